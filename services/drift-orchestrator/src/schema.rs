//! Fixed churn dataset schema and the labeled projection used by training and scoring.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::DatasetError;

/// Header of every source shard and of the merged dataset, in order.
pub const DATASET_COLUMNS: [&str; 5] = ["corporation", "lastmonth_activity", "lastyear_activity", "number_of_employees", "exited"];
/// Model inputs, in the order models see them.
pub const FEATURE_COLUMNS: [&str; 3] = ["lastmonth_activity", "lastyear_activity", "number_of_employees"];
pub const LABEL_COLUMN: &str = "exited";
pub const SOURCE_EXTENSION: &str = "csv";

pub type Label = u8;

/// One customer row. Equality and hashing cover every column, which is what dedup keys on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChurnRecord {
    pub corporation: String,
    pub lastmonth_activity: i64,
    pub lastyear_activity: i64,
    pub number_of_employees: i64,
    pub exited: i64,
}

/// Row-major numeric matrix with named columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureMatrix {
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<f64>>) -> Self {
        debug_assert!(rows.iter().all(|r| r.len() == columns.len()));
        Self { columns, rows }
    }
    pub fn columns(&self) -> &[String] { &self.columns }
    pub fn rows(&self) -> &[Vec<f64>] { &self.rows }
    pub fn len(&self) -> usize { self.rows.len() }
    pub fn is_empty(&self) -> bool { self.rows.is_empty() }
    pub fn column(&self, idx: usize) -> impl Iterator<Item = f64> + '_ { self.rows.iter().map(move |r| r[idx]) }
}

/// Features projected in [`FEATURE_COLUMNS`] order plus the binary label.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LabeledData {
    pub features: FeatureMatrix,
    pub labels: Vec<Label>,
}

impl LabeledData {
    /// Read a CSV with a header row and project it. Extra columns are ignored; a missing feature or
    /// label column, a non-numeric feature, or a label other than 0/1 is an error.
    pub fn from_csv(path: &Path) -> Result<Self, DatasetError> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|source| csv_error(path, source))?;
        let headers = rdr.headers().map_err(|source| csv_error(path, source))?.clone();
        let locate = |name: &str| headers.iter().position(|h| h == name)
            .ok_or_else(|| DatasetError::MissingColumn { path: path.to_path_buf(), column: name.to_string() });
        let feature_idx = FEATURE_COLUMNS.iter().map(|c| locate(c)).collect::<Result<Vec<_>, _>>()?;
        let label_idx = locate(LABEL_COLUMN)?;

        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for (i, rec) in rdr.records().enumerate() {
            let rec = rec.map_err(|source| csv_error(path, source))?;
            let row_no = i as u64 + 1;
            let mut row = Vec::with_capacity(feature_idx.len());
            for (&idx, &name) in feature_idx.iter().zip(FEATURE_COLUMNS.iter()) {
                let raw = rec.get(idx).unwrap_or("");
                let v: f64 = raw.parse().map_err(|_| DatasetError::BadValue { path: path.to_path_buf(), row: row_no, column: name.to_string(), value: raw.to_string() })?;
                row.push(v);
            }
            let raw = rec.get(label_idx).unwrap_or("");
            labels.push(parse_label(raw).ok_or_else(|| DatasetError::BadLabel { path: path.to_path_buf(), row: row_no, value: raw.to_string() })?);
            rows.push(row);
        }
        let columns = FEATURE_COLUMNS.iter().map(|c| c.to_string()).collect();
        Ok(Self { features: FeatureMatrix::new(columns, rows), labels })
    }

    pub fn len(&self) -> usize { self.labels.len() }
    pub fn is_empty(&self) -> bool { self.labels.is_empty() }
}

fn parse_label(raw: &str) -> Option<Label> {
    match raw.parse::<f64>() {
        Ok(v) if v == 0.0 => Some(0),
        Ok(v) if v == 1.0 => Some(1),
        _ => None,
    }
}

/// csv folds io failures into its own error type; callers report them separately.
pub(crate) enum CsvFault { Io(std::io::Error), Format(csv::Error) }

pub(crate) fn classify_csv_error(err: csv::Error) -> CsvFault {
    if !err.is_io_error() { return CsvFault::Format(err); }
    match err.into_kind() {
        csv::ErrorKind::Io(io) => CsvFault::Io(io),
        other => CsvFault::Io(std::io::Error::new(std::io::ErrorKind::Other, format!("{other:?}"))),
    }
}

pub(crate) fn csv_error(path: &Path, source: csv::Error) -> DatasetError {
    match classify_csv_error(source) {
        CsvFault::Io(source) => DatasetError::Io { path: path.to_path_buf(), source },
        CsvFault::Format(source) => DatasetError::Csv { path: path.to_path_buf(), source },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projects_features_in_documented_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testdata.csv");
        // columns deliberately shuffled
        std::fs::write(&path, "exited,number_of_employees,corporation,lastyear_activity,lastmonth_activity\n1,10,abcd,200,34\n0,99,efgh,5,1\n").unwrap();
        let data = LabeledData::from_csv(&path).unwrap();
        assert_eq!(data.features.columns(), &["lastmonth_activity", "lastyear_activity", "number_of_employees"]);
        assert_eq!(data.features.rows(), &[vec![34.0, 200.0, 10.0], vec![1.0, 5.0, 99.0]]);
        assert_eq!(data.labels, vec![1, 0]);
    }

    #[test]
    fn missing_label_column_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("finaldata.csv");
        std::fs::write(&path, "corporation,lastmonth_activity,lastyear_activity,number_of_employees\nabcd,1,2,3\n").unwrap();
        let err = LabeledData::from_csv(&path).unwrap_err();
        assert!(matches!(err, DatasetError::MissingColumn { ref column, .. } if column == "exited"));
    }

    #[test]
    fn non_numeric_feature_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("finaldata.csv");
        std::fs::write(&path, "corporation,lastmonth_activity,lastyear_activity,number_of_employees,exited\nabcd,lots,2,3,0\n").unwrap();
        assert!(matches!(LabeledData::from_csv(&path), Err(DatasetError::BadValue { row: 1, .. })));
    }

    #[test]
    fn label_outside_binary_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("finaldata.csv");
        std::fs::write(&path, "corporation,lastmonth_activity,lastyear_activity,number_of_employees,exited\nabcd,1,2,3,2\n").unwrap();
        assert!(matches!(LabeledData::from_csv(&path), Err(DatasetError::BadLabel { .. })));
    }

    #[test]
    fn missing_file_is_io() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(LabeledData::from_csv(&dir.path().join("absent.csv")), Err(DatasetError::Io { .. })));
    }

    #[test]
    fn header_only_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("finaldata.csv");
        std::fs::write(&path, DATASET_COLUMNS.join(",") + "\n").unwrap();
        let data = LabeledData::from_csv(&path).unwrap();
        assert!(data.is_empty());
        assert!(data.features.is_empty());
    }
}
