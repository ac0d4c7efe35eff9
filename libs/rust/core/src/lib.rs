//! Core shared utilities for churnguard services.

use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod fsio;
pub mod metrics;

pub use config::ConfigError as ConfigSourceError;
pub use metrics::{PipelineMetrics, PIPELINE_METRICS};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Install the process-wide subscriber. Safe to call more than once.
///
/// `RUST_LOG` drives filtering (default `info`); `CHURNGUARD_JSON_LOG=1` switches to JSON lines.
/// Logs go to stderr so command output on stdout stays machine readable.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("CHURNGUARD_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry
                .with(tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr))
                .try_init()?;
        } else {
            registry
                .with(tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_line_number(true)
                    .with_writer(std::io::stderr))
                .try_init()?;
        }
        Ok(())
    })?;
    info!(target: "churnguard", service, "tracing initialized");
    Ok(())
}

/// Layered configuration: defaults, then an optional file, then `<PREFIX>_*` environment overrides.
///
/// The file comes from `file` or, failing that, `<PREFIX>_CONFIG_FILE`. Its format follows the
/// extension (json, yaml, toml). Nested keys use `__` in the environment, e.g.
/// `CHURNGUARD_DRIFT_POLICY__TOLERANCE=1e-9`.
pub fn load_layered<T: DeserializeOwned>(service: &str, file: Option<&Path>, env_prefix: &str) -> Result<T, ConfigSourceError> {
    let mut builder = config::Config::builder().set_default("service_name", service)?;
    let file: Option<PathBuf> = file
        .map(Path::to_path_buf)
        .or_else(|| std::env::var(format!("{env_prefix}_CONFIG_FILE")).ok().map(PathBuf::from));
    if let Some(path) = &file {
        builder = builder.add_source(config::File::from(path.as_path()).required(true));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(env_prefix)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );
    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct Sample { service_name: String, input_dir: String, #[serde(default)] retries: u32 }

    #[test]
    fn file_layer_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut f = std::fs::File::create(&path).unwrap();
        write!(f, r#"{{"input_dir": "sourcedata", "retries": 2}}"#).unwrap();
        let cfg: Sample = load_layered("unit", Some(&path), "CHURNGUARD_UNIT_TEST").unwrap();
        assert_eq!(cfg.service_name, "unit");
        assert_eq!(cfg.input_dir, "sourcedata");
        assert_eq!(cfg.retries, 2);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let res: Result<Sample, _> = load_layered("unit", Some(&dir.path().join("absent.yaml")), "CHURNGUARD_UNIT_TEST");
        assert!(res.is_err());
    }

    #[test]
    fn tracing_init_is_idempotent() {
        assert!(init_tracing("unit").is_ok());
        assert!(init_tracing("unit").is_ok());
    }
}
