//! Crash-safe file replacement.
//!
//! Writers stage bytes in a sibling temp file, fsync it, then rename over the target. Readers see
//! either the previous content or the new content, never a torn file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Replace `path` with `bytes` atomically (same-directory rename).
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = parent_dir(path);
    fs::create_dir_all(&parent)?;
    let tmp = temp_sibling(path);
    let res = (|| {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if res.is_err() { let _ = fs::remove_file(&tmp); }
    res?;
    sync_dir(&parent);
    Ok(())
}

/// Hidden, uniquely named sibling of `path`, suitable as a rename source.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    parent_dir(path).join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

/// Best-effort directory fsync so a completed rename survives power loss. No-op where unsupported.
pub fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) { let _ = d.sync_all(); }
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
