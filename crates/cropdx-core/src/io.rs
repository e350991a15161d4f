//! Crash-safe file output.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{CropdxError, Result};

/// Writes `bytes` to `path` so that readers never observe a partial file.
///
/// The payload goes to a hidden sibling (`.<name>.tmp`), is flushed to disk,
/// and is then renamed over the target. On failure the temp file is removed
/// and any previous file at `path` is left untouched.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path.file_name().ok_or_else(|| {
        CropdxError::Configuration(format!("output path {} has no file name", path.display()))
    })?;

    fs::create_dir_all(&parent)?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));

    let written: std::io::Result<()> = (|| {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_and_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("models").join("model.bin");

        write_atomic(&target, b"first").unwrap();
        write_atomic(&target, b"second").unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"second");
        let leftovers: Vec<_> = fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn failed_write_keeps_previous_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("class_indices.json");
        write_atomic(&target, b"{}").unwrap();

        // A directory squatting on the temp name makes File::create fail.
        fs::create_dir(dir.path().join(".class_indices.json.tmp")).unwrap();
        assert!(write_atomic(&target, b"{\"0\": \"cat\"}").is_err());
        assert_eq!(fs::read(&target).unwrap(), b"{}");
    }
}
