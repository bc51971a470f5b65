use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::BackfillError;

const ROLLBACK_SUFFIX: &str = ".rollback";

/// The id of the last record whose batch was committed, persisted as a single
/// plain-text value.
///
/// Every write replaces the whole file (temp file + rename), so a crash leaves
/// either the previous or the new id, never a torn value. Without a path the
/// checkpoint is kept nowhere and the run always starts from the beginning.
pub struct Checkpoint {
    path: Option<PathBuf>,
}

impl Checkpoint {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Checkpoint for one migration direction. Rollback runs keep their own
    /// file next to the forward one (`<name>.rollback`), so a finished
    /// forward run never hides records from a rollback.
    pub fn for_direction(path: Option<PathBuf>, rollback: bool) -> Self {
        let path = match path {
            Some(path) if rollback => {
                let mut name = path.clone().into_os_string();
                name.push(ROLLBACK_SUFFIX);
                Some(PathBuf::from(name))
            }
            other => other,
        };
        Self { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn load(&self) -> Result<Option<String>, BackfillError> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(None),
        };

        match fs::read_to_string(path) {
            Ok(contents) => {
                let id = contents.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn record(&self, id: &str) -> Result<(), BackfillError> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, id)?;
        fs::rename(&tmp, path)?;
        debug!("Checkpoint recorded: {}", id);
        Ok(())
    }

    /// Remove the persisted checkpoint. Returns true if one existed.
    pub fn clear(&self) -> Result<bool, BackfillError> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(false),
        };

        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let checkpoint = Checkpoint::new(Some(dir.path().join("last_id")));
        assert_eq!(checkpoint.load().unwrap(), None);
    }

    #[test]
    fn test_record_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("last_id");
        let checkpoint = Checkpoint::new(Some(path.clone()));

        checkpoint.record("0001").unwrap();
        checkpoint.record("0042").unwrap();

        assert_eq!(checkpoint.load().unwrap(), Some("0042".to_string()));
        assert_eq!(fs::read_to_string(&path).unwrap(), "0042");
    }

    #[test]
    fn test_load_trims_whitespace() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_id");
        fs::write(&path, "  abc\n").unwrap();
        assert_eq!(Checkpoint::new(Some(path)).load().unwrap(), Some("abc".to_string()));
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let checkpoint = Checkpoint::new(Some(dir.path().join("last_id")));
        checkpoint.record("x").unwrap();
        assert!(checkpoint.clear().unwrap());
        assert!(!checkpoint.clear().unwrap());
        assert_eq!(checkpoint.load().unwrap(), None);
    }

    #[test]
    fn test_directions_keep_separate_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("last_id");
        let forward = Checkpoint::for_direction(Some(path.clone()), false);
        let rollback = Checkpoint::for_direction(Some(path.clone()), true);

        assert_eq!(forward.path(), Some(path.as_path()));
        assert_eq!(rollback.path(), Some(dir.path().join("last_id.rollback").as_path()));

        forward.record("zzz").unwrap();
        assert_eq!(rollback.load().unwrap(), None);
        rollback.record("aaa").unwrap();
        assert_eq!(forward.load().unwrap(), Some("zzz".to_string()));

        assert_eq!(Checkpoint::for_direction(None, true).path(), None);
    }

    #[test]
    fn test_without_path_is_inert() {
        let checkpoint = Checkpoint::new(None);
        checkpoint.record("x").unwrap();
        assert_eq!(checkpoint.load().unwrap(), None);
        assert!(!checkpoint.clear().unwrap());
    }
}
