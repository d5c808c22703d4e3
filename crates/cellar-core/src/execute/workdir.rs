//! Working directory of a notebook execution.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::cache::{FileTimes, collect_artifacts, copy_relative, file_times};

/// Directory a kernel runs in.
///
/// Either the notebook's own directory, or a fresh temporary directory that
/// is removed when the `WorkDir` is dropped.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    temp: Option<TempDir>,
    /// File times seen before an in-place run.
    baseline: Option<FileTimes>,
}

impl WorkDir {
    /// Run in an existing directory.
    ///
    /// The files already there are recorded so that the ones an execution
    /// writes can be told apart afterwards.
    pub fn in_place(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let baseline = match file_times(&path) {
            Ok(times) => Some(times),
            Err(e) => {
                tracing::warn!(
                    "Failed to scan {}; files written there will not be cached: {}",
                    path.display(),
                    e
                );
                None
            }
        };
        Self {
            path,
            temp: None,
            baseline,
        }
    }

    /// Run in a new temporary directory.
    pub fn temporary() -> io::Result<Self> {
        let temp = tempfile::Builder::new().prefix("cellar-").tempdir()?;
        Ok(Self {
            path: temp.path().to_path_buf(),
            temp: Some(temp),
            baseline: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    /// Files the execution produced, relative to [`path`](Self::path).
    ///
    /// In place, these are the visible files created or modified since the
    /// directory was opened. Notebooks are left out since the host writes
    /// them back itself.
    pub fn produced_files(&self) -> io::Result<Vec<PathBuf>> {
        if self.is_temporary() {
            return collect_artifacts(&self.path, None);
        }
        let Some(baseline) = &self.baseline else {
            return Ok(Vec::new());
        };
        Ok(collect_artifacts(&self.path, Some(baseline))?
            .into_iter()
            .filter(|path| path.extension().is_none_or(|ext| ext != "ipynb"))
            .collect())
    }

    /// Copy `files` (relative to this directory) into `dest`.
    ///
    /// Returns the destination paths of the files that were copied.
    pub fn export(&self, files: &[PathBuf], dest: &Path) -> Vec<PathBuf> {
        if same_dir(&self.path, dest) {
            return files.iter().map(|relative| dest.join(relative)).collect();
        }
        let mut exported = Vec::with_capacity(files.len());
        for relative in files {
            match copy_relative(&self.path, dest, relative) {
                Ok(_) => exported.push(dest.join(relative)),
                Err(e) => tracing::warn!(
                    "Failed to copy artifact {} to {}: {}",
                    relative.display(),
                    dest.display(),
                    e
                ),
            }
        }
        exported
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_temporary_dir_removed_on_drop() {
        let workdir = WorkDir::temporary().unwrap();
        let path = workdir.path().to_path_buf();
        fs::write(path.join("out.txt"), b"x").unwrap();
        assert_eq!(workdir.produced_files().unwrap(), vec![PathBuf::from("out.txt")]);

        drop(workdir);
        assert!(!path.exists());
    }

    #[test]
    fn test_in_place_reports_written_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("existing.txt"), b"x").unwrap();
        let workdir = WorkDir::in_place(dir.path());
        assert!(!workdir.is_temporary());
        assert!(workdir.produced_files().unwrap().is_empty());

        fs::create_dir_all(dir.path().join("figs")).unwrap();
        fs::write(dir.path().join("figs/plot.png"), b"png").unwrap();
        fs::write(dir.path().join("other.ipynb"), b"{}").unwrap();
        assert_eq!(
            workdir.produced_files().unwrap(),
            vec![PathBuf::from("figs").join("plot.png")]
        );
    }

    #[test]
    fn test_export_into_own_directory_keeps_files() {
        let dir = TempDir::new().unwrap();
        let workdir = WorkDir::in_place(dir.path());
        fs::write(dir.path().join("out.csv"), b"1,2").unwrap();

        let files = workdir.produced_files().unwrap();
        let exported = workdir.export(&files, dir.path());
        assert_eq!(exported, vec![dir.path().join("out.csv")]);
        assert_eq!(fs::read(&exported[0]).unwrap(), b"1,2");
    }

    #[test]
    fn test_export() {
        let workdir = WorkDir::temporary().unwrap();
        fs::create_dir_all(workdir.path().join("img")).unwrap();
        fs::write(workdir.path().join("img/a.png"), b"png").unwrap();
        let dest = TempDir::new().unwrap();

        let exported = workdir.export(&workdir.produced_files().unwrap(), dest.path());
        assert_eq!(exported, vec![dest.path().join("img").join("a.png")]);
        assert_eq!(fs::read(&exported[0]).unwrap(), b"png");
    }
}
