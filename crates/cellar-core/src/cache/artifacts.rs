//! Discovery and copying of files produced by an execution.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::{DirEntry, WalkDir};

/// Modification times of the files under a directory, keyed by their path
/// relative to it.
pub type FileTimes = BTreeMap<PathBuf, SystemTime>;

/// Record the modification time of every visible file under `root`.
pub fn file_times(root: &Path) -> io::Result<FileTimes> {
    let mut times = FileTimes::new();
    for entry in visible_files(root) {
        let entry = entry.map_err(io::Error::other)?;
        let modified = entry.metadata().map_err(io::Error::other)?.modified()?;
        if let Ok(relative) = entry.path().strip_prefix(root) {
            times.insert(relative.to_path_buf(), modified);
        }
    }
    Ok(times)
}

/// Files under `root` produced by an execution, as paths relative to `root`.
///
/// Without a baseline every file counts, which suits a directory that
/// started out empty. With one, only visible files that are new or whose
/// modification time changed are reported. Sorted for a stable record.
pub fn collect_artifacts(root: &Path, baseline: Option<&FileTimes>) -> io::Result<Vec<PathBuf>> {
    let Some(baseline) = baseline else {
        let mut found = Vec::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(relative) = entry.path().strip_prefix(root) {
                found.push(relative.to_path_buf());
            }
        }
        found.sort();
        return Ok(found);
    };

    Ok(file_times(root)?
        .into_iter()
        .filter(|(path, modified)| baseline.get(path) != Some(modified))
        .map(|(path, _)| path)
        .collect())
}

/// Regular files below `root`, skipping hidden files and directories.
fn visible_files(root: &Path) -> impl Iterator<Item = walkdir::Result<DirEntry>> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
        })
        .filter(|entry| match entry {
            Ok(entry) => entry.file_type().is_file(),
            Err(_) => true,
        })
}

/// Copy `relative` from `from` to `to`, creating parent directories.
pub(crate) fn copy_relative(from: &Path, to: &Path, relative: &Path) -> io::Result<u64> {
    let target = to.join(relative);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from.join(relative), target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_collects_nested_files_sorted() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("figs")).unwrap();
        fs::write(dir.path().join("figs/b.png"), b"b").unwrap();
        fs::write(dir.path().join("a.csv"), b"a").unwrap();

        let found = collect_artifacts(dir.path(), None).unwrap();
        assert_eq!(
            found,
            vec![PathBuf::from("a.csv"), PathBuf::from("figs").join("b.png")]
        );
    }

    #[test]
    fn test_baseline_reports_new_and_modified_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("kept.txt"), b"kept").unwrap();
        fs::write(dir.path().join("rewritten.txt"), b"v1").unwrap();
        let mut baseline = file_times(dir.path()).unwrap();
        // Pretend the earlier write happened long ago
        let past = SystemTime::now() - Duration::from_secs(3600);
        baseline.insert(PathBuf::from("rewritten.txt"), past);

        fs::create_dir_all(dir.path().join("figs")).unwrap();
        fs::write(dir.path().join("figs/new.png"), b"png").unwrap();
        fs::create_dir_all(dir.path().join(".hidden")).unwrap();
        fs::write(dir.path().join(".hidden/state"), b"x").unwrap();

        let found = collect_artifacts(dir.path(), Some(&baseline)).unwrap();
        assert_eq!(
            found,
            vec![PathBuf::from("figs").join("new.png"), PathBuf::from("rewritten.txt")]
        );
    }

    #[test]
    fn test_copy_relative_creates_parents() {
        let from = TempDir::new().unwrap();
        let to = TempDir::new().unwrap();
        fs::create_dir_all(from.path().join("out")).unwrap();
        fs::write(from.path().join("out/plot.png"), b"\x89PNG").unwrap();

        copy_relative(from.path(), to.path(), Path::new("out/plot.png")).unwrap();
        assert_eq!(fs::read(to.path().join("out/plot.png")).unwrap(), b"\x89PNG");
    }
}
