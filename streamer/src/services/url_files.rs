//! Write-once files holding the run and group URLs

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::UrlFiles;
use crate::error::{StreamerError, StreamerResult};

/// Write each configured file whose URL the collector provided
///
/// Both files are attempted; the first failure is returned after that.
/// Returns the paths actually written.
pub fn write_url_files(files: &UrlFiles, run_url: Option<&str>, group_url: Option<&str>) -> StreamerResult<Vec<PathBuf>> {
    let mut written = Vec::new();
    let mut first_error = None;

    let targets = [(&files.run_url_file, run_url, "run"), (&files.group_url_file, group_url, "group")];
    for (path, url, label) in targets {
        let (Some(path), Some(url)) = (path, url) else {
            continue;
        };
        match write_url_file(path, url) {
            Ok(()) => {
                info!("🔗 Wrote {} URL to {}", label, path.display());
                written.push(path.clone());
            }
            Err(e) => {
                warn!("⚠️ Failed to write {} URL file: {}", label, e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(written),
    }
}

fn write_url_file(path: &Path, url: &str) -> StreamerResult<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| StreamerError::io(parent.display().to_string(), &e))?;
    }
    std::fs::write(path, url).map_err(|e| StreamerError::io(path.display().to_string(), &e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_only_configured_and_received_urls() {
        let dir = tempfile::tempdir().unwrap();
        let files = UrlFiles {
            run_url_file: Some(dir.path().join("nested/run_url.txt")),
            group_url_file: Some(dir.path().join("group_url.txt")),
        };

        let written = write_url_files(&files, Some("http://collector/runs/7"), None).unwrap();

        assert_eq!(written, vec![dir.path().join("nested/run_url.txt")]);
        let content = std::fs::read_to_string(dir.path().join("nested/run_url.txt")).unwrap();
        assert_eq!(content, "http://collector/runs/7");
        assert!(!dir.path().join("group_url.txt").exists());
    }

    #[test]
    fn test_unconfigured_files_are_a_no_op() {
        let written = write_url_files(&UrlFiles::default(), Some("http://a"), Some("http://b")).unwrap();
        assert!(written.is_empty());
    }

    #[test]
    fn test_failure_on_one_file_still_writes_the_other() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();

        let files = UrlFiles {
            run_url_file: Some(blocker.join("run_url.txt")),
            group_url_file: Some(dir.path().join("group_url.txt")),
        };

        let result = write_url_files(&files, Some("http://run"), Some("http://group"));
        assert!(matches!(result, Err(StreamerError::Io { .. })));
        assert_eq!(std::fs::read_to_string(dir.path().join("group_url.txt")).unwrap(), "http://group");
    }
}
