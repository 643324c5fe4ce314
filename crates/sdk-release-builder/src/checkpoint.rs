use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Marker for work that must survive a force-clean of the cloud-agent tree.
pub const FETCHED_MARKER: &str = ".fetched";
pub const BUILT_MARKER: &str = ".built";

/// A completion marker inside a stage's own working directory. Existence
/// means the expensive one-time work for that directory is done. Markers are
/// per-working-directory, never per-release-version: a new board+module pair
/// gets a new directory and therefore starts unmarked.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: PathBuf,
}

impl Checkpoint {
    pub fn fetched(work_dir: &Path) -> Self {
        Self {
            path: work_dir.join(FETCHED_MARKER),
        }
    }

    pub fn built(work_dir: &Path) -> Self {
        Self {
            path: work_dir.join(BUILT_MARKER),
        }
    }

    pub fn is_done(&self) -> bool {
        self.path.exists()
    }

    pub fn mark(&self) -> Result<()> {
        fs::write(&self.path, b"").map_err(|e| {
            Error::command(format!(
                "failed to write checkpoint {}: {e}",
                self.path.display()
            ))
        })
    }
}

/// Delete-and-recreate a working directory. Checkpointed work always starts
/// from an empty directory so an interrupted attempt never leaves hybrid
/// state behind.
pub fn prep_clean_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .map_err(|e| Error::command(format!("failed to remove {}: {e}", dir.display())))?;
    }
    fs::create_dir_all(dir)
        .map_err(|e| Error::command(format!("failed to create {}: {e}", dir.display())))
}

/// Run an expensive fetch at most once per working directory. When the
/// `.fetched` marker is absent the directory is fully reset, `fetch` runs,
/// and the marker is written; a failure leaves the marker unset so the next
/// invocation retries from a clean directory.
pub fn fetch_once(work_dir: &Path, fetch: impl FnOnce() -> Result<()>) -> Result<()> {
    let checkpoint = Checkpoint::fetched(work_dir);
    if checkpoint.is_done() {
        return Ok(());
    }
    prep_clean_dir(work_dir)?;
    fetch()?;
    checkpoint.mark()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn mark_then_is_done() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cp = Checkpoint::built(tmp.path());
        assert!(!cp.is_done());
        cp.mark().expect("mark");
        assert!(cp.is_done());
    }

    #[test]
    fn fetch_once_runs_the_fetch_exactly_once() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("src");
        let calls = Cell::new(0u32);

        fetch_once(&dir, || {
            calls.set(calls.get() + 1);
            Ok(())
        })
        .expect("first fetch");
        fetch_once(&dir, || {
            calls.set(calls.get() + 1);
            Ok(())
        })
        .expect("second call is a no-op");

        assert_eq!(calls.get(), 1);
        assert!(Checkpoint::fetched(&dir).is_done());
    }

    #[test]
    fn failed_fetch_leaves_the_checkpoint_unset_and_retries_clean() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("src");

        let err = fetch_once(&dir, || {
            // Simulate a partial fetch before the failure.
            fs::write(dir.join("partial"), b"x").unwrap();
            Err(Error::fetch("network down"))
        })
        .expect_err("fetch failure must propagate");
        assert!(matches!(err, Error::Fetch(_)));
        assert!(!Checkpoint::fetched(&dir).is_done());

        // The retry starts from an empty directory.
        fetch_once(&dir, || {
            assert!(!dir.join("partial").exists());
            Ok(())
        })
        .expect("retry succeeds");
        assert!(Checkpoint::fetched(&dir).is_done());
    }

    #[test]
    fn checkpoints_are_per_working_directory() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let a = tmp.path().join("os-red-wp85");
        let b = tmp.path().join("os-yellow-wp76xx");
        fs::create_dir_all(&a).unwrap();
        fs::create_dir_all(&b).unwrap();

        Checkpoint::fetched(&a).mark().unwrap();
        assert!(Checkpoint::fetched(&a).is_done());
        assert!(!Checkpoint::fetched(&b).is_done());
    }
}
