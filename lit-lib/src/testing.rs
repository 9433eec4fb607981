//! Testing utilities.
//!
//! This is inside `src` rather than `tests` since we use this code in some unit
//! tests.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tempfile::TempDir;
use tracing::instrument;

use crate::core::check_out::{switch_branch, switch_detached};
use crate::git::{get_status, NoIgnore, NonZeroOid, Repo, WorkingCopyStatus};
use crate::util::remove_file_if_exists;

const DUMMY_NAME: &str = "Testy McTestface";
const DUMMY_EMAIL: &str = "test@example.com";

/// Wed 29 Oct 12:34:56 2020 PDT.
const DUMMY_TIMESTAMP: u64 = 1_604_000_096;

/// A repository in a temporary directory, for testing. The directory is
/// deleted when this value is dropped.
#[derive(Debug)]
pub struct TestRepo {
    _temp_dir: TempDir,

    /// The repository under test.
    pub repo: Repo,
}

/// Create a repository in a fresh temporary directory, with a configured
/// identity and no commits.
#[instrument]
pub fn make_test_repo() -> eyre::Result<TestRepo> {
    let temp_dir = tempfile::tempdir()?;
    let repo = Repo::init(temp_dir.path())?;
    repo.set_user_identity(DUMMY_NAME, DUMMY_EMAIL)?;
    Ok(TestRepo {
        _temp_dir: temp_dir,
        repo,
    })
}

impl TestRepo {
    /// The root of the working copy.
    pub fn path(&self) -> &Path {
        self.repo.get_working_copy_path()
    }

    /// A fixed point in time, offset by `time` minutes. Tests pass
    /// increasing values of `time` to get deterministic commit hashes.
    pub fn now(&self, time: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(DUMMY_TIMESTAMP + time * 60)
    }

    /// Write a file into the working copy, creating parent directories.
    pub fn write_file(&self, path: &str, contents: &str) -> eyre::Result<()> {
        let path = self.path().join(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Read a file from the working copy, or `None` if it does not exist.
    pub fn read_file(&self, path: &str) -> eyre::Result<Option<String>> {
        match self.repo.read_working_copy_file(path)? {
            Some(contents) => Ok(Some(String::from_utf8(contents)?)),
            None => Ok(None),
        }
    }

    /// Delete a file from the working copy.
    pub fn delete_file(&self, path: &str) -> eyre::Result<()> {
        remove_file_if_exists(&self.path().join(path))?;
        Ok(())
    }

    /// Stage the working copy version of a file.
    pub fn stage(&self, path: &str) -> eyre::Result<()> {
        let mut index = self.repo.get_index()?;
        index.add_path(&self.repo, &self.path().join(path), &NoIgnore)?;
        self.repo.write_index(&index)?;
        Ok(())
    }

    /// Stage every file in the working copy.
    pub fn stage_all(&self) -> eyre::Result<()> {
        let mut index = self.repo.get_index()?;
        index.add_all(&self.repo, &NoIgnore)?;
        self.repo.write_index(&index)?;
        Ok(())
    }

    /// Commit the index at the given time.
    pub fn run_commit(&self, message: &str, time: u64) -> eyre::Result<NonZeroOid> {
        Ok(self.repo.commit_index(message, self.now(time))?)
    }

    /// Write, stage and commit a file with the given contents.
    pub fn commit_file_with_contents(
        &self,
        path: &str,
        time: u64,
        contents: &str,
    ) -> eyre::Result<NonZeroOid> {
        self.write_file(path, contents)?;
        self.stage(path)?;
        self.run_commit(&format!("create {}", path), time)
    }

    /// Commit a file named `{name}.txt` with some default contents.
    pub fn commit_file(&self, name: &str, time: u64) -> eyre::Result<NonZeroOid> {
        self.commit_file_with_contents(
            &format!("{}.txt", name),
            time,
            &format!("{} contents\n", name),
        )
    }

    /// Create a branch at `HEAD`.
    pub fn create_branch(&self, branch_name: &str) -> eyre::Result<NonZeroOid> {
        let head_oid = self.repo.get_head_oid()?;
        self.repo.create_branch(branch_name, head_oid, false)?;
        Ok(head_oid)
    }

    /// Check out a branch.
    pub fn switch(&self, branch_name: &str) -> eyre::Result<NonZeroOid> {
        Ok(switch_branch(&self.repo, branch_name)?)
    }

    /// Check out a commit with `HEAD` detached.
    pub fn detach(&self, oid: NonZeroOid) -> eyre::Result<()> {
        Ok(switch_detached(&self.repo, oid)?)
    }

    /// Resolve a revision expression.
    pub fn resolve(&self, expr: &str) -> eyre::Result<NonZeroOid> {
        Ok(self.repo.resolve_revision(expr)?)
    }

    /// Compute the status of the working copy.
    pub fn get_status(&self) -> eyre::Result<WorkingCopyStatus> {
        Ok(get_status(&self.repo, &NoIgnore)?)
    }
}
