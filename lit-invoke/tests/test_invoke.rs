use std::fs;

use lib::core::merge::{merge, MergeOptions, MergeOutcome};
use lib::git::RepoError;
use lib::testing::make_test_repo;
use lit_invoke::{do_main_and_drop_locals, install_tracing, CommandContext, ExitCode};

#[test]
fn test_install_tracing_is_idempotent() -> eyre::Result<()> {
    install_tracing()?;
    install_tracing()?;
    Ok(())
}

#[test]
fn test_get_repo_from_subdirectory() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    let subdir = test_repo.path().join("a").join("b");
    fs::create_dir_all(&subdir)?;

    let ctx = CommandContext::new(subdir);
    let repo = ctx.get_repo()?;
    assert_eq!(repo.get_working_copy_path(), test_repo.path());
    Ok(())
}

#[test]
fn test_get_repo_outside_repository() -> eyre::Result<()> {
    let dir = tempfile::tempdir()?;
    let ctx = CommandContext::new(dir.path().to_path_buf());
    let err = match ctx.get_repo() {
        Ok(repo) => eyre::bail!("unexpectedly found a repository: {:?}", repo),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<RepoError>(),
        Some(RepoError::RepositoryNotFound { .. })
    ));
    Ok(())
}

#[test]
fn test_exit_codes() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    let working_directory = Some(test_repo.path().to_path_buf());

    let exit_code = do_main_and_drop_locals(|_ctx| Ok(Ok(())), working_directory.clone())?;
    assert_eq!(exit_code, 0);

    let exit_code =
        do_main_and_drop_locals(|_ctx| Ok(Err(ExitCode(3))), working_directory.clone())?;
    assert_eq!(exit_code, 3);

    let result = do_main_and_drop_locals(
        |_ctx| -> lit_invoke::EyreExitOr<()> { eyre::bail!("command failed") },
        working_directory,
    );
    assert!(result.is_err());
    Ok(())
}

#[test]
fn test_conflicted_merge_reports_exit_code() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    test_repo.commit_file_with_contents("file.txt", 1, "A\nB\nC\n")?;
    test_repo.create_branch("feature")?;
    test_repo.commit_file_with_contents("file.txt", 2, "A\nX\nC\n")?;
    test_repo.switch("feature")?;
    test_repo.commit_file_with_contents("file.txt", 3, "A\nY\nC\n")?;
    test_repo.switch("main")?;

    let exit_code = do_main_and_drop_locals(
        |ctx| {
            let repo = ctx.get_repo()?;
            let theirs = repo.resolve_revision("feature")?;
            let outcome = merge(&repo, theirs, &MergeOptions::new("feature"), ctx.now)?;
            match outcome {
                MergeOutcome::Conflicted { .. } => Ok(Err(ExitCode(1))),
                MergeOutcome::UpToDate
                | MergeOutcome::FastForwarded { .. }
                | MergeOutcome::Merged { .. } => Ok(Ok(())),
            }
        },
        Some(test_repo.path().to_path_buf()),
    )?;
    assert_eq!(exit_code, 1);
    assert!(test_repo.read_file("file.txt")?.unwrap_or_default().contains("<<<<<<< HEAD"));
    Ok(())
}
