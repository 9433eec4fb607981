use std::time::SystemTime;

use lit::core::rewrite::{
    cherry_pick, cherry_pick_abort, cherry_pick_continue, CherryPickResult,
    ExecuteRebasePlanOptions,
};
use lit::core::session::{get_current_operation_type, load_cherry_pick_session, Error, OperationType};
use lit::git::NonZeroOid;
use lit::testing::make_test_repo;

fn expect_success(result: CherryPickResult) -> eyre::Result<NonZeroOid> {
    match result {
        CherryPickResult::Succeeded { commit_oid } => Ok(commit_oid),
        other => eyre::bail!("unexpected cherry-pick result: {:?}", other),
    }
}

fn seconds_since_epoch(time: SystemTime) -> eyre::Result<i64> {
    let seconds = time.duration_since(SystemTime::UNIX_EPOCH)?.as_secs();
    Ok(i64::try_from(seconds)?)
}

#[test]
fn test_cherry_pick_clean() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    test_repo.commit_file("base", 1)?;
    test_repo.create_branch("feature")?;
    test_repo.switch("feature")?;
    let picked = test_repo.commit_file("picked", 2)?;
    test_repo.switch("main")?;
    let main = test_repo.commit_file("main", 3)?;

    let options = ExecuteRebasePlanOptions::new(test_repo.now(4));
    let new_oid = expect_success(cherry_pick(&test_repo.repo, picked, &options)?)?;
    assert_eq!(test_repo.repo.get_head_oid()?, new_oid);
    assert_eq!(test_repo.repo.get_current_branch()?, Some("main".to_string()));

    let original = test_repo.repo.find_commit_or_fail(picked)?;
    let new = test_repo.repo.find_commit_or_fail(new_oid)?;
    assert_eq!(new.get_parent_oids(), &[main]);
    assert_eq!(new.get_message_raw(), original.get_message_raw());
    assert_eq!(new.get_author(), original.get_author());
    assert_eq!(
        new.get_committer().get_identity(),
        original.get_committer().get_identity()
    );
    assert_eq!(
        new.get_committer().get_time().seconds(),
        seconds_since_epoch(test_repo.now(4))?
    );

    assert_eq!(
        test_repo.read_file("picked.txt")?,
        Some("picked contents\n".to_string())
    );
    assert_eq!(test_repo.read_file("main.txt")?, Some("main contents\n".to_string()));
    assert!(test_repo.get_status()?.is_clean());
    Ok(())
}

#[test]
fn test_cherry_pick_conflict_continue_and_abort() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    test_repo.commit_file_with_contents("file.txt", 1, "A\nB\nC\n")?;
    test_repo.create_branch("feature")?;
    test_repo.switch("feature")?;
    let picked = test_repo.commit_file_with_contents("file.txt", 2, "A\nZ\nC\n")?;
    test_repo.switch("main")?;
    let main = test_repo.commit_file_with_contents("file.txt", 3, "A\nX\nC\n")?;

    let options = ExecuteRebasePlanOptions::new(test_repo.now(4));
    let result = cherry_pick(&test_repo.repo, picked, &options)?;
    assert!(matches!(result, CherryPickResult::DeclinedToMerge { .. }));
    assert_eq!(
        get_current_operation_type(&test_repo.repo),
        Some(OperationType::CherryPick)
    );
    assert_eq!(
        load_cherry_pick_session(&test_repo.repo)?.map(|session| session.commit_oid),
        Some(picked)
    );
    assert_eq!(test_repo.repo.get_head_oid()?, main);

    cherry_pick_abort(&test_repo.repo)?;
    assert_eq!(test_repo.read_file("file.txt")?, Some("A\nX\nC\n".to_string()));
    assert_eq!(get_current_operation_type(&test_repo.repo), None);
    assert!(test_repo.get_status()?.is_clean());

    let result = cherry_pick(&test_repo.repo, picked, &options)?;
    assert!(matches!(result, CherryPickResult::DeclinedToMerge { .. }));
    test_repo.write_file("file.txt", "A\nX and Z\nC\n")?;
    test_repo.stage("file.txt")?;
    let new_oid = cherry_pick_continue(&test_repo.repo, &options)?;
    let new = test_repo.repo.find_commit_or_fail(new_oid)?;
    assert_eq!(new.get_parent_oids(), &[main]);
    assert_eq!(new.get_summary().to_string(), "create file.txt");
    assert_eq!(test_repo.repo.get_head_oid()?, new_oid);
    assert_eq!(get_current_operation_type(&test_repo.repo), None);
    assert!(test_repo.get_status()?.is_clean());
    Ok(())
}

#[test]
fn test_cherry_pick_requires_session() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    test_repo.commit_file("base", 1)?;
    let options = ExecuteRebasePlanOptions::new(test_repo.now(2));
    assert!(matches!(
        cherry_pick_continue(&test_repo.repo, &options),
        Err(Error::NoOperationInProgress {
            operation: OperationType::CherryPick
        })
    ));
    assert!(matches!(
        cherry_pick_abort(&test_repo.repo),
        Err(Error::NoOperationInProgress {
            operation: OperationType::CherryPick
        })
    ));
    Ok(())
}

#[test]
fn test_cherry_pick_refuses_uncommitted_changes() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    test_repo.commit_file("base", 1)?;
    test_repo.create_branch("feature")?;
    test_repo.switch("feature")?;
    let picked = test_repo.commit_file("picked", 2)?;
    test_repo.switch("main")?;
    let main = test_repo.commit_file("main", 3)?;
    test_repo.write_file("main.txt", "local edit\n")?;

    let options = ExecuteRebasePlanOptions::new(test_repo.now(4));
    match cherry_pick(&test_repo.repo, picked, &options) {
        Err(Error::UncommittedChanges { paths }) => assert_eq!(paths, vec!["main.txt"]),
        other => eyre::bail!("expected uncommitted changes, got {:?}", other),
    }
    assert_eq!(test_repo.read_file("main.txt")?, Some("local edit\n".to_string()));
    assert_eq!(test_repo.read_file("picked.txt")?, None);
    assert_eq!(test_repo.repo.get_head_oid()?, main);
    Ok(())
}

#[test]
fn test_cherry_pick_abort_removes_conflicted_file_missing_from_head() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    test_repo.commit_file_with_contents("file.txt", 1, "A\nB\nC\n")?;
    test_repo.create_branch("feature")?;
    test_repo.delete_file("file.txt")?;
    test_repo.stage("file.txt")?;
    let main = test_repo.run_commit("delete file.txt", 2)?;
    test_repo.switch("feature")?;
    let picked = test_repo.commit_file_with_contents("file.txt", 3, "A\nZ\nC\n")?;
    test_repo.switch("main")?;

    let options = ExecuteRebasePlanOptions::new(test_repo.now(4));
    let result = cherry_pick(&test_repo.repo, picked, &options)?;
    assert!(matches!(result, CherryPickResult::DeclinedToMerge { .. }));
    assert!(test_repo.read_file("file.txt")?.is_some());

    cherry_pick_abort(&test_repo.repo)?;
    assert_eq!(test_repo.read_file("file.txt")?, None);
    assert_eq!(test_repo.repo.get_head_oid()?, main);
    let status = test_repo.get_status()?;
    assert!(status.is_clean());
    assert!(status.untracked.is_empty());
    Ok(())
}
