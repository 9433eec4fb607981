use std::collections::BTreeMap;

use lit::core::rewrite::{
    rebase_abort, rebase_continue, rebase_skip, start_rebase, ExecuteRebasePlanOptions,
    ExecuteRebasePlanResult, FailedMergeInfo, RebasePlan,
};
use lit::core::session::{get_current_operation_type, load_rebase_state, Error, OperationType};
use lit::git::{list_working_copy_files, MaybeZeroOid, NoIgnore, NonZeroOid};
use lit::testing::{make_test_repo, TestRepo};

fn snapshot_working_copy(test_repo: &TestRepo) -> eyre::Result<BTreeMap<String, Vec<u8>>> {
    let mut result = BTreeMap::new();
    for path in list_working_copy_files(&test_repo.repo, &NoIgnore)? {
        let contents = std::fs::read(test_repo.path().join(&path))?;
        result.insert(path, contents);
    }
    Ok(result)
}

fn get_rewritten_oids(
    result: ExecuteRebasePlanResult,
) -> eyre::Result<BTreeMap<NonZeroOid, MaybeZeroOid>> {
    match result {
        ExecuteRebasePlanResult::Succeeded { rewritten_oids } => Ok(rewritten_oids),
        other => eyre::bail!("unexpected rebase result: {:?}", other),
    }
}

#[test]
fn test_rebase_linear_commits() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    test_repo.commit_file("base", 1)?;
    test_repo.create_branch("feature")?;
    let upstream = test_repo.commit_file("upstream", 2)?;
    test_repo.switch("feature")?;
    let originals = vec![
        test_repo.commit_file("one", 3)?,
        test_repo.commit_file("two", 4)?,
        test_repo.commit_file("three", 5)?,
    ];

    let plan = RebasePlan::build(&test_repo.repo, upstream)?;
    assert_eq!(plan.get_commits_to_replay(), originals);

    let options = ExecuteRebasePlanOptions::new(test_repo.now(6));
    let rewritten_oids = get_rewritten_oids(start_rebase(&test_repo.repo, upstream, &options)?)?;
    assert_eq!(rewritten_oids.len(), 3);

    let mut new_oids = Vec::new();
    let mut current = test_repo.repo.get_head_oid()?;
    for _ in 0..3 {
        new_oids.push(current);
        let commit = test_repo.repo.find_commit_or_fail(current)?;
        current = commit
            .get_only_parent_oid()
            .ok_or_else(|| eyre::eyre!("expected exactly one parent"))?;
    }
    assert_eq!(current, upstream);
    new_oids.reverse();

    for (original_oid, new_oid) in originals.iter().zip(&new_oids) {
        assert_ne!(original_oid, new_oid);
        assert_eq!(
            rewritten_oids.get(original_oid),
            Some(&MaybeZeroOid::NonZero(*new_oid))
        );
        let original = test_repo.repo.find_commit_or_fail(*original_oid)?;
        let new = test_repo.repo.find_commit_or_fail(*new_oid)?;
        assert_eq!(original.get_message_raw(), new.get_message_raw());
        assert_eq!(original.get_author(), new.get_author());
        assert_eq!(
            original.get_committer().get_identity(),
            new.get_committer().get_identity()
        );
        assert_ne!(original.get_committer().get_time(), new.get_committer().get_time());
    }

    assert_eq!(test_repo.repo.get_current_branch()?, Some("feature".to_string()));
    for name in ["base", "upstream", "one", "two", "three"] {
        assert_eq!(
            test_repo.read_file(&format!("{}.txt", name))?,
            Some(format!("{} contents\n", name))
        );
    }
    assert!(test_repo.get_status()?.is_clean());
    assert_eq!(get_current_operation_type(&test_repo.repo), None);
    Ok(())
}

#[test]
fn test_rebase_onto_ancestor_rewrites_commits() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    let base = test_repo.commit_file("base", 1)?;
    let one = test_repo.commit_file("one", 2)?;
    let two = test_repo.commit_file("two", 3)?;

    let options = ExecuteRebasePlanOptions::new(test_repo.now(4));
    let rewritten_oids = get_rewritten_oids(start_rebase(&test_repo.repo, base, &options)?)?;
    assert_eq!(rewritten_oids.len(), 2);
    assert!(rewritten_oids.contains_key(&one));
    assert!(rewritten_oids.contains_key(&two));

    let head = test_repo.repo.find_commit_or_fail(test_repo.repo.get_head_oid()?)?;
    assert_ne!(head.get_oid(), two);
    assert_eq!(
        head.get_tree_oid(),
        test_repo.repo.find_commit_or_fail(two)?.get_tree_oid()
    );
    Ok(())
}

#[test]
fn test_rebase_preserve_timestamps() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    let base = test_repo.commit_file("base", 1)?;
    let one = test_repo.commit_file("one", 2)?;

    let options = ExecuteRebasePlanOptions {
        preserve_timestamps: true,
        ..ExecuteRebasePlanOptions::new(test_repo.now(3))
    };
    let rewritten_oids = get_rewritten_oids(start_rebase(&test_repo.repo, base, &options)?)?;
    // Nothing about the commit changed, so it is recreated identically.
    assert_eq!(rewritten_oids.get(&one), Some(&MaybeZeroOid::NonZero(one)));
    Ok(())
}

#[test]
fn test_rebase_fast_forward_and_up_to_date() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    test_repo.commit_file("base", 1)?;
    test_repo.create_branch("feature")?;
    let upstream = test_repo.commit_file("upstream", 2)?;
    test_repo.switch("feature")?;

    let options = ExecuteRebasePlanOptions::new(test_repo.now(3));
    assert_eq!(
        start_rebase(&test_repo.repo, upstream, &options)?,
        ExecuteRebasePlanResult::FastForwarded { oid: upstream }
    );
    assert_eq!(test_repo.repo.get_head_oid()?, upstream);
    assert_eq!(test_repo.repo.get_current_branch()?, Some("feature".to_string()));
    assert_eq!(
        test_repo.read_file("upstream.txt")?,
        Some("upstream contents\n".to_string())
    );

    assert_eq!(
        start_rebase(&test_repo.repo, upstream, &options)?,
        ExecuteRebasePlanResult::UpToDate
    );
    Ok(())
}

struct ConflictSetup {
    upstream: NonZeroOid,
    unrelated: NonZeroOid,
    conflicting: NonZeroOid,
}

/// `main` changes line 2 of `file.txt`; `feature` adds `other.txt` and then
/// changes the same line differently. `feature` is left checked out.
fn make_conflict_setup(test_repo: &TestRepo) -> eyre::Result<ConflictSetup> {
    test_repo.commit_file_with_contents("file.txt", 1, "A\nB\nC\n")?;
    test_repo.create_branch("feature")?;
    let upstream = test_repo.commit_file_with_contents("file.txt", 2, "A\nX\nC\n")?;
    test_repo.switch("feature")?;
    let unrelated = test_repo.commit_file("other", 3)?;
    let conflicting = test_repo.commit_file_with_contents("file.txt", 4, "A\nZ\nC\n")?;
    Ok(ConflictSetup {
        upstream,
        unrelated,
        conflicting,
    })
}

fn expect_conflict(result: ExecuteRebasePlanResult) -> eyre::Result<FailedMergeInfo> {
    match result {
        ExecuteRebasePlanResult::DeclinedToMerge { failed_merge_info } => Ok(failed_merge_info),
        other => eyre::bail!("expected a conflict, got: {:?}", other),
    }
}

#[test]
fn test_rebase_conflict_abort_restores_state() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    let setup = make_conflict_setup(&test_repo)?;
    let working_copy_before = snapshot_working_copy(&test_repo)?;

    let options = ExecuteRebasePlanOptions::new(test_repo.now(5));
    let failed_merge_info =
        expect_conflict(start_rebase(&test_repo.repo, setup.upstream, &options)?)?;
    let FailedMergeInfo::Conflict { commit_oid, .. } = &failed_merge_info;
    assert_eq!(*commit_oid, setup.conflicting);
    assert_eq!(failed_merge_info.get_conflicting_paths(), vec!["file.txt"]);
    assert_eq!(
        get_current_operation_type(&test_repo.repo),
        Some(OperationType::Rebase)
    );
    let state = load_rebase_state(&test_repo.repo)?
        .ok_or_else(|| eyre::eyre!("rebase state missing"))?;
    assert_eq!(state.cursor, 1);
    assert_eq!(state.current_commit(), Some(setup.conflicting));
    assert!(test_repo
        .read_file("file.txt")?
        .unwrap_or_default()
        .starts_with("<<<<<<< HEAD\n"));

    rebase_abort(&test_repo.repo)?;
    assert_eq!(test_repo.repo.get_head_oid()?, setup.conflicting);
    assert_eq!(test_repo.repo.get_current_branch()?, Some("feature".to_string()));
    assert_eq!(snapshot_working_copy(&test_repo)?, working_copy_before);
    assert!(test_repo.get_status()?.is_clean());
    assert_eq!(get_current_operation_type(&test_repo.repo), None);
    Ok(())
}

#[test]
fn test_rebase_conflict_continue() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    let setup = make_conflict_setup(&test_repo)?;
    let options = ExecuteRebasePlanOptions::new(test_repo.now(5));
    expect_conflict(start_rebase(&test_repo.repo, setup.upstream, &options)?)?;

    test_repo.write_file("file.txt", "A\nXZ\nC\n")?;
    test_repo.stage("file.txt")?;
    let rewritten_oids = get_rewritten_oids(rebase_continue(&test_repo.repo, &options)?)?;
    assert_eq!(rewritten_oids.len(), 2);

    let head = test_repo.repo.find_commit_or_fail(test_repo.repo.get_head_oid()?)?;
    assert_eq!(head.get_summary().to_string(), "create file.txt");
    assert_eq!(
        rewritten_oids.get(&setup.conflicting),
        Some(&MaybeZeroOid::NonZero(head.get_oid()))
    );
    let parent_oid = head
        .get_only_parent_oid()
        .ok_or_else(|| eyre::eyre!("expected exactly one parent"))?;
    assert_eq!(
        rewritten_oids.get(&setup.unrelated),
        Some(&MaybeZeroOid::NonZero(parent_oid))
    );
    assert_eq!(test_repo.read_file("file.txt")?, Some("A\nXZ\nC\n".to_string()));
    assert_eq!(get_current_operation_type(&test_repo.repo), None);
    Ok(())
}

#[test]
fn test_rebase_conflict_skip() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    let setup = make_conflict_setup(&test_repo)?;
    let options = ExecuteRebasePlanOptions::new(test_repo.now(5));
    expect_conflict(start_rebase(&test_repo.repo, setup.upstream, &options)?)?;

    let rewritten_oids = get_rewritten_oids(rebase_skip(&test_repo.repo, &options)?)?;
    assert_eq!(
        rewritten_oids.get(&setup.conflicting),
        Some(&MaybeZeroOid::Zero)
    );
    let head = test_repo.repo.find_commit_or_fail(test_repo.repo.get_head_oid()?)?;
    assert_eq!(head.get_summary().to_string(), "create other.txt");
    assert_eq!(head.get_only_parent_oid(), Some(setup.upstream));
    assert_eq!(test_repo.read_file("file.txt")?, Some("A\nX\nC\n".to_string()));
    assert!(test_repo.get_status()?.is_clean());
    Ok(())
}

#[test]
fn test_rebase_requires_session() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    test_repo.commit_file("base", 1)?;
    let options = ExecuteRebasePlanOptions::new(test_repo.now(2));
    for result in [
        rebase_continue(&test_repo.repo, &options).map(|_| ()),
        rebase_skip(&test_repo.repo, &options).map(|_| ()),
        rebase_abort(&test_repo.repo),
    ] {
        assert!(matches!(
            result,
            Err(Error::NoOperationInProgress {
                operation: OperationType::Rebase
            })
        ));
    }
    Ok(())
}

#[test]
fn test_rebase_refuses_while_in_progress() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    let setup = make_conflict_setup(&test_repo)?;
    let options = ExecuteRebasePlanOptions::new(test_repo.now(5));
    expect_conflict(start_rebase(&test_repo.repo, setup.upstream, &options)?)?;
    assert!(matches!(
        start_rebase(&test_repo.repo, setup.upstream, &options),
        Err(Error::OperationAlreadyInProgress {
            operation: OperationType::Rebase
        })
    ));
    Ok(())
}

#[test]
fn test_rebase_refuses_uncommitted_changes() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    let setup = make_conflict_setup(&test_repo)?;
    test_repo.write_file("other.txt", "precious local edit\n")?;

    let options = ExecuteRebasePlanOptions::new(test_repo.now(5));
    match start_rebase(&test_repo.repo, setup.upstream, &options) {
        Err(Error::UncommittedChanges { paths }) => assert_eq!(paths, vec!["other.txt"]),
        other => eyre::bail!("expected uncommitted changes, got {:?}", other),
    }
    assert_eq!(
        test_repo.read_file("other.txt")?,
        Some("precious local edit\n".to_string())
    );
    assert_eq!(test_repo.repo.get_head_oid()?, setup.conflicting);
    assert_eq!(get_current_operation_type(&test_repo.repo), None);
    Ok(())
}

#[test]
fn test_rebase_skip_removes_file_deleted_upstream() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    test_repo.commit_file_with_contents("file.txt", 1, "A\nB\nC\n")?;
    test_repo.create_branch("feature")?;
    test_repo.delete_file("file.txt")?;
    test_repo.stage("file.txt")?;
    let upstream = test_repo.run_commit("delete file.txt", 2)?;
    test_repo.switch("feature")?;
    let conflicting = test_repo.commit_file_with_contents("file.txt", 3, "A\nZ\nC\n")?;

    let options = ExecuteRebasePlanOptions::new(test_repo.now(4));
    let failed_merge_info = expect_conflict(start_rebase(&test_repo.repo, upstream, &options)?)?;
    assert_eq!(failed_merge_info.get_conflicting_paths(), vec!["file.txt"]);
    assert!(test_repo
        .read_file("file.txt")?
        .unwrap_or_default()
        .starts_with("<<<<<<< HEAD\n=======\nA\nZ\nC\n>>>>>>> "));

    let rewritten_oids = get_rewritten_oids(rebase_skip(&test_repo.repo, &options)?)?;
    assert_eq!(rewritten_oids.get(&conflicting), Some(&MaybeZeroOid::Zero));
    assert_eq!(test_repo.repo.get_head_oid()?, upstream);
    assert_eq!(test_repo.read_file("file.txt")?, None);
    let status = test_repo.get_status()?;
    assert!(status.is_clean());
    assert!(status.untracked.is_empty());
    Ok(())
}
