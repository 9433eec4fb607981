use lit::git::{ReferenceName, RepoError};
use lit::testing::make_test_repo;

#[test]
fn test_resolve_revision_suffixes() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    let first = test_repo.commit_file("first", 1)?;
    let second = test_repo.commit_file("second", 2)?;
    let third = test_repo.commit_file("third", 3)?;

    assert_eq!(test_repo.resolve("HEAD")?, third);
    assert_eq!(test_repo.resolve("@")?, third);
    assert_eq!(test_repo.resolve("main")?, third);
    assert_eq!(test_repo.resolve("refs/heads/main")?, third);
    assert_eq!(test_repo.resolve("HEAD~")?, second);
    assert_eq!(test_repo.resolve("HEAD~2")?, first);
    assert_eq!(test_repo.resolve("HEAD^")?, second);
    assert_eq!(test_repo.resolve("HEAD^^")?, first);
    assert_eq!(test_repo.resolve("main~1^1")?, first);
    assert_eq!(test_repo.resolve("HEAD^0")?, third);
    assert_eq!(test_repo.resolve(&third.to_string())?, third);
    assert_eq!(test_repo.resolve(&third.to_short_string())?, third);

    assert!(matches!(
        test_repo.repo.resolve_revision("HEAD~3"),
        Err(RepoError::RevisionNotFound { .. })
    ));
    assert!(matches!(
        test_repo.repo.resolve_revision("HEAD^2"),
        Err(RepoError::RevisionNotFound { .. })
    ));
    assert!(matches!(
        test_repo.repo.resolve_revision("nonexistent"),
        Err(RepoError::RevisionNotFound { .. })
    ));
    assert!(matches!(
        test_repo.repo.resolve_revision(""),
        Err(RepoError::RevisionNotFound { .. })
    ));
    Ok(())
}

#[test]
fn test_resolve_tags_and_remote_branches() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    let first = test_repo.commit_file("first", 1)?;
    let second = test_repo.commit_file("second", 2)?;

    test_repo.repo.create_tag("v1", first, false)?;
    test_repo.repo.create_reference(
        &ReferenceName::from("refs/remotes/origin/main"),
        first,
        false,
    )?;
    assert_eq!(test_repo.resolve("v1")?, first);
    assert_eq!(test_repo.resolve("origin/main")?, first);
    assert_eq!(
        test_repo.repo.get_remote_branches()?,
        vec![("origin/main".to_string(), first)]
    );

    // Branches take precedence over tags of the same name.
    test_repo.repo.create_branch("v1", second, false)?;
    assert_eq!(test_repo.resolve("v1")?, second);
    assert_eq!(test_repo.resolve("refs/tags/v1")?, first);
    Ok(())
}

#[test]
fn test_references_take_precedence_over_abbreviated_oids() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    let first = test_repo.commit_file("first", 1)?;
    let second = test_repo.commit_file("second", 2)?;

    let prefix = second.to_short_string();
    test_repo.repo.create_branch(&prefix, first, false)?;
    assert_eq!(test_repo.resolve(&prefix)?, first);
    assert_eq!(test_repo.resolve(&second.to_string())?, second);
    Ok(())
}

#[test]
fn test_ambiguous_abbreviated_oid() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    let object_store = test_repo.repo.get_object_store();

    // With 256 possible two-digit prefixes, some pair of these blobs must
    // share one.
    let mut ambiguous_prefix = None;
    for i in 0..=256 {
        let oid = test_repo
            .repo
            .create_blob_from_contents(format!("blob {}\n", i).as_bytes())?;
        let prefix = oid.to_string()[..2].to_string();
        if object_store.find_by_prefix(&prefix)?.len() > 1 {
            ambiguous_prefix = Some(prefix);
            break;
        }
    }
    let prefix = match ambiguous_prefix {
        Some(prefix) => prefix,
        None => eyre::bail!("expected two blobs to share a prefix"),
    };

    match test_repo.repo.resolve_revision(&prefix) {
        Err(RepoError::AmbiguousRevision { expr, candidates }) => {
            assert_eq!(expr, prefix);
            assert_eq!(candidates.len(), 2);
        }
        other => eyre::bail!("expected an ambiguous revision, got {:?}", other),
    }

    // A single hex digit is never treated as an abbreviated OID.
    let single_digit = &prefix[..1];
    assert!(matches!(
        test_repo.repo.resolve_revision(single_digit),
        Err(RepoError::RevisionNotFound { .. })
    ));
    Ok(())
}

#[test]
fn test_branch_lifecycle() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    let first = test_repo.commit_file("first", 1)?;
    test_repo.create_branch("feature")?;

    assert!(matches!(
        test_repo.repo.create_branch("feature", first, false),
        Err(RepoError::ReferenceExists { .. })
    ));
    assert!(matches!(
        test_repo.repo.create_branch("bad..name", first, false),
        Err(RepoError::InvalidReferenceName { .. })
    ));
    assert!(matches!(
        test_repo.repo.delete_branch("main"),
        Err(RepoError::DeleteCurrentBranch { .. })
    ));

    test_repo.repo.rename_branch("main", "trunk")?;
    assert_eq!(test_repo.repo.get_current_branch()?, Some("trunk".to_string()));
    let branch_names: Vec<_> = test_repo
        .repo
        .get_all_local_branches()?
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    assert_eq!(branch_names, vec!["feature", "trunk"]);

    test_repo.repo.delete_branch("feature")?;
    assert!(matches!(
        test_repo.repo.delete_branch("feature"),
        Err(RepoError::ReferenceNotFound { .. })
    ));
    Ok(())
}
