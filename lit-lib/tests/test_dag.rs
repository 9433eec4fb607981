use lit::core::dag::Dag;
use lit::testing::make_test_repo;

#[test]
fn test_ancestors_and_fast_forward() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    let first = test_repo.commit_file("first", 1)?;
    let second = test_repo.commit_file("second", 2)?;
    let third = test_repo.commit_file("third", 3)?;
    let dag = Dag::new(&test_repo.repo);

    let ancestors: Vec<_> = dag.ancestors(third)?.into_iter().collect();
    assert_eq!(ancestors, vec![third, second, first]);
    let distances = dag.ancestor_distances(third)?;
    assert_eq!(distances.get(&first), Some(&2));

    assert!(dag.is_fast_forward(first, third)?);
    assert!(dag.is_fast_forward(third, third)?);
    assert!(!dag.is_fast_forward(third, first)?);
    assert_eq!(dag.merge_base(first, third)?, Some(first));
    assert_eq!(dag.merge_base(third, third)?, Some(third));
    Ok(())
}

#[test]
fn test_merge_base_of_diverged_branches() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    test_repo.commit_file("root", 1)?;
    let fork = test_repo.commit_file("fork", 2)?;
    test_repo.create_branch("feature")?;
    let main_tip = test_repo.commit_file("main", 3)?;
    test_repo.switch("feature")?;
    test_repo.commit_file("feature1", 4)?;
    let feature_tip = test_repo.commit_file("feature2", 5)?;
    let dag = Dag::new(&test_repo.repo);

    assert_eq!(dag.merge_base(main_tip, feature_tip)?, Some(fork));
    assert_eq!(dag.merge_base(feature_tip, main_tip)?, Some(fork));
    assert!(!dag.is_fast_forward(main_tip, feature_tip)?);

    let to_replay = dag.commits_to_replay(feature_tip, main_tip)?;
    let summaries = to_replay
        .iter()
        .map(|oid| {
            let commit = test_repo.repo.find_commit_or_fail(*oid)?;
            Ok(commit.get_summary().to_string())
        })
        .collect::<eyre::Result<Vec<_>>>()?;
    assert_eq!(summaries, vec!["create feature1.txt", "create feature2.txt"]);
    Ok(())
}

#[test]
fn test_merge_base_after_merge_commit() -> eyre::Result<()> {
    let test_repo = make_test_repo()?;
    test_repo.commit_file("root", 1)?;
    test_repo.create_branch("feature")?;
    let main1 = test_repo.commit_file("main1", 2)?;
    test_repo.switch("feature")?;
    let feature1 = test_repo.commit_file("feature1", 3)?;

    // Record a merge of `main` into `feature`.
    let tree_oid = test_repo.repo.get_index()?.build_tree(&test_repo.repo)?;
    let signature = test_repo
        .repo
        .find_commit_or_fail(feature1)?
        .get_author()
        .clone();
    let merge_oid = test_repo.repo.create_commit(
        tree_oid,
        vec![feature1, main1],
        signature.clone(),
        signature,
        "Merge main into feature",
    )?;
    test_repo.repo.update_head_target(merge_oid)?;
    test_repo.switch("main")?;
    let main2 = test_repo.commit_file("main2", 4)?;

    let dag = Dag::new(&test_repo.repo);
    assert_eq!(dag.merge_base(main2, merge_oid)?, Some(main1));
    assert_eq!(dag.merge_base(merge_oid, main2)?, Some(main1));

    let to_replay = dag.commits_to_replay(merge_oid, main2)?;
    assert_eq!(to_replay, vec![feature1, merge_oid]);
    Ok(())
}
