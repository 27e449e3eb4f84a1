mod common;

use common::{Fixture, REPO};

use docvault::backup;
use docvault::BackupError;

/// Four backups of 5000, 4000, 3000 and 2000 new documents
fn four_backups(fx: &Fixture) -> Vec<String> {
    [("full", 5000), ("incr-1-", 4000), ("incr-2-", 3000), ("incr-3-", 2000)]
        .into_iter()
        .map(|(prefix, count)| {
            fx.cluster.load_documents("default", prefix, count).unwrap();
            fx.backup()
        })
        .collect()
}

#[test]
fn test_merge_whole_history() {
    let fx = Fixture::new();
    let names = four_backups(&fx);
    assert_eq!(fx.incr_docs(&names[3]), 2000);

    let merged = backup::merge(&fx.archive, REPO, &names[0], &names[3]).unwrap();
    assert_eq!(merged, names[3]);
    assert_eq!(fx.incr_docs(&names[3]), 14000);

    let summary = fx.archive.repository_summary(REPO).unwrap();
    assert_eq!(summary.num_incr_backups, 1);
    assert_eq!(summary.total_docs, 14000);

    let instance = fx.archive.instance(REPO, &names[3]).unwrap();
    assert_eq!(instance.merged_from, names);

    fx.cluster.delete_all_buckets();
    assert_eq!(fx.restore(None, None), 14000);
}

#[test]
fn test_merge_middle_range() {
    let fx = Fixture::new();
    let names = four_backups(&fx);

    backup::merge(&fx.archive, REPO, &names[1], &names[2]).unwrap();
    assert_eq!(
        fx.archive.list_instances(REPO).unwrap(),
        vec![names[0].clone(), names[2].clone(), names[3].clone()]
    );
    assert_eq!(fx.incr_docs(&names[2]), 7000);
    assert_eq!(fx.info()["default"].num_docs, 14000);

    // Backups continue from the merged history
    fx.cluster.load_documents("default", "incr-4-", 1000).unwrap();
    let name5 = fx.backup();
    assert_eq!(fx.incr_docs(&name5), 1000);

    fx.cluster.delete_all_buckets();
    assert_eq!(fx.restore(Some(&names[2]), None), 10000);
}

#[test]
fn test_merge_keeps_latest_version_of_each_key() {
    let fx = Fixture::new();
    fx.cluster.load_documents("default", "doc", 1000).unwrap();
    let name1 = fx.backup();
    fx.cluster.delete_documents("default", "doc", 300).unwrap();
    let name2 = fx.backup();

    backup::merge(&fx.archive, REPO, &name1, &name2).unwrap();
    let record = &fx.archive.incr_backup_info(REPO, &name2).unwrap()["default"];
    assert_eq!(record.num_docs, 700);
    assert_eq!(record.num_deletions, 300);

    fx.cluster.delete_all_buckets();
    assert_eq!(fx.restore(None, None), 700);
}

#[test]
fn test_merge_preserves_backup_info() {
    let fx = Fixture::new();
    fx.cluster.load_documents("default", "doc", 1000).unwrap();
    let name1 = fx.backup();

    // 300 deleted, 200 of them written again
    fx.cluster.delete_documents("default", "doc", 300).unwrap();
    fx.cluster.load_documents("default", "doc", 200).unwrap();
    let name2 = fx.backup();

    let before = fx.info();
    assert_eq!(before["default"].num_docs, 900);
    assert_eq!(before["default"].num_deletions, 100);
    assert_eq!(fx.archive.repository_summary(REPO).unwrap().total_docs, 900);

    backup::merge(&fx.archive, REPO, &name1, &name2).unwrap();
    assert_eq!(fx.info(), before);
    assert_eq!(fx.archive.repository_summary(REPO).unwrap().total_docs, 900);

    fx.cluster.delete_all_buckets();
    assert_eq!(fx.restore(None, None), 900);
}

/// The original four instances, the merged one, or the merged one plus a backup
fn is_whole_state(list: &[String], names: &[String]) -> bool {
    list == names || list == &names[3..] || (list.len() == 2 && list[0] == names[3])
}

#[test]
fn test_readers_never_see_partial_state() {
    let fx = Fixture::new();
    let names = four_backups(&fx);

    std::thread::scope(|scope| {
        let writer = scope.spawn(|| {
            backup::merge(&fx.archive, REPO, &names[0], &names[3]).unwrap();
            fx.cluster.load_documents("default", "incr-4-", 1000).unwrap();
            fx.backup();
        });

        let mut observations = 0;
        loop {
            let finished = writer.is_finished();

            let listed = fx.archive.list_instances(REPO).unwrap();
            assert!(is_whole_state(&listed, &names), "listed {:?}", listed);

            let history: Vec<String> = fx
                .archive
                .open_history(REPO)
                .unwrap()
                .iter()
                .map(|i| i.name().to_string())
                .collect();
            assert!(is_whole_state(&history, &names), "opened {:?}", history);

            let docs = fx.archive.backup_info(REPO, None).unwrap()["default"].num_docs;
            assert!(docs == 14000 || docs == 15000, "backup_info saw {} documents", docs);

            observations += 1;
            if finished {
                break;
            }
        }

        writer.join().unwrap();
        assert!(observations > 0);
    });

    assert_eq!(fx.archive.list_instances(REPO).unwrap().len(), 2);
    assert_eq!(fx.info()["default"].num_docs, 15000);
}

#[test]
fn test_merge_single_instance_is_noop() {
    let fx = Fixture::new();
    let names = four_backups(&fx);

    let merged = backup::merge(&fx.archive, REPO, &names[1], &names[1]).unwrap();
    assert_eq!(merged, names[1]);
    assert_eq!(fx.archive.list_instances(REPO).unwrap(), names);
}

#[test]
fn test_merge_errors() {
    let fx = Fixture::new();
    let names = four_backups(&fx);

    let err = backup::merge(&fx.archive, REPO, &names[2], &names[0]).unwrap_err();
    assert!(matches!(err, BackupError::InvalidRange { .. }));

    let err = backup::merge(&fx.archive, REPO, "missing", &names[0]).unwrap_err();
    assert!(matches!(err, BackupError::InstanceNotFound { .. }));

    assert_eq!(fx.archive.list_instances(REPO).unwrap(), names);
}
