mod common;

use common::{fixtures, test_ledger};
use update_ledger::{
    ContentType, DefinitionIterators, HashId, JobHandle, Mime, ServiceType,
};

const REPO_KEY: &[u8] = b"test tag repository";

fn subscribed_ledger() -> update_ledger::SqliteLedger {
    let mut ledger = test_ledger();
    ledger
        .add_repository_service(REPO_KEY, ServiceType::TagRepository, "test repo")
        .unwrap();
    ledger
}

fn import_and_register(
    ledger: &mut update_ledger::SqliteLedger,
    label: &str,
    mime: Mime,
) -> HashId {
    let hash_id = ledger
        .import_update_file(&fixtures::update_hash(label), mime, None)
        .unwrap();
    ledger.notify_updates_imported(&[hash_id]).unwrap();
    hash_id
}

#[test]
fn first_pass_flags_flip_as_work_completes() {
    let mut ledger = subscribed_ledger();

    let metadata = fixtures::manifest(&[(0, &["def0"]), (1, &["content1"])]);
    ledger
        .set_repository_update_hashes(REPO_KEY, &metadata)
        .unwrap();
    import_and_register(&mut ledger, "def0", Mime::UpdateDefinitions);
    import_and_register(&mut ledger, "content1", Mime::UpdateContent);

    let work = ledger
        .get_processable_update_hashes(REPO_KEY, &ContentType::ALL)
        .unwrap();
    assert!(work.first_definitions_work);
    assert!(work.first_content_work);

    let mut iterators =
        DefinitionIterators::new().with_hash_rows(vec![(1, fixtures::update_hash("payload"))]);
    ledger
        .process_repository_definitions(
            REPO_KEY,
            &fixtures::update_hash("def0"),
            &mut iterators,
            &[ContentType::Definitions],
            &JobHandle::new(),
            None,
        )
        .unwrap();

    let work = ledger
        .get_processable_update_hashes(REPO_KEY, &ContentType::ALL)
        .unwrap();
    assert!(!work.first_definitions_work);
    assert!(work.first_content_work);
    assert!(work.definition_updates.is_empty());
    assert_eq!(work.content_updates.len(), 1);

    let service_id = ledger.repository_service_id(REPO_KEY).unwrap();
    ledger
        .set_update_processed(
            service_id,
            &fixtures::update_hash("content1"),
            &[
                ContentType::Mappings,
                ContentType::TagParents,
                ContentType::TagSiblings,
            ],
        )
        .unwrap();

    let work = ledger
        .get_processable_update_hashes(REPO_KEY, &ContentType::ALL)
        .unwrap();
    assert!(!work.first_content_work);
    assert!(work.content_updates.is_empty());
}

#[test]
fn a_missing_sibling_blocks_its_whole_index_and_everything_after() {
    let mut ledger = subscribed_ledger();

    // index 1 has two sibling blobs
    let metadata = fixtures::manifest(&[
        (0, &["content0"]),
        (1, &["content1a", "content1b"]),
        (2, &["content2"]),
    ]);
    ledger
        .set_repository_update_hashes(REPO_KEY, &metadata)
        .unwrap();

    let content0 = import_and_register(&mut ledger, "content0", Mime::UpdateContent);
    import_and_register(&mut ledger, "content1a", Mime::UpdateContent);
    let content1b = import_and_register(&mut ledger, "content1b", Mime::UpdateContent);
    import_and_register(&mut ledger, "content2", Mime::UpdateContent);
    let _ = content0;

    // one sibling's file disappears: index 1 is incomplete
    ledger.remove_update_file(content1b).unwrap();

    let work = ledger
        .get_processable_update_hashes(REPO_KEY, &ContentType::ALL)
        .unwrap();

    let exposed: Vec<Vec<u8>> = work
        .content_updates
        .iter()
        .map(|update| update.hash.clone())
        .collect();
    assert_eq!(exposed, vec![fixtures::update_hash("content0")]);
}

#[test]
fn wanted_content_types_narrow_the_candidates() {
    let mut ledger = subscribed_ledger();

    let metadata = fixtures::manifest(&[(0, &["def0", "content0"])]);
    ledger
        .set_repository_update_hashes(REPO_KEY, &metadata)
        .unwrap();
    import_and_register(&mut ledger, "def0", Mime::UpdateDefinitions);
    import_and_register(&mut ledger, "content0", Mime::UpdateContent);

    let work = ledger
        .get_processable_update_hashes(REPO_KEY, &[ContentType::Definitions])
        .unwrap();
    assert_eq!(work.definition_updates.len(), 1);
    assert!(work.content_updates.is_empty());

    let work = ledger
        .get_processable_update_hashes(REPO_KEY, &[ContentType::Mappings])
        .unwrap();
    assert!(work.definition_updates.is_empty());
    assert_eq!(work.content_updates.len(), 1);
    // only the wanted subset of the blob's outstanding types is reported
    let wanted_only: std::collections::BTreeSet<ContentType> =
        std::iter::once(ContentType::Mappings).collect();
    assert_eq!(work.content_updates[0].content_types, wanted_only);
}

#[test]
fn progress_counts_by_content_type_with_zero_fill() {
    let mut ledger = subscribed_ledger();

    let metadata = fixtures::manifest(&[(0, &["def0"]), (1, &["content1", "content2"])]);
    ledger
        .set_repository_update_hashes(REPO_KEY, &metadata)
        .unwrap();
    import_and_register(&mut ledger, "def0", Mime::UpdateDefinitions);
    import_and_register(&mut ledger, "content1", Mime::UpdateContent);
    import_and_register(&mut ledger, "content2", Mime::UpdateContent);

    let service_id = ledger.repository_service_id(REPO_KEY).unwrap();
    ledger
        .set_update_processed(
            service_id,
            &fixtures::update_hash("content1"),
            &[ContentType::Mappings],
        )
        .unwrap();

    let progress = ledger.get_repository_progress(REPO_KEY).unwrap();
    assert_eq!(progress.num_total_updates, 3);
    assert_eq!(progress.num_local_updates, 3);

    assert_eq!(progress.total_by_type[&ContentType::Definitions], 1);
    assert_eq!(progress.total_by_type[&ContentType::Mappings], 2);
    assert_eq!(progress.total_by_type[&ContentType::TagParents], 2);

    assert_eq!(progress.processed_by_type[&ContentType::Mappings], 1);
    // untouched types are present with zero, not absent
    assert_eq!(progress.processed_by_type[&ContentType::Definitions], 0);
    assert_eq!(progress.processed_by_type[&ContentType::TagParents], 0);
    assert_eq!(progress.processed_by_type[&ContentType::TagSiblings], 0);
}

#[test]
fn missing_hashes_shrink_as_files_arrive() {
    let mut ledger = subscribed_ledger();

    let metadata = fixtures::manifest(&[(0, &["def0"]), (1, &["content1"]), (2, &["content2"])]);
    ledger
        .set_repository_update_hashes(REPO_KEY, &metadata)
        .unwrap();

    assert_eq!(ledger.get_missing_update_hashes(REPO_KEY).unwrap().len(), 3);

    import_and_register(&mut ledger, "content1", Mime::UpdateContent);

    let missing = ledger.get_missing_update_hashes(REPO_KEY).unwrap();
    assert_eq!(
        missing,
        vec![
            fixtures::update_hash("def0"),
            fixtures::update_hash("content2")
        ]
    );
}

#[test]
fn outstanding_work_threshold_is_exact() {
    let mut ledger = test_ledger();
    ledger
        .add_repository_service(REPO_KEY, ServiceType::FileRepository, "file repo")
        .unwrap();
    let service_id = ledger.repository_service_id(REPO_KEY).unwrap();

    // 19 unprocessed FILES rows: below the threshold of 20
    let labels: Vec<String> = (0..19).map(|n| format!("content{n}")).collect();
    let label_refs: Vec<&str> = labels.iter().map(String::as_str).collect();
    let mut rows: Vec<(i64, &[&str])> = Vec::new();
    for (index, label) in (0_i64..).zip(label_refs.iter()) {
        rows.push((index, std::slice::from_ref(label)));
    }
    ledger
        .set_repository_update_hashes(REPO_KEY, &fixtures::manifest(&rows))
        .unwrap();

    let ids: Vec<HashId> = labels
        .iter()
        .map(|label| {
            ledger
                .import_update_file(&fixtures::update_hash(label), Mime::UpdateContent, None)
                .unwrap()
        })
        .collect();
    ledger.notify_updates_imported(&ids).unwrap();

    assert!(
        !ledger
            .has_lots_of_outstanding_local_processing(service_id, &[ContentType::Files])
            .unwrap()
    );

    // one more row reaches the threshold
    ledger
        .associate_repository_update_hashes(
            REPO_KEY,
            &fixtures::manifest(&[(19, &["content19"])]),
        )
        .unwrap();
    let extra = ledger
        .import_update_file(&fixtures::update_hash("content19"), Mime::UpdateContent, None)
        .unwrap();
    ledger.notify_updates_imported(&[extra]).unwrap();

    assert!(
        ledger
            .has_lots_of_outstanding_local_processing(service_id, &[ContentType::Files])
            .unwrap()
    );
}
