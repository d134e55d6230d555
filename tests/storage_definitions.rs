mod common;

use std::time::Duration;

use common::{fixtures, open_raw, test_ledger, test_ledger_with_dir};
use update_ledger::storage::tables::repository_table_names;
use update_ledger::{
    ContentType, DefinitionIterators, JobHandle, LedgerError, MaintenanceJobType, Mime,
    ServiceType,
};

const REPO_KEY: &[u8] = b"test tag repository";

fn ledger_with_registered_definition(
) -> (update_ledger::SqliteLedger, update_ledger::ServiceId, i64) {
    let mut ledger = test_ledger();
    let service_id = ledger
        .add_repository_service(REPO_KEY, ServiceType::TagRepository, "test repo")
        .unwrap();

    let metadata = fixtures::manifest(&[(0, &["def0"])]);
    ledger
        .set_repository_update_hashes(REPO_KEY, &metadata)
        .unwrap();
    let def0 = ledger
        .import_update_file(&fixtures::update_hash("def0"), Mime::UpdateDefinitions, None)
        .unwrap();
    ledger.notify_updates_imported(&[def0]).unwrap();

    (ledger, service_id, def0)
}

#[test]
fn definitions_round_trip_through_normalisation() {
    let (mut ledger, service_id, _def0) = ledger_with_registered_definition();

    let mut iterators = DefinitionIterators::new()
        .with_hash_rows(vec![
            (100, fixtures::update_hash("payload a")),
            (101, fixtures::update_hash("payload b")),
        ])
        .with_tag_rows(vec![
            (200, "species:cat".to_string()),
            (201, "creator:someone".to_string()),
        ]);

    let applied = ledger
        .process_repository_definitions(
            REPO_KEY,
            &fixtures::update_hash("def0"),
            &mut iterators,
            &[ContentType::Definitions],
            &JobHandle::new(),
            None,
        )
        .unwrap();
    assert_eq!(applied, 4);

    // every remote id written during processing resolves
    let a = ledger.normalise_service_hash_id(service_id, 100).unwrap();
    let b = ledger.normalise_service_hash_id(service_id, 101).unwrap();
    assert_ne!(a, b);

    let bulk = ledger
        .normalise_service_hash_ids(service_id, &[100, 101].into_iter().collect())
        .unwrap();
    let expected: std::collections::HashSet<i64> = [a, b].into_iter().collect();
    assert_eq!(bulk, expected);

    assert!(ledger.normalise_service_tag_id(service_id, 200).is_ok());
    assert!(ledger.normalise_service_tag_id(service_id, 201).is_ok());

    let progress = ledger.get_repository_progress(REPO_KEY).unwrap();
    assert_eq!(progress.processed_by_type[&ContentType::Definitions], 1);
}

#[test]
fn caller_resume_loop_eventually_completes() {
    let (mut ledger, _service_id, _def0) = ledger_with_registered_definition();

    let hash_rows: Vec<(i64, Vec<u8>)> = (0..500)
        .map(|n: i64| (n, fixtures::update_hash(&format!("payload {n}"))))
        .collect();
    let tag_rows: Vec<(i64, String)> = (0..120).map(|n: i64| (n, format!("tag {n}"))).collect();
    let mut iterators = DefinitionIterators::new()
        .with_hash_rows(hash_rows)
        .with_tag_rows(tag_rows);

    // the client loop: hand the same iterators back until done
    let mut total = 0;
    let mut passes = 0;
    while !iterators.is_exhausted() {
        total += ledger
            .process_repository_definitions(
                REPO_KEY,
                &fixtures::update_hash("def0"),
                &mut iterators,
                &[ContentType::Definitions],
                &JobHandle::new(),
                Some(Duration::ZERO),
            )
            .unwrap();
        passes += 1;
        assert!(passes < 100, "resume loop failed to make progress");
    }

    assert_eq!(total, 620);

    let progress = ledger.get_repository_progress(REPO_KEY).unwrap();
    assert_eq!(progress.processed_by_type[&ContentType::Definitions], 1);
}

#[test]
fn cancelled_ingestion_resumes_into_the_tag_stream() {
    let (mut ledger, service_id, _def0) = ledger_with_registered_definition();

    let mut iterators = DefinitionIterators::new()
        .with_hash_rows(vec![(100, fixtures::update_hash("payload"))])
        .with_tag_rows(vec![(200, "species:cat".to_string())]);

    let job = JobHandle::new();
    job.cancel();

    // the hash chunk lands, then cancellation stops the call
    let applied = ledger
        .process_repository_definitions(
            REPO_KEY,
            &fixtures::update_hash("def0"),
            &mut iterators,
            &[ContentType::Definitions],
            &job,
            None,
        )
        .unwrap();
    assert_eq!(applied, 1);
    assert!(!iterators.is_exhausted());

    let progress = ledger.get_repository_progress(REPO_KEY).unwrap();
    assert_eq!(progress.processed_by_type[&ContentType::Definitions], 0);

    // a fresh call picks up at the tag stream
    let applied = ledger
        .process_repository_definitions(
            REPO_KEY,
            &fixtures::update_hash("def0"),
            &mut iterators,
            &[ContentType::Definitions],
            &JobHandle::new(),
            None,
        )
        .unwrap();
    assert_eq!(applied, 1);
    assert!(iterators.is_exhausted());

    assert!(ledger.normalise_service_hash_id(service_id, 100).is_ok());
    assert!(ledger.normalise_service_tag_id(service_id, 200).is_ok());

    let progress = ledger.get_repository_progress(REPO_KEY).unwrap();
    assert_eq!(progress.processed_by_type[&ContentType::Definitions], 1);
}

#[test]
fn corrupted_definition_map_triggers_committed_recovery() {
    let (mut ledger, dir) = test_ledger_with_dir();
    let service_id = ledger
        .add_repository_service(REPO_KEY, ServiceType::TagRepository, "test repo")
        .unwrap();

    let metadata = fixtures::manifest(&[(0, &["def0"])]);
    ledger
        .set_repository_update_hashes(REPO_KEY, &metadata)
        .unwrap();
    let def0 = ledger
        .import_update_file(&fixtures::update_hash("def0"), Mime::UpdateDefinitions, None)
        .unwrap();
    ledger.notify_updates_imported(&[def0]).unwrap();

    let mut iterators = DefinitionIterators::new()
        .with_hash_rows(vec![(100, fixtures::update_hash("payload"))]);
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

    // a crash or bad disk leaves the map missing a row
    {
        let raw = open_raw(&dir);
        let names = repository_table_names(service_id);
        raw.execute(
            &format!("DELETE FROM {} WHERE service_hash_id = 100", names.hash_id_map),
            [],
        )
        .unwrap();
    }

    let err = ledger
        .normalise_service_hash_id(service_id, 100)
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::CriticalDefinition { kind: "hash_id", .. }
    ));

    // the remedial work is visible from an independent connection,
    // proving it committed before the error surfaced
    let raw = open_raw(&dir);
    let names = repository_table_names(service_id);
    let unprocessed_definitions: i64 = raw
        .query_row(
            &format!(
                "SELECT COUNT( * ) FROM {} WHERE content_type = ?1 AND processed = 0",
                names.processed
            ),
            [ContentType::Definitions.as_i64()],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(unprocessed_definitions, 1);

    for job_type in [MaintenanceJobType::IntegrityData, MaintenanceJobType::Metadata] {
        let queued: i64 = raw
            .query_row(
                "SELECT COUNT( * ) FROM file_maintenance_jobs WHERE job_type = ?1",
                [job_type.as_i64()],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(queued, 1, "missing queued job for {job_type:?}");
    }
}

#[test]
fn reprocessing_definitions_reapplies_over_existing_maps() {
    let (mut ledger, service_id, _def0) = ledger_with_registered_definition();

    let rows = vec![(100, fixtures::update_hash("payload"))];
    let mut iterators = DefinitionIterators::new().with_hash_rows(rows.clone());
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
    let before = ledger.normalise_service_hash_id(service_id, 100).unwrap();

    ledger
        .reprocess_repository(REPO_KEY, &[ContentType::Definitions])
        .unwrap();

    // the blob shows up as definition work again
    let work = ledger
        .get_processable_update_hashes(REPO_KEY, &ContentType::ALL)
        .unwrap();
    assert_eq!(work.definition_updates.len(), 1);
    assert_eq!(work.definition_updates[0].hash, fixtures::update_hash("def0"));

    // second application replaces rather than duplicates
    let mut iterators = DefinitionIterators::new().with_hash_rows(rows);
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

    let after = ledger.normalise_service_hash_id(service_id, 100).unwrap();
    assert_eq!(before, after);
}
