//! End-to-end scenarios for the migration orchestrator: dry-run planning,
//! the full saga, compensating rollback and book-closing.

mod setup;

use std::collections::HashMap;
use std::sync::Arc;

use everstream::backup::{BackupProvider, InMemoryBackupProvider};
use everstream::document::StreamClosureReason;
use everstream::migration::{
    close_books, execute, BackupConfig, BookClosingConfig, MigrationBuilder, RiskSeverity,
};
use everstream::store::{InMemoryDataStore, InMemoryDocumentStore, StoreError};

async fn seeded(
    object_id: &str,
    stream: &str,
    event_types: &[&str],
) -> (
    everstream::ObjectDocument,
    InMemoryDataStore,
    InMemoryDocumentStore,
) {
    let data_store = InMemoryDataStore::new();
    let document_store = InMemoryDocumentStore::new();
    let mut document = setup::document(object_id, stream);
    setup::seed_stream(&mut document, &data_store, &document_store, event_types).await;
    (document, data_store, document_store)
}

#[tokio::test]
async fn dry_run_without_backup_is_infeasible() {
    let (document, data_store, document_store) =
        seeded("order-1", "stream-1", &["EventA", "EventB", "EventA"]).await;

    let context = MigrationBuilder::new(document)
        .copy_to_new_stream("stream-2")
        .with_stores(Arc::new(data_store.clone()), Arc::new(document_store))
        .as_dry_run()
        .build()
        .unwrap();

    let result = execute(context).await;
    let plan = result.plan.expect("dry run produces a plan");

    assert_eq!(3, plan.source_analysis.event_count);
    assert_eq!(
        Some(&2),
        plan.source_analysis.event_type_distribution.get("EventA")
    );
    assert_eq!(
        Some(&1),
        plan.source_analysis.event_type_distribution.get("EventB")
    );
    assert!(plan.risks.iter().any(|risk| {
        risk.category == "Data Safety" && risk.severity == RiskSeverity::High
    }));
    assert!(!plan.is_feasible);

    // Nothing was written anywhere.
    assert!(data_store.events("stream-2").is_empty());
}

#[tokio::test]
async fn dry_run_with_backup_is_feasible() {
    let (document, data_store, document_store) =
        seeded("order-1", "stream-1", &["EventA", "EventB", "EventA"]).await;

    let context = MigrationBuilder::new(document)
        .copy_to_new_stream("stream-2")
        .with_stores(Arc::new(data_store), Arc::new(document_store))
        .with_backup(BackupConfig::new("/backups"))
        .as_dry_run()
        .build()
        .unwrap();

    let result = execute(context).await;
    let plan = result.plan.expect("dry run produces a plan");

    assert!(plan
        .risks
        .iter()
        .all(|risk| risk.severity != RiskSeverity::High));
    assert!(plan.is_feasible);
}

#[tokio::test]
async fn failed_cutover_restores_the_backup_and_the_document() {
    let (document, data_store, document_store) =
        seeded("order-1", "stream-1", &["EventA", "EventA", "EventB"]).await;
    let pre_migration = document_store.stored("order", "order-1").unwrap();

    let data_store = Arc::new(data_store);
    let backup_provider = Arc::new(InMemoryBackupProvider::new(data_store.clone()));

    // The copy phase succeeds; the cutover's document update does not.
    document_store.fail_next_set(StoreError::Unavailable("503".to_owned()));

    let context = MigrationBuilder::new(document)
        .copy_to_new_stream("stream-2")
        .with_stores(data_store.clone(), Arc::new(document_store.clone()))
        .with_backup(BackupConfig::new("/backups"))
        .with_backup_provider(backup_provider.clone() as Arc<dyn BackupProvider>)
        .with_rollback_support()
        .build()
        .unwrap();

    let result = execute(context).await;

    assert!(!result.success);
    assert!(result.statistics.rolled_back);
    assert_eq!(1, backup_provider.backup_calls());
    assert_eq!(1, backup_provider.restored().len());

    // The stored document still points at the pre-migration stream.
    let stored = document_store.stored("order", "order-1").unwrap();
    assert_eq!(
        pre_migration.active.stream_identifier,
        stored.active.stream_identifier
    );
    assert_eq!(
        pre_migration.active.current_stream_version,
        stored.active.current_stream_version
    );
    assert!(stored.terminated_streams.is_empty());
}

#[tokio::test]
async fn rollback_without_backup_is_advisory() {
    let (document, data_store, document_store) =
        seeded("order-1", "stream-1", &["EventA", "EventA"]).await;

    document_store.fail_next_set(StoreError::Unavailable("503".to_owned()));

    let context = MigrationBuilder::new(document)
        .copy_to_new_stream("stream-2")
        .with_stores(Arc::new(data_store.clone()), Arc::new(document_store))
        .with_rollback_support()
        .build()
        .unwrap();

    let result = execute(context).await;

    assert!(!result.success);
    // The flag marks that compensation ran; the copied events stay behind
    // as orphan data.
    assert!(result.statistics.rolled_back);
    assert_eq!(2, data_store.events("stream-2").len());
}

#[tokio::test]
async fn book_closing_finalizes_the_terminated_stream_idempotently() {
    let (document, data_store, document_store) =
        seeded("order-1", "stream-1", &["EventA", "EventB"]).await;

    let config = BookClosingConfig {
        reason: "Migration completed".to_owned(),
        mark_as_deleted: true,
        archive_location: Some("/archive/2024".to_owned()),
        create_snapshot: false,
        metadata: HashMap::from([("migratedBy".to_owned(), "automated".to_owned())]),
    };

    let context = MigrationBuilder::new(document.clone())
        .copy_to_new_stream("stream-2")
        .with_stores(Arc::new(data_store), Arc::new(document_store.clone()))
        .with_book_closing(config.clone())
        .build()
        .unwrap();

    let result = execute(context).await;
    assert!(result.success, "error: {:?}", result.error);

    let stored = document_store.stored("order", "order-1").unwrap();
    let terminated = stored
        .terminated_stream("stream-1")
        .expect("source stream is terminated");

    assert_eq!(
        StreamClosureReason::Other("Migration completed".to_owned()),
        terminated.reason
    );
    assert!(terminated.deleted);
    let metadata = terminated.metadata.as_ref().unwrap();
    assert_eq!(Some(&"automated".to_owned()), metadata.get("migratedBy"));
    assert_eq!(
        Some(&"/archive/2024".to_owned()),
        metadata.get("archiveLocation")
    );

    // A second book-closing pass over the same state changes nothing.
    let sets_before = document_store.set_calls();
    let (after, changed) = close_books(&document_store, &stored, "stream-1", &config)
        .await
        .expect("book-closing should not fail");

    assert!(!changed);
    assert_eq!(sets_before, document_store.set_calls());
    assert_eq!(stored, after);
}

#[tokio::test]
async fn migrated_stream_keeps_source_order_under_transformation_failures() {
    let (document, data_store, document_store) = seeded(
        "order-1",
        "stream-1",
        &["EventA", "EventB", "EventA", "EventB", "EventA"],
    )
    .await;

    let context = MigrationBuilder::new(document)
        .copy_to_new_stream("stream-2")
        .with_stores(Arc::new(data_store.clone()), Arc::new(document_store))
        .with_transformer(Arc::new(everstream::migration::FnTransformer(
            |event: everstream::Event| {
                if event.event_type == "EventB" {
                    return Err(everstream::migration::TransformError {
                        event_type: event.event_type,
                        event_version: event.event_version,
                        message: "dropped".to_owned(),
                    });
                }
                Ok(event)
            },
        )))
        .build()
        .unwrap();

    let result = execute(context).await;
    assert!(result.success, "error: {:?}", result.error);

    // |target| = |source| - transformation failures, in source order.
    assert_eq!(5, result.statistics.total_events);
    assert_eq!(2, result.statistics.transformation_failures);

    let target = data_store.events("stream-2");
    assert_eq!(3, target.len());
    assert!(target.iter().all(|e| e.event_type == "EventA"));
    assert_eq!(
        vec![0, 1, 2],
        target.iter().map(|e| e.event_version).collect::<Vec<_>>()
    );

    // The payload trail proves source order: versions 0, 2, 4.
    assert_eq!(
        vec![
            serde_json::json!({"n": 0}),
            serde_json::json!({"n": 2}),
            serde_json::json!({"n": 4}),
        ],
        target.into_iter().map(|e| e.payload).collect::<Vec<_>>()
    );
}
