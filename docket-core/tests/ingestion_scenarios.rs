mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Workspace, pdf_with_barcode, pdf_without_barcode};
use docket_core::{
    ChangeKind, ChangeTag, ContentHasher, DebounceConfig, EventDebouncer,
    FingerprintSource, LogicalEvent, PipelineStats, RawEvent, RawEventKind,
};
use tokio::sync::mpsc;

#[tokio::test]
async fn scanned_pdf_is_renamed_from_its_barcode() {
    let ws = Workspace::new();
    let scan = ws.write("scan001.pdf", &pdf_with_barcode("EAN-900112345", "a"));
    let mut pipeline = ws.pipeline();

    pipeline
        .process(LogicalEvent::Created { path: scan.clone() })
        .await
        .unwrap();

    let renamed = ws.inbox.join("EAN-900112345.pdf");
    assert!(!scan.exists());
    assert!(renamed.exists());

    assert!(ws.store.get(&scan).is_none());
    let record = ws.store.get(&renamed).unwrap();
    assert_eq!(record.digest, ContentHasher::hash_bytes(&pdf_with_barcode("EAN-900112345", "a")));

    let entries = ws.entries();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].kind, ChangeKind::MovedFrom);
    assert_eq!(entries[0].path, scan);
    assert_eq!(entries[0].counterpart.as_deref(), Some(renamed.as_path()));
    assert_eq!(entries[1].kind, ChangeKind::MovedTo);
    assert_eq!(entries[1].path, renamed);
    assert_eq!(entries[2].kind, ChangeKind::Created);
    assert_eq!(entries[2].path, renamed);
    assert_eq!(entries[2].digest, Some(record.digest));
}

#[tokio::test]
async fn pdf_without_barcode_keeps_its_name() {
    let ws = Workspace::new();
    let scan = ws.write("scan002.pdf", &pdf_without_barcode("b"));
    let mut pipeline = ws.pipeline();

    pipeline
        .process(LogicalEvent::Created { path: scan.clone() })
        .await
        .unwrap();

    assert!(scan.exists());
    assert!(ws.store.get(&scan).is_some());
    assert_eq!(
        ws.kinds(),
        vec![(ChangeKind::Created, Some(ChangeTag::NoBarcode))]
    );
}

#[tokio::test]
async fn replayed_creation_is_idempotent() {
    let ws = Workspace::new();
    let scan = ws.write("scan003.pdf", &pdf_with_barcode("INV-42", "c"));
    let mut pipeline = ws.pipeline();
    pipeline
        .process(LogicalEvent::Created { path: scan })
        .await
        .unwrap();

    let renamed = ws.inbox.join("INV-42.pdf");
    let before = ws.store.get(&renamed).unwrap();
    let store_bytes = std::fs::read(ws.store_path()).unwrap();

    // A fresh pipeline, as after a restart, has no memory of the rename.
    let mut pipeline = ws.pipeline();
    pipeline
        .process(LogicalEvent::Created {
            path: renamed.clone(),
        })
        .await
        .unwrap();

    assert!(renamed.exists());
    assert!(!ws.inbox.join("INV-42-2.pdf").exists());
    assert_eq!(ws.store.get(&renamed).unwrap(), before);
    assert_eq!(std::fs::read(ws.store_path()).unwrap(), store_bytes);
    assert_eq!(
        ws.kinds().last().cloned(),
        Some((ChangeKind::Created, Some(ChangeTag::Unchanged)))
    );
}

#[tokio::test]
async fn equal_barcodes_get_distinct_names() {
    let ws = Workspace::new();
    let first = ws.write("first.pdf", &pdf_with_barcode("ORDER-7", "one"));
    let second = ws.write("second.pdf", &pdf_with_barcode("ORDER-7", "two"));
    let mut pipeline = ws.pipeline();

    pipeline
        .process(LogicalEvent::Created { path: first })
        .await
        .unwrap();
    pipeline
        .process(LogicalEvent::Created { path: second })
        .await
        .unwrap();

    let a = ws.inbox.join("ORDER-7.pdf");
    let b = ws.inbox.join("ORDER-7-2.pdf");
    assert_eq!(std::fs::read(&a).unwrap(), pdf_with_barcode("ORDER-7", "one"));
    assert_eq!(std::fs::read(&b).unwrap(), pdf_with_barcode("ORDER-7", "two"));
    assert!(ws.store.get(&a).is_some());
    assert!(ws.store.get(&b).is_some());
}

#[tokio::test]
async fn non_pdf_files_are_only_hashed() {
    let ws = Workspace::new();
    let notes = ws.write("notes.txt", b"BARCODE=IGNORED\n");
    let mut pipeline = ws.pipeline();

    pipeline
        .process(LogicalEvent::Created {
            path: notes.clone(),
        })
        .await
        .unwrap();

    assert!(notes.exists());
    assert_eq!(ws.kinds(), vec![(ChangeKind::Created, None)]);
}

#[tokio::test]
async fn deleting_a_tracked_file_logs_its_last_digest() {
    let ws = Workspace::new();
    let notes = ws.write("notes.txt", b"hello");
    let mut pipeline = ws.pipeline();
    pipeline
        .process(LogicalEvent::Created {
            path: notes.clone(),
        })
        .await
        .unwrap();

    std::fs::remove_file(&notes).unwrap();
    pipeline
        .process(LogicalEvent::Deleted {
            path: notes.clone(),
        })
        .await
        .unwrap();

    let entries = ws.entries();
    assert_eq!(entries[1].kind, ChangeKind::Deleted);
    assert_eq!(entries[1].digest, Some(ContentHasher::hash_bytes(b"hello")));
    assert!(ws.store.get(&notes).is_none());
}

/// Raw events through the debouncer into the pipeline, the way the runtime
/// wires them, minus the OS watcher.
async fn run_raw(ws: &Workspace, events: Vec<RawEvent>) -> PipelineStats {
    let (raw_tx, raw_rx) = mpsc::channel(16);
    let (logical_tx, logical_rx) = mpsc::channel(16);
    let source: Arc<dyn FingerprintSource> = ws.store.clone();
    let debouncer = EventDebouncer::new(
        DebounceConfig {
            settle_window: Duration::from_millis(20),
            poll_interval: Duration::from_millis(10),
            ..DebounceConfig::default()
        },
        source,
        ContentHasher::default(),
    );
    let debouncer = tokio::spawn(debouncer.run(raw_rx, logical_tx));
    let pipeline = tokio::spawn(ws.pipeline().run(logical_rx));

    for event in events {
        raw_tx.send(event).await.unwrap();
    }
    drop(raw_tx);

    debouncer.await.unwrap();
    pipeline.await.unwrap()
}

#[tokio::test]
async fn noisy_upload_is_processed_once() {
    let ws = Workspace::new();
    let temp = ws.inbox.join("scan004.pdf.tmp");
    let final_path = ws.inbox.join("scan004.pdf");
    std::fs::write(&temp, pdf_with_barcode("EAN-1", "d")).unwrap();
    std::fs::rename(&temp, &final_path).unwrap();

    let stats = run_raw(
        &ws,
        vec![
            RawEvent::new(RawEventKind::Created, &temp),
            RawEvent::new(RawEventKind::Modified, &temp),
            RawEvent::new(RawEventKind::Modified, &temp),
            RawEvent::new(RawEventKind::MovedFrom, &temp),
            RawEvent::new(RawEventKind::MovedTo, &final_path),
        ],
    )
    .await;

    assert_eq!(stats.processed, 1);
    assert_eq!(stats.renamed, 1);
    assert!(ws.inbox.join("EAN-1.pdf").exists());
    assert_eq!(
        ws.entries().iter().map(|entry| entry.kind).collect::<Vec<_>>(),
        vec![ChangeKind::MovedFrom, ChangeKind::MovedTo, ChangeKind::Created]
    );
}

#[tokio::test]
async fn scan_overwritten_under_the_same_name_is_extracted_again() {
    let ws = Workspace::new();
    let scan = ws.write("scan.pdf", &pdf_without_barcode("blank page"));
    ws.pipeline()
        .process(LogicalEvent::Created { path: scan.clone() })
        .await
        .unwrap();
    assert!(ws.store.get(&scan).is_some());

    std::fs::remove_file(&scan).unwrap();
    std::fs::write(&scan, pdf_with_barcode("EAN-77", "second scan")).unwrap();
    let stats = run_raw(
        &ws,
        vec![
            RawEvent::new(RawEventKind::Deleted, &scan),
            RawEvent::new(RawEventKind::Created, &scan),
        ],
    )
    .await;

    let renamed = ws.inbox.join("EAN-77.pdf");
    assert_eq!(stats.renamed, 1);
    assert!(!scan.exists());
    assert!(renamed.exists());
    assert!(ws.store.get(&scan).is_none());
    assert!(ws.store.get(&renamed).is_some());
}
