mod common;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{MemoryStorage, test_config};
use octofhir_bulk::{
    CheckpointState, ImportInput, JobContext, JobOutcome, JobRequest, JobRunner,
    PartitionDescriptor, PartitionStatus, StorageType,
};

/// Writes `count` Patient records; line `n` (1-based) has id `p{n}`.
fn write_source(dir: &Path, name: &str, count: usize, eol: &str, edit: impl Fn(usize) -> Option<String>) {
    let mut body = String::new();
    for n in 1..=count {
        let line = edit(n).unwrap_or_else(|| format!(r#"{{"resourceType":"Patient","id":"p{n}"}}"#));
        body.push_str(&line);
        body.push_str(eol);
    }
    let path = dir.join("in").join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}

fn source(name: &str) -> ImportInput {
    ImportInput {
        resource_type: "Patient".into(),
        location: format!("in/{name}"),
    }
}

#[tokio::test]
async fn test_malformed_record_does_not_stop_the_import() {
    let dir = tempfile::tempdir().unwrap();
    write_source(dir.path(), "Patient.ndjson", 100, "\n", |n| (n == 37).then(|| "{not json".into()));
    let storage = Arc::new(MemoryStorage::new());
    let runner = JobRunner::new(test_config(dir.path()), storage.clone());

    let report = runner
        .run(&JobContext::default(), &JobRequest::import(StorageType::File, vec![source("Patient.ndjson")]))
        .await
        .unwrap();

    assert_eq!(report.outcome(), JobOutcome::PartialSuccess);
    assert_eq!(storage.count("Patient"), 99);
    assert!(storage.get("Patient", "p37").is_none());
    assert_eq!(report.record_failures(), 1);
    assert_eq!(report.resources_written(), 99);

    let partition = &report.partitions[0];
    assert_eq!(partition.status, PartitionStatus::Completed);
    assert_eq!(partition.outcomes.entries.len(), 1);
    assert_eq!(partition.outcomes.entries[0].position, 37);
    assert_eq!(report.outputs()[0].url, "in/Patient.ndjson");
    assert_eq!(report.outputs()[0].count, 99);
}

#[tokio::test]
async fn test_rejected_records_are_isolated_from_their_batch() {
    let dir = tempfile::tempdir().unwrap();
    write_source(dir.path(), "Patient.ndjson", 30, "\n", |n| {
        (n == 5).then(|| r#"{"resourceType":"Observation","id":"p5"}"#.into())
    });
    let storage = Arc::new(MemoryStorage::new());
    storage.reject_id("p12");
    let runner = JobRunner::new(test_config(dir.path()), storage.clone());

    let report = runner
        .run(&JobContext::default(), &JobRequest::import(StorageType::File, vec![source("Patient.ndjson")]))
        .await
        .unwrap();

    assert_eq!(report.outcome(), JobOutcome::PartialSuccess);
    assert_eq!(storage.count("Patient"), 28);
    assert_eq!(storage.count("Observation"), 0);
    let positions: Vec<u64> = report.partitions[0]
        .outcomes
        .entries
        .iter()
        .map(|o| o.position)
        .collect();
    assert_eq!(positions, vec![5, 12]);
    assert_eq!(report.partitions[0].outcomes.entries[1].id.as_deref(), Some("p12"));
}

#[tokio::test]
async fn test_large_source_is_split_into_segments() {
    let dir = tempfile::tempdir().unwrap();
    write_source(dir.path(), "Patient.ndjson", 60, "\r\n", |_| None);
    let storage = Arc::new(MemoryStorage::new());
    let mut config = test_config(dir.path());
    config.import.segment_bytes = 256;
    let runner = JobRunner::new(config, storage.clone());

    let report = runner
        .run(&JobContext::default(), &JobRequest::import(StorageType::File, vec![source("Patient.ndjson")]))
        .await
        .unwrap();

    assert_eq!(report.outcome(), JobOutcome::Complete);
    assert!(report.partitions.len() > 1);
    assert_eq!(storage.count("Patient"), 60);
    // Every record was owned by exactly one segment.
    assert_eq!(storage.upserted.load(Ordering::SeqCst), 60);
    assert_eq!(report.resources_written(), 60);
    assert_eq!(report.checkpoint, Some(report.partitions.len() as u32 - 1));
}

#[tokio::test]
async fn test_throttled_persistence_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    write_source(dir.path(), "Patient.ndjson", 100, "\n", |_| None);
    let storage = Arc::new(MemoryStorage::new());
    storage.throttle_upserts.store(2, Ordering::SeqCst);
    let runner = JobRunner::new(test_config(dir.path()), storage.clone());

    let report = runner
        .run(&JobContext::default(), &JobRequest::import(StorageType::File, vec![source("Patient.ndjson")]))
        .await
        .unwrap();

    assert_eq!(report.outcome(), JobOutcome::Complete);
    assert_eq!(storage.count("Patient"), 100);
    assert_eq!(storage.upserted.load(Ordering::SeqCst), 100);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_partition() {
    let dir = tempfile::tempdir().unwrap();
    write_source(dir.path(), "Patient.ndjson", 25, "\n", |_| None);
    let storage = Arc::new(MemoryStorage::new());
    let mut config = test_config(dir.path());
    config.jobs.max_retries = 1;
    let runner = JobRunner::new(config, storage.clone());

    // First batch persists, the second is throttled past the budget.
    let job = JobRequest::import(StorageType::File, vec![source("Patient.ndjson")]);
    let ctx = JobContext::default();
    let listener_storage = storage.clone();
    let listener = move |_: &PartitionDescriptor, state: &CheckpointState| {
        if state.page_number == 1 {
            listener_storage.throttle_upserts.store(5, Ordering::SeqCst);
        }
    };
    let report = runner
        .with_listener(Arc::new(listener))
        .run(&ctx, &job)
        .await
        .unwrap();

    assert_eq!(report.outcome(), JobOutcome::Failed);
    let partition = &report.partitions[0];
    assert_eq!(partition.status, PartitionStatus::Failed);
    assert_eq!(partition.state.page_number, 1);
    assert_eq!(partition.state.resources_written, 10);
    assert!(partition.error.as_ref().unwrap().message.contains("retry budget exhausted"));

    // Resuming re-reads from the failed batch only.
    storage.throttle_upserts.store(0, Ordering::SeqCst);
    let resumed = JobRunner::new(test_config(dir.path()), storage.clone())
        .resume(&JobContext::new(ctx.job_id), &job, &report.resume_states())
        .await
        .unwrap();
    assert_eq!(resumed.outcome(), JobOutcome::Complete);
    assert_eq!(storage.count("Patient"), 25);
    assert_eq!(storage.upserted.load(Ordering::SeqCst), 25);
    assert_eq!(resumed.partitions[0].state.resources_written, 25);
}

#[tokio::test]
async fn test_cancelled_import_resumes_after_last_batch() {
    let dir = tempfile::tempdir().unwrap();
    write_source(dir.path(), "Patient.ndjson", 50, "\n", |_| None);
    let storage = Arc::new(MemoryStorage::new());
    let ctx = JobContext::default();
    let cancel_ctx = ctx.clone();
    let listener = move |_: &PartitionDescriptor, state: &CheckpointState| {
        if state.page_number >= 3 && !state.complete {
            cancel_ctx.cancel();
        }
    };
    let job = JobRequest::import(StorageType::File, vec![source("Patient.ndjson")]);

    let first = JobRunner::new(test_config(dir.path()), storage.clone())
        .with_listener(Arc::new(listener))
        .run(&ctx, &job)
        .await
        .unwrap();
    assert_eq!(first.outcome(), JobOutcome::Cancelled);
    assert_eq!(first.partitions[0].state.page_number, 3);
    assert_eq!(storage.count("Patient"), 30);

    let second = JobRunner::new(test_config(dir.path()), storage.clone())
        .resume(&JobContext::new(ctx.job_id), &job, &first.resume_states())
        .await
        .unwrap();
    assert_eq!(second.outcome(), JobOutcome::Complete);
    assert_eq!(storage.count("Patient"), 50);
    assert_eq!(storage.upserted.load(Ordering::SeqCst), 50);
}

#[tokio::test]
async fn test_missing_sources_are_planning_failures() {
    let dir = tempfile::tempdir().unwrap();
    write_source(dir.path(), "Patient.ndjson", 3, "\n", |_| None);
    let storage = Arc::new(MemoryStorage::new());
    let runner = JobRunner::new(test_config(dir.path()), storage.clone());

    let report = runner
        .run(
            &JobContext::default(),
            &JobRequest::import(
                StorageType::File,
                vec![source("Patient.ndjson"), source("missing.ndjson")],
            ),
        )
        .await
        .unwrap();
    assert_eq!(report.outcome(), JobOutcome::PartialSuccess);
    assert_eq!(report.planning_failures.len(), 1);
    assert_eq!(report.planning_failures[0].source_id, "in/missing.ndjson");
    assert_eq!(storage.count("Patient"), 3);

    let err = runner
        .run(
            &JobContext::default(),
            &JobRequest::import(StorageType::File, vec![source("missing.ndjson")]),
        )
        .await
        .unwrap_err();
    assert!(err.is_job_fatal());
}
