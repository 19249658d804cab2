mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{MemoryStorage, observation, patient, read_lines, test_config};
use octofhir_bulk::{
    CheckpointState, ErrorKind, ExportRequest, ExportScope, JobContext, JobOutcome, JobRequest,
    JobRunner, PartitionDescriptor, PartitionStatus, StorageType,
};
use serde_json::{Value, json};

fn seeded() -> Arc<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::new());
    storage.seed((0..23).map(|i| patient(&format!("p{i:02}"), if i % 2 == 0 { "female" } else { "male" })));
    storage.seed((0..10).map(|i| {
        let code = if i < 4 { "bp" } else { "hr" };
        observation(&format!("o{i:02}"), &format!("p{:02}", i % 3), "final", code)
    }));
    storage
}

fn ids(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .map(|l| {
            let v: Value = serde_json::from_str(l.trim_end()).unwrap();
            v["id"].as_str().unwrap().to_string()
        })
        .collect()
}

fn export(types: &[&str]) -> ExportRequest {
    ExportRequest {
        resource_types: types.iter().map(|t| t.to_string()).collect(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_system_export_writes_one_ndjson_object_per_type() {
    let dir = tempfile::tempdir().unwrap();
    let storage = seeded();
    let runner = JobRunner::new(test_config(dir.path()), storage.clone());
    let ctx = JobContext::default();

    let report = runner
        .run(&ctx, &JobRequest::export(StorageType::File, export(&["Patient", "Observation"])))
        .await
        .unwrap();

    assert_eq!(report.outcome(), JobOutcome::Complete);
    assert_eq!(report.partitions.len(), 2);
    assert_eq!(report.checkpoint, Some(1));
    assert_eq!(report.resources_written(), 33);

    let outputs = report.outputs();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].resource_type, "Patient");
    assert_eq!(outputs[0].count, 23);
    assert_eq!(outputs[0].url, format!("exports/{}/Patient_0.ndjson", ctx.job_id));
    assert_eq!(outputs[1].resource_type, "Observation");
    assert_eq!(outputs[1].count, 10);

    let lines = read_lines(&dir.path().join(&outputs[0].url));
    assert_eq!(lines.len(), 23);
    assert!(lines.iter().all(|l| l.ends_with("\r\n")));
    let expected: Vec<String> = (0..23).map(|i| format!("p{i:02}")).collect();
    assert_eq!(ids(&lines), expected);

    // Staging directories are gone once the uploads completed.
    let job_dir = dir.path().join("exports").join(ctx.job_id.to_string());
    let leftovers: Vec<_> = std::fs::read_dir(job_dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().contains(".upload-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_type_filters_do_not_duplicate_records() {
    let dir = tempfile::tempdir().unwrap();
    let runner = JobRunner::new(test_config(dir.path()), seeded());
    let request = ExportRequest {
        type_filters: vec![
            "Observation?status=final".into(),
            "Observation?code=bp".into(),
        ],
        ..Default::default()
    };

    let report = runner
        .run(&JobContext::default(), &JobRequest::export(StorageType::File, request))
        .await
        .unwrap();

    assert_eq!(report.outcome(), JobOutcome::Complete);
    assert_eq!(report.partitions.len(), 1);
    let outputs = report.outputs();
    assert_eq!(outputs[0].count, 10);
    let lines = read_lines(&dir.path().join(&outputs[0].url));
    let unique: BTreeSet<String> = ids(&lines).into_iter().collect();
    assert_eq!(lines.len(), 10);
    assert_eq!(unique.len(), 10);
    assert_eq!(report.partitions[0].state.current_type_filter_index, 1);
}

#[tokio::test]
async fn test_filter_for_unexported_type_is_a_planning_failure() {
    let dir = tempfile::tempdir().unwrap();
    let runner = JobRunner::new(test_config(dir.path()), seeded());
    let request = ExportRequest {
        resource_types: vec!["Patient".into()],
        type_filters: vec!["Observation?status=final".into()],
        ..Default::default()
    };

    let report = runner
        .run(&JobContext::default(), &JobRequest::export(StorageType::File, request))
        .await
        .unwrap();

    assert_eq!(report.planning_failures.len(), 1);
    assert_eq!(report.partitions.len(), 1);
    assert_eq!(report.outcome(), JobOutcome::PartialSuccess);
}

#[tokio::test]
async fn test_group_export_is_limited_to_active_members() {
    let dir = tempfile::tempdir().unwrap();
    let storage = seeded();
    storage.seed([json!({
        "resourceType": "Group",
        "id": "cohort",
        "member": [
            {"entity": {"reference": "Patient/p00"}},
            {"entity": {"reference": "Patient/p01"}},
            {"entity": {"reference": "Patient/p01"}},
            {"entity": {"reference": "Patient/p02"}, "inactive": true}
        ]
    })]);
    let runner = JobRunner::new(test_config(dir.path()), storage);
    let request = ExportRequest {
        scope: ExportScope::Group("cohort".into()),
        resource_types: vec!["Patient".into(), "Observation".into()],
        ..Default::default()
    };

    let report = runner
        .run(&JobContext::default(), &JobRequest::export(StorageType::File, request))
        .await
        .unwrap();

    assert_eq!(report.outcome(), JobOutcome::Complete);
    let outputs = report.outputs();
    let patients = read_lines(&dir.path().join(&outputs[0].url));
    assert_eq!(ids(&patients), vec!["p00", "p01"]);
    // o00, o03, o06, o09 belong to p00; o01, o04, o07 to p01.
    let observations = read_lines(&dir.path().join(&outputs[1].url));
    assert_eq!(
        ids(&observations),
        vec!["o00", "o01", "o03", "o04", "o06", "o07", "o09"]
    );
}

#[tokio::test]
async fn test_missing_group_leaves_nothing_to_do() {
    let dir = tempfile::tempdir().unwrap();
    let runner = JobRunner::new(test_config(dir.path()), seeded());
    let request = ExportRequest {
        scope: ExportScope::Group("nope".into()),
        resource_types: vec!["Patient".into()],
        ..Default::default()
    };

    let err = runner
        .run(&JobContext::default(), &JobRequest::export(StorageType::File, request))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Job);
}

#[tokio::test]
async fn test_cancelled_export_resumes_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let storage = seeded();
    let ctx = JobContext::default();
    let cancel_ctx = ctx.clone();
    let listener = move |_: &PartitionDescriptor, state: &CheckpointState| {
        if state.page_number >= 2 && !state.complete {
            cancel_ctx.cancel();
        }
    };
    let request = JobRequest::export(StorageType::File, export(&["Patient"]));

    let first = JobRunner::new(test_config(dir.path()), storage.clone())
        .with_listener(Arc::new(listener))
        .run(&ctx, &request)
        .await
        .unwrap();

    assert_eq!(first.outcome(), JobOutcome::Cancelled);
    let partition = &first.partitions[0];
    assert_eq!(partition.status, PartitionStatus::Cancelled);
    assert_eq!(partition.state.page_number, 2);
    assert_eq!(partition.state.resources_written, 10);
    assert!(partition.state.upload_id.is_some());
    assert_eq!(first.checkpoint, None);

    // Same job id, fresh cancellation token.
    let resumed_ctx = JobContext::new(ctx.job_id);
    let second = JobRunner::new(test_config(dir.path()), storage)
        .resume(&resumed_ctx, &request, &first.resume_states())
        .await
        .unwrap();

    assert_eq!(second.outcome(), JobOutcome::Complete);
    assert_eq!(second.checkpoint, Some(0));
    let outputs = second.outputs();
    assert_eq!(outputs[0].count, 23);
    let lines = read_lines(&dir.path().join(&outputs[0].url));
    let expected: Vec<String> = (0..23).map(|i| format!("p{i:02}")).collect();
    assert_eq!(ids(&lines), expected);

    // A completed partition is skipped on a further resume.
    let third = JobRunner::new(test_config(dir.path()), seeded())
        .resume(&resumed_ctx, &request, &second.resume_states())
        .await
        .unwrap();
    assert_eq!(third.outcome(), JobOutcome::Complete);
    assert_eq!(third.outputs()[0].count, 23);
    assert_eq!(read_lines(&dir.path().join(&outputs[0].url)).len(), 23);
}

#[tokio::test]
async fn test_failing_type_does_not_stop_other_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let storage = seeded();
    storage.fail_searches_for("Observation");
    let runner = JobRunner::new(test_config(dir.path()), storage);

    let report = runner
        .run(
            &JobContext::default(),
            &JobRequest::export(StorageType::File, export(&["Patient", "Observation"])),
        )
        .await
        .unwrap();

    assert_eq!(report.outcome(), JobOutcome::PartialSuccess);
    assert_eq!(report.partitions[0].status, PartitionStatus::Completed);
    let failed = &report.partitions[1];
    assert_eq!(failed.status, PartitionStatus::Failed);
    assert_eq!(failed.error.as_ref().unwrap().kind, ErrorKind::Partition);
    assert_eq!(failed.state, CheckpointState::new());
    // Ordinal 0 completed, ordinal 1 never will.
    assert_eq!(report.checkpoint, Some(0));
}

#[tokio::test]
async fn test_transient_search_failures_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let storage = seeded();
    storage
        .timeout_searches
        .store(2, std::sync::atomic::Ordering::SeqCst);
    let runner = JobRunner::new(test_config(dir.path()), storage);

    let report = runner
        .run(
            &JobContext::default(),
            &JobRequest::export(StorageType::File, export(&["Patient"])).with_max_concurrent_partitions(1),
        )
        .await
        .unwrap();

    assert_eq!(report.outcome(), JobOutcome::Complete);
    assert_eq!(report.outputs()[0].count, 23);
}

#[tokio::test]
async fn test_export_to_https_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let runner = JobRunner::new(test_config(dir.path()), seeded());
    let err = runner
        .run(&JobContext::default(), &JobRequest::export(StorageType::Https, export(&["Patient"])))
        .await
        .unwrap_err();
    assert!(err.is_job_fatal());
}

#[tokio::test]
async fn test_resume_across_type_filters_does_not_duplicate_records() {
    let dir = tempfile::tempdir().unwrap();
    let storage = seeded();
    let ctx = JobContext::default();
    let cancel_ctx = ctx.clone();
    let listener = move |_: &PartitionDescriptor, state: &CheckpointState| {
        if state.page_number >= 2 && !state.complete {
            cancel_ctx.cancel();
        }
    };
    let request = JobRequest::export(
        StorageType::File,
        ExportRequest {
            type_filters: vec![
                "Observation?status=final".into(),
                "Observation?code=bp".into(),
            ],
            ..Default::default()
        },
    );

    let first = JobRunner::new(test_config(dir.path()), storage.clone())
        .with_listener(Arc::new(listener))
        .run(&ctx, &request)
        .await
        .unwrap();
    assert_eq!(first.outcome(), JobOutcome::Cancelled);
    assert_eq!(first.partitions[0].state.current_type_filter_index, 0);
    assert_eq!(first.partitions[0].state.resources_written, 10);

    let second = JobRunner::new(test_config(dir.path()), storage)
        .resume(&JobContext::new(ctx.job_id), &request, &first.resume_states())
        .await
        .unwrap();
    assert_eq!(second.outcome(), JobOutcome::Complete);
    let outputs = second.outputs();
    assert_eq!(outputs[0].count, 10);
    let lines = read_lines(&dir.path().join(&outputs[0].url));
    let unique: BTreeSet<String> = ids(&lines).into_iter().collect();
    assert_eq!(lines.len(), 10);
    assert_eq!(unique.len(), 10);
}

#[tokio::test]
async fn test_pages_larger_than_a_part_are_split() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.export.max_records_per_part = 2;
    let snapshots = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = snapshots.clone();
    let listener = move |_: &PartitionDescriptor, state: &CheckpointState| {
        seen.lock().unwrap().push((
            state.page_number,
            state.completed_parts.len(),
            state.resources_written,
        ));
    };

    let report = JobRunner::new(config, seeded())
        .with_listener(Arc::new(listener))
        .run(&JobContext::default(), &JobRequest::export(StorageType::File, export(&["Patient"])))
        .await
        .unwrap();

    assert_eq!(report.outcome(), JobOutcome::Complete);
    // Pages of five close a resumable point only when no record is left over.
    assert_eq!(
        *snapshots.lock().unwrap(),
        vec![(2, 5, 10), (4, 10, 20), (5, 0, 23)]
    );
    let outputs = report.outputs();
    assert_eq!(outputs[0].count, 23);
    assert_eq!(read_lines(&dir.path().join(&outputs[0].url)).len(), 23);
}
