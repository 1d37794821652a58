mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use greylit::pipeline::RunOutcome;
use greylit::progress::PipelineProgressEvent;
use greylit_core::models::SimilarityType;
use greylit_core::session::{ProcessingSession, ProcessingStage, ProcessingStatus};
use greylit_core::store::ResultStore;

use common::{
    distinct_results, fast_config, pipeline, raw, seed, CollectingProgress, FlakyStore,
};

fn started(outcome: RunOutcome) -> greylit::pipeline::RunReport {
    match outcome {
        RunOutcome::Started(report) => report,
        other => panic!("expected a started run, got {:?}", other),
    }
}

/// Two results for the same report (one with tracking parameters), two
/// unrelated results, and one without a title.
fn five_results() -> Vec<greylit_core::models::RawResult> {
    vec![
        raw(
            "s1",
            "r1",
            0,
            "Telehealth adoption in rural clinics",
            "https://www.health.gov/reports/telehealth?utm_source=newsletter",
        ),
        raw(
            "s1",
            "r2",
            1,
            "Telehealth adoption in rural clinics (PDF)",
            "https://health.gov/reports/telehealth",
        ),
        raw(
            "s1",
            "r3",
            2,
            "Nurse staffing ratios in urban hospitals",
            "https://nursing.example.org/staffing",
        ),
        raw(
            "s1",
            "r4",
            3,
            "Coastal flood defence funding",
            "https://climate.example.net/funding",
        ),
        raw("s1", "r5", 4, "   ", "https://blank.example.com/item"),
    ]
}

#[tokio::test]
async fn end_to_end_five_results() {
    let store = Arc::new(FlakyStore::new());
    seed(store.as_ref(), "s1", &five_results()).await;
    let progress = Arc::new(CollectingProgress::default());
    let pipeline = pipeline(store.clone(), &fast_config(2, 0), progress);

    let report = started(pipeline.process_session_results("s1").await);
    assert_eq!(report.status, ProcessingStatus::Completed);
    assert_eq!(report.total, 5);
    assert_eq!(report.processed, 4);
    assert_eq!(report.errors, 1);
    assert_eq!(report.duplicate_groups, 1);
    assert_eq!(report.duplicates, 1);
    assert!(report.failure.is_none());

    let groups = store.duplicate_groups("s1").await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].result_count, 2);
    assert_eq!(groups[0].similarity_type, SimilarityType::ExactUrl);
    assert_eq!(groups[0].sources, vec!["health.gov".to_string()]);

    let members = store.group_members(&groups[0].id).await.unwrap();
    let raw_ids: Vec<_> = members
        .iter()
        .map(|m| m.raw_result_id.clone().unwrap())
        .collect();
    assert_eq!(raw_ids, vec!["r1", "r2"]);
    assert_eq!(groups[0].canonical_result_id, members[0].id);

    let session = store.processing_session("s1").await.unwrap().unwrap();
    assert_eq!(session.status, ProcessingStatus::Completed);
    assert_eq!(session.processed_count + session.error_count, 5);
    assert_eq!(session.duplicate_count, 1);
    assert_eq!(session.current_stage, ProcessingStage::Finalization);
    assert_eq!(session.stage_progress, 100);
    assert_eq!(session.error_details.len(), 1);
    assert_eq!(
        session.error_details[0].message,
        "failed to process raw result r5"
    );

    let failed = store
        .raw_results_by_ids(&["r5".to_string()])
        .await
        .unwrap();
    assert!(!failed[0].is_processed);
    assert!(failed[0].processing_error.is_some());

    let stats = report.statistics.unwrap();
    assert_eq!(stats.total_results, 5);
    assert_eq!(stats.processed_results, 4);
    assert_eq!(stats.unique_results, 3);
}

#[tokio::test]
async fn completed_session_is_not_reprocessed() {
    let store = Arc::new(FlakyStore::new());
    seed(store.as_ref(), "s1", &distinct_results("s1", 3)).await;
    let pipeline = pipeline(
        store.clone(),
        &fast_config(10, 0),
        Arc::new(CollectingProgress::default()),
    );

    started(pipeline.process_session_results("s1").await);
    let before = store.processing_session("s1").await.unwrap().unwrap();

    assert_eq!(
        pipeline.process_session_results("s1").await,
        RunOutcome::AlreadyCompleted
    );
    let after = store.processing_session("s1").await.unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(store.processed_results("s1").await.unwrap().len(), 3);
}

#[tokio::test]
async fn empty_session_completes_without_a_run() {
    let store = Arc::new(FlakyStore::new());
    seed(store.as_ref(), "s1", &[]).await;
    let pipeline = pipeline(
        store.clone(),
        &fast_config(10, 0),
        Arc::new(CollectingProgress::default()),
    );

    assert_eq!(
        pipeline.process_session_results("s1").await,
        RunOutcome::NoResults
    );
    let session = store.processing_session("s1").await.unwrap().unwrap();
    assert_eq!(session.status, ProcessingStatus::Completed);
    assert!(store.duplicate_groups("s1").await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_or_running_session_is_rejected() {
    let store = Arc::new(FlakyStore::new());
    let pipeline = pipeline(
        store.clone(),
        &fast_config(10, 0),
        Arc::new(CollectingProgress::default()),
    );

    match pipeline.process_session_results("missing").await {
        RunOutcome::Error(message) => assert!(message.contains("unknown search session")),
        other => panic!("unexpected outcome {:?}", other),
    }

    seed(store.as_ref(), "s1", &distinct_results("s1", 2)).await;
    let mut running = ProcessingSession::new("s1");
    running.start_processing(2, None).unwrap();
    store.save_processing_session(&running).await.unwrap();

    match pipeline.process_session_results("s1").await {
        RunOutcome::Error(message) => assert!(message.contains("in progress")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(store.processed_results("s1").await.unwrap().is_empty());
}

#[tokio::test]
async fn one_persist_failure_does_not_stop_the_run() {
    let store = Arc::new(FlakyStore::new());
    seed(store.as_ref(), "s1", &distinct_results("s1", 10)).await;
    store.fail_insert("r6");
    let pipeline = pipeline(
        store.clone(),
        &fast_config(3, 0),
        Arc::new(CollectingProgress::default()),
    );

    let report = started(pipeline.process_session_results("s1").await);
    assert_eq!(report.status, ProcessingStatus::Completed);
    assert_eq!(report.processed, 9);
    assert_eq!(report.errors, 1);
    assert!(report.statistics.is_some());

    let session = store.processing_session("s1").await.unwrap().unwrap();
    assert_eq!(session.processed_count + session.error_count, session.total_raw_results);
    assert_eq!(session.current_stage, ProcessingStage::Finalization);
    let detail = &session.error_details[0];
    assert_eq!(detail.message, "failed to process raw result r6");
    assert!(detail.details.as_deref().unwrap().contains("disk I/O error"));

    assert_eq!(store.processed_results("s1").await.unwrap().len(), 9);
    assert_eq!(
        store.unprocessed_raw_result_ids("s1").await.unwrap(),
        vec!["r6"]
    );
}

#[tokio::test]
async fn transient_batch_failures_are_retried() {
    let store = Arc::new(FlakyStore::new());
    seed(store.as_ref(), "s1", &distinct_results("s1", 6)).await;
    store.fail_next_applies(2);
    let pipeline = pipeline(
        store.clone(),
        &fast_config(3, 3),
        Arc::new(CollectingProgress::default()),
    );

    let report = started(pipeline.process_session_results("s1").await);
    assert_eq!(report.status, ProcessingStatus::Completed);
    assert_eq!(report.processed, 6);
    assert_eq!(report.errors, 0);
    assert_eq!(store.apply_failures.load(Ordering::SeqCst), 0);
    assert_eq!(store.processed_results("s1").await.unwrap().len(), 6);
}

#[tokio::test]
async fn exhausted_retries_fail_the_session_and_retry_recovers() {
    let store = Arc::new(FlakyStore::new());
    seed(store.as_ref(), "s1", &distinct_results("s1", 4)).await;
    store.fail_next_applies(1_000);
    let progress = Arc::new(CollectingProgress::default());
    let pipeline = pipeline(store.clone(), &fast_config(4, 1), progress.clone());

    let report = started(pipeline.process_session_results("s1").await);
    assert_eq!(report.status, ProcessingStatus::Failed);
    let failure = report.failure.unwrap();
    assert!(failure.contains("failed after 2 attempts"), "{}", failure);
    assert!(failure.contains("database is locked"), "{}", failure);
    assert!(store.duplicate_groups("s1").await.unwrap().is_empty());

    let session = store.processing_session("s1").await.unwrap().unwrap();
    assert_eq!(session.status, ProcessingStatus::Failed);
    assert!(session.completed_at.is_some());
    assert!(matches!(
        progress.events().last(),
        Some(PipelineProgressEvent::Finished {
            status: ProcessingStatus::Failed,
            statistics: None,
            ..
        })
    ));

    store.fail_next_applies(0);
    let report = started(pipeline.retry_failed_processing("s1").await);
    assert_eq!(report.status, ProcessingStatus::Completed);
    assert_eq!(report.processed, 4);
    assert_eq!(report.errors, 0);

    let session = store.processing_session("s1").await.unwrap().unwrap();
    assert_eq!(session.retry_count, 1);
    assert!(session.error_details.is_empty());
    assert_eq!(store.processed_results("s1").await.unwrap().len(), 4);
}

#[tokio::test]
async fn retry_resets_counters_errors_and_flags() {
    let store = Arc::new(FlakyStore::new());
    seed(store.as_ref(), "s1", &distinct_results("s1", 3)).await;
    store.fail_group_write.store(true, Ordering::SeqCst);
    let pipeline = pipeline(
        store.clone(),
        &fast_config(10, 0),
        Arc::new(CollectingProgress::default()),
    );

    let report = started(pipeline.process_session_results("s1").await);
    assert_eq!(report.status, ProcessingStatus::Failed);
    assert!(report.failure.unwrap().starts_with("deduplication failed"));
    assert!(store.duplicate_groups("s1").await.unwrap().is_empty());
    assert!(store.unprocessed_raw_result_ids("s1").await.unwrap().is_empty());

    store.fail_group_write.store(false, Ordering::SeqCst);
    let outcome = pipeline.retry_failed_processing("s1").await;
    let report = started(outcome);
    assert_eq!(report.status, ProcessingStatus::Completed);
    assert_eq!(report.processed, 3);
    assert_eq!(report.errors, 0);

    let session = store.processing_session("s1").await.unwrap().unwrap();
    assert_eq!(session.retry_count, 1);
    assert!(session.error_details.is_empty());
    assert_eq!(session.processed_count, 3);

    // A session that is not failed cannot be retried.
    match pipeline.retry_failed_processing("s1").await {
        RunOutcome::Error(message) => assert!(message.contains("cannot retry"), "{}", message),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn failed_session_needs_a_retry_to_run_again() {
    let store = Arc::new(FlakyStore::new());
    seed(store.as_ref(), "s1", &distinct_results("s1", 3)).await;
    store.fail_group_write.store(true, Ordering::SeqCst);
    let pipeline = pipeline(
        store.clone(),
        &fast_config(10, 0),
        Arc::new(CollectingProgress::default()),
    );

    let report = started(pipeline.process_session_results("s1").await);
    assert_eq!(report.status, ProcessingStatus::Failed);
    store.fail_group_write.store(false, Ordering::SeqCst);
    let failed = store.processing_session("s1").await.unwrap().unwrap();

    match pipeline.process_session_results("s1").await {
        RunOutcome::Error(message) => assert!(message.contains("retry"), "{}", message),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(store.processing_session("s1").await.unwrap().unwrap(), failed);

    let report = started(pipeline.retry_failed_processing("s1").await);
    assert_eq!(report.status, ProcessingStatus::Completed);
    let session = store.processing_session("s1").await.unwrap().unwrap();
    assert_eq!(session.total_raw_results, 3);
    assert_eq!(session.processed_count, 3);
    assert_eq!(session.error_count, 0);
    assert!(session.error_details.is_empty());
    assert_eq!(session.progress_percentage(), 100.0);
    assert_eq!(store.processed_results("s1").await.unwrap().len(), 3);
}

#[tokio::test]
async fn merge_promotes_the_most_complete_member() {
    let store = Arc::new(FlakyStore::new());
    let mut rich = raw(
        "s1",
        "r2",
        1,
        "Rural broadband access report",
        "https://gov.example.org/broadband?utm_source=news",
    );
    rich.snippet = "The 2021 national survey of rural broadband access covers coverage gaps, \
                    pricing, adoption barriers and local authority programmes in detail."
        .to_string();
    let sparse = raw(
        "s1",
        "r1",
        0,
        "Rural broadband access report",
        "https://gov.example.org/broadband",
    );
    seed(store.as_ref(), "s1", &[sparse, rich]).await;
    let pipeline = pipeline(
        store.clone(),
        &fast_config(10, 0),
        Arc::new(CollectingProgress::default()),
    );
    started(pipeline.process_session_results("s1").await);

    let group = store.duplicate_groups("s1").await.unwrap().remove(0);
    let members = store.group_members(&group.id).await.unwrap();
    let sparse_id = members
        .iter()
        .find(|m| m.raw_result_id.as_deref() == Some("r1"))
        .unwrap()
        .id
        .clone();
    let rich_id = members
        .iter()
        .find(|m| m.raw_result_id.as_deref() == Some("r2"))
        .unwrap()
        .id
        .clone();
    assert_eq!(group.canonical_result_id, sparse_id);

    let merged = pipeline.merge_duplicate_group(&group.id).await.unwrap();
    assert_eq!(merged.canonical_result_id, rich_id);
    assert_eq!(merged.result_count, 2);
    assert_eq!(merged.sources, vec!["gov.example.org".to_string()]);

    let stored = store.duplicate_group(&group.id).await.unwrap().unwrap();
    assert_eq!(stored, merged);

    assert!(pipeline.merge_duplicate_group("no-such-group").await.is_err());
}

#[tokio::test]
async fn progress_events_follow_the_stages() {
    let store = Arc::new(FlakyStore::new());
    seed(store.as_ref(), "s1", &distinct_results("s1", 5)).await;
    let progress = Arc::new(CollectingProgress::default());
    let pipeline = pipeline(store.clone(), &fast_config(2, 0), progress.clone());

    started(pipeline.process_session_results("s1").await);
    let events = progress.events();

    let stages: Vec<ProcessingStage> = events
        .iter()
        .filter_map(|e| match e {
            PipelineProgressEvent::Stage { stage, .. } => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        vec![
            ProcessingStage::UrlNormalization,
            ProcessingStage::Deduplication,
            ProcessingStage::QualityScoring,
        ]
    );

    let batches: Vec<(usize, usize, u64)> = events
        .iter()
        .filter_map(|e| match e {
            PipelineProgressEvent::Batch {
                completed_batches,
                total_batches,
                processed,
                ..
            } => Some((*completed_batches, *total_batches, *processed)),
            _ => None,
        })
        .collect();
    assert_eq!(batches.len(), 3);
    assert_eq!(
        batches.iter().map(|b| b.0).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(batches.iter().all(|b| b.1 == 3));
    assert_eq!(batches.last().unwrap().2, 5);

    match events.last() {
        Some(PipelineProgressEvent::Finished {
            status, statistics, ..
        }) => {
            assert_eq!(*status, ProcessingStatus::Completed);
            assert_eq!(statistics.as_ref().unwrap().processed_results, 5);
        }
        other => panic!("unexpected last event {:?}", other),
    }
}
