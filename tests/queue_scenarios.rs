//! End-to-end flows through the queue, the scheduler and the orchestrator,
//! with ffprobe and ffmpeg replaced by fakes.


use framecast::{FramecastError, JobStatus, ProcessingQueue, store::memory::MemoryStore};
use std::{
    sync::{Arc, atomic::AtomicBool},
    time::Duration,
};
use test_utils::{
    FakeProbe, FakeTranscoder, MediaFixture, build_app, fast_config, init_logging,
    wait_for_terminal,
};

fn started_queue(store: &MemoryStore) -> ProcessingQueue {
    ProcessingQueue::new(Arc::new(store.clone()), Arc::new(AtomicBool::new(true)))
}

#[tokio::test]
async fn test_job_runs_to_completion() {
    init_logging();
    let fixture = MediaFixture::new();
    let transcoder = Arc::new(FakeTranscoder::new());
    let (app, _store) = build_app(fast_config(), fixture.probe(20.0), transcoder.clone());
    app.start().await.unwrap();

    let data = fixture.job_data("job-1", "u1", 10.0, 5.0);
    let submission = app.queue().add_video_processing_job(data.clone()).await.unwrap();
    assert_eq!(submission.job_id, "job-1");
    assert!(!submission.duplicate);

    assert_eq!(wait_for_terminal(&app, "job-1").await, JobStatus::Completed);

    let status = app.queue().get_job_status("job-1").await.unwrap();
    assert_eq!(status.progress, 100);
    assert!(status.error.is_none());
    assert!(status.completed_at.is_some());
    assert!(status.failed_at.is_none());
    assert_eq!(status.output_path.as_deref(), Some(data.output_path.as_str()));
    assert_eq!(status.processing_data.unwrap().start_time, 10.0);

    let result = app.queue().get_job_result("job-1").await.unwrap();
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.output_path, data.output_path);
    assert!(std::path::Path::new(&result.output_path).exists());
    assert_eq!(transcoder.call_count(), 1);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_window_past_video_end_fails_job() {
    let fixture = MediaFixture::new();
    let transcoder = Arc::new(FakeTranscoder::new());
    let (app, _store) = build_app(fast_config(), fixture.probe(12.0), transcoder.clone());
    app.start().await.unwrap();

    app.queue()
        .add_video_processing_job(fixture.job_data("job-1", "u1", 10.0, 5.0))
        .await
        .unwrap();

    assert_eq!(wait_for_terminal(&app, "job-1").await, JobStatus::Failed);

    let status = app.queue().get_job_status("job-1").await.unwrap();
    let error = status.error.unwrap();
    assert!(
        error.contains("Overlay duration exceeds remaining video time"),
        "{}",
        error
    );
    assert!(status.failed_at.is_some());
    assert!(status.output_path.is_none());

    let result = app.queue().get_job_result("job-1").await.unwrap();
    assert_eq!(result.status, JobStatus::Failed);
    assert!(result.output_path.is_empty());
    assert_eq!(transcoder.call_count(), 0);

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_render_failure_is_reported() {
    let fixture = MediaFixture::new();
    let transcoder = Arc::new(FakeTranscoder::failing("Conversion failed!"));
    let (app, _store) = build_app(fast_config(), fixture.probe(20.0), transcoder);
    app.start().await.unwrap();

    app.queue()
        .add_video_processing_job(fixture.job_data("job-1", "u1", 1.0, 2.0))
        .await
        .unwrap();

    assert_eq!(wait_for_terminal(&app, "job-1").await, JobStatus::Failed);
    let error = app.queue().get_job_status("job-1").await.unwrap().error.unwrap();
    assert!(error.starts_with("Video processing failed"), "{}", error);
    assert!(!fixture.output("job-1.mp4").exists());

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_progress_never_decreases_while_rendering() {
    let fixture = MediaFixture::new();
    let transcoder = Arc::new(FakeTranscoder::new().with_delay(Duration::from_millis(500)));
    let (app, _store) = build_app(fast_config(), fixture.probe(20.0), transcoder);
    app.start().await.unwrap();

    app.queue()
        .add_video_processing_job(fixture.job_data("job-1", "u1", 1.0, 2.0))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut samples = Vec::new();
    let final_status = loop {
        let status = app.queue().get_job_status("job-1").await.unwrap();
        samples.push(status.progress);
        if status.status.is_terminal() {
            break status.status;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never finished");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    assert_eq!(final_status, JobStatus::Completed);
    assert!(
        samples.windows(2).all(|pair| pair[0] <= pair[1]),
        "progress went backwards: {:?}",
        samples
    );
    assert_eq!(samples.last(), Some(&100));
    // The render band was observed, not just the end state
    assert!(
        samples.iter().any(|&p| p > 30 && p < 100),
        "no render progress in {:?}",
        samples
    );

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_pending_job() {
    let fixture = MediaFixture::new();
    let store = MemoryStore::new();
    let queue = started_queue(&store);

    queue
        .add_video_processing_job(fixture.job_data("job-1", "u1", 1.0, 2.0))
        .await
        .unwrap();
    assert_eq!(
        queue.get_job_status("job-1").await.unwrap().status,
        JobStatus::Pending
    );

    assert_eq!(queue.cancel_job("job-1").await.unwrap(), 1);
    assert!(matches!(
        queue.get_job_status("job-1").await,
        Err(FramecastError::JobNotFound { .. })
    ));

    // Nothing left to cancel
    assert_eq!(queue.cancel_job("job-1").await.unwrap(), 0);

    // The key is free again once the record is gone
    let again = queue
        .add_video_processing_job(fixture.job_data("job-1", "u1", 1.0, 2.0))
        .await
        .unwrap();
    assert!(!again.duplicate);
}

#[tokio::test]
async fn test_running_job_cannot_be_cancelled() {
    let fixture = MediaFixture::new();
    let transcoder = Arc::new(FakeTranscoder::new().with_delay(Duration::from_millis(500)));
    let (app, _store) = build_app(fast_config(), fixture.probe(20.0), transcoder);
    app.start().await.unwrap();

    app.queue()
        .add_video_processing_job(fixture.job_data("job-1", "u1", 1.0, 2.0))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while app.queue().get_job_status("job-1").await.unwrap().status != JobStatus::Processing {
        assert!(tokio::time::Instant::now() < deadline, "job never started");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(app.queue().cancel_job("job-1").await.unwrap(), 0);
    assert_eq!(wait_for_terminal(&app, "job-1").await, JobStatus::Completed);
    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_user_jobs_newest_first() {
    let fixture = MediaFixture::new();
    let store = MemoryStore::new();
    let queue = started_queue(&store);

    for n in 1..=5 {
        queue
            .add_video_processing_job(fixture.job_data(&format!("job-{}", n), "u1", 1.0, 2.0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    queue
        .add_video_processing_job(fixture.job_data("other", "u2", 1.0, 2.0))
        .await
        .unwrap();

    let jobs = queue.get_user_jobs("u1", 2).await.unwrap();
    let ids: Vec<_> = jobs.iter().map(|job| job.id.as_str()).collect();
    assert_eq!(ids, vec!["job-5", "job-4"]);
    assert!(jobs.iter().all(|job| job.processing_data.is_none()));

    assert_eq!(queue.get_user_jobs("u1", 10).await.unwrap().len(), 5);
    assert!(queue.get_user_jobs("nobody", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_submission_is_flagged() {
    let fixture = MediaFixture::new();
    let store = MemoryStore::new();
    let queue = started_queue(&store);

    let first = queue
        .add_video_processing_job(fixture.job_data("job-1", "u1", 1.0, 2.0))
        .await
        .unwrap();
    let second = queue
        .add_video_processing_job(fixture.job_data("job-1", "u1", 3.0, 4.0))
        .await
        .unwrap();

    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(first.record_id, second.record_id);
    assert_eq!(store.len().await, 1);

    // The original payload is kept
    let status = queue.get_job_status("job-1").await.unwrap();
    assert_eq!(status.processing_data.unwrap().start_time, 1.0);
}

#[tokio::test]
async fn test_queue_closed_outside_service_lifetime() {
    let fixture = MediaFixture::new();
    let (app, store) = build_app(fast_config(), FakeProbe::new(), Arc::new(FakeTranscoder::new()));

    let err = app
        .queue()
        .add_video_processing_job(fixture.job_data("job-1", "u1", 1.0, 2.0))
        .await
        .unwrap_err();
    assert!(matches!(err, FramecastError::NotInitialized { .. }));
    assert!(matches!(
        app.queue().get_job_status("job-1").await,
        Err(FramecastError::NotInitialized { .. })
    ));
    assert!(matches!(
        app.queue().health_check().await,
        Err(FramecastError::NotInitialized { .. })
    ));
    assert!(store.is_empty().await);

    app.start().await.unwrap();
    assert!(app.queue().health_check().await.unwrap());
    app.shutdown().await.unwrap();

    assert!(matches!(
        app.queue().cancel_job("job-1").await,
        Err(FramecastError::NotInitialized { .. })
    ));
}
