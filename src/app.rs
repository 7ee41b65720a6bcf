//! Service composition root.
//!
//! [`Framecast`] wires a store, the media tools, the orchestrator, the cleanup
//! task and the scheduler together and exposes the [`ProcessingQueue`].

use crate::{
    FramecastError, Result,
    cleanup::FileCleanup,
    config::FramecastConfig,
    cron::CronSchedule,
    job::CLEANUP_OLD_FILES,
    media::{FfmpegTranscoder, FfprobeProbe, MediaProbe, MediaTranscoder},
    orchestrator::ProcessingOrchestrator,
    queue::ProcessingQueue,
    scheduler::JobScheduler,
    store::JobStore,
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::info;

/// Concurrency of the "process video" handler.
pub const PROCESS_VIDEO_CONCURRENCY: u32 = 1;

pub struct Framecast {
    config: FramecastConfig,
    store: Arc<dyn JobStore>,
    scheduler: Arc<JobScheduler>,
    queue: ProcessingQueue,
    ready: Arc<AtomicBool>,
}

impl Framecast {
    /// Assembles the service around an existing store and media tools.
    /// Nothing runs until [`start`](Self::start).
    pub fn new(
        config: FramecastConfig,
        store: Arc<dyn JobStore>,
        probe: Arc<dyn MediaProbe>,
        transcoder: Arc<dyn MediaTranscoder>,
    ) -> Result<Self> {
        config.validate()?;
        let orchestrator = Arc::new(ProcessingOrchestrator::new(probe, transcoder));
        let mut scheduler = JobScheduler::new(Arc::clone(&store), config.scheduler.clone())
            .define(orchestrator.job_definition(PROCESS_VIDEO_CONCURRENCY));

        if config.cleanup.enabled {
            let schedule =
                CronSchedule::with_timezone(&config.cleanup.schedule, &config.cleanup.timezone)?;
            let cleanup = Arc::new(
                FileCleanup::new(Arc::clone(&store), config.cleanup.retention)
                    .with_delete_outputs(config.cleanup.delete_outputs),
            );
            scheduler = scheduler
                .define(cleanup.job_definition())
                .every(CLEANUP_OLD_FILES, schedule);
        }

        let ready = Arc::new(AtomicBool::new(false));
        let queue = ProcessingQueue::new(Arc::clone(&store), Arc::clone(&ready));

        Ok(Self {
            config,
            store,
            scheduler: Arc::new(scheduler),
            queue,
            ready,
        })
    }

    /// Connects to PostgreSQL and uses the ffmpeg tools named in `config`.
    #[cfg(feature = "postgres")]
    pub async fn connect(config: FramecastConfig) -> Result<Self> {
        let store = crate::store::postgres::PostgresStore::connect(
            &config.database.url,
            config.database.pool_size,
            std::time::Duration::from_secs(config.database.connection_timeout_secs),
        )
        .await?;

        let probe =
            FfprobeProbe::new(&config.media.ffprobe_path).with_timeout(config.media.probe_timeout);
        let transcoder = FfmpegTranscoder::new(&config.media.ffmpeg_path).with_encoding(
            config.media.video_codec.clone(),
            config.media.preset.clone(),
            config.media.crf,
        );

        Self::new(config, Arc::new(store), Arc::new(probe), Arc::new(transcoder))
    }

    /// Checks the media tools are installed.
    pub fn check_media_tools(config: &FramecastConfig) -> Result<()> {
        FfprobeProbe::new(&config.media.ffprobe_path).check_available()?;
        FfmpegTranscoder::new(&config.media.ffmpeg_path).check_available()?;
        Ok(())
    }

    /// Verifies the store, creates tables if configured, and starts the
    /// scheduler. The store work is bounded by the start timeout.
    pub async fn start(&self) -> Result<()> {
        let timeout = self.config.scheduler.start_timeout;
        let prepare = async {
            if !self.store.health_check().await {
                return Err(FramecastError::StoreUnavailable {
                    message: "Job store did not answer the health check".to_string(),
                });
            }
            if self.config.database.create_tables {
                self.store.create_tables().await?;
            }
            Ok(())
        };

        tokio::time::timeout(timeout, prepare)
            .await
            .map_err(|_| FramecastError::Timeout {
                message: format!("Job store not ready within {:?}", timeout),
            })??;

        self.scheduler.start().await?;
        self.ready.store(true, Ordering::SeqCst);
        info!(worker = %self.scheduler.worker_id(), "Framecast started");
        Ok(())
    }

    pub fn queue(&self) -> &ProcessingQueue {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn config(&self) -> &FramecastConfig {
        &self.config
    }

    pub fn is_started(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Closes the queue to new requests and stops the scheduler, waiting for
    /// in-flight jobs up to the shutdown timeout.
    pub async fn shutdown(&self) -> Result<()> {
        self.ready.store(false, Ordering::SeqCst);
        self.scheduler.shutdown().await?;
        info!("Framecast stopped");
        Ok(())
    }
}
