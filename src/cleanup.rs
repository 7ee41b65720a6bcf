//! Nightly maintenance: removes expired job records and their output files.

use crate::{
    Result,
    job::{CLEANUP_OLD_FILES, Job},
    scheduler::{JobContext, JobDefinition, JobHandler},
    store::JobStore,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{path::Path, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// What one cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub records_removed: usize,
    pub files_removed: usize,
}

pub struct FileCleanup {
    store: Arc<dyn JobStore>,
    retention: Duration,
    delete_outputs: bool,
}

impl FileCleanup {
    pub fn new(store: Arc<dyn JobStore>, retention: Duration) -> Self {
        Self {
            store,
            retention,
            delete_outputs: true,
        }
    }

    pub fn with_delete_outputs(mut self, delete_outputs: bool) -> Self {
        self.delete_outputs = delete_outputs;
        self
    }

    /// Purges one-off jobs that finished or failed more than the retention
    /// period ago, then deletes the output files they produced.
    pub async fn run(&self) -> Result<CleanupReport> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| crate::FramecastError::Config(format!("Invalid retention: {}", e)))?;
        let cutoff = Utc::now() - retention;

        let purged = self.store.purge_finished(cutoff).await?;
        let mut report = CleanupReport {
            records_removed: purged.len(),
            files_removed: 0,
        };

        if self.delete_outputs {
            for job in &purged {
                if remove_output(job).await {
                    report.files_removed += 1;
                }
            }
        }

        info!(
            records = report.records_removed,
            files = report.files_removed,
            %cutoff,
            "Cleanup pass finished"
        );
        Ok(report)
    }

    pub fn job_definition(self: Arc<Self>) -> JobDefinition {
        let handler: JobHandler = Arc::new(move |_ctx: JobContext| {
            let cleanup = Arc::clone(&self);
            Box::pin(async move {
                let report = cleanup.run().await?;
                Ok(Some(serde_json::to_value(report)?))
            })
        });
        JobDefinition::new(CLEANUP_OLD_FILES, handler)
    }
}

/// Deletes the output a completed job recorded. Failed jobs never produced one.
async fn remove_output(job: &Job) -> bool {
    let Some(output) = job.output_path() else {
        return false;
    };
    let path = Path::new(&output);
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(job_id = %job.id, path = %path.display(), "Removed output file");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(job_id = %job.id, path = %path.display(), error = %e, "Failed to remove output file");
            false
        }
    }
}
