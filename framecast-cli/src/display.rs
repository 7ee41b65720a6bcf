use chrono::{DateTime, Utc};
use comfy_table::Table;
use framecast::{JobStatus, JobStatusReport};
use std::fmt;

pub fn status_label(status: JobStatus) -> String {
    let icon = match status {
        JobStatus::Pending => "🟡",
        JobStatus::Processing => "🔵",
        JobStatus::Completed => "🟢",
        JobStatus::Failed => "🔴",
    };
    format!("{} {}", icon, status)
}

pub fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Shortens `text` to `max` characters, marking the cut with an ellipsis.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", kept)
}

pub struct JobTable {
    table: Table,
    rows: usize,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        let mut table = Table::new();
        table.set_header(vec![
            "Job ID",
            "Status",
            "Progress",
            "Created At",
            "Finished At",
            "Output / Error",
        ]);
        Self { table, rows: 0 }
    }

    pub fn add_report(&mut self, report: &JobStatusReport) {
        let finished = report.completed_at.or(report.failed_at);
        let detail = match (&report.output_path, &report.error) {
            (_, Some(error)) => truncate(error, 60),
            (Some(path), None) => path.clone(),
            (None, None) => String::new(),
        };

        self.table.add_row(vec![
            report.id.clone(),
            status_label(report.status),
            format!("{}%", report.progress),
            format_time(Some(report.created_at)),
            format_time(finished),
            detail,
        ]);
        self.rows += 1;
    }

    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }
}

impl fmt::Display for JobTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table)
    }
}

/// Multi-line detail view of one job.
pub fn job_details(report: &JobStatusReport) -> String {
    let mut table = Table::new();
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["Job ID".to_string(), report.id.clone()]);
    table.add_row(vec!["Status".to_string(), status_label(report.status)]);
    table.add_row(vec!["Progress".to_string(), format!("{}%", report.progress)]);
    table.add_row(vec!["Created At".to_string(), format_time(Some(report.created_at))]);

    if let Some(completed_at) = report.completed_at {
        table.add_row(vec!["Completed At".to_string(), format_time(Some(completed_at))]);
    }
    if let Some(failed_at) = report.failed_at {
        table.add_row(vec!["Failed At".to_string(), format_time(Some(failed_at))]);
    }
    if let Some(error) = &report.error {
        table.add_row(vec!["Error".to_string(), error.clone()]);
    }
    if let Some(output) = &report.output_path {
        table.add_row(vec!["Output".to_string(), output.clone()]);
    }
    if let Some(data) = &report.processing_data {
        table.add_row(vec!["Video".to_string(), data.video_path.clone()]);
        table.add_row(vec!["Frame".to_string(), data.frame_path.clone()]);
        table.add_row(vec![
            "Window".to_string(),
            format!("{}s + {}s", data.start_time, data.duration),
        ]);
    }
    table.to_string()
}
