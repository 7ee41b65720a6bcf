//! Job priority levels used to order claiming when several jobs are eligible.
//!
//! Priorities are stored as signed integers so that the claim query can sort on
//! them directly.
//!
//! ## Priority Levels
//!
//! - **High (10)**: user-submitted video processing jobs
//! - **Normal (0)**: the default
//! - **Low (-10)**: recurring housekeeping such as file cleanup

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Job priority levels that determine claim order.
///
/// # Examples
///
/// ```rust
/// use framecast::JobPriority;
///
/// assert_eq!(JobPriority::High.as_i32(), 10);
/// assert!(JobPriority::High > JobPriority::Normal);
/// assert!(JobPriority::Normal > JobPriority::Low);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Background housekeeping.
    Low = -10,

    /// Default priority level.
    #[default]
    Normal = 0,

    /// User-facing work; video processing jobs are enqueued at this level.
    High = 10,
}

impl JobPriority {
    /// Gets the numeric value of the priority for database storage.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Creates a JobPriority from a stored value.
    ///
    /// Values between the named levels are rounded down to the nearest level,
    /// values outside the scale are rejected.
    ///
    /// ```rust
    /// use framecast::JobPriority;
    ///
    /// assert_eq!(JobPriority::from_i32(10).unwrap(), JobPriority::High);
    /// assert_eq!(JobPriority::from_i32(5).unwrap(), JobPriority::Normal);
    /// assert!(JobPriority::from_i32(100).is_err());
    /// ```
    pub fn from_i32(value: i32) -> Result<Self, PriorityError> {
        match value {
            10 => Ok(JobPriority::High),
            0..=9 => Ok(JobPriority::Normal),
            -10..=-1 => Ok(JobPriority::Low),
            _ => Err(PriorityError::InvalidPriorityValue(value)),
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPriority::Low => write!(f, "low"),
            JobPriority::Normal => write!(f, "normal"),
            JobPriority::High => write!(f, "high"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PriorityError {
    #[error("Invalid priority value: {0}")]
    InvalidPriorityValue(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_priority_ordering() {
        let mut priorities = vec![JobPriority::High, JobPriority::Low, JobPriority::Normal];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![JobPriority::Low, JobPriority::Normal, JobPriority::High]
        );
    }

    #[test]
    fn test_job_priority_conversion() {
        for priority in [JobPriority::Low, JobPriority::Normal, JobPriority::High] {
            assert_eq!(JobPriority::from_i32(priority.as_i32()).unwrap(), priority);
        }
        assert_eq!(JobPriority::from_i32(-5).unwrap(), JobPriority::Low);
        assert_eq!(
            JobPriority::from_i32(-11),
            Err(PriorityError::InvalidPriorityValue(-11))
        );
        assert!(JobPriority::from_i32(20).is_err());
    }

    #[test]
    fn test_priority_serde_lowercase() {
        let json = serde_json::to_string(&JobPriority::High).unwrap();
        assert_eq!(json, "\"high\"");
        assert_eq!(JobPriority::Low.to_string(), "low");
    }
}
