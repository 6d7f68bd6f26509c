//! Conversion job model and lifecycle.
//!
//! A job moves `pending -> processing -> completed | failed`. Terminal jobs
//! never change again; a retry is a new child job pointing at its parent.

use crate::format::Format;
use crate::request::{ConversionOptions, ConversionRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("job {job_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("job {0} has not failed and cannot be retried")]
    NotRetryable(String),
}

/// Lifecycle of one conversion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionJob {
    pub job_id: String,
    /// Set when this job retries an earlier failed one.
    pub parent_job_id: Option<String>,
    pub from_format: Format,
    pub to_format: Format,
    pub options: ConversionOptions,
    pub route: Vec<Format>,
    pub status: JobStatus,
    pub attempt: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl ConversionJob {
    pub fn new(request: &ConversionRequest) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4().to_string(),
            parent_job_id: None,
            from_format: request.from_format,
            to_format: request.to_format,
            options: request.options.clone(),
            route: Vec::new(),
            status: JobStatus::Pending,
            attempt: 1,
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn start_processing(&mut self, route: &[Format]) -> Result<(), JobError> {
        self.transition(JobStatus::Processing)?;
        self.route = route.to_vec();
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<(), JobError> {
        if self.status != JobStatus::Processing {
            return Err(self.invalid(JobStatus::Completed));
        }
        self.transition(JobStatus::Completed)?;
        self.error = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: String) -> Result<(), JobError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(error);
        Ok(())
    }

    /// Creates the job that retries this failed one with new options.
    pub fn spawn_retry(&self, options: ConversionOptions) -> Result<ConversionJob, JobError> {
        if self.status != JobStatus::Failed {
            return Err(JobError::NotRetryable(self.job_id.clone()));
        }
        let now = Utc::now();
        Ok(Self {
            job_id: Uuid::new_v4().to_string(),
            parent_job_id: Some(self.job_id.clone()),
            from_format: self.from_format,
            to_format: self.to_format,
            options,
            route: Vec::new(),
            status: JobStatus::Pending,
            attempt: self.attempt.saturating_add(1),
            created_at: now,
            updated_at: now,
            error: None,
        })
    }

    pub fn processing_duration_ms(&self) -> Option<i64> {
        if self.status.is_terminal() {
            Some(
                self.updated_at
                    .signed_duration_since(self.created_at)
                    .num_milliseconds(),
            )
        } else {
            None
        }
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), JobError> {
        if self.status.is_terminal() || self.status == to {
            return Err(self.invalid(to));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn invalid(&self, to: JobStatus) -> JobError {
        JobError::InvalidTransition {
            job_id: self.job_id.clone(),
            from: self.status,
            to,
        }
    }
}
