use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::llm::LLMError;
use crate::mailbox::{ConnectError, MailboxError};
use crate::stores::StoreError;

/// Failures that abort a whole operation. Per-message problems are counted in
/// [`RunSummary`] instead.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The classifier rejected the credentials or the request shape.
    #[error("classifier unavailable: {0}")]
    Classifier(#[from] LLMError),
    #[error("worker task failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Cancelled,
    Error,
}

/// End-of-run accounting shared by the organizers, purge, and reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub operation: &'static str,
    pub outcome: Outcome,
    /// Messages selected for the run.
    pub total: usize,
    /// Messages fully handled (labelled, trashed, or stripped).
    pub processed: usize,
    /// Messages filed under the fallback category.
    pub unsure: usize,
    /// Messages that could not be fetched or parsed.
    pub skipped: usize,
    /// Label failures and classifier answers outside the category set.
    pub errors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    pub fn new(operation: &'static str, total: usize) -> Self {
        Self {
            operation,
            outcome: Outcome::Success,
            total,
            processed: 0,
            unsure: 0,
            skipped: 0,
            errors: 0,
            error: None,
        }
    }

    pub fn failed(operation: &'static str, err: &OperationError) -> Self {
        Self {
            outcome: Outcome::Error,
            error: Some(err.to_string()),
            ..Self::new(operation, 0)
        }
    }

    pub fn cancelled(mut self) -> Self {
        self.outcome = Outcome::Cancelled;
        self
    }

    /// Collapse an operation result into a summary, keeping the error text.
    pub fn from_result(operation: &'static str, result: Result<Self, OperationError>) -> Self {
        result.unwrap_or_else(|err| Self::failed(operation, &err))
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.outcome {
            Outcome::Error => write!(
                f,
                "{} failed: {}",
                self.operation,
                self.error.as_deref().unwrap_or("unknown error")
            ),
            outcome => {
                write!(
                    f,
                    "{} of {} organized, {} unsure, {} skipped",
                    self.processed, self.total, self.unsure, self.skipped
                )?;
                if self.errors > 0 {
                    write!(f, ", {} errors", self.errors)?;
                }
                if outcome == Outcome::Cancelled {
                    f.write_str(" (cancelled)")?;
                }
                Ok(())
            }
        }
    }
}
