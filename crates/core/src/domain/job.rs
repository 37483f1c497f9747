// Job Identity & State Drafts

use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};

/// Internal job identity. Callers exchange job ids as decimal strings;
/// every other persisted entity references a job through this integer.
pub type JobId = i64;

/// Parse a job id received at the boundary.
///
/// Ids must be positive decimal integers. Anything else is a precondition
/// error raised before any work is staged.
pub fn parse_job_id(raw: &str) -> Result<JobId> {
    raw.parse::<JobId>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| AppError::Validation(format!("malformed job id: {:?}", raw)))
}

/// A state to append to a job's history.
///
/// `data` is an opaque payload produced by the caller; the engine never
/// inspects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDraft {
    pub name: String,
    pub reason: Option<String>,
    pub data: Option<String>,
}

impl StateDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: None,
            data: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positive_decimal_ids() {
        assert_eq!(parse_job_id("42").unwrap(), 42);
        assert_eq!(parse_job_id("1").unwrap(), 1);
    }

    #[test]
    fn rejects_malformed_ids() {
        for raw in ["", "0", "-3", "abc", "1.5", "99999999999999999999"] {
            assert!(parse_job_id(raw).is_err(), "should reject {:?}", raw);
        }
    }

    #[test]
    fn state_draft_builder() {
        let state = StateDraft::new("Succeeded")
            .with_reason("done")
            .with_data("{\"latency\":12}");
        assert_eq!(state.name, "Succeeded");
        assert_eq!(state.reason.as_deref(), Some("done"));
        assert!(state.data.unwrap().contains("latency"));
    }
}
