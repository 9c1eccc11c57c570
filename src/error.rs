//! Error taxonomy shared across the batch engine.
//!
//! Every failure that can cross a subsystem boundary is one of these kinds.
//! The HTTP executor absorbs what key rotation can recover from, the upsert
//! engine absorbs per-chunk retries, and only errors that survive both reach
//! the scheduler, which consults `severity()` and `is_retryable()` to decide
//! what happens to the job.

use thiserror::Error;

use crate::providers::Provider;

/// Alert severity attached to classified errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure kinds for the batch engine.
#[derive(Debug, Error)]
pub enum BatchError {
    /// Every key of a provider is exhausted or disabled for the day.
    #[error("daily quota exhausted for provider {provider}")]
    QuotaExhausted { provider: Provider },

    /// All keys of a provider landed in cooldown at the same time.
    #[error("rate limited by provider {provider}")]
    RateLimited { provider: Provider },

    /// The provider rejected the credential. Requires manual reactivation.
    #[error("credential rejected by provider {provider}: {detail}")]
    Auth { provider: Provider, detail: String },

    /// Network failure, 5xx, or an unparseable response.
    #[error("transient failure: {detail}")]
    Transient { detail: String },

    /// A row was dropped by the transform. Never fatal for a job.
    #[error("row validation failed: {detail}")]
    Validation { detail: String },

    /// A constraint violation the upsert conflict keys do not cover.
    #[error("constraint conflict: {detail}")]
    Conflict { detail: String },

    /// The upsert engine aborted after five consecutive failed chunks.
    #[error("bulk upsert into {table} aborted after repeated chunk failures ({completed} records committed)")]
    PartialFailure { table: String, completed: u64 },

    /// One or more tables scored below their quality threshold.
    #[error("quality gate failed for: {tables}")]
    QualityGateFailed { tables: String },

    /// The scheduler cancelled the job body at its deadline.
    #[error("job timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Invalid startup configuration. The process aborts.
    #[error("configuration error: {detail}")]
    Config { detail: String },

    #[error("database error: {0}")]
    Db(#[from] diesel::result::Error),
}

impl BatchError {
    pub fn severity(&self) -> Severity {
        match self {
            BatchError::QuotaExhausted { .. } => Severity::Critical,
            BatchError::Config { .. } => Severity::Critical,
            BatchError::Auth { .. } => Severity::High,
            BatchError::QualityGateFailed { .. } => Severity::High,
            BatchError::Timeout { .. } => Severity::High,
            BatchError::PartialFailure { .. } => Severity::High,
            BatchError::RateLimited { .. } => Severity::Medium,
            BatchError::Transient { .. } => Severity::Medium,
            BatchError::Conflict { .. } => Severity::Medium,
            BatchError::Db(_) => Severity::Medium,
            BatchError::Validation { .. } => Severity::Low,
        }
    }

    /// Whether the scheduler may re-run the whole job after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BatchError::RateLimited { .. }
                | BatchError::Transient { .. }
                | BatchError::PartialFailure { .. }
                | BatchError::Db(_)
        )
    }

    /// Short stable label used in execution rows and alerts.
    pub fn kind(&self) -> &'static str {
        match self {
            BatchError::QuotaExhausted { .. } => "quota_exhausted",
            BatchError::RateLimited { .. } => "rate_limited",
            BatchError::Auth { .. } => "auth",
            BatchError::Transient { .. } => "transient",
            BatchError::Validation { .. } => "validation",
            BatchError::Conflict { .. } => "conflict",
            BatchError::QualityGateFailed { .. } => "quality_gate",
            BatchError::PartialFailure { .. } => "partial_failure",
            BatchError::Timeout { .. } => "timeout",
            BatchError::Config { .. } => "config",
            BatchError::Db(_) => "database",
        }
    }
}

/// Strip anything that could carry a credential out of an error string.
///
/// Provider errors sometimes embed the full request URL, which would leak
/// the `serviceKey` query parameter into logs and ledger rows.
pub fn sanitize_detail(detail: &str) -> String {
    match detail.find("serviceKey=") {
        Some(idx) => {
            let tail = &detail[idx..];
            let end = tail.find('&').map(|i| idx + i).unwrap_or(detail.len());
            format!("{}serviceKey=<redacted>{}", &detail[..idx], &detail[end..])
        }
        None => detail.to_string(),
    }
}
