//! The registry client capability consumed by the liveness agent, and the
//! entities it exchanges with a remote service registry.
use std::fmt;
use std::time;

use async_trait::async_trait;
use thiserror::Error;

/// Enumeration of errors returned by a `RegistryClient`.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid registry url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("registry token is not a valid header value")]
    InvalidToken,
    /// The connection was never established, so the registry saw nothing.
    #[error("registry could not be reached: {0}")]
    Unreachable(reqwest::Error),
    /// The request may have been sent before the exchange broke down.
    #[error("registry request failed: {0}")]
    Transport(reqwest::Error),
    #[error("registry rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("registry call timed out after {0:?}")]
    Timeout(time::Duration),
}

impl RegistryError {
    /// True when the request may have been applied by the registry even though
    /// we got no answer, e.g. a timeout after the body was sent. A refused
    /// connection is not ambiguous.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, RegistryError::Timeout(_) | RegistryError::Transport(_))
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::InvalidUrl(_) => "invalid_url",
            RegistryError::InvalidToken => "invalid_token",
            RegistryError::Unreachable(_) => "unreachable",
            RegistryError::Transport(_) => "transport",
            RegistryError::Rejected { .. } => "rejected",
            RegistryError::Timeout(_) => "timeout",
        }
    }
}

/// A time-to-live health check: the registry expects a pass/fail report
/// at least once per `ttl`, and marks the service critical otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlCheck {
    pub name: String,
    pub note: String,
    pub ttl: time::Duration,
    /// Ask the registry to reap the entry once it has been critical for this long.
    pub deregister_critical_after: Option<time::Duration>,
}

impl TtlCheck {
    pub fn new(name: &str, note: &str, ttl: time::Duration) -> Self {
        Self {
            name: name.to_owned(),
            note: note.to_owned(),
            ttl,
            deregister_critical_after: None,
        }
    }

    pub fn deregister_critical_after(mut self, after: time::Duration) -> Self {
        self.deregister_critical_after = Some(after);
        self
    }
}

/// The entry this agent owns in the registry. A re-registration replaces it
/// entirely, it is never patched in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub service_id: String,
    pub name: String,
    pub address: String,
    /// `None` means the service is not network-addressable.
    pub port: Option<u16>,
    pub tags: Vec<String>,
    pub check: TtlCheck,
}

impl RegistrationRecord {
    pub fn new(service_id: &str, name: &str, address: &str, check: TtlCheck) -> Self {
        Self {
            service_id: service_id.to_owned(),
            name: name.to_owned(),
            address: address.to_owned(),
            port: None,
            tags: Vec::new(),
            check,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportStatus {
    Alive,
    Failing,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Alive => "alive",
            ReportStatus::Failing => "failing",
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single heartbeat. Not stored anywhere locally: the registry is the
/// system of record for the current status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    pub service_id: String,
    pub status: ReportStatus,
    pub note: String,
}

impl LivenessReport {
    pub fn alive(service_id: &str, note: &str) -> Self {
        Self {
            service_id: service_id.to_owned(),
            status: ReportStatus::Alive,
            note: note.to_owned(),
        }
    }

    pub fn failing(service_id: &str, note: &str) -> Self {
        Self {
            service_id: service_id.to_owned(),
            status: ReportStatus::Failing,
            note: note.to_owned(),
        }
    }
}

/// Request/response access to a remote service registry.
///
/// Implementations must not cache anything locally: every call is a round-trip.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn register(&self, record: &RegistrationRecord) -> Result<(), RegistryError>;

    async fn report_alive(&self, service_id: &str, note: &str) -> Result<(), RegistryError>;

    async fn report_failing(&self, service_id: &str, note: &str) -> Result<(), RegistryError>;

    async fn deregister(&self, service_id: &str) -> Result<(), RegistryError>;

    async fn report(&self, report: &LivenessReport) -> Result<(), RegistryError> {
        match report.status {
            ReportStatus::Alive => self.report_alive(&report.service_id, &report.note).await,
            ReportStatus::Failing => self.report_failing(&report.service_id, &report.note).await,
        }
    }
}
