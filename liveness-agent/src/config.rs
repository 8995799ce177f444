use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use registry_common::registry::{RegistrationRecord, TtlCheck};

use crate::heartbeat::ReportFailurePolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(default = "http://127.0.0.1:8500")]
    pub registry_url: String,

    pub registry_token: Option<String>,

    #[envconfig(default = "liveness-agent")]
    pub service_name: NonEmptyString,

    /// Defaults to `{service_name}-{advertise_address}`.
    pub service_id: Option<NonEmptyString>,

    #[envconfig(default = "")]
    pub service_tags: CommaSeparated,

    /// Defaults to the host's outbound IPv4 address.
    pub advertise_address: Option<String>,

    /// Leave unset for services that are not network-addressable.
    pub advertise_port: Option<u16>,

    #[envconfig(from = "HEARTBEAT_INTERVAL_MS", default = "10000")]
    pub heartbeat_interval: EnvMsDuration,

    #[envconfig(from = "CHECK_TTL_MS", default = "15000")]
    pub check_ttl: EnvMsDuration,

    #[envconfig(from = "REGISTRY_TIMEOUT_MS", default = "5000")]
    pub registry_timeout: EnvMsDuration,

    /// Probe timeout plus registry timeout must stay below the heartbeat interval.
    #[envconfig(from = "PROBE_TIMEOUT_MS", default = "2000")]
    pub probe_timeout: EnvMsDuration,

    #[envconfig(default = "Service TTL check")]
    pub check_name: String,

    #[envconfig(default = "Liveness agent heartbeat")]
    pub check_note: String,

    #[envconfig(from = "DEREGISTER_CRITICAL_AFTER_MS")]
    pub deregister_critical_after: Option<EnvMsDuration>,

    #[envconfig(default = "3")]
    pub report_failure_escalate_after: u32,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn service_id(&self, address: &str) -> String {
        match &self.service_id {
            Some(id) => id.as_str().to_owned(),
            None => format!("{}-{}", self.service_name.as_str(), address),
        }
    }

    pub fn registration_record(&self, address: &str) -> RegistrationRecord {
        let mut check = TtlCheck::new(&self.check_name, &self.check_note, self.check_ttl.0);
        if let Some(after) = self.deregister_critical_after {
            check = check.deregister_critical_after(after.0);
        }

        let mut record = RegistrationRecord::new(
            &self.service_id(address),
            self.service_name.as_str(),
            address,
            check,
        )
        .tags(self.service_tags.0.clone());
        record.port = self.advertise_port;
        record
    }

    pub fn report_failure_policy(&self) -> ReportFailurePolicy {
        ReportFailurePolicy {
            escalate_after: self.report_failure_escalate_after,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Comma separated list, blank entries dropped.
#[derive(Debug, Clone, Default)]
pub struct CommaSeparated(pub Vec<String>);

impl FromStr for CommaSeparated {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CommaSeparated(
            s.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_owned)
                .collect(),
        ))
    }
}
