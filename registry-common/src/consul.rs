//! `RegistryClient` speaking the Consul agent HTTP API.
use std::time;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::registry::{RegistrationRecord, RegistryClient, RegistryError};

const TOKEN_HEADER: &str = "x-consul-token";

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct ServiceDefinition<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: &'a [String],
    check: CheckDefinition<'a>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct CheckDefinition<'a> {
    #[serde(rename = "CheckID")]
    check_id: String,
    name: &'a str,
    notes: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    deregister_critical_service_after: Option<String>,
}

impl<'a> From<&'a RegistrationRecord> for ServiceDefinition<'a> {
    fn from(record: &'a RegistrationRecord) -> Self {
        Self {
            id: &record.service_id,
            name: &record.name,
            address: &record.address,
            port: record.port.unwrap_or(0),
            tags: &record.tags,
            check: CheckDefinition {
                check_id: check_id(&record.service_id),
                name: &record.check.name,
                notes: &record.check.note,
                ttl: go_duration(record.check.ttl),
                deregister_critical_service_after: record
                    .check
                    .deregister_critical_after
                    .map(go_duration),
            },
        }
    }
}

/// Consul names the TTL check embedded in a service definition after the service.
fn check_id(service_id: &str) -> String {
    format!("service:{}", service_id)
}

fn go_duration(duration: time::Duration) -> String {
    format!("{}ms", duration.as_millis())
}

/// HTTP client for a Consul agent. Every request is bounded by `timeout`.
#[derive(Clone)]
pub struct ConsulClient {
    base: Url,
    timeout: time::Duration,
    client: reqwest::Client,
}

impl ConsulClient {
    pub fn new(
        base_url: &str,
        timeout: time::Duration,
        token: Option<&str>,
    ) -> Result<Self, RegistryError> {
        let base = Url::parse(base_url)?;
        if base.cannot_be_a_base() {
            return Err(RegistryError::InvalidUrl(
                url::ParseError::RelativeUrlWithCannotBeABaseBase,
            ));
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let mut value =
                HeaderValue::from_str(token).map_err(|_| RegistryError::InvalidToken)?;
            value.set_sensitive(true);
            headers.insert(TOKEN_HEADER, value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(RegistryError::Transport)?;

        Ok(Self {
            base,
            timeout,
            client,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RegistryError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                RegistryError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase)
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn classify(&self, error: reqwest::Error) -> RegistryError {
        if error.is_timeout() {
            RegistryError::Timeout(self.timeout)
        } else if error.is_connect() {
            RegistryError::Unreachable(error)
        } else {
            RegistryError::Transport(error)
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<(), RegistryError> {
        let response = request.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(RegistryError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    async fn update_check(
        &self,
        verb: &str,
        service_id: &str,
        note: &str,
    ) -> Result<(), RegistryError> {
        let check_id = check_id(service_id);
        let url = self.endpoint(&["v1", "agent", "check", verb, &check_id])?;
        debug!(%url, "updating ttl check");
        self.send(self.client.put(url).query(&[("note", note)])).await
    }
}

#[async_trait]
impl RegistryClient for ConsulClient {
    async fn register(&self, record: &RegistrationRecord) -> Result<(), RegistryError> {
        let url = self.endpoint(&["v1", "agent", "service", "register"])?;
        let definition = ServiceDefinition::from(record);
        self.send(self.client.put(url).json(&definition)).await
    }

    async fn report_alive(&self, service_id: &str, note: &str) -> Result<(), RegistryError> {
        self.update_check("pass", service_id, note).await
    }

    async fn report_failing(&self, service_id: &str, note: &str) -> Result<(), RegistryError> {
        self.update_check("fail", service_id, note).await
    }

    async fn deregister(&self, service_id: &str) -> Result<(), RegistryError> {
        let url = self.endpoint(&["v1", "agent", "service", "deregister", service_id])?;
        self.send(self.client.put(url)).await
    }
}
