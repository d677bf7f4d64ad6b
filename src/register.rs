//! Node registration with the control plane.
//!
//! The control plane's minion API answers the very first registration of a
//! new node with a spurious 500 ("The requested resource does not exist")
//! while it initializes. Registration therefore makes at most two attempts:
//! that specific failure on the first attempt is retried once after a short
//! delay, anything else is terminal.

use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use serde::Serialize;
use sysinfo::System;

use crate::error::{Error, Result};

pub const MINIONS_PATH: &str = "/api/v1beta1/minions";
const TRANSIENT_MESSAGE_PREFIX: &str = "The requested resource does not exist";
const MAX_ATTEMPTS: usize = 2;

/// Facts about the local host reported as node capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostFacts {
    pub private_address: String,
    pub mem_kib: u64,
    pub cpus: usize,
}

impl HostFacts {
    pub fn collect(private_address: impl Into<String>) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();
        Self {
            private_address: private_address.into(),
            mem_kib: sys.total_memory() / 1024,
            cpus: sys.cpus().len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MinionRequest {
    #[serde(rename = "Kind")]
    pub kind: &'static str,
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "HostIP")]
    pub host_ip: String,
    pub metadata: Metadata,
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resources {
    pub capacity: Capacity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capacity {
    pub mem: String,
    pub cpu: usize,
}

impl MinionRequest {
    pub fn new(facts: &HostFacts) -> Self {
        Self {
            kind: "Minion",
            id: facts.private_address.clone(),
            host_ip: facts.private_address.clone(),
            metadata: Metadata {
                name: facts.private_address.clone(),
            },
            resources: Resources {
                capacity: Capacity {
                    mem: format!("{} K", facts.mem_kib),
                    cpu: facts.cpus,
                },
            },
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

/// Raw response from the minion API.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    /// The `message` field of a JSON error body, if any.
    pub fn message(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(&self.body).ok()?;
        value.get("message")?.as_str().map(str::to_string)
    }
}

#[async_trait]
pub trait MinionApi: Send + Sync {
    async fn post_minion(&self, endpoint: &str, request: &MinionRequest) -> Result<ApiResponse>;
}

/// Minion API over plain HTTP.
pub struct HttpMinionApi {
    client: reqwest::Client,
}

impl HttpMinionApi {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::RegistrationFatal {
                endpoint: String::new(),
                reason: format!("failed to build HTTP client: {}", e),
                request: String::new(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MinionApi for HttpMinionApi {
    async fn post_minion(&self, endpoint: &str, request: &MinionRequest) -> Result<ApiResponse> {
        let url = format!("{}{}", endpoint.trim_end_matches('/'), MINIONS_PATH);
        let transport_err = |e: reqwest::Error| Error::RegistrationFatal {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
            request: request.to_json(),
        };

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::ACCEPT, "application/json")
            .json(request)
            .send()
            .await
            .map_err(transport_err)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(transport_err)?;
        Ok(ApiResponse { status, body })
    }
}

/// Registration progress. `Attempt` and `Retried` are the live states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Attempt,
    Retried,
    Registered,
    Failed,
}

#[derive(Debug)]
enum Classified {
    Registered,
    Transient(String),
    Fatal(String),
}

fn classify(response: &ApiResponse, state: RegistrationState) -> Classified {
    match response.status {
        200 | 202 | 409 => Classified::Registered,
        500 => match response.message() {
            Some(message)
                if state == RegistrationState::Attempt
                    && message.starts_with(TRANSIENT_MESSAGE_PREFIX) =>
            {
                Classified::Transient(message)
            }
            _ => Classified::Fatal(format!("status 500: {}", response.body)),
        },
        status => Classified::Fatal(format!("status {}: {}", status, response.body)),
    }
}

pub struct NodeRegistrar<'a> {
    pub api: &'a dyn MinionApi,
    pub retry_delay: Duration,
}

impl<'a> NodeRegistrar<'a> {
    /// Register the node described by `facts` with the control plane at
    /// `endpoint`. Returns the terminal state, which is always `Registered`
    /// on success.
    pub async fn register(&self, endpoint: &str, facts: &HostFacts) -> Result<RegistrationState> {
        let request = MinionRequest::new(facts);
        let mut state = RegistrationState::Attempt;

        for _ in 0..MAX_ATTEMPTS {
            let response = self.api.post_minion(endpoint, &request).await?;
            info!(
                "Registration response from {}: status {} body {}",
                endpoint, response.status, response.body
            );

            match classify(&response, state) {
                Classified::Registered => {
                    info!("Registered {} with {}", facts.private_address, endpoint);
                    return Ok(RegistrationState::Registered);
                }
                Classified::Transient(message) => {
                    let transient = Error::RegistrationTransient {
                        endpoint: endpoint.to_string(),
                        message,
                    };
                    warn!("{}, retrying registration in {:?}", transient, self.retry_delay);
                    tokio::time::sleep(self.retry_delay).await;
                    state = RegistrationState::Retried;
                }
                Classified::Fatal(reason) => {
                    warn!(
                        "Registration {:?} after {:?}: {}",
                        RegistrationState::Failed,
                        state,
                        reason
                    );
                    return Err(Error::RegistrationFatal {
                        endpoint: endpoint.to_string(),
                        reason,
                        request: request.to_json(),
                    });
                }
            }
        }

        // Unreachable in practice: the second attempt is never classified as
        // transient, so the loop always returns.
        Err(Error::RegistrationFatal {
            endpoint: endpoint.to_string(),
            reason: format!("gave up after {} attempts", MAX_ATTEMPTS),
            request: request.to_json(),
        })
    }
}
