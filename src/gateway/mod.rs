//! Outbound client for the session gateway.
//!
//! The gateway is a black box that actually spawns agent sessions; the
//! orchestrator fires a spawn request and later hears back through the
//! inbound webhooks. This module is transport only — rate limiting, dedup,
//! and retry policy all live in the dispatcher.

use crate::errors::GatewayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Agent "thinking level" requested from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    None,
    #[default]
    Low,
    Medium,
    High,
}

/// Fire-and-forget spawn request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRequest {
    /// Full prompt for the agent session.
    pub task: String,
    /// Human-readable session label.
    pub label: String,
    pub model: String,
    pub thinking: ThinkingLevel,
    /// Whether the gateway should clean the session up after completion.
    pub cleanup: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_verify: Option<bool>,
}

/// Gateway acknowledgement. `verified` means the session was confirmed
/// running before the call returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnResponse {
    pub ok: bool,
    pub run_id: String,
    pub child_session_key: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The gateway seam. Production uses [`HttpGateway`]; tests swap in a mock.
#[async_trait]
pub trait SessionGateway: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnResponse, GatewayError>;
}

/// HTTP transport to the gateway's `/spawn` endpoint with bearer auth.
pub struct HttpGateway {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SessionGateway for HttpGateway {
    async fn spawn(&self, request: SpawnRequest) -> Result<SpawnResponse, GatewayError> {
        let url = format!("{}/spawn", self.base_url.trim_end_matches('/'));
        let mut req = self.client.post(&url).json(&request);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let response = req
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // 5xx is worth retrying; anything else is a refusal
            if status.is_server_error() {
                return Err(GatewayError::Transport(format!("{status}: {body}")));
            }
            return Err(GatewayError::SpawnRefused(format!("{status}: {body}")));
        }

        let parsed: SpawnResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::BadResponse(e.to_string()))?;
        if !parsed.ok {
            return Err(GatewayError::SpawnRefused(
                parsed.error.unwrap_or_else(|| "gateway returned ok=false".to_string()),
            ));
        }
        Ok(parsed)
    }
}

pub mod mock {
    //! Scriptable gateway used across the dispatch and pipeline tests.

    use super::*;
    use std::sync::Mutex;

    /// Returns canned results in order, recording every request. When the
    /// script runs out it keeps succeeding.
    pub struct MockGateway {
        pub requests: Mutex<Vec<SpawnRequest>>,
        script: Mutex<Vec<Result<SpawnResponse, GatewayError>>>,
        counter: Mutex<u32>,
    }

    impl MockGateway {
        pub fn always_ok() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                script: Mutex::new(Vec::new()),
                counter: Mutex::new(0),
            }
        }

        pub fn scripted(script: Vec<Result<SpawnResponse, GatewayError>>) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                script: Mutex::new(script),
                counter: Mutex::new(0),
            }
        }

        pub fn ok_response(session: &str) -> SpawnResponse {
            SpawnResponse {
                ok: true,
                run_id: format!("gw-{session}"),
                child_session_key: session.to_string(),
                verified: true,
                error: None,
            }
        }

        pub fn spawn_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SessionGateway for MockGateway {
        async fn spawn(&self, request: SpawnRequest) -> Result<SpawnResponse, GatewayError> {
            self.requests.lock().unwrap().push(request);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                let mut counter = self.counter.lock().unwrap();
                *counter += 1;
                Ok(Self::ok_response(&format!("session-{}", *counter)))
            } else {
                script.remove(0)
            }
        }
    }
}
