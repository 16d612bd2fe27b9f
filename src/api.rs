//! Session API client
//!
//! The external REST collaborator that mints session codes and hands out
//! signaling endpoints and ICE credentials. Join failures (unknown or
//! expired code) surface here, before any WebRTC setup is attempted.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::ShareError;
use crate::types::{IceServer, SessionDescriptor};

/// Parameters for minting a new session
#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionRequest {
    pub single_use: bool,
    pub ttl_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Default for CreateSessionRequest {
    fn default() -> Self {
        Self {
            single_use: true,
            ttl_seconds: 600,
            metadata: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    code: String,
    session_id: String,
    signaling_url: String,
    #[serde(default)]
    ice_servers: Vec<IceServer>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    expires_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JoinSessionResponse {
    session_id: String,
    signaling_url: String,
    #[serde(default)]
    ws_token: Option<String>,
    #[serde(default)]
    ice_servers: Vec<IceServer>,
    #[serde(default)]
    expires_at: Option<String>,
}

/// Boundary to the session-issuing service
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create_session(
        &self,
        req: &CreateSessionRequest,
    ) -> Result<SessionDescriptor, ShareError>;

    /// Redeem a code. A code is redeemed by exactly one joiner.
    async fn join_session(&self, code: &str) -> Result<SessionDescriptor, ShareError>;
}

/// Map an API error status onto the session error taxonomy.
pub(crate) fn map_error_status(status: StatusCode) -> ShareError {
    match status {
        StatusCode::NOT_FOUND => ShareError::SessionNotFound,
        StatusCode::GONE => ShareError::SessionExpired,
        other => ShareError::SignalingUnreachable(format!("session api returned {other}")),
    }
}

/// HTTP implementation of the session API
pub struct HttpSessionApi {
    base_url: String,
    http: reqwest::Client,
}

impl HttpSessionApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn create_session(
        &self,
        req: &CreateSessionRequest,
    ) -> Result<SessionDescriptor, ShareError> {
        let url = format!("{}/sessions", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| ShareError::SignalingUnreachable(format!("session api: {e}")))?;
        if !response.status().is_success() {
            return Err(map_error_status(response.status()));
        }
        let body: CreateSessionResponse = response
            .json()
            .await
            .map_err(|e| ShareError::SignalingUnreachable(format!("session api decode: {e}")))?;
        Ok(SessionDescriptor {
            code: body.code,
            session_id: body.session_id,
            signaling_url: body.signaling_url,
            auth_token: None,
            ice_servers: body.ice_servers,
            created_at: body.created_at,
            expires_at: body.expires_at,
        })
    }

    async fn join_session(&self, code: &str) -> Result<SessionDescriptor, ShareError> {
        let url = format!("{}/sessions/join", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "code": code }))
            .send()
            .await
            .map_err(|e| ShareError::SignalingUnreachable(format!("session api: {e}")))?;
        if !response.status().is_success() {
            return Err(map_error_status(response.status()));
        }
        let body: JoinSessionResponse = response
            .json()
            .await
            .map_err(|e| ShareError::SignalingUnreachable(format!("session api decode: {e}")))?;
        Ok(SessionDescriptor {
            code: code.to_string(),
            session_id: body.session_id,
            signaling_url: body.signaling_url,
            auth_token: body.ws_token,
            ice_servers: body.ice_servers,
            created_at: None,
            expires_at: body.expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            map_error_status(StatusCode::NOT_FOUND),
            ShareError::SessionNotFound
        );
        assert_eq!(map_error_status(StatusCode::GONE), ShareError::SessionExpired);
        assert!(matches!(
            map_error_status(StatusCode::INTERNAL_SERVER_ERROR),
            ShareError::SignalingUnreachable(_)
        ));
    }

    #[test]
    fn create_request_serializes_without_empty_metadata() {
        let req = CreateSessionRequest::default();
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["single_use"], true);
        assert_eq!(json["ttl_seconds"], 600);
        assert!(json.get("metadata").is_none());
    }
}
