//! Async HTTP client for the controller's API v2 (§4.2).
//!
//! Bearer-token authenticated. Adds a fixed per-request timeout and never
//! retries internally — retry policy belongs to the monitor loop, which
//! knows about tick cadence and machine state.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::ControllerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStatus {
    pub running: bool,
    pub player_count: u32,
}

#[derive(Debug, Deserialize)]
struct ServerStatsResponse {
    running: bool,
    #[serde(default)]
    online_players: u32,
}

pub struct ControllerClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ControllerClient {
    pub fn new(base_url: &str, token: String, timeout: Duration) -> Result<Self, ControllerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ControllerError::TransientNetwork)?;

        Ok(ControllerClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Fetch `{running, player_count}` for every id in `server_ids`, coalesced
    /// into one logical snapshot for this tick (§4.2, §4.6).
    pub async fn list_status(
        &self,
        server_ids: &[String],
    ) -> HashMap<String, Result<ServerStatus, ControllerError>> {
        let mut out = HashMap::with_capacity(server_ids.len());
        for id in server_ids {
            let result = self.fetch_status(id).await;
            out.insert(id.clone(), result);
        }
        out
    }

    async fn fetch_status(&self, server_id: &str) -> Result<ServerStatus, ControllerError> {
        let url = format!("{}/api/v2/servers/{server_id}/stats", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let response = Self::check_status(response, server_id)?;

        let parsed: ServerStatsResponse = response
            .json()
            .await
            .map_err(|e| ControllerError::Protocol(e.to_string()))?;

        Ok(ServerStatus {
            running: parsed.running,
            player_count: parsed.online_players,
        })
    }

    /// Accept the controller's start request. Returns once accepted, not
    /// once the server is actually online.
    pub async fn start(&self, server_id: &str) -> Result<(), ControllerError> {
        self.post_action(server_id, "start_server").await
    }

    pub async fn stop(&self, server_id: &str) -> Result<(), ControllerError> {
        self.post_action(server_id, "stop_server").await
    }

    async fn post_action(&self, server_id: &str, action: &str) -> Result<(), ControllerError> {
        let url = format!(
            "{}/api/v2/servers/{server_id}/action/{action}",
            self.base_url
        );
        let response = self.http.post(&url).bearer_auth(&self.token).send().await?;
        Self::check_status(response, server_id)?;
        Ok(())
    }

    fn check_status(
        response: reqwest::Response,
        server_id: &str,
    ) -> Result<reqwest::Response, ControllerError> {
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ControllerError::AuthDenied),
            StatusCode::NOT_FOUND => Err(ControllerError::NotFound(server_id.to_string())),
            status => Err(ControllerError::Protocol(format!(
                "controller returned {status}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = ControllerClient::new(
            "http://localhost:8000/",
            "token".to_string(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.base_url, "http://localhost:8000");
    }

    #[test]
    fn status_classification_matches_expected_error_variants() {
        let unauthorized = StatusCode::UNAUTHORIZED;
        let forbidden = StatusCode::FORBIDDEN;
        let not_found = StatusCode::NOT_FOUND;
        let teapot = StatusCode::IM_A_TEAPOT;

        assert!(unauthorized.is_client_error());
        assert!(forbidden.is_client_error());
        assert!(not_found.is_client_error());
        assert!(!teapot.is_success());
    }
}
