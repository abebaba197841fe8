// SPDX-License-Identifier: MIT
//! reqwest-backed implementation of [`RemoteApi`].
//!
//! Every operation carries an explicit deadline; a timeout is reported as
//! [`ApiError::Timeout`] and is always ambiguous — the server may have
//! processed the request.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::{validate_identity, RemoteApi, SessionStatusResponse, TelemetryPayload};
use crate::error::{classify_status, classify_transport, ApiError};

const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSMIT_TIMEOUT: Duration = Duration::from_secs(15);
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(10);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(15);

pub struct HttpRemoteApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemoteApi {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ApiError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post_json(
        &self,
        path: &str,
        identity: &str,
        body: serde_json::Value,
        deadline: Duration,
    ) -> Result<reqwest::Response, ApiError> {
        validate_identity(identity)?;
        let response = self
            .client
            .post(self.url(path))
            .bearer_auth(identity)
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(e, deadline))?;

        let status = response.status().as_u16();
        if let Some(err) = classify_status(status) {
            return Err(err);
        }
        Ok(response)
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn check_status(
        &self,
        identity: &str,
        tenant: &str,
    ) -> Result<SessionStatusResponse, ApiError> {
        let response = self
            .post_json(
                "/session/status",
                identity,
                serde_json::json!({ "tenantCode": tenant }),
                STATUS_TIMEOUT,
            )
            .await?;
        let body: SessionStatusResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Protocol(e.to_string()))?;
        debug!(logged_in = body.logged_in, "session status checked");
        Ok(body)
    }

    async fn transmit_telemetry(
        &self,
        identity: &str,
        tenant: &str,
        payload: &TelemetryPayload,
    ) -> Result<(), ApiError> {
        let body = serde_json::json!({
            "tenantCode": tenant,
            "telemetry": payload,
        });
        self.post_json("/telemetry", identity, body, TRANSMIT_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn logout(
        &self,
        identity: &str,
        tenant: &str,
        force_offline: bool,
    ) -> Result<(), ApiError> {
        let body = serde_json::json!({
            "tenantCode": tenant,
            "forceOffline": force_offline,
        });
        self.post_json("/session/logout", identity, body, LOGOUT_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn login(&self, identity: &str, tenant: &str) -> Result<(), ApiError> {
        self.post_json(
            "/session/login",
            identity,
            serde_json::json!({ "tenantCode": tenant }),
            LOGIN_TIMEOUT,
        )
        .await?;
        Ok(())
    }
}
