// SPDX-License-Identifier: MIT
//! Remote-service contract.
//!
//! The coordinator consumes four operations from the backing service:
//! session status check, telemetry transmission, logout, and login. The
//! [`RemoteApi`] trait keeps the wire encoding out of the coordination core;
//! [`http::HttpRemoteApi`] is the production implementation.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::sync::MovementTier;
use crate::telemetry::{Reading, SignalTier};

/// Result of `check_status`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub logged_in: bool,
}

/// Telemetry as transmitted to the service.
///
/// Coordinates are rounded to ~1 m and speed to one decimal so that two
/// payloads from the same physical situation compare equal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPayload {
    pub latitude: f64,
    pub longitude: f64,
    pub speed_mps: f64,
    pub power_level: u8,
    pub signal_tier: SignalTier,
    pub movement_tier: MovementTier,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
}

impl TelemetryPayload {
    pub fn from_reading(reading: &Reading, movement_tier: MovementTier) -> Self {
        let position = reading.position.rounded();
        Self {
            latitude: position.latitude,
            longitude: position.longitude,
            speed_mps: (reading.speed_mps * 10.0).round() / 10.0,
            power_level: reading.power_level,
            signal_tier: reading.signal_tier,
            movement_tier,
            timestamp: reading.captured_at_ms,
        }
    }
}

/// Operations exposed by the remote service.
///
/// Implementations classify every failure into [`ApiError`]; callers never
/// see transport-level error types.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn check_status(
        &self,
        identity: &str,
        tenant: &str,
    ) -> Result<SessionStatusResponse, ApiError>;

    async fn transmit_telemetry(
        &self,
        identity: &str,
        tenant: &str,
        payload: &TelemetryPayload,
    ) -> Result<(), ApiError>;

    async fn logout(
        &self,
        identity: &str,
        tenant: &str,
        force_offline: bool,
    ) -> Result<(), ApiError>;

    async fn login(&self, identity: &str, tenant: &str) -> Result<(), ApiError>;
}

/// Reject identity credentials that cannot travel in an HTTP header.
///
/// Runs synchronously before any request is built; a failure here is a
/// [`ApiError::Validation`] and is never retried.
pub fn validate_identity(identity: &str) -> Result<(), ApiError> {
    if identity.is_empty() {
        return Err(ApiError::Validation("identity token is empty".into()));
    }
    if let Some(bad) = identity.chars().find(|c| !c.is_ascii_graphic()) {
        return Err(ApiError::Validation(format!(
            "identity token contains illegal character {bad:?}"
        )));
    }
    Ok(())
}
