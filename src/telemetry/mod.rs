// SPDX-License-Identifier: MIT
//! Telemetry reading types and the provider collaborator.
//!
//! Raw sensor acquisition is outside this crate: a [`TelemetryProvider`]
//! hands the coordinator complete readings on demand and pushes updates over
//! a watch channel. The crate ships [`FeedTelemetryProvider`], a provider fed
//! by whatever adapter owns the actual sensors (the bundled binary pipes
//! JSONL readings into it).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Mean Earth radius in meters, used by the haversine distance.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Coordinate precision for transmitted payloads: 5 decimal places ≈ 1.1 m.
const COORD_DECIMALS: i32 = 5;

// ─── Geo types ───────────────────────────────────────────────────────────────

/// A WGS-84 position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance to `other` in meters (haversine).
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }

    /// Round both coordinates to transmission precision (~1 m).
    pub fn rounded(&self) -> GeoPoint {
        let f = 10f64.powi(COORD_DECIMALS);
        GeoPoint {
            latitude: (self.latitude * f).round() / f,
            longitude: (self.longitude * f).round() / f,
        }
    }
}

// ─── Signal tier ─────────────────────────────────────────────────────────────

/// Coarse radio signal quality bucket reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalTier {
    None,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl std::fmt::Display for SignalTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalTier::None => write!(f, "none"),
            SignalTier::Poor => write!(f, "poor"),
            SignalTier::Fair => write!(f, "fair"),
            SignalTier::Good => write!(f, "good"),
            SignalTier::Excellent => write!(f, "excellent"),
        }
    }
}

// ─── Reading ─────────────────────────────────────────────────────────────────

/// One complete telemetry sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub position: GeoPoint,
    /// Ground speed in meters per second.
    pub speed_mps: f64,
    /// Battery percentage, 0–100.
    pub power_level: u8,
    pub signal_tier: SignalTier,
    /// Capture time, Unix epoch milliseconds.
    pub captured_at_ms: i64,
}

// ─── Provider collaborator ───────────────────────────────────────────────────

/// Source of telemetry readings.
///
/// `current_reading` returns the freshest sample the provider has;
/// `subscribe` yields a push-style feed that updates whenever a new sample
/// arrives. `None` on the feed means no sample has been captured yet.
#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    async fn current_reading(&self) -> anyhow::Result<Reading>;
    fn subscribe(&self) -> watch::Receiver<Option<Reading>>;
}

/// Provider backed by a watch channel, fed by an external adapter.
pub struct FeedTelemetryProvider {
    tx: watch::Sender<Option<Reading>>,
}

impl FeedTelemetryProvider {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Publish a fresh reading to all subscribers.
    pub fn publish(&self, reading: Reading) {
        // Ignore errors — no subscribers is fine.
        let _ = self.tx.send(Some(reading));
    }
}

impl Default for FeedTelemetryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetryProvider for FeedTelemetryProvider {
    async fn current_reading(&self) -> anyhow::Result<Reading> {
        let latest = *self.tx.borrow();
        latest.ok_or_else(|| anyhow::anyhow!("no telemetry reading captured yet"))
    }

    fn subscribe(&self) -> watch::Receiver<Option<Reading>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading_at(lat: f64, lon: f64) -> Reading {
        Reading {
            position: GeoPoint::new(lat, lon),
            speed_mps: 0.0,
            power_level: 80,
            signal_tier: SignalTier::Good,
            captured_at_ms: 0,
        }
    }

    #[test]
    fn zero_distance_to_self() {
        let p = GeoPoint::new(52.52, 13.405);
        assert!(p.distance_m(&p) < 1e-6);
    }

    #[test]
    fn one_degree_latitude_is_about_111_km() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(1.0, 0.0);
        let d = a.distance_m(&b);
        assert!((d - 111_195.0).abs() < 200.0, "got {d}");
    }

    #[test]
    fn small_diagonal_step_is_about_15_m() {
        // The 0.0001°/0.0001° step used by the sync engine scenarios.
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0001, 0.0001);
        let d = a.distance_m(&b);
        assert!((13.0..18.0).contains(&d), "got {d}");
    }

    #[test]
    fn rounding_keeps_meter_precision() {
        let p = GeoPoint::new(52.520008123456, 13.404954987654);
        let r = p.rounded();
        assert_eq!(r.latitude, 52.52001);
        assert_eq!(r.longitude, 13.40495);
    }

    #[tokio::test]
    async fn feed_provider_reports_latest_reading() {
        let provider = FeedTelemetryProvider::new();
        assert!(provider.current_reading().await.is_err());

        provider.publish(reading_at(1.0, 2.0));
        let r = provider.current_reading().await.unwrap();
        assert_eq!(r.position, GeoPoint::new(1.0, 2.0));

        let mut rx = provider.subscribe();
        provider.publish(reading_at(3.0, 4.0));
        rx.changed().await.unwrap();
        let latest = *rx.borrow();
        assert_eq!(latest.unwrap().position, GeoPoint::new(3.0, 4.0));
    }
}
