//! Geofence alert state machine.
//!
//! Each zone is `Idle` until the user comes within its radius, then
//! `Cooling` until the cooldown has elapsed since its last alert. Leaving a
//! zone does not re-arm it. [`evaluate`] is a pure transition: it takes the
//! state by value and hands back the next one with the events it raised.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::geo::{haversine_distance, LatLng};
use crate::window::HazardPoint;
use crate::RmError;

pub const DEFAULT_RADIUS_M: f64 = 10.0;

fn default_radius() -> f64 {
    DEFAULT_RADIUS_M
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AlertConfig {
    pub cooldown_ms: u64,
    pub default_radius_m: f64,
    /// Delay between raising a batch and handing it to the sink.
    pub batch_delay_ms: u64,
    /// Silence on the position feed longer than this is reported.
    pub position_timeout_ms: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 15_000,
            default_radius_m: DEFAULT_RADIUS_M,
            batch_delay_ms: 100,
            position_timeout_ms: 5_000,
        }
    }
}

impl AlertConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::milliseconds(i64::try_from(self.cooldown_ms).unwrap_or(i64::MAX))
    }

    pub fn batch_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.batch_delay_ms)
    }

    pub fn position_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.position_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), RmError> {
        if !self.default_radius_m.is_finite() || self.default_radius_m < 0.0 {
            return Err(RmError::Config(format!(
                "defaultRadiusM {} must be a non-negative distance",
                self.default_radius_m
            )));
        }
        if self.position_timeout_ms == 0 {
            return Err(RmError::Config("positionTimeoutMs must be positive".into()));
        }
        Ok(())
    }
}

/// Zone identity: its center coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZoneKey(OrderedFloat<f64>, OrderedFloat<f64>);

impl ZoneKey {
    pub fn new(center: LatLng) -> Self {
        Self(OrderedFloat(center.latitude), OrderedFloat(center.longitude))
    }
}

impl fmt::Display for ZoneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.0, self.1)
    }
}

impl Serialize for ZoneKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AlertZone {
    pub center: LatLng,
    #[serde(default = "default_radius")]
    pub radius: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl AlertZone {
    pub fn new(center: LatLng, radius: f64) -> Self {
        Self {
            center,
            radius,
            label: None,
        }
    }

    pub fn from_point(point: &HazardPoint, radius: f64) -> Self {
        Self::new(point.position(), radius)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn key(&self) -> ZoneKey {
        ZoneKey::new(self.center)
    }

    pub fn validate(&self) -> Result<(), RmError> {
        self.center.validate()?;
        if !self.radius.is_finite() || self.radius < 0.0 {
            return Err(RmError::invalid(format!(
                "zone radius {} must be a non-negative distance",
                self.radius
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZoneStatus {
    Idle,
    Cooling,
}

#[derive(Clone, Debug, Default)]
pub struct AlertState {
    cooldowns: HashMap<ZoneKey, DateTime<Utc>>,
}

impl AlertState {
    pub fn last_alerted(&self, key: &ZoneKey) -> Option<DateTime<Utc>> {
        self.cooldowns.get(key).copied()
    }

    pub fn status(&self, key: &ZoneKey, now: DateTime<Utc>, cooldown: Duration) -> ZoneStatus {
        match self.cooldowns.get(key) {
            Some(last) if now - *last <= cooldown => ZoneStatus::Cooling,
            _ => ZoneStatus::Idle,
        }
    }

    /// Number of zones that have ever alerted.
    pub fn len(&self) -> usize {
        self.cooldowns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cooldowns.is_empty()
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub zone_id: ZoneKey,
    /// Position of the zone in the list it was evaluated against.
    pub index: usize,
    pub position: LatLng,
    pub distance_m: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl AlertEvent {
    pub fn message(&self) -> String {
        let name = self
            .label
            .clone()
            .unwrap_or_else(|| format!("hazard #{}", self.index + 1));
        format!(
            "Approaching {name} at {} ({:.0} m away)",
            self.zone_id, self.distance_m
        )
    }
}

/// Everything raised by one position update, delivered as one notification.
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlertBatch {
    pub raised_at: DateTime<Utc>,
    pub events: Vec<AlertEvent>,
}

impl AlertBatch {
    pub fn new(events: Vec<AlertEvent>, raised_at: DateTime<Utc>) -> Self {
        Self { raised_at, events }
    }

    pub fn message(&self) -> String {
        self.events
            .iter()
            .map(AlertEvent::message)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub fn evaluate(
    position: LatLng,
    zones: &[AlertZone],
    mut state: AlertState,
    now: DateTime<Utc>,
    cooldown: Duration,
) -> (AlertState, Vec<AlertEvent>) {
    let mut events = Vec::new();
    for (index, zone) in zones.iter().enumerate() {
        let distance = haversine_distance(position, zone.center);
        if distance > zone.radius {
            continue;
        }
        let key = zone.key();
        if state.status(&key, now, cooldown) == ZoneStatus::Cooling {
            continue;
        }
        state.cooldowns.insert(key, now);
        events.push(AlertEvent {
            zone_id: key,
            index,
            position,
            distance_m: distance,
            label: zone.label.clone(),
        });
    }
    (state, events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 1, 8, 0, 0).unwrap()
    }

    fn cooldown() -> Duration {
        AlertConfig::default().cooldown()
    }

    #[test]
    fn alert_fires_once_then_cools_down() {
        let center = LatLng::new(35.654_732, 139.797_082);
        let zones = vec![AlertZone::new(center, 10.0)];

        let (state, events) = evaluate(center, &zones, AlertState::default(), t0(), cooldown());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].index, 0);
        assert_eq!(events[0].distance_m, 0.0);
        assert_eq!(state.status(&zones[0].key(), t0(), cooldown()), ZoneStatus::Cooling);

        let later = t0() + Duration::seconds(5);
        let (state, events) = evaluate(center, &zones, state, later, cooldown());
        assert!(events.is_empty());
        assert_eq!(state.last_alerted(&zones[0].key()), Some(t0()));

        let at_edge = t0() + cooldown();
        let (state, events) = evaluate(center, &zones, state, at_edge, cooldown());
        assert!(events.is_empty());

        let after = t0() + cooldown() + Duration::milliseconds(1);
        let (state, events) = evaluate(center, &zones, state, after, cooldown());
        assert_eq!(events.len(), 1);
        assert_eq!(state.last_alerted(&zones[0].key()), Some(after));
    }

    #[test]
    fn outside_radius_does_not_alert_or_rearm() {
        let center = LatLng::new(35.0, 139.0);
        let zones = vec![AlertZone::new(center, 10.0)];
        // ~111 m north
        let away = LatLng::new(35.001, 139.0);
        let (state, events) = evaluate(away, &zones, AlertState::default(), t0(), cooldown());
        assert!(events.is_empty());
        assert!(state.is_empty());

        let (state, _) = evaluate(center, &zones, state, t0(), cooldown());
        let (state, _) = evaluate(away, &zones, state, t0() + Duration::seconds(1), cooldown());
        let (_, events) = evaluate(center, &zones, state, t0() + Duration::seconds(2), cooldown());
        assert!(events.is_empty(), "leaving the zone must not re-arm it");
    }

    #[test]
    fn boundary_distance_counts_as_inside() {
        let center = LatLng::new(0.0, 0.0);
        let edge = LatLng::new(0.0, 0.0001);
        let d = haversine_distance(center, edge);
        let zones = vec![AlertZone::new(center, d)];
        let (_, events) = evaluate(edge, &zones, AlertState::default(), t0(), cooldown());
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn every_qualifying_zone_fires_in_the_same_update() {
        let here = LatLng::new(35.0, 139.0);
        let zones = vec![
            AlertZone::new(LatLng::new(35.000_02, 139.0), 10.0).with_label("pothole"),
            AlertZone::new(LatLng::new(35.1, 139.0), 10.0),
            AlertZone::new(LatLng::new(35.0, 139.000_05), 10.0),
        ];
        let (state, events) = evaluate(here, &zones, AlertState::default(), t0(), cooldown());
        let indices: Vec<usize> = events.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 2]);
        assert_eq!(state.len(), 2);

        let batch = AlertBatch::new(events, t0());
        let message = batch.message();
        assert_eq!(message.lines().count(), 2);
        assert!(message.starts_with("Approaching pothole"));
        assert!(message.contains("hazard #3"));
    }

    #[test]
    fn duplicate_zones_alert_once() {
        let center = LatLng::new(35.0, 139.0);
        let zones = vec![AlertZone::new(center, 10.0), AlertZone::new(center, 25.0)];
        let (_, events) = evaluate(center, &zones, AlertState::default(), t0(), cooldown());
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn cooldown_is_measured_in_wall_clock_time() {
        let center = LatLng::new(35.0, 139.0);
        let zones = vec![AlertZone::new(center, 10.0)];
        let (state, _) = evaluate(center, &zones, AlertState::default(), t0(), cooldown());
        // a single late update after a long gap fires again
        let (_, events) = evaluate(center, &zones, state, t0() + Duration::hours(1), cooldown());
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn zone_defaults_and_key_format() {
        let zone: AlertZone =
            serde_json::from_str(r#"{"center": {"latitude": 35.5, "longitude": 139.25}}"#).unwrap();
        assert_eq!(zone.radius, DEFAULT_RADIUS_M);
        assert_eq!(zone.key().to_string(), "35.5,139.25");
        let event = AlertEvent {
            zone_id: zone.key(),
            index: 0,
            position: zone.center,
            distance_m: 0.0,
            label: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["zoneId"], "35.5,139.25");
    }

    #[test]
    fn config_validation() {
        assert!(AlertConfig::default().validate().is_ok());
        let bad = AlertConfig {
            default_radius_m: -1.0,
            ..AlertConfig::default()
        };
        assert!(matches!(bad.validate(), Err(RmError::Config(_))));
    }

    #[test]
    fn zone_validation() {
        let center = LatLng::new(35.0, 139.0);
        assert!(AlertZone::new(center, 0.0).validate().is_ok());
        assert!(AlertZone::new(center, -5.0).validate().is_err());
        assert!(AlertZone::new(center, f64::NAN).validate().is_err());
        assert!(AlertZone::new(LatLng::new(91.0, 0.0), 10.0).validate().is_err());
    }
}
