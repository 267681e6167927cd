//! Session window aggregation.
//!
//! Each session accumulates accelerometer and microphone readings until the
//! next location fix arrives. The fix closes the window: the buffered readings
//! are reduced to a [`HazardPoint`] at the fix's coordinates and the buffers
//! start over empty.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geo::LatLng;
use crate::math::{normalize, reduce, root_mean_square, ReduceMode};
use crate::sample::{Reading, Sample};
use crate::RmError;

/// What to do with a window that saw neither accelerometer nor microphone samples.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmptyWindowPolicy {
    /// Emit a point with zero vibration and a null microphone score.
    #[default]
    Emit,
    /// Drop the point.
    Suppress,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct WindowConfig {
    /// Reference range the mean dBFS is normalized against.
    pub mic_min: f64,
    pub mic_max: f64,
    /// Keep per-axis RMS on emitted points.
    pub retain_axis_vibration: bool,
    pub empty_window: EmptyWindowPolicy,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            mic_min: 0.0,
            mic_max: 30.0,
            retain_axis_vibration: true,
            empty_window: EmptyWindowPolicy::Emit,
        }
    }
}

impl WindowConfig {
    pub fn validate(&self) -> Result<(), RmError> {
        if !(self.mic_min.is_finite() && self.mic_max.is_finite()) {
            return Err(RmError::Config("microphone range must be finite".into()));
        }
        if self.mic_min == self.mic_max {
            return Err(RmError::Config(format!(
                "microphone range is degenerate (micMin == micMax == {})",
                self.mic_min
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct AxisVibration {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Score for one closed window, positioned at the fix that closed it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HazardPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub time: i64,
    pub vertical_vibration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vibration: Option<AxisVibration>,
    #[serde(default)]
    pub microphone: Option<f64>,
}

impl HazardPoint {
    pub fn position(&self) -> LatLng {
        LatLng::new(self.latitude, self.longitude)
    }

    pub fn validate(&self) -> Result<(), RmError> {
        self.position().validate()?;
        if !self.vertical_vibration.is_finite() || self.vertical_vibration < 0.0 {
            return Err(RmError::invalid(format!(
                "verticalVibration {} must be finite and non-negative",
                self.vertical_vibration
            )));
        }
        if let Some(axes) = self.vibration {
            if ![axes.x, axes.y, axes.z]
                .iter()
                .all(|v| v.is_finite() && *v >= 0.0)
            {
                return Err(RmError::invalid("per-axis vibration must be finite and non-negative"));
            }
        }
        if let Some(mic) = self.microphone {
            if !mic.is_finite() {
                return Err(RmError::invalid("microphone score must be finite"));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct PendingCounts {
    pub accelerometer: usize,
    pub microphone: usize,
}

/// Buffers of the window currently open in one session.
#[derive(Clone, Debug, Default)]
pub struct Window {
    x: Vec<f64>,
    y: Vec<f64>,
    z: Vec<f64>,
    mic: Vec<f64>,
}

impl Window {
    pub fn push_acceleration(&mut self, x: f64, y: f64, z: f64) {
        self.x.push(x);
        self.y.push(y);
        self.z.push(z);
    }

    pub fn push_microphone(&mut self, dbfs: f64) {
        self.mic.push(dbfs);
    }

    pub fn is_empty(&self) -> bool {
        self.z.is_empty() && self.mic.is_empty()
    }

    pub fn pending(&self) -> PendingCounts {
        PendingCounts {
            accelerometer: self.z.len(),
            microphone: self.mic.len(),
        }
    }

    /// Reduce the buffered readings at `fix` and reset the buffers.
    ///
    /// The buffers are empty afterwards whatever the outcome.
    pub fn close(
        &mut self,
        fix: LatLng,
        time: i64,
        config: &WindowConfig,
    ) -> Result<Option<HazardPoint>, RmError> {
        let taken = std::mem::take(self);
        if taken.is_empty() && config.empty_window == EmptyWindowPolicy::Suppress {
            return Ok(None);
        }

        let vertical_vibration = root_mean_square(&taken.z);
        let vibration = config.retain_axis_vibration.then(|| AxisVibration {
            x: root_mean_square(&taken.x),
            y: root_mean_square(&taken.y),
            z: vertical_vibration,
        });
        let microphone = if taken.mic.is_empty() {
            None
        } else {
            let mean = reduce(&taken.mic, ReduceMode::Mean)?;
            Some(normalize(mean, config.mic_min, config.mic_max)?)
        };

        let point = HazardPoint {
            latitude: fix.latitude,
            longitude: fix.longitude,
            time,
            vertical_vibration,
            vibration,
            microphone,
        };
        point.validate()?;
        Ok(Some(point))
    }
}

#[derive(Clone, Debug, Default)]
struct SessionState {
    window: Window,
    last_time: Option<i64>,
}

impl SessionState {
    fn check_order(&self, session: &str, time: i64) -> Result<(), RmError> {
        match self.last_time {
            Some(previous) if time < previous => Err(RmError::OutOfOrderSample {
                session: session.to_string(),
                previous,
                got: time,
            }),
            _ => Ok(()),
        }
    }

    fn apply(
        &mut self,
        sample: &Sample,
        config: &WindowConfig,
    ) -> Result<Option<HazardPoint>, RmError> {
        let point = match &sample.reading {
            Reading::Accelerometer { x, y, z } => {
                self.window.push_acceleration(*x, *y, *z);
                None
            }
            Reading::Microphone { dbfs } => {
                self.window.push_microphone(*dbfs);
                None
            }
            Reading::Location(fix) => self.window.close(*fix, sample.time, config)?,
        };
        self.last_time = Some(sample.time);
        Ok(point)
    }
}

/// Keeps one open window per session; one writer per session at a time.
///
/// Every ingest runs against a copy of the session state that replaces the
/// live one only when the whole call succeeds.
#[derive(Debug, Default)]
pub struct SessionAggregator {
    config: WindowConfig,
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl SessionAggregator {
    pub fn new(config: WindowConfig) -> Result<Self, RmError> {
        config.validate()?;
        Ok(Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    fn session(&self, session_id: &str) -> Arc<Mutex<SessionState>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(sessions.entry(session_id.to_string()).or_default())
    }

    /// Feed one sample; a location sample yields the closed window's point.
    pub fn ingest(&self, sample: &Sample) -> Result<Option<HazardPoint>, RmError> {
        let session = self.session(&sample.session_id);
        let mut state = session.lock().unwrap_or_else(PoisonError::into_inner);
        state.check_order(&sample.session_id, sample.time)?;
        let mut staged = state.clone();
        let point = staged.apply(sample, &self.config)?;
        *state = staged;
        if let Some(p) = point.as_ref() {
            debug!(
                session = %sample.session_id,
                time = p.time,
                vertical_vibration = p.vertical_vibration,
                "window closed"
            );
        }
        Ok(point)
    }

    /// Feed an ordered batch for one session.
    ///
    /// Either every sample is applied or none is: a rejected batch leaves the
    /// open window and the last accepted time as they were.
    pub fn ingest_batch(
        &self,
        session_id: &str,
        samples: &[Sample],
    ) -> Result<Vec<HazardPoint>, RmError> {
        self.ingest_batch_then(session_id, samples, |_| Ok(()))
    }

    /// Like [`ingest_batch`](Self::ingest_batch), with `persist` run on the
    /// closed points under the session lock before the new state is kept.
    /// An error from `persist` discards the batch, so the caller can resend it.
    pub fn ingest_batch_then<F>(
        &self,
        session_id: &str,
        samples: &[Sample],
        persist: F,
    ) -> Result<Vec<HazardPoint>, RmError>
    where
        F: FnOnce(&[HazardPoint]) -> Result<(), RmError>,
    {
        let session = self.session(session_id);
        let mut state = session.lock().unwrap_or_else(PoisonError::into_inner);

        let mut last = state.last_time;
        for (index, sample) in samples.iter().enumerate() {
            if sample.session_id != session_id {
                return Err(RmError::invalid(format!(
                    "sample {index} belongs to session '{}', not '{session_id}'",
                    sample.session_id
                )));
            }
            if let Some(previous) = last {
                if sample.time < previous {
                    return Err(RmError::OutOfOrderSample {
                        session: session_id.to_string(),
                        previous,
                        got: sample.time,
                    });
                }
            }
            last = Some(sample.time);
        }

        let mut staged = state.clone();
        let mut points = Vec::new();
        for (index, sample) in samples.iter().enumerate() {
            let closed = staged.apply(sample, &self.config).map_err(|e| match e {
                RmError::InvalidInput(msg) => RmError::invalid(format!("sample {index}: {msg}")),
                other => other,
            })?;
            if let Some(point) = closed {
                points.push(point);
            }
        }
        persist(&points)?;
        *state = staged;

        debug!(
            session = session_id,
            samples = samples.len(),
            points = points.len(),
            "batch ingested"
        );
        Ok(points)
    }

    pub fn pending(&self, session_id: &str) -> Option<PendingCounts> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let session = sessions.get(session_id)?;
        let state = session.lock().unwrap_or_else(PoisonError::into_inner);
        Some(state.window.pending())
    }

    /// Time of the last sample accepted for the session.
    pub fn last_time(&self, session_id: &str) -> Option<i64> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let session = sessions.get(session_id)?;
        let state = session.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_time
    }

    pub fn sessions(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Reprocess recorded raw history: group by session, order by time and run
/// each session's windows from scratch.
pub fn aggregate_history(
    samples: Vec<Sample>,
    config: &WindowConfig,
) -> Result<BTreeMap<String, Vec<HazardPoint>>, RmError> {
    config.validate()?;
    let mut by_session: BTreeMap<String, Vec<Sample>> = BTreeMap::new();
    for sample in samples {
        by_session
            .entry(sample.session_id.clone())
            .or_default()
            .push(sample);
    }

    let mut out = BTreeMap::new();
    for (session_id, mut session_samples) in by_session {
        session_samples.sort_by_key(|s| s.time);
        let mut state = SessionState::default();
        let mut points = Vec::new();
        for sample in &session_samples {
            if let Some(point) = state.apply(sample, config)? {
                points.push(point);
            }
        }
        debug!(
            session = %session_id,
            samples = session_samples.len(),
            points = points.len(),
            "session reprocessed"
        );
        out.insert(session_id, points);
    }
    Ok(out)
}
