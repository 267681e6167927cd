//! Sensor samples and the ingestion wire format.
//!
//! Clients post `{"sessionId": ..., "payload": [{"name", "time", "values"}]}`
//! with millisecond timestamps; [`IngestBatch::into_samples`] validates each
//! entry and produces typed [`Sample`]s with whole-second times.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::geo::LatLng;
use crate::RmError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    Accelerometer,
    Microphone,
    Location,
}

impl std::fmt::Display for SampleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SampleKind::Accelerometer => "accelerometer",
            SampleKind::Microphone => "microphone",
            SampleKind::Location => "location",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "name", content = "values", rename_all = "lowercase")]
pub enum Reading {
    Accelerometer {
        x: f64,
        y: f64,
        z: f64,
    },
    Microphone {
        #[serde(rename = "dBFS")]
        dbfs: f64,
    },
    Location(LatLng),
}

impl Reading {
    pub fn kind(&self) -> SampleKind {
        match self {
            Reading::Accelerometer { .. } => SampleKind::Accelerometer,
            Reading::Microphone { .. } => SampleKind::Microphone,
            Reading::Location(_) => SampleKind::Location,
        }
    }

    fn validate(&self) -> Result<(), RmError> {
        match self {
            Reading::Accelerometer { x, y, z } => {
                if [x, y, z].iter().all(|v| v.is_finite()) {
                    Ok(())
                } else {
                    Err(RmError::invalid("accelerometer values must be finite"))
                }
            }
            Reading::Microphone { dbfs } => {
                if dbfs.is_finite() {
                    Ok(())
                } else {
                    Err(RmError::invalid("microphone dBFS must be finite"))
                }
            }
            Reading::Location(fix) => fix.validate(),
        }
    }
}

/// One immutable sensor reading; `time` is in whole seconds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub session_id: String,
    pub time: i64,
    pub reading: Reading,
}

impl Sample {
    pub fn new(session_id: impl Into<String>, time: i64, reading: Reading) -> Result<Self, RmError> {
        let session_id = session_id.into();
        if session_id.trim().is_empty() {
            return Err(RmError::invalid("sessionId must not be empty"));
        }
        if time < 0 {
            return Err(RmError::invalid(format!("sample time {time} is negative")));
        }
        reading.validate()?;
        Ok(Self {
            session_id,
            time,
            reading,
        })
    }

    pub fn kind(&self) -> SampleKind {
        self.reading.kind()
    }
}

#[derive(Deserialize)]
struct AccelerometerValues {
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Deserialize)]
struct MicrophoneValues {
    #[serde(rename = "dBFS")]
    dbfs: f64,
}

/// One payload entry as sent by the recording client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireEntry {
    pub name: SampleKind,
    /// Milliseconds since epoch.
    pub time: i64,
    pub values: JsonValue,
}

impl WireEntry {
    fn into_reading(self) -> Result<Reading, serde_json::Error> {
        Ok(match self.name {
            SampleKind::Accelerometer => {
                let v: AccelerometerValues = serde_json::from_value(self.values)?;
                Reading::Accelerometer {
                    x: v.x,
                    y: v.y,
                    z: v.z,
                }
            }
            SampleKind::Microphone => {
                let v: MicrophoneValues = serde_json::from_value(self.values)?;
                Reading::Microphone { dbfs: v.dbfs }
            }
            SampleKind::Location => Reading::Location(serde_json::from_value(self.values)?),
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestBatch {
    pub session_id: String,
    pub payload: Vec<WireEntry>,
}

impl IngestBatch {
    /// Validate every entry and convert to samples, preserving arrival order.
    pub fn into_samples(self) -> Result<Vec<Sample>, RmError> {
        let session_id = self.session_id;
        self.payload
            .into_iter()
            .enumerate()
            .map(|(index, entry)| {
                let kind = entry.name;
                if entry.time < 0 {
                    return Err(RmError::invalid(format!(
                        "payload[{index}]: time {} is negative",
                        entry.time
                    )));
                }
                let time = entry.time.div_euclid(1000);
                let reading = entry.into_reading().map_err(|e| {
                    RmError::invalid(format!("payload[{index}]: malformed {kind} values: {e}"))
                })?;
                Sample::new(session_id.clone(), time, reading)
                    .map_err(|e| RmError::invalid(format!("payload[{index}]: {e}")))
            })
            .collect()
    }
}
