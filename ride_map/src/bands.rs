//! Severity bands over vertical vibration.
//!
//! A band is a half-open interval `(above, up_to]`; either end may be open.
//! Classification happens at query time, so the table can change without
//! touching stored points.

use serde::{Deserialize, Serialize};

use crate::filter::{CompareOp, Field, RangeFilter};
use crate::store::{HazardStore, PointIter};
use crate::RmError;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeverityBand {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub above: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_to: Option<f64>,
}

impl SeverityBand {
    pub fn new(name: &str, above: Option<f64>, up_to: Option<f64>) -> Self {
        Self {
            name: name.to_string(),
            above,
            up_to,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        self.above.map_or(true, |lo| value > lo) && self.up_to.map_or(true, |hi| value <= hi)
    }

    pub fn filter(&self) -> Result<RangeFilter, RmError> {
        let mut filter = RangeFilter::all();
        if let Some(lo) = self.above {
            filter = filter.with(Field::VerticalVibration, CompareOp::Gt, lo)?;
        }
        if let Some(hi) = self.up_to {
            filter = filter.with(Field::VerticalVibration, CompareOp::Lte, hi)?;
        }
        Ok(filter)
    }
}

impl std::fmt::Display for SeverityBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lo = self.above.map_or("-inf".to_string(), |v| v.to_string());
        match self.up_to {
            Some(hi) => write!(f, "{} ({lo}, {hi}]", self.name),
            None => write!(f, "{} ({lo}, inf)", self.name),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct BandTable {
    bands: Vec<SeverityBand>,
}

impl Default for BandTable {
    fn default() -> Self {
        Self {
            bands: vec![
                SeverityBand::new("not-uncomfortable", None, Some(0.315)),
                SeverityBand::new("little-uncomfortable", Some(0.315), Some(0.63)),
                SeverityBand::new("fairly-uncomfortable", Some(0.63), Some(1.0)),
                SeverityBand::new("uncomfortable", Some(1.0), Some(1.6)),
                SeverityBand::new("very-uncomfortable", Some(1.6), Some(2.5)),
                SeverityBand::new("extremely-uncomfortable", Some(2.5), None),
            ],
        }
    }
}

impl BandTable {
    pub fn new(bands: Vec<SeverityBand>) -> Result<Self, RmError> {
        let table = Self { bands };
        table.validate()?;
        Ok(table)
    }

    /// Names must be unique and every interval non-empty. Overlap between
    /// bands is allowed.
    pub fn validate(&self) -> Result<(), RmError> {
        for (i, band) in self.bands.iter().enumerate() {
            if band.name.trim().is_empty() {
                return Err(RmError::Config(format!("band {i} has an empty name")));
            }
            if self.bands[..i].iter().any(|b| b.name == band.name) {
                return Err(RmError::Config(format!("duplicate band '{}'", band.name)));
            }
            band.filter()
                .map_err(|e| RmError::Config(format!("band '{}': {e}", band.name)))?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&SeverityBand> {
        self.bands.iter().find(|b| b.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SeverityBand> {
        self.bands.iter()
    }

    pub fn classify(&self, name: &str) -> Result<RangeFilter, RmError> {
        self.get(name)
            .ok_or_else(|| RmError::invalid(format!("unknown severity band '{name}'")))?
            .filter()
    }

    /// Every band containing `value`, in table order.
    pub fn band_of(&self, value: f64) -> Vec<&str> {
        self.bands
            .iter()
            .filter(|b| b.contains(value))
            .map(|b| b.name.as_str())
            .collect()
    }
}

pub fn points_in_band<'a>(
    store: &'a dyn HazardStore,
    table: &BandTable,
    name: &str,
) -> Result<PointIter<'a>, RmError> {
    let filter = table.classify(name)?;
    store.query(&filter)
}
