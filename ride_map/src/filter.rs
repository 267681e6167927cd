//! Comparison predicates over hazard point scores.
//!
//! On the wire a filter is an object keyed by field with comparison bounds,
//! e.g. `{"verticalVibration": {"gt": 1.0, "lte": 1.6}}`. The mongo-style
//! `$gt`/`$lte` spellings and the legacy `zVibration` key are accepted too.

use serde::{Deserialize, Serialize};

use crate::window::HazardPoint;
use crate::RmError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    VerticalVibration,
    Microphone,
}

impl Field {
    /// `None` when the point carries no value for this field.
    pub fn read(self, point: &HazardPoint) -> Option<f64> {
        match self {
            Field::VerticalVibration => Some(point.vertical_vibration),
            Field::Microphone => point.microphone,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CompareOp::Gt => lhs > rhs,
            CompareOp::Gte => lhs >= rhs,
            CompareOp::Lt => lhs < rhs,
            CompareOp::Lte => lhs <= rhs,
        }
    }

    fn is_lower(self) -> bool {
        matches!(self, CompareOp::Gt | CompareOp::Gte)
    }

    fn is_exclusive(self) -> bool {
        matches!(self, CompareOp::Gt | CompareOp::Lt)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct Comparison {
    pub field: Field,
    pub op: CompareOp,
    pub value: f64,
}

impl Comparison {
    pub fn new(field: Field, op: CompareOp, value: f64) -> Result<Self, RmError> {
        if !value.is_finite() {
            return Err(RmError::invalid(format!(
                "comparison value for {field:?} must be finite, got {value}"
            )));
        }
        Ok(Self { field, op, value })
    }

    pub fn matches(&self, point: &HazardPoint) -> bool {
        self.field
            .read(point)
            .is_some_and(|v| self.op.holds(v, self.value))
    }
}

/// Conjunction of comparisons; the empty filter matches every point.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RangeFilterWire", into = "RangeFilterWire")]
pub struct RangeFilter {
    comparisons: Vec<Comparison>,
}

impl RangeFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Add a bound, rejecting a second lower or upper bound on the same field
    /// and bounds that leave an empty interval.
    pub fn with(mut self, field: Field, op: CompareOp, value: f64) -> Result<Self, RmError> {
        let cmp = Comparison::new(field, op, value)?;
        for existing in self.comparisons.iter().filter(|c| c.field == field) {
            if existing.op.is_lower() == op.is_lower() {
                return Err(RmError::invalid(format!(
                    "{field:?} has more than one {} bound",
                    if op.is_lower() { "lower" } else { "upper" }
                )));
            }
            let (lower, upper) = if op.is_lower() {
                (cmp, *existing)
            } else {
                (*existing, cmp)
            };
            let empty = lower.value > upper.value
                || (lower.value == upper.value
                    && (lower.op.is_exclusive() || upper.op.is_exclusive()));
            if empty {
                return Err(RmError::invalid(format!(
                    "{field:?} range {:?} {} / {:?} {} is empty",
                    lower.op, lower.value, upper.op, upper.value
                )));
            }
        }
        self.comparisons.push(cmp);
        Ok(self)
    }

    pub fn comparisons(&self) -> &[Comparison] {
        &self.comparisons
    }

    pub fn matches(&self, point: &HazardPoint) -> bool {
        self.comparisons.iter().all(|c| c.matches(point))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct BoundsWire {
    #[serde(default, alias = "$gt", skip_serializing_if = "Option::is_none")]
    gt: Option<f64>,
    #[serde(default, alias = "$gte", skip_serializing_if = "Option::is_none")]
    gte: Option<f64>,
    #[serde(default, alias = "$lt", skip_serializing_if = "Option::is_none")]
    lt: Option<f64>,
    #[serde(default, alias = "$lte", skip_serializing_if = "Option::is_none")]
    lte: Option<f64>,
}

impl BoundsWire {
    fn entries(&self) -> impl Iterator<Item = (CompareOp, f64)> {
        [
            (CompareOp::Gt, self.gt),
            (CompareOp::Gte, self.gte),
            (CompareOp::Lt, self.lt),
            (CompareOp::Lte, self.lte),
        ]
        .into_iter()
        .filter_map(|(op, v)| v.map(|v| (op, v)))
    }

    fn set(&mut self, op: CompareOp, value: f64) {
        let slot = match op {
            CompareOp::Gt => &mut self.gt,
            CompareOp::Gte => &mut self.gte,
            CompareOp::Lt => &mut self.lt,
            CompareOp::Lte => &mut self.lte,
        };
        *slot = Some(value);
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RangeFilterWire {
    #[serde(
        default,
        rename = "verticalVibration",
        alias = "zVibration",
        skip_serializing_if = "Option::is_none"
    )]
    vertical_vibration: Option<BoundsWire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    microphone: Option<BoundsWire>,
}

impl TryFrom<RangeFilterWire> for RangeFilter {
    type Error = RmError;

    fn try_from(wire: RangeFilterWire) -> Result<Self, Self::Error> {
        let mut filter = RangeFilter::all();
        let fields = [
            (Field::VerticalVibration, wire.vertical_vibration),
            (Field::Microphone, wire.microphone),
        ];
        for (field, bounds) in fields {
            if let Some(bounds) = bounds {
                for (op, value) in bounds.entries() {
                    filter = filter.with(field, op, value)?;
                }
            }
        }
        Ok(filter)
    }
}

impl From<RangeFilter> for RangeFilterWire {
    fn from(filter: RangeFilter) -> Self {
        let mut wire = RangeFilterWire::default();
        for cmp in filter.comparisons {
            let slot = match cmp.field {
                Field::VerticalVibration => &mut wire.vertical_vibration,
                Field::Microphone => &mut wire.microphone,
            };
            slot.get_or_insert_with(BoundsWire::default)
                .set(cmp.op, cmp.value);
        }
        wire
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn point(vv: f64, mic: Option<f64>) -> HazardPoint {
        HazardPoint {
            latitude: 35.0,
            longitude: 139.0,
            time: 0,
            vertical_vibration: vv,
            vibration: None,
            microphone: mic,
        }
    }

    #[test]
    fn parses_the_client_range_payload() {
        let filter: RangeFilter =
            serde_json::from_value(json!({ "verticalVibration": { "gt": 1.0, "lte": 1.6 } }))
                .unwrap();
        assert_eq!(filter.comparisons().len(), 2);
        assert!(!filter.matches(&point(1.0, None)));
        assert!(filter.matches(&point(1.000_1, None)));
        assert!(filter.matches(&point(1.6, None)));
        assert!(!filter.matches(&point(1.600_1, None)));
    }

    #[test]
    fn accepts_legacy_spellings() {
        let filter: RangeFilter =
            serde_json::from_value(json!({ "zVibration": { "$gt": 1.6, "$lte": 2.5 } })).unwrap();
        assert!(filter.matches(&point(2.0, None)));
        assert!(!filter.matches(&point(1.6, None)));
    }

    #[test]
    fn rejects_malformed_filters() {
        let bad = [
            json!({ "verticalVibration": { "gt": 1.0, "gte": 1.0 } }),
            json!({ "verticalVibration": { "gt": 2.0, "lte": 1.0 } }),
            json!({ "verticalVibration": { "gt": 1.0, "lt": 1.0 } }),
            json!({ "verticalVibration": { "between": [1, 2] } }),
            json!({ "speed": { "gt": 1.0 } }),
            json!({ "verticalVibration": { "gt": "high" } }),
        ];
        for payload in bad {
            assert!(
                serde_json::from_value::<RangeFilter>(payload.clone()).is_err(),
                "accepted {payload}"
            );
        }
        assert!(RangeFilter::all()
            .with(Field::Microphone, CompareOp::Gt, f64::NAN)
            .is_err());
    }

    #[test]
    fn equal_inclusive_bounds_are_a_point_interval() {
        let filter = RangeFilter::all()
            .with(Field::VerticalVibration, CompareOp::Gte, 1.0)
            .unwrap()
            .with(Field::VerticalVibration, CompareOp::Lte, 1.0)
            .unwrap();
        assert!(filter.matches(&point(1.0, None)));
    }

    #[test]
    fn microphone_bounds_skip_points_without_sound() {
        let filter = RangeFilter::all()
            .with(Field::Microphone, CompareOp::Gte, 0.0)
            .unwrap();
        assert!(filter.matches(&point(0.0, Some(0.3))));
        assert!(!filter.matches(&point(0.0, None)));
    }

    #[test]
    fn empty_filter_matches_everything_and_serializes_to_empty_object() {
        let filter: RangeFilter = serde_json::from_value(json!({})).unwrap();
        assert!(filter.matches(&point(0.0, None)));
        assert_eq!(serde_json::to_value(&filter).unwrap(), json!({}));
    }

    #[test]
    fn serializes_in_wire_form() {
        let filter = RangeFilter::all()
            .with(Field::VerticalVibration, CompareOp::Gt, 2.5)
            .unwrap();
        assert_eq!(
            serde_json::to_value(&filter).unwrap(),
            json!({ "verticalVibration": { "gt": 2.5 } })
        );
    }
}
