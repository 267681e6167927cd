//! Numeric reductions used when closing a sensor window.

use std::str::FromStr;

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use crate::RmError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReduceMode {
    Mean,
    Max,
}

impl FromStr for ReduceMode {
    type Err = RmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean" => Ok(ReduceMode::Mean),
            "max" => Ok(ReduceMode::Max),
            other => Err(RmError::invalid(format!(
                "unknown reduce mode '{other}', expected 'mean' or 'max'"
            ))),
        }
    }
}

/// Root mean square of `values`; an empty slice yields 0.
pub fn root_mean_square(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let view = ArrayView1::from(values);
    view.mapv(|v| v * v).mean().unwrap_or(0.0).sqrt()
}

pub fn reduce(values: &[f64], mode: ReduceMode) -> Result<f64, RmError> {
    if values.is_empty() {
        return Err(RmError::invalid("cannot reduce an empty sequence"));
    }
    let view = ArrayView1::from(values);
    match mode {
        ReduceMode::Mean => view
            .mean()
            .ok_or_else(|| RmError::invalid("cannot reduce an empty sequence")),
        ReduceMode::Max => Ok(view.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v))),
    }
}

/// Min-max normalization, folded to a non-negative value.
pub fn normalize(value: f64, min: f64, max: f64) -> Result<f64, RmError> {
    if min == max {
        return Err(RmError::invalid(format!(
            "normalization range is degenerate (min == max == {min})"
        )));
    }
    if !(value.is_finite() && min.is_finite() && max.is_finite()) {
        return Err(RmError::invalid("normalization inputs must be finite"));
    }
    Ok(((value - min) / (max - min)).abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_empty_is_zero() {
        assert_eq!(root_mean_square(&[]), 0.0);
    }

    #[test]
    fn rms_of_three_four() {
        let rms = root_mean_square(&[3.0, 4.0]);
        assert!((rms - (12.5_f64).sqrt()).abs() < 1e-12);
        assert!((rms - 3.535_533_9).abs() < 1e-6);
    }

    #[test]
    fn rms_ignores_sign() {
        assert_eq!(root_mean_square(&[-2.0, 2.0]), 2.0);
    }

    #[test]
    fn reduce_modes() {
        let data = [1.0, 5.0, 3.0];
        assert_eq!(reduce(&data, ReduceMode::Mean).unwrap(), 3.0);
        assert_eq!(reduce(&data, ReduceMode::Max).unwrap(), 5.0);
        assert!(matches!(
            reduce(&[], ReduceMode::Mean),
            Err(RmError::InvalidInput(_))
        ));
        assert!(matches!(
            reduce(&[], ReduceMode::Max),
            Err(RmError::InvalidInput(_))
        ));
    }

    #[test]
    fn reduce_mode_parsing() {
        assert_eq!("mean".parse::<ReduceMode>().unwrap(), ReduceMode::Mean);
        assert_eq!(" MAX ".parse::<ReduceMode>().unwrap(), ReduceMode::Max);
        assert!(matches!(
            "median".parse::<ReduceMode>(),
            Err(RmError::InvalidInput(_))
        ));
    }

    #[test]
    fn normalize_midpoint_and_sign() {
        assert_eq!(normalize(15.0, 0.0, 30.0).unwrap(), 0.5);
        // dBFS readings are negative; the result is folded to a magnitude.
        assert_eq!(normalize(-15.0, 0.0, 30.0).unwrap(), 0.5);
    }

    #[test]
    fn normalize_rejects_degenerate_range() {
        for (v, m) in [(0.0, 0.0), (12.0, 3.5), (-4.0, -4.0)] {
            assert!(matches!(normalize(v, m, m), Err(RmError::InvalidInput(_))));
        }
    }
}
