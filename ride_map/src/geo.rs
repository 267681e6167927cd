use serde::{Deserialize, Serialize};

use crate::RmError;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct LatLng {
    pub latitude: f64,
    pub longitude: f64,
}

impl LatLng {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn validate(&self) -> Result<(), RmError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(RmError::invalid(format!(
                "latitude {} outside [-90, 90]",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(RmError::invalid(format!(
                "longitude {} outside [-180, 180]",
                self.longitude
            )));
        }
        Ok(())
    }
}

/// Great-circle distance in metres.
pub fn haversine_distance(a: LatLng, b: LatLng) -> f64 {
    let to_rad = |deg: f64| deg.to_radians();
    let dlat = to_rad(b.latitude - a.latitude);
    let dlon = to_rad(b.longitude - a.longitude);
    let h = (dlat / 2.0).sin().powi(2)
        + to_rad(a.latitude).cos() * to_rad(b.latitude).cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Initial compass bearing from `a` to `b`, degrees in `[0, 360)`.
pub fn bearing(a: LatLng, b: LatLng) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();
    let y = dlon.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlon.cos();
    let deg = y.atan2(x).to_degrees().rem_euclid(360.0);
    if deg >= 360.0 {
        0.0
    } else {
        deg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_degree_of_longitude_at_equator() {
        let dist = haversine_distance(LatLng::new(0.0, 0.0), LatLng::new(0.0, 1.0));
        assert!((dist - 111_195.0).abs() < 200.0);
    }

    #[test]
    fn distance_to_self_is_zero() {
        let p = LatLng::new(35.654_732, 139.797_082);
        assert_eq!(haversine_distance(p, p), 0.0);
    }

    #[test]
    fn distance_is_symmetric_and_obeys_triangle_inequality() {
        let a = LatLng::new(35.6895, 139.6917);
        let b = LatLng::new(34.6937, 135.5023);
        let c = LatLng::new(43.0621, 141.3544);
        let ab = haversine_distance(a, b);
        let ba = haversine_distance(b, a);
        assert!((ab - ba).abs() < 1e-6);
        let ac = haversine_distance(a, c);
        let cb = haversine_distance(c, b);
        assert!(ab <= ac + cb + 1e-6);
        assert!(ac <= ab + haversine_distance(b, c) + 1e-6);
    }

    #[test]
    fn cardinal_bearings() {
        let origin = LatLng::new(0.0, 0.0);
        assert!(bearing(origin, LatLng::new(1.0, 0.0)).abs() < 1e-9);
        assert!((bearing(origin, LatLng::new(0.0, 1.0)) - 90.0).abs() < 1e-9);
        assert!((bearing(origin, LatLng::new(-1.0, 0.0)) - 180.0).abs() < 1e-9);
        assert!((bearing(origin, LatLng::new(0.0, -1.0)) - 270.0).abs() < 1e-9);
    }

    #[test]
    fn bearing_stays_in_range() {
        let a = LatLng::new(35.0, 139.0);
        for (lat, lng) in [(35.0, 138.999_999_9), (34.0, 139.0), (36.0, 140.0)] {
            let deg = bearing(a, LatLng::new(lat, lng));
            assert!((0.0..360.0).contains(&deg), "bearing {deg} out of range");
        }
    }

    #[test]
    fn validation_rejects_out_of_range() {
        assert!(LatLng::new(35.0, 139.0).validate().is_ok());
        assert!(LatLng::new(91.0, 0.0).validate().is_err());
        assert!(LatLng::new(0.0, -181.0).validate().is_err());
        assert!(LatLng::new(f64::NAN, 0.0).validate().is_err());
    }
}
