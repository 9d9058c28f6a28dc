//! UTM coordinates and the inverse projection used by the WMS backend.

use serde::{Deserialize, Serialize};

/// WGS-84 equatorial radius, meters.
const WGS84_A: f64 = 6_378_137.0;
/// WGS-84 first eccentricity squared.
const WGS84_ECC_SQUARED: f64 = 0.006_694_38;
/// UTM central meridian scale factor.
const K0: f64 = 0.9996;
/// UTM false easting.
const FALSE_EASTING: f64 = 500_000.0;

/// A northern-hemisphere UTM position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UtmPoint {
    /// Meters east, including the 500 km false easting.
    pub easting: f64,
    /// Meters north of the equator.
    pub northing: f64,
    /// UTM zone, 1 through 60.
    pub zone: i8,
}

impl UtmPoint {
    pub const fn new(easting: f64, northing: f64, zone: i8) -> Self {
        Self { easting, northing, zone }
    }

    /// Shift by the given offsets in meters.
    pub fn offset(&self, east: f64, north: f64) -> Self {
        Self::new(self.easting + east, self.northing + north, self.zone)
    }
}

/// Convert a UTM position to WGS-84 `(latitude, longitude)` in degrees.
pub fn utm_to_lat_long(p: &UtmPoint) -> (f64, f64) {
    let ecc2 = WGS84_ECC_SQUARED;
    let one_minus_ecc2 = 1.0 - ecc2;
    let ecc_prime2 = ecc2 / one_minus_ecc2;
    let root = one_minus_ecc2.sqrt();
    let e1 = (1.0 - root) / (1.0 + root);
    let e1e1 = e1 * e1;

    let mu_den = 1.0 - ecc2 / 4.0 * (1.0 + ecc2 / 16.0 * (3.0 + 5.0 * ecc2 / 4.0));
    let mu = p.northing / K0 / WGS84_A / mu_den;

    // Footpoint latitude.
    let phi1 = mu
        + e1 / 2.0
            * (3.0 * (1.0 - 9.0 * e1e1 / 16.0) * (2.0 * mu).sin()
                + e1 / 8.0
                    * ((21.0 - 55.0 * e1e1 / 2.0) * (4.0 * mu).sin()
                        + 151.0 * e1 / 6.0 * (6.0 * mu).sin()));
    let (sp1, cp1) = phi1.sin_cos();
    let tp1 = sp1 / cp1;

    let w = 1.0 - ecc2 * sp1 * sp1;
    let n1 = WGS84_A / w.sqrt();
    let t1 = tp1 * tp1;
    let c1 = ecc_prime2 * cp1 * cp1;
    let r1 = one_minus_ecc2 * n1 / w;

    let d = (p.easting - FALSE_EASTING) / n1 / K0;
    let dd = d * d;

    let lat = phi1
        - n1 * tp1 / r1
            * dd
            / 2.0
            * (1.0
                - dd / 12.0
                    * (5.0 + 3.0 * t1 + (5.0 - 2.0 * c1) * 2.0 * c1 - 9.0 * ecc_prime2
                        + dd / 30.0
                            * (61.0 + (2.0 + t1) * 45.0 * t1 - 252.0 * ecc_prime2
                                + (99.0 - c1) * 3.0 * c1)));

    let central_meridian = (f64::from(p.zone) - 0.5) * 6.0 - 180.0;
    let lon = central_meridian
        + (d / cp1
            * (1.0
                - dd / 6.0
                    * (1.0 + 2.0 * t1 + c1
                        - dd / 20.0
                            * (5.0 - (2.0 + 3.0 * c1) * c1
                                + 8.0 * ecc_prime2
                                + (7.0 + 6.0 * t1) * 4.0 * t1))))
            .to_degrees();

    (lat.to_degrees(), lon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equator_on_central_meridian() {
        let (lat, lon) = utm_to_lat_long(&UtmPoint::new(500_000.0, 0.0, 12));
        assert!(lat.abs() < 1e-9);
        assert!((lon - (-111.0)).abs() < 1e-9);
    }

    #[test]
    fn test_one_degree_north() {
        // One degree of latitude is about 110.574 km at the equator.
        let (lat, lon) = utm_to_lat_long(&UtmPoint::new(500_000.0, 110_574.0 * K0, 31));
        assert!((lat - 1.0).abs() < 0.01, "lat = {}", lat);
        assert!((lon - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_east_of_center_increases_longitude() {
        let center = utm_to_lat_long(&UtmPoint::new(500_000.0, 3_500_000.0, 12));
        let east = utm_to_lat_long(&UtmPoint::new(560_000.0, 3_500_000.0, 12));
        assert!(east.1 > center.1);
        // Roughly 0.63 degrees of longitude per 60 km near 31.6N.
        assert!((east.1 - center.1 - 0.63).abs() < 0.02, "dlon = {}", east.1 - center.1);
    }
}
