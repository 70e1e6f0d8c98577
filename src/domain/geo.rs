//! Geometry helpers on WGS84 coordinates
//!
//! Distances use the haversine formula on a spherical earth. Short-range
//! work (perpendicular distances, interpolation) uses a local
//! equirectangular projection around a reference latitude.

/// Mean earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude (and of longitude at the equator)
pub const METERS_PER_DEG: f64 = 111_320.0;

/// Great-circle distance in meters
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Initial bearing from point 1 to point 2, in degrees [0, 360)
pub fn bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let y = dlon.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlon.cos();
    normalize_deg(y.atan2(x).to_degrees())
}

/// Wrap an angle into [0, 360)
#[inline]
pub fn normalize_deg(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Smallest absolute difference between two bearings, in [0, 180]
#[inline]
pub fn bearing_delta_deg(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(360.0);
    if diff > 180.0 {
        360.0 - diff
    } else {
        diff
    }
}

/// True for finite coordinates within |lat| <= 90 and |lon| <= 180
#[inline]
pub fn is_valid_coordinate(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && lat.abs() <= 90.0 && lon.abs() <= 180.0
}

/// Clamp a possibly invalid coordinate into the representable range.
/// Non-finite components become 0.
pub fn clamp_coordinate(lat: f64, lon: f64) -> (f64, f64) {
    let lat = if lat.is_finite() { lat.clamp(-90.0, 90.0) } else { 0.0 };
    let lon = if lon.is_finite() { lon.clamp(-180.0, 180.0) } else { 0.0 };
    (lat, lon)
}

/// Meters per degree of longitude at the given latitude
#[inline]
pub fn meters_per_deg_lon(lat: f64) -> f64 {
    (METERS_PER_DEG * lat.to_radians().cos()).max(1e-6)
}

/// Project (lat, lon) to local planar meters around a reference latitude
#[inline]
pub fn to_local_m(lat: f64, lon: f64, ref_lat: f64) -> (f64, f64) {
    (lon * meters_per_deg_lon(ref_lat), lat * METERS_PER_DEG)
}

/// Distance in meters from a point to the segment [start, end]
pub fn perpendicular_distance_m(
    point: (f64, f64),
    start: (f64, f64),
    end: (f64, f64),
) -> f64 {
    let ref_lat = (start.0 + end.0) / 2.0;
    let (px, py) = to_local_m(point.0, point.1, ref_lat);
    let (ax, ay) = to_local_m(start.0, start.1, ref_lat);
    let (bx, by) = to_local_m(end.0, end.1, ref_lat);

    let dx = bx - ax;
    let dy = by - ay;
    let len_sq = dx * dx + dy * dy;
    if len_sq < f64::EPSILON {
        return ((px - ax).powi(2) + (py - ay).powi(2)).sqrt();
    }

    let t = (((px - ax) * dx + (py - ay) * dy) / len_sq).clamp(0.0, 1.0);
    let cx = ax + t * dx;
    let cy = ay + t * dy;
    ((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
}

/// Linear interpolation between two coordinates, `t` in [0, 1]
#[inline]
pub fn lerp_coordinate(from: (f64, f64), to: (f64, f64), t: f64) -> (f64, f64) {
    (from.0 + (to.0 - from.0) * t, from.1 + (to.1 - from.1) * t)
}

/// Offset a coordinate by the given meters north and east. Used to build
/// traces in tests and replays.
pub fn offset_m(lat: f64, lon: f64, north_m: f64, east_m: f64) -> (f64, f64) {
    (lat + north_m / METERS_PER_DEG, lon + east_m / meters_per_deg_lon(lat))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // One degree of latitude is ~111.2 km on a 6371 km sphere
        let d = haversine_m(0.0, 0.0, 1.0, 0.0);
        assert!((d - 111_194.9).abs() < 1.0, "got {d}");
        assert_eq!(haversine_m(48.0, 2.0, 48.0, 2.0), 0.0);
    }

    #[test]
    fn test_offset_matches_haversine() {
        let (lat, lon) = offset_m(48.0, 2.0, 100.0, 0.0);
        let d = haversine_m(48.0, 2.0, lat, lon);
        assert!((d - 100.0).abs() < 0.5, "got {d}");

        let (lat, lon) = offset_m(48.0, 2.0, 0.0, 100.0);
        let d = haversine_m(48.0, 2.0, lat, lon);
        assert!((d - 100.0).abs() < 0.5, "got {d}");
    }

    #[test]
    fn test_bearing_cardinal_directions() {
        assert!((bearing_deg(0.0, 0.0, 1.0, 0.0) - 0.0).abs() < 1e-6);
        assert!((bearing_deg(0.0, 0.0, 0.0, 1.0) - 90.0).abs() < 1e-6);
        assert!((bearing_deg(0.0, 0.0, -1.0, 0.0) - 180.0).abs() < 1e-6);
        assert!((bearing_deg(0.0, 0.0, 0.0, -1.0) - 270.0).abs() < 1e-6);
    }

    #[test]
    fn test_bearing_delta_wraparound() {
        assert!((bearing_delta_deg(350.0, 10.0) - 20.0).abs() < 1e-9);
        assert!((bearing_delta_deg(10.0, 350.0) - 20.0).abs() < 1e-9);
        assert!((bearing_delta_deg(0.0, 180.0) - 180.0).abs() < 1e-9);
        assert!((bearing_delta_deg(90.0, 90.0)).abs() < 1e-9);
    }

    #[test]
    fn test_coordinate_validity() {
        assert!(is_valid_coordinate(90.0, -180.0));
        assert!(!is_valid_coordinate(90.1, 0.0));
        assert!(!is_valid_coordinate(0.0, 180.5));
        assert!(!is_valid_coordinate(f64::NAN, 0.0));
        assert_eq!(clamp_coordinate(120.0, -200.0), (90.0, -180.0));
        assert_eq!(clamp_coordinate(f64::NAN, 10.0), (0.0, 10.0));
    }

    #[test]
    fn test_perpendicular_distance() {
        let start = (48.0, 2.0);
        let end = offset_m(48.0, 2.0, 0.0, 100.0);
        let mid = offset_m(48.0, 2.0, 10.0, 50.0);
        let d = perpendicular_distance_m(mid, start, end);
        assert!((d - 10.0).abs() < 0.1, "got {d}");

        // Degenerate segment falls back to point distance
        let d = perpendicular_distance_m(mid, start, start);
        assert!(d > 50.0);
    }
}
