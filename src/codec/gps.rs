//! GPS point binary encoding.
//!
//! Latitude/longitude travel as fixed-point fractions of their valid ranges:
//! the 6-byte form spends 24 bits per axis, the 8-byte form 32 bits. The
//! all-zero byte pattern is reserved for "no fix" and round-trips to (0, 0),
//! which the validity check rejects.

const POW2_24: f64 = 16_777_216.0;
const POW2_32: f64 = 4_294_967_296.0;

/// A latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// A point is valid when it is inside the open lat/lon ranges and is not
    /// the (0, 0) "no fix" sentinel.
    pub fn is_valid(&self) -> bool {
        if self.latitude == 0.0 && self.longitude == 0.0 {
            return false;
        }
        self.latitude < 90.0
            && self.latitude > -90.0
            && self.longitude < 180.0
            && self.longitude > -180.0
    }
}

fn lat_to_fixed(lat: f64, scale: f64) -> u32 {
    ((lat - 90.0) * (scale / -180.0)) as u32
}

fn lon_to_fixed(lon: f64, scale: f64) -> u32 {
    ((lon + 180.0) * (scale / 360.0)) as u32
}

/// Encode to the 6-byte (24 bits per axis) form.
pub fn encode_gps6(point: &GpsPoint) -> [u8; 6] {
    let mut buf = [0u8; 6];
    if point.is_valid() {
        let mut lat = lat_to_fixed(point.latitude, POW2_24);
        let mut lon = lon_to_fixed(point.longitude, POW2_24);
        for i in (0..3).rev() {
            buf[i] = (lat & 0xFF) as u8;
            buf[i + 3] = (lon & 0xFF) as u8;
            lat >>= 8;
            lon >>= 8;
        }
    }
    buf
}

/// Decode the 6-byte form.
pub fn decode_gps6(buf: &[u8]) -> GpsPoint {
    let mut lat: u32 = 0;
    let mut lon: u32 = 0;
    for i in 0..3 {
        lat = (lat << 8) | buf[i] as u32;
        lon = (lon << 8) | buf[i + 3] as u32;
    }
    if lat == 0 && lon == 0 {
        GpsPoint::default()
    } else {
        GpsPoint {
            latitude: (lat as f64) * (-180.0 / POW2_24) + 90.0,
            longitude: (lon as f64) * (360.0 / POW2_24) - 180.0,
        }
    }
}

/// Encode to the 8-byte (32 bits per axis) form.
pub fn encode_gps8(point: &GpsPoint) -> [u8; 8] {
    let mut buf = [0u8; 8];
    if point.is_valid() {
        let mut lat = lat_to_fixed(point.latitude, POW2_32);
        let mut lon = lon_to_fixed(point.longitude, POW2_32);
        for i in (0..4).rev() {
            buf[i] = (lat & 0xFF) as u8;
            buf[i + 4] = (lon & 0xFF) as u8;
            lat >>= 8;
            lon >>= 8;
        }
    }
    buf
}

/// Decode the 8-byte form.
pub fn decode_gps8(buf: &[u8]) -> GpsPoint {
    let mut lat: u32 = 0;
    let mut lon: u32 = 0;
    for i in 0..4 {
        lat = (lat << 8) | buf[i] as u32;
        lon = (lon << 8) | buf[i + 4] as u32;
    }
    if lat == 0 && lon == 0 {
        GpsPoint::default()
    } else {
        GpsPoint {
            latitude: (lat as f64) * (-180.0 / POW2_32) + 90.0,
            longitude: (lon as f64) * (360.0 / POW2_32) - 180.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_ERR_6: f64 = 1.25e-5;
    const MAX_ERR_8: f64 = 4.7e-8;

    #[test]
    fn test_gps6_round_trip_error_bound() {
        let points = [
            (39.1234, -142.5678),
            (-45.9999, 0.0001),
            (89.9, 179.9),
            (-89.9, -179.9),
            (0.0001, 0.0001),
        ];
        for &(lat, lon) in &points {
            let p = GpsPoint::new(lat, lon);
            let q = decode_gps6(&encode_gps6(&p));
            assert!(
                (q.latitude - lat).abs() <= MAX_ERR_6,
                "lat {} -> {}",
                lat,
                q.latitude
            );
            assert!(
                (q.longitude - lon).abs() <= MAX_ERR_6,
                "lon {} -> {}",
                lon,
                q.longitude
            );
        }
    }

    #[test]
    fn test_gps8_round_trip_error_bound() {
        let points = [(37.7749, -122.4194), (51.5007, -0.1246), (-33.8568, 151.2153)];
        for &(lat, lon) in &points {
            let p = GpsPoint::new(lat, lon);
            let q = decode_gps8(&encode_gps8(&p));
            assert!((q.latitude - lat).abs() <= MAX_ERR_8);
            assert!((q.longitude - lon).abs() <= MAX_ERR_8);
        }
    }

    #[test]
    fn test_origin_is_invalid_and_encodes_to_zeros() {
        let origin = GpsPoint::new(0.0, 0.0);
        assert!(!origin.is_valid());
        assert_eq!(encode_gps6(&origin), [0u8; 6]);
        assert_eq!(encode_gps8(&origin), [0u8; 8]);
        assert_eq!(decode_gps6(&[0u8; 6]), GpsPoint::default());
        assert_eq!(decode_gps8(&[0u8; 8]), GpsPoint::default());
    }

    #[test]
    fn test_out_of_range_encodes_to_zeros() {
        let p = GpsPoint::new(91.0, 10.0);
        assert!(!p.is_valid());
        assert_eq!(encode_gps6(&p), [0u8; 6]);
    }
}
