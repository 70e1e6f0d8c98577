//! Encoded polyline format at 1e-5 precision
//!
//! Thin layer over the `polyline` crate. Callers work in (lat, lon) pairs;
//! the crate works in `geo_types` coordinates where x is longitude.

use geo_types::LineString;
use thiserror::Error;

const PRECISION: u32 = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolylineError {
    #[error("invalid polyline byte {byte:#x} at {pos}")]
    InvalidByte { byte: u8, pos: usize },
    #[error("polyline codec: {0}")]
    Codec(String),
}

/// Encode (lat, lon) pairs
pub fn encode<I>(coordinates: I) -> Result<String, PolylineError>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let line: LineString<f64> = coordinates.into_iter().map(|(lat, lon)| (lon, lat)).collect();
    polyline::encode_coordinates(line, PRECISION).map_err(|e| PolylineError::Codec(e.to_string()))
}

/// Decode back into (lat, lon) pairs
pub fn decode(encoded: &str) -> Result<Vec<(f64, f64)>, PolylineError> {
    if let Some(pos) = encoded.bytes().position(|b| !(63..=126).contains(&b)) {
        return Err(PolylineError::InvalidByte { byte: encoded.as_bytes()[pos], pos });
    }
    if encoded.is_empty() {
        return Ok(Vec::new());
    }

    let line = polyline::decode_polyline(encoded, PRECISION).map_err(|e| PolylineError::Codec(e.to_string()))?;
    Ok(line.into_iter().map(|c| (c.y, c.x)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_vector() {
        let coords = [(38.5, -120.2), (40.7, -120.95), (43.252, -126.453)];
        assert_eq!(encode(coords).unwrap(), "_p~iF~ps|U_ulLnnqC_mqNvxq`@");
    }

    #[test]
    fn test_round_trip_within_precision() {
        let coords = vec![(48.858_37, 2.294_481), (48.853_1, 2.349_9), (-33.856_78, 151.215_29)];
        let decoded = decode(&encode(coords.iter().copied()).unwrap()).unwrap();
        assert_eq!(decoded.len(), coords.len());
        for (a, b) in coords.iter().zip(decoded.iter()) {
            assert!((a.0 - b.0).abs() <= 1e-5);
            assert!((a.1 - b.1).abs() <= 1e-5);
        }
    }

    #[test]
    fn test_empty() {
        assert_eq!(encode(std::iter::empty()).unwrap(), "");
        assert!(decode("").unwrap().is_empty());
    }

    #[test]
    fn test_reference_decode_order() {
        let decoded = decode("_p~iF~ps|U_ulLnnqC_mqNvxq`@").unwrap();
        assert_eq!(decoded.len(), 3);
        assert!((decoded[0].0 - 38.5).abs() < 1e-9);
        assert!((decoded[0].1 + 120.2).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_bytes_outside_alphabet() {
        assert_eq!(decode("_p~iF ps"), Err(PolylineError::InvalidByte { byte: b' ', pos: 4 }));
    }
}
