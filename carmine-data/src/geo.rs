//! Geospatial primitives: the 52-bit interleaved coordinate encoding, great
//! circle distance, and the coarse cell windows a radius query scans before
//! exact filtering.
//!
//! Coordinates are normalized against the Mercator-safe latitude band and
//! quantized to 26 bits per axis; latitude occupies the even bit positions,
//! longitude the odd ones. The resulting integer is stored as the score of
//! an ordinary sorted set, so every geo command is a sorted-set command
//! underneath.

use carmine_errors::{CarmineError, CarmineResult};

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub const LAT_MIN: f64 = -85.05112878;
pub const LAT_MAX: f64 = 85.05112878;
pub const LON_MIN: f64 = -180.0;
pub const LON_MAX: f64 = 180.0;

/// Quantization bits per axis; 2 × 26 = 52 bits total, exactly
/// representable in an f64 score.
const STEP: u32 = 26;

/// Mercator circumference bound used by the radius→step estimate.
const MERCATOR_MAX: f64 = 20_037_726.37;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Meters,
    Kilometers,
    Miles,
    Feet,
}

impl Unit {
    pub fn parse(input: &[u8]) -> CarmineResult<Self> {
        match input.to_ascii_lowercase().as_slice() {
            b"m" => Ok(Unit::Meters),
            b"km" => Ok(Unit::Kilometers),
            b"mi" => Ok(Unit::Miles),
            b"ft" => Ok(Unit::Feet),
            _ => Err(CarmineError::InvalidGeoUnit),
        }
    }

    pub fn to_meters(self, value: f64) -> f64 {
        value * self.meters_per_unit()
    }

    pub fn from_meters(self, meters: f64) -> f64 {
        meters / self.meters_per_unit()
    }

    fn meters_per_unit(self) -> f64 {
        match self {
            Unit::Meters => 1.0,
            Unit::Kilometers => 1000.0,
            Unit::Miles => 1609.34,
            Unit::Feet => 0.3048,
        }
    }
}

fn spread(v: u32) -> u64 {
    let mut x = u64::from(v) & 0x03FF_FFFF;
    x = (x | (x << 16)) & 0x0000_FFFF_0000_FFFF;
    x = (x | (x << 8)) & 0x00FF_00FF_00FF_00FF;
    x = (x | (x << 4)) & 0x0F0F_0F0F_0F0F_0F0F;
    x = (x | (x << 2)) & 0x3333_3333_3333_3333;
    x = (x | (x << 1)) & 0x5555_5555_5555_5555;
    x
}

fn squash(v: u64) -> u32 {
    let mut x = v & 0x5555_5555_5555_5555;
    x = (x | (x >> 1)) & 0x3333_3333_3333_3333;
    x = (x | (x >> 2)) & 0x0F0F_0F0F_0F0F_0F0F;
    x = (x | (x >> 4)) & 0x00FF_00FF_00FF_00FF;
    x = (x | (x >> 8)) & 0x0000_FFFF_0000_FFFF;
    x = (x | (x >> 16)) & 0x0000_0000_FFFF_FFFF;
    x as u32
}

fn interleave(lat_bits: u32, lon_bits: u32) -> u64 {
    spread(lat_bits) | (spread(lon_bits) << 1)
}

fn deinterleave(bits: u64) -> (u32, u32) {
    (squash(bits), squash(bits >> 1))
}

fn quantize(value: f64, min: f64, max: f64) -> u32 {
    let scaled = (value - min) / (max - min) * f64::from(1u32 << STEP) as f64;
    (scaled as u32).min((1 << STEP) - 1)
}

/// Encode a coordinate pair into the 52-bit score.
pub fn encode(lon: f64, lat: f64) -> CarmineResult<u64> {
    if !(LON_MIN..=LON_MAX).contains(&lon) || !(LAT_MIN..=LAT_MAX).contains(&lat) {
        return Err(CarmineError::InvalidCoordinates(lon, lat));
    }
    Ok(interleave(
        quantize(lat, LAT_MIN, LAT_MAX),
        quantize(lon, LON_MIN, LON_MAX),
    ))
}

/// Decode a 52-bit score back to the (lon, lat) cell center.
pub fn decode(bits: u64) -> (f64, f64) {
    let (lat_bits, lon_bits) = deinterleave(bits);
    let cell = |idx: u32, min: f64, max: f64| {
        let span = (max - min) / f64::from(1u32 << STEP) as f64;
        min + (f64::from(idx) + 0.5) * span
    };
    (
        cell(lon_bits, LON_MIN, LON_MAX),
        cell(lat_bits, LAT_MIN, LAT_MAX),
    )
}

/// Great-circle distance in meters between two (lon, lat) pairs.
pub fn haversine(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let lat1r = lat1.to_radians();
    let lat2r = lat2.to_radians();
    let u = ((lat2r - lat1r) / 2.0).sin();
    let v = ((lon2 - lon1).to_radians() / 2.0).sin();
    2.0 * EARTH_RADIUS_M * (u * u + lat1r.cos() * lat2r.cos() * v * v).sqrt().asin()
}

/// Coarse step (bits per axis) whose cell comfortably covers `radius_m`
/// around latitude `lat`. High latitudes shrink the step to compensate for
/// Mercator distortion.
pub fn estimate_steps_by_radius(radius_m: f64, lat: f64) -> u32 {
    if radius_m == 0.0 {
        return STEP;
    }
    let mut step: i32 = 1;
    let mut range = radius_m;
    while range < MERCATOR_MAX {
        range *= 2.0;
        step += 1;
    }
    step -= 2;
    if !(-66.0..=66.0).contains(&lat) {
        step -= 1;
        if !(-80.0..=80.0).contains(&lat) {
            step -= 1;
        }
    }
    step.clamp(1, 25) as u32
}

/// The score windows a radius query must scan: the center's cell at the
/// estimated step plus its eight neighbors. Callers still filter every
/// candidate by exact [`haversine`] distance.
pub fn search_ranges(lon: f64, lat: f64, radius_m: f64) -> CarmineResult<Vec<(u64, u64)>> {
    if !(LON_MIN..=LON_MAX).contains(&lon) || !(LAT_MIN..=LAT_MAX).contains(&lat) {
        return Err(CarmineError::InvalidCoordinates(lon, lat));
    }
    let step = estimate_steps_by_radius(radius_m, lat);
    let shift = STEP - step;
    let lat_cell = quantize(lat, LAT_MIN, LAT_MAX) >> shift;
    let lon_cell = quantize(lon, LON_MIN, LON_MAX) >> shift;

    let max_cell = (1u32 << step) - 1;
    let mut ranges = Vec::with_capacity(9);
    for dlat in [-1i64, 0, 1] {
        let lat_n = i64::from(lat_cell) + dlat;
        // Latitude cells do not wrap.
        if lat_n < 0 || lat_n > i64::from(max_cell) {
            continue;
        }
        for dlon in [-1i64, 0, 1] {
            // Longitude wraps around the antimeridian.
            let lon_n = (i64::from(lon_cell) + dlon).rem_euclid(i64::from(max_cell) + 1);
            let min = interleave((lat_n as u32) << shift, (lon_n as u32) << shift);
            let span = 1u64 << (2 * shift);
            ranges.push((min, min + span));
        }
    }
    Ok(ranges)
}

const GEOALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// The classic 11-character base32 geohash string (`GEOHASH` reply). Uses
/// the standard ±90 latitude normalization, unlike the score encoding.
pub fn geohash_string(lon: f64, lat: f64) -> String {
    let quant = |value: f64, min: f64, max: f64| {
        let scaled = (value - min) / (max - min) * f64::from(1u32 << STEP) as f64;
        (scaled as u32).min((1 << STEP) - 1)
    };
    let bits = interleave(quant(lat, -90.0, 90.0), quant(lon, -180.0, 180.0));
    // 52 bits padded to 55 so they divide into 11 five-bit groups.
    let padded = bits << 3;
    (0..11)
        .map(|i| GEOALPHABET[((padded >> (55 - 5 * (i + 1))) & 0x1f) as usize] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip_is_cell_accurate() {
        for &(lon, lat) in &[
            (13.361389, 38.115556),  // Palermo
            (15.087269, 37.502669),  // Catania
            (-122.27652, 37.80574),  // Oakland
            (0.0, 0.0),
            (179.999, -85.0),
        ] {
            let bits = encode(lon, lat).unwrap();
            let (dlon, dlat) = decode(bits);
            // One 26-bit cell is < 0.00001 degrees of longitude.
            assert!((dlon - lon).abs() < 0.0001, "lon {lon} -> {dlon}");
            assert!((dlat - lat).abs() < 0.0001, "lat {lat} -> {dlat}");
        }
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(encode(181.0, 0.0).is_err());
        assert!(encode(0.0, 86.0).is_err());
    }

    #[test]
    fn haversine_palermo_catania() {
        // The canonical Redis example: ~166 km.
        let d = haversine(13.361389, 38.115556, 15.087269, 37.502669);
        assert!((d - 166_274.0).abs() < 200.0, "distance {d}");
    }

    #[test]
    fn units() {
        assert_eq!(Unit::parse(b"KM").unwrap(), Unit::Kilometers);
        assert!((Unit::Kilometers.from_meters(1500.0) - 1.5).abs() < 1e-9);
        assert!((Unit::Miles.to_meters(1.0) - 1609.34).abs() < 1e-9);
        assert!(Unit::parse(b"yd").is_err());
    }

    #[test]
    fn steps_shrink_with_radius_and_latitude() {
        assert!(estimate_steps_by_radius(100.0, 0.0) > estimate_steps_by_radius(100_000.0, 0.0));
        assert!(
            estimate_steps_by_radius(1000.0, 84.0) < estimate_steps_by_radius(1000.0, 0.0)
        );
        assert_eq!(estimate_steps_by_radius(0.0, 0.0), 26);
    }

    #[test]
    fn search_ranges_cover_the_center() {
        let (lon, lat) = (13.361389, 38.115556);
        let bits = encode(lon, lat).unwrap();
        let ranges = search_ranges(lon, lat, 200_000.0).unwrap();
        assert!(!ranges.is_empty() && ranges.len() <= 9);
        assert!(
            ranges.iter().any(|&(lo, hi)| (lo..hi).contains(&bits)),
            "center cell missing from its own search window"
        );
    }

    #[test]
    fn nearby_points_share_a_search_window() {
        // Palermo and Catania are ~166km apart; a 200km search around
        // Palermo must produce windows containing Catania's score.
        let catania = encode(15.087269, 37.502669).unwrap();
        let ranges = search_ranges(13.361389, 38.115556, 200_000.0).unwrap();
        assert!(ranges.iter().any(|&(lo, hi)| (lo..hi).contains(&catania)));
    }

    #[test]
    fn geohash_strings() {
        // Redis's documented examples.
        assert_eq!(geohash_string(13.361389, 38.115556), "sqc8b49rny0");
        assert_eq!(geohash_string(15.087269, 37.502669), "sqdtr74hyu0");
    }
}
