//! Position extraction from APRS information fields.
//!
//! Two textual encodings are accepted on the read path: the uncompressed
//! `DDMM.mmN/DDDMM.mmW` form and the base-91 compressed form. Emission only
//! ever uses the uncompressed form.

/// Signed decimal degrees, north and east positive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
}

/// Mean Earth radius in km, as used by the APRS-IS range filters.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two positions in km.
pub fn haversine_km(a: Position, b: Position) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Extract a position from a raw information field, if the packet is of a
/// position-carrying kind.
pub fn decode(data: &[u8]) -> Option<Position> {
    let (first, rest) = data.split_first()?;

    let body = match first {
        b'!' | b'=' => rest,
        // timestamp is always 7 bytes (`092345z`, `092345/`, `234517h`)
        b'/' | b'@' => rest.get(7..)?,
        // object: 9 byte name, live/killed byte, 7 byte timestamp
        b';' => rest.get(17..)?,
        // item: 3 to 9 byte name terminated by `!` or `_`
        b')' => {
            let end = rest
                .iter()
                .take(10)
                .position(|b| *b == b'!' || *b == b'_')?;
            if end < 3 {
                return None;
            }
            rest.get(end + 1..)?
        }
        _ => return None,
    };

    decode_uncompressed(body).or_else(|| decode_compressed(body))
}

fn decode_uncompressed(body: &[u8]) -> Option<Position> {
    if body.len() < 19 {
        return None;
    }

    let latitude = decode_angle(&body[0..8], 2)?;
    let longitude = decode_angle(&body[9..18], 3)?;

    Some(Position {
        latitude,
        longitude,
    })
}

/// `DDMM.mm{N|S}` with `degree_digits` degree digits (2 for latitude, 3 for
/// longitude).
fn decode_angle(field: &[u8], degree_digits: usize) -> Option<f64> {
    let (hemisphere, digits) = field.split_last()?;
    let digits = std::str::from_utf8(digits).ok()?;

    let degrees = digits.get(..degree_digits)?.parse::<f64>().ok()?;
    let minutes = digits.get(degree_digits..)?.parse::<f64>().ok()?;
    if minutes >= 60.0 {
        return None;
    }

    let value = degrees + minutes / 60.0;
    match hemisphere {
        b'N' if degree_digits == 2 && value <= 90.0 => Some(value),
        b'S' if degree_digits == 2 && value <= 90.0 => Some(-value),
        b'E' if degree_digits == 3 && value <= 180.0 => Some(value),
        b'W' if degree_digits == 3 && value <= 180.0 => Some(-value),
        _ => None,
    }
}

fn decode_compressed(body: &[u8]) -> Option<Position> {
    if body.len() < 9 {
        return None;
    }

    // symbol table identifier for compressed positions
    match body[0] {
        b'/' | b'\\' | b'A'..=b'Z' | b'a'..=b'j' => {}
        _ => return None,
    }

    let latitude = 90.0 - base91(&body[1..5])? / 380926.0;
    let longitude = -180.0 + base91(&body[5..9])? / 190463.0;

    (latitude.abs() <= 90.0 && longitude.abs() <= 180.0).then_some(Position {
        latitude,
        longitude,
    })
}

fn base91(bytes: &[u8]) -> Option<f64> {
    let mut value = 0u32;
    for byte in bytes {
        if *byte < 33 || *byte > 123 {
            return None;
        }
        value = value * 91 + u32::from(byte - 33);
    }
    Some(value as f64)
}

/// Format a latitude as `DDMM.mm{N|S}` for uncompressed emission.
pub fn format_latitude(latitude: f64) -> String {
    let (degrees, minutes, hemisphere) = split_angle(latitude, 'N', 'S');
    format!("{degrees:02}{minutes:05.2}{hemisphere}")
}

/// Format a longitude as `DDDMM.mm{E|W}` for uncompressed emission.
pub fn format_longitude(longitude: f64) -> String {
    let (degrees, minutes, hemisphere) = split_angle(longitude, 'E', 'W');
    format!("{degrees:03}{minutes:05.2}{hemisphere}")
}

fn split_angle(value: f64, positive: char, negative: char) -> (u32, f64, char) {
    let hemisphere = if value < 0.0 { negative } else { positive };
    let value = value.abs();
    let mut degrees = value.trunc() as u32;
    let mut minutes = (value - value.trunc()) * 60.0;

    // carry when the minutes would print as 60.00
    if minutes >= 59.995 {
        minutes = 0.0;
        degrees += 1;
    }

    (degrees, minutes, hemisphere)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use crate::position::{
        Position,
        decode,
        format_latitude,
        format_longitude,
        haversine_km,
    };

    #[test]
    fn it_decodes_an_uncompressed_position() {
        let position = decode(b"!3553.50N/10602.50W>Test").unwrap();
        assert_abs_diff_eq!(position.latitude, 35.891666, epsilon = 1e-4);
        assert_abs_diff_eq!(position.longitude, -106.041666, epsilon = 1e-4);
    }

    #[test]
    fn it_skips_the_timestamp_of_timestamped_positions() {
        let position = decode(b"@092345z4903.50N/07201.75W>088/036").unwrap();
        assert_abs_diff_eq!(position.latitude, 49.058333, epsilon = 1e-4);
        assert_abs_diff_eq!(position.longitude, -72.029166, epsilon = 1e-4);
    }

    #[test]
    fn it_decodes_object_and_item_positions() {
        let position = decode(b";LEADER   *092345z4903.50N/07201.75W>").unwrap();
        assert_abs_diff_eq!(position.latitude, 49.058333, epsilon = 1e-4);

        let position = decode(b")AID!4903.50N/07201.75W!").unwrap();
        assert_abs_diff_eq!(position.longitude, -72.029166, epsilon = 1e-4);
    }

    #[test]
    fn it_decodes_a_compressed_position() {
        // worked example from the APRS 1.01 specification
        let position = decode(b"!/5L!!<*e7>7P[").unwrap();
        assert_abs_diff_eq!(position.latitude, 49.5, epsilon = 1e-3);
        assert_abs_diff_eq!(position.longitude, -72.75, epsilon = 1e-3);
    }

    #[test]
    fn it_rejects_non_position_data() {
        assert_eq!(decode(b":N0CALL   :hello"), None);
        assert_eq!(decode(b">status text"), None);
        assert_eq!(decode(b"!not a position"), None);
        assert_eq!(decode(b""), None);
    }

    #[test]
    fn it_formats_angles() {
        assert_eq!(format_latitude(35.891666), "3553.50N");
        assert_eq!(format_longitude(-106.041666), "10602.50W");
        assert_eq!(format_latitude(-0.5), "0030.00S");
        assert_eq!(format_longitude(0.9999999), "00100.00E");
    }

    #[test]
    fn haversine_grows_with_angular_separation() {
        let origin = Position {
            latitude: 35.0,
            longitude: -106.0,
        };

        let mut previous = 0.0;
        for step in 1..=10 {
            let other = Position {
                latitude: 35.0,
                longitude: -106.0 + f64::from(step) * 0.5,
            };
            let distance = haversine_km(origin, other);
            assert!(distance > previous);
            previous = distance;
        }
    }

    #[test]
    fn haversine_of_known_distance() {
        // Albuquerque to Santa Fe is roughly 100 km
        let abq = Position {
            latitude: 35.0844,
            longitude: -106.6504,
        };
        let saf = Position {
            latitude: 35.6870,
            longitude: -105.9378,
        };
        let distance = haversine_km(abq, saf);
        assert!(distance > 85.0 && distance < 105.0, "{distance}");
    }
}
