//! Shared APRS domain types: callsigns, digipeater paths, q-constructs,
//! packets with their TNC2 text codec, and position handling.

pub mod callsign;
pub mod packet;
pub mod path;
pub mod position;

pub use crate::{
    callsign::{
        Callsign,
        CallsignFromStrError,
    },
    packet::{
        MAX_LINE_LENGTH,
        MAX_PATH_LENGTH,
        Packet,
        PacketType,
        ParsePacketError,
    },
    path::{
        PathElement,
        PathElementFromStrError,
        QConstruct,
    },
    position::{
        Position,
        haversine_km,
    },
};

/// The published APRS-IS passcode for a callsign.
///
/// XOR hash over the first 10 characters of the upper-cased base call,
/// processed in 2-byte pairs, seeded with 0x73E2 and masked to 15 bits.
/// Verification against it is advisory only.
pub fn passcode(callsign: &Callsign) -> u16 {
    let base = callsign.base().as_bytes();

    let mut hash: u16 = 0x73e2;
    for pair in base.chunks(2).take(5) {
        hash ^= u16::from(pair[0]) << 8;
        if let Some(low) = pair.get(1) {
            hash ^= u16::from(*low);
        }
    }

    hash & 0x7fff
}

#[cfg(test)]
mod tests {
    use crate::{
        Callsign,
        passcode,
    };

    #[test]
    fn passcode_matches_the_reference_values() {
        // well-known reference vector for the published algorithm
        let call = "N0CALL".parse::<Callsign>().unwrap();
        assert_eq!(passcode(&call), 13023);

        // the SSID does not participate
        let call = "N0CALL-9".parse::<Callsign>().unwrap();
        assert_eq!(passcode(&call), 13023);
    }
}
