use std::{
    fmt::{
        Debug,
        Display,
    },
    str::FromStr,
};

use bytes::{
    BufMut,
    Bytes,
    BytesMut,
};

use crate::{
    callsign::{
        Callsign,
        CallsignFromStrError,
    },
    path::{
        PathElement,
        PathElementFromStrError,
    },
    position::{
        self,
        Position,
    },
};

/// Maximum number of digipeater path elements.
pub const MAX_PATH_LENGTH: usize = 8;

/// Maximum length of an encoded packet line, excluding CRLF.
pub const MAX_LINE_LENGTH: usize = 512;

/// An APRS packet in its TNC2 representation:
/// `SOURCE>DEST[,PATH1,PATH2,…]:DATA`.
///
/// The information field is kept as raw bytes and preserved verbatim,
/// including 8-bit values; everything the core emits round-trips
/// byte-exactly through [`Packet::parse`] and [`Packet::encode`].
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub source: Callsign,
    pub destination: Callsign,
    pub path: Vec<PathElement>,
    pub data: Bytes,
}

impl Packet {
    /// Parse one TNC2 line. A trailing CRLF is trimmed; the data bytes are
    /// otherwise untouched.
    pub fn parse(line: &[u8]) -> Result<Self, ParsePacketError> {
        let line = trim_crlf(line);

        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or(ParsePacketError::InvalidFormat)?;
        let (header, data) = (&line[..colon], &line[colon + 1..]);

        let header =
            std::str::from_utf8(header).map_err(|_| {
                ParsePacketError::InvalidHeader {
                    header: String::from_utf8_lossy(header).into_owned(),
                }
            })?;

        let (source, rest) = header.split_once('>').ok_or_else(|| {
            ParsePacketError::InvalidHeader {
                header: header.to_owned(),
            }
        })?;

        let mut elements = rest.split(',');
        let destination = elements.next().unwrap_or("");
        if destination.is_empty() {
            return Err(ParsePacketError::InvalidHeader {
                header: header.to_owned(),
            });
        }

        let source = source.parse::<Callsign>()?;
        let destination = destination.parse::<Callsign>()?;

        let path = elements
            .map(|element| element.parse::<PathElement>())
            .collect::<Result<Vec<_>, _>>()?;
        if path.len() > MAX_PATH_LENGTH {
            return Err(ParsePacketError::PathTooLong { length: path.len() });
        }

        Ok(Self {
            source,
            destination,
            path,
            data: Bytes::copy_from_slice(data),
        })
    }

    /// Canonical TNC2 encoding without line terminator.
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(64 + self.data.len());
        self.encode_into(&mut buffer);
        buffer.freeze()
    }

    /// Canonical TNC2 encoding with CRLF, ready for the wire.
    pub fn encode_line(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(66 + self.data.len());
        self.encode_into(&mut buffer);
        buffer.put_slice(b"\r\n");
        buffer.freeze()
    }

    fn encode_into(&self, buffer: &mut BytesMut) {
        buffer.put_slice(self.source.to_string().as_bytes());
        buffer.put_u8(b'>');
        buffer.put_slice(self.destination.to_string().as_bytes());
        for element in &self.path {
            buffer.put_u8(b',');
            buffer.put_slice(element.to_string().as_bytes());
        }
        buffer.put_u8(b':');
        buffer.put_slice(&self.data);
    }

    /// The packet kind, per the first byte(s) of the information field.
    pub fn packet_type(&self) -> PacketType {
        PacketType::from_data(&self.data)
    }

    /// Decoded position for position-carrying packets.
    pub fn position(&self) -> Option<Position> {
        position::decode(&self.data)
    }

    /// The addressee of a message or bulletin (the 9-character field after
    /// the leading `:`, space padding trimmed).
    pub fn addressee(&self) -> Option<&str> {
        if self.data.first() != Some(&b':') || self.data.get(10) != Some(&b':') {
            return None;
        }
        std::str::from_utf8(&self.data[1..10])
            .ok()
            .map(|addressee| addressee.trim_end_matches(' '))
    }

    /// Third-party traffic (`}` payload) is never gated or digipeated.
    pub fn is_third_party(&self) -> bool {
        self.data.first() == Some(&b'}')
    }

    /// Number of used (`*`-marked) path elements.
    pub fn used_hops(&self) -> usize {
        self.path.iter().filter(|element| element.used).count()
    }

    /// True when no used hop precedes the end of the path, i.e. the packet
    /// was received without an intermediate digipeat.
    pub fn is_direct(&self) -> bool {
        self.used_hops() == 0
    }
}

fn trim_crlf(mut line: &[u8]) -> &[u8] {
    while let [rest @ .., b'\r' | b'\n'] = line {
        line = rest;
    }
    line
}

impl Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.encode()))
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet({self})")
    }
}

impl FromStr for Packet {
    type Err = ParsePacketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s.as_bytes())
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum ParsePacketError {
    #[error("missing data separator")]
    InvalidFormat,
    #[error("invalid header: {header}")]
    InvalidHeader { header: String },
    #[error("invalid callsign")]
    InvalidCallsign(#[from] CallsignFromStrError),
    #[error("invalid path element")]
    InvalidPath(#[from] PathElementFromStrError),
    #[error("path too long: {length} elements")]
    PathTooLong { length: usize },
}

/// APRS packet kinds, per the type indicator table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    PositionNoTimestamp,
    PositionWithTimestamp,
    PositionWithTimestampMessaging,
    PositionCompressed,
    Message,
    Status,
    Object,
    Item,
    MicE,
    Weather,
    Telemetry,
    Query,
    Bulletin,
    UserDefined,
    ThirdParty,
    RawGps,
    Unknown,
}

impl PacketType {
    pub fn from_data(data: &[u8]) -> Self {
        let Some((first, rest)) = data.split_first() else {
            return PacketType::Unknown;
        };

        match first {
            b'!' | b'=' => {
                if rest.first().is_some_and(|b| b.is_ascii_digit()) {
                    PacketType::PositionNoTimestamp
                }
                else if rest.first() == Some(&b'_') {
                    // positionless weather report disguised as a position
                    PacketType::Weather
                }
                else {
                    PacketType::PositionCompressed
                }
            }
            b'/' => PacketType::PositionWithTimestamp,
            b'@' => PacketType::PositionWithTimestampMessaging,
            b':' => {
                if rest.starts_with(b"BLN") || rest.starts_with(b"NWS") {
                    PacketType::Bulletin
                }
                else {
                    PacketType::Message
                }
            }
            b'>' => PacketType::Status,
            b';' => PacketType::Object,
            b')' => PacketType::Item,
            0x1c | 0x1d | b'`' | b'\'' => PacketType::MicE,
            b'_' => PacketType::Weather,
            b'T' => PacketType::Telemetry,
            b'?' => PacketType::Query,
            b'{' => PacketType::UserDefined,
            b'}' => PacketType::ThirdParty,
            b'$' => PacketType::RawGps,
            _ => PacketType::Unknown,
        }
    }

    /// Any of the position-carrying kinds, as used by the digipeater's
    /// viscous delay and the gate's range check.
    pub fn is_position(&self) -> bool {
        matches!(
            self,
            PacketType::PositionNoTimestamp
                | PacketType::PositionWithTimestamp
                | PacketType::PositionWithTimestampMessaging
                | PacketType::PositionCompressed
                | PacketType::MicE
        )
    }

    pub fn is_message(&self) -> bool {
        matches!(self, PacketType::Message | PacketType::Bulletin)
    }
}
