//! APRS-IS filter expressions.
//!
//! A filter string is a space-separated list of `type/args` tokens; a
//! packet matches the list if it matches any element. Unknown token types
//! are dropped silently so that newer client filters degrade gracefully;
//! malformed arguments of known types are an error. A blank filter
//! matches everything.

use aprsgate_types::{
    Packet,
    PacketType,
    Position,
    haversine_km,
};

#[derive(Clone, Debug, thiserror::Error)]
#[error("invalid filter token: {token}")]
pub struct FilterParseError {
    pub token: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    /// `r/lat/lon/km` — packets positioned within range of a point.
    Range {
        latitude: f64,
        longitude: f64,
        range_km: f64,
    },
    /// `p/p1[/p2…]` — source callsign prefix list (case sensitive).
    Prefix { prefixes: Vec<String> },
    /// `b/c1[/c2…]` — exact match on source, destination or any path
    /// element.
    Budlist { calls: Vec<String> },
    /// `t/chars` — packet kind classes.
    Type { classes: Vec<TypeClass> },
    /// `s/s1[/s2…]` — symbol codes.
    Symbol { symbols: Vec<char> },
    /// `o/name[/…]` — object names.
    Object { names: Vec<String> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeClass {
    Position,
    Object,
    Item,
    Message,
    Query,
    Status,
    Telemetry,
    Weather,
    Nws,
    UserDefined,
}

impl TypeClass {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'p' => Some(TypeClass::Position),
            'o' => Some(TypeClass::Object),
            'i' => Some(TypeClass::Item),
            'm' => Some(TypeClass::Message),
            'q' => Some(TypeClass::Query),
            's' => Some(TypeClass::Status),
            't' => Some(TypeClass::Telemetry),
            'w' => Some(TypeClass::Weather),
            'n' => Some(TypeClass::Nws),
            'u' => Some(TypeClass::UserDefined),
            _ => None,
        }
    }

    fn matches(&self, packet_type: PacketType) -> bool {
        match self {
            TypeClass::Position => packet_type.is_position(),
            TypeClass::Object => packet_type == PacketType::Object,
            TypeClass::Item => packet_type == PacketType::Item,
            TypeClass::Message => packet_type == PacketType::Message,
            TypeClass::Query => packet_type == PacketType::Query,
            TypeClass::Status => packet_type == PacketType::Status,
            TypeClass::Telemetry => packet_type == PacketType::Telemetry,
            TypeClass::Weather => packet_type == PacketType::Weather,
            TypeClass::Nws => packet_type == PacketType::Bulletin,
            TypeClass::UserDefined => packet_type == PacketType::UserDefined,
        }
    }
}

impl Filter {
    fn parse_token(token: &str) -> Result<Option<Self>, FilterParseError> {
        let err = || {
            FilterParseError {
                token: token.to_owned(),
            }
        };

        let Some((kind, args)) = token.split_once('/') else {
            // a bare token is unknown, drop it
            return Ok(None);
        };

        let filter = match kind {
            "r" => {
                let mut parts = args.split('/');
                let latitude = parts.next().ok_or_else(err)?;
                let longitude = parts.next().ok_or_else(err)?;
                let range_km = parts.next().ok_or_else(err)?;
                if parts.next().is_some() {
                    return Err(err());
                }
                Filter::Range {
                    latitude: latitude.parse().map_err(|_| err())?,
                    longitude: longitude.parse().map_err(|_| err())?,
                    range_km: range_km.parse().map_err(|_| err())?,
                }
            }
            "p" => {
                Filter::Prefix {
                    prefixes: split_args(args).ok_or_else(err)?,
                }
            }
            "b" => {
                Filter::Budlist {
                    calls: split_args(args)
                        .ok_or_else(err)?
                        .into_iter()
                        .map(|call| call.to_ascii_uppercase())
                        .collect(),
                }
            }
            "t" => {
                if args.is_empty() {
                    return Err(err());
                }
                let classes = args
                    .chars()
                    .map(TypeClass::from_char)
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(err)?;
                Filter::Type { classes }
            }
            "s" => {
                let symbols = split_args(args)
                    .ok_or_else(err)?
                    .into_iter()
                    .map(|arg| {
                        let mut chars = arg.chars();
                        let symbol = chars.next().ok_or_else(err)?;
                        if chars.next().is_some() {
                            return Err(err());
                        }
                        Ok(symbol)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Filter::Symbol { symbols }
            }
            "o" => {
                Filter::Object {
                    names: split_args(args).ok_or_else(err)?,
                }
            }
            _ => return Ok(None),
        };

        Ok(Some(filter))
    }

    pub fn matches(&self, packet: &Packet) -> bool {
        match self {
            Filter::Range {
                latitude,
                longitude,
                range_km,
            } => {
                let Some(position) = packet.position() else {
                    return false;
                };
                let center = Position {
                    latitude: *latitude,
                    longitude: *longitude,
                };
                haversine_km(center, position) <= *range_km
            }
            Filter::Prefix { prefixes } => {
                let source = packet.source.to_string();
                prefixes.iter().any(|prefix| source.starts_with(prefix))
            }
            Filter::Budlist { calls } => {
                calls.iter().any(|call| {
                    packet.source.to_string() == *call
                        || packet.destination.to_string() == *call
                        || packet.path.iter().any(|element| element.matches(call))
                })
            }
            Filter::Type { classes } => {
                let packet_type = packet.packet_type();
                classes.iter().any(|class| class.matches(packet_type))
            }
            Filter::Symbol { symbols } => {
                symbol_code(&packet.data)
                    .is_some_and(|symbol| symbols.iter().any(|wanted| *wanted == symbol))
            }
            Filter::Object { names } => {
                object_name(&packet.data).is_some_and(|name| {
                    names.iter().any(|wanted| wanted == name)
                })
            }
        }
    }
}

fn split_args(args: &str) -> Option<Vec<String>> {
    if args.is_empty() {
        return None;
    }
    let parts: Vec<String> = args.split('/').map(str::to_owned).collect();
    if parts.iter().any(String::is_empty) {
        return None;
    }
    Some(parts)
}

/// The symbol code of a position report, uncompressed or compressed.
fn symbol_code(data: &[u8]) -> Option<char> {
    let (first, rest) = data.split_first()?;
    let body = match first {
        b'!' | b'=' => rest,
        b'/' | b'@' => rest.get(7..)?,
        b';' => rest.get(17..)?,
        _ => return None,
    };

    if body.first()?.is_ascii_digit() {
        // uncompressed: 8 byte latitude, table, 9 byte longitude, code
        body.get(18).map(|byte| char::from(*byte))
    }
    else {
        // compressed: table, 4+4 base-91, code
        body.get(9).map(|byte| char::from(*byte))
    }
}

/// The name of an object report, space padding trimmed.
fn object_name(data: &[u8]) -> Option<&str> {
    if data.first() != Some(&b';') {
        return None;
    }
    std::str::from_utf8(data.get(1..10)?)
        .ok()
        .map(|name| name.trim_end_matches(' '))
}

/// An ordered list of filters with OR semantics; the empty list matches
/// everything.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FilterList {
    filters: Vec<Filter>,
}

impl FilterList {
    pub fn match_all() -> Self {
        Self::default()
    }

    pub fn parse(input: &str) -> Result<Self, FilterParseError> {
        let mut filters = Vec::new();
        for token in input.split_whitespace() {
            if let Some(filter) = Filter::parse_token(token)? {
                filters.push(filter);
            }
        }
        Ok(Self { filters })
    }

    pub fn is_match_all(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn matches(&self, packet: &Packet) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|filter| filter.matches(packet))
    }
}
