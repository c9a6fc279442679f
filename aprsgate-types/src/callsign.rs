use std::{
    fmt::{
        Debug,
        Display,
    },
    str::FromStr,
};

use serde::{
    Deserialize,
    Serialize,
};

/// An amateur radio callsign with an optional SSID, e.g. `N0CALL-9`.
///
/// The base call is 1 to 6 alphanumeric characters containing at least one
/// letter; the SSID is 0 to 15. Input is case-insensitive and canonicalized
/// to upper case. An SSID of 0 is not rendered.
///
/// APRS "tocalls" (`APRS`, `APDW16`, ...) are syntactically callsigns too,
/// so the same type is used for packet destinations.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Callsign {
    base: String,
    ssid: u8,
}

impl Callsign {
    pub fn new(base: &str, ssid: u8) -> Result<Self, CallsignFromStrError> {
        let err = || {
            CallsignFromStrError {
                input: if ssid == 0 {
                    base.to_owned()
                }
                else {
                    format!("{base}-{ssid}")
                },
            }
        };

        if base.is_empty() || base.len() > 6 || ssid > 15 {
            return Err(err());
        }
        if !base.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(err());
        }
        if !base.bytes().any(|b| b.is_ascii_alphabetic()) {
            return Err(err());
        }

        Ok(Self {
            base: base.to_ascii_uppercase(),
            ssid,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn ssid(&self) -> u8 {
        self.ssid
    }

    /// The base call without SSID, as its own callsign.
    pub fn without_ssid(&self) -> Self {
        Self {
            base: self.base.clone(),
            ssid: 0,
        }
    }
}

impl Display for Callsign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.base)
        }
        else {
            write!(f, "{}-{}", self.base, self.ssid)
        }
    }
}

impl Debug for Callsign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Callsign({self})")
    }
}

impl FromStr for Callsign {
    type Err = CallsignFromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || {
            CallsignFromStrError {
                input: s.to_owned(),
            }
        };

        let (base, ssid) = match s.split_once('-') {
            Some((base, ssid)) => {
                // reject `-07` style zero-padded SSIDs so encoding round-trips
                if ssid.len() > 1 && ssid.starts_with('0') {
                    return Err(err());
                }
                (base, ssid.parse::<u8>().map_err(|_| err())?)
            }
            None => (s, 0),
        };

        Self::new(base, ssid).map_err(|_| err())
    }
}

impl TryFrom<String> for Callsign {
    type Error = CallsignFromStrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Callsign> for String {
    fn from(value: Callsign) -> Self {
        value.to_string()
    }
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("invalid callsign: {input}")]
pub struct CallsignFromStrError {
    pub input: String,
}
