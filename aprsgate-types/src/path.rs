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

use crate::callsign::Callsign;

/// One element of a packet's digipeater path.
///
/// An element is a callsign or alias, optionally suffixed `*` meaning "this
/// hop has been used". Reserved token forms (`WIDEn-N`, `TRACEn-N`,
/// `TCPIP`, `NOGATE`, `RFONLY`, q-constructs) are recognized through the
/// accessor methods; the element itself stores the token verbatim so that
/// re-encoding is byte-exact.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathElement {
    pub alias: String,
    pub used: bool,
}

impl PathElement {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            used: false,
        }
    }

    pub fn used(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            used: true,
        }
    }

    pub fn from_callsign(callsign: &Callsign, used: bool) -> Self {
        Self {
            alias: callsign.to_string(),
            used,
        }
    }

    /// `WIDEn-N` / `WIDEn` hop counts as `(total, remaining)`.
    ///
    /// Returns `None` for anything that isn't a syntactically valid WIDE
    /// token with total hops in 1..=7 and remaining hops not above total.
    pub fn wide_hops(&self) -> Option<(u8, u8)> {
        flood_hops(&self.alias, "WIDE")
    }

    /// `TRACEn-N` / `TRACEn` hop counts as `(total, remaining)`.
    pub fn trace_hops(&self) -> Option<(u8, u8)> {
        flood_hops(&self.alias, "TRACE")
    }

    pub fn q_construct(&self) -> Option<QConstruct> {
        self.alias.parse().ok()
    }

    /// Any `q…` token, including malformed q-constructs.
    pub fn looks_like_q_construct(&self) -> bool {
        self.alias.starts_with('q')
    }

    pub fn is_tcpip(&self) -> bool {
        self.alias.eq_ignore_ascii_case("TCPIP")
    }

    pub fn is_nogate(&self) -> bool {
        self.alias.eq_ignore_ascii_case("NOGATE")
    }

    pub fn is_rfonly(&self) -> bool {
        self.alias.eq_ignore_ascii_case("RFONLY")
    }

    pub fn matches(&self, alias: &str) -> bool {
        self.alias.eq_ignore_ascii_case(alias)
    }

    pub fn matches_callsign(&self, callsign: &Callsign) -> bool {
        self.alias.eq_ignore_ascii_case(&callsign.to_string())
    }
}

fn flood_hops(alias: &str, prefix: &str) -> Option<(u8, u8)> {
    let rest = match alias.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => &alias[prefix.len()..],
        _ => return None,
    };

    let mut chars = rest.chars();
    let total = chars.next()?.to_digit(10)? as u8;
    if total == 0 || total > 7 {
        return None;
    }

    let remaining = match chars.next() {
        None => 0,
        Some('-') => {
            let remaining = chars.next()?.to_digit(10)? as u8;
            if chars.next().is_some() || remaining == 0 || remaining > total {
                return None;
            }
            remaining
        }
        Some(_) => return None,
    };

    Some((total, remaining))
}

impl Display for PathElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.used {
            write!(f, "{}*", self.alias)
        }
        else {
            write!(f, "{}", self.alias)
        }
    }
}

impl Debug for PathElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PathElement({self})")
    }
}

impl FromStr for PathElement {
    type Err = PathElementFromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || {
            PathElementFromStrError {
                input: s.to_owned(),
            }
        };

        let (alias, used) = match s.strip_suffix('*') {
            Some(alias) => (alias, true),
            None => (s, false),
        };

        if alias.is_empty() || alias.len() > 9 {
            return Err(err());
        }
        if !alias
            .bytes()
            .all(|b| b.is_ascii_graphic() && b != b',' && b != b':' && b != b'*' && b != b'>')
        {
            return Err(err());
        }

        Ok(Self {
            alias: alias.to_owned(),
            used,
        })
    }
}

impl TryFrom<String> for PathElement {
    type Error = PathElementFromStrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PathElement> for String {
    fn from(value: PathElement) -> Self {
        value.to_string()
    }
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("invalid path element: {input}")]
pub struct PathElementFromStrError {
    pub input: String,
}

/// An APRS-IS q-construct, the synthetic path element recording how a packet
/// entered the Internet tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QConstruct {
    /// Accepted from a verified client login.
    AC,
    /// Accepted from an unverified client login.
    AX,
    /// Received from another server.
    AU,
    /// Client-only port, unverified.
    Ao,
    /// Client-only port, verified.
    AO,
    /// Server-generated.
    AS,
    /// Relayed, unverified.
    Ar,
    /// Received directly from RF by the attached gateway.
    AR,
    /// Constructed by the server.
    AZ,
}

impl QConstruct {
    pub const fn as_str(&self) -> &'static str {
        match self {
            QConstruct::AC => "qAC",
            QConstruct::AX => "qAX",
            QConstruct::AU => "qAU",
            QConstruct::Ao => "qAo",
            QConstruct::AO => "qAO",
            QConstruct::AS => "qAS",
            QConstruct::Ar => "qAr",
            QConstruct::AR => "qAR",
            QConstruct::AZ => "qAZ",
        }
    }

    /// The construct for a packet submitted by a logged-in client.
    pub fn for_client(verified: bool) -> Self {
        if verified { QConstruct::AC } else { QConstruct::AX }
    }
}

impl Display for QConstruct {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QConstruct {
    type Err = QConstructFromStrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "qAC" => Ok(QConstruct::AC),
            "qAX" => Ok(QConstruct::AX),
            "qAU" => Ok(QConstruct::AU),
            "qAo" => Ok(QConstruct::Ao),
            "qAO" => Ok(QConstruct::AO),
            "qAS" => Ok(QConstruct::AS),
            "qAr" => Ok(QConstruct::Ar),
            "qAR" => Ok(QConstruct::AR),
            "qAZ" => Ok(QConstruct::AZ),
            _ => {
                Err(QConstructFromStrError {
                    input: s.to_owned(),
                })
            }
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("invalid q-construct: {input}")]
pub struct QConstructFromStrError {
    pub input: String,
}
