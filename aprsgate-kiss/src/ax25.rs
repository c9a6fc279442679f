//! AX.25 UI frame codec
//!
//! APRS rides in AX.25 unnumbered-information frames: destination and
//! source addresses, up to eight digipeater addresses, control `0x03`,
//! PID `0xF0` (no layer 3), then the information field. Address bytes are
//! ASCII shifted left by one bit and space padded; the trailing SSID byte
//! carries the SSID in bits 1-4, the has-been-repeated bit in bit 7 and
//! the address-extension bit in bit 0.

use bytes::{
    BufMut,
    Bytes,
    BytesMut,
};

use aprsgate_types::{
    Callsign,
    MAX_PATH_LENGTH,
    Packet,
    PathElement,
};

const ADDRESS_LENGTH: usize = 7;
const CONTROL_UI: u8 = 0x03;
const PID_NO_LAYER_3: u8 = 0xf0;

#[derive(Debug, thiserror::Error)]
#[error("ax.25 frame error")]
pub enum Error {
    #[error("frame truncated at {length} bytes")]
    Truncated { length: usize },
    #[error("invalid address field")]
    InvalidAddress,
    #[error("not a ui frame (control {control:#04x}, pid {pid:?})")]
    NotUi { control: u8, pid: Option<u8> },
    #[error("path too long: {length} digipeaters")]
    PathTooLong { length: usize },
}

/// An AX.25 station address: callsign, SSID and the h ("has been
/// repeated") bit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub callsign: Callsign,
    pub repeated: bool,
}

impl Address {
    pub fn new(callsign: Callsign) -> Self {
        Self {
            callsign,
            repeated: false,
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let base: String = bytes[..6]
            .iter()
            .map(|byte| char::from(byte >> 1))
            .collect();
        let ssid_byte = bytes[6];
        let ssid = (ssid_byte >> 1) & 0x0f;

        let callsign =
            Callsign::new(base.trim_end_matches(' '), ssid).map_err(|_| Error::InvalidAddress)?;

        Ok(Self {
            callsign,
            repeated: ssid_byte & 0x80 != 0,
        })
    }

    fn encode_into(&self, buffer: &mut BytesMut, last: bool) {
        let base = self.callsign.base().as_bytes();
        for index in 0..6 {
            let byte = base.get(index).copied().unwrap_or(b' ');
            buffer.put_u8(byte << 1);
        }

        let mut ssid_byte = ((self.callsign.ssid() & 0x0f) << 1) | 0x60;
        if self.repeated {
            ssid_byte |= 0x80;
        }
        if last {
            ssid_byte |= 0x01;
        }
        buffer.put_u8(ssid_byte);
    }
}

/// A decoded AX.25 UI frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UiFrame {
    pub destination: Address,
    pub source: Address,
    pub via: Vec<Address>,
    pub info: Bytes,
}

impl UiFrame {
    /// Decode a raw AX.25 frame (the payload of a KISS data frame).
    ///
    /// Anything that is not a UI frame with PID `0xF0` is rejected; the
    /// connected-mode frame types never carry APRS.
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let err_truncated = || Error::Truncated { length: data.len() };

        if data.len() < 2 * ADDRESS_LENGTH + 2 {
            return Err(err_truncated());
        }

        let destination = Address::decode(&data[..ADDRESS_LENGTH])?;
        let source = Address::decode(&data[ADDRESS_LENGTH..2 * ADDRESS_LENGTH])?;

        let mut position = 2 * ADDRESS_LENGTH;
        let mut via = Vec::new();
        let mut last = data[position - 1] & 0x01 != 0;
        while !last {
            let field = data
                .get(position..position + ADDRESS_LENGTH)
                .ok_or_else(err_truncated)?;
            via.push(Address::decode(field)?);
            last = field[6] & 0x01 != 0;
            position += ADDRESS_LENGTH;
            if via.len() > MAX_PATH_LENGTH {
                return Err(Error::PathTooLong { length: via.len() });
            }
        }

        let control = *data.get(position).ok_or_else(err_truncated)?;
        let pid = data.get(position + 1).copied();
        if control & 0xef != CONTROL_UI || pid != Some(PID_NO_LAYER_3) {
            return Err(Error::NotUi { control, pid });
        }

        Ok(Self {
            destination,
            source,
            via,
            info: Bytes::copy_from_slice(&data[position + 2..]),
        })
    }

    /// Encode as a raw AX.25 frame, ready to wrap into a KISS data frame.
    pub fn encode(&self) -> Bytes {
        let mut buffer =
            BytesMut::with_capacity((2 + self.via.len()) * ADDRESS_LENGTH + 2 + self.info.len());

        self.destination.encode_into(&mut buffer, false);
        self.source.encode_into(&mut buffer, self.via.is_empty());
        for (index, address) in self.via.iter().enumerate() {
            address.encode_into(&mut buffer, index + 1 == self.via.len());
        }
        buffer.put_u8(CONTROL_UI);
        buffer.put_u8(PID_NO_LAYER_3);
        buffer.put_slice(&self.info);

        buffer.freeze()
    }

    /// Build a frame from a packet headed for RF.
    ///
    /// Every path element must be expressible as an AX.25 address;
    /// q-constructs and `TCPIP` markers have to be stripped by the gate
    /// before a packet reaches an RF interface.
    pub fn from_packet(packet: &Packet) -> Result<Self, Error> {
        let via = packet
            .path
            .iter()
            .map(|element| {
                let callsign = element
                    .alias
                    .parse::<Callsign>()
                    .map_err(|_| Error::InvalidAddress)?;
                Ok(Address {
                    callsign,
                    repeated: element.used,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self {
            destination: Address::new(packet.destination.clone()),
            source: Address::new(packet.source.clone()),
            via,
            info: packet.data.clone(),
        })
    }

    /// The packet carried by this frame.
    pub fn to_packet(&self) -> Packet {
        Packet {
            source: self.source.callsign.clone(),
            destination: self.destination.callsign.clone(),
            path: self
                .via
                .iter()
                .map(|address| {
                    PathElement {
                        alias: address.callsign.to_string(),
                        used: address.repeated,
                    }
                })
                .collect(),
            data: self.info.clone(),
        }
    }
}
