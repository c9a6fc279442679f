//! UDP submission socket.
//!
//! Fire-and-forget ingestion for local producers (trackers, scripts).
//! A datagram is either a literal TNC2 line, a KISS data frame (first
//! byte `0xC0`), or a JSON object `{source, destination?, path?, data}`.
//! Invalid datagrams are dropped with a debug log; nothing is ever sent
//! back.

use bytes::Bytes;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use aprsgate_kiss::{
    Command as KissCommand,
    Decoder,
    ax25::UiFrame,
};
use aprsgate_types::{
    Callsign,
    Packet,
    PathElement,
};

use crate::{
    config::UdpConfig,
    source::{
        InboundSink,
        Origin,
    },
};

const MAX_DATAGRAM_SIZE: usize = 2048;

#[derive(Debug, Deserialize)]
struct JsonSubmission {
    source: Callsign,
    destination: Option<Callsign>,
    #[serde(default)]
    path: Vec<PathElement>,
    data: String,
}

pub fn spawn(config: UdpConfig, sink: InboundSink, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let socket = match UdpSocket::bind(config.listen).await {
            Ok(socket) => socket,
            Err(error) => {
                tracing::error!(listen = %config.listen, %error, "udp bind failed");
                return;
            }
        };
        tracing::info!(listen = %config.listen, "udp submission socket ready");

        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((length, remote_addr)) => {
                            let datagram = &buffer[..length];
                            match decode_datagram(datagram) {
                                Some(packet) => {
                                    tracing::debug!(%remote_addr, %packet, "udp submission");
                                    sink.packet(Origin::Udp, packet).await;
                                }
                                None => {
                                    tracing::debug!(
                                        %remote_addr,
                                        length,
                                        "dropping invalid udp datagram"
                                    );
                                    sink.parse_error(Origin::Udp).await;
                                }
                            }
                        }
                        Err(error) => {
                            tracing::warn!(%error, "udp receive failed");
                        }
                    }
                }
            }
        }
    });
}

/// Sniff the payload format and decode one packet from it.
fn decode_datagram(datagram: &[u8]) -> Option<Packet> {
    match datagram.first()? {
        0xc0 => {
            let frame = Decoder::decode_buffer(datagram)
                .into_iter()
                .find(|frame| frame.command == KissCommand::Data)?;
            Some(UiFrame::decode(&frame.payload).ok()?.to_packet())
        }
        b'{' => {
            let submission: JsonSubmission = serde_json::from_slice(datagram).ok()?;
            Some(Packet {
                source: submission.source,
                destination: submission
                    .destination
                    .unwrap_or_else(|| "APRS".parse().expect("valid default tocall")),
                path: submission.path,
                data: Bytes::from(submission.data.into_bytes()),
            })
        }
        _ => Packet::parse(datagram).ok(),
    }
}

#[cfg(test)]
mod tests {
    use aprsgate_kiss::{
        Frame,
        ax25::UiFrame,
    };
    use aprsgate_types::Packet;

    use crate::source::udp::decode_datagram;

    #[test]
    fn it_decodes_literal_tnc2_lines() {
        let packet = decode_datagram(b"N0CALL>APRS,WIDE1-1:>hello\r\n").unwrap();
        assert_eq!(packet.source.to_string(), "N0CALL");
        assert_eq!(&packet.data[..], b">hello");
    }

    #[test]
    fn it_decodes_kiss_framed_datagrams() {
        let inner = Packet::parse(b"N0CALL>APRS:>kiss").unwrap();
        let datagram = Frame::data(0, UiFrame::from_packet(&inner).unwrap().encode()).encode();

        let packet = decode_datagram(&datagram).unwrap();
        assert_eq!(&packet.encode()[..], b"N0CALL>APRS:>kiss");
    }

    #[test]
    fn it_decodes_json_submissions() {
        let packet = decode_datagram(
            br#"{"source": "N0CALL-9", "path": ["WIDE1-1"], "data": ">from json"}"#,
        )
        .unwrap();
        assert_eq!(packet.source.to_string(), "N0CALL-9");
        assert_eq!(packet.destination.to_string(), "APRS");
        assert_eq!(packet.path[0].to_string(), "WIDE1-1");
        assert_eq!(&packet.data[..], b">from json");
    }

    #[test]
    fn invalid_datagrams_are_rejected() {
        assert!(decode_datagram(b"").is_none());
        assert!(decode_datagram(b"not a packet").is_none());
        assert!(decode_datagram(b"{\"source\": \"BAD CALL\"}").is_none());
        assert!(decode_datagram(&[0xc0, 0x00, 0x01, 0xc0]).is_none());
    }
}
