//! Packet sources: the APRS-IS uplink, KISS RF interfaces, the UDP
//! submission socket, and the shared line reader for the text protocols.
//!
//! Sources never hold a reference back to the coordinator; they deliver
//! through an [`InboundSink`], a typed sender for inbound-from-wire
//! events.

pub mod is;
pub mod kiss;
pub mod line;
pub mod udp;

use tokio::sync::mpsc;

use aprsgate_types::Packet;

use crate::broker::ClientId;

/// Where a packet entered the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// An RF interface, by its index in the configuration.
    Rf { interface: usize },
    AprsIs,
    /// A downstream client session.
    Client { id: ClientId, verified: bool },
    Udp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug)]
pub enum SourceEvent {
    Packet {
        origin: Origin,
        packet: Packet,
    },
    ParseError {
        origin: Origin,
    },
    Status {
        endpoint: String,
        state: LinkState,
    },
}

/// The sink handed to every source task.
#[derive(Clone, Debug)]
pub struct InboundSink {
    sender: mpsc::Sender<SourceEvent>,
}

impl InboundSink {
    pub fn new(sender: mpsc::Sender<SourceEvent>) -> Self {
        Self { sender }
    }

    pub async fn packet(&self, origin: Origin, packet: Packet) {
        let _ = self
            .sender
            .send(SourceEvent::Packet { origin, packet })
            .await;
    }

    pub async fn parse_error(&self, origin: Origin) {
        let _ = self.sender.send(SourceEvent::ParseError { origin }).await;
    }

    pub async fn status(&self, endpoint: impl Into<String>, state: LinkState) {
        let _ = self
            .sender
            .send(SourceEvent::Status {
                endpoint: endpoint.into(),
                state,
            })
            .await;
    }
}
