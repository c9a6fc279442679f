//! KISS-over-TCP RF interface.
//!
//! One task per configured TNC endpoint. The reader side turns KISS data
//! frames into packets via the AX.25 codec and pushes them into the
//! pipeline as RF-origin traffic; the writer side drains the transmit
//! queue. Non-data KISS frames are ignored. Everything here stays
//! byte-oriented.

use std::time::Duration;

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::mpsc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use aprsgate_kiss::{
    Command as KissCommand,
    Frame,
    FrameReader,
    ax25::UiFrame,
};
use aprsgate_types::Packet;

use crate::{
    config::RfInterfaceConfig,
    source::{
        InboundSink,
        LinkState,
        Origin,
    },
};

const COMMAND_QUEUE_SIZE: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Handle to one RF interface task.
#[derive(Clone, Debug)]
pub struct RfInterface {
    command_sender: mpsc::Sender<Command>,
}

impl RfInterface {
    pub fn spawn(
        config: RfInterfaceConfig,
        index: usize,
        sink: InboundSink,
        shutdown: CancellationToken,
    ) -> Self {
        let (command_sender, command_receiver) = mpsc::channel(COMMAND_QUEUE_SIZE);

        tokio::spawn(async move {
            let reactor = Reactor {
                config,
                index,
                sink,
                command_receiver,
                shutdown,
            };
            reactor.run().await;
        });

        Self { command_sender }
    }

    /// Queue one packet for transmission. Dropped with a warning when the
    /// TNC link is down.
    pub async fn transmit(&self, packet: Packet) {
        let _ = self.command_sender.send(Command::Transmit { packet }).await;
    }
}

#[derive(Debug)]
enum Command {
    Transmit { packet: Packet },
}

#[derive(Debug)]
enum Closed {
    Shutdown,
    HandleDropped,
    Lost,
}

#[derive(Debug)]
struct Reactor {
    config: RfInterfaceConfig,
    index: usize,
    sink: InboundSink,
    command_receiver: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
}

impl Reactor {
    async fn run(mut self) {
        let mut backoff = self.config.reconnect_interval;

        loop {
            self.sink
                .status(self.config.name.clone(), LinkState::Connecting)
                .await;

            match self.connect().await {
                Ok(stream) => {
                    backoff = self.config.reconnect_interval;
                    tracing::info!(
                        interface = %self.config.name,
                        address = %self.config.address,
                        "tnc connected"
                    );
                    self.sink
                        .status(self.config.name.clone(), LinkState::Connected)
                        .await;

                    match self.run_connection(stream).await {
                        Closed::Shutdown | Closed::HandleDropped => return,
                        Closed::Lost => {}
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        interface = %self.config.name,
                        address = %self.config.address,
                        %error,
                        "tnc connect failed"
                    );
                }
            }

            self.sink
                .status(self.config.name.clone(), LinkState::Disconnected)
                .await;

            match self.backoff_and_drain(backoff).await {
                Closed::Shutdown | Closed::HandleDropped => return,
                Closed::Lost => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn connect(&self) -> Result<TcpStream, std::io::Error> {
        tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect(self.config.address.as_str()),
        )
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))?
    }

    async fn run_connection(&mut self, stream: TcpStream) -> Closed {
        let (read_half, mut write_half) = stream.into_split();
        let mut frames = FrameReader::new(read_half);
        let mut write_buffer = BytesMut::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Closed::Shutdown,

                command = self.command_receiver.recv() => {
                    match command {
                        Some(Command::Transmit { packet }) => {
                            let frame = match UiFrame::from_packet(&packet) {
                                Ok(frame) => frame,
                                Err(error) => {
                                    tracing::error!(
                                        %packet,
                                        %error,
                                        "packet not expressible as ax.25, not transmitting"
                                    );
                                    continue;
                                }
                            };

                            write_buffer.clear();
                            Frame::data(self.config.port, frame.encode())
                                .encode_into(&mut write_buffer);
                            if let Err(error) = write_half.write_all(&write_buffer).await {
                                tracing::warn!(
                                    interface = %self.config.name,
                                    %error,
                                    "tnc write failed"
                                );
                                return Closed::Lost;
                            }
                        }
                        None => return Closed::HandleDropped,
                    }
                }

                frame = frames.next() => {
                    match frame {
                        None => {
                            tracing::warn!(interface = %self.config.name, "tnc closed connection");
                            return Closed::Lost;
                        }
                        Some(Err(error)) => {
                            tracing::warn!(interface = %self.config.name, %error, "tnc read failed");
                            return Closed::Lost;
                        }
                        Some(Ok(frame)) => self.handle_frame(frame).await,
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, frame: Frame) {
        if frame.command != KissCommand::Data {
            tracing::trace!(?frame, "ignoring non-data kiss frame");
            return;
        }

        match UiFrame::decode(&frame.payload) {
            Ok(ui_frame) => {
                let packet = ui_frame.to_packet();
                tracing::debug!(interface = %self.config.name, %packet, "rf packet");
                self.sink
                    .packet(
                        Origin::Rf {
                            interface: self.index,
                        },
                        packet,
                    )
                    .await;
            }
            Err(error) => {
                tracing::debug!(
                    interface = %self.config.name,
                    %error,
                    "undecodable ax.25 frame"
                );
                self.sink
                    .parse_error(Origin::Rf {
                        interface: self.index,
                    })
                    .await;
            }
        }
    }

    async fn backoff_and_drain(&mut self, backoff: Duration) -> Closed {
        let deadline = Instant::now() + backoff;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Closed::Shutdown,
                _ = tokio::time::sleep_until(deadline) => return Closed::Lost,
                command = self.command_receiver.recv() => {
                    match command {
                        Some(Command::Transmit { packet }) => {
                            tracing::warn!(
                                interface = %self.config.name,
                                %packet,
                                "tnc not connected, dropping packet"
                            );
                        }
                        None => return Closed::HandleDropped,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{
            AsyncReadExt,
            AsyncWriteExt,
        },
        net::TcpListener,
        sync::mpsc,
    };
    use tokio_util::sync::CancellationToken;

    use aprsgate_kiss::{
        Decoder,
        Frame,
        ax25::UiFrame,
    };
    use aprsgate_types::Packet;

    use crate::{
        config::RfInterfaceConfig,
        source::{
            InboundSink,
            Origin,
            SourceEvent,
            kiss::RfInterface,
        },
    };

    fn config(port: u16) -> RfInterfaceConfig {
        serde_json::from_str(&format!(
            r#"{{"name": "tnc0", "address": "127.0.0.1:{port}"}}"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn received_kiss_frames_become_rf_packets() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (event_sender, mut events) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let _interface = RfInterface::spawn(
            config(port),
            0,
            InboundSink::new(event_sender),
            shutdown.clone(),
        );

        let (mut socket, _) = listener.accept().await.unwrap();

        let packet = Packet::parse(b"N0CALL>APRS,WIDE1-1:!3553.50N/10602.50W>").unwrap();
        let frame = Frame::data(0, UiFrame::from_packet(&packet).unwrap().encode());
        socket.write_all(&frame.encode()).await.unwrap();

        loop {
            match events.recv().await.unwrap() {
                SourceEvent::Packet { origin, packet } => {
                    assert_eq!(origin, Origin::Rf { interface: 0 });
                    assert_eq!(packet.source.to_string(), "N0CALL");
                    break;
                }
                SourceEvent::Status { .. } => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn transmitted_packets_are_kiss_framed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (event_sender, _events) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let interface = RfInterface::spawn(
            config(port),
            0,
            InboundSink::new(event_sender),
            shutdown.clone(),
        );

        let (mut socket, _) = listener.accept().await.unwrap();

        interface
            .transmit(Packet::parse(b"N0CALL>APRS,WIDE2-1:>test").unwrap())
            .await;

        let mut buffer = vec![0u8; 256];
        let read = socket.read(&mut buffer).await.unwrap();
        let frames = Decoder::decode_buffer(&buffer[..read]);
        assert_eq!(frames.len(), 1);

        let decoded = UiFrame::decode(&frames[0].payload).unwrap();
        assert_eq!(
            &decoded.to_packet().encode()[..],
            b"N0CALL>APRS,WIDE2-1:>test"
        );

        shutdown.cancel();
    }
}
