//! APRS-IS client
//!
//! A single persistent line-oriented TCP connection to the Internet tier.
//! On connect it sends one login line and then feeds every non-comment
//! line to the packet pipeline. The connection task reconnects forever
//! with exponential backoff; the hostname is resolved again on every
//! attempt so rotating DNS entries behave as intended.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::mpsc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use aprsgate_types::{
    Callsign,
    Packet,
    passcode,
};

use crate::{
    config::AprsIsConfig,
    source::{
        InboundSink,
        LinkState,
        Origin,
        line::LineReader,
    },
};

const COMMAND_QUEUE_SIZE: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
/// silent for three keepalive periods means the connection is dead
const IDLE_TIMEOUT: Duration = Duration::from_secs(180);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

const ENDPOINT: &str = "aprs-is";

/// Handle to the APRS-IS uplink task.
#[derive(Clone, Debug)]
pub struct AprsIsClient {
    command_sender: mpsc::Sender<Command>,
}

impl AprsIsClient {
    pub fn spawn(
        config: AprsIsConfig,
        callsign: Callsign,
        sink: InboundSink,
        shutdown: CancellationToken,
    ) -> Self {
        let (command_sender, command_receiver) = mpsc::channel(COMMAND_QUEUE_SIZE);

        tokio::spawn(async move {
            let reactor = Reactor {
                config,
                callsign,
                sink,
                command_receiver,
                shutdown,
            };
            reactor.run().await;
        });

        Self { command_sender }
    }

    /// Queue one packet for upstream delivery. Dropped with a warning when
    /// the connection is down.
    pub async fn send(&self, packet: Packet) {
        let _ = self.command_sender.send(Command::Send { packet }).await;
    }
}

#[derive(Debug)]
enum Command {
    Send { packet: Packet },
}

#[derive(Debug)]
struct Reactor {
    config: AprsIsConfig,
    callsign: Callsign,
    sink: InboundSink,
    command_receiver: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
}

/// Why a connection attempt or session ended.
#[derive(Debug)]
enum Closed {
    Shutdown,
    HandleDropped,
    Lost,
}

impl Reactor {
    async fn run(mut self) {
        let mut backoff = self.config.reconnect_interval;

        loop {
            self.sink.status(ENDPOINT, LinkState::Connecting).await;

            match self.connect().await {
                Ok(stream) => {
                    backoff = self.config.reconnect_interval;
                    self.sink.status(ENDPOINT, LinkState::Connected).await;

                    match self.run_connection(stream).await {
                        Closed::Shutdown | Closed::HandleDropped => return,
                        Closed::Lost => {}
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        server = %self.config.server,
                        port = self.config.port,
                        %error,
                        "aprs-is connect failed"
                    );
                }
            }

            self.sink.status(ENDPOINT, LinkState::Disconnected).await;

            match self.backoff_and_drain(backoff).await {
                Closed::Shutdown | Closed::HandleDropped => return,
                Closed::Lost => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn connect(&self) -> Result<TcpStream, std::io::Error> {
        let address = (self.config.server.as_str(), self.config.port);
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))?
    }

    fn login_line(&self) -> String {
        let client_passcode = self
            .config
            .passcode
            .unwrap_or_else(|| i32::from(passcode(&self.callsign)));

        let mut line = format!(
            "user {} pass {} vers {} {}",
            self.callsign, client_passcode, self.config.software, self.config.version
        );
        if let Some(filter) = &self.config.filter {
            line.push_str(" filter ");
            line.push_str(filter);
        }
        line.push_str("\r\n");
        line
    }

    async fn run_connection(&mut self, stream: TcpStream) -> Closed {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = LineReader::new(read_half);

        if let Err(error) = write_half.write_all(self.login_line().as_bytes()).await {
            tracing::warn!(%error, "aprs-is login write failed");
            return Closed::Lost;
        }

        let keepalive_comment = format!("# {} keepalive\r\n", self.config.software);
        let mut keepalive =
            tokio::time::interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Closed::Shutdown,

                _ = keepalive.tick() => {
                    if let Err(error) = write_half.write_all(keepalive_comment.as_bytes()).await {
                        tracing::warn!(%error, "aprs-is keepalive write failed");
                        return Closed::Lost;
                    }
                }

                command = self.command_receiver.recv() => {
                    match command {
                        Some(Command::Send { packet }) => {
                            if let Err(error) =
                                write_half.write_all(&packet.encode_line()).await
                            {
                                tracing::warn!(%error, "aprs-is send failed");
                                return Closed::Lost;
                            }
                        }
                        None => return Closed::HandleDropped,
                    }
                }

                result = tokio::time::timeout(IDLE_TIMEOUT, lines.next()) => {
                    match result {
                        Err(_) => {
                            tracing::warn!("aprs-is silent too long, forcing reconnect");
                            return Closed::Lost;
                        }
                        Ok(None) => {
                            tracing::warn!("aprs-is connection closed");
                            return Closed::Lost;
                        }
                        Ok(Some(Err(error))) => {
                            tracing::warn!(%error, "aprs-is read failed");
                            return Closed::Lost;
                        }
                        Ok(Some(Ok(line))) => self.handle_line(&line).await,
                    }
                }
            }
        }
    }

    async fn handle_line(&self, line: &[u8]) {
        if line.first() == Some(&b'#') {
            // server comment; the interesting one is the login response
            let comment = String::from_utf8_lossy(line);
            if comment.contains("logresp") {
                let verified = !comment.contains("unverified");
                tracing::info!(%comment, verified, "aprs-is login response");
            }
            else {
                tracing::trace!(%comment, "aprs-is server comment");
            }
            return;
        }

        match Packet::parse(line) {
            Ok(packet) => {
                self.sink.packet(Origin::AprsIs, packet).await;
            }
            Err(error) => {
                tracing::debug!(
                    line = %String::from_utf8_lossy(line),
                    %error,
                    "unparseable aprs-is line"
                );
                self.sink.parse_error(Origin::AprsIs).await;
            }
        }
    }

    /// Sleep out the reconnect backoff, dropping queued sends with a
    /// warning instead of letting callers block on a dead link.
    async fn backoff_and_drain(&mut self, backoff: Duration) -> Closed {
        let deadline = Instant::now() + backoff;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Closed::Shutdown,
                _ = tokio::time::sleep_until(deadline) => return Closed::Lost,
                command = self.command_receiver.recv() => {
                    match command {
                        Some(Command::Send { packet }) => {
                            tracing::warn!(%packet, "aprs-is not connected, dropping packet");
                        }
                        None => return Closed::HandleDropped,
                    }
                }
            }
        }
    }
}
