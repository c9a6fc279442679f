//! Downstream client server.
//!
//! Line-oriented TCP: banner on accept, a `user … pass …` login within
//! the timeout, then bidirectional packet traffic. Each session owns its
//! socket; everything shared (session table, ACL, history) lives in the
//! broker. The session never blocks on a peer: outbound traffic arrives
//! through the bounded queue registered with the broker.

use std::net::SocketAddr;

use futures_util::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpListener,
        TcpStream,
        tcp::OwnedWriteHalf,
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

use aprsgate_types::{
    Callsign,
    Packet,
};

use crate::{
    broker::{
        Broker,
        ClientId,
        ConnectReject,
        LoginReject,
    },
    config::ServerConfig,
    filter::FilterList,
    source::{
        InboundSink,
        Origin,
        line::{
            self,
            LineReader,
        },
    },
};

const AGENT: &str = concat!("aprsgate ", env!("CARGO_PKG_VERSION"));

/// Periodic server comment so idle clients see a live connection.
const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(20);

/// Bind the configured address and serve until cancelled.
pub async fn run(
    config: ServerConfig,
    server_call: Callsign,
    broker: Broker,
    sink: InboundSink,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(config.listen).await?;
    tracing::info!(listen = %config.listen, "client server listening");
    serve(listener, config, server_call, broker, sink, shutdown).await
}

/// Accept loop. Accept errors are logged and do not take the listener
/// down.
pub async fn serve(
    listener: TcpListener,
    config: ServerConfig,
    server_call: Callsign,
    broker: Broker,
    sink: InboundSink,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, remote_addr)) => {
                        tracing::debug!(%remote_addr, "new connection");
                        let session = Session {
                            config: config.clone(),
                            server_call: server_call.clone(),
                            broker: broker.clone(),
                            sink: sink.clone(),
                            remote_addr,
                            shutdown: shutdown.clone(),
                        };
                        tokio::spawn(session.run(stream));
                    }
                    Err(error) => {
                        tracing::warn!(%error, "accept failed");
                    }
                }
            }
        }
    }

    Ok(())
}

/// A parsed `user <call> pass <pass> vers <sw> <ver> [filter …]` line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginRequest {
    pub callsign: String,
    pub passcode: i32,
    pub software: Option<String>,
    pub version: Option<String>,
    pub filter: Option<String>,
}

/// Parse a login line. The filter argument is the verbatim remainder and
/// may contain spaces.
pub fn parse_login(line: &str) -> Option<LoginRequest> {
    let mut tokens = line.split_whitespace();

    if !tokens.next()?.eq_ignore_ascii_case("user") {
        return None;
    }
    let callsign = tokens.next()?.to_owned();

    if !tokens.next()?.eq_ignore_ascii_case("pass") {
        return None;
    }
    let passcode = tokens.next()?.parse::<i32>().unwrap_or(-1);

    let mut software = None;
    let mut version = None;
    let mut filter = None;

    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case("vers") {
            software = tokens.next().map(str::to_owned);
            version = tokens.next().map(str::to_owned);
        }
        else if token.eq_ignore_ascii_case("filter") {
            let rest: Vec<&str> = tokens.collect();
            if !rest.is_empty() {
                filter = Some(rest.join(" "));
            }
            break;
        }
    }

    Some(LoginRequest {
        callsign,
        passcode,
        software,
        version,
        filter,
    })
}

#[derive(Debug)]
struct Session {
    config: ServerConfig,
    server_call: Callsign,
    broker: Broker,
    sink: InboundSink,
    remote_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Session {
    async fn run(self, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = LineReader::new(read_half);

        let (outbound_sender, mut outbound_receiver) =
            mpsc::channel(self.config.client_queue_size);

        let client_id = match self.broker.connect(self.remote_addr, outbound_sender).await {
            Ok(client_id) => client_id,
            Err(reject) => {
                let comment = match reject {
                    ConnectReject::ServerFull => "# server full\r\n",
                    ConnectReject::AclDenied => "# access denied\r\n",
                };
                let _ = write_half.write_all(comment.as_bytes()).await;
                return;
            }
        };

        if write_half
            .write_all(format!("# {AGENT}\r\n").as_bytes())
            .await
            .is_err()
        {
            self.broker.disconnect(client_id).await;
            return;
        }

        let verified = match self.login_phase(&mut lines, &mut write_half, client_id).await {
            Some(verified) => verified,
            None => {
                self.broker.disconnect(client_id).await;
                return;
            }
        };

        let origin = Origin::Client {
            id: client_id,
            verified,
        };

        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
            KEEPALIVE_INTERVAL,
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                _ = keepalive.tick() => {
                    let comment = format!(
                        "# {AGENT} {} {}\r\n",
                        chrono::Utc::now().format("%e %b %Y %H:%M:%S GMT"),
                        self.server_call,
                    );
                    if write_half.write_all(comment.as_bytes()).await.is_err() {
                        break;
                    }
                }

                line = lines.next() => {
                    match line {
                        None => break,
                        Some(Err(line::Error::MaxLineLengthExceeded)) => {
                            tracing::debug!(%client_id, "oversized line from client");
                        }
                        Some(Err(error)) => {
                            tracing::debug!(%client_id, %error, "client read failed");
                            break;
                        }
                        Some(Ok(line)) => {
                            if line.first() == Some(&b'#') {
                                // client keepalive comment
                                continue;
                            }
                            if !self.broker.allow_send(client_id, line.len()).await {
                                let _ = write_half
                                    .write_all(b"# flood limit exceeded\r\n")
                                    .await;
                                break;
                            }
                            match Packet::parse(&line) {
                                Ok(packet) => {
                                    self.sink.packet(origin, packet).await;
                                }
                                Err(error) => {
                                    tracing::debug!(
                                        %client_id,
                                        %error,
                                        line = %String::from_utf8_lossy(&line),
                                        "unparseable client line"
                                    );
                                    self.sink.parse_error(origin).await;
                                }
                            }
                        }
                    }
                }

                outbound = outbound_receiver.recv() => {
                    match outbound {
                        // the broker dropped us (overflow or ban)
                        None => break,
                        Some(line) => {
                            if write_half.write_all(&line).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        self.broker.disconnect(client_id).await;
        tracing::debug!(%client_id, remote_addr = %self.remote_addr, "session closed");
    }

    /// Read and answer the login line. Returns the verified flag, or
    /// `None` when the session must close.
    async fn login_phase<R>(
        &self,
        lines: &mut LineReader<R>,
        write_half: &mut OwnedWriteHalf,
        client_id: ClientId,
    ) -> Option<bool>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let line = tokio::time::timeout(self.config.login_timeout, lines.next())
            .await
            .ok()??
            .ok()?;
        let line = String::from_utf8(line.to_vec()).ok()?;

        let Some(request) = parse_login(&line) else {
            let _ = write_half.write_all(b"# expected login\r\n").await;
            return None;
        };

        let Ok(callsign) = request.callsign.parse::<Callsign>() else {
            let _ = write_half
                .write_all(
                    format!(
                        "# logresp {} invalid, server {}\r\n",
                        request.callsign, self.server_call
                    )
                    .as_bytes(),
                )
                .await;
            return None;
        };

        let filter = match &request.filter {
            Some(filter) => {
                match FilterList::parse(filter) {
                    Ok(filter) => Some(filter),
                    Err(error) => {
                        tracing::debug!(%client_id, %error, "unparseable filter, ignoring");
                        let _ = write_half.write_all(b"# filter ignored\r\n").await;
                        None
                    }
                }
            }
            None => None,
        };

        let ack = match self
            .broker
            .login(client_id, callsign.clone(), request.passcode, filter)
            .await
        {
            Ok(ack) => ack,
            Err(LoginReject::AclDenied) => {
                let _ = write_half.write_all(b"# access denied\r\n").await;
                return None;
            }
            Err(LoginReject::AlreadyLoggedIn) => {
                let _ = write_half.write_all(b"# already logged in\r\n").await;
                return None;
            }
        };

        let status = if ack.verified { "verified" } else { "unverified" };
        write_half
            .write_all(
                format!("# logresp {} {}, server {}\r\n", callsign, status, self.server_call)
                    .as_bytes(),
            )
            .await
            .ok()?;

        for packet in &ack.replay {
            write_half.write_all(&packet.encode_line()).await.ok()?;
            tokio::time::sleep(self.config.replay_pacing).await;
        }

        Some(ack.verified)
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{
            AsyncReadExt,
            AsyncWriteExt,
        },
        net::TcpStream,
        sync::mpsc,
    };
    use tokio_util::sync::CancellationToken;

    use crate::{
        broker::Broker,
        config::{
            AclConfig,
            HistoryConfig,
            ServerConfig,
        },
        server::parse_login,
        source::{
            InboundSink,
            Origin,
            SourceEvent,
        },
    };

    #[test]
    fn it_parses_full_login_lines() {
        let request =
            parse_login("user N0CALL-5 pass 13023 vers aprsgate 0.2.0 filter r/35/-106/100 t/m")
                .unwrap();
        assert_eq!(request.callsign, "N0CALL-5");
        assert_eq!(request.passcode, 13023);
        assert_eq!(request.software.as_deref(), Some("aprsgate"));
        assert_eq!(request.version.as_deref(), Some("0.2.0"));
        assert_eq!(request.filter.as_deref(), Some("r/35/-106/100 t/m"));
    }

    #[test]
    fn it_parses_minimal_login_lines() {
        let request = parse_login("user N0CALL pass -1").unwrap();
        assert_eq!(request.callsign, "N0CALL");
        assert_eq!(request.passcode, -1);
        assert_eq!(request.software, None);
        assert_eq!(request.filter, None);
    }

    #[test]
    fn it_rejects_non_login_lines() {
        assert_eq!(parse_login("N0CALL>APRS:>status"), None);
        assert_eq!(parse_login("user N0CALL"), None);
        assert_eq!(parse_login(""), None);
    }

    async fn start_server() -> (std::net::SocketAddr, mpsc::Receiver<SourceEvent>, CancellationToken)
    {
        let shutdown = CancellationToken::new();
        let broker = Broker::spawn(
            ServerConfig::default(),
            AclConfig::default(),
            HistoryConfig::default(),
            shutdown.clone(),
        );
        let (event_sender, events) = mpsc::channel(16);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(super::serve(
            listener,
            ServerConfig::default(),
            "GATE-10".parse().unwrap(),
            broker,
            InboundSink::new(event_sender),
            shutdown.clone(),
        ));

        (address, events, shutdown)
    }

    async fn read_line(socket: &mut TcpStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            socket.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            if byte[0] != b'\r' {
                line.push(byte[0]);
            }
        }
        String::from_utf8(line).unwrap()
    }

    #[tokio::test]
    async fn a_session_logs_in_and_submits_packets() {
        let (address, mut events, shutdown) = start_server().await;

        let mut socket = TcpStream::connect(address).await.unwrap();
        assert!(read_line(&mut socket).await.starts_with("# aprsgate"));

        socket
            .write_all(b"user N0CALL pass 13023 vers test 1.0\r\n")
            .await
            .unwrap();
        assert_eq!(
            read_line(&mut socket).await,
            "# logresp N0CALL verified, server GATE-10"
        );

        socket
            .write_all(b"N0CALL>APRS:>from client\r\n")
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            SourceEvent::Packet { origin, packet } => {
                assert!(matches!(origin, Origin::Client { verified: true, .. }));
                assert_eq!(&packet.data[..], b">from client");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        shutdown.cancel();
    }

    #[tokio::test]
    async fn an_invalid_callsign_is_refused() {
        let (address, _events, shutdown) = start_server().await;

        let mut socket = TcpStream::connect(address).await.unwrap();
        let _banner = read_line(&mut socket).await;

        socket
            .write_all(b"user NOT+VALID pass -1\r\n")
            .await
            .unwrap();
        assert_eq!(
            read_line(&mut socket).await,
            "# logresp NOT+VALID invalid, server GATE-10"
        );

        // the server closes the connection
        let mut buffer = [0u8; 16];
        assert_eq!(socket.read(&mut buffer).await.unwrap(), 0);

        shutdown.cancel();
    }
}
