//! Downstream client broker.
//!
//! Single owner of the client session table, the ACL and the history
//! ring. Session handlers and the coordinator talk to it through
//! commands; it never touches a socket itself. One slow client cannot
//! stall another: outbound delivery uses `try_send` into each session's
//! bounded queue and overflowing sessions are disconnected.

use std::{
    collections::HashMap,
    fmt::{
        Debug,
        Display,
    },
    net::SocketAddr,
    time::Instant,
};

use bytes::Bytes;
use tokio::sync::{
    mpsc,
    oneshot,
};
use tokio_util::sync::CancellationToken;

use aprsgate_types::{
    Callsign,
    Packet,
    passcode,
};

use crate::{
    acl::Acl,
    config::{
        AclConfig,
        HistoryConfig,
        ServerConfig,
    },
    filter::FilterList,
    history::HistoryBuffer,
};

const COMMAND_QUEUE_SIZE: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl ClientId {
    #[cfg(test)]
    pub(crate) fn for_test(id: u64) -> Self {
        Self(id)
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectReject {
    #[error("server full")]
    ServerFull,
    #[error("address denied")]
    AclDenied,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LoginReject {
    #[error("callsign denied")]
    AclDenied,
    #[error("already logged in")]
    AlreadyLoggedIn,
}

#[derive(Debug)]
pub struct LoginAck {
    pub verified: bool,
    /// History to replay, oldest first; the session handler paces it out.
    pub replay: Vec<Packet>,
}

/// Cheap-to-clone handle; the work happens in a spawned reactor task.
#[derive(Clone, Debug)]
pub struct Broker {
    command_sender: mpsc::Sender<Command>,
}

impl Broker {
    pub fn spawn(
        server_config: ServerConfig,
        acl_config: AclConfig,
        history_config: HistoryConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (command_sender, command_receiver) = mpsc::channel(COMMAND_QUEUE_SIZE);

        tokio::spawn(async move {
            let reactor = Reactor {
                server_config,
                acl: Acl::new(acl_config),
                history: HistoryBuffer::new(history_config.capacity),
                history_config,
                clients: HashMap::new(),
                next_client_id: 1,
                command_receiver,
                shutdown,
            };
            reactor.run().await;
        });

        Self { command_sender }
    }

    async fn send_command(&self, command: Command) {
        let _ = self.command_sender.send(command).await;
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
        fallback: impl FnOnce() -> T,
    ) -> T {
        let (result_sender, result_receiver) = oneshot::channel();
        self.send_command(build(result_sender)).await;
        result_receiver.await.unwrap_or_else(|_| fallback())
    }

    /// Register a new connection. The returned id identifies the session
    /// in every later command.
    pub async fn connect(
        &self,
        remote_addr: SocketAddr,
        message_sender: mpsc::Sender<Bytes>,
    ) -> Result<ClientId, ConnectReject> {
        self.request(
            |result_sender| {
                Command::Connect {
                    remote_addr,
                    message_sender,
                    result_sender,
                }
            },
            || Err(ConnectReject::ServerFull),
        )
        .await
    }

    /// Process a login line that already parsed. Passcode verification is
    /// advisory: a wrong passcode still logs in, unverified.
    pub async fn login(
        &self,
        client_id: ClientId,
        callsign: Callsign,
        client_passcode: i32,
        filter: Option<FilterList>,
    ) -> Result<LoginAck, LoginReject> {
        self.request(
            |result_sender| {
                Command::Login {
                    client_id,
                    callsign,
                    client_passcode,
                    filter,
                    result_sender,
                }
            },
            || Err(LoginReject::AclDenied),
        )
        .await
    }

    /// Flood-limit check for one submitted line.
    pub async fn allow_send(&self, client_id: ClientId, bytes: usize) -> bool {
        self.request(
            |result_sender| {
                Command::AllowSend {
                    client_id,
                    bytes,
                    result_sender,
                }
            },
            || false,
        )
        .await
    }

    /// Deliver a packet to every matching authenticated client except the
    /// submitter, and append it to the history ring.
    pub async fn broadcast(&self, packet: Packet, exclude: Option<ClientId>) {
        self.send_command(Command::Broadcast { packet, exclude }).await;
    }

    pub async fn disconnect(&self, client_id: ClientId) {
        self.send_command(Command::Disconnect { client_id }).await;
    }

    pub async fn client_count(&self) -> usize {
        self.request(
            |result_sender| Command::ClientCount { result_sender },
            || 0,
        )
        .await
    }

    /// Periodic housekeeping; driven by the coordinator's sweep tick.
    pub async fn sweep(&self) {
        self.send_command(Command::Sweep).await;
    }
}

#[derive(Debug)]
enum Command {
    Connect {
        remote_addr: SocketAddr,
        message_sender: mpsc::Sender<Bytes>,
        result_sender: oneshot::Sender<Result<ClientId, ConnectReject>>,
    },
    Login {
        client_id: ClientId,
        callsign: Callsign,
        client_passcode: i32,
        filter: Option<FilterList>,
        result_sender: oneshot::Sender<Result<LoginAck, LoginReject>>,
    },
    AllowSend {
        client_id: ClientId,
        bytes: usize,
        result_sender: oneshot::Sender<bool>,
    },
    Broadcast {
        packet: Packet,
        exclude: Option<ClientId>,
    },
    Disconnect {
        client_id: ClientId,
    },
    ClientCount {
        result_sender: oneshot::Sender<usize>,
    },
    Sweep,
}

#[derive(Debug)]
struct ClientState {
    remote_addr: SocketAddr,
    callsign: Option<Callsign>,
    authenticated: bool,
    filter: FilterList,
    connected_at: Instant,
    message_sender: mpsc::Sender<Bytes>,
}

#[derive(Debug)]
struct Reactor {
    server_config: ServerConfig,
    acl: Acl,
    history: HistoryBuffer,
    history_config: HistoryConfig,
    clients: HashMap<ClientId, ClientState>,
    next_client_id: u64,
    command_receiver: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
}

impl Reactor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = self.command_receiver.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                remote_addr,
                message_sender,
                result_sender,
            } => {
                let _ = result_sender.send(self.connect(remote_addr, message_sender));
            }
            Command::Login {
                client_id,
                callsign,
                client_passcode,
                filter,
                result_sender,
            } => {
                let _ =
                    result_sender.send(self.login(client_id, callsign, client_passcode, filter));
            }
            Command::AllowSend {
                client_id,
                bytes,
                result_sender,
            } => {
                let allowed = match self.clients.get(&client_id) {
                    Some(client) => {
                        let ip = client.remote_addr.ip();
                        self.acl.allow_send(client_id, ip, bytes, Instant::now())
                    }
                    None => false,
                };
                if !allowed {
                    self.drop_client(client_id, "flood limit exceeded");
                }
                let _ = result_sender.send(allowed);
            }
            Command::Broadcast { packet, exclude } => {
                self.broadcast(packet, exclude);
            }
            Command::Disconnect { client_id } => {
                self.clients.remove(&client_id);
                self.acl.forget_client(client_id);
            }
            Command::ClientCount { result_sender } => {
                let _ = result_sender.send(self.clients.len());
            }
            Command::Sweep => {
                self.acl.sweep(Instant::now());
            }
        }
    }

    fn connect(
        &mut self,
        remote_addr: SocketAddr,
        message_sender: mpsc::Sender<Bytes>,
    ) -> Result<ClientId, ConnectReject> {
        if self.clients.len() >= self.server_config.max_clients {
            return Err(ConnectReject::ServerFull);
        }
        if !self
            .acl
            .allow_connect(remote_addr.ip(), None, Instant::now())
        {
            return Err(ConnectReject::AclDenied);
        }

        let client_id = ClientId(self.next_client_id);
        self.next_client_id += 1;

        self.clients.insert(
            client_id,
            ClientState {
                remote_addr,
                callsign: None,
                authenticated: false,
                filter: FilterList::match_all(),
                connected_at: Instant::now(),
                message_sender,
            },
        );

        tracing::debug!(%client_id, %remote_addr, "client connected");
        Ok(client_id)
    }

    fn login(
        &mut self,
        client_id: ClientId,
        callsign: Callsign,
        client_passcode: i32,
        filter: Option<FilterList>,
    ) -> Result<LoginAck, LoginReject> {
        let Some(client) = self.clients.get(&client_id) else {
            return Err(LoginReject::AclDenied);
        };
        if client.authenticated {
            return Err(LoginReject::AlreadyLoggedIn);
        }

        let ip = client.remote_addr.ip();
        if !self.acl.allow_connect(ip, Some(&callsign), Instant::now()) {
            return Err(LoginReject::AclDenied);
        }

        let verified = client_passcode >= 0 && client_passcode == i32::from(passcode(&callsign));

        let replay = match &filter {
            Some(filter) if !filter.is_match_all() => {
                self.history
                    .query(filter, None, self.history_config.replay_limit)
            }
            _ => Vec::new(),
        };

        let client = self
            .clients
            .get_mut(&client_id)
            .expect("client checked above");
        client.callsign = Some(callsign.clone());
        client.authenticated = true;
        client.filter = filter.unwrap_or_default();

        tracing::info!(
            %client_id,
            %callsign,
            verified,
            uptime = ?client.connected_at.elapsed(),
            "client logged in"
        );

        Ok(LoginAck { verified, replay })
    }

    fn broadcast(&mut self, packet: Packet, exclude: Option<ClientId>) {
        self.history.record(packet.clone(), Instant::now());

        let line = packet.encode_line();
        let mut overflowed = Vec::new();

        for (client_id, client) in &self.clients {
            if Some(*client_id) == exclude || !client.authenticated {
                continue;
            }
            if !client.filter.matches(&packet) {
                continue;
            }

            if client.message_sender.try_send(line.clone()).is_err() {
                overflowed.push(*client_id);
            }
        }

        for client_id in overflowed {
            self.drop_client(client_id, "outbound queue overflow");
        }
    }

    fn drop_client(&mut self, client_id: ClientId, reason: &str) {
        if let Some(client) = self.clients.remove(&client_id) {
            tracing::warn!(%client_id, remote_addr = %client.remote_addr, reason, "dropping client");
        }
        self.acl.forget_client(client_id);
        // dropping the sender closes the session's outbound queue, which
        // its handler treats as a disconnect
    }
}
