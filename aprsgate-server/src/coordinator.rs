//! Coordinator
//!
//! The owning task of the packet plane. Every source delivers into its
//! event channel; it runs the per-direction pipelines (duplicate filter,
//! digipeater hand-off, RF↔IS gating, q-construct normalization), feeds
//! admitted packets to the broker for history and broadcast, emits
//! beacons and keeps the stats counters.

use std::time::{
    Duration,
    Instant,
};

use tokio::sync::{
    mpsc,
    oneshot,
};
use tokio_util::sync::CancellationToken;

use aprsgate_types::{
    Callsign,
    Packet,
    PathElement,
    Position,
    position,
};

use crate::{
    broker::Broker,
    config::Config,
    dedup::DuplicateFilter,
    digipeater::DigipeaterHandle,
    gate::RfGate,
    qpath,
    source::{
        InboundSink,
        Origin,
        SourceEvent,
        is::AprsIsClient,
        kiss::RfInterface,
    },
};

const COMMAND_QUEUE_SIZE: usize = 32;
const SOURCE_QUEUE_SIZE: usize = 256;
const DIGIPEAT_QUEUE_SIZE: usize = 64;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const STATS_INTERVAL: Duration = Duration::from_secs(300);

/// Experimental-class tocall for our own beacons.
const BEACON_TOCALL: &str = "APZGTE";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub rf_rx: u64,
    pub rf_tx: u64,
    pub is_rx: u64,
    pub is_tx: u64,
    pub client_rx: u64,
    pub udp_rx: u64,
    pub digipeated: u64,
    pub gated_to_is: u64,
    pub gated_to_rf: u64,
    pub duplicates: u64,
    pub parse_errors: u64,
    pub beacons: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct Snapshot {
    pub stats: Stats,
    pub heard_stations: usize,
}

/// Handle to the coordinator task plus the sink sources deliver into.
#[derive(Clone, Debug)]
pub struct Coordinator {
    command_sender: mpsc::Sender<Command>,
}

pub struct CoordinatorChannels {
    pub sink: InboundSink,
    pub digipeat_sender: mpsc::Sender<Packet>,
}

impl Coordinator {
    /// Create the inbound channels first so sources and the digipeater can
    /// be spawned, then [`spawn`](Self::spawn) the reactor with their
    /// receivers.
    pub fn channels() -> (
        CoordinatorChannels,
        mpsc::Receiver<SourceEvent>,
        mpsc::Receiver<Packet>,
    ) {
        let (source_sender, source_receiver) = mpsc::channel(SOURCE_QUEUE_SIZE);
        let (digipeat_sender, digipeat_receiver) = mpsc::channel(DIGIPEAT_QUEUE_SIZE);

        (
            CoordinatorChannels {
                sink: InboundSink::new(source_sender),
                digipeat_sender,
            },
            source_receiver,
            digipeat_receiver,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: Config,
        broker: Broker,
        digipeater: DigipeaterHandle,
        is_client: Option<AprsIsClient>,
        rf_interfaces: Vec<RfInterface>,
        source_receiver: mpsc::Receiver<SourceEvent>,
        digipeat_receiver: mpsc::Receiver<Packet>,
        shutdown: CancellationToken,
    ) -> Self {
        let (command_sender, command_receiver) = mpsc::channel(COMMAND_QUEUE_SIZE);

        let station_position = match (config.beacon.latitude, config.beacon.longitude) {
            (Some(latitude), Some(longitude)) => {
                Some(Position {
                    latitude,
                    longitude,
                })
            }
            _ => None,
        };

        let beacon_path: Vec<PathElement> = config
            .beacon
            .path
            .iter()
            .filter_map(|element| {
                match element.parse() {
                    Ok(element) => Some(element),
                    Err(error) => {
                        tracing::warn!(%error, "ignoring invalid beacon path element");
                        None
                    }
                }
            })
            .collect();

        let is_send = config
            .aprs_is
            .as_ref()
            .is_some_and(|aprs_is| aprs_is.send);

        tokio::spawn(async move {
            let reactor = Reactor {
                gate: RfGate::new(
                    config.gate.clone(),
                    config.callsign.clone(),
                    station_position,
                ),
                dedup: DuplicateFilter::new(config.gate.dedup_window),
                server_call: config.callsign.clone(),
                beacon_path,
                config,
                broker,
                digipeater,
                is_client,
                is_send,
                rf_interfaces,
                stats: Stats::default(),
                command_receiver,
                source_receiver,
                digipeat_receiver,
                shutdown,
            };
            reactor.run().await;
        });

        Self { command_sender }
    }

    pub async fn snapshot(&self) -> Snapshot {
        let (result_sender, result_receiver) = oneshot::channel();
        let _ = self
            .command_sender
            .send(Command::Snapshot { result_sender })
            .await;
        result_receiver.await.unwrap_or(Snapshot {
            stats: Stats::default(),
            heard_stations: 0,
        })
    }
}

#[derive(Debug)]
enum Command {
    Snapshot {
        result_sender: oneshot::Sender<Snapshot>,
    },
}

struct Reactor {
    config: Config,
    server_call: Callsign,
    beacon_path: Vec<PathElement>,

    gate: RfGate,
    dedup: DuplicateFilter,
    stats: Stats,

    broker: Broker,
    digipeater: DigipeaterHandle,
    is_client: Option<AprsIsClient>,
    is_send: bool,
    rf_interfaces: Vec<RfInterface>,

    command_receiver: mpsc::Receiver<Command>,
    source_receiver: mpsc::Receiver<SourceEvent>,
    digipeat_receiver: mpsc::Receiver<Packet>,
    shutdown: CancellationToken,
}

impl Reactor {
    async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
        stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let beacon_enabled = self.config.beacon.enabled;
        let mut beacon = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.beacon.interval,
            self.config.beacon.interval,
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                command = self.command_receiver.recv() => {
                    match command {
                        Some(Command::Snapshot { result_sender }) => {
                            let _ = result_sender.send(Snapshot {
                                stats: self.stats,
                                heard_stations: self.gate.heard_count(),
                            });
                        }
                        None => break,
                    }
                }

                event = self.source_receiver.recv() => {
                    match event {
                        Some(SourceEvent::Packet { origin, packet }) => {
                            self.handle_packet(origin, packet).await;
                        }
                        Some(SourceEvent::ParseError { origin }) => {
                            self.stats.parse_errors += 1;
                            tracing::trace!(?origin, "parse error");
                        }
                        Some(SourceEvent::Status { endpoint, state }) => {
                            tracing::info!(%endpoint, ?state, "link status");
                        }
                        None => break,
                    }
                }

                emission = self.digipeat_receiver.recv() => {
                    match emission {
                        Some(packet) => self.handle_digipeat_emission(packet).await,
                        None => break,
                    }
                }

                _ = beacon.tick(), if beacon_enabled => {
                    self.send_beacon().await;
                }

                _ = sweep.tick() => {
                    let now = Instant::now();
                    self.dedup.sweep(now);
                    self.gate.sweep(now);
                    self.broker.sweep().await;
                }

                _ = stats_tick.tick() => {
                    tracing::info!(stats = ?self.stats, heard = self.gate.heard_count(), "gateway stats");
                }
            }
        }
    }

    async fn handle_packet(&mut self, origin: Origin, packet: Packet) {
        let now = Instant::now();

        match origin {
            Origin::Rf { .. } => self.stats.rf_rx += 1,
            Origin::AprsIs => self.stats.is_rx += 1,
            Origin::Client { .. } => self.stats.client_rx += 1,
            Origin::Udp => self.stats.udp_rx += 1,
        }

        if let Origin::Rf { .. } = origin {
            self.gate.heard(&packet, now);
            // the digipeater keeps its own duplicate window; it must see
            // every copy so the viscous queue can cancel
            self.digipeater.offer(packet.clone()).await;
        }

        if self.dedup.check_and_record(&packet, now) {
            self.stats.duplicates += 1;
            return;
        }

        match origin {
            Origin::Rf { .. } => {
                match self.gate.rf_to_is(&packet, now) {
                    Ok(gated) => {
                        self.stats.gated_to_is += 1;
                        self.send_to_is(gated.clone()).await;
                        self.broker.broadcast(gated, None).await;
                    }
                    Err(reason) => {
                        tracing::trace!(%packet, %reason, "not gating rf packet");
                        self.broker.broadcast(packet, None).await;
                    }
                }
            }
            Origin::AprsIs => {
                match self.gate.is_to_rf(&packet, now) {
                    Ok(prepared) => {
                        self.stats.gated_to_rf += 1;
                        self.send_to_rf(prepared).await;
                    }
                    Err(reason) => {
                        tracing::trace!(%packet, %reason, "not gating is packet");
                    }
                }
                self.broker.broadcast(packet, None).await;
            }
            Origin::Client { id, verified } => {
                let mut packet = packet;
                qpath::normalize(&mut packet.path, verified, &self.server_call);
                self.send_to_is(packet.clone()).await;
                self.broker.broadcast(packet, Some(id)).await;
            }
            Origin::Udp => {
                let mut packet = packet;
                qpath::normalize(&mut packet.path, false, &self.server_call);
                self.send_to_is(packet.clone()).await;
                self.broker.broadcast(packet, None).await;
            }
        }
    }

    async fn handle_digipeat_emission(&mut self, packet: Packet) {
        self.stats.digipeated += 1;
        self.send_to_rf(packet).await;
    }

    async fn send_to_is(&mut self, packet: Packet) {
        if let Some(is_client) = &self.is_client {
            if self.is_send {
                is_client.send(packet).await;
                self.stats.is_tx += 1;
            }
        }
    }

    async fn send_to_rf(&mut self, packet: Packet) {
        for interface in &self.rf_interfaces {
            interface.transmit(packet.clone()).await;
            self.stats.rf_tx += 1;
        }
    }

    async fn send_beacon(&mut self) {
        let beacon = &self.config.beacon;

        let data = match (beacon.latitude, beacon.longitude) {
            (Some(latitude), Some(longitude)) => {
                format!(
                    "!{}{}{}{}{}",
                    position::format_latitude(latitude),
                    beacon.symbol_table,
                    position::format_longitude(longitude),
                    beacon.symbol,
                    beacon.comment,
                )
            }
            _ => format!(">{} (no position fix)", beacon.comment),
        };

        let beacon_to_is = beacon.to_is;

        let packet = Packet {
            source: self.server_call.clone(),
            destination: BEACON_TOCALL.parse().expect("valid beacon tocall"),
            path: self.beacon_path.clone(),
            data: data.into_bytes().into(),
        };

        tracing::debug!(%packet, "beaconing");
        self.stats.beacons += 1;

        self.send_to_rf(packet.clone()).await;
        if beacon_to_is {
            self.send_to_is(packet).await;
        }
    }
}
