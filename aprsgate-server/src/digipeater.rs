//! Digipeater
//!
//! Decides whether an RF packet is retransmitted, rewrites its path and
//! enforces hop, flood and duplicate limits. The decision pipeline is a
//! pure state machine; the actor around it owns the viscous queue and its
//! timer.
//!
//! With a viscous delay configured, the first copy of a position report is
//! held back; hearing another copy before the timer fires means a
//! neighboring digipeater already handled it and the hold is cancelled.

use std::{
    collections::HashMap,
    time::{
        Duration,
        Instant,
    },
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use aprsgate_types::{
    Callsign,
    MAX_PATH_LENGTH,
    Packet,
    PacketType,
    PathElement,
};

use crate::{
    config::DigipeaterConfig,
    dedup::DuplicateFilter,
};

const COMMAND_QUEUE_SIZE: usize = 64;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Disabled,
    Duplicate,
    Flooding,
    Acl,
    FilteredType,
    NoMatch,
    MaxHops,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
    Digipeat(Packet),
    Defer(Duration),
    Drop(DropReason),
}

#[derive(Debug)]
struct Recent {
    at: Instant,
    source: Callsign,
}

#[derive(Debug)]
struct ViscousEntry {
    packet: Packet,
    queued_at: Instant,
}

/// The digipeater state machine.
#[derive(Debug)]
pub struct Digipeater {
    config: DigipeaterConfig,
    own_call: Callsign,
    recent_packets: HashMap<String, Recent>,
    viscous_queue: HashMap<String, ViscousEntry>,
}

impl Digipeater {
    pub fn new(config: DigipeaterConfig, own_call: Callsign) -> Self {
        Self {
            config,
            own_call,
            recent_packets: HashMap::new(),
            viscous_queue: HashMap::new(),
        }
    }

    /// Run one packet through the decision pipeline.
    ///
    /// `Digipeat` carries the rewritten packet and has been recorded;
    /// `Defer` means the rewritten packet sits in the viscous queue until
    /// [`take_due`](Self::take_due) releases it or a duplicate cancels it.
    pub fn offer(&mut self, packet: &Packet, now: Instant) -> Decision {
        if !self.config.enabled {
            return Decision::Drop(DropReason::Disabled);
        }

        let fingerprint = DuplicateFilter::key(packet);

        // a second copy within the viscous delay means someone else
        // digipeated it; cancel the hold and suppress further copies
        if self.viscous_queue.remove(&fingerprint).is_some() {
            self.record(fingerprint, &packet.source, now);
            return Decision::Drop(DropReason::Duplicate);
        }

        if self
            .recent_packets
            .get(&fingerprint)
            .is_some_and(|recent| now.duration_since(recent.at) <= self.config.dedup_window)
        {
            return Decision::Drop(DropReason::Duplicate);
        }

        let from_source = self
            .recent_packets
            .values()
            .filter(|recent| recent.source == packet.source)
            .filter(|recent| now.duration_since(recent.at) <= self.config.flood_window)
            .count();
        if from_source > self.config.max_flood_rate {
            return Decision::Drop(DropReason::Flooding);
        }

        if !self.source_allowed(&packet.source) {
            return Decision::Drop(DropReason::Acl);
        }

        let packet_type = packet.packet_type();
        if (packet_type == PacketType::Weather && self.config.filter_weather)
            || (packet_type == PacketType::Telemetry && self.config.filter_telemetry)
        {
            return Decision::Drop(DropReason::FilteredType);
        }

        let rewritten = match self.rewrite(packet) {
            Ok(rewritten) => rewritten,
            Err(reason) => return Decision::Drop(reason),
        };

        if !self.config.viscous_delay.is_zero() && packet_type.is_position() {
            self.viscous_queue.insert(
                fingerprint,
                ViscousEntry {
                    packet: rewritten,
                    queued_at: now,
                },
            );
            return Decision::Defer(self.config.viscous_delay);
        }

        self.record(fingerprint, &packet.source, now);
        Decision::Digipeat(rewritten)
    }

    fn source_allowed(&self, source: &Callsign) -> bool {
        let in_list = |list: &[Callsign]| list.iter().any(|entry| entry.base() == source.base());

        if in_list(&self.config.blacklist) {
            return false;
        }
        self.config.whitelist.is_empty() || in_list(&self.config.whitelist)
    }

    /// Find the digipeat point and rewrite the path.
    fn rewrite(&self, packet: &Packet) -> Result<Packet, DropReason> {
        let index = packet
            .path
            .iter()
            .position(|element| !element.used)
            .ok_or(DropReason::NoMatch)?;
        let element = &packet.path[index];

        let mut path = packet.path.clone();

        if element.matches_callsign(&self.own_call)
            || element.matches(self.own_call.base())
            || self
                .config
                .aliases
                .iter()
                .any(|alias| element.matches(alias))
        {
            path[index] = PathElement::from_callsign(&self.own_call, true);
        }
        else if let Some((total, remaining)) = element.wide_hops().filter(|(_, m)| *m >= 1) {
            if self.config.fill_in && (total, remaining) != (1, 1) {
                return Err(DropReason::NoMatch);
            }
            if usize::from(total) > self.config.max_hops {
                return Err(DropReason::MaxHops);
            }

            if self.config.fill_in || self.config.preemptive {
                path.insert(index, PathElement::from_callsign(&self.own_call, true));
                decrement_flood(&mut path[index + 1], "WIDE", total, remaining);
            }
            else {
                decrement_flood(&mut path[index], "WIDE", total, remaining);
            }
        }
        else if let Some((total, remaining)) = element.trace_hops().filter(|(_, m)| *m >= 1) {
            if usize::from(total) > self.config.max_hops {
                return Err(DropReason::MaxHops);
            }

            path.insert(index, PathElement::from_callsign(&self.own_call, true));
            decrement_flood(&mut path[index + 1], "TRACE", total, remaining);
        }
        else {
            return Err(DropReason::NoMatch);
        }

        if path.len() > MAX_PATH_LENGTH {
            return Err(DropReason::MaxHops);
        }
        let used = path.iter().filter(|element| element.used).count();
        if used > self.config.max_hops {
            return Err(DropReason::MaxHops);
        }

        Ok(Packet {
            source: packet.source.clone(),
            destination: packet.destination.clone(),
            path,
            data: packet.data.clone(),
        })
    }

    fn record(&mut self, fingerprint: String, source: &Callsign, now: Instant) {
        self.recent_packets.insert(
            fingerprint,
            Recent {
                at: now,
                source: source.clone(),
            },
        );
    }

    /// Earliest viscous-queue deadline, for the actor's timer.
    pub fn next_due(&self) -> Option<Instant> {
        self.viscous_queue
            .values()
            .map(|entry| entry.queued_at + self.config.viscous_delay)
            .min()
    }

    /// Release viscous entries whose delay has elapsed, recording them.
    pub fn take_due(&mut self, now: Instant) -> Vec<Packet> {
        let delay = self.config.viscous_delay;
        let due: Vec<String> = self
            .viscous_queue
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.queued_at) >= delay)
            .map(|(fingerprint, _)| fingerprint.clone())
            .collect();

        due.into_iter()
            .filter_map(|fingerprint| {
                let entry = self.viscous_queue.remove(&fingerprint)?;
                let source = entry.packet.source.clone();
                self.record(fingerprint, &source, now);
                Some(entry.packet)
            })
            .collect()
    }

    /// Evict recent-packet entries older than both windows.
    pub fn sweep(&mut self, now: Instant) {
        let horizon = self.config.dedup_window.max(self.config.flood_window);
        self.recent_packets
            .retain(|_, recent| now.duration_since(recent.at) <= horizon);
    }
}

fn decrement_flood(element: &mut PathElement, prefix: &str, total: u8, remaining: u8) {
    if remaining > 1 {
        *element = PathElement::new(format!("{prefix}{total}-{}", remaining - 1));
    }
    else {
        *element = PathElement::used(format!("{prefix}{total}"));
    }
}

/// Handle to the digipeater task. Cheap to clone; emitted packets are
/// delivered to the sender passed at spawn time.
#[derive(Clone, Debug)]
pub struct DigipeaterHandle {
    command_sender: mpsc::Sender<Command>,
}

impl DigipeaterHandle {
    pub fn spawn(
        config: DigipeaterConfig,
        own_call: Callsign,
        emit_sender: mpsc::Sender<Packet>,
        shutdown: CancellationToken,
    ) -> Self {
        let (command_sender, command_receiver) = mpsc::channel(COMMAND_QUEUE_SIZE);

        tokio::spawn(async move {
            let reactor = Reactor {
                digipeater: Digipeater::new(config, own_call),
                command_receiver,
                emit_sender,
                shutdown,
            };
            reactor.run().await;
        });

        Self { command_sender }
    }

    /// Offer an RF packet; the result arrives on the emit channel if the
    /// digipeater decides to transmit.
    pub async fn offer(&self, packet: Packet) {
        let _ = self.command_sender.send(Command::Offer { packet }).await;
    }
}

#[derive(Debug)]
enum Command {
    Offer { packet: Packet },
}

#[derive(Debug)]
struct Reactor {
    digipeater: Digipeater,
    command_receiver: mpsc::Receiver<Command>,
    emit_sender: mpsc::Sender<Packet>,
    shutdown: CancellationToken,
}

impl Reactor {
    async fn run(mut self) {
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let next_due = self.digipeater.next_due();

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = self.command_receiver.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                _ = viscous_timer(next_due) => {
                    for packet in self.digipeater.take_due(Instant::now()) {
                        tracing::debug!(%packet, "viscous delay elapsed, digipeating");
                        let _ = self.emit_sender.send(packet).await;
                    }
                }
                _ = sweep.tick() => {
                    self.digipeater.sweep(Instant::now());
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Offer { packet } => {
                match self.digipeater.offer(&packet, Instant::now()) {
                    Decision::Digipeat(rewritten) => {
                        let _ = self.emit_sender.send(rewritten).await;
                    }
                    Decision::Defer(delay) => {
                        tracing::debug!(%packet, ?delay, "holding packet in viscous queue");
                    }
                    Decision::Drop(reason) => {
                        tracing::trace!(%packet, ?reason, "not digipeating");
                    }
                }
            }
        }
    }
}

async fn viscous_timer(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due.into()).await,
        None => std::future::pending().await,
    }
}
