//! RF↔IS gating policy.
//!
//! The gate decides which RF packets are forwarded to APRS-IS (tagged
//! `qAR`) and which IS packets are worth transmitting on the air. Both
//! directions are guarded by their own duplicate window; the IS→RF
//! direction additionally enforces a transmit rate budget, a heard-station
//! reachability policy and a remaining-hop budget.

use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    time::{
        Duration,
        Instant,
    },
};

use aprsgate_types::{
    Callsign,
    Packet,
    PacketType,
    Position,
    QConstruct,
    haversine_km,
};

use crate::{
    config::{
        GateConfig,
        IsToRfType,
    },
    dedup::DuplicateFilter,
    qpath,
};

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Policy rejections. Counted, never surfaced to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GateReject {
    #[error("gating disabled")]
    Disabled,
    #[error("duplicate")]
    Duplicate,
    #[error("path forbids gating")]
    InvalidPath,
    #[error("third party traffic")]
    ThirdParty,
    #[error("outside local range")]
    OutOfRange,
    #[error("type filtered")]
    FilteredType,
    #[error("no recipient heard on rf")]
    NotHeard,
    #[error("rf rate limit reached")]
    RateLimited,
    #[error("hop budget exceeded")]
    MaxHops,
}

#[derive(Debug)]
pub struct RfGate {
    config: GateConfig,
    own_call: Callsign,
    station_position: Option<Position>,

    heard_direct: HashMap<Callsign, Instant>,
    heard_indirect: HashMap<Callsign, Instant>,

    rf_to_is_seen: DuplicateFilter,
    is_to_rf_seen: DuplicateFilter,
    rf_emissions: VecDeque<Instant>,
}

impl RfGate {
    pub fn new(config: GateConfig, own_call: Callsign, station_position: Option<Position>) -> Self {
        let dedup_window = config.dedup_window;
        Self {
            config,
            own_call,
            station_position,
            heard_direct: HashMap::new(),
            heard_indirect: HashMap::new(),
            rf_to_is_seen: DuplicateFilter::new(dedup_window),
            is_to_rf_seen: DuplicateFilter::new(dedup_window),
            rf_emissions: VecDeque::new(),
        }
    }

    /// Record an RF reception for heard-station tracking. Direct means no
    /// used hop precedes the source.
    pub fn heard(&mut self, packet: &Packet, now: Instant) {
        if packet.is_direct() {
            self.heard_direct.insert(packet.source.clone(), now);
        }
        else {
            self.heard_indirect.insert(packet.source.clone(), now);
        }
    }

    pub fn is_heard(&self, callsign: &Callsign, now: Instant) -> bool {
        let fresh = |seen: &Instant| now.duration_since(*seen) <= self.config.heard_window;
        self.heard_direct.get(callsign).is_some_and(fresh)
            || self.heard_indirect.get(callsign).is_some_and(fresh)
    }

    fn is_heard_str(&self, callsign: &str, now: Instant) -> bool {
        callsign
            .parse::<Callsign>()
            .is_ok_and(|callsign| self.is_heard(&callsign, now))
    }

    /// RF→IS check. On success the returned packet carries `qAR,<own>`.
    pub fn rf_to_is(&mut self, packet: &Packet, now: Instant) -> Result<Packet, GateReject> {
        if !self.config.rf_to_is {
            return Err(GateReject::Disabled);
        }
        if self.rf_to_is_seen.is_duplicate(packet, now) {
            return Err(GateReject::Duplicate);
        }

        let path_forbids = packet.path.iter().any(|element| {
            element.looks_like_q_construct()
                || element.is_tcpip()
                || element.is_nogate()
                || element.is_rfonly()
        });
        if path_forbids {
            return Err(GateReject::InvalidPath);
        }

        if packet.is_third_party() {
            return Err(GateReject::ThirdParty);
        }

        if self.config.gate_local_only {
            if let (Some(station), Some(position)) = (self.station_position, packet.position()) {
                if haversine_km(station, position) > self.config.local_range_km {
                    return Err(GateReject::OutOfRange);
                }
            }
            // packets without a position are treated as local
        }

        if !self.type_allowed(packet.packet_type()) {
            return Err(GateReject::FilteredType);
        }

        self.rf_to_is_seen.record(packet, now);

        let mut gated = packet.clone();
        qpath::append(&mut gated.path, QConstruct::AR, &self.own_call);
        Ok(gated)
    }

    /// IS→RF check. On success the returned packet's path is stripped of
    /// q-construct groups and `TCPIP` markers.
    pub fn is_to_rf(&mut self, packet: &Packet, now: Instant) -> Result<Packet, GateReject> {
        if !self.config.is_to_rf {
            return Err(GateReject::Disabled);
        }
        if self.is_to_rf_seen.is_duplicate(packet, now) {
            return Err(GateReject::Duplicate);
        }

        self.prune_emissions(now);
        if self.rf_emissions.len() >= self.config.max_rf_rate {
            return Err(GateReject::RateLimited);
        }

        if !self.reachable(packet, now) {
            return Err(GateReject::NotHeard);
        }

        let mut prepared = packet.clone();
        qpath::strip_for_rf(&mut prepared.path);

        let hop_budget: usize = prepared
            .path
            .iter()
            .filter(|element| !element.used)
            .map(|element| {
                element
                    .wide_hops()
                    .map(|(_, remaining)| usize::from(remaining))
                    .unwrap_or(1)
            })
            .sum();
        if hop_budget > self.config.max_hops_to_rf {
            return Err(GateReject::MaxHops);
        }

        self.is_to_rf_seen.record(packet, now);
        self.rf_emissions.push_back(now);
        Ok(prepared)
    }

    fn reachable(&self, packet: &Packet, now: Instant) -> bool {
        match self.config.is_to_rf_type {
            IsToRfType::All => true,
            IsToRfType::MessageOnly => {
                packet.data.first() == Some(&b':')
                    || packet
                        .addressee()
                        .is_some_and(|addressee| self.is_heard_str(addressee, now))
            }
            IsToRfType::Heard => {
                self.is_heard(&packet.source, now)
                    || self.is_heard(&packet.destination, now)
                    || packet
                        .addressee()
                        .is_some_and(|addressee| self.is_heard_str(addressee, now))
            }
        }
    }

    fn type_allowed(&self, packet_type: PacketType) -> bool {
        match packet_type {
            kind if kind.is_position() => self.config.gate_positions,
            PacketType::Message | PacketType::Bulletin => self.config.gate_messages,
            PacketType::Weather => self.config.gate_weather,
            PacketType::Telemetry => self.config.gate_telemetry,
            PacketType::Object | PacketType::Item => self.config.gate_objects,
            _ => true,
        }
    }

    fn prune_emissions(&mut self, now: Instant) {
        while let Some(at) = self.rf_emissions.front() {
            if now.duration_since(*at) <= RATE_WINDOW {
                break;
            }
            self.rf_emissions.pop_front();
        }
    }

    /// Evict stale heard entries and dedup keys.
    pub fn sweep(&mut self, now: Instant) {
        let window = self.config.heard_window;
        self.heard_direct
            .retain(|_, seen| now.duration_since(*seen) <= window);
        self.heard_indirect
            .retain(|_, seen| now.duration_since(*seen) <= window);
        self.rf_to_is_seen.sweep(now);
        self.is_to_rf_seen.sweep(now);
        self.prune_emissions(now);
    }

    pub fn heard_count(&self) -> usize {
        self.heard_direct.len() + self.heard_indirect.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{
        Duration,
        Instant,
    };

    use aprsgate_types::Packet;

    use crate::{
        config::{
            GateConfig,
            IsToRfType,
        },
        gate::{
            GateReject,
            RfGate,
        },
    };

    fn packet(line: &str) -> Packet {
        Packet::parse(line.as_bytes()).unwrap()
    }

    fn gate(config: GateConfig) -> RfGate {
        RfGate::new(config, "GW-10".parse().unwrap(), None)
    }

    fn rendered(packet: &Packet) -> Vec<String> {
        packet.path.iter().map(|element| element.to_string()).collect()
    }

    #[test]
    fn rf_to_is_appends_qar_and_own_call() {
        let mut gate = gate(GateConfig::default());
        let gated = gate
            .rf_to_is(&packet("N0CALL>APRS,WIDE1*:!3553.50N/10602.50W>"), Instant::now())
            .unwrap();
        assert_eq!(rendered(&gated), ["WIDE1*", "qAR", "GW-10"]);
    }

    #[test]
    fn rf_to_is_rejects_forbidden_paths() {
        let mut gate = gate(GateConfig::default());
        let now = Instant::now();

        for line in [
            "N0CALL>APRS,NOGATE:>s",
            "N0CALL>APRS,RFONLY:>s",
            "N0CALL>APRS,TCPIP*:>s",
            "N0CALL>APRS,qAX,SRV:>s",
        ] {
            assert_eq!(
                gate.rf_to_is(&packet(line), now),
                Err(GateReject::InvalidPath),
                "{line}"
            );
        }
    }

    #[test]
    fn rf_to_is_rejects_third_party_and_duplicates() {
        let mut gate = gate(GateConfig::default());
        let now = Instant::now();

        assert_eq!(
            gate.rf_to_is(&packet("N0CALL>APRS:}K1ABC>APRS:>s"), now),
            Err(GateReject::ThirdParty)
        );

        let first = packet("N0CALL>APRS:>s");
        assert!(gate.rf_to_is(&first, now).is_ok());
        assert_eq!(
            gate.rf_to_is(&first, now + Duration::from_secs(5)),
            Err(GateReject::Duplicate)
        );
    }

    #[test]
    fn rf_to_is_honors_the_local_range() {
        let config = GateConfig {
            gate_local_only: true,
            local_range_km: 100.0,
            ..GateConfig::default()
        };
        let station = aprsgate_types::Position {
            latitude: 35.89,
            longitude: -106.04,
        };
        let mut gate = RfGate::new(config, "GW-10".parse().unwrap(), Some(station));
        let now = Instant::now();

        assert!(gate
            .rf_to_is(&packet("N0CALL>APRS:!3553.50N/10602.50W>"), now)
            .is_ok());
        assert_eq!(
            gate.rf_to_is(&packet("K1ABC>APRS:!4000.00N/11100.00W>"), now),
            Err(GateReject::OutOfRange)
        );
        // positionless packets count as local
        assert!(gate.rf_to_is(&packet("W6XYZ>APRS:>status"), now).is_ok());
    }

    #[test]
    fn rf_to_is_type_filters() {
        let config = GateConfig {
            gate_weather: false,
            ..GateConfig::default()
        };
        let mut gate = gate(config);
        let now = Instant::now();

        assert_eq!(
            gate.rf_to_is(&packet("N0CALL>APRS:_10090556c220s004"), now),
            Err(GateReject::FilteredType)
        );
        assert!(gate.rf_to_is(&packet("N0CALL>APRS:>status"), now).is_ok());
    }

    #[test]
    fn is_to_rf_strips_q_groups_when_destination_is_heard() {
        let config = GateConfig {
            is_to_rf: true,
            is_to_rf_type: IsToRfType::Heard,
            ..GateConfig::default()
        };
        let mut gate = gate(config);
        let now = Instant::now();

        // hear the addressee on RF first
        gate.heard(&packet("KC0ABC>APRS:>here"), now);

        let prepared = gate
            .is_to_rf(&packet("N0CALL>KC0ABC,WIDE2-1,qAC,SRV:>hello"), now)
            .unwrap();
        assert_eq!(rendered(&prepared), ["WIDE2-1"]);
    }

    #[test]
    fn is_to_rf_rejects_unheard_destinations() {
        let config = GateConfig {
            is_to_rf: true,
            is_to_rf_type: IsToRfType::Heard,
            ..GateConfig::default()
        };
        let mut gate = gate(config);

        assert_eq!(
            gate.is_to_rf(&packet("N0CALL>KC0ABC,qAC,SRV:>hello"), Instant::now()),
            Err(GateReject::NotHeard)
        );
    }

    #[test]
    fn heard_entries_expire() {
        let config = GateConfig {
            is_to_rf: true,
            is_to_rf_type: IsToRfType::Heard,
            heard_window: Duration::from_secs(600),
            ..GateConfig::default()
        };
        let mut gate = gate(config);
        let now = Instant::now();

        gate.heard(&packet("KC0ABC>APRS:>here"), now);
        let call = "KC0ABC".parse().unwrap();
        assert!(gate.is_heard(&call, now + Duration::from_secs(599)));
        assert!(!gate.is_heard(&call, now + Duration::from_secs(601)));

        gate.sweep(now + Duration::from_secs(601));
        assert_eq!(gate.heard_count(), 0);
    }

    #[test]
    fn message_only_admits_messages_and_nothing_else() {
        let config = GateConfig {
            is_to_rf: true,
            is_to_rf_type: IsToRfType::MessageOnly,
            ..GateConfig::default()
        };
        let mut gate = gate(config);
        let now = Instant::now();

        assert!(gate
            .is_to_rf(&packet("N0CALL>APRS,qAC,SRV::KC0ABC   :hi"), now)
            .is_ok());
        assert_eq!(
            gate.is_to_rf(&packet("N0CALL>APRS,qAC,SRV:>status"), now),
            Err(GateReject::NotHeard)
        );
    }

    #[test]
    fn is_to_rf_rate_limit() {
        let config = GateConfig {
            is_to_rf: true,
            is_to_rf_type: IsToRfType::All,
            max_rf_rate: 2,
            ..GateConfig::default()
        };
        let mut gate = gate(config);
        let now = Instant::now();

        for index in 0..2 {
            assert!(gate
                .is_to_rf(&packet(&format!("N0CALL>APRS,qAC,SRV:>s{index}")), now)
                .is_ok());
        }
        assert_eq!(
            gate.is_to_rf(&packet("N0CALL>APRS,qAC,SRV:>s9"), now),
            Err(GateReject::RateLimited)
        );
        // the budget frees up as the window slides
        assert!(gate
            .is_to_rf(
                &packet("N0CALL>APRS,qAC,SRV:>s9"),
                now + Duration::from_secs(61)
            )
            .is_ok());
    }

    #[test]
    fn is_to_rf_hop_budget() {
        let config = GateConfig {
            is_to_rf: true,
            is_to_rf_type: IsToRfType::All,
            max_hops_to_rf: 2,
            ..GateConfig::default()
        };
        let mut gate = gate(config);
        let now = Instant::now();

        assert!(gate
            .is_to_rf(&packet("N0CALL>APRS,WIDE2-2,qAC,SRV:>a"), now)
            .is_ok());
        assert_eq!(
            gate.is_to_rf(&packet("N0CALL>APRS,WIDE3-3,qAC,SRV:>b"), now),
            Err(GateReject::MaxHops)
        );
        assert_eq!(
            gate.is_to_rf(&packet("N0CALL>APRS,DIGI1,DIGI2,DIGI3,qAC,SRV:>c"), now),
            Err(GateReject::MaxHops)
        );
    }
}
