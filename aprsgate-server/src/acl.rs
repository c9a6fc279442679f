use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    net::IpAddr,
    time::{
        Duration,
        Instant,
    },
};

use aprsgate_types::Callsign;

use crate::{
    broker::ClientId,
    config::AclConfig,
};

/// Width of the rolling flood window.
const FLOOD_WINDOW: Duration = Duration::from_secs(60);

/// Connection-time allow/deny lists plus per-client flood limits.
///
/// A client exceeding its rolling packet or byte budget is banned by IP;
/// bans expire lazily on the next check.
#[derive(Debug)]
pub struct Acl {
    config: AclConfig,
    bans: HashMap<IpAddr, Instant>,
    flood: HashMap<ClientId, FloodWindow>,
}

#[derive(Debug, Default)]
struct FloodWindow {
    samples: VecDeque<(Instant, usize)>,
    bytes: usize,
}

impl FloodWindow {
    fn push(&mut self, now: Instant, bytes: usize) {
        self.samples.push_back((now, bytes));
        self.bytes += bytes;
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, bytes)) = self.samples.front() {
            if now.duration_since(*at) <= FLOOD_WINDOW {
                break;
            }
            self.bytes -= bytes;
            self.samples.pop_front();
        }
    }
}

impl Acl {
    pub fn new(config: AclConfig) -> Self {
        Self {
            config,
            bans: HashMap::new(),
            flood: HashMap::new(),
        }
    }

    /// Whether a connection from this address (and, after login, this
    /// callsign) is admitted.
    pub fn allow_connect(&mut self, ip: IpAddr, callsign: Option<&Callsign>, now: Instant) -> bool {
        if let Some(expires) = self.bans.get(&ip) {
            if now < *expires {
                return false;
            }
            self.bans.remove(&ip);
        }

        if self.config.ip_blacklist.contains(&ip) {
            return false;
        }
        if let Some(callsign) = callsign {
            if self
                .config
                .callsign_blacklist
                .iter()
                .any(|banned| banned.base() == callsign.base())
            {
                return false;
            }
        }

        // no whitelist configured means everyone is admitted; a non-empty
        // whitelist admits a connection when either side is on it
        if self.config.ip_whitelist.is_empty() && self.config.callsign_whitelist.is_empty() {
            return true;
        }

        let ip_listed = self.config.ip_whitelist.contains(&ip);
        let callsign_listed = match callsign {
            Some(callsign) => {
                self.config
                    .callsign_whitelist
                    .iter()
                    .any(|allowed| allowed.base() == callsign.base())
            }
            // before login the callsign is unknown; a configured callsign
            // whitelist is enforced once the login names one
            None => !self.config.callsign_whitelist.is_empty(),
        };

        ip_listed || callsign_listed
    }

    /// Whether this client may submit another packet of `bytes` length.
    /// Exceeding the budget bans the client's address.
    pub fn allow_send(&mut self, client: ClientId, ip: IpAddr, bytes: usize, now: Instant) -> bool {
        if !self.config.flood_protection {
            return true;
        }

        let window = self.flood.entry(client).or_default();
        window.push(now, bytes);

        if window.samples.len() > self.config.max_packets_per_minute
            || window.bytes > self.config.max_bytes_per_minute
        {
            self.bans.insert(ip, now + self.config.ban_duration);
            self.flood.remove(&client);
            return false;
        }

        true
    }

    pub fn forget_client(&mut self, client: ClientId) {
        self.flood.remove(&client);
    }

    /// Drop expired bans and stale flood windows.
    pub fn sweep(&mut self, now: Instant) {
        self.bans.retain(|_, expires| now < *expires);
        self.flood.retain(|_, window| {
            window.prune(now);
            !window.samples.is_empty()
        });
    }
}
