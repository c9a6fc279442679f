use std::{
    collections::HashMap,
    time::{
        Duration,
        Instant,
    },
};

use md5::{
    Digest,
    Md5,
};

use aprsgate_types::Packet;

/// Sliding-window duplicate filter.
///
/// Packets are keyed by source callsign and the md5 of the information
/// field, so the same content arriving over a different path within the
/// window still counts as a duplicate. The owning task calls [`sweep`]
/// periodically; between sweeps the map is bounded by the traffic rate
/// over one window.
///
/// [`sweep`]: DuplicateFilter::sweep
#[derive(Debug)]
pub struct DuplicateFilter {
    window: Duration,
    entries: HashMap<String, Instant>,
}

impl DuplicateFilter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    pub fn key(packet: &Packet) -> String {
        use std::fmt::Write;

        let mut key = packet.source.to_string();
        key.push('\u{0}');
        for byte in Md5::digest(&packet.data) {
            let _ = write!(key, "{byte:02x}");
        }
        key
    }

    /// Whether an identical `(source, data)` was recorded within the
    /// window.
    pub fn is_duplicate(&self, packet: &Packet, now: Instant) -> bool {
        self.entries
            .get(&Self::key(packet))
            .is_some_and(|seen| now.duration_since(*seen) <= self.window)
    }

    /// Record a sighting, overwriting any previous timestamp.
    pub fn record(&mut self, packet: &Packet, now: Instant) {
        self.entries.insert(Self::key(packet), now);
    }

    /// Convenience for the common check-then-record step.
    pub fn check_and_record(&mut self, packet: &Packet, now: Instant) -> bool {
        let duplicate = self.is_duplicate(packet, now);
        self.record(packet, now);
        duplicate
    }

    /// Evict entries older than the window.
    pub fn sweep(&mut self, now: Instant) {
        let window = self.window;
        self.entries
            .retain(|_, seen| now.duration_since(*seen) <= window);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{
        Duration,
        Instant,
    };

    use aprsgate_types::Packet;

    use crate::dedup::DuplicateFilter;

    fn packet(line: &str) -> Packet {
        Packet::parse(line.as_bytes()).unwrap()
    }

    #[test]
    fn it_detects_duplicates_within_the_window() {
        let mut filter = DuplicateFilter::new(Duration::from_secs(30));
        let now = Instant::now();
        let first = packet("N0CALL>APRS,WIDE1-1:>hello");

        assert!(!filter.is_duplicate(&first, now));
        filter.record(&first, now);
        assert!(filter.is_duplicate(&first, now + Duration::from_secs(10)));
        assert!(!filter.is_duplicate(&first, now + Duration::from_secs(31)));
    }

    #[test]
    fn the_path_does_not_participate_in_the_key() {
        let mut filter = DuplicateFilter::new(Duration::from_secs(30));
        let now = Instant::now();

        filter.record(&packet("N0CALL>APRS,WIDE1-1:>hello"), now);
        assert!(filter.is_duplicate(&packet("N0CALL>APRS,DIGI*,WIDE2-1:>hello"), now));
    }

    #[test]
    fn different_source_or_data_is_not_a_duplicate() {
        let mut filter = DuplicateFilter::new(Duration::from_secs(30));
        let now = Instant::now();

        filter.record(&packet("N0CALL>APRS:>hello"), now);
        assert!(!filter.is_duplicate(&packet("K1ABC>APRS:>hello"), now));
        assert!(!filter.is_duplicate(&packet("N0CALL>APRS:>other"), now));
    }

    #[test]
    fn sweep_evicts_expired_entries() {
        let mut filter = DuplicateFilter::new(Duration::from_secs(30));
        let now = Instant::now();

        filter.record(&packet("N0CALL>APRS:>a"), now);
        filter.record(&packet("N0CALL>APRS:>b"), now + Duration::from_secs(20));
        assert_eq!(filter.len(), 2);

        filter.sweep(now + Duration::from_secs(40));
        assert_eq!(filter.len(), 1);
    }
}
