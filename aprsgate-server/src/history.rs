use std::{
    collections::VecDeque,
    time::Instant,
};

use aprsgate_types::Packet;

use crate::filter::FilterList;

/// Bounded ring of recently observed packets, used to replay traffic to
/// newly connected clients. The bound is hard; there is no sweep.
#[derive(Debug)]
pub struct HistoryBuffer {
    capacity: usize,
    slots: VecDeque<HistorySlot>,
}

#[derive(Clone, Debug)]
pub struct HistorySlot {
    pub packet: Packet,
    pub received: Instant,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Append a packet, evicting the oldest slot when full.
    pub fn record(&mut self, packet: Packet, received: Instant) {
        if self.capacity == 0 {
            return;
        }
        if self.slots.len() == self.capacity {
            self.slots.pop_front();
        }
        self.slots.push_back(HistorySlot { packet, received });
    }

    /// The most recent `limit` packets recorded after `since` that match
    /// the filter, in insertion order.
    pub fn query(&self, filter: &FilterList, since: Option<Instant>, limit: usize) -> Vec<Packet> {
        let mut matched: Vec<&HistorySlot> = self
            .slots
            .iter()
            .rev()
            .filter(|slot| since.is_none_or(|since| slot.received > since))
            .filter(|slot| filter.matches(&slot.packet))
            .take(limit)
            .collect();

        matched.reverse();
        matched.into_iter().map(|slot| slot.packet.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn oldest(&self) -> Option<&HistorySlot> {
        self.slots.front()
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
        filter::FilterList,
        history::HistoryBuffer,
    };

    fn packet(line: &str) -> Packet {
        Packet::parse(line.as_bytes()).unwrap()
    }

    #[test]
    fn it_evicts_the_oldest_exactly_at_capacity() {
        let mut history = HistoryBuffer::new(3);
        let now = Instant::now();

        for index in 0..4 {
            history.record(packet(&format!("N0CALL>APRS:>status {index}")), now);
        }

        assert_eq!(history.len(), 3);
        assert_eq!(&history.oldest().unwrap().packet.data[..], b">status 1");
    }

    #[test]
    fn query_returns_matching_packets_in_insertion_order() {
        let mut history = HistoryBuffer::new(10);
        let now = Instant::now();

        history.record(packet("N0CALL>APRS::KC0ABC   :one"), now);
        history.record(packet("N0CALL>APRS:>status"), now);
        history.record(packet("K1ABC>APRS::KC0ABC   :two"), now);

        let messages = FilterList::parse("t/m").unwrap();
        let result = history.query(&messages, None, 10);
        assert_eq!(result.len(), 2);
        assert_eq!(&result[0].data[..], b":KC0ABC   :one");
        assert_eq!(&result[1].data[..], b":KC0ABC   :two");
    }

    #[test]
    fn query_limit_keeps_the_most_recent() {
        let mut history = HistoryBuffer::new(10);
        let now = Instant::now();

        for index in 0..5 {
            history.record(packet(&format!("N0CALL>APRS:>status {index}")), now);
        }

        let result = history.query(&FilterList::match_all(), None, 2);
        assert_eq!(result.len(), 2);
        assert_eq!(&result[0].data[..], b">status 3");
        assert_eq!(&result[1].data[..], b">status 4");
    }

    #[test]
    fn query_since_excludes_older_slots() {
        let mut history = HistoryBuffer::new(10);
        let start = Instant::now();

        history.record(packet("N0CALL>APRS:>old"), start);
        history.record(packet("N0CALL>APRS:>new"), start + Duration::from_secs(5));

        let result = history.query(&FilterList::match_all(), Some(start), 10);
        assert_eq!(result.len(), 1);
        assert_eq!(&result[0].data[..], b">new");
    }
}
