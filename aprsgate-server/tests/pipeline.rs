//! End-to-end scenarios through the public packet-plane APIs.

use std::time::{
    Duration,
    Instant,
};

use approx::assert_abs_diff_eq;

use aprsgate_server::{
    config::{
        DigipeaterConfig,
        GateConfig,
        IsToRfType,
    },
    digipeater::{
        Decision,
        Digipeater,
        DropReason,
    },
    filter::FilterList,
    gate::RfGate,
    history::HistoryBuffer,
};
use aprsgate_types::Packet;

fn packet(line: &str) -> Packet {
    Packet::parse(line.as_bytes()).unwrap()
}

fn rendered_path(packet: &Packet) -> Vec<String> {
    packet.path.iter().map(|element| element.to_string()).collect()
}

#[test]
fn parse_encode_round_trip() {
    let line = "N0CALL>APRS,TCPIP*:!3553.50N/10602.50W>Test";
    let parsed = packet(line);

    assert_eq!(parsed.source.to_string(), "N0CALL");
    assert_eq!(parsed.destination.to_string(), "APRS");
    assert_eq!(rendered_path(&parsed), ["TCPIP*"]);
    assert_eq!(&parsed.data[..], b"!3553.50N/10602.50W>Test");
    assert_eq!(
        parsed.packet_type(),
        aprsgate_types::PacketType::PositionNoTimestamp
    );

    assert_eq!(&parsed.encode()[..], line.as_bytes());
    assert_eq!(Packet::parse(&parsed.encode()).unwrap(), parsed);
}

#[test]
fn position_extraction() {
    let parsed = packet("N0CALL>APRS:!3553.50N/10602.50W>Test");
    let position = parsed.position().unwrap();
    assert_abs_diff_eq!(position.latitude, 35.891666, epsilon = 1e-4);
    assert_abs_diff_eq!(position.longitude, -106.041666, epsilon = 1e-4);
}

#[test]
fn wide2_2_digipeat_with_dedup() {
    let config = DigipeaterConfig {
        callsign: Some("DIGI".parse().unwrap()),
        preemptive: false,
        max_hops: 2,
        ..DigipeaterConfig::default()
    };
    let mut digipeater = Digipeater::new(config.clone(), config.callsign.clone().unwrap());
    let now = Instant::now();

    let input = packet("N0CALL>APRS,WIDE2-2:!3553.50N/10602.50W>");
    match digipeater.offer(&input, now) {
        Decision::Digipeat(output) => assert_eq!(rendered_path(&output), ["WIDE2-1"]),
        other => panic!("expected digipeat, got {other:?}"),
    }

    assert_eq!(
        digipeater.offer(&input, now + Duration::from_secs(10)),
        Decision::Drop(DropReason::Duplicate)
    );
}

#[test]
fn rf_to_is_adds_the_q_construct() {
    let mut gate = RfGate::new(GateConfig::default(), "GW-10".parse().unwrap(), None);

    let gated = gate
        .rf_to_is(&packet("N0CALL>APRS,WIDE1*:!3553.50N/10602.50W>"), Instant::now())
        .unwrap();
    assert_eq!(rendered_path(&gated), ["WIDE1*", "qAR", "GW-10"]);
}

#[test]
fn is_to_rf_sanitizes_the_path() {
    let config = GateConfig {
        is_to_rf: true,
        is_to_rf_type: IsToRfType::Heard,
        ..GateConfig::default()
    };
    let mut gate = RfGate::new(config, "GW-10".parse().unwrap(), None);
    let now = Instant::now();

    // destination heard on RF
    gate.heard(&packet("KC0ABC>APRS:>here"), now);

    let prepared = gate
        .is_to_rf(&packet("N0CALL>KC0ABC,WIDE2-1,qAC,SRV:>hi"), now)
        .unwrap();
    assert_eq!(rendered_path(&prepared), ["WIDE2-1"]);
    assert!(!prepared
        .path
        .iter()
        .any(|element| element.looks_like_q_construct() || element.is_tcpip()));
}

#[test]
fn combined_filter_matches_a_message_by_prefix() {
    let filter = FilterList::parse("r/35/-106/100 p/N0 t/pm").unwrap();
    assert!(filter.matches(&packet("N0CALL>APRS::KC0ABC   :hi")));
}

#[test]
fn wide7_7_is_dropped_with_a_small_hop_budget() {
    let config = DigipeaterConfig {
        max_hops: 2,
        ..DigipeaterConfig::default()
    };
    let mut digipeater = Digipeater::new(config, "DIGI".parse().unwrap());

    assert_eq!(
        digipeater.offer(&packet("N0CALL>APRS,WIDE7-7:>s"), Instant::now()),
        Decision::Drop(DropReason::MaxHops)
    );
}

#[test]
fn viscous_second_copy_suppresses_both() {
    let config = DigipeaterConfig {
        viscous_delay: Duration::from_millis(5000),
        ..DigipeaterConfig::default()
    };
    let mut digipeater = Digipeater::new(config, "DIGI".parse().unwrap());
    let now = Instant::now();
    let input = packet("N0CALL>APRS,WIDE2-2:!3553.50N/10602.50W>");

    assert_eq!(
        digipeater.offer(&input, now),
        Decision::Defer(Duration::from_millis(5000))
    );
    assert_eq!(
        digipeater.offer(&input, now + Duration::from_millis(1000)),
        Decision::Drop(DropReason::Duplicate)
    );

    // the timer fires into an empty queue
    assert!(digipeater.take_due(now + Duration::from_millis(6000)).is_empty());
}

#[test]
fn message_filter_selects_messages_only() {
    let filter = FilterList::parse("t/m").unwrap();

    assert!(filter.matches(&packet("N0CALL>APRS::KC0ABC   :hello")));
    assert!(!filter.matches(&packet("N0CALL>APRS:!3553.50N/10602.50W>")));
    assert!(!filter.matches(&packet("N0CALL>APRS:>status")));
    assert!(!filter.matches(&packet("N0CALL>APRS:_10090556c220s004")));
}

#[test]
fn history_eviction_is_exact_at_capacity() {
    let mut history = HistoryBuffer::new(100);
    let now = Instant::now();

    for index in 0..101 {
        history.record(packet(&format!("N0CALL>APRS:>status {index}")), now);
    }

    assert_eq!(history.len(), 100);
    assert_eq!(&history.oldest().unwrap().packet.data[..], b">status 1");

    let all = history.query(&FilterList::match_all(), None, 200);
    assert_eq!(all.len(), 100);
    assert_eq!(&all[99].data[..], b">status 100");
}
