//! Q-construct path policy.
//!
//! A q-construct is a two-element group: a `qA?` marker followed by the
//! call of the server that admitted the packet. These functions implement
//! the server-side policy: annotate packets entering from clients,
//! validate what other servers attached, and strip everything q-related
//! (plus the `TCPIP` marker) before a packet is allowed back onto RF.

use aprsgate_types::{
    Callsign,
    PathElement,
    QConstruct,
};

/// Append a q-construct group `q,server_call` to a path.
pub fn append(path: &mut Vec<PathElement>, q: QConstruct, server_call: &Callsign) {
    path.push(PathElement::new(q.as_str()));
    path.push(PathElement::from_callsign(server_call, false));
}

/// Position of the first q-construct-looking element, if any.
pub fn find_q(path: &[PathElement]) -> Option<usize> {
    path.iter()
        .position(|element| element.looks_like_q_construct())
}

/// Normalize the q-state of a packet accepted from a client login.
///
/// A valid existing q-construct passes through untouched; a malformed
/// `q…` group is stripped. A packet without one gets `qAC`/`qAX` with the
/// server's call appended, depending on whether the login verified.
pub fn normalize(path: &mut Vec<PathElement>, verified: bool, server_call: &Callsign) {
    if let Some(index) = find_q(path) {
        if path[index].q_construct().is_some() {
            return;
        }
        // malformed q-construct, drop the marker and its server call
        strip_group(path, index);
    }

    append(path, QConstruct::for_client(verified), server_call);
}

/// Strip every q-construct group and `TCPIP` marker, preparing a path for
/// RF emission.
pub fn strip_for_rf(path: &mut Vec<PathElement>) {
    while let Some(index) = find_q(path) {
        strip_group(path, index);
    }
    path.retain(|element| !element.is_tcpip());
}

/// Remove the `q…` element at `index` together with its following
/// server-call element, when present.
fn strip_group(path: &mut Vec<PathElement>, index: usize) {
    path.remove(index);
    if index < path.len() {
        path.remove(index);
    }
}

#[cfg(test)]
mod tests {
    use aprsgate_types::{
        Callsign,
        Packet,
        QConstruct,
    };

    use crate::qpath::{
        append,
        normalize,
        strip_for_rf,
    };

    fn server() -> Callsign {
        "GATE-10".parse().unwrap()
    }

    fn path_of(line: &str) -> Vec<aprsgate_types::PathElement> {
        Packet::parse(line.as_bytes()).unwrap().path
    }

    fn rendered(path: &[aprsgate_types::PathElement]) -> Vec<String> {
        path.iter().map(|element| element.to_string()).collect()
    }

    #[test]
    fn it_appends_qac_for_verified_logins() {
        let mut path = path_of("N0CALL>APRS,TCPIP*:>s");
        normalize(&mut path, true, &server());
        assert_eq!(rendered(&path), ["TCPIP*", "qAC", "GATE-10"]);
    }

    #[test]
    fn it_appends_qax_for_unverified_logins() {
        let mut path = path_of("N0CALL>APRS:>s");
        normalize(&mut path, false, &server());
        assert_eq!(rendered(&path), ["qAX", "GATE-10"]);
    }

    #[test]
    fn it_passes_valid_q_constructs_through() {
        let mut path = path_of("N0CALL>APRS,qAR,IGATE:>s");
        normalize(&mut path, true, &server());
        assert_eq!(rendered(&path), ["qAR", "IGATE"]);
    }

    #[test]
    fn it_replaces_malformed_q_constructs() {
        let mut path = path_of("N0CALL>APRS,qAQ,IGATE:>s");
        normalize(&mut path, false, &server());
        assert_eq!(rendered(&path), ["qAX", "GATE-10"]);
    }

    #[test]
    fn it_strips_q_groups_and_tcpip_for_rf() {
        let mut path = path_of("N0CALL>APRS,WIDE2-1,qAC,SRV:>s");
        strip_for_rf(&mut path);
        assert_eq!(rendered(&path), ["WIDE2-1"]);

        let mut path = path_of("N0CALL>APRS,TCPIP*,qAX,SRV,WIDE1-1:>s");
        strip_for_rf(&mut path);
        assert_eq!(rendered(&path), ["WIDE1-1"]);
    }

    #[test]
    fn it_strips_a_trailing_q_without_server_call() {
        let mut path = path_of("N0CALL>APRS,WIDE1-1,qAR:>s");
        strip_for_rf(&mut path);
        assert_eq!(rendered(&path), ["WIDE1-1"]);
    }

    #[test]
    fn append_builds_the_two_element_group() {
        let mut path = Vec::new();
        append(&mut path, QConstruct::AR, &server());
        assert_eq!(rendered(&path), ["qAR", "GATE-10"]);
    }
}
