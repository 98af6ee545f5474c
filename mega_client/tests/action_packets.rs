//! Action-packet processing: ordered application, move recognition,
//! idempotent re-application, unknown-code tolerance and the durability
//! commit on end-of-batch.

mod support;

use serde_json::json;

use mega_core::NodeHandle;
use mega_core::crypto::FileKey;
use support::*;

fn handle(c: u64) -> NodeHandle {
    NodeHandle::from_raw(c)
}

/// Brings up a logged-in client with root/rubbish/file as in a fresh
/// fetch, returning (root, rubbish, file).
fn seeded(h: &mut Harness) -> (NodeHandle, NodeHandle, NodeHandle) {
    full_login(h, None);
    let root = handle(0xa);
    let rubbish = handle(0xb);
    let file = handle(0xc);
    let key = FileKey {
        aes: [3u8; 16],
        iv: [4u8; 8],
        meta_mac: [5u8; 8],
    };
    h.client.fetch_nodes(2);
    assert!(answer_cs(h, |_| {
        json!([{
            "f": [
                {"h": root.to_b64(), "t": 2},
                {"h": rubbish.to_b64(), "t": 4},
                file_node_json(file, root, "c.txt", 1024, 100, &key),
            ],
            "sn": "S0AAAAAAAA",
        }])
    }));
    (root, rubbish, file)
}

#[test]
fn delete_then_readd_is_a_move() {
    let mut h = harness();
    let (_root, rubbish, file) = seeded(&mut h);
    h.events.lock().unwrap().node_updates.clear();

    let packets = json!([
        {"a": "d", "n": file.to_b64()},
        {"a": "t", "t": {"f": [{"h": file.to_b64(), "p": rubbish.to_b64(), "t": 0}]}},
    ]);
    assert!(push_sc(&mut h, packets, "S1AAAAAAAA"));

    let c = h.client.nodes.get(file).expect("file survives the move");
    assert_eq!(c.parent, Some(rubbish));
    assert_eq!(h.client.scsn.as_str(), Some("S1AAAAAAAA"));
    assert_eq!(h.client.transfer_count(), 0, "no transfer may start");

    // One coherent notification batch with the moved node.
    let events = h.events.lock().unwrap();
    let batch: Vec<_> = events
        .node_updates
        .iter()
        .filter(|b| !b.is_empty())
        .collect();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].as_slice(), &[file]);
}

#[test]
fn reapplying_the_same_packets_is_a_noop() {
    let mut h = harness();
    let (_root, rubbish, file) = seeded(&mut h);

    let packets = json!([
        {"a": "d", "n": file.to_b64()},
        {"a": "t", "t": {"f": [{"h": file.to_b64(), "p": rubbish.to_b64(), "t": 0}]}},
    ]);
    assert!(push_sc(&mut h, packets.clone(), "S1AAAAAAAA"));
    let nodes_after_first = h.client.nodes.len();

    assert!(push_sc(&mut h, packets, "S2AAAAAAAA"));
    assert_eq!(h.client.nodes.len(), nodes_after_first);
    assert_eq!(
        h.client.nodes.get(file).unwrap().parent,
        Some(rubbish),
        "second application leaves the tree unchanged"
    );
    assert_eq!(h.client.scsn.as_str(), Some("S2AAAAAAAA"));
}

#[test]
fn unknown_packet_codes_are_skipped() {
    let mut h = harness();
    let (root, _rubbish, file) = seeded(&mut h);

    let packets = json!([
        {"a": "future-code", "x": 1},
        {"a": "u", "n": file.to_b64(), "ts": 12345},
        {"nota": "packet"},
    ]);
    assert!(push_sc(&mut h, packets, "S1AAAAAAAA"));
    assert_eq!(h.client.nodes.get(file).unwrap().ctime, 12345);
    assert_eq!(h.client.nodes.get(file).unwrap().parent, Some(root));
}

#[test]
fn keepalive_body_rearms_polling() {
    let mut h = harness();
    seeded(&mut h);

    h.client.exec();
    let req = h.http.pop_request_matching("wsc?").expect("long poll active");
    h.http.respond(&req, b"0");
    h.client.exec();

    // The channel must come back for more.
    assert!(h.http.pop_request_matching("wsc?").is_some());
}

#[test]
fn subtree_deletion_purges_descendants() {
    let mut h = harness();
    let (root, _rubbish, file) = seeded(&mut h);

    assert!(push_sc(
        &mut h,
        json!([{"a": "d", "n": root.to_b64()}]),
        "S1AAAAAAAA"
    ));
    assert!(!h.client.nodes.contains(root));
    assert!(!h.client.nodes.contains(file));
}

#[test]
fn contact_packet_updates_users() {
    let mut h = harness();
    seeded(&mut h);

    let peer = mega_core::UserHandle::from_raw(0x1234_5678_9abc);
    let packets = json!([{
        "a": "c",
        "u": [{"u": peer.to_b64(), "c": 1, "m": "peer@x", "ts": 77}],
    }]);
    assert!(push_sc(&mut h, packets, "S1AAAAAAAA"));

    let user = h.client.users.get(peer).expect("contact created");
    assert_eq!(user.email, "peer@x");
    assert_eq!(user.visibility, mega_client::users::Visibility::Visible);
    assert_eq!(h.client.users.by_email("peer@x").unwrap().handle, peer);
}
