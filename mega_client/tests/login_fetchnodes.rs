//! End-to-end login and tree fetch against the scripted backend.
//!
//! Covers the fresh-login scenario (credentials → session → tree in
//! memory and in the cache, cursor committed alongside) and the session
//! dump/restore roundtrip.

mod support;

use serde_json::json;

use mega_core::crypto::FileKey;
use mega_core::{NodeHandle, b64};
use support::*;

fn handle(c: u64) -> NodeHandle {
    NodeHandle::from_raw(c)
}

#[test]
fn fresh_login_and_fetchnodes() {
    let mut h = harness();
    full_login(&mut h, None);

    let root = handle(0xa);
    let rubbish = handle(0xb);
    let file = handle(0xc);
    let key = FileKey {
        aes: [3u8; 16],
        iv: [4u8; 8],
        meta_mac: [5u8; 8],
    };

    h.client.fetch_nodes(2);
    assert!(answer_cs(&mut h, |batch| {
        assert_eq!(batch[0]["a"], "f");
        json!([{
            "f": [
                {"h": root.to_b64(), "t": 2},
                {"h": rubbish.to_b64(), "t": 4},
                file_node_json(file, root, "c.txt", 1024, 100, &key),
            ],
            "sn": "S0AAAAAAAA",
        }])
    }));

    assert_eq!(h.events.lock().unwrap().fetchnodes, Some(Ok(())));
    assert_eq!(h.client.nodes.len(), 3);
    assert_eq!(h.client.nodes.root, root);
    assert_eq!(h.client.nodes.rubbish, rubbish);
    assert_eq!(h.client.scsn.as_str(), Some("S0AAAAAAAA"));

    let c = h.client.nodes.get(file).expect("file node present");
    assert_eq!(c.parent, Some(root));
    assert_eq!(c.name(), "c.txt");
    assert!(c.has_key(), "node key must decrypt with the master key");
    assert_eq!(c.key.decrypted().unwrap(), key.fold());
    let fp = c.fingerprint.expect("fingerprint from attributes");
    assert_eq!((fp.size, fp.mtime), (1024, 100));

    // Cache: exactly three node rows and one cursor row, committed.
    let names = h.db.database_names();
    assert_eq!(names.len(), 1);
    let dbname = &names[0];
    assert_eq!(h.db.records_of_kind(dbname, mega_client::KIND_NODE).len(), 3);
    assert_eq!(h.db.records_of_kind(dbname, mega_client::KIND_SCSN).len(), 1);
    assert!(h.events.lock().unwrap().db_commits >= 1);
}

#[test]
fn session_dump_roundtrip() {
    let mut h = harness();
    full_login(&mut h, None);

    let blob = h.client.dump_session().expect("logged in");
    assert_eq!(blob[0], 1);
    assert_eq!(blob.len(), 1 + 16 + 27);

    let mut h2 = harness_with(h.http.clone(), h.db.clone(), h.fs.clone());
    h2.client.login_with_session(&blob).unwrap();
    assert_eq!(h2.client.dump_session().as_deref(), Some(blob.as_slice()));
}

#[test]
fn folder_session_dump_roundtrip() {
    let mut h = harness();
    let link = mega_core::links::PublicLink::new_folder(
        mega_core::PublicHandle::from_raw(0x99),
        [5u8; 16],
    );
    h.client.login_to_folder(&link).unwrap();

    let blob = h.client.dump_session().expect("folder session");
    assert_eq!(blob[0], 2);
    // fixed-length regardless of optional auth fields
    assert_eq!(blob.len(), 96);

    let mut h2 = harness_with(h.http.clone(), h.db.clone(), h.fs.clone());
    h2.client.login_with_session(&blob).unwrap();
    assert_eq!(h2.client.dump_session().as_deref(), Some(blob.as_slice()));
}

#[test]
fn login_failure_surfaces() {
    let mut h = harness();
    h.client.login("u@x", "wrong", 1);
    assert!(answer_cs(&mut h, |_| json!([{"v": 1}])));
    // ENOENT: unknown user / wrong credentials
    assert!(answer_cs(&mut h, |_| json!([-9])));
    assert_eq!(
        h.events.lock().unwrap().login,
        Some(Err(mega_core::ApiError::NotFound))
    );
}

#[test]
fn batch_positional_demultiplexing() {
    let mut h = harness();
    full_login(&mut h, None);
    let root = support::insert_folder(
        &mut h.client,
        0xa,
        None,
        mega_client::NodeType::Root,
        "root",
    );

    // Two commands in one batch: first fails, second succeeds, each
    // completion sees only its own element.
    h.client.create_folder(root, "one", 10).unwrap();
    h.client.create_folder(root, "two", 11).unwrap();
    assert!(answer_cs(&mut h, |batch| {
        assert_eq!(batch.as_array().unwrap().len(), 2);
        assert_eq!(batch[0]["a"], "p");
        json!([
            -11,
            {"f": [{"h": NodeHandle::from_raw(0x10).to_b64(), "p": batch[1]["t"],
                     "t": 1, "u": me().to_b64(),
                     "k": format!("{}:{}", me().to_b64(), b64::encode(&[0u8; 16]))}]},
        ])
    }));
    assert!(h.client.nodes.contains(NodeHandle::from_raw(0x10)));
}
