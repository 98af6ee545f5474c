//! CS dispatcher contract: idempotent retries under the same request
//! id, lock/rate retry bodies, top-level aborts and session death, plus
//! the streaming direct-read path.

mod support;

use serde_json::json;

use mega_client::NodeType;
use mega_core::crypto::{FileKey, SymmCipher};
use support::*;

fn reqid_of(url: &str) -> String {
    let start = url.find("id=").expect("cs url carries an id") + 3;
    url[start..start + 10].to_string()
}

#[test]
fn lock_retry_reposts_same_request_id() {
    let mut h = harness();
    h.client.login("u@x", "p", 1);

    h.client.exec();
    let first = h.http.pop_request_matching("/cs?").unwrap();
    let id1 = reqid_of(first.url());
    let body1 = first.body().to_vec();
    // Exact "-3": server-side lock, silent retry.
    h.http.respond(&first, b"-3");
    h.client.exec();

    // The retry is armed with backoff; force it due and re-run.
    h.client.advance_clock(100);
    h.client.exec();
    let second = h.http.pop_request_matching("/cs?").expect("retried POST");
    assert_eq!(reqid_of(second.url()), id1, "same reqid: dedup-safe");
    assert_eq!(second.body(), body1, "identical batch body");
}

#[test]
fn connectivity_failure_retries_with_backoff() {
    let mut h = harness();
    h.client.login("u@x", "p", 1);

    h.client.exec();
    let first = h.http.pop_request_matching("/cs?").unwrap();
    let id1 = reqid_of(first.url());
    h.http.fail_transport(&first);
    h.client.exec();
    assert!(
        h.http.pop_request_matching("/cs?").is_none(),
        "no immediate re-post before the backoff fires"
    );

    h.client.advance_clock(100);
    h.client.exec();
    let second = h.http.pop_request_matching("/cs?").expect("retried POST");
    assert_eq!(reqid_of(second.url()), id1);
}

#[test]
fn toplevel_error_aborts_whole_batch() {
    let mut h = harness();
    h.client.login("u@x", "p", 1);
    assert!(answer_cs(&mut h, |_| json!({"err": -2})));
    assert_eq!(
        h.events.lock().unwrap().login,
        Some(Err(mega_core::ApiError::Args))
    );
}

#[test]
fn esid_kills_the_session() {
    let mut h = harness();
    full_login(&mut h, None);
    h.client.scsn.set("S0AAAAAAAA");
    assert!(h.client.scsn.ready());

    h.client.fetch_nodes(2);
    assert!(answer_cs(&mut h, |_| json!(-15)));
    assert!(!h.client.scsn.ready(), "SC polling suspended after ESID");

    // Long polls posted before the death are moot; no new one may start.
    while h.http.pop_request_matching("wsc?").is_some() {}
    h.client.exec();
    assert!(
        h.http.pop_request_matching("wsc?").is_none(),
        "no further long-poll after session death"
    );
}

#[test]
fn direct_read_streams_decrypted_bytes() {
    let mut h = harness();
    let root = insert_folder(&mut h.client, 0x1, None, NodeType::Root, "root");
    let key = FileKey {
        aes: [4u8; 16],
        iv: [5u8; 8],
        meta_mac: [0u8; 8],
    };
    let file = insert_file(&mut h.client, 0x10, root, "stream.bin", 1 << 20, key);

    let plain = b"some streamable media bytes.....".to_vec();
    let offset = 4096u64;
    let read_id = h
        .client
        .direct_read(file, false, Some(key), offset, plain.len() as u64);

    // URL command, then the ranged request.
    assert!(answer_cs(&mut h, |batch| {
        assert_eq!(batch[0]["a"], "g");
        json!([{"p": "https://gfs.test/stream"}])
    }));
    h.client.exec();
    let req = h.http.pop_request_matching("gfs.test").expect("range request");
    assert!(req.url().ends_with(&format!("/{}-{}", offset, offset + plain.len() as u64 - 1)));

    let cipher = SymmCipher::new(key.aes);
    let mut body = plain.clone();
    cipher.ctr_crypt(&key.iv, offset, &mut body);
    h.http.respond(&req, &body);
    h.client.exec();

    let events = h.events.lock().unwrap();
    assert_eq!(events.dr_data.len(), 1);
    assert_eq!(events.dr_data[0].0, read_id);
    assert_eq!(events.dr_data[0].1, plain, "bytes arrive decrypted");
}

#[test]
fn cancelled_direct_read_reports_incomplete() {
    let mut h = harness();
    let root = insert_folder(&mut h.client, 0x1, None, NodeType::Root, "root");
    let key = FileKey {
        aes: [4u8; 16],
        iv: [5u8; 8],
        meta_mac: [0u8; 8],
    };
    let file = insert_file(&mut h.client, 0x10, root, "stream.bin", 1 << 20, key);

    let read_id = h.client.direct_read(file, false, Some(key), 0, 1024);
    h.client.cancel_direct_read(read_id);
    let events = h.events.lock().unwrap();
    assert_eq!(
        events.dr_failed,
        vec![(read_id, mega_core::ApiError::Incomplete)]
    );
}
