//! Transfer engine behavior: slot-count invariants, overquota backoff
//! holding the download direction, and chunked resumption against the
//! partial-file fingerprint.

mod support;

use std::path::PathBuf;

use serde_json::json;

use mega_client::{NodeType, TransferState};
use mega_core::crypto::{FileKey, SymmCipher};
use mega_core::PublicHandle;
use support::*;

fn folder_link() -> mega_core::links::PublicLink {
    mega_core::links::PublicLink::new_folder(PublicHandle::from_raw(0x99), [5u8; 16])
}

#[test]
fn overquota_holds_the_download_direction() {
    let mut h = harness();
    let root = insert_folder(&mut h.client, 0x1, None, NodeType::Root, "root");
    let key = FileKey {
        aes: [1u8; 16],
        iv: [2u8; 8],
        meta_mac: [0u8; 8],
    };
    let file = insert_file(&mut h.client, 0x10, root, "big.bin", 60_000, key);

    let id = h
        .client
        .start_download(file, PathBuf::from("/dl/big.bin"), None, 1)
        .unwrap();

    // The slot asks for a temp URL; the server answers overquota with a
    // retry-in of 60 seconds.
    assert!(answer_cs(&mut h, |batch| {
        assert_eq!(batch[0]["a"], "g");
        json!([{"e": -17, "tl": 60}])
    }));

    assert_eq!(h.client.transfer_state(id), Some(TransferState::Retrying));
    let now = h.client.now_ds();
    let fire = h.client.transfer_next_fire(id).unwrap();
    assert!(
        fire >= now + 595 && fire <= now + 605,
        "retry must be armed ~600 ds out, got {} at {}",
        fire,
        now
    );

    // Nothing else in the GET direction may jump the queue.
    let file2 = insert_file(&mut h.client, 0x11, root, "other.bin", 500, key);
    h.client
        .start_download(file2, PathBuf::from("/dl/other.bin"), None, 2)
        .unwrap();
    h.client.exec();
    let (_, get_slots, _) = h.client.slot_counts();
    assert_eq!(get_slots, 0, "downloads stay held during overquota");
}

#[test]
fn slot_count_invariants() {
    let mut h = harness();
    let root = insert_folder(&mut h.client, 0x1, None, NodeType::Root, "root");
    let key = FileKey {
        aes: [1u8; 16],
        iv: [2u8; 8],
        meta_mac: [0u8; 8],
    };
    for i in 0..80u64 {
        let file = insert_file(&mut h.client, 0x100 + i, root, &format!("f{i}"), 1000 + i, key);
        h.client
            .start_download(file, PathBuf::from(format!("/dl/f{i}")), None, 0)
            .unwrap();
    }
    h.client.exec();
    h.client.exec();

    let (total, get, put) = h.client.slot_counts();
    assert!(total <= 48, "total slots capped at 48, got {total}");
    assert!(get <= 32, "GET slots capped at 32, got {get}");
    assert_eq!(put, 0);
    assert!(get > 0, "some downloads must have started");

    // Soft-pausing PUT leaves the GET slots untouched.
    h.client.pause_transfers(mega_client::Direction::Put, false);
    h.client.exec();
    let (_, get_after, _) = h.client.slot_counts();
    assert_eq!(get_after, get);
}

/// Downloads two chunks, restarts the engine over the same cache, and
/// verifies the transfer resumes at the contiguous block end; a
/// corrupted temp file restarts from zero instead.
#[test]
fn download_resumption_via_cache() {
    let key = FileKey {
        aes: [8u8; 16],
        iv: [9u8; 8],
        meta_mac: [0u8; 8],
    };
    let size: u64 = 600_000;
    let plain: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

    let (http, db, fs, final_pos) = {
        let mut h = harness();
        h.client.login_to_folder(&folder_link()).unwrap();
        let root = insert_folder(&mut h.client, 0x1, None, NodeType::Root, "root");
        let file = insert_file(&mut h.client, 0x10, root, "c.bin", size, key);
        h.client.nodes.notify(file);
        h.client.scsn.set("S0AAAAAAAA");
        h.client.exec();

        let id = h
            .client
            .start_download(file, PathBuf::from("/dl/c.bin"), None, 1)
            .unwrap();
        assert!(answer_cs(&mut h, |_| json!([{"p": "https://gfs.test/dl"}])));

        // Serve the first two chunks (128K + 256K).
        let cipher = SymmCipher::new(key.aes);
        for (start, len) in [(0u64, 131_072usize), (131_072, 262_144)] {
            h.client.exec();
            let req = h
                .http
                .pop_request_matching("gfs.test")
                .expect("chunk request");
            assert!(req.url().contains(&format!("/{start}-")));
            let mut chunk = plain[start as usize..start as usize + len].to_vec();
            cipher.ctr_crypt(&key.iv, start, &mut chunk);
            h.http.respond(&req, &chunk);
            h.client.exec();
        }
        let (pos, completed, _) = h.client.transfer_progress(id).unwrap();
        assert_eq!(pos, 393_216);
        assert_eq!(completed, 393_216);

        // Commit the cache (transfer record included) at a new cursor.
        assert!(push_sc(&mut h, json!([]), "S1AAAAAAAA"));
        (h.http.clone(), h.db.clone(), h.fs.clone(), pos)
    };

    // Restart: same backends, fresh engine.
    let mut h2 = harness_with(http, db, fs);
    h2.client.login_to_folder(&folder_link()).unwrap();
    let ids = h2.client.transfer_ids();
    assert_eq!(ids.len(), 1, "cached transfer restored");
    let id = ids[0];
    assert_eq!(h2.client.transfer_state(id), Some(TransferState::Paused));

    // Reaching state-current releases deferred transfers.
    assert!(push_sc(&mut h2, json!([]), "S2AAAAAAAA"));
    h2.client.exec();

    let (pos, completed, size_back) = h2.client.transfer_progress(id).unwrap();
    assert_eq!(size_back, size);
    assert_eq!(completed, final_pos);
    assert_eq!(pos, final_pos, "resume at the contiguous block end");
    assert!(pos <= completed);
}

#[test]
fn download_restarts_when_temp_file_mismatches() {
    let key = FileKey {
        aes: [8u8; 16],
        iv: [9u8; 8],
        meta_mac: [0u8; 8],
    };
    let size: u64 = 600_000;
    let plain: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

    let (http, db, fs) = {
        let mut h = harness();
        h.client.login_to_folder(&folder_link()).unwrap();
        let root = insert_folder(&mut h.client, 0x1, None, NodeType::Root, "root");
        let file = insert_file(&mut h.client, 0x10, root, "c.bin", size, key);
        h.client.nodes.notify(file);
        h.client.scsn.set("S0AAAAAAAA");
        h.client.exec();

        h.client
            .start_download(file, PathBuf::from("/dl/c.bin"), None, 1)
            .unwrap();
        assert!(answer_cs(&mut h, |_| json!([{"p": "https://gfs.test/dl"}])));

        let cipher = SymmCipher::new(key.aes);
        h.client.exec();
        let req = h.http.pop_request_matching("gfs.test").unwrap();
        let mut chunk = plain[..131_072].to_vec();
        cipher.ctr_crypt(&key.iv, 0, &mut chunk);
        h.http.respond(&req, &chunk);
        h.client.exec();

        assert!(push_sc(&mut h, json!([]), "S1AAAAAAAA"));
        (h.http.clone(), h.db.clone(), h.fs.clone())
    };

    // Corrupt the staged partial before the restart.
    fs.write_file("/dl/c.bin.getxfer", b"corrupted beyond recognition", 1);

    let mut h2 = harness_with(http, db, fs);
    h2.client.login_to_folder(&folder_link()).unwrap();
    let ids = h2.client.transfer_ids();
    assert_eq!(ids.len(), 1);
    assert!(push_sc(&mut h2, json!([]), "S2AAAAAAAA"));
    h2.client.exec();

    let (pos, completed, _) = h2.client.transfer_progress(ids[0]).unwrap();
    assert_eq!(pos, 0, "fingerprint mismatch resets progress");
    assert_eq!(completed, 0);
}
