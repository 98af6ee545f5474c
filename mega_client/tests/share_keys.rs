//! Share-key distribution and revocation, RSA-wrapped node keys and the
//! rewrite queue, and authring protection against key substitution.

mod support;

use std::sync::OnceLock;

use serde_json::json;

use mega_client::NodeType;
use mega_client::nodes::{Access, Share};
use mega_core::crypto::FileKey;
use mega_core::keypair::KeyPairs;
use mega_core::{NodeHandle, PcrHandle, UserHandle, b64};
use support::*;

fn keypairs() -> &'static KeyPairs {
    static PAIRS: OnceLock<KeyPairs> = OnceLock::new();
    PAIRS.get_or_init(|| {
        let mut rng = rand::SeedableRng::seed_from_u64(1234);
        KeyPairs::generate(&mut rng).expect("rsa generation")
    })
}

fn peer() -> UserHandle {
    UserHandle::from_raw(0x0011_2233_4455_6677)
}

#[test]
fn share_addition_installs_key_and_edge() {
    let mut h = harness();
    full_login(&mut h, None);
    let root = insert_folder(&mut h.client, 0x1, None, NodeType::Root, "root");
    let shared = insert_folder(&mut h.client, 0x20, Some(root), NodeType::Folder, "shared");

    let share_key = [0x5au8; 16];
    let mut wrapped = share_key.to_vec();
    master().ecb_encrypt(&mut wrapped);

    let packets = json!([{
        "a": "s2",
        "n": shared.to_b64(),
        "u": peer().to_b64(),
        "r": 2,
        "ts": 1000,
        "k": b64::encode(&wrapped),
    }]);
    h.client.scsn.set("S0AAAAAAAA");
    assert!(push_sc(&mut h, packets, "S1AAAAAAAA"));

    let node = h.client.nodes.get(shared).unwrap();
    assert_eq!(node.share_key, Some(share_key));
    let edge = node.outshares.get(&peer()).expect("outshare edge");
    assert_eq!(edge.access, Access::Full);
}

#[test]
fn share_revocation_drops_key_and_rewrites_foreign_keys() {
    let mut h = harness();
    full_login(&mut h, None);
    let root = insert_folder(&mut h.client, 0x1, None, NodeType::Root, "root");
    let shared = insert_folder(&mut h.client, 0x20, Some(root), NodeType::Folder, "shared");
    let key = FileKey {
        aes: [6u8; 16],
        iv: [7u8; 8],
        meta_mac: [0u8; 8],
    };
    let foreign = insert_file(&mut h.client, 0x21, shared, "theirs.bin", 99, key);

    // Established share with a key and one peer; one descendant carries
    // a foreign-wrapped key.
    {
        let node = h.client.nodes.get_mut(shared).unwrap();
        node.share_key = Some([0x5au8; 16]);
        node.outshares.insert(
            peer(),
            Share {
                user: peer(),
                pcr: PcrHandle::UNDEF,
                access: Access::Full,
                ts: 1000,
            },
        );
        h.client.nodes.get_mut(foreign).unwrap().foreign_key = true;
    }

    h.client.scsn.set("S0AAAAAAAA");
    let packets = json!([{
        "a": "s",
        "n": shared.to_b64(),
        "u": peer().to_b64(),
        "okd": 1,
    }]);
    assert!(push_sc(&mut h, packets, "S1AAAAAAAA"));

    let node = h.client.nodes.get(shared).unwrap();
    assert!(node.outshares.is_empty(), "peer edge removed");
    assert_eq!(node.share_key, None, "share key dropped with last edge");

    // The foreign-owned descendant must get a fresh symmetric wrap.
    assert!(answer_cs(&mut h, |batch| {
        let nk = batch[0]["nk"].as_array().expect("key rewrite batch");
        assert_eq!(batch[0]["a"], "k");
        assert_eq!(nk.len(), 2, "exactly one rewrite pair");
        assert_eq!(nk[0], foreign.to_b64());
        json!([0])
    }));
}

#[test]
fn rsa_wrapped_key_decrypts_and_queues_rewrite() {
    let mut h = harness();
    let kp = keypairs();
    full_login(&mut h, kp.rsa.private_blob());
    let root = insert_folder(&mut h.client, 0x1, None, NodeType::Root, "root");

    let key = FileKey {
        aes: [0xaau8; 16],
        iv: [0xbbu8; 8],
        meta_mac: [0xccu8; 8],
    };
    let full = key.fold();
    let rsa_wrapped = kp.rsa.encrypt(&full);
    assert!(rsa_wrapped.len() > 40, "RSA form exceeds symmetric sizes");

    let node = NodeHandle::from_raw(0x30);
    let cipher = mega_core::crypto::SymmCipher::new(key.aes);
    let attrs = mega_core::attrs::name_attrs("wrapped.bin", None);
    let blob = mega_core::attrs::encrypt_attrs(&attrs, &cipher);

    h.client.scsn.set("S0AAAAAAAA");
    let packets = json!([{
        "a": "t",
        "t": {"f": [{
            "h": node.to_b64(),
            "p": root.to_b64(),
            "t": 0,
            "s": 99,
            "u": me().to_b64(),
            "k": format!("{}:{}", me().to_b64(), b64::encode(&rsa_wrapped)),
            "a": b64::encode(&blob),
        }]},
    }]);
    assert!(push_sc(&mut h, packets, "S1AAAAAAAA"));

    let n = h.client.nodes.get(node).expect("node ingested");
    assert!(n.has_key(), "RSA unwrap succeeded");
    assert_eq!(n.key.decrypted().unwrap(), full);
    assert_eq!(n.name(), "wrapped.bin");

    // The handle appears exactly once in the rewrite batch.
    assert!(answer_cs(&mut h, |batch| {
        assert_eq!(batch[0]["a"], "k");
        let nk = batch[0]["nk"].as_array().unwrap();
        let mentions = nk
            .iter()
            .filter(|v| v.as_str() == Some(node.to_b64().as_str()))
            .count();
        assert_eq!(mentions, 1);

        // And the new wrap is the symmetric master-key form.
        let rewrapped = b64::decode(nk[1].as_str().unwrap()).unwrap();
        let mut plain = rewrapped.clone();
        master().ecb_decrypt(&mut plain);
        assert_eq!(plain, full);
        json!([0])
    }));
}

#[test]
fn tracked_key_mismatch_is_preserved_and_reported() {
    let mut h = harness();
    full_login(&mut h, None);

    // First observation tracks the key.
    let blob_a = b"public-key-material-a".to_vec();
    let packets = json!([]);
    h.client.scsn.set("S0AAAAAAAA");
    assert!(push_sc(&mut h, packets, "S1AAAAAAAA"));

    h.client.request_pubkey(peer(), 5);
    assert!(answer_cs(&mut h, |batch| {
        assert_eq!(batch[0]["a"], "uk");
        json!([{"pubk": b64::encode(&blob_a)}])
    }));
    // (the blob is not a parseable RSA key, so only the ring tracked it)

    // A different key for the same contact must not replace the record.
    h.client.request_pubkey(peer(), 6);
    assert!(answer_cs(&mut h, |batch| {
        assert_eq!(batch[0]["a"], "uk");
        json!([{"pubk": b64::encode(b"public-key-material-EVIL")}])
    }));
    assert_eq!(h.events.lock().unwrap().key_modified, vec![peer()]);
}
