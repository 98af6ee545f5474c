//! Shared harness: a client wired to the scripted HTTP backend, the
//! in-memory filesystem and the in-memory cache database, plus helpers
//! for scripting the CS and SC channels and building remote nodes.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use mega_client::app::AppHandler;
use mega_client::client::{ClientConfig, MegaClient};
use mega_client::nodes::{Node, NodeKey, NodeType};
use mega_core::crypto::{FileKey, SymmCipher};
use mega_core::testutil::{MemFileSystem, ScriptedHttp};
use mega_core::{ApiError, FileFingerprint, NodeHandle, UserHandle, b64};
use mega_store_memory::MemoryDbAccess;

pub const API: &str = "https://api.test/";

#[derive(Default)]
pub struct Events {
    pub login: Option<Result<(), ApiError>>,
    pub fetchnodes: Option<Result<(), ApiError>>,
    pub node_updates: Vec<Vec<NodeHandle>>,
    pub transfers_complete: Vec<NodeHandle>,
    pub transfers_failed: Vec<ApiError>,
    pub key_modified: Vec<UserHandle>,
    pub db_commits: usize,
    pub dr_data: Vec<(u64, Vec<u8>)>,
    pub dr_failed: Vec<(u64, ApiError)>,
}

#[derive(Clone, Default)]
pub struct Recorder(pub Arc<Mutex<Events>>);

impl AppHandler for Recorder {
    fn login_result(&mut self, result: Result<(), ApiError>) {
        self.0.lock().unwrap().login = Some(result);
    }

    fn fetchnodes_result(&mut self, result: Result<(), ApiError>) {
        self.0.lock().unwrap().fetchnodes = Some(result);
    }

    fn nodes_updated(&mut self, nodes: &[NodeHandle]) {
        self.0.lock().unwrap().node_updates.push(nodes.to_vec());
    }

    fn transfer_complete(&mut self, _id: mega_client::TransferId, node: NodeHandle) {
        self.0.lock().unwrap().transfers_complete.push(node);
    }

    fn transfer_failed(&mut self, _id: mega_client::TransferId, err: ApiError) {
        self.0.lock().unwrap().transfers_failed.push(err);
    }

    fn key_modified(&mut self, user: UserHandle) {
        self.0.lock().unwrap().key_modified.push(user);
    }

    fn notify_dbcommit(&mut self) {
        self.0.lock().unwrap().db_commits += 1;
    }

    fn direct_read_data(&mut self, read_id: u64, data: &[u8]) -> bool {
        self.0.lock().unwrap().dr_data.push((read_id, data.to_vec()));
        true
    }

    fn direct_read_failed(&mut self, read_id: u64, err: ApiError) {
        self.0.lock().unwrap().dr_failed.push((read_id, err));
    }
}

pub struct Harness {
    pub client: MegaClient,
    pub http: ScriptedHttp,
    pub db: MemoryDbAccess,
    pub fs: MemFileSystem,
    pub events: Arc<Mutex<Events>>,
}

pub fn harness() -> Harness {
    let http = ScriptedHttp::new();
    let db = MemoryDbAccess::new();
    let fs = MemFileSystem::new();
    let recorder = Recorder::default();
    let events = recorder.0.clone();
    let client = MegaClient::new(
        ClientConfig {
            api_url: API.to_string(),
            app_key: "sdktestak".to_string(),
            lang: None,
            rng_seed: Some(42),
        },
        Box::new(http.clone()),
        Arc::new(fs.clone()),
        Some(Box::new(db.clone())),
        Box::new(mega_core::caps::NullGfx),
        Box::new(recorder),
    );
    Harness {
        client,
        http,
        db,
        fs,
        events,
    }
}

/// Reuses an existing backend set, as a process restart would.
pub fn harness_with(http: ScriptedHttp, db: MemoryDbAccess, fs: MemFileSystem) -> Harness {
    let recorder = Recorder::default();
    let events = recorder.0.clone();
    let client = MegaClient::new(
        ClientConfig {
            api_url: API.to_string(),
            app_key: "sdktestak".to_string(),
            lang: None,
            rng_seed: Some(43),
        },
        Box::new(http.clone()),
        Arc::new(fs.clone()),
        Some(Box::new(db.clone())),
        Box::new(mega_core::caps::NullGfx),
        Box::new(recorder),
    );
    Harness {
        client,
        http,
        db,
        fs,
        events,
    }
}

/// Answers the next CS batch with `respond(batch) -> response body`.
pub fn answer_cs(h: &mut Harness, respond: impl FnOnce(&Value) -> Value) -> bool {
    h.client.exec();
    let Some(req) = h.http.pop_request_matching("/cs?") else {
        return false;
    };
    let batch: Value = serde_json::from_slice(req.body()).expect("batch is json");
    let response = respond(&batch);
    h.http.respond(&req, response.to_string().as_bytes());
    h.client.exec();
    true
}

/// Answers the next SC long-poll with a packet batch.
pub fn push_sc(h: &mut Harness, packets: Value, sn: &str) -> bool {
    h.client.exec();
    let Some(req) = h.http.pop_request_matching("wsc?") else {
        return false;
    };
    let body = json!({"a": packets, "sn": sn, "ir": 0});
    h.http.respond(&req, body.to_string().as_bytes());
    h.client.exec();
    true
}

pub const MASTER_KEY: [u8; 16] = [7u8; 16];
pub const SID: [u8; 27] = [9u8; 27];

pub fn master() -> SymmCipher {
    SymmCipher::new(MASTER_KEY)
}

pub fn me() -> UserHandle {
    UserHandle::from_raw(0x00dd_ccbb_aa99_8877)
}

/// Scripted full login: prelogin (v1), login with the master key and a
/// plain session id, then user data. Optionally serves a wrapped RSA
/// private key blob.
pub fn full_login(h: &mut Harness, privk_blob: Option<Vec<u8>>) {
    h.client.login("u@x", "p", 1);

    assert!(answer_cs(h, |batch| {
        assert_eq!(batch[0]["a"], "us0");
        json!([{"v": 1}])
    }));

    let pw = SymmCipher::new(mega_client::session::derive_v1_key("p"));
    let mut wrapped_master = MASTER_KEY.to_vec();
    pw.ecb_encrypt(&mut wrapped_master);

    let mut login_resp = json!({
        "k": b64::encode(&wrapped_master),
        "u": me().to_b64(),
        "tsid": b64::encode(&SID),
    });
    if let Some(blob) = privk_blob {
        let mut padded = blob;
        let len = padded.len().div_ceil(16) * 16;
        padded.resize(len, 0);
        master().ecb_encrypt(&mut padded);
        login_resp["privk"] = Value::String(b64::encode(&padded));
    }
    assert!(answer_cs(h, |batch| {
        assert_eq!(batch[0]["a"], "us");
        json!([login_resp])
    }));

    assert!(answer_cs(h, |batch| {
        assert_eq!(batch[0]["a"], "ug");
        json!([{"u": me().to_b64(), "email": "u@x"}])
    }));

    assert_eq!(h.events.lock().unwrap().login, Some(Ok(())));
}

/// Wire form of a file node owned by `me`, key wrapped with the master.
pub fn file_node_json(
    handle: NodeHandle,
    parent: NodeHandle,
    name: &str,
    size: u64,
    mtime: i64,
    key: &FileKey,
) -> Value {
    let full = key.fold();
    let mut wrapped = full.to_vec();
    master().ecb_encrypt(&mut wrapped);

    let fp = FileFingerprint {
        size,
        mtime,
        crc: [1, 2, 3, 4],
    };
    let cipher = SymmCipher::new(key.aes);
    let attrs = mega_core::attrs::name_attrs(name, Some(&fp.to_attr()));
    let blob = mega_core::attrs::encrypt_attrs(&attrs, &cipher);

    json!({
        "h": handle.to_b64(),
        "p": parent.to_b64(),
        "u": me().to_b64(),
        "t": 0,
        "s": size,
        "ts": mtime,
        "k": format!("{}:{}", me().to_b64(), b64::encode(&wrapped)),
        "a": b64::encode(&blob),
    })
}

/// Directly inserts a decrypted file node (for tests that skip the
/// wire ingestion path).
pub fn insert_file(
    client: &mut MegaClient,
    raw: u64,
    parent: NodeHandle,
    name: &str,
    size: u64,
    key: FileKey,
) -> NodeHandle {
    let handle = NodeHandle::from_raw(raw);
    let mut node = Node::new(handle, NodeType::File);
    node.parent = Some(parent);
    node.size = size;
    node.ctime = 1_700_000_000;
    node.key = NodeKey::Decrypted(key.fold().to_vec());
    node.attrs = mega_core::attrs::name_attrs(name, None);
    node.fingerprint = Some(FileFingerprint {
        size,
        mtime: 100,
        crc: [raw as u32, 2, 3, 4],
    });
    client.nodes.insert(node);
    handle
}

pub fn insert_folder(
    client: &mut MegaClient,
    raw: u64,
    parent: Option<NodeHandle>,
    ntype: NodeType,
    name: &str,
) -> NodeHandle {
    let handle = NodeHandle::from_raw(raw);
    let mut node = Node::new(handle, ntype);
    node.parent = parent;
    node.key = NodeKey::Decrypted(vec![raw as u8; 16]);
    node.attrs = mega_core::attrs::name_attrs(name, None);
    client.nodes.insert(node);
    handle
}
