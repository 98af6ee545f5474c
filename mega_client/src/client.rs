//! The client engine: owns every subsystem and runs the cooperative
//! loop. One `exec()` drains all ready work and returns; the caller then
//! blocks in `wait()` until a timer expires or I/O is ready and calls
//! `exec()` again. No engine data is touched from any other thread; the
//! worker pool communicates only through its result queue, drained at
//! the top of each tick.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde_json::Value;

use mega_core::caps::{DbAccess, GfxProc, HttpIo, ReqStatus};
use mega_core::crypto::SymmCipher;
use mega_core::{
    ApiError, Clock, Ds, HttpReq, NEVER, NodeHandle, ScSn, UploadHandle, UserHandle, b64,
};

use crate::app::AppHandler;
use crate::authring::AuthRings;
use crate::cache::Cache;
use crate::commands::{CmdResult, Command, Completion, PutNodesSource};
use crate::consts::DEFAULT_API_URL;
use crate::directread::DirectReads;
use crate::fileattr::FileAttrQueue;
use crate::keys::NewShare;
use crate::nodes::{Access, NodeStore, NodeType};
use crate::reqs::ReqDispatcher;
use crate::sc::ScChannel;
use crate::session::SessionState;
use crate::slots::Slots;
use crate::speed::SpeedMeter;
use crate::sync::Sync;
use crate::transfers::{TransferId, TransferQueues, TransferState};
use crate::users::UserStore;
use crate::workers::WorkerPool;

/// A server-side notification shown to the user (seeded via `sc?c=50`).
#[derive(Debug, Clone)]
pub struct UserAlert {
    pub alert_type: String,
    pub ts: i64,
    pub seen: bool,
}

/// Construction parameters.
pub struct ClientConfig {
    pub api_url: String,
    pub app_key: String,
    pub lang: Option<String>,
    /// Deterministic PRNG seed for tests; None draws from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            api_url: DEFAULT_API_URL.to_string(),
            app_key: String::new(),
            lang: None,
            rng_seed: None,
        }
    }
}

pub struct MegaClient {
    // capabilities
    pub(crate) http: Box<dyn HttpIo>,
    pub(crate) fsaccess: Arc<dyn mega_core::FileSystemAccess>,
    pub(crate) dbaccess: Option<Box<dyn DbAccess>>,
    pub(crate) gfx: Box<dyn GfxProc>,
    pub(crate) app: Box<dyn AppHandler>,

    pub(crate) clock: Clock,
    pub(crate) rng: StdRng,
    pub(crate) api_url: String,
    pub(crate) app_key: String,
    pub(crate) lang: Option<String>,

    // session
    pub(crate) session: SessionState,
    pub(crate) password_key: Option<SymmCipher>,

    // channels
    pub(crate) reqs: ReqDispatcher,
    pub(crate) sc: ScChannel,
    pub scsn: ScSn,
    pub(crate) cached_scsn: Option<String>,
    pub(crate) state_current: bool,
    pub(crate) fetching_nodes: bool,
    pub(crate) pending_db_commit: bool,

    // model
    pub nodes: NodeStore,
    pub users: UserStore,
    pub(crate) new_shares: Vec<NewShare>,
    pub(crate) key_rewrites: Vec<NodeHandle>,
    pub(crate) authrings: AuthRings,

    // transfers
    pub(crate) transfers: TransferQueues,
    pub(crate) slots: Slots,
    pub(crate) speeds: [SpeedMeter; 2],
    pub(crate) faqueue: FileAttrQueue,
    pub(crate) fa_cache: HashMap<String, Vec<u8>>,
    pub(crate) drq: DirectReads,
    pub(crate) bad_hosts: BTreeSet<String>,
    bad_host_report: Option<HttpReq>,

    // sync
    pub(crate) syncs: Vec<Sync>,
    pub(crate) next_sync_id: u64,
    pub(crate) syncdown_required: bool,
    pub(crate) to_debris: Vec<NodeHandle>,
    pub(crate) to_unlink: Vec<NodeHandle>,
    pub(crate) debris_waiting: Vec<NodeHandle>,
    pub(crate) debris_creating: bool,
    pub(crate) debris_checked_minute: i64,

    // persistence and misc
    pub(crate) cache: Option<Cache>,
    pub(crate) workers: WorkerPool,
    pub(crate) user_alerts: Vec<UserAlert>,
    user_alert_req: Option<HttpReq>,
    user_alerts_seeded: bool,
    pub(crate) business_status: i64,
    /// Downloads hold off entirely until this instant (overquota).
    pub(crate) overquota_until: Ds,
    pub(crate) blocked: bool,
    pub(crate) loop_requested: bool,
    next_tag: u32,
    pub(crate) upload_handles: UploadHandle,
}

impl MegaClient {
    pub fn new(
        config: ClientConfig,
        http: Box<dyn HttpIo>,
        fsaccess: Arc<dyn mega_core::FileSystemAccess>,
        dbaccess: Option<Box<dyn DbAccess>>,
        gfx: Box<dyn GfxProc>,
        app: Box<dyn AppHandler>,
    ) -> MegaClient {
        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let reqid_seed = rng.next_u64() & 0xffff_ffff;
        MegaClient {
            http,
            fsaccess,
            dbaccess,
            gfx,
            app,
            clock: Clock::new(),
            rng,
            api_url: config.api_url,
            app_key: config.app_key,
            lang: config.lang,
            session: SessionState::default(),
            password_key: None,
            reqs: ReqDispatcher::new(reqid_seed),
            sc: ScChannel::new(),
            scsn: ScSn::new(),
            cached_scsn: None,
            state_current: false,
            fetching_nodes: false,
            pending_db_commit: false,
            nodes: NodeStore::new(),
            users: UserStore::new(),
            new_shares: Vec::new(),
            key_rewrites: Vec::new(),
            authrings: AuthRings::new(),
            transfers: TransferQueues::new(),
            slots: Slots::new(),
            speeds: [SpeedMeter::new(), SpeedMeter::new()],
            faqueue: FileAttrQueue::new(),
            fa_cache: HashMap::new(),
            drq: DirectReads::new(),
            bad_hosts: BTreeSet::new(),
            bad_host_report: None,
            syncs: Vec::new(),
            next_sync_id: 0,
            syncdown_required: false,
            to_debris: Vec::new(),
            to_unlink: Vec::new(),
            debris_waiting: Vec::new(),
            debris_creating: false,
            debris_checked_minute: 0,
            cache: None,
            workers: WorkerPool::new(2),
            user_alerts: Vec::new(),
            user_alert_req: None,
            user_alerts_seeded: false,
            business_status: 0,
            overquota_until: 0,
            blocked: false,
            loop_requested: false,
            next_tag: 0,
            upload_handles: UploadHandle::default(),
        }
    }

    pub fn now_ds(&self) -> Ds {
        self.clock.now_ds()
    }

    /// Advances the engine clock, for embedders simulating time.
    pub fn advance_clock(&mut self, ds: Ds) {
        self.clock.advance(ds);
    }

    /// Application correlation tags, monotonic per client.
    pub fn next_tag(&mut self) -> u32 {
        self.next_tag += 1;
        self.next_tag
    }

    pub fn logged_in(&self) -> bool {
        self.session.logged_in()
    }

    pub fn state_current(&self) -> bool {
        self.state_current
    }

    // -- the cooperative loop --

    /// Drains all ready work. Subsystems requesting an immediate re-run
    /// set `loop_requested`, which re-enters instead of returning, so a
    /// long CPU step can split itself across iterations.
    pub fn exec(&mut self) {
        loop {
            self.loop_requested = false;

            self.apply_worker_results();
            self.exec_cs();
            self.try_db_commit();
            self.exec_sc();
            self.merge_new_shares();
            self.flush_key_rewrites();
            self.exec_fileattrs();
            self.dispatch_transfers();
            self.exec_transfer_slots();
            self.exec_direct_reads();
            self.exec_syncs();
            self.flush_bad_hosts();
            self.poll_user_alerts();
            self.notify_purge();

            if !self.loop_requested {
                break;
            }
        }
    }

    /// Blocks until the earliest timer or I/O readiness.
    pub fn wait(&mut self) {
        let ds = self.wait_budget();
        if ds == 0 {
            return;
        }
        let capped = ds.min(600); // stay responsive to external queueing
        self.http
            .wait_io(Duration::from_millis(u64::from(capped) * 100));
    }

    /// Minimum deciseconds until something needs the loop again.
    fn wait_budget(&self) -> Ds {
        if self.loop_requested {
            return 0;
        }
        let now = self.now_ds();
        let mut min = NEVER;
        self.reqs.bt.update_min(&mut min);
        self.sc.bt.update_min(&mut min);
        for id in self.transfers.all_ids() {
            if let Some(t) = self.transfers.get(id) {
                t.bt.update_min(&mut min);
            }
        }
        for sync in &self.syncs {
            if sync.running() {
                sync.syncdown_bt.update_min(&mut min);
                // Nagle horizons and queued scans keep the loop ticking.
                min = min.min(now + 10);
            }
        }
        if !self.slots.is_empty() || !self.drq.is_empty() || !self.faqueue.is_empty() {
            min = min.min(now + 5);
        }
        if min == NEVER {
            return 3600;
        }
        min.saturating_sub(now).max(1)
    }

    // -- command completion dispatch --

    pub(crate) fn complete_command(&mut self, cmd: Command, result: CmdResult) {
        let tag = cmd.tag;
        if let Err(err) = &result
            && tag != 0
        {
            self.app.request_error(tag, *err);
        }
        match cmd.completion {
            Completion::None => {
                if let Err(err) = result {
                    tracing::debug!("background command failed: {err}");
                }
            }
            Completion::Prelogin { email, password } => {
                self.on_prelogin(tag, &email, &password, result)
            }
            Completion::Login => self.on_login(tag, result),
            Completion::UserData => self.on_user_data(result),
            Completion::FetchNodes => self.on_fetch_nodes(result),
            Completion::PutNodes(ctx) => match ctx.source {
                PutNodesSource::App => self.on_app_putnodes(result),
                PutNodesSource::Upload { transfer } => self.on_upload_putnodes(transfer, result),
                PutNodesSource::SyncFolder { sync, local_path } => {
                    self.sync_folder_created(sync, &local_path, result)
                }
                PutNodesSource::Debris => self.debris_created(result),
            },
            Completion::TransferUrl { transfer, .. } => self.on_transfer_url(transfer, result),
            Completion::DirectReadUrl { handle, public } => {
                self.dr_url_result(handle, public, result)
            }
            Completion::NodeKeyUpdate => {
                if let Err(err) = result {
                    tracing::warn!("node key rewrite rejected: {err}");
                }
            }
            Completion::SetAttr { node } => {
                if result.is_ok() {
                    self.nodes.notify(node);
                }
            }
            Completion::MoveNode { node, target } => {
                if result.is_ok() && self.nodes.contains(node) {
                    self.nodes.set_parent(node, Some(target));
                    self.nodes.notify(node);
                }
            }
            Completion::DeleteNode { node } => {
                if result.is_ok() {
                    self.nodes.purge_subtree(node);
                }
            }
            Completion::Export { node, remove } => self.on_export(node, remove, result),
            Completion::PubKey { user } => self.on_pubkey(user, result),
            Completion::GetUserAttr { user, attr } => self.on_user_attr(user, &attr, result),
            Completion::PutUserAttr { attr } => {
                if let Err(err) = result {
                    tracing::warn!("attribute {attr} update failed: {err}");
                }
            }
            Completion::FaUploadUrl { fa_id } => self.fa_url_result(fa_id, result),
            Completion::FaFetch { fa_handle } => self.fa_fetch_url_result(fa_handle, result),
            Completion::BackupPut { sync } => self.backup_put_result(sync, result),
            Completion::Logout => {
                self.locallogout();
                self.app.logout_result();
            }
        }
    }

    // -- fetchnodes --

    /// Issues a full (or cache-assisted) tree fetch.
    pub fn fetch_nodes(&mut self, tag: u32) {
        self.fetching_nodes = true;
        self.state_current = false;
        self.queue_command(Command::fetch_nodes(self.cached_scsn.is_some()).with_tag(tag));
    }

    fn on_fetch_nodes(&mut self, result: CmdResult) {
        let response = match result {
            Ok(v) => v,
            Err(err) => {
                self.fetching_nodes = false;
                self.app.fetchnodes_result(Err(err));
                return;
            }
        };

        // Replace the model wholesale: the response is the new truth.
        // Contact-key observations made during the bulk load batch into
        // one authring update at the end instead of one write each.
        self.authrings.begin_bulk();
        self.nodes = NodeStore::new();
        self.read_nodes(&response);

        // Outgoing share keys ride in `ok`, share edges in `s`.
        if let Some(ok_list) = response.get("ok").and_then(Value::as_array) {
            for entry in ok_list {
                let (Some(h), Some(k)) = (
                    entry
                        .get("h")
                        .and_then(Value::as_str)
                        .and_then(|s| NodeHandle::from_b64(s).ok()),
                    entry.get("k").and_then(Value::as_str),
                ) else {
                    continue;
                };
                let auth = entry
                    .get("ha")
                    .and_then(Value::as_str)
                    .and_then(|a| b64::decode_exact::<16>(a).ok());
                if let Ok(wrapped) = b64::decode(k) {
                    self.new_shares.push(NewShare {
                        node: h,
                        outgoing: true,
                        peer: UserHandle::UNDEF,
                        pcr: mega_core::PcrHandle::UNDEF,
                        access: Access::Owner,
                        ts: 0,
                        key: Some(wrapped),
                        auth,
                        remove_key: false,
                        upgrade_pending: false,
                    });
                }
            }
        }
        if let Some(shares) = response.get("s").and_then(Value::as_array) {
            for entry in shares {
                if let Value::Object(obj) = entry {
                    self.sc_share_from_fetch(obj);
                }
            }
        }
        if let Some(users) = response.get("u").and_then(Value::as_array) {
            let mut packet = serde_json::Map::new();
            packet.insert("a".to_string(), Value::String("c".to_string()));
            packet.insert("u".to_string(), Value::Array(users.clone()));
            self.apply_packet(&packet);
        }
        self.merge_new_shares();

        for rt in self.authrings.end_bulk() {
            let value = b64::encode(&self.authrings.ring(rt).serialize());
            self.queue_command(Command::put_user_attr(rt.attr().code(), &value, None));
        }

        if let Some(sn) = response.get("sn").and_then(Value::as_str) {
            self.scsn.set(sn);
        }
        self.fetching_nodes = false;

        // Persist the freshly fetched tree in one transaction.
        for h in self.nodes.handles() {
            self.save_node_to_cache(h);
        }
        for u in self.users.handles() {
            self.save_user_to_cache(u);
        }
        self.request_db_commit();
        self.app.fetchnodes_result(Ok(()));
        let now = self.now_ds();
        self.sc.bt.arm(now);
        self.loop_requested = true;
    }

    /// `s` entries inside the fetchnodes response use the packet shape.
    fn sc_share_from_fetch(&mut self, obj: &serde_json::Map<String, Value>) {
        let mut packet = obj.clone();
        packet.insert("a".to_string(), Value::String("s2".to_string()));
        self.apply_packet(&packet);
    }

    fn on_app_putnodes(&mut self, result: CmdResult) {
        match result {
            Ok(response) => {
                let read = self.read_nodes(&response);
                tracing::debug!(n = read.len(), "nodes created");
            }
            Err(err) => tracing::warn!("putnodes failed: {err}"),
        }
    }

    fn on_upload_putnodes(&mut self, id: TransferId, result: CmdResult) {
        match result {
            Ok(response) => {
                let read = self.read_nodes(&response);
                let node = read.first().copied().unwrap_or(NodeHandle::UNDEF);
                let targets = self
                    .transfers
                    .get(id)
                    .map(|t| t.files.clone())
                    .unwrap_or_default();
                if let Some(t) = self.transfers.get_mut(id) {
                    t.state = TransferState::Completed;
                }
                self.remove_transfer_from_cache(id);
                for target in &targets {
                    if let Some(sync) = target.sync {
                        self.sync_upload_finished(sync, &target.local_path, node);
                    }
                }
                self.app.transfer_complete(id, node);
                self.transfers.remove(id);
            }
            Err(ApiError::OverQuota) => self.transfer_overquota(id, None),
            Err(err) => self.fail_transfer(id, err),
        }
    }

    fn on_transfer_url(&mut self, id: TransferId, result: CmdResult) {
        // Overquota may arrive as an in-band object with a retry-in.
        if let Ok(response) = &result
            && let Some(e) = response.get("e").and_then(Value::as_i64)
            && e < 0
        {
            let err = ApiError::from_code(e as i32);
            if err == ApiError::OverQuota {
                let timeleft = response.get("tl").and_then(Value::as_u64);
                self.transfer_overquota(id, timeleft);
            } else {
                self.transfer_url_result(id, Err(err));
            }
            return;
        }
        self.transfer_url_result(id, result);
    }

    fn on_export(&mut self, node: NodeHandle, remove: bool, result: CmdResult) {
        match result {
            Ok(response) => {
                if remove {
                    if let Some(n) = self.nodes.get_mut(node) {
                        n.plink = None;
                        n.changed.public_link = true;
                        self.nodes.notify(node);
                    }
                    return;
                }
                let ph = response
                    .as_str()
                    .and_then(|s| mega_core::PublicHandle::from_b64(s).ok());
                if let Some(ph) = ph
                    && let Some(n) = self.nodes.get_mut(node)
                {
                    n.plink = Some(crate::nodes::PublicLinkState {
                        ph,
                        cts: chrono::Utc::now().timestamp(),
                        ets: 0,
                        taken_down: false,
                    });
                    n.changed.public_link = true;
                    self.nodes.notify(node);
                }
            }
            Err(err) => tracing::warn!("export failed: {err}"),
        }
    }

    fn on_pubkey(&mut self, user: UserHandle, result: CmdResult) {
        let Ok(response) = result else {
            return;
        };
        let Some(blob) = response
            .get("pubk")
            .and_then(Value::as_str)
            .and_then(|s| b64::decode(s).ok())
        else {
            return;
        };
        // Track the raw material first: a changed key must never be
        // adopted, parseable or not.
        let track = self
            .authrings
            .track(crate::authring::AuthRingType::Rsa, user, &blob, false);
        if track == crate::authring::TrackResult::Mismatch {
            self.on_key_modified(user);
            return;
        }
        self.push_dirty_authrings();
        match mega_core::crypto::RsaKey::from_public_blob(&blob) {
            Ok(key) => {
                let u = self.users.ensure(user);
                u.pubkey = Some(key);
                u.changed.pubkey = true;
                u.pubkey_waiters.clear();
                self.users.notify_user(user);
            }
            Err(err) => tracing::warn!("unparseable public key for {user}: {err:?}"),
        }
    }

    fn on_user_attr(&mut self, user: UserHandle, attr: &str, result: CmdResult) {
        let Ok(response) = result else {
            return;
        };
        let value = response
            .get("av")
            .and_then(Value::as_str)
            .and_then(|s| b64::decode(s).ok())
            .unwrap_or_default();
        let version = response
            .get("v")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let attr_kind = crate::users::UserAttr::from_code(attr);
        // Authrings re-merge rather than overwrite blindly.
        let ring_type = match attr_kind {
            crate::users::UserAttr::AuthRing => Some(crate::authring::AuthRingType::Ed25519),
            crate::users::UserAttr::AuthCu255 => Some(crate::authring::AuthRingType::Cu25519),
            crate::users::UserAttr::AuthRsa => Some(crate::authring::AuthRingType::Rsa),
            _ => None,
        };
        if let Some(rt) = ring_type
            && let Ok(ring) = crate::authring::AuthRing::deserialize(&value)
        {
            *self.authrings.ring_mut(rt) = ring;
        }

        let u = self.users.ensure(user);
        u.set_attr(attr_kind, value, version);
        self.users.notify_user(user);
    }

    /// Pushes changed authrings as single attribute updates; a no-op in
    /// bulk mode, where `end_bulk` flushes once at the end.
    pub(crate) fn push_dirty_authrings(&mut self) {
        if self.authrings.in_bulk() {
            return;
        }
        for rt in self.authrings.take_dirty() {
            let value = b64::encode(&self.authrings.ring(rt).serialize());
            self.queue_command(Command::put_user_attr(rt.attr().code(), &value, None));
        }
    }

    /// "Verify credentials" for a contact: SEEN becomes FINGERPRINT.
    pub fn verify_credentials(&mut self, user: UserHandle) {
        let changed = self
            .authrings
            .ring_mut(crate::authring::AuthRingType::Ed25519)
            .set_verified(user);
        if changed {
            let value = b64::encode(
                &self
                    .authrings
                    .ring(crate::authring::AuthRingType::Ed25519)
                    .serialize(),
            );
            self.queue_command(Command::put_user_attr(
                crate::users::UserAttr::AuthRing.code(),
                &value,
                None,
            ));
        }
    }

    // -- state-current transition --

    /// First complete SC range: the model now matches the server. Late
    /// work held for this moment runs: cached transfers resume and the
    /// user alert list seeds.
    pub(crate) fn on_state_current(&mut self) {
        tracing::info!("state current at scsn {:?}", self.scsn.as_str());
        let now = self.now_ds();
        for id in self.transfers.all_ids() {
            if let Some(t) = self.transfers.get_mut(id)
                && t.state == TransferState::Paused
            {
                t.state = TransferState::Queued;
                t.bt.arm(now);
            }
        }
        if !self.user_alerts_seeded {
            self.user_alerts_seeded = true;
            let url = format!("{}sc?c=50{}", self.api_url, self.auth_suffix());
            let req = HttpReq::post(url, Vec::new());
            if self.http.post(&req).is_ok() {
                self.user_alert_req = Some(req);
            }
        }
        self.loop_requested = true;
    }

    fn poll_user_alerts(&mut self) {
        let Some(req) = self.user_alert_req.clone() else {
            return;
        };
        match req.status() {
            ReqStatus::Success => {
                self.user_alert_req = None;
                let body = req.take_response();
                if let Ok(Value::Object(obj)) = serde_json::from_slice::<Value>(&body)
                    && let Some(alerts) = obj.get("c").and_then(Value::as_array)
                {
                    for alert in alerts {
                        self.user_alerts.push(UserAlert {
                            alert_type: alert
                                .get("t")
                                .and_then(Value::as_str)
                                .unwrap_or("?")
                                .to_string(),
                            ts: alert.get("ts").and_then(Value::as_i64).unwrap_or(0),
                            seen: false,
                        });
                    }
                    tracing::debug!(n = self.user_alerts.len(), "user alerts seeded");
                }
            }
            ReqStatus::Failure => {
                self.user_alert_req = None;
            }
            _ => {}
        }
    }

    /// Acknowledges all alerts (emits `la` to other sessions).
    pub fn acknowledge_user_alerts(&mut self) {
        let latest = self.user_alerts.iter().map(|a| a.ts).max().unwrap_or(0);
        for alert in &mut self.user_alerts {
            alert.seen = true;
        }
        self.queue_command(Command::user_alert_ack(latest));
    }

    // -- bad host reporting --

    fn flush_bad_hosts(&mut self) {
        if let Some(req) = self.bad_host_report.clone() {
            match req.status() {
                ReqStatus::Success => {
                    self.bad_host_report = None;
                    self.bad_hosts.clear();
                }
                ReqStatus::Failure => {
                    self.bad_host_report = None;
                }
                _ => {}
            }
            return;
        }
        if self.bad_hosts.is_empty() {
            return;
        }
        let body = self
            .bad_hosts
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(",");
        let url = format!("{}pf?h", self.api_url);
        let req = HttpReq::post(url, body.into_bytes());
        if self.http.post(&req).is_ok() {
            self.bad_host_report = Some(req);
        }
    }

    // -- notifications --

    /// Emits the coalesced model notifications once per tick, persisting
    /// each notified entity to the cache first so the embedder view and
    /// the cache never diverge.
    fn notify_purge(&mut self) {
        if self.nodes.has_pending_notifications() {
            let drained = self.nodes.drain_notifications();
            let mut visible = Vec::new();
            for (h, changes) in &drained {
                if changes.removed {
                    self.del_node_from_cache(*h);
                } else {
                    self.save_node_to_cache(*h);
                }
                visible.push(*h);
            }
            if !visible.is_empty() {
                self.app.nodes_updated(&visible);
            }
        }

        let users = self.users.take_user_notifications();
        if !users.is_empty() {
            for u in &users {
                self.save_user_to_cache(*u);
            }
            self.app.users_updated(&users);
        }

        let pcrs = self.users.take_pcr_notifications();
        if !pcrs.is_empty() {
            for p in &pcrs {
                self.save_pcr_to_cache(*p);
            }
            self.app.pcrs_updated(&pcrs);
        }
    }

    // -- app-facing node operations --

    pub fn create_folder(&mut self, parent: NodeHandle, name: &str, tag: u32) -> Result<(), ApiError> {
        let Some(master) = self.session.master_key.clone() else {
            return Err(ApiError::Access);
        };
        if !self.nodes.contains(parent) {
            return Err(ApiError::NotFound);
        }
        let mut key = [0u8; 16];
        self.rng.fill_bytes(&mut key);
        let cipher = SymmCipher::new(key);
        let attrs = mega_core::attrs::name_attrs(name, None);
        let blob = mega_core::attrs::encrypt_attrs(&attrs, &cipher);
        let mut wrapped = key.to_vec();
        master.ecb_encrypt(&mut wrapped);
        let node = serde_json::json!([{
            "h": "xxxxxxxx",
            "t": 1,
            "a": b64::encode(&blob),
            "k": b64::encode(&wrapped),
        }]);
        self.queue_command(Command::put_nodes(parent, node, PutNodesSource::App).with_tag(tag));
        Ok(())
    }

    pub fn rename_node(&mut self, h: NodeHandle, name: &str, tag: u32) -> Result<(), ApiError> {
        let node = self.nodes.get(h).ok_or(ApiError::NotFound)?;
        let cipher = node.cipher().ok_or(ApiError::Key)?;
        let mut attrs = node.attrs.clone();
        attrs.insert("n".to_string(), Value::String(name.to_string()));
        let blob = mega_core::attrs::encrypt_attrs(&attrs, &cipher);
        let node = self.nodes.get_mut(h).expect("checked above");
        node.attrs = attrs;
        node.changed.attrs = true;
        self.queue_command(Command::set_attr(h, &b64::encode(&blob)).with_tag(tag));
        self.nodes.notify(h);
        Ok(())
    }

    pub fn move_node_to(
        &mut self,
        h: NodeHandle,
        target: NodeHandle,
        tag: u32,
    ) -> Result<(), ApiError> {
        if !self.nodes.contains(h) || !self.nodes.contains(target) {
            return Err(ApiError::NotFound);
        }
        // Moving a node under its own subtree would orphan the tree.
        if self.nodes.is_ancestor(h, target) {
            return Err(ApiError::Circular);
        }
        if self.access_level(target) < Access::ReadWrite {
            return Err(ApiError::Access);
        }
        self.queue_command(Command::move_node(h, target).with_tag(tag));
        Ok(())
    }

    pub fn delete_node(&mut self, h: NodeHandle, tag: u32) -> Result<(), ApiError> {
        if !self.nodes.contains(h) {
            return Err(ApiError::NotFound);
        }
        if self.access_level(h) < Access::Full {
            return Err(ApiError::Access);
        }
        self.queue_command(Command::delete_node(h).with_tag(tag));
        Ok(())
    }

    pub fn export_node(&mut self, h: NodeHandle, remove: bool, tag: u32) -> Result<(), ApiError> {
        if !self.nodes.contains(h) {
            return Err(ApiError::NotFound);
        }
        if self.access_level(h) != Access::Owner {
            return Err(ApiError::Access);
        }
        self.queue_command(Command::export(h, remove).with_tag(tag));
        Ok(())
    }

    /// Public link for an exported file node, once the `ph` packet or
    /// export completion recorded it.
    pub fn public_link(&self, h: NodeHandle) -> Option<mega_core::links::PublicLink> {
        let node = self.nodes.get(h)?;
        let plink = node.plink?;
        let key = node.key.decrypted()?;
        Some(if node.ntype == NodeType::File {
            mega_core::links::PublicLink::new_file(plink.ph, key.try_into().ok()?)
        } else {
            let share = node.share_key?;
            mega_core::links::PublicLink::new_folder(plink.ph, share)
        })
    }

    pub fn request_pubkey(&mut self, user: UserHandle, tag: u32) {
        if let Some(u) = self.users.get(user)
            && u.pubkey.is_some()
        {
            return;
        }
        self.users.ensure(user).pubkey_waiters.push(tag);
        self.queue_command(Command::pubkey_request(user).with_tag(tag));
    }

    // -- teardown --

    /// Local logout: drop all queued work, close the channels, commit
    /// nothing further, clear the keychain.
    pub fn locallogout(&mut self) {
        tracing::info!("local logout");
        self.workers.shutdown();
        self.workers = WorkerPool::new(2);

        for slot_id in self.slots.ids() {
            self.release_slot(slot_id);
        }
        for id in self.transfers.all_ids() {
            self.transfers.remove(id);
        }
        self.faqueue = FileAttrQueue::new();
        self.drq = DirectReads::new();
        self.syncs.clear();
        self.to_debris.clear();
        self.to_unlink.clear();
        self.debris_waiting.clear();

        if let Some(cache) = &mut self.cache {
            cache.table.abort();
        }
        self.cache = None;

        self.nodes = NodeStore::new();
        self.users = UserStore::new();
        self.new_shares.clear();
        self.key_rewrites.clear();
        self.authrings = AuthRings::new();
        self.user_alerts.clear();
        self.user_alert_req = None;
        self.user_alerts_seeded = false;

        self.session = SessionState::default();
        self.password_key = None;
        self.scsn.clear();
        self.cached_scsn = None;
        self.state_current = false;
        self.fetching_nodes = false;
        self.pending_db_commit = false;
        self.blocked = false;
        self.sc = ScChannel::new();
        let reqid_seed = self.rng.next_u64() & 0xffff_ffff;
        self.reqs = ReqDispatcher::new(reqid_seed);
    }
}

impl Drop for MegaClient {
    fn drop(&mut self) {
        self.workers.shutdown();
    }
}
