//! The SC (server-client) channel: a long-poll stream of causally
//! ordered action packets mutating the remote tree and the user, share,
//! PCR and chat tables.
//!
//! The reader is a small state machine: idle, request in flight, or
//! parsing a received batch. Parsing can yield mid-batch: after a packet
//! that touches a synced subtree the engine runs `syncdown` before the
//! next packet, resuming at the same position on the following tick.

use serde_json::{Map, Value};

use mega_core::caps::ReqStatus;
use mega_core::{
    ApiError, BackoffTimer, Ds, HttpReq, NodeHandle, PcrHandle, PublicHandle, UserHandle, b64,
};

use crate::client::MegaClient;
use crate::commands::Command;
use crate::consts::SC_REQUEST_TIMEOUT_DS;
use crate::keys::NewShare;
use crate::nodes::{Access, Node, NodeKey, NodeType, PublicLinkState};
use crate::users::{ChatRoom, PendingContactRequest, UserAttr, Visibility};

pub struct ScBatch {
    packets: Vec<Value>,
    idx: usize,
    sn: Option<String>,
    /// Incomplete range: more batches follow before the state is current.
    ir: bool,
}

pub enum ScState {
    Idle,
    Inflight(HttpReq),
    Parsing(ScBatch),
}

pub struct ScChannel {
    pub state: ScState,
    pub bt: BackoffTimer,
    /// One-shot replacement URL supplied by the server.
    pub scnotify_url: Option<String>,
    /// Set when the parser must hand control to syncdown before the next
    /// packet.
    pub yield_to_sync: bool,
}

impl ScChannel {
    pub fn new() -> ScChannel {
        let mut bt = BackoffTimer::new();
        bt.arm(0);
        ScChannel {
            state: ScState::Idle,
            bt,
            scnotify_url: None,
            yield_to_sync: false,
        }
    }
}

impl MegaClient {
    /// One SC tick.
    pub(crate) fn exec_sc(&mut self) {
        let now = self.now_ds();
        match &self.sc.state {
            ScState::Idle => {
                if self.scsn.ready() && self.sc.bt.armed(now) && !self.blocked {
                    self.post_sc_request();
                }
            }
            ScState::Inflight(req) => {
                let req = req.clone();
                self.poll_sc_request(now, req);
            }
            ScState::Parsing(_) => self.continue_sc_parsing(),
        }
    }

    fn post_sc_request(&mut self) {
        let url = match self.sc.scnotify_url.take() {
            Some(url) => url,
            None => format!(
                "{}wsc?sn={}{}",
                self.api_url,
                self.scsn.as_str().unwrap_or_default(),
                self.auth_suffix(),
            ),
        };
        let req = HttpReq::post(url, Vec::new());
        if let Err(err) = self.http.post(&req) {
            tracing::warn!("SC post failed to start: {err}");
            req.fail();
        }
        self.sc.state = ScState::Inflight(req);
    }

    fn poll_sc_request(&mut self, now: Ds, req: HttpReq) {
        match req.status() {
            ReqStatus::Prepared | ReqStatus::Inflight => {
                let idle = req.idle_time().unwrap_or_default();
                if idle.as_millis() as u64 > u64::from(SC_REQUEST_TIMEOUT_DS) * 100 {
                    // Abandon and re-arm; the cursor survives untouched.
                    tracing::debug!("SC request timed out, re-arming");
                    self.http.cancel(&req);
                    self.sc.state = ScState::Idle;
                    self.sc.bt.arm(now);
                }
            }
            ReqStatus::Failure => {
                self.sc.state = ScState::Idle;
                self.sc.bt.backoff(now, &mut self.rng);
            }
            ReqStatus::Success => {
                let body = req.take_response();
                self.sc.state = ScState::Idle;
                self.handle_sc_body(now, req.http_status(), body);
            }
        }
    }

    fn handle_sc_body(&mut self, now: Ds, status: u16, body: Vec<u8>) {
        if status != 200 {
            self.sc.bt.backoff(now, &mut self.rng);
            return;
        }
        let trimmed = body.trim_ascii();
        if trimmed == b"0" {
            // Keep-alive: nothing happened server-side; re-poll at once.
            self.sc.bt.reset();
            self.sc.bt.arm(now);
            self.loop_requested = true;
            return;
        }
        match serde_json::from_slice::<Value>(trimmed) {
            Ok(Value::Object(obj)) => {
                if let Some(url) = obj.get("w").and_then(Value::as_str)
                    && !obj.contains_key("a")
                {
                    // Wait endpoint: poll it once, then return to wsc.
                    self.sc.scnotify_url = Some(url.to_string());
                    self.sc.bt.reset();
                    self.sc.bt.arm(now);
                    self.loop_requested = true;
                    return;
                }
                let batch = ScBatch {
                    packets: obj
                        .get("a")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default(),
                    idx: 0,
                    sn: obj.get("sn").and_then(Value::as_str).map(str::to_string),
                    ir: obj.get("ir").and_then(Value::as_i64) == Some(1),
                };
                self.sc.state = ScState::Parsing(batch);
                self.loop_requested = true;
            }
            Ok(Value::Number(num)) => {
                let err = ApiError::from_code(num.as_i64().unwrap_or(-1) as i32);
                self.handle_sc_error(now, err);
            }
            _ => {
                tracing::warn!("unparseable SC payload");
                self.sc.bt.backoff(now, &mut self.rng);
            }
        }
    }

    fn handle_sc_error(&mut self, now: Ds, err: ApiError) {
        match err {
            ApiError::Sid => self.session_died(err),
            ApiError::Blocked => self.enter_blocked_state(),
            ApiError::TooMany => {
                // More pending updates than the server buffers: the
                // stream has a hole we can never fill. Resync from the
                // cache via a fresh fetchnodes.
                tracing::warn!("SC overload: restarting from fetchnodes");
                self.suspend_all_syncs();
                self.queue_command(Command::fetch_nodes(true));
                self.fetching_nodes = true;
                self.sc.bt.reset();
            }
            _ => self.sc.bt.backoff(now, &mut self.rng),
        }
    }

    /// Applies packets until the batch drains or a sync yield interrupts.
    fn continue_sc_parsing(&mut self) {
        loop {
            if self.sc.yield_to_sync {
                // syncdown runs later this tick; we resume afterwards.
                self.loop_requested = true;
                return;
            }
            let ScState::Parsing(batch) = &mut self.sc.state else {
                return;
            };
            if batch.idx >= batch.packets.len() {
                break;
            }
            let packet = batch.packets[batch.idx].clone();
            batch.idx += 1;
            if let Value::Object(obj) = packet {
                self.apply_packet(&obj);
            }
        }
        self.finish_sc_batch();
    }

    fn finish_sc_batch(&mut self) {
        let ScState::Parsing(batch) = std::mem::replace(&mut self.sc.state, ScState::Idle) else {
            return;
        };
        if let Some(sn) = &batch.sn
            && !self.scsn.set(sn)
        {
            tracing::warn!("server sent malformed scsn {sn:?}");
        }
        let now = self.now_ds();
        self.sc.bt.reset();
        self.sc.bt.arm(now);

        if !batch.ir {
            // End of the complete range: the model is at server state.
            if !self.state_current {
                self.state_current = true;
                self.on_state_current();
            }
            self.request_db_commit();
        }
        self.loop_requested = true;
    }

    /// Applies one action packet. Unknown codes are skipped silently;
    /// packets originating from this session are ignored except during
    /// the bulk fetch, whose effects are not in the model yet.
    pub(crate) fn apply_packet(&mut self, obj: &Map<String, Value>) {
        if !self.fetching_nodes
            && let Some(origin) = obj.get("i").and_then(Value::as_str)
            && origin == self.session.session_id
        {
            return;
        }
        let Some(action) = obj.get("a").and_then(Value::as_str) else {
            return;
        };
        match action {
            "u" => self.sc_update_node(obj),
            "t" => self.sc_new_nodes(obj),
            "d" => self.sc_delete_node(obj),
            "s" | "s2" => self.sc_share(obj),
            "c" => self.sc_contacts(obj),
            "k" => self.sc_keys(obj),
            "fa" => self.sc_fileattr(obj),
            "ua" => self.sc_user_attrs(obj),
            "psts" | "pses" => self.sc_payment(obj),
            "ipc" | "opc" => self.sc_pcr_new(obj, action == "opc"),
            "upci" | "upco" => self.sc_pcr_update(obj, action == "upco"),
            "ph" => self.sc_public_link(obj),
            "se" => self.sc_set_email(obj),
            "mcc" | "mcpc" => self.sc_chat_upsert(obj),
            "mcfc" | "mcfpc" => self.sc_chat_flags(obj),
            "mcna" | "mcpna" => self.sc_chat_node_access(obj),
            "uac" => self.sc_account_confirmed(obj),
            "la" => self.sc_alerts_acknowledged(),
            "ub" => self.sc_business_status(obj),
            other => {
                tracing::trace!("skipping unknown packet {other:?}");
            }
        }
    }

    fn node_of(obj: &Map<String, Value>, field: &str) -> Option<NodeHandle> {
        obj.get(field)
            .and_then(Value::as_str)
            .and_then(|s| NodeHandle::from_b64(s).ok())
    }

    fn user_of(obj: &Map<String, Value>, field: &str) -> Option<UserHandle> {
        obj.get(field)
            .and_then(Value::as_str)
            .and_then(|s| UserHandle::from_b64(s).ok())
    }

    // -- packet handlers --

    /// `u`: metadata update on one node (attrs, owner, ctime).
    fn sc_update_node(&mut self, obj: &Map<String, Value>) {
        let Some(h) = Self::node_of(obj, "n") else {
            return;
        };
        if !self.nodes.contains(h) {
            return;
        }
        if let Some(at) = obj.get("at").and_then(Value::as_str)
            && let Ok(blob) = b64::decode(at)
        {
            let node = self.nodes.get_mut(h).expect("checked above");
            node.attr_blob = Some(blob);
            node.changed.attrs = true;
            self.apply_node_attrs(h);
        }
        if let Some(owner) = Self::user_of(obj, "u") {
            let node = self.nodes.get_mut(h).expect("checked above");
            if node.owner != owner {
                node.owner = owner;
                node.changed.owner = true;
            }
        }
        if let Some(ts) = obj.get("ts").and_then(Value::as_i64) {
            let node = self.nodes.get_mut(h).expect("checked above");
            if node.ctime != ts {
                node.ctime = ts;
                node.changed.ctime = true;
            }
        }
        self.nodes.notify(h);
        self.yield_for_sync_if_relevant(h);
    }

    /// `t`: a tree fragment of new (or moved) nodes.
    fn sc_new_nodes(&mut self, obj: &Map<String, Value>) {
        let Some(tree) = obj.get("t") else {
            return;
        };
        let read = self.read_nodes(tree);
        self.merge_new_shares();
        for h in read {
            self.yield_for_sync_if_relevant(h);
        }
    }

    /// `d`: subtree deletion.
    fn sc_delete_node(&mut self, obj: &Map<String, Value>) {
        let Some(h) = Self::node_of(obj, "n") else {
            return;
        };
        let relevant = self.sync_covers_node(h);
        self.nodes.purge_subtree(h);
        if relevant {
            self.sc.yield_to_sync = true;
            self.syncdown_required = true;
        }
    }

    /// `s`/`s2`: share addition, modification or revocation.
    fn sc_share(&mut self, obj: &Map<String, Value>) {
        let Some(node) = Self::node_of(obj, "n") else {
            return;
        };
        let owner = Self::user_of(obj, "o");
        let peer = Self::user_of(obj, "u");
        let pcr = obj
            .get("p")
            .and_then(Value::as_str)
            .and_then(|s| PcrHandle::from_b64(s).ok())
            .unwrap_or(PcrHandle::UNDEF);
        let outgoing = owner.is_none() || owner == self.session.me;
        let access = obj
            .get("r")
            .and_then(Value::as_i64)
            .map_or(Access::Unknown, Access::from_code);
        let key = obj
            .get("k")
            .and_then(Value::as_str)
            .and_then(|k| b64::decode(k).ok());
        let auth = obj
            .get("ha")
            .and_then(Value::as_str)
            .and_then(|a| b64::decode_exact::<16>(a).ok());

        self.new_shares.push(NewShare {
            node,
            outgoing,
            peer: peer.unwrap_or(UserHandle::UNDEF),
            pcr,
            access,
            ts: obj.get("ts").and_then(Value::as_i64).unwrap_or(0),
            key,
            auth,
            remove_key: obj.get("okd").and_then(Value::as_i64) == Some(1),
            upgrade_pending: obj.contains_key("ou"),
        });
        self.merge_new_shares();
    }

    /// `c`: contact list changes.
    fn sc_contacts(&mut self, obj: &Map<String, Value>) {
        let Some(entries) = obj.get("u").and_then(Value::as_array) else {
            return;
        };
        for entry in entries {
            let Value::Object(entry) = entry else {
                continue;
            };
            let Some(h) = Self::user_of(entry, "u") else {
                continue;
            };
            let user = self.users.ensure(h);
            if let Some(vis) = entry.get("c").and_then(Value::as_i64) {
                user.visibility = Visibility::from_code(vis);
                user.changed.visibility = true;
            }
            if let Some(ts) = entry.get("ts").and_then(Value::as_i64) {
                user.ctime = ts;
            }
            if let Some(email) = entry.get("m").and_then(Value::as_str).map(str::to_string) {
                self.users.set_email(h, &email);
            }
            self.users.notify_user(h);
        }
    }

    /// `k`: share-key request (`sr`) or distribution (`h`/`k` pair).
    fn sc_keys(&mut self, obj: &Map<String, Value>) {
        if let Some(h) = Self::node_of(obj, "h")
            && let Some(key) = obj.get("k").and_then(Value::as_str)
            && let Ok(wrapped) = b64::decode(key)
        {
            self.new_shares.push(NewShare {
                node: h,
                outgoing: true,
                peer: UserHandle::UNDEF,
                pcr: PcrHandle::UNDEF,
                access: Access::Owner,
                ts: 0,
                key: Some(wrapped),
                auth: None,
                remove_key: false,
                upgrade_pending: false,
            });
            self.merge_new_shares();
        }
        if let Some(sr) = obj.get("sr").and_then(Value::as_array) {
            self.answer_key_request(sr);
        }
    }

    /// Answers a crypto request: peers need share keys re-encrypted to
    /// their public keys. Entries come as (share, user, node…) runs.
    fn answer_key_request(&mut self, sr: &[Value]) {
        let mut response = Vec::new();
        for pair in sr.chunks(2) {
            let [share, _user] = pair else {
                continue;
            };
            let Some(share_h) = share.as_str().and_then(|s| NodeHandle::from_b64(s).ok()) else {
                continue;
            };
            if let Some(node) = self.nodes.get(share_h)
                && node.share_key.is_some()
            {
                response.push(Value::String(share_h.to_b64()));
            }
        }
        if !response.is_empty() {
            tracing::debug!(n = response.len(), "answering share-key request");
            self.queue_command(Command::share_key_response(Value::Array(response)));
        }
    }

    /// `fa`: file attribute string changed.
    fn sc_fileattr(&mut self, obj: &Map<String, Value>) {
        let Some(h) = Self::node_of(obj, "n") else {
            return;
        };
        if let Some(node) = self.nodes.get_mut(h) {
            node.fileattrs = obj.get("fa").and_then(Value::as_str).map(str::to_string);
            node.changed.fileattrs = true;
            self.nodes.notify(h);
        }
    }

    /// `ua`: attribute version bumps. Invalidate, refetch critical ones.
    fn sc_user_attrs(&mut self, obj: &Map<String, Value>) {
        let Some(user_h) = Self::user_of(obj, "u") else {
            return;
        };
        let Some(names) = obj.get("ua").and_then(Value::as_array) else {
            return;
        };
        let mut refetch = Vec::new();
        {
            let user = self.users.ensure(user_h);
            for name in names.iter().filter_map(Value::as_str) {
                user.invalidate_attr(name);
                let attr = UserAttr::from_code(name);
                if attr.is_critical() {
                    refetch.push(name.to_string());
                }
            }
        }
        self.users.notify_user(user_h);
        for name in refetch {
            self.queue_command(Command::get_user_attr(user_h, &name));
        }
    }

    /// `psts`/`pses`: payment events change quota state; refresh.
    fn sc_payment(&mut self, _obj: &Map<String, Value>) {
        self.queue_command(Command::user_data());
    }

    /// `ipc`/`opc`: a pending contact request appeared or changed.
    fn sc_pcr_new(&mut self, obj: &Map<String, Value>, outgoing: bool) {
        let Some(h) = obj
            .get("p")
            .and_then(Value::as_str)
            .and_then(|s| PcrHandle::from_b64(s).ok())
        else {
            return;
        };
        let deleted = obj.contains_key("dts");
        if self.users.pcr(h).is_none() {
            let mut pcr = PendingContactRequest::new(h);
            pcr.changed.new = true;
            self.users.insert_pcr(pcr);
        }
        let pcr = self.users.pcr_mut(h).expect("inserted above");
        pcr.outgoing = outgoing;
        if let Some(email) = obj.get("m").and_then(Value::as_str) {
            pcr.origin_email = email.to_string();
        }
        if let Some(email) = obj.get("e").and_then(Value::as_str) {
            pcr.target_email = email.to_string();
        }
        pcr.ts = obj.get("ts").and_then(Value::as_i64).unwrap_or(pcr.ts);
        pcr.uts = obj.get("uts").and_then(Value::as_i64).unwrap_or(pcr.uts);
        if let Some(msg) = obj.get("msg").and_then(Value::as_str) {
            pcr.message = msg.to_string();
        }
        if obj.contains_key("rts") {
            pcr.changed.reminded = true;
        }
        if deleted {
            pcr.removed = true;
            pcr.changed.deleted = true;
        }
        self.users.notify_pcr(h);
    }

    /// `upci`/`upco`: state transition of a pending contact request.
    fn sc_pcr_update(&mut self, obj: &Map<String, Value>, _outgoing: bool) {
        let Some(h) = obj
            .get("p")
            .and_then(Value::as_str)
            .and_then(|s| PcrHandle::from_b64(s).ok())
        else {
            return;
        };
        let Some(pcr) = self.users.pcr_mut(h) else {
            return;
        };
        match obj.get("s").and_then(Value::as_i64) {
            Some(1) => pcr.changed.ignored = true,
            Some(2) => {
                pcr.changed.accepted = true;
                pcr.removed = true;
            }
            Some(3) => {
                pcr.changed.denied = true;
                pcr.removed = true;
            }
            _ => {}
        }
        self.users.notify_pcr(h);
    }

    /// `ph`: public link created, deleted, taken down or reinstated.
    fn sc_public_link(&mut self, obj: &Map<String, Value>) {
        let Some(h) = Self::node_of(obj, "h") else {
            return;
        };
        let Some(node) = self.nodes.get_mut(h) else {
            return;
        };
        if obj.get("d").and_then(Value::as_i64) == Some(1) {
            node.plink = None;
        } else {
            let ph = obj
                .get("ph")
                .and_then(Value::as_str)
                .and_then(|s| PublicHandle::from_b64(s).ok())
                .unwrap_or(PublicHandle::UNDEF);
            node.plink = Some(PublicLinkState {
                ph,
                cts: obj.get("ts").and_then(Value::as_i64).unwrap_or(0),
                ets: obj.get("ets").and_then(Value::as_i64).unwrap_or(0),
                taken_down: obj.get("down").and_then(Value::as_i64) == Some(1),
            });
        }
        node.changed.public_link = true;
        self.nodes.notify(h);
    }

    /// `se`: email change confirmed.
    fn sc_set_email(&mut self, obj: &Map<String, Value>) {
        if let Some(user) = Self::user_of(obj, "u")
            && let Some(email) = obj.get("e").and_then(Value::as_str)
        {
            self.users.set_email(user, email);
            self.users.notify_user(user);
        }
    }

    fn chat_of(obj: &Map<String, Value>) -> Option<mega_core::ChatHandle> {
        obj.get("id")
            .and_then(Value::as_str)
            .and_then(|s| mega_core::ChatHandle::from_b64(s).ok())
    }

    /// `mcc`/`mcpc`: chat created or participants changed.
    fn sc_chat_upsert(&mut self, obj: &Map<String, Value>) {
        let Some(id) = Self::chat_of(obj) else {
            return;
        };
        let chat = self
            .users
            .chats
            .entry(id)
            .or_insert_with(|| ChatRoom::new(id));
        if let Some(g) = obj.get("g").and_then(Value::as_i64) {
            chat.group = g == 1;
        }
        if let Some(shard) = obj.get("cs").and_then(Value::as_i64) {
            chat.shard = shard;
        }
        if let Some(flags) = obj.get("f").and_then(Value::as_i64) {
            chat.flags = flags;
        }
        if let Some(peers) = obj.get("u").and_then(Value::as_array) {
            chat.peers.clear();
            for peer in peers {
                if let Value::Object(peer) = peer
                    && let Some(u) = Self::user_of(peer, "u")
                {
                    let priv_level = peer.get("p").and_then(Value::as_i64).unwrap_or(0);
                    chat.peers.insert(u, priv_level);
                }
            }
        }
    }

    /// `mcfc`/`mcfpc`: chat flag updates.
    fn sc_chat_flags(&mut self, obj: &Map<String, Value>) {
        if let Some(id) = Self::chat_of(obj)
            && let Some(chat) = self.users.chats.get_mut(&id)
            && let Some(flags) = obj.get("f").and_then(Value::as_i64)
        {
            chat.flags = flags;
        }
    }

    /// `mcna`/`mcpna`: a node was granted or revoked for chat access.
    fn sc_chat_node_access(&mut self, obj: &Map<String, Value>) {
        let Some(id) = Self::chat_of(obj) else {
            return;
        };
        let (Some(node), Some(user)) = (Self::node_of(obj, "n"), Self::user_of(obj, "u")) else {
            return;
        };
        let Some(chat) = self.users.chats.get_mut(&id) else {
            return;
        };
        if obj.get("r").and_then(Value::as_i64) == Some(1) {
            if let Some(set) = chat.node_access.get_mut(&node) {
                set.remove(&user);
            }
        } else {
            chat.node_access.entry(node).or_default().insert(user);
        }
    }

    /// `uac`: account confirmation completed.
    fn sc_account_confirmed(&mut self, obj: &Map<String, Value>) {
        if let (Some(me), Some(email)) = (
            self.session.me,
            obj.get("m").and_then(Value::as_str).map(str::to_string),
        ) {
            self.users.set_email(me, &email);
            self.users.notify_user(me);
        }
    }

    /// `la`: another session acknowledged the user alerts.
    fn sc_alerts_acknowledged(&mut self) {
        for alert in &mut self.user_alerts {
            alert.seen = true;
        }
    }

    /// `ub`: business account status changed.
    fn sc_business_status(&mut self, obj: &Map<String, Value>) {
        let status = obj.get("s").and_then(Value::as_i64).unwrap_or(0);
        self.business_status = status;
        if let Some(me) = self.session.me {
            let user = self.users.ensure(me);
            user.business = status > 0;
            self.users.notify_user(me);
        }
    }

    // -- node ingestion shared with fetchnodes --

    /// Reads a `{"f": […]}` tree fragment into the model; parents may
    /// arrive after children. Returns the handles read, in order.
    pub(crate) fn read_nodes(&mut self, tree: &Value) -> Vec<NodeHandle> {
        let Some(list) = tree.get("f").and_then(Value::as_array) else {
            return Vec::new();
        };
        let mut read = Vec::new();
        for raw in list {
            let Value::Object(raw) = raw else {
                continue;
            };
            if let Some(h) = self.read_one_node(raw) {
                read.push(h);
            }
        }
        for h in &read {
            self.try_decrypt_node_key(*h);
            self.nodes.notify(*h);
        }
        read
    }

    fn read_one_node(&mut self, raw: &Map<String, Value>) -> Option<NodeHandle> {
        let h = Self::node_of(raw, "h")?;
        let ntype = NodeType::from_code(raw.get("t").and_then(Value::as_i64).unwrap_or(-1))?;

        // A handle reappearing in a tree fragment is a move or metadata
        // refresh of the node we already hold; an earlier deletion packet
        // in the same batch was the first half of the move.
        if self.nodes.contains(h) {
            if let Some(node) = self.nodes.get_mut(h) {
                node.changed.removed = false;
            }
            if let Some(parent) = Self::node_of(raw, "p") {
                self.nodes.set_parent(h, Some(parent));
            }
            return Some(h);
        }

        let mut node = Node::new(h, ntype);
        node.changed.new = true;
        node.parent = Self::node_of(raw, "p");
        node.owner = Self::user_of(raw, "u").unwrap_or(UserHandle::UNDEF);
        node.size = raw.get("s").and_then(Value::as_u64).unwrap_or(0);
        node.ctime = raw.get("ts").and_then(Value::as_i64).unwrap_or(0);
        node.fileattrs = raw.get("fa").and_then(Value::as_str).map(str::to_string);
        if let Some(at) = raw.get("a").and_then(Value::as_str) {
            node.attr_blob = b64::decode(at).ok();
        }
        if let Some(k) = raw.get("k").and_then(Value::as_str) {
            node.key = NodeKey::Pending(k.to_string());
        }

        // In-share root: the wrapped share key and sharing user ride along.
        if let Some(sk) = raw.get("sk").and_then(Value::as_str)
            && let Ok(wrapped) = b64::decode(sk)
        {
            let su = Self::user_of(raw, "su").unwrap_or(UserHandle::UNDEF);
            let access = raw
                .get("r")
                .and_then(Value::as_i64)
                .map_or(Access::ReadOnly, Access::from_code);
            self.new_shares.push(NewShare {
                node: h,
                outgoing: false,
                peer: su,
                pcr: PcrHandle::UNDEF,
                access,
                ts: node.ctime,
                key: Some(wrapped),
                auth: None,
                remove_key: false,
                upgrade_pending: false,
            });
        }

        self.nodes.insert(node);
        Some(h)
    }

    // -- sync interplay --

    /// True when the node lies inside (or is the root of) a running sync.
    fn sync_covers_node(&self, h: NodeHandle) -> bool {
        self.syncs
            .iter()
            .any(|s| s.running() && self.nodes.is_ancestor(s.config.remote_root, h))
    }

    fn yield_for_sync_if_relevant(&mut self, h: NodeHandle) {
        if self.sync_covers_node(h) {
            self.sc.yield_to_sync = true;
            self.syncdown_required = true;
        }
    }
}
