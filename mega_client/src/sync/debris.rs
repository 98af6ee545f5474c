//! SyncDebris: deletions the synchronizer performs are quarantined, not
//! destroyed. Remote targets move into a dated folder
//! `//bin/SyncDebris/YYYY-MM-DD`; local targets move into a `.debris`
//! day folder under the sync root. Day folders are created lazily and
//! the existence check is cached for a minute.

use std::path::Path;

use mega_core::NodeHandle;

use crate::client::MegaClient;
use crate::commands::{Command, PutNodesSource};
use crate::nodes::NodeType;

const DEBRIS_FOLDER: &str = "SyncDebris";
const LOCAL_DEBRIS: &str = ".debris";

fn day_name() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

impl MegaClient {
    /// Runs the deferred deletion queues after a reconciliation cycle.
    pub(crate) fn flush_sync_deletes(&mut self) {
        for h in std::mem::take(&mut self.to_debris) {
            self.move_to_sync_debris(h);
        }
        for h in std::mem::take(&mut self.to_unlink) {
            if self.nodes.contains(h) {
                self.queue_command(Command::delete_node(h));
            }
        }
    }

    /// Moves one node into today's remote debris folder, creating the
    /// folder chain on first use.
    pub(crate) fn move_to_sync_debris(&mut self, h: NodeHandle) {
        if !self.nodes.contains(h) {
            return;
        }
        match self.debris_day_folder() {
            Some(day) => {
                self.queue_command(Command::move_node(h, day));
            }
            None => {
                self.debris_waiting.push(h);
                self.create_debris_day_folder();
            }
        }
    }

    /// Resolves `//bin/SyncDebris/<today>` if it already exists.
    fn debris_day_folder(&self) -> Option<NodeHandle> {
        let rubbish = self.nodes.rubbish;
        if rubbish.is_undef() {
            return None;
        }
        let debris = self.nodes.child_by_name(rubbish, DEBRIS_FOLDER)?;
        self.nodes.child_by_name(debris, &day_name())
    }

    /// Creates the missing part of the chain. At most one creation is in
    /// flight, and a successful probe is cached for a minute so steady
    /// deletion streams do not re-walk the tree.
    fn create_debris_day_folder(&mut self) {
        let minute = chrono::Utc::now().timestamp() / 60;
        if self.debris_creating || self.debris_checked_minute == minute {
            return;
        }
        self.debris_creating = true;
        self.debris_checked_minute = minute;

        let Some(master) = self.session.master_key.clone() else {
            self.debris_creating = false;
            return;
        };
        let rubbish = self.nodes.rubbish;
        if rubbish.is_undef() {
            self.debris_creating = false;
            return;
        }
        let debris = self.nodes.child_by_name(rubbish, DEBRIS_FOLDER);
        let (target, names) = match debris {
            Some(debris) => (debris, vec![day_name()]),
            None => (rubbish, vec![DEBRIS_FOLDER.to_string(), day_name()]),
        };

        // Nested folder chain in one PutNodes: each child targets its
        // predecessor by array position.
        let mut nodes = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let mut key = [0u8; 16];
            rand::RngCore::fill_bytes(&mut self.rng, &mut key);
            let cipher = mega_core::crypto::SymmCipher::new(key);
            let attrs = mega_core::attrs::name_attrs(name, None);
            let blob = mega_core::attrs::encrypt_attrs(&attrs, &cipher);
            let mut wrapped = key.to_vec();
            master.ecb_encrypt(&mut wrapped);
            let mut node = serde_json::json!({
                "h": format!("x{i}"),
                "t": 1,
                "a": mega_core::b64::encode(&blob),
                "k": mega_core::b64::encode(&wrapped),
            });
            if i > 0 {
                node["p"] = serde_json::Value::String(format!("x{}", i - 1));
            }
            nodes.push(node);
        }
        tracing::debug!("creating SyncDebris day folder");
        self.queue_command(Command::put_nodes(
            target,
            serde_json::Value::Array(nodes),
            PutNodesSource::Debris,
        ));
    }

    /// PutNodes completion for the debris chain: flush waiting moves.
    pub(crate) fn debris_created(&mut self, result: crate::commands::CmdResult) {
        self.debris_creating = false;
        match result {
            Ok(response) => {
                let read = self.read_nodes(&response);
                // The day folder is the deepest created node.
                let day = read
                    .iter()
                    .rev()
                    .copied()
                    .find(|h| self.nodes.get(*h).is_some_and(|n| n.ntype == NodeType::Folder));
                if let Some(day) = day {
                    for h in std::mem::take(&mut self.debris_waiting) {
                        if self.nodes.contains(h) {
                            self.queue_command(Command::move_node(h, day));
                        }
                    }
                } else {
                    self.debris_waiting.clear();
                }
            }
            Err(err) => {
                tracing::warn!("SyncDebris creation failed: {err}");
                // Fall back to plain deletion so the sync can progress.
                for h in std::mem::take(&mut self.debris_waiting) {
                    self.to_unlink.push(h);
                }
            }
        }
    }

    /// Moves a local file into the sync's `.debris/<today>` folder.
    pub(crate) fn move_to_local_debris(&mut self, idx: usize, path: &Path) {
        let root = self.syncs[idx].config.local_root.clone();
        let day_dir = root.join(LOCAL_DEBRIS).join(day_name());
        if let Err(err) = self.fsaccess.mkdir(&day_dir) {
            tracing::warn!("local debris mkdir failed: {err}");
            return;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let mut target = day_dir.join(&name);
        // Avoid clobbering an earlier debris entry of the same name.
        let mut suffix = 0;
        while self.fsaccess.stat(&target).ok().flatten().is_some() {
            suffix += 1;
            target = day_dir.join(format!("{name}.{suffix}"));
        }
        if let Err(err) = self.fsaccess.rename(path, &target) {
            tracing::warn!("local debris move failed: {err}");
        }
    }
}
