//! Command objects for the CS channel.
//!
//! Each command contributes one JSON object to the next batch and carries
//! a completion describing what to do with its positional response. The
//! command set is a closed enum dispatched once when the batch response
//! parses, instead of a class hierarchy with virtual `procresult`s.

use serde_json::{Value, json};

use mega_core::{ApiError, NodeHandle, PublicHandle, UserHandle};

use crate::sync::SyncId;
use crate::transfers::{Direction, TransferId};

/// What happens when the positional response for a command arrives.
#[derive(Debug)]
pub enum Completion {
    /// Fire-and-forget (telemetry, acknowledgements).
    None,
    Prelogin {
        email: String,
        password: String,
    },
    Login,
    UserData,
    FetchNodes,
    PutNodes(PutNodesCtx),
    /// Temp URL for an upload or download transfer.
    TransferUrl {
        transfer: TransferId,
        direction: Direction,
    },
    /// Temp URL for a streaming direct read.
    DirectReadUrl {
        handle: NodeHandle,
        public: bool,
    },
    NodeKeyUpdate,
    SetAttr {
        node: NodeHandle,
    },
    MoveNode {
        node: NodeHandle,
        target: NodeHandle,
    },
    DeleteNode {
        node: NodeHandle,
    },
    Export {
        node: NodeHandle,
        remove: bool,
    },
    PubKey {
        user: UserHandle,
    },
    GetUserAttr {
        user: UserHandle,
        attr: String,
    },
    PutUserAttr {
        attr: String,
    },
    FaUploadUrl {
        fa_id: u64,
    },
    FaFetch {
        fa_handle: String,
    },
    BackupPut {
        sync: SyncId,
    },
    Logout,
}

/// Context a PutNodes completion needs to bind fresh handles.
#[derive(Debug)]
pub struct PutNodesCtx {
    pub target: NodeHandle,
    pub source: PutNodesSource,
}

#[derive(Debug)]
pub enum PutNodesSource {
    /// App-level folder creation or node copy.
    App,
    /// Upload finalization; maps the upload token to the new node.
    Upload { transfer: TransferId },
    /// Sync-created folder; the completion pairs the local node.
    SyncFolder { sync: SyncId, local_path: std::path::PathBuf },
    /// SyncDebris day-folder creation.
    Debris,
}

#[derive(Debug)]
pub struct Command {
    pub json: Value,
    /// Application correlation id; 0 for engine-internal commands.
    pub tag: u32,
    /// Whether the response may be part of a bulk tree fetch and must be
    /// replayed against the cache rather than the live model.
    pub batchable_with_fetchnodes: bool,
    pub completion: Completion,
}

impl Command {
    pub fn new(json: Value, completion: Completion) -> Command {
        Command {
            json,
            tag: 0,
            batchable_with_fetchnodes: false,
            completion,
        }
    }

    pub fn with_tag(mut self, tag: u32) -> Command {
        self.tag = tag;
        self
    }

    pub fn prelogin(email: &str, password: &str) -> Command {
        Command::new(
            json!({"a": "us0", "user": email}),
            Completion::Prelogin {
                email: email.to_string(),
                password: password.to_string(),
            },
        )
    }

    pub fn login(email: &str, user_hash: &str, sek: &str) -> Command {
        Command::new(
            json!({"a": "us", "user": email, "uh": user_hash, "sek": sek}),
            Completion::Login,
        )
    }

    pub fn login_v2(email: &str, auth_key_b64: &str, sek: &str) -> Command {
        Command::new(
            json!({"a": "us", "user": email, "uh": auth_key_b64, "sek": sek}),
            Completion::Login,
        )
    }

    pub fn user_data() -> Command {
        Command::new(json!({"a": "ug"}), Completion::UserData)
    }

    pub fn fetch_nodes(cached: bool) -> Command {
        let mut cmd = Command::new(json!({"a": "f", "c": 1, "r": 1}), Completion::FetchNodes);
        cmd.batchable_with_fetchnodes = true;
        let _ = cached; // the cached variant differs only in engine state
        cmd
    }

    pub fn put_nodes(target: NodeHandle, nodes: Value, ctx: PutNodesSource) -> Command {
        Command::new(
            json!({"a": "p", "t": target.to_b64(), "n": nodes}),
            Completion::PutNodes(PutNodesCtx {
                target,
                source: ctx,
            }),
        )
    }

    pub fn get_file_url(transfer: TransferId, node: NodeHandle) -> Command {
        Command::new(
            json!({"a": "g", "g": 1, "v": 2, "n": node.to_b64()}),
            Completion::TransferUrl {
                transfer,
                direction: Direction::Get,
            },
        )
    }

    pub fn put_file_url(transfer: TransferId, size: u64) -> Command {
        Command::new(
            json!({"a": "u", "s": size, "ms": 0}),
            Completion::TransferUrl {
                transfer,
                direction: Direction::Put,
            },
        )
    }

    pub fn direct_read_url(handle: NodeHandle, public: bool) -> Command {
        let json = if public {
            json!({"a": "g", "g": 1, "v": 2, "p": PublicHandle::from_raw(handle.as_raw()).to_b64()})
        } else {
            json!({"a": "g", "g": 1, "v": 2, "n": handle.to_b64()})
        };
        Command::new(json, Completion::DirectReadUrl { handle, public })
    }

    /// Replaces RSA-wrapped or foreign node keys with symmetric wraps:
    /// `nk` is a flat [handle, key, handle, key, …] array.
    pub fn node_key_update(rewrites: &[(NodeHandle, String)]) -> Command {
        let mut nk = Vec::with_capacity(rewrites.len() * 2);
        for (h, key) in rewrites {
            nk.push(Value::String(h.to_b64()));
            nk.push(Value::String(key.clone()));
        }
        Command::new(json!({"a": "k", "nk": nk}), Completion::NodeKeyUpdate)
    }

    /// Distributes a share key to share peers (crypto-request response).
    pub fn share_key_response(entries: Value) -> Command {
        Command::new(json!({"a": "k", "cr": entries}), Completion::None)
    }

    pub fn set_attr(node: NodeHandle, attr_b64: &str) -> Command {
        Command::new(
            json!({"a": "a", "n": node.to_b64(), "at": attr_b64}),
            Completion::SetAttr { node },
        )
    }

    pub fn move_node(node: NodeHandle, target: NodeHandle) -> Command {
        Command::new(
            json!({"a": "m", "n": node.to_b64(), "t": target.to_b64()}),
            Completion::MoveNode { node, target },
        )
    }

    pub fn delete_node(node: NodeHandle) -> Command {
        Command::new(
            json!({"a": "d", "n": node.to_b64()}),
            Completion::DeleteNode { node },
        )
    }

    pub fn export(node: NodeHandle, remove: bool) -> Command {
        let json = if remove {
            json!({"a": "l", "n": node.to_b64(), "d": 1})
        } else {
            json!({"a": "l", "n": node.to_b64()})
        };
        Command::new(json, Completion::Export { node, remove })
    }

    pub fn pubkey_request(user: UserHandle) -> Command {
        Command::new(
            json!({"a": "uk", "u": user.to_b64()}),
            Completion::PubKey { user },
        )
    }

    pub fn get_user_attr(user: UserHandle, attr: &str) -> Command {
        Command::new(
            json!({"a": "uga", "u": user.to_b64(), "ua": attr, "v": 1}),
            Completion::GetUserAttr {
                user,
                attr: attr.to_string(),
            },
        )
    }

    pub fn put_user_attr(attr: &str, value_b64: &str, version: Option<&str>) -> Command {
        let json = match version {
            Some(v) => json!({"a": "upv", attr: [value_b64, v]}),
            None => json!({"a": "up", attr: value_b64}),
        };
        Command::new(
            json,
            Completion::PutUserAttr {
                attr: attr.to_string(),
            },
        )
    }

    pub fn fa_upload_url(fa_id: u64, size: usize) -> Command {
        Command::new(
            json!({"a": "ufa", "s": size}),
            Completion::FaUploadUrl { fa_id },
        )
    }

    pub fn fa_fetch_url(fa_handle: &str) -> Command {
        Command::new(
            json!({"a": "ufa", "fah": fa_handle, "r": 1}),
            Completion::FaFetch {
                fa_handle: fa_handle.to_string(),
            },
        )
    }

    /// Attaches an uploaded file attribute to a node.
    pub fn attach_fa(node: NodeHandle, fa: &str) -> Command {
        Command::new(
            json!({"a": "pfa", "n": node.to_b64(), "fa": fa}),
            Completion::None,
        )
    }

    /// Registers or updates a sync with the backup monitor.
    pub fn backup_put(sync: SyncId, remote: NodeHandle, local_path: &str, backup: bool) -> Command {
        Command::new(
            json!({
                "a": "sp",
                "h": remote.to_b64(),
                "l": local_path,
                "t": if backup { 5 } else { 9 },
                "s": 1,
            }),
            Completion::BackupPut { sync },
        )
    }

    pub fn telemetry_event(event: u32, message: &str) -> Command {
        Command::new(
            json!({"a": "log", "e": event, "m": message}),
            Completion::None,
        )
    }

    pub fn user_alert_ack(ts: i64) -> Command {
        Command::new(json!({"a": "sla", "t": ts}), Completion::None)
    }

    pub fn logout() -> Command {
        Command::new(json!({"a": "sml"}), Completion::Logout)
    }
}

/// Positional result for one command: either its JSON element or a
/// numeric API error.
pub type CmdResult = Result<Value, ApiError>;

/// Splits a response element into ok/error: numbers are errors, zero
/// means plain success.
pub fn element_result(element: Value) -> CmdResult {
    match element {
        Value::Number(num) => {
            let code = num.as_i64().unwrap_or(i64::from(ApiError::Internal.code()));
            if code < 0 {
                Err(ApiError::from_code(code as i32))
            } else {
                Ok(Value::Number(num))
            }
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_json_shapes() {
        let cmd = Command::fetch_nodes(false);
        assert_eq!(cmd.json["a"], "f");
        assert!(cmd.batchable_with_fetchnodes);

        let node = NodeHandle::from_raw(5);
        let cmd = Command::move_node(node, NodeHandle::from_raw(6));
        assert_eq!(cmd.json["a"], "m");
        assert_eq!(cmd.json["n"], node.to_b64());
    }

    #[test]
    fn test_node_key_update_is_flat_pairs() {
        let rewrites = vec![
            (NodeHandle::from_raw(1), "k1".to_string()),
            (NodeHandle::from_raw(2), "k2".to_string()),
        ];
        let cmd = Command::node_key_update(&rewrites);
        let nk = cmd.json["nk"].as_array().unwrap();
        assert_eq!(nk.len(), 4);
        assert_eq!(nk[1], "k1");
        assert_eq!(nk[3], "k2");
    }

    #[test]
    fn test_element_result() {
        assert!(matches!(
            element_result(serde_json::json!(-9)),
            Err(ApiError::NotFound)
        ));
        assert!(element_result(serde_json::json!(0)).is_ok());
        assert!(element_result(serde_json::json!({"f": []})).is_ok());
    }
}
