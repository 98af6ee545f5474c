//! The embedder-facing callback surface.
//!
//! The engine calls into this trait at well-defined points: once per tick
//! for coalesced model notifications, and per event for request, transfer
//! and sync outcomes. All methods default to no-ops so embedders override
//! only what they present.

use mega_core::{ApiError, NodeHandle, PcrHandle, SyncError, UserHandle};

use crate::sync::SyncId;
use crate::transfers::TransferId;

/// Storage state reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageState {
    Green,
    Orange,
    Red,
    Paywall,
}

/// Filename anomaly kinds surfaced while materializing remote names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileNameAnomaly {
    /// The local canonical form differs from the remote name.
    NameMismatch,
    /// The remote name is reserved on this platform.
    NameReserved,
}

#[allow(unused_variables)]
pub trait AppHandler: Send {
    // -- session --

    fn login_result(&mut self, result: Result<(), ApiError>) {}

    fn fetchnodes_result(&mut self, result: Result<(), ApiError>) {}

    fn logout_result(&mut self) {}

    /// The server invalidated the session or blocked the account.
    fn session_dead(&mut self, err: ApiError) {}

    // -- model notifications (once per notifypurge) --

    fn nodes_updated(&mut self, nodes: &[NodeHandle]) {}

    fn users_updated(&mut self, users: &[UserHandle]) {}

    fn pcrs_updated(&mut self, pcrs: &[PcrHandle]) {}

    /// All queued cache writes became durable together with the cursor.
    fn notify_dbcommit(&mut self) {}

    /// The cache was found inconsistent; the engine is reloading.
    fn reload_requested(&mut self, reason: &str) {}

    // -- requests --

    fn request_error(&mut self, tag: u32, err: ApiError) {}

    // -- transfers --

    fn transfer_complete(&mut self, id: TransferId, node: NodeHandle) {}

    fn transfer_failed(&mut self, id: TransferId, err: ApiError) {}

    /// Direct-read data. Return false to cancel the remaining stream.
    fn direct_read_data(&mut self, read_id: u64, data: &[u8]) -> bool {
        true
    }

    fn direct_read_failed(&mut self, read_id: u64, err: ApiError) {}

    // -- account state --

    fn storage_state_changed(&mut self, state: StorageState) {}

    /// A tracked contact key changed its fingerprint. The old key stays.
    fn key_modified(&mut self, user: UserHandle) {}

    // -- sync --

    fn sync_state_changed(&mut self, sync: SyncId, err: SyncError) {}

    fn filename_anomaly(&mut self, anomaly: FileNameAnomaly, remote_name: &str) {}
}

/// An embedder that ignores everything; useful for tools and tests.
#[derive(Debug, Default)]
pub struct NullApp;

impl AppHandler for NullApp {}
