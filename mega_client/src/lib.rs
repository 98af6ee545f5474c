//! The client access engine of the encrypted cloud storage service.
//!
//! An application embeds [`client::MegaClient`] to authenticate, mirror
//! the remote tree, transfer encrypted files, manage shares and links,
//! and keep local folders in sync. The engine is a single-threaded
//! cooperative loop: the embedder alternates `exec()` and `wait()`;
//! every capability (HTTP, filesystem, cache database, thumbnailer) is
//! injected as a trait object, so the whole loop runs deterministically
//! under test harnesses.
//!
//! Module map:
//! - `client` — loop ordering, command completion dispatch (C10)
//! - `reqs` — batched CS request dispatcher (C3)
//! - `sc` — action-packet stream processor (C4)
//! - `keys` / `authring` — key engine and contact-key tracking (C5)
//! - `nodes` / `users` — the in-memory model (C6)
//! - `transfers` / `slots` / `raid` / `fileattr` — transfer engine (C7)
//! - `directread` — streaming partial reads (C8)
//! - `sync` — the folder synchronizer (C9)
//! - `session` — login, session tokens, keypair lifecycle
//! - `cache` — crash-consistent persistence

pub mod app;
pub mod authring;
mod cache;
pub mod client;
pub mod commands;
pub mod consts;
pub mod directread;
mod fileattr;
mod keys;
pub mod nodes;
pub mod raid;
mod reqs;
mod sc;
pub mod session;
mod slots;
mod speed;
pub mod sync;
pub mod transfers;
pub mod users;
mod workers;

pub use app::{AppHandler, FileNameAnomaly, NullApp, StorageState};
pub use cache::{KIND_NODE, KIND_PCR, KIND_SCSN, KIND_TRANSFER, KIND_USER};
pub use client::{ClientConfig, MegaClient, UserAlert};
pub use keys::NewShare;
pub use nodes::{Access, Node, NodeStore, NodeType};
pub use sync::{SyncId, SyncMode, SyncState};
pub use transfers::{Direction, TransferId, TransferState};
