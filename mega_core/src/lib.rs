//! Core types and capability traits for the mega-rs client engine.
//!
//! This crate defines everything the engine crates share:
//!
//! ## Protocol types (wire-stable)
//!
//! - 48-bit handles in their base64url wire form (`handle`)
//! - The server-client stream cursor (`scsn::ScSn`)
//! - Content fingerprints (`fingerprint::FileFingerprint`)
//! - Transfer chunk geometry and MAC tables (`chunk`)
//! - Attribute-blob framing (`attrs`) and link codecs (`links`)
//! - The numeric API error space (`error::ApiError`)
//!
//! These appear on the wire or in persistent caches; changes to them are
//! protocol changes.
//!
//! ## Engine plumbing (non-wire)
//!
//! - The decisecond clock and backoff timers (`clock`)
//! - AES/RSA/PBKDF2 primitives in the shapes the protocol uses (`crypto`)
//! - Account keypair material and cross-signatures (`keypair`)
//! - Capability traits for HTTP, filesystem, cache DB and media
//!   (`caps`) — implementations live in their own crates
//!
//! The `testutil` module (behind the `testutil` feature) carries an
//! in-memory filesystem and a scripted HTTP backend so the whole engine
//! can be driven deterministically from tests.

pub mod attrs;
pub mod b64;
pub mod caps;
pub mod chunk;
pub mod clock;
pub mod crypto;
pub mod error;
pub mod fingerprint;
pub mod handle;
pub mod keypair;
pub mod links;
pub mod scsn;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use caps::{DbAccess, DbTable, FileSystemAccess, GfxProc, HttpIo, HttpReq, ReqStatus};
pub use clock::{BackoffTimer, Clock, Ds, NEVER};
pub use error::{ApiError, CodecError, ErrorKind, SyncError};
pub use fingerprint::FileFingerprint;
pub use handle::{
    ChatHandle, NodeHandle, PcrHandle, PublicHandle, ShareHandle, UploadHandle, UserHandle,
};
pub use scsn::ScSn;
