//! Opaque 48-bit identifiers used on the wire.
//!
//! Handles are stored as 64-bit values with a sentinel for "undefined" and
//! travel base64url-encoded (6 bytes, little-endian, 8 characters). The
//! server mints all of them except [`UploadHandle`], which is client-side
//! and monotonic.

use std::fmt;

use crate::b64;
use crate::error::CodecError;

/// The sentinel value for an unset handle.
pub const UNDEF: u64 = u64::MAX;

/// Number of raw bytes a handle occupies on the wire.
pub const HANDLE_SIZE: usize = 6;

/// Number of raw bytes a user handle occupies on the wire.
pub const USER_HANDLE_SIZE: usize = 8;

macro_rules! handle_type {
    ($(#[$doc:meta])* $name:ident, $size:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// The undefined sentinel.
            pub const UNDEF: $name = $name(UNDEF);

            /// Wire size in bytes.
            pub const SIZE: usize = $size;

            pub const fn from_raw(raw: u64) -> Self {
                $name(raw)
            }

            pub const fn as_raw(&self) -> u64 {
                self.0
            }

            pub const fn is_undef(&self) -> bool {
                self.0 == UNDEF
            }

            pub const fn is_set(&self) -> bool {
                self.0 != UNDEF
            }

            /// Decodes the base64url wire form.
            pub fn from_b64(s: &str) -> Result<Self, CodecError> {
                let bytes = b64::decode(s)?;
                if bytes.len() > 8 {
                    return Err(CodecError::BadHandle(s.to_string()));
                }
                let mut raw = [0u8; 8];
                raw[..bytes.len()].copy_from_slice(&bytes);
                Ok($name(u64::from_le_bytes(raw)))
            }

            /// Encodes the low `SIZE` bytes, little-endian, base64url.
            pub fn to_b64(&self) -> String {
                b64::encode(&self.0.to_le_bytes()[..Self::SIZE])
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::UNDEF
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_undef() {
                    write!(f, concat!(stringify!($name), "(undef)"))
                } else {
                    write!(f, concat!(stringify!($name), "({})"), self.to_b64())
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_b64())
            }
        }
    };
}

handle_type!(
    /// Identifies a node in the remote tree.
    NodeHandle,
    HANDLE_SIZE
);
handle_type!(
    /// Identifies a user account.
    UserHandle,
    USER_HANDLE_SIZE
);
handle_type!(
    /// Identifies an outgoing or incoming share edge.
    ShareHandle,
    HANDLE_SIZE
);
handle_type!(
    /// Identifies a pending contact request.
    PcrHandle,
    USER_HANDLE_SIZE
);
handle_type!(
    /// Identifies a chat room.
    ChatHandle,
    USER_HANDLE_SIZE
);
handle_type!(
    /// Identifies an exported (public) node.
    PublicHandle,
    HANDLE_SIZE
);

/// Client-minted identifier for an upload in progress.
///
/// Unlike the server-assigned handles this one is allocated locally and
/// strictly monotonic within a session, so it can never collide with a
/// handle received from the server before the upload completes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default)]
pub struct UploadHandle(pub u64);

impl UploadHandle {
    pub fn next(&mut self) -> UploadHandle {
        self.0 += 1;
        UploadHandle(self.0)
    }

    pub fn to_b64(&self) -> String {
        b64::encode(&self.0.to_le_bytes()[..HANDLE_SIZE])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_roundtrip() {
        let h = NodeHandle::from_raw(0x0000_0504_0302_0100);
        let enc = h.to_b64();
        assert_eq!(enc.len(), 8);
        let back = NodeHandle::from_b64(&enc).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn test_handle_undef() {
        let h = NodeHandle::UNDEF;
        assert!(h.is_undef());
        assert!(!h.is_set());
        assert_eq!(NodeHandle::default(), NodeHandle::UNDEF);
    }

    #[test]
    fn test_user_handle_is_eleven_chars() {
        let u = UserHandle::from_raw(42);
        // 8 bytes -> 11 base64 characters, no padding
        assert_eq!(u.to_b64().len(), 11);
        assert_eq!(UserHandle::from_b64(&u.to_b64()).unwrap(), u);
    }

    #[test]
    fn test_bad_wire_form_rejected() {
        assert!(NodeHandle::from_b64("not base64 at all!!").is_err());
        assert!(NodeHandle::from_b64("AAAAAAAAAAAAAAAAAAAA").is_err());
    }

    #[test]
    fn test_upload_handles_are_monotonic() {
        let mut r#gen = UploadHandle::default();
        let a = r#gen.next();
        let b = r#gen.next();
        assert!(b > a);
    }
}
