//! Content fingerprints: (size, mtime, CRC of sampled blocks).
//!
//! The CRC part is deterministic from the file bytes alone, so two files
//! with equal fingerprints are treated as identical content by transfers
//! and the sync engine. Small files hash completely; large files sample
//! 32 evenly spaced 4-byte windows to stay O(1) in file size.

use crc32fast::Hasher;

use crate::b64;
use crate::error::CodecError;

/// Files up to this size carry their raw bytes in the CRC words.
const CRC_RAW_MAX: u64 = 16;

/// Files up to this size are CRCed in full, quarter by quarter.
const CRC_FULL_MAX: u64 = 8192;

/// Samples per CRC word for large files.
const SAMPLES_PER_WORD: u64 = 8;
const SAMPLE_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileFingerprint {
    pub size: u64,
    pub mtime: i64,
    pub crc: [u32; 4],
}

impl FileFingerprint {
    /// Computes the fingerprint by reading through the given accessor.
    /// `read` must fill the buffer completely from the absolute offset.
    pub fn generate<F>(size: u64, mtime: i64, mut read: F) -> anyhow::Result<FileFingerprint>
    where
        F: FnMut(u64, &mut [u8]) -> anyhow::Result<()>,
    {
        let mut crc = [0u32; 4];

        if size <= CRC_RAW_MAX {
            let mut raw = [0u8; 16];
            if size > 0 {
                read(0, &mut raw[..size as usize])?;
            }
            for i in 0..4 {
                crc[i] = u32::from_be_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
            }
        } else if size <= CRC_FULL_MAX {
            let mut data = vec![0u8; size as usize];
            read(0, &mut data)?;
            let quarter = data.len() / 4;
            for i in 0..4 {
                let end = if i == 3 { data.len() } else { (i + 1) * quarter };
                let mut hasher = Hasher::new();
                hasher.update(&data[i * quarter..end]);
                crc[i] = hasher.finalize();
            }
        } else {
            let total = 4 * SAMPLES_PER_WORD;
            let mut buf = [0u8; SAMPLE_BYTES];
            for i in 0..4u64 {
                let mut hasher = Hasher::new();
                for j in 0..SAMPLES_PER_WORD {
                    let idx = i * SAMPLES_PER_WORD + j;
                    let pos = (size - SAMPLE_BYTES as u64) * idx / (total - 1);
                    read(pos, &mut buf)?;
                    hasher.update(&buf);
                }
                crc[i as usize] = hasher.finalize();
            }
        }

        Ok(FileFingerprint { size, mtime, crc })
    }

    /// Convenience for in-memory content (tests, small buffers).
    pub fn from_bytes(data: &[u8], mtime: i64) -> FileFingerprint {
        FileFingerprint::generate(data.len() as u64, mtime, |pos, buf| {
            let pos = pos as usize;
            buf.copy_from_slice(&data[pos..pos + buf.len()]);
            Ok(())
        })
        .expect("in-memory reads cannot fail")
    }

    /// Serializes crc + compact mtime for the node attribute field.
    pub fn to_attr(&self) -> String {
        let mut out = Vec::with_capacity(16 + 9);
        for word in &self.crc {
            out.extend_from_slice(&word.to_be_bytes());
        }
        serialize_compact_i64(&mut out, self.mtime);
        b64::encode(&out)
    }

    /// Parses the attribute form; the size is carried separately by the
    /// node, so the caller supplies it.
    pub fn from_attr(attr: &str, size: u64) -> Result<FileFingerprint, CodecError> {
        let data = b64::decode(attr)?;
        if data.len() < 17 {
            return Err(CodecError::Truncated);
        }
        let mut crc = [0u32; 4];
        for i in 0..4 {
            crc[i] = u32::from_be_bytes(data[i * 4..i * 4 + 4].try_into().unwrap());
        }
        let mtime = deserialize_compact_i64(&data[16..])?;
        Ok(FileFingerprint { size, mtime, crc })
    }

    /// Content equality ignoring mtime, for rename/version detection.
    pub fn same_content(&self, other: &FileFingerprint) -> bool {
        self.size == other.size && self.crc == other.crc
    }
}

/// Compact little-endian integer: one length byte then the significant bytes.
fn serialize_compact_i64(out: &mut Vec<u8>, v: i64) {
    let bytes = v.to_le_bytes();
    let mut len = 8;
    while len > 0 && bytes[len - 1] == 0 {
        len -= 1;
    }
    out.push(len as u8);
    out.extend_from_slice(&bytes[..len]);
}

fn deserialize_compact_i64(data: &[u8]) -> Result<i64, CodecError> {
    let len = *data.first().ok_or(CodecError::Truncated)? as usize;
    if len > 8 || data.len() < 1 + len {
        return Err(CodecError::Truncated);
    }
    let mut bytes = [0u8; 8];
    bytes[..len].copy_from_slice(&data[1..1 + len]);
    Ok(i64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiny_file_is_raw_bytes() {
        let fp = FileFingerprint::from_bytes(b"abcd", 100);
        assert_eq!(fp.crc[0], u32::from_be_bytes(*b"abcd"));
        assert_eq!(fp.crc[1], 0);
    }

    #[test]
    fn test_deterministic() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let a = FileFingerprint::from_bytes(&data, 5);
        let b = FileFingerprint::from_bytes(&data, 5);
        assert_eq!(a, b);
    }

    #[test]
    fn test_content_change_changes_crc() {
        let mut data = vec![7u8; 50_000];
        let a = FileFingerprint::from_bytes(&data, 5);
        // Large files are sampled; byte 24191 is the start of the
        // sixteenth sampled window ((size-4)*15/31), so the change is
        // guaranteed visible.
        data[24_191] ^= 0xff;
        let b = FileFingerprint::from_bytes(&data, 5);
        assert_ne!(a.crc, b.crc);
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_mtime_does_not_affect_content_equality() {
        let data = vec![1u8; 4096];
        let a = FileFingerprint::from_bytes(&data, 5);
        let b = FileFingerprint::from_bytes(&data, 99);
        assert_ne!(a, b);
        assert!(a.same_content(&b));
    }

    #[test]
    fn test_attr_roundtrip() {
        let data = vec![3u8; 12_345];
        let fp = FileFingerprint::from_bytes(&data, 1_700_000_000);
        let attr = fp.to_attr();
        let back = FileFingerprint::from_attr(&attr, fp.size).unwrap();
        assert_eq!(fp, back);
    }

    #[test]
    fn test_compact_i64() {
        for v in [0i64, 1, 255, 256, 1_700_000_000, i64::MAX] {
            let mut out = Vec::new();
            serialize_compact_i64(&mut out, v);
            assert_eq!(deserialize_compact_i64(&out).unwrap(), v);
        }
    }
}
