//! RAID transfer layout: six parallel streams, five data plus one
//! parity, interleaved in 16-byte sectors over 80-byte lines.
//!
//! File offset `o` lives in line `o / 80`; within a line the five data
//! sectors map to parts 1..=5 in order and part 0 carries their XOR.
//! Any single missing part reconstructs from the other five.

pub const RAID_PARTS: usize = 6;
pub const RAID_SECTOR: usize = 16;
pub const RAID_LINE: usize = RAID_SECTOR * (RAID_PARTS - 1);

/// Number of lines needed to carry `size` bytes of file data.
pub fn line_count(size: u64) -> u64 {
    size.div_ceil(RAID_LINE as u64)
}

/// Byte range of one part backing file range `[start, end)`:
/// whole lines, so the caller may need to trim the decoded buffer.
pub fn part_range(start: u64, end: u64) -> (u64, u64) {
    let first_line = start / RAID_LINE as u64;
    let last_line = end.div_ceil(RAID_LINE as u64);
    (
        first_line * RAID_SECTOR as u64,
        last_line * RAID_SECTOR as u64,
    )
}

/// Splits plain data (assumed line-aligned at offset zero) into the six
/// part streams, zero-padding the tail line.
pub fn encode(data: &[u8]) -> [Vec<u8>; 6] {
    let lines = data.len().div_ceil(RAID_LINE);
    let mut parts: [Vec<u8>; 6] = std::array::from_fn(|_| vec![0u8; lines * RAID_SECTOR]);
    for line in 0..lines {
        let mut parity = [0u8; RAID_SECTOR];
        for p in 1..RAID_PARTS {
            let src = line * RAID_LINE + (p - 1) * RAID_SECTOR;
            let dst = line * RAID_SECTOR;
            for i in 0..RAID_SECTOR {
                let byte = data.get(src + i).copied().unwrap_or(0);
                parts[p][dst + i] = byte;
                parity[i] ^= byte;
            }
        }
        parts[0][line * RAID_SECTOR..(line + 1) * RAID_SECTOR].copy_from_slice(&parity);
    }
    parts
}

/// Reassembles plain data from the parts. `missing` may name one absent
/// part (its buffer is ignored and reconstructed from parity). `len`
/// trims the zero padding of the final line.
pub fn decode(parts: &[Vec<u8>; 6], missing: Option<usize>, len: usize) -> Option<Vec<u8>> {
    let lines = parts
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != missing)
        .map(|(_, p)| p.len() / RAID_SECTOR)
        .max()?;
    let mut out = vec![0u8; lines * RAID_LINE];

    for line in 0..lines {
        let mut sectors = [[0u8; RAID_SECTOR]; RAID_PARTS];
        for p in 0..RAID_PARTS {
            if Some(p) == missing {
                continue;
            }
            let off = line * RAID_SECTOR;
            let part = &parts[p];
            if off < part.len() {
                let end = (off + RAID_SECTOR).min(part.len());
                sectors[p][..end - off].copy_from_slice(&part[off..end]);
            }
        }
        if let Some(m) = missing {
            // XOR of the other five restores the gap (parity included).
            let mut rebuilt = [0u8; RAID_SECTOR];
            for p in 0..RAID_PARTS {
                if p == m {
                    continue;
                }
                for i in 0..RAID_SECTOR {
                    rebuilt[i] ^= sectors[p][i];
                }
            }
            sectors[m] = rebuilt;
        }
        for p in 1..RAID_PARTS {
            let dst = line * RAID_LINE + (p - 1) * RAID_SECTOR;
            out[dst..dst + RAID_SECTOR].copy_from_slice(&sectors[p]);
        }
    }

    out.truncate(len);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        for len in [0usize, 1, 79, 80, 81, 4096, 100_001] {
            let data = sample(len);
            let parts = encode(&data);
            let back = decode(&parts, None, len).unwrap();
            assert_eq!(back, data, "len {len}");
        }
    }

    #[test]
    fn test_single_part_reconstruction() {
        let data = sample(10_000);
        let parts = encode(&data);
        for missing in 0..RAID_PARTS {
            let back = decode(&parts, Some(missing), data.len()).unwrap();
            assert_eq!(back, data, "missing part {missing}");
        }
    }

    #[test]
    fn test_part_range_is_line_aligned() {
        let (start, end) = part_range(100, 300);
        assert_eq!(start, 16); // line 1
        assert_eq!(end, 64); // through line 3
    }
}
