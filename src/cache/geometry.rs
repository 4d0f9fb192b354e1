//! Block geometry: mapping byte ranges onto block-aligned spans.

use crate::error::{BlockcowError, Result};

/// Round `offset` down to the start of its block.
pub fn floor_offset(offset: u64, block_size: u64) -> u64 {
    offset - offset % block_size
}

/// Round `offset` up to the next block boundary, or return it unchanged if aligned.
pub fn ceil_offset(offset: u64, block_size: u64) -> Option<u64> {
    match offset % block_size {
        0 => Some(offset),
        rem => offset.checked_add(block_size - rem),
    }
}

/// Ascending block offsets covering `[floor(offset), ceil(offset + length))`.
///
/// A zero-length request yields no blocks. The span check can only fail on an
/// internal arithmetic bug or on overflow of `offset + length`.
pub fn align(offset: u64, length: u64, block_size: u64) -> Result<Vec<u64>> {
    if block_size == 0 {
        return Err(BlockcowError::Alignment(
            "block size must be non-zero".to_string(),
        ));
    }
    if length == 0 {
        return Ok(Vec::new());
    }

    let end = offset
        .checked_add(length)
        .and_then(|end| ceil_offset(end, block_size))
        .ok_or_else(|| {
            BlockcowError::Alignment(format!(
                "range at offset {} of len {} overflows",
                offset, length
            ))
        })?;
    let start = floor_offset(offset, block_size);

    let total = end - start;
    if total % block_size != 0 {
        return Err(BlockcowError::Alignment(format!(
            "region wrong length at offset {}, of len {}",
            start, total
        )));
    }

    Ok((0..total / block_size)
        .map(|i| start + i * block_size)
        .collect())
}

/// Overwrite `buf[index..index + patch.len()]` with `patch` in place.
///
/// The buffer keeps its length; the caller guarantees the patch fits.
pub fn patch(buf: &mut [u8], patch: &[u8], index: usize) {
    buf[index..index + patch.len()].copy_from_slice(patch);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_and_ceil() {
        assert_eq!(floor_offset(0, 4096), 0);
        assert_eq!(floor_offset(4095, 4096), 0);
        assert_eq!(floor_offset(4096, 4096), 4096);
        assert_eq!(ceil_offset(0, 4096), Some(0));
        assert_eq!(ceil_offset(1, 4096), Some(4096));
        assert_eq!(ceil_offset(8192, 4096), Some(8192));
        assert_eq!(ceil_offset(u64::MAX, 4096), None);
    }

    #[test]
    fn test_align_straddling_request() {
        let blocks = align(4090, 10, 4096).unwrap();
        assert_eq!(blocks, vec![0, 4096]);
    }

    #[test]
    fn test_align_exact_block() {
        assert_eq!(align(4096, 4096, 4096).unwrap(), vec![4096]);
        assert_eq!(align(0, 1, 4096).unwrap(), vec![0]);
    }

    #[test]
    fn test_align_zero_length_is_empty() {
        assert!(align(0, 0, 4096).unwrap().is_empty());
        assert!(align(123_456, 0, 4096).unwrap().is_empty());
    }

    #[test]
    fn test_align_rejects_zero_block_size() {
        assert!(matches!(
            align(0, 10, 0),
            Err(BlockcowError::Alignment(_))
        ));
    }

    #[test]
    fn test_align_rejects_overflow() {
        assert!(matches!(
            align(u64::MAX - 1, 10, 4096),
            Err(BlockcowError::Alignment(_))
        ));
    }

    #[test]
    fn test_patch_replaces_only_target_range() {
        let mut buf = vec![b'a'; 16];
        patch(&mut buf, b"XYZ", 5);

        assert_eq!(buf.len(), 16);
        assert_eq!(&buf[5..8], b"XYZ");
        assert!(buf[..5].iter().all(|&b| b == b'a'));
        assert!(buf[8..].iter().all(|&b| b == b'a'));
    }

    #[test]
    fn test_patch_at_edges() {
        let mut buf = vec![0u8; 8];
        patch(&mut buf, b"ab", 0);
        patch(&mut buf, b"yz", 6);
        assert_eq!(&buf, b"ab\0\0\0\0yz");

        let mut buf = vec![0u8; 4];
        patch(&mut buf, b"", 4);
        assert_eq!(buf, vec![0u8; 4]);
    }
}
