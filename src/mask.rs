//! XOR masking of client payloads (RFC 6455 Section 5.3).

/// Masks or unmasks `buf` in place: byte `i` is XORed with `mask[i % 4]`.
///
/// Applying the same mask twice restores the input.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let key = u32::from_ne_bytes(mask);

    let mut words = buf.chunks_exact_mut(4);
    for word in &mut words {
        let mut raw = [0; 4];
        raw.copy_from_slice(word);
        word.copy_from_slice(&(u32::from_ne_bytes(raw) ^ key).to_ne_bytes());
    }

    for (byte, key) in words.into_remainder().iter_mut().zip(mask) {
        *byte ^= key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply_mask_bytewise(buf: &mut [u8], mask: [u8; 4]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }
    }

    #[test]
    fn test_matches_bytewise() {
        let mask = [0x6d, 0xb6, 0xb2, 0x80];
        let data: Vec<u8> = (0..=40).collect();

        for len in 0..data.len() {
            let mut fast = data[..len].to_vec();
            let mut slow = data[..len].to_vec();
            apply_mask(&mut fast, mask);
            apply_mask_bytewise(&mut slow, mask);
            assert_eq!(fast, slow, "length {len}");
        }
    }

    #[test]
    fn test_mask_unmask_identity() {
        let mask = [0xAA, 0xBB, 0xCC, 0xDD];
        let original = b"Hello, World! This is a test message with various lengths.";

        let mut data = original.to_vec();
        apply_mask(&mut data, mask);
        assert_ne!(&data[..], &original[..]);

        apply_mask(&mut data, mask);
        assert_eq!(&data[..], &original[..]);
    }

    #[test]
    fn test_zero_mask_is_noop() {
        let mut data = b"Test data".to_vec();
        apply_mask(&mut data, [0; 4]);
        assert_eq!(&data[..], b"Test data");
    }

    #[test]
    fn test_short_buffers() {
        let mask = [0x12, 0x34, 0x56, 0x78];

        let mut three = vec![0xAB, 0xCD, 0xEF];
        apply_mask(&mut three, mask);
        assert_eq!(three, vec![0xAB ^ 0x12, 0xCD ^ 0x34, 0xEF ^ 0x56]);

        let mut empty: Vec<u8> = vec![];
        apply_mask(&mut empty, mask);
        assert!(empty.is_empty());
    }
}
