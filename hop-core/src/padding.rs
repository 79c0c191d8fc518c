//! Block padding for private plaintexts, so ciphertext length leaks only a size class.

use rand::RngCore;

/// Target block sizes in bytes. Larger payloads are padded minimally.
pub const BLOCK_SIZES: [usize; 4] = [256, 512, 1024, 2048];

/// AEAD tag plus nonce, counted against the block so the ciphertext lands on the boundary.
const CIPHER_OVERHEAD: usize = 16 + 12;

/// Smallest block that fits `data_len` plus cipher overhead, or `data_len + 1` if none does.
pub fn optimal_block_size(data_len: usize) -> usize {
    let total = data_len + CIPHER_OVERHEAD;
    BLOCK_SIZES
        .iter()
        .copied()
        .find(|&b| total <= b)
        .map(|b| b - CIPHER_OVERHEAD)
        .unwrap_or(data_len + 1)
}

/// Pad with random bytes; the final byte records how many bytes were appended (1..=255).
/// Always appends at least one byte so [`unpad`] is unambiguous.
pub fn pad(data: &[u8]) -> Vec<u8> {
    let target = optimal_block_size(data.len());
    let needed = target.saturating_sub(data.len());
    let pad_len = if (1..=255).contains(&needed) { needed } else { 1 };
    let mut out = Vec::with_capacity(data.len() + pad_len);
    out.extend_from_slice(data);
    let mut filler = vec![0u8; pad_len - 1];
    rand::thread_rng().fill_bytes(&mut filler);
    out.extend_from_slice(&filler);
    out.push(pad_len as u8);
    out
}

/// Strip padding added by [`pad`]. `None` if the trailer is inconsistent.
pub fn unpad(data: &[u8]) -> Option<&[u8]> {
    let pad_len = *data.last()? as usize;
    if pad_len == 0 || pad_len > data.len() {
        return None;
    }
    Some(&data[..data.len() - pad_len])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pads_small_payload_to_first_block() {
        let padded = pad(b"hello");
        assert_eq!(padded.len() + CIPHER_OVERHEAD, 256);
        assert_eq!(unpad(&padded), Some(&b"hello"[..]));
    }

    #[test]
    fn pads_large_payload_minimally() {
        let data = vec![7u8; 4000];
        let padded = pad(&data);
        assert_eq!(padded.len(), 4001);
        assert_eq!(unpad(&padded), Some(&data[..]));
    }

    #[test]
    fn gap_over_255_falls_back_to_single_byte() {
        let data = vec![1u8; 485];
        let padded = pad(&data);
        assert_eq!(padded.len(), 486);
        assert_eq!(unpad(&padded), Some(&data[..]));
        let exact = vec![2u8; 228];
        assert_eq!(pad(&exact).len(), 229);
        let empty = pad(b"");
        assert_eq!(unpad(&empty), Some(&b""[..]));
    }

    #[test]
    fn unpad_rejects_garbage() {
        assert_eq!(unpad(&[]), None);
        assert_eq!(unpad(&[0]), None);
        assert_eq!(unpad(&[1, 2, 9]), None);
    }
}
