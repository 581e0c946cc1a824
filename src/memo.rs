//! Per-event memo nonces.
//!
//! Memo-based networks funnel every deposit through one gateway account and
//! tell the events apart by a compact nonce encoded into the chain's memo
//! field: ten decimal digits for XRP (destination tags are numeric), ten
//! lowercase base32 characters elsewhere.

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::types::Network;

/// RFC 4648 alphabet, lowercased. No base32 crate ships in this stack, and
/// ten characters is all we ever emit.
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Length of every memo the gateway publishes.
pub const MEMO_LEN: usize = 10;

/// Derive the memo for a deposit event from its random seed.
pub fn encode_memo(network: Network, seed: u128) -> String {
    let digest = Sha256::digest(seed.to_string().as_bytes());
    match network {
        Network::Xrp => {
            // Destination tags are numeric: ten digits, never a leading zero.
            let mut word = [0u8; 8];
            word.copy_from_slice(&digest[..8]);
            let value = u64::from_be_bytes(word);
            format!("{}", 1_000_000_000 + value % 9_000_000_000)
        }
        _ => {
            let encoded = base32_lower(hex::encode(digest).as_bytes());
            encoded[..MEMO_LEN].to_string()
        }
    }
}

/// Seed space for memo generation.
pub fn random_seed() -> u128 {
    rand::thread_rng().gen_range(10u128.pow(17)..10u128.pow(18))
}

fn base32_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 8 / 5 + 1);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}
