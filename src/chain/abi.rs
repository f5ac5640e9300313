//! EVM word codec
//!
//! Hand-rolled 32-byte word encoding/decoding for the handful of aggregator
//! calls and events this agent touches. Calldata stays hex strings end to end
//! so it can go straight into JSON-RPC params.

use std::fmt;
use std::str::FromStr;

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::One;
use thiserror::Error;

pub const WORD_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum AbiError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("word {0} out of range for return data of {1} bytes")]
    ShortData(usize, usize),
    #[error("value does not fit in a 256-bit word")]
    Overflow,
    #[error("uint value does not fit in u64")]
    U64Overflow,
}

/// A 20-byte account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn from_hex(s: &str) -> Result<Self, AbiError> {
        let stripped = s.trim().trim_start_matches("0x");
        let bytes = hex::decode(stripped).map_err(|_| AbiError::InvalidAddress(s.to_string()))?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| AbiError::InvalidAddress(s.to_string()))?;
        Ok(Self(arr))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = AbiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Decode a `0x`-prefixed hex string into raw bytes.
pub fn decode_hex(s: &str) -> Result<Vec<u8>, AbiError> {
    let stripped = s.trim().trim_start_matches("0x");
    hex::decode(stripped).map_err(|_| AbiError::InvalidHex(s.to_string()))
}

/// Parse a JSON-RPC quantity (`0x`-prefixed, no leading zeros) into u64.
pub fn decode_quantity(s: &str) -> Result<u64, AbiError> {
    let stripped = s.trim().trim_start_matches("0x");
    u64::from_str_radix(stripped, 16).map_err(|_| AbiError::InvalidHex(s.to_string()))
}

/// Borrow the i-th 32-byte word of ABI return data.
pub fn word(data: &[u8], i: usize) -> Result<&[u8], AbiError> {
    let start = i * WORD_LEN;
    let end = start + WORD_LEN;
    if data.len() < end {
        return Err(AbiError::ShortData(i, data.len()));
    }
    Ok(&data[start..end])
}

pub fn decode_uint(w: &[u8]) -> BigUint {
    BigUint::from_bytes_be(w)
}

/// Unsigned word constrained to u64, for round ids and timestamps.
pub fn decode_u64(w: &[u8]) -> Result<u64, AbiError> {
    if w[..WORD_LEN - 8].iter().any(|b| *b != 0) {
        return Err(AbiError::U64Overflow);
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&w[WORD_LEN - 8..]);
    Ok(u64::from_be_bytes(buf))
}

/// Two's-complement int256 decode.
pub fn decode_int(w: &[u8]) -> BigInt {
    let raw = BigInt::from_bytes_be(Sign::Plus, w);
    if w[0] & 0x80 != 0 {
        raw - (BigInt::one() << 256)
    } else {
        raw
    }
}

pub fn decode_bool(w: &[u8]) -> bool {
    w.iter().any(|b| *b != 0)
}

pub fn decode_address(w: &[u8]) -> Address {
    let mut arr = [0u8; 20];
    arr.copy_from_slice(&w[WORD_LEN - 20..]);
    Address(arr)
}

pub fn encode_u64(v: u64) -> [u8; WORD_LEN] {
    let mut w = [0u8; WORD_LEN];
    w[WORD_LEN - 8..].copy_from_slice(&v.to_be_bytes());
    w
}

pub fn encode_address(a: &Address) -> [u8; WORD_LEN] {
    let mut w = [0u8; WORD_LEN];
    w[WORD_LEN - 20..].copy_from_slice(&a.0);
    w
}

/// Two's-complement int256 encode.
pub fn encode_int(v: &BigInt) -> Result<[u8; WORD_LEN], AbiError> {
    let modulus = BigInt::one() << 256;
    let bound = BigInt::one() << 255;
    if *v >= bound || *v < -&bound {
        return Err(AbiError::Overflow);
    }
    let unsigned = if v.sign() == Sign::Minus {
        v + &modulus
    } else {
        v.clone()
    };
    let (_, bytes) = unsigned.to_bytes_be();
    let mut w = [0u8; WORD_LEN];
    w[WORD_LEN - bytes.len()..].copy_from_slice(&bytes);
    Ok(w)
}

/// Build `0x`-prefixed calldata from a selector and already-encoded words.
pub fn calldata(selector: &str, words: &[[u8; WORD_LEN]]) -> String {
    let mut out = String::from(selector);
    for w in words {
        out.push_str(&hex::encode(w));
    }
    out
}
