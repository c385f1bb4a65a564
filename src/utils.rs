//! Utility functions for moving values between the chain and the field
//!
//! On-chain values are `uint256` words; circuit values are BN254 scalars.
//! Every commitment, root and nullifier crosses that boundary, so the
//! conversions here are strict: a word that does not fit the field is an
//! error, never silently reduced.

use alloy_primitives::U256;
use ark_bn254::Fr;
use ark_ff::{BigInt, PrimeField};
use thiserror::Error;

/// Error type for field conversions
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("value is {0} bytes, at most 32 fit a field element")]
    TooLong(usize),

    #[error("value {0} is not below the BN254 scalar field modulus")]
    OutOfRange(U256),
}

/// BN254 scalar field modulus as a chain word
pub fn field_modulus() -> U256 {
    U256::from_limbs(Fr::MODULUS.0)
}

/// Convert a chain word to a field element
///
/// Rejects values at or above the modulus instead of reducing them, so a
/// commitment read from a log always round-trips to the same word.
pub fn u256_to_field(value: U256) -> Result<Fr, FieldError> {
    Fr::from_bigint(BigInt::new(value.into_limbs())).ok_or(FieldError::OutOfRange(value))
}

/// Convert a field element to a chain word
pub fn field_to_u256(field: Fr) -> U256 {
    U256::from_limbs(field.into_bigint().0)
}

/// Convert hex string to field element
///
/// Accepts strings with or without "0x" prefix (big-endian, up to 32 bytes)
pub fn hex_to_field(hex: &str) -> Result<Fr, FieldError> {
    let bytes = decode_hex(hex)?;
    if bytes.len() > 32 {
        return Err(FieldError::TooLong(bytes.len()));
    }

    // Pad to 32 bytes (big-endian)
    let mut padded = [0u8; 32];
    let start = 32 - bytes.len();
    padded[start..].copy_from_slice(&bytes);

    u256_to_field(U256::from_be_bytes(padded))
}

/// Convert field element to a 0x-prefixed, 32-byte big-endian hex string
pub fn field_to_hex(field: Fr) -> String {
    let bytes: [u8; 32] = field_to_u256(field).to_be_bytes();
    format!("0x{}", hex::encode(bytes))
}

/// Decode a hex string with an optional "0x" prefix
pub fn decode_hex(hex: &str) -> Result<Vec<u8>, FieldError> {
    let hex = hex.trim();
    let hex = hex
        .strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .unwrap_or(hex);
    hex::decode(hex).map_err(|e| FieldError::InvalidHex(e.to_string()))
}
