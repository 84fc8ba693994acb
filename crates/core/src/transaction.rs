//! Binary transaction envelope, as submitted by clients in base64.
//!
//! Layout (version 1):
//! `version u8 | transaction_id 16B | contract_hash 32B | valid_till i64be |
//! payload utf8 | signature 64B | public_key 33B`
//! The payload occupies everything between the fixed header and the trailing
//! signature/key block. `valid_till = 0` means the transaction never expires.

use thiserror::Error;

pub const ID_LEN: usize = 16;
pub const CONTRACT_HASH_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
pub const PUBLIC_KEY_LEN: usize = 33;

const HEADER_LEN: usize = 1 + ID_LEN + CONTRACT_HASH_LEN + 8;
const TRAILER_LEN: usize = SIGNATURE_LEN + PUBLIC_KEY_LEN;
pub const MIN_LEN: usize = HEADER_LEN + TRAILER_LEN;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TxDecodeError {
    #[error("Invalid base64 transaction data.")]
    Base64,
    #[error("Transaction too short: {0} bytes, minimum {MIN_LEN}.")]
    TooShort(usize),
    #[error("Unsupported transaction version: {0}.")]
    UnsupportedVersion(u8),
    #[error("Transaction payload is not valid text.")]
    PayloadNotUtf8,
}

/// A decoded but not yet validated transaction. Contract execution and
/// signature checking belong to the processor; the gateway only needs the
/// fields it persists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedTransaction {
    pub version: u8,
    pub id: [u8; ID_LEN],
    pub contract_hash: [u8; CONTRACT_HASH_LEN],
    pub valid_till: i64,
    pub payload: String,
    pub signature: [u8; SIGNATURE_LEN],
    pub public_key: [u8; PUBLIC_KEY_LEN],
}

impl SignedTransaction {
    pub fn from_base64(data: &str) -> Result<SignedTransaction, TxDecodeError> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|_| TxDecodeError::Base64)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<SignedTransaction, TxDecodeError> {
        if bytes.len() < MIN_LEN {
            return Err(TxDecodeError::TooShort(bytes.len()));
        }
        let version = bytes[0];
        if version != 1 {
            return Err(TxDecodeError::UnsupportedVersion(version));
        }

        let mut at = 1;
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&bytes[at..at + ID_LEN]);
        at += ID_LEN;

        let mut contract_hash = [0u8; CONTRACT_HASH_LEN];
        contract_hash.copy_from_slice(&bytes[at..at + CONTRACT_HASH_LEN]);
        at += CONTRACT_HASH_LEN;

        let valid_till = i64::from_be_bytes(bytes[at..at + 8].try_into().unwrap());
        at += 8;

        let payload_end = bytes.len() - TRAILER_LEN;
        let payload = std::str::from_utf8(&bytes[at..payload_end])
            .map_err(|_| TxDecodeError::PayloadNotUtf8)?
            .to_owned();

        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&bytes[payload_end..payload_end + SIGNATURE_LEN]);
        let mut public_key = [0u8; PUBLIC_KEY_LEN];
        public_key.copy_from_slice(&bytes[payload_end + SIGNATURE_LEN..]);

        Ok(SignedTransaction {
            version,
            id,
            contract_hash,
            valid_till,
            payload,
            signature,
            public_key,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_LEN + self.payload.len());
        out.push(self.version);
        out.extend_from_slice(&self.id);
        out.extend_from_slice(&self.contract_hash);
        out.extend_from_slice(&self.valid_till.to_be_bytes());
        out.extend_from_slice(self.payload.as_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.public_key);
        out
    }

    pub fn hex_id(&self) -> String {
        hex::encode(self.id)
    }
}
