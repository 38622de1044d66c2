//! Shared types for the Veil SDK: the error model, field/hex codecs and
//! arbitrary-precision amount encoding.

use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField};
use num_bigint::BigUint;
use num_traits::Num;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// BN254 scalar field element type alias.
pub type FieldElement = Fr;

/// 0x-prefixed hex string (e.g. "0x1234...").
pub type Hex = String;

/// Semantic error category. Every error the SDK surfaces carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Missing or invalid options.
    Config,
    /// Asset manifest or asset fetch failures.
    Assets,
    /// Storage adapter I/O.
    Storage,
    /// Indexer contract violated: gaps, duplicates, aborts, timeouts.
    Sync,
    /// Decryption or commitment validation.
    Crypto,
    /// Tree contiguity, local-db-behind, path construction.
    Merkle,
    /// Proof bridge init/compute.
    Proof,
    /// Relayer HTTP, timeouts, aborts.
    Relayer,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Config => "CONFIG",
            Self::Assets => "ASSETS",
            Self::Storage => "STORAGE",
            Self::Sync => "SYNC",
            Self::Crypto => "CRYPTO",
            Self::Merkle => "MERKLE",
            Self::Proof => "PROOF",
            Self::Relayer => "RELAYER",
        };
        f.write_str(s)
    }
}

/// Transport context attached to HTTP-born errors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub status: Option<u16>,
    pub url: Option<String>,
    pub body: Option<String>,
}

const BODY_TRUNCATE: usize = 512;

impl ErrorDetail {
    pub fn http(status: Option<u16>, url: impl Into<String>, body: Option<&str>) -> Self {
        Self {
            status,
            url: Some(url.into()),
            body: body.map(|b| {
                let mut b = b.to_string();
                if b.len() > BODY_TRUNCATE {
                    b.truncate(BODY_TRUNCATE);
                }
                b
            }),
        }
    }
}

/// Veil SDK error: a semantic code plus a human message, optionally carrying
/// HTTP detail and an underlying cause.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub detail: Option<ErrorDetail>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
            source: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Config, message)
    }

    pub fn assets(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Assets, message)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Storage, message)
    }

    pub fn sync(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Sync, message)
    }

    pub fn crypto(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Crypto, message)
    }

    pub fn merkle(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Merkle, message)
    }

    pub fn proof(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Proof, message)
    }

    pub fn relayer(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Relayer, message)
    }

    /// A cancelled operation. The message is exactly "Aborted" so callers
    /// can match it.
    pub fn aborted(code: ErrorCode) -> Self {
        Self::new(code, "Aborted")
    }

    pub fn with_detail(mut self, detail: ErrorDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn is_aborted(&self) -> bool {
        self.message == "Aborted"
    }

    /// HTTP status of the failing request, when one was observed.
    pub fn status(&self) -> Option<u16> {
        self.detail.as_ref().and_then(|d| d.status)
    }
}

/// Parse a 0x-prefixed hex string into a field element.
pub fn hex_to_field(hex_str: &str) -> Result<Fr> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    let padded_hex = if hex_str.len() % 2 != 0 {
        format!("0{}", hex_str)
    } else {
        hex_str.to_string()
    };
    let bytes = hex::decode(&padded_hex)
        .map_err(|e| Error::crypto(format!("invalid hex string: {}", e)))?;
    if bytes.len() > 32 {
        return Err(Error::crypto(format!(
            "hex value too wide for field: {} bytes",
            bytes.len()
        )));
    }
    let mut padded = [0u8; 32];
    let offset = 32 - bytes.len();
    padded[offset..].copy_from_slice(&bytes);
    // ark-ff wants little-endian
    padded.reverse();
    Ok(Fr::from_le_bytes_mod_order(&padded))
}

/// Convert a field element to a 0x-prefixed hex string (64 hex chars).
pub fn field_to_hex(f: &Fr) -> Hex {
    let bytes = f.into_bigint().to_bytes_be();
    format!("0x{}", hex::encode(bytes))
}

/// Parse a hex string to big-endian bytes.
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    hex::decode(hex_str).map_err(|e| Error::crypto(format!("invalid hex string: {}", e)))
}

/// Convert bytes to a 0x-prefixed hex string.
pub fn bytes_to_hex(bytes: &[u8]) -> Hex {
    format!("0x{}", hex::encode(bytes))
}

/// Arbitrary-precision non-negative amount. Never truncated to 64 bits;
/// text stores carry it as a decimal string, SQL as TEXT.
pub type Amount = BigUint;

/// Parse a decimal amount string.
pub fn amount_from_decimal(s: &str) -> Result<Amount> {
    BigUint::from_str_radix(s, 10)
        .map_err(|e| Error::storage(format!("invalid decimal amount {:?}: {}", s, e)))
}

/// Render an amount as a decimal string.
pub fn amount_to_decimal(a: &Amount) -> String {
    a.to_str_radix(10)
}

/// Parse a 0x-prefixed hex amount (the wire encoding used by note fields).
pub fn amount_from_hex(s: &str) -> Result<Amount> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(BigUint::from(0u32));
    }
    BigUint::from_str_radix(s, 16)
        .map_err(|e| Error::storage(format!("invalid hex amount {:?}: {}", s, e)))
}

/// Convert a field element to an amount.
pub fn amount_from_field(f: &Fr) -> Amount {
    BigUint::from_bytes_be(&f.into_bigint().to_bytes_be())
}

/// Convert an amount to a field element. Fails when the amount does not fit
/// the field.
pub fn amount_to_field(a: &Amount) -> Result<Fr> {
    let modulus = BigUint::from_bytes_be(&Fr::MODULUS.to_bytes_be());
    if *a >= modulus {
        return Err(Error::crypto("amount exceeds field modulus".to_string()));
    }
    let bytes = a.to_bytes_le();
    Ok(Fr::from_le_bytes_mod_order(&bytes))
}

/// Serde codec persisting an [`Amount`] as a decimal string.
pub mod amount_serde {
    use super::{amount_from_decimal, amount_to_decimal, Amount};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        amount_to_decimal(amount).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        let s = String::deserialize(deserializer)?;
        amount_from_decimal(&s).map_err(serde::de::Error::custom)
    }
}

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
