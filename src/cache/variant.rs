//! Variant identifiers: the closed set of quantized forms the server knows.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned when a string names no known variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unsupported model type: {0}")]
pub struct UnknownVariant(pub String);

/// A quantized variant of the base model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VariantId {
    /// 4-bit K-quant, medium.
    #[serde(rename = "4bit")]
    FourBit,
    /// 8-bit round-to-nearest.
    #[serde(rename = "8bit")]
    EightBit,
}

impl VariantId {
    /// Every known variant, in quantization order.
    pub const ALL: [VariantId; 2] = [VariantId::FourBit, VariantId::EightBit];

    /// Wire name, also the name of the variant's subdirectory.
    pub fn as_str(self) -> &'static str {
        match self {
            VariantId::FourBit => "4bit",
            VariantId::EightBit => "8bit",
        }
    }

    /// Quantization format tag passed to the quantize tool.
    pub fn quant_tag(self) -> &'static str {
        match self {
            VariantId::FourBit => "Q4_K_M",
            VariantId::EightBit => "Q8_0",
        }
    }
}

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariantId {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "4bit" => Ok(VariantId::FourBit),
            "8bit" => Ok(VariantId::EightBit),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}
