pub mod kind;
pub mod node;
pub mod symtab;
pub mod text;

pub use kind::{Arity, NodeKind, PredefinedSym};
pub use node::{IntegerValue, NodeRef, Payload, SymbolId};
pub use symtab::{SymbolTable, WriteRange};
pub use text::write_text;

use anyhow::{anyhow, Result};

/// Display format of an integer literal; round-trips through CASM as
/// `ordinal + 1` (0 is reserved for default-valued literals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueFormat {
    Decimal,
    SignedDecimal,
    Hexadecimal,
}

impl ValueFormat {
    pub fn from_raw(value: u64) -> Result<Self> {
        match value {
            0 => Ok(Self::Decimal),
            1 => Ok(Self::SignedDecimal),
            2 => Ok(Self::Hexadecimal),
            value => Err(anyhow!("Unknown value format: {value}")),
        }
    }

    pub fn into_raw(self) -> u64 {
        match self {
            Self::Decimal => 0,
            Self::SignedDecimal => 1,
            Self::Hexadecimal => 2,
        }
    }
}
