use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::ast::NodeKind;
use crate::IntType;

/// Wire formats a header value or abbreviation index can take.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum IntTypeFormat {
    Uint8 = 0,
    Uint32 = 1,
    Uint64 = 2,
    Varint32 = 3,
    Varint64 = 4,
    Varuint32 = 5,
    Varuint64 = 6,
}

impl IntTypeFormat {
    pub fn name(self) -> &'static str {
        match self {
            Self::Uint8 => "uint8",
            Self::Uint32 => "uint32",
            Self::Uint64 => "uint64",
            Self::Varint32 => "varint32",
            Self::Varint64 => "varint64",
            Self::Varuint32 => "varuint32",
            Self::Varuint64 => "varuint64",
        }
    }

    pub fn from_kind(kind: NodeKind) -> Option<Self> {
        match kind {
            NodeKind::Uint8 | NodeKind::U8Const => Some(Self::Uint8),
            NodeKind::Uint32 | NodeKind::U32Const => Some(Self::Uint32),
            NodeKind::Uint64 | NodeKind::U64Const => Some(Self::Uint64),
            NodeKind::Varint32 | NodeKind::I32Const => Some(Self::Varint32),
            NodeKind::Varint64 | NodeKind::I64Const => Some(Self::Varint64),
            NodeKind::Varuint32 => Some(Self::Varuint32),
            NodeKind::Varuint64 => Some(Self::Varuint64),
            _ => None,
        }
    }

    pub fn to_kind(self) -> NodeKind {
        match self {
            Self::Uint8 => NodeKind::Uint8,
            Self::Uint32 => NodeKind::Uint32,
            Self::Uint64 => NodeKind::Uint64,
            Self::Varint32 => NodeKind::Varint32,
            Self::Varint64 => NodeKind::Varint64,
            Self::Varuint32 => NodeKind::Varuint32,
            Self::Varuint64 => NodeKind::Varuint64,
        }
    }

    /// Encoded size of `value` under this format, in bytes. Used to
    /// price an abbreviation index against the weight it saves.
    pub fn byte_size(self, value: IntType) -> usize {
        fn leb_size(value: IntType) -> usize {
            (64 - value.leading_zeros()).div_ceil(7).max(1) as usize
        }
        fn signed_leb_size(value: i64) -> usize {
            let magnitude = if value < 0 { !value as u64 } else { value as u64 };
            // One extra bit for the sign.
            (65 - magnitude.leading_zeros()).div_ceil(7) as usize
        }
        match self {
            Self::Uint8 => 1,
            Self::Uint32 => 4,
            Self::Uint64 => 8,
            Self::Varuint32 | Self::Varuint64 => leb_size(value),
            Self::Varint32 | Self::Varint64 => signed_leb_size(value as i64),
        }
    }
}
