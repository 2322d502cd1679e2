pub mod cursor;
pub mod eob;
pub mod page;
pub mod queue;

pub use cursor::{ReadCursor, ReadFormats, WriteCursor, WriteFormats};
pub use eob::BlockEob;
pub use page::Page;
pub use queue::{Queue, QueueRef};

use anyhow::{anyhow, Result};

/// Virtual byte address into a queue. Addresses are monotone and stable:
/// a byte written at address `N` is always addressed as `N`, even after
/// earlier pages have been retired.
pub type AddressType = u64;

pub const PAGE_SIZE_LOG2: u32 = 16;
pub const PAGE_SIZE: AddressType = 1 << PAGE_SIZE_LOG2;

/// The last page index is reserved, so every eob below this limit can be
/// associated with a real page.
pub const MAX_EOF_ADDRESS: AddressType = AddressType::MAX << PAGE_SIZE_LOG2;
pub const UNDEFINED_ADDRESS: AddressType = AddressType::MAX;

pub fn is_good_address(address: AddressType) -> bool {
    address <= MAX_EOF_ADDRESS
}

/// Errors raised by queue/cursor primitives. The interpreter maps these
/// onto its own throw taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamError {
    /// Address landed on a page that has already been retired.
    Retired(AddressType),
    /// Write attempted after the eof was frozen.
    Frozen,
    /// Read attempted at or past the current end-of-block.
    PastEob,
    /// Read attempted past the frozen eof.
    PastEof,
    /// LEB128 continuation bits exceed the target width.
    Overlong,
    /// The backing source failed to produce bytes.
    Source,
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retired(addr) => write!(f, "Address {addr:#x} is on a retired page"),
            Self::Frozen => write!(f, "Write after eof was frozen"),
            Self::PastEob => write!(f, "Read past end of block"),
            Self::PastEof => write!(f, "Read past frozen eof"),
            Self::Overlong => write!(f, "LEB128 value overflows target width"),
            Self::Source => write!(f, "Backing stream failed"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Direction of a stream referenced by a `Stream` AST node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Input,
    Output,
}

/// Granularity of a stream referenced by a `Stream` AST node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Byte,
    Int,
}

impl StreamKind {
    fn from_raw(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Input),
            1 => Ok(Self::Output),
            value => Err(anyhow!("Unknown stream kind: {value}")),
        }
    }

    fn into_raw(self) -> u8 {
        match self {
            Self::Input => 0,
            Self::Output => 1,
        }
    }
}

impl StreamType {
    // NOTE raw values 0x2 and 0x3 appear in old call sites with unclear
    // meaning; they are rejected as malformed.
    fn from_raw(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Byte),
            1 => Ok(Self::Int),
            value => Err(anyhow!("Unknown stream type: {value}")),
        }
    }

    fn into_raw(self) -> u8 {
        match self {
            Self::Byte => 0,
            Self::Int => 1,
        }
    }
}

/// Unpack the `kind << 4 | type` encoding used by `Stream` nodes.
pub fn unpack_stream(value: u64) -> Result<(StreamKind, StreamType)> {
    let kind = StreamKind::from_raw((value >> 4) as u8)?;
    let typ = StreamType::from_raw((value & 0xf) as u8)?;
    Ok((kind, typ))
}

pub fn pack_stream(kind: StreamKind, typ: StreamType) -> u64 {
    (u64::from(kind.into_raw()) << 4) | u64::from(typ.into_raw())
}
