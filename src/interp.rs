pub mod byte_input;
pub mod byte_output;
pub mod format;
pub mod int_stream;
pub mod interpreter;
pub mod selector;
pub mod state;
pub mod thrown;

pub use byte_input::ByteInput;
pub use byte_output::ByteOutput;
pub use format::IntTypeFormat;
pub use int_stream::{IntEntry, IntInput, IntOutput, IntStream, IntStreamRef};
pub use interpreter::Interpreter;
pub use selector::{AlgorithmSelector, DecompressSelector, PipelineState};
pub use state::{CallFrame, Method, Mode, State};
pub use thrown::{ThrowKind, Thrown};

use crate::ast::NodeKind;
use crate::stream::StreamType;
use crate::IntType;
use thrown::TResult;

/// Pull side of an interpreter: a positioned reader over some stream
/// granularity. Byte inputs decode the wire formats; int inputs hand
/// back already-decoded integers.
pub trait StreamInput {
    fn stream_type(&self) -> StreamType;

    /// Whether the dispatcher may take another step without risking a
    /// blocking read (at least a page buffered, or eof frozen).
    fn can_process_more_now(&mut self) -> bool;
    fn at_input_eof(&mut self) -> bool;
    fn at_input_eob(&mut self) -> bool;
    /// Pull more bytes from the backing source; false when exhausted.
    fn fill_more_input(&mut self) -> bool;

    fn push_peek_pos(&mut self);
    fn pop_peek_pos(&mut self) -> TResult<()>;
    fn peek_depth(&self) -> usize;

    fn read_u8(&mut self) -> TResult<u8>;
    fn read_u32(&mut self) -> TResult<u32>;
    fn read_u64(&mut self) -> TResult<u64>;
    fn read_varint32(&mut self) -> TResult<i32>;
    fn read_varint64(&mut self) -> TResult<i64>;
    fn read_varuint32(&mut self) -> TResult<u32>;
    fn read_varuint64(&mut self) -> TResult<u64>;
    fn read_bit(&mut self) -> TResult<u8>;
    fn read_bits(&mut self, count: u32) -> TResult<IntType>;
    fn align_to_byte(&mut self) -> TResult<()>;

    fn read_block_enter(&mut self) -> TResult<()>;
    fn read_block_exit(&mut self) -> TResult<()>;

    /// Decode one value in the format declared by an AST format node.
    /// `width` is the explicit bit width of one-arg format literals.
    fn read_value(&mut self, kind: NodeKind, width: Option<u32>) -> TResult<IntType> {
        match (kind, width) {
            (_, Some(width)) => self.read_bits(width),
            (NodeKind::Uint8, None) => Ok(IntType::from(self.read_u8()?)),
            (NodeKind::Uint32, None) => Ok(IntType::from(self.read_u32()?)),
            (NodeKind::Uint64, None) => self.read_u64(),
            (NodeKind::Varint32, None) => Ok(self.read_varint32()? as i64 as IntType),
            (NodeKind::Varint64, None) => Ok(self.read_varint64()? as IntType),
            (NodeKind::Varuint32, None) => Ok(IntType::from(self.read_varuint32()?)),
            (NodeKind::Varuint64, None) => self.read_varuint64(),
            (kind, None) => Err(Thrown::fatal(format!(
                "Read not defined for {}",
                kind.sexp_name()
            ))),
        }
    }

    fn read_header_value(&mut self, format: IntTypeFormat) -> TResult<IntType>;

    /// React to a predefined action while reading. Unknown actions are
    /// ignored (the writer side may still care).
    fn read_action(&mut self, action: IntType) -> TResult<bool>;

    /// Whether the whole input was consumed cleanly.
    fn processed_correctly(&mut self) -> bool;
}

/// Push side of an interpreter. Implementations include the byte
/// writer, the int-stream capture, and the AST inflater.
pub trait StreamOutput {
    fn stream_type(&self) -> StreamType;

    fn write_u8(&mut self, value: u8) -> TResult<()>;
    fn write_u32(&mut self, value: u32) -> TResult<()>;
    fn write_u64(&mut self, value: u64) -> TResult<()>;
    fn write_varint32(&mut self, value: i32) -> TResult<()>;
    fn write_varint64(&mut self, value: i64) -> TResult<()>;
    fn write_varuint32(&mut self, value: u32) -> TResult<()>;
    fn write_varuint64(&mut self, value: u64) -> TResult<()>;
    fn write_bit(&mut self, value: u8) -> TResult<()>;
    fn write_bits(&mut self, value: u64, count: u32) -> TResult<()>;
    fn align_to_byte(&mut self) -> TResult<()>;

    fn write_block_enter(&mut self) -> TResult<()>;
    fn write_block_exit(&mut self) -> TResult<()>;
    fn set_minimize_block_size(&mut self, _minimize: bool) {}

    fn write_value(&mut self, value: IntType, kind: NodeKind, width: Option<u32>) -> TResult<()> {
        match (kind, width) {
            (_, Some(width)) => self.write_bits(value, width),
            (NodeKind::Uint8, None) => self.write_u8(value as u8),
            (NodeKind::Uint32, None) => self.write_u32(value as u32),
            (NodeKind::Uint64, None) => self.write_u64(value),
            (NodeKind::Varint32, None) => self.write_varint32(value as i64 as i32),
            (NodeKind::Varint64, None) => self.write_varint64(value as i64),
            (NodeKind::Varuint32, None) => self.write_varuint32(value as u32),
            (NodeKind::Varuint64, None) => self.write_varuint64(value),
            (kind, None) => Err(Thrown::fatal(format!(
                "Write not defined for {}",
                kind.sexp_name()
            ))),
        }
    }

    fn write_header_value(&mut self, value: IntType, format: IntTypeFormat) -> TResult<()>;

    fn write_action(&mut self, action: IntType) -> TResult<bool>;

    fn write_freeze_eof(&mut self) -> TResult<()>;
}
