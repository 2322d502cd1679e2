use super::format::IntTypeFormat;
use super::thrown::{TResult, Thrown};
use super::StreamOutput;
use crate::ast::PredefinedSym;
use crate::stream::{QueueRef, StreamType, WriteCursor, WriteFormats};
use crate::IntType;

/// Byte-granular output over a paged queue. Blocks reserve a
/// fixed-width size slot that gets back-patched at exit; with
/// minimization on, the slot shrinks to the minimal varuint and the
/// body slides back over the slack.
pub struct ByteOutput {
    pos: WriteCursor,
    /// Per open block: the size-slot cursor, then the body-start cursor.
    block_starts: Vec<WriteCursor>,
    minimize_block_size: bool,
}

impl ByteOutput {
    pub fn new(queue: QueueRef) -> Self {
        Self {
            pos: WriteCursor::new(queue),
            block_starts: Vec::new(),
            minimize_block_size: false,
        }
    }

    pub fn pos(&self) -> &WriteCursor {
        &self.pos
    }

    pub fn minimizing(&self) -> bool {
        self.minimize_block_size
    }
}

impl StreamOutput for ByteOutput {
    fn stream_type(&self) -> StreamType {
        StreamType::Byte
    }

    fn write_u8(&mut self, value: u8) -> TResult<()> {
        Ok(WriteFormats::write_u8(&mut self.pos, value)?)
    }

    fn write_u32(&mut self, value: u32) -> TResult<()> {
        Ok(WriteFormats::write_u32(&mut self.pos, value)?)
    }

    fn write_u64(&mut self, value: u64) -> TResult<()> {
        Ok(WriteFormats::write_u64(&mut self.pos, value)?)
    }

    fn write_varint32(&mut self, value: i32) -> TResult<()> {
        Ok(self.pos.write_varint32(value)?)
    }

    fn write_varint64(&mut self, value: i64) -> TResult<()> {
        Ok(self.pos.write_varint64(value)?)
    }

    fn write_varuint32(&mut self, value: u32) -> TResult<()> {
        Ok(self.pos.write_varuint32(value)?)
    }

    fn write_varuint64(&mut self, value: u64) -> TResult<()> {
        Ok(self.pos.write_varuint64(value)?)
    }

    fn write_bit(&mut self, value: u8) -> TResult<()> {
        Ok(self.pos.write_bit(value)?)
    }

    fn write_bits(&mut self, value: u64, count: u32) -> TResult<()> {
        Ok(self.pos.write_bits(value, count)?)
    }

    fn align_to_byte(&mut self) -> TResult<()> {
        self.pos.align_to_byte();
        Ok(())
    }

    fn write_block_enter(&mut self) -> TResult<()> {
        // Alignment first, in case bit encodings are in flight.
        self.pos.align_to_byte();
        self.block_starts.push(self.pos.clone());
        self.pos.write_fixed_leb128(0)?;
        self.block_starts.push(self.pos.clone());
        Ok(())
    }

    fn write_block_exit(&mut self) -> TResult<()> {
        self.pos.align_to_byte();
        let body_start = self
            .block_starts
            .pop()
            .ok_or_else(|| Thrown::fatal("Block exit without matching enter"))?;
        let mut size_slot = self
            .block_starts
            .pop()
            .ok_or_else(|| Thrown::fatal("Block exit without matching enter"))?;
        let body_size = self.pos.address() - body_start.address();
        let size = u32::try_from(body_size)
            .map_err(|_| Thrown::malformed(format!("Block size too large: {body_size}")))?;
        if !self.minimize_block_size {
            size_slot.write_fixed_leb128(size)?;
            return Ok(());
        }
        size_slot.write_varuint32(size)?;
        let slack = body_start.address() - size_slot.address();
        if slack > 0 {
            let end = self.pos.address();
            let queue = self.pos.queue().clone();
            queue.copy_within(body_start.address(), end, size_slot.address())?;
            queue.truncate(end - slack);
            self.pos.set_address(end - slack);
        }
        Ok(())
    }

    fn set_minimize_block_size(&mut self, minimize: bool) {
        self.minimize_block_size = minimize;
    }

    fn write_header_value(&mut self, value: IntType, format: IntTypeFormat) -> TResult<()> {
        match format {
            IntTypeFormat::Uint8 => self.write_u8(value as u8),
            IntTypeFormat::Uint32 => self.write_u32(value as u32),
            IntTypeFormat::Uint64 => self.write_u64(value),
            format => Err(Thrown::malformed(format!(
                "Header values cannot use format {}",
                format.name()
            ))),
        }
    }

    fn write_action(&mut self, action: IntType) -> TResult<bool> {
        let Ok(raw) = u32::try_from(action) else {
            return Ok(true);
        };
        match PredefinedSym::try_from(raw) {
            Ok(PredefinedSym::BlockEnter | PredefinedSym::BlockEnterWriteonly) => {
                self.write_block_enter()?;
                Ok(true)
            }
            Ok(PredefinedSym::BlockExit | PredefinedSym::BlockExitWriteonly) => {
                self.write_block_exit()?;
                Ok(true)
            }
            Ok(PredefinedSym::Align) => {
                self.align_to_byte()?;
                Ok(true)
            }
            // Read-only and structural actions emit no bytes.
            _ => Ok(true),
        }
    }

    fn write_freeze_eof(&mut self) -> TResult<()> {
        self.pos.freeze_eof();
        Ok(())
    }
}
