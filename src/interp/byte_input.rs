use super::format::IntTypeFormat;
use super::thrown::{TResult, ThrowKind, Thrown};
use super::StreamInput;
use crate::ast::PredefinedSym;
use crate::stream::{QueueRef, ReadCursor, ReadFormats, StreamType, PAGE_SIZE};
use crate::IntType;

/// Byte-granular input over a paged queue. Peeks save whole cursors;
/// block actions read the leading size field and push a nested eob.
pub struct ByteInput {
    pos: ReadCursor,
    peek_stack: Vec<ReadCursor>,
    block_depth: usize,
}

impl ByteInput {
    pub fn new(queue: QueueRef) -> Self {
        Self {
            pos: ReadCursor::new(queue),
            peek_stack: Vec::new(),
            block_depth: 0,
        }
    }

    pub fn pos(&self) -> &ReadCursor {
        &self.pos
    }

    pub fn set_pos(&mut self, pos: ReadCursor) {
        self.pos = pos;
    }
}

impl StreamInput for ByteInput {
    fn stream_type(&self) -> StreamType {
        StreamType::Byte
    }

    fn can_process_more_now(&mut self) -> bool {
        let queue = self.pos.queue();
        queue.is_eof_frozen() || queue.available_from(self.pos.address()) >= PAGE_SIZE
    }

    fn at_input_eof(&mut self) -> bool {
        self.pos.at_eof()
    }

    fn at_input_eob(&mut self) -> bool {
        self.pos.at_eob()
    }

    fn fill_more_input(&mut self) -> bool {
        self.pos.queue().fill_from_source().unwrap_or(false)
    }

    fn push_peek_pos(&mut self) {
        self.peek_stack.push(self.pos.clone());
    }

    fn pop_peek_pos(&mut self) -> TResult<()> {
        match self.peek_stack.pop() {
            Some(saved) => {
                self.pos = saved;
                Ok(())
            }
            None => Err(Thrown::fatal("Peek position stack is empty")),
        }
    }

    fn peek_depth(&self) -> usize {
        self.peek_stack.len()
    }

    fn read_u8(&mut self) -> TResult<u8> {
        Ok(ReadFormats::read_u8(&mut self.pos)?)
    }

    fn read_u32(&mut self) -> TResult<u32> {
        Ok(ReadFormats::read_u32(&mut self.pos)?)
    }

    fn read_u64(&mut self) -> TResult<u64> {
        Ok(ReadFormats::read_u64(&mut self.pos)?)
    }

    fn read_varint32(&mut self) -> TResult<i32> {
        Ok(self.pos.read_varint32()?)
    }

    fn read_varint64(&mut self) -> TResult<i64> {
        Ok(self.pos.read_varint64()?)
    }

    fn read_varuint32(&mut self) -> TResult<u32> {
        Ok(self.pos.read_varuint32()?)
    }

    fn read_varuint64(&mut self) -> TResult<u64> {
        Ok(self.pos.read_varuint64()?)
    }

    fn read_bit(&mut self) -> TResult<u8> {
        Ok(self.pos.read_bit()?)
    }

    fn read_bits(&mut self, count: u32) -> TResult<IntType> {
        Ok(self.pos.read_bits(count)?)
    }

    fn align_to_byte(&mut self) -> TResult<()> {
        self.pos.align_to_byte();
        Ok(())
    }

    fn read_block_enter(&mut self) -> TResult<()> {
        self.pos.align_to_byte();
        let size = self.pos.read_varuint32()?;
        self.pos.push_eob(IntType::from(size));
        self.block_depth += 1;
        Ok(())
    }

    fn read_block_exit(&mut self) -> TResult<()> {
        if self.block_depth == 0 {
            return Err(Thrown::fatal("Block exit without matching enter"));
        }
        self.pos.align_to_byte();
        self.pos.pop_eob();
        self.block_depth -= 1;
        Ok(())
    }

    fn read_header_value(&mut self, format: IntTypeFormat) -> TResult<IntType> {
        match format {
            IntTypeFormat::Uint8 => Ok(IntType::from(StreamInput::read_u8(self)?)),
            IntTypeFormat::Uint32 => Ok(IntType::from(StreamInput::read_u32(self)?)),
            IntTypeFormat::Uint64 => StreamInput::read_u64(self),
            format => Err(Thrown::new(
                ThrowKind::MalformedInput,
                format!("Header values cannot use format {}", format.name()),
            )),
        }
    }

    fn read_action(&mut self, action: IntType) -> TResult<bool> {
        let Ok(raw) = u32::try_from(action) else {
            return Ok(true);
        };
        match PredefinedSym::try_from(raw) {
            Ok(PredefinedSym::BlockEnter | PredefinedSym::BlockEnterReadonly) => {
                self.read_block_enter()?;
                Ok(true)
            }
            Ok(PredefinedSym::BlockExit | PredefinedSym::BlockExitReadonly) => {
                self.read_block_exit()?;
                Ok(true)
            }
            Ok(PredefinedSym::Align) => {
                self.align_to_byte()?;
                Ok(true)
            }
            // Write-only and structural actions take no input bytes.
            _ => Ok(true),
        }
    }

    fn processed_correctly(&mut self) -> bool {
        self.block_depth == 0 && self.pos.at_eof()
    }
}
