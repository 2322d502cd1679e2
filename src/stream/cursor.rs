use std::rc::Rc;

use num_traits::{PrimInt, Unsigned};

use super::eob::BlockEob;
use super::page::Page;
use super::queue::QueueRef;
use super::{AddressType, StreamError};

/// Forward read position in a queue. Cursors are freely cloned; every
/// live cursor pins the page it points into.
#[derive(Clone)]
pub struct ReadCursor {
    queue: QueueRef,
    page: Option<Rc<Page>>,
    address: AddressType,
    /// Bits already consumed from the byte at `address` (0..8).
    bit: u32,
    eob: Rc<BlockEob>,
    /// Below this address `read_byte` can skip every eob/eof check.
    guaranteed_before_eob: AddressType,
}

impl ReadCursor {
    pub fn new(queue: QueueRef) -> Self {
        let mut cursor = Self {
            queue,
            page: None,
            address: 0,
            bit: 0,
            eob: BlockEob::root(),
            guaranteed_before_eob: 0,
        };
        cursor.update_guarantee();
        cursor
    }

    pub fn queue(&self) -> &QueueRef {
        &self.queue
    }

    pub fn address(&self) -> AddressType {
        self.address
    }

    pub fn eob_address(&self) -> AddressType {
        self.eob.address()
    }

    /// Push a nested end-of-block `size` bytes past the current position.
    pub fn push_eob(&mut self, size: AddressType) {
        let address = self.address + size;
        debug_assert!(address <= self.eob.address());
        self.eob = BlockEob::nested(address, Rc::clone(&self.eob));
        self.update_guarantee();
    }

    pub fn pop_eob(&mut self) {
        if let Some(enclosing) = self.eob.enclosing() {
            self.eob = enclosing;
        } else {
            debug_assert!(false, "pop_eob on the outermost eob");
        }
        self.update_guarantee();
    }

    fn update_guarantee(&mut self) {
        self.guaranteed_before_eob = self.eob.address().min(self.queue.size());
    }

    /// True when no byte remains before the current end-of-block. Blocks
    /// on the backing source if more bytes could still arrive.
    pub fn at_eob(&mut self) -> bool {
        if self.address < self.guaranteed_before_eob {
            return false;
        }
        let result = self.address >= self.eob.address() || !self.fill_to(self.address + 1);
        self.update_guarantee();
        result
    }

    pub fn at_eof(&self) -> bool {
        self.queue.is_eof_frozen() && self.address >= self.queue.eof_address()
    }

    /// Make sure addresses below `target` are buffered, pulling from the
    /// backing source when one exists.
    fn fill_to(&mut self, target: AddressType) -> bool {
        loop {
            if self.queue.size() >= target {
                return true;
            }
            if self.queue.is_eof_frozen() {
                return false;
            }
            match self.queue.fill_from_source() {
                Ok(true) => {}
                _ => return self.queue.size() >= target,
            }
        }
    }

    fn page_for(&mut self, address: AddressType) -> Result<Rc<Page>, StreamError> {
        if let Some(page) = &self.page {
            if page.contains(address) {
                return Ok(Rc::clone(page));
            }
        }
        let page = self
            .queue
            .page_at(address)
            .ok_or(StreamError::Retired(address))?;
        self.page = Some(Rc::clone(&page));
        Ok(page)
    }

    fn byte_at(&mut self, address: AddressType) -> Result<u8, StreamError> {
        let page = self.page_for(address)?;
        page.read(address).ok_or(StreamError::Retired(address))
    }

    fn check_readable(&mut self) -> Result<(), StreamError> {
        if self.address >= self.eob.address() {
            return Err(StreamError::PastEob);
        }
        if !self.fill_to(self.address + 1) {
            return Err(StreamError::PastEof);
        }
        self.update_guarantee();
        Ok(())
    }

    pub fn read_byte(&mut self) -> Result<u8, StreamError> {
        // Byte operations work on byte boundaries; a partially consumed
        // byte is discarded, mirroring the writer's zero padding.
        self.align_to_byte();
        if self.address >= self.guaranteed_before_eob {
            self.check_readable()?;
        }
        let byte = self.byte_at(self.address)?;
        self.address += 1;
        Ok(byte)
    }

    pub fn read_bit(&mut self) -> Result<u8, StreamError> {
        if self.address >= self.guaranteed_before_eob {
            self.check_readable()?;
        }
        let byte = self.byte_at(self.address)?;
        let value = (byte >> self.bit) & 1;
        self.bit += 1;
        if self.bit == 8 {
            self.bit = 0;
            self.address += 1;
        }
        Ok(value)
    }

    /// Read `count` bits, first bit in the least significant position.
    pub fn read_bits(&mut self, count: u32) -> Result<u64, StreamError> {
        debug_assert!(count <= 64);
        let mut value = 0u64;
        for index in 0..count {
            value |= u64::from(self.read_bit()?) << index;
        }
        Ok(value)
    }

    /// Discard any partially consumed byte.
    pub fn align_to_byte(&mut self) {
        if self.bit != 0 {
            self.bit = 0;
            self.address += 1;
        }
    }

    /// Try to move forward `distance` bytes; returns how far it got.
    pub fn advance(&mut self, distance: AddressType) -> AddressType {
        let limit = self.eob.address().min(self.queue.size());
        let moved = distance.min(limit.saturating_sub(self.address));
        self.address += moved;
        moved
    }

    /// Fill `buf` with as many bytes as remain before the eob; returns
    /// the count read. Crossing a retired page is an error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.align_to_byte();
        for (count, slot) in buf.iter_mut().enumerate() {
            if self.at_eob() {
                return Ok(count);
            }
            *slot = self.read_byte()?;
        }
        Ok(buf.len())
    }
}

impl std::fmt::Debug for ReadCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReadCursor@{:#x}+{} {:?}", self.address, self.bit, self.eob)
    }
}

/// Append/patch position in a queue.
#[derive(Clone)]
pub struct WriteCursor {
    queue: QueueRef,
    page: Option<Rc<Page>>,
    address: AddressType,
    /// Bits already written into the byte at `address` (0..8).
    bit: u32,
}

impl WriteCursor {
    pub fn new(queue: QueueRef) -> Self {
        let address = queue.size();
        Self {
            queue,
            page: None,
            address,
            bit: 0,
        }
    }

    pub fn queue(&self) -> &QueueRef {
        &self.queue
    }

    pub fn address(&self) -> AddressType {
        self.address
    }

    pub fn write_byte(&mut self, value: u8) -> Result<(), StreamError> {
        // Zero-pad any partial byte first so byte and bit writes can
        // interleave; the reader discards the same padding.
        self.align_to_byte();
        if self.address == self.queue.size() {
            let page = self.queue.append_byte(value)?;
            self.page = Some(page);
        } else {
            self.queue.patch_byte(self.address, value)?;
        }
        self.address += 1;
        Ok(())
    }

    pub fn write_bit(&mut self, value: u8) -> Result<(), StreamError> {
        let value = value & 1;
        if self.bit == 0 {
            if self.address == self.queue.size() {
                let page = self.queue.append_byte(value)?;
                self.page = Some(page);
            } else {
                self.queue.patch_byte(self.address, value)?;
            }
        } else {
            let old = self
                .queue
                .read_byte_at(self.address)
                .map_err(|_| StreamError::Retired(self.address))?;
            self.queue
                .patch_byte(self.address, old | (value << self.bit))?;
        }
        self.bit += 1;
        if self.bit == 8 {
            self.bit = 0;
            self.address += 1;
        }
        Ok(())
    }

    /// Write `count` bits, least significant bit first.
    pub fn write_bits(&mut self, value: u64, count: u32) -> Result<(), StreamError> {
        debug_assert!(count <= 64);
        for index in 0..count {
            self.write_bit(((value >> index) & 1) as u8)?;
        }
        Ok(())
    }

    /// Zero-pad out any partially written byte.
    pub fn align_to_byte(&mut self) {
        if self.bit != 0 {
            self.bit = 0;
            self.address += 1;
        }
    }

    pub fn freeze_eof(&mut self) {
        self.align_to_byte();
        self.queue.freeze_eof();
    }

    pub fn swap(&mut self, other: &mut WriteCursor) {
        std::mem::swap(self, other);
    }

    /// Reposition the cursor; only byte-aligned jumps are meaningful.
    pub fn set_address(&mut self, address: AddressType) {
        debug_assert_eq!(self.bit, 0);
        self.address = address;
        self.page = None;
    }

    /// Discard everything written at or after this cursor.
    pub fn truncate_here(&mut self) {
        debug_assert_eq!(self.bit, 0);
        self.queue.truncate(self.address);
    }
}

impl std::fmt::Debug for WriteCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "WriteCursor@{:#x}+{}{}",
            self.address,
            self.bit,
            if self.page.is_some() { " pinned" } else { "" }
        )
    }
}

fn leb_chunks(bits: u32) -> u32 {
    bits.div_ceil(7)
}

/// Bit-exact decoders for the integer formats of §4.2. The `var*`
/// variants are LEB128 with seven payload bits per byte.
pub trait ReadFormats {
    fn read_leb128<T: PrimInt + Unsigned>(&mut self) -> Result<T, StreamError>;
    fn read_signed_leb128(&mut self, bits: u32) -> Result<i64, StreamError>;

    fn read_u8(&mut self) -> Result<u8, StreamError>;
    fn read_fixed_le<T: PrimInt + Unsigned>(&mut self) -> Result<T, StreamError>;

    fn read_u32(&mut self) -> Result<u32, StreamError> {
        self.read_fixed_le::<u32>()
    }

    fn read_u64(&mut self) -> Result<u64, StreamError> {
        self.read_fixed_le::<u64>()
    }

    fn read_varuint32(&mut self) -> Result<u32, StreamError> {
        self.read_leb128::<u32>()
    }

    fn read_varuint64(&mut self) -> Result<u64, StreamError> {
        self.read_leb128::<u64>()
    }

    fn read_varint32(&mut self) -> Result<i32, StreamError> {
        Ok(self.read_signed_leb128(32)? as i32)
    }

    fn read_varint64(&mut self) -> Result<i64, StreamError> {
        self.read_signed_leb128(64)
    }
}

impl ReadFormats for ReadCursor {
    fn read_leb128<T: PrimInt + Unsigned>(&mut self) -> Result<T, StreamError> {
        let bits = T::zero().count_zeros();
        let mut value = T::zero();
        let mut shift = 0u32;
        loop {
            let chunk = self.read_byte()?;
            let data = chunk & 0x7f;
            if shift >= bits {
                return Err(StreamError::Overlong);
            }
            if shift + 7 > bits && u32::from(data) >> (bits - shift) != 0 {
                return Err(StreamError::Overlong);
            }
            let data = T::from(data).ok_or(StreamError::Overlong)?;
            value = value | (data << shift as usize);
            if chunk & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn read_signed_leb128(&mut self, bits: u32) -> Result<i64, StreamError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let chunk = self.read_byte()?;
            if shift >= leb_chunks(bits) * 7 {
                return Err(StreamError::Overlong);
            }
            value |= u64::from(chunk & 0x7f) << shift;
            shift += 7;
            if chunk & 0x80 == 0 {
                if chunk & 0x40 != 0 && shift < 64 {
                    value |= !0u64 << shift;
                }
                return Ok(value as i64);
            }
        }
    }

    fn read_u8(&mut self) -> Result<u8, StreamError> {
        self.read_byte()
    }

    fn read_fixed_le<T: PrimInt + Unsigned>(&mut self) -> Result<T, StreamError> {
        let bytes = T::zero().count_zeros() / 8;
        let mut value = T::zero();
        for index in 0..bytes {
            let byte = T::from(self.read_byte()?).ok_or(StreamError::Overlong)?;
            value = value | (byte << (index * 8) as usize);
        }
        Ok(value)
    }
}

/// Bit-exact encoders mirroring [`ReadFormats`].
pub trait WriteFormats {
    fn write_leb128<T: PrimInt + Unsigned>(&mut self, value: T) -> Result<(), StreamError>;
    fn write_signed_leb128(&mut self, value: i64) -> Result<(), StreamError>;
    /// LEB128 padded out to exactly `ceil(bits/7)` bytes; reserved for
    /// block sizes that get back-patched later.
    fn write_fixed_leb128(&mut self, value: u32) -> Result<(), StreamError>;

    fn write_u8(&mut self, value: u8) -> Result<(), StreamError>;
    fn write_fixed_le<T: PrimInt + Unsigned>(&mut self, value: T) -> Result<(), StreamError>;

    fn write_u32(&mut self, value: u32) -> Result<(), StreamError> {
        self.write_fixed_le(value)
    }

    fn write_u64(&mut self, value: u64) -> Result<(), StreamError> {
        self.write_fixed_le(value)
    }

    fn write_varuint32(&mut self, value: u32) -> Result<(), StreamError> {
        self.write_leb128(value)
    }

    fn write_varuint64(&mut self, value: u64) -> Result<(), StreamError> {
        self.write_leb128(value)
    }

    fn write_varint32(&mut self, value: i32) -> Result<(), StreamError> {
        self.write_signed_leb128(i64::from(value))
    }

    fn write_varint64(&mut self, value: i64) -> Result<(), StreamError> {
        self.write_signed_leb128(value)
    }
}

impl WriteFormats for WriteCursor {
    fn write_leb128<T: PrimInt + Unsigned>(&mut self, mut value: T) -> Result<(), StreamError> {
        let mask = T::from(0x7f).ok_or(StreamError::Overlong)?;
        loop {
            let byte = (value & mask).to_u8().ok_or(StreamError::Overlong)?;
            value = value >> 7;
            if value == T::zero() {
                return self.write_byte(byte);
            }
            self.write_byte(byte | 0x80)?;
        }
    }

    fn write_signed_leb128(&mut self, mut value: i64) -> Result<(), StreamError> {
        let negative = value < 0;
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let done = if negative {
                value == -1 && byte & 0x40 != 0
            } else {
                value == 0 && byte & 0x40 == 0
            };
            if done {
                return self.write_byte(byte);
            }
            self.write_byte(byte | 0x80)?;
        }
    }

    fn write_fixed_leb128(&mut self, mut value: u32) -> Result<(), StreamError> {
        let chunks = leb_chunks(32);
        for index in 0..chunks {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if index + 1 == chunks {
                self.write_byte(byte)?;
            } else {
                self.write_byte(byte | 0x80)?;
            }
        }
        Ok(())
    }

    fn write_u8(&mut self, value: u8) -> Result<(), StreamError> {
        self.write_byte(value)
    }

    fn write_fixed_le<T: PrimInt + Unsigned>(&mut self, value: T) -> Result<(), StreamError> {
        let bytes = T::zero().count_zeros() / 8;
        let mask = T::from(0xff).ok_or(StreamError::Overlong)?;
        for index in 0..bytes {
            let byte = ((value >> (index * 8) as usize) & mask)
                .to_u8()
                .ok_or(StreamError::Overlong)?;
            self.write_byte(byte)?;
        }
        Ok(())
    }
}
