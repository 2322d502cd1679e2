use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::rc::Rc;

use super::page::Page;
use super::{AddressType, StreamError, MAX_EOF_ADDRESS, PAGE_SIZE, PAGE_SIZE_LOG2};

pub type QueueRef = Rc<Queue>;

/// Growable in-memory byte stream, stored as a chain of fixed-size pages.
///
/// Addresses are virtual: they start at 0 and stay valid for the lifetime
/// of the queue even after leading pages are retired. A page is retired
/// only when it is full, no cursor pins it (cursors hold an `Rc` to their
/// page), and a backing sink has consumed it. Without a sink the queue
/// keeps everything buffered.
pub struct Queue {
    inner: RefCell<QueueInner>,
}

struct QueueInner {
    pages: VecDeque<Rc<Page>>,
    /// Next append address; also the current queue size.
    size: AddressType,
    /// Lowest address still buffered.
    first_address: AddressType,
    eof_frozen: bool,
    eof_address: AddressType,
    /// Retired pages are spilled here before being dropped.
    sink: Option<Box<dyn Write>>,
    /// Backfill source for pull-style reading.
    source: Option<Box<dyn Read>>,
    /// Addresses below this have been handed to the sink.
    spilled: AddressType,
}

impl Queue {
    pub fn new() -> QueueRef {
        Self::build(None, None)
    }

    /// Queue whose retired pages spill into `sink`. Call [`Queue::flush`]
    /// once writing is done to push the unretired tail out as well.
    pub fn write_backed(sink: Box<dyn Write>) -> QueueRef {
        Self::build(Some(sink), None)
    }

    /// Queue lazily filled from `source`. Reaching the end of the source
    /// freezes the eof.
    pub fn read_backed(source: Box<dyn Read>) -> QueueRef {
        Self::build(None, Some(source))
    }

    fn build(sink: Option<Box<dyn Write>>, source: Option<Box<dyn Read>>) -> QueueRef {
        Rc::new(Self {
            inner: RefCell::new(QueueInner {
                pages: VecDeque::new(),
                size: 0,
                first_address: 0,
                eof_frozen: false,
                eof_address: MAX_EOF_ADDRESS,
                sink,
                source,
                spilled: 0,
            }),
        })
    }

    /// Build an already-frozen queue holding `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> QueueRef {
        let queue = Self::new();
        for &byte in bytes {
            // A fresh in-memory queue accepts every append.
            if queue.append_byte(byte).is_err() {
                break;
            }
        }
        queue.freeze_eof();
        queue
    }

    pub fn size(&self) -> AddressType {
        self.inner.borrow().size
    }

    pub fn first_address(&self) -> AddressType {
        self.inner.borrow().first_address
    }

    pub fn is_eof_frozen(&self) -> bool {
        self.inner.borrow().eof_frozen
    }

    pub fn eof_address(&self) -> AddressType {
        self.inner.borrow().eof_address
    }

    /// Freeze the eof at the current size. All later writes fail.
    pub fn freeze_eof(&self) {
        let mut inner = self.inner.borrow_mut();
        if !inner.eof_frozen {
            inner.eof_frozen = true;
            inner.eof_address = inner.size;
        }
    }

    /// The page holding `address`, if still buffered.
    pub fn page_at(&self, address: AddressType) -> Option<Rc<Page>> {
        let inner = self.inner.borrow();
        let first = inner.pages.front()?;
        let first_index = first.min_address() >> PAGE_SIZE_LOG2;
        let index = (address >> PAGE_SIZE_LOG2).checked_sub(first_index)?;
        let page = inner.pages.get(index as usize)?;
        page.contains(address).then(|| Rc::clone(page))
    }

    pub(crate) fn append_byte(&self, value: u8) -> Result<Rc<Page>, StreamError> {
        let mut inner = self.inner.borrow_mut();
        if inner.eof_frozen {
            return Err(StreamError::Frozen);
        }
        let needs_page = match inner.pages.back() {
            Some(last) => last.is_full(),
            None => true,
        };
        if needs_page {
            let min_address = inner.size;
            debug_assert_eq!(min_address % PAGE_SIZE, 0);
            inner.retire_front_pages()?;
            inner.pages.push_back(Rc::new(Page::new(min_address)));
        }
        let Some(page) = inner.pages.back() else {
            return Err(StreamError::Retired(inner.size));
        };
        let page = Rc::clone(page);
        if !page.append(value) {
            return Err(StreamError::Retired(inner.size));
        }
        inner.size += 1;
        Ok(page)
    }

    /// Overwrite an already-written byte (block-size back-patching).
    pub(crate) fn patch_byte(&self, address: AddressType, value: u8) -> Result<(), StreamError> {
        let page = self.page_at(address).ok_or(StreamError::Retired(address))?;
        if page.patch(address, value) {
            Ok(())
        } else {
            Err(StreamError::Retired(address))
        }
    }

    pub fn read_byte_at(&self, address: AddressType) -> Result<u8, StreamError> {
        if address >= self.size() {
            return Err(if self.is_eof_frozen() {
                StreamError::PastEof
            } else {
                StreamError::Retired(address)
            });
        }
        let page = self.page_at(address).ok_or(StreamError::Retired(address))?;
        page.read(address).ok_or(StreamError::Retired(address))
    }

    /// Copy `[src_begin, src_end)` down to `dst_begin`. Used when a
    /// minimized block size leaves slack before the block body.
    pub(crate) fn copy_within(
        &self,
        src_begin: AddressType,
        src_end: AddressType,
        dst_begin: AddressType,
    ) -> Result<(), StreamError> {
        debug_assert!(dst_begin <= src_begin);
        let mut dst = dst_begin;
        for src in src_begin..src_end {
            let byte = self.read_byte_at(src)?;
            self.patch_byte(dst, byte)?;
            dst += 1;
        }
        Ok(())
    }

    /// Drop everything at or above `new_size`.
    pub(crate) fn truncate(&self, new_size: AddressType) {
        let mut inner = self.inner.borrow_mut();
        if new_size >= inner.size {
            return;
        }
        while let Some(last) = inner.pages.back() {
            if last.min_address() >= new_size {
                inner.pages.pop_back();
            } else {
                last.truncate(new_size);
                break;
            }
        }
        inner.size = new_size;
    }

    /// Pull more bytes from the backing source. Returns false once the
    /// source is exhausted (which freezes the eof).
    pub fn fill_from_source(&self) -> Result<bool, StreamError> {
        let mut chunk = [0u8; 4096];
        let got = {
            let mut inner = self.inner.borrow_mut();
            if inner.eof_frozen {
                return Ok(false);
            }
            let Some(source) = inner.source.as_mut() else {
                // Not read-backed, writers freeze it explicitly.
                return Ok(false);
            };
            source.read(&mut chunk).map_err(|_| StreamError::Source)?
        };
        if got == 0 {
            self.freeze_eof();
            return Ok(false);
        }
        for &byte in &chunk[..got] {
            self.append_byte(byte)?;
        }
        Ok(true)
    }

    /// Number of buffered bytes at or above `address`.
    pub fn available_from(&self, address: AddressType) -> AddressType {
        self.size().saturating_sub(address)
    }

    /// Spill every still-buffered byte into the sink. A no-op without one.
    pub fn flush(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.borrow_mut();
        inner.spill_through(AddressType::MAX)
    }

    /// Collect the whole buffered contents, for in-memory consumers.
    pub fn to_bytes(&self) -> Vec<u8> {
        let inner = self.inner.borrow();
        let mut out = Vec::with_capacity(inner.size as usize);
        for page in &inner.pages {
            page.copy_out(&mut out);
        }
        out
    }
}

impl QueueInner {
    /// Retire leading pages that are full, unpinned, and spilled.
    fn retire_front_pages(&mut self) -> Result<(), StreamError> {
        if self.sink.is_none() {
            return Ok(());
        }
        while let Some(front) = self.pages.front() {
            if !front.is_full() || Rc::strong_count(front) != 1 {
                break;
            }
            let max = front.max_address();
            self.spill_through(max)?;
            self.first_address = max;
            self.pages.pop_front();
        }
        Ok(())
    }

    fn spill_through(&mut self, limit: AddressType) -> Result<(), StreamError> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        let mut scratch = Vec::new();
        for page in &self.pages {
            if page.min_address() >= limit {
                break;
            }
            if page.max_address() <= self.spilled {
                continue;
            }
            scratch.clear();
            page.copy_out(&mut scratch);
            let skip = self.spilled.saturating_sub(page.min_address()) as usize;
            let take = (limit.min(page.max_address()) - page.min_address()) as usize;
            sink.write_all(&scratch[skip..take])
                .map_err(|_| StreamError::Source)?;
            self.spilled = page.min_address() + take as AddressType;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Queue")
            .field("size", &inner.size)
            .field("first_address", &inner.first_address)
            .field("eof_frozen", &inner.eof_frozen)
            .field("pages", &inner.pages.len())
            .finish()
    }
}
