use std::cell::RefCell;

use super::{AddressType, PAGE_SIZE};

/// One fixed-size chunk of queue storage. A page starts empty and only
/// grows by appends at its tail; bytes below the tail may be patched in
/// place for block-size back-fills.
pub struct Page {
    min_address: AddressType,
    buf: RefCell<Vec<u8>>,
}

impl Page {
    pub(crate) fn new(min_address: AddressType) -> Self {
        Self {
            min_address,
            buf: RefCell::new(Vec::with_capacity(PAGE_SIZE as usize)),
        }
    }

    pub fn min_address(&self) -> AddressType {
        self.min_address
    }

    /// One past the last written address of this page.
    pub fn max_address(&self) -> AddressType {
        self.min_address + self.buf.borrow().len() as AddressType
    }

    /// Address limit of this page, written or not.
    pub fn limit_address(&self) -> AddressType {
        self.min_address + PAGE_SIZE
    }

    pub fn len(&self) -> usize {
        self.buf.borrow().len()
    }

    pub fn is_full(&self) -> bool {
        self.len() == PAGE_SIZE as usize
    }

    pub fn contains(&self, address: AddressType) -> bool {
        address >= self.min_address && address < self.limit_address()
    }

    pub fn read(&self, address: AddressType) -> Option<u8> {
        let offset = address.checked_sub(self.min_address)? as usize;
        self.buf.borrow().get(offset).copied()
    }

    /// Overwrite an already-written byte.
    pub(crate) fn patch(&self, address: AddressType, value: u8) -> bool {
        let Some(offset) = address.checked_sub(self.min_address) else {
            return false;
        };
        let mut buf = self.buf.borrow_mut();
        match buf.get_mut(offset as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Append at the page tail. Returns false when the page is full.
    pub(crate) fn append(&self, value: u8) -> bool {
        let mut buf = self.buf.borrow_mut();
        if buf.len() == PAGE_SIZE as usize {
            return false;
        }
        buf.push(value);
        true
    }

    pub(crate) fn truncate(&self, new_max: AddressType) {
        let keep = new_max.saturating_sub(self.min_address) as usize;
        let mut buf = self.buf.borrow_mut();
        if keep < buf.len() {
            buf.truncate(keep);
        }
    }

    pub(crate) fn copy_out(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.buf.borrow());
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("min_address", &self.min_address)
            .field("len", &self.len())
            .finish()
    }
}
