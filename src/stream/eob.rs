use std::cell::Cell;
use std::rc::Rc;

use super::{is_good_address, AddressType, MAX_EOF_ADDRESS, UNDEFINED_ADDRESS};

/// End-of-block address for a (possibly nested) sized block. The outermost
/// eob always spans the whole queue. Cursors hold the innermost eob of the
/// block they are reading; popping restores the enclosing one.
pub struct BlockEob {
    address: Cell<AddressType>,
    enclosing: Option<Rc<BlockEob>>,
}

impl BlockEob {
    /// The outermost eob, covering the entire queue.
    pub fn root() -> Rc<Self> {
        Rc::new(Self {
            address: Cell::new(MAX_EOF_ADDRESS),
            enclosing: None,
        })
    }

    pub fn nested(address: AddressType, enclosing: Rc<BlockEob>) -> Rc<Self> {
        debug_assert!(is_good_address(address));
        Rc::new(Self {
            address: Cell::new(address),
            enclosing: Some(enclosing),
        })
    }

    pub fn address(&self) -> AddressType {
        self.address.get()
    }

    pub fn set_address(&self, address: AddressType) {
        self.address.set(address);
    }

    pub fn is_good(&self) -> bool {
        is_good_address(self.address.get())
    }

    pub fn is_defined(&self) -> bool {
        self.address.get() != UNDEFINED_ADDRESS
    }

    /// Mark this eob bad. A failed eob poisons the enclosing eob on the
    /// next write that observes it.
    pub fn fail(&self) {
        self.address.set(UNDEFINED_ADDRESS);
    }

    /// Propagate failure outward.
    pub fn fail_enclosing(&self) {
        if let Some(enclosing) = &self.enclosing {
            enclosing.fail();
        }
    }

    pub fn enclosing(&self) -> Option<Rc<BlockEob>> {
        self.enclosing.clone()
    }
}

impl std::fmt::Debug for BlockEob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_good() {
            write!(f, "eob@{:#x}", self.address.get())
        } else {
            write!(f, "eob@failed")
        }
    }
}
