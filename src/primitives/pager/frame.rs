use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;

/// One cached page image.
///
/// A frame is pinned while any [`super::PageCursor`] holds a clone of its `Arc`.
pub struct Frame {
    pub buf: Arc<RwLock<Box<[u8]>>>,
    dirty: AtomicBool,
}

impl Frame {
    pub fn new(image: Box<[u8]>) -> Self {
        Self {
            buf: Arc::new(RwLock::new(image)),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, AtomicOrdering::Release);
    }

    /// Clears the dirty flag, returning whether it was set.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, AtomicOrdering::AcqRel)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(AtomicOrdering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_flag_is_consumed_once() {
        let frame = Frame::new(vec![0u8; 64].into_boxed_slice());
        assert!(!frame.is_dirty());
        frame.mark_dirty();
        assert!(frame.take_dirty());
        assert!(!frame.take_dirty());
    }
}
