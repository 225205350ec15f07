//! Per-thread scratch buffers.
//!
//! Each thread owns two pages, one for payload data and one for the offset
//! table. They are allocated on first use, never shared, and their contents
//! are overwritten by the next call on the same thread.

use std::cell::{Cell, RefCell};
use std::fmt;

use crate::error::{IoctlError, Result};

/// Capacity of each scratch buffer in bytes (about one page).
pub const SCRATCH_CAPACITY: usize = 2048;

#[repr(C, align(64))]
struct ScratchPage([u8; SCRATCH_CAPACITY]);

/// Logical slot of a scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchSlot {
    Payload,
    Offsets,
}

impl fmt::Display for ScratchSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScratchSlot::Payload => f.write_str("payload"),
            ScratchSlot::Offsets => f.write_str("offsets"),
        }
    }
}

/// Lazily allocated scratch storage for one slot.
pub(crate) struct Scratch {
    page: Option<Box<ScratchPage>>,
}

thread_local! {
    static PAYLOAD_SCRATCH: RefCell<Scratch> = const { RefCell::new(Scratch { page: None }) };
    static OFFSETS_SCRATCH: RefCell<Scratch> = const { RefCell::new(Scratch { page: None }) };
    static ALLOCATIONS: Cell<usize> = const { Cell::new(0) };
}

impl Scratch {
    /// Borrow the first `len` bytes of the page, allocating it if needed.
    ///
    /// Fails closed when `len` exceeds [`SCRATCH_CAPACITY`]; nothing is
    /// allocated in that case.
    pub(crate) fn stage(&mut self, len: usize) -> Result<&mut [u8]> {
        if len > SCRATCH_CAPACITY {
            return Err(IoctlError::ScratchBufferOverrun {
                requested: len,
                capacity: SCRATCH_CAPACITY,
            });
        }
        let page = self.page.get_or_insert_with(|| {
            ALLOCATIONS.with(|n| n.set(n.get() + 1));
            Box::new(ScratchPage([0; SCRATCH_CAPACITY]))
        });
        Ok(&mut page.0[..len])
    }
}

/// Run `f` with exclusive access to this thread's scratch buffer for `slot`.
///
/// Not reentrant: asking for a slot that is already held further up the
/// same thread's stack fails with [`IoctlError::Reentrant`].
pub(crate) fn with_slot<R>(
    slot: ScratchSlot,
    f: impl FnOnce(&mut Scratch) -> Result<R>,
) -> Result<R> {
    let key = match slot {
        ScratchSlot::Payload => &PAYLOAD_SCRATCH,
        ScratchSlot::Offsets => &OFFSETS_SCRATCH,
    };
    key.with(|cell| {
        let mut scratch = cell
            .try_borrow_mut()
            .map_err(|_| IoctlError::Reentrant { slot })?;
        f(&mut scratch)
    })
}

/// Number of scratch pages allocated so far on the calling thread.
pub fn thread_allocations() -> usize {
    ALLOCATIONS.with(Cell::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_allocation_once_per_slot() {
        let before = thread_allocations();
        with_slot(ScratchSlot::Payload, |s| s.stage(16).map(|_| ())).unwrap();
        with_slot(ScratchSlot::Payload, |s| s.stage(SCRATCH_CAPACITY).map(|_| ())).unwrap();
        assert_eq!(thread_allocations(), before + 1);

        with_slot(ScratchSlot::Offsets, |s| s.stage(8).map(|_| ())).unwrap();
        assert_eq!(thread_allocations(), before + 2);
    }

    #[test]
    fn test_overrun_does_not_allocate() {
        let before = thread_allocations();
        let err = with_slot(ScratchSlot::Offsets, |s| s.stage(SCRATCH_CAPACITY + 1).map(|_| ()));
        assert_eq!(
            err,
            Err(IoctlError::ScratchBufferOverrun {
                requested: SCRATCH_CAPACITY + 1,
                capacity: SCRATCH_CAPACITY,
            })
        );
        assert_eq!(thread_allocations(), before);
    }

    #[test]
    fn test_staged_view_is_aligned() {
        with_slot(ScratchSlot::Payload, |s| {
            let view = s.stage(32)?;
            assert_eq!(view.len(), 32);
            assert_eq!(view.as_ptr() as usize % 64, 0);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_nested_slot_is_reentrant_error() {
        let inner = with_slot(ScratchSlot::Payload, |_| {
            Ok(with_slot(ScratchSlot::Payload, |_| Ok(())))
        })
        .unwrap();
        assert_eq!(
            inner,
            Err(IoctlError::Reentrant {
                slot: ScratchSlot::Payload
            })
        );

        // Different slots nest, and the slot is free again afterwards.
        with_slot(ScratchSlot::Offsets, |_| with_slot(ScratchSlot::Payload, |_| Ok(()))).unwrap();
        with_slot(ScratchSlot::Payload, |_| Ok(())).unwrap();
    }
}
