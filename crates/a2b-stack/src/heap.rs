use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use a2b_core::A2bError;

/// Byte budget backing every stack allocation.
///
/// Job queues, messages, and contexts each hold a [`HeapLease`]; dropping
/// the lease returns its bytes. With no limit set the heap only accounts.
pub struct Heap {
    limit: Cell<Option<usize>>,
    in_use: Cell<usize>,
    peak: Cell<usize>,
    live: Cell<usize>,
}

impl Heap {
    pub fn new(limit: Option<usize>) -> Rc<Self> {
        Rc::new(Self {
            limit: Cell::new(limit),
            in_use: Cell::new(0),
            peak: Cell::new(0),
            live: Cell::new(0),
        })
    }

    /// Reserves `size` bytes, failing with `AllocFailure` past the limit.
    pub fn try_alloc(self: &Rc<Self>, size: usize) -> Result<HeapLease, A2bError> {
        let next = self
            .in_use
            .get()
            .checked_add(size)
            .ok_or(A2bError::AllocFailure)?;
        if let Some(limit) = self.limit.get() {
            if next > limit {
                return Err(A2bError::AllocFailure);
            }
        }
        self.in_use.set(next);
        self.peak.set(self.peak.get().max(next));
        self.live.set(self.live.get() + 1);
        Ok(HeapLease {
            heap: Rc::clone(self),
            size,
        })
    }

    pub fn set_limit(&self, limit: Option<usize>) {
        self.limit.set(limit);
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit.get()
    }

    /// Bytes currently leased.
    pub fn in_use(&self) -> usize {
        self.in_use.get()
    }

    /// High-water mark of leased bytes.
    pub fn peak(&self) -> usize {
        self.peak.get()
    }

    /// Number of outstanding leases.
    pub fn live_allocations(&self) -> usize {
        self.live.get()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("limit", &self.limit.get())
            .field("in_use", &self.in_use.get())
            .field("peak", &self.peak.get())
            .field("live", &self.live.get())
            .finish()
    }
}

/// Bytes reserved from a [`Heap`], released on drop.
pub struct HeapLease {
    heap: Rc<Heap>,
    size: usize,
}

impl HeapLease {
    pub fn size(&self) -> usize {
        self.size
    }
}

impl fmt::Debug for HeapLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapLease").field("size", &self.size).finish()
    }
}

impl Drop for HeapLease {
    fn drop(&mut self) {
        self.heap.in_use.set(self.heap.in_use.get() - self.size);
        self.heap.live.set(self.heap.live.get() - 1);
    }
}
