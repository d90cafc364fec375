//! Block descriptors: one per live allocation.

use bitflags::bitflags;

/// Type-erased finalizer for a block's payload — the drop glue of the
/// allocated type, recorded at allocation time.
///
/// # Safety
///
/// Must be called at most once, with the payload address of a live,
/// initialized object of the type it was instantiated for.
pub(crate) type Finalizer = unsafe fn(*mut u8);

/// Finalizer of unused table slots.
pub(crate) unsafe fn finalize_nothing(_payload: *mut u8) {}

bitflags! {
    /// Per-block phase and status bits.
    ///
    /// The phase bits are compared against the collector's global phase
    /// toggle, so blocks untouched by a cycle need no per-cycle clearing.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct BlockFlags: u8 {
        /// Found reachable during the cycle matching the global phase.
        const MARK_PHASE = 1 << 0;
        /// Member chain already rewritten during the matching cycle.
        const ADJUST_PHASE = 1 << 1;
        /// Freshly allocated and not yet adopted by any handle. Locked
        /// blocks are treated as reachable and are never relocated.
        const LOCKED = 1 << 2;
        /// Explicitly destroyed; the finalizer already ran and the storage
        /// is reclaimed once no handle refers to it.
        const DELETED = 1 << 3;
    }
}

/// Descriptor of one live allocation.
#[derive(Clone, Copy)]
pub(crate) struct Block {
    /// Current payload address.
    pub object: *mut u8,
    /// Payload address planned for the next move pass.
    pub new_object: *mut u8,
    /// Chain offset (from the prefix word) of the first member handle;
    /// 0 means the object embeds none.
    pub ptrs: usize,
    /// Payload size in bytes, 8-aligned, excluding the prefix word.
    pub size: usize,
    /// Drop glue of the allocated type.
    pub finalizer: Finalizer,
    pub flags: BlockFlags,
}

impl Block {
    pub fn unused() -> Self {
        Self {
            object: core::ptr::null_mut(),
            new_object: core::ptr::null_mut(),
            ptrs: 0,
            size: 0,
            finalizer: finalize_nothing,
            flags: BlockFlags::empty(),
        }
    }

    #[inline(always)]
    pub fn locked(&self) -> bool {
        self.flags.contains(BlockFlags::LOCKED)
    }

    #[inline(always)]
    pub fn set_locked(&mut self, on: bool) {
        self.flags.set(BlockFlags::LOCKED, on);
    }

    #[inline(always)]
    pub fn deleted(&self) -> bool {
        self.flags.contains(BlockFlags::DELETED)
    }

    #[inline(always)]
    pub fn set_deleted(&mut self, on: bool) {
        self.flags.set(BlockFlags::DELETED, on);
    }

    #[inline(always)]
    pub fn mark_phase(&self) -> bool {
        self.flags.contains(BlockFlags::MARK_PHASE)
    }

    #[inline(always)]
    pub fn set_mark_phase(&mut self, phase: bool) {
        self.flags.set(BlockFlags::MARK_PHASE, phase);
    }

    #[inline(always)]
    pub fn adjust_phase(&self) -> bool {
        self.flags.contains(BlockFlags::ADJUST_PHASE)
    }

    #[inline(always)]
    pub fn set_adjust_phase(&mut self, phase: bool) {
        self.flags.set(BlockFlags::ADJUST_PHASE, phase);
    }
}
