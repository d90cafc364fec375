//! The collected heap: allocation, handle registration, and the
//! mark-adjust-move collector.
//!
//! Objects are bump-allocated out of a fixed arena, one block-table entry
//! per allocation. A collection is four passes over that table:
//!
//! 1. **mark** — flip the global phase bit, then walk the object graph
//!    from the root set, following each block's member-pointer chain.
//! 2. **plan** — compact the table in allocation order, assign every
//!    surviving block its post-move address, and finalize garbage.
//! 3. **adjust** — rewrite every reachable handle (roots and members) to
//!    its referent's planned address. Chain traversal still reads the old
//!    payload addresses, which the move pass has not yet overwritten.
//! 4. **move** — slide surviving payloads down to their planned addresses
//!    and restore `free_index` to the live high-water mark.
//!
//! A freshly allocated block is *locked* until a handle adopts it, which
//! keeps a collection triggered between allocation and first assignment
//! from sweeping the object. Locked blocks are treated as reachable and
//! are never relocated; the plan pass steps the relocation cursor past
//! them so sliding survivors cannot land on pinned storage.
//!
//! All state lives behind one process-wide recursive lock. Finalizers run
//! during the plan pass with that lock already held; they may construct,
//! copy, and drop handles, but must not allocate or collect, and must not
//! store references to the object being finalized.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use object::{GcField, Managed, RawHandle};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::arena::{Arena, WORD, align8, block_index_of, set_block_index};
use crate::block::{Block, BlockFlags, Finalizer};
use crate::roots::RootPool;

// ── Settings ──────────────────────────────────────────────────────────

/// Configuration for a collected heap.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Total arena size in bytes. Must be a multiple of 8.
    pub arena_bytes: usize,
    /// Capacity of the block table (one entry per live allocation).
    pub max_blocks: usize,
    /// Capacity of the root pool, sentinel node included.
    pub max_roots: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            arena_bytes: 64 * 1024 * 1024, // 64 MiB
            max_blocks: 262_144,
            max_roots: 262_144,
        }
    }
}

impl HeapSettings {
    fn validate(&self) -> Result<(), &'static str> {
        if self.arena_bytes == 0 || self.arena_bytes % 8 != 0 {
            return Err("arena_bytes must be a non-zero multiple of 8");
        }
        if self.max_blocks == 0 {
            return Err("max_blocks must be > 0");
        }
        if self.max_roots < 2 {
            return Err("max_roots must cover the sentinel and one node");
        }
        if self.max_blocks > (1 << 31) || self.max_roots > (1 << 31) {
            return Err("table capacities exceed the handle index range");
        }
        Ok(())
    }
}

// ── Stats ─────────────────────────────────────────────────────────────

/// Collection statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    /// Completed collections.
    pub collections: usize,
    /// Cumulative bytes reclaimed.
    pub freed_bytes: usize,
    /// Live bytes after the most recent collection, prefix words included.
    pub live_bytes: usize,
    /// Live blocks after the most recent collection.
    pub live_blocks: usize,
}

// ── Heap state ────────────────────────────────────────────────────────

pub(crate) struct HeapState {
    arena: Arena,
    blocks: Box<[Block]>,
    block_count: usize,
    roots: RootPool,
    /// Global phase toggle. A block whose phase bits differ from this was
    /// not visited by the current cycle.
    phase: bool,
    stats: HeapStats,
}

struct HeapShared {
    /// Process-wide recursive lock. Recursive so finalizers invoked by the
    /// plan pass can re-enter handle operations.
    lock: ReentrantMutex<()>,
    state: UnsafeCell<HeapState>,
}

// SAFETY: every access to `state` happens while `lock` is held; the lock
// serializes all threads and re-entry stays on the owning thread.
unsafe impl Send for HeapShared {}
// SAFETY: as above.
unsafe impl Sync for HeapShared {}

impl Drop for HeapShared {
    fn drop(&mut self) {
        let _guard = self.lock.lock();
        let state = self.state.get();
        // Finalize in reverse allocation order so parents run before the
        // storage of objects allocated after them is released.
        // SAFETY: last owner, lock held; blocks hold initialized payloads.
        unsafe {
            for i in (0..(*state).block_count).rev() {
                let block = (*state).blocks[i];
                if !block.deleted() {
                    (block.finalizer)(block.object);
                }
            }
            (*state).block_count = 0;
        }
    }
}

/// The collected heap. Cheap to clone; all clones share one arena.
///
/// Exactly one heap should exist per address space at a time: block prefix
/// words hold absolute table indices, so handles must never cross heaps.
#[derive(Clone)]
pub struct Heap {
    inner: Arc<HeapShared>,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Self {
        settings.validate().expect("invalid heap settings");
        let state = HeapState {
            arena: Arena::new(settings.arena_bytes),
            blocks: vec![Block::unused(); settings.max_blocks]
                .into_boxed_slice(),
            block_count: 0,
            roots: RootPool::new(settings.max_roots),
            phase: false,
            stats: HeapStats::default(),
        };
        Self {
            inner: Arc::new(HeapShared {
                lock: ReentrantMutex::new(()),
                state: UnsafeCell::new(state),
            }),
        }
    }

    /// Acquire the heap lock and return the raw state pointer.
    ///
    /// The pointer is valid for the lifetime of the guard. Internal code
    /// re-derives references from it instead of holding borrows across
    /// calls into user code, since finalizers re-enter through the
    /// recursive lock.
    fn enter(&self) -> (ReentrantMutexGuard<'_, ()>, *mut HeapState) {
        let guard = self.inner.lock.lock();
        (guard, self.inner.state.get())
    }

    /// Allocate `value` and adopt it with a fresh root handle.
    ///
    /// Runs a collection when the block table or the arena is exhausted;
    /// returns `None` when space still cannot be found afterwards.
    pub fn allocate<T: Managed>(&self, value: T) -> Option<Gc<T>> {
        let (_guard, state) = self.enter();
        // SAFETY: lock held; the payload is written before any operation
        // that could observe it.
        unsafe {
            let payload =
                allocate_block(state, size_of::<T>(), finalize::<T>)?;
            payload.cast::<T>().as_ptr().write(value);
            thread_members::<T>(state, payload.as_ptr());
            let slot = register_root(state, payload.as_ptr());
            unlock_block(state, payload.as_ptr());
            Some(Gc {
                heap: self.clone(),
                slot,
                _marker: PhantomData,
            })
        }
    }

    /// Allocate `value` without adopting it. The block stays locked — it
    /// survives collections pinned in place — until a handle takes custody
    /// via [`Heap::adopt`], [`Gc::set_ptr`] or [`Heap::store_ptr`].
    pub fn allocate_raw<T: Managed>(&self, value: T) -> Option<NonNull<T>> {
        let (_guard, state) = self.enter();
        // SAFETY: lock held.
        unsafe {
            let payload =
                allocate_block(state, size_of::<T>(), finalize::<T>)?;
            payload.cast::<T>().as_ptr().write(value);
            thread_members::<T>(state, payload.as_ptr());
            Some(payload.cast())
        }
    }

    /// Adopt a payload with a fresh root handle, clearing its allocation
    /// lock.
    ///
    /// # Safety
    ///
    /// `payload` must point at a live payload of this heap.
    pub unsafe fn adopt<T>(&self, payload: NonNull<T>) -> Gc<T> {
        let (_guard, state) = self.enter();
        // SAFETY: lock held; payload per contract.
        unsafe {
            let slot = register_root(state, payload.as_ptr().cast());
            unlock_block(state, payload.as_ptr().cast());
            Gc {
                heap: self.clone(),
                slot,
                _marker: PhantomData,
            }
        }
    }

    /// Finalize the object at `payload` now and mark its block deleted.
    /// The storage is reclaimed by the next collection at which no handle
    /// refers to it. Destroying an already destroyed object is a no-op.
    ///
    /// # Safety
    ///
    /// `payload` must point at a payload of this heap, and the object must
    /// not be accessed through any handle afterwards.
    pub unsafe fn destroy(&self, payload: NonNull<u8>) {
        let (_guard, state) = self.enter();
        // SAFETY: lock held; payload per contract.
        unsafe {
            let index = block_index_of(payload.as_ptr());
            let block = (*state).blocks[index];
            if block.deleted() {
                return;
            }
            (*state).blocks[index].set_deleted(true);
            (block.finalizer)(block.object);
        }
    }

    /// Run a full collection. Returns the number of bytes reclaimed.
    pub fn collect(&self) -> usize {
        let (_guard, state) = self.enter();
        // SAFETY: lock held.
        unsafe { collect_in(state) }
    }

    /// Store the referent of `value` into `field`.
    pub fn store<T>(&self, field: &GcField<T>, value: &Gc<T>) {
        let (_guard, state) = self.enter();
        // SAFETY: lock held; `value`'s slot stays registered while it lives.
        unsafe {
            field
                .raw()
                .set_object((*state).roots.handle(value.slot).object());
        }
    }

    /// Store a raw payload into `field`, clearing the target block's
    /// allocation lock: custody passes to the handle graph.
    ///
    /// # Safety
    ///
    /// `ptr`, when `Some`, must be a live payload of this heap.
    pub unsafe fn store_ptr<T>(
        &self,
        field: &GcField<T>,
        ptr: Option<NonNull<T>>,
    ) {
        let (_guard, state) = self.enter();
        match ptr {
            Some(p) => {
                // SAFETY: lock held; payload per contract.
                unsafe { unlock_block(state, p.as_ptr().cast()) };
                field.raw().set_object(p.as_ptr().cast());
            }
            None => field.raw().set_object(ptr::null_mut()),
        }
    }

    /// Register a fresh root handle for the current referent of `field`.
    pub fn load<T>(&self, field: &GcField<T>) -> Option<Gc<T>> {
        let (_guard, state) = self.enter();
        let target = field.raw().object();
        if target.is_null() {
            return None;
        }
        // SAFETY: lock held; a non-null field refers to a live block.
        let slot = unsafe { register_root(state, target) };
        Some(Gc {
            heap: self.clone(),
            slot,
            _marker: PhantomData,
        })
    }

    /// Bytes occupied by live blocks, prefix words included.
    pub fn alloc_size(&self) -> usize {
        let (_guard, state) = self.enter();
        // SAFETY: lock held.
        unsafe { (*state).arena.alloc_size }
    }

    /// Bump-cursor offset of the first free arena byte.
    pub fn free_index(&self) -> usize {
        let (_guard, state) = self.enter();
        // SAFETY: lock held.
        unsafe { (*state).arena.free_index }
    }

    /// Number of live block-table entries.
    pub fn block_count(&self) -> usize {
        let (_guard, state) = self.enter();
        // SAFETY: lock held.
        unsafe { (*state).block_count }
    }

    /// Snapshot of the collection statistics.
    pub fn stats(&self) -> HeapStats {
        let (_guard, state) = self.enter();
        // SAFETY: lock held.
        unsafe { (*state).stats }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(HeapSettings::default())
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("Heap")
            .field("alloc_size", &self.alloc_size())
            .field("block_count", &self.block_count())
            .field("collections", &stats.collections)
            .finish()
    }
}

// ── Rooted handles ────────────────────────────────────────────────────

/// A rooted managed pointer.
///
/// The registered handle words live inside the heap's root pool, so the
/// `Gc` value itself is a plain movable slot reference. The referent may
/// be relocated by any collection; the handle always observes the current
/// address, while raw pointers obtained through [`Gc::as_ptr`] and borrows
/// from [`Gc::get`] are invalidated by the next allocation or collection.
pub struct Gc<T> {
    heap: Heap,
    slot: usize,
    _marker: PhantomData<*mut T>,
}

impl<T> Gc<T> {
    /// A root handle referring to nothing.
    pub fn null(heap: &Heap) -> Self {
        let (_guard, state) = heap.enter();
        // SAFETY: lock held.
        let slot = unsafe { register_root(state, ptr::null_mut()) };
        Self {
            heap: heap.clone(),
            slot,
            _marker: PhantomData,
        }
    }

    /// Current address of the referent; null for an empty handle.
    pub fn as_ptr(&self) -> *mut T {
        let (_guard, state) = self.heap.enter();
        // SAFETY: lock held.
        unsafe { (*state).roots.handle(self.slot).object().cast() }
    }

    /// Borrow the referent.
    ///
    /// The borrow must not be held across an allocation or a collection;
    /// either may relocate the object.
    pub fn get(&self) -> Option<&T> {
        // SAFETY: a non-null root always refers to a live object at its
        // current address; lifetime caveat documented above.
        unsafe { self.as_ptr().as_ref() }
    }

    /// Mutably borrow the referent.
    ///
    /// # Safety
    ///
    /// No other reference to the object may exist, and the borrow must not
    /// be held across an allocation or a collection.
    pub unsafe fn get_mut(&self) -> Option<&mut T> {
        // SAFETY: per the contract above.
        unsafe { self.as_ptr().as_mut() }
    }

    pub fn is_null(&self) -> bool {
        self.as_ptr().is_null()
    }

    /// Point this handle at `other`'s referent.
    pub fn set(&self, other: &Gc<T>) {
        let (_guard, state) = self.heap.enter();
        // SAFETY: lock held; both slots stay registered while the handles
        // live.
        unsafe {
            let object = (*state).roots.handle(other.slot).object();
            (*state).roots.handle(self.slot).set_object(object);
        }
    }

    /// Point this handle at a raw payload, clearing the target block's
    /// allocation lock.
    ///
    /// # Safety
    ///
    /// `ptr`, when `Some`, must be a live payload of this heap.
    pub unsafe fn set_ptr(&self, ptr: Option<NonNull<T>>) {
        let (_guard, state) = self.heap.enter();
        // SAFETY: lock held; payload per contract.
        unsafe {
            match ptr {
                Some(p) => {
                    unlock_block(state, p.as_ptr().cast());
                    (*state)
                        .roots
                        .handle(self.slot)
                        .set_object(p.as_ptr().cast());
                }
                None => {
                    (*state).roots.handle(self.slot).set_object(ptr::null_mut())
                }
            }
        }
    }

    /// Whether both handles refer to the same object.
    pub fn ptr_eq(&self, other: &Gc<T>) -> bool {
        let (_guard, state) = self.heap.enter();
        // SAFETY: lock held.
        unsafe {
            (*state).roots.handle(self.slot).object()
                == (*state).roots.handle(other.slot).object()
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }
}

impl<T> Clone for Gc<T> {
    fn clone(&self) -> Self {
        let (_guard, state) = self.heap.enter();
        // SAFETY: lock held.
        unsafe {
            let object = (*state).roots.handle(self.slot).object();
            let slot = register_root(state, object);
            Self {
                heap: self.heap.clone(),
                slot,
                _marker: PhantomData,
            }
        }
    }
}

impl<T> Drop for Gc<T> {
    fn drop(&mut self) {
        let (_guard, state) = self.heap.enter();
        // SAFETY: lock held; the slot was registered at construction.
        unsafe { (*state).roots.release(self.slot) };
    }
}

impl<T> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gc({:?})", self.as_ptr())
    }
}

// SAFETY: every handle operation takes the process-wide heap lock; sending
// a handle moves only its slot index. Borrowing the referent from another
// thread is governed by the `Gc::get` contract, hence the `T` bounds.
unsafe impl<T: Send> Send for Gc<T> {}
// SAFETY: as above.
unsafe impl<T: Sync> Sync for Gc<T> {}

// ── Allocation ────────────────────────────────────────────────────────

/// Drop glue for `T`, instantiated once per allocated type.
///
/// # Safety
///
/// `payload` must hold an initialized `T`; called at most once.
unsafe fn finalize<T>(payload: *mut u8) {
    // SAFETY: per the contract above.
    unsafe { ptr::drop_in_place(payload.cast::<T>()) }
}

/// Reserve a block for `size` payload bytes, collecting when the block
/// table or the arena is exhausted. `None` when space still cannot be
/// found after a collection.
///
/// # Safety
///
/// Heap lock held. The returned payload is uninitialized and the block is
/// locked; the caller writes the payload before releasing the lock.
unsafe fn allocate_block(
    state: *mut HeapState,
    size: usize,
    finalizer: Finalizer,
) -> Option<NonNull<u8>> {
    // SAFETY: lock held throughout; `state` stays valid.
    unsafe {
        if (*state).block_count == (&(*state).blocks).len() {
            collect_in(state);
            if (*state).block_count == (&(*state).blocks).len() {
                tracing::warn!(
                    target: "gc",
                    requested = size,
                    "allocation failed: block table exhausted"
                );
                return None;
            }
        }

        let asize = align8(size + WORD);
        if (*state).arena.free_index + asize > (*state).arena.capacity() {
            collect_in(state);
            if (*state).arena.free_index + asize > (*state).arena.capacity() {
                tracing::warn!(
                    target: "gc",
                    requested = size,
                    "allocation failed: arena exhausted"
                );
                return None;
            }
        }

        let base = (*state).arena.bump(asize);
        let payload = base.add(WORD);
        let index = (*state).block_count;
        set_block_index(payload, index);

        let mut flags = BlockFlags::LOCKED;
        flags.set(BlockFlags::MARK_PHASE, (*state).phase);
        flags.set(BlockFlags::ADJUST_PHASE, (*state).phase);
        (*state).blocks[index] = Block {
            object: payload,
            new_object: ptr::null_mut(),
            ptrs: 0,
            size: asize - WORD,
            finalizer,
            flags,
        };
        (*state).block_count = index + 1;
        Some(NonNull::new_unchecked(payload))
    }
}

/// Thread the freshly written object's member handles into its block's
/// chain. Chain offsets are biased by the prefix word, so a field at
/// payload offset 0 stays representable and 0 remains the terminator.
///
/// # Safety
///
/// Heap lock held; `payload` holds an initialized `T` in this heap.
unsafe fn thread_members<T: Managed>(state: *mut HeapState, payload: *mut u8) {
    if T::EDGES.is_empty() {
        return;
    }
    // SAFETY: lock held; offsets are in bounds per the `Managed` contract.
    unsafe {
        let index = block_index_of(payload);
        let block = &mut (*state).blocks[index];
        for &offset in T::EDGES {
            debug_assert!(offset + size_of::<RawHandle>() <= block.size);
            let handle = &*(payload.add(offset) as *const RawHandle);
            handle.set_member_link(block.ptrs);
            block.ptrs = offset + WORD;
        }
    }
}

/// Register a root-pool node holding `object`.
///
/// # Safety
///
/// Heap lock held.
unsafe fn register_root(state: *mut HeapState, object: *mut u8) -> usize {
    // SAFETY: lock held.
    unsafe {
        let slot = (*state).roots.acquire();
        let handle = (*state).roots.handle(slot);
        handle.set_object(object);
        handle.set_root_link(slot);
        slot
    }
}

/// Clear the allocation lock of the block owning `payload`.
///
/// # Safety
///
/// Heap lock held; `payload` must be a live payload of this heap.
unsafe fn unlock_block(state: *mut HeapState, payload: *mut u8) {
    // SAFETY: per the contract above.
    unsafe {
        let index = block_index_of(payload);
        (*state).blocks[index].set_locked(false);
    }
}

// ── Collection ────────────────────────────────────────────────────────

/// One full collection. Returns the number of bytes reclaimed.
///
/// # Safety
///
/// Heap lock held.
pub(crate) unsafe fn collect_in(state: *mut HeapState) -> usize {
    // SAFETY: lock held throughout all passes.
    unsafe {
        let old_alloc = (*state).arena.alloc_size;

        (*state).phase = !(*state).phase;
        mark_from_roots(state);
        plan_and_finalize(state);
        adjust_from_roots(state);
        move_survivors(state);

        let freed = old_alloc - (*state).arena.alloc_size;
        let stats = &mut (*state).stats;
        stats.collections += 1;
        stats.freed_bytes += freed;
        stats.live_bytes = (*state).arena.alloc_size;
        stats.live_blocks = (*state).block_count;
        tracing::debug!(
            target: "gc",
            freed,
            live_bytes = stats.live_bytes,
            live_blocks = stats.live_blocks,
            "collection finished"
        );
        freed
    }
}

/// Walk a block's member-handle chain, invoking `visit` on each handle.
/// `payload` supplies the base the chain offsets are relative to.
///
/// # Safety
///
/// `payload` and `first` must come from one block descriptor whose chain
/// is intact at `payload`.
unsafe fn walk_chain(
    payload: *mut u8,
    first: usize,
    mut visit: impl FnMut(*const RawHandle),
) {
    // SAFETY: chain offsets were recorded against this payload layout.
    unsafe {
        let base = payload.sub(WORD);
        let mut offset = first;
        while offset != 0 {
            let handle = base.add(offset) as *const RawHandle;
            visit(handle);
            offset = (*handle).next_member();
        }
    }
}

/// Pass 1: mark every block reachable from the root set. Locked blocks
/// are pinned and need no mark bit; deleted blocks are traversed like any
/// other so blocks that are still referenced stay in the table.
///
/// # Safety
///
/// Heap lock held.
unsafe fn mark_from_roots(state: *mut HeapState) {
    // SAFETY: lock held.
    unsafe {
        let phase = (*state).phase;
        let mut queue: Vec<usize> = Vec::new();

        for slot in (*state).roots.live_slots() {
            let handle = (*state).roots.handle_ptr(slot);
            mark_handle(state, handle, phase, &mut queue);
        }

        while let Some(index) = queue.pop() {
            let block = (*state).blocks[index];
            walk_chain(block.object, block.ptrs, |handle| {
                mark_handle(state, handle, phase, &mut queue);
            });
        }
    }
}

/// Mark one handle's referent and enqueue its block for chain traversal.
///
/// # Safety
///
/// Heap lock held; `handle` points at a registered handle.
unsafe fn mark_handle(
    state: *mut HeapState,
    handle: *const RawHandle,
    phase: bool,
    queue: &mut Vec<usize>,
) {
    // SAFETY: lock held; non-null handles refer to blocks of this heap.
    unsafe {
        let object = (*handle).object();
        if object.is_null() {
            return;
        }
        let index = block_index_of(object);
        let block = &mut (*state).blocks[index];
        debug_assert_eq!(block.object, object);
        if block.locked() || block.mark_phase() == phase {
            return;
        }
        block.set_mark_phase(phase);
        queue.push(index);
    }
}

/// Pass 2: compact the block table in allocation (= address) order,
/// assign survivors their post-move addresses, and finalize garbage.
///
/// The relocation cursor never crosses a pinned block: survivors slide
/// down into the lowest free space, and the cursor hops past pinned
/// storage, so a move can only overlap the block's own old bytes.
///
/// # Safety
///
/// Heap lock held. Finalizers may re-enter handle operations; no state
/// borrows are live when one runs.
unsafe fn plan_and_finalize(state: *mut HeapState) {
    // SAFETY: lock held; blocks are processed by value.
    unsafe {
        let phase = (*state).phase;
        let count = (*state).block_count;
        let mut kept = 0usize;
        let mut new_alloc = 0usize;
        let mut cursor = 0usize;

        for i in 0..count {
            let block = (*state).blocks[i];
            if block.locked() && !block.deleted() {
                // Pinned in place.
                set_block_index(block.object, kept);
                let end = (*state).arena.offset_of(block.object) + block.size;
                cursor = cursor.max(end);
                let mut moved = block;
                moved.new_object = block.object;
                (*state).blocks[kept] = moved;
                new_alloc += block.size + WORD;
                kept += 1;
            } else if !block.locked() && block.mark_phase() == phase {
                // Reachable survivor, slides down to the cursor.
                set_block_index(block.object, kept);
                let mut moved = block;
                moved.new_object = (*state).arena.base().add(cursor + WORD);
                (*state).blocks[kept] = moved;
                new_alloc += block.size + WORD;
                cursor += block.size + WORD;
                kept += 1;
            } else if !block.deleted() {
                // Unreachable: run the finalizer on the still-intact
                // payload. It may re-enter through the recursive lock.
                (block.finalizer)(block.object);
            }
            // Deleted and unreachable (or deleted while still locked):
            // finalized by destroy already, the storage is dropped.
        }

        (*state).arena.free_index = cursor;
        (*state).arena.alloc_size = new_alloc;
        (*state).block_count = kept;
    }
}

/// Pass 3: rewrite every reachable handle to its referent's planned
/// address. Chain traversal reads the blocks' old payload addresses,
/// which the move pass has not yet overwritten.
///
/// # Safety
///
/// Heap lock held; runs after `plan_and_finalize` of the same cycle.
unsafe fn adjust_from_roots(state: *mut HeapState) {
    // SAFETY: lock held.
    unsafe {
        let phase = (*state).phase;
        let mut queue: Vec<usize> = Vec::new();

        for slot in (*state).roots.live_slots() {
            let handle = (*state).roots.handle_ptr(slot);
            adjust_handle(state, handle, phase, &mut queue);
        }

        while let Some(index) = queue.pop() {
            let block = (*state).blocks[index];
            walk_chain(block.object, block.ptrs, |handle| {
                adjust_handle(state, handle, phase, &mut queue);
            });
        }
    }
}

/// Rewrite one handle and enqueue its referent's chain, once per block.
/// Locked blocks did not move and are skipped entirely.
///
/// # Safety
///
/// Heap lock held; `handle` points at a registered handle.
unsafe fn adjust_handle(
    state: *mut HeapState,
    handle: *const RawHandle,
    phase: bool,
    queue: &mut Vec<usize>,
) {
    // SAFETY: lock held; the prefix word of a surviving block was
    // rewritten to its compacted index by the plan pass.
    unsafe {
        let object = (*handle).object();
        if object.is_null() {
            return;
        }
        let index = block_index_of(object);
        let block = &mut (*state).blocks[index];
        if block.locked() {
            return;
        }
        (*handle).set_object(block.new_object);
        if block.adjust_phase() == phase {
            return;
        }
        block.set_adjust_phase(phase);
        queue.push(index);
    }
}

/// Pass 4: slide surviving payloads down to their planned addresses and
/// stamp the prefix word at each destination.
///
/// # Safety
///
/// Heap lock held; runs after `adjust_from_roots` of the same cycle.
unsafe fn move_survivors(state: *mut HeapState) {
    // SAFETY: lock held; planned regions only overlap their own old bytes.
    unsafe {
        let count = (*state).block_count;
        for i in 0..count {
            let block = &mut (*state).blocks[i];
            if block.locked() || block.new_object == block.object {
                continue;
            }
            set_block_index(block.new_object, i);
            ptr::copy(block.object, block.new_object, block.size);
            block.object = block.new_object;
        }
    }
}
