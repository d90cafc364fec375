/// Types that can live on the collected heap.
///
/// A managed type declares where its embedded managed pointers are so the
/// allocator can thread them into the owning block's pointer chain and the
/// collector can enumerate them in bounded time.
///
/// ```ignore
/// struct Node {
///     next: GcField<Node>,
///     value: u64,
/// }
///
/// unsafe impl Managed for Node {
///     const EDGES: &'static [usize] = &[core::mem::offset_of!(Node, next)];
/// }
/// ```
///
/// # Safety
///
/// `EDGES` must list the byte offset of every `GcField` embedded in the
/// type, each exactly once, and nothing else. The collector reads and
/// rewrites these locations in place; a wrong or missing offset is
/// undefined behavior. Leaf types with no fields keep the empty default.
pub unsafe trait Managed: Sized + 'static {
    /// Byte offsets of the type's `GcField`s, via [`core::mem::offset_of!`].
    const EDGES: &'static [usize] = &[];
}
