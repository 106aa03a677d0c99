//! Pre-allocated pool of message nodes.
//!
//! All nodes are allocated at startup and addressed by [`NodeHandle`]. The
//! free list is a [`SlotRing`] of indices, so allocation and release are
//! lock-free and never block: an empty free list is reported as
//! [`EngineError::PoolExhausted`].
//!
//! Every node carries a reference countdown. A published node starts at
//! `consumers + 1` and goes back to the free list when the last reference is
//! released.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tidal_proto::{Message, MESSAGE_SIZE};

use crate::error::{EngineError, Result};
use crate::slots::SlotRing;

/// Messages per node.
pub const NODE_CAPACITY: usize = 255;

/// Bytes of message data per node.
pub const NODE_BYTES: usize = NODE_CAPACITY * MESSAGE_SIZE;

/// Index into the node pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct NodeHandle(pub u32);

impl NodeHandle {
    /// Invalid handle constant, also the "no successor" link value.
    pub const INVALID: Self = Self(u32::MAX);

    #[inline(always)]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }

    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl Default for NodeHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

/// A batch of up to [`NODE_CAPACITY`] messages.
#[repr(C, align(64))]
pub struct Node {
    messages: UnsafeCell<[Message; NODE_CAPACITY]>,
    len: AtomicU32,
    pub(crate) refs: AtomicU32,
    pub(crate) next: AtomicU32,
}

// SAFETY: message storage is written only by the single owner of a freshly
// allocated node and read only after it has been published (Release on the
// list link, Acquire on traversal).
unsafe impl Sync for Node {}

impl Node {
    fn new() -> Self {
        Self {
            messages: UnsafeCell::new([Message::default(); NODE_CAPACITY]),
            len: AtomicU32::new(0),
            refs: AtomicU32::new(0),
            next: AtomicU32::new(NodeHandle::INVALID.0),
        }
    }

    /// Published messages of this node.
    ///
    /// Only meaningful for a node reached through the broadcast list.
    #[inline]
    pub fn messages(&self) -> &[Message] {
        let len = self.len.load(Ordering::Acquire) as usize;
        // SAFETY: see the Sync impl; `len` never exceeds NODE_CAPACITY.
        unsafe { &(&(*self.messages.get()))[..len] }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whole storage of the node, for its owner before publication.
    ///
    /// # Safety
    /// The caller must own the node exclusively (allocated, not yet published).
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn storage_mut(&self) -> &mut [Message; NODE_CAPACITY] {
        &mut *self.messages.get()
    }

    /// Byte view of the whole storage, for its owner before publication.
    ///
    /// # Safety
    /// Same as [`Node::storage_mut`].
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn bytes_mut(&self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut *self.messages.get())
    }

    #[inline]
    pub(crate) fn set_len(&self, len: usize) {
        debug_assert!(len <= NODE_CAPACITY);
        self.len.store(len as u32, Ordering::Release);
    }

    /// Current reference countdown.
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }
}

/// Fixed-size, lock-free pool of nodes.
pub struct NodePool {
    /// `capacity` allocatable nodes plus the permanent list sentinel.
    nodes: Box<[Node]>,
    free: SlotRing<u32>,
    capacity: u32,
    recycled: AtomicU64,
}

impl NodePool {
    /// Create a pool of `capacity` nodes.
    ///
    /// # Panics
    /// Panics if `capacity` is zero or does not fit a handle.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "node pool needs at least one node");
        assert!(capacity < u32::MAX as usize - 1, "node pool too large");

        let nodes: Box<[Node]> = (0..=capacity).map(|_| Node::new()).collect();
        let free = SlotRing::with_capacity(capacity);
        for idx in 0..capacity as u32 {
            let pushed = free.push(idx);
            debug_assert!(pushed.is_ok());
        }

        Self {
            nodes,
            free,
            capacity: capacity as u32,
            recycled: AtomicU64::new(0),
        }
    }

    /// Take a node off the free list. Never blocks.
    ///
    /// The returned node is empty and holds a single reference owned by the
    /// caller.
    #[inline]
    pub fn allocate(&self) -> Result<NodeHandle> {
        let idx = self.free.pop().ok_or(EngineError::PoolExhausted {
            capacity: self.capacity as usize,
        })?;
        let node = &self.nodes[idx as usize];
        node.len.store(0, Ordering::Relaxed);
        node.next.store(NodeHandle::INVALID.0, Ordering::Relaxed);
        node.refs.store(1, Ordering::Release);
        Ok(NodeHandle(idx))
    }

    /// Drop one reference on `handle`, recycling the node on the last one.
    ///
    /// Releasing the sentinel is a no-op.
    #[inline]
    pub fn release(&self, handle: NodeHandle) {
        if handle == self.sentinel() {
            return;
        }
        let node = self.get(handle);
        let prev = node.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release of free node {}", handle.0);
        if prev == 1 {
            self.recycled.fetch_add(1, Ordering::Relaxed);
            let returned = self.free.push(handle.0);
            debug_assert!(returned.is_ok(), "free list overflow");
        }
    }

    /// Add a reference to a live node.
    #[inline]
    pub(crate) fn retain(&self, handle: NodeHandle) {
        if handle == self.sentinel() {
            return;
        }
        let prev = self.get(handle).refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "retain of free node {}", handle.0);
    }

    /// Set the countdown of an owned node before it is published.
    #[inline]
    pub(crate) fn set_refs(&self, handle: NodeHandle, refs: u32) {
        self.get(handle).refs.store(refs, Ordering::Release);
    }

    #[inline(always)]
    pub fn get(&self, handle: NodeHandle) -> &Node {
        debug_assert!(handle.0 <= self.capacity, "handle out of bounds");
        &self.nodes[handle.index()]
    }

    /// The permanent head node of the broadcast list; never allocated.
    #[inline(always)]
    pub fn sentinel(&self) -> NodeHandle {
        NodeHandle(self.capacity)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Number of nodes on the free list.
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Number of nodes returned to the free list since creation.
    pub fn recycled(&self) -> u64 {
        self.recycled.load(Ordering::Relaxed)
    }
}
