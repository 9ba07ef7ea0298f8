//! Lock-free list. Multiple readers, single writer.
//!
//! Reading speed is the priority: a background thread creates
//! expensive-to-construct objects (file reading + decoding) and reading
//! threads use them with a single atomic increment of overhead. The writer
//! adds and removes items frequently.
//!
//! Nodes are never freed until the list itself is dropped, so a reader
//! holding a `&Node` always points at valid memory; what changes is whether
//! the slot currently contains a live value. Bit 31 of the reader counter is
//! the "dead" flag: a reader does one atomic increment and inspects the
//! result - if the dead bit is set it reverts the increment and gives up.
//! The more expensive bitwise operations are paid by the writer, moving all
//! the latency-sensitive cost off the reader threads.
//!
//! Writer methods take `&self` so the list can sit behind an `Arc`, but they
//! must only ever be called from one thread at a time (or under an external
//! mutex). Reader methods are safe from any thread.
//!
//! Iteration is weakly consistent: while the writer edits the list a reader
//! may skip live nodes or observe the same node twice. Callers must treat
//! that as equivalent to items being added or removed during iteration.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

const DEAD_BIT: u32 = 1 << 31;

pub struct Node<T> {
    reader_uses: AtomicU32,
    value: UnsafeCell<MaybeUninit<T>>,
    next: AtomicPtr<Node<T>>,
    /// Writer-only link used for the dead and free lists, separate from
    /// `next` so a reader mid-iteration is never redirected into them.
    writer_next: UnsafeCell<*mut Node<T>>,
}

// Safety: `value` is only read between a successful try_retain and the
// matching release, during which the writer will not drop it; `writer_next`
// is only touched by the single writer.
unsafe impl<T: Send + Sync> Send for Node<T> {}
unsafe impl<T: Send + Sync> Sync for Node<T> {}

impl<T> Node<T> {
    /// Reader. On success the value will not be destroyed until `release`.
    #[inline]
    pub fn try_retain(&self) -> Option<&T> {
        let r = self.reader_uses.fetch_add(1, Ordering::Acquire);
        if r & DEAD_BIT != 0 {
            self.reader_uses.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        // Safety: the node is live and our retain keeps the writer from
        // dropping the value.
        Some(unsafe { (*self.value.get()).assume_init_ref() })
    }

    /// Reader, only after a successful `try_retain`.
    #[inline]
    pub fn release(&self) {
        let r = self.reader_uses.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(r & !DEAD_BIT != 0);
    }

    /// Reader convenience: retain guarded by RAII.
    pub fn try_scoped(&self) -> Option<RetainedValue<'_, T>> {
        self.try_retain().map(|value| RetainedValue { node: self, value })
    }

    pub fn is_dead(&self) -> bool {
        self.reader_uses.load(Ordering::Relaxed) & DEAD_BIT != 0
    }
}

/// RAII guard for a retained node value.
pub struct RetainedValue<'a, T> {
    node: &'a Node<T>,
    value: &'a T,
}

impl<T> std::ops::Deref for RetainedValue<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value
    }
}

impl<T> Drop for RetainedValue<'_, T> {
    fn drop(&mut self) {
        self.node.release();
    }
}

pub struct AtomicRefList<T> {
    live_list: AtomicPtr<Node<T>>,
    dead_list: UnsafeCell<*mut Node<T>>,
    free_list: UnsafeCell<*mut Node<T>>,
    /// Every node ever allocated; owned until the list drops.
    arena: UnsafeCell<Vec<*mut Node<T>>>,
}

// Safety: the writer-only cells are guarded by the single-writer contract;
// everything readers touch is atomic or retain-protected.
unsafe impl<T: Send + Sync> Send for AtomicRefList<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicRefList<T> {}

impl<T> Default for AtomicRefList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AtomicRefList<T> {
    pub fn new() -> Self {
        Self {
            live_list: AtomicPtr::new(ptr::null_mut()),
            dead_list: UnsafeCell::new(ptr::null_mut()),
            free_list: UnsafeCell::new(ptr::null_mut()),
            arena: UnsafeCell::new(Vec::new()),
        }
    }

    /// Reader or writer. Yields `&Node`; readers must access values through
    /// `try_retain`/`try_scoped`.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            node: self.live_list.load(Ordering::Acquire),
            _list: std::marker::PhantomData,
        }
    }

    /// Writer. Inserts a new value at the head of the live list and makes it
    /// visible to readers.
    pub fn insert(&self, value: T) -> &Node<T> {
        let node = self.allocate();
        unsafe {
            (*(*node).value.get()).write(value);
            (*node)
                .next
                .store(self.live_list.load(Ordering::Relaxed), Ordering::Relaxed);
            self.live_list.store(node, Ordering::Release);
            // Signal that readers may now use this node.
            (*node).reader_uses.fetch_and(!DEAD_BIT, Ordering::Release);
            &*node
        }
    }

    fn allocate(&self) -> *mut Node<T> {
        unsafe {
            let free_list = self.free_list.get();
            if !(*free_list).is_null() {
                let node = *free_list;
                *free_list = *(*node).writer_next.get();
                return node;
            }
            let node = Box::into_raw(Box::new(Node {
                reader_uses: AtomicU32::new(DEAD_BIT),
                value: UnsafeCell::new(MaybeUninit::uninit()),
                next: AtomicPtr::new(ptr::null_mut()),
                writer_next: UnsafeCell::new(ptr::null_mut()),
            }));
            (*self.arena.get()).push(node);
            node
        }
    }

    /// Writer. Unlinks the node from the live list and marks it dead; the
    /// value is destroyed later by `delete_removed_and_unreferenced` once no
    /// reader holds a retain.
    pub fn remove(&self, node: &Node<T>) {
        let target = node as *const Node<T> as *mut Node<T>;

        let mut prev: *mut Node<T> = ptr::null_mut();
        let mut current = self.live_list.load(Ordering::Relaxed);
        while !current.is_null() && current != target {
            prev = current;
            current = unsafe { (*current).next.load(Ordering::Relaxed) };
        }
        debug_assert!(!current.is_null(), "node not in live list");
        if current.is_null() {
            return;
        }

        unsafe {
            let after = (*target).next.load(Ordering::Relaxed);
            if prev.is_null() {
                self.live_list.store(after, Ordering::Release);
            } else {
                (*prev).next.store(after, Ordering::Release);
            }

            *(*target).writer_next.get() = *self.dead_list.get();
            *self.dead_list.get() = target;

            // ADD works as OR here since the dead bit is known clear, and an
            // atomic add avoids a CAS loop on x86.
            let prev_uses = (*target).reader_uses.fetch_add(DEAD_BIT, Ordering::AcqRel);
            debug_assert!(prev_uses & DEAD_BIT == 0, "already dead");
        }
    }

    /// Writer. Removes every value matching the predicate.
    pub fn remove_where(&self, mut predicate: impl FnMut(&T) -> bool) {
        let mut current = self.live_list.load(Ordering::Relaxed);
        while !current.is_null() {
            let next = unsafe { (*current).next.load(Ordering::Relaxed) };
            // Safety: writer-side access; the value is live.
            let matches = unsafe { predicate((*(*current).value.get()).assume_init_ref()) };
            if matches {
                unsafe { self.remove(&*current) };
            }
            current = next;
        }
    }

    /// Writer.
    pub fn remove_all(&self) {
        self.remove_where(|_| true);
    }

    /// Writer; call regularly. Destroys values of removed nodes that no
    /// reader still holds and recycles the nodes.
    pub fn delete_removed_and_unreferenced(&self) {
        unsafe {
            let mut previous: *mut Node<T> = ptr::null_mut();
            let mut current = *self.dead_list.get();
            while !current.is_null() {
                let next = *(*current).writer_next.get();
                if (*current).reader_uses.load(Ordering::Acquire) == DEAD_BIT {
                    if previous.is_null() {
                        *self.dead_list.get() = next;
                    } else {
                        *(*previous).writer_next.get() = next;
                    }
                    (*(*current).value.get()).assume_init_drop();
                    *(*current).writer_next.get() = *self.free_list.get();
                    *self.free_list.get() = current;
                } else {
                    previous = current;
                }
                current = next;
            }
        }
    }

    /// Writer-side value access (the writer never races itself).
    pub fn writer_get<'a>(&'a self, node: &'a Node<T>) -> &'a T {
        debug_assert!(!node.is_dead());
        unsafe { (*node.value.get()).assume_init_ref() }
    }
}

impl<T> Drop for AtomicRefList<T> {
    fn drop(&mut self) {
        // All readers must be gone by now; the owner is responsible for
        // joining them first.
        self.remove_all();
        self.delete_removed_and_unreferenced();
        unsafe {
            debug_assert!((*self.dead_list.get()).is_null(), "retains outlived the list");
            for &node in (*self.arena.get()).iter() {
                drop(Box::from_raw(node));
            }
        }
    }
}

pub struct Iter<'a, T> {
    node: *mut Node<T>,
    _list: std::marker::PhantomData<&'a AtomicRefList<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a Node<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.node.is_null() {
            return None;
        }
        // Safety: nodes live as long as the list, which outlives 'a.
        let node = unsafe { &*self.node };
        self.node = node.next.load(Ordering::Acquire);
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn insert_then_retain_reads_value() {
        let list = AtomicRefList::new();
        list.insert(42u32);
        let node = list.iter().next().unwrap();
        let retained = node.try_scoped().unwrap();
        assert_eq!(*retained, 42);
    }

    #[test]
    fn removed_node_fails_retain() {
        let list = AtomicRefList::new();
        list.insert(1u32);
        let node = list.iter().next().unwrap();
        list.remove(node);
        assert!(node.try_retain().is_none());
        assert_eq!(list.iter().count(), 0);
    }

    #[test]
    fn value_not_destroyed_while_retained() {
        struct DropFlag(Arc<AtomicBool>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let list = AtomicRefList::new();
        list.insert(DropFlag(Arc::clone(&dropped)));

        let node = list.iter().next().unwrap();
        assert!(node.try_retain().is_some());

        list.remove(node);
        list.delete_removed_and_unreferenced();
        assert!(!dropped.load(Ordering::SeqCst), "freed while retained");

        node.release();
        list.delete_removed_and_unreferenced();
        assert!(dropped.load(Ordering::SeqCst), "not freed after release");
    }

    #[test]
    fn nodes_are_recycled_through_the_free_list() {
        let list = AtomicRefList::new();
        let first = list.insert(1u32) as *const Node<u32>;
        list.remove(unsafe { &*first });
        list.delete_removed_and_unreferenced();
        let second = list.insert(2u32) as *const Node<u32>;
        assert_eq!(first, second, "expected node reuse");
        assert_eq!(unsafe { (*list.arena.get()).len() }, 1);
    }

    #[test]
    fn concurrent_readers_during_churn_never_observe_freed_values() {
        // Values carry a checksum; a reader that dereferenced freed or torn
        // memory would fail it. The writer continuously inserts, removes and
        // reaps.
        let list = Arc::new(AtomicRefList::<(u64, u64)>::new());
        let stop = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let list = Arc::clone(&list);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    let mut seen = 0u64;
                    while !stop.load(Ordering::Relaxed) {
                        for node in list.iter() {
                            if let Some(value) = node.try_scoped() {
                                assert_eq!(value.1, value.0.wrapping_mul(31).wrapping_add(7));
                                seen += 1;
                            }
                        }
                    }
                    seen
                })
            })
            .collect();

        // Single writer thread.
        let writer = {
            let list = Arc::clone(&list);
            std::thread::spawn(move || {
                for i in 0..20_000u64 {
                    list.insert((i, i.wrapping_mul(31).wrapping_add(7)));
                    if i % 3 == 0 {
                        if let Some(node) = list.iter().last() {
                            list.remove(node);
                        }
                    }
                    if i % 16 == 0 {
                        list.delete_removed_and_unreferenced();
                    }
                    if i % 64 == 0 {
                        list.remove_all();
                        list.delete_removed_and_unreferenced();
                    }
                }
                list.remove_all();
            })
        };

        writer.join().unwrap();
        stop.store(true, Ordering::Relaxed);
        let total: u64 = readers.into_iter().map(|r| r.join().unwrap()).sum();
        assert!(total > 0, "readers never saw a live node");
        list.delete_removed_and_unreferenced();
    }
}
