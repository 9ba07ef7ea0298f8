//! User-facing error notifications, readable from any thread.
//!
//! Writers (loader thread, main thread) publish under a mutex; readers (GUI)
//! walk the atomic-ref list without blocking. Notifications are deduplicated
//! by a 64-bit id so a repeating failure updates in place rather than
//! flooding the list.

use std::sync::Mutex;

use crate::sync::ref_list::{AtomicRefList, Node, RetainedValue};
use crate::types::LoadError;

#[derive(Debug, Clone)]
pub struct ErrorNotice {
    pub title: String,
    pub message: String,
    pub error: Option<LoadError>,
    pub id: u64,
}

/// Stable id for a notification: a 4-char category tag plus a hash of the
/// distinguishing string.
pub const fn error_id(tag: [u8; 4], string_to_hash: &str) -> u64 {
    let tag32 = u32::from_le_bytes(tag) as u64;
    // FNV-1a over the string bytes.
    let bytes = string_to_hash.as_bytes();
    let mut hash = 0x811c9dc5u32;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(0x01000193);
        i += 1;
    }
    (tag32 << 32) | hash as u64
}

#[derive(Default)]
pub struct ErrorNotifications {
    items: AtomicRefList<ErrorNotice>,
    writer_mutex: Mutex<()>,
}

impl ErrorNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any thread except the audio thread.
    pub fn add_or_update(&self, notice: ErrorNotice) {
        let _guard = self.writer_mutex.lock().unwrap();
        // Same id: replace by remove + insert so readers only ever see a
        // complete notice.
        self.items.remove_where(|item| item.id == notice.id);
        self.items.insert(notice);
        self.items.delete_removed_and_unreferenced();
    }

    pub fn remove(&self, id: u64) {
        let _guard = self.writer_mutex.lock().unwrap();
        self.items.remove_where(|item| item.id == id);
        self.items.delete_removed_and_unreferenced();
    }

    /// Reader-side visit of every currently-live notice.
    pub fn for_each(&self, mut f: impl FnMut(&ErrorNotice)) {
        for node in self.items.iter() {
            if let Some(notice) = node.try_scoped() {
                f(&notice);
            }
        }
    }

    /// Reader-side retained access to a single notice.
    pub fn find(&self, id: u64) -> Option<RetainedValue<'_, ErrorNotice>> {
        for node in self.items.iter() {
            if let Some(notice) = node.try_scoped() {
                if notice.id == id {
                    return Some(notice);
                }
            }
        }
        None
    }

    #[allow(dead_code)]
    fn node_for_tests(&self) -> Option<&Node<ErrorNotice>> {
        self.items.iter().next()
    }
}
