//! The two-lane hash bucket.

use crate::node::KeyNode;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

/// One hash slot: two singly linked chains threaded through the nodes.
///
/// The `stable` chain is readable without a lock. During the concurrent
/// regime nothing is ever added to it; it changes only while all workers
/// are quiesced (sequential inserts, promotion barriers, resize). The
/// `unstable` chain collects concurrent-regime inserts and is read and
/// written only under the bucket's stripe lock.
///
/// An all-zero bucket is a valid empty bucket, so bucket arrays are
/// allocated zeroed.
#[repr(C)]
pub(crate) struct Bucket {
    pub stable: AtomicPtr<KeyNode>,
    pub unstable: AtomicPtr<KeyNode>,
}

impl Bucket {
    /// Walk a chain from `head` looking for `key`. The caller holds
    /// whatever lock the lane requires (none for a stable head).
    pub fn scan(head: *mut KeyNode, hash: u32, key: &[u8]) -> Option<NonNull<KeyNode>> {
        let mut k = head;
        while !k.is_null() {
            let node = unsafe { &*k };
            if node.hash == hash && node.bytes() == key {
                return NonNull::new(k);
            }
            k = node.next.load(Ordering::Acquire);
        }
        None
    }
}
