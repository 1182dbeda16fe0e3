// Cache entries and the acquisition protocol
//
// An entry is one guest address range materialized as a host
// resource. Entries are shared: the per-kind table holds one strong
// handle and every tag that acquired the entry holds another. The
// access state is the ownership token between tags; waiting on it is
// the only blocking the cache ever does on its own.
//
// Readers share an entry, a writer holds it alone. Release happens
// in two phases so write-back work is recorded before any waiter is
// allowed back in.
//
// Austin Shafer - 2024

use crate::buffer::BufferPayload;
use crate::cache::TagId;
use crate::image::{ImagePayload, ImageViewPayload};
use crate::image_buffer::ImageBufferPayload;
use crate::index_buffer::IndexBufferPayload;
use crate::range::AddressRange;
use crate::shader::ShaderPayload;
use crate::Access;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

/// Kinds of entries, one cache table per kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum EntryType {
    Buffer,
    ImageBuffer,
    Image,
    IndexBuffer,
    Shader,
}

pub(crate) enum EntryPayload {
    Buffer(BufferPayload),
    ImageBuffer(ImageBufferPayload),
    Image(ImagePayload),
    ImageView(ImageViewPayload),
    IndexBuffer(IndexBufferPayload),
    Shader(ShaderPayload),
}

#[derive(Default)]
struct HolderState {
    /// Union of the access held by every current holder
    h_access: Access,
    /// Ownership tokens of the tags currently holding this entry
    h_tokens: Vec<u64>,
}

pub(crate) struct CacheEntry {
    /// The guest range this entry shadows. An internal scratch buffer
    /// has a range starting at zero and is never flushed.
    pub e_range: AddressRange,
    /// TagId at which the content became authoritative
    pub e_tag_id: AtomicU64,
    /// Set while a write-back toward the next lower level is owed
    pub e_has_delayed_flush: AtomicBool,
    e_holders: Mutex<HolderState>,
    e_wait_cond: Condvar,
    pub e_payload: EntryPayload,
}

// Entry identity is pointer identity; two entries are never "equal by
// value" even when they shadow the same range.
impl PartialEq for CacheEntry {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl CacheEntry {
    pub fn new(range: AddressRange, tag_id: TagId, payload: EntryPayload) -> Self {
        Self {
            e_range: range,
            e_tag_id: AtomicU64::new(tag_id.0),
            e_has_delayed_flush: AtomicBool::new(false),
            e_holders: Mutex::new(HolderState::default()),
            e_wait_cond: Condvar::new(),
            e_payload: payload,
        }
    }

    pub fn tag_id(&self) -> TagId {
        TagId(self.e_tag_id.load(Ordering::Relaxed))
    }

    pub fn set_tag_id(&self, id: TagId) {
        self.e_tag_id.store(id.0, Ordering::Relaxed);
    }

    pub fn has_delayed_flush(&self) -> bool {
        self.e_has_delayed_flush.load(Ordering::Relaxed)
    }

    pub fn set_delayed_flush(&self, value: bool) {
        self.e_has_delayed_flush.store(value, Ordering::Relaxed);
    }

    pub fn is_in_use(&self) -> bool {
        !self.e_holders.lock().unwrap().h_tokens.is_empty()
    }

    pub fn acquired_access(&self) -> Access {
        self.e_holders.lock().unwrap().h_access
    }

    /// Install `(token, access)` on this entry.
    ///
    /// A free entry is taken outright. A tag that already holds the
    /// entry ORs its access in. Readers may join other readers. In
    /// every other combination we block until the holders drain; that
    /// wait chain is what gives two tags touching the same range a
    /// happens-before edge.
    pub fn acquire(&self, token: u64, access: Access) {
        assert!(token != 0 && !access.is_empty());

        let mut state = self.e_holders.lock().unwrap();
        loop {
            if state.h_tokens.contains(&token) {
                state.h_access |= access;
                return;
            }

            if state.h_tokens.is_empty() {
                state.h_access = access;
                state.h_tokens.push(token);
                return;
            }

            if !state.h_access.contains(Access::WRITE) && !access.contains(Access::WRITE) {
                state.h_access |= access;
                state.h_tokens.push(token);
                return;
            }

            state = self.e_wait_cond.wait(state).unwrap();
        }
    }

    /// First phase of release: if this token is a holder, report the
    /// access union so the caller can record write-back work. The
    /// hold itself stays in place until `finish_release`.
    pub fn begin_release(&self, token: u64) -> Option<Access> {
        let state = self.e_holders.lock().unwrap();
        if !state.h_tokens.contains(&token) {
            return None;
        }

        Some(state.h_access)
    }

    /// Second phase: drop the hold and wake waiters once the last
    /// holder is gone.
    pub fn finish_release(&self, token: u64) {
        let mut state = self.e_holders.lock().unwrap();
        if let Some(pos) = state.h_tokens.iter().position(|&t| t == token) {
            state.h_tokens.swap_remove(pos);
        }

        if state.h_tokens.is_empty() {
            state.h_access = Access::empty();
            self.e_wait_cond.notify_all();
        }
    }
}

/// Accessors panic on a kind mismatch: a table never stores a payload
/// of the wrong kind, so reaching one is a corrupted cache.
impl CacheEntry {
    pub fn as_buffer(&self) -> &BufferPayload {
        match &self.e_payload {
            EntryPayload::Buffer(b) => b,
            _ => panic!("cache entry is not a buffer"),
        }
    }

    pub fn as_image_buffer(&self) -> &ImageBufferPayload {
        match &self.e_payload {
            EntryPayload::ImageBuffer(b) => b,
            _ => panic!("cache entry is not an image buffer"),
        }
    }

    pub fn as_image(&self) -> &ImagePayload {
        match &self.e_payload {
            EntryPayload::Image(i) => i,
            _ => panic!("cache entry is not an image"),
        }
    }

    pub fn as_image_view(&self) -> &ImageViewPayload {
        match &self.e_payload {
            EntryPayload::ImageView(v) => v,
            _ => panic!("cache entry is not an image view"),
        }
    }

    pub fn as_index_buffer(&self) -> &IndexBufferPayload {
        match &self.e_payload {
            EntryPayload::IndexBuffer(i) => i,
            _ => panic!("cache entry is not an index buffer"),
        }
    }

    pub fn as_shader(&self) -> &ShaderPayload {
        match &self.e_payload {
            EntryPayload::Shader(s) => s,
            _ => panic!("cache entry is not a shader"),
        }
    }
}
