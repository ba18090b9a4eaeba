//! A single resident page and the bookkeeping needed to place it on the
//! LRU list, the tick list, and the delayed-write list.

use crate::container::MemType;

use super::slab::EntryId;

#[derive(Debug)]
pub struct Entry {
    pub page_number: u64,
    pub addr: u64,
    pub size: usize,
    pub image: Vec<u8>,
    pub mem_type: MemType,
    pub is_metadata: bool,
    pub is_mpmde: bool,
    pub is_dirty: bool,
    pub has_published_bytes: bool,
    /// Doubles as "is this entry currently linked into the tick list" —
    /// the invariant `modified_this_tick ⇒ on tick list` holds by
    /// construction rather than needing a second flag.
    pub modified_this_tick: bool,
    pub delay_write_until: u64,

    pub lru_prev: Option<EntryId>,
    pub lru_next: Option<EntryId>,
    pub tick_prev: Option<EntryId>,
    pub tick_next: Option<EntryId>,
    pub dwl_prev: Option<EntryId>,
    pub dwl_next: Option<EntryId>,
}

impl Entry {
    pub fn new_loaded(
        page_number: u64,
        addr: u64,
        image: Vec<u8>,
        mem_type: MemType,
    ) -> Self {
        let size = image.len();
        Self {
            page_number,
            addr,
            size,
            image,
            mem_type,
            is_metadata: mem_type.is_metadata(),
            is_mpmde: false,
            is_dirty: false,
            has_published_bytes: true,
            modified_this_tick: false,
            delay_write_until: 0,
            lru_prev: None,
            lru_next: None,
            tick_prev: None,
            tick_next: None,
            dwl_prev: None,
            dwl_next: None,
        }
    }

    pub fn new_allocated(page_number: u64, addr: u64, size: usize, mem_type: MemType) -> Self {
        Self {
            page_number,
            addr,
            size,
            image: vec![0u8; size],
            mem_type,
            is_metadata: mem_type.is_metadata(),
            is_mpmde: false,
            is_dirty: false,
            has_published_bytes: false,
            modified_this_tick: false,
            delay_write_until: 0,
            lru_prev: None,
            lru_next: None,
            tick_prev: None,
            tick_next: None,
            dwl_prev: None,
            dwl_next: None,
        }
    }

    pub fn new_mpmde(page_number: u64, addr: u64, image: Vec<u8>, mem_type: MemType) -> Self {
        let size = image.len();
        Self {
            page_number,
            addr,
            size,
            image,
            mem_type,
            is_metadata: true,
            is_mpmde: true,
            is_dirty: false,
            has_published_bytes: false,
            modified_this_tick: false,
            delay_write_until: 0,
            lru_prev: None,
            lru_next: None,
            tick_prev: None,
            tick_next: None,
            dwl_prev: None,
            dwl_next: None,
        }
    }
}
