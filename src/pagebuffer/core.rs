//! The page buffer: hash index, LRU policy, tick list, delayed-write
//! list, make-space algorithm, dirty/clean bookkeeping. Reads and writes
//! are dispatched by memory class, alignment, and span against the page
//! size, with multi-page metadata entries and raw-data bypass handled as
//! special cases.

use std::collections::HashMap;

use crate::container::{ContainerVfd, MemType};
use crate::error::{CoreError, Result};
use crate::stats::PageBufferStats;
use crate::tick::delay;

use super::config::PageBufferConfig;
use super::entry::Entry;
use super::slab::{EntryId, Slab};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum EntryKind {
    Miss,
    Regular,
    Mpmde,
}

/// A snapshot of one tick-list entry taken before it is released, for the
/// tick coordinator's index-update step.
#[derive(Debug, Clone, Copy)]
pub struct TickListSnapshot {
    pub entry_id: EntryId,
    pub page_number: u64,
    pub addr: u64,
    pub size: usize,
    pub is_dirty: bool,
    pub is_mpmde: bool,
    pub delay_write_until: u64,
}

pub struct PageBuffer {
    entries: Slab<Entry>,
    index: HashMap<u64, EntryId>,

    lru_head: Option<EntryId>, // most recently used
    lru_tail: Option<EntryId>, // least recently used; eviction candidate

    tick_head: Option<EntryId>,
    tick_tail: Option<EntryId>,

    dwl_head: Option<EntryId>, // highest delay_until
    dwl_tail: Option<EntryId>, // lowest delay_until; release scan starts here

    config: PageBufferConfig,
    curr_pages: usize,
    curr_md_pages: usize,
    curr_rd_pages: usize,
    prev_addr: Option<u64>,
    cur_tick: u64,
    stats: PageBufferStats,
}

impl PageBuffer {
    pub fn new(config: PageBufferConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            entries: Slab::new(),
            index: HashMap::new(),
            lru_head: None,
            lru_tail: None,
            tick_head: None,
            tick_tail: None,
            dwl_head: None,
            dwl_tail: None,
            config,
            curr_pages: 0,
            curr_md_pages: 0,
            curr_rd_pages: 0,
            prev_addr: None,
            cur_tick: 0,
            stats: PageBufferStats::default(),
        })
    }

    pub fn config(&self) -> &PageBufferConfig {
        &self.config
    }

    pub fn stats(&self) -> PageBufferStats {
        self.stats
    }

    pub fn curr_pages(&self) -> usize {
        self.curr_pages
    }

    pub fn curr_md_pages(&self) -> usize {
        self.curr_md_pages
    }

    pub fn curr_rd_pages(&self) -> usize {
        self.curr_rd_pages
    }

    pub fn cur_tick(&self) -> u64 {
        self.cur_tick
    }

    pub fn set_cur_tick(&mut self, tick: u64) {
        self.cur_tick = tick;
    }

    pub fn page_exists(&self, addr: u64) -> bool {
        self.index.contains_key(&self.page_number(addr))
    }

    fn page_number(&self, addr: u64) -> u64 {
        addr / self.config.page_size as u64
    }

    fn classify(&self, key: u64) -> EntryKind {
        match self.index.get(&key) {
            None => EntryKind::Miss,
            Some(&id) if self.entries.get(id).is_mpmde => EntryKind::Mpmde,
            Some(_) => EntryKind::Regular,
        }
    }

    /// Whether an entry for `page_number` is present and currently dirty.
    /// `None` means the page is not resident at all.
    pub fn entry_is_dirty(&self, page_number: u64) -> Option<bool> {
        self.index
            .get(&page_number)
            .map(|&id| self.entries.get(id).is_dirty)
    }

    pub fn entry_image(&self, page_number: u64) -> Option<&[u8]> {
        self.index
            .get(&page_number)
            .map(|&id| self.entries.get(id).image.as_slice())
    }

    // ---- insertion primitives -------------------------------------------------

    pub fn add_new_page(
        &mut self,
        vfd: &mut dyn ContainerVfd,
        mem_type: MemType,
        page_addr: u64,
    ) -> Result<EntryId> {
        let page_size = self.config.page_size as u64;
        if page_addr % page_size != 0 {
            return Err(CoreError::InvalidArg(
                "add_new_page requires a page-aligned address".into(),
            ));
        }
        let key = page_addr / page_size;
        if self.index.contains_key(&key) {
            return Err(CoreError::Conflict(format!(
                "page {key} is already resident"
            )));
        }
        self.make_space(vfd, mem_type)?;

        let entry = Entry::new_allocated(key, page_addr, self.config.page_size, mem_type);
        let id = self.entries.insert(entry);
        self.index.insert(key, id);
        self.lru_push_front(id);
        self.account_insert(mem_type);
        Ok(id)
    }

    /// Loads a page from the container, or — if the page lies wholly or
    /// partly past the container's current end-of-file — treats the
    /// missing bytes as a fresh, zero-filled allocation rather than
    /// erroring. A page materialized this way is not considered
    /// `has_published_bytes`, so dirtying it later never triggers the
    /// delayed-write policy: no reader could have observed bytes that
    /// never existed.
    fn load_page(
        &mut self,
        vfd: &mut dyn ContainerVfd,
        mem_type: MemType,
        key: u64,
    ) -> Result<EntryId> {
        let page_size = self.config.page_size;
        let addr = key * page_size as u64;
        let eof = vfd.get_eof();

        let entry = if addr >= eof {
            Entry::new_allocated(key, addr, page_size, mem_type)
        } else if addr + page_size as u64 <= eof {
            let image = vfd.read(mem_type, addr, page_size)?;
            Entry::new_loaded(key, addr, image, mem_type)
        } else {
            let avail = (eof - addr) as usize;
            let mut image = vfd.read(mem_type, addr, avail)?;
            image.resize(page_size, 0);
            Entry::new_loaded(key, addr, image, mem_type)
        };

        self.make_space(vfd, mem_type)?;

        let id = self.entries.insert(entry);
        self.index.insert(key, id);
        self.lru_push_front(id);
        self.account_insert(mem_type);
        Ok(id)
    }

    fn account_insert(&mut self, mem_type: MemType) {
        self.curr_pages += 1;
        if mem_type.is_metadata() {
            self.curr_md_pages += 1;
        } else {
            self.curr_rd_pages += 1;
        }
    }

    pub fn remove_entry(&mut self, addr: u64) -> Result<()> {
        let key = self.page_number(addr);
        let id = *self
            .index
            .get(&key)
            .ok_or(CoreError::NotFound(addr))?;

        if self.entries.get(id).modified_this_tick {
            self.tick_remove(id);
        }
        if self.entries.get(id).delay_write_until > 0 {
            self.dwl_remove(id);
        } else if !self.entries.get(id).is_mpmde {
            self.lru_remove(id);
        }
        self.entries.get_mut(id).is_dirty = false;
        self.evict_unlinked(id)
    }

    pub fn update_entry(&mut self, addr: u64, offset: usize, bytes: &[u8]) -> Result<()> {
        let key = self.page_number(addr);
        let id = *self
            .index
            .get(&key)
            .ok_or(CoreError::NotFound(addr))?;
        let entry = self.entries.get_mut(id);
        if offset + bytes.len() > entry.size {
            return Err(CoreError::InvalidArg(
                "update_entry write would run past the end of the page image".into(),
            ));
        }
        entry.image[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.lru_bump(id);
        Ok(())
    }

    // ---- read/write dispatch ---------------------------------------------------

    pub fn read(
        &mut self,
        vfd: &mut dyn ContainerVfd,
        mem_type: MemType,
        addr: u64,
        size: usize,
    ) -> Result<Vec<u8>> {
        if size == 0 {
            return Err(CoreError::InvalidArg("zero-length read".into()));
        }
        let page_size = self.config.page_size as u64;
        let is_metadata = mem_type.is_metadata();
        let page_aligned = addr % page_size == 0;
        let over_page = size as u64 > page_size;
        let key = self.page_number(addr);
        let pa_eq_a = self.prev_addr == Some(addr);
        self.prev_addr = Some(addr);

        if !is_metadata {
            return if over_page {
                self.stats.bypasses += 1;
                self.read_raw_bypass(vfd, addr, size)
            } else {
                match self.classify(key) {
                    EntryKind::Miss => {
                        self.stats.misses += 1;
                        self.load_page(vfd, mem_type, key)?;
                        self.satisfy(key, addr, size, true)
                    }
                    _ => {
                        self.stats.hits += 1;
                        self.satisfy(key, addr, size, true)
                    }
                }
            };
        }

        if !page_aligned {
            return match self.classify(key) {
                EntryKind::Mpmde => Err(CoreError::InvalidArg(
                    "unaligned read into a multi-page metadata entry".into(),
                )),
                EntryKind::Miss => {
                    self.stats.misses += 1;
                    self.load_page(vfd, mem_type, key)?;
                    self.satisfy(key, addr, size, true)
                }
                EntryKind::Regular => {
                    self.stats.hits += 1;
                    self.satisfy(key, addr, size, true)
                }
            };
        }

        if over_page {
            return match self.classify(key) {
                EntryKind::Miss => {
                    self.stats.bypasses += 1;
                    vfd.read(mem_type, addr, size)
                }
                EntryKind::Regular => {
                    if pa_eq_a {
                        self.force_evict_clean(vfd, key)?;
                        self.stats.bypasses += 1;
                        vfd.read(mem_type, addr, size)
                    } else {
                        self.stats.hits += 1;
                        self.satisfy(key, addr, size, true)
                    }
                }
                EntryKind::Mpmde => {
                    if !self.config.vfd_swmr_writer {
                        return Err(CoreError::Unsupported(
                            "multi-page metadata entries require an armed SWMR writer".into(),
                        ));
                    }
                    self.stats.hits += 1;
                    self.satisfy(key, addr, size, true)
                }
            };
        }

        match self.classify(key) {
            EntryKind::Miss => {
                self.stats.misses += 1;
                self.load_page(vfd, mem_type, key)?;
                self.satisfy(key, addr, size, true)
            }
            EntryKind::Regular => {
                self.stats.hits += 1;
                self.satisfy(key, addr, size, true)
            }
            EntryKind::Mpmde => {
                if !self.config.vfd_swmr_writer {
                    return Err(CoreError::Unsupported(
                        "multi-page metadata entries require an armed SWMR writer".into(),
                    ));
                }
                self.stats.hits += 1;
                self.satisfy(key, addr, size, true)
            }
        }
    }

    fn satisfy(&mut self, key: u64, addr: u64, size: usize, bump: bool) -> Result<Vec<u8>> {
        let id = *self.index.get(&key).ok_or(CoreError::NotFound(addr))?;
        let page_size = self.config.page_size as u64;
        let entry_start = key * page_size;
        let offset = (addr - entry_start) as usize;
        let entry = self.entries.get(id);
        let available = entry.size.saturating_sub(offset);
        let len = size.min(available);
        let bytes = entry.image[offset..offset + len].to_vec();
        if bump {
            self.lru_bump(id);
        }
        Ok(bytes)
    }

    fn read_raw_bypass(
        &mut self,
        vfd: &mut dyn ContainerVfd,
        addr: u64,
        size: usize,
    ) -> Result<Vec<u8>> {
        let mut buf = vfd.read(MemType::RawData, addr, size)?;
        let page_size = self.config.page_size as u64;
        let start_page = addr / page_size;
        let end_page = (addr + size as u64 - 1) / page_size;

        for pn in start_page..=end_page {
            let Some(&id) = self.index.get(&pn) else {
                continue;
            };
            let entry = self.entries.get(id);
            if !entry.is_dirty {
                continue;
            }
            let entry_start = pn * page_size;
            let entry_end = entry_start + entry.size as u64;
            let overlap_start = entry_start.max(addr);
            let overlap_end = entry_end.min(addr + size as u64);
            if overlap_start >= overlap_end {
                continue;
            }
            let buf_off = (overlap_start - addr) as usize;
            let img_off = (overlap_start - entry_start) as usize;
            let len = (overlap_end - overlap_start) as usize;
            buf[buf_off..buf_off + len].copy_from_slice(&entry.image[img_off..img_off + len]);
        }
        Ok(buf)
    }

    fn force_evict_clean(&mut self, vfd: &mut dyn ContainerVfd, key: u64) -> Result<()> {
        if let Some(&id) = self.index.get(&key) {
            if self.entries.get(id).is_dirty {
                self.flush_entry(vfd, id)?;
            }
            if !self.entries.get(id).modified_this_tick {
                self.evict(id)?;
            }
        }
        Ok(())
    }

    pub fn write(
        &mut self,
        vfd: &mut dyn ContainerVfd,
        mem_type: MemType,
        addr: u64,
        bytes: &[u8],
    ) -> Result<()> {
        if bytes.is_empty() {
            return Err(CoreError::InvalidArg("zero-length write".into()));
        }
        let page_size = self.config.page_size as u64;
        let size = bytes.len() as u64;
        let is_metadata = mem_type.is_metadata();

        if !is_metadata {
            return if size >= page_size {
                self.write_raw_bypass(vfd, addr, bytes)
            } else {
                self.write_small(vfd, mem_type, addr, bytes)
            };
        }

        if size > page_size {
            return if self.config.vfd_swmr_writer {
                self.write_mpmde(addr, bytes, mem_type)
            } else {
                vfd.write(mem_type, addr, bytes)
            };
        }

        self.write_small(vfd, mem_type, addr, bytes)
    }

    fn write_raw_bypass(
        &mut self,
        vfd: &mut dyn ContainerVfd,
        addr: u64,
        bytes: &[u8],
    ) -> Result<()> {
        vfd.write(MemType::RawData, addr, bytes)?;
        let page_size = self.config.page_size as u64;
        let size = bytes.len() as u64;
        let start_page = addr / page_size;
        let end_page = (addr + size - 1) / page_size;

        for pn in start_page..=end_page {
            let Some(&id) = self.index.get(&pn) else {
                continue;
            };
            let entry_start = pn * page_size;
            let entry_size = self.entries.get(id).size as u64;
            let fully_covered = addr <= entry_start && addr + size >= entry_start + entry_size;
            if fully_covered {
                self.entries.get_mut(id).is_dirty = false;
                if !self.entries.get(id).modified_this_tick {
                    self.evict(id)?;
                }
            } else {
                let overlap_start = entry_start.max(addr);
                let overlap_end = (entry_start + entry_size).min(addr + size);
                let img_off = (overlap_start - entry_start) as usize;
                let src_off = (overlap_start - addr) as usize;
                let len = (overlap_end - overlap_start) as usize;
                self.entries.get_mut(id).image[img_off..img_off + len]
                    .copy_from_slice(&bytes[src_off..src_off + len]);
                self.mark_entry_dirty(id);
            }
        }
        Ok(())
    }

    fn write_small(
        &mut self,
        vfd: &mut dyn ContainerVfd,
        mem_type: MemType,
        addr: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let page_size = self.config.page_size as u64;
        let key = self.page_number(addr);
        if self.classify(key) == EntryKind::Miss {
            self.load_page(vfd, mem_type, key)?;
        }
        let id = *self.index.get(&key).ok_or(CoreError::NotFound(addr))?;
        if self.entries.get(id).is_mpmde {
            return Err(CoreError::InvalidArg(
                "sub-page write into a multi-page metadata entry".into(),
            ));
        }
        let offset = (addr - key * page_size) as usize;
        let entry = self.entries.get_mut(id);
        if offset + bytes.len() > entry.size {
            return Err(CoreError::InvalidArg(
                "write would run past the end of the page".into(),
            ));
        }
        entry.image[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.mark_entry_dirty(id);
        Ok(())
    }

    fn write_mpmde(&mut self, addr: u64, bytes: &[u8], mem_type: MemType) -> Result<()> {
        let page_size = self.config.page_size as u64;
        if addr % page_size != 0 {
            return Err(CoreError::InvalidArg(
                "a multi-page metadata entry must start on a page boundary".into(),
            ));
        }
        let key = addr / page_size;
        let id = match self.index.get(&key) {
            Some(&id) => {
                if self.entries.get(id).size != bytes.len() {
                    return Err(CoreError::InvalidArg(
                        "resizing an existing multi-page metadata entry is not supported".into(),
                    ));
                }
                self.entries.get_mut(id).image.copy_from_slice(bytes);
                id
            }
            None => {
                let entry = Entry::new_mpmde(key, addr, bytes.to_vec(), mem_type);
                let id = self.entries.insert(entry);
                self.index.insert(key, id);
                self.account_insert(mem_type);
                id
            }
        };
        self.mark_entry_dirty(id);
        Ok(())
    }

    // ---- dirty/clean bookkeeping ------------------------------------------------

    /// A page with `has_published_bytes` already has bytes a reader may
    /// currently be observing (via the metadata file or, pre-SWMR, via
    /// the container itself), so dirtying it moves it onto the
    /// delayed-write list instead of letting its new bytes reach the
    /// container before `delay_until` ticks have passed.
    fn mark_entry_dirty(&mut self, id: EntryId) {
        let already_active_dirty = {
            let e = self.entries.get(id);
            e.is_dirty && !e.is_mpmde && e.delay_write_until == 0
        };
        if already_active_dirty {
            self.lru_bump(id);
            return;
        }

        let has_published_bytes = self.entries.get(id).has_published_bytes;
        let is_metadata = self.entries.get(id).is_metadata;
        self.entries.get_mut(id).is_dirty = true;

        if self.config.vfd_swmr_writer {
            self.tick_push_back_if_absent(id);
        }

        if self.config.vfd_swmr_writer && has_published_bytes && is_metadata {
            let delay_until = delay::compute_delay_until(self.cur_tick, self.config.max_lag);
            if delay_until > 0 {
                if !self.entries.get(id).is_mpmde {
                    self.lru_remove(id);
                }
                self.entries.get_mut(id).delay_write_until = delay_until;
                self.dwl_insert_sorted(id);
            }
        }
    }

    /// Marks a resident page dirty without supplying new bytes — for a
    /// caller that mutated the page's image through some other handle and
    /// only needs this entry to join the tick list and delayed-write
    /// accounting.
    pub fn touch_dirty(&mut self, page_number: u64) -> Result<()> {
        let id = *self
            .index
            .get(&page_number)
            .ok_or(CoreError::NotFound(page_number))?;
        self.mark_entry_dirty(id);
        Ok(())
    }

    pub fn mark_clean(&mut self, page_number: u64) -> Result<()> {
        let id = *self
            .index
            .get(&page_number)
            .ok_or(CoreError::NotFound(page_number))?;
        let entry = self.entries.get_mut(id);
        entry.is_dirty = false;
        // Once a page has been published, any reader could have cached
        // its bytes — the next time it's dirtied, the delayed-write
        // policy must hold the old bytes until the delay lapses, not
        // just on the page's very first load from the container.
        entry.has_published_bytes = true;
        Ok(())
    }

    // ---- flush / evict / make-space --------------------------------------------

    fn flush_entry(&mut self, vfd: &mut dyn ContainerVfd, id: EntryId) -> Result<()> {
        let (dirty, mem_type, addr, needs_write) = {
            let entry = self.entries.get(id);
            (entry.is_dirty, entry.mem_type, entry.addr, entry.is_dirty)
        };
        if dirty {
            let image = self.entries.get(id).image.clone();
            vfd.write(mem_type, addr, &image)?;
        }
        let _ = needs_write;
        self.entries.get_mut(id).is_dirty = false;
        Ok(())
    }

    /// Evicts an entry that is still linked into the LRU or DWL.
    fn evict(&mut self, id: EntryId) -> Result<()> {
        let (dirty, on_tick_list, delayed) = {
            let e = self.entries.get(id);
            (e.is_dirty, e.modified_this_tick, e.delay_write_until > 0)
        };
        if dirty {
            return Err(CoreError::StateMismatch(
                "cannot evict a dirty entry".into(),
            ));
        }
        if on_tick_list {
            return Err(CoreError::StateMismatch(
                "cannot evict an entry still on the tick list".into(),
            ));
        }
        if delayed {
            self.dwl_remove(id);
        } else if !self.entries.get(id).is_mpmde {
            self.lru_remove(id);
        }
        self.evict_unlinked(id)
    }

    /// Finishes eviction for an entry already unlinked from every list.
    fn evict_unlinked(&mut self, id: EntryId) -> Result<()> {
        let page_number = self.entries.get(id).page_number;
        let is_md = self.entries.get(id).is_metadata;
        self.index.remove(&page_number);
        self.entries.remove(id);
        self.curr_pages -= 1;
        if is_md {
            self.curr_md_pages -= 1;
        } else {
            self.curr_rd_pages -= 1;
        }
        self.stats.evictions += 1;
        Ok(())
    }

    pub fn flush(&mut self, vfd: &mut dyn ContainerVfd) -> Result<()> {
        let ids: Vec<EntryId> = self.entries.iter_ids().collect();
        for id in ids {
            if self.entries.get(id).is_dirty {
                self.flush_entry(vfd, id)?;
            }
        }
        Ok(())
    }

    /// Flushes every dirty entry to the container, then evicts every
    /// resident page so the buffer ends up empty. This is the non-SWMR
    /// close path — it ignores tick discipline entirely, so it must not
    /// be used while a SWMR writer still has entries on the
    /// delayed-write list waiting out their lag.
    pub fn close(&mut self, vfd: &mut dyn ContainerVfd) -> Result<()> {
        self.flush(vfd)?;
        let page_numbers: Vec<u64> = self.index.keys().copied().collect();
        for page_number in page_numbers {
            let addr = page_number * self.config.page_size as u64;
            self.remove_entry(addr)?;
        }
        Ok(())
    }

    fn make_space(&mut self, vfd: &mut dyn ContainerVfd, inserting_type: MemType) -> Result<()> {
        let inserting_md = inserting_type.is_metadata();
        if (inserting_md && self.config.min_rd_pages == self.config.max_pages)
            || (!inserting_md && self.config.min_md_pages == self.config.max_pages)
        {
            return Err(CoreError::Unsupported(
                "page buffer is configured exclusively for the other memory class".into(),
            ));
        }

        let mut cursor = self.lru_tail;
        while self.curr_pages >= self.config.max_pages {
            let Some(id) = cursor else { break };
            let entry = self.entries.get(id);

            if entry.modified_this_tick {
                cursor = entry.lru_prev;
                continue;
            }

            let is_md = entry.is_metadata;
            if inserting_md
                && !is_md
                && self.config.min_rd_pages > 0
                && self.curr_rd_pages <= self.config.min_rd_pages
            {
                cursor = entry.lru_prev;
                continue;
            }
            if !inserting_md
                && is_md
                && self.config.min_md_pages > 0
                && self.curr_md_pages <= self.config.min_md_pages
            {
                cursor = entry.lru_prev;
                continue;
            }

            let next_cursor = entry.lru_prev;
            if entry.is_dirty {
                self.flush_entry(vfd, id)?;
                self.lru_bump(id);
            } else {
                self.evict(id)?;
            }
            cursor = next_cursor;
        }

        if self.curr_pages >= self.config.max_pages {
            if self.config.vfd_swmr_writer {
                self.stats.make_space_overflow += 1;
            } else {
                return Err(CoreError::SpaceExhausted {
                    used: self.curr_pages,
                    capacity: self.config.max_pages,
                });
            }
        }
        Ok(())
    }

    // ---- tick coordinator hooks --------------------------------------------------

    /// Read-only view of the tick list, for the index-update step. Does
    /// not unlink anything.
    pub fn tick_list_snapshot(&self) -> Vec<TickListSnapshot> {
        let mut out = Vec::new();
        let mut cursor = self.tick_head;
        while let Some(id) = cursor {
            let e = self.entries.get(id);
            out.push(TickListSnapshot {
                entry_id: id,
                page_number: e.page_number,
                addr: e.addr,
                size: e.size,
                is_dirty: e.is_dirty,
                is_mpmde: e.is_mpmde,
                delay_write_until: e.delay_write_until,
            });
            cursor = e.tick_next;
        }
        out
    }

    /// Read-only view of delayed-write-list entries whose delay has
    /// expired as of `next_tick` — pages dirtied in a past tick that were
    /// held back from publish and are now due. Does not unlink anything;
    /// pair with [`PageBuffer::release_expired_delayed_writes`] after
    /// actually publishing them.
    pub fn delayed_due_snapshot(&self, next_tick: u64) -> Vec<TickListSnapshot> {
        let mut out = Vec::new();
        let mut cursor = self.dwl_tail;
        while let Some(id) = cursor {
            let e = self.entries.get(id);
            if e.delay_write_until >= next_tick {
                break;
            }
            out.push(TickListSnapshot {
                entry_id: id,
                page_number: e.page_number,
                addr: e.addr,
                size: e.size,
                is_dirty: e.is_dirty,
                is_mpmde: e.is_mpmde,
                delay_write_until: e.delay_write_until,
            });
            cursor = e.dwl_prev;
        }
        out
    }

    /// Unlinks every entry from the tick list. MPMDEs not on the delayed
    /// write list are flushed and evicted immediately; everything else
    /// stays resident on whichever list (LRU or DWL) already held it.
    pub fn release_tick_list(&mut self, vfd: &mut dyn ContainerVfd) -> Result<()> {
        while let Some(id) = self.tick_head {
            self.tick_remove(id);
            let should_evict = {
                let e = self.entries.get(id);
                e.is_mpmde && e.delay_write_until == 0
            };
            if should_evict {
                self.flush_entry(vfd, id)?;
                self.evict(id)?;
            }
        }
        Ok(())
    }

    /// Scans the delayed-write list tail (lowest `delay_until`) upward,
    /// releasing every entry whose delay has expired as of `cur_tick`.
    pub fn release_expired_delayed_writes(
        &mut self,
        vfd: &mut dyn ContainerVfd,
        cur_tick: u64,
    ) -> Result<()> {
        loop {
            let Some(id) = self.dwl_tail else { break };
            if self.entries.get(id).delay_write_until >= cur_tick {
                break;
            }
            self.dwl_remove(id);
            self.entries.get_mut(id).delay_write_until = 0;
            if self.entries.get(id).is_mpmde {
                self.flush_entry(vfd, id)?;
                self.evict(id)?;
            } else {
                self.lru_push_front(id);
            }
        }
        Ok(())
    }

    // ---- LRU list ---------------------------------------------------------------

    fn lru_push_front(&mut self, id: EntryId) {
        let old_head = self.lru_head;
        {
            let e = self.entries.get_mut(id);
            e.lru_prev = None;
            e.lru_next = old_head;
        }
        if let Some(h) = old_head {
            self.entries.get_mut(h).lru_prev = Some(id);
        }
        self.lru_head = Some(id);
        if self.lru_tail.is_none() {
            self.lru_tail = Some(id);
        }
    }

    fn lru_remove(&mut self, id: EntryId) {
        let (prev, next) = {
            let e = self.entries.get(id);
            (e.lru_prev, e.lru_next)
        };
        match prev {
            Some(p) => self.entries.get_mut(p).lru_next = next,
            None => self.lru_head = next,
        }
        match next {
            Some(n) => self.entries.get_mut(n).lru_prev = prev,
            None => self.lru_tail = prev,
        }
        let e = self.entries.get_mut(id);
        e.lru_prev = None;
        e.lru_next = None;
    }

    fn lru_bump(&mut self, id: EntryId) {
        if self.lru_head == Some(id) {
            return;
        }
        self.lru_remove(id);
        self.lru_push_front(id);
    }

    // ---- tick list ---------------------------------------------------------------

    fn tick_push_back_if_absent(&mut self, id: EntryId) {
        if self.entries.get(id).modified_this_tick {
            return;
        }
        self.entries.get_mut(id).modified_this_tick = true;
        let old_tail = self.tick_tail;
        {
            let e = self.entries.get_mut(id);
            e.tick_next = None;
            e.tick_prev = old_tail;
        }
        if let Some(t) = old_tail {
            self.entries.get_mut(t).tick_next = Some(id);
        }
        self.tick_tail = Some(id);
        if self.tick_head.is_none() {
            self.tick_head = Some(id);
        }
    }

    fn tick_remove(&mut self, id: EntryId) {
        let (prev, next) = {
            let e = self.entries.get(id);
            (e.tick_prev, e.tick_next)
        };
        match prev {
            Some(p) => self.entries.get_mut(p).tick_next = next,
            None => self.tick_head = next,
        }
        match next {
            Some(n) => self.entries.get_mut(n).tick_prev = prev,
            None => self.tick_tail = prev,
        }
        let e = self.entries.get_mut(id);
        e.tick_prev = None;
        e.tick_next = None;
        e.modified_this_tick = false;
    }

    // ---- delayed-write list (sorted descending by delay_until) -----------------

    fn dwl_insert_sorted(&mut self, id: EntryId) {
        let delay_until = self.entries.get(id).delay_write_until;
        let mut cursor = self.dwl_head;
        while let Some(c) = cursor {
            if self.entries.get(c).delay_write_until <= delay_until {
                break;
            }
            cursor = self.entries.get(c).dwl_next;
        }

        match cursor {
            Some(c) => {
                let prev = self.entries.get(c).dwl_prev;
                {
                    let e = self.entries.get_mut(id);
                    e.dwl_prev = prev;
                    e.dwl_next = Some(c);
                }
                match prev {
                    Some(p) => self.entries.get_mut(p).dwl_next = Some(id),
                    None => self.dwl_head = Some(id),
                }
                self.entries.get_mut(c).dwl_prev = Some(id);
            }
            None => {
                let old_tail = self.dwl_tail;
                {
                    let e = self.entries.get_mut(id);
                    e.dwl_prev = old_tail;
                    e.dwl_next = None;
                }
                match old_tail {
                    Some(t) => self.entries.get_mut(t).dwl_next = Some(id),
                    None => self.dwl_head = Some(id),
                }
                self.dwl_tail = Some(id);
            }
        }
    }

    fn dwl_remove(&mut self, id: EntryId) {
        let (prev, next) = {
            let e = self.entries.get(id);
            (e.dwl_prev, e.dwl_next)
        };
        match prev {
            Some(p) => self.entries.get_mut(p).dwl_next = next,
            None => self.dwl_head = next,
        }
        match next {
            Some(n) => self.entries.get_mut(n).dwl_prev = prev,
            None => self.dwl_tail = prev,
        }
        let e = self.entries.get_mut(id);
        e.dwl_prev = None;
        e.dwl_next = None;
    }
}
