//! The tick coordinator: runs one end-of-tick pipeline for a SWMR
//! writer — index update, publish (pages then index then header), tick
//! list release, delayed-write release, and tick advance.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::container::ContainerVfd;
use crate::error::{CoreError, Result};
use crate::metafile::checksum::fletcher32;
use crate::metafile::header::{Header, HEADER_SIZE};
use crate::metafile::index;
use crate::pagebuffer::PageBuffer;

use super::index_table::IndexTable;

/// Owns the metadata file descriptor on the writer side and the
/// in-memory index that mirrors what has been published to it.
pub struct TickCoordinator {
    md_file: File,
    fs_page_size: u32,
    md_pages_reserved: u64,
    next_md_page: u64,
    index: IndexTable,
    cur_tick: u64,
}

impl TickCoordinator {
    /// Creates (or truncates) the metadata file and seeds tick 0 with an
    /// empty index.
    pub fn create(
        md_file_path: impl AsRef<Path>,
        fs_page_size: u32,
        md_pages_reserved: u64,
    ) -> Result<Self> {
        let md_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(md_file_path.as_ref())
            .map_err(|cause| CoreError::IoWrite { addr: 0, cause })?;

        let mut coordinator = Self {
            md_file,
            fs_page_size,
            md_pages_reserved,
            next_md_page: md_pages_reserved,
            index: IndexTable::new(),
            cur_tick: 0,
        };
        coordinator.publish_index_and_header(0)?;
        Ok(coordinator)
    }

    pub fn cur_tick(&self) -> u64 {
        self.cur_tick
    }

    pub fn index(&self) -> &IndexTable {
        &self.index
    }

    fn reserved_bytes(&self) -> u64 {
        self.md_pages_reserved * self.fs_page_size as u64
    }

    /// Reserves the metadata-file pages a new entry of `size` bytes needs
    /// and returns the first one. An MPMDE spans `size.div_ceil(page_size)`
    /// pages, so the next allocation must skip past all of them rather than
    /// just the one page after this entry's start.
    fn allocate_md_page(&mut self, size: usize) -> u32 {
        let page = self.next_md_page as u32;
        let pages = (size as u64).div_ceil(self.fs_page_size as u64).max(1);
        self.next_md_page += pages;
        page
    }

    /// Runs the full end-of-tick pipeline. Writes already accepted into
    /// `page_buffer` (via [`PageBuffer::write`]) before this call become
    /// durable and visible to readers at the new tick.
    pub fn run_tick(
        &mut self,
        page_buffer: &mut PageBuffer,
        container: &mut dyn ContainerVfd,
    ) -> Result<()> {
        let next_tick = self.cur_tick + 1;

        // Entries just dirtied this tick (tick list) and entries dirtied
        // in an earlier tick whose delay has now lapsed (delayed-write
        // list) both need an index/publish decision this tick. A page
        // still within its delay window is left untouched in both the
        // buffer and the published index — that's what lets a reader who
        // hasn't reloaded keep observing its old bytes.
        let snapshot = page_buffer.tick_list_snapshot();
        let due = page_buffer.delayed_due_snapshot(next_tick);

        let mut candidates = snapshot.clone();
        for d in &due {
            if !candidates.iter().any(|s| s.page_number == d.page_number) {
                candidates.push(*d);
            }
        }
        let touched: Vec<u32> = candidates.iter().map(|s| s.page_number as u32).collect();

        let ready: Vec<_> = candidates
            .iter()
            .filter(|s| s.delay_write_until == 0 || s.delay_write_until < next_tick)
            .cloned()
            .collect();

        for s in &ready {
            let container_page = s.page_number as u32;
            let md_page = self
                .index
                .find(container_page)
                .map(|e| e.md_page)
                .unwrap_or_else(|| self.allocate_md_page(s.size));
            // Checksum is finalized once the bytes are actually written
            // below; seed with 0 here and patch after.
            self.index
                .upsert(container_page, md_page, s.size as u32, 0, next_tick, false, 0);
        }

        for entry in self.index.entries().to_vec() {
            if touched.contains(&entry.container_page) {
                continue;
            }
            let resident_and_clean = page_buffer
                .entry_is_dirty(entry.container_page as u64)
                .map(|dirty| !dirty);
            let should_clean = match resident_and_clean {
                None => true,          // no longer resident at all
                Some(true) => true,    // resident but clean
                Some(false) => false,  // still dirty, leave alone
            };
            if !entry.clean && should_clean {
                self.index.mark_clean(entry.container_page, next_tick);
            }
        }

        for s in &ready {
            let container_page = s.page_number as u32;
            let md_page = self.index.find(container_page).unwrap().md_page;
            let bytes = page_buffer
                .entry_image(container_page as u64)
                .ok_or(CoreError::NotFound(s.addr))?
                .to_vec();
            let checksum = fletcher32(&bytes);
            self.write_md_page(md_page, &bytes)?;
            self.index.upsert(
                container_page,
                md_page,
                bytes.len() as u32,
                checksum,
                next_tick,
                true,
                0,
            );
            page_buffer.mark_clean(container_page as u64)?;
        }

        self.publish_index_and_header(next_tick)?;

        page_buffer.release_tick_list(container)?;
        page_buffer.release_expired_delayed_writes(container, next_tick)?;

        page_buffer.set_cur_tick(next_tick);
        self.cur_tick = next_tick;
        Ok(())
    }

    fn write_md_page(&mut self, md_page: u32, bytes: &[u8]) -> Result<()> {
        let offset = md_page as u64 * self.fs_page_size as u64;
        self.md_file
            .seek(SeekFrom::Start(offset))
            .map_err(|cause| CoreError::IoSeek { offset, cause })?;
        self.md_file
            .write_all(bytes)
            .map_err(|cause| CoreError::IoWrite { addr: offset, cause })?;
        Ok(())
    }

    fn publish_index_and_header(&mut self, tick_num: u64) -> Result<()> {
        let records = self.index.to_wire_records();
        let index_bytes = index::encode(tick_num, &records);
        let index_offset = HEADER_SIZE as u64;

        if index_offset + index_bytes.len() as u64 > self.reserved_bytes() {
            return Err(CoreError::SpaceExhausted {
                used: records.len(),
                capacity: self.md_pages_reserved as usize,
            });
        }

        self.md_file
            .seek(SeekFrom::Start(index_offset))
            .map_err(|cause| CoreError::IoSeek {
                offset: index_offset,
                cause,
            })?;
        self.md_file
            .write_all(&index_bytes)
            .map_err(|cause| CoreError::IoWrite {
                addr: index_offset,
                cause,
            })?;
        self.md_file
            .flush()
            .map_err(|cause| CoreError::IoWrite {
                addr: index_offset,
                cause,
            })?;

        let header = Header {
            fs_page_size: self.fs_page_size,
            tick_num,
            index_offset,
            index_length: index_bytes.len() as u64,
        };
        self.md_file
            .seek(SeekFrom::Start(0))
            .map_err(|cause| CoreError::IoSeek { offset: 0, cause })?;
        self.md_file
            .write_all(&header.encode())
            .map_err(|cause| CoreError::IoWrite { addr: 0, cause })?;
        self.md_file
            .flush()
            .map_err(|cause| CoreError::IoWrite { addr: 0, cause })?;
        Ok(())
    }
}
