//! The public surface a higher-level metadata cache would call: a facade
//! over the page buffer and the tick coordinator that keeps their
//! operations in the order the SWMR protocol requires.

use crate::container::{Addr, ContainerVfd, MemType};
use crate::error::Result;
use crate::pagebuffer::{EntryId, PageBuffer, PageBufferConfig};
use crate::tick::TickCoordinator;

use std::path::Path;

/// What kind of higher-level object a buffered page backs. The core has
/// no object model of its own; this tag is just enough for a caller to
/// recover which namespace an address belongs to without a `match` on a
/// raw integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    File,
    Group,
    Dataset,
    Datatype,
    Attribute,
    Reference,
}

/// An object's class plus its address, as a higher-level cache would
/// look it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLocation {
    pub kind: EntityKind,
    pub addr: Addr,
}

impl EntityKind {
    pub fn oloc_of(self, addr: Addr) -> ObjectLocation {
        ObjectLocation { kind: self, addr }
    }
}

/// Binds a [`PageBuffer`] to the [`TickCoordinator`] that publishes its
/// dirty pages, and exposes the operations a metadata cache sitting above
/// the core would call.
pub struct CacheShim {
    page_buffer: PageBuffer,
    coordinator: TickCoordinator,
}

impl CacheShim {
    pub fn new(
        config: PageBufferConfig,
        md_file_path: impl AsRef<Path>,
        md_pages_reserved: u64,
    ) -> Result<Self> {
        let page_size = config.page_size as u32;
        Ok(Self {
            page_buffer: PageBuffer::new(config)?,
            coordinator: TickCoordinator::create(md_file_path, page_size, md_pages_reserved)?,
        })
    }

    pub fn page_buffer(&self) -> &PageBuffer {
        &self.page_buffer
    }

    pub fn cur_tick(&self) -> u64 {
        self.coordinator.cur_tick()
    }

    pub fn add_new(
        &mut self,
        vfd: &mut dyn ContainerVfd,
        mem_type: MemType,
        addr: Addr,
    ) -> Result<EntryId> {
        self.page_buffer.add_new_page(vfd, mem_type, addr)
    }

    pub fn remove(&mut self, addr: Addr) -> Result<()> {
        self.page_buffer.remove_entry(addr)
    }

    pub fn read(
        &mut self,
        vfd: &mut dyn ContainerVfd,
        mem_type: MemType,
        addr: Addr,
        size: usize,
    ) -> Result<Vec<u8>> {
        self.page_buffer.read(vfd, mem_type, addr, size)
    }

    pub fn write(
        &mut self,
        vfd: &mut dyn ContainerVfd,
        mem_type: MemType,
        addr: Addr,
        bytes: &[u8],
    ) -> Result<()> {
        self.page_buffer.write(vfd, mem_type, addr, bytes)
    }

    pub fn notify_dirty(&mut self, page_number: u64) -> Result<()> {
        self.page_buffer.touch_dirty(page_number)
    }

    pub fn notify_clean(&mut self, page_number: u64) -> Result<()> {
        self.page_buffer.mark_clean(page_number)
    }

    /// Runs one full tick: updates the in-memory index from the tick
    /// list, publishes pages then the index then the header, releases
    /// the tick list, and releases any delayed writes that have expired.
    /// These four steps (`update_index`, `publish`, `release_tick_list`,
    /// `release_delayed_writes`) are not exposed individually — running
    /// them out of order would let a reader observe an index that
    /// describes pages not yet durable, so this is the only entry point.
    pub fn run_tick(&mut self, vfd: &mut dyn ContainerVfd) -> Result<()> {
        self.coordinator.run_tick(&mut self.page_buffer, vfd)
    }

    /// Closes out a writer. An armed SWMR writer runs one final tick so
    /// any outstanding dirty pages are published before the handle goes
    /// away; otherwise the tick coordinator's publish pipeline never
    /// applies, so every resident page is flushed straight to the
    /// container and evicted instead.
    pub fn close(&mut self, vfd: &mut dyn ContainerVfd) -> Result<()> {
        if self.page_buffer.config().vfd_swmr_writer {
            self.run_tick(vfd)
        } else {
            self.page_buffer.close(vfd)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::file_vfd::FileVfd;
    use tempdir::TempDir;

    fn config() -> PageBufferConfig {
        PageBufferConfig {
            max_pages: 16,
            min_md_pages: 0,
            min_rd_pages: 0,
            page_size: 4096,
            vfd_swmr_writer: true,
            max_lag: 3,
        }
    }

    #[test]
    fn oloc_of_carries_the_address_through() {
        let oloc = EntityKind::Dataset.oloc_of(128);
        assert_eq!(oloc.kind, EntityKind::Dataset);
        assert_eq!(oloc.addr, 128);
    }

    #[test]
    fn write_read_and_tick_round_trip_through_the_shim() {
        let dir = TempDir::new("shim").unwrap();
        let mut vfd = FileVfd::open(dir.path().join("container.db")).unwrap();
        let mut shim = CacheShim::new(config(), dir.path().join("meta.db"), 4).unwrap();

        shim.write(&mut vfd, MemType::Metadata, 0, b"abc").unwrap();
        let bytes = shim.read(&mut vfd, MemType::Metadata, 0, 3).unwrap();
        assert_eq!(bytes, b"abc");

        shim.run_tick(&mut vfd).unwrap();
        assert_eq!(shim.cur_tick(), 1);
    }
}
