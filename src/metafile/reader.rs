//! The reader-side VFD: loads and validates the metadata file with
//! bounded retries, and routes each read either to a metadata-file page
//! or through to the container VFD.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::Duration;

use crate::container::{Addr, ContainerVfd, MemType};
use crate::error::{CoreError, Result};
use crate::retry::{retry_until, Clock, SystemClock};

use super::checksum::fletcher32;
use super::header::{Header, HEADER_SIZE};
use super::index::{self, IndexRecord};

/// Retry budgets, broken out so tests can shrink them instead of waiting
/// out the production defaults.
#[derive(Debug, Clone, Copy)]
pub struct RetryLimits {
    pub header: u32,
    pub index: u32,
    pub page: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            header: 10,
            index: 10,
            page: 10,
        }
    }
}

/// Per-reader retry counters, useful for diagnosing a writer that is
/// publishing unusually slowly.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReaderStats {
    pub header_retries: u32,
    pub index_retries: u32,
    pub page_retries: u32,
}

/// Wraps a container VFD and a metadata-file descriptor. Writes and
/// truncation are always rejected: a reader never mutates either file.
pub struct SwmrReaderVfd<V: ContainerVfd> {
    container: V,
    md_file: File,
    fs_page_size: u32,
    md_pages_reserved: u64,
    local_header: Option<Header>,
    local_index: Vec<IndexRecord>,
    /// Becomes `true` once the owning page buffer has been initialized;
    /// before that, partial/misaligned reads against an index-satisfied
    /// page skip checksum validation, since the bootstrap reader has no
    /// page buffer yet to reconcile a partial read against.
    page_buffer_configured: bool,
    limits: RetryLimits,
    clock: Box<dyn Clock>,
    stats: ReaderStats,
}

impl<V: ContainerVfd> SwmrReaderVfd<V> {
    pub fn open(
        container: V,
        md_file_path: impl AsRef<Path>,
        fs_page_size: u32,
        md_pages_reserved: u64,
    ) -> Result<Self> {
        let md_file = File::open(md_file_path.as_ref()).map_err(|cause| CoreError::IoRead {
            addr: 0,
            cause,
        })?;
        let mut reader = Self {
            container,
            md_file,
            fs_page_size,
            md_pages_reserved,
            local_header: None,
            local_index: Vec::new(),
            page_buffer_configured: false,
            limits: RetryLimits::default(),
            clock: Box::new(SystemClock),
            stats: ReaderStats::default(),
        };
        reader.reload()?;
        Ok(reader)
    }

    pub fn with_retry_limits(mut self, limits: RetryLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn mark_page_buffer_configured(&mut self) {
        self.page_buffer_configured = true;
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    pub fn local_tick(&self) -> u64 {
        self.local_header.map(|h| h.tick_num).unwrap_or(0)
    }

    /// Reloads the header and, if it advanced (or this is the first
    /// load), the index.
    pub fn reload(&mut self) -> Result<()> {
        let local_tick = self.local_header.map(|h| h.tick_num);

        let header = self.read_header_with_retries(local_tick)?;

        let needs_index_reload = match local_tick {
            None => true,
            Some(t) => header.tick_num > t,
        };

        if !needs_index_reload {
            return Ok(());
        }

        let reserved_bytes = self.md_pages_reserved * self.fs_page_size as u64;
        if header.index_offset + header.index_length > reserved_bytes {
            return Err(CoreError::Truncated {
                expected: header.index_offset + header.index_length,
                found: reserved_bytes,
            });
        }

        let records = self.read_index_with_retries(&header)?;

        self.local_header = Some(header);
        self.local_index = records;
        Ok(())
    }

    fn read_header_with_retries(&mut self, local_tick: Option<u64>) -> Result<Header> {
        let limits = self.limits;
        let mut tries = 0u32;
        let md_file = &mut self.md_file;
        let clock = self.clock.as_ref();
        let result = retry_until(limits.header, Duration::from_nanos(1), clock, |_| {
            tries += 1;
            let mut buf = [0u8; HEADER_SIZE];
            md_file.seek(SeekFrom::Start(0)).ok()?;
            md_file.read_exact(&mut buf).ok()?;
            Header::decode(&buf).ok()
        });
        self.stats.header_retries += tries.saturating_sub(1);

        let header = result.ok_or(CoreError::ChecksumMismatch {
            what: "header",
            retries: limits.header,
        })?;

        if let Some(local) = local_tick {
            if header.tick_num < local {
                return Err(CoreError::TickRegression {
                    local,
                    candidate: header.tick_num,
                });
            }
        }

        Ok(header)
    }

    fn read_index_with_retries(&mut self, header: &Header) -> Result<Vec<IndexRecord>> {
        let limits = self.limits;
        let local_tick = header.tick_num;
        let mut tries = 0u32;
        let md_file = &mut self.md_file;
        let clock = self.clock.as_ref();

        let result = retry_until(limits.index, Duration::from_nanos(1), clock, |_| {
            tries += 1;
            let mut buf = vec![0u8; header.index_length as usize];
            md_file.seek(SeekFrom::Start(header.index_offset)).ok()?;
            md_file.read_exact(&mut buf).ok()?;
            let (index_tick, records) = index::decode(&buf).ok()?;

            if local_tick == index_tick {
                Some(records)
            } else if local_tick == index_tick + 1 {
                // Writer is mid-publish: index not yet rolled for this tick.
                None
            } else {
                None
            }
        });

        self.stats.index_retries += tries.saturating_sub(1);

        result.ok_or(CoreError::ChecksumMismatch {
            what: "index",
            retries: limits.index,
        })
    }

    /// Routes a read either through the cached metadata-file index or to
    /// the container VFD, depending on whether the target page is covered
    /// by the locally cached index.
    pub fn read(&mut self, mem_type: MemType, addr: Addr, size: usize) -> Result<Vec<u8>> {
        let page_size = self.fs_page_size as u64;
        let target_page = (addr / page_size) as u32;

        let record = match self
            .local_index
            .binary_search_by_key(&target_page, |r| r.container_page)
        {
            Ok(pos) => self.local_index[pos],
            Err(_) => return self.container.read(mem_type, addr, size),
        };

        if self.page_buffer_configured {
            if size != record.length as usize || addr != target_page as u64 * page_size {
                return Err(CoreError::InvalidArg(
                    "once the page buffer is configured, index-satisfied reads must cover the whole page".into(),
                ));
            }
            self.read_md_page_checked(&record)
        } else {
            let page_start = target_page as u64 * page_size;
            if addr < page_start || addr + size as u64 > page_start + record.length as u64 {
                return Err(CoreError::InvalidArg(
                    "read crosses a page boundary".into(),
                ));
            }
            let md_offset =
                record.md_page as u64 * page_size + (addr - page_start);
            self.read_md_bytes(md_offset, size)
        }
    }

    fn read_md_page_checked(&mut self, record: &IndexRecord) -> Result<Vec<u8>> {
        let page_size = self.fs_page_size as u64;
        let md_offset = record.md_page as u64 * page_size;
        let length = record.length as usize;
        let expected_checksum = record.checksum;
        let limits = self.limits;
        let mut tries = 0u32;
        let md_file = &mut self.md_file;
        let clock = self.clock.as_ref();

        let result = retry_until(limits.page, Duration::from_nanos(1), clock, |_| {
            tries += 1;
            let mut buf = vec![0u8; length];
            md_file.seek(SeekFrom::Start(md_offset)).ok()?;
            md_file.read_exact(&mut buf).ok()?;
            if fletcher32(&buf) == expected_checksum {
                Some(buf)
            } else {
                None
            }
        });

        self.stats.page_retries += tries.saturating_sub(1);

        result.ok_or(CoreError::ChecksumMismatch {
            what: "metadata-file page",
            retries: limits.page,
        })
    }

    fn read_md_bytes(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        self.md_file
            .seek(SeekFrom::Start(offset))
            .map_err(|cause| CoreError::IoSeek { offset, cause })?;
        let mut buf = vec![0u8; size];
        self.md_file
            .read_exact(&mut buf)
            .map_err(|cause| CoreError::IoRead { addr: offset, cause })?;
        Ok(buf)
    }

    /// Always fails: readers never mutate the container.
    pub fn write(&mut self, _mem_type: MemType, _addr: Addr, _bytes: &[u8]) -> Result<()> {
        Err(CoreError::StateMismatch(
            "write through a read-only SWMR reader VFD".into(),
        ))
    }

    /// Always fails: readers never truncate the container.
    pub fn truncate(&mut self) -> Result<()> {
        Err(CoreError::StateMismatch(
            "truncate through a read-only SWMR reader VFD".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::file_vfd::FileVfd;
    use crate::metafile::header::Header;
    use std::fs::OpenOptions;
    use std::io::Write as _;
    use tempdir::TempDir;

    const PAGE_SIZE: u32 = 4096;

    fn write_metafile(path: &Path, tick: u64, records: &[IndexRecord], pages: &[(u32, Vec<u8>)]) {
        let index_offset = HEADER_SIZE as u64;
        let index_bytes = index::encode(tick, records);
        let header = Header {
            fs_page_size: PAGE_SIZE,
            tick_num: tick,
            index_offset,
            index_length: index_bytes.len() as u64,
        };

        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .unwrap();
        f.write_all(&header.encode()).unwrap();
        f.write_all(&index_bytes).unwrap();

        let reserved = 4 * PAGE_SIZE as u64; // plenty of reserved header+index room
        f.set_len(reserved).unwrap();
        for (md_page, bytes) in pages {
            f.seek(SeekFrom::Start(*md_page as u64 * PAGE_SIZE as u64))
                .unwrap();
            f.write_all(bytes).unwrap();
        }
    }

    #[test]
    fn read_forwards_misses_to_the_container() {
        let dir = TempDir::new("reader").unwrap();
        let container_path = dir.path().join("container.db");
        let mut container = FileVfd::open(&container_path).unwrap();
        container
            .write(MemType::Metadata, 0, &[7u8; PAGE_SIZE as usize])
            .unwrap();

        let md_path = dir.path().join("meta.db");
        write_metafile(&md_path, 0, &[], &[]);

        let mut reader =
            SwmrReaderVfd::open(container, &md_path, PAGE_SIZE, 4).unwrap();
        let bytes = reader.read(MemType::Metadata, 0, PAGE_SIZE as usize).unwrap();
        assert_eq!(bytes, vec![7u8; PAGE_SIZE as usize]);
    }

    #[test]
    fn read_routes_indexed_page_through_the_metadata_file() {
        let dir = TempDir::new("reader").unwrap();
        let container_path = dir.path().join("container.db");
        let container = FileVfd::open(&container_path).unwrap();

        let page_bytes = vec![9u8; PAGE_SIZE as usize];
        let checksum = fletcher32(&page_bytes);
        let records = vec![IndexRecord {
            container_page: 2,
            md_page: 0,
            length: PAGE_SIZE,
            checksum,
        }];

        let md_path = dir.path().join("meta.db");
        write_metafile(&md_path, 1, &records, &[(0, page_bytes.clone())]);

        let mut reader =
            SwmrReaderVfd::open(container, &md_path, PAGE_SIZE, 4).unwrap();
        reader.mark_page_buffer_configured();

        let addr = 2 * PAGE_SIZE as u64;
        let bytes = reader
            .read(MemType::Metadata, addr, PAGE_SIZE as usize)
            .unwrap();
        assert_eq!(bytes, page_bytes);
    }

    #[test]
    fn write_and_truncate_are_rejected() {
        let dir = TempDir::new("reader").unwrap();
        let container = FileVfd::open(dir.path().join("container.db")).unwrap();
        let md_path = dir.path().join("meta.db");
        write_metafile(&md_path, 0, &[], &[]);

        let mut reader =
            SwmrReaderVfd::open(container, &md_path, PAGE_SIZE, 4).unwrap();
        assert!(reader.write(MemType::Metadata, 0, b"x").is_err());
        assert!(reader.truncate().is_err());
    }

    #[test]
    fn reload_rejects_tick_regression() {
        let dir = TempDir::new("reader").unwrap();
        let container = FileVfd::open(dir.path().join("container.db")).unwrap();
        let md_path = dir.path().join("meta.db");
        write_metafile(&md_path, 5, &[], &[]);

        let mut reader =
            SwmrReaderVfd::open(container, &md_path, PAGE_SIZE, 4).unwrap();
        assert_eq!(reader.local_tick(), 5);

        write_metafile(&md_path, 2, &[], &[]);
        assert!(reader.reload().is_err());
    }
}
