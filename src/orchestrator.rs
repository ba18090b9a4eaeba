//! The open/create orchestrator: validates access-mode combinations,
//! derives page buffer reservations from meta/raw percentages, and hands
//! back an owned handle whose `Drop` flushes a writer's final tick.

use std::path::{Path, PathBuf};

use crate::cache_shim::CacheShim;
use crate::container::file_vfd::FileVfd;
use crate::error::{CoreError, Result};
use crate::metafile::{RetryLimits, SwmrReaderVfd};
use crate::pagebuffer::PageBufferConfig;

/// Open/create access flags. Mirrors the handful of boolean switches a
/// caller actually needs rather than the full POSIX `open(2)` flag space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessMode(u8);

impl AccessMode {
    pub const EXCL: AccessMode = AccessMode(1 << 0);
    pub const TRUNC: AccessMode = AccessMode(1 << 1);
    pub const RDWR: AccessMode = AccessMode(1 << 2);
    pub const RDONLY: AccessMode = AccessMode(1 << 3);
    pub const SWMR_WRITE: AccessMode = AccessMode(1 << 4);
    pub const SWMR_READ: AccessMode = AccessMode(1 << 5);

    pub const fn union(self, other: AccessMode) -> AccessMode {
        AccessMode(self.0 | other.0)
    }

    pub const fn contains(self, other: AccessMode) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// Builder for the options that govern a core open or create.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    access: AccessMode,
    page_size: u32,
    page_buffer_pages: usize,
    min_meta_pct: u8,
    min_raw_pct: u8,
    md_pages_reserved: u64,
    md_file_path: PathBuf,
    max_lag: u64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            access: AccessMode::default(),
            page_size: 4096,
            page_buffer_pages: 128,
            min_meta_pct: 0,
            min_raw_pct: 0,
            md_pages_reserved: 4,
            md_file_path: PathBuf::from("metadata.swmr"),
            max_lag: 3,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn access(mut self, access: AccessMode) -> Self {
        self.access = access;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Page buffer capacity, rounded down to a whole number of pages.
    pub fn page_buffer_size(mut self, bytes: usize) -> Self {
        self.page_buffer_pages = bytes / self.page_size.max(1) as usize;
        self
    }

    pub fn min_meta_pct(mut self, pct: u8) -> Self {
        self.min_meta_pct = pct;
        self
    }

    pub fn min_raw_pct(mut self, pct: u8) -> Self {
        self.min_raw_pct = pct;
        self
    }

    pub fn md_pages_reserved(mut self, pages: u64) -> Self {
        self.md_pages_reserved = pages;
        self
    }

    pub fn md_file_path(mut self, path: impl AsRef<Path>) -> Self {
        self.md_file_path = path.as_ref().to_path_buf();
        self
    }

    pub fn max_lag(mut self, ticks: u64) -> Self {
        self.max_lag = ticks;
        self
    }

    fn validate_access(&self) -> Result<()> {
        let a = self.access;
        if a.contains(AccessMode::EXCL) && a.contains(AccessMode::TRUNC) {
            return Err(CoreError::InvalidArg(
                "ACC_EXCL and ACC_TRUNC are mutually exclusive".into(),
            ));
        }
        if a.contains(AccessMode::RDWR) && a.contains(AccessMode::RDONLY) {
            return Err(CoreError::InvalidArg(
                "ACC_RDWR and ACC_RDONLY are mutually exclusive".into(),
            ));
        }
        if a.contains(AccessMode::RDWR) && a.contains(AccessMode::SWMR_READ) {
            return Err(CoreError::InvalidArg(
                "ACC_SWMR_READ requires ACC_RDONLY, not ACC_RDWR".into(),
            ));
        }
        if a.contains(AccessMode::RDONLY) && a.contains(AccessMode::SWMR_WRITE) {
            return Err(CoreError::InvalidArg(
                "ACC_SWMR_WRITE requires ACC_RDWR, not ACC_RDONLY".into(),
            ));
        }
        if a.contains(AccessMode::SWMR_WRITE) && !a.contains(AccessMode::RDWR) {
            return Err(CoreError::InvalidArg(
                "ACC_SWMR_WRITE requires ACC_RDWR".into(),
            ));
        }
        if a.contains(AccessMode::SWMR_READ) && !a.contains(AccessMode::RDONLY) {
            return Err(CoreError::InvalidArg(
                "ACC_SWMR_READ requires ACC_RDONLY".into(),
            ));
        }
        Ok(())
    }

    /// Derives `(min_md_pages, min_rd_pages)` from the configured
    /// percentages and the page buffer's total page count.
    fn reservations(&self) -> Result<(usize, usize)> {
        if self.min_meta_pct as u32 + self.min_raw_pct as u32 > 100 {
            return Err(CoreError::InvalidArg(
                "min_meta_pct + min_raw_pct must not exceed 100".into(),
            ));
        }
        let min_md = self.page_buffer_pages * self.min_meta_pct as usize / 100;
        let min_rd = self.page_buffer_pages * self.min_raw_pct as usize / 100;
        Ok((min_md, min_rd))
    }

    fn page_buffer_config(&self) -> Result<PageBufferConfig> {
        let (min_md_pages, min_rd_pages) = self.reservations()?;
        let config = PageBufferConfig {
            max_pages: self.page_buffer_pages,
            min_md_pages,
            min_rd_pages,
            page_size: self.page_size as usize,
            vfd_swmr_writer: self.access.contains(AccessMode::SWMR_WRITE),
            max_lag: self.max_lag,
        };
        config.validate()?;
        Ok(config)
    }

    /// Creates a new container, seeding a fresh metadata file and tick 0
    /// if `ACC_SWMR_WRITE` is set.
    pub fn create(&self, container_path: impl AsRef<Path>) -> Result<CoreHandle> {
        self.validate_access()?;
        if !self.access.contains(AccessMode::RDWR) {
            return Err(CoreError::InvalidArg(
                "create requires ACC_RDWR".into(),
            ));
        }
        let container = FileVfd::open(container_path.as_ref())?;
        let config = self.page_buffer_config()?;
        let shim = CacheShim::new(config, &self.md_file_path, self.md_pages_reserved)?;
        log::info!(
            "created container {:?} with metadata file {:?}",
            container_path.as_ref(),
            self.md_file_path
        );
        Ok(CoreHandle::Writer { container, shim })
    }

    /// Opens an existing container, deciding role (reader or writer)
    /// from the configured access flags.
    pub fn open(&self, container_path: impl AsRef<Path>) -> Result<CoreHandle> {
        self.validate_access()?;

        if self.access.contains(AccessMode::RDWR) {
            let container = FileVfd::open(container_path.as_ref())?;
            let config = self.page_buffer_config()?;
            let shim = CacheShim::new(config, &self.md_file_path, self.md_pages_reserved)?;
            log::info!("opened container {:?} for writing", container_path.as_ref());
            return Ok(CoreHandle::Writer { container, shim });
        }

        if !self.access.contains(AccessMode::SWMR_READ) {
            log::warn!(
                "rejecting open of {:?}: ACC_RDONLY without ACC_SWMR_READ is not a supported role",
                container_path.as_ref()
            );
            return Err(CoreError::InvalidArg(
                "read-only open requires ACC_SWMR_READ".into(),
            ));
        }

        let container = FileVfd::open(container_path.as_ref())?;
        let reader = SwmrReaderVfd::open(
            container,
            &self.md_file_path,
            self.page_size,
            self.md_pages_reserved,
        )?
        .with_retry_limits(RetryLimits::default());
        log::info!("opened container {:?} for reading", container_path.as_ref());
        Ok(CoreHandle::Reader { reader })
    }
}

/// An open core instance. Dropping a writer handle flushes its final
/// tick so no accepted write is lost; dropping a reader handle is a
/// plain close.
pub enum CoreHandle {
    Writer {
        container: FileVfd,
        shim: CacheShim,
    },
    Reader {
        reader: SwmrReaderVfd<FileVfd>,
    },
}

impl CoreHandle {
    pub fn as_writer(&mut self) -> Option<(&mut FileVfd, &mut CacheShim)> {
        match self {
            CoreHandle::Writer { container, shim } => Some((container, shim)),
            CoreHandle::Reader { .. } => None,
        }
    }

    pub fn as_reader(&mut self) -> Option<&mut SwmrReaderVfd<FileVfd>> {
        match self {
            CoreHandle::Reader { reader } => Some(reader),
            CoreHandle::Writer { .. } => None,
        }
    }
}

impl Drop for CoreHandle {
    fn drop(&mut self) {
        if let CoreHandle::Writer { container, shim } = self {
            if let Err(err) = shim.close(container) {
                log::warn!("final close failed: {err}");
            }
        }
    }
}
