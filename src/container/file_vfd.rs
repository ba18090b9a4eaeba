//! A file-backed [`ContainerVfd`]. Wraps a [`std::fs::File`] behind a
//! `BufReader`/`BufWriter` pair the way `storage::pager::Pager` wraps its
//! file handle, but speaks typed, address-based block I/O instead of page
//! IDs.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{CoreError, Result};

use super::{Addr, ContainerVfd, LockMode, MemType, VfdFeatures};

/// Allocation rounds every request up to a multiple of `alignment` once
/// the request is at least `threshold` bytes; below threshold, allocation
/// is a plain bump past the current EOA.
#[derive(Debug, Clone, Copy)]
pub struct AllocationPolicy {
    pub alignment: u64,
    pub threshold: u64,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            alignment: 1,
            threshold: 1,
        }
    }
}

/// File-backed Container VFD.
#[derive(Debug)]
pub struct FileVfd {
    reader: BufReader<File>,
    writer: BufWriter<File>,
    eoa: HashMap<MemType, Addr>,
    eof: Addr,
    policy: AllocationPolicy,
    lock: Option<LockMode>,
}

impl FileVfd {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, AllocationPolicy::default())
    }

    pub fn open_with(path: impl AsRef<Path>, policy: AllocationPolicy) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|cause| CoreError::IoRead { addr: 0, cause })?;

        let eof = file
            .metadata()
            .map_err(|cause| CoreError::IoRead { addr: 0, cause })?
            .len();

        let reader = BufReader::new(file.try_clone().map_err(|cause| CoreError::IoRead {
            addr: 0,
            cause,
        })?);
        let writer = BufWriter::new(file);

        Ok(Self {
            reader,
            writer,
            eoa: HashMap::new(),
            eof,
            policy,
            lock: None,
        })
    }
}

impl ContainerVfd for FileVfd {
    fn read(&mut self, _mem_type: MemType, addr: Addr, size: usize) -> Result<Vec<u8>> {
        self.reader
            .seek(SeekFrom::Start(addr))
            .map_err(|cause| CoreError::IoSeek { offset: addr, cause })?;
        let mut buf = vec![0u8; size];
        self.reader
            .read_exact(&mut buf)
            .map_err(|cause| CoreError::IoRead { addr, cause })?;
        Ok(buf)
    }

    fn write(&mut self, _mem_type: MemType, addr: Addr, bytes: &[u8]) -> Result<()> {
        self.writer
            .seek(SeekFrom::Start(addr))
            .map_err(|cause| CoreError::IoSeek { offset: addr, cause })?;
        self.writer
            .write_all(bytes)
            .map_err(|cause| CoreError::IoWrite { addr, cause })?;
        self.writer
            .flush()
            .map_err(|cause| CoreError::IoWrite { addr, cause })?;
        self.eof = self.eof.max(addr + bytes.len() as u64);
        Ok(())
    }

    fn allocate(&mut self, mem_type: MemType, size: usize) -> Result<Addr> {
        if size == 0 {
            return Err(CoreError::InvalidArg("allocate requires size > 0".into()));
        }
        let eoa = self.get_eoa(mem_type);
        let addr = if size as u64 >= self.policy.threshold && self.policy.alignment > 1 {
            let rem = eoa % self.policy.alignment;
            if rem == 0 { eoa } else { eoa + (self.policy.alignment - rem) }
        } else {
            eoa
        };
        self.set_eoa(mem_type, addr + size as u64)?;
        Ok(addr)
    }

    fn get_eoa(&self, mem_type: MemType) -> Addr {
        *self.eoa.get(&mem_type).unwrap_or(&0)
    }

    fn set_eoa(&mut self, mem_type: MemType, addr: Addr) -> Result<()> {
        let current = self.get_eoa(mem_type);
        if addr < current {
            return Err(CoreError::InvalidArg(format!(
                "set_eoa must be monotonic: {addr} < {current}"
            )));
        }
        self.eoa.insert(mem_type, addr);
        Ok(())
    }

    fn get_eof(&self) -> Addr {
        self.eof
    }

    fn truncate(&mut self) -> Result<()> {
        let max_eoa = self.eoa.values().copied().max().unwrap_or(0);
        self.writer
            .get_mut()
            .set_len(max_eoa)
            .map_err(|cause| CoreError::IoWrite {
                addr: max_eoa,
                cause,
            })?;
        self.eof = max_eoa;
        Ok(())
    }

    fn lock(&mut self, mode: LockMode) -> Result<()> {
        match self.lock {
            Some(LockMode::Exclusive) => Err(CoreError::Conflict(
                "container file already held exclusively".into(),
            )),
            Some(LockMode::Shared) if mode == LockMode::Exclusive => Err(CoreError::Conflict(
                "cannot upgrade a shared lock to exclusive".into(),
            )),
            _ => {
                self.lock = Some(mode);
                Ok(())
            }
        }
    }

    fn unlock(&mut self) -> Result<()> {
        self.lock = None;
        Ok(())
    }

    fn features(&self) -> VfdFeatures {
        VfdFeatures::SUPPORTS_SWMR_IO
            .union(VfdFeatures::DEFAULT_VFD_COMPATIBLE)
            .union(VfdFeatures::AGGREGATE_METADATA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = TempDir::new("file_vfd").unwrap();
        let mut vfd = FileVfd::open(dir.path().join("container.db")).unwrap();

        vfd.write(MemType::Metadata, 0, b"hello world").unwrap();
        let bytes = vfd.read(MemType::Metadata, 0, 11).unwrap();
        assert_eq!(&bytes, b"hello world");
    }

    #[test]
    fn allocate_bumps_eoa_and_honors_alignment() {
        let dir = TempDir::new("file_vfd").unwrap();
        let mut vfd = FileVfd::open_with(
            dir.path().join("container.db"),
            AllocationPolicy {
                alignment: 4096,
                threshold: 1,
            },
        )
        .unwrap();

        let first = vfd.allocate(MemType::Metadata, 10).unwrap();
        assert_eq!(first, 0);
        let second = vfd.allocate(MemType::Metadata, 4096).unwrap();
        assert_eq!(second, 4096);
    }

    #[test]
    fn set_eoa_rejects_non_monotonic_updates() {
        let dir = TempDir::new("file_vfd").unwrap();
        let mut vfd = FileVfd::open(dir.path().join("container.db")).unwrap();
        vfd.set_eoa(MemType::Metadata, 100).unwrap();
        assert!(vfd.set_eoa(MemType::Metadata, 50).is_err());
    }

    #[test]
    fn lock_rejects_conflicting_mode() {
        let dir = TempDir::new("file_vfd").unwrap();
        let mut vfd = FileVfd::open(dir.path().join("container.db")).unwrap();
        vfd.lock(LockMode::Shared).unwrap();
        assert!(vfd.lock(LockMode::Exclusive).is_err());
    }
}
