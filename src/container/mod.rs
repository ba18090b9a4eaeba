//! The Container VFD: a thin, typed block-I/O device over the primary
//! container file. Memory-type discrimination is carried through every
//! call; what it means (reservation accounting, delayed writes, ...) is
//! decided above, in the page buffer.

pub mod file_vfd;

pub use file_vfd::FileVfd;

use crate::error::Result;

/// A byte offset within the container file's address space.
pub type Addr = u64;

/// The memory-type tag threaded through every Container VFD call. Policy
/// (reservation, delay, MPMDE eligibility) lives in the page buffer; the
/// VFD itself only uses this to track per-type end-of-allocated addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemType {
    Metadata,
    RawData,
    Superblock,
    GlobalHeap,
}

impl MemType {
    pub fn is_metadata(self) -> bool {
        !matches!(self, MemType::RawData)
    }
}

/// The advisory lock mode a [`ContainerVfd`] may be held under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Feature bits a VFD implementation advertises to the layers above it.
/// Represented as a small flag byte rather than pulling in a bitflags
/// crate for six independent bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VfdFeatures(u8);

impl VfdFeatures {
    pub const AGGREGATE_METADATA: VfdFeatures = VfdFeatures(1 << 0);
    pub const ACCUMULATE_METADATA: VfdFeatures = VfdFeatures(1 << 1);
    pub const DATA_SIEVE: VfdFeatures = VfdFeatures(1 << 2);
    pub const AGGREGATE_SMALLDATA: VfdFeatures = VfdFeatures(1 << 3);
    pub const SUPPORTS_SWMR_IO: VfdFeatures = VfdFeatures(1 << 4);
    pub const DEFAULT_VFD_COMPATIBLE: VfdFeatures = VfdFeatures(1 << 5);

    pub const fn empty() -> Self {
        VfdFeatures(0)
    }

    pub const fn union(self, other: VfdFeatures) -> VfdFeatures {
        VfdFeatures(self.0 | other.0)
    }

    pub const fn contains(self, other: VfdFeatures) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// Typed block I/O against a backing store, keyed by memory class so an
/// implementation can apply different allocation and aggregation policy
/// per class.
pub trait ContainerVfd {
    fn read(&mut self, mem_type: MemType, addr: Addr, size: usize) -> Result<Vec<u8>>;
    fn write(&mut self, mem_type: MemType, addr: Addr, bytes: &[u8]) -> Result<()>;
    fn allocate(&mut self, mem_type: MemType, size: usize) -> Result<Addr>;
    fn get_eoa(&self, mem_type: MemType) -> Addr;
    fn set_eoa(&mut self, mem_type: MemType, addr: Addr) -> Result<()>;
    fn get_eof(&self) -> Addr;
    fn truncate(&mut self) -> Result<()>;
    fn lock(&mut self, mode: LockMode) -> Result<()>;
    fn unlock(&mut self) -> Result<()>;
    fn features(&self) -> VfdFeatures;
}
