//! Page buffer accounting, logged at `trace`/`debug` rather than exposed
//! through a metrics crate.

/// Running counters for one [`crate::pagebuffer::PageBuffer`] instance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PageBufferStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub bypasses: u64,
    /// Number of `make_space` calls that left `curr_pages >= max_pages`
    /// because tick/delay discipline forbade evicting enough entries.
    /// Only possible while `vfd_swmr_writer` is armed.
    pub make_space_overflow: u64,
}
