//! Page buffer configuration: capacity, memory-class reservations, page
//! size, and the SWMR writer's delayed-write lag.

use crate::error::{CoreError, Result};

#[derive(Debug, Clone)]
pub struct PageBufferConfig {
    pub max_pages: usize,
    pub min_md_pages: usize,
    pub min_rd_pages: usize,
    pub page_size: usize,
    pub vfd_swmr_writer: bool,
    pub max_lag: u64,
}

impl PageBufferConfig {
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(CoreError::InvalidArg("page_size must be > 0".into()));
        }
        if self.min_md_pages + self.min_rd_pages > self.max_pages {
            return Err(CoreError::InvalidArg(
                "min_md_pages + min_rd_pages must not exceed max_pages".into(),
            ));
        }
        if self.vfd_swmr_writer && self.max_lag == 0 {
            return Err(CoreError::InvalidArg(
                "max_lag must be > 0 when vfd_swmr_writer is armed".into(),
            ));
        }
        Ok(())
    }
}
