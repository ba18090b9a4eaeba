//! The tick coordinator and the writer-side index it maintains, plus the
//! delayed-write policy shared between them and the page buffer.

pub mod coordinator;
pub mod delay;
pub mod index_table;

pub use coordinator::TickCoordinator;
pub use index_table::{IndexEntry, IndexTable};
