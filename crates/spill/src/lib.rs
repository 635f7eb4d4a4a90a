//! Temporary row spill files.
//!
//! A stage that must hold more rows than it may keep in memory writes them to a
//! [`SpillWriter`], then replays them through a [`SpillReader`]. Files are named by a
//! [`SpillLayout`] and removed when the writer or reader is dropped.

pub mod codec;
pub mod layout;
pub mod reader;
pub mod writer;

pub use layout::SpillLayout;
pub use reader::SpillReader;
pub use writer::SpillWriter;
