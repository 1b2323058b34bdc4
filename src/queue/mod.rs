//! Benchmark work queue.
//!
//! - [`QueueScheduler`]: claim/release/enable/repeat/priority operations
//! - [`EntryStore`]: atomic storage contract, with [`MemoryEntryStore`] and
//!   [`SqliteEntryStore`] implementations

pub mod entry;
pub mod filter;
pub mod memory;
pub mod scheduler;
pub mod sqlite;
pub mod store;

pub use entry::{
    ConfigUpdate, EnabledStatus, EntryId, FlagAssignment, NewConfig, PriorityUpdate, QueueEntry,
    QueueFlags, QueueState, RepeatStatus,
};
pub use filter::EntryFilter;
pub use memory::MemoryEntryStore;
pub use scheduler::QueueScheduler;
pub use sqlite::SqliteEntryStore;
pub use store::{Condition, EntryOrder, EntryStore, EntryUpdate, Selector};
