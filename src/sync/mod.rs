//! Lane Synchronization
//!
//! Barrier-synchronized periodic ticking of lanes running on their own
//! threads.

pub mod synchronizer;

pub use synchronizer::{FinishReport, SyncError, Synchronizer, SynchronizerConfig, TickData};
