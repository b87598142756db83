//! Event Lanes
//!
//! In-process publish/subscribe bus decoupling engine modules (controller,
//! model, view, audio, network) that run on independent threads.
//!
//! - `envelope`: addressing triple and destination filters
//! - `handler`: subscriber callback trait
//! - `lane`: the per-thread bus and cross-thread emitters
//! - `sub_lane`: per-module subscription handle

pub mod envelope;
pub mod handler;
pub mod lane;
pub mod sub_lane;

pub use envelope::{DestinationFilter, DestinationId, Envelope, EventId, SenderId};
pub use handler::Handler;
pub use lane::{Emitter, Lane};
pub use sub_lane::SubLane;
