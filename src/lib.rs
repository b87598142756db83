//! # Lane Engine
//!
//! Inter-thread messaging core of a component-based game engine: event
//! lanes, a barrier-synchronized tick driver, and a UDP peer transport.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        LANE ENGINE                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  events/         - Publish/subscribe bus                     │
//! │  ├── envelope.rs - Event ids, addressing, filters            │
//! │  ├── handler.rs  - Subscriber callback trait                 │
//! │  ├── lane.rs     - Per-thread bus, cross-thread emitters     │
//! │  └── sub_lane.rs - Per-module subscription handle            │
//! │                                                              │
//! │  sync/           - Tick driver                               │
//! │  └── synchronizer.rs - Barrier-synchronized lane threads     │
//! │                                                              │
//! │  network/        - Datagram transport (non-deterministic)    │
//! │  ├── protocol.rs - Protocol trait, UDP header and framing    │
//! │  ├── handshake.rs- 26-byte handshake with checksum           │
//! │  ├── identification.rs - Endpoint → peer strategies          │
//! │  ├── sequence.rs - Loss/reorder detection                    │
//! │  ├── peer.rs     - Peer ids and connection tokens            │
//! │  └── module.rs   - Read/write modules over one socket        │
//! │                                                              │
//! │  config.rs       - Engine configuration                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading Model
//!
//! Each lane runs on its own OS thread and invokes its handlers one at a
//! time. The synchronizer ticks every lane once per period and waits until
//! all of them have finished the tick before starting the next one:
//! - Tick N+1 never reaches any lane before every lane is done with tick N
//! - `TickData` is the only clock simulation code may read
//! - Network loops run on tokio and re-enter lanes through emitters

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod events;
pub mod network;
pub mod sync;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use events::{DestinationFilter, DestinationId, Emitter, Envelope, EventId, Handler, Lane, SenderId, SubLane};
pub use network::{Handshake, PeerId, Token, UNIQUE_PEER};
pub use sync::{FinishReport, Synchronizer, SynchronizerConfig, TickData};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version carried in handshakes
pub const PROTOCOL_VERSION: u16 = 1;

/// Default tick rate (Hz)
pub const TICK_RATE: u32 = 60;
