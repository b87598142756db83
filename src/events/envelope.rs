//! Event Addressing
//!
//! Every message travelling on a lane carries an [`Envelope`]: which event it
//! is, who it is for, and who sent it.

use std::fmt;

use serde::{Serialize, Deserialize};

/// Engine-wide event tag.
///
/// Each semantic event gets exactly one id. Ids below [`EventId::FIRST_USER`]
/// are reserved for the engine itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u32);

impl EventId {
    /// Periodic tick delivered by the synchronizer (payload: `TickData`).
    pub const TICK: EventId = EventId(0);

    /// Packet to be written by a network write module (payload: `OutboundPacket`).
    pub const PACKET_OUTBOUND: EventId = EventId(1);

    /// Packet received and attributed to a peer (payload: `InboundPacket`).
    pub const PACKET_INBOUND: EventId = EventId(2);

    /// Packet received from an endpoint that could not be identified
    /// (payload: `UnidentifiedPacket`).
    pub const PACKET_UNIDENTIFIED: EventId = EventId(3);

    /// First id available to engine modules.
    pub const FIRST_USER: EventId = EventId(1000);

    /// Create an event id.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Whether this id is reserved for engine use.
    pub fn is_reserved(&self) -> bool {
        self.0 < Self::FIRST_USER.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event#{}", self.0)
    }
}

/// Opaque recipient handle. Zero means broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DestinationId(pub u64);

impl DestinationId {
    /// Delivered to every subscriber of the event on the lane.
    pub const BROADCAST: DestinationId = DestinationId(0);

    /// Create a destination id.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Check if this is the broadcast destination.
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

/// Opaque sender handle, unique per SubLane or emitter on a lane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SenderId(pub u64);

impl SenderId {
    /// Sender id used for messages injected by the engine itself (ticks).
    pub const ENGINE: SenderId = SenderId(0);
}

/// The addressing triple attached to every message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Envelope {
    /// What happened.
    pub event: EventId,
    /// Who it is for.
    pub destination: DestinationId,
    /// Who emitted it.
    pub sender: SenderId,
}

impl Envelope {
    /// Create an envelope.
    pub fn new(event: EventId, destination: DestinationId, sender: SenderId) -> Self {
        Self { event, destination, sender }
    }

    /// Create a broadcast envelope.
    pub fn broadcast(event: EventId, sender: SenderId) -> Self {
        Self::new(event, DestinationId::BROADCAST, sender)
    }
}

/// Destination filter a subscription is registered with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DestinationFilter {
    /// Don't care: receive the event whatever its destination.
    #[default]
    Any,
    /// Receive only messages addressed to this destination (and broadcasts).
    Exact(DestinationId),
}

impl DestinationFilter {
    /// Check whether an envelope passes this filter.
    pub fn accepts(&self, envelope: &Envelope) -> bool {
        match self {
            DestinationFilter::Any => true,
            DestinationFilter::Exact(id) => {
                envelope.destination.is_broadcast() || envelope.destination == *id
            }
        }
    }
}

impl From<DestinationId> for DestinationFilter {
    fn from(id: DestinationId) -> Self {
        DestinationFilter::Exact(id)
    }
}
