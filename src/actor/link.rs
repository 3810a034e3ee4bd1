//! The peer link: the transport boundary of the node.
//!
//! The transport owns connection establishment, framing and peer
//! identity; the node core only ever sees whole frames tagged with the
//! sender's id, plus arrival and departure events.

use std::fmt::Debug;

use bytes::Bytes;
use dyn_clone::DynClone;

use crate::common::Id;

#[derive(Debug, Clone, PartialEq, Eq)]
/// An event surfaced by the transport.
pub enum LinkEvent {
    /// A link to this peer is open; frames can flow both ways.
    PeerConnected(Id),
    /// The link closed; pending requests to the peer will time out.
    PeerDisconnected(Id),
    /// A whole inbound frame from a connected peer.
    Frame(Id, Bytes),
}

/// A reliable, ordered, message-oriented link to the rest of the overlay,
/// implemented by the host.
///
/// All methods are best-effort: sends to departed peers are dropped,
/// connect hints may fail silently. Correctness rests on request timers,
/// never on delivery guarantees.
pub trait PeerLink: Send + Debug {
    /// Send one frame to a connected peer. Dropped if the peer is gone.
    fn send(&mut self, peer: &Id, frame: Bytes);

    /// Ask the transport to establish a link to a peer it may know how to
    /// reach. Asynchronous; may fail silently.
    fn connect_hint(&mut self, peer: &Id);

    /// Force-close the link to a peer.
    fn drop_peer(&mut self, peer: &Id);

    /// Whether a link to this peer is currently open.
    fn is_connected(&self, peer: &Id) -> bool;

    /// All peers with an open link.
    fn connected_peers(&self) -> Vec<Id>;

    /// Drain one pending transport event, if any. Never blocks.
    fn poll_event(&mut self) -> Option<LinkEvent>;
}

/// Host-provided callbacks observing the node from outside.
///
/// The node holds one configured instance and never mutates it.
pub trait NodeHooks: Send + Debug + DynClone {
    /// A peer connected and was offered to the routing table.
    fn on_peer_connected(&self, peer: &Id);

    /// Nodes returned by a peer during a lookup, after filtering.
    fn on_find_node_response(&self, from: &Id, nodes: &[Id]);

    /// A transport-private signalling frame to relay; the node never
    /// inspects these.
    fn route_signal(&self, from: &Id, frame: &Bytes);
}

dyn_clone::clone_trait_object!(NodeHooks);

#[derive(Debug, Clone)]
/// Default hooks that observe nothing.
pub struct NoopHooks;

impl NodeHooks for NoopHooks {
    fn on_peer_connected(&self, _peer: &Id) {}

    fn on_find_node_response(&self, _from: &Id, _nodes: &[Id]) {}

    fn route_signal(&self, _from: &Id, _frame: &Bytes) {}
}
