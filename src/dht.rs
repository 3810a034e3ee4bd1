//! The public node handle.
//!
//! [Dht::new] spawns the event loop on its own thread and returns a
//! cloneable handle; every method sends a command over a channel and
//! blocks on the reply. The async facade in
//! [async_dht](crate::async_dht) awaits the same channels instead.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;

use crate::actor::config::Config;
use crate::actor::link::PeerLink;
use crate::actor::{Actor, Info};
use crate::common::{Id, Record};
use crate::core::store_query::StoreError;
use crate::{Error, Result};

/// How long the run loop sleeps when a tick had nothing to do.
const IDLE_SLEEP: Duration = Duration::from_millis(1);

#[derive(Debug)]
/// A node participating in the overlay.
pub struct Dht {
    pub(crate) sender: flume::Sender<ActorMessage>,
    local_id: Id,
    handle: Option<JoinHandle<()>>,
}

impl Clone for Dht {
    fn clone(&self) -> Self {
        Dht {
            sender: self.sender.clone(),
            local_id: self.local_id,
            handle: None,
        }
    }
}

impl Dht {
    /// Start a node over the given peer link.
    pub fn new(config: Config, link: Box<dyn PeerLink>) -> Dht {
        let (sender, receiver) = flume::unbounded();

        let actor = Actor::new(config, link);
        let local_id = *actor.id();

        let handle = thread::spawn(move || run(actor, receiver));

        Dht {
            sender,
            local_id,
            handle: Some(handle),
        }
    }

    // === Getters ===

    /// This node's id.
    pub fn local_id(&self) -> Id {
        self.local_id
    }

    /// Routing table and storage counters, for inspection.
    pub fn info(&self) -> Result<Info> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Info { sender })
            .map_err(|_| Error::Shutdown)?;

        receiver.recv().map_err(|_| Error::Shutdown)
    }

    // === Public Methods ===

    /// Store a value under a key at the nodes closest to its hash.
    ///
    /// Blocks until enough acks arrived, and returns their count. Fails
    /// with [StoreError::QuorumNotMet] when too few replicas confirmed;
    /// the copies that were stored remain readable regardless.
    pub fn store(&self, key: &[u8], value: &[u8]) -> Result<usize> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Store {
                key: key.to_vec(),
                value: value.to_vec(),
                sender,
            })
            .map_err(|_| Error::Shutdown)?;

        let acks = receiver.recv().map_err(|_| Error::Shutdown)??;

        Ok(acks)
    }

    /// Look up the value stored under a key.
    ///
    /// A locally-held copy is returned immediately; otherwise the lookup
    /// traverses the overlay and returns the newest record found, or
    /// None once the traversal exhausts without a hit.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Get {
                key: key.to_vec(),
                sender,
            })
            .map_err(|_| Error::Shutdown)?;

        let record = receiver.recv().map_err(|_| Error::Shutdown)?;

        Ok(record.map(|record| Bytes::from(record.data)))
    }

    /// Find the known nodes closest to an id, traversing the overlay.
    pub fn find_closest_nodes(&self, target: Id) -> Result<Vec<Id>> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::FindClosestNodes { target, sender })
            .map_err(|_| Error::Shutdown)?;

        receiver.recv().map_err(|_| Error::Shutdown)
    }

    /// Whether a connected peer answers a PING within the probe deadline.
    pub fn ping(&self, peer: &Id) -> Result<bool> {
        let (sender, receiver) = flume::bounded(1);

        self.sender
            .send(ActorMessage::Ping {
                peer: *peer,
                sender,
            })
            .map_err(|_| Error::Shutdown)?;

        receiver.recv().map_err(|_| Error::Shutdown)
    }

    /// Stop the event loop. Idempotent; pending callers get
    /// [Error::Shutdown].
    pub fn shutdown(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown);
    }

    /// Shut down and wait for the event loop thread to exit.
    pub fn shutdown_and_join(mut self) {
        self.shutdown();

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The event loop: interleave commands with ticks, sleeping briefly when
/// both are idle.
fn run(mut actor: Actor, receiver: flume::Receiver<ActorMessage>) {
    loop {
        let mut did_work = false;

        match receiver.try_recv() {
            Ok(ActorMessage::Shutdown) => break,
            Ok(message) => {
                actor.handle_command(message);
                did_work = true;
            }
            Err(flume::TryRecvError::Empty) => {}
            Err(flume::TryRecvError::Disconnected) => break,
        }

        if actor.tick() {
            did_work = true;
        }

        if !did_work {
            thread::sleep(IDLE_SLEEP);
        }
    }
}

#[derive(Debug)]
/// Commands from [Dht] handles to the event loop.
pub(crate) enum ActorMessage {
    Store {
        key: Vec<u8>,
        value: Vec<u8>,
        sender: flume::Sender<std::result::Result<usize, StoreError>>,
    },
    Get {
        key: Vec<u8>,
        sender: flume::Sender<Option<Record>>,
    },
    FindClosestNodes {
        target: Id,
        sender: flume::Sender<Vec<Id>>,
    },
    Ping {
        peer: Id,
        sender: flume::Sender<bool>,
    },
    Info {
        sender: flume::Sender<Info>,
    },
    Shutdown,
}
