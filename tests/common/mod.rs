//! In-memory transport for wiring several nodes together in tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use overline::{Config, Dht, Id, LinkEvent, PeerLink};

/// Shrunk timings so scenarios settle in milliseconds.
pub fn fast_config() -> Config {
    Config {
        request_timeout: Duration::from_millis(400),
        probe_timeout: Duration::from_millis(300),
        has_value_timeout: Duration::from_millis(200),
        settle_delay: Duration::from_millis(30),
        repair_interval: Duration::from_millis(150),
        ..Default::default()
    }
}

/// Start a node with a fixed id on the hub.
pub fn spawn_node(hub: &MemoryHub, id: Id) -> Dht {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let link = hub.link(id);

    Dht::new(
        Config {
            id: Some(id),
            ..fast_config()
        },
        Box::new(link),
    )
}

/// Poll until a condition holds or the deadline passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    false
}

#[derive(Debug, Default)]
struct HubInner {
    inboxes: HashMap<Id, flume::Sender<LinkEvent>>,
    connections: HashSet<(Id, Id)>,
}

#[derive(Debug, Clone, Default)]
/// A process-local overlay: every link registered on the hub can reach
/// every other, with explicit connections and instant dials.
pub struct MemoryHub(Arc<Mutex<HubInner>>);

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.0.lock().expect("hub lock")
    }

    /// Register a node and return its link.
    pub fn link(&self, id: Id) -> MemoryLink {
        let (sender, receiver) = flume::unbounded();
        self.lock().inboxes.insert(id, sender);

        MemoryLink {
            id,
            hub: self.clone(),
            events: receiver,
        }
    }

    /// Open a link between two registered nodes, delivering a connect
    /// event to both.
    pub fn connect(&self, a: &Id, b: &Id) {
        let mut inner = self.lock();

        if a == b || !inner.inboxes.contains_key(a) || !inner.inboxes.contains_key(b) {
            return;
        }

        if inner.connections.insert(pair(a, b)) {
            if let Some(inbox) = inner.inboxes.get(a) {
                let _ = inbox.send(LinkEvent::PeerConnected(*b));
            }
            if let Some(inbox) = inner.inboxes.get(b) {
                let _ = inbox.send(LinkEvent::PeerConnected(*a));
            }
        }
    }

    /// Close the link between two nodes, delivering a disconnect event to
    /// both.
    pub fn disconnect(&self, a: &Id, b: &Id) {
        let mut inner = self.lock();

        if inner.connections.remove(&pair(a, b)) {
            if let Some(inbox) = inner.inboxes.get(a) {
                let _ = inbox.send(LinkEvent::PeerDisconnected(*b));
            }
            if let Some(inbox) = inner.inboxes.get(b) {
                let _ = inbox.send(LinkEvent::PeerDisconnected(*a));
            }
        }
    }
}

fn pair(a: &Id, b: &Id) -> (Id, Id) {
    if a < b {
        (*a, *b)
    } else {
        (*b, *a)
    }
}

#[derive(Debug)]
pub struct MemoryLink {
    id: Id,
    hub: MemoryHub,
    events: flume::Receiver<LinkEvent>,
}

impl PeerLink for MemoryLink {
    fn send(&mut self, peer: &Id, frame: Bytes) {
        let inner = self.hub.lock();

        if !inner.connections.contains(&pair(&self.id, peer)) {
            return;
        }
        if let Some(inbox) = inner.inboxes.get(peer) {
            let _ = inbox.send(LinkEvent::Frame(self.id, frame));
        }
    }

    fn connect_hint(&mut self, peer: &Id) {
        self.hub.connect(&self.id, peer);
    }

    fn drop_peer(&mut self, peer: &Id) {
        self.hub.disconnect(&self.id, peer);
    }

    fn is_connected(&self, peer: &Id) -> bool {
        self.hub.lock().connections.contains(&pair(&self.id, peer))
    }

    fn connected_peers(&self) -> Vec<Id> {
        self.hub
            .lock()
            .connections
            .iter()
            .filter_map(|(a, b)| {
                if a == &self.id {
                    Some(*b)
                } else if b == &self.id {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect()
    }

    fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.try_recv().ok()
    }
}
