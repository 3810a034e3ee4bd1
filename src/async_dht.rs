//! Node handle with an async api.

use bytes::Bytes;

use crate::actor::Info;
use crate::common::{Id, Record};
use crate::dht::ActorMessage;
use crate::{Dht, Error, Result};

#[derive(Debug, Clone)]
/// Async facade over a [Dht] handle: the same commands, awaited instead
/// of blocked on.
pub struct AsyncDht(Dht);

impl Dht {
    /// Wrap this handle in the async api.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

impl AsyncDht {
    /// This node's id.
    pub fn local_id(&self) -> Id {
        self.0.local_id()
    }

    /// Async version of [info](Dht::info).
    pub async fn info(&self) -> Result<Info> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .sender
            .send(ActorMessage::Info { sender })
            .map_err(|_| Error::Shutdown)?;

        receiver.recv_async().await.map_err(|_| Error::Shutdown)
    }

    /// Async version of [store](Dht::store).
    pub async fn store(&self, key: &[u8], value: &[u8]) -> Result<usize> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .sender
            .send(ActorMessage::Store {
                key: key.to_vec(),
                value: value.to_vec(),
                sender,
            })
            .map_err(|_| Error::Shutdown)?;

        let acks = receiver
            .recv_async()
            .await
            .map_err(|_| Error::Shutdown)??;

        Ok(acks)
    }

    /// Async version of [get](Dht::get).
    pub async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .sender
            .send(ActorMessage::Get {
                key: key.to_vec(),
                sender,
            })
            .map_err(|_| Error::Shutdown)?;

        let record: Option<Record> = receiver.recv_async().await.map_err(|_| Error::Shutdown)?;

        Ok(record.map(|record| Bytes::from(record.data)))
    }

    /// Async version of [find_closest_nodes](Dht::find_closest_nodes).
    pub async fn find_closest_nodes(&self, target: Id) -> Result<Vec<Id>> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .sender
            .send(ActorMessage::FindClosestNodes { target, sender })
            .map_err(|_| Error::Shutdown)?;

        receiver.recv_async().await.map_err(|_| Error::Shutdown)
    }

    /// Async version of [ping](Dht::ping).
    pub async fn ping(&self, peer: &Id) -> Result<bool> {
        let (sender, receiver) = flume::bounded(1);

        self.0
            .sender
            .send(ActorMessage::Ping {
                peer: *peer,
                sender,
            })
            .map_err(|_| Error::Shutdown)?;

        receiver.recv_async().await.map_err(|_| Error::Shutdown)
    }

    /// Stop the event loop.
    pub fn shutdown(&self) {
        self.0.shutdown();
    }
}
