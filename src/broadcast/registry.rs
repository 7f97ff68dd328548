//! Listener registry and fan-out broadcaster
//!
//! Every listener gets its own bounded chunk queue. The broadcaster never
//! waits on a listener: a full queue drops the chunk for that listener only,
//! and a closed queue removes the listener from the registry.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Unique, never reused listener identifier
pub type ListenerId = Uuid;

/// One connected listener
struct ListenerSink {
    queue: mpsc::Sender<Bytes>,
    connected_at: DateTime<Utc>,
}

struct RegistryInner {
    listeners: DashMap<ListenerId, ListenerSink>,
    queue_capacity: usize,
    chunks_written: AtomicU64,
    bytes_written: AtomicU64,
}

/// Set of currently connected listeners
#[derive(Clone)]
pub struct ListenerRegistry {
    inner: Arc<RegistryInner>,
}

impl ListenerRegistry {
    /// Create a registry whose listeners buffer up to `queue_capacity` chunks
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                listeners: DashMap::new(),
                queue_capacity: queue_capacity.max(1),
                chunks_written: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
            }),
        }
    }

    /// Add a listener. The returned stream yields every chunk broadcast from
    /// now on; dropping it deregisters the listener.
    pub fn register(&self) -> (ListenerId, ListenerStream) {
        let id = Uuid::new_v4();
        let (queue, receiver) = mpsc::channel(self.inner.queue_capacity);

        self.inner.listeners.insert(
            id,
            ListenerSink {
                queue,
                connected_at: Utc::now(),
            },
        );
        tracing::info!("listener {} connected ({} total)", id, self.len());

        let stream = ListenerStream {
            id,
            receiver,
            registry: Arc::downgrade(&self.inner),
        };
        (id, stream)
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn deregister(&self, id: ListenerId) -> bool {
        let removed = self.inner.listeners.remove(&id).is_some();
        if removed {
            tracing::info!("listener {} disconnected ({} remaining)", id, self.len());
        }
        removed
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.inner.listeners.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.listeners.is_empty()
    }

    /// The write side feeding all listeners
    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster {
            inner: self.inner.clone(),
        }
    }

    /// Get statistics
    pub fn stats(&self) -> RegistryStats {
        let oldest = self
            .inner
            .listeners
            .iter()
            .map(|entry| entry.value().connected_at)
            .min();

        RegistryStats {
            listeners: self.len(),
            chunks_written: self.inner.chunks_written.load(Ordering::Relaxed),
            bytes_written: self.inner.bytes_written.load(Ordering::Relaxed),
            oldest_connection: oldest,
        }
    }
}

/// Registry statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    pub listeners: usize,
    pub chunks_written: u64,
    pub bytes_written: u64,
    pub oldest_connection: Option<DateTime<Utc>>,
}

/// Outcome of a single broadcast write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Listeners the chunk was queued for
    pub delivered: usize,
    /// Listeners removed because their stream was closed
    pub pruned: usize,
    /// Listeners that skipped this chunk because their queue was full
    pub lagged: usize,
}

/// Fan-out sink duplicating each chunk to every registered listener
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<RegistryInner>,
}

impl Broadcaster {
    /// Deliver `chunk` to the listeners registered at call time
    pub fn write(&self, chunk: Bytes) -> DeliveryReport {
        let snapshot: Vec<(ListenerId, mpsc::Sender<Bytes>)> = self
            .inner
            .listeners
            .iter()
            .map(|entry| (*entry.key(), entry.value().queue.clone()))
            .collect();

        let mut report = DeliveryReport::default();
        for (id, queue) in snapshot {
            if queue.is_closed() {
                self.prune(id);
                report.pruned += 1;
                continue;
            }

            match queue.try_send(chunk.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!("listener {} is lagging, chunk dropped", id);
                    report.lagged += 1;
                }
                Err(TrySendError::Closed(_)) => {
                    self.prune(id);
                    report.pruned += 1;
                }
            }
        }

        self.inner.chunks_written.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_written
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        report
    }

    /// Number of listeners currently registered
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    fn prune(&self, id: ListenerId) {
        if self.inner.listeners.remove(&id).is_some() {
            tracing::debug!("listener {} went away, removed", id);
        }
    }
}

/// Receiving end of one listener
pub struct ListenerStream {
    id: ListenerId,
    receiver: mpsc::Receiver<Bytes>,
    registry: Weak<RegistryInner>,
}

impl ListenerStream {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Next broadcast chunk; `None` once closed
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    /// Chunk already queued, if any
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.receiver.try_recv().ok()
    }

    /// Stop accepting chunks. The registry notices on its next write.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

impl Stream for ListenerStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for ListenerStream {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            if inner.listeners.remove(&self.id).is_some() {
                tracing::info!(
                    "listener {} disconnected ({} remaining)",
                    self.id,
                    inner.listeners.len()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn test_register_and_deregister() {
        let registry = ListenerRegistry::new(8);
        let (id, _stream) = registry.register();

        assert!(registry.contains(id));
        assert_eq!(registry.len(), 1);

        assert!(registry.deregister(id));
        assert!(!registry.deregister(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = ListenerRegistry::new(8);
        let (a, _sa) = registry.register();
        let (b, _sb) = registry.register();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fan_out_to_all() {
        let registry = ListenerRegistry::new(8);
        let mut streams: Vec<_> = (0..5).map(|_| registry.register().1).collect();

        let report = registry.broadcaster().write(Bytes::from_static(b"chunk"));
        assert_eq!(report.delivered, 5);

        for stream in &mut streams {
            assert_eq!(stream.try_recv().unwrap(), Bytes::from_static(b"chunk"));
            assert!(stream.try_recv().is_none());
        }
    }

    #[test]
    fn test_closed_listener_pruned() {
        let registry = ListenerRegistry::new(8);
        let (_, mut open) = registry.register();
        let (closed_id, mut closed) = registry.register();
        closed.close();

        assert_eq!(registry.len(), 2);
        let report = registry.broadcaster().write(Bytes::from_static(b"hello"));

        assert_eq!(report, DeliveryReport { delivered: 1, pruned: 1, lagged: 0 });
        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(closed_id));
        assert_eq!(open.try_recv().unwrap(), Bytes::from_static(b"hello"));
        assert!(closed.try_recv().is_none());
    }

    #[test]
    fn test_n_closed_m_open() {
        let registry = ListenerRegistry::new(8);
        let mut open: Vec<_> = (0..3).map(|_| registry.register().1).collect();
        let mut closed: Vec<_> = (0..4).map(|_| registry.register().1).collect();
        for stream in &mut closed {
            stream.close();
        }

        let broadcaster = registry.broadcaster();
        let first = broadcaster.write(Bytes::from_static(b"a"));
        assert_eq!(first.delivered, 3);
        assert_eq!(first.pruned, 4);

        let second = broadcaster.write(Bytes::from_static(b"b"));
        assert_eq!(second.delivered, 3);
        assert_eq!(second.pruned, 0);

        for stream in &mut open {
            assert_eq!(stream.try_recv().unwrap(), Bytes::from_static(b"a"));
            assert_eq!(stream.try_recv().unwrap(), Bytes::from_static(b"b"));
        }
    }

    #[test]
    fn test_dropped_stream_deregisters() {
        let registry = ListenerRegistry::new(8);
        let (id, stream) = registry.register();
        drop(stream);
        assert!(!registry.contains(id));
    }

    #[test]
    fn test_lagging_listener_does_not_block_others() {
        let registry = ListenerRegistry::new(2);
        let (_, mut slow) = registry.register();
        let (_, mut fast) = registry.register();
        let broadcaster = registry.broadcaster();

        for i in 0..4u8 {
            broadcaster.write(Bytes::from(vec![i]));
            assert_eq!(fast.try_recv().unwrap(), Bytes::from(vec![i]));
        }

        assert_eq!(slow.try_recv().unwrap(), Bytes::from(vec![0]));
        assert_eq!(slow.try_recv().unwrap(), Bytes::from(vec![1]));
        assert!(slow.try_recv().is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_late_listener_gets_only_later_chunks() {
        let registry = ListenerRegistry::new(8);
        let broadcaster = registry.broadcaster();
        broadcaster.write(Bytes::from_static(b"before"));

        let (_, mut late) = registry.register();
        broadcaster.write(Bytes::from_static(b"after"));

        assert_eq!(late.try_recv().unwrap(), Bytes::from_static(b"after"));
        assert!(late.try_recv().is_none());
    }

    #[test]
    fn test_stats() {
        let registry = ListenerRegistry::new(8);
        let (_, _stream) = registry.register();
        registry.broadcaster().write(Bytes::from_static(b"12345"));

        let stats = registry.stats();
        assert_eq!(stats.listeners, 1);
        assert_eq!(stats.chunks_written, 1);
        assert_eq!(stats.bytes_written, 5);
        assert!(stats.oldest_connection.is_some());
    }

    #[tokio::test]
    async fn test_stream_yields_chunks() {
        let registry = ListenerRegistry::new(8);
        let (_, mut stream) = registry.register();
        registry.broadcaster().write(Bytes::from_static(b"one"));

        assert_eq!(stream.next().await.unwrap(), Bytes::from_static(b"one"));
    }
}
