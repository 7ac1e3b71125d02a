//! In-process signal bus.
//!
//! Backs tests and single-node deployments with the same contract a
//! networked broker would provide: broadcast fan-out per channel, shared
//! sets, and TTL-expiring warm-up locks. Publishing never blocks on
//! subscribers; a slow subscriber that overflows its buffer observes a
//! [`SignalBusError::Lagged`] and is expected to resync.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{MessageStream, SignalBus, SignalBusError, Subscription};

/// Per-channel buffer size before a slow subscriber starts lagging.
const CHANNEL_CAPACITY: usize = 256;

/// Shared in-memory bus. Cheap to clone via `Arc`.
pub struct MemorySignalBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    sets: Mutex<HashMap<String, HashSet<String>>>,
    locks: Mutex<HashMap<String, Instant>>,
}

impl Default for MemorySignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySignalBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            sets: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

struct BroadcastStream {
    channel: String,
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl MessageStream for BroadcastStream {
    async fn next(&mut self) -> Result<Option<String>, SignalBusError> {
        match self.rx.recv().await {
            Ok(message) => Ok(Some(message)),
            Err(broadcast::error::RecvError::Closed) => Ok(None),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(SignalBusError::Lagged {
                channel: self.channel.clone(),
                skipped,
            }),
        }
    }
}

#[async_trait]
impl SignalBus for MemorySignalBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), SignalBusError> {
        // A send error only means nobody is subscribed; at-most-once
        // delivery makes that a non-event.
        let _ = self.sender_for(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, SignalBusError> {
        let rx = self.sender_for(channel).subscribe();
        Ok(Subscription::new(
            channel,
            Box::new(BroadcastStream {
                channel: channel.to_string(),
                rx,
            }),
        ))
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), SignalBusError> {
        let mut sets = self
            .sets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let set = sets.entry(key.to_string()).or_default();
        for member in members {
            set.insert(member.clone());
        }
        Ok(())
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), SignalBusError> {
        let mut sets = self
            .sets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(set) = sets.get_mut(key) {
            for member in members {
                set.remove(member);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, SignalBusError> {
        let sets = self
            .sets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_card(&self, key: &str) -> Result<usize, SignalBusError> {
        let sets = self
            .sets
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(sets.get(key).map_or(0, HashSet::len))
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool, SignalBusError> {
        let now = Instant::now();
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.retain(|_, expires| *expires > now);

        if locks.contains_key(key) {
            return Ok(false);
        }
        locks.insert(key.to_string(), now + ttl);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_live_subscribers() {
        let bus = MemorySignalBus::new();
        let mut sub = bus.subscribe("chan").await.unwrap();

        bus.publish("chan", "hello").await.unwrap();
        assert_eq!(sub.next().await.unwrap(), Some("hello".to_string()));
    }

    #[tokio::test]
    async fn messages_before_subscribe_are_dropped() {
        let bus = MemorySignalBus::new();
        bus.publish("chan", "missed").await.unwrap();

        let mut sub = bus.subscribe("chan").await.unwrap();
        bus.publish("chan", "seen").await.unwrap();
        assert_eq!(sub.next().await.unwrap(), Some("seen".to_string()));
    }

    #[tokio::test]
    async fn set_operations() {
        let bus = MemorySignalBus::new();
        bus.set_add("s", &["a".into(), "b".into()]).await.unwrap();
        assert_eq!(bus.set_card("s").await.unwrap(), 2);

        bus.set_remove("s", &["a".into()]).await.unwrap();
        let members = bus.set_members("s").await.unwrap();
        assert_eq!(members, vec!["b".to_string()]);
        assert_eq!(bus.set_card("missing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn lock_is_single_winner_until_expiry() {
        let bus = MemorySignalBus::new();
        assert!(bus.acquire_lock("l", Duration::from_secs(30)).await.unwrap());
        assert!(!bus.acquire_lock("l", Duration::from_secs(30)).await.unwrap());

        let bus = MemorySignalBus::new();
        assert!(bus.acquire_lock("l", Duration::from_millis(1)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(bus.acquire_lock("l", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn overflow_surfaces_lag() {
        let bus = MemorySignalBus::new();
        let mut sub = bus.subscribe("busy").await.unwrap();
        for i in 0..(CHANNEL_CAPACITY + 10) {
            bus.publish("busy", &format!("m{i}")).await.unwrap();
        }
        assert!(matches!(
            sub.next().await,
            Err(SignalBusError::Lagged { .. })
        ));
    }
}
