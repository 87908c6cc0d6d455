//! Topic router — subscription tables and best-effort fan-out.
//!
//! DESIGN
//! ======
//! Each topic owns its own subscriber map behind its own mutex. A publish
//! holds that mutex for the whole fan-out, so publishes to one topic are
//! delivered in the order they were accepted, and a concurrent subscribe or
//! unsubscribe is observed either entirely before or entirely after a
//! publish. Unrelated topics never contend beyond the brief lookup in the
//! topic table.
//!
//! Delivery is `try_send` into each subscriber's bounded outbound queue.
//! A full or closed queue drops the frame for that subscriber only; the
//! publisher gets a `Delivery` tally, never an error.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::debug;

use crate::frame::Frame;
use crate::topic::{ConnId, Topic};

/// Sender half of a connection's outbound queue.
pub type Outbound = mpsc::Sender<Frame>;

type Subscribers = HashMap<ConnId, Outbound>;

/// Outcome of a single publish.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("topic {topic} is private to another connection")]
    NotOwner { topic: String },
}

impl crate::frame::ErrorCode for RouterError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotOwner { .. } => "E_UNAUTHORIZED",
        }
    }
}

#[derive(Clone, Default)]
pub struct TopicRouter {
    topics: Arc<RwLock<HashMap<Topic, Arc<Mutex<Subscribers>>>>>,
}

impl TopicRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `conn_id` to the subscriber set of `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NotOwner`] when subscribing to another
    /// connection's private topic.
    pub async fn subscribe(&self, conn_id: ConnId, topic: &Topic, tx: Outbound) -> Result<(), RouterError> {
        if topic.owner().is_some_and(|owner| owner != conn_id) {
            return Err(RouterError::NotOwner { topic: topic.to_string() });
        }

        let mut topics = self.topics.write().await;
        let slot = topics.entry(topic.clone()).or_default();
        slot.lock().await.insert(conn_id, tx);
        Ok(())
    }

    /// Remove `conn_id` from `topic`. Empty topics are dropped from the table.
    pub async fn unsubscribe(&self, conn_id: ConnId, topic: &Topic) {
        let mut topics = self.topics.write().await;
        let Some(slot) = topics.get(topic).cloned() else {
            return;
        };
        let mut subscribers = slot.lock().await;
        subscribers.remove(&conn_id);
        if subscribers.is_empty() {
            topics.remove(topic);
        }
    }

    /// Remove `conn_id` from every topic in `topics`.
    pub async fn unsubscribe_all(&self, conn_id: ConnId, topics: &[Topic]) {
        for topic in topics {
            self.unsubscribe(conn_id, topic).await;
        }
    }

    /// Deliver `frame` to every subscriber of `topic`.
    pub async fn publish(&self, topic: &Topic, frame: Frame) -> Delivery {
        self.publish_except(topic, frame, None).await
    }

    /// Deliver `frame` to every subscriber of `topic` except `exclude`.
    pub async fn publish_except(&self, topic: &Topic, frame: Frame, exclude: Option<ConnId>) -> Delivery {
        let slot = {
            let topics = self.topics.read().await;
            topics.get(topic).cloned()
        };
        let Some(slot) = slot else {
            return Delivery::default();
        };

        let frame = frame.with_topic(topic);
        let subscribers = slot.lock().await;
        let mut delivery = Delivery::default();
        for (conn_id, tx) in subscribers.iter() {
            if exclude == Some(*conn_id) {
                continue;
            }
            match tx.try_send(frame.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    delivery.dropped += 1;
                    debug!(%topic, %conn_id, "router: delivery dropped (queue full)");
                }
                Err(TrySendError::Closed(_)) => {
                    delivery.dropped += 1;
                    debug!(%topic, %conn_id, "router: delivery dropped (queue closed)");
                }
            }
        }
        delivery
    }

    /// Number of current subscribers of `topic`.
    #[cfg(test)]
    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        let slot = {
            let topics = self.topics.read().await;
            topics.get(topic).cloned()
        };
        match slot {
            Some(slot) => slot.lock().await.len(),
            None => 0,
        }
    }
}

#[cfg(test)]
#[path = "router_test.rs"]
mod tests;
