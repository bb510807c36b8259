//! Answer fan-out to components watching agent activity
//!
//! Every answer a session delivers is also published on an [`AnswerBus`],
//! whether or not a listener was registered for its sequence. Observers are
//! called in-line, in registration order.
//!
//! ```rust,ignore
//! let bus = Arc::new(AnswerBus::new());
//! bus.register(Arc::new(HostActivityTracker::default())).await;
//! // every session built with this bus now reports to the tracker
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{AgentId, Answer};

#[async_trait]
pub trait AnswerObserver: Send + Sync {
    /// Called for every answer delivered on any session sharing the bus
    async fn on_answer(&self, agent_id: AgentId, answer: &Answer);
}

#[derive(Default)]
pub struct AnswerBus {
    observers: RwLock<Vec<Arc<dyn AnswerObserver>>>,
}

impl AnswerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, observer: Arc<dyn AnswerObserver>) {
        self.observers.write().await.push(observer);
    }

    /// Deliver `answer` to every registered observer
    pub async fn notify(&self, agent_id: AgentId, answer: &Answer) {
        let observers = self.observers.read().await;
        for observer in observers.iter() {
            observer.on_answer(agent_id, answer).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.observers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.observers.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Command, Request};
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<(&'static str, AgentId, u64)>>>,
    }

    #[async_trait]
    impl AnswerObserver for Recorder {
        async fn on_answer(&self, agent_id: AgentId, answer: &Answer) {
            self.log.lock().unwrap().push((self.name, agent_id, answer.seq));
        }
    }

    #[tokio::test]
    async fn test_registration_order_fan_out() {
        let bus = AnswerBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            bus.register(Arc::new(Recorder {
                name,
                log: Arc::clone(&log),
            }))
            .await;
        }
        assert_eq!(bus.len().await, 2);

        let req = Request::new(4, 11, vec![Command::new("PingCommand")], false);
        bus.notify(4, &Answer::new(&req, vec![])).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec![("first", 4, 11), ("second", 4, 11)]
        );
    }

    #[tokio::test]
    async fn test_empty_bus_is_noop() {
        let bus = AnswerBus::new();
        let req = Request::new(4, 1, vec![], false);
        bus.notify(4, &Answer::new(&req, vec![])).await;
        assert!(bus.is_empty().await);
    }
}
