use crate::queue::{Broker, QueueError, QueueResult};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

/// In-process broker with the same push-left / pop-right semantics as the Redis one
///
/// Used by the `local` run mode and as the broker in tests.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    channels: Mutex<HashMap<String, VecDeque<String>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> QueueResult<MutexGuard<'_, HashMap<String, VecDeque<String>>>> {
        self.channels.lock().map_err(|_| QueueError::LockPoisoned)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, channel: &str, payload: String) -> QueueResult<()> {
        self.lock()?
            .entry(channel.to_string())
            .or_default()
            .push_front(payload);
        Ok(())
    }

    async fn pop(&self, channel: &str) -> QueueResult<Option<String>> {
        Ok(self
            .lock()?
            .get_mut(channel)
            .and_then(|queue| queue.pop_back()))
    }

    async fn len(&self, channel: &str) -> QueueResult<usize> {
        Ok(self.lock()?.get(channel).map_or(0, VecDeque::len))
    }
}
