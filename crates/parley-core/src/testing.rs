//! Test broker with injectable failures.

use async_trait::async_trait;
use dashmap::DashSet;
use parley_broker::{Broker, BrokerError, MemoryBroker, Pipeline, Reply, Subscription};
use std::sync::atomic::{AtomicBool, Ordering};

/// A [`MemoryBroker`] that reports `Unavailable` for chosen keys, or for
/// every command and publish while [`FlakyBroker::fail_all`] is set.
#[derive(Default)]
pub struct FlakyBroker {
    inner: MemoryBroker,
    failing_keys: DashSet<String>,
    down: AtomicBool,
}

impl FlakyBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail any pipeline touching `key`.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing_keys.insert(key.into());
    }

    pub fn fail_all(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Clear every injected failure.
    pub fn heal(&self) {
        self.failing_keys.clear();
        self.fail_all(false);
    }

    fn check(&self) -> Result<(), BrokerError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("broker down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn execute(&self, pipeline: Pipeline) -> Result<Vec<Reply>, BrokerError> {
        self.check()?;
        if let Some(cmd) = pipeline
            .commands()
            .iter()
            .find(|cmd| self.failing_keys.contains(cmd.key()))
        {
            return Err(BrokerError::Unavailable(format!("{} unavailable", cmd.key())));
        }
        self.inner.execute(pipeline).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BrokerError> {
        self.check()?;
        self.inner.publish(channel, payload).await
    }

    async fn psubscribe(&self, patterns: &[&str]) -> Result<Subscription, BrokerError> {
        self.inner.psubscribe(patterns).await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}
