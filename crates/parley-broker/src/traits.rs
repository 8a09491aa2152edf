//! Broker abstraction traits for Parley.
//!
//! These types define the interface every broker backend provides, so the
//! messaging core never depends on a particular store.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The operation did not complete within its time bound.
    #[error("Broker operation timed out")]
    Timeout,

    /// The broker could not be reached.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The broker rejected a command.
    #[error("Broker command failed: {0}")]
    Command(String),

    /// A reply did not have the expected shape.
    #[error("Unexpected broker reply: expected {0}")]
    UnexpectedReply(&'static str),

    /// A subscription stream ended.
    #[error("Subscription closed")]
    Closed,
}

impl BrokerError {
    /// Whether retrying the operation later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Timeout | BrokerError::Unavailable(_) | BrokerError::Closed
        )
    }
}

/// Run a broker future with a time bound.
///
/// # Errors
///
/// Returns [`BrokerError::Timeout`] if the limit elapses first, or the
/// future's own error.
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, BrokerError>
where
    F: Future<Output = Result<T, BrokerError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(BrokerError::Timeout),
    }
}

/// A single broker command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Set a string value, optionally expiring.
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    /// Get a string value.
    Get { key: String },
    /// Check whether a key exists.
    Exists { key: String },
    /// Delete a key of any type.
    Del { key: String },
    /// Set a time-to-live on an existing key.
    Expire { key: String, ttl: Duration },
    /// Add a member to a set.
    SAdd { key: String, member: String },
    /// Remove a member from a set.
    SRem { key: String, member: String },
    /// Set cardinality.
    SCard { key: String },
    /// All members of a set.
    SMembers { key: String },
    /// Append an entry to a log, returning the broker-assigned id.
    Append {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Trim a log to roughly `max_len` entries. Backends may keep more.
    Trim { key: String, max_len: usize },
    /// Read up to `count` entries, newest first.
    RevRange { key: String, count: usize },
}

impl Command {
    /// The key this command operates on.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Command::Set { key, .. }
            | Command::Get { key }
            | Command::Exists { key }
            | Command::Del { key }
            | Command::Expire { key, .. }
            | Command::SAdd { key, .. }
            | Command::SRem { key, .. }
            | Command::SCard { key }
            | Command::SMembers { key }
            | Command::Append { key, .. }
            | Command::Trim { key, .. }
            | Command::RevRange { key, .. } => key,
        }
    }
}

/// One entry of an append-only log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Broker-assigned id, monotonic within the log.
    pub id: String,
    /// Field/value pairs.
    pub fields: Vec<(String, String)>,
}

impl LogEntry {
    /// Look up a field value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A command reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Text(String),
    Members(Vec<String>),
    Entries(Vec<LogEntry>),
}

impl Reply {
    /// Interpret the reply as an integer.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply is not an integer.
    pub fn into_int(self) -> Result<i64, BrokerError> {
        match self {
            Reply::Int(n) => Ok(n),
            _ => Err(BrokerError::UnexpectedReply("integer")),
        }
    }

    /// Interpret an integer reply as a flag (`> 0`).
    ///
    /// # Errors
    ///
    /// Returns an error if the reply is not an integer.
    pub fn into_bool(self) -> Result<bool, BrokerError> {
        self.into_int().map(|n| n > 0)
    }

    /// Interpret the reply as an optional string.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply is neither text nor nil.
    pub fn into_text(self) -> Result<Option<String>, BrokerError> {
        match self {
            Reply::Text(s) => Ok(Some(s)),
            Reply::Nil => Ok(None),
            _ => Err(BrokerError::UnexpectedReply("text")),
        }
    }

    /// Interpret the reply as set members.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply is not a member list.
    pub fn into_members(self) -> Result<Vec<String>, BrokerError> {
        match self {
            Reply::Members(m) => Ok(m),
            Reply::Nil => Ok(Vec::new()),
            _ => Err(BrokerError::UnexpectedReply("members")),
        }
    }

    /// Interpret the reply as log entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the reply is not a list of entries.
    pub fn into_entries(self) -> Result<Vec<LogEntry>, BrokerError> {
        match self {
            Reply::Entries(e) => Ok(e),
            Reply::Nil => Ok(Vec::new()),
            _ => Err(BrokerError::UnexpectedReply("entries")),
        }
    }
}

/// An ordered batch of commands executed in one round trip.
///
/// Pipelines are not transactions: each command runs on its own, in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Pipeline {
    commands: Vec<Command>,
}

impl Pipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command.
    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.push(Command::Set {
            key: key.into(),
            value: value.into(),
            ttl: None,
        })
    }

    pub fn set_ex(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        ttl: Duration,
    ) -> &mut Self {
        self.push(Command::Set {
            key: key.into(),
            value: value.into(),
            ttl: Some(ttl),
        })
    }

    pub fn get(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::Get { key: key.into() })
    }

    pub fn exists(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::Exists { key: key.into() })
    }

    pub fn del(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::Del { key: key.into() })
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.push(Command::Expire {
            key: key.into(),
            ttl,
        })
    }

    pub fn sadd(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(Command::SAdd {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn srem(&mut self, key: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.push(Command::SRem {
            key: key.into(),
            member: member.into(),
        })
    }

    pub fn scard(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::SCard { key: key.into() })
    }

    pub fn smembers(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::SMembers { key: key.into() })
    }

    pub fn append(&mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> &mut Self {
        self.push(Command::Append {
            key: key.into(),
            fields,
        })
    }

    pub fn trim(&mut self, key: impl Into<String>, max_len: usize) -> &mut Self {
        self.push(Command::Trim {
            key: key.into(),
            max_len,
        })
    }

    pub fn rev_range(&mut self, key: impl Into<String>, count: usize) -> &mut Self {
        self.push(Command::RevRange {
            key: key.into(),
            count,
        })
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// The queued commands.
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Consume the pipeline, yielding its commands.
    #[must_use]
    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }
}

/// A message received through a pattern subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMessage {
    /// The pattern that matched.
    pub pattern: String,
    /// The concrete channel the message was published on.
    pub channel: String,
    /// Message payload.
    pub payload: String,
}

/// A live pattern subscription.
///
/// Backed by a dedicated listener task; dropping the subscription stops it.
pub struct Subscription {
    rx: mpsc::Receiver<PatternMessage>,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Wrap a receiver fed by a listener task.
    #[must_use]
    pub fn new(rx: mpsc::Receiver<PatternMessage>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    /// Receive the next message. Returns `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<PatternMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A shared broker.
///
/// Implementations must be safe to use from many tasks at once. Pub/sub
/// listening uses a connection separate from command execution.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Execute a pipeline, returning one reply per command in order.
    async fn execute(&self, pipeline: Pipeline) -> Result<Vec<Reply>, BrokerError>;

    /// Publish a payload on a channel.
    ///
    /// Returns the number of subscribers that received it, as reported by
    /// the broker.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BrokerError>;

    /// Subscribe to a set of glob patterns.
    ///
    /// The returned subscription is active once this call returns.
    async fn psubscribe(&self, patterns: &[&str]) -> Result<Subscription, BrokerError>;

    /// Backend name (e.g. "redis", "memory").
    fn name(&self) -> &'static str;

    /// Check if the broker is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Single-command conveniences over [`Broker::execute`].
#[async_trait]
pub trait BrokerExt: Broker {
    /// Execute one command.
    async fn run(&self, command: Command) -> Result<Reply, BrokerError> {
        let mut pipeline = Pipeline::new();
        pipeline.push(command);
        self.execute(pipeline)
            .await?
            .pop()
            .ok_or(BrokerError::UnexpectedReply("one reply"))
    }

    async fn exists(&self, key: &str) -> Result<bool, BrokerError> {
        self.run(Command::Exists { key: key.to_string() })
            .await?
            .into_bool()
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, BrokerError> {
        self.run(Command::SMembers { key: key.to_string() })
            .await?
            .into_members()
    }

    /// Existence check for many keys in one round trip.
    async fn exists_many(&self, keys: &[String]) -> Result<Vec<bool>, BrokerError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipeline = Pipeline::new();
        for key in keys {
            pipeline.exists(key.as_str());
        }
        self.execute(pipeline)
            .await?
            .into_iter()
            .map(Reply::into_bool)
            .collect()
    }
}

impl<B: Broker + ?Sized> BrokerExt for B {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_builder() {
        let mut pipe = Pipeline::new();
        pipe.sadd("s", "a").exists("k").trim("log", 10);

        assert_eq!(pipe.len(), 3);
        assert_eq!(
            pipe.commands()[0],
            Command::SAdd {
                key: "s".into(),
                member: "a".into()
            }
        );
        assert!(matches!(pipe.commands()[2], Command::Trim { max_len: 10, .. }));

        let keys: Vec<&str> = pipe.commands().iter().map(Command::key).collect();
        assert_eq!(keys, vec!["s", "k", "log"]);
    }

    #[test]
    fn test_reply_conversions() {
        assert!(Reply::Int(1).into_bool().unwrap());
        assert!(!Reply::Int(0).into_bool().unwrap());
        assert_eq!(Reply::Nil.into_text().unwrap(), None);
        assert!(Reply::Ok.into_int().is_err());
        assert!(Reply::Nil.into_members().unwrap().is_empty());
    }

    #[test]
    fn test_log_entry_lookup() {
        let entry = LogEntry {
            id: "1-0".into(),
            fields: vec![("senderId".into(), "alice".into())],
        };
        assert_eq!(entry.get("senderId"), Some("alice"));
        assert_eq!(entry.get("message"), None);
    }

    #[test]
    fn test_transient_errors() {
        assert!(BrokerError::Timeout.is_transient());
        assert!(BrokerError::Unavailable("down".into()).is_transient());
        assert!(!BrokerError::Command("WRONGTYPE".into()).is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let result: Result<(), _> = bounded(Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(BrokerError::Timeout)));
    }
}
