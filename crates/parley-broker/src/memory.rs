//! In-process broker.
//!
//! Implements the full [`Broker`] surface on lock-free maps so a single
//! server process (and the test suite) can run without an external store.
//! Expiry is evaluated lazily against the tokio clock.

use crate::traits::{
    Broker, BrokerError, Command, LogEntry, PatternMessage, Pipeline, Reply, Subscription,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Default capacity of the internal pub/sub bus.
const DEFAULT_BUS_CAPACITY: usize = 4096;

/// Buffer between the bus and one subscription.
const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Default)]
struct MemoryLog {
    entries: VecDeque<LogEntry>,
    last_id: (u64, u64),
}

impl MemoryLog {
    fn next_id(&mut self) -> String {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let (last_ms, last_seq) = self.last_id;
        self.last_id = if now_ms > last_ms {
            (now_ms, 0)
        } else {
            (last_ms, last_seq + 1)
        };
        format!("{}-{}", self.last_id.0, self.last_id.1)
    }
}

#[derive(Debug, Clone)]
struct Published {
    channel: String,
    payload: String,
}

/// Match a glob pattern supporting `*` and `?`.
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// An in-process broker.
pub struct MemoryBroker {
    strings: DashMap<String, Expiring<String>>,
    sets: DashMap<String, Expiring<BTreeSet<String>>>,
    logs: DashMap<String, Expiring<MemoryLog>>,
    bus: broadcast::Sender<Arc<Published>>,
}

impl MemoryBroker {
    /// Create a new broker.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    /// Create a broker whose pub/sub bus buffers `capacity` messages.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity);
        Self {
            strings: DashMap::new(),
            sets: DashMap::new(),
            logs: DashMap::new(),
            bus,
        }
    }

    /// Number of entries currently held in a log.
    #[must_use]
    pub fn log_len(&self, key: &str) -> usize {
        self.logs
            .get(key)
            .map(|log| log.value.entries.len())
            .unwrap_or(0)
    }

    fn purge(&self, key: &str, now: Instant) {
        self.strings.remove_if(key, |_, e| !e.is_live(now));
        self.sets.remove_if(key, |_, e| !e.is_live(now));
        self.logs.remove_if(key, |_, e| !e.is_live(now));
    }

    fn key_exists(&self, key: &str) -> bool {
        self.strings.contains_key(key) || self.sets.contains_key(key) || self.logs.contains_key(key)
    }

    fn apply(&self, command: Command, now: Instant) -> Reply {
        self.purge(command_key(&command), now);

        match command {
            Command::Set { key, value, ttl } => {
                self.sets.remove(&key);
                self.logs.remove(&key);
                let mut entry = Expiring::new(value);
                entry.expires_at = ttl.map(|ttl| now + ttl);
                self.strings.insert(key, entry);
                Reply::Ok
            }
            Command::Get { key } => self
                .strings
                .get(&key)
                .map_or(Reply::Nil, |e| Reply::Text(e.value.clone())),
            Command::Exists { key } => Reply::Int(i64::from(self.key_exists(&key))),
            Command::Del { key } => {
                let removed = self.strings.remove(&key).is_some()
                    | self.sets.remove(&key).is_some()
                    | self.logs.remove(&key).is_some();
                Reply::Int(i64::from(removed))
            }
            Command::Expire { key, ttl } => {
                let at = Some(now + ttl);
                let mut found = false;
                if let Some(mut e) = self.strings.get_mut(&key) {
                    e.expires_at = at;
                    found = true;
                }
                if let Some(mut e) = self.sets.get_mut(&key) {
                    e.expires_at = at;
                    found = true;
                }
                if let Some(mut e) = self.logs.get_mut(&key) {
                    e.expires_at = at;
                    found = true;
                }
                Reply::Int(i64::from(found))
            }
            Command::SAdd { key, member } => {
                let mut set = self
                    .sets
                    .entry(key)
                    .or_insert_with(|| Expiring::new(BTreeSet::new()));
                Reply::Int(i64::from(set.value.insert(member)))
            }
            Command::SRem { key, member } => {
                let removed = self
                    .sets
                    .get_mut(&key)
                    .map(|mut set| set.value.remove(&member))
                    .unwrap_or(false);
                self.sets.remove_if(&key, |_, set| set.value.is_empty());
                Reply::Int(i64::from(removed))
            }
            Command::SCard { key } => Reply::Int(
                self.sets
                    .get(&key)
                    .map(|set| set.value.len() as i64)
                    .unwrap_or(0),
            ),
            Command::SMembers { key } => Reply::Members(
                self.sets
                    .get(&key)
                    .map(|set| set.value.iter().cloned().collect())
                    .unwrap_or_default(),
            ),
            Command::Append { key, fields } => {
                let mut log = self
                    .logs
                    .entry(key)
                    .or_insert_with(|| Expiring::new(MemoryLog::default()));
                let id = log.value.next_id();
                log.value.entries.push_back(LogEntry {
                    id: id.clone(),
                    fields,
                });
                Reply::Text(id)
            }
            Command::Trim { key, max_len } => {
                let mut removed = 0;
                if let Some(mut log) = self.logs.get_mut(&key) {
                    while log.value.entries.len() > max_len {
                        log.value.entries.pop_front();
                        removed += 1;
                    }
                }
                Reply::Int(removed)
            }
            Command::RevRange { key, count } => Reply::Entries(
                self.logs
                    .get(&key)
                    .map(|log| log.value.entries.iter().rev().take(count).cloned().collect())
                    .unwrap_or_default(),
            ),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn command_key(command: &Command) -> &str {
    match command {
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
        | Command::RevRange { key, .. } => key.as_str(),
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn execute(&self, pipeline: Pipeline) -> Result<Vec<Reply>, BrokerError> {
        let now = Instant::now();
        let replies = pipeline
            .into_commands()
            .into_iter()
            .map(|command| self.apply(command, now))
            .collect::<Vec<_>>();
        trace!(commands = replies.len(), "Executed pipeline");
        Ok(replies)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BrokerError> {
        let message = Arc::new(Published {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(self.bus.send(message).unwrap_or_default())
    }

    async fn psubscribe(&self, patterns: &[&str]) -> Result<Subscription, BrokerError> {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        let mut bus = self.bus.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        debug!(?patterns, "Memory broker subscription started");

        let task = tokio::spawn(async move {
            loop {
                match bus.recv().await {
                    Ok(published) => {
                        for pattern in &patterns {
                            if !glob_match(pattern, &published.channel) {
                                continue;
                            }
                            let message = PatternMessage {
                                pattern: pattern.clone(),
                                channel: published.channel.clone(),
                                payload: published.payload.clone(),
                            };
                            if tx.send(message).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Memory broker subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(Subscription::new(rx, task))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
