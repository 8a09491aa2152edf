//! Redis broker implementation.
//!
//! Command and publish traffic use two separate auto-reconnecting
//! `ConnectionManager` handles. Pattern subscriptions open a dedicated
//! connection, since a connection in subscriber mode cannot issue commands.

use ::redis::aio::ConnectionManager;
use ::redis::streams::StreamRangeReply;
use ::redis::{Client, FromRedisValue, RedisError, Value};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::traits::{
    bounded, Broker, BrokerError, Command, LogEntry, PatternMessage, Pipeline, Reply, Subscription,
};

/// Buffer between the subscriber connection and its consumer.
const SUBSCRIPTION_BUFFER: usize = 4096;

/// Redis broker configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`.
    pub url: String,
    /// Time bound for each command or pipeline.
    pub command_timeout: Duration,
    /// Time bound for establishing a connection.
    pub connect_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            command_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl From<RedisError> for BrokerError {
    fn from(err: RedisError) -> Self {
        if err.is_timeout() {
            BrokerError::Timeout
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
        {
            BrokerError::Unavailable(err.to_string())
        } else {
            BrokerError::Command(err.to_string())
        }
    }
}

/// Redis-backed broker.
pub struct RedisBroker {
    client: Client,
    commands: ConnectionManager,
    publisher: ConnectionManager,
    config: RedisConfig,
}

impl RedisBroker {
    /// Connect the command and publisher handles.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server cannot be reached
    /// within the connect timeout.
    pub async fn connect(config: RedisConfig) -> Result<Self, BrokerError> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| BrokerError::Unavailable(format!("invalid redis url: {}", e)))?;

        let commands = bounded(config.connect_timeout, async {
            ConnectionManager::new(client.clone())
                .await
                .map_err(BrokerError::from)
        })
        .await?;
        let publisher = bounded(config.connect_timeout, async {
            ConnectionManager::new(client.clone())
                .await
                .map_err(BrokerError::from)
        })
        .await?;

        info!("Redis broker connected");

        Ok(Self {
            client,
            commands,
            publisher,
            config,
        })
    }
}

fn convert(command: &Command, value: &Value) -> Result<Reply, BrokerError> {
    let reply = match command {
        Command::Set { .. } => Reply::Ok,
        Command::Get { .. } => match Option::<String>::from_redis_value(value)? {
            Some(text) => Reply::Text(text),
            None => Reply::Nil,
        },
        Command::Append { .. } => Reply::Text(String::from_redis_value(value)?),
        Command::SMembers { .. } => Reply::Members(Vec::<String>::from_redis_value(value)?),
        Command::RevRange { .. } => {
            let range = StreamRangeReply::from_redis_value(value)?;
            let entries = range
                .ids
                .into_iter()
                .map(|entry| LogEntry {
                    id: entry.id,
                    fields: entry
                        .map
                        .into_iter()
                        .filter_map(|(k, v)| String::from_redis_value(&v).ok().map(|v| (k, v)))
                        .collect(),
                })
                .collect();
            Reply::Entries(entries)
        }
        Command::Exists { .. }
        | Command::Del { .. }
        | Command::Expire { .. }
        | Command::SAdd { .. }
        | Command::SRem { .. }
        | Command::SCard { .. }
        | Command::Trim { .. } => Reply::Int(i64::from_redis_value(value)?),
    };
    Ok(reply)
}

fn build(commands: &[Command]) -> ::redis::Pipeline {
    let mut pipe = ::redis::pipe();
    for command in commands {
        match command {
            Command::Set { key, value, ttl } => {
                pipe.cmd("SET").arg(key).arg(value);
                if let Some(ttl) = ttl {
                    pipe.arg("EX").arg(ttl.as_secs().max(1));
                }
            }
            Command::Get { key } => {
                pipe.cmd("GET").arg(key);
            }
            Command::Exists { key } => {
                pipe.cmd("EXISTS").arg(key);
            }
            Command::Del { key } => {
                pipe.cmd("DEL").arg(key);
            }
            Command::Expire { key, ttl } => {
                pipe.cmd("EXPIRE").arg(key).arg(ttl.as_secs().max(1));
            }
            Command::SAdd { key, member } => {
                pipe.cmd("SADD").arg(key).arg(member);
            }
            Command::SRem { key, member } => {
                pipe.cmd("SREM").arg(key).arg(member);
            }
            Command::SCard { key } => {
                pipe.cmd("SCARD").arg(key);
            }
            Command::SMembers { key } => {
                pipe.cmd("SMEMBERS").arg(key);
            }
            Command::Append { key, fields } => {
                pipe.cmd("XADD").arg(key).arg("*");
                for (field, value) in fields {
                    pipe.arg(field).arg(value);
                }
            }
            Command::Trim { key, max_len } => {
                // Approximate trimming for performance
                pipe.cmd("XTRIM").arg(key).arg("MAXLEN").arg("~").arg(*max_len);
            }
            Command::RevRange { key, count } => {
                pipe.cmd("XREVRANGE")
                    .arg(key)
                    .arg("+")
                    .arg("-")
                    .arg("COUNT")
                    .arg(*count);
            }
        }
    }
    pipe
}

#[async_trait]
impl Broker for RedisBroker {
    async fn execute(&self, pipeline: Pipeline) -> Result<Vec<Reply>, BrokerError> {
        if pipeline.is_empty() {
            return Ok(Vec::new());
        }

        let commands = pipeline.into_commands();
        let pipe = build(&commands);
        let mut conn = self.commands.clone();

        let values: Vec<Value> = bounded(self.config.command_timeout, async {
            pipe.query_async(&mut conn).await.map_err(BrokerError::from)
        })
        .await?;

        if values.len() != commands.len() {
            return Err(BrokerError::UnexpectedReply("one reply per command"));
        }

        commands
            .iter()
            .zip(values.iter())
            .map(|(command, value)| convert(command, value))
            .collect()
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize, BrokerError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = bounded(self.config.command_timeout, async {
            ::redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async(&mut conn)
                .await
                .map_err(BrokerError::from)
        })
        .await?;
        Ok(usize::try_from(receivers).unwrap_or_default())
    }

    async fn psubscribe(&self, patterns: &[&str]) -> Result<Subscription, BrokerError> {
        // PubSub requires a dedicated connection, not multiplexed
        let mut pubsub = bounded(self.config.connect_timeout, async {
            self.client
                .get_async_pubsub()
                .await
                .map_err(BrokerError::from)
        })
        .await?;

        for pattern in patterns {
            bounded(self.config.command_timeout, async {
                pubsub.psubscribe(*pattern).await.map_err(BrokerError::from)
            })
            .await?;
            info!(pattern = %pattern, "Subscribed to channel pattern");
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let task = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let pattern: String = msg.get_pattern().unwrap_or_default();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Dropping non-text payload");
                        continue;
                    }
                };
                if tx
                    .send(PatternMessage {
                        pattern,
                        channel,
                        payload,
                    })
                    .await
                    .is_err()
                {
                    debug!("Subscription receiver dropped");
                    return;
                }
            }
            warn!("Redis subscriber connection closed");
        });

        Ok(Subscription::new(rx, task))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
