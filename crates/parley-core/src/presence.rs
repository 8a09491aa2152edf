//! Presence tracking across devices.
//!
//! A user is online while their session set is non-empty. Every session
//! registration refreshes a TTL on both the online marker and the session
//! set, so a process that dies without calling [`PresenceTracker::mark_offline`]
//! leaves nothing behind once the TTL elapses.

use crate::error::ChatError;
use crate::keys;
use parley_broker::{Broker, BrokerExt, Pipeline, Reply};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of removing a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    /// Other sessions remain.
    StillOnline(usize),
    /// The last session was removed.
    WentOffline,
}

/// Tracks online users and their sessions.
pub struct PresenceTracker {
    broker: Arc<dyn Broker>,
    ttl: Duration,
}

impl PresenceTracker {
    pub fn new(broker: Arc<dyn Broker>, ttl: Duration) -> Self {
        Self { broker, ttl }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register a session and refresh the user's TTL.
    ///
    /// Idempotent for a session that is already registered. Also used to
    /// re-assert presence on heartbeat.
    ///
    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn mark_online(&self, user_id: &str, session_id: &str) -> Result<(), ChatError> {
        let sessions = keys::sessions(user_id);
        let mut pipe = Pipeline::new();
        pipe.set_ex(keys::online_marker(user_id), session_id, self.ttl)
            .sadd(keys::ONLINE_USERS, user_id)
            .sadd(sessions.as_str(), session_id)
            .expire(sessions.as_str(), self.ttl);
        self.broker.execute(pipe).await?;

        debug!(user = %user_id, session = %session_id, "Presence refreshed");
        Ok(())
    }

    /// Remove one session, or all sessions when `session_id` is `None`.
    ///
    /// When no session remains, the session set, the online marker and the
    /// entry in the online set are cleared together.
    ///
    /// A concurrent [`mark_online`](Self::mark_online) from another device can
    /// land between the cardinality check and the cleanup; that device's next
    /// heartbeat restores its presence.
    ///
    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn mark_offline(
        &self,
        user_id: &str,
        session_id: Option<&str>,
    ) -> Result<PresenceTransition, ChatError> {
        let sessions = keys::sessions(user_id);

        if let Some(session_id) = session_id {
            let mut pipe = Pipeline::new();
            pipe.srem(sessions.as_str(), session_id)
                .scard(sessions.as_str());
            let remaining = self
                .broker
                .execute(pipe)
                .await?
                .pop()
                .map(Reply::into_int)
                .transpose()?
                .unwrap_or(0);

            if remaining > 0 {
                debug!(user = %user_id, session = %session_id, remaining, "Session removed");
                return Ok(PresenceTransition::StillOnline(remaining as usize));
            }
        }

        let mut pipe = Pipeline::new();
        pipe.del(keys::online_marker(user_id))
            .del(sessions.as_str())
            .srem(keys::ONLINE_USERS, user_id);
        self.broker.execute(pipe).await?;

        info!(user = %user_id, forced = session_id.is_none(), "User offline");
        Ok(PresenceTransition::WentOffline)
    }

    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn is_online(&self, user_id: &str) -> Result<bool, ChatError> {
        Ok(self.broker.exists(&keys::online_marker(user_id)).await?)
    }

    /// Online state for many users in one round trip.
    ///
    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn are_online(
        &self,
        user_ids: &[String],
    ) -> Result<BTreeMap<String, bool>, ChatError> {
        let markers: Vec<String> = user_ids.iter().map(|u| keys::online_marker(u)).collect();
        let flags = self.broker.exists_many(&markers).await?;
        Ok(user_ids.iter().cloned().zip(flags).collect())
    }

    /// Users whose online marker is still live.
    ///
    /// Members of the online set whose marker has expired are removed from
    /// it on the way.
    ///
    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn online_users(&self) -> Result<Vec<String>, ChatError> {
        let candidates = self.broker.members(keys::ONLINE_USERS).await?;
        let status = self.are_online(&candidates).await?;

        let (online, ghosts): (Vec<_>, Vec<_>) =
            status.into_iter().partition(|(_, online)| *online);

        if !ghosts.is_empty() {
            let mut pipe = Pipeline::new();
            for (user_id, _) in &ghosts {
                pipe.srem(keys::ONLINE_USERS, user_id.as_str());
            }
            match self.broker.execute(pipe).await {
                Ok(_) => debug!(pruned = ghosts.len(), "Pruned expired presence entries"),
                Err(e) => warn!(error = %e, "Failed to prune expired presence entries"),
            }
        }

        Ok(online.into_iter().map(|(user_id, _)| user_id).collect())
    }

    /// Size of the online set. May include users whose marker expired since
    /// the last [`online_users`](Self::online_users) call.
    ///
    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn online_count(&self) -> Result<usize, ChatError> {
        let mut pipe = Pipeline::new();
        pipe.scard(keys::ONLINE_USERS);
        let count = self
            .broker
            .execute(pipe)
            .await?
            .pop()
            .map(Reply::into_int)
            .transpose()?
            .unwrap_or(0);
        Ok(count.max(0) as usize)
    }

    /// Registered sessions for a user.
    ///
    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn sessions(&self, user_id: &str) -> Result<Vec<String>, ChatError> {
        Ok(self.broker.members(&keys::sessions(user_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_broker::MemoryBroker;

    fn tracker() -> (Arc<MemoryBroker>, PresenceTracker) {
        let broker = Arc::new(MemoryBroker::new());
        let tracker = PresenceTracker::new(broker.clone(), Duration::from_secs(3600));
        (broker, tracker)
    }

    #[tokio::test]
    async fn test_multi_device_presence() {
        let (_, presence) = tracker();

        presence.mark_online("u", "s1").await.unwrap();
        presence.mark_online("u", "s2").await.unwrap();

        assert_eq!(
            presence.mark_offline("u", Some("s1")).await.unwrap(),
            PresenceTransition::StillOnline(1)
        );
        assert!(presence.is_online("u").await.unwrap());

        assert_eq!(
            presence.mark_offline("u", Some("s2")).await.unwrap(),
            PresenceTransition::WentOffline
        );
        assert!(!presence.is_online("u").await.unwrap());
        assert!(presence.sessions("u").await.unwrap().is_empty());
        assert!(presence.online_users().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_online_is_idempotent() {
        let (_, presence) = tracker();

        presence.mark_online("u", "s1").await.unwrap();
        presence.mark_online("u", "s1").await.unwrap();

        assert_eq!(presence.sessions("u").await.unwrap(), vec!["s1".to_string()]);
        assert_eq!(presence.online_count().await.unwrap(), 1);
        assert!(presence.is_online("u").await.unwrap());
    }

    #[tokio::test]
    async fn test_forced_offline_clears_all_sessions() {
        let (_, presence) = tracker();

        presence.mark_online("u", "s1").await.unwrap();
        presence.mark_online("u", "s2").await.unwrap();

        assert_eq!(
            presence.mark_offline("u", None).await.unwrap(),
            PresenceTransition::WentOffline
        );
        assert!(!presence.is_online("u").await.unwrap());
        assert!(presence.sessions("u").await.unwrap().is_empty());
        assert_eq!(presence.online_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch_online_check() {
        let (_, presence) = tracker();
        presence.mark_online("alice", "s1").await.unwrap();

        let status = presence
            .are_online(&["alice".to_string(), "bob".to_string()])
            .await
            .unwrap();
        assert_eq!(status.get("alice"), Some(&true));
        assert_eq!(status.get("bob"), Some(&false));

        assert!(presence.are_online(&[]).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_session_expires() {
        let (broker, presence) = tracker();
        presence.mark_online("ghost", "s1").await.unwrap();
        presence.mark_online("alive", "s2").await.unwrap();

        tokio::time::advance(Duration::from_secs(1800)).await;
        presence.mark_online("alive", "s2").await.unwrap();
        tokio::time::advance(Duration::from_secs(1801)).await;

        assert!(!presence.is_online("ghost").await.unwrap());
        assert!(presence.sessions("ghost").await.unwrap().is_empty());
        assert!(presence.is_online("alive").await.unwrap());

        // The stale set member is pruned on read
        assert_eq!(presence.online_count().await.unwrap(), 2);
        assert_eq!(presence.online_users().await.unwrap(), vec!["alive".to_string()]);
        assert_eq!(presence.online_count().await.unwrap(), 1);
        assert!(!broker.exists(&keys::online_marker("ghost")).await.unwrap());
    }
}
