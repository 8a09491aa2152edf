//! Durable group membership.
//!
//! Membership is an explicit set per group. It is independent of which
//! connections currently sit in the group's room.

use crate::error::ChatError;
use crate::keys;
use parley_broker::{Broker, BrokerExt, Command, Reply};
use std::sync::Arc;
use tracing::debug;

pub struct GroupMembership {
    broker: Arc<dyn Broker>,
}

impl GroupMembership {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Add a user to a group. Returns `false` if already a member.
    ///
    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn add_member(&self, group_id: &str, user_id: &str) -> Result<bool, ChatError> {
        let added = self
            .broker
            .run(Command::SAdd {
                key: keys::group_members(group_id),
                member: user_id.to_string(),
            })
            .await
            .and_then(Reply::into_bool)?;
        debug!(group = %group_id, user = %user_id, added, "Group member added");
        Ok(added)
    }

    /// Remove a user from a group. Returns `false` if not a member.
    ///
    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn remove_member(&self, group_id: &str, user_id: &str) -> Result<bool, ChatError> {
        let removed = self
            .broker
            .run(Command::SRem {
                key: keys::group_members(group_id),
                member: user_id.to_string(),
            })
            .await
            .and_then(Reply::into_bool)?;
        debug!(group = %group_id, user = %user_id, removed, "Group member removed");
        Ok(removed)
    }

    /// # Errors
    ///
    /// Returns a broker error.
    pub async fn members(&self, group_id: &str) -> Result<Vec<String>, ChatError> {
        Ok(self.broker.members(&keys::group_members(group_id)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_broker::MemoryBroker;

    #[tokio::test]
    async fn test_membership() {
        let groups = GroupMembership::new(Arc::new(MemoryBroker::new()));

        assert!(groups.add_member("rust", "alice").await.unwrap());
        assert!(groups.add_member("rust", "bob").await.unwrap());
        assert!(!groups.add_member("rust", "bob").await.unwrap());

        let mut members = groups.members("rust").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["alice".to_string(), "bob".to_string()]);

        assert!(groups.remove_member("rust", "alice").await.unwrap());
        assert!(!groups.remove_member("rust", "alice").await.unwrap());
        assert_eq!(groups.members("rust").await.unwrap(), vec!["bob".to_string()]);
        assert!(groups.members("empty").await.unwrap().is_empty());
    }
}
