//! Broker key and channel namespace.

/// Pattern covering every direct message channel.
pub const DM_CHANNEL_PATTERN: &str = "chat:dm:*";
/// Pattern covering every group channel.
pub const GROUP_CHANNEL_PATTERN: &str = "chat:group:*";
/// Pattern covering every notification channel.
pub const NOTIFY_CHANNEL_PATTERN: &str = "notifications:*";

pub(crate) const DM_CHANNEL_PREFIX: &str = "chat:dm:";
pub(crate) const GROUP_CHANNEL_PREFIX: &str = "chat:group:";
pub(crate) const NOTIFY_CHANNEL_PREFIX: &str = "notifications:";

/// Set of users with at least one registered session.
pub const ONLINE_USERS: &str = "users:online";

pub fn dm_log(pair: &str) -> String {
    format!("chat:stream:dm:{}", pair)
}

pub fn group_log(group_id: &str) -> String {
    format!("chat:stream:group:{}", group_id)
}

pub fn dm_channel(pair: &str) -> String {
    format!("{}{}", DM_CHANNEL_PREFIX, pair)
}

pub fn group_channel(group_id: &str) -> String {
    format!("{}{}", GROUP_CHANNEL_PREFIX, group_id)
}

pub fn notify_channel(user_id: &str) -> String {
    format!("{}{}", NOTIFY_CHANNEL_PREFIX, user_id)
}

/// TTL marker holding the most recent session id.
pub fn online_marker(user_id: &str) -> String {
    format!("user:online:{}", user_id)
}

pub fn sessions(user_id: &str) -> String {
    format!("user:sessions:{}", user_id)
}

pub fn group_members(group_id: &str) -> String {
    format!("group:members:{}", group_id)
}

pub fn pending(user_id: &str) -> String {
    format!("user:pending:{}", user_id)
}

pub fn delivered(message_id: &str, user_id: &str) -> String {
    format!("message:delivered:{}:{}", message_id, user_id)
}

pub fn read(message_id: &str, user_id: &str) -> String {
    format!("message:read:{}:{}", message_id, user_id)
}

/// Connection-layer room for a single user's connections.
pub fn user_room(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// Connection-layer room for a group's joined connections.
pub fn group_room(group_id: &str) -> String {
    format!("group:{}", group_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace() {
        assert_eq!(dm_log("alice:bob"), "chat:stream:dm:alice:bob");
        assert_eq!(group_channel("rust"), "chat:group:rust");
        assert_eq!(notify_channel("bob"), "notifications:bob");
        assert_eq!(delivered("1-0", "bob"), "message:delivered:1-0:bob");
        assert_eq!(user_room("bob"), "user:bob");
    }
}
