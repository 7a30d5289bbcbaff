//! Per-user rate limiting over Redis counter windows.
//!
//! One counter per (user, action class), incremented and armed with its TTL
//! in a single Lua round trip. Windows are hard-cutover: the TTL is set when
//! the key is first touched and never extended, so the counter vanishes at
//! the window boundary regardless of traffic.

use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::error::{ChatError, ChatResult};
use crate::kv::KvClient;

/// Rate limit action classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionClass {
    /// Message sends and edits
    Message,
    /// Reaction toggles
    Reaction,
    /// Room joins and leaves
    Membership,
}

impl ActionClass {
    /// Action identifier for counter keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Reaction => "reaction",
            Self::Membership => "membership",
        }
    }

    /// Human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            Self::Message => "send messages",
            Self::Reaction => "toggle reactions",
            Self::Membership => "join or leave rooms",
        }
    }
}

/// Ceiling for one class within one window
pub fn ceiling_for(limits: &LimitsConfig, class: ActionClass) -> u32 {
    match class {
        ActionClass::Message => limits.messages_per_window,
        ActionClass::Reaction | ActionClass::Membership => limits.actions_per_window,
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    kv: KvClient,
    limits: LimitsConfig,
}

impl RateLimiter {
    pub fn new(kv: KvClient, limits: LimitsConfig) -> Self {
        Self { kv, limits }
    }

    fn counter_key(user_id: &Uuid, class: ActionClass) -> String {
        format!("rate:{}:{}", class.as_str(), user_id)
    }

    /// Count this call against the user's window; reject once the ceiling
    /// is crossed, with a retry hint read from the key's remaining TTL.
    pub async fn check_and_consume(&self, user_id: &Uuid, class: ActionClass) -> ChatResult<()> {
        let ceiling = ceiling_for(&self.limits, class);
        let key = Self::counter_key(user_id, class);
        let mut kv = self.kv.clone();

        let count = kv.counter_window(&key, self.limits.window_secs).await?;
        if count > ceiling as i64 {
            // The key can expire between the increment and this read; a
            // non-positive TTL just means the client may retry immediately.
            let retry_after_secs = kv.ttl(&key).await?.max(0);
            crate::metrics::RATE_LIMIT_REJECTIONS_TOTAL.inc();
            tracing::debug!(
                class = class.as_str(),
                count,
                ceiling,
                retry_after_secs,
                "Rate limited: too many attempts to {}",
                class.description()
            );
            return Err(ChatError::RateLimited { retry_after_secs });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> LimitsConfig {
        LimitsConfig {
            messages_per_window: 30,
            actions_per_window: 10,
            window_secs: 60,
        }
    }

    #[test]
    fn action_class_strings() {
        assert_eq!(ActionClass::Message.as_str(), "message");
        assert_eq!(ActionClass::Reaction.as_str(), "reaction");
        assert_eq!(ActionClass::Membership.as_str(), "membership");

        assert_eq!(ActionClass::Message.description(), "send messages");
        assert_eq!(ActionClass::Reaction.description(), "toggle reactions");
        assert_eq!(ActionClass::Membership.description(), "join or leave rooms");
    }

    #[test]
    fn message_class_gets_the_higher_ceiling() {
        let limits = limits();
        assert_eq!(ceiling_for(&limits, ActionClass::Message), 30);
        assert_eq!(ceiling_for(&limits, ActionClass::Reaction), 10);
        assert_eq!(ceiling_for(&limits, ActionClass::Membership), 10);
    }

    #[test]
    fn counter_keys_separate_users_and_classes() {
        let user_a = Uuid::new_v4();
        let user_b = Uuid::new_v4();

        let key_a = RateLimiter::counter_key(&user_a, ActionClass::Message);
        assert_eq!(key_a, format!("rate:message:{}", user_a));
        assert_ne!(key_a, RateLimiter::counter_key(&user_b, ActionClass::Message));
        assert_ne!(key_a, RateLimiter::counter_key(&user_a, ActionClass::Reaction));
    }
}
