use std::sync::Arc;

use crate::auth::AuthManager;
use crate::config::Config;
use crate::crypto::MessageCipher;
use crate::db::DbPool;
use crate::kv::KvClient;
use crate::moderation::ModerationPipeline;
use crate::presence::PresenceRegistry;
use crate::rate_limit::RateLimiter;
use crate::rooms::RoomDirectory;
use crate::store::MessageStore;

/// Application context containing shared dependencies
/// This reduces parameter passing and makes it easier to add new dependencies
#[derive(Clone)]
pub struct AppContext {
    pub db_pool: DbPool,
    pub kv: KvClient,
    pub auth_manager: Arc<AuthManager>,
    pub cipher: Arc<MessageCipher>,
    pub moderation: Arc<ModerationPipeline>,
    pub rate_limiter: Arc<RateLimiter>,
    pub rooms: RoomDirectory,
    pub store: MessageStore,
    pub presence: Arc<PresenceRegistry>,
    pub config: Arc<Config>,
}
