use anyhow::Result;

// ============================================================================
// Configuration Constants
// ============================================================================

// Default port values
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_HEALTH_PORT: u16 = 8081;

// Time conversion constants
pub const SECONDS_PER_MINUTE: i64 = 60;
pub const SECONDS_PER_HOUR: i64 = 3600;

// WebSocket frames carry text plus metadata only; anything larger is a
// client bug or an attack, and media does not travel over this socket.
pub const MAX_WEBSOCKET_MESSAGE_SIZE: usize = 64 * 1024; // 64 KB

// Default rate-limit ceilings (per window)
const DEFAULT_MESSAGES_PER_WINDOW: u32 = 30;
const DEFAULT_ACTIONS_PER_WINDOW: u32 = 10;
const DEFAULT_RATE_WINDOW_SECS: i64 = SECONDS_PER_MINUTE;

// Default recent-cache shape
const DEFAULT_RECENT_CACHE_CAP: usize = 100;
const DEFAULT_RECENT_CACHE_TTL_SECS: i64 = SECONDS_PER_HOUR;

// Default pipeline budgets (in seconds)
const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

// Longest message body accepted by validation (characters, post-trim)
const DEFAULT_MAX_CONTENT_CHARS: usize = 4000;

// ============================================================================
// Configuration Structures
// ============================================================================

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub enable_user_identifiers: bool,
    pub hash_salt: String,
}

/// Database connection pool configuration
#[derive(Clone, Debug)]
pub struct DbConfig {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Timeout for acquiring a connection from the pool (seconds)
    pub acquire_timeout_secs: u64,
    /// Timeout for idle connections before they are closed (seconds)
    pub idle_timeout_secs: u64,
}

/// Per-user rate-limit ceilings, all counted against a shared window length
#[derive(Clone, Debug)]
pub struct LimitsConfig {
    /// Ceiling for message sends and edits within one window
    pub messages_per_window: u32,
    /// Ceiling for reactions, joins and leaves within one window
    pub actions_per_window: u32,
    /// Window length in seconds; counters hard-expire at the boundary
    pub window_secs: i64,
}

/// What happens when the profanity filter matches
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfanityPolicy {
    /// Fail the send with a validation error
    Reject,
    /// Substitute the matched token and flag the message
    Replace,
}

impl std::str::FromStr for ProfanityPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "replace" => Ok(Self::Replace),
            _ => anyhow::bail!(
                "Invalid profanity policy: {}. Must be 'reject' or 'replace'",
                s
            ),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModerationConfig {
    pub policy: ProfanityPolicy,
    /// Lowercased banned tokens; an empty list disables matching
    pub words: Vec<String>,
    /// Replacement token under the `replace` policy
    pub placeholder: String,
}

/// Bounded per-room recent message cache
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Entries retained per room
    pub recent_cap: usize,
    /// List TTL in seconds
    pub ttl_secs: i64,
}

/// Full-text search collaborator
#[derive(Clone, Debug)]
pub struct SearchConfig {
    /// Disabled means documents are silently skipped
    pub enabled: bool,
    /// Base URL of the search engine (e.g., "http://localhost:7700")
    pub base_url: String,
    /// Index (collection) name documents are written to
    pub index: String,
    /// Per-request timeout (seconds)
    pub timeout_secs: u64,
}

/// Message pipeline budgets and validation bounds
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Budget for each awaited stage (rate-limit check, persistence)
    pub stage_timeout_secs: u64,
    /// How long a fresh socket may take to present its connect frame
    pub handshake_timeout_secs: u64,
    /// Longest accepted message body, in characters
    pub max_content_chars: usize,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    /// HS256 secret for verifying gateway tokens
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub port: u16,
    pub health_port: u16,
    pub rust_log: String,
    /// Optional base64 32-byte key pinning message encryption across
    /// restarts; absent means a fresh per-process key
    pub message_key: Option<String>,
    pub limits: LimitsConfig,
    pub moderation: ModerationConfig,
    pub cache: CacheConfig,
    pub search: SearchConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
    pub db: DbConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")?,
            redis_url: std::env::var("REDIS_URL")?,
            jwt_secret: {
                let secret = std::env::var("JWT_SECRET")?;
                if secret.len() < 32 {
                    anyhow::bail!("JWT_SECRET must be at least 32 characters long");
                }
                secret
            },
            jwt_issuer: std::env::var("JWT_ISSUER")
                .unwrap_or_else(|_| "roomcast".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            health_port: std::env::var("HEALTH_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_HEALTH_PORT),
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            message_key: std::env::var("MESSAGE_KEY").ok(),
            limits: LimitsConfig {
                messages_per_window: std::env::var("RATE_MESSAGES_PER_WINDOW")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_MESSAGES_PER_WINDOW),
                actions_per_window: std::env::var("RATE_ACTIONS_PER_WINDOW")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_ACTIONS_PER_WINDOW),
                window_secs: std::env::var("RATE_WINDOW_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_RATE_WINDOW_SECS),
            },
            moderation: ModerationConfig {
                policy: std::env::var("MODERATION_POLICY")
                    .unwrap_or_else(|_| "replace".to_string())
                    .parse()?,
                words: std::env::var("MODERATION_WORDS")
                    .unwrap_or_default()
                    .split(',')
                    .map(|w| w.trim().to_lowercase())
                    .filter(|w| !w.is_empty())
                    .collect(),
                placeholder: std::env::var("MODERATION_PLACEHOLDER")
                    .unwrap_or_else(|_| "***".to_string()),
            },
            cache: CacheConfig {
                recent_cap: std::env::var("RECENT_CACHE_CAP")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_RECENT_CACHE_CAP),
                ttl_secs: std::env::var("RECENT_CACHE_TTL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_RECENT_CACHE_TTL_SECS),
            },
            search: SearchConfig {
                enabled: std::env::var("SEARCH_ENABLED")
                    .unwrap_or_else(|_| "false".to_string())
                    .parse()
                    .unwrap_or(false),
                base_url: std::env::var("SEARCH_BASE_URL")
                    .unwrap_or_else(|_| "http://localhost:7700".to_string()),
                index: std::env::var("SEARCH_INDEX")
                    .unwrap_or_else(|_| "messages".to_string()),
                timeout_secs: std::env::var("SEARCH_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            },
            pipeline: PipelineConfig {
                stage_timeout_secs: std::env::var("STAGE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_STAGE_TIMEOUT_SECS),
                handshake_timeout_secs: std::env::var("HANDSHAKE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
                max_content_chars: std::env::var("MAX_CONTENT_CHARS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_MAX_CONTENT_CHARS),
            },
            logging: LoggingConfig {
                enable_user_identifiers: std::env::var("LOG_USER_IDENTIFIERS")
                    .unwrap_or_else(|_| "false".to_string())
                    .parse()
                    .unwrap_or(false),
                hash_salt: {
                    let salt = std::env::var("LOG_HASH_SALT")
                        .unwrap_or_else(|_| "default-salt-please-change".to_string());
                    if salt.is_empty() || salt == "default-salt-please-change" {
                        anyhow::bail!("LOG_HASH_SALT must be set to a unique, secret value");
                    }
                    salt
                },
            },
            db: DbConfig {
                max_connections: std::env::var("DB_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
                acquire_timeout_secs: std::env::var("DB_ACQUIRE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
                idle_timeout_secs: std::env::var("DB_IDLE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(600),
            },
        })
    }
}
