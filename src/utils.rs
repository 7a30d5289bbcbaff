use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::LoggingConfig;

/// Creates a truncated, salted hash of an identifier for safe logging.
pub fn log_safe_id(id: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(id.as_bytes());
    let hash = hasher.finalize();

    // Take first 4 bytes and format each as hex
    hash[..4]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>()
}

/// How a user id appears in log output: the raw identifier only when the
/// deployment opts in, otherwise the salted hash.
pub fn display_user_id(user_id: &Uuid, logging: &LoggingConfig) -> String {
    if logging.enable_user_identifiers {
        user_id.to_string()
    } else {
        log_safe_id(&user_id.to_string(), &logging.hash_salt)
    }
}

/// Display name for a user whose token carried no name claim, or who is not
/// currently connected.
pub fn fallback_username(user_id: &Uuid) -> String {
    format!("user-{}", &user_id.to_string()[..8])
}
