use anyhow::Result;

use crate::db::DbPool;
use crate::kv::KvClient;

/// Liveness of both backing stores. Either failing marks the process
/// unhealthy.
pub async fn health_check(pool: &DbPool, kv: &KvClient) -> Result<()> {
    // Check database
    sqlx::query("SELECT 1").execute(pool).await?;

    // Check Redis
    kv.clone().ping().await?;

    Ok(())
}
