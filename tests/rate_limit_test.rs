// ============================================================================
// Rate Limiter Integration Tests
// ============================================================================
//
// These tests require a Redis instance (local or test container).
//
// Run with: cargo test --test rate_limit_test -- --ignored
// (Tests are marked with #[ignore] to skip unless Redis is available)
//
// ============================================================================

use roomcast::config::LimitsConfig;
use roomcast::error::ChatError;
use roomcast::kv::KvClient;
use roomcast::rate_limit::{ActionClass, RateLimiter};
use serial_test::serial;
use std::env;
use uuid::Uuid;

async fn test_limiter(messages: u32, actions: u32) -> RateLimiter {
    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let kv = KvClient::connect(&redis_url)
        .await
        .expect("Failed to connect to Redis for tests");

    RateLimiter::new(
        kv,
        LimitsConfig {
            messages_per_window: messages,
            actions_per_window: actions,
            window_secs: 60,
        },
    )
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis - run with: cargo test --test rate_limit_test -- --ignored
async fn test_allows_up_to_ceiling_then_rejects() {
    let limiter = test_limiter(3, 2).await;
    // Fresh user per run, so stale counters from earlier runs cannot leak in
    let user = Uuid::new_v4();

    for _ in 0..3 {
        limiter
            .check_and_consume(&user, ActionClass::Message)
            .await
            .expect("Send within the ceiling should pass");
    }

    let err = limiter
        .check_and_consume(&user, ActionClass::Message)
        .await
        .expect_err("Fourth send should be rejected");

    match err {
        ChatError::RateLimited { retry_after_secs } => {
            assert!(
                retry_after_secs > 0 && retry_after_secs <= 60,
                "Retry hint should reflect the remaining window, got {}",
                retry_after_secs
            );
        }
        other => panic!("Expected RateLimited, got {:?}", other),
    }
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn test_action_classes_are_counted_separately() {
    let limiter = test_limiter(3, 1).await;
    let user = Uuid::new_v4();

    limiter
        .check_and_consume(&user, ActionClass::Reaction)
        .await
        .expect("First reaction should pass");
    limiter
        .check_and_consume(&user, ActionClass::Reaction)
        .await
        .expect_err("Second reaction should hit the action ceiling");

    // The message window is untouched by reaction traffic
    limiter
        .check_and_consume(&user, ActionClass::Message)
        .await
        .expect("Message send should still pass");

    // Membership shares the action ceiling but not the reaction counter
    limiter
        .check_and_consume(&user, ActionClass::Membership)
        .await
        .expect("Join should still pass");
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn test_users_do_not_share_windows() {
    let limiter = test_limiter(1, 1).await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    limiter
        .check_and_consume(&alice, ActionClass::Message)
        .await
        .expect("Alice's first send should pass");
    limiter
        .check_and_consume(&alice, ActionClass::Message)
        .await
        .expect_err("Alice's second send should be rejected");

    limiter
        .check_and_consume(&bob, ActionClass::Message)
        .await
        .expect("Bob's window is independent of Alice's");
}

#[tokio::test]
#[serial]
#[ignore] // Requires Redis
async fn test_rejection_survives_repeated_attempts() {
    let limiter = test_limiter(1, 1).await;
    let user = Uuid::new_v4();

    limiter
        .check_and_consume(&user, ActionClass::Message)
        .await
        .expect("First send should pass");

    // Hammering the limiter must not reopen the window early
    for _ in 0..5 {
        let err = limiter
            .check_and_consume(&user, ActionClass::Message)
            .await
            .expect_err("Rejection should hold for the whole window");
        assert!(matches!(err, ChatError::RateLimited { .. }));
    }
}
