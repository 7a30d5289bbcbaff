use anyhow::Result;
use bytes::Bytes;
use http_body_util::Full;
use std::convert::Infallible;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming as IncomingBody, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;

pub mod auth;
pub mod config;
pub mod context;
pub mod crypto;
pub mod db;
pub mod error;
pub mod gateway;
pub mod health;
pub mod kv;
pub mod message;
pub mod metrics;
pub mod moderation;
pub mod presence;
pub mod rate_limit;
pub mod rooms;
pub mod store;
pub mod utils;

use auth::AuthManager;
use config::{Config, MAX_WEBSOCKET_MESSAGE_SIZE};
use context::AppContext;
use crypto::MessageCipher;
use db::DbPool;
use gateway::handle_socket;
use kv::KvClient;
use moderation::ModerationPipeline;
use presence::PresenceRegistry;
use rate_limit::RateLimiter;
use rooms::RoomDirectory;
use store::{MessageStore, RecentCache, SearchIndexer};

type HttpResult = Result<Response<Full<Bytes>>, Infallible>;

async fn http_handler(req: Request<IncomingBody>, db_pool: DbPool, kv: KvClient) -> HttpResult {
    let response = match req.uri().path() {
        "/health" => match health::health_check(&db_pool, &kv).await {
            Ok(_) => Response::new(Full::new(Bytes::from("OK"))),
            Err(e) => {
                tracing::error!("Health check failed: {}", e);
                let mut res = Response::new(Full::new(Bytes::from("Service Unavailable")));
                *res.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                res
            }
        },
        "/metrics" => match metrics::gather_metrics() {
            Ok(metrics_data) => {
                let mut res = Response::new(Full::new(Bytes::from(metrics_data)));
                res.headers_mut()
                    .insert("Content-Type", "text/plain; version=0.0.4".parse().unwrap());
                res
            }
            Err(e) => {
                tracing::error!("Failed to gather metrics: {}", e);
                let mut res = Response::new(Full::new(Bytes::from("Internal Server Error")));
                *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                res
            }
        },
        _ => {
            let mut not_found = Response::new(Full::new(Bytes::from("Not Found")));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            not_found
        }
    };
    Ok(response)
}

pub async fn run_http_server(health_port: u16, db_pool: DbPool, kv: KvClient) -> Result<()> {
    let http_addr = format!("0.0.0.0:{}", health_port);
    let listener = TcpListener::bind(&http_addr).await?;
    tracing::info!("HTTP server listening on http://{}", http_addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        let db_pool_clone = db_pool.clone();
        let kv_clone = kv.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                http_handler(req, db_pool_clone.clone(), kv_clone.clone())
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Error serving HTTP connection: {:?}", err);
            }
        });
    }
}

pub async fn run_websocket_server(app_context: AppContext, listener: TcpListener) {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(MAX_WEBSOCKET_MESSAGE_SIZE);
    ws_config.max_frame_size = Some(MAX_WEBSOCKET_MESSAGE_SIZE);

    loop {
        let (socket, addr) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to accept socket: {}", e);
                continue;
            }
        };

        let ctx = app_context.clone();

        tokio::spawn(async move {
            match accept_async_with_config(socket, Some(ws_config)).await {
                Ok(ws_stream) => {
                    let span = tracing::info_span!("connection", addr = %addr);
                    handle_socket(ws_stream, addr, ctx).instrument(span).await;
                }
                Err(e) => {
                    tracing::debug!("WebSocket upgrade failed for {}: {}", addr, e);
                }
            }
        });
    }
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    let app_config = Arc::new(config);

    let bind_address = format!("0.0.0.0:{}", app_config.port);

    // Connect to database and bring the schema up to date
    let db_pool = db::create_pool(&app_config.database_url, &app_config.db).await?;
    tracing::info!("Connected to database");

    // Connect to Redis; mask credentials in the startup log
    let redis_url_safe = if let Some(at_pos) = app_config.redis_url.find('@') {
        let protocol_end = app_config.redis_url.find("://").map(|p| p + 3).unwrap_or(0);
        format!(
            "{}***{}",
            &app_config.redis_url[..protocol_end],
            &app_config.redis_url[at_pos..]
        )
    } else {
        app_config.redis_url.clone()
    };
    tracing::info!("Connecting to Redis at: {}", redis_url_safe);

    let kv = KvClient::connect(&app_config.redis_url).await?;
    tracing::info!("Connected to Redis");

    // Shared services
    let auth_manager = Arc::new(AuthManager::new(
        &app_config.jwt_secret,
        app_config.jwt_issuer.clone(),
    ));
    let cipher = Arc::new(MessageCipher::from_config(
        app_config.message_key.as_deref(),
    )?);
    let moderation = Arc::new(ModerationPipeline::new(&app_config.moderation));
    let rate_limiter = Arc::new(RateLimiter::new(kv.clone(), app_config.limits.clone()));
    let rooms = RoomDirectory::new(db_pool.clone());
    let recent_cache = RecentCache::new(kv.clone(), &app_config.cache);
    let indexer = Arc::new(SearchIndexer::new(&app_config.search));
    let store = MessageStore::new(db_pool.clone(), recent_cache, indexer);
    let presence = Arc::new(PresenceRegistry::new());

    // WebSocket listener
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!("Roomcast engine listening on {} (WebSocket)", bind_address);

    let app_context = AppContext {
        db_pool: db_pool.clone(),
        kv: kv.clone(),
        auth_manager,
        cipher,
        moderation,
        rate_limiter,
        rooms,
        store,
        presence,
        config: app_config.clone(),
    };

    let websocket_server = run_websocket_server(app_context, listener);
    let http_server = run_http_server(app_config.health_port, db_pool.clone(), kv.clone());

    tokio::select! {
        _ = websocket_server => {
            tracing::info!("WebSocket server shut down.");
        },
        res = http_server => {
            if let Err(e) = res {
                tracing::error!("HTTP server failed: {}", e);
            }
        },
        _ = signal::ctrl_c() => {
            tracing::info!("Shutdown signal received. Shutting down...");
        }
    }

    Ok(())
}
