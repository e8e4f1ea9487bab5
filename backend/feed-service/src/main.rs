use actix_web::{dev::Service, web, App, HttpServer};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::info;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feed_service::cache::{DisabledCache, RedisFeedCache, TimelineCache};
use feed_service::clients::{HttpServiceClient, UpstreamClient};
use feed_service::config::{Config, DEFAULT_LOG_FILTER};
use feed_service::consumers::{FeedEventHandler, FeedEventsConsumer};
use feed_service::db::{self, FeedStore, PgFeedStore};
use feed_service::events::{FeedEventPublisher, KafkaFeedEventProducer, NoopEventPublisher};
use feed_service::handlers;
use feed_service::jobs::start_feed_trimmer;
use feed_service::metrics;
use feed_service::middleware::TokenVerifier;
use feed_service::services::FeedService;

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_line_number(true)
                .with_file(true)
                .with_target(true),
        )
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Configuration loading failed: {:#}", e);
            eprintln!("ERROR: Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting feed-service v{}", env!("CARGO_PKG_VERSION"));
    info!("Environment: {}", config.app.env);

    // Durable store
    let pool = match db::create_pool(&config.database.url, config.database.max_connections).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Database pool creation failed: {:#}", e);
            eprintln!("ERROR: Failed to create database pool: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = db::MIGRATOR.run(&pool).await {
        tracing::error!("Database migration failed: {:#}", e);
        eprintln!("ERROR: Failed to run migrations: {}", e);
        std::process::exit(1);
    }
    let store: Arc<dyn FeedStore> = Arc::new(PgFeedStore::new(pool));

    // Cache; the service runs without it if Redis is off or unreachable
    let cache: Arc<dyn TimelineCache> = if config.redis.enabled {
        match RedisFeedCache::new(&config.redis).await {
            Ok(cache) => {
                info!("Redis feed cache connected");
                Arc::new(cache)
            }
            Err(e) => {
                tracing::warn!("Redis unavailable, continuing without feed cache: {}", e);
                Arc::new(DisabledCache)
            }
        }
    } else {
        info!("Redis disabled, feed cache off");
        Arc::new(DisabledCache)
    };

    let upstream: Arc<dyn UpstreamClient> = match HttpServiceClient::new(&config.upstream) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::error!("HTTP client initialization failed: {}", e);
            eprintln!("ERROR: Failed to build upstream HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let publisher: Arc<dyn FeedEventPublisher> = if config.kafka.enabled {
        match KafkaFeedEventProducer::new(
            &config.kafka.bootstrap_servers,
            &config.kafka.feed_updated_topic,
        ) {
            Ok(producer) => Arc::new(producer),
            Err(e) => {
                tracing::warn!("Kafka producer unavailable, feed events disabled: {}", e);
                Arc::new(NoopEventPublisher)
            }
        }
    } else {
        Arc::new(NoopEventPublisher)
    };

    let feed_service = Arc::new(FeedService::new(
        store,
        cache,
        upstream.clone(),
        publisher,
        config.feed.clone(),
        config.redis.max_entries,
    ));

    let verifier = if config.auth.verify_remote {
        info!("Bearer tokens verified by auth-service");
        TokenVerifier::remote(upstream.clone())
    } else {
        match TokenVerifier::local(&config.auth.jwt_secret, &config.auth.jwt_algorithm) {
            Ok(verifier) => verifier,
            Err(e) => {
                tracing::error!("JWT verifier initialization failed: {}", e);
                eprintln!("ERROR: Failed to initialize JWT verification: {}", e);
                std::process::exit(1);
            }
        }
    };
    let verifier = Arc::new(verifier);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Event ingestion
    let consumer_handle = if config.kafka.enabled {
        let handler = FeedEventHandler::new(feed_service.clone(), config.auth.service_token.clone());
        if config.auth.service_token.is_none() {
            tracing::warn!("SERVICE_AUTH_TOKEN not set, post_created events will not be fanned out");
        }
        match FeedEventsConsumer::new(&config.kafka, handler, shutdown_rx.clone()) {
            Ok(consumer) => Some(tokio::spawn(async move {
                if let Err(e) = consumer.run().await {
                    tracing::error!("Feed events consumer exited with error: {:#}", e);
                }
            })),
            Err(e) => {
                tracing::error!("Failed to start feed events consumer: {:#}", e);
                None
            }
        }
    } else {
        info!("Kafka disabled, event ingestion off");
        None
    };

    let trimmer_handle = tokio::spawn(start_feed_trimmer(
        feed_service.clone(),
        Duration::from_secs(config.feed.trim_interval_secs.max(1)),
        shutdown_rx,
    ));

    let service_data = web::Data::from(feed_service);
    let debug_routes = config.app.debug;
    if debug_routes {
        tracing::warn!("Debug mode on, internal fan-out route mounted");
    }

    let bind_addr = format!("{}:{}", config.app.host, config.app.port);
    info!("HTTP server listening on {}", bind_addr);

    let server_result = HttpServer::new(move || {
        let verifier = verifier.clone();

        App::new()
            .app_data(service_data.clone())
            .wrap(TracingLogger::default())
            .wrap_fn(|req, srv| {
                let method = req.method().to_string();
                let path = req
                    .match_pattern()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| req.path().to_string());
                let start = Instant::now();

                let fut = srv.call(req);
                async move {
                    match fut.await {
                        Ok(res) => {
                            metrics::observe_http_request(
                                &method,
                                &path,
                                res.status().as_u16(),
                                start.elapsed(),
                            );
                            Ok(res)
                        }
                        Err(err) => {
                            metrics::observe_http_request(&method, &path, 500, start.elapsed());
                            Err(err)
                        }
                    }
                }
            })
            .configure(|cfg| handlers::configure(cfg, verifier, debug_routes))
    })
    .bind(bind_addr)?
    .run()
    .await;

    info!("HTTP server stopped, shutting down background tasks");
    let _ = shutdown_tx.send(true);
    if let Some(handle) = consumer_handle {
        let _ = handle.await;
    }
    let _ = trimmer_handle.await;

    server_result
}
