use axum::Router;
use dealflow_scheduler::{Dispatcher, JobQueue, Worker};
use dealflow_server::{
    config::ServerConfig,
    crm::CrmStore,
    db::{PgCrm, PgExecutionLog, PgJobQueue, PgWorkflowRepository},
    routes,
    state::AppState,
};
use dealflow_workflow::nats::NatsEventStream;
use dealflow_workflow::{
    CrmGateway, EventSink, ExecutionEngine, ExecutionLog, MirroredLog, WorkflowRepository,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = ServerConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    // Create database connection pool
    let db_pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to database");

    // Run migrations
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .expect("failed to run migrations");

    let workflows: Arc<dyn WorkflowRepository> =
        Arc::new(PgWorkflowRepository::new(db_pool.clone()));
    let mut log: Arc<dyn ExecutionLog> = Arc::new(PgExecutionLog::new(db_pool.clone()));
    if let Some(nats) = config.nats {
        tracing::info!(url = %nats.url, "Mirroring execution events to NATS");
        let stream: Arc<dyn EventSink> = Arc::new(
            NatsEventStream::connect(nats)
                .await
                .expect("failed to connect to NATS"),
        );
        log = Arc::new(MirroredLog::new(log, stream));
    }

    let crm = Arc::new(PgCrm::new(db_pool.clone()));
    let gateway: Arc<dyn CrmGateway> = crm.clone();
    let store: Arc<dyn CrmStore> = crm;
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(db_pool));

    let engine = Arc::new(
        ExecutionEngine::new(log.clone(), gateway)
            .with_retry_policy(config.retry),
    );
    let dispatcher = Arc::new(Dispatcher::new(workflows, log, queue.clone()));

    // Spawn the execution worker
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let worker = Worker::new(engine, queue, config.worker);
    let worker_handle = tokio::spawn(async move {
        worker
            .run(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await;
    });

    let app: Router =
        routes::router(AppState::new(dispatcher, store)).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .expect("failed to bind to address");

    tracing::info!("listening on http://{}", config.listen_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let _ = shutdown_tx.send(true);
    if let Err(e) = worker_handle.await {
        tracing::error!(error = %e, "execution worker panicked");
    }
    tracing::info!("shutdown complete");
}

/// Waits for Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                tracing::info!("Received SIGTERM, shutting down");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
