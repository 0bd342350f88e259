//! db-relay - batch push and apply node
//!
//! This is the composition root that wires together all the components.

use db_relay::adapters::inbound::{PushServer, PushState};
use db_relay::adapters::outbound::{
    DashMapParameterStore, HttpTransportConfig, HttpTransportManager, MemoryNodeRepository,
    SqliteBatchStore, SqliteClusterService, SqliteTargetDatabase,
};
use db_relay::application::{DataLoaderService, PushService, RouterService};
use db_relay::config::load_config;
use db_relay::domain::entities::{Conflict, Node, NodeChannel};
use db_relay::domain::services::WriterSettings;
use db_relay::domain::value_objects::NodeId;
use db_relay::infrastructure::{shutdown_signal, JobConfig, JobRunner, ShutdownController};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting db-relay node={} group={} listen={}",
        cfg.node_id,
        cfg.node_group_id,
        cfg.listen_addr
    );

    // ===== COMPOSITION ROOT =====
    // Wire up all adapters and services

    // 1. Create outbound adapters

    // Parameters (DashMap, seeded from config, env fallback)
    let parameters = Arc::new(
        DashMapParameterStore::new(Duration::from_millis(cfg.parameter_cache_timeout_ms))
            .with_values(cfg.parameters()),
    );

    // Batch and change log storage (SQLite)
    let store = Arc::new(SqliteBatchStore::new(cfg.runtime_db_path.clone()));
    store.init_db()?;

    // Cluster lock (SQLite, same runtime database)
    let server_id = format!("{}-{}", cfg.node_id, std::process::id());
    let cluster = Arc::new(SqliteClusterService::new(
        cfg.runtime_db_path.clone(),
        server_id,
        parameters.clone(),
    ));
    cluster.init_db()?;

    // Node topology (in memory, from config)
    let identity = Node::new(cfg.node_id.clone(), cfg.node_group_id.clone())
        .with_sync_url(cfg.sync_url.clone());
    let nodes = Arc::new(MemoryNodeRepository::new(identity));
    for push_node in &cfg.push_nodes {
        let target = push_node.to_node(&cfg.push_node_group_id);
        for channel in &cfg.channels {
            nodes.set_channel(NodeChannel::new(
                target.node_id.clone(),
                channel.channel_id.clone(),
                channel.processing_order,
            ));
        }
        tracing::info!("push target {} at {}", target.node_id, target.sync_url);
        nodes.add_push_target(target);
    }

    // Push transport (reqwest)
    let transports = Arc::new(HttpTransportManager::new(HttpTransportConfig::default())?);

    // 2. Create application services
    let router = Arc::new(RouterService::new(
        nodes.clone(),
        store.clone(),
        store.clone(),
    ));
    let push = Arc::new(PushService::new(
        nodes,
        store.clone(),
        store.clone(),
        cluster,
        transports,
    ));

    let settings = WriterSettings {
        max_rows_before_commit: cfg.max_rows_before_commit,
        commit_sleep: Duration::from_millis(cfg.commit_sleep_ms),
        default_conflict: Conflict::new("default", cfg.detect_conflict, cfg.resolve_conflict),
        ignore_missing_tables: cfg.ignore_missing_tables,
        apply_changes_only: cfg.apply_changes_only,
        ..WriterSettings::default()
    };
    let target = SqliteTargetDatabase::open(&cfg.target_db_path)?;
    let loader = Arc::new(DataLoaderService::new(
        NodeId::new(cfg.node_id.clone()),
        Box::new(target),
        store,
        Arc::new(settings),
    ));

    // 3. Start inbound adapter and jobs
    let shutdown = ShutdownController::new();

    let server = PushServer::new(
        cfg.listen_addr.clone(),
        PushState::new(cfg.node_id.clone(), loader),
    );
    let mut server_shutdown = shutdown.subscribe();
    let server_handle = tokio::spawn(async move {
        let stopped = async move {
            let _ = server_shutdown.recv().await;
        };
        if let Err(e) = server.run(stopped).await {
            tracing::error!("push receiver failed: {:?}", e);
        }
    });

    let push_job = JobRunner::new(
        JobConfig::new("push", Duration::from_secs(cfg.push_interval_secs)),
        shutdown.clone(),
    );
    let push_handle = push_job.start(move || {
        let router = router.clone();
        let push = push.clone();
        async move {
            if let Err(e) = router.route(chrono::Utc::now()) {
                tracing::error!("routing failed: {:?}", e);
            }
            let cycle = push.push_data().await;
            if cycle.had_useful_work() {
                tracing::info!("push cycle pushed to {} node(s)", cycle.outcomes.len());
            }
        }
    });

    // 4. Wait for a signal, then drain
    shutdown_signal(shutdown.clone()).await;
    if !shutdown.wait_for_drain(DRAIN_TIMEOUT).await {
        tracing::warn!("jobs still running after {:?}", DRAIN_TIMEOUT);
    }
    let _ = push_handle.await;
    let _ = server_handle.await;

    tracing::info!("db-relay stopped");
    Ok(())
}
