use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dogeindex::chain::{Blockchain, CoreRpcClient};
use dogeindex::config::Config;
use dogeindex::indexer::Indexer;
use dogeindex::mempool::MempoolTracker;
use dogeindex::spv::{SpvConfig, SpvSession};
use dogeindex::state::AppState;
use dogeindex::store::{PgStore, Store};
use dogeindex::tip::{TipChaser, ZmqTipSource};
use dogeindex::walker::{resolve_start_block, BlockWalker};
use dogeindex::api;

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    info!("starting dogeindex");

    // The database is load-bearing; failing to reach it is fatal.
    let store: Arc<dyn Store> = match PgStore::connect(&config.database_url()).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(%err, "failed to connect to database");
            std::process::exit(1);
        }
    };

    let cursor = match store.cursor().await {
        Ok(cursor) => cursor,
        Err(err) => {
            error!(%err, "failed to read block cursor");
            std::process::exit(1);
        }
    };
    let cursor_hash = cursor.as_ref().map(|c| c.hash.clone());

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    // Chain source: the SPV peer session when configured, the Core RPC
    // client otherwise. Both serve the same contract, so everything
    // downstream is wired identically.
    let chain: Arc<dyn Blockchain> = if let Some(peer) = config.spv_peer.clone() {
        info!(%peer, "using the SPV peer session as the chain source");
        let spv_config = match cursor.as_ref() {
            Some(cursor) => SpvConfig {
                peers: vec![peer],
                start_height: cursor.height,
                start_hash: cursor.hash.clone(),
            },
            None => SpvConfig::from_genesis(vec![peer]),
        };
        let spv = Arc::new(SpvSession::new(spv_config));
        tasks.push(tokio::spawn(spv.clone().run(cancel.clone())));

        // The walker needs at least one validated headers batch to resume.
        let mut waited = 0u32;
        while spv.synced_height().is_none() {
            if waited >= 120 {
                error!("SPV peer never delivered headers");
                std::process::exit(1);
            }
            if waited % 10 == 0 {
                info!("waiting for SPV header sync");
            }
            waited += 1;
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
        spv
    } else {
        info!(
            host = %config.rpc_host,
            port = config.rpc_port,
            "connecting to Dogecoin node"
        );
        Arc::new(CoreRpcClient::new(
            &config.rpc_host,
            config.rpc_port,
            &config.rpc_user,
            &config.rpc_pass,
        ))
    };

    // Resolve where the walker resumes: flag, then cursor, then node tip.
    let resume_hash =
        match resolve_start_block(chain.as_ref(), config.start_block.as_deref(), cursor_hash)
            .await
        {
            Ok(hash) => hash,
            Err(err) => {
                error!(%err, "cannot reach the Dogecoin node");
                std::process::exit(1);
            }
        };

    // Mempool tracker.
    let mempool = Arc::new(MempoolTracker::new(chain.clone(), store.clone()));
    tasks.push(tokio::spawn(mempool.clone().run(cancel.clone())));

    // API server.
    let app_state = Arc::new(AppState {
        config: config.clone(),
        store: store.clone(),
        mempool: mempool.clone(),
    });
    let router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", config.api_port);
    let api_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        info!(addr = %api_addr, "starting API server");
        let listener = match tokio::net::TcpListener::bind(&api_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(%err, "failed to bind API port");
                api_cancel.cancel();
                return;
            }
        };
        let shutdown = api_cancel.clone();
        if let Err(err) = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
        {
            error!(%err, "API server error");
        }
    }));

    // Tip chaser: ZMQ push with polling fallback.
    let (zmq_host, zmq_port) = config.zmq_endpoint();
    let tip_source = Box::new(ZmqTipSource::new(&zmq_host, zmq_port));
    let (chaser, tip_rx) = TipChaser::new(tip_source, chain.clone());
    tasks.push(tokio::spawn(chaser.run(cancel.clone())));

    // Walker and indexer: the serial block-ingest pipeline.
    let (walker, events) = match BlockWalker::new(chain.clone(), resume_hash).await {
        Ok(pair) => pair,
        Err(err) => {
            error!(%err, "walker startup failed");
            std::process::exit(1);
        }
    };
    tasks.push(tokio::spawn(walker.run(tip_rx, cancel.clone())));
    let indexer = Indexer::new(chain.clone(), store.clone());
    tasks.push(tokio::spawn(indexer.run(events, cancel.clone())));

    shutdown_signal().await;
    cancel.cancel();

    for task in tasks {
        let _ = task.await;
    }
    info!("dogeindex stopped");
}
