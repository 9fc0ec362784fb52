// ===============================
// src/main.rs
// ===============================
/*
 # live config
 curl -s localhost:9898/metrics | grep '^config_store_mode'

 # traffic
 curl -s localhost:9898/metrics | grep '^messages_total'
 curl -s localhost:9898/metrics | grep '^commands_total'
*/
mod config;
mod domain;
mod handler;
mod inventory;
mod ledger;
mod metrics;
mod normalize;
mod parser;
mod recorder;
mod session;
mod store;
mod transport;

use std::sync::Arc;

use ahash::AHashMap as HashMap;
use tokio::{
    select,
    sync::{mpsc, Mutex},
    time::Duration,
};
use tracing::info;

use crate::domain::{Event, Inbound, Outbound};
use crate::store::{HttpStore, MemStore, Store};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt().with_env_filter("info").init();

    // ---- Load config ----
    let cfg = Arc::new(config::load());

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(cfg.metrics_port));

    info!(
        store_mode = %cfg.store_mode.as_str(),
        store_base = %cfg.store_base_url,
        metrics_port = cfg.metrics_port,
        smart_parse_default = cfg.smart_parse_default,
        reset_enabled = cfg.reset_pass_sha256.is_some(),
        "startup config"
    );
    metrics::CONFIG_STORE_MODE
        .with_label_values(&[cfg.store_mode.as_str()])
        .set(1);

    // ---- Store ----
    let store: Arc<dyn Store> = match cfg.store_mode {
        config::StoreMode::Mock => Arc::new(MemStore::new()),
        config::StoreMode::Http => Arc::new(HttpStore::new(
            cfg.store_base_url.clone(),
            cfg.store_api_key.clone(),
            cfg.store_timeout_ms,
        )),
    };

    // ---- Buses ----
    let (in_tx, mut in_rx) = mpsc::channel::<Inbound>(2048);
    let (out_tx, out_rx) = mpsc::channel::<Outbound>(2048);

    // ---- Recorder (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
    if let Some(path) = cfg.record_file.clone() {
        tokio::spawn(recorder::run(rec_rx, path));
    }

    let ctx = Arc::new(handler::Ctx {
        cfg: cfg.clone(),
        store,
        out_tx,
        rec_tx,
        write_lock: Mutex::new(()),
    });

    // ---- Transport ----
    tokio::spawn(transport::run_stdin(in_tx, cfg.stdin_chat_id));
    tokio::spawn(transport::run_printer(out_rx));

    // ---- Dispatcher: one worker per chat, messages stay ordered per chat ----
    let mut chat_txs: HashMap<i64, mpsc::Sender<Inbound>> = HashMap::new();
    let mut msg_count: u64 = 0;

    loop {
        select! {
            maybe_msg = in_rx.recv() => {
                let Some(msg) = maybe_msg else { break };
                msg_count += 1;
                let tx = chat_txs.entry(msg.chat_id).or_insert_with(|| {
                    let (tx, rx) = mpsc::channel::<Inbound>(256);
                    info!(chat = msg.chat_id, "spawning chat worker");
                    tokio::spawn(handler::run_chat(ctx.clone(), msg.chat_id, rx));
                    tx
                });
                let _ = tx.send(msg).await;
            },
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if msg_count > 0 {
                    info!(messages = msg_count, chats = chat_txs.len(), "heartbeat");
                    msg_count = 0;
                }
            }
        }
    }
    info!("inbound channel closed, shutting down");
}
