// ===============================
// src/recorder.rs
// ===============================
//
// Best-effort JSONL event log. One serde_json line per Event, appended to
// RECORD_FILE (see main.rs). Flushes on an interval and after a burst of
// events; a failed write reopens the file once and retries the whole line.
//
use std::path::Path;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::Event;

const FLUSH_EVERY_N_EVENTS: u32 = 1000;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

async fn open_writer(path: &str) -> BufWriter<tokio::fs::File> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = fs::create_dir_all(parent).await {
                error!(?e, %path, "recorder: create_dir_all failed");
            }
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .unwrap_or_else(|e| panic!("recorder: open {} failed: {}", path, e));

    BufWriter::new(file)
}

pub async fn run(mut rx: mpsc::Receiver<Event>, path: String) {
    info!(%path, "recorder: started");
    let mut writer = open_writer(&path).await;

    let mut tick = interval(FLUSH_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut pending: u32 = 0;

    loop {
        tokio::select! {
            maybe_ev = rx.recv() => {
                let Some(ev) = maybe_ev else {
                    let _ = writer.flush().await;
                    info!("recorder: channel closed, stopped");
                    break;
                };
                let mut line = match serde_json::to_string(&ev) {
                    Ok(s) => s,
                    Err(e) => {
                        error!(?e, "recorder: serialize error, skip event");
                        continue;
                    }
                };
                line.push('\n');

                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    error!(?e, "recorder: write failed, reopening");
                    writer = open_writer(&path).await;
                    if let Err(e2) = writer.write_all(line.as_bytes()).await {
                        error!(?e2, "recorder: write failed after reopen, drop event");
                        continue;
                    }
                }

                pending += 1;
                if pending >= FLUSH_EVERY_N_EVENTS {
                    let _ = writer.flush().await;
                    pending = 0;
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                pending = 0;
            }
        }
    }
}
