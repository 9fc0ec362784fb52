// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Message flow --------
pub static MESSAGES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("messages_total", "inbound chat messages").unwrap());

pub static COMMANDS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("commands_total", "recognized commands (label: kind)"),
        &["kind"],
    )
    .unwrap()
});

pub static PARSE_FAIL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("parse_fail_total", "messages no recognizer consumed").unwrap()
});

// -------- Sessions --------
pub static SESSIONS_OPENED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("sessions_opened_total", "multi-step sessions opened").unwrap());

// -------- Store traffic --------
pub static STORE_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("store_calls_total", "store operations (label: op)"),
        &["op"],
    )
    .unwrap()
});

pub static STORE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("store_errors_total", "failed store operations (label: op)"),
        &["op"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_STORE_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_store_mode", "store mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(MESSAGES.clone())),
        REGISTRY.register(Box::new(COMMANDS.clone())),
        REGISTRY.register(Box::new(PARSE_FAIL.clone())),
        REGISTRY.register(Box::new(SESSIONS_OPENED.clone())),
        REGISTRY.register(Box::new(STORE_CALLS.clone())),
        REGISTRY.register(Box::new(STORE_ERRORS.clone())),
        REGISTRY.register(Box::new(CONFIG_STORE_MODE.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .unwrap_or_else(|e| panic!("metrics bind {} failed: {}", addr, e));
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}
