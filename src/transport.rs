// ===============================
// src/transport.rs
// ===============================
//
// Line-oriented local transport. Each stdin line becomes one inbound
// message for the configured chat id; replies are printed to stdout with
// keyboard options rendered as bracketed rows. A line of the form
// `@<id> <text>` overrides the chat id, which is how multi-chat dispatch
// is exercised without a messenger connection.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use crate::domain::{Inbound, Outbound};

fn split_chat_override(line: &str, default_chat: i64) -> (i64, &str) {
    if let Some(rest) = line.strip_prefix('@') {
        if let Some((id, text)) = rest.split_once(' ') {
            if let Ok(chat_id) = id.parse::<i64>() {
                return (chat_id, text);
            }
        }
    }
    (default_chat, line)
}

pub async fn run_stdin(in_tx: mpsc::Sender<Inbound>, default_chat: i64) {
    let user = std::env::var("USER").unwrap_or_else(|_| "local".to_string());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!(chat = default_chat, "stdin transport started");

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (chat_id, text) = split_chat_override(line, default_chat);
        let msg = Inbound { chat_id, user: user.clone(), text: text.to_string() };
        if in_tx.send(msg).await.is_err() {
            break;
        }
    }
    info!("stdin transport stopped");
}

pub async fn run_printer(mut out_rx: mpsc::Receiver<Outbound>) {
    while let Some(out) = out_rx.recv().await {
        println!("[{}] {}", out.chat_id, out.text);
        if let Some(kb) = out.keyboard {
            for row in kb {
                println!("[{}]   ( {} )", out.chat_id, row.join(" | "));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_override_prefix() {
        assert_eq!(split_chat_override("@7 mua 3ss 50k", 1), (7, "mua 3ss 50k"));
        assert_eq!(split_chat_override("mua 3ss 50k", 1), (1, "mua 3ss 50k"));
        // malformed override falls through as plain text
        assert_eq!(split_chat_override("@x hello", 1), (1, "@x hello"));
    }
}
