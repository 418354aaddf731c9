//! Console input producer.
//!
//! A dedicated thread reads stdin line by line and forwards each line on a
//! bounded channel. The interactive resolver is the only consumer; when
//! stdin closes the sender is dropped and the resolver sees a closed channel.

use std::io::{self, BufRead};
use std::thread;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const INPUT_CHANNEL_CAPACITY: usize = 16;

/// Spawn the stdin reader and return the receiving end.
pub fn spawn_stdin_reader() -> Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
    thread::Builder::new()
        .name("mend-stdin".to_string())
        .spawn(move || forward_lines(io::stdin().lock(), &tx))
        .context("spawn stdin reader thread")?;
    Ok(rx)
}

fn forward_lines<R: BufRead>(reader: R, tx: &mpsc::Sender<String>) {
    for line in reader.lines() {
        match line {
            Ok(line) => {
                if tx.blocking_send(line).is_err() {
                    debug!("input consumer gone, stopping stdin reader");
                    return;
                }
            }
            Err(e) => {
                warn!(err = %e, "failed to read stdin");
                return;
            }
        }
    }
    debug!("stdin closed");
}
