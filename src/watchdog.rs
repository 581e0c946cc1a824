//! Process heartbeat over the IPC pipe.
//!
//! Every worker updates its key in the `watchdog` document at a cadence of
//! ten seconds or better. The supervisor alerts when a worker goes stale and
//! re-alerts while it stays that way; a worker that observes a stale `main`
//! key shuts itself down.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use eyre::{eyre, Result};

use crate::config::WatchdogConfig;
use crate::ipc::JsonIpc;

const DOC: &str = "watchdog";

/// `{process: [last_update_unix, died_unix, alive]}`
type Heartbeats = BTreeMap<String, (i64, i64, bool)>;

#[derive(Clone)]
pub struct Watchdog {
    ipc: JsonIpc,
    stale_secs: u64,
    repeat_secs: u64,
    /// Workers the supervisor looks after.
    children: Vec<String>,
}

impl Watchdog {
    pub fn new(ipc: JsonIpc, config: &WatchdogConfig, children: Vec<String>) -> Self {
        Watchdog {
            ipc,
            stale_secs: config.stale_secs,
            repeat_secs: config.repeat_secs,
            children,
        }
    }

    /// Reset the heartbeat file for a fresh session.
    pub async fn scrub(&self) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut beats = Heartbeats::new();
        beats.insert("main".to_string(), (now, now, true));
        for child in &self.children {
            beats.insert(child.clone(), (now, now, true));
        }
        self.ipc.write(DOC, &beats).await?;
        Ok(())
    }

    /// Record a worker heartbeat. Fails when `main` itself has gone stale,
    /// telling the worker to shut down.
    pub async fn beat(&self, process: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut beats: Heartbeats = self.ipc.read(DOC).await?.unwrap_or_default();
        if let Some(&(main_last, _, _)) = beats.get("main") {
            let stale = now - main_last;
            if stale > self.stale_secs as i64 {
                tracing::warn!(process, stale, "gateway main is stale, shutting down worker");
                return Err(eyre!("gateway main stale by {stale} seconds"));
            }
        }
        beats.insert(process.to_string(), (now, now, true));
        self.ipc.write(DOC, &beats).await?;
        Ok(())
    }

    /// One supervisor pass: refresh `main`, alert on stale children. An
    /// alert flips the child's alive flag so it is not repeated until
    /// `repeat_secs` have passed.
    pub async fn supervise(&self) -> Result<()> {
        let now = Utc::now().timestamp();
        let mut beats: Heartbeats = self.ipc.read(DOC).await?.unwrap_or_default();
        beats.insert("main".to_string(), (now, now, true));
        for child in &self.children {
            let Some(&(last, died, alive)) = beats.get(child) else {
                continue;
            };
            let stale = now - last;
            if stale > self.stale_secs as i64 && (alive || stale > self.repeat_secs as i64) {
                tracing::warn!(
                    process = child.as_str(),
                    stale,
                    dead_for = now - died,
                    "watchdog detects stale gateway worker"
                );
                beats.insert(child.clone(), (now, died, false));
            }
        }
        self.ipc.write(DOC, &beats).await?;
        Ok(())
    }

    /// Sleep in heartbeat-sized chunks so the worker's key never goes stale
    /// while it waits out a long cadence.
    pub async fn sleep(&self, process: &str, pause: Duration) -> Result<()> {
        let mut remaining = pause;
        loop {
            let chunk = remaining.min(Duration::from_secs(10));
            tokio::time::sleep(chunk).await;
            self.beat(process).await?;
            remaining = remaining.saturating_sub(chunk);
            if remaining.is_zero() {
                return Ok(());
            }
        }
    }
}
