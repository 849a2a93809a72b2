use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Sender};
use serde_json::json;
use tracing::{debug, warn};

use crate::invariants::types::ViolationResult;

const HISTORY_CAP: usize = 10_000;
const HISTORY_COMPACT: usize = 5_000;

#[derive(Clone, Debug)]
pub struct AlertRecord {
    pub project_id: String,
    pub invariant_id: String,
    pub block_number: u64,
    pub sent: bool,
}

/// Dispatches violation webhooks with a per-(project, invariant) dedup
/// window. Transport is asynchronous: payloads go over a channel to a
/// background poster and are never retried inline.
pub struct AlertManager {
    webhook_url: Option<String>,
    dedup_window: Duration,
    last_sent: HashMap<(String, String), Instant>,
    history: VecDeque<AlertRecord>,
    outbox: Option<Sender<serde_json::Value>>,
}

impl AlertManager {
    pub fn new(webhook_url: Option<String>, dedup_window: Duration) -> Self {
        let outbox = webhook_url.as_ref().map(|url| {
            let url = url.clone();
            let (tx, rx) = bounded::<serde_json::Value>(256);
            std::thread::spawn(move || {
                let client = reqwest::blocking::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()
                    .expect("build client failed");
                for payload in rx {
                    match client.post(&url).json(&payload).send() {
                        Ok(resp) if resp.status().is_success() => {}
                        Ok(resp) => warn!(status = %resp.status(), "webhook rejected alert"),
                        Err(e) => warn!(error = %e, "webhook post failed"),
                    }
                }
            });
            tx
        });
        Self {
            webhook_url,
            dedup_window,
            last_sent: HashMap::new(),
            history: VecDeque::new(),
            outbox,
        }
    }

    /// Whether a `(project, invariant)` pair may fire right now; updates
    /// the dedup clock when it may.
    pub fn should_send(&mut self, project_id: &str, invariant_id: &str) -> bool {
        let key = (project_id.to_string(), invariant_id.to_string());
        let now = Instant::now();
        if let Some(last) = self.last_sent.get(&key) {
            if now.duration_since(*last) < self.dedup_window {
                return false;
            }
        }
        self.last_sent.insert(key, now);
        true
    }

    pub fn dispatch(&mut self, violation: &ViolationResult) {
        let allowed = self.should_send(&violation.project_id, &violation.invariant_id);
        self.record(AlertRecord {
            project_id: violation.project_id.clone(),
            invariant_id: violation.invariant_id.clone(),
            block_number: violation.block_number,
            sent: allowed,
        });
        if !allowed {
            debug!(
                project = %violation.project_id,
                invariant = %violation.invariant_id,
                "alert suppressed by dedup window"
            );
            return;
        }
        if self.webhook_url.is_none() {
            return;
        }
        let payload = json!({
            "type": "INVARIANT_VIOLATION",
            "severity": "CRITICAL",
            "timestamp": SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            "project": violation.project_id,
            "invariant": violation.invariant_id,
            "block": violation.block_number,
            "transaction": violation.tx_hash,
            "details": {
                "name": violation.invariant_name,
                "message": violation.message,
                "extra": violation.details,
            },
        });
        if let Some(outbox) = &self.outbox {
            if outbox.try_send(payload).is_err() {
                warn!("alert outbox full, dropping webhook");
            }
        }
    }

    fn record(&mut self, record: AlertRecord) {
        self.history.push_back(record);
        if self.history.len() > HISTORY_CAP {
            while self.history.len() > HISTORY_COMPACT {
                self.history.pop_front();
            }
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_window_allows_one_per_pair() {
        let mut alerts = AlertManager::new(None, Duration::from_secs(300));
        assert!(alerts.should_send("p1", "inv1"));
        // 30 seconds later (same window) would be suppressed
        assert!(!alerts.should_send("p1", "inv1"));
        // a different pair is unaffected
        assert!(alerts.should_send("p1", "inv2"));
        assert!(alerts.should_send("p2", "inv1"));
    }

    #[test]
    fn window_expiry_reopens_the_pair() {
        let mut alerts = AlertManager::new(None, Duration::from_millis(10));
        assert!(alerts.should_send("p1", "inv1"));
        assert!(!alerts.should_send("p1", "inv1"));
        std::thread::sleep(Duration::from_millis(15));
        assert!(alerts.should_send("p1", "inv1"));
    }

    #[test]
    fn history_compacts_on_overflow() {
        let mut alerts = AlertManager::new(None, Duration::from_secs(0));
        for i in 0..(HISTORY_CAP + 1) {
            alerts.record(AlertRecord {
                project_id: "p".into(),
                invariant_id: format!("i{}", i),
                block_number: i as u64,
                sent: true,
            });
        }
        assert_eq!(alerts.history_len(), HISTORY_COMPACT);
    }
}
