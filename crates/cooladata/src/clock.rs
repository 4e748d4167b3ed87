//! Event timestamps, optionally aligned to the server clock.

use crate::transport::Transport;
use crate::types::{now_ms, CalibrationResponse};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Source of event timestamps.
///
/// Uses the local wall clock until a server calibration is applied, then
/// shifts every reading by the server/local difference seen at that time.
#[derive(Debug)]
pub(crate) struct Clock {
    started: Instant,
    offset_ms: AtomicI64,
    calibrated: AtomicBool,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
            offset_ms: AtomicI64::new(0),
            calibrated: AtomicBool::new(false),
        }
    }

    /// Align to a server timestamp taken "now".
    pub(crate) fn calibrate(&self, server_ms: i64) {
        self.offset_ms.store(server_ms - now_ms(), Ordering::SeqCst);
        self.calibrated.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_calibrated(&self) -> bool {
        self.calibrated.load(Ordering::SeqCst)
    }

    /// Milliseconds since epoch.
    pub(crate) fn now_ms(&self) -> i64 {
        if self.is_calibrated() {
            now_ms() + self.offset_ms.load(Ordering::SeqCst)
        } else {
            now_ms()
        }
    }

    /// Milliseconds since the tracker was built.
    pub(crate) fn time_in_app_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Ask the server for its clock. Any failure yields `None`.
pub(crate) async fn fetch_calibration(
    transport: &dyn Transport,
    api_token: &str,
    timeout: Duration,
) -> Option<i64> {
    let path = format!("egw/2/{api_token}/config");
    let response = match tokio::time::timeout(timeout, transport.send(&path, None)).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            debug!(error = %e, "calibration fetch failed");
            return None;
        }
        Err(_) => {
            debug!("calibration fetch timed out");
            return None;
        }
    };

    match serde_json::from_str::<CalibrationResponse>(&response) {
        Ok(parsed) => parsed.timestamp_millis(),
        Err(e) => {
            debug!(error = %e, "calibration response was not understood");
            None
        }
    }
}
