//! Process-wide counters for the modem link.
//! Plain atomics; read them with [`snapshot`].
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

static FRAMES_DECODED: AtomicU64 = AtomicU64::new(0);
static FRAMING_ERRORS: AtomicU64 = AtomicU64::new(0);
static PURE_NACKS: AtomicU64 = AtomicU64::new(0);
static WRITES: AtomicU64 = AtomicU64::new(0);
static ACKS: AtomicU64 = AtomicU64::new(0);
static NACKS: AtomicU64 = AtomicU64::new(0);
static TIMEOUTS: AtomicU64 = AtomicU64::new(0);
static RETRIES: AtomicU64 = AtomicU64::new(0);
static WRITE_FAILURES: AtomicU64 = AtomicU64::new(0);
static RECONNECTS: AtomicU64 = AtomicU64::new(0);
static DB_CYCLES: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn inc_frames_decoded() {
    FRAMES_DECODED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_framing_errors() {
    FRAMING_ERRORS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_pure_nacks() {
    PURE_NACKS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_writes() {
    WRITES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_acks() {
    ACKS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_nacks() {
    NACKS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_timeouts() {
    TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_retries() {
    RETRIES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_write_failures() {
    WRITE_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reconnects() {
    RECONNECTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_db_cycles() {
    DB_CYCLES.fetch_add(1, Ordering::Relaxed);
}

/// Time from first transmission to the modem's echo.
pub fn observe_ack_latency(sent_at: Instant) {
    let ms = sent_at.elapsed().as_millis() as u64;
    ACK_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    ACK_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Snapshot {
    pub frames_decoded: u64,
    pub framing_errors: u64,
    pub pure_nacks: u64,
    pub writes: u64,
    pub acks: u64,
    pub nacks: u64,
    pub timeouts: u64,
    pub retries: u64,
    pub write_failures: u64,
    pub reconnects: u64,
    pub db_cycles: u64,
    pub ack_latency_avg_ms: Option<u64>,
}

pub fn snapshot() -> Snapshot {
    let sum = ACK_LATENCY_SUM_MS.load(Ordering::Relaxed);
    let count = ACK_LATENCY_COUNT.load(Ordering::Relaxed);
    Snapshot {
        frames_decoded: FRAMES_DECODED.load(Ordering::Relaxed),
        framing_errors: FRAMING_ERRORS.load(Ordering::Relaxed),
        pure_nacks: PURE_NACKS.load(Ordering::Relaxed),
        writes: WRITES.load(Ordering::Relaxed),
        acks: ACKS.load(Ordering::Relaxed),
        nacks: NACKS.load(Ordering::Relaxed),
        timeouts: TIMEOUTS.load(Ordering::Relaxed),
        retries: RETRIES.load(Ordering::Relaxed),
        write_failures: WRITE_FAILURES.load(Ordering::Relaxed),
        reconnects: RECONNECTS.load(Ordering::Relaxed),
        db_cycles: DB_CYCLES.load(Ordering::Relaxed),
        ack_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_only_grow() {
        let before = snapshot();
        inc_writes();
        inc_retries();
        inc_db_cycles();
        observe_ack_latency(Instant::now());
        let after = snapshot();
        assert!(after.writes > before.writes);
        assert!(after.retries > before.retries);
        assert!(after.db_cycles > before.db_cycles);
        assert!(after.ack_latency_avg_ms.is_some());
    }
}
