#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    // Registry churn (cumulative counts)
    static SOCKETS_ADDED: AtomicU64 = AtomicU64::new(0);
    static SOCKETS_REMOVED: AtomicU64 = AtomicU64::new(0);
    static REGISTER_FAILURES: AtomicU64 = AtomicU64::new(0);
    static DEREGISTER_FAILURES: AtomicU64 = AtomicU64::new(0);
    // Throughput (cumulative)
    static BYTES_READ: AtomicU64 = AtomicU64::new(0);
    static BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);
    // Backpressure / anomalies
    static BURST_REJECTED: AtomicU64 = AtomicU64::new(0);
    static NULL_EVENTS: AtomicU64 = AtomicU64::new(0);
    static STALE_EVENTS: AtomicU64 = AtomicU64::new(0);
    static SOCKET_ERRORS: AtomicU64 = AtomicU64::new(0);
    // Worker wait outcomes (stall = timeout with nothing ready)
    static WAKEUPS: AtomicU64 = AtomicU64::new(0);
    static WAIT_TIMEOUTS: AtomicU64 = AtomicU64::new(0);
    // Gauges
    static LIVE_SOCKETS: AtomicUsize = AtomicUsize::new(0);
    static LIVE_SOCKETS_MAX: AtomicUsize = AtomicUsize::new(0);

    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub sockets_added: u64,
        pub sockets_removed: u64,
        pub register_failures: u64,
        pub deregister_failures: u64,
        pub bytes_read: u64,
        pub bytes_written: u64,
        pub burst_rejected: u64,
        pub null_events: u64,
        pub stale_events: u64,
        pub socket_errors: u64,
        pub wakeups: u64,
        pub wait_timeouts: u64,
        pub live_sockets: usize,
        pub live_sockets_max: usize,
    }

    fn update_max(target: &AtomicUsize, value: usize) {
        let mut prev = target.load(Ordering::Relaxed);
        while value > prev {
            match target.compare_exchange_weak(prev, value, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
    }

    pub fn inc_sockets_added() {
        SOCKETS_ADDED.fetch_add(1, Ordering::Relaxed);
        let live = LIVE_SOCKETS.fetch_add(1, Ordering::Relaxed) + 1;
        update_max(&LIVE_SOCKETS_MAX, live);
    }

    pub fn inc_sockets_removed() {
        SOCKETS_REMOVED.fetch_add(1, Ordering::Relaxed);
        LIVE_SOCKETS.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_register_failures() {
        REGISTER_FAILURES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deregister_failures() {
        DEREGISTER_FAILURES.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_read(n: usize) {
        BYTES_READ.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_written(n: usize) {
        BYTES_WRITTEN.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_burst_rejected() {
        BURST_REJECTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_null_events() {
        NULL_EVENTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stale_events() {
        STALE_EVENTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_socket_errors() {
        SOCKET_ERRORS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_wakeups() {
        WAKEUPS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_wait_timeouts() {
        WAIT_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            sockets_added: SOCKETS_ADDED.load(Ordering::Relaxed),
            sockets_removed: SOCKETS_REMOVED.load(Ordering::Relaxed),
            register_failures: REGISTER_FAILURES.load(Ordering::Relaxed),
            deregister_failures: DEREGISTER_FAILURES.load(Ordering::Relaxed),
            bytes_read: BYTES_READ.load(Ordering::Relaxed),
            bytes_written: BYTES_WRITTEN.load(Ordering::Relaxed),
            burst_rejected: BURST_REJECTED.load(Ordering::Relaxed),
            null_events: NULL_EVENTS.load(Ordering::Relaxed),
            stale_events: STALE_EVENTS.load(Ordering::Relaxed),
            socket_errors: SOCKET_ERRORS.load(Ordering::Relaxed),
            wakeups: WAKEUPS.load(Ordering::Relaxed),
            wait_timeouts: WAIT_TIMEOUTS.load(Ordering::Relaxed),
            live_sockets: LIVE_SOCKETS.load(Ordering::Relaxed),
            live_sockets_max: LIVE_SOCKETS_MAX.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        let spawned = std::thread::Builder::new()
            .name("metrics".into())
            .spawn(|| {
                let mut last = snapshot();
                loop {
                    std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                    let snap = snapshot();
                    tracing::info!(
                        interval_secs = INTERVAL_SECS,
                        added = snap.sockets_added.saturating_sub(last.sockets_added),
                        removed = snap.sockets_removed.saturating_sub(last.sockets_removed),
                        bytes_in = snap.bytes_read.saturating_sub(last.bytes_read),
                        bytes_out = snap.bytes_written.saturating_sub(last.bytes_written),
                        burst_rejected = snap.burst_rejected.saturating_sub(last.burst_rejected),
                        register_failures =
                            snap.register_failures.saturating_sub(last.register_failures),
                        deregister_failures =
                            snap.deregister_failures.saturating_sub(last.deregister_failures),
                        null_events = snap.null_events.saturating_sub(last.null_events),
                        stale_events = snap.stale_events.saturating_sub(last.stale_events),
                        socket_errors = snap.socket_errors.saturating_sub(last.socket_errors),
                        wakeups = snap.wakeups.saturating_sub(last.wakeups),
                        wait_timeouts = snap.wait_timeouts.saturating_sub(last.wait_timeouts),
                        live = snap.live_sockets,
                        live_max = snap.live_sockets_max,
                        "metrics delta"
                    );
                    last = snap;
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(%err, "metrics reporter not started");
        }
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub sockets_added: u64,
        pub sockets_removed: u64,
        pub register_failures: u64,
        pub deregister_failures: u64,
        pub bytes_read: u64,
        pub bytes_written: u64,
        pub burst_rejected: u64,
        pub null_events: u64,
        pub stale_events: u64,
        pub socket_errors: u64,
        pub wakeups: u64,
        pub wait_timeouts: u64,
        pub live_sockets: usize,
        pub live_sockets_max: usize,
    }

    pub fn inc_sockets_added() {}
    pub fn inc_sockets_removed() {}
    pub fn inc_register_failures() {}
    pub fn inc_deregister_failures() {}
    pub fn add_bytes_read(_: usize) {}
    pub fn add_bytes_written(_: usize) {}
    pub fn inc_burst_rejected() {}
    pub fn inc_null_events() {}
    pub fn inc_stale_events() {}
    pub fn inc_socket_errors() {}
    pub fn inc_wakeups() {}
    pub fn inc_wait_timeouts() {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            sockets_added: 0,
            sockets_removed: 0,
            register_failures: 0,
            deregister_failures: 0,
            bytes_read: 0,
            bytes_written: 0,
            burst_rejected: 0,
            null_events: 0,
            stale_events: 0,
            socket_errors: 0,
            wakeups: 0,
            wait_timeouts: 0,
            live_sockets: 0,
            live_sockets_max: 0,
        }
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
