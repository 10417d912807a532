use std::sync::atomic::{AtomicUsize, Ordering};

/// Live per-call counters owned by a gateway
#[derive(Debug, Default)]
pub(crate) struct CallCounters {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl CallCounters {
    pub(crate) fn record_open(&self) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn snapshot(&self, ambient_created: bool, disposed: bool) -> GatewayStats {
        let opened = self.opened.load(Ordering::SeqCst);
        let closed = self.closed.load(Ordering::SeqCst);
        GatewayStats {
            opened,
            closed,
            in_flight: opened.saturating_sub(closed),
            ambient_created,
            disposed,
        }
    }
}

/// Gateway statistics
///
/// Covers per-call connections only; the ambient connection is reported
/// by whether it exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayStats {
    pub opened: usize,
    pub closed: usize,
    pub in_flight: usize,
    pub ambient_created: bool,
    pub disposed: bool,
}

impl std::fmt::Display for GatewayStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Gateway Stats: {} opened, {} closed, {} in flight, ambient {}{}",
            self.opened,
            self.closed,
            self.in_flight,
            if self.ambient_created { "created" } else { "untouched" },
            if self.disposed { ", disposed" } else { "" }
        )
    }
}
