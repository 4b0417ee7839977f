//! Statistics tracking for the server core
//!
//! All counters are increment-only and live behind `Cell` so that any
//! subsystem holding a shared reference to the core context can bump
//! them. The core is single-threaded; there is nothing to lock.

use std::cell::Cell;

/// Increment-only server counters
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Successful DNS lookups delivered to a consumer
    pub dns_good: Cell<u64>,
    /// Failed DNS lookups (negative answers, malformed replies)
    pub dns_bad: Cell<u64>,
    /// Total DNS replies processed
    pub dns_total: Cell<u64>,
    /// Bytes written to client sockets
    pub sent: Cell<u64>,
    /// Bytes read from client sockets
    pub recv: Cell<u64>,
    /// Connections accepted
    pub accepts: Cell<u64>,
    /// Total events delivered by the socket engine
    pub total_events: Cell<u64>,
    /// Read events delivered
    pub read_events: Cell<u64>,
    /// Write events delivered
    pub write_events: Cell<u64>,
    /// Error events delivered
    pub error_events: Cell<u64>,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dns_good(&self) {
        bump(&self.dns_good);
    }

    pub fn record_dns_bad(&self) {
        bump(&self.dns_bad);
    }

    pub fn record_dns_total(&self) {
        bump(&self.dns_total);
    }

    pub fn record_accept(&self) {
        bump(&self.accepts);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.sent.set(self.sent.get() + bytes as u64);
    }

    pub fn record_recv(&self, bytes: usize) {
        self.recv.set(self.recv.get() + bytes as u64);
    }
}

fn bump(cell: &Cell<u64>) {
    cell.set(cell.get() + 1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let stats = ServerStats::new();
        stats.record_dns_good();
        stats.record_dns_good();
        stats.record_dns_bad();
        stats.record_sent(100);
        stats.record_recv(42);
        assert_eq!(stats.dns_good.get(), 2);
        assert_eq!(stats.dns_bad.get(), 1);
        assert_eq!(stats.sent.get(), 100);
        assert_eq!(stats.recv.get(), 42);
    }
}
