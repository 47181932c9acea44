//! Wire byte accounting.

use std::io::{self, Read, Write};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::conn::Carrier;

/// Atomic counters for bytes moved over the carrier, handshake included.
#[derive(Debug, Default)]
pub(crate) struct TrafficStat {
    read: AtomicU64,
    written: AtomicU64,
}

impl TrafficStat {
    pub(crate) fn add_read(&self, n: u64) {
        self.read.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn add_written(&self, n: u64) {
        self.written.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn totals(&self) -> (u64, u64) {
        (
            self.read.load(Ordering::Relaxed),
            self.written.load(Ordering::Relaxed),
        )
    }
}

/// A cloneable carrier handle that counts every byte it moves.
///
/// Both record stacks of a connection hold one, sharing the carrier and
/// the counters.
#[derive(Debug)]
pub(crate) struct Metered<C> {
    carrier: Arc<C>,
    stat: Arc<TrafficStat>,
}

impl<C> Metered<C> {
    pub(crate) fn new(carrier: Arc<C>, stat: Arc<TrafficStat>) -> Self {
        Self { carrier, stat }
    }
}

impl<C> Clone for Metered<C> {
    fn clone(&self) -> Self {
        Self {
            carrier: Arc::clone(&self.carrier),
            stat: Arc::clone(&self.stat),
        }
    }
}

impl<C: Carrier> Read for Metered<C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.carrier.read(buf)?;
        self.stat.add_read(n as u64);
        Ok(n)
    }
}

impl<C: Carrier> Write for Metered<C> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.carrier.write(buf)?;
        self.stat.add_written(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.carrier.flush()
    }
}
