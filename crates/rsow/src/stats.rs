//! Process-wide statistics.
//!
//! Components report what happened through [`record`]; nothing reads the
//! counters back except [`snapshot`]. Every counter group sits behind its own
//! lock, so a busy group never stalls the others.

use std::sync::{Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;

use crate::message::MsgType;

/// Retry histogram width: attempts beyond this land in the last slot
pub const MAX_ATTEMPTS: usize = 4;

/// Something worth counting.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Crc8 { ok: bool },
    Crc16 { ok: bool },
    BusLock,
    BusTransaction { ok: bool },
    CacheHit,
    CacheMiss,
    CacheAdd,
    CacheExpire,
    Read { ok: bool, bytes: usize, attempts: usize },
    Write { ok: bool, bytes: usize, attempts: usize },
    Dir { entries: usize },
    Connection,
    Request(MsgType),
    ProtocolError,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IoStats {
    pub calls: u64,
    pub success: u64,
    pub bytes: u64,
    /// `tries[n]` counts operations that took `n + 1` attempts
    pub tries: [u64; MAX_ATTEMPTS],
}

impl IoStats {
    fn add(&mut self, ok: bool, bytes: usize, attempts: usize) {
        self.calls += 1;
        if ok {
            self.success += 1;
            self.bytes += bytes as u64;
        }
        let slot = attempts.clamp(1, MAX_ATTEMPTS) - 1;
        self.tries[slot] += 1;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirStats {
    pub calls: u64,
    pub entries: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CrcStats {
    pub crc8_tries: u64,
    pub crc8_errors: u64,
    pub crc16_tries: u64,
    pub crc16_errors: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BusStats {
    pub locks: u64,
    pub transactions: u64,
    pub errors: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub adds: u64,
    pub expired: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connections: u64,
    /// Requests indexed by message type
    pub requests: [u64; 6],
    pub protocol_errors: u64,
}

/// A copy of every counter group.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub read: IoStats,
    pub write: IoStats,
    pub dir: DirStats,
    pub crc: CrcStats,
    pub bus: BusStats,
    pub cache: CacheStats,
    pub server: ServerStats,
}

/// The counter registry.
#[derive(Default)]
pub struct Registry {
    read: Mutex<IoStats>,
    write: Mutex<IoStats>,
    dir: Mutex<DirStats>,
    crc: Mutex<CrcStats>,
    bus: Mutex<BusStats>,
    cache: Mutex<CacheStats>,
    server: Mutex<ServerStats>,
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Registry {
    pub fn record(&self, event: Event) {
        match event {
            Event::Crc8 { ok } => {
                let mut crc = locked(&self.crc);
                crc.crc8_tries += 1;
                crc.crc8_errors += !ok as u64;
            }
            Event::Crc16 { ok } => {
                let mut crc = locked(&self.crc);
                crc.crc16_tries += 1;
                crc.crc16_errors += !ok as u64;
            }
            Event::BusLock => locked(&self.bus).locks += 1,
            Event::BusTransaction { ok } => {
                let mut bus = locked(&self.bus);
                bus.transactions += 1;
                bus.errors += !ok as u64;
            }
            Event::CacheHit => locked(&self.cache).hits += 1,
            Event::CacheMiss => locked(&self.cache).misses += 1,
            Event::CacheAdd => locked(&self.cache).adds += 1,
            Event::CacheExpire => locked(&self.cache).expired += 1,
            Event::Read { ok, bytes, attempts } => locked(&self.read).add(ok, bytes, attempts),
            Event::Write { ok, bytes, attempts } => locked(&self.write).add(ok, bytes, attempts),
            Event::Dir { entries } => {
                let mut dir = locked(&self.dir);
                dir.calls += 1;
                dir.entries += entries as u64;
            }
            Event::Connection => locked(&self.server).connections += 1,
            Event::Request(typ) => locked(&self.server).requests[typ as usize] += 1,
            Event::ProtocolError => locked(&self.server).protocol_errors += 1,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            read: locked(&self.read).clone(),
            write: locked(&self.write).clone(),
            dir: locked(&self.dir).clone(),
            crc: locked(&self.crc).clone(),
            bus: locked(&self.bus).clone(),
            cache: locked(&self.cache).clone(),
            server: locked(&self.server).clone(),
        }
    }

    pub fn reset(&self) {
        *locked(&self.read) = Default::default();
        *locked(&self.write) = Default::default();
        *locked(&self.dir) = Default::default();
        *locked(&self.crc) = Default::default();
        *locked(&self.bus) = Default::default();
        *locked(&self.cache) = Default::default();
        *locked(&self.server) = Default::default();
    }
}

lazy_static! {
    static ref GLOBAL: Registry = Registry::default();
}

pub fn global() -> &'static Registry {
    &GLOBAL
}

pub fn record(event: Event) {
    GLOBAL.record(event)
}

pub fn snapshot() -> Snapshot {
    GLOBAL.snapshot()
}

pub fn reset() {
    GLOBAL.reset()
}

#[cfg(test)]
mod tests {
    use super::*;

    // A private registry: the global one is shared with every other test.
    #[test]
    fn groups_count_independently() {
        let reg = Registry::default();
        reg.record(Event::Crc16 { ok: true });
        reg.record(Event::Crc16 { ok: false });
        reg.record(Event::Read { ok: true, bytes: 5, attempts: 1 });
        reg.record(Event::Read { ok: false, bytes: 0, attempts: 9 });
        reg.record(Event::Request(MsgType::Dir));

        let snap = reg.snapshot();
        assert_eq!(snap.crc.crc16_tries, 2);
        assert_eq!(snap.crc.crc16_errors, 1);
        assert_eq!(snap.read.calls, 2);
        assert_eq!(snap.read.bytes, 5);
        assert_eq!(snap.read.tries, [1, 0, 0, 1]);
        assert_eq!(snap.server.requests[MsgType::Dir as usize], 1);
        assert_eq!(snap.write, IoStats::default());

        reg.reset();
        assert_eq!(reg.snapshot(), Snapshot::default());
    }
}
