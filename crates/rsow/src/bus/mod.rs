//! Bus masters.
//!
//! A [`Bus`] is one physical or simulated 1-Wire segment. It is only ever
//! driven through a [`BusMaster`], which owns the single lock for that
//! segment; every transaction log runs with the lock held.

use async_trait::async_trait;
use log::{debug, trace};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::TransactionError;
use crate::sn::SerialNumber;
use crate::stats::{self, Event};
use crate::transaction::{Transcript, TransactionLog};
use crate::utils::Result;

pub mod sim;

/// ROM function commands
pub const MATCH_ROM: u8 = 0x55;
pub const SKIP_ROM: u8 = 0xCC;
pub const SEARCH_ROM: u8 = 0xF0;

/// Low level access to one 1-Wire segment.
///
/// `touch` is the sendback primitive: every byte written is returned as seen
/// on the wire, so reading is writing `0xFF` and collecting what the slave
/// pulled low.
#[async_trait]
pub trait Bus: Send {
    /// Reset pulse. Returns whether any slave answered with presence.
    async fn reset(&mut self) -> Result<bool>;

    /// Write `bytes`, returning the bytes seen on the wire.
    async fn touch(&mut self, bytes: &[u8]) -> Result<Vec<u8>>;

    /// EPROM programming pulse.
    async fn program_pulse(&mut self) -> Result<()>;

    /// Enumerate every ROM code on the segment.
    async fn search(&mut self) -> Result<Vec<SerialNumber>>;

    /// Address a single slave: reset, then MATCH ROM with the echo verified.
    async fn select(&mut self, sn: &SerialNumber) -> Result<()> {
        if !self.reset().await? {
            return Err(TransactionError::NoPresence.into());
        }
        let mut cmd = Vec::with_capacity(9);
        cmd.push(MATCH_ROM);
        cmd.extend_from_slice(sn.bytes());
        let echo = self.touch(&cmd).await?;
        if echo != cmd {
            return Err(TransactionError::Echo { sent: cmd, echoed: echo }.into());
        }
        Ok(())
    }

    /// Human readable adapter name.
    fn name(&self) -> &str {
        "bus"
    }
}

/// Exclusive owner of a bus segment.
pub struct BusMaster {
    index: usize,
    bus: Mutex<Box<dyn Bus>>,
}

impl BusMaster {
    pub fn new(index: usize, bus: Box<dyn Bus>) -> Self {
        BusMaster {
            index,
            bus: Mutex::new(bus),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Take the bus lock to run several logs back to back.
    pub async fn lock(&self) -> BusGuard<'_> {
        let guard = self.bus.lock().await;
        stats::record(Event::BusLock);
        BusGuard { index: self.index, bus: guard }
    }

    /// Run one transaction log under the bus lock.
    pub async fn transaction(&self, sn: &SerialNumber, log: &TransactionLog) -> Result<Transcript> {
        self.lock().await.transaction(sn, log).await
    }

    /// List the devices on this segment.
    pub async fn search(&self) -> Result<Vec<SerialNumber>> {
        let mut guard = self.lock().await;
        let found = guard.bus.search().await?;
        trace!("bus.{}: search found {} devices", self.index, found.len());
        Ok(found)
    }
}

/// The held bus lock.
pub struct BusGuard<'a> {
    index: usize,
    bus: MutexGuard<'a, Box<dyn Bus>>,
}

impl BusGuard<'_> {
    pub async fn transaction(&mut self, sn: &SerialNumber, log: &TransactionLog) -> Result<Transcript> {
        let ret = log.execute(&mut **self.bus, sn).await;
        stats::record(Event::BusTransaction { ok: ret.is_ok() });
        if let Err(ref e) = ret {
            debug!("bus.{}: {} transaction failed: {}", self.index, sn, e);
        }
        ret
    }
}
