//! Transaction logs: scripted exchanges with one device.
//!
//! A log is an ordered list of [`Step`]s that always opens with a start step
//! and closes with [`Step::End`]. It is executed atomically under the bus
//! lock by [`crate::bus::BusMaster`]; the first failing step aborts the rest.
//! Nothing here retries.
//!
//! Checksums cover the *window*: every byte written or read since the start
//! step or the previous checksum step. A seeded checksum preloads the CRC
//! register instead of starting from zero.
//!
//! ```
//! use rsow::transaction::TransactionLog;
//!
//! // page 0 through the CRC16 guarded read memory command
//! let log = TransactionLog::select()
//!     .matching(&[0xA5, 0x00, 0x00])
//!     .read(32)
//!     .crc16()
//!     .end();
//! assert_eq!(log.len(), 5);
//! ```

use std::time::Duration;

use log::debug;

use crate::bus::Bus;
use crate::crc::{crc16, crc16_valid, crc8_valid};
use crate::error::{errno::*, TransactionError};
use crate::sn::SerialNumber;
use crate::stats::{self, Event};
use crate::utils::Result;

/// Time allowed for an EPROM cell to settle after a programming pulse
pub const PROGRAM_SETTLE: Duration = Duration::from_micros(500);

/// A MoaT length byte with this value means the device had no answer ready
const NOT_READY: u8 = 0xFF;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StartKind {
    /// Reset and address the device with MATCH ROM
    Select,
    /// Keep talking to the device addressed by the previous log
    Resume,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Start(StartKind),
    /// Write bytes; the sendback must equal what was written
    Match(Vec<u8>),
    /// Read a fixed number of bytes
    Read(usize),
    /// Read a length byte and then that many bytes, keeping at most `max`
    ReadCounted { max: usize },
    /// Read one CRC8 byte and validate the window
    Crc8 { seed: u8 },
    /// Read the two inverted CRC16 bytes and validate the window
    Crc16 { seed: u16 },
    /// Acknowledge the last CRC16 by sending it back inverted
    AckCrc16,
    Program,
    Delay(Duration),
    End,
}

/// An ordered list of steps against one device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionLog {
    steps: Vec<Step>,
}

impl TransactionLog {
    /// A log that starts by addressing the device.
    pub fn select() -> Self {
        TransactionLog {
            steps: vec![Step::Start(StartKind::Select)],
        }
    }

    /// A log that continues an exchange left open by the previous log.
    pub fn resume() -> Self {
        TransactionLog {
            steps: vec![Step::Start(StartKind::Resume)],
        }
    }

    fn push(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn matching(self, bytes: &[u8]) -> Self {
        self.push(Step::Match(bytes.to_vec()))
    }

    pub fn read(self, n: usize) -> Self {
        self.push(Step::Read(n))
    }

    pub fn read_counted(self, max: usize) -> Self {
        self.push(Step::ReadCounted { max })
    }

    pub fn crc8(self) -> Self {
        self.crc8_seeded(0)
    }

    pub fn crc8_seeded(self, seed: u8) -> Self {
        self.push(Step::Crc8 { seed })
    }

    pub fn crc16(self) -> Self {
        self.crc16_seeded(0)
    }

    pub fn crc16_seeded(self, seed: u16) -> Self {
        self.push(Step::Crc16 { seed })
    }

    pub fn ack_crc16(self) -> Self {
        self.push(Step::AckCrc16)
    }

    pub fn program(self) -> Self {
        self.push(Step::Program)
    }

    pub fn delay(self, d: Duration) -> Self {
        self.push(Step::Delay(d))
    }

    pub fn end(self) -> Self {
        self.push(Step::End)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    fn well_formed(&self) -> bool {
        let n = self.steps.len();
        n >= 2
            && matches!(self.steps[0], Step::Start(_))
            && self.steps[n - 1] == Step::End
            && self.steps[1..n - 1]
                .iter()
                .all(|s| !matches!(s, Step::Start(_) | Step::End))
    }

    /// Run the log on an already locked bus.
    pub async fn execute(&self, bus: &mut dyn Bus, sn: &SerialNumber) -> Result<Transcript> {
        if !self.well_formed() {
            return Err(EINVAL.into());
        }

        let mut exec = Execution::default();
        for (i, step) in self.steps.iter().enumerate() {
            if let Err(e) = exec.step(bus, sn, step).await {
                debug!("{}: step {} {:?} failed: {}", sn, i, step, e);
                return Err(e);
            }
        }
        Ok(Transcript { reads: exec.reads })
    }
}

/// What the device sent back, one buffer per read step in log order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transcript {
    reads: Vec<Vec<u8>>,
}

impl Transcript {
    pub fn get(&self, i: usize) -> &[u8] {
        self.reads.get(i).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn into_reads(self) -> Vec<Vec<u8>> {
        self.reads
    }

    /// The first read buffer, which is all most logs have.
    pub fn into_first(self) -> Vec<u8> {
        self.reads.into_iter().next().unwrap_or_default()
    }
}

#[derive(Default)]
struct Execution {
    window: Vec<u8>,
    last_crc16: [u8; 2],
    reads: Vec<Vec<u8>>,
}

impl Execution {
    async fn receive(&mut self, bus: &mut dyn Bus, n: usize) -> Result<Vec<u8>> {
        let got = bus.touch(&vec![0xFF; n]).await?;
        if got.len() != n {
            return Err(TransactionError::Short { wanted: n, got: got.len() }.into());
        }
        self.window.extend_from_slice(&got);
        Ok(got)
    }

    async fn send(&mut self, bus: &mut dyn Bus, bytes: &[u8]) -> Result<()> {
        let echo = bus.touch(bytes).await?;
        if echo != bytes {
            return Err(TransactionError::Echo {
                sent: bytes.to_vec(),
                echoed: echo,
            }
            .into());
        }
        self.window.extend_from_slice(bytes);
        Ok(())
    }

    async fn step(&mut self, bus: &mut dyn Bus, sn: &SerialNumber, step: &Step) -> Result<()> {
        match *step {
            Step::Start(StartKind::Select) => {
                bus.select(sn).await?;
                self.window.clear();
            }
            Step::Start(StartKind::Resume) => self.window.clear(),
            Step::Match(ref bytes) => self.send(bus, bytes).await?,
            Step::Read(n) => {
                let got = self.receive(bus, n).await?;
                self.reads.push(got);
            }
            Step::ReadCounted { max } => {
                let len = self.receive(bus, 1).await?[0];
                if len == NOT_READY {
                    return Err(TransactionError::NotReady.into());
                }
                let mut body = self.receive(bus, len as usize).await?;
                body.truncate(max);
                self.reads.push(body);
            }
            Step::Crc8 { seed } => {
                self.receive(bus, 1).await?;
                let ok = crc8_valid(seed, &self.window);
                stats::record(Event::Crc8 { ok });
                self.window.clear();
                if !ok {
                    return Err(TransactionError::Crc8.into());
                }
            }
            Step::Crc16 { seed } => {
                let got = self.receive(bus, 2).await?;
                let ok = crc16_valid(seed, &self.window);
                stats::record(Event::Crc16 { ok });
                self.window.clear();
                if !ok {
                    return Err(TransactionError::Crc16.into());
                }
                self.last_crc16 = [got[0], got[1]];
            }
            Step::AckCrc16 => {
                let ack = [!self.last_crc16[0], !self.last_crc16[1]];
                self.send(bus, &ack).await?;
                self.window.clear();
            }
            Step::Program => {
                bus.program_pulse().await?;
                tokio::time::sleep(PROGRAM_SETTLE).await;
            }
            Step::Delay(d) => tokio::time::sleep(d).await,
            Step::End => {}
        }
        Ok(())
    }
}

/// CRC16 of a MoaT or memory command header, for seeding a later check.
pub fn header_seed(header: &[u8]) -> u16 {
    crc16(0, header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::{SimBus, SimDs2502};
    use crate::bus::BusMaster;
    use crate::crc::crc8;
    use std::sync::{Arc, Mutex};

    fn eprom() -> (BusMaster, Arc<Mutex<SimDs2502>>, SerialNumber) {
        let sn = SerialNumber::new(0x09, [1, 2, 3, 4, 5, 6]);
        let chip = Arc::new(Mutex::new(SimDs2502::new(sn)));
        let mut bus = SimBus::new();
        bus.attach(chip.clone());
        (BusMaster::new(0, Box::new(bus)), chip, sn)
    }

    #[test]
    fn builder_invariant() {
        assert!(TransactionLog::select().read(1).end().well_formed());
        assert!(!TransactionLog::select().read(1).well_formed());
        assert!(!TransactionLog::select().end().end().well_formed());
    }

    #[tokio::test]
    async fn unterminated_log_is_rejected() {
        let (bus, _, sn) = eprom();
        let err = bus.transaction(&sn, &TransactionLog::select().read(1)).await.unwrap_err();
        assert_eq!(err.errno(), EINVAL);
    }

    #[tokio::test]
    async fn crc8_read() {
        let (bus, chip, sn) = eprom();
        chip.lock().unwrap().memory_mut()[..4].copy_from_slice(b"\x11\x22\x33\x44");

        let log = TransactionLog::select()
            .matching(&[0xC3, 0x00, 0x00])
            .crc8()
            .read(32)
            .crc8()
            .end();
        let t = bus.transaction(&sn, &log).await.unwrap();
        assert_eq!(&t.get(0)[..4], b"\x11\x22\x33\x44");
    }

    #[tokio::test]
    async fn empty_bus_has_no_presence() {
        let bus = BusMaster::new(0, Box::new(SimBus::new()));
        let ghost = SerialNumber::new(0x09, [9, 9, 9, 9, 9, 9]);
        let log = TransactionLog::select().read(1).end();
        let err = bus.transaction(&ghost, &log).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Transaction(TransactionError::NoPresence)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn bad_checksum_stops_the_log() {
        let (bus, chip, sn) = eprom();
        // a wrong seed makes the command check fail before the program pulse
        let log = TransactionLog::select()
            .matching(&[0x0F, 0x00, 0x00, 0x5A])
            .crc8_seeded(crc8(0, &[0x01]))
            .program()
            .read(1)
            .end();
        let err = bus.transaction(&sn, &log).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Transaction(TransactionError::Crc8)));
        assert_eq!(chip.lock().unwrap().memory_mut()[0], 0xFF);
    }
}
