//! A simulated bus segment.
//!
//! Each attached chip is a byte-level state machine behind [`SimDevice`].
//! The bus handles ROM commands itself and routes bytes to the selected chip;
//! the sendback is the wired AND of the master byte and what the chip drives.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{Bus, MATCH_ROM, SKIP_ROM};
use crate::sn::SerialNumber;
use crate::utils::Result;

mod ds1921;
mod ds2502;
mod moat;

pub use self::ds1921::SimDs1921;
pub use self::ds2502::SimDs2502;
pub use self::moat::SimMoat;

/// A chip on a simulated segment.
pub trait SimDevice: Send {
    fn rom(&self) -> SerialNumber;

    /// Reset pulse: abandon any command in progress.
    fn reset(&mut self);

    /// The master wrote `byte` while this chip was selected. Returns what the
    /// chip drives; `0xFF` leaves the line alone.
    fn touch(&mut self, byte: u8) -> u8;

    fn program_pulse(&mut self) {}
}

/// A chip that answers presence and search but ignores every command.
pub struct SimSilent {
    rom: SerialNumber,
}

impl SimSilent {
    pub fn new(rom: SerialNumber) -> Self {
        SimSilent { rom }
    }
}

impl SimDevice for SimSilent {
    fn rom(&self) -> SerialNumber {
        self.rom
    }

    fn reset(&mut self) {}

    fn touch(&mut self, _byte: u8) -> u8 {
        0xFF
    }
}

/// Build the simulated chip matching the family of `sn`.
pub fn simulated(sn: SerialNumber) -> Arc<Mutex<dyn SimDevice>> {
    match sn.family() {
        0x21 => Arc::new(Mutex::new(SimDs1921::new(sn))),
        0x09 | 0x89 => Arc::new(Mutex::new(SimDs2502::new(sn))),
        0xF0 => Arc::new(Mutex::new(SimMoat::new(sn))),
        _ => Arc::new(Mutex::new(SimSilent::new(sn))),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum RomState {
    /// No reset since the last command
    Idle,
    /// Reset seen, waiting for a ROM command
    Command,
    Matching(Vec<u8>),
    Selected(usize),
}

pub struct SimBus {
    devices: Vec<Arc<Mutex<dyn SimDevice>>>,
    state: RomState,
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

fn chip<'a>(dev: &'a Mutex<dyn SimDevice + 'static>) -> MutexGuard<'a, dyn SimDevice + 'static> {
    dev.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SimBus {
    pub fn new() -> Self {
        SimBus {
            devices: Vec::new(),
            state: RomState::Idle,
        }
    }

    pub fn attach(&mut self, device: Arc<Mutex<dyn SimDevice>>) {
        self.devices.push(device);
    }

    pub fn with(mut self, device: Arc<Mutex<dyn SimDevice>>) -> Self {
        self.attach(device);
        self
    }

    fn touch_byte(&mut self, byte: u8) -> u8 {
        let (next, echo) = match std::mem::replace(&mut self.state, RomState::Idle) {
            RomState::Idle => (RomState::Idle, byte),
            RomState::Command => match byte {
                MATCH_ROM => (RomState::Matching(Vec::with_capacity(8)), byte),
                SKIP_ROM if self.devices.len() == 1 => (RomState::Selected(0), byte),
                _ => (RomState::Idle, byte),
            },
            RomState::Matching(mut rom) => {
                rom.push(byte);
                if rom.len() < 8 {
                    (RomState::Matching(rom), byte)
                } else {
                    let hit = self.devices.iter().position(|d| chip(d).rom().bytes()[..] == rom[..]);
                    (hit.map_or(RomState::Idle, RomState::Selected), byte)
                }
            }
            RomState::Selected(i) => {
                let out = chip(&self.devices[i]).touch(byte);
                (RomState::Selected(i), byte & out)
            }
        };
        self.state = next;
        echo
    }
}

#[async_trait]
impl Bus for SimBus {
    async fn reset(&mut self) -> Result<bool> {
        for dev in &self.devices {
            chip(dev).reset();
        }
        self.state = RomState::Command;
        Ok(!self.devices.is_empty())
    }

    async fn touch(&mut self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.iter().map(|&b| self.touch_byte(b)).collect())
    }

    async fn program_pulse(&mut self) -> Result<()> {
        if let RomState::Selected(i) = self.state {
            chip(&self.devices[i]).program_pulse();
        }
        Ok(())
    }

    async fn search(&mut self) -> Result<Vec<SerialNumber>> {
        self.state = RomState::Idle;
        Ok(self.devices.iter().map(|d| chip(d).rom()).collect())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn match_rom_routes_to_one_chip() {
        let a = SerialNumber::new(0x09, [1, 1, 1, 1, 1, 1]);
        let b = SerialNumber::new(0x09, [2, 2, 2, 2, 2, 2]);
        let chip_a = Arc::new(Mutex::new(SimDs2502::new(a)));
        let chip_b = Arc::new(Mutex::new(SimDs2502::new(b)));
        chip_b.lock().unwrap().memory_mut()[0] = 0x42;

        let mut bus = SimBus::new().with(chip_a).with(chip_b);
        bus.select(&b).await.unwrap();
        // read memory: command, address, CRC8, then data
        let echo = bus.touch(&[0xC3, 0x00, 0x00, 0xFF, 0xFF]).await.unwrap();
        assert_eq!(echo[4], 0x42);

        let found = bus.search().await.unwrap();
        assert_eq!(found, vec![a, b]);
    }

    #[tokio::test]
    async fn unmatched_rom_stays_quiet() {
        let a = SerialNumber::new(0x09, [1, 1, 1, 1, 1, 1]);
        let mut bus = SimBus::new().with(Arc::new(Mutex::new(SimDs2502::new(a))));
        bus.select(&SerialNumber::new(0x09, [3; 6])).await.unwrap();
        let echo = bus.touch(&[0xC3, 0x00, 0x00, 0xFF]).await.unwrap();
        assert_eq!(echo, vec![0xC3, 0x00, 0x00, 0xFF]);
    }
}
