use std::collections::VecDeque;

use super::SimDevice;
use crate::crc::{crc16_trailer, crc8};
use crate::sn::SerialNumber;

const MEMORY: usize = 128;
const PAGE: usize = 32;

const READ_DATA_CRC: u8 = 0xC3;
const WRITE_MEMORY: u8 = 0x0F;

#[derive(Debug)]
enum Phase {
    Command,
    Address { cmd: u8, got: Vec<u8> },
    /// Streaming memory; the next page starts at `next`
    Reading { next: usize },
    /// Waiting for the data byte of a write
    WriteData { addr: usize },
    WriteCommand { addr: usize },
    AwaitPulse { addr: usize, data: u8 },
    Done,
}

/// 1 kbit add-only EPROM.
pub struct SimDs2502 {
    rom: SerialNumber,
    memory: [u8; MEMORY],
    phase: Phase,
    tx: VecDeque<u8>,
}

impl SimDs2502 {
    pub fn new(rom: SerialNumber) -> Self {
        SimDs2502 {
            rom,
            memory: [0xFF; MEMORY],
            phase: Phase::Command,
            tx: VecDeque::new(),
        }
    }

    pub fn memory_mut(&mut self) -> &mut [u8; MEMORY] {
        &mut self.memory
    }

    /// Store a length prefixed, CRC16 protected record in page 0.
    pub fn with_record(mut self, data: &[u8]) -> Self {
        let mut record = Vec::with_capacity(data.len() + 3);
        record.push(data.len() as u8);
        record.extend_from_slice(data);
        let trailer = crc16_trailer(0, &record);
        record.extend_from_slice(&trailer);
        self.memory[..record.len()].copy_from_slice(&record);
        self
    }

    fn queue_page(&mut self, from: usize) {
        let end = (from / PAGE + 1) * PAGE;
        let data = &self.memory[from..end];
        self.tx.extend(data.iter().copied());
        self.tx.push_back(crc8(0, data));
        self.phase = if end < MEMORY {
            Phase::Reading { next: end }
        } else {
            Phase::Done
        };
    }
}

fn addr_bytes(addr: usize) -> [u8; 2] {
    [(addr & 0xFF) as u8, (addr >> 8) as u8]
}

impl SimDevice for SimDs2502 {
    fn rom(&self) -> SerialNumber {
        self.rom
    }

    fn reset(&mut self) {
        self.phase = Phase::Command;
        self.tx.clear();
    }

    fn touch(&mut self, byte: u8) -> u8 {
        if let Some(out) = self.tx.pop_front() {
            if self.tx.is_empty() {
                if let Phase::Reading { next } = self.phase {
                    self.queue_page(next);
                }
            }
            return out;
        }

        match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Command => {
                self.phase = match byte {
                    READ_DATA_CRC | WRITE_MEMORY => Phase::Address { cmd: byte, got: Vec::new() },
                    _ => Phase::Done,
                }
            }
            Phase::Address { cmd, mut got } => {
                got.push(byte);
                if got.len() < 2 {
                    self.phase = Phase::Address { cmd, got };
                    return 0xFF;
                }
                let addr = (got[0] as usize | (got[1] as usize) << 8) % MEMORY;
                if cmd == READ_DATA_CRC {
                    self.tx.push_back(crc8(0, &[cmd, got[0], got[1]]));
                    self.phase = Phase::Reading { next: addr };
                } else {
                    self.phase = Phase::WriteCommand { addr };
                }
            }
            Phase::WriteCommand { addr } => {
                let [lo, hi] = addr_bytes(addr);
                self.tx.push_back(crc8(0, &[WRITE_MEMORY, lo, hi, byte]));
                self.phase = Phase::AwaitPulse { addr, data: byte };
            }
            Phase::WriteData { addr } => {
                let [lo, hi] = addr_bytes(addr);
                self.tx.push_back(crc8(0, &[lo, hi, byte]));
                self.phase = Phase::AwaitPulse { addr, data: byte };
            }
            other => self.phase = other,
        }
        0xFF
    }

    fn program_pulse(&mut self) {
        if let Phase::AwaitPulse { addr, data } = self.phase {
            self.memory[addr] &= data;
            self.tx.push_back(self.memory[addr]);
            self.phase = if addr + 1 < MEMORY {
                Phase::WriteData { addr: addr + 1 }
            } else {
                Phase::Done
            };
        }
    }
}
