use std::collections::VecDeque;

use super::SimDevice;
use crate::crc::crc16_trailer;
use crate::sn::SerialNumber;

const MEMORY: usize = 0x2000;
const PAGE: usize = 32;

const WRITE_SCRATCHPAD: u8 = 0x0F;
const READ_SCRATCHPAD: u8 = 0xAA;
const COPY_SCRATCHPAD: u8 = 0x55;
const READ_MEMORY_CRC: u8 = 0xA5;
const CLEAR_MEMORY: u8 = 0x3C;
const CONVERT: u8 = 0x44;

const RTC: usize = 0x200;
const SAMPLE_RATE: usize = 0x20D;
const CONTROL: usize = 0x20E;
const STOP: usize = 0x210;
const TEMPERATURE: usize = 0x211;
const STATUS: usize = 0x214;
const MISSION_STAMP: usize = 0x215;
const MISSION_SAMPLES: usize = 0x21A;
const DEVICE_SAMPLES: usize = 0x21D;
const HISTOGRAM: usize = 0x800;
const LOG: usize = 0x1000;
const LOG_ELEMENTS: usize = 2048;

const CONTROL_CLOCK_STOPPED: u8 = 0x80;
const CONTROL_ENABLE_CLEAR: u8 = 0x40;
const CONTROL_ROLLOVER: u8 = 0x08;
const STATUS_MEMCLR: u8 = 0x40;
const STATUS_MIP: u8 = 0x20;

#[derive(Debug)]
enum Phase {
    Command,
    Address { cmd: u8, got: Vec<u8> },
    WriteScratch { pos: usize, seen: Vec<u8> },
    Streaming { next: usize },
    Done,
}

/// Thermochron temperature logger.
pub struct SimDs1921 {
    rom: SerialNumber,
    memory: Vec<u8>,
    scratch: [u8; PAGE],
    target: u16,
    ending: u8,
    temperature_raw: u8,
    corrupt: bool,
    phase: Phase,
    tx: VecDeque<u8>,
}

fn u24(bytes: &[u8]) -> usize {
    bytes[0] as usize | (bytes[1] as usize) << 8 | (bytes[2] as usize) << 16
}

impl SimDs1921 {
    pub fn new(rom: SerialNumber) -> Self {
        let mut memory = vec![0u8; MEMORY];
        memory[CONTROL] = CONTROL_CLOCK_STOPPED;
        SimDs1921 {
            rom,
            memory,
            scratch: [0xFF; PAGE],
            target: 0,
            ending: 0,
            temperature_raw: 0xA0,
            corrupt: false,
            phase: Phase::Command,
            tx: VecDeque::new(),
        }
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// Raw reading the next conversion produces.
    pub fn set_temperature_raw(&mut self, raw: u8) {
        self.temperature_raw = raw;
    }

    /// Flip a bit in the next scratchpad readback, once.
    pub fn corrupt_next_readback(&mut self) {
        self.corrupt = true;
    }

    pub fn mission_running(&self) -> bool {
        self.memory[STATUS] & STATUS_MIP != 0
    }

    pub fn clock(&self) -> [u8; 7] {
        let mut rtc = [0u8; 7];
        rtc.copy_from_slice(&self.memory[RTC..RTC + 7]);
        rtc
    }

    /// Log one sample the way a running mission does.
    pub fn record_sample(&mut self, raw: u8) {
        let n = u24(&self.memory[MISSION_SAMPLES..]);
        if n < LOG_ELEMENTS || self.memory[CONTROL] & CONTROL_ROLLOVER != 0 {
            self.memory[LOG + n % LOG_ELEMENTS] = raw;
        }
        self.store_u24(MISSION_SAMPLES, n + 1);
        let total = u24(&self.memory[DEVICE_SAMPLES..]);
        self.store_u24(DEVICE_SAMPLES, total + 1);

        let bin = (raw / 4) as usize;
        if bin < 63 {
            let at = HISTOGRAM + 2 * bin;
            let count = u16::from_le_bytes([self.memory[at], self.memory[at + 1]]).saturating_add(1);
            self.memory[at..at + 2].copy_from_slice(&count.to_le_bytes());
        }
    }

    fn store_u24(&mut self, at: usize, v: usize) {
        self.memory[at] = v as u8;
        self.memory[at + 1] = (v >> 8) as u8;
        self.memory[at + 2] = (v >> 16) as u8;
    }

    fn queue_page(&mut self, from: usize, header: &[u8]) {
        let end = (from / PAGE + 1) * PAGE;
        let mut covered = header.to_vec();
        covered.extend_from_slice(&self.memory[from..end]);
        self.tx.extend(self.memory[from..end].iter().copied());
        self.tx.extend(crc16_trailer(0, &covered));
        self.phase = if end < MEMORY {
            Phase::Streaming { next: end }
        } else {
            Phase::Done
        };
    }

    fn queue_scratchpad(&mut self) {
        let from = (self.target as usize) & (PAGE - 1);
        let [lo, hi] = self.target.to_le_bytes();
        let mut sent = vec![lo, hi, self.ending];
        sent.extend_from_slice(&self.scratch[from..]);
        if self.corrupt && sent.len() > 3 {
            sent[3] ^= 0x01;
            self.corrupt = false;
        }
        let mut covered = vec![READ_SCRATCHPAD];
        covered.extend_from_slice(&sent);
        self.tx.extend(sent);
        self.tx.extend(crc16_trailer(0, &covered));
    }

    fn copy_scratchpad(&mut self, auth: &[u8]) {
        let [lo, hi] = self.target.to_le_bytes();
        if auth[..] != [lo, hi, self.ending][..] {
            return;
        }
        let base = (self.target as usize) & !(PAGE - 1);
        let from = (self.target as usize) & (PAGE - 1);
        for i in from..=(self.ending as usize & (PAGE - 1)) {
            self.memory[base + i] = self.scratch[i];
            self.side_effect(base + i);
        }
    }

    fn side_effect(&mut self, addr: usize) {
        if addr == SAMPLE_RATE
            && self.memory[SAMPLE_RATE] != 0
            && self.memory[STATUS] & (STATUS_MIP | STATUS_MEMCLR) == STATUS_MEMCLR
        {
            self.memory[STATUS] = (self.memory[STATUS] & !STATUS_MEMCLR) | STATUS_MIP;
            let rtc = self.clock();
            self.memory[MISSION_STAMP..MISSION_STAMP + 5].copy_from_slice(&[
                rtc[1],
                rtc[2],
                rtc[4],
                rtc[5] & 0x1F,
                rtc[6],
            ]);
            self.store_u24(MISSION_SAMPLES, 0);
        }
    }

    fn clear_memory(&mut self) {
        if self.memory[CONTROL] & CONTROL_ENABLE_CLEAR == 0 {
            return;
        }
        self.memory[MISSION_STAMP..MISSION_SAMPLES + 3].fill(0);
        self.memory[0x220..0x280].fill(0);
        self.memory[HISTOGRAM..HISTOGRAM + 126].fill(0);
        self.memory[LOG..LOG + LOG_ELEMENTS].fill(0);
        self.memory[CONTROL] &= !CONTROL_ENABLE_CLEAR;
        self.memory[STATUS] |= STATUS_MEMCLR;
    }

    fn command(&mut self, cmd: u8) -> Phase {
        match cmd {
            WRITE_SCRATCHPAD | COPY_SCRATCHPAD | READ_MEMORY_CRC => Phase::Address { cmd, got: Vec::new() },
            READ_SCRATCHPAD => {
                self.queue_scratchpad();
                Phase::Done
            }
            CLEAR_MEMORY => {
                self.clear_memory();
                Phase::Done
            }
            CONVERT => {
                if self.memory[STATUS] & STATUS_MIP == 0 {
                    self.memory[TEMPERATURE] = self.temperature_raw;
                }
                Phase::Done
            }
            _ => Phase::Done,
        }
    }
}

impl SimDevice for SimDs1921 {
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
                if let Phase::Streaming { next } = self.phase {
                    self.queue_page(next, &[]);
                }
            }
            return out;
        }

        self.phase = match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Command => self.command(byte),
            Phase::Address { cmd, mut got } => {
                got.push(byte);
                let wanted = if cmd == COPY_SCRATCHPAD { 3 } else { 2 };
                if got.len() < wanted {
                    Phase::Address { cmd, got }
                } else {
                    let addr = (got[0] as usize | (got[1] as usize) << 8) % MEMORY;
                    match cmd {
                        WRITE_SCRATCHPAD => {
                            self.target = addr as u16;
                            self.ending = (addr & (PAGE - 1)) as u8;
                            Phase::WriteScratch {
                                pos: addr & (PAGE - 1),
                                seen: vec![cmd, got[0], got[1]],
                            }
                        }
                        COPY_SCRATCHPAD => {
                            self.copy_scratchpad(&got);
                            Phase::Done
                        }
                        _ => {
                            if addr == STOP {
                                self.memory[STATUS] &= !STATUS_MIP;
                            }
                            self.queue_page(addr, &[cmd, got[0], got[1]]);
                            return 0xFF;
                        }
                    }
                }
            }
            Phase::WriteScratch { pos, mut seen } => {
                self.scratch[pos] = byte;
                self.ending = pos as u8;
                seen.push(byte);
                if pos + 1 == PAGE {
                    self.tx.extend(crc16_trailer(0, &seen));
                    Phase::Done
                } else {
                    Phase::WriteScratch { pos: pos + 1, seen }
                }
            }
            other => other,
        };
        0xFF
    }
}
