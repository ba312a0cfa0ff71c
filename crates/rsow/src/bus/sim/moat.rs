use std::collections::{BTreeMap, VecDeque};

use num_traits::FromPrimitive;

use super::SimDevice;
use crate::crc::crc16_trailer;
use crate::devices::moat::{ConfigItem, Feature, READ_MOAT, WRITE_MOAT};
use crate::sn::SerialNumber;

#[derive(Debug)]
enum Phase {
    Command,
    Header { cmd: u8, got: Vec<u8> },
    WriteData { typ: u8, stype: u8, len: usize, data: Vec<u8> },
    AwaitAck { expect: [u8; 2], got: Vec<u8>, write: Option<(u8, u8, Vec<u8>)> },
    Done,
}

/// A MoaT microcontroller answering the F2/F4 sub-protocol from a table of
/// registers keyed by (type, subtype).
pub struct SimMoat {
    rom: SerialNumber,
    registers: BTreeMap<(u8, u8), Vec<u8>>,
    phase: Phase,
    tx: VecDeque<u8>,
}

fn bitmap(bits: &[usize], bytes: usize) -> Vec<u8> {
    let mut map = vec![0u8; bytes];
    for &b in bits {
        map[b >> 3] |= 1 << (b & 7);
    }
    map
}

impl SimMoat {
    /// Four ports, two PWM channels, two ADCs, two counters and a console.
    pub fn new(rom: SerialNumber) -> Self {
        let mut features = [0u8; Feature::COUNT];
        features[Feature::Console as usize] = 1;
        features[Feature::Port as usize] = 4;
        features[Feature::Adc as usize] = 2;
        features[Feature::Pwm as usize] = 2;
        features[Feature::Count as usize] = 2;

        let mut moat = SimMoat {
            rom,
            registers: BTreeMap::new(),
            phase: Phase::Command,
            tx: VecDeque::new(),
        };
        let config = Feature::Config as u8;
        moat.set_register(config, ConfigItem::Nums as u8, &features);
        moat.set_register(config, ConfigItem::Name as u8, b"rsow sim");
        moat.set_register(
            config,
            ConfigItem::List as u8,
            &bitmap(&[ConfigItem::Nums as usize, ConfigItem::Name as usize], 1),
        );
        moat.set_register(Feature::Alarm as u8, 0, &bitmap(&[Feature::Port as usize], 2));
        moat.set_register(Feature::Alarm as u8, Feature::Port as u8, &[0x02, 0, 0, 0]);
        moat.set_register(Feature::Port as u8, 0, &[0x00]);
        for n in 1..=4 {
            moat.set_register(Feature::Port as u8, n, &[0x00]);
        }
        for n in 1..=2 {
            moat.set_register(Feature::Pwm as u8, n, &[0; 7]);
            moat.set_register(Feature::Adc as u8, n, &[0, 0x12, 0x34, 0, 0, 0xFF, 0xFF]);
        }
        moat.set_register(Feature::Count as u8, 1, &[0, 0, 0, 42]);
        moat.set_register(Feature::Count as u8, 2, &[0, 0, 1, 0]);
        moat.set_register(Feature::Console as u8, 1, b"");
        moat
    }

    pub fn register(&self, typ: u8, stype: u8) -> Option<&[u8]> {
        self.registers.get(&(typ, stype)).map(Vec::as_slice)
    }

    pub fn set_register(&mut self, typ: u8, stype: u8, value: &[u8]) {
        self.registers.insert((typ, stype), value.to_vec());
    }

    /// Whether output port `n` (1-based) is driven.
    pub fn port(&self, n: u8) -> bool {
        self.register(Feature::Port as u8, n)
            .is_some_and(|r| r.first().is_some_and(|b| b & 0x80 != 0))
    }

    fn queue_read(&mut self, typ: u8, stype: u8) {
        let body = self.registers.get(&(typ, stype)).cloned().unwrap_or_default();
        let mut covered = vec![READ_MOAT, typ, stype, body.len() as u8];
        covered.extend_from_slice(&body);
        let trailer = crc16_trailer(0, &covered);
        self.tx.extend(covered[3..].iter().copied());
        self.tx.extend(trailer);
        self.phase = Phase::AwaitAck {
            expect: [!trailer[0], !trailer[1]],
            got: Vec::new(),
            write: None,
        };
    }

    fn apply_write(&mut self, typ: u8, stype: u8, data: Vec<u8>) {
        match Feature::from_u8(typ) {
            Some(Feature::Port) if !data.is_empty() => {
                let on = data[0] != 0;
                self.set_register(typ, stype, &[if on { 0x80 } else { 0x00 }]);
                let mut map = self.register(typ, 0).map(<[u8]>::to_vec).unwrap_or_default();
                let bit = stype.saturating_sub(1) as usize;
                if map.len() <= bit >> 3 {
                    map.resize((bit >> 3) + 1, 0);
                }
                if on {
                    map[bit >> 3] |= 1 << (bit & 7);
                } else {
                    map[bit >> 3] &= !(1 << (bit & 7));
                }
                self.set_register(typ, 0, &map);
            }
            Some(Feature::Pwm) | Some(Feature::Adc) if data.len() == 4 => {
                let mut reg = self.register(typ, stype).map(<[u8]>::to_vec).unwrap_or_default();
                reg.resize(7, 0);
                reg[3..7].copy_from_slice(&data);
                self.set_register(typ, stype, &reg);
            }
            _ => self.set_register(typ, stype, &data),
        }
    }
}

impl SimDevice for SimMoat {
    fn rom(&self) -> SerialNumber {
        self.rom
    }

    fn reset(&mut self) {
        self.phase = Phase::Command;
        self.tx.clear();
    }

    fn touch(&mut self, byte: u8) -> u8 {
        if let Some(out) = self.tx.pop_front() {
            return out;
        }

        self.phase = match std::mem::replace(&mut self.phase, Phase::Done) {
            Phase::Command if byte == READ_MOAT || byte == WRITE_MOAT => Phase::Header {
                cmd: byte,
                got: Vec::new(),
            },
            Phase::Command => Phase::Done,
            Phase::Header { cmd, mut got } => {
                got.push(byte);
                match (cmd, got.len()) {
                    (READ_MOAT, 2) => {
                        self.queue_read(got[0], got[1]);
                        return 0xFF;
                    }
                    (WRITE_MOAT, 3) => Phase::WriteData {
                        typ: got[0],
                        stype: got[1],
                        len: got[2] as usize,
                        data: Vec::new(),
                    },
                    _ => Phase::Header { cmd, got },
                }
            }
            Phase::WriteData { typ, stype, len, mut data } => {
                data.push(byte);
                if data.len() < len {
                    Phase::WriteData { typ, stype, len, data }
                } else {
                    let mut covered = vec![WRITE_MOAT, typ, stype, len as u8];
                    covered.extend_from_slice(&data);
                    let trailer = crc16_trailer(0, &covered);
                    self.tx.extend(trailer);
                    Phase::AwaitAck {
                        expect: [!trailer[0], !trailer[1]],
                        got: Vec::new(),
                        write: Some((typ, stype, data)),
                    }
                }
            }
            Phase::AwaitAck { expect, mut got, write } => {
                got.push(byte);
                if got.len() < 2 {
                    Phase::AwaitAck { expect, got, write }
                } else {
                    if got[..] == expect[..] {
                        if let Some((typ, stype, data)) = write {
                            self.apply_write(typ, stype, data);
                        }
                    }
                    Phase::Done
                }
            }
            other => other,
        };
        0xFF
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::SimBus;
    use crate::bus::Bus;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn write_needs_the_ack() {
        let sn = SerialNumber::new(0xF0, [1, 0, 0, 0, 0, 0]);
        let chip = Arc::new(Mutex::new(SimMoat::new(sn)));
        let mut bus = SimBus::new().with(chip.clone());
        let port = Feature::Port as u8;

        // no acknowledgement: the write is dropped
        bus.select(&sn).await.unwrap();
        bus.touch(&[WRITE_MOAT, port, 2, 1, 1, 0xFF, 0xFF]).await.unwrap();
        bus.touch(&[0x00, 0x00]).await.unwrap();
        assert!(!chip.lock().unwrap().port(2));

        bus.select(&sn).await.unwrap();
        let echo = bus.touch(&[WRITE_MOAT, port, 2, 1, 1, 0xFF, 0xFF]).await.unwrap();
        bus.touch(&[!echo[5], !echo[6]]).await.unwrap();
        assert!(chip.lock().unwrap().port(2));
        assert_eq!(chip.lock().unwrap().register(port, 0), Some(&[0x02][..]));
    }
}
