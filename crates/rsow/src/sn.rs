//! 1-Wire ROM codes.

use std::fmt;
use std::str::FromStr;

use crate::crc::crc8;
use crate::error::{Errno, Error};
use crate::message::DeviceFormat;

/// The 8-byte ROM code of a device: family, six id bytes, CRC8.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialNumber(pub [u8; 8]);

impl SerialNumber {
    /// Build a ROM code from family and id, computing the CRC.
    pub fn new(family: u8, id: [u8; 6]) -> Self {
        let mut rom = [0u8; 8];
        rom[0] = family;
        rom[1..7].copy_from_slice(&id);
        rom[7] = crc8(0, &rom[..7]);
        SerialNumber(rom)
    }

    pub fn family(&self) -> u8 {
        self.0[0]
    }

    pub fn bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        crc8(0, &self.0) == 0
    }

    /// Render as a path component in the requested format.
    pub fn display(&self, format: DeviceFormat) -> String {
        let f = format!("{:02X}", self.0[0]);
        let i: String = self.0[1..7].iter().map(|b| format!("{:02X}", b)).collect();
        let c = format!("{:02X}", self.0[7]);
        match format {
            DeviceFormat::Fdi => format!("{}.{}", f, i),
            DeviceFormat::Fi => format!("{}{}", f, i),
            DeviceFormat::Fdidc => format!("{}.{}.{}", f, i, c),
            DeviceFormat::Fdic => format!("{}.{}{}", f, i, c),
            DeviceFormat::Fidc => format!("{}{}.{}", f, i, c),
            DeviceFormat::Fic => format!("{}{}{}", f, i, c),
        }
    }

    /// Parse a path component, `None` if it does not look like a ROM code.
    ///
    /// A wrong CRC is reported separately by `FromStr`.
    fn parse_digits(s: &str) -> Option<(Vec<u8>, Option<u8>)> {
        let digits: String = s.chars().filter(|&c| c != '.').collect();
        let dots = s.len() - digits.len();
        if dots > 2 || !(digits.len() == 14 || digits.len() == 16) {
            return None;
        }
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let bytes = (0..digits.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&digits[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .ok()?;
        let crc = if bytes.len() == 8 { Some(bytes[7]) } else { None };
        Some((bytes[..7].to_vec(), crc))
    }

    /// Whether `s` has the shape of a ROM code (used to tell devices from
    /// other path components).
    pub fn looks_like(s: &str) -> bool {
        Self::parse_digits(s).is_some()
    }
}

impl FromStr for SerialNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, crc) = Self::parse_digits(s).ok_or(Error::No(Errno::EINVAL))?;
        let mut id = [0u8; 6];
        id.copy_from_slice(&head[1..7]);
        let sn = SerialNumber::new(head[0], id);
        match crc {
            Some(c) if c != sn.0[7] => Err(Error::No(Errno::ENOENT)),
            _ => Ok(sn),
        }
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.display(DeviceFormat::Fdi))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_rom_crc() {
        let sn = SerialNumber::new(0x02, [0x1C, 0xB8, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(sn.0[7], 0xA2);
        assert!(sn.is_valid());
    }

    #[test]
    fn parse_forms() {
        let sn: SerialNumber = "21.AABBCCDD0000".parse().unwrap();
        assert_eq!(sn.family(), 0x21);
        assert_eq!(&sn.0[1..7], &[0xAA, 0xBB, 0xCC, 0xDD, 0x00, 0x00]);

        let full = sn.display(DeviceFormat::Fdidc);
        assert_eq!(full.parse::<SerialNumber>().unwrap(), sn);
        assert_eq!("21aabbccdd0000".parse::<SerialNumber>().unwrap(), sn);
        assert_eq!(sn.display(DeviceFormat::Fi), "21AABBCCDD0000");
    }

    #[test]
    fn wrong_crc_is_not_found() {
        let sn: SerialNumber = "21.AABBCCDD0000".parse().unwrap();
        let bad = format!("21.AABBCCDD0000.{:02X}", sn.0[7] ^ 1);
        assert_eq!(bad.parse::<SerialNumber>().unwrap_err().errno(), Errno::ENOENT);
    }

    #[test]
    fn not_a_device() {
        assert!(!SerialNumber::looks_like("bus.0"));
        assert!(!SerialNumber::looks_like("temperature"));
        assert!(!SerialNumber::looks_like("21.AABB"));
        assert!(SerialNumber::looks_like("F0.010203040506"));
    }
}
