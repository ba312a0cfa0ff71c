//! 1-Wire checksums.
//!
//! CRC8 is the Dallas/Maxim polynomial x^8 + x^5 + x^4 + 1 used for ROM codes
//! and short commands. CRC16 is the reflected 0xA001 polynomial the memory
//! chips append, inverted and least significant byte first, to block transfers.

/// Running CRC16 value over data followed by its inverted checksum.
pub const CRC16_RESIDUE: u16 = 0xB001;

/// Continue a CRC8 computation from `seed`.
pub fn crc8(seed: u8, bytes: &[u8]) -> u8 {
    bytes.iter().fold(seed, |crc, &b| {
        let mut crc = crc ^ b;
        for _ in 0..8 {
            crc = if crc & 0x01 != 0 { (crc >> 1) ^ 0x8C } else { crc >> 1 };
        }
        crc
    })
}

/// Continue a CRC16 computation from `seed`.
pub fn crc16(seed: u16, bytes: &[u8]) -> u16 {
    bytes.iter().fold(seed, |crc, &b| {
        let mut crc = crc ^ b as u16;
        for _ in 0..8 {
            crc = if crc & 0x0001 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
        }
        crc
    })
}

/// True when `bytes` ends with a CRC8 byte matching everything before it.
pub fn crc8_valid(seed: u8, bytes: &[u8]) -> bool {
    !bytes.is_empty() && crc8(seed, bytes) == 0
}

/// True when `bytes` ends with the two inverted CRC16 bytes of everything
/// before it.
pub fn crc16_valid(seed: u16, bytes: &[u8]) -> bool {
    bytes.len() >= 2 && crc16(seed, bytes) == CRC16_RESIDUE
}

/// The two bytes a device appends after `bytes`: the inverted CRC16, LSB first.
pub fn crc16_trailer(seed: u16, bytes: &[u8]) -> [u8; 2] {
    let crc = !crc16(seed, bytes);
    [(crc & 0xFF) as u8, (crc >> 8) as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROM: [u8; 8] = [0x02, 0x1C, 0xB8, 0x01, 0x00, 0x00, 0x00, 0xA2];

    #[test]
    fn crc8_known_rom() {
        assert_eq!(crc8(0, &ROM[..7]), 0xA2);
        assert!(crc8_valid(0, &ROM));
    }

    #[test]
    fn crc16_check_value() {
        assert_eq!(crc16(0, b"123456789"), 0xBB3D);
    }

    #[test]
    fn crc16_trailer_validates() {
        let mut frame = vec![0xA5, 0x00, 0x02, 0x11, 0x22, 0x33];
        let trailer = crc16_trailer(0, &frame);
        frame.extend_from_slice(&trailer);
        assert!(crc16_valid(0, &frame));
    }

    #[test]
    fn seeded_crc16_continues_a_computation() {
        let head = [0xF2u8, 0x03, 0x01, 0x02];
        let body = [0x80u8, 0x00];
        let seed = crc16(0, &head);
        let mut tail = body.to_vec();
        tail.extend_from_slice(&crc16_trailer(seed, &body));
        assert!(crc16_valid(seed, &tail));
        assert!(!crc16_valid(0, &tail));
    }

    #[test]
    fn any_flipped_byte_fails() {
        let mut frame = vec![0x0F, 0x20, 0x00, 0xDE, 0xAD, 0xBE, 0xEF];
        frame.extend_from_slice(&crc16_trailer(0, &frame));
        for i in 0..frame.len() {
            let mut bad = frame.clone();
            bad[i] ^= 0x01;
            assert!(!crc16_valid(0, &bad), "crc16 byte {}", i);
        }
        for i in 0..ROM.len() {
            let mut bad = ROM;
            bad[i] ^= 0x40;
            assert!(!crc8_valid(0, &bad), "crc8 byte {}", i);
        }
    }
}
