//! owserver protocol data types and constants.
//!
//! Every message is a fixed header of five 32-bit words in network byte
//! order followed by `payload` bytes. Requests carry `path\0[data]`,
//! responses carry result bytes.

use bitflags::bitflags;
use enum_primitive::*;

use crate::error::{Errno, Error};

/// Default owserver TCP port
pub const DEFAULT_PORT: u16 = 4304;

/// Size of both the request and the response header
pub const HEADER_LEN: usize = 20;

/// Largest payload accepted from a peer
pub const MAX_PAYLOAD: u32 = 65000;

/// Longest directory entry name below its parent
pub const MAX_ENTRY_NAME: usize = 64;

enum_from_primitive! {
    #[doc = "Request type, owserver operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum MsgType {
        Nop         = 0,
        Read        = 1,
        Write       = 2,
        Dir         = 3,
        Size        = 4,
        Presence    = 5,
    }
}

impl MsgType {
    /// Whether the request payload must hold a null terminated path
    pub fn needs_path(self) -> bool {
        !matches!(self, MsgType::Nop)
    }
}

enum_from_primitive! {
    #[doc = "Temperature scale selected by the session flags"]
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub enum TemperatureScale {
        #[default]
        Celsius     = 0,
        Fahrenheit  = 1,
        Kelvin      = 2,
        Rankine     = 3,
    }
}

impl TemperatureScale {
    /// Convert a Celsius temperature into this scale.
    pub fn from_celsius(self, c: f64) -> f64 {
        match self {
            TemperatureScale::Celsius => c,
            TemperatureScale::Fahrenheit => c * 1.8 + 32.0,
            TemperatureScale::Kelvin => c + 273.15,
            TemperatureScale::Rankine => (c + 273.15) * 1.8,
        }
    }

    /// Convert a temperature in this scale back into Celsius.
    pub fn to_celsius(self, t: f64) -> f64 {
        match self {
            TemperatureScale::Celsius => t,
            TemperatureScale::Fahrenheit => (t - 32.0) / 1.8,
            TemperatureScale::Kelvin => t - 273.15,
            TemperatureScale::Rankine => t / 1.8 - 273.15,
        }
    }

    /// Convert a Celsius temperature difference into this scale.
    pub fn gap_from_celsius(self, c: f64) -> f64 {
        match self {
            TemperatureScale::Celsius | TemperatureScale::Kelvin => c,
            TemperatureScale::Fahrenheit | TemperatureScale::Rankine => c * 1.8,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "C" | "CELSIUS" => Some(TemperatureScale::Celsius),
            "F" | "FAHRENHEIT" => Some(TemperatureScale::Fahrenheit),
            "K" | "KELVIN" => Some(TemperatureScale::Kelvin),
            "R" | "RANKINE" => Some(TemperatureScale::Rankine),
            _ => None,
        }
    }
}

enum_from_primitive! {
    #[doc = "How device serial numbers are spelled in paths and listings"]
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub enum DeviceFormat {
        #[default]
        Fdi     = 0,
        Fi      = 1,
        Fdidc   = 2,
        Fdic    = 3,
        Fidc    = 4,
        Fic     = 5,
    }
}

impl DeviceFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fdi" | "f.i" => Some(DeviceFormat::Fdi),
            "fi" => Some(DeviceFormat::Fi),
            "fdidc" | "f.i.c" => Some(DeviceFormat::Fdidc),
            "fdic" | "f.ic" => Some(DeviceFormat::Fdic),
            "fidc" | "fi.c" => Some(DeviceFormat::Fidc),
            "fic" => Some(DeviceFormat::Fic),
            _ => None,
        }
    }
}

bitflags! {
    /// Session flags carried in every message.
    ///
    /// Bits 16..24 hold the temperature scale and bits 24..32 the device
    /// display format; see the accessors.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct SemiGlobal: u32 {
        #[doc = "Ask the server to include bus entries in listings"]
        const BUSRET        = 1 << 1;
        #[doc = "Client would like to keep the connection (echoed only)"]
        const PERSISTENT    = 1 << 2;
        #[doc = "Temperature scale field"]
        const TEMPSCALE     = 0x00FF_0000;
        #[doc = "Device format field"]
        const DEVFORMAT     = 0xFF00_0000;

        const _ = !0;
    }
}

impl SemiGlobal {
    pub fn temperature_scale(self) -> TemperatureScale {
        TemperatureScale::from_u32((self.bits() >> 16) & 0xFF).unwrap_or_default()
    }

    pub fn with_temperature_scale(self, scale: TemperatureScale) -> Self {
        let bits = (self.bits() & !Self::TEMPSCALE.bits()) | ((scale as u32) << 16);
        Self::from_bits_retain(bits)
    }

    pub fn device_format(self) -> DeviceFormat {
        DeviceFormat::from_u32(self.bits() >> 24).unwrap_or_default()
    }

    pub fn with_device_format(self, format: DeviceFormat) -> Self {
        let bits = (self.bits() & !Self::DEVFORMAT.bits()) | ((format as u32) << 24);
        Self::from_bits_retain(bits)
    }
}

/// Request header, sent client to server.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestHeader {
    /// Number of payload bytes following the header
    pub payload: u32,
    /// Requested read size, or length of the write data
    pub size: u32,
    /// Raw message type, see [`MsgType`]
    pub typ: u32,
    pub sg: SemiGlobal,
    pub offset: u32,
}

impl RequestHeader {
    pub fn msg_type(&self) -> Option<MsgType> {
        MsgType::from_u32(self.typ)
    }
}

/// Response header, sent server to client.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    pub payload: u32,
    pub size: u32,
    /// Negative errno on failure, zero or a length on success
    pub ret: i32,
    pub sg: SemiGlobal,
    pub offset: u32,
}

/// A complete request: header and owned payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
    pub header: RequestHeader,
    pub payload: Vec<u8>,
}

impl Request {
    /// Build a request for `path` with optional write data.
    pub fn new(typ: MsgType, path: &str, data: &[u8], size: u32, offset: u32, sg: SemiGlobal) -> Self {
        let mut payload = Vec::with_capacity(path.len() + 1 + data.len());
        payload.extend_from_slice(path.as_bytes());
        payload.push(0);
        payload.extend_from_slice(data);

        Request {
            header: RequestHeader {
                payload: payload.len() as u32,
                size,
                typ: typ as u32,
                sg,
                offset,
            },
            payload,
        }
    }

    pub fn nop(sg: SemiGlobal) -> Self {
        Request {
            header: RequestHeader {
                typ: MsgType::Nop as u32,
                sg,
                ..Default::default()
            },
            payload: Vec::new(),
        }
    }

    fn terminator(&self) -> Option<usize> {
        self.payload.iter().position(|&b| b == 0)
    }

    /// The target path; a payload without a terminating null is malformed.
    pub fn path(&self) -> Result<&str, Error> {
        let end = self.terminator().ok_or(Error::No(Errno::EBADMSG))?;
        std::str::from_utf8(&self.payload[..end]).map_err(|_| Error::No(Errno::EBADMSG))
    }

    /// Write data following the path terminator.
    pub fn data(&self) -> &[u8] {
        match self.terminator() {
            Some(end) => &self.payload[end + 1..],
            None => &[],
        }
    }
}

/// A complete response: header and owned payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    pub header: ResponseHeader,
    pub data: Vec<u8>,
}

impl Response {
    /// Successful response carrying `data`; `ret` is the data length.
    pub fn with_data(data: Vec<u8>, sg: SemiGlobal, offset: u32) -> Self {
        Response {
            header: ResponseHeader {
                payload: data.len() as u32,
                size: data.len() as u32,
                ret: data.len() as i32,
                sg,
                offset,
            },
            data,
        }
    }

    /// Payload-free response with a return code.
    pub fn ret(ret: i32, sg: SemiGlobal) -> Self {
        Response {
            header: ResponseHeader {
                ret,
                sg,
                ..Default::default()
            },
            data: Vec::new(),
        }
    }

    pub fn error(e: &Error, sg: SemiGlobal) -> Self {
        Self::ret(-(e.errno() as i32), sg)
    }

    /// A zero payload, non-negative response: no data, or end of a listing.
    pub fn is_terminator(&self) -> bool {
        self.header.payload == 0 && self.header.ret >= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_path_and_data() {
        let req = Request::new(MsgType::Write, "/21.AABBCCDD0000/mission/delay", b"15", 2, 0, SemiGlobal::empty());
        assert_eq!(req.path().unwrap(), "/21.AABBCCDD0000/mission/delay");
        assert_eq!(req.data(), b"15");
        assert_eq!(req.header.payload as usize, req.payload.len());
    }

    #[test]
    fn unterminated_path_is_bad_message() {
        let req = Request {
            header: RequestHeader {
                payload: 3,
                typ: MsgType::Read as u32,
                ..Default::default()
            },
            payload: b"/10".to_vec(),
        };
        assert_eq!(req.path().unwrap_err().errno(), Errno::EBADMSG);
    }

    #[test]
    fn session_flag_fields() {
        let sg = SemiGlobal::BUSRET
            .with_temperature_scale(TemperatureScale::Kelvin)
            .with_device_format(DeviceFormat::Fic);
        assert_eq!(sg.temperature_scale(), TemperatureScale::Kelvin);
        assert_eq!(sg.device_format(), DeviceFormat::Fic);
        assert!(sg.contains(SemiGlobal::BUSRET));
        assert_eq!(sg.bits(), 0x0502_0002);
    }

    #[test]
    fn scale_conversions() {
        let f = TemperatureScale::Fahrenheit;
        assert!((f.from_celsius(100.0) - 212.0).abs() < 1e-9);
        assert!((f.to_celsius(212.0) - 100.0).abs() < 1e-9);
        assert!((TemperatureScale::Rankine.gap_from_celsius(0.5) - 0.9).abs() < 1e-9);
    }

    #[test]
    fn empty_success_is_terminator() {
        assert!(Response::ret(0, SemiGlobal::empty()).is_terminator());
        assert!(!Response::ret(-5, SemiGlobal::empty()).is_terminator());
    }
}
