//! Property descriptors.
//!
//! Every readable or writable file below a device is a static [`Property`].
//! Reading and writing go through a closed set of capabilities ([`Read`],
//! [`Write`]) so the filesystem layer can tell a per-element reader from one
//! that returns the whole array, and a typed value from a raw memory block.

use std::sync::Arc;

use bitflags::bitflags;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::bus::BusMaster;
use crate::cache::TtlCache;
use crate::error::errno::*;
use crate::message::SemiGlobal;
use crate::path::Extension;
use crate::sn::SerialNumber;
use crate::transaction::{Transcript, TransactionLog};
use crate::utils::Result;

/// Formatted lengths of the scalar formats
pub const LEN_YESNO: usize = 1;
pub const LEN_UNSIGNED: usize = 12;
pub const LEN_INTEGER: usize = 12;
pub const LEN_FLOAT: usize = 12;
pub const LEN_TEMP: usize = 12;
pub const LEN_DATE: usize = 24;

/// A typed property value. Temperatures are always Celsius here; the session
/// scale is applied when formatting.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Yesno(bool),
    Unsigned(u32),
    Integer(i32),
    Float(f64),
    Temperature(f64),
    TempGap(f64),
    Date(DateTime<Utc>),
    Ascii(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn as_bool(&self) -> Result<bool> {
        match *self {
            Value::Yesno(b) => Ok(b),
            Value::Unsigned(u) => Ok(u != 0),
            _ => Err(EINVAL.into()),
        }
    }

    pub fn as_u32(&self) -> Result<u32> {
        match *self {
            Value::Unsigned(u) => Ok(u),
            Value::Yesno(b) => Ok(b as u32),
            Value::Integer(i) if i >= 0 => Ok(i as u32),
            _ => Err(EINVAL.into()),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match *self {
            Value::Float(f) | Value::Temperature(f) | Value::TempGap(f) => Ok(f),
            Value::Unsigned(u) => Ok(u as f64),
            Value::Integer(i) => Ok(i as f64),
            _ => Err(EINVAL.into()),
        }
    }

    pub fn as_date(&self) -> Result<DateTime<Utc>> {
        match *self {
            Value::Date(d) => Ok(d),
            Value::Unsigned(u) => DateTime::from_timestamp(u as i64, 0).ok_or_else(|| EINVAL.into()),
            _ => Err(EINVAL.into()),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    Yesno,
    Unsigned,
    Integer,
    Float,
    Temperature,
    TempGap,
    Date,
    Ascii,
    Binary,
}

/// How long a read value may be served from the value cache.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CacheClass {
    Volatile,
    Stable,
    Static,
    Second,
    Uncached,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Length {
    Subdir,
    Bytes(usize),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Index {
    Numbers,
    Letters,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Layout {
    /// One read or write per element
    Separate,
    /// A single element or the whole array, by separate callbacks
    Mixed,
    /// The whole array at once, split in software
    Aggregate,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Aggregate {
    pub elements: usize,
    pub index: Index,
    pub layout: Layout,
}

impl Aggregate {
    pub const fn numbers(elements: usize, layout: Layout) -> Self {
        Aggregate {
            elements,
            index: Index::Numbers,
            layout,
        }
    }

    /// Name of element `i`: `3` or `D`.
    pub fn element_name(&self, i: usize) -> String {
        match self.index {
            Index::Numbers => i.to_string(),
            Index::Letters => ((b'A' + i as u8) as char).to_string(),
        }
    }
}

/// Opaque per-property data handed to the callbacks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Data {
    None,
    /// A register address
    Addr(u16),
    /// One bit of a register, optionally read inverted
    Bit { addr: u16, bit: u8, inverted: bool },
    /// A device-defined type code
    Type(u8),
}

pub type ScalarRead = for<'a> fn(&'a Query) -> BoxFuture<'a, Result<Value>>;
pub type ArrayRead = for<'a> fn(&'a Query) -> BoxFuture<'a, Result<Vec<Value>>>;
/// Raw bytes of a block property, given size and offset.
pub type BlockRead = for<'a> fn(&'a Query, usize, usize) -> BoxFuture<'a, Result<Vec<u8>>>;
pub type ScalarWrite = for<'a> fn(&'a Query, Value) -> BoxFuture<'a, Result<()>>;
/// Raw bytes into a block property at an offset.
pub type BlockWrite = for<'a> fn(&'a Query, Vec<u8>, usize) -> BoxFuture<'a, Result<()>>;
pub type VisibleFn = for<'a> fn(&'a Query) -> BoxFuture<'a, bool>;

#[derive(Copy, Clone)]
pub enum Read {
    None,
    Scalar(ScalarRead),
    Array(ArrayRead),
    Mixed { one: ScalarRead, all: ArrayRead },
    Block(BlockRead),
}

#[derive(Copy, Clone)]
pub enum Write {
    None,
    Scalar(ScalarWrite),
    Block(BlockWrite),
}

/// A static property table entry.
pub struct Property {
    /// Path below the device, `/` separated for subdirectory members
    pub name: &'static str,
    pub len: Length,
    pub format: Format,
    pub cache: CacheClass,
    pub aggregate: Option<Aggregate>,
    pub read: Read,
    pub write: Write,
    pub visible: Option<VisibleFn>,
    pub data: Data,
}

impl Property {
    pub const fn subdir(name: &'static str) -> Self {
        Property {
            name,
            len: Length::Subdir,
            format: Format::Ascii,
            cache: CacheClass::Uncached,
            aggregate: None,
            read: Read::None,
            write: Write::None,
            visible: None,
            data: Data::None,
        }
    }

    pub const fn leaf(name: &'static str, len: usize, format: Format, cache: CacheClass) -> Self {
        Property {
            name,
            len: Length::Bytes(len),
            format,
            cache,
            aggregate: None,
            read: Read::None,
            write: Write::None,
            visible: None,
            data: Data::None,
        }
    }

    pub const fn read(mut self, read: Read) -> Self {
        self.read = read;
        self
    }

    pub const fn write(mut self, write: Write) -> Self {
        self.write = write;
        self
    }

    pub const fn aggregate(mut self, aggregate: Aggregate) -> Self {
        self.aggregate = Some(aggregate);
        self
    }

    pub const fn visible(mut self, visible: VisibleFn) -> Self {
        self.visible = Some(visible);
        self
    }

    pub const fn data(mut self, data: Data) -> Self {
        self.data = data;
        self
    }

    pub fn is_subdir(&self) -> bool {
        self.len == Length::Subdir
    }

    /// Formatted length of one element.
    pub fn element_len(&self) -> usize {
        match self.len {
            Length::Subdir => 0,
            Length::Bytes(n) => n,
        }
    }

    /// Directory containing this property, `None` at device level.
    pub fn parent(&self) -> Option<&'static str> {
        self.name.rsplit_once('/').map(|(dir, _)| dir)
    }

    /// Last path component.
    pub fn basename(&self) -> &'static str {
        self.name.rsplit_once('/').map_or(self.name, |(_, base)| base)
    }

    pub fn readable(&self) -> bool {
        !matches!(self.read, Read::None)
    }

    pub fn writable(&self) -> bool {
        !matches!(self.write, Write::None)
    }
}

impl std::fmt::Debug for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("format", &self.format)
            .field("aggregate", &self.aggregate)
            .finish_non_exhaustive()
    }
}

bitflags! {
    /// Family capabilities reported in the flags of a directory listing.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct DevFlags: u32 {
        const ALARM     = 0x0001;
        const RESUME    = 0x0002;
        const OVDR      = 0x0004;
        const CHAIN     = 0x2000;
        const VOLT      = 0x4000;
        const TEMP      = 0x8000;
    }
}

/// A chip family: its code, name and property table.
pub struct Family {
    pub code: u8,
    pub name: &'static str,
    pub flags: DevFlags,
    pub properties: &'static [Property],
}

impl Family {
    pub fn property(&self, name: &str) -> Option<&'static Property> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Internal per-device cache key: device and what is stored.
pub type InternalKey = (SerialNumber, &'static str);

/// One device reached through one bus leg.
#[derive(Clone)]
pub struct Device {
    pub sn: SerialNumber,
    pub bus: Arc<BusMaster>,
    pub internal: Arc<TtlCache<InternalKey, Vec<u8>>>,
}

/// Everything a property callback gets to see.
#[derive(Clone)]
pub struct Query {
    pub dev: Device,
    pub property: &'static Property,
    pub extension: Extension,
    pub sg: SemiGlobal,
}

impl Query {
    pub fn sn(&self) -> &SerialNumber {
        &self.dev.sn
    }

    /// The selected element, `EINVAL` for `ALL` or a scalar.
    pub fn index(&self) -> Result<usize> {
        match self.extension {
            Extension::Index(i) => Ok(i),
            _ => Err(EINVAL.into()),
        }
    }

    /// The same query narrowed to one element.
    pub fn element(&self, i: usize) -> Query {
        Query {
            extension: Extension::Index(i),
            ..self.clone()
        }
    }

    pub async fn transaction(&self, log: &TransactionLog) -> Result<Transcript> {
        self.dev.bus.transaction(&self.dev.sn, log).await
    }

    /// Read a value kept in the per-device internal cache.
    pub fn cached(&self, tag: &'static str) -> Option<Vec<u8>> {
        self.dev.internal.get(&(self.dev.sn, tag))
    }

    pub fn cache(&self, tag: &'static str, value: Vec<u8>) {
        self.dev.internal.insert((self.dev.sn, tag), value)
    }
}
