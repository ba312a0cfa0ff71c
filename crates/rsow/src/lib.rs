#![forbid(unsafe_code)]
//! 1-Wire filesystem library speaking the owserver protocol.
//!
//! This crate exposes 1-Wire and iButton devices as a tree of typed
//! properties and serves that tree over the owserver protocol, so the bus
//! hardware can live on one host while consumers run elsewhere.
//!
//! # Overview
//!
//! Requests name a property by path:
//!
//! ```text
//! /[uncached/][bus.N/][<family>.<id>[/<property>[.<index>|.ALL]]]
//! ```
//!
//! The server parses the path, finds the bus the device is on, and calls the
//! property's reader or writer. Those are small device programs built from
//! [`transaction::TransactionLog`]s: ordered bus steps (match bytes, read,
//! CRC check, program pulse) run atomically under the lock of one bus.
//!
//! # Getting Started
//!
//! 1. Build an [`owfs::OwFs`] from one or more bus legs: a local [`bus::Bus`]
//!    (the simulated one in [`bus::sim`] ships with the crate) or a remote
//!    owserver reached through a [`client::Client`]
//! 2. Serve it with [`srv::srv_async`]
//!
//! ```no_run
//! use rsow::{bus::sim::{simulated, SimBus}, owfs::{OwFs, Settings}, srv::srv_async, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let sn = "21.AABBCCDD0000".parse()?;
//!     let bus = SimBus::new().with(simulated(sn));
//!     let fs = OwFs::builder(Settings::default()).local(Box::new(bus)).build();
//!     srv_async(fs, "tcp!127.0.0.1!4304").await
//! }
//! ```
//!
//! # Protocol Details
//!
//! Each connection carries one request. Both directions use a header of five
//! big-endian 32-bit words followed by `payload` bytes:
//!
//! - Request: `payload, size, type, sg, offset`, then `path\0[data]`
//! - Response: `payload, size, ret, sg, offset`, then the result bytes
//!
//! A negative `ret` is an errno. A directory listing answers with one
//! response per entry and ends with a zero payload response whose `offset`
//! carries the device flags.
//!
//! # Error Handling
//!
//! Return errors using the [`error::Error`] type. The server converts them to
//! a negative `ret` carrying the errno.
//!
//! Common error codes:
//! - `ENOENT` - No such device or property
//! - `EINVAL` / `ERANGE` - The written value makes no sense for the property
//! - `EBUSY` - Refused while a mission is running
//! - `EIO` - The device did not answer correctly, even after retries
//! - `EBADMSG` / `EMSGSIZE` - Malformed request
//!
//! # Transport
//!
//! - **TCP**: `"tcp!host!port"`, `"host:port"` or a bare port
//! - **Unix Domain Sockets**: `"unix!path!suffix"` (e.g., `"unix!/tmp/owserver!0"`)
#[macro_use]
pub mod utils;

pub mod bus;
pub mod cache;
pub mod client;
pub mod crc;
pub mod date;
pub mod devices;
pub mod error;
pub mod filetype;
pub mod format;
pub mod message;
pub mod owfs;
pub mod path;
pub mod serialize;
pub mod sn;
pub mod srv;
pub mod stats;
pub mod transaction;

pub use crate::error::errno;
pub use crate::error::Error;
pub use crate::message::*;
pub use crate::sn::SerialNumber;
pub use crate::utils::Result;
