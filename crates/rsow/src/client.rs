//! owserver session client.
//!
//! Every operation opens a fresh connection, sends one request and reads one
//! response, or for a listing, responses up to the zero payload terminator.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::sink::SinkExt;
use log::{debug, trace};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{Errno, Error};
use crate::message::*;
use crate::serialize;
use crate::utils::{self, Result};
use crate::io_err;

trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp!{}", addr),
            Endpoint::Unix(path) => write!(f, "unix!{}", path.display()),
        }
    }
}

/// One request/response exchange over its own connection.
struct Session {
    framed: Framed<Box<dyn Transport>, LengthDelimitedCodec>,
}

impl Session {
    async fn send(&mut self, request: &Request) -> Result<()> {
        trace!("\t→ {:?}", request.header);
        self.framed.send(serialize::to_frame(request)?).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Response> {
        let bytes = self
            .framed
            .next()
            .await
            .ok_or_else(|| io_err!(UnexpectedEof, "Server closed the connection"))??;
        let response = serialize::response_from_frame(bytes.freeze())?;
        trace!("\t← {:?}", response.header);
        Ok(response)
    }
}

/// A negative return code becomes the error; its payload is not trusted.
fn checked(response: Response) -> Result<Response> {
    if response.header.ret < 0 {
        return Err(Error::No(Errno::from_raw(-response.header.ret)));
    }
    Ok(response)
}

/// Entry path in a listing response: the payload up to any null padding.
fn entry_name(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Client for a remote owserver.
#[derive(Clone, Debug)]
pub struct Client {
    endpoint: Endpoint,
    sg: Arc<AtomicU32>,
}

impl Client {
    /// `addr` is `host:port`, a bare port, `tcp!host!port` or `unix!path!_`.
    pub fn new(addr: &str) -> Result<Self> {
        let endpoint = match utils::parse_proto(addr) {
            Some(("tcp", addr)) => Endpoint::Tcp(addr.replace("0.0.0.0:", "127.0.0.1:")),
            Some(("unix", path)) => Endpoint::Unix(path.into()),
            _ => return Err(io_err!(InvalidInput, "Invalid protocol or address").into()),
        };
        Ok(Client {
            endpoint,
            sg: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn with_flags(self, sg: SemiGlobal) -> Self {
        self.set_flags(sg);
        self
    }

    /// Session flags sent with every request.
    pub fn flags(&self) -> SemiGlobal {
        SemiGlobal::from_bits_retain(self.sg.load(Ordering::Relaxed))
    }

    pub fn set_flags(&self, sg: SemiGlobal) {
        self.sg.store(sg.bits(), Ordering::Relaxed)
    }

    /// A client to the same server with its own flags, for forwarding a
    /// request on behalf of someone else.
    pub fn for_session(&self, sg: SemiGlobal) -> Client {
        Client {
            endpoint: self.endpoint.clone(),
            sg: Arc::new(AtomicU32::new(sg.bits())),
        }
    }

    async fn connect(&self) -> Result<Session> {
        debug!("connecting to {}", self.endpoint);
        let stream: Box<dyn Transport> = match self.endpoint {
            Endpoint::Tcp(ref addr) => Box::new(TcpStream::connect(addr.as_str()).await?),
            Endpoint::Unix(ref path) => Box::new(UnixStream::connect(path).await?),
        };
        Ok(Session {
            framed: Framed::new(stream, serialize::frame_codec()),
        })
    }

    /// Send one request and read its single response.
    async fn call(&self, request: Request) -> Result<Response> {
        let mut session = self.connect().await?;
        session.send(&request).await?;
        checked(session.recv().await?)
    }

    pub async fn nop(&self) -> Result<()> {
        self.call(Request::nop(self.flags())).await.map(|_| ())
    }

    /// Formatted length of the property at `path`.
    pub async fn size(&self, path: &str) -> Result<usize> {
        let request = Request::new(MsgType::Size, path, &[], 0, 0, self.flags());
        Ok(self.call(request).await?.header.ret as usize)
    }

    /// Read at most `size` bytes of `path` from `offset`.
    pub async fn read(&self, path: &str, size: usize, offset: usize) -> Result<Vec<u8>> {
        let request = Request::new(MsgType::Read, path, &[], size as u32, offset as u32, self.flags());
        let mut data = self.call(request).await?.data;
        data.truncate(size);
        Ok(data)
    }

    /// Write `data` to `path` at `offset`, returning the length taken.
    pub async fn write(&self, path: &str, data: &[u8], offset: usize) -> Result<usize> {
        let sg = self.flags();
        let request = Request::new(MsgType::Write, path, data, data.len() as u32, offset as u32, sg);
        let response = self.call(request).await?;
        if response.header.sg != sg {
            debug!("{}: session flags now {:#010x}", self.endpoint, response.header.sg.bits());
            self.set_flags(response.header.sg);
        }
        Ok(response.header.ret as usize)
    }

    /// Bus index the device named by `path` answers on.
    pub async fn presence(&self, path: &str) -> Result<usize> {
        let request = Request::new(MsgType::Presence, path, &[], 0, 0, self.flags());
        Ok(self.call(request).await?.header.ret as usize)
    }

    /// List `path`, handing each entry to `each` as it arrives. Returns the
    /// device flags carried by the terminator.
    pub async fn dir<F>(&self, path: &str, mut each: F) -> Result<u32>
    where
        F: FnMut(String),
    {
        let mut session = self.connect().await?;
        session
            .send(&Request::new(MsgType::Dir, path, &[], 0, 0, self.flags()))
            .await?;
        loop {
            let response = checked(session.recv().await?)?;
            if response.header.payload == 0 {
                return Ok(response.header.offset);
            }
            each(entry_name(&response.data));
        }
    }

    /// Convenience form of [`Client::dir`] collecting the entries.
    pub async fn dir_all(&self, path: &str) -> Result<(Vec<String>, u32)> {
        let mut entries = Vec::new();
        let flags = self.dir(path, |e| entries.push(e)).await?;
        Ok((entries, flags))
    }
}

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.endpoint.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_forms() {
        let c = Client::new("tcp!localhost!4304").unwrap();
        assert_eq!(c.endpoint, Endpoint::Tcp("localhost:4304".into()));
        assert_eq!(Client::new("4304").unwrap().endpoint, Endpoint::Tcp("127.0.0.1:4304".into()));
        assert_eq!(Client::new("unix!/run/ow.sock!0").unwrap().to_string(), "unix!/run/ow.sock");
        assert!(Client::new("bogus").is_err());
    }

    #[test]
    fn flags_are_shared_between_clones() {
        let a = Client::new("127.0.0.1:4304").unwrap();
        let b = a.clone();
        a.set_flags(SemiGlobal::BUSRET);
        assert_eq!(b.flags(), SemiGlobal::BUSRET);
    }

    #[test]
    fn padded_entries_are_trimmed() {
        assert_eq!(entry_name(b"/21.AABBCCDD0000\0\0\0"), "/21.AABBCCDD0000");
        assert_eq!(entry_name(b"/bus.0"), "/bus.0");
    }

    #[test]
    fn negative_ret_is_an_error() {
        let err = checked(Response::ret(-(Errno::ENOENT as i32), SemiGlobal::empty())).unwrap_err();
        assert_eq!(err.errno(), Errno::ENOENT);
    }
}
