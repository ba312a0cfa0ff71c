//! Asynchronous owserver side of the protocol.
//!
//! Every connection carries exactly one request. The request is read as a
//! single length delimited frame, the target path is parsed before anything
//! touches a bus, the [`Filesystem`] answers, and the connection closes.
//! Directory listings are the one multi-message reply: one response per entry
//! streamed through a [`DirSink`], then a zero payload terminator.

use {
    crate::{
        error::{self, errno::*},
        io_err,
        message::*,
        path::ParsedPath,
        serialize,
        stats::{self, Event},
        utils::{self, Result},
    },
    async_trait::async_trait,
    bytes::Bytes,
    futures::sink::{Sink, SinkExt},
    log::{debug, error, info},
    std::{
        io,
        path::{Path, PathBuf},
        pin::Pin,
        sync::{atomic::Ordering, Arc},
    },
    tokio::{
        io::{AsyncRead, AsyncWrite},
        net::{TcpListener, UnixListener},
    },
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite},
};

/// Streams the entries of one directory listing back to the client.
///
/// Holds what the per-entry responses need: the connection writer, the
/// directory the client asked for, and the header every entry repeats.
pub struct DirSink<'a> {
    sink: Pin<Box<dyn Sink<Bytes, Error = io::Error> + Send + 'a>>,
    base: String,
    template: ResponseHeader,
    entries: usize,
}

impl<'a> DirSink<'a> {
    pub fn new<S>(sink: S, base: &str, sg: SemiGlobal) -> Self
    where
        S: Sink<Bytes, Error = io::Error> + Send + 'a,
    {
        DirSink {
            sink: Box::pin(sink),
            base: base.trim_end_matches('/').to_owned(),
            template: ResponseHeader {
                sg,
                ..Default::default()
            },
            entries: 0,
        }
    }

    /// The listed directory as the client named it, without a trailing `/`.
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn sg(&self) -> SemiGlobal {
        self.template.sg
    }

    /// Number of entries sent so far.
    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Send the entry `name` below the listed directory.
    pub async fn entry(&mut self, name: &str) -> Result<()> {
        if name.is_empty() || name.len() > MAX_ENTRY_NAME {
            return Err(ENAMETOOLONG.into());
        }
        let path = format!("{}/{}", self.base, name);
        let mut header = self.template;
        header.payload = path.len() as u32;
        header.size = path.len() as u32;
        let response = Response {
            header,
            data: path.into_bytes(),
        };
        send(&mut self.sink, &response).await?;
        self.entries += 1;
        Ok(())
    }
}

/// Filesystem server trait.
///
/// Implementors can represent an error condition by returning an `Err`,
/// which is sent to the client as a negative errno.
///
/// The default implementation, returning EOPNOTSUPP error, is provided to
/// all methods.
#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Keepalive and connectivity check.
    async fn rnop(&self) -> Result<()> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Read a property.
    ///
    /// Returns at most `size` formatted bytes starting at `offset`.
    async fn rread(&self, _: &ParsedPath, _size: usize, _offset: usize, _sg: SemiGlobal) -> Result<Vec<u8>> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Write a property, returning the number of bytes taken.
    async fn rwrite(&self, _: &ParsedPath, _data: &[u8], _offset: usize, _sg: SemiGlobal) -> Result<usize> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// List a directory into `sink`, returning the device flags of the
    /// listed entries.
    async fn rdir(&self, _: &ParsedPath, _sink: &mut DirSink<'_>) -> Result<u32> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Formatted length of a property.
    async fn rsize(&self, _: &ParsedPath, _sg: SemiGlobal) -> Result<usize> {
        Err(error::Error::No(EOPNOTSUPP))
    }

    /// Bus index a device is reachable through.
    async fn rpresence(&self, _: &ParsedPath, _sg: SemiGlobal) -> Result<usize> {
        Err(error::Error::No(EOPNOTSUPP))
    }
}

async fn send<S>(sink: &mut S, response: &Response) -> io::Result<()>
where
    S: Sink<Bytes, Error = io::Error> + Unpin,
{
    let frame = serialize::to_frame(response)?;
    sink.send(frame).await?;
    debug!("\t→ {:?}", response.header);
    Ok(())
}

#[rustfmt::skip]
async fn dispatch_once<Fs, Writer>(
    request: &Request,
    typ: MsgType,
    fs: &Fs,
    framedwrite: &mut FramedWrite<Writer, tokio_util::codec::LengthDelimitedCodec>,
) -> Result<Response>
where
    Fs: Filesystem,
    Writer: AsyncWrite + Send + std::marker::Unpin,
{
    let header = &request.header;
    let sg = header.sg;

    if typ == MsgType::Nop {
        fs.rnop().await?;
        return Ok(Response::ret(0, sg));
    }

    let path = ParsedPath::parse(request.path()?)?;
    let size = header.size as usize;
    let offset = header.offset as usize;

    let response = match typ {
        MsgType::Read       => Response::with_data(fs.rread(&path, size, offset, sg).await?, sg, header.offset),
        MsgType::Write      => {
            let data = request.data();
            if data.is_empty() || data.len() < size {
                return Err(error::Error::No(EMSGSIZE));
            }
            let written = fs.rwrite(&path, &data[..size], offset, sg).await?;
            let mut response = Response::ret(written as i32, sg);
            response.header.size = written as u32;
            response
        }
        MsgType::Dir        => {
            let mut sink = DirSink::new(&mut *framedwrite, &path.raw, sg);
            let flags = fs.rdir(&path, &mut sink).await?;
            stats::record(Event::Dir { entries: sink.len() });
            let mut response = Response::ret(0, sg);
            response.header.offset = flags;
            response
        }
        MsgType::Size       => Response::ret(fs.rsize(&path, sg).await? as i32, sg),
        MsgType::Presence   => Response::ret(fs.rpresence(&path, sg).await? as i32, sg),
        MsgType::Nop        => Response::ret(0, sg),
    };

    Ok(response)
}

/// Serve the single request of one connection.
async fn dispatch<Fs, Reader, Writer>(filesystem: Fs, reader: Reader, writer: Writer) -> Result<()>
where
    Fs: Filesystem,
    Reader: AsyncRead + Send + std::marker::Unpin,
    Writer: AsyncWrite + Send + std::marker::Unpin,
{
    stats::record(Event::Connection);

    let mut framedread = FramedRead::new(reader, serialize::frame_codec());
    let mut framedwrite = FramedWrite::new(writer, serialize::frame_codec());

    let bytes = match framedread.next().await {
        Some(Ok(bytes)) => bytes,
        Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
            stats::record(Event::ProtocolError);
            debug!("Rejecting request: {}", e);
            let response = Response::error(&error::Error::No(EMSGSIZE), SemiGlobal::empty());
            send(&mut framedwrite, &response).await?;
            return Ok(());
        }
        Some(Err(e)) => {
            stats::record(Event::ProtocolError);
            return Err(e.into());
        }
        None => {
            stats::record(Event::ProtocolError);
            debug!("Connection closed before a request");
            return Ok(());
        }
    };

    let request = serialize::request_from_frame(bytes.freeze())?;
    debug!("\t← {:?}", request.header);
    let sg = request.header.sg;

    let response = match request.header.msg_type() {
        Some(typ) => {
            stats::record(Event::Request(typ));
            dispatch_once(&request, typ, &filesystem, &mut framedwrite)
                .await
                .unwrap_or_else(|e| {
                    if e.errno() == EBADMSG {
                        stats::record(Event::ProtocolError);
                    }
                    match e {
                        error::Error::Io(ref e) => error!("{:?}: Error: \"{}\": {:?}", typ, e, e),
                        ref e => debug!("{:?}: {}", typ, e),
                    }
                    Response::error(&e, sg)
                })
        }
        None => {
            stats::record(Event::ProtocolError);
            debug!("Unknown message type {}", request.header.typ);
            Response::error(&error::Error::No(EIO), sg)
        }
    };

    send(&mut framedwrite, &response).await?;
    Ok(())
}

/// Accept connections on an already bound listener, forever.
pub async fn serve<Fs>(filesystem: Fs, listener: TcpListener) -> Result<()>
where
    Fs: 'static + Filesystem + Clone,
{
    loop {
        let (stream, peer) = listener.accept().await?;
        info!("accepted: {:?}", peer);

        let fs = filesystem.clone();
        tokio::spawn(async move {
            let (readhalf, writehalf) = stream.into_split();
            let res = dispatch(fs, readhalf, writehalf).await;
            if let Err(e) = res {
                error!("Error: {}: {:?}", e, e);
            }
        });
    }
}

pub async fn srv_async_tcp<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Clone,
{
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);
    serve(filesystem, listener).await
}

struct DeleteOnDrop {
    path: PathBuf,
    listener: UnixListener,
}

impl DeleteOnDrop {
    fn bind(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_owned();
        UnixListener::bind(&path).map(|listener| DeleteOnDrop { path, listener })
    }
}

impl std::ops::Deref for DeleteOnDrop {
    type Target = UnixListener;

    fn deref(&self) -> &Self::Target {
        &self.listener
    }
}

impl std::ops::DerefMut for DeleteOnDrop {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.listener
    }
}

impl Drop for DeleteOnDrop {
    fn drop(&mut self) {
        // There's no way to return a useful error here
        if let Err(e) = std::fs::remove_file(&self.path) {
            error!("Failed to remove socket file {:?}: {}", self.path, e);
        }
    }
}

pub async fn srv_async_unix<Fs>(filesystem: Fs, addr: impl AsRef<Path>) -> Result<()>
where
    Fs: 'static + Filesystem + Clone,
{
    use tokio::signal::unix::{signal, SignalKind};

    let listener = DeleteOnDrop::bind(addr)?;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));

    {
        let running = running.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                }
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        info!("accepted: {:?}", peer);

                        let fs = filesystem.clone();
                        tokio::spawn(async move {
                            let (readhalf, writehalf) = tokio::io::split(stream);
                            let res = dispatch(fs, readhalf, writehalf).await;
                            if let Err(e) = res {
                                error!("Error: {:?}", e);
                            }
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {
                // Allow the server to check the running flag
            }
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Listen on `tcp!host!port`, `unix!path!_`, `host:port` or a bare port.
pub async fn srv_async<Fs>(filesystem: Fs, addr: &str) -> Result<()>
where
    Fs: 'static + Filesystem + Clone,
{
    let (proto, listen_addr) =
        utils::parse_proto(addr).ok_or_else(|| io_err!(InvalidInput, "Invalid protocol or address"))?;

    match proto {
        "tcp" => srv_async_tcp(filesystem, &listen_addr).await,
        "unix" => srv_async_unix(filesystem, &listen_addr).await,
        _ => Err(From::from(io_err!(InvalidInput, "Protocol not supported"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Answers reads with the path, lists three entries.
    #[derive(Clone)]
    struct Echo;

    #[async_trait]
    impl Filesystem for Echo {
        async fn rnop(&self) -> Result<()> {
            Ok(())
        }

        async fn rread(&self, path: &ParsedPath, size: usize, offset: usize, _: SemiGlobal) -> Result<Vec<u8>> {
            Ok(crate::format::window(path.raw.clone().into_bytes(), size, offset))
        }

        async fn rdir(&self, _: &ParsedPath, sink: &mut DirSink<'_>) -> Result<u32> {
            for name in ["a", "b", "c"] {
                sink.entry(name).await?;
            }
            Ok(0x8000)
        }
    }

    async fn exchange(raw: Vec<u8>) -> Vec<Response> {
        let (mut client, server) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(server);
        let task = tokio::spawn(dispatch(Echo, r, w));
        client.write_all(&raw).await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        task.await.unwrap().unwrap();

        let mut cursor = Cursor::new(out);
        let mut responses = Vec::new();
        while (cursor.position() as usize) < cursor.get_ref().len() {
            responses.push(serialize::read_response(&mut cursor).unwrap());
        }
        responses
    }

    fn encoded(request: &Request) -> Vec<u8> {
        let mut buf = Vec::new();
        serialize::write_request(&mut buf, request).unwrap();
        buf
    }

    #[tokio::test]
    async fn read_is_windowed_and_echoes_offset() {
        let sg = SemiGlobal::BUSRET;
        let request = Request::new(MsgType::Read, "/bus.0", &[], 4, 1, sg);
        let responses = exchange(encoded(&request)).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].data, b"bus.");
        assert_eq!(responses[0].header.ret, 4);
        assert_eq!(responses[0].header.offset, 1);
        assert_eq!(responses[0].header.sg, sg);
    }

    #[tokio::test]
    async fn dir_streams_then_terminates() {
        let request = Request::new(MsgType::Dir, "/bus.0/", &[], 0, 0, SemiGlobal::empty());
        let responses = exchange(encoded(&request)).await;
        let names: Vec<_> = responses.iter().map(|r| String::from_utf8(r.data.clone()).unwrap()).collect();
        assert_eq!(names, ["/bus.0/a", "/bus.0/b", "/bus.0/c", ""]);
        assert!(responses[3].is_terminator());
        assert_eq!(responses[3].header.offset, 0x8000);
    }

    #[tokio::test]
    async fn missing_terminator_is_bad_message() {
        let mut request = Request::new(MsgType::Read, "/", &[], 10, 0, SemiGlobal::empty());
        request.payload.pop();
        request.header.payload -= 1;
        let responses = exchange(encoded(&request)).await;
        assert_eq!(responses[0].header.ret, -(EBADMSG as i32));
    }

    #[tokio::test]
    async fn unknown_type_and_missing_handler() {
        let mut request = Request::nop(SemiGlobal::empty());
        request.header.typ = 99;
        assert_eq!(exchange(encoded(&request)).await[0].header.ret, -(EIO as i32));

        let request = Request::new(MsgType::Size, "/", &[], 0, 0, SemiGlobal::empty());
        assert_eq!(exchange(encoded(&request)).await[0].header.ret, -(EOPNOTSUPP as i32));

        let request = Request::nop(SemiGlobal::empty());
        assert_eq!(exchange(encoded(&request)).await[0].header.ret, 0);
    }

    #[tokio::test]
    async fn short_write_data_is_rejected() {
        let request = Request::new(MsgType::Write, "/x", b"12", 5, 0, SemiGlobal::empty());
        let responses = exchange(encoded(&request)).await;
        assert_eq!(responses[0].header.ret, -(EMSGSIZE as i32));
    }

    #[tokio::test]
    async fn oversized_payload_is_refused() {
        let header = RequestHeader {
            payload: MAX_PAYLOAD + 1,
            typ: MsgType::Read as u32,
            ..Default::default()
        };
        let mut raw = Vec::new();
        serialize::Encodable::encode(&header, &mut raw).unwrap();
        let responses = exchange(raw).await;
        assert_eq!(responses[0].header.ret, -(EMSGSIZE as i32));
    }
}
