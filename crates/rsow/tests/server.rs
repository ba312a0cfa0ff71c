use std::net::SocketAddr;

use futures::sink::SinkExt;
use rsow::bus::sim::{simulated, SimBus};
use rsow::client::Client;
use rsow::errno::*;
use rsow::owfs::{OwFs, Settings};
use rsow::path::ParsedPath;
use rsow::serialize;
use rsow::devices;
use rsow::srv::{serve, Filesystem};
use rsow::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

const THERMOCHRON: &str = "21.AABBCCDD0000";

async fn spawn_server(fs: OwFs) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(fs, listener));
    addr
}

async fn simulated_server(roms: &[&str]) -> SocketAddr {
    let mut bus = SimBus::new();
    for rom in roms {
        bus.attach(simulated(rom.parse().unwrap()));
    }
    spawn_server(OwFs::builder(Settings::default()).local(Box::new(bus)).build()).await
}

fn client(addr: SocketAddr) -> Client {
    Client::new(&addr.to_string()).unwrap()
}

/// Send raw bytes and read back one response header plus its payload.
async fn exchange(addr: SocketAddr, bytes: &[u8]) -> ([i32; 5], Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(bytes).await.unwrap();
    let mut header = [0u8; 20];
    stream.read_exact(&mut header).await.unwrap();
    let mut words = [0i32; 5];
    for (i, w) in words.iter_mut().enumerate() {
        *w = i32::from_be_bytes([header[4 * i], header[4 * i + 1], header[4 * i + 2], header[4 * i + 3]]);
    }
    let mut payload = vec![0u8; words[0] as usize];
    stream.read_exact(&mut payload).await.unwrap();
    (words, payload)
}

fn request_header(payload: u32, size: u32, typ: u32) -> Vec<u8> {
    [payload, size, typ, 0, 0].iter().flat_map(|w| w.to_be_bytes()).collect()
}

#[tokio::test]
async fn temperature_read_is_windowed_by_size() {
    let client = client(simulated_server(&[THERMOCHRON]).await);
    let path = format!("/{}/temperature", THERMOCHRON);

    assert_eq!(client.read(&path, 4, 0).await.unwrap(), b"40.0");
    assert_eq!(client.read(&path, 8192, 0).await.unwrap(), b"40.00");
    assert_eq!(client.read(&path, 8192, 3).await.unwrap(), b"00");
}

#[tokio::test]
async fn read_reports_the_length_in_ret() {
    let addr = simulated_server(&[THERMOCHRON]).await;
    let path = format!("/{}/temperature\0", THERMOCHRON);

    let mut bytes = request_header(path.len() as u32, 4, MsgType::Read as u32);
    bytes.extend_from_slice(path.as_bytes());
    let (header, payload) = exchange(addr, &bytes).await;
    assert_eq!(header[2], 4);
    assert_eq!(payload, b"40.0");

    let mut bytes = request_header(path.len() as u32, 8192, MsgType::Read as u32);
    bytes.extend_from_slice(path.as_bytes());
    let (header, payload) = exchange(addr, &bytes).await;
    assert_eq!(header[2], 5);
    assert_eq!(payload, b"40.00");
}

#[tokio::test]
async fn malformed_requests_are_answered_with_errno() {
    let addr = simulated_server(&[THERMOCHRON]).await;

    // path without its terminating null
    let path = format!("/{}/temperature", THERMOCHRON);
    let mut bytes = request_header(path.len() as u32, 16, MsgType::Read as u32);
    bytes.extend_from_slice(path.as_bytes());
    let (header, payload) = exchange(addr, &bytes).await;
    assert_eq!(header[2], -(EBADMSG as i32));
    assert!(payload.is_empty());

    let bytes = request_header(MAX_PAYLOAD + 1, 0, MsgType::Read as u32);
    let (header, _) = exchange(addr, &bytes).await;
    assert_eq!(header[2], -(EMSGSIZE as i32));

    let bytes = request_header(0, 0, 42);
    let (header, _) = exchange(addr, &bytes).await;
    assert_eq!(header[2], -(EIO as i32));
}

#[tokio::test]
async fn listing_streams_devices_and_properties() {
    let client = client(simulated_server(&[THERMOCHRON, "09.010203040506"]).await);

    let (entries, _) = client.dir_all("/").await.unwrap();
    assert!(entries.contains(&format!("/{}", THERMOCHRON)));
    assert!(entries.iter().any(|e| e.starts_with("/09.")));
    assert!(!entries.iter().any(|e| e.starts_with("/bus.")));

    let busret = client.for_session(SemiGlobal::BUSRET);
    let (entries, _) = busret.dir_all("/").await.unwrap();
    assert_eq!(entries.last().map(String::as_str), Some("/bus.0"));

    let (entries, _) = client.dir_all(&format!("/{}", THERMOCHRON)).await.unwrap();
    assert!(entries.contains(&format!("/{}/temperature", THERMOCHRON)));
    assert!(entries.contains(&format!("/{}/mission", THERMOCHRON)));

    let err = client.dir_all(&format!("/{}/temperature", THERMOCHRON)).await.unwrap_err();
    assert_eq!(err.errno(), ENOTDIR);
}

#[tokio::test]
async fn listing_terminator_carries_device_flags() {
    let client = client(simulated_server(&[THERMOCHRON]).await);
    let thermochron = devices::flags(0x21).bits();
    assert_ne!(thermochron, 0);

    let (_, flags) = client.dir_all("/").await.unwrap();
    assert_eq!(flags, thermochron);
    let (_, flags) = client.dir_all(&format!("/{}", THERMOCHRON)).await.unwrap();
    assert_eq!(flags, thermochron);
}

#[tokio::test]
async fn served_read_matches_local_read() {
    let mut bus = SimBus::new();
    bus.attach(simulated(THERMOCHRON.parse().unwrap()));
    let fs = OwFs::builder(Settings::default()).local(Box::new(bus)).build();
    let client = client(spawn_server(fs.clone()).await);

    for (property, size) in [("temperature", 8192), ("temperature", 3), ("family", 2), ("address", 16)] {
        let path = format!("/{}/{}", THERMOCHRON, property);
        let local = fs.rread(&ParsedPath::parse(&path).unwrap(), size, 0, SemiGlobal::empty()).await.unwrap();
        assert_eq!(client.read(&path, size, 0).await.unwrap(), local, "{}", path);
    }
}

#[tokio::test]
async fn listing_is_read_until_the_terminator() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, serialize::frame_codec());
        framed.next().await.unwrap().unwrap();
        for name in ["/E1", "/E2", "/E3"] {
            let entry = Response::with_data(name.as_bytes().to_vec(), SemiGlobal::empty(), 0);
            framed.send(serialize::to_frame(&entry).unwrap()).await.unwrap();
        }
        let mut end = Response::ret(0, SemiGlobal::empty());
        end.header.offset = 0x0000_0102;
        framed.send(serialize::to_frame(&end).unwrap()).await.unwrap();
    });

    let client = Client::new(&addr.to_string()).unwrap();
    let mut seen = Vec::new();
    let flags = client.dir("/", |e| seen.push(e)).await.unwrap();
    assert_eq!(seen, ["/E1", "/E2", "/E3"]);
    assert_eq!(flags, 0x0000_0102);
}

#[tokio::test]
async fn size_and_presence() {
    let client = client(simulated_server(&[THERMOCHRON]).await);

    assert_eq!(client.size(&format!("/{}/temperature", THERMOCHRON)).await.unwrap(), 12);
    assert_eq!(client.size("/").await.unwrap(), 0);
    assert_eq!(client.presence(&format!("/{}", THERMOCHRON)).await.unwrap(), 0);
    let err = client.presence("/21.000000000001").await.unwrap_err();
    assert_eq!(err.errno(), ENOENT);
    client.nop().await.unwrap();
}

#[tokio::test]
async fn write_then_read_back() {
    let client = client(simulated_server(&[THERMOCHRON]).await);
    let path = format!("/{}/mission/delay", THERMOCHRON);

    assert_eq!(client.write(&path, b"30", 0).await.unwrap(), 2);
    assert_eq!(client.read(&path, 12, 0).await.unwrap(), b"30");

    let err = client.write(&path, b"later", 0).await.unwrap_err();
    assert_eq!(err.errno(), EINVAL);
    let err = client.write(&format!("/{}/temperature", THERMOCHRON), b"1", 0).await.unwrap_err();
    assert_eq!(err.errno(), EACCES);
}

#[tokio::test]
async fn remote_leg_forwards_requests() {
    let upstream = client(simulated_server(&[THERMOCHRON]).await);
    let fs = OwFs::builder(Settings::default()).remote(upstream).build();
    let client = client(spawn_server(fs).await);
    let path = format!("/{}/temperature", THERMOCHRON);

    assert_eq!(client.read(&path, 8192, 0).await.unwrap(), b"40.00");
    assert_eq!(client.presence(&format!("/{}", THERMOCHRON)).await.unwrap(), 0);
    let (entries, _) = client.dir_all("/").await.unwrap();
    assert_eq!(entries, [format!("/{}", THERMOCHRON)]);

    let delay = format!("/bus.0/{}/mission/delay", THERMOCHRON);
    client.write(&delay, b"7", 0).await.unwrap();
    assert_eq!(client.read(&delay, 12, 0).await.unwrap(), b"7");
}
