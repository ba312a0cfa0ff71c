//! The 1-Wire filesystem: bus legs, device resolution, caches and the
//! mapping of reads and writes onto property callbacks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};

use crate::bus::{Bus, BusMaster};
use crate::cache::{DirectoryCache, TtlCache};
use crate::client::Client;
use crate::devices;
use crate::error::{errno::*, Error};
use crate::filetype::*;
use crate::format::{format_value, format_values, formatted_size, parse_value, parse_values, window};
use crate::message::SemiGlobal;
use crate::path::{Extension, ParsedPath};
use crate::sn::SerialNumber;
use crate::srv::{DirSink, Filesystem};
use crate::stats::{self, Event};
use crate::utils::Result;

/// Cache lifetimes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub volatile: Duration,
    pub stable: Duration,
    pub directory: Duration,
    pub presence: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            volatile: Duration::from_secs(15),
            stable: Duration::from_secs(300),
            directory: Duration::from_secs(60),
            presence: Duration::from_secs(120),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub timeouts: Timeouts,
    /// Extra attempts for a read or write that failed on the bus
    pub retries: usize,
    /// Temperature scale and display format for clients that send none
    pub sg: SemiGlobal,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            timeouts: Timeouts::default(),
            retries: 3,
            sg: SemiGlobal::empty(),
        }
    }
}

/// One bus leg.
pub enum Inbound {
    Local(Arc<BusMaster>),
    Remote(Client),
}

type ValueKey = (SerialNumber, &'static str, Extension);

struct Inner {
    legs: Vec<Inbound>,
    settings: Settings,
    /// device → bus index
    locations: TtlCache<SerialNumber, usize>,
    directory: DirectoryCache,
    values: TtlCache<ValueKey, Vec<Value>>,
    internal: Arc<TtlCache<InternalKey, Vec<u8>>>,
}

/// Collects bus legs for an [`OwFs`]. Legs are numbered in the order added.
pub struct OwFsBuilder {
    settings: Settings,
    legs: Vec<Inbound>,
}

impl OwFsBuilder {
    pub fn local(mut self, bus: Box<dyn Bus>) -> Self {
        let index = self.legs.len();
        self.legs.push(Inbound::Local(Arc::new(BusMaster::new(index, bus))));
        self
    }

    pub fn remote(mut self, client: Client) -> Self {
        self.legs.push(Inbound::Remote(client));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.legs.is_empty()
    }

    pub fn build(self) -> OwFs {
        let t = self.settings.timeouts;
        OwFs {
            inner: Arc::new(Inner {
                legs: self.legs,
                settings: self.settings,
                locations: TtlCache::new(t.presence),
                directory: DirectoryCache::new(t.directory),
                values: TtlCache::new(t.stable),
                internal: Arc::new(TtlCache::new(t.stable)),
            }),
        }
    }
}

/// The filesystem served by owserver.
#[derive(Clone)]
pub struct OwFs {
    inner: Arc<Inner>,
}

/// Where a device lives.
enum Located<'a> {
    Local(Device),
    Remote(&'a Client),
}

impl OwFs {
    pub fn builder(settings: Settings) -> OwFsBuilder {
        OwFsBuilder {
            settings,
            legs: Vec::new(),
        }
    }

    pub fn legs(&self) -> usize {
        self.inner.legs.len()
    }

    fn leg(&self, index: usize) -> Result<&Inbound> {
        self.inner.legs.get(index).ok_or(Error::No(ENOENT))
    }

    /// Fill in the server defaults for a client that left scale and format
    /// unset.
    fn session(&self, sg: SemiGlobal) -> SemiGlobal {
        let fields = SemiGlobal::TEMPSCALE | SemiGlobal::DEVFORMAT;
        if sg.intersects(fields) {
            sg
        } else {
            sg | (self.inner.settings.sg & fields)
        }
    }

    fn ttl(&self, class: CacheClass) -> Duration {
        let t = &self.inner.settings.timeouts;
        match class {
            CacheClass::Volatile => t.volatile,
            CacheClass::Stable | CacheClass::Static => t.stable,
            CacheClass::Second => Duration::from_secs(1),
            CacheClass::Uncached => Duration::ZERO,
        }
    }

    /// Devices on a local leg, from the directory cache unless `uncached`.
    async fn devices(&self, master: &BusMaster, uncached: bool) -> Result<Vec<SerialNumber>> {
        let index = master.index();
        if !uncached {
            if let Some(found) = self.inner.directory.list(index) {
                return Ok(found);
            }
        }
        self.inner.directory.begin(index);
        let found = master.search().await?;
        for (i, sn) in found.iter().enumerate() {
            self.inner.directory.put(index, i, *sn);
            self.inner.locations.insert(*sn, index);
        }
        self.inner.directory.finish(index, found.len());
        Ok(found)
    }

    /// Bus index of `sn`: the explicit `bus.N`, the location cache, or a
    /// probe of every leg in order.
    async fn locate(&self, pn: &ParsedPath, sn: SerialNumber) -> Result<usize> {
        if let Some(bus) = pn.bus {
            self.leg(bus)?;
            return Ok(bus);
        }
        if !pn.uncached {
            if let Some(bus) = self.inner.locations.get(&sn) {
                return Ok(bus);
            }
        }

        let probe = format!("/{}", sn);
        for (i, leg) in self.inner.legs.iter().enumerate() {
            let found = match leg {
                Inbound::Local(master) => match self.devices(master, pn.uncached).await {
                    Ok(found) => found.contains(&sn),
                    Err(e) => {
                        warn!("bus.{}: search failed: {}", i, e);
                        false
                    }
                },
                Inbound::Remote(client) => client.presence(&probe).await.is_ok(),
            };
            if found {
                debug!("{} found on bus.{}", sn, i);
                self.inner.locations.insert(sn, i);
                return Ok(i);
            }
        }
        Err(Error::No(ENOENT))
    }

    async fn device(&self, pn: &ParsedPath, sn: SerialNumber) -> Result<Located<'_>> {
        let bus = self.locate(pn, sn).await?;
        Ok(match self.leg(bus)? {
            Inbound::Local(master) => Located::Local(Device {
                sn,
                bus: master.clone(),
                internal: self.inner.internal.clone(),
            }),
            Inbound::Remote(client) => Located::Remote(client),
        })
    }

    /// Run `op` again while it fails on the bus, up to the retry limit.
    async fn retrying<T, F, Fut>(&self, what: &str, mut op: F) -> (Result<T>, usize)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op().await {
                Err(e) if e.is_retryable() && attempts <= self.inner.settings.retries => {
                    debug!("{}: attempt {} failed: {}", what, attempts, e);
                }
                ret => return (ret, attempts),
            }
        }
    }

    /// Typed values of a property, through the value cache.
    async fn values(&self, q: &Query, uncached: bool) -> Result<Vec<Value>> {
        let key = (*q.sn(), q.property.name, q.extension);
        let ttl = self.ttl(q.property.cache);
        if !uncached && !ttl.is_zero() {
            if let Some(values) = self.inner.values.get(&key) {
                return Ok(values);
            }
        }
        let values = read_values(q).await?;
        self.inner.values.insert_for(key, values.clone(), ttl);
        Ok(values)
    }

    async fn read_property(&self, q: &Query, size: usize, offset: usize, uncached: bool) -> Result<Vec<u8>> {
        let p = q.property;
        match (p.read, q.extension, p.aggregate) {
            (Read::None, _, _) => Err(Error::No(EACCES)),
            (Read::Block(read), Extension::All, Some(agg)) => {
                let mut data = Vec::with_capacity(agg.elements * p.element_len());
                for i in 0..agg.elements {
                    data.extend(read(&q.element(i), p.element_len(), 0).await?);
                }
                Ok(window(data, size, offset))
            }
            (Read::Block(read), _, _) => read(q, size, offset).await,
            (_, Extension::All, _) => {
                let values = self.values(q, uncached).await?;
                Ok(window(format_values(&values, p.format, q.sg), size, offset))
            }
            _ => {
                let values = self.values(q, uncached).await?;
                let first = values.first().ok_or(Error::No(EIO))?;
                Ok(window(format_value(first, q.sg), size, offset))
            }
        }
    }

    async fn write_property(&self, q: &Query, data: &[u8], offset: usize) -> Result<()> {
        let p = q.property;
        match (p.write, q.extension, p.aggregate) {
            (Write::None, _, _) => Err(Error::No(EACCES)),
            (Write::Block(write), Extension::All, Some(agg)) => {
                if offset != 0 || data.len() > agg.elements * p.element_len() {
                    return Err(Error::No(EINVAL));
                }
                for (i, chunk) in data.chunks(p.element_len()).enumerate() {
                    write(&q.element(i), chunk.to_vec(), 0).await?;
                }
                Ok(())
            }
            (Write::Block(write), _, _) => write(q, data.to_vec(), offset).await,
            (Write::Scalar(_), _, _) if offset != 0 => Err(Error::No(EINVAL)),
            (Write::Scalar(write), Extension::All, Some(agg)) => {
                let values = parse_values(p.format, data, agg.elements, q.sg)?;
                for (i, v) in values.into_iter().enumerate() {
                    write(&q.element(i), v).await?;
                }
                Ok(())
            }
            (Write::Scalar(write), _, _) => write(q, parse_value(p.format, data, q.sg)?).await,
        }
    }

    async fn visible(&self, q: &Query) -> bool {
        match q.property.visible {
            Some(visible) => visible(q).await,
            None => true,
        }
    }

    /// Entries of a local device directory, or of one of its subdirectories.
    async fn list_device(&self, dev: Device, subdir: Option<&str>, sg: SemiGlobal, sink: &mut DirSink<'_>) -> Result<()> {
        for p in devices::properties(dev.sn.family()).filter(|p| p.parent() == subdir) {
            let q = Query {
                dev: dev.clone(),
                property: p,
                extension: Extension::None,
                sg,
            };
            let name = p.basename();
            match p.aggregate {
                _ if p.is_subdir() => sink.entry(name).await?,
                Some(agg) => {
                    let mut every = true;
                    for i in 0..agg.elements {
                        if self.visible(&q.element(i)).await {
                            sink.entry(&format!("{}.{}", name, agg.element_name(i))).await?;
                        } else {
                            every = false;
                        }
                    }
                    if every {
                        sink.entry(&format!("{}.ALL", name)).await?;
                    }
                }
                None => {
                    if self.visible(&q).await {
                        sink.entry(name).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Devices a remote leg lists, stored like a local search.
    async fn remote_devices(&self, index: usize, client: &Client, uncached: bool, sg: SemiGlobal) -> Result<Vec<SerialNumber>> {
        let path = if uncached { "/uncached" } else { "/" };
        let mut found = Vec::new();
        client
            .for_session(sg)
            .dir(path, |entry| {
                let name = entry.rsplit('/').next().unwrap_or_default();
                if let Ok(sn) = name.parse::<SerialNumber>() {
                    found.push(sn);
                }
            })
            .await?;
        self.inner.directory.store(index, &found);
        for sn in &found {
            self.inner.locations.insert(*sn, index);
        }
        Ok(found)
    }

    /// Devices of one leg into `sink`, skipping any already listed.
    async fn list_leg(&self, index: usize, uncached: bool, sg: SemiGlobal, seen: &mut Vec<SerialNumber>, sink: &mut DirSink<'_>) -> Result<u32> {
        let found = match self.leg(index)? {
            Inbound::Local(master) => self.devices(master, uncached).await?,
            Inbound::Remote(client) => {
                let cached = if uncached { None } else { self.inner.directory.list(index) };
                match cached {
                    Some(found) => found,
                    None => self.remote_devices(index, client, uncached, sg).await?,
                }
            }
        };

        let mut flags = DevFlags::empty();
        for sn in found {
            if seen.contains(&sn) {
                continue;
            }
            seen.push(sn);
            flags |= devices::flags(sn.family());
            sink.entry(&sn.display(sg.device_format())).await?;
        }
        Ok(flags.bits())
    }
}

/// Call the reader a property declares, producing every requested value.
async fn read_values(q: &Query) -> Result<Vec<Value>> {
    let p = q.property;
    match (p.read, q.extension, p.aggregate) {
        (Read::Scalar(read), Extension::All, Some(agg)) => {
            let mut values = Vec::with_capacity(agg.elements);
            for i in 0..agg.elements {
                values.push(read(&q.element(i)).await?);
            }
            Ok(values)
        }
        (Read::Scalar(read), _, _) => Ok(vec![read(q).await?]),
        (Read::Array(read), ext, _) => {
            let all = read(q).await?;
            match ext {
                Extension::Index(i) => all.get(i).cloned().map(|v| vec![v]).ok_or(Error::No(EINVAL)),
                _ => Ok(all),
            }
        }
        (Read::Mixed { all, .. }, Extension::All, _) => all(q).await,
        (Read::Mixed { one, .. }, _, _) => Ok(vec![one(q).await?]),
        (Read::Block(_) | Read::None, _, _) => Err(Error::No(EACCES)),
    }
}

#[async_trait]
impl Filesystem for OwFs {
    async fn rnop(&self) -> Result<()> {
        Ok(())
    }

    async fn rread(&self, pn: &ParsedPath, size: usize, offset: usize, sg: SemiGlobal) -> Result<Vec<u8>> {
        let sg = self.session(sg);
        let (Some(sn), Some(property)) = (pn.sn, pn.property) else {
            return Err(Error::No(EISDIR));
        };
        let dev = match self.device(pn, sn).await? {
            Located::Local(dev) => dev,
            Located::Remote(client) => return client.for_session(sg).read(&pn.busless(), size, offset).await,
        };
        let q = Query {
            dev,
            property,
            extension: pn.extension,
            sg,
        };

        let (ret, attempts) = self
            .retrying(&pn.raw, || self.read_property(&q, size, offset, pn.uncached))
            .await;
        stats::record(Event::Read {
            ok: ret.is_ok(),
            bytes: ret.as_ref().map_or(0, Vec::len),
            attempts,
        });
        ret
    }

    async fn rwrite(&self, pn: &ParsedPath, data: &[u8], offset: usize, sg: SemiGlobal) -> Result<usize> {
        let sg = self.session(sg);
        let (Some(sn), Some(property)) = (pn.sn, pn.property) else {
            return Err(Error::No(EISDIR));
        };
        let dev = match self.device(pn, sn).await? {
            Located::Local(dev) => dev,
            Located::Remote(client) => return client.for_session(sg).write(&pn.busless(), data, offset).await,
        };
        let q = Query {
            dev,
            property,
            extension: pn.extension,
            sg,
        };

        let (ret, attempts) = self.retrying(&pn.raw, || self.write_property(&q, data, offset)).await;
        stats::record(Event::Write {
            ok: ret.is_ok(),
            bytes: if ret.is_ok() { data.len() } else { 0 },
            attempts,
        });
        ret?;
        // anything read from this device may have changed
        self.inner.values.retain(|key| key.0 != sn);
        Ok(data.len())
    }

    async fn rdir(&self, pn: &ParsedPath, sink: &mut DirSink<'_>) -> Result<u32> {
        let sg = self.session(sink.sg());

        if let Some(sn) = pn.sn {
            if pn.property.is_some() {
                return Err(Error::No(ENOTDIR));
            }
            return match self.device(pn, sn).await? {
                Located::Local(dev) => {
                    self.list_device(dev, pn.subdir, sg, sink).await?;
                    Ok(devices::flags(sn.family()).bits())
                }
                Located::Remote(client) => {
                    let mut names = Vec::new();
                    let flags = client
                        .for_session(sg)
                        .dir(&pn.busless(), |entry| {
                            names.push(entry.rsplit('/').next().unwrap_or_default().to_owned())
                        })
                        .await?;
                    for name in names {
                        sink.entry(&name).await?;
                    }
                    Ok(flags)
                }
            };
        }

        let mut seen = Vec::new();
        if let Some(bus) = pn.bus {
            return self.list_leg(bus, pn.uncached, sg, &mut seen, sink).await;
        }

        let mut flags = 0;
        let mut failed = None;
        let mut listed = false;
        for i in 0..self.legs() {
            match self.list_leg(i, pn.uncached, sg, &mut seen, sink).await {
                Ok(f) => {
                    flags |= f;
                    listed = true;
                }
                Err(e) => {
                    warn!("bus.{}: listing failed: {}", i, e);
                    failed.get_or_insert(e);
                }
            }
        }
        if !listed {
            if let Some(e) = failed {
                return Err(e);
            }
        }
        if self.legs() > 1 || sg.contains(SemiGlobal::BUSRET) {
            for i in 0..self.legs() {
                sink.entry(&format!("bus.{}", i)).await?;
            }
        }
        Ok(flags)
    }

    async fn rsize(&self, pn: &ParsedPath, sg: SemiGlobal) -> Result<usize> {
        let Some(property) = pn.property else {
            return Ok(0);
        };
        if let Some(Inbound::Remote(client)) = pn.bus.map(|b| self.leg(b)).transpose()? {
            return client.for_session(self.session(sg)).size(&pn.busless()).await;
        }
        Ok(formatted_size(property, pn.extension))
    }

    async fn rpresence(&self, pn: &ParsedPath, _sg: SemiGlobal) -> Result<usize> {
        match pn.sn {
            Some(sn) => self.locate(pn, sn).await,
            None => {
                let bus = pn.bus.unwrap_or(0);
                self.leg(bus)?;
                Ok(bus)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::{simulated, SimBus};
    use crate::message::{DeviceFormat, TemperatureScale};
    use crate::message::{MsgType, Response};
    use crate::path::ParsedPath;
    use crate::serialize::{frame_codec, request_from_frame, to_frame};
    use futures::sink::SinkExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio_stream::StreamExt;
    use tokio_util::codec::{Framed, FramedWrite};

    fn owfs(roms: &[SerialNumber]) -> OwFs {
        let mut bus = SimBus::new();
        for sn in roms {
            bus.attach(simulated(*sn));
        }
        OwFs::builder(Settings::default()).local(Box::new(bus)).build()
    }

    fn thermochron() -> SerialNumber {
        "21.AABBCCDD0000".parse().unwrap()
    }

    async fn read(fs: &OwFs, path: &str, size: usize, sg: SemiGlobal) -> Result<Vec<u8>> {
        fs.rread(&ParsedPath::parse(path)?, size, 0, sg).await
    }

    #[tokio::test(start_paused = true)]
    async fn temperature_is_formatted_and_windowed() {
        let fs = owfs(&[thermochron()]);
        assert_eq!(read(&fs, "/21.AABBCCDD0000/temperature", 4, SemiGlobal::empty()).await.unwrap(), b"40.0");
        assert_eq!(read(&fs, "/21.AABBCCDD0000/temperature", 100, SemiGlobal::empty()).await.unwrap(), b"40.00");

        let kelvin = SemiGlobal::empty().with_temperature_scale(TemperatureScale::Kelvin);
        assert_eq!(read(&fs, "/21.AABBCCDD0000/temperature", 100, kelvin).await.unwrap(), b"313.15");
    }

    #[tokio::test(start_paused = true)]
    async fn missing_device_and_directories() {
        let fs = owfs(&[thermochron()]);
        let err = read(&fs, "/21.000000000001/temperature", 10, SemiGlobal::empty()).await.unwrap_err();
        assert_eq!(err.errno(), ENOENT);
        let err = read(&fs, "/21.AABBCCDD0000", 10, SemiGlobal::empty()).await.unwrap_err();
        assert_eq!(err.errno(), EISDIR);
        let err = read(&fs, "/bus.3/21.AABBCCDD0000/temperature", 10, SemiGlobal::empty()).await.unwrap_err();
        assert_eq!(err.errno(), ENOENT);
    }

    #[tokio::test(start_paused = true)]
    async fn write_then_read_back_invalidates_the_cache() {
        let fs = owfs(&[thermochron()]);
        let pn = ParsedPath::parse("/21.AABBCCDD0000/mission/delay").unwrap();
        assert_eq!(read(&fs, &pn.raw, 12, SemiGlobal::empty()).await.unwrap(), b"0");
        assert_eq!(fs.rwrite(&pn, b"15", 0, SemiGlobal::empty()).await.unwrap(), 2);
        assert_eq!(read(&fs, &pn.raw, 12, SemiGlobal::empty()).await.unwrap(), b"15");

        let err = fs.rwrite(&pn, b"15", 1, SemiGlobal::empty()).await.unwrap_err();
        assert_eq!(err.errno(), EINVAL);
        let err = fs.rwrite(&pn, b"soon", 0, SemiGlobal::empty()).await.unwrap_err();
        assert_eq!(err.errno(), EINVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn sizes_follow_the_table() {
        let fs = owfs(&[]);
        let size = |p: &str| {
            let pn = ParsedPath::parse(p).unwrap();
            let fs = fs.clone();
            async move { fs.rsize(&pn, SemiGlobal::empty()).await.unwrap() }
        };
        assert_eq!(size("/21.AABBCCDD0000/temperature").await, LEN_TEMP);
        assert_eq!(size("/21.AABBCCDD0000/pages/page.ALL").await, 16 * 32);
        assert_eq!(size("/21.AABBCCDD0000/log/temperature.ALL").await, 2048 * LEN_TEMP + 2047);
        assert_eq!(size("/").await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn presence_caches_the_location() {
        let fs = owfs(&[thermochron()]);
        let pn = ParsedPath::parse("/21.AABBCCDD0000").unwrap();
        assert_eq!(fs.rpresence(&pn, SemiGlobal::empty()).await.unwrap(), 0);
        assert_eq!(fs.inner.locations.get(&thermochron()), Some(0));
        let pn = ParsedPath::parse("/09.010203040506").unwrap();
        assert_eq!(fs.rpresence(&pn, SemiGlobal::empty()).await.unwrap_err().errno(), ENOENT);
    }

    /// An owserver stand-in that lists one Thermochron and counts listings.
    async fn counting_upstream(listings: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let mut framed = Framed::new(stream, frame_codec());
                let frame = framed.next().await.unwrap().unwrap();
                let request = request_from_frame(frame.freeze()).unwrap();
                assert_eq!(request.header.msg_type(), Some(MsgType::Dir));
                listings.fetch_add(1, Ordering::SeqCst);
                let sg = request.header.sg;
                let entry = Response::with_data(b"/21.AABBCCDD0000".to_vec(), sg, 0);
                framed.send(to_frame(&entry).unwrap()).await.unwrap();
                framed.send(to_frame(&Response::ret(0, sg)).unwrap()).await.unwrap();
            }
        });
        addr
    }

    async fn list(fs: &OwFs, path: &str) -> Result<usize> {
        let mut out = FramedWrite::new(Vec::new(), frame_codec());
        let mut sink = DirSink::new(&mut out, path, SemiGlobal::empty());
        fs.rdir(&ParsedPath::parse(path)?, &mut sink).await?;
        Ok(sink.len())
    }

    #[tokio::test]
    async fn remote_listing_is_cached() {
        let listings = Arc::new(AtomicUsize::new(0));
        let upstream = Client::new(&counting_upstream(listings.clone()).await).unwrap();
        let fs = OwFs::builder(Settings::default()).remote(upstream).build();

        assert_eq!(list(&fs, "/").await.unwrap(), 1);
        assert_eq!(list(&fs, "/").await.unwrap(), 1);
        assert_eq!(listings.load(Ordering::SeqCst), 1);

        assert_eq!(list(&fs, "/uncached").await.unwrap(), 1);
        assert_eq!(listings.load(Ordering::SeqCst), 2);
        assert_eq!(fs.inner.locations.get(&thermochron()), Some(0));
    }

    #[test]
    fn server_defaults_fill_unset_flags() {
        let defaults = SemiGlobal::empty().with_temperature_scale(TemperatureScale::Fahrenheit);
        let fs = OwFs::builder(Settings {
            sg: defaults,
            ..Settings::default()
        })
        .build();
        assert_eq!(fs.session(SemiGlobal::BUSRET).temperature_scale(), TemperatureScale::Fahrenheit);
        let own = SemiGlobal::empty().with_device_format(DeviceFormat::Fic);
        assert_eq!(fs.session(own), own);
    }
}
