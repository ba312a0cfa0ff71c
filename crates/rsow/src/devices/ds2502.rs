//! DS2502 add-only memory, and the DS1982U iButton with the same die.

use futures::future::{BoxFuture, FutureExt};
use log::debug;

use crate::crc::{crc16_valid, crc8};
use crate::error::{errno::*, TransactionError};
use crate::filetype::*;
use crate::transaction::TransactionLog;
use crate::utils::Result;

const PAGE: usize = 32;
const MEMORY_SIZE: usize = 128;

const READ_DATA_CRC: u8 = 0xC3;
const WRITE_MEMORY: u8 = 0x0F;

/// Tag of the page 0 data record in the internal cache
const RECORD: &str = "ds2502/record";

/// Read from `addr` to at most the end of its page.
async fn read_page(q: &Query, size: usize, addr: usize) -> Result<Vec<u8>> {
    let rest = PAGE - (addr & (PAGE - 1));
    let [lo, hi] = (addr as u16).to_le_bytes();
    let log = TransactionLog::select()
        .matching(&[READ_DATA_CRC, lo, hi])
        .crc8()
        .read(rest)
        .crc8()
        .end();
    let mut data = q.transaction(&log).await?.into_first();
    data.truncate(size);
    Ok(data)
}

async fn read_mem(q: &Query, size: usize, addr: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(size);
    let mut at = addr;
    while out.len() < size && at < MEMORY_SIZE {
        let chunk = read_page(q, size - out.len(), at).await?;
        at += chunk.len();
        out.extend(chunk);
    }
    Ok(out)
}

/// Program bytes one at a time. Only the first needs the command and
/// address; the device then advances on its own, so the rest go out as
/// resumed logs under the same bus lock.
async fn write_mem(q: &Query, data: &[u8], addr: usize) -> Result<()> {
    let Some((&first, rest)) = data.split_first() else {
        return Ok(());
    };
    if addr + data.len() > MEMORY_SIZE {
        return Err(ERANGE.into());
    }

    let mut bus = q.dev.bus.lock().await;
    let [lo, hi] = (addr as u16).to_le_bytes();
    let log = TransactionLog::select()
        .matching(&[WRITE_MEMORY, lo, hi, first])
        .crc8()
        .program()
        .read(1)
        .end();
    verify(bus.transaction(q.sn(), &log).await?.get(0), first, addr)?;

    for (i, &byte) in rest.iter().enumerate() {
        let at = addr + 1 + i;
        let [lo, hi] = (at as u16).to_le_bytes();
        let log = TransactionLog::resume()
            .matching(&[byte])
            .crc8_seeded(crc8(0, &[lo, hi]))
            .program()
            .read(1)
            .end();
        verify(bus.transaction(q.sn(), &log).await?.get(0), byte, at)?;
    }
    Ok(())
}

/// EPROM bits only ever clear; a readback other than the byte written means
/// the cell already held zeros where a one was wanted.
fn verify(readback: &[u8], wanted: u8, addr: usize) -> Result<()> {
    if readback != [wanted] {
        debug!("eprom byte {:#04x} reads {:02X?}, wanted {:02X}", addr, readback, wanted);
        return Err(TransactionError::Verify.into());
    }
    Ok(())
}

fn r_memory(q: &Query, size: usize, offset: usize) -> BoxFuture<'_, Result<Vec<u8>>> {
    async move { read_mem(q, size, offset).await }.boxed()
}

fn w_memory(q: &Query, data: Vec<u8>, offset: usize) -> BoxFuture<'_, Result<()>> {
    async move { write_mem(q, &data, offset).await }.boxed()
}

fn r_page(q: &Query, size: usize, offset: usize) -> BoxFuture<'_, Result<Vec<u8>>> {
    async move {
        if offset >= PAGE {
            return Ok(Vec::new());
        }
        read_page(q, size, q.index()? * PAGE + offset).await
    }
    .boxed()
}

fn w_page(q: &Query, data: Vec<u8>, offset: usize) -> BoxFuture<'_, Result<()>> {
    async move {
        if offset + data.len() > PAGE {
            return Err(ERANGE.into());
        }
        write_mem(q, &data, q.index()? * PAGE + offset).await
    }
    .boxed()
}

/// The length prefixed, CRC16 checked record at the start of page 0.
async fn record(q: &Query) -> Result<Vec<u8>> {
    if let Some(r) = q.cached(RECORD) {
        return Ok(r);
    }
    let page = read_page(q, PAGE, 0).await?;
    let len = page[0] as usize;
    if len + 3 > PAGE || !crc16_valid(0, &page[..len + 3]) {
        return Err(EINVAL.into());
    }
    let r = page[1..1 + len].to_vec();
    q.cache(RECORD, r.clone());
    Ok(r)
}

fn r_param(q: &Query, size: usize, offset: usize) -> BoxFuture<'_, Result<Vec<u8>>> {
    async move {
        let Data::Addr(at) = q.property.data else {
            return Err(EINVAL.into());
        };
        let start = at as usize;
        let end = start + q.property.element_len();
        let r = record(q).await?;
        let field = r.get(start..end).ok_or(EINVAL)?;
        Ok(field.iter().skip(offset).take(size).copied().collect())
    }
    .boxed()
}

const PAGES: Aggregate = Aggregate::numbers(MEMORY_SIZE / PAGE, Layout::Separate);

pub static DS2502: Family = Family {
    code: 0x09,
    name: "DS2502",
    flags: DevFlags::empty(),
    properties: &[
        Property::leaf("memory", MEMORY_SIZE, Format::Binary, CacheClass::Stable)
            .read(Read::Block(r_memory))
            .write(Write::Block(w_memory)),
        Property::subdir("pages"),
        Property::leaf("pages/page", PAGE, Format::Binary, CacheClass::Stable)
            .aggregate(PAGES)
            .read(Read::Block(r_page))
            .write(Write::Block(w_page)),
    ],
};

pub static DS1982U: Family = Family {
    code: 0x89,
    name: "DS1982U",
    flags: DevFlags::empty(),
    properties: &[
        Property::leaf("mac_e", 6, Format::Binary, CacheClass::Stable)
            .read(Read::Block(r_param))
            .data(Data::Addr(4)),
        Property::leaf("mac_fw", 8, Format::Binary, CacheClass::Stable)
            .read(Read::Block(r_param))
            .data(Data::Addr(4)),
        Property::leaf("project", 4, Format::Binary, CacheClass::Stable)
            .read(Read::Block(r_param))
            .data(Data::Addr(0)),
        Property::leaf("memory", MEMORY_SIZE, Format::Binary, CacheClass::Stable)
            .read(Read::Block(r_memory))
            .write(Write::Block(w_memory)),
        Property::subdir("pages"),
        Property::leaf("pages/page", PAGE, Format::Binary, CacheClass::Stable)
            .aggregate(PAGES)
            .read(Read::Block(r_page))
            .write(Write::Block(w_page)),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::{SimBus, SimDs2502};
    use crate::bus::BusMaster;
    use crate::cache::TtlCache;
    use crate::message::SemiGlobal;
    use crate::path::Extension;
    use crate::sn::SerialNumber;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn rig(sn: SerialNumber, chip: SimDs2502) -> (Device, Arc<Mutex<SimDs2502>>) {
        let chip = Arc::new(Mutex::new(chip));
        let dev = Device {
            sn,
            bus: Arc::new(BusMaster::new(0, Box::new(SimBus::new().with(chip.clone())))),
            internal: Arc::new(TtlCache::new(Duration::from_secs(300))),
        };
        (dev, chip)
    }

    fn query(dev: &Device, family: &'static Family, name: &str) -> Query {
        Query {
            dev: dev.clone(),
            property: family.property(name).unwrap(),
            extension: Extension::None,
            sg: SemiGlobal::empty(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn program_across_a_page_boundary() {
        let sn = SerialNumber::new(0x09, [1, 2, 3, 4, 5, 6]);
        let (dev, chip) = rig(sn, SimDs2502::new(sn));
        let q = query(&dev, &DS2502, "memory");

        w_memory(&q, b"hello, eprom".to_vec(), 26).await.unwrap();
        assert_eq!(&chip.lock().unwrap().memory_mut()[26..38], b"hello, eprom");
        assert_eq!(r_memory(&q, 12, 26).await.unwrap(), b"hello, eprom");

        let mut q = query(&dev, &DS2502, "pages/page");
        q.extension = Extension::Index(1);
        assert_eq!(r_page(&q, 7, 0).await.unwrap(), b" eprom\xFF");
    }

    #[tokio::test(start_paused = true)]
    async fn setting_a_cleared_bit_fails_verify() {
        let sn = SerialNumber::new(0x09, [1, 2, 3, 4, 5, 6]);
        let (dev, chip) = rig(sn, SimDs2502::new(sn));
        chip.lock().unwrap().memory_mut()[3] = 0x0F;
        let q = query(&dev, &DS2502, "memory");

        let err = w_memory(&q, vec![0xAA, 0xF0], 2).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Transaction(TransactionError::Verify)));
        // the first byte went through before the failure
        assert_eq!(chip.lock().unwrap().memory_mut()[2], 0xAA);

        assert_eq!(w_memory(&q, vec![0; 2], 127).await.unwrap_err().errno(), ERANGE);
    }

    #[tokio::test]
    async fn ds1982u_record_fields() {
        let sn = SerialNumber::new(0x89, [1, 2, 3, 4, 5, 6]);
        let (dev, _) = rig(sn, SimDs2502::new(sn).with_record(b"PRJ1\x00\x60\x35\x01\x02\x03\xAB\xCD"));

        let project = r_param(&query(&dev, &DS1982U, "project"), 4, 0).await.unwrap();
        assert_eq!(project, b"PRJ1");
        let mac = r_param(&query(&dev, &DS1982U, "mac_e"), 6, 0).await.unwrap();
        assert_eq!(mac, b"\x00\x60\x35\x01\x02\x03");
        let fw = r_param(&query(&dev, &DS1982U, "mac_fw"), 8, 0).await.unwrap();
        assert_eq!(fw, b"\x00\x60\x35\x01\x02\x03\xAB\xCD");
    }

    #[tokio::test]
    async fn blank_part_has_no_record() {
        let sn = SerialNumber::new(0x89, [1, 2, 3, 4, 5, 6]);
        let (dev, _) = rig(sn, SimDs2502::new(sn));
        let err = r_param(&query(&dev, &DS1982U, "project"), 4, 0).await.unwrap_err();
        assert_eq!(err.errno(), EINVAL);
    }
}
