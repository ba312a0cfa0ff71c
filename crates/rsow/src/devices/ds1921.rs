//! DS1921 Thermochron temperature logger.
//!
//! All registers live in one 8 KiB address space read through the CRC16
//! guarded read memory command and written through the scratchpad. The
//! temperature scale and conversion delay depend on the chip variant, which
//! is encoded in the serial number.

use std::time::Duration;

use chrono::{DateTime, Datelike, TimeDelta, Utc};
use futures::future::{BoxFuture, FutureExt};
use log::debug;

use crate::date;
use crate::error::{errno::*, TransactionError};
use crate::filetype::*;
use crate::sn::SerialNumber;
use crate::transaction::TransactionLog;
use crate::utils::Result;

const PAGE: usize = 32;
const MEMORY_SIZE: usize = 512;

const WRITE_SCRATCHPAD: u8 = 0x0F;
const READ_SCRATCHPAD: u8 = 0xAA;
const COPY_SCRATCHPAD: u8 = 0x55;
const READ_MEMORY_CRC: u8 = 0xA5;
const CLEAR_MEMORY: u8 = 0x3C;
const CONVERT_TEMPERATURE: u8 = 0x44;

const RTC: u16 = 0x200;
const ALARM_TIME: u16 = 0x207;
const UNDERTEMP_THRESHOLD: u16 = 0x20B;
const OVERTEMP_THRESHOLD: u16 = 0x20C;
const SAMPLE_RATE: u16 = 0x20D;
const CONTROL: u16 = 0x20E;
const STOP_MISSION: u16 = 0x210;
const TEMPERATURE: u16 = 0x211;
const MISSION_DELAY: u16 = 0x212;
const STATUS: u16 = 0x214;
const MISSION_SAMPLES: u16 = 0x21A;
const DEVICE_SAMPLES: u16 = 0x21D;
const UNDERTEMP_LOG: u16 = 0x220;
const OVERTEMP_LOG: u16 = 0x250;
const HISTOGRAM: u16 = 0x800;
const LOG: u16 = 0x1000;

const CLOCK_STOPPED: u8 = 0x80;
const ENABLE_CLEAR: u8 = 0x40;
const STATUS_MIP: u8 = 5;

const HISTOGRAM_ELEMENTS: usize = 63;
const LOG_ELEMENTS: usize = 2048;
const ALARM_ELEMENTS: usize = 12;

/// Per-variant constants, sorted by `id`.
#[derive(Debug, PartialEq)]
pub struct Version {
    pub id: u16,
    pub name: &'static str,
    /// Temperature of raw reading zero, Celsius
    pub histolow: f64,
    /// Celsius per raw step
    pub resolution: f64,
    pub rangelow: f64,
    pub rangehigh: f64,
    /// Conversion time
    pub delay: Duration,
}

pub static VERSIONS: [Version; 7] = [
    Version { id: 0x000, name: "DS1921G-F5", histolow: -40.0, resolution: 0.500, rangelow: -40.0, rangehigh: 85.0, delay: Duration::from_millis(90) },
    Version { id: 0x064, name: "DS1921L-F50", histolow: -40.0, resolution: 0.500, rangelow: -40.0, rangehigh: 85.0, delay: Duration::from_millis(300) },
    Version { id: 0x15C, name: "DS1921L-F53", histolow: -40.0, resolution: 0.500, rangelow: -30.0, rangehigh: 85.0, delay: Duration::from_millis(300) },
    Version { id: 0x254, name: "DS1921L-F52", histolow: -40.0, resolution: 0.500, rangelow: -20.0, rangehigh: 85.0, delay: Duration::from_millis(300) },
    Version { id: 0x34C, name: "DS1921L-F51", histolow: -40.0, resolution: 0.500, rangelow: -10.0, rangehigh: 85.0, delay: Duration::from_millis(300) },
    Version { id: 0x3B2, name: "DS1921Z-F5", histolow: -5.5, resolution: 0.125, rangelow: -5.0, rangehigh: 26.0, delay: Duration::from_millis(360) },
    Version { id: 0x4F2, name: "DS1921H-F5", histolow: 14.5, resolution: 0.125, rangelow: 15.0, rangehigh: 46.0, delay: Duration::from_millis(360) },
];

/// The variant id: the high nibble of serial byte 5 and all of byte 6.
pub fn variant_id(sn: &SerialNumber) -> u16 {
    (sn.0[5] >> 4) as u16 | (sn.0[6] as u16) << 4
}

/// Exact match on the variant id.
pub fn version(sn: &SerialNumber) -> Option<&'static Version> {
    let id = variant_id(sn);
    VERSIONS.binary_search_by_key(&id, |v| v.id).ok().map(|i| &VERSIONS[i])
}

fn version_of(q: &Query) -> Result<&'static Version> {
    version(q.sn()).ok_or_else(|| EINVAL.into())
}

fn raw_to_celsius(v: &Version, raw: u8) -> f64 {
    raw as f64 * v.resolution + v.histolow
}

fn celsius_to_raw(v: &Version, c: f64) -> Result<u8> {
    let raw = ((c - v.histolow) / v.resolution).round();
    if !(0.0..=255.0).contains(&raw) {
        return Err(ERANGE.into());
    }
    Ok(raw as u8)
}

fn u24(b: &[u8]) -> u32 {
    b[0] as u32 | (b[1] as u32) << 8 | (b[2] as u32) << 16
}

fn addr_of(q: &Query) -> u16 {
    match q.property.data {
        Data::Addr(a) | Data::Bit { addr: a, .. } => a,
        _ => 0,
    }
}

// Bus programs

/// Read `size` bytes at `addr`, one CRC16 checked transaction per page.
async fn read_mem(q: &Query, size: usize, addr: u16) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(size);
    let mut at = addr as usize;
    while out.len() < size {
        let rest = PAGE - (at & (PAGE - 1));
        let [lo, hi] = (at as u16).to_le_bytes();
        let log = TransactionLog::select()
            .matching(&[READ_MEMORY_CRC, lo, hi])
            .read(rest)
            .crc16()
            .end();
        let page = q.transaction(&log).await?.into_first();
        let take = rest.min(size - out.len());
        out.extend_from_slice(&page[..take]);
        at += rest;
    }
    Ok(out)
}

async fn read_byte(q: &Query, addr: u16) -> Result<u8> {
    Ok(read_mem(q, 1, addr).await?[0])
}

/// Write within one page: scratchpad, readback compare, copy.
async fn write_page(q: &Query, data: &[u8], addr: u16) -> Result<()> {
    let off = addr as usize & (PAGE - 1);
    if data.is_empty() || off + data.len() > PAGE {
        return Err(EINVAL.into());
    }
    let [lo, hi] = addr.to_le_bytes();

    let mut cmd = vec![WRITE_SCRATCHPAD, lo, hi];
    cmd.extend_from_slice(data);
    let mut log = TransactionLog::select().matching(&cmd);
    if (off + data.len()) % PAGE == 0 {
        log = log.crc16();
    }
    q.transaction(&log.end()).await?;

    let rest = PAGE - off;
    let log = TransactionLog::select()
        .matching(&[READ_SCRATCHPAD, lo, hi])
        .read(1 + rest)
        .crc16()
        .end();
    let readback = q.transaction(&log).await?.into_first();
    if readback[1..1 + data.len()] != *data {
        debug!("{}: scratchpad readback differs at {:#06x}", q.sn(), addr);
        return Err(TransactionError::Verify.into());
    }

    let log = TransactionLog::select()
        .matching(&[COPY_SCRATCHPAD, lo, hi, readback[0]])
        .delay(Duration::from_millis(1))
        .end();
    q.transaction(&log).await?;
    Ok(())
}

/// Write any span, page by page.
async fn write_mem(q: &Query, data: &[u8], addr: u16) -> Result<()> {
    let mut at = addr as usize;
    let mut data = data;
    while !data.is_empty() {
        let n = (PAGE - (at & (PAGE - 1))).min(data.len());
        write_page(q, &data[..n], at as u16).await?;
        data = &data[n..];
        at += n;
    }
    Ok(())
}

async fn mission_in_progress(q: &Query) -> Result<bool> {
    Ok(read_byte(q, STATUS).await? & (1 << STATUS_MIP) != 0)
}

async fn refuse_if_busy(q: &Query) -> Result<()> {
    if mission_in_progress(q).await? {
        return Err(EBUSY.into());
    }
    Ok(())
}

struct Mission {
    start: DateTime<Utc>,
    rollover: bool,
    /// Seconds between samples
    interval: i64,
    samples: u32,
}

impl Mission {
    async fn fetch(q: &Query) -> Result<Mission> {
        let data = read_mem(q, 16, SAMPLE_RATE).await?;
        let mut stamp = [0u8; 5];
        stamp.copy_from_slice(&data[8..13]);
        Ok(Mission {
            start: date::decode_short(&stamp, Utc::now().year())?,
            rollover: data[1] & 0x08 != 0,
            interval: 60 * data[0] as i64,
            samples: u24(&data[13..16]),
        })
    }

    fn at(&self, steps: i64) -> DateTime<Utc> {
        self.start + TimeDelta::seconds(steps * self.interval)
    }

    /// Offset of the oldest sample in the log ring, when it has wrapped.
    fn wrapped(&self) -> Option<usize> {
        let samples = self.samples as usize;
        (self.rollover && samples >= LOG_ELEMENTS).then_some(samples % LOG_ELEMENTS)
    }

    /// Sample number of log element `i`.
    fn step(&self, i: usize) -> i64 {
        match self.wrapped() {
            Some(_) => self.samples as i64 - LOG_ELEMENTS as i64 + i as i64,
            None => i as i64,
        }
    }
}

async fn stop_mission(q: &Query) -> Result<()> {
    read_mem(q, 1, STOP_MISSION).await.map(drop)
}

async fn set_running(q: &Query, on: bool) -> Result<()> {
    let cr = read_byte(q, CONTROL).await?;
    let cr = if on { cr & !CLOCK_STOPPED } else { cr | CLOCK_STOPPED };
    write_mem(q, &[cr], CONTROL).await
}

async fn set_clock(q: &Query, t: &DateTime<Utc>) -> Result<()> {
    refuse_if_busy(q).await?;
    write_mem(q, &date::encode(t)?, RTC).await?;
    set_running(q, true).await
}

async fn clear_memory(q: &Query) -> Result<()> {
    let cr = read_byte(q, CONTROL).await?;
    write_mem(q, &[(cr & 0x3F) | ENABLE_CLEAR], CONTROL).await?;
    let log = TransactionLog::select()
        .matching(&[CLEAR_MEMORY])
        .delay(Duration::from_millis(1))
        .end();
    q.transaction(&log).await.map(drop)
}

/// Stop, validate, start the clock if needed, clear, then arm by writing
/// the sample rate in minutes.
async fn start_mission(q: &Query, minutes: u32) -> Result<()> {
    stop_mission(q).await?;
    if minutes == 0 {
        return Ok(());
    }
    if minutes > 255 {
        return Err(ERANGE.into());
    }
    if read_byte(q, CONTROL).await? & CLOCK_STOPPED != 0 {
        set_clock(q, &Utc::now()).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    clear_memory(q).await?;
    write_mem(q, &[minutes as u8], SAMPLE_RATE).await
}

/// The alarm log at `addr`: twelve (start sample, duration) pairs.
async fn alarm_log(q: &Query, addr: u16) -> Result<Vec<(u32, u8)>> {
    let data = read_mem(q, 4 * ALARM_ELEMENTS, addr).await?;
    Ok(data.chunks(4).map(|c| (u24(c), c[3])).collect())
}

// Property callbacks

fn r_memory(q: &Query, size: usize, offset: usize) -> BoxFuture<'_, Result<Vec<u8>>> {
    async move {
        if offset >= MEMORY_SIZE {
            return Ok(Vec::new());
        }
        read_mem(q, size.min(MEMORY_SIZE - offset), offset as u16).await
    }
    .boxed()
}

fn w_memory(q: &Query, data: Vec<u8>, offset: usize) -> BoxFuture<'_, Result<()>> {
    async move {
        if offset + data.len() > MEMORY_SIZE {
            return Err(ERANGE.into());
        }
        write_mem(q, &data, offset as u16).await
    }
    .boxed()
}

fn r_page(q: &Query, size: usize, offset: usize) -> BoxFuture<'_, Result<Vec<u8>>> {
    async move {
        if offset >= PAGE {
            return Ok(Vec::new());
        }
        let base = q.index()? * PAGE;
        read_mem(q, size.min(PAGE - offset), (base + offset) as u16).await
    }
    .boxed()
}

fn w_page(q: &Query, data: Vec<u8>, offset: usize) -> BoxFuture<'_, Result<()>> {
    async move {
        if offset + data.len() > PAGE {
            return Err(ERANGE.into());
        }
        let base = q.index()? * PAGE;
        write_page(q, &data, (base + offset) as u16).await
    }
    .boxed()
}

fn r_histogram_one(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let at = HISTOGRAM + 2 * q.index()? as u16;
        let d = read_mem(q, 2, at).await?;
        Ok(Value::Unsigned(u16::from_le_bytes([d[0], d[1]]) as u32))
    }
    .boxed()
}

fn r_histogram_all(q: &Query) -> BoxFuture<'_, Result<Vec<Value>>> {
    async move {
        let d = read_mem(q, 2 * HISTOGRAM_ELEMENTS, HISTOGRAM).await?;
        Ok(d.chunks(2)
            .map(|c| Value::Unsigned(u16::from_le_bytes([c[0], c[1]]) as u32))
            .collect())
    }
    .boxed()
}

fn r_histogram_elements(_q: &Query) -> BoxFuture<'_, Result<Value>> {
    async { Ok(Value::Unsigned(HISTOGRAM_ELEMENTS as u32)) }.boxed()
}

fn r_histogram_gap(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move { Ok(Value::TempGap(4.0 * version_of(q)?.resolution)) }.boxed()
}

fn histogram_bin(v: &Version, i: usize) -> Value {
    Value::Temperature(v.histolow + 4.0 * i as f64 * v.resolution)
}

fn r_histogram_temp_one(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move { Ok(histogram_bin(version_of(q)?, q.index()?)) }.boxed()
}

fn r_histogram_temp_all(q: &Query) -> BoxFuture<'_, Result<Vec<Value>>> {
    async move {
        let v = version_of(q)?;
        Ok((0..HISTOGRAM_ELEMENTS).map(|i| histogram_bin(v, i)).collect())
    }
    .boxed()
}

async fn clock(q: &Query) -> Result<DateTime<Utc>> {
    let d = read_mem(q, 7, RTC).await?;
    let mut rtc = [0u8; 7];
    rtc.copy_from_slice(&d);
    date::decode(&rtc)
}

fn r_date(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move { Ok(Value::Date(clock(q).await?)) }.boxed()
}

fn r_udate(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move { Ok(Value::Unsigned(clock(q).await?.timestamp() as u32)) }.boxed()
}

fn w_date(q: &Query, v: Value) -> BoxFuture<'_, Result<()>> {
    async move { set_clock(q, &v.as_date()?).await }.boxed()
}

/// Sets the clock registers without starting the oscillator.
fn w_udate(q: &Query, v: Value) -> BoxFuture<'_, Result<()>> {
    async move {
        let t = v.as_date()?;
        refuse_if_busy(q).await?;
        write_mem(q, &date::encode(&t)?, RTC).await
    }
    .boxed()
}

fn r_bit(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let Data::Bit { addr, bit, inverted } = q.property.data else {
            return Err(EINVAL.into());
        };
        let set = read_byte(q, addr).await? & (1 << bit) != 0;
        Ok(Value::Yesno(set != inverted))
    }
    .boxed()
}

/// Read-modify-write of one bit; not atomic against the device.
fn w_bit(q: &Query, v: Value) -> BoxFuture<'_, Result<()>> {
    async move {
        let Data::Bit { addr, bit, inverted } = q.property.data else {
            return Err(EINVAL.into());
        };
        let set = v.as_bool()? != inverted;
        let old = read_byte(q, addr).await?;
        let new = if set { old | (1 << bit) } else { old & !(1 << bit) };
        write_mem(q, &[new], addr).await
    }
    .boxed()
}

fn r_resolution(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move { Ok(Value::TempGap(version_of(q)?.resolution)) }.boxed()
}

fn r_templow(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move { Ok(Value::Temperature(version_of(q)?.rangelow)) }.boxed()
}

fn r_temphigh(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move { Ok(Value::Temperature(version_of(q)?.rangehigh)) }.boxed()
}

fn r_version(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let v = version(q.sn()).ok_or(ENOENT)?;
        Ok(Value::Ascii(v.name.to_owned()))
    }
    .boxed()
}

fn r_3byte(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move { Ok(Value::Unsigned(u24(&read_mem(q, 3, addr_of(q)).await?))) }.boxed()
}

/// Forced conversion; refused while a mission owns the sensor.
fn r_temperature(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let v = version_of(q)?;
        refuse_if_busy(q).await?;
        let log = TransactionLog::select().matching(&[CONVERT_TEMPERATURE]).end();
        q.transaction(&log).await?;
        tokio::time::sleep(v.delay).await;
        let raw = read_byte(q, TEMPERATURE).await?;
        Ok(Value::Temperature(raw_to_celsius(v, raw)))
    }
    .boxed()
}

fn w_mission_running(q: &Query, v: Value) -> BoxFuture<'_, Result<()>> {
    async move {
        if v.as_bool()? {
            let rate = read_byte(q, SAMPLE_RATE).await?;
            start_mission(q, rate as u32).await
        } else {
            stop_mission(q).await
        }
    }
    .boxed()
}

fn r_frequency(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move { Ok(Value::Unsigned(read_byte(q, SAMPLE_RATE).await? as u32)) }.boxed()
}

fn w_frequency(q: &Query, v: Value) -> BoxFuture<'_, Result<()>> {
    async move { start_mission(q, v.as_u32()?).await }.boxed()
}

fn r_interval(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move { Ok(Value::Unsigned(60 * read_byte(q, SAMPLE_RATE).await? as u32)) }.boxed()
}

/// Seconds, rounded up to whole minutes.
fn w_interval(q: &Query, v: Value) -> BoxFuture<'_, Result<()>> {
    async move { start_mission(q, v.as_u32()?.div_ceil(60)).await }.boxed()
}

fn r_delay(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let d = read_mem(q, 2, MISSION_DELAY).await?;
        Ok(Value::Unsigned(u16::from_le_bytes([d[0], d[1]]) as u32))
    }
    .boxed()
}

fn w_delay(q: &Query, v: Value) -> BoxFuture<'_, Result<()>> {
    async move {
        let minutes = u16::try_from(v.as_u32()?).map_err(|_| ERANGE)?;
        refuse_if_busy(q).await?;
        write_mem(q, &minutes.to_le_bytes(), MISSION_DELAY).await
    }
    .boxed()
}

fn r_mission_date(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move { Ok(Value::Date(Mission::fetch(q).await?.start)) }.boxed()
}

fn r_mission_udate(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move { Ok(Value::Unsigned(Mission::fetch(q).await?.start.timestamp() as u32)) }.boxed()
}

/// Stop the clock, clear rollover and delay, then start a mission.
fn w_easystart(q: &Query, v: Value) -> BoxFuture<'_, Result<()>> {
    async move {
        let minutes = v.as_u32()?;
        write_mem(q, &[0x86, 0, 0, 0, 0, 0, 0], CONTROL).await?;
        start_mission(q, minutes).await
    }
    .boxed()
}

fn alarm_addr(q: &Query) -> u16 {
    match q.property.parent() {
        Some("overtemp") => OVERTEMP_LOG,
        _ => UNDERTEMP_LOG,
    }
}

fn r_alarm_date(q: &Query) -> BoxFuture<'_, Result<Vec<Value>>> {
    async move {
        let m = Mission::fetch(q).await?;
        let log = alarm_log(q, alarm_addr(q)).await?;
        Ok(log.iter().map(|&(t, _)| Value::Date(m.at(t as i64))).collect())
    }
    .boxed()
}

fn r_alarm_udate(q: &Query) -> BoxFuture<'_, Result<Vec<Value>>> {
    async move {
        let m = Mission::fetch(q).await?;
        let log = alarm_log(q, alarm_addr(q)).await?;
        Ok(log
            .iter()
            .map(|&(t, _)| Value::Unsigned(m.at(t as i64).timestamp() as u32))
            .collect())
    }
    .boxed()
}

fn r_alarm_end(q: &Query) -> BoxFuture<'_, Result<Vec<Value>>> {
    async move {
        let m = Mission::fetch(q).await?;
        let log = alarm_log(q, alarm_addr(q)).await?;
        Ok(log
            .iter()
            .map(|&(t, c)| Value::Date(m.at(t as i64 + c as i64)))
            .collect())
    }
    .boxed()
}

fn r_alarm_count(q: &Query) -> BoxFuture<'_, Result<Vec<Value>>> {
    async move {
        let log = alarm_log(q, alarm_addr(q)).await?;
        Ok(log.iter().map(|&(_, c)| Value::Unsigned(c as u32)).collect())
    }
    .boxed()
}

fn r_alarm_elements(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let log = alarm_log(q, alarm_addr(q)).await?;
        let n = log.iter().take_while(|&&(_, c)| c != 0).count();
        Ok(Value::Unsigned(n as u32))
    }
    .boxed()
}

fn r_threshold(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let v = version_of(q)?;
        Ok(Value::Temperature(raw_to_celsius(v, read_byte(q, addr_of(q)).await?)))
    }
    .boxed()
}

fn w_threshold(q: &Query, t: Value) -> BoxFuture<'_, Result<()>> {
    async move {
        let v = version_of(q)?;
        let raw = celsius_to_raw(v, t.as_f64()?)?;
        refuse_if_busy(q).await?;
        write_mem(q, &[raw], addr_of(q)).await
    }
    .boxed()
}

fn r_log_temp_one(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let v = version_of(q)?;
        let m = Mission::fetch(q).await?;
        let i = q.index()?;
        let slot = m.wrapped().map_or(i, |off| (i + off) % LOG_ELEMENTS);
        let raw = read_byte(q, LOG + slot as u16).await?;
        Ok(Value::Temperature(raw_to_celsius(v, raw)))
    }
    .boxed()
}

fn r_log_temp_all(q: &Query) -> BoxFuture<'_, Result<Vec<Value>>> {
    async move {
        let v = version_of(q)?;
        let m = Mission::fetch(q).await?;
        let data = read_mem(q, LOG_ELEMENTS, LOG).await?;
        let off = m.wrapped().unwrap_or(0);
        Ok((0..LOG_ELEMENTS)
            .map(|i| Value::Temperature(raw_to_celsius(v, data[(i + off) % LOG_ELEMENTS])))
            .collect())
    }
    .boxed()
}

fn r_log_date_one(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let m = Mission::fetch(q).await?;
        Ok(Value::Date(m.at(m.step(q.index()?))))
    }
    .boxed()
}

fn r_log_date_all(q: &Query) -> BoxFuture<'_, Result<Vec<Value>>> {
    async move {
        let m = Mission::fetch(q).await?;
        Ok((0..LOG_ELEMENTS).map(|i| Value::Date(m.at(m.step(i)))).collect())
    }
    .boxed()
}

fn r_log_udate_one(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let m = Mission::fetch(q).await?;
        Ok(Value::Unsigned(m.at(m.step(q.index()?)).timestamp() as u32))
    }
    .boxed()
}

fn r_log_udate_all(q: &Query) -> BoxFuture<'_, Result<Vec<Value>>> {
    async move {
        let m = Mission::fetch(q).await?;
        Ok((0..LOG_ELEMENTS)
            .map(|i| Value::Unsigned(m.at(m.step(i)).timestamp() as u32))
            .collect())
    }
    .boxed()
}

fn r_log_elements(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let m = Mission::fetch(q).await?;
        Ok(Value::Unsigned(m.samples.min(LOG_ELEMENTS as u32)))
    }
    .boxed()
}

/// Alarm match registers keep the mask flag in bit 7.
fn r_alarm_time(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move { Ok(Value::Unsigned((read_byte(q, addr_of(q)).await? & 0x7F) as u32)) }.boxed()
}

fn w_alarm_time(q: &Query, v: Value) -> BoxFuture<'_, Result<()>> {
    async move {
        let value = v.as_u32()?;
        if value > 0x7F {
            return Err(ERANGE.into());
        }
        let addr = addr_of(q);
        let old = read_byte(q, addr).await?;
        write_mem(q, &[value as u8 | (old & 0x80)], addr).await
    }
    .boxed()
}

/// 0 for no time alarm, else 1 (every second) to 4 (match day of week).
fn r_alarm_trigger(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let d = read_mem(q, 4, ALARM_TIME).await?;
        let n = d.iter().position(|b| b & 0x80 != 0).map_or(0, |i| i + 1);
        Ok(Value::Unsigned(n as u32))
    }
    .boxed()
}

fn w_alarm_trigger(q: &Query, v: Value) -> BoxFuture<'_, Result<()>> {
    async move {
        let n = v.as_u32()? as usize;
        let mut d = read_mem(q, 4, ALARM_TIME).await?;
        for (i, b) in d.iter_mut().enumerate() {
            *b &= 0x7F;
            if n > 0 && i + 1 >= n {
                *b |= 0x80;
            }
        }
        write_mem(q, &d, ALARM_TIME).await
    }
    .boxed()
}

const fn bit(addr: u16, bit: u8) -> Data {
    Data::Bit { addr, bit, inverted: false }
}

const CLOCK_RUNNING: Data = Data::Bit { addr: CONTROL, bit: 7, inverted: true };

const PAGES: Aggregate = Aggregate::numbers(16, Layout::Separate);
const HISTOGRAM_AGG: Aggregate = Aggregate::numbers(HISTOGRAM_ELEMENTS, Layout::Mixed);
const LOG_AGG: Aggregate = Aggregate::numbers(LOG_ELEMENTS, Layout::Mixed);
const ALARM_AGG: Aggregate = Aggregate::numbers(ALARM_ELEMENTS, Layout::Aggregate);

use self::CacheClass::*;
use self::Format::*;

pub static DS1921: Family = Family {
    code: 0x21,
    name: "DS1921",
    flags: DevFlags::ALARM.union(DevFlags::TEMP).union(DevFlags::OVDR),
    properties: &[
        Property::leaf("memory", MEMORY_SIZE, Binary, Stable)
            .read(Read::Block(r_memory))
            .write(Write::Block(w_memory)),
        Property::subdir("pages"),
        Property::leaf("pages/page", PAGE, Binary, Stable)
            .aggregate(PAGES)
            .read(Read::Block(r_page))
            .write(Write::Block(w_page)),
        Property::subdir("histogram"),
        Property::leaf("histogram/counts", LEN_UNSIGNED, Unsigned, Volatile)
            .aggregate(HISTOGRAM_AGG)
            .read(Read::Mixed { one: r_histogram_one, all: r_histogram_all }),
        Property::leaf("histogram/elements", LEN_UNSIGNED, Unsigned, Static).read(Read::Scalar(r_histogram_elements)),
        Property::leaf("histogram/gap", LEN_TEMP, TempGap, Static).read(Read::Scalar(r_histogram_gap)),
        Property::leaf("histogram/temperature", LEN_TEMP, Temperature, Static)
            .aggregate(HISTOGRAM_AGG)
            .read(Read::Mixed { one: r_histogram_temp_one, all: r_histogram_temp_all }),
        Property::subdir("clock"),
        Property::leaf("clock/date", LEN_DATE, Date, Second)
            .read(Read::Scalar(r_date))
            .write(Write::Scalar(w_date)),
        Property::leaf("clock/udate", LEN_UNSIGNED, Unsigned, Second)
            .read(Read::Scalar(r_udate))
            .write(Write::Scalar(w_udate)),
        Property::leaf("clock/running", LEN_YESNO, Yesno, Stable)
            .read(Read::Scalar(r_bit))
            .write(Write::Scalar(w_bit))
            .data(CLOCK_RUNNING),
        Property::subdir("about"),
        Property::leaf("about/resolution", LEN_TEMP, TempGap, Static).read(Read::Scalar(r_resolution)),
        Property::leaf("about/templow", LEN_TEMP, Temperature, Static).read(Read::Scalar(r_templow)),
        Property::leaf("about/temphigh", LEN_TEMP, Temperature, Static).read(Read::Scalar(r_temphigh)),
        Property::leaf("about/version", 11, Ascii, Stable).read(Read::Scalar(r_version)),
        Property::leaf("about/samples", LEN_UNSIGNED, Unsigned, Volatile)
            .read(Read::Scalar(r_3byte))
            .data(Data::Addr(DEVICE_SAMPLES)),
        Property::leaf("about/measuring", LEN_YESNO, Yesno, Volatile)
            .read(Read::Scalar(r_bit))
            .data(bit(STATUS, 7)),
        Property::leaf("temperature", LEN_TEMP, Temperature, Volatile).read(Read::Scalar(r_temperature)),
        Property::subdir("mission"),
        Property::leaf("mission/running", LEN_YESNO, Yesno, Volatile)
            .read(Read::Scalar(r_bit))
            .write(Write::Scalar(w_mission_running))
            .data(bit(STATUS, STATUS_MIP)),
        Property::leaf("mission/frequency", LEN_UNSIGNED, Unsigned, Volatile)
            .read(Read::Scalar(r_frequency))
            .write(Write::Scalar(w_frequency)),
        Property::leaf("mission/interval", LEN_UNSIGNED, Unsigned, Volatile)
            .read(Read::Scalar(r_interval))
            .write(Write::Scalar(w_interval)),
        Property::leaf("mission/samples", LEN_UNSIGNED, Unsigned, Volatile)
            .read(Read::Scalar(r_3byte))
            .data(Data::Addr(MISSION_SAMPLES)),
        Property::leaf("mission/delay", LEN_UNSIGNED, Unsigned, Volatile)
            .read(Read::Scalar(r_delay))
            .write(Write::Scalar(w_delay)),
        Property::leaf("mission/rollover", LEN_YESNO, Yesno, Stable)
            .read(Read::Scalar(r_bit))
            .write(Write::Scalar(w_bit))
            .data(bit(CONTROL, 3)),
        Property::leaf("mission/date", LEN_DATE, Date, Volatile).read(Read::Scalar(r_mission_date)),
        Property::leaf("mission/udate", LEN_UNSIGNED, Unsigned, Volatile).read(Read::Scalar(r_mission_udate)),
        Property::leaf("mission/sampling", LEN_YESNO, Yesno, Volatile)
            .read(Read::Scalar(r_bit))
            .data(bit(STATUS, 4)),
        Property::leaf("mission/easystart", LEN_UNSIGNED, Unsigned, Stable).write(Write::Scalar(w_easystart)),
        Property::subdir("overtemp"),
        Property::leaf("overtemp/date", LEN_DATE, Date, Volatile)
            .aggregate(ALARM_AGG)
            .read(Read::Array(r_alarm_date)),
        Property::leaf("overtemp/udate", LEN_UNSIGNED, Unsigned, Volatile)
            .aggregate(ALARM_AGG)
            .read(Read::Array(r_alarm_udate)),
        Property::leaf("overtemp/end", LEN_DATE, Date, Volatile)
            .aggregate(ALARM_AGG)
            .read(Read::Array(r_alarm_end)),
        Property::leaf("overtemp/count", LEN_UNSIGNED, Unsigned, Volatile)
            .aggregate(ALARM_AGG)
            .read(Read::Array(r_alarm_count)),
        Property::leaf("overtemp/elements", LEN_UNSIGNED, Unsigned, Volatile).read(Read::Scalar(r_alarm_elements)),
        Property::leaf("overtemp/temperature", LEN_TEMP, Temperature, Stable)
            .read(Read::Scalar(r_threshold))
            .write(Write::Scalar(w_threshold))
            .data(Data::Addr(OVERTEMP_THRESHOLD)),
        Property::subdir("undertemp"),
        Property::leaf("undertemp/date", LEN_DATE, Date, Volatile)
            .aggregate(ALARM_AGG)
            .read(Read::Array(r_alarm_date)),
        Property::leaf("undertemp/udate", LEN_UNSIGNED, Unsigned, Volatile)
            .aggregate(ALARM_AGG)
            .read(Read::Array(r_alarm_udate)),
        Property::leaf("undertemp/end", LEN_DATE, Date, Volatile)
            .aggregate(ALARM_AGG)
            .read(Read::Array(r_alarm_end)),
        Property::leaf("undertemp/count", LEN_UNSIGNED, Unsigned, Volatile)
            .aggregate(ALARM_AGG)
            .read(Read::Array(r_alarm_count)),
        Property::leaf("undertemp/elements", LEN_UNSIGNED, Unsigned, Volatile).read(Read::Scalar(r_alarm_elements)),
        Property::leaf("undertemp/temperature", LEN_TEMP, Temperature, Stable)
            .read(Read::Scalar(r_threshold))
            .write(Write::Scalar(w_threshold))
            .data(Data::Addr(UNDERTEMP_THRESHOLD)),
        Property::subdir("log"),
        Property::leaf("log/temperature", LEN_TEMP, Temperature, Volatile)
            .aggregate(LOG_AGG)
            .read(Read::Mixed { one: r_log_temp_one, all: r_log_temp_all }),
        Property::leaf("log/date", LEN_DATE, Date, Volatile)
            .aggregate(LOG_AGG)
            .read(Read::Mixed { one: r_log_date_one, all: r_log_date_all }),
        Property::leaf("log/udate", LEN_UNSIGNED, Unsigned, Volatile)
            .aggregate(LOG_AGG)
            .read(Read::Mixed { one: r_log_udate_one, all: r_log_udate_all }),
        Property::leaf("log/elements", LEN_UNSIGNED, Unsigned, Volatile).read(Read::Scalar(r_log_elements)),
        Property::leaf("running", LEN_YESNO, Yesno, Stable)
            .read(Read::Scalar(r_bit))
            .write(Write::Scalar(w_bit))
            .data(CLOCK_RUNNING),
        Property::leaf("alarm_second", LEN_UNSIGNED, Unsigned, Stable)
            .read(Read::Scalar(r_alarm_time))
            .write(Write::Scalar(w_alarm_time))
            .data(Data::Addr(ALARM_TIME)),
        Property::leaf("alarm_minute", LEN_UNSIGNED, Unsigned, Stable)
            .read(Read::Scalar(r_alarm_time))
            .write(Write::Scalar(w_alarm_time))
            .data(Data::Addr(ALARM_TIME + 1)),
        Property::leaf("alarm_hour", LEN_UNSIGNED, Unsigned, Stable)
            .read(Read::Scalar(r_alarm_time))
            .write(Write::Scalar(w_alarm_time))
            .data(Data::Addr(ALARM_TIME + 2)),
        Property::leaf("alarm_dow", LEN_UNSIGNED, Unsigned, Stable)
            .read(Read::Scalar(r_alarm_time))
            .write(Write::Scalar(w_alarm_time))
            .data(Data::Addr(ALARM_TIME + 3)),
        Property::leaf("alarm_trigger", LEN_UNSIGNED, Unsigned, Stable)
            .read(Read::Scalar(r_alarm_trigger))
            .write(Write::Scalar(w_alarm_trigger)),
    ],
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::sim::{SimBus, SimDs1921};
    use crate::bus::BusMaster;
    use crate::cache::TtlCache;
    use crate::message::SemiGlobal;
    use crate::path::Extension;
    use std::sync::{Arc, Mutex};

    fn rig(sn: SerialNumber) -> (Device, Arc<Mutex<SimDs1921>>) {
        let chip = Arc::new(Mutex::new(SimDs1921::new(sn)));
        let bus = SimBus::new().with(chip.clone());
        let dev = Device {
            sn,
            bus: Arc::new(BusMaster::new(0, Box::new(bus))),
            internal: Arc::new(TtlCache::new(Duration::from_secs(300))),
        };
        (dev, chip)
    }

    fn query(dev: &Device, name: &str) -> Query {
        Query {
            dev: dev.clone(),
            property: DS1921.property(name).unwrap(),
            extension: Extension::None,
            sg: SemiGlobal::empty(),
        }
    }

    fn thermochron() -> SerialNumber {
        SerialNumber::new(0x21, [0xAA, 0xBB, 0xCC, 0xDD, 0x00, 0x00])
    }

    #[test]
    fn variant_lookup_is_exact() {
        for v in &VERSIONS {
            let sn = SerialNumber::new(0x21, [0, 0, 0, 0, ((v.id & 0x0F) << 4) as u8, (v.id >> 4) as u8]);
            assert_eq!(version(&sn), Some(v));
        }
        // between DS1921L-F50 (0x064) and DS1921L-F53 (0x15C)
        let sn = SerialNumber::new(0x21, [0, 0, 0, 0, 0x50, 0x06]);
        assert_eq!(variant_id(&sn), 0x065);
        assert_eq!(version(&sn), None);
        let sn = SerialNumber::new(0x21, [0, 0, 0, 0, 0xF0, 0xFF]);
        assert_eq!(version(&sn), None);
    }

    #[test]
    fn versions_sorted() {
        assert!(VERSIONS.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test(start_paused = true)]
    async fn paged_write_read_back() {
        let (dev, chip) = rig(thermochron());
        let q = query(&dev, "memory");
        let data: Vec<u8> = (0..70u8).map(|b| b.wrapping_mul(37)).collect();

        write_mem(&q, &data, 10).await.unwrap();
        assert_eq!(read_mem(&q, data.len(), 10).await.unwrap(), data);
        assert_eq!(&chip.lock().unwrap().memory()[10..80], &data[..]);
        assert_eq!(r_memory(&q, 4, 8).await.unwrap(), vec![0, 0, data[0], data[1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn corrupted_readback_is_not_committed() {
        let (dev, chip) = rig(thermochron());
        let q = query(&dev, "memory");
        chip.lock().unwrap().corrupt_next_readback();

        let err = write_mem(&q, &[1, 2, 3, 4], 0x40).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Transaction(TransactionError::Verify)));
        assert_eq!(&chip.lock().unwrap().memory()[0x40..0x44], &[0, 0, 0, 0]);

        // the corruption was one-shot
        write_mem(&q, &[1, 2, 3, 4], 0x40).await.unwrap();
        assert_eq!(&chip.lock().unwrap().memory()[0x40..0x44], &[1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_conversion() {
        let (dev, chip) = rig(thermochron());
        let q = query(&dev, "temperature");
        assert_eq!(r_temperature(&q).await.unwrap(), Value::Temperature(40.0));
        chip.lock().unwrap().set_temperature_raw(0x50);
        assert_eq!(r_temperature(&q).await.unwrap(), Value::Temperature(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn frequency_zero_stays_stopped() {
        let (dev, chip) = rig(thermochron());
        w_frequency(&query(&dev, "mission/frequency"), Value::Unsigned(0)).await.unwrap();
        assert!(!chip.lock().unwrap().mission_running());

        let err = w_frequency(&query(&dev, "mission/frequency"), Value::Unsigned(300)).await.unwrap_err();
        assert_eq!(err.errno(), ERANGE);
        assert!(!chip.lock().unwrap().mission_running());
    }

    #[tokio::test(start_paused = true)]
    async fn armed_mission_refuses_clock() {
        let (dev, chip) = rig(thermochron());
        w_interval(&query(&dev, "mission/interval"), Value::Unsigned(300)).await.unwrap();
        assert!(chip.lock().unwrap().mission_running());
        assert_eq!(chip.lock().unwrap().memory()[SAMPLE_RATE as usize], 5);
        assert_eq!(
            r_bit(&query(&dev, "mission/running")).await.unwrap(),
            Value::Yesno(true)
        );

        let before = chip.lock().unwrap().clock();
        let err = w_date(&query(&dev, "clock/date"), Value::Unsigned(0)).await.unwrap_err();
        assert_eq!(err.errno(), EBUSY);
        assert_eq!(chip.lock().unwrap().clock(), before);
        assert!(chip.lock().unwrap().mission_running());

        let err = w_delay(&query(&dev, "mission/delay"), Value::Unsigned(10)).await.unwrap_err();
        assert_eq!(err.errno(), EBUSY);

        w_mission_running(&query(&dev, "mission/running"), Value::Yesno(false)).await.unwrap();
        assert!(!chip.lock().unwrap().mission_running());
    }

    #[tokio::test(start_paused = true)]
    async fn log_follows_the_mission() {
        let (dev, chip) = rig(thermochron());
        w_frequency(&query(&dev, "mission/frequency"), Value::Unsigned(10)).await.unwrap();
        {
            let mut chip = chip.lock().unwrap();
            for raw in [0x50, 0x52, 0x54] {
                chip.record_sample(raw);
            }
        }
        assert_eq!(r_log_elements(&query(&dev, "log/elements")).await.unwrap(), Value::Unsigned(3));

        let mut q = query(&dev, "log/temperature");
        q.extension = Extension::Index(1);
        assert_eq!(r_log_temp_one(&q).await.unwrap(), Value::Temperature(1.0));

        let q = query(&dev, "log/date");
        let dates = r_log_date_all(&q).await.unwrap();
        let (Value::Date(d0), Value::Date(d1)) = (&dates[0], &dates[1]) else {
            panic!("{:?}", &dates[..2]);
        };
        assert_eq!((*d1 - *d0).num_seconds(), 600);

        // 0x50 and 0x52 land in bin 20, 0x54 in bin 21
        let mut q = query(&dev, "histogram/counts");
        q.extension = Extension::Index(20);
        assert_eq!(r_histogram_one(&q).await.unwrap(), Value::Unsigned(2));
        let all = r_histogram_all(&q).await.unwrap();
        assert_eq!(all[21], Value::Unsigned(1));
        assert_eq!(all.len(), HISTOGRAM_ELEMENTS);
    }

    #[tokio::test(start_paused = true)]
    async fn thresholds_and_alarm_fields() {
        let (dev, chip) = rig(thermochron());
        let q = query(&dev, "overtemp/temperature");
        w_threshold(&q, Value::Temperature(30.0)).await.unwrap();
        assert_eq!(chip.lock().unwrap().memory()[OVERTEMP_THRESHOLD as usize], 140);
        assert_eq!(r_threshold(&q).await.unwrap(), Value::Temperature(30.0));
        assert_eq!(
            w_threshold(&q, Value::Temperature(100.0)).await.unwrap_err().errno(),
            ERANGE
        );

        chip.lock().unwrap().memory_mut()[ALARM_TIME as usize + 1] = 0x80;
        let q = query(&dev, "alarm_minute");
        w_alarm_time(&q, Value::Unsigned(42)).await.unwrap();
        assert_eq!(chip.lock().unwrap().memory()[ALARM_TIME as usize + 1], 0x80 | 42);
        assert_eq!(r_alarm_time(&q).await.unwrap(), Value::Unsigned(42));

        let q = query(&dev, "alarm_trigger");
        w_alarm_trigger(&q, Value::Unsigned(3)).await.unwrap();
        assert_eq!(r_alarm_trigger(&q).await.unwrap(), Value::Unsigned(3));
    }

    #[tokio::test]
    async fn unknown_variant_is_an_error() {
        let (dev, _) = rig(SerialNumber::new(0x21, [0, 0, 0, 0, 0x50, 0x06]));
        assert_eq!(r_version(&query(&dev, "about/version")).await.unwrap_err().errno(), ENOENT);
        assert_eq!(r_resolution(&query(&dev, "about/resolution")).await.unwrap_err().errno(), EINVAL);
    }
}
