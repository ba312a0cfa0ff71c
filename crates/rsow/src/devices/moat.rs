//! MoaT: microcontroller slaves that describe their own features.
//!
//! Every register is addressed by a (type, subtype) pair and moved with the
//! `F2`/`F4` sub-protocol: header, length byte, body, CRC16 over all of it,
//! then the CRC sent back inverted as an acknowledgement. Which ports,
//! channels and counters exist is read from the device and kept in the
//! internal cache.

use enum_primitive::*;
use futures::future::{BoxFuture, FutureExt};
use log::debug;

use crate::error::errno::*;
use crate::filetype::*;
use crate::path::Extension;
use crate::transaction::TransactionLog;
use crate::utils::Result;

pub const READ_MOAT: u8 = 0xF2;
pub const WRITE_MOAT: u8 = 0xF4;

/// Longest register body
const MAX_BODY: usize = 255;
const MAX_PORTS: usize = 32;

const FEATURES: &str = "moat/features";
const CONFIGS: &str = "moat/configs";
const ALARMS: &str = "moat/alarms";

enum_from_primitive! {
    #[doc = "Register types, also the index into the feature map"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum Feature {
        Config      = 0,
        Alarm       = 1,
        Console     = 2,
        Port        = 3,
        Smoke       = 4,
        Temp        = 5,
        Humid       = 6,
        Adc         = 7,
        Pid         = 8,
        Pwm         = 9,
        Count       = 10,
        Stats       = 11,
    }
}

const FEATURE_NAMES: [&str; Feature::COUNT] = [
    "config", "alarm", "console", "port", "smoke", "temp", "humid", "adc", "pid", "pwm", "count", "stats",
];

impl Feature {
    pub const COUNT: usize = 12;

    pub fn name(self) -> &'static str {
        FEATURE_NAMES[self as usize]
    }
}

enum_from_primitive! {
    #[doc = "Subtypes of the config register"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub enum ConfigItem {
        Loader      = 0,
        Rtc         = 1,
        Crystal     = 2,
        Euid        = 3,
        Nums        = 4,
        Name        = 5,
        List        = 6,
    }
}

pub const CFG_MAX: usize = 7;

fn bit(map: &[u8], n: usize) -> bool {
    map.get(n >> 3).is_some_and(|b| b & (1 << (n & 7)) != 0)
}

async fn read_std(q: &Query, typ: u8, stype: u8, max: usize) -> Result<Vec<u8>> {
    let log = TransactionLog::select()
        .matching(&[READ_MOAT, typ, stype])
        .read_counted(max)
        .crc16()
        .ack_crc16()
        .end();
    let body = q.transaction(&log).await?.into_first();
    debug!("{}: read {}/{}: {} bytes", q.sn(), typ, stype, body.len());
    Ok(body)
}

async fn write_std(q: &Query, typ: u8, stype: u8, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    if data.len() > MAX_BODY {
        return Err(EMSGSIZE.into());
    }
    let mut cmd = vec![WRITE_MOAT, typ, stype, data.len() as u8];
    cmd.extend_from_slice(data);
    let log = TransactionLog::select().matching(&cmd).crc16().ack_crc16().end();
    q.transaction(&log).await?;
    debug!("{}: wrote {}/{}: {} bytes", q.sn(), typ, stype, data.len());
    Ok(())
}

/// How many of each feature the device has.
async fn features(q: &Query) -> Result<Vec<u8>> {
    if let Some(map) = q.cached(FEATURES) {
        return Ok(map);
    }
    let mut map = read_std(q, Feature::Config as u8, ConfigItem::Nums as u8, Feature::COUNT).await?;
    // older firmware knows fewer types
    map.resize(Feature::COUNT, 0);
    q.cache(FEATURES, map.clone());
    Ok(map)
}

/// Bitmap of the config items the device answers.
async fn configs(q: &Query) -> Result<Vec<u8>> {
    if let Some(map) = q.cached(CONFIGS) {
        return Ok(map);
    }
    let mut map = read_std(q, Feature::Config as u8, ConfigItem::List as u8, CFG_MAX.div_ceil(8)).await?;
    map.resize(CFG_MAX.div_ceil(8), 0);
    q.cache(CONFIGS, map.clone());
    Ok(map)
}

/// Bitmap of the feature types currently raising the alarm.
async fn alarms(q: &Query, fresh: bool) -> Result<Vec<u8>> {
    if !fresh {
        if let Some(map) = q.cached(ALARMS) {
            return Ok(map);
        }
    }
    let mut map = read_std(q, Feature::Alarm as u8, 0, Feature::COUNT.div_ceil(8)).await?;
    map.resize(Feature::COUNT.div_ceil(8), 0);
    q.cache(ALARMS, map.clone());
    Ok(map)
}

fn type_of(q: &Query) -> u8 {
    match q.property.data {
        Data::Type(t) => t,
        _ => Feature::Config as u8,
    }
}

/// Device element numbers start at 1.
fn element(q: &Query) -> Result<u8> {
    match q.extension {
        Extension::Index(0) => Err(EINVAL.into()),
        Extension::Index(i) => Ok(i as u8),
        _ => Err(EINVAL.into()),
    }
}

// Visibility

fn show_entry(q: &Query) -> BoxFuture<'_, bool> {
    async move {
        let Extension::Index(i) = q.extension else {
            return false;
        };
        if i == 0 {
            return false;
        }
        match features(q).await {
            Ok(map) => i <= map[type_of(q) as usize] as usize,
            Err(_) => false,
        }
    }
    .boxed()
}

fn show_entries(q: &Query) -> BoxFuture<'_, bool> {
    async move { features(q).await.is_ok_and(|map| map[type_of(q) as usize] != 0) }.boxed()
}

fn show_one_config(q: &Query) -> BoxFuture<'_, bool> {
    async move { configs(q).await.is_ok_and(|map| bit(&map, type_of(q) as usize)) }.boxed()
}

fn show_config(q: &Query) -> BoxFuture<'_, bool> {
    async move {
        match q.extension {
            Extension::Index(i) if i < CFG_MAX => configs(q).await.is_ok_and(|map| bit(&map, i)),
            _ => false,
        }
    }
    .boxed()
}

fn show_alarm(q: &Query) -> BoxFuture<'_, bool> {
    async move { alarms(q, false).await.is_ok_and(|map| bit(&map, type_of(q) as usize)) }.boxed()
}

// Readers and writers

fn ascii(body: Vec<u8>) -> Value {
    Value::Ascii(String::from_utf8_lossy(&body).into_owned())
}

fn r_config_name(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move { Ok(ascii(read_std(q, Feature::Config as u8, ConfigItem::Name as u8, MAX_BODY).await?)) }.boxed()
}

/// `port=4` lines for every feature present.
fn r_types(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let map = features(q).await?;
        let mut out = String::new();
        for (name, &n) in FEATURE_NAMES.iter().zip(&map) {
            if n != 0 {
                out.push_str(&format!("{}={}\n", name, n));
            }
        }
        Ok(Value::Ascii(out))
    }
    .boxed()
}

fn r_console(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move { Ok(ascii(read_std(q, Feature::Console as u8, 1, MAX_BODY).await?)) }.boxed()
}

fn w_console(q: &Query, v: Value) -> BoxFuture<'_, Result<()>> {
    async move {
        let Value::Ascii(text) = v else {
            return Err(EINVAL.into());
        };
        write_std(q, Feature::Console as u8, 1, text.as_bytes()).await
    }
    .boxed()
}

fn r_port(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let body = read_std(q, Feature::Port as u8, element(q)?, 1).await?;
        match body[..] {
            [b] => Ok(Value::Yesno(b & 0x80 != 0)),
            _ => Err(EINVAL.into()),
        }
    }
    .boxed()
}

fn w_port(q: &Query, v: Value) -> BoxFuture<'_, Result<()>> {
    async move { write_std(q, Feature::Port as u8, element(q)?, &[v.as_bool()? as u8]).await }.boxed()
}

/// Every port as `1,0,...` from the port bitmap.
fn r_ports(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let count = features(q).await?[Feature::Port as usize] as usize;
        let map = read_std(q, Feature::Port as u8, 0, count.div_ceil(8)).await?;
        let states: Vec<&str> = (0..count).map(|i| if bit(&map, i) { "1" } else { "0" }).collect();
        Ok(Value::Ascii(states.join(",")))
    }
    .boxed()
}

/// A channel register: a status byte and three big-endian words.
async fn channel(q: &Query, typ: Feature) -> Result<[u16; 3]> {
    let body = read_std(q, typ as u8, element(q)?, 7).await?;
    if body.len() != 7 {
        return Err(EINVAL.into());
    }
    let word = |i: usize| u16::from_be_bytes([body[i], body[i + 1]]);
    Ok([word(1), word(3), word(5)])
}

/// Two comma separated numbers, each at most `max`.
fn pair(v: &Value, max: u32) -> Result<[u8; 4]> {
    let Value::Ascii(ref s) = *v else {
        return Err(EINVAL.into());
    };
    let (a, b) = s.trim_end_matches('\n').split_once(',').ok_or(EINVAL)?;
    let a: u32 = a.trim().parse().map_err(|_| EINVAL)?;
    let b: u32 = b.trim().parse().map_err(|_| EINVAL)?;
    if a > max || b > max {
        return Err(EINVAL.into());
    }
    let [a0, a1] = (a as u16).to_be_bytes();
    let [b0, b1] = (b as u16).to_be_bytes();
    Ok([a0, a1, b0, b1])
}

fn r_pwm(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let [_, on, off] = channel(q, Feature::Pwm).await?;
        Ok(Value::Ascii(format!("{},{}", on, off)))
    }
    .boxed()
}

/// `on,off` in timer ticks, each below 32768.
fn w_pwm(q: &Query, v: Value) -> BoxFuture<'_, Result<()>> {
    async move { write_std(q, Feature::Pwm as u8, element(q)?, &pair(&v, 32767)?).await }.boxed()
}

fn r_adc(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let [value, lower, upper] = channel(q, Feature::Adc).await?;
        Ok(Value::Ascii(format!("{}, {},{}", value, lower, upper)))
    }
    .boxed()
}

/// Alarm thresholds `lower,upper`.
fn w_adc(q: &Query, v: Value) -> BoxFuture<'_, Result<()>> {
    async move { write_std(q, Feature::Adc as u8, element(q)?, &pair(&v, 65535)?).await }.boxed()
}

fn r_count(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let body = read_std(q, Feature::Count as u8, element(q)?, 4).await?;
        Ok(Value::Unsigned(body.iter().fold(0, |acc, &b| acc << 8 | b as u32)))
    }
    .boxed()
}

fn r_alarm_sources(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let map = alarms(q, true).await?;
        let names: Vec<&str> = (0..Feature::COUNT)
            .filter(|&i| bit(&map, i))
            .map(|i| FEATURE_NAMES[i])
            .collect();
        Ok(Value::Ascii(names.join(",")))
    }
    .boxed()
}

/// Element numbers whose alarm bit is set.
fn r_alarm(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let map = read_std(q, Feature::Alarm as u8, type_of(q), 4).await?;
        let set: Vec<String> = (0..map.len() * 8)
            .filter(|&i| bit(&map, i))
            .map(|i| (i + 1).to_string())
            .collect();
        Ok(Value::Ascii(set.join(",")))
    }
    .boxed()
}

/// ADC alarms have two bits per channel: below and above range.
fn r_alarm_two(q: &Query) -> BoxFuture<'_, Result<Value>> {
    async move {
        let map = read_std(q, Feature::Alarm as u8, type_of(q), 8).await?;
        let mut set = Vec::new();
        for ch in 0..map.len() * 4 {
            if bit(&map, 2 * ch) {
                set.push(format!("-{}", ch + 1));
            }
            if bit(&map, 2 * ch + 1) {
                set.push(format!("+{}", ch + 1));
            }
        }
        Ok(Value::Ascii(set.join(",")))
    }
    .boxed()
}

fn r_raw(q: &Query, size: usize, offset: usize) -> BoxFuture<'_, Result<Vec<u8>>> {
    async move {
        let stype = match (type_of(q), q.extension) {
            // config items are numbered from 0
            (0, Extension::Index(i)) => i as u8,
            _ => element(q)?,
        };
        let body = read_std(q, type_of(q), stype, MAX_BODY).await?;
        Ok(body.into_iter().skip(offset).take(size).collect())
    }
    .boxed()
}

fn r_raw_all(q: &Query, size: usize, offset: usize) -> BoxFuture<'_, Result<Vec<u8>>> {
    async move {
        let body = read_std(q, type_of(q), 0, MAX_BODY).await?;
        Ok(body.into_iter().skip(offset).take(size).collect())
    }
    .boxed()
}

fn w_raw(q: &Query, data: Vec<u8>, offset: usize) -> BoxFuture<'_, Result<()>> {
    async move {
        if offset != 0 {
            return Err(EINVAL.into());
        }
        write_std(q, type_of(q), element(q)?, &data).await
    }
    .boxed()
}

const PORTS: Aggregate = Aggregate::numbers(MAX_PORTS, Layout::Separate);
const CONFIG_ITEMS: Aggregate = Aggregate::numbers(CFG_MAX, Layout::Separate);

const fn ty(f: Feature) -> Data {
    Data::Type(f as u8)
}

const fn alarm(name: &'static str, f: Feature) -> Property {
    Property::leaf(name, MAX_BODY, Format::Ascii, CacheClass::Volatile)
        .read(Read::Scalar(r_alarm))
        .visible(show_alarm)
        .data(ty(f))
}

const fn raw(name: &'static str, f: Feature) -> Property {
    Property::leaf(name, MAX_BODY, Format::Binary, CacheClass::Uncached)
        .aggregate(PORTS)
        .read(Read::Block(r_raw))
        .write(Write::Block(w_raw))
        .visible(show_entry)
        .data(ty(f))
}

const fn raw_all(name: &'static str, f: Feature) -> Property {
    Property::leaf(name, MAX_BODY, Format::Binary, CacheClass::Uncached)
        .read(Read::Block(r_raw_all))
        .visible(show_entries)
        .data(ty(f))
}

use self::Feature::*;

pub static MOAT: Family = Family {
    code: 0xF0,
    name: "MoaT",
    flags: DevFlags::ALARM,
    properties: &[
        Property::subdir("config"),
        Property::leaf("config/name", MAX_BODY, Format::Ascii, CacheClass::Static)
            .read(Read::Scalar(r_config_name))
            .visible(show_one_config)
            .data(Data::Type(ConfigItem::Name as u8)),
        Property::leaf("config/types", MAX_BODY, Format::Ascii, CacheClass::Static)
            .read(Read::Scalar(r_types))
            .visible(show_one_config)
            .data(Data::Type(ConfigItem::Nums as u8)),
        Property::leaf("console", MAX_BODY, Format::Ascii, CacheClass::Uncached)
            .read(Read::Scalar(r_console))
            .write(Write::Scalar(w_console)),
        Property::leaf("port", LEN_YESNO, Format::Yesno, CacheClass::Volatile)
            .aggregate(PORTS)
            .read(Read::Scalar(r_port))
            .write(Write::Scalar(w_port))
            .visible(show_entry)
            .data(ty(Port)),
        Property::leaf("ports", MAX_BODY, Format::Ascii, CacheClass::Volatile)
            .read(Read::Scalar(r_ports))
            .visible(show_entries)
            .data(ty(Port)),
        Property::leaf("pwm", 20, Format::Ascii, CacheClass::Stable)
            .aggregate(PORTS)
            .read(Read::Scalar(r_pwm))
            .write(Write::Scalar(w_pwm))
            .visible(show_entry)
            .data(ty(Pwm)),
        Property::leaf("adc", 30, Format::Ascii, CacheClass::Stable)
            .aggregate(PORTS)
            .read(Read::Scalar(r_adc))
            .write(Write::Scalar(w_adc))
            .visible(show_entry)
            .data(ty(Adc)),
        Property::leaf("count", LEN_UNSIGNED, Format::Unsigned, CacheClass::Volatile)
            .aggregate(PORTS)
            .read(Read::Scalar(r_count))
            .visible(show_entry)
            .data(ty(Count)),
        Property::subdir("alarm"),
        Property::leaf("alarm/sources", MAX_BODY, Format::Ascii, CacheClass::Volatile)
            .read(Read::Scalar(r_alarm_sources)),
        alarm("alarm/config", Config),
        alarm("alarm/alarm", Alarm),
        alarm("alarm/stats", Stats),
        alarm("alarm/console", Console),
        alarm("alarm/port", Port),
        alarm("alarm/pwm", Pwm),
        alarm("alarm/count", Count),
        Property::leaf("alarm/adc", MAX_BODY, Format::Ascii, CacheClass::Volatile)
            .read(Read::Scalar(r_alarm_two))
            .visible(show_alarm)
            .data(ty(Adc)),
        alarm("alarm/temp", Temp),
        alarm("alarm/humid", Humid),
        alarm("alarm/pid", Pid),
        alarm("alarm/smoke", Smoke),
        Property::subdir("raw"),
        Property::leaf("raw/config", MAX_BODY, Format::Binary, CacheClass::Static)
            .aggregate(CONFIG_ITEMS)
            .read(Read::Block(r_raw))
            .visible(show_config)
            .data(ty(Config)),
        raw("raw/alarm", Alarm),
        raw_all("raw/alarms", Alarm),
        raw("raw/stat", Stats),
        raw_all("raw/stats", Stats),
        raw("raw/port", Port),
        raw_all("raw/ports", Port),
        raw("raw/smoke", Smoke),
        raw_all("raw/smokes", Smoke),
        raw("raw/temp", Temp),
        raw_all("raw/temps", Temp),
        raw("raw/humid", Humid),
        raw_all("raw/humids", Humid),
        raw("raw/adc", Adc),
        raw_all("raw/adcs", Adc),
        raw("raw/pid", Pid),
        raw_all("raw/pids", Pid),
        raw("raw/pwm", Pwm),
        raw_all("raw/pwms", Pwm),
        raw("raw/count", Count),
        raw_all("raw/counts", Count),
    ],
};
