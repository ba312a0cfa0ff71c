//! Text forms of property values.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

use crate::error::errno::*;
use crate::filetype::{Format, Length, Property, Value};
use crate::message::SemiGlobal;
use crate::path::Extension;
use crate::utils::Result;

/// Display form of dates, 24 characters wide
pub const DATE_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Format one value for a client with session flags `sg`.
pub fn format_value(v: &Value, sg: SemiGlobal) -> Vec<u8> {
    let scale = sg.temperature_scale();
    match *v {
        Value::Yesno(b) => if b { b"1".to_vec() } else { b"0".to_vec() },
        Value::Unsigned(u) => u.to_string().into_bytes(),
        Value::Integer(i) => i.to_string().into_bytes(),
        Value::Float(f) => format!("{:.2}", f).into_bytes(),
        Value::Temperature(c) => format!("{:.2}", scale.from_celsius(c)).into_bytes(),
        Value::TempGap(c) => format!("{:.2}", scale.gap_from_celsius(c)).into_bytes(),
        Value::Date(ref d) => d.format(DATE_FORMAT).to_string().into_bytes(),
        Value::Ascii(ref s) => s.clone().into_bytes(),
        Value::Binary(ref b) => b.clone(),
    }
}

/// Format the elements of an `ALL` read: comma separated, binary
/// concatenated.
pub fn format_values(values: &[Value], format: Format, sg: SemiGlobal) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, v) in values.iter().enumerate() {
        if i > 0 && format != Format::Binary {
            out.push(b',');
        }
        out.extend_from_slice(&format_value(v, sg));
    }
    out
}

fn text(data: &[u8]) -> Result<&str> {
    std::str::from_utf8(data).map(str::trim).map_err(|_| EINVAL.into())
}

fn parse_yesno(s: &str) -> Result<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "y" | "yes" | "on" => Ok(true),
        "0" | "n" | "no" | "off" => Ok(false),
        _ => Err(EINVAL.into()),
    }
}

fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(secs) = s.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0).ok_or_else(|| EINVAL.into());
    }
    // %e pads with a space, so normalise runs of blanks first
    let s = s.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&s, "%a %b %d %H:%M:%S %Y")
        .map(|t| Utc.from_utc_datetime(&t))
        .map_err(|_| EINVAL.into())
}

fn number<T: std::str::FromStr>(s: &str) -> Result<T> {
    s.parse().map_err(|_| EINVAL.into())
}

/// Parse one written value.
pub fn parse_value(format: Format, data: &[u8], sg: SemiGlobal) -> Result<Value> {
    let scale = sg.temperature_scale();
    Ok(match format {
        Format::Binary => Value::Binary(data.to_vec()),
        Format::Ascii => Value::Ascii(String::from_utf8(data.to_vec()).map_err(|_| EINVAL)?),
        Format::Yesno => Value::Yesno(parse_yesno(text(data)?)?),
        Format::Unsigned => Value::Unsigned(number(text(data)?)?),
        Format::Integer => Value::Integer(number(text(data)?)?),
        Format::Float => Value::Float(number(text(data)?)?),
        Format::Temperature => Value::Temperature(scale.to_celsius(number(text(data)?)?)),
        Format::TempGap => Value::TempGap(number::<f64>(text(data)?)? / scale.gap_from_celsius(1.0)),
        Format::Date => Value::Date(parse_date(text(data)?)?),
    })
}

/// Parse the comma separated elements of an `ALL` write.
pub fn parse_values(format: Format, data: &[u8], elements: usize, sg: SemiGlobal) -> Result<Vec<Value>> {
    if format == Format::Binary {
        return Err(EINVAL.into());
    }
    let values = data
        .split(|&b| b == b',')
        .map(|part| parse_value(format, part, sg))
        .collect::<Result<Vec<_>>>()?;
    if values.len() != elements {
        return Err(EINVAL.into());
    }
    Ok(values)
}

/// Declared size of a property read with extension `ext`.
pub fn formatted_size(p: &Property, ext: Extension) -> usize {
    let len = match p.len {
        Length::Subdir => return 0,
        Length::Bytes(n) => n,
    };
    match (ext, p.aggregate) {
        (Extension::All, Some(agg)) if p.format == Format::Binary => agg.elements * len,
        (Extension::All, Some(agg)) => agg.elements * len + agg.elements.saturating_sub(1),
        _ => len,
    }
}

/// Apply a client's offset and size to formatted output.
pub fn window(mut data: Vec<u8>, size: usize, offset: usize) -> Vec<u8> {
    if offset >= data.len() {
        return Vec::new();
    }
    data.drain(..offset);
    data.truncate(size);
    data
}
