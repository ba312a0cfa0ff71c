//! Chip families and their property tables.

use futures::future::{BoxFuture, FutureExt};

use crate::filetype::{CacheClass, DevFlags, Family, Format, Property, Query, Read, Value};
use crate::utils::Result;

pub mod ds1921;
pub mod ds2502;
pub mod moat;

static FAMILIES: [&Family; 4] = [&ds1921::DS1921, &ds2502::DS2502, &ds2502::DS1982U, &moat::MOAT];

/// The family with code `code`, if it is one this library knows.
pub fn family(code: u8) -> Option<&'static Family> {
    FAMILIES.iter().copied().find(|f| f.code == code)
}

pub fn flags(code: u8) -> DevFlags {
    family(code).map(|f| f.flags).unwrap_or_default()
}

fn r_address(q: &Query) -> BoxFuture<'_, Result<Value>> {
    let hex: String = q.sn().bytes().iter().map(|b| format!("{:02X}", b)).collect();
    async move { Ok(Value::Ascii(hex)) }.boxed()
}

fn r_crc8(q: &Query) -> BoxFuture<'_, Result<Value>> {
    let crc = format!("{:02X}", q.sn().bytes()[7]);
    async move { Ok(Value::Ascii(crc)) }.boxed()
}

fn r_family(q: &Query) -> BoxFuture<'_, Result<Value>> {
    let code = format!("{:02X}", q.sn().family());
    async move { Ok(Value::Ascii(code)) }.boxed()
}

fn r_id(q: &Query) -> BoxFuture<'_, Result<Value>> {
    let id: String = q.sn().bytes()[1..7].iter().map(|b| format!("{:02X}", b)).collect();
    async move { Ok(Value::Ascii(id)) }.boxed()
}

fn r_type(q: &Query) -> BoxFuture<'_, Result<Value>> {
    let name = family(q.sn().family()).map_or("unknown", |f| f.name);
    async move { Ok(Value::Ascii(name.to_owned())) }.boxed()
}

/// Properties every known family has.
pub static STANDARD: [Property; 5] = [
    Property::leaf("address", 16, Format::Ascii, CacheClass::Static).read(Read::Scalar(r_address)),
    Property::leaf("crc8", 2, Format::Ascii, CacheClass::Static).read(Read::Scalar(r_crc8)),
    Property::leaf("family", 2, Format::Ascii, CacheClass::Static).read(Read::Scalar(r_family)),
    Property::leaf("id", 12, Format::Ascii, CacheClass::Static).read(Read::Scalar(r_id)),
    Property::leaf("type", 32, Format::Ascii, CacheClass::Static).read(Read::Scalar(r_type)),
];

/// Every property of family `code`; none for an unknown family.
pub fn properties(code: u8) -> impl Iterator<Item = &'static Property> {
    let own = family(code).map(|f| f.properties).unwrap_or(&[]);
    let standard = if own.is_empty() { &[][..] } else { &STANDARD[..] };
    standard.iter().chain(own.iter())
}

pub fn property(code: u8, name: &str) -> Option<&'static Property> {
    properties(code).find(|p| p.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filetype::Write;

    #[test]
    fn tables_are_well_formed() {
        for f in FAMILIES {
            for p in properties(f.code) {
                if p.is_subdir() {
                    assert!(!p.readable() && !p.writable(), "{}: {}", f.name, p.name);
                } else {
                    assert!(p.readable() || p.writable(), "{}: {}", f.name, p.name);
                    assert!(p.element_len() > 0, "{}: {}", f.name, p.name);
                }
                if let Some(dir) = p.parent() {
                    assert!(property(f.code, dir).is_some_and(Property::is_subdir), "{}: {}", f.name, p.name);
                }
                if let Read::Block(_) = p.read {
                    assert_eq!(p.format, Format::Binary, "{}: {}", f.name, p.name);
                }
                if let Write::Block(_) = p.write {
                    assert_eq!(p.format, Format::Binary, "{}: {}", f.name, p.name);
                }
            }
            let mut names: Vec<_> = properties(f.code).map(|p| p.name).collect();
            let n = names.len();
            names.sort_unstable();
            names.dedup();
            assert_eq!(names.len(), n, "{} has duplicate names", f.name);
        }
    }

    #[test]
    fn registry() {
        assert_eq!(family(0x21).unwrap().name, "DS1921");
        assert!(family(0x10).is_none());
        assert_eq!(properties(0x10).count(), 0);
        assert!(flags(0x21).contains(DevFlags::TEMP));
        assert!(property(0x09, "address").is_some());
    }
}
