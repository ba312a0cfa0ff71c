//! Path parsing.
//!
//! `/[uncached/][bus.N/][<sn>[/<property>[.<ext>]]]`

use crate::devices;
use crate::error::errno::*;
use crate::filetype::{Index, Property};
use crate::sn::SerialNumber;
use crate::utils::Result;

const UNCACHED: &str = "uncached";
const BUS_PREFIX: &str = "bus.";

/// Element selection of an aggregate property.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Extension {
    /// Scalar property, or no property at all
    #[default]
    None,
    All,
    Index(usize),
}

#[derive(Clone, Debug)]
pub struct ParsedPath {
    pub raw: String,
    pub bus: Option<usize>,
    pub uncached: bool,
    pub sn: Option<SerialNumber>,
    pub property: Option<&'static Property>,
    pub extension: Extension,
    /// Set when the path names a property subdirectory
    pub subdir: Option<&'static str>,
}

fn extension(p: &Property, ext: Option<&str>) -> Result<Extension> {
    let (agg, ext) = match (p.aggregate, ext) {
        (None, None) => return Ok(Extension::None),
        (Some(agg), Some(ext)) => (agg, ext),
        _ => return Err(ENOENT.into()),
    };
    let i = match (ext, agg.index) {
        ("ALL", _) => return Ok(Extension::All),
        (_, Index::Numbers) => ext.parse::<usize>().map_err(|_| ENOENT)?,
        (_, Index::Letters) => match ext.as_bytes() {
            [c @ b'A'..=b'Z'] => (c - b'A') as usize,
            _ => return Err(ENOENT.into()),
        },
    };
    if i >= agg.elements {
        return Err(ENOENT.into());
    }
    Ok(Extension::Index(i))
}

impl ParsedPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut parsed = ParsedPath {
            raw: raw.to_owned(),
            bus: None,
            uncached: false,
            sn: None,
            property: None,
            extension: Extension::None,
            subdir: None,
        };

        let trimmed = raw.trim_start_matches('/').trim_end_matches('/');
        if trimmed.is_empty() {
            return Ok(parsed);
        }
        let parts: Vec<&str> = trimmed.split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(EINVAL.into());
        }

        let mut rest = &parts[..];
        while let Some((first, tail)) = rest.split_first() {
            if *first == UNCACHED && !parsed.uncached {
                parsed.uncached = true;
            } else if let Some(n) = first.strip_prefix(BUS_PREFIX).filter(|_| parsed.bus.is_none()) {
                parsed.bus = Some(n.parse().map_err(|_| ENOENT)?);
            } else {
                break;
            }
            rest = tail;
        }

        let Some((first, props)) = rest.split_first() else {
            return Ok(parsed);
        };
        if !SerialNumber::looks_like(first) {
            return Err(ENOENT.into());
        }
        let sn: SerialNumber = first.parse()?;
        parsed.sn = Some(sn);
        if props.is_empty() {
            return Ok(parsed);
        }

        let joined = props.join("/");
        if let Some(dir) = devices::property(sn.family(), &joined).filter(|p| p.is_subdir()) {
            parsed.subdir = Some(dir.name);
            return Ok(parsed);
        }

        let (name, ext) = match joined.rsplit_once('.') {
            Some((name, ext)) if !ext.contains('/') => (name, Some(ext)),
            _ => (joined.as_str(), None),
        };
        let p = devices::property(sn.family(), name)
            .filter(|p| !p.is_subdir())
            .ok_or(ENOENT)?;
        parsed.extension = extension(p, ext)?;
        parsed.property = Some(p);
        Ok(parsed)
    }

    /// No device named: the root or a bus directory.
    pub fn is_root(&self) -> bool {
        self.sn.is_none()
    }

    /// The same path without its `bus.N` component, for a remote leg.
    pub fn busless(&self) -> String {
        let kept: Vec<&str> = self
            .raw
            .split('/')
            .filter(|c| !c.is_empty())
            .filter(|c| !(self.bus.is_some() && c.starts_with(BUS_PREFIX) && c[BUS_PREFIX.len()..].parse::<usize>().is_ok()))
            .collect();
        format!("/{}", kept.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_and_bus() {
        let p = ParsedPath::parse("/").unwrap();
        assert!(p.is_root());
        let p = ParsedPath::parse("/uncached/bus.1").unwrap();
        assert!(p.uncached);
        assert_eq!(p.bus, Some(1));
        assert!(p.is_root());
    }

    #[test]
    fn device_property_and_extension() {
        let p = ParsedPath::parse("/bus.0/21.AABBCCDD0000/log/temperature.7").unwrap();
        assert_eq!(p.sn.unwrap().family(), 0x21);
        assert_eq!(p.property.unwrap().name, "log/temperature");
        assert_eq!(p.extension, Extension::Index(7));
        assert_eq!(p.busless(), "/21.AABBCCDD0000/log/temperature.7");

        let p = ParsedPath::parse("/21.AABBCCDD0000/pages/page.ALL").unwrap();
        assert_eq!(p.extension, Extension::All);

        let p = ParsedPath::parse("/21.AABBCCDD0000/mission").unwrap();
        assert_eq!(p.subdir, Some("mission"));
        assert!(p.property.is_none());
    }

    #[test]
    fn bad_paths() {
        for bad in [
            "/21.AABBCCDD0000/nonsense",
            "/21.AABBCCDD0000/temperature.3",
            "/21.AABBCCDD0000/pages/page",
            "/21.AABBCCDD0000/pages/page.16",
            "/notadevice",
        ] {
            assert_eq!(ParsedPath::parse(bad).unwrap_err().errno(), ENOENT, "{}", bad);
        }
        assert_eq!(ParsedPath::parse("/21.AABBCCDD0000//temperature").unwrap_err().errno(), EINVAL);
    }

    #[test]
    fn unknown_family_has_no_properties() {
        let p = ParsedPath::parse("/10.AABBCCDDEEFF").unwrap();
        assert_eq!(p.sn.unwrap().family(), 0x10);
        assert!(ParsedPath::parse("/10.AABBCCDDEEFF/temperature").is_err());
    }
}
