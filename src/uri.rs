// vim: tw=80
//! Device URI grammar for assembling RAID sets.
//!
//! ```text
//! raid<mode>:<backend>[,<backend>]*
//! backend := dev:<name> | zonefs:<path>
//! mode    := c | 0 | 1 | a
//! ```
//!
//! The tools layer parses a URI into a [`RaidUri`] and constructs the
//! matching backends itself; this module knows nothing about drivers.

use std::{fmt, path::PathBuf, str::FromStr};

use crate::{raid::RaidMode, types::*};

/// One backend named by a RAID device URI.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BackendSpec {
    /// A raw zoned block device, e.g. `dev:nullb0`
    Dev(String),
    /// A zonefs mount exposing one file per zone
    Zonefs(PathBuf),
}

impl fmt::Display for BackendSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendSpec::Dev(name) => write!(f, "dev:{name}"),
            BackendSpec::Zonefs(path) =>
                write!(f, "zonefs:{}", path.display()),
        }
    }
}

impl FromStr for BackendSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(name) = s.strip_prefix("dev:") {
            if name.is_empty() {
                return Err(Error::EINVAL);
            }
            Ok(BackendSpec::Dev(name.to_string()))
        } else if let Some(path) = s.strip_prefix("zonefs:") {
            if path.is_empty() {
                return Err(Error::EINVAL);
            }
            Ok(BackendSpec::Zonefs(PathBuf::from(path)))
        } else {
            Err(Error::EINVAL)
        }
    }
}

/// A parsed RAID device URI: the main mode and the ordered backends.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaidUri {
    pub mode: RaidMode,
    pub backends: Vec<BackendSpec>,
}

impl fmt::Display for RaidUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "raid{}:", self.mode)?;
        for (i, b) in self.backends.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{b}")?;
        }
        Ok(())
    }
}

impl FromStr for RaidUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s.strip_prefix("raid").ok_or(Error::EINVAL)?;
        let (mode, backends) = rest.split_once(':').ok_or(Error::EINVAL)?;
        let mode = mode.parse()?;
        let backends = backends.split(',')
            .map(str::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(RaidUri { mode, backends })
    }
}

// LCOV_EXCL_STOP
