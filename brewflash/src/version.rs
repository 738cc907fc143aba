//! Firmware version reported by the controller.
//!
//! Newer firmware answers the version query with a JSON object:
//!
//! ```text
//! N:{"v":"0.2.4","n":"8fd5b4e","b":"s"}
//! ```
//!
//! Older releases answer with a bare dotted string (`N:0.2.0`). Both shapes
//! parse into [`FirmwareVersion`]; anything else leaves the version unknown,
//! which callers model as `Option::None`.

use {
    crate::error::{Error, Result},
    serde_json::Value,
    std::{cmp::Ordering, fmt, str::FromStr},
};

/// Firmware version triple with optional build metadata.
///
/// Ordering and equality consider only `(major, minor, revision)`.
#[derive(Debug, Clone)]
pub struct FirmwareVersion {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Revision.
    pub revision: u32,
    /// Free-form build identifier (commit hash, build date).
    pub build: Option<String>,
    /// Board identifier reported alongside the version.
    pub board: Option<String>,
}

impl FirmwareVersion {
    /// Create a version without build metadata.
    pub fn new(major: u32, minor: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            revision,
            build: None,
            board: None,
        }
    }

    /// The comparable triple.
    pub fn triple(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.revision)
    }

    /// Parse the payload of a version report (the text after `N:`).
    pub fn from_report(payload: &str) -> Result<Self> {
        let payload = payload.trim();
        if !payload.starts_with('{') {
            return payload.parse();
        }

        let value: Value = serde_json::from_str(payload)?;
        let text = value
            .get("v")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidVersion(format!("no \"v\" field in {payload}")))?;
        let mut version: Self = text.parse()?;
        version.build = value
            .get("n")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        version.board = value
            .get("b")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Ok(version)
    }

    /// Version plus build and board, for log output.
    pub fn to_extended_string(&self) -> String {
        let mut text = format!("firmware v{self}");
        if let Some(build) = &self.build {
            text.push_str(&format!(" build {build}"));
        }
        if let Some(board) = &self.board {
            text.push_str(&format!(" on board '{board}'"));
        }
        text
    }
}

impl FromStr for FirmwareVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let digits = s
            .strip_prefix('v')
            .or_else(|| s.strip_prefix('V'))
            .unwrap_or(s);

        let mut parts = digits.split('.');
        let mut next = |what: &str| -> Result<u32> {
            parts
                .next()
                .ok_or_else(|| Error::InvalidVersion(format!("missing {what} in '{s}'")))?
                .trim()
                .parse()
                .map_err(|_| Error::InvalidVersion(format!("bad {what} in '{s}'")))
        };
        let major = next("major")?;
        let minor = next("minor")?;
        let revision = next("revision")?;

        if parts
            .next()
            .is_some()
        {
            return Err(Error::InvalidVersion(format!(
                "too many components in '{s}'"
            )));
        }

        Ok(Self::new(major, minor, revision))
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

impl PartialEq for FirmwareVersion {
    fn eq(&self, other: &Self) -> bool {
        self.triple() == other.triple()
    }
}

impl Eq for FirmwareVersion {}

impl PartialOrd for FirmwareVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FirmwareVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.triple()
            .cmp(&other.triple())
    }
}
