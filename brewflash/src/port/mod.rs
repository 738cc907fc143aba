//! Port abstraction for serial communication with the controller.
//!
//! Protocol code never talks to `serialport` directly. It is written against
//! the [`Port`] trait so the same line protocol and packet transfer run over a
//! real serial device or over an in-memory double in tests.
//!
//! ```text
//! +--------------------+   +--------------------+
//! |   UpdateOrchestrator (owns DeviceHandle)    |
//! +--------------------+   +--------------------+
//!          |  borrows for one call
//!          v
//! +--------+---------+     +------------------+
//! |   DeviceLink     |     |  YmodemTransfer  |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+------------------------+---------+
//! |                 Port trait                |
//! +--------+------------------------+---------+
//!          |
//!          v
//! +--------+---------+
//! | NativePort       |
//! |   (serialport)   |
//! +------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use brewflash::port::Port;
//!
//! fn example<P: Port>(port: &mut P) -> std::io::Result<()> {
//!     port.write_all(b"n")?;
//!
//!     let mut buf = [0u8; 32];
//!     let n = port.read(&mut buf)?;
//!     println!("Received: {:?}", &buf[..n]);
//!
//!     Ok(())
//! }
//! ```

mod handle;
#[cfg(feature = "native")]
pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

pub use handle::{DeviceHandle, HandleState};
#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator, NativePortFactory};

/// Baud rate spoken by the controller firmware.
pub const DEFAULT_BAUD: u32 = 57600;

/// Per-read timeout used on the controller link.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: DEFAULT_READ_TIMEOUT,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
}

/// Board family guessed from the USB identifiers of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardKind {
    /// Genuine Arduino board (native USB or 16U2 bridge).
    Arduino,
    /// Spark Core / Particle Photon.
    Spark,
    /// FTDI bridge, common on older clones.
    Ftdi,
    /// CH340/CH341 bridge.
    Ch340,
    /// Not recognised.
    Unknown,
}

/// USB vendor IDs and the board family they indicate.
const KNOWN_VENDORS: &[(u16, BoardKind)] = &[
    (0x2341, BoardKind::Arduino),
    (0x2A03, BoardKind::Arduino),
    (0x1D50, BoardKind::Spark),
    (0x2B04, BoardKind::Spark),
    (0x0403, BoardKind::Ftdi),
    (0x1A86, BoardKind::Ch340),
];

impl BoardKind {
    /// Classify a USB vendor ID.
    #[must_use]
    pub fn from_vid(vid: u16) -> Self {
        KNOWN_VENDORS
            .iter()
            .find(|(known, _)| *known == vid)
            .map_or(Self::Unknown, |(_, kind)| *kind)
    }

    /// Human-readable name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Arduino => "Arduino",
            Self::Spark => "Spark Core",
            Self::Ftdi => "FTDI",
            Self::Ch340 => "CH340/CH341",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the vendor ID was recognised.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Serial port information.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Board family suggested by the USB vendor ID.
    pub fn board(&self) -> BoardKind {
        self.vid
            .map_or(BoardKind::Unknown, BoardKind::from_vid)
    }
}

/// Unified port trait for serial communication.
///
/// Reads are expected to honour the timeout the port was opened with and
/// report an elapsed timeout as `ErrorKind::TimedOut`; callers treat that as
/// "no data yet".
pub trait Port: Read + Write + Send {
    /// Discard anything pending in the input and output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;
}

/// Opens ports by configuration.
///
/// The orchestrator reopens the link several times during a session, so it
/// holds a factory rather than a single port.
pub trait PortFactory {
    /// Port type produced by this factory.
    type Port: Port;

    /// Open a port.
    fn open(&self, config: &SerialConfig) -> Result<Self::Port>;
}

/// Trait for listing available serial ports.
///
/// This is separated from `Port` because it's a static operation that
/// doesn't require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}
