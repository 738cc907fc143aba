//! Ways of getting a firmware image onto the board.
//!
//! The orchestrator only sees [`FlashBackend`]. Which backend a session uses
//! is decided when the orchestrator is built:
//!
//! - [`PacketTransportFlash`]: asks the running firmware to reboot into its
//!   bootloader and streams the image over the same serial link (Spark Core).
//! - [`ExternalToolFlash`]: releases the port and runs a native programmer
//!   such as avrdude (Arduino).

mod external;
mod packet;

pub use {
    external::ExternalToolFlash,
    packet::{PacketTransportFlash, ProgressFn},
};

use crate::{error::Result, image::FirmwareImage, port::Port};

/// What the orchestrator must do with the link before flashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preparation {
    /// Keep the link open and hand it to the backend.
    KeepOpen,
    /// Close the link so another program can open the port.
    Release {
        /// Open at this baud and close again first, to kick native-USB
        /// boards into their bootloader.
        touch_baud: Option<u32>,
    },
}

/// The port as handed to a backend.
pub enum FlashTarget<'a> {
    /// The open link.
    Link(&'a mut dyn Port),
    /// The link was closed; the backend gets the port name.
    Released {
        /// Name of the port the board was last seen on.
        port_name: &'a str,
    },
}

/// Capability to reprogram the board.
pub trait FlashBackend {
    /// Short description for log output.
    fn describe(&self) -> String;

    /// How the link must be prepared.
    fn preparation(&self) -> Preparation;

    /// Program `image`. Any error leaves the session failed.
    fn flash(&mut self, image: &FirmwareImage, target: FlashTarget<'_>) -> Result<()>;
}
