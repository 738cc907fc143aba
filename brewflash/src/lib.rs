//! # brewflash
//!
//! A library for updating the firmware of a serial-attached temperature
//! controller without losing its configuration.
//!
//! An update session:
//!
//! 1. asks the running firmware for its version,
//! 2. captures its control constants, control settings and installed
//!    devices, and saves them as a JSON backup,
//! 3. flashes the new image, either over the same serial link with YMODEM
//!    or by handing the port to an external programmer,
//! 4. waits for the board to come back,
//! 5. maps every setting the new firmware knows to the old name that
//!    carries the same meaning, and writes the values back one at a time.
//!
//! ## Features
//!
//! - `native` (default): serial ports through the `serialport` crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use brewflash::{
//!     DeviceHandle, DirectoryBackup, FirmwareImage, NativePortFactory, PacketTransportFlash,
//!     UpdateOptions, UpdateOrchestrator, UpdateOutcome,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("brewpi.bin")?;
//!     let handle = DeviceHandle::new(NativePortFactory, "/dev/ttyACM0", None);
//!     let options = UpdateOptions {
//!         display_name: "Spark Core".into(),
//!         ..UpdateOptions::default()
//!     };
//!
//!     let mut session = UpdateOrchestrator::new(handle, Box::new(PacketTransportFlash::new()), options)
//!         .with_backup(Box::new(DirectoryBackup::new("backups")));
//!
//!     match session.run(&image) {
//!         UpdateOutcome::Complete(summary) => println!("restored {:?}", summary.settings_restored),
//!         UpdateOutcome::Partial { reason, .. } => println!("flashed, but {reason}"),
//!         UpdateOutcome::Failed { state, error } => println!("failed while {state}: {error}"),
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compat;
pub mod error;
pub mod flash;
pub mod image;
pub mod port;
pub mod protocol;
pub mod snapshot;
pub mod update;
pub mod version;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator, NativePortFactory};
pub use {
    compat::{CompatibilityTable, RestorePlan, select_plan},
    error::{Error, Result},
    flash::{ExternalToolFlash, FlashBackend, FlashTarget, PacketTransportFlash, Preparation},
    image::{FirmwareImage, ImageFormat},
    port::{
        BoardKind, DeviceHandle, HandleState, Port, PortEnumerator, PortFactory, PortInfo,
        SerialConfig,
    },
    protocol::{
        link::{DeviceLink, LogExpander, Pacing, PlainLogExpander},
        ymodem::{TransferOutcome, YmodemConfig},
    },
    snapshot::{BackupSink, DeviceDescriptor, DirectoryBackup, NoBackup, SettingsSnapshot},
    update::{
        RestoreGap, RestoreSummary, SessionState, UpdateOptions, UpdateOrchestrator, UpdateOutcome,
    },
    version::FirmwareVersion,
};
