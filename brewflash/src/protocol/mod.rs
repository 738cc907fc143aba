//! Protocol implementations.

pub mod link;
pub mod ymodem;

// Re-export common types
pub use link::{Command, DeviceLink, LogExpander, Message, Pacing, PlainLogExpander, decode};
pub use ymodem::{TransferOutcome, YmodemConfig, YmodemTransfer};
