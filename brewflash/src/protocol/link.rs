//! Line protocol spoken by the controller firmware.
//!
//! Requests are a single ASCII letter, optionally followed by a JSON-ish
//! payload. Replies are newline-terminated lines whose first character is a
//! tag and whose payload starts after a two-character prefix:
//!
//! ```text
//! -> c
//! <- C:{"tempFormat":"C","Kp":20.000,...}
//! -> j{mode:b}
//! <- D:{"logType":"I","logID":1,"V":[]}
//! ```

use {
    crate::{
        error::{Error, Result},
        snapshot::{DeviceDescriptor, SettingsMap, SettingsSnapshot},
        version::FirmwareVersion,
    },
    log::{debug, info, trace, warn},
    serde::de::DeserializeOwned,
    serde_json::Value,
    std::{
        io::{ErrorKind, Read, Write},
        thread,
        time::{Duration, Instant},
    },
};

/// Maximum request sends in one exchange.
pub const MAX_SENDS: usize = 10;

/// Version queries sent before the version is declared unknown.
pub const VERSION_ATTEMPTS: usize = 10;

/// A request understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command<'a> {
    /// `n`: report firmware version.
    QueryVersion,
    /// `c`: report control constants.
    QueryControlConstants,
    /// `s`: report control settings.
    QueryControlSettings,
    /// `d{}`: list installed devices.
    QueryInstalledDevices,
    /// `j{key:value}`: change one setting.
    WriteSetting {
        /// Setting name.
        key: &'a str,
        /// New value.
        value: &'a Value,
    },
    /// `U{...}`: install or update a device.
    RegisterDevice(&'a DeviceDescriptor),
    /// `h{}`: list hardware the firmware detected on its own.
    QueryDetectedHardware,
    /// `E`: reset the EEPROM to defaults.
    ResetToDefaults,
    /// `F`: reboot into the bootloader and await a YMODEM transfer.
    EnterFlashMode,
}

impl Command<'_> {
    /// Bytes put on the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Self::QueryVersion => b"n".to_vec(),
            Self::QueryControlConstants => b"c".to_vec(),
            Self::QueryControlSettings => b"s".to_vec(),
            Self::QueryInstalledDevices => b"d{}".to_vec(),
            Self::WriteSetting { key, value } => {
                format!("j{{{key}:{}}}\n", setting_text(value)).into_bytes()
            },
            Self::RegisterDevice(device) => {
                let mut bytes = b"U".to_vec();
                bytes.extend(serde_json::to_vec(device)?);
                bytes
            },
            Self::QueryDetectedHardware => b"h{}".to_vec(),
            Self::ResetToDefaults => b"E".to_vec(),
            Self::EnterFlashMode => b"F".to_vec(),
        })
    }

    /// Tag of the line that answers this command, if it has a dedicated one.
    pub fn reply_tag(&self) -> Option<char> {
        match self {
            Self::QueryVersion => Some('N'),
            Self::QueryControlConstants => Some('C'),
            Self::QueryControlSettings => Some('S'),
            Self::QueryInstalledDevices => Some('d'),
            Self::RegisterDevice(_) => Some('U'),
            Self::QueryDetectedHardware => Some('h'),
            Self::WriteSetting { .. } | Self::ResetToDefaults | Self::EnterFlashMode => None,
        }
    }
}

/// Text form of a setting value: strings bare, everything else as JSON.
fn setting_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A decoded inbound line.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `N`: firmware version report.
    Version(FirmwareVersion),
    /// `C`: control constants.
    ControlConstants(SettingsMap),
    /// `S`: control settings.
    ControlSettings(SettingsMap),
    /// `d`: installed devices.
    InstalledDevices(Vec<DeviceDescriptor>),
    /// `D`: firmware log line, raw payload.
    DebugLog(String),
    /// `U`: a device was installed or updated.
    DeviceUpdated(Value),
    /// `h`: detected hardware.
    DetectedHardware(Vec<DeviceDescriptor>),
    /// Any other line.
    Unrecognized(String),
}

impl Message {
    /// Tag character of the line this message came from.
    pub fn tag(&self) -> Option<char> {
        match self {
            Self::Version(_) => Some('N'),
            Self::ControlConstants(_) => Some('C'),
            Self::ControlSettings(_) => Some('S'),
            Self::InstalledDevices(_) => Some('d'),
            Self::DebugLog(_) => Some('D'),
            Self::DeviceUpdated(_) => Some('U'),
            Self::DetectedHardware(_) => Some('h'),
            Self::Unrecognized(_) => None,
        }
    }
}

/// Decode one inbound line (without its terminator).
pub fn decode(line: &str) -> Result<Message> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(tag) = line
        .chars()
        .next()
    else {
        return Ok(Message::Unrecognized(String::new()));
    };
    let payload = line
        .get(2..)
        .unwrap_or_default();

    Ok(match tag {
        'N' => Message::Version(FirmwareVersion::from_report(payload).map_err(|e| {
            Error::Decode {
                tag,
                reason: e.to_string(),
            }
        })?),
        'C' => Message::ControlConstants(decode_json(tag, payload)?),
        'S' => Message::ControlSettings(decode_json(tag, payload)?),
        'd' => Message::InstalledDevices(decode_json(tag, payload)?),
        'h' => Message::DetectedHardware(decode_json(tag, payload)?),
        'U' => Message::DeviceUpdated(decode_json(tag, payload)?),
        'D' => Message::DebugLog(payload.to_string()),
        _ => Message::Unrecognized(line.to_string()),
    })
}

fn decode_json<T: DeserializeOwned>(tag: char, payload: &str) -> Result<T> {
    serde_json::from_str(payload).map_err(|e| Error::Decode {
        tag,
        reason: e.to_string(),
    })
}

/// Renders firmware log payloads into readable text.
///
/// The firmware sends log lines as message ids plus arguments; the id table
/// lives outside this crate.
pub trait LogExpander {
    /// Expand one `D` payload.
    fn expand(&self, payload: &str) -> Result<String>;
}

/// Prints log payloads unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainLogExpander;

impl LogExpander for PlainLogExpander {
    fn expand(&self, payload: &str) -> Result<String> {
        Ok(payload.to_string())
    }
}

/// Delays the firmware needs between requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// After each `j` write.
    pub after_setting: Duration,
    /// After each `U` registration.
    pub after_device: Duration,
    /// After `E`; rewriting the EEPROM is slow.
    pub after_reset: Duration,
    /// After `h{}`.
    pub after_hardware_query: Duration,
    /// After sending a batch of queries.
    pub after_query: Duration,
    /// After `F`, before the first packet.
    pub after_flash_mode: Duration,
    /// Window for one version query.
    pub version_window: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            after_setting: Duration::from_millis(500),
            after_device: Duration::from_secs(3),
            after_reset: Duration::from_secs(5),
            after_hardware_query: Duration::from_secs(1),
            after_query: Duration::from_secs(2),
            after_flash_mode: Duration::from_millis(200),
            version_window: Duration::from_secs(1),
        }
    }
}

impl Pacing {
    /// No delays, for simulated devices.
    pub fn none() -> Self {
        Self {
            after_setting: Duration::ZERO,
            after_device: Duration::ZERO,
            after_reset: Duration::ZERO,
            after_hardware_query: Duration::ZERO,
            after_query: Duration::ZERO,
            after_flash_mode: Duration::ZERO,
            version_window: Duration::ZERO,
        }
    }
}

/// Command/response session over a borrowed port.
pub struct DeviceLink<'a, P: Read + Write + ?Sized> {
    port: &'a mut P,
    pacing: Pacing,
    expander: &'a dyn LogExpander,
}

impl<'a, P: Read + Write + ?Sized> DeviceLink<'a, P> {
    /// Borrow `port` for a sequence of requests.
    pub fn new(port: &'a mut P, pacing: Pacing, expander: &'a dyn LogExpander) -> Self {
        Self {
            port,
            pacing,
            expander,
        }
    }

    fn pause(duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }

    /// Write one command.
    pub fn send(&mut self, command: &Command<'_>) -> Result<()> {
        let bytes = command.encode()?;
        trace!("-> {}", String::from_utf8_lossy(&bytes).trim_end());
        self.port
            .write_all(&bytes)?;
        self.port
            .flush()?;
        Ok(())
    }

    /// Read up to the next newline.
    ///
    /// Returns `None` when the port times out before any byte arrives. A
    /// partial line cut off by the timeout is returned as it is.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self
                .port
                .read(&mut byte)
            {
                Ok(1) if byte[0] == b'\n' => break,
                Ok(1) => buf.push(byte[0]),
                Ok(_) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    break;
                },
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    break;
                },
                Err(e) => return Err(e.into()),
            }
        }

        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches('\r')
            .to_string();
        trace!("<- {line}");
        Ok(Some(line))
    }

    /// Read and decode the next line.
    ///
    /// `Ok(None)` means nothing usable arrived: a timeout, or a line whose
    /// payload did not decode (logged).
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        let Some(line) = self.read_line()? else {
            return Ok(None);
        };
        match decode(&line) {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                warn!("Ignoring malformed reply: {e}");
                debug!("Line received was: {line}");
                Ok(None)
            },
        }
    }

    /// Report a message nobody asked for.
    fn log_unsolicited(&self, message: &Message) {
        match message {
            Message::DebugLog(payload) => match self
                .expander
                .expand(payload)
            {
                Ok(text) => info!("Controller: {text}"),
                Err(e) => {
                    warn!("Cannot expand log message: {e}");
                    info!("Controller debug message: {payload}");
                },
            },
            Message::DeviceUpdated(device) => info!("Controller reports device updated to: {device}"),
            Message::Unrecognized(line) if line.is_empty() => {},
            Message::Unrecognized(line) => debug!("Unrecognized line: {line}"),
            other => debug!("Unexpected reply: {other:?}"),
        }
    }

    /// Read lines until the port goes quiet, logging each one.
    ///
    /// Returns how many lines were read.
    pub fn drain(&mut self) -> Result<usize> {
        let mut count = 0;
        while let Some(line) = self.read_line()? {
            count += 1;
            match decode(&line) {
                Ok(message) => self.log_unsolicited(&message),
                Err(e) => warn!("Ignoring malformed reply: {e}"),
            }
        }
        Ok(count)
    }

    /// Ask for the firmware version.
    ///
    /// Returns `None` when the firmware never answers with a usable version,
    /// which is normal for an unprogrammed board. A reported `0.0.0` counts
    /// as no answer.
    pub fn query_version(&mut self) -> Result<Option<FirmwareVersion>> {
        for attempt in 1..=VERSION_ATTEMPTS {
            trace!("Version query {attempt}/{VERSION_ATTEMPTS}");
            self.send(&Command::QueryVersion)?;
            let deadline = Instant::now() + self.pacing.version_window;
            loop {
                match self.next_message()? {
                    Some(Message::Version(version)) if version.triple() != (0, 0, 0) => {
                        return Ok(Some(version));
                    },
                    Some(other) => self.log_unsolicited(&other),
                    None => {},
                }
                if Instant::now() >= deadline {
                    break;
                }
            }
        }
        Ok(None)
    }

    /// Send every command and collect one reply per command.
    ///
    /// A command is not re-sent while its reply may still be in flight. A
    /// polling round ends when the port goes quiet; replies still missing at
    /// that point are requested again. After [`MAX_SENDS`] sends the
    /// exchange gives up and returns what it has, with `None` for the
    /// missing replies.
    pub fn request_all(&mut self, commands: &[Command<'_>]) -> Result<Vec<Option<Message>>> {
        let mut replies: Vec<Option<Message>> = vec![None; commands.len()];
        let mut outstanding = vec![false; commands.len()];
        let mut sends = 0;

        while replies
            .iter()
            .any(Option::is_none)
        {
            if sends >= MAX_SENDS {
                let missing: Vec<_> = commands
                    .iter()
                    .zip(&replies)
                    .filter(|(_, reply)| reply.is_none())
                    .filter_map(|(command, _)| command.reply_tag())
                    .collect();
                warn!("Could not receive all replies, missing {missing:?}");
                break;
            }

            for (i, command) in commands
                .iter()
                .enumerate()
            {
                if replies[i].is_none() && !outstanding[i] && sends < MAX_SENDS {
                    self.send(command)?;
                    outstanding[i] = true;
                    sends += 1;
                }
            }
            Self::pause(self.pacing.after_query);

            while let Some(message) = self.next_message()? {
                let slot = commands
                    .iter()
                    .position(|c| c.reply_tag().is_some() && c.reply_tag() == message.tag());
                match slot {
                    Some(i) => {
                        outstanding[i] = false;
                        if replies[i].is_none() {
                            replies[i] = Some(message);
                        }
                    },
                    None => self.log_unsolicited(&message),
                }
                if !outstanding
                    .iter()
                    .any(|o| *o)
                {
                    break;
                }
            }
            outstanding.fill(false);
        }

        Ok(replies)
    }

    /// Capture the old firmware's configuration.
    ///
    /// Firmware before 0.2 has no device manager, so devices are only
    /// queried when `version.minor > 1`.
    pub fn snapshot(&mut self, version: &FirmwareVersion) -> Result<SettingsSnapshot> {
        let mut commands = vec![Command::QueryControlConstants, Command::QueryControlSettings];
        if version.minor > 1 {
            commands.push(Command::QueryInstalledDevices);
        }

        let mut snapshot = SettingsSnapshot::default();
        for reply in self
            .request_all(&commands)?
            .into_iter()
            .flatten()
        {
            match reply {
                Message::ControlConstants(map) => snapshot.control_constants = map,
                Message::ControlSettings(map) => snapshot.control_settings = map,
                Message::InstalledDevices(devices) => snapshot.installed_devices = devices,
                _ => {},
            }
        }
        Ok(snapshot)
    }

    /// Fetch current control constants and settings.
    pub fn query_settings(&mut self) -> Result<(Option<SettingsMap>, Option<SettingsMap>)> {
        let mut replies = self
            .request_all(&[Command::QueryControlConstants, Command::QueryControlSettings])?
            .into_iter();
        let constants = match replies.next() {
            Some(Some(Message::ControlConstants(map))) => Some(map),
            _ => None,
        };
        let settings = match replies.next() {
            Some(Some(Message::ControlSettings(map))) => Some(map),
            _ => None,
        };
        Ok((constants, settings))
    }

    /// Write one setting, then log whatever the firmware says about it.
    pub fn write_setting(&mut self, key: &str, value: &Value) -> Result<()> {
        self.send(&Command::WriteSetting { key, value })?;
        Self::pause(self.pacing.after_setting);
        self.drain()?;
        Ok(())
    }

    /// Install a device, then log the acknowledgement.
    pub fn register_device(&mut self, device: &DeviceDescriptor) -> Result<()> {
        self.send(&Command::RegisterDevice(device))?;
        Self::pause(self.pacing.after_device);
        self.drain()?;
        Ok(())
    }

    /// List hardware the firmware detected. `None` if it never answered.
    pub fn query_detected_hardware(&mut self) -> Result<Option<Vec<DeviceDescriptor>>> {
        self.send(&Command::QueryDetectedHardware)?;
        Self::pause(self.pacing.after_hardware_query);
        while let Some(message) = self.next_message()? {
            match message {
                Message::DetectedHardware(devices) => return Ok(Some(devices)),
                other => self.log_unsolicited(&other),
            }
        }
        Ok(None)
    }

    /// Reset the EEPROM to firmware defaults.
    pub fn reset_to_defaults(&mut self) -> Result<()> {
        self.send(&Command::ResetToDefaults)?;
        Self::pause(self.pacing.after_reset);
        self.drain()?;
        Ok(())
    }

    /// Ask the firmware to reboot into its YMODEM bootloader.
    pub fn enter_flash_mode(&mut self) -> Result<Option<String>> {
        self.send(&Command::EnterFlashMode)?;
        let reply = self.read_line()?;
        if let Some(line) = &reply {
            info!("{line}");
        }
        Self::pause(self.pacing.after_flash_mode);
        Ok(reply)
    }
}
