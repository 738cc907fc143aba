//! Simulated controller for session tests.
//!
//! The simulator reacts to the same single-letter commands as the real
//! firmware, speaks the receiving side of the YMODEM subset, and swaps in a
//! new firmware personality when an image is flashed.

#![allow(dead_code)]

use {
    brewflash::{
        Error, FirmwareImage, FlashBackend, FlashTarget, Port, PortFactory, Preparation, Result,
        SerialConfig,
        protocol::ymodem::{PACKET_LEN, control},
    },
    serde_json::{Map, Value, json},
    std::{
        collections::VecDeque,
        io::{self, Read, Write},
        sync::{Arc, Mutex, MutexGuard},
    },
};

/// One firmware personality.
#[derive(Debug, Clone, Default)]
pub struct Firmware {
    /// Payload of the `N` reply, or `None` for a board that never answers.
    pub version: Option<String>,
    pub constants: Map<String, Value>,
    pub settings: Map<String, Value>,
    pub devices: Vec<Value>,
    pub detected: Vec<Value>,
}

impl Firmware {
    pub fn new(version: Option<&str>, constants: Value, settings: Value) -> Self {
        Self {
            version: version.map(str::to_string),
            constants: as_map(constants),
            settings: as_map(settings),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_devices(mut self, devices: Value) -> Self {
        self.devices = as_array(devices);
        self
    }

    #[must_use]
    pub fn with_detected(mut self, detected: Value) -> Self {
        self.detected = as_array(detected);
        self
    }
}

fn as_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn as_array(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        _ => Vec::new(),
    }
}

#[derive(Debug, Default)]
struct YmodemRx {
    header_seen: bool,
    eot_seen: bool,
    bytes: usize,
}

/// Board state shared by the factory, its ports and the fake programmer.
#[derive(Debug, Default)]
pub struct Controller {
    pub firmware: Firmware,
    defaults: Firmware,
    /// Personality after the next flash.
    pub next: Option<Firmware>,
    /// Port names that currently open.
    pub available: Vec<String>,
    /// Port names after the next flash.
    pub available_after_flash: Option<Vec<String>>,
    /// Opens that fail right after a flash while the board reboots.
    pub reboot_opens: usize,
    offline_opens: usize,
    /// Every open attempt, by name.
    pub open_attempts: Vec<String>,
    /// Every text command received.
    pub commands: Vec<String>,
    /// Packets received while in the bootloader.
    pub packets: usize,
    /// Payload bytes received by the bootloader.
    pub flashed_bytes: usize,
    pub flash_count: usize,
    outbox: VecDeque<u8>,
    ymodem: Option<YmodemRx>,
}

impl Controller {
    pub fn new(port: &str, firmware: Firmware) -> Self {
        Self {
            available: vec![port.to_string()],
            defaults: Firmware {
                constants: firmware
                    .constants
                    .clone(),
                settings: firmware
                    .settings
                    .clone(),
                ..Firmware::default()
            },
            firmware,
            ..Self::default()
        }
    }

    fn reply(&mut self, line: &str) {
        self.outbox
            .extend(line.bytes());
        self.outbox
            .push_back(b'\n');
    }

    fn reboot_into_next(&mut self) {
        self.flash_count += 1;
        if let Some(next) = self
            .next
            .take()
        {
            self.defaults = Firmware {
                constants: next
                    .constants
                    .clone(),
                settings: next
                    .settings
                    .clone(),
                ..Firmware::default()
            };
            self.firmware = next;
        }
        if let Some(names) = self
            .available_after_flash
            .take()
        {
            self.available = names;
        }
        self.offline_opens = self.reboot_opens;
        self.outbox
            .clear();
    }

    fn receive(&mut self, bytes: &[u8]) {
        if let Some(rx) = self
            .ymodem
            .as_mut()
        {
            if bytes == [control::EOT] {
                rx.eot_seen = true;
                self.outbox
                    .push_back(control::ACK);
                return;
            }
            if bytes.len() == PACKET_LEN {
                self.packets += 1;
                let seq = bytes[1];
                if seq == 0 && !rx.header_seen {
                    rx.header_seen = true;
                    self.outbox
                        .extend([control::ACK, control::C]);
                } else if seq == 0 && rx.eot_seen {
                    self.ymodem = None;
                    self.reboot_into_next();
                    self.outbox
                        .push_back(control::ACK);
                } else {
                    rx.bytes += PACKET_LEN - 5;
                    self.flashed_bytes += PACKET_LEN - 5;
                    self.outbox
                        .push_back(control::ACK);
                }
                return;
            }
            self.outbox
                .push_back(control::NAK);
            return;
        }

        let text = String::from_utf8_lossy(bytes).into_owned();
        self.commands
            .push(text.clone());
        let fw = &self.firmware;
        match text.chars().next() {
            Some('n') => {
                if let Some(version) = fw.version.clone() {
                    self.reply(&format!("N:{version}"));
                }
            },
            Some('c') => {
                let line = format!("C:{}", Value::Object(fw.constants.clone()));
                self.reply(&line);
            },
            Some('s') => {
                let line = format!("S:{}", Value::Object(fw.settings.clone()));
                self.reply(&line);
            },
            Some('d') => {
                let line = format!("d:{}", Value::Array(fw.devices.clone()));
                self.reply(&line);
            },
            Some('h') => {
                let line = format!("h:{}", Value::Array(fw.detected.clone()));
                self.reply(&line);
            },
            Some('j') => {
                let body = text
                    .trim_end()
                    .trim_start_matches("j{")
                    .trim_end_matches('}');
                if let Some((key, value)) = body.split_once(':') {
                    let value = Value::String(value.to_string());
                    if self
                        .firmware
                        .constants
                        .contains_key(key)
                    {
                        self.firmware
                            .constants
                            .insert(key.to_string(), value);
                    } else {
                        self.firmware
                            .settings
                            .insert(key.to_string(), value);
                    }
                }
                self.reply(r#"D:{"logType":"I","logID":9,"V":[]}"#);
            },
            Some('U') => {
                if let Ok(device) = serde_json::from_str::<Value>(&text[1..]) {
                    self.firmware
                        .devices
                        .push(device.clone());
                    self.reply(&format!("U:{device}"));
                }
            },
            Some('E') => {
                self.firmware.constants = self
                    .defaults
                    .constants
                    .clone();
                self.firmware.settings = self
                    .defaults
                    .settings
                    .clone();
                self.firmware
                    .devices
                    .clear();
                self.reply("D:eeprom reset");
            },
            Some('F') => {
                self.reply("Waiting for YMODEM transfer");
                self.ymodem = Some(YmodemRx::default());
            },
            _ => {},
        }
    }

    /// Text commands starting with `prefix`.
    pub fn commands_starting_with(&self, prefix: &str) -> Vec<String> {
        self.commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.commands_starting_with(prefix)
            .len()
    }
}

pub type Shared = Arc<Mutex<Controller>>;

pub fn shared(controller: Controller) -> Shared {
    Arc::new(Mutex::new(controller))
}

pub fn lock(shared: &Shared) -> MutexGuard<'_, Controller> {
    shared
        .lock()
        .unwrap()
}

/// Port connected to the simulated board.
pub struct SimPort {
    name: String,
    board: Shared,
}

impl Read for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match lock(&self.board)
            .outbox
            .pop_front()
        {
            Some(byte) if !buf.is_empty() => {
                buf[0] = byte;
                Ok(1)
            },
            _ => Err(io::Error::new(io::ErrorKind::TimedOut, "no data")),
        }
    }
}

impl Write for SimPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        lock(&self.board).receive(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SimPort {
    fn clear_buffers(&mut self) -> Result<()> {
        lock(&self.board)
            .outbox
            .clear();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens [`SimPort`]s while the board is reachable.
pub struct SimFactory {
    pub board: Shared,
}

impl PortFactory for SimFactory {
    type Port = SimPort;

    fn open(&self, config: &SerialConfig) -> Result<SimPort> {
        let mut board = lock(&self.board);
        board
            .open_attempts
            .push(config.port_name.clone());
        if board.offline_opens > 0 {
            board.offline_opens -= 1;
            return Err(Error::Connection("board is rebooting".into()));
        }
        if !board
            .available
            .contains(&config.port_name)
        {
            return Err(Error::Connection(format!("{} not found", config.port_name)));
        }
        board
            .outbox
            .clear();
        Ok(SimPort {
            name: config
                .port_name
                .clone(),
            board: Arc::clone(&self.board),
        })
    }
}

/// Programmer double that reflashes the simulated board directly.
pub struct FakeProgrammer {
    pub board: Shared,
    pub seen_port: Arc<Mutex<Option<String>>>,
}

impl FlashBackend for FakeProgrammer {
    fn describe(&self) -> String {
        "fake programmer".into()
    }

    fn preparation(&self) -> Preparation {
        Preparation::Release { touch_baud: None }
    }

    fn flash(&mut self, image: &FirmwareImage, target: FlashTarget<'_>) -> Result<()> {
        let FlashTarget::Released { port_name } = target else {
            return Err(Error::InvalidState("expected a released port".into()));
        };
        *self
            .seen_port
            .lock()
            .unwrap() = Some(port_name.to_string());
        let mut board = lock(&self.board);
        board.flashed_bytes += image
            .data()
            .len();
        board.reboot_into_next();
        Ok(())
    }
}

/// Programmer double whose tool always fails.
pub struct BrokenProgrammer;

impl FlashBackend for BrokenProgrammer {
    fn describe(&self) -> String {
        "broken programmer".into()
    }

    fn preparation(&self) -> Preparation {
        Preparation::Release { touch_baud: None }
    }

    fn flash(&mut self, _image: &FirmwareImage, _target: FlashTarget<'_>) -> Result<()> {
        Err(Error::Tool("avrdude exited with exit status: 1".into()))
    }
}

/// Settings as the 0.2.x firmware reports them.
pub fn constants_0_2(kp: f64) -> Value {
    json!({
        "tempFormat": "C",
        "tempSetMin": 1.0,
        "tempSetMax": 30.0,
        "Kp": kp,
        "Ki": 0.25,
        "Kd": -1.5,
        "heatTargetH": 0.3,
        "lah": 0,
    })
}
