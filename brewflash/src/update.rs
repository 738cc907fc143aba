//! Update session: flash new firmware and carry the old configuration over.
//!
//! ```text
//! Idle -> LinkOpen -> DetectOld -> Backup -> Flash -> Reconnect
//!      -> DetectNew -> Reconcile -> Restore -> Done
//!                  (any step) -> Failed
//! ```
//!
//! Only losing the link or failing to flash ends a session as
//! [`UpdateOutcome::Failed`]. Missing versions, unreadable replies and
//! incompatible settings are logged and narrow what gets restored.

use {
    crate::{
        compat::{self, CompatibilityTable},
        error::{Error, Result},
        flash::{FlashBackend, FlashTarget, Preparation},
        image::FirmwareImage,
        port::{DeviceHandle, Port, PortFactory},
        protocol::link::{DeviceLink, LogExpander, Pacing, PlainLogExpander},
        snapshot::{BackupSink, DeviceDescriptor, NoBackup, SettingsMap, SettingsSnapshot},
        version::FirmwareVersion,
    },
    log::{debug, error, info, trace, warn},
    std::{fmt, path::PathBuf, thread, time::Duration},
};

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started.
    Idle,
    /// Opening the serial link.
    LinkOpen,
    /// Asking the old firmware for its version.
    DetectOld,
    /// Capturing and saving the old configuration.
    Backup,
    /// Programming the board.
    Flash,
    /// Waiting for the board to come back.
    Reconnect,
    /// Asking the new firmware for its version.
    DetectNew,
    /// Deciding what can be restored.
    Reconcile,
    /// Replaying settings and devices.
    Restore,
    /// Finished.
    Done,
    /// Gave up.
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::LinkOpen => "opening link",
            Self::DetectOld => "detecting old version",
            Self::Backup => "backing up settings",
            Self::Flash => "flashing",
            Self::Reconnect => "reconnecting",
            Self::DetectNew => "detecting new version",
            Self::Reconcile => "checking compatibility",
            Self::Restore => "restoring",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a flashed board did not get its configuration back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreGap {
    /// The old firmware never reported a version, so nothing was saved.
    OldVersionUnknown,
    /// The new firmware never reported a version.
    NewVersionUnknown,
    /// The new firmware did not list its settings.
    SettingsUnavailable,
}

impl fmt::Display for RestoreGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OldVersionUnknown => "old firmware version unknown, nothing was restored",
            Self::NewVersionUnknown => "new firmware did not report a version, nothing was restored",
            Self::SettingsUnavailable => "new firmware did not list its settings",
        })
    }
}

/// What a session did.
#[derive(Debug, Clone, Default)]
pub struct RestoreSummary {
    /// Version before flashing.
    pub old_version: Option<FirmwareVersion>,
    /// Version after flashing.
    pub new_version: Option<FirmwareVersion>,
    /// Where the snapshot was saved.
    pub backup: Option<PathBuf>,
    /// Compatibility table used.
    pub table: Option<&'static str>,
    /// Why the table was chosen.
    pub note: Option<&'static str>,
    /// Keys written to the new firmware, in write order.
    pub settings_restored: Vec<String>,
    /// New keys left at their defaults.
    pub settings_defaulted: Vec<String>,
    /// Devices registered again.
    pub devices_restored: usize,
}

/// Result of a session.
#[derive(Debug)]
pub enum UpdateOutcome {
    /// Flashed, and everything that could be restored was.
    Complete(RestoreSummary),
    /// Flashed, but restoration was skipped or incomplete.
    Partial {
        /// Why.
        reason: RestoreGap,
        /// What was done.
        summary: RestoreSummary,
    },
    /// The session stopped.
    Failed {
        /// State the session was in.
        state: SessionState,
        /// What went wrong.
        error: Error,
    },
}

impl UpdateOutcome {
    /// Whether the new firmware is on the board.
    pub fn is_flashed(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }
}

/// Session options.
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Board name used in log output ("Arduino", "Spark Core").
    pub display_name: String,
    /// Restore control settings and constants if compatible.
    pub restore_settings: bool,
    /// Restore installed devices if compatible.
    pub restore_devices: bool,
    /// Open attempts after flashing before giving up.
    pub reconnect_attempts: u32,
    /// Delay between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Delay between the first successful reopen and the final one.
    pub settle_delay: Duration,
    /// Delay after the first open, for boards that reset when the port opens.
    pub open_delay: Duration,
    /// Reset the new firmware's EEPROM before restoring.
    pub reset_after_flash: bool,
    /// Protocol delays.
    pub pacing: Pacing,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            display_name: "controller".into(),
            restore_settings: true,
            restore_devices: true,
            reconnect_attempts: 30,
            reconnect_interval: Duration::from_secs(1),
            settle_delay: Duration::from_secs(2),
            open_delay: Duration::ZERO,
            reset_after_flash: true,
            pacing: Pacing::default(),
        }
    }
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

/// Drives one update session against one board.
pub struct UpdateOrchestrator<F: PortFactory> {
    handle: DeviceHandle<F>,
    backend: Box<dyn FlashBackend>,
    backup: Box<dyn BackupSink>,
    expander: Box<dyn LogExpander>,
    options: UpdateOptions,
    state: SessionState,
}

impl<F: PortFactory> UpdateOrchestrator<F> {
    /// Create a session. Nothing is saved unless a backup sink is set.
    pub fn new(handle: DeviceHandle<F>, backend: Box<dyn FlashBackend>, options: UpdateOptions) -> Self {
        Self {
            handle,
            backend,
            backup: Box::new(NoBackup),
            expander: Box::new(PlainLogExpander),
            options,
            state: SessionState::Idle,
        }
    }

    /// Save the old configuration to `backup`.
    #[must_use]
    pub fn with_backup(mut self, backup: Box<dyn BackupSink>) -> Self {
        self.backup = backup;
        self
    }

    /// Render firmware log lines with `expander`.
    #[must_use]
    pub fn with_log_expander(mut self, expander: Box<dyn LogExpander>) -> Self {
        self.expander = expander;
        self
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to `Done` or `Failed`.
    pub fn run(&mut self, image: &FirmwareImage) -> UpdateOutcome {
        let outcome = match self.drive(image) {
            Ok(outcome) => outcome,
            Err(error) => {
                let state = self.state;
                error!(
                    "{} update failed while {state}: {error}",
                    self.options
                        .display_name
                );
                self.enter(SessionState::Failed);
                UpdateOutcome::Failed { state, error }
            },
        };
        if let Err(e) = self
            .handle
            .close()
        {
            debug!("Closing the link: {e}");
        }
        outcome
    }

    fn enter(&mut self, state: SessionState) {
        debug!("Session state: {} -> {state}", self.state);
        self.state = state;
    }

    fn link(&mut self) -> Result<DeviceLink<'_, F::Port>> {
        let port = self
            .handle
            .port_mut()?;
        Ok(DeviceLink::new(port, self.options.pacing, self.expander.as_ref()))
    }

    fn drive(&mut self, image: &FirmwareImage) -> Result<UpdateOutcome> {
        let name = self
            .options
            .display_name
            .clone();
        let mut summary = RestoreSummary::default();
        info!("****    {name} update started    ****");
        self.log_restore_selection();

        self.enter(SessionState::LinkOpen);
        let port = self
            .handle
            .open()?
            .to_string();
        info!("Opened {port}");
        pause(self.options.open_delay);

        self.enter(SessionState::DetectOld);
        info!("Checking old version before programming");
        let old = self
            .link()?
            .query_version()?;
        match &old {
            Some(version) => info!("Found {} on port {port}", version.to_extended_string()),
            None => warn!(
                "Cannot receive version number from {name}. It is either not programmed yet or \
                 running a very old firmware, and will be reset to defaults"
            ),
        }
        summary.old_version = old.clone();

        self.enter(SessionState::Backup);
        let snapshot = match &old {
            Some(version) => {
                info!("Requesting old settings from {name}");
                let snapshot = self
                    .link()?
                    .snapshot(version)?;
                if snapshot.is_empty() {
                    warn!("{name} returned no settings and no devices, the backup will be empty");
                }
                match self
                    .backup
                    .store(&snapshot)
                {
                    Ok(path) => summary.backup = path,
                    Err(e) => warn!("Could not save old settings, continuing without a backup: {e}"),
                }
                Some(snapshot)
            },
            None => {
                debug!("No version, skipping backup");
                None
            },
        };

        self.enter(SessionState::Flash);
        self.flash(image)?;

        self.enter(SessionState::Reconnect);
        info!("Waiting for {name} to reset");
        self.reconnect()?;

        self.enter(SessionState::DetectNew);
        let new = self
            .link()?
            .query_version()?;
        match &new {
            Some(version) => info!("Found new {}", version.to_extended_string()),
            None => warn!("Cannot receive version number from {name} after programming"),
        }
        summary.new_version = new.clone();
        if self
            .options
            .reset_after_flash
        {
            info!("Resetting EEPROM to default settings");
            self.link()?
                .reset_to_defaults()?;
        }

        self.enter(SessionState::Reconcile);
        info!("Now checking which settings and devices can be restored");
        let Some(new) = new else {
            warn!("Something must have gone wrong while flashing. Settings and devices are not restored");
            return Ok(self.finish(UpdateOutcome::Partial {
                reason: RestoreGap::NewVersionUnknown,
                summary,
            }));
        };
        let (Some(old), Some(snapshot)) = (old, snapshot) else {
            warn!("Could not receive version number from old board, no settings or devices are restored");
            return Ok(self.finish(UpdateOutcome::Partial {
                reason: RestoreGap::OldVersionUnknown,
                summary,
            }));
        };

        let plan = compat::select_plan(&old, &new);
        info!("{}: {}", capitalize(plan.note), plan.table);
        summary.table = Some(plan.table.name());
        summary.note = Some(plan.note);
        let restore_settings = self
            .options
            .restore_settings
            && plan.settings;
        let restore_devices = self
            .options
            .restore_devices
            && plan.devices;

        self.enter(SessionState::Restore);
        let mut gap = None;
        if !restore_settings && !restore_devices {
            info!("Nothing to restore");
        }
        if restore_settings {
            info!("Trying to restore compatible settings from {old} to {new}");
            if !self.restore_settings(&plan.table, &snapshot, &mut summary)? {
                gap = Some(RestoreGap::SettingsUnavailable);
            }
        } else {
            info!("No settings to restore");
        }
        if restore_devices {
            self.restore_devices(&snapshot, &mut summary)?;
        } else {
            info!("No devices to restore");
        }

        info!("****    {name} update done!    ****");
        Ok(self.finish(match gap {
            Some(reason) => UpdateOutcome::Partial { reason, summary },
            None => UpdateOutcome::Complete(summary),
        }))
    }

    fn finish(&mut self, outcome: UpdateOutcome) -> UpdateOutcome {
        self.enter(SessionState::Done);
        outcome
    }

    fn log_restore_selection(&self) {
        let options = &self.options;
        let verb = |on: bool| if on { "be restored if possible" } else { "not be restored" };
        info!("Settings will {}", verb(options.restore_settings));
        info!("Devices will {}", verb(options.restore_devices));
    }

    fn flash(&mut self, image: &FirmwareImage) -> Result<()> {
        info!(
            "Flashing {} with {}",
            image.name(),
            self.backend
                .describe()
        );
        match self
            .backend
            .preparation()
        {
            Preparation::KeepOpen => {
                let port: &mut dyn Port = self
                    .handle
                    .port_mut()?;
                self.backend
                    .flash(image, FlashTarget::Link(port))
            },
            Preparation::Release { touch_baud } => {
                let port_name = self
                    .handle
                    .port_name()
                    .unwrap_or(self.handle.primary())
                    .to_string();
                self.handle
                    .close()?;
                if let Some(baud) = touch_baud {
                    info!("Resetting {port_name} with a {baud} baud touch");
                    self.handle
                        .touch(baud)?;
                }
                self.backend
                    .flash(image, FlashTarget::Released { port_name: &port_name })
            },
        }
    }

    /// Close the link and poll until the board is back.
    ///
    /// The first successful open may race the board's own reset, so the
    /// link is dropped once more and reopened after the settle delay. Only
    /// the polling opens count against the attempt budget.
    fn reconnect(&mut self) -> Result<()> {
        self.handle
            .close()?;
        let budget = self
            .options
            .reconnect_attempts;
        let interval = self
            .options
            .reconnect_interval;

        let mut back = None;
        for attempt in 1..=budget {
            pause(interval);
            match self
                .handle
                .open()
            {
                Ok(port) => {
                    back = Some(port.to_string());
                    break;
                },
                Err(e) => trace!("Reconnect attempt {attempt}/{budget}: {e}"),
            }
        }
        let Some(port) = back else {
            return Err(Error::Connection(format!(
                "{} did not come back after {budget} attempts, settings are not restored",
                self.handle
                    .primary()
            )));
        };

        debug!("{port} is back, reopening after {:?}", self.options.settle_delay);
        self.handle
            .close()?;
        pause(
            self.options
                .settle_delay,
        );
        let port = self
            .handle
            .open()?;
        info!("Reconnected on {port}");
        Ok(())
    }

    /// Returns `false` when the new firmware's key set could not be read.
    fn restore_settings(
        &mut self,
        table: &CompatibilityTable,
        snapshot: &SettingsSnapshot,
        summary: &mut RestoreSummary,
    ) -> Result<bool> {
        let mut link = self.link()?;
        let (constants, settings) = link.query_settings()?;
        if constants.is_none() && settings.is_none() {
            warn!("Could not receive the new firmware's settings, nothing restored");
            return Ok(false);
        }

        // Constants are looked up among the old constants only, settings
        // among the old settings only.
        let mut restored = SettingsMap::new();
        let pairs = [
            (constants.as_ref(), &snapshot.control_constants),
            (settings.as_ref(), &snapshot.control_settings),
        ];
        for (new_map, old) in pairs {
            for key in new_map
                .iter()
                .flat_map(|map| map.keys())
            {
                match table
                    .resolve(key, old)
                    .and_then(|old_key| old.get(old_key))
                {
                    Some(value) => {
                        restored.insert(key.clone(), value.clone());
                    },
                    None => summary
                        .settings_defaulted
                        .push(key.clone()),
                }
            }
        }
        info!("Restoring these settings: {}", serde_json::Value::Object(restored.clone()));

        for key in compat::restore_order(restored.keys().map(String::as_str)) {
            let value = &restored[key];
            if value.is_null() {
                debug!("Skipping {key}, old value is null");
                continue;
            }
            link.write_setting(key, value)?;
            summary
                .settings_restored
                .push(key.to_string());
        }
        info!("Restoring settings done");

        Ok(constants.is_some() && settings.is_some())
    }

    fn restore_devices(&mut self, snapshot: &SettingsSnapshot, summary: &mut RestoreSummary) -> Result<()> {
        let mut link = self.link()?;
        info!(
            "Now trying to restore {} previously installed devices",
            snapshot
                .installed_devices
                .len()
        );

        let mut detected: Option<Option<Vec<DeviceDescriptor>>> = None;
        for saved in &snapshot.installed_devices {
            let mut device = saved.clone();
            if device.has_autodetect_address() {
                warn!(
                    "OneWire sensor was configured to autodetect the first sensor on the bus, \
                     which is no longer supported. Looking up its address"
                );
                if detected.is_none() {
                    detected = Some(link.query_detected_hardware()?);
                }
                let found = detected
                    .iter()
                    .flatten()
                    .flatten()
                    .find(|d| d.pin().is_some() && d.pin() == device.pin())
                    .and_then(DeviceDescriptor::address)
                    .map(str::to_string);
                match found {
                    Some(address) => device.set_address(address),
                    None => warn!("No detected sensor on pin {:?}, keeping the old address", device.pin()),
                }
            }

            info!("Restoring device: {}", serde_json::Value::Object(device.0.clone()));
            link.register_device(&device)?;
            summary.devices_restored += 1;
        }
        info!("Restoring installed devices done");
        Ok(())
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars)
            .collect(),
        None => String::new(),
    }
}
