//! `flash` command: program the controller and carry its settings over.

use {
    crate::{Cli, CliError, config::Config, get_port, serial::map_prompt_error, use_fancy_output},
    anyhow::{Context, Result},
    brewflash::{
        DeviceHandle, DirectoryBackup, ExternalToolFlash, FirmwareImage, FlashBackend,
        NativePortFactory, PacketTransportFlash, RestoreSummary, UpdateOptions,
        UpdateOrchestrator, UpdateOutcome, port::DEFAULT_BAUD,
    },
    clap::{Args, ValueEnum},
    console::style,
    dialoguer::{Confirm, theme::ColorfulTheme},
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    log::debug,
    std::{io::IsTerminal, path::PathBuf, time::Duration},
};

/// Programmer used when `--method external` names none.
pub(crate) const DEFAULT_TOOL: &str = "avrdude";

/// Arguments for [`DEFAULT_TOOL`] on an Arduino Uno class board.
pub(crate) const DEFAULT_TOOL_ARGS: &[&str] = &[
    "-F",
    "-e",
    "-p",
    "atmega328p",
    "-c",
    "arduino",
    "-b",
    "115200",
    "-P",
    "{port}",
    "-U",
    "flash:w:{file}:i",
];

/// How the image gets onto the board.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Method {
    /// Reboot the firmware into its bootloader and send the image over the
    /// serial link (Spark Core).
    Packet,
    /// Release the port and run an external programmer (Arduino).
    External,
}

impl Method {
    fn default_display_name(self) -> &'static str {
        match self {
            Self::Packet => "Spark Core",
            Self::External => "Arduino",
        }
    }

    /// Boards flashed by a programmer reset when the port opens.
    fn default_open_delay_secs(self) -> u64 {
        match self {
            Self::Packet => 0,
            Self::External => 5,
        }
    }
}

/// Arguments of `brewflash flash`.
#[derive(Args, Debug)]
pub(crate) struct FlashArgs {
    /// Firmware image (.bin, or .hex for the external programmer).
    pub firmware: PathBuf,

    /// Flash method.
    #[arg(long, value_enum)]
    pub method: Option<Method>,

    /// External programmer executable.
    #[arg(long)]
    pub tool: Option<PathBuf>,

    /// Argument for the external programmer; `{port}` and `{file}` are
    /// substituted (repeatable).
    #[arg(long = "tool-arg", allow_hyphen_values = true)]
    pub tool_args: Vec<String>,

    /// Largest program the board accepts, in bytes.
    #[arg(long)]
    pub max_size: Option<usize>,

    /// Open the port at this baud first to enter the bootloader (e.g. 1200).
    #[arg(long)]
    pub touch_baud: Option<u32>,

    /// Do not restore control constants and settings.
    #[arg(long)]
    pub no_restore_settings: bool,

    /// Do not restore installed devices.
    #[arg(long)]
    pub no_restore_devices: bool,

    /// Directory for the settings backup.
    #[arg(long)]
    pub backup_dir: Option<PathBuf>,

    /// Name of the board in messages.
    #[arg(long)]
    pub name: Option<String>,

    /// Seconds to wait after opening the port before talking to the board.
    #[arg(long, value_name = "SECS")]
    pub open_delay: Option<u64>,

    /// Do not ask for confirmation.
    #[arg(short, long)]
    pub yes: bool,
}

/// Flash options after merging arguments and configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FlashSettings {
    pub method: Method,
    pub tool: PathBuf,
    pub tool_args: Vec<String>,
    pub max_size: Option<usize>,
    pub touch_baud: Option<u32>,
    pub display_name: String,
    pub open_delay: Duration,
    pub restore_settings: bool,
    pub restore_devices: bool,
    pub backup_dir: PathBuf,
}

impl FlashSettings {
    /// Command-line values win over the configuration.
    pub(crate) fn resolve(args: &FlashArgs, config: &Config) -> Result<Self> {
        let flash = &config.flash;
        let method = match (args.method, &flash.method) {
            (Some(method), _) => method,
            (None, Some(name)) => Method::from_str(name, true).map_err(|_| {
                CliError::Config(format!(
                    "Unknown flash method '{name}' in config, expected 'packet' or 'external'"
                ))
            })?,
            (None, None) => Method::Packet,
        };

        let tool_args = if !args
            .tool_args
            .is_empty()
        {
            args.tool_args
                .clone()
        } else if !flash
            .tool_args
            .is_empty()
        {
            flash
                .tool_args
                .clone()
        } else {
            DEFAULT_TOOL_ARGS
                .iter()
                .map(ToString::to_string)
                .collect()
        };

        Ok(Self {
            method,
            tool: args
                .tool
                .clone()
                .or_else(|| {
                    flash
                        .tool
                        .clone()
                })
                .unwrap_or_else(|| PathBuf::from(DEFAULT_TOOL)),
            tool_args,
            max_size: args
                .max_size
                .or(flash.max_size),
            touch_baud: args
                .touch_baud
                .or(flash.touch_baud),
            display_name: args
                .name
                .clone()
                .or_else(|| {
                    flash
                        .display_name
                        .clone()
                })
                .unwrap_or_else(|| {
                    method
                        .default_display_name()
                        .to_string()
                }),
            open_delay: Duration::from_secs(
                args.open_delay
                    .or(flash.open_delay_secs)
                    .unwrap_or_else(|| method.default_open_delay_secs()),
            ),
            restore_settings: !args.no_restore_settings
                && config
                    .restore
                    .settings
                    .unwrap_or(true),
            restore_devices: !args.no_restore_devices
                && config
                    .restore
                    .devices
                    .unwrap_or(true),
            backup_dir: args
                .backup_dir
                .clone()
                .unwrap_or_else(|| config.backup_dir()),
        })
    }

    fn backend(&self, progress: &ProgressBar) -> Box<dyn FlashBackend> {
        match self.method {
            Method::Packet => {
                let pb = progress.clone();
                Box::new(
                    PacketTransportFlash::new().with_progress(Box::new(move |sent, total| {
                        pb.set_length(total as u64);
                        pb.set_position(sent as u64);
                    })),
                )
            },
            Method::External => {
                let mut tool = ExternalToolFlash::new(
                    self.tool
                        .clone(),
                    self.tool_args
                        .clone(),
                );
                if let Some(max) = self.max_size {
                    tool = tool.with_max_size(max);
                }
                if let Some(baud) = self.touch_baud {
                    tool = tool.with_touch_baud(baud);
                }
                Box::new(tool)
            },
        }
    }
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config, args: &FlashArgs) -> Result<()> {
    let settings = FlashSettings::resolve(args, config)?;
    debug!("Flash settings: {settings:?}");

    let image = FirmwareImage::from_file(&args.firmware)
        .with_context(|| format!("Failed to load firmware {}", args.firmware.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} Loaded {} ({} bytes)",
            style("📦").cyan(),
            image.name(),
            image
                .data()
                .len()
        );
    }

    let port = get_port(cli, config)?;
    let alt_port = cli
        .alt_port
        .clone()
        .or_else(|| {
            config
                .port
                .alt_serial
                .clone()
        });
    let baud = cli
        .baud
        .or(config.port.baud)
        .unwrap_or(DEFAULT_BAUD);
    if !cli.quiet {
        eprintln!(
            "{} Using {} at {baud} baud",
            style("🔌").cyan(),
            style(&port).green()
        );
    }

    let prompt = format!(
        "Flash {} onto the {} on {port}?",
        image.name(),
        settings.display_name
    );
    if !confirm(cli, args, &prompt)? {
        return Err(CliError::Cancelled("Update cancelled".into()).into());
    }

    let progress = progress_bar(cli, settings.method);
    let handle = DeviceHandle::new(NativePortFactory, port, alt_port).with_baud(baud);
    let options = UpdateOptions {
        display_name: settings
            .display_name
            .clone(),
        restore_settings: settings.restore_settings,
        restore_devices: settings.restore_devices,
        open_delay: settings.open_delay,
        ..UpdateOptions::default()
    };
    let mut session = UpdateOrchestrator::new(handle, settings.backend(&progress), options)
        .with_backup(Box::new(DirectoryBackup::new(&settings.backup_dir)));

    let outcome = session.run(&image);
    progress.finish_and_clear();
    report(cli, outcome)
}

/// Ask before touching the board, unless told not to or unable to ask.
fn confirm(cli: &Cli, args: &FlashArgs, prompt: &str) -> Result<bool> {
    if args.yes
        || cli.non_interactive
        || !(std::io::stdin().is_terminal() && std::io::stderr().is_terminal())
    {
        return Ok(true);
    }
    Ok(Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false))
}

fn progress_bar(cli: &Cli, method: Method) -> ProgressBar {
    if cli.quiet || !use_fancy_output() || method != Method::Packet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr());
    pb
}

fn print_summary(summary: &RestoreSummary) {
    let version = |v: &Option<brewflash::FirmwareVersion>| {
        v.as_ref()
            .map_or_else(|| "unknown".to_string(), ToString::to_string)
    };
    eprintln!(
        "  {} {} -> {}",
        style("Version:").bold(),
        version(&summary.old_version),
        version(&summary.new_version)
    );
    if let Some(table) = summary.table {
        eprintln!("  {} {table}", style("Compatibility:").bold());
    }
    if let Some(path) = &summary.backup {
        eprintln!(
            "  {} {}",
            style("Backup:").bold(),
            style(path.display()).yellow()
        );
    }
    eprintln!(
        "  {} {} restored, {} left at defaults",
        style("Settings:").bold(),
        summary
            .settings_restored
            .len(),
        summary
            .settings_defaulted
            .len()
    );
    eprintln!(
        "  {} {} restored",
        style("Devices:").bold(),
        summary.devices_restored
    );
}

fn report(cli: &Cli, outcome: UpdateOutcome) -> Result<()> {
    match outcome {
        UpdateOutcome::Complete(summary) => {
            if !cli.quiet {
                print_summary(&summary);
                eprintln!(
                    "\n{} Update complete",
                    style("🎉")
                        .green()
                        .bold()
                );
            }
            Ok(())
        },
        UpdateOutcome::Partial { reason, summary } => {
            if !cli.quiet {
                print_summary(&summary);
            }
            Err(CliError::Partial(format!("Firmware flashed, but {reason}")).into())
        },
        UpdateOutcome::Failed { state, error } => {
            Err(anyhow::Error::new(error).context(format!("Update failed while {state}")))
        },
    }
}
