//! brewflash CLI - update temperature-controller firmware without losing its
//! settings.
//!
//! ## Features
//!
//! - Flash over the serial link (YMODEM) or through an external programmer
//! - Back up and restore control settings and installed devices
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use {
    anyhow::Result,
    clap::{Parser, Subcommand},
    clap_complete::Shell,
    console::style,
    env_logger::Env,
    log::debug,
    std::{
        env,
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
    },
};

mod commands;
mod config;
mod serial;

use {
    commands::flash::FlashArgs,
    config::Config,
    serial::{SerialOptions, select_serial_port},
};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Errors that map to a specific exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing input the user has to supply.
    #[error("{0}")]
    Usage(String),
    /// Configuration that cannot be used.
    #[error("{0}")]
    Config(String),
    /// Flashed, but the configuration was not (fully) restored.
    #[error("{0}")]
    Partial(String),
    /// The user declined a prompt.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::Partial(_) => 5,
            Self::Cancelled(_) => 1,
        }
    }
}

/// Exit code for an error that ended the program.
///
/// Library errors are classified by kind: a board that cannot be reached is
/// a device failure, a bad configuration value a configuration error.
pub(crate) fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return cli_err.exit_code();
        }
        if let Some(lib_err) = cause.downcast_ref::<brewflash::Error>() {
            return match lib_err {
                brewflash::Error::Connection(_)
                | brewflash::Error::Timeout(_)
                | brewflash::Error::Serial(_) => 4,
                brewflash::Error::Config(_) => 3,
                _ => 1,
            };
        }
    }
    1
}

/// brewflash - flash new firmware onto a brewing temperature controller and
/// carry its settings over.
///
/// Environment variables:
///   BREWFLASH_PORT              - Serial port of the controller
///   BREWFLASH_ALT_PORT          - Port the board may reappear on after reset
///   BREWFLASH_BAUD              - Baud rate (default: 57600)
///   BREWFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "brewflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "BREWFLASH_PORT")]
    port: Option<String>,

    /// Alternate port to try when the board re-enumerates after a reset.
    #[arg(long, global = true, env = "BREWFLASH_ALT_PORT")]
    alt_port: Option<String>,

    /// Baud rate of the controller's serial link.
    #[arg(short, long, global = true, env = "BREWFLASH_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "BREWFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file (replaces the global and local files).
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash a firmware image and restore the old settings.
    Flash(FlashArgs),

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell to generate completions for.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Help, version and usage errors exit here with clap's own codes (0 / 2).
    let cli = Cli::parse();
    init_logging(&cli);

    debug!(
        "brewflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!(
                "{} {err:#}",
                style("Error:")
                    .red()
                    .bold()
            );
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };

    match &cli.command {
        Commands::Flash(args) => commands::flash::cmd_flash(cli, &config, args),
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Get the serial port from CLI args, config or interactive selection.
fn get_port(cli: &Cli, config: &Config) -> Result<String> {
    let options = SerialOptions {
        port: cli
            .port
            .clone(),
        non_interactive: cli.non_interactive,
    };
    select_serial_port(&options, config)
}
