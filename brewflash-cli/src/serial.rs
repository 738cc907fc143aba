//! Serial port selection.
//!
//! An explicit `--port` or the configured port wins. Otherwise the ports are
//! enumerated, recognised controller boards are preferred, and the user picks
//! one when more than one candidate is left.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    brewflash::{NativePortEnumerator, PortEnumerator, PortInfo},
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI or environment.
    pub port: Option<String>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Select a serial port from the options, the config or the attached boards.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<String> {
    if let Some(port_name) = &options.port {
        return Ok(port_name.clone());
    }

    if let Some(port_name) = &config
        .port
        .serial
    {
        debug!("Using port from config: {port_name}");
        return Ok(port_name.clone());
    }

    let ports = NativePortEnumerator::list_ports()?;
    if ports.is_empty() {
        return Err(usage_err("No serial ports found. Is the controller plugged in?"));
    }

    let candidates = candidates(ports);
    if options.non_interactive {
        return pick_non_interactive(candidates).map(|p| p.name);
    }

    match candidates
        .len()
        .cmp(&1)
    {
        Ordering::Equal => {
            let port = candidates
                .into_iter()
                .next()
                .ok_or_else(|| usage_err("No serial ports available"))?;
            info!(
                "Auto-selected port: {} [{}]",
                port.name,
                port.board()
                    .name()
            );
            Ok(port.name)
        },
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(candidates)
        },
        Ordering::Less => Err(usage_err("No serial ports available")),
    }
}

/// Recognised boards if there are any, otherwise every port.
pub fn candidates(ports: Vec<PortInfo>) -> Vec<PortInfo> {
    let (known, unknown): (Vec<_>, Vec<_>) = ports
        .into_iter()
        .partition(|p| {
            p.board()
                .is_known()
        });
    if known.is_empty() { unknown } else { known }
}

/// Without prompts only an unambiguous choice is accepted.
pub fn pick_non_interactive(candidates: Vec<PortInfo>) -> Result<PortInfo> {
    match candidates
        .len()
        .cmp(&1)
    {
        Ordering::Equal => candidates
            .into_iter()
            .next()
            .ok_or_else(|| usage_err("No serial ports available")),
        Ordering::Greater => Err(usage_err(
            "Found multiple serial ports; pass --port to choose one in non-interactive mode",
        )),
        Ordering::Less => Err(usage_err("No serial ports available")),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Several serial ports found and no terminal to ask on; pass --port",
        ))
    }
}

pub(crate) fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Cancelled".into()).into()
            } else {
                usage_err(&format!("Prompt failed: {io_err}"))
            }
        },
    }
}

/// One line of the port picker.
pub fn describe_port(port: &PortInfo) -> String {
    let board = port.board();
    let device_info = if board.is_known() {
        format!(" [{}]", style(board.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();
    format!("{}{device_info}{product}", port.name)
}

fn select_port_interactive(ports: Vec<PortInfo>) -> Result<String> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&describe_port(p), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the controller's serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .into_iter()
            .nth(index)
            .map(|p| p.name)
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("Port selection cancelled".into()).into()),
    }
}
