//! `list-ports` command.

use {
    crate::serial::{candidates, describe_port},
    anyhow::Result,
    brewflash::{NativePortEnumerator, PortEnumerator, PortInfo},
    console::style,
    log::warn,
    serde_json::{Value, json},
};

/// JSON record for one port.
pub(crate) fn port_json(port: &PortInfo) -> Value {
    let board = port.board();
    json!({
        "name": port.name,
        "board": board.name(),
        "known": board.is_known(),
        "vid": port.vid,
        "pid": port.pid,
        "manufacturer": port.manufacturer,
        "product": port.product,
        "serial": port.serial_number,
    })
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = NativePortEnumerator::list_ports().unwrap_or_else(|e| {
        warn!("Cannot enumerate serial ports: {e}");
        Vec::new()
    });

    if json {
        let list: Vec<Value> = ports
            .iter()
            .map(port_json)
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Available serial ports")
            .bold()
            .underlined()
    );

    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &ports {
        eprintln!("  {} {}", style("•").green(), describe_port(port));
    }

    let picks = candidates(ports);
    if let [only] = picks.as_slice() {
        if only
            .board()
            .is_known()
        {
            eprintln!(
                "\n{} Would auto-select {}",
                style("→")
                    .green()
                    .bold(),
                style(&only.name)
                    .cyan()
                    .bold()
            );
        }
    }
    Ok(())
}
