//! `boardflash list-ports`.

use boardflash::{DetectedPort, DeviceClass, auto_detect_port, discover_ports, discover_ports_for};
use console::style;
use rust_i18n::t;

/// List serial ports, optionally only those matching `board`.
pub(crate) fn cmd_list_ports(json: bool, board: Option<DeviceClass>) {
    let detected = match board {
        Some(class) => discover_ports_for(class),
        None => discover_ports(),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&ports_json(&detected)).unwrap_or_default()
        );
        return;
    }

    eprintln!("{}", style(t!("list_ports.header")).bold().underlined());
    if detected.is_empty() {
        eprintln!("  {}", style(t!("list_ports.no_ports")).dim());
        return;
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();
        let boards = board_names(port);
        let boards = if boards.is_empty() {
            String::new()
        } else {
            format!(" {}", style(format!("<{}>", boards.join(", "))).green())
        };
        eprintln!(
            "  {} {}{device_type}{vid_pid}{product}{boards}",
            style("•").green(),
            style(&port.name).cyan()
        );
    }

    let classes = board.map_or_else(|| DeviceClass::ALL.to_vec(), |class| vec![class]);
    for class in classes {
        if let Ok(port) = auto_detect_port(class) {
            eprintln!(
                "{} {}",
                style("→").green().bold(),
                t!(
                    "list_ports.auto_detected",
                    board = class.name(),
                    port = style(&port.name).cyan().bold().to_string()
                )
            );
        }
    }
}

fn board_names(port: &DetectedPort) -> Vec<&'static str> {
    port.classes().iter().map(DeviceClass::name).collect()
}

fn ports_json(ports: &[DetectedPort]) -> Vec<serde_json::Value> {
    ports
        .iter()
        .map(|p| {
            serde_json::json!({
                "name": p.name,
                "device": p.device.name(),
                "known": p.device.is_known(),
                "boards": board_names(p),
                "vid": p.vid,
                "pid": p.pid,
                "manufacturer": p.manufacturer,
                "product": p.product,
                "serial": p.serial,
            })
        })
        .collect()
}
