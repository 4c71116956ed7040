//! Terminal reporting for the admin and simulator commands
//!
//! Outcome lines go to stdout with a coloured marker; failures go to stderr so
//! a simulator run piped into a file still shows why it stopped.

use colored::{ColoredString, Colorize};
use iotedge_shared::Device;

fn report(marker: ColoredString, msg: &str) {
    println!("{} {}", marker, msg);
}

/// The server accepted what was sent.
pub fn success(msg: &str) {
    report("ok".green().bold(), msg);
}

/// The command stopped; printed once from `main`.
pub fn error(msg: &str) {
    eprintln!("{} {}", "failed".red().bold(), msg);
}

/// Progress of a running simulation.
pub fn info(msg: &str) {
    report("..".blue(), msg);
}

/// Something went wrong that did not stop the command.
pub fn warning(msg: &str) {
    report("warn".yellow().bold(), msg);
}

/// Device settings as the server stored them
pub fn device_summary(device: &Device) -> String {
    format!(
        "{} (id {}): interval {}s, buffer {}",
        device.name.bold(),
        device.id,
        device.interval,
        device.buffer
    )
}
