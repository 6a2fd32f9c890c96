use acpowermeter_lib::protocol as proto;
use acpowermeter_lib::serialport::DEFAULT_BAUD_RATE;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_address(s: &str) -> Result<u8, String> {
    let address =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid address format: {e}"))?;
    proto::address_encode(address).map_err(|e| e.to_string())?;
    Ok(address)
}

fn parse_threshold(s: &str) -> Result<i32, String> {
    let watts = s
        .parse::<i32>()
        .map_err(|e| format!("Invalid power alarm threshold format: {e}"))?;
    proto::threshold_encode(watts).map_err(|e| e.to_string())?;
    Ok(watts)
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show voltage, current, power, energy, frequency, power factor and alarm state
    Poll,
    /// Show or set the power alarm threshold in W
    Alarm {
        /// New threshold (0..=32767). Without it the current threshold is shown.
        #[arg(value_parser = parse_threshold)]
        watts: Option<i32>,
    },
    /// Show or set the slave address
    Address {
        /// New slave address (0..=247, e.g. 7 or 0x07). Without it the current address is shown.
        #[arg(value_parser = parse_address)]
        address: Option<u8>,
    },
    /// Reset the energy counter
    ResetEnergy,
    /// Run in daemon mode, periodically polling and recording measurements
    Daemon {
        /// Output destination for measurements
        #[command(subcommand)]
        output: DaemonOutput,
        /// Interval between two polls (e.g., "500ms", "1s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "1s")]
        interval: Duration,
        /// Reset the energy counter before recording
        #[clap(long, short, action)]
        reset: bool,
        /// Set the power alarm threshold in W before recording
        #[clap(long, short, value_parser = parse_threshold)]
        alarm: Option<i32>,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously poll and print measurements to the standard output (console).
    Console,
    /// Continuously poll and append measurements to a CSV file.
    Csv {
        /// Output file (default: ACM_<timestamp>.csv)
        #[arg(long, short)]
        file: Option<String>,
    },
}

const fn about_text() -> &'static str {
    "AC power meter command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    /// Baud rate of the serial link
    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    pub baud_rate: u32,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout of a single serial read (e.g., "10ms", "20ms").
    /// A reply is given up after 50 empty reads.
    #[arg(value_parser = humantime::parse_duration, long, default_value = "10ms")]
    pub timeout: Duration,

    // Some USB - RS485 dongles requires at least 10ms to switch between TX and RX, so use a save delay between frames
    /// Delay between two requests to the meter (e.g., "4ms", "15ms")
    /// (useful for some serial adapters that need time to switch between TX/RX)
    #[arg(value_parser = humantime::parse_duration, long, default_value = "4ms")]
    pub delay: Duration,
}
