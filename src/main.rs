use acpowermeter_lib::serialport::PowerMeter;
use anyhow::{bail, Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let mut meter = PowerMeter::connect(&args.device, args.baud_rate)
        .with_context(|| format!("No power meter responding on '{}'", args.device))?;
    meter.set_timeout(args.timeout)?;
    meter.set_delay(args.delay);

    match args.command {
        CliCommands::Poll => match meter.poll().with_context(|| "Cannot poll")? {
            Some(measurement) => println!("Measurement: {measurement:?}"),
            None => bail!("No valid reply from power meter"),
        },
        CliCommands::Alarm { watts: None } => {
            match meter
                .get_power_alarm()
                .with_context(|| "Cannot get power alarm")?
            {
                Some(threshold) => println!("Power alarm threshold: {threshold} W"),
                None => bail!("No valid reply from power meter"),
            }
        }
        CliCommands::Alarm { watts: Some(watts) } => {
            match meter
                .set_power_alarm(watts)
                .with_context(|| "Cannot set power alarm")?
            {
                Some(threshold) => println!("Power alarm threshold set to {threshold} W"),
                None => bail!("No valid reply from power meter"),
            }
        }
        CliCommands::Address { address: None } => {
            match meter
                .get_slave_address()
                .with_context(|| "Cannot get slave address")?
            {
                Some(address) => println!("Slave address: {address:#04X}"),
                None => bail!("No valid reply from power meter"),
            }
        }
        CliCommands::Address {
            address: Some(address),
        } => match meter
            .set_slave_address(address)
            .with_context(|| "Cannot set slave address")?
        {
            Some(current) if current == address => {
                println!("Slave address set to {current:#04X}")
            }
            Some(current) => bail!("Slave address is still {current:#04X}"),
            None => bail!("No valid reply from power meter"),
        },
        CliCommands::ResetEnergy => {
            if !meter
                .reset_energy()
                .with_context(|| "Cannot reset energy")?
            {
                bail!("Energy reset was not acknowledged");
            }
            println!("Energy counter reset");
        }
        CliCommands::Daemon {
            output,
            interval,
            reset,
            alarm,
        } => daemon::run(meter, output, interval, reset, alarm)?,
    }

    Ok(())
}
