use acpowermeter_lib::protocol::Measurement;
use acpowermeter_lib::serialport::PowerMeter;
use anyhow::{Context, Result};
use log::{info, warn};
use serde::Serialize;
use std::fs::File;
use std::time::{Duration, Instant};

use crate::commandline;

/// Apparent and reactive power derived from voltage, current and power factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerTriangle {
    /// VA
    pub apparent: f32,
    /// var
    pub reactive: f32,
    /// degrees
    pub phi: f32,
}

impl From<&Measurement> for PowerTriangle {
    fn from(m: &Measurement) -> Self {
        let phi = m.power_factor.clamp(0.0, 1.0).acos();
        let apparent = m.voltage * m.current;
        Self {
            apparent,
            reactive: apparent * phi.sin(),
            phi: phi.to_degrees(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Row {
    #[serde(rename = "Time[S]")]
    time: f64,
    #[serde(rename = "Volt[V]")]
    voltage: f32,
    #[serde(rename = "Current[A]")]
    current: f32,
    #[serde(rename = "Power[W]")]
    power: f32,
    #[serde(rename = "Energy[Wh]")]
    energy: u32,
    #[serde(rename = "Freq[Hz]")]
    frequency: f32,
    #[serde(rename = "PF")]
    power_factor: f32,
    #[serde(rename = "Alarm")]
    alarm: u8,
}

impl Row {
    fn new(elapsed: Duration, m: &Measurement) -> Self {
        Self {
            time: elapsed.as_secs_f64(),
            voltage: m.voltage,
            current: m.current,
            power: m.power,
            energy: m.energy,
            frequency: m.frequency,
            power_factor: m.power_factor,
            alarm: m.alarm.into(),
        }
    }
}

fn default_csv_file_name() -> String {
    format!("ACM_{}.csv", chrono::Local::now().format("%Y%m%d%H%M%S"))
}

enum Recorder {
    Console,
    Csv(csv::Writer<File>),
}

impl Recorder {
    fn new(output: &commandline::DaemonOutput) -> Result<Self> {
        Ok(match output {
            commandline::DaemonOutput::Console => Recorder::Console,
            commandline::DaemonOutput::Csv { file } => {
                let file = file.clone().unwrap_or_else(default_csv_file_name);
                info!("Recording to {file:?}");
                let writer = csv::Writer::from_path(&file)
                    .with_context(|| format!("Cannot create CSV file {file:?}"))?;
                Recorder::Csv(writer)
            }
        })
    }

    fn record(&mut self, elapsed: Duration, m: &Measurement) -> Result<()> {
        match self {
            Recorder::Console => {
                let triangle = PowerTriangle::from(m);
                println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                println!(
                    "Volt {:7.1} V  Curr {:7.3} A  Pwr  {:7.1} W",
                    m.voltage, m.current, m.power
                );
                println!(
                    "Freq {:7.1} Hz Ener {:7} Wh Pf   {:7.2}   Alarm {}",
                    m.frequency, m.energy, m.power_factor, m.alarm
                );
                println!(
                    "Qpwr {:7.3} var Spwr {:7.3} VA Phi {:5.1} deg",
                    triangle.reactive, triangle.apparent, triangle.phi
                );
            }
            Recorder::Csv(writer) => {
                writer
                    .serialize(Row::new(elapsed, m))
                    .with_context(|| "Cannot write CSV row")?;
                writer.flush().with_context(|| "Cannot flush CSV file")?;
            }
        }
        Ok(())
    }
}

pub fn run(
    mut meter: PowerMeter,
    output: commandline::DaemonOutput,
    interval: Duration,
    reset: bool,
    alarm: Option<i32>,
) -> Result<()> {
    info!("Starting daemon mode: output={output:?}, interval={interval:?}");

    if reset {
        if meter.reset_energy()? {
            info!("Energy counter reset");
        } else {
            warn!("Energy counter reset was not acknowledged");
        }
    }
    if let Some(watts) = alarm {
        match meter.set_power_alarm(watts)? {
            Some(threshold) => info!("Power alarm threshold set to {threshold} W"),
            None => warn!("Cannot set power alarm threshold to {watts} W"),
        }
    }

    let mut recorder = Recorder::new(&output)?;
    let start = Instant::now();
    loop {
        let cycle = Instant::now();
        match meter.poll()? {
            Some(measurement) => recorder.record(start.elapsed(), &measurement)?,
            None => warn!("No data in this cycle"),
        }
        if let Some(remaining) = interval.checked_sub(cycle.elapsed()) {
            std::thread::sleep(remaining);
        }
    }
}
