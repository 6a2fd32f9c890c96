//! Synchronous client for the AC power meter using the `serialport` crate.
//!
//! Every operation is one request/response exchange: the request frame is
//! written, then the reply is collected with short reads until it is complete
//! or the link stays silent for [`RESPONSE_RETRIES`] read timeouts.
//!
//! # Example
//!
//! ```no_run
//! use acpowermeter_lib::serialport::PowerMeter;
//!
//! fn main() -> Result<(), acpowermeter_lib::Error> {
//!     let mut meter = PowerMeter::connect("/dev/ttyUSB0", 9600)?;
//!     if let Some(measurement) = meter.poll()? {
//!         println!("{:?}", measurement);
//!     }
//!     Ok(())
//! }
//! ```

use crate::protocol::*;
use crate::Error;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

type Result<T> = std::result::Result<T, Error>;

pub const DEFAULT_BAUD_RATE: u32 = 9600;
/// Per read timeout, also the polling cadence of the response collector.
pub const READ_TIMEOUT: Duration = Duration::from_millis(10);
/// Number of empty reads before a response is given up.
pub const RESPONSE_RETRIES: u8 = 50;

const READ_CHUNK_SIZE: usize = 32;

/// Byte stream to the meter.
pub trait Transport: Read + Write {
    /// Drops whatever is waiting in the input buffer.
    fn clear_input(&mut self) -> io::Result<()>;
}

impl Transport for Box<dyn serialport::SerialPort> {
    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// Handle to one power meter on a point to point serial link.
///
/// Not meant to be shared between threads; a periodic poller has to own it.
#[derive(Debug)]
pub struct PowerMeter<T: Transport = Box<dyn serialport::SerialPort>> {
    transport: T,
    last_execution: Instant,
    delay: Duration,
    state: DeviceState,
}

impl PowerMeter {
    /// Opens `port` and queries the meter for its slave address.
    ///
    /// Fails if the port cannot be opened or the meter does not answer,
    /// so a returned handle always knows the current address.
    pub fn connect(port: &str, baud_rate: u32) -> Result<Self> {
        let serial = serialport::new(port, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;
        log::debug!("Opened serial port '{}' at {} baud", port, baud_rate);
        Self::with_transport(serial)
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.transport.set_timeout(timeout).map_err(Error::from)
    }
}

impl<T: Transport> PowerMeter<T> {
    pub fn with_transport(transport: T) -> Result<Self> {
        let mut meter = Self {
            transport,
            last_execution: Instant::now(),
            delay: MINIMUM_DELAY,
            state: DeviceState::default(),
        };
        log::info!("Initializing meter - getting address");
        meter.transact(&Settings::request(CALIBRATION_ADDRESS)?, Settings::reply_size())?;
        log::info!("Initializing meter - has address {}", meter.state.address);
        Ok(meter)
    }

    /// Minimum silent time between the end of a reply and the next request.
    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = Duration::max(delay, MINIMUM_DELAY);
    }

    /// Slave address all requests are sent to.
    pub fn address(&self) -> u8 {
        self.state.address
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    fn serial_await_delay(&self) {
        let last_exec_diff = Instant::now().duration_since(self.last_execution);
        if let Some(time_until_delay_reached) = self.delay.checked_sub(last_exec_diff) {
            std::thread::sleep(time_until_delay_reached);
        }
    }

    fn send_bytes(&mut self, tx_buffer: &[u8]) -> Result<()> {
        // clear all incoming serial to avoid data collision
        self.transport.clear_input()?;
        self.serial_await_delay();
        log::trace!("send_bytes: {:02X?}", tx_buffer);
        self.transport.write_all(tx_buffer)?;
        self.transport.flush()?;
        Ok(())
    }

    /// Collects at least `size` bytes. Only empty reads count against the
    /// retry budget, a slow but flowing reply is never cut short.
    fn receive_bytes(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut rx_buffer = Vec::with_capacity(size.max(READ_CHUNK_SIZE));
        let mut chunk = [0; READ_CHUNK_SIZE];
        let mut tries = RESPONSE_RETRIES;

        let result = loop {
            if rx_buffer.len() >= size {
                break Ok(());
            }
            let received = match self.transport.read(&mut chunk) {
                Ok(received) => received,
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                    ) =>
                {
                    0
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => break Err(Error::from(err)),
            };
            if received > 0 {
                rx_buffer.extend_from_slice(&chunk[..received]);
            } else {
                tries -= 1;
                if tries == 0 {
                    log::warn!(
                        "Timeout - expected={} received={} buffer={:02X?}",
                        size,
                        rx_buffer.len(),
                        rx_buffer
                    );
                    break Err(Error::Timeout {
                        expected: size,
                        received: rx_buffer.len(),
                    });
                }
            }
        };
        self.last_execution = Instant::now();
        result?;

        log::trace!("receive_bytes: {:02X?}", rx_buffer);
        Ok(rx_buffer)
    }

    /// One complete exchange: send `request`, collect `reply_size` bytes,
    /// decode and commit the reply to the cached state.
    pub fn transact(&mut self, request: &[u8], reply_size: usize) -> Result<Response> {
        self.send_bytes(request)?;
        let rx_buffer = self.receive_bytes(reply_size)?;
        let response = Response::decode(&rx_buffer)?;
        self.state.apply(&response);
        Ok(response)
    }

    /// Like [`Self::transact`] but protocol faults are logged and become `None`.
    fn transact_or_none(
        &mut self,
        operation: &str,
        request: &[u8],
        reply_size: usize,
    ) -> Result<Option<Response>> {
        match self.transact(request, reply_size) {
            Ok(response) => Ok(Some(response)),
            Err(err) if err.is_protocol_fault() => {
                log::warn!("Cannot {operation}: {err}");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Reads the measurement registers. `None` means no valid reply this time.
    pub fn poll(&mut self) -> Result<Option<Measurement>> {
        let request = Measurement::request(self.state.address)?;
        Ok(
            match self.transact_or_none("poll", &request, Measurement::reply_size())? {
                Some(Response::InputRegisterBlock(measurement)) => Some(measurement),
                Some(other) => {
                    log::warn!("Unexpected reply to measurement request: {:?}", other);
                    None
                }
                None => None,
            },
        )
    }

    /// Power alarm threshold in W.
    pub fn get_power_alarm(&mut self) -> Result<Option<f32>> {
        let request = Settings::request(self.state.address)?;
        let response =
            self.transact_or_none("get power alarm", &request, Settings::reply_size())?;
        Ok(response.and(self.state.threshold))
    }

    /// Writes the power alarm threshold (0..=32767 W) and returns the value
    /// the meter confirmed.
    pub fn set_power_alarm(&mut self, watts: i32) -> Result<Option<f32>> {
        let value = threshold_encode(watts)?;
        let request = write_register_request(self.state.address, THRESHOLD_REG_ADDR, value);
        let response =
            self.transact_or_none("set power alarm", &request, write_register_reply_size())?;
        Ok(response.and(self.state.threshold))
    }

    /// Asks for the configured slave address via [`CALIBRATION_ADDRESS`], so it
    /// works without knowing the current one.
    pub fn get_slave_address(&mut self) -> Result<Option<u8>> {
        let request = Settings::request(CALIBRATION_ADDRESS)?;
        let response =
            self.transact_or_none("get slave address", &request, Settings::reply_size())?;
        Ok(response.map(|_| self.state.address))
    }

    /// Changes the slave address (0..=247).
    ///
    /// The request is sent to the address currently known to this handle, so
    /// it only works after a successful [`PowerMeter::connect`] or
    /// [`Self::get_slave_address`]. Returns the address after the write; compare
    /// it with `address` to check the change took effect.
    pub fn set_slave_address(&mut self, address: u8) -> Result<Option<u8>> {
        let value = address_encode(address)?;
        log::info!(
            "Setting slave address {} to new address {}",
            self.state.address,
            address
        );
        let request = write_register_request(self.state.address, ADDRESS_REG_ADDR, value);
        let response =
            self.transact_or_none("set slave address", &request, write_register_reply_size())?;
        let result = response.map(|_| self.state.address);
        log::info!("Setting slave address success: {}", result == Some(address));
        Ok(result)
    }

    /// Resets the energy counter, `true` if the meter acknowledged.
    pub fn reset_energy(&mut self) -> Result<bool> {
        let request = user_function_request(self.state.address, FunctionCode::ResetEnergy);
        let response =
            self.transact_or_none("reset energy", &request, user_function_reply_size())?;
        Ok(matches!(
            response,
            Some(Response::BareAck(FunctionCode::ResetEnergy))
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::VecDeque;

    fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc16(body).to_le_bytes());
        frame
    }

    fn settings_reply(threshold: u16, address: u8) -> Vec<u8> {
        let mut body = vec![CALIBRATION_ADDRESS, 0x03, 0x04];
        body.extend_from_slice(&threshold.to_be_bytes());
        body.extend_from_slice(&(address as u16).to_be_bytes());
        with_crc(&body)
    }

    fn measurement_reply(address: u8, words: [u16; 10]) -> Vec<u8> {
        let mut body = vec![address, 0x04, 0x14];
        for w in words {
            body.extend_from_slice(&w.to_be_bytes());
        }
        with_crc(&body)
    }

    /// Each read returns the next scripted chunk, an empty chunk or an
    /// exhausted script is a read timeout.
    #[derive(Debug, Default)]
    struct ScriptedTransport {
        chunks: VecDeque<Vec<u8>>,
        written: Vec<Vec<u8>>,
        reads: usize,
        read_delay: Option<Duration>,
    }

    impl ScriptedTransport {
        fn reply(&mut self, frame: Vec<u8>) -> &mut Self {
            self.chunks.push_back(frame);
            self
        }
    }

    impl Read for ScriptedTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            match self.chunks.pop_front() {
                Some(mut chunk) if !chunk.is_empty() => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.chunks.push_front(chunk.split_off(n));
                    }
                    Ok(n)
                }
                _ => {
                    if let Some(delay) = self.read_delay {
                        std::thread::sleep(delay);
                    }
                    Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
                }
            }
        }
    }

    impl Write for ScriptedTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.push(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for ScriptedTransport {
        fn clear_input(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn connected(address: u8) -> PowerMeter<ScriptedTransport> {
        let mut transport = ScriptedTransport::default();
        transport.reply(settings_reply(2300, address));
        PowerMeter::with_transport(transport).unwrap()
    }

    #[test]
    fn connect_discovers_address() {
        let meter = connected(0x07);
        assert_eq!(meter.address(), 0x07);
        assert_eq!(meter.state().threshold, Some(2300.0));
        assert_eq!(
            meter.transport.written,
            vec![Settings::request(CALIBRATION_ADDRESS).unwrap()]
        );
    }

    #[test]
    fn connect_fails_on_silent_link() {
        let result = PowerMeter::with_transport(ScriptedTransport::default());
        assert_matches!(
            result,
            Err(Error::Timeout {
                expected: 9,
                received: 0
            })
        );
    }

    #[test]
    fn poll_decodes_measurement() {
        let mut meter = connected(0x07);
        meter
            .transport
            .reply(measurement_reply(0x07, [2300, 1500, 0, 12000, 0, 500, 0, 500, 95, 0]));
        let measurement = meter.poll().unwrap().unwrap();
        assert_eq!(measurement.voltage, 230.0);
        assert_eq!(measurement.current, 1.5);
        assert_eq!(measurement.power, 1200.0);
        assert_eq!(measurement.energy, 500);
        assert_eq!(measurement.frequency, 50.0);
        assert_eq!(measurement.power_factor, 0.95);
        assert!(!measurement.alarm);
        assert_eq!(meter.state().measurement, Some(measurement));
        assert_eq!(
            meter.transport.written.last().unwrap(),
            &Measurement::request(0x07).unwrap()
        );
    }

    #[test]
    fn poll_accumulates_partial_reads() {
        let mut meter = connected(0x01);
        let frame = measurement_reply(0x01, [2300, 0, 0, 0, 0, 0, 0, 500, 100, 0]);
        meter
            .transport
            .reply(frame[..5].to_vec())
            .reply(Vec::new())
            .reply(frame[5..11].to_vec())
            .reply(Vec::new())
            .reply(frame[11..].to_vec());
        let measurement = meter.poll().unwrap().unwrap();
        assert_eq!(measurement.voltage, 230.0);
    }

    #[test]
    fn slow_reply_is_not_a_timeout() {
        let mut meter = connected(0x01);
        let frame = measurement_reply(0x01, [2300, 0, 0, 0, 0, 0, 0, 500, 100, 0]);
        // one byte at a time, more reads in total than the retry budget
        for (i, byte) in frame.into_iter().enumerate() {
            if i < 20 {
                meter.transport.reply(Vec::new()).reply(Vec::new());
            }
            meter.transport.reply(vec![byte]);
        }
        let reads_before = meter.transport.reads;
        assert!(meter.poll().unwrap().is_some());
        assert_eq!(meter.transport.reads - reads_before, 65);
    }

    #[test]
    fn silent_link_times_out_after_retry_budget() {
        let mut meter = connected(0x01);
        meter.transport.read_delay = Some(Duration::from_millis(1));
        let reads_before = meter.transport.reads;
        let start = Instant::now();

        let result = meter.transact(&Measurement::request(0x01).unwrap(), Measurement::reply_size());

        assert_matches!(
            result,
            Err(Error::Timeout {
                expected: 25,
                received: 0
            })
        );
        assert_eq!(
            meter.transport.reads - reads_before,
            RESPONSE_RETRIES as usize
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(RESPONSE_RETRIES as u64));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn poll_timeout_is_no_data() {
        let mut meter = connected(0x01);
        assert_matches!(meter.poll(), Ok(None));
    }

    #[test]
    fn corrupted_reply_keeps_state() {
        let mut meter = connected(0x03);
        meter
            .transport
            .reply(measurement_reply(0x03, [2300, 0, 0, 0, 0, 0, 0, 500, 100, 0]));
        meter.poll().unwrap().unwrap();
        let before = meter.state().clone();

        let mut corrupted = measurement_reply(0x03, [1000, 0, 0, 0, 0, 0, 0, 600, 50, 0]);
        corrupted[24] ^= 0x55;
        meter.transport.reply(corrupted);
        assert_matches!(meter.poll(), Ok(None));

        let mut corrupted = settings_reply(100, 0x09);
        corrupted[3] ^= 0x01;
        meter.transport.reply(corrupted);
        assert_matches!(meter.get_power_alarm(), Ok(None));

        assert_eq!(meter.state(), &before);
    }

    #[test]
    fn set_power_alarm_commits_threshold() {
        let mut meter = connected(0x05);
        let ack = write_register_request(0x05, THRESHOLD_REG_ADDR, 23000);
        meter.transport.reply(ack.clone());
        assert_eq!(meter.set_power_alarm(23000).unwrap(), Some(23000.0));
        assert_eq!(meter.state().threshold, Some(23000.0));
        assert_eq!(meter.address(), 0x05);
        assert_eq!(meter.transport.written.last().unwrap(), &ack);
    }

    #[test]
    fn set_power_alarm_out_of_range() {
        let mut meter = connected(0x05);
        let writes = meter.transport.written.len();
        assert_matches!(
            meter.set_power_alarm(-1),
            Err(Error::ThresholdOutOfRange(-1))
        );
        assert_matches!(
            meter.set_power_alarm(40000),
            Err(Error::ThresholdOutOfRange(40000))
        );
        assert_eq!(meter.transport.written.len(), writes);
    }

    #[test]
    fn get_power_alarm() {
        let mut meter = connected(0x05);
        meter.transport.reply(settings_reply(500, 0x05));
        assert_eq!(meter.get_power_alarm().unwrap(), Some(500.0));
        assert_eq!(
            meter.transport.written.last().unwrap(),
            &Settings::request(0x05).unwrap()
        );
    }

    #[test]
    fn unknown_write_ack_still_succeeds() {
        let mut meter = connected(0x05);
        meter
            .transport
            .reply(write_register_request(0x05, 0x0010, 1));
        assert_eq!(meter.set_power_alarm(100).unwrap(), Some(2300.0));
        assert_eq!(meter.state().threshold, Some(2300.0));
    }

    #[test]
    fn slave_address_roundtrip() {
        let mut meter = connected(0x01);

        meter
            .transport
            .reply(write_register_request(0x01, ADDRESS_REG_ADDR, 0x22));
        assert_eq!(meter.set_slave_address(0x22).unwrap(), Some(0x22));
        // written to the previously known address
        assert_eq!(
            meter.transport.written.last().unwrap(),
            &write_register_request(0x01, ADDRESS_REG_ADDR, 0x22)
        );
        assert_eq!(meter.address(), 0x22);

        meter.transport.reply(settings_reply(2300, 0x22));
        assert_eq!(meter.get_slave_address().unwrap(), Some(0x22));
        assert_eq!(
            meter.transport.written.last().unwrap(),
            &Settings::request(CALIBRATION_ADDRESS).unwrap()
        );
    }

    #[test]
    fn set_slave_address_out_of_range() {
        let mut meter = connected(0x01);
        let writes = meter.transport.written.len();
        assert_matches!(
            meter.set_slave_address(248),
            Err(Error::AddressOutOfRange(248))
        );
        assert_eq!(meter.transport.written.len(), writes);
    }

    #[test]
    fn reset_energy() {
        let mut meter = connected(0x02);
        meter
            .transport
            .reply(user_function_request(0x02, FunctionCode::ResetEnergy));
        assert!(meter.reset_energy().unwrap());
        assert_eq!(
            meter.transport.written.last().unwrap(),
            &user_function_request(0x02, FunctionCode::ResetEnergy)
        );

        assert!(!meter.reset_energy().unwrap());
    }

    #[test]
    fn unrecognized_reply_is_no_data() {
        let mut meter = connected(0x02);
        let mut body = vec![0x02, 0x10];
        body.resize(Measurement::reply_size() - 2, 0);
        meter.transport.reply(with_crc(&body));
        assert_matches!(meter.poll(), Ok(None));
    }

    #[test]
    fn io_errors_propagate() {
        #[derive(Debug)]
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
            }
        }
        impl Write for Broken {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        impl Transport for Broken {
            fn clear_input(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        assert_matches!(PowerMeter::with_transport(Broken), Err(Error::Io(_)));
    }

    #[test]
    fn delay_is_clamped() {
        let mut meter = connected(0x01);
        meter.set_delay(Duration::from_millis(1));
        assert_eq!(meter.delay, MINIMUM_DELAY);
        meter.set_delay(Duration::from_millis(20));
        assert_eq!(meter.delay, Duration::from_millis(20));
    }
}
