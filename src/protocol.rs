use crate::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Function codes understood by the power meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHolding = 0x03,
    ReadInput = 0x04,
    WriteSingle = 0x06,
    /// Vendor defined, only accepted on [`CALIBRATION_ADDRESS`]
    Calibration = 0x41,
    /// Vendor defined
    ResetEnergy = 0x42,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

pub const FACTORY_DEFAULT_ADDRESS: u8 = 0x01;
pub const BROADCAST_ADDRESS: u8 = 0x00;
/// Answered by every meter regardless of its configured slave address.
pub const CALIBRATION_ADDRESS: u8 = 0xF8;
pub const ADDRESS_MIN: u8 = 0;
pub const ADDRESS_MAX: u8 = 247;

pub const THRESHOLD_MIN: i32 = 0;
pub const THRESHOLD_MAX: i32 = 0x7FFF;

// https://minimalmodbus.readthedocs.io/en/stable/serialcommunication.html#timing-of-the-serial-communications
// minimum delay 4ms by baud rate 9600
pub const MINIMUM_DELAY: std::time::Duration = std::time::Duration::from_millis(4);

// Input registers
pub const REG_VOLTAGE: u16 = 0x0000;
pub const REG_CURRENT_LOW: u16 = 0x0001;
pub const REG_CURRENT_HIGH: u16 = 0x0002;
pub const REG_POWER_LOW: u16 = 0x0003;
pub const REG_POWER_HIGH: u16 = 0x0004;
pub const REG_ENERGY_LOW: u16 = 0x0005;
pub const REG_ENERGY_HIGH: u16 = 0x0006;
pub const REG_FREQUENCY: u16 = 0x0007;
pub const REG_POWER_FACTOR: u16 = 0x0008;
pub const REG_ALARM: u16 = 0x0009;

pub const MEASUREMENT_REG_ADDR: u16 = REG_VOLTAGE;
pub const MEASUREMENT_REG_QUAN: u16 = 10;

// Holding registers
pub const THRESHOLD_REG_ADDR: u16 = 0x0001;
pub const ADDRESS_REG_ADDR: u16 = 0x0002;

pub const SETTINGS_REG_ADDR: u16 = THRESHOLD_REG_ADDR;
pub const SETTINGS_REG_QUAN: u16 = 2;

const ALARM_ON: u16 = 0xFFFF;

const REGISTER_FRAME_LENGTH: usize = 8;
const USER_FUNCTION_FRAME_LENGTH: usize = 4;
const CHECKSUM_LENGTH: usize = 2;
const MIN_FRAME_LENGTH: usize = 4;

/// CRC16 (polynomial 0xA001, initial 0xFFFF) over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if (crc & 0x0001) != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Checksum bytes (little endian) of a frame whose last two bytes are the
/// checksum placeholder.
pub fn checksum(frame: &[u8]) -> [u8; 2] {
    crc16(&frame[..frame.len() - CHECKSUM_LENGTH]).to_le_bytes()
}

fn calc_crc_and_set(buffer: &mut [u8]) {
    let len = buffer.len();
    let crc = checksum(buffer);
    buffer[len - CHECKSUM_LENGTH..].copy_from_slice(&crc);
}

/// Read `count` holding or input registers starting at `start`.
pub fn read_registers_request(
    address: u8,
    function_code: FunctionCode,
    start: u16,
    count: u16,
) -> Result<Vec<u8>, Error> {
    if !matches!(
        function_code,
        FunctionCode::ReadHolding | FunctionCode::ReadInput
    ) {
        return Err(Error::InvalidFunctionCode(function_code.code()));
    }
    let mut tx_buffer = vec![0; REGISTER_FRAME_LENGTH];
    tx_buffer[0] = address;
    tx_buffer[1] = function_code.code();
    tx_buffer[2..4].copy_from_slice(&start.to_be_bytes());
    tx_buffer[4..6].copy_from_slice(&count.to_be_bytes());
    calc_crc_and_set(&mut tx_buffer);
    Ok(tx_buffer)
}

pub fn read_registers_reply_size(count: u16) -> usize {
    5 + 2 * count as usize
}

pub fn write_register_request(address: u8, register: u16, value: u16) -> Vec<u8> {
    let mut tx_buffer = vec![0; REGISTER_FRAME_LENGTH];
    tx_buffer[0] = address;
    tx_buffer[1] = FunctionCode::WriteSingle.code();
    tx_buffer[2..4].copy_from_slice(&register.to_be_bytes());
    tx_buffer[4..6].copy_from_slice(&value.to_be_bytes());
    calc_crc_and_set(&mut tx_buffer);
    tx_buffer
}

pub fn write_register_reply_size() -> usize {
    REGISTER_FRAME_LENGTH
}

/// Vendor defined function without payload. Calibration always goes to
/// [`CALIBRATION_ADDRESS`].
pub fn user_function_request(address: u8, function_code: FunctionCode) -> Vec<u8> {
    let mut tx_buffer = vec![0; USER_FUNCTION_FRAME_LENGTH];
    tx_buffer[0] = if function_code == FunctionCode::Calibration {
        CALIBRATION_ADDRESS
    } else {
        address
    };
    tx_buffer[1] = function_code.code();
    calc_crc_and_set(&mut tx_buffer);
    tx_buffer
}

pub fn user_function_reply_size() -> usize {
    USER_FUNCTION_FRAME_LENGTH
}

pub fn threshold_encode(watts: i32) -> Result<u16, Error> {
    if (THRESHOLD_MIN..=THRESHOLD_MAX).contains(&watts) {
        Ok(watts as u16)
    } else {
        Err(Error::ThresholdOutOfRange(watts))
    }
}

pub fn address_encode(address: u8) -> Result<u16, Error> {
    if (ADDRESS_MIN..=ADDRESS_MAX).contains(&address) {
        Ok(address as u16)
    } else {
        Err(Error::AddressOutOfRange(address as i32))
    }
}

fn validate_len(buffer: &[u8]) -> Result<(), Error> {
    if buffer.len() < MIN_FRAME_LENGTH {
        log::warn!("Not enough data - buffer={:02X?}", buffer);
        return Err(Error::ShortFrame(buffer.len()));
    }
    Ok(())
}

fn validate_checksum(buffer: &[u8]) -> Result<(), Error> {
    let body = &buffer[..buffer.len() - CHECKSUM_LENGTH];
    let calculated = crc16(body);
    let received = u16::from_le_bytes([buffer[buffer.len() - 2], buffer[buffer.len() - 1]]);
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={:04X} received={:04X} buffer={:02X?}",
            calculated,
            received,
            buffer
        );
        return Err(Error::ChecksumError {
            calculated,
            received,
        });
    }
    Ok(())
}

/// Big endian word `n` following a header of `header` bytes.
fn word(buffer: &[u8], header: usize, n: u16) -> u16 {
    let i = header + 2 * n as usize;
    u16::from_be_bytes([buffer[i], buffer[i + 1]])
}

fn double_word(buffer: &[u8], header: usize, low: u16, high: u16) -> u32 {
    0x10000 * word(buffer, header, high) as u32 + word(buffer, header, low) as u32
}

/// Decoded electrical state of one measurement cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Measurement {
    /// V
    pub voltage: f32,
    /// A
    pub current: f32,
    /// W
    pub power: f32,
    /// Wh
    pub energy: u32,
    /// Hz
    pub frequency: f32,
    pub power_factor: f32,
    pub alarm: bool,
}

impl Measurement {
    const HEADER: usize = 3;

    pub fn request(address: u8) -> Result<Vec<u8>, Error> {
        read_registers_request(
            address,
            FunctionCode::ReadInput,
            MEASUREMENT_REG_ADDR,
            MEASUREMENT_REG_QUAN,
        )
    }

    pub fn reply_size() -> usize {
        read_registers_reply_size(MEASUREMENT_REG_QUAN)
    }

    fn decode(rx_buffer: &[u8]) -> Self {
        let w = |reg| word(rx_buffer, Self::HEADER, reg);
        let dw = |low, high| double_word(rx_buffer, Self::HEADER, low, high);
        Self {
            voltage: w(REG_VOLTAGE) as f32 / 10.0,
            current: dw(REG_CURRENT_LOW, REG_CURRENT_HIGH) as f32 / 1000.0,
            power: dw(REG_POWER_LOW, REG_POWER_HIGH) as f32 / 10.0,
            energy: dw(REG_ENERGY_LOW, REG_ENERGY_HIGH),
            frequency: w(REG_FREQUENCY) as f32 / 10.0,
            power_factor: w(REG_POWER_FACTOR) as f32 / 100.0,
            alarm: w(REG_ALARM) == ALARM_ON,
        }
    }
}

/// Power alarm threshold and slave address as stored in the holding registers.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Settings {
    /// W
    pub threshold: f32,
    pub address: u8,
}

impl Settings {
    const HEADER: usize = 3;

    pub fn request(address: u8) -> Result<Vec<u8>, Error> {
        read_registers_request(
            address,
            FunctionCode::ReadHolding,
            SETTINGS_REG_ADDR,
            SETTINGS_REG_QUAN,
        )
    }

    pub fn reply_size() -> usize {
        read_registers_reply_size(SETTINGS_REG_QUAN)
    }

    fn decode(rx_buffer: &[u8]) -> Result<Self, Error> {
        let address = word(rx_buffer, Self::HEADER, 1);
        let address = u8::try_from(address).map_err(|_| {
            log::warn!("Invalid slave address {address} - buffer={:02X?}", rx_buffer);
            Error::UnrecognizedResponse(rx_buffer.to_vec())
        })?;
        Ok(Self {
            threshold: word(rx_buffer, Self::HEADER, 0) as f32,
            address,
        })
    }
}

/// Echo of a write single register request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteAck {
    Threshold(f32),
    Address(u8),
    /// Structurally valid but for a register this driver never writes.
    Unrecognized { register: u16, value: u16 },
}

impl WriteAck {
    const HEADER: usize = 2;

    fn decode(rx_buffer: &[u8]) -> Self {
        let register = word(rx_buffer, Self::HEADER, 0);
        let value = word(rx_buffer, Self::HEADER, 1);
        let ack = match register {
            THRESHOLD_REG_ADDR => WriteAck::Threshold(value as f32),
            ADDRESS_REG_ADDR => match u8::try_from(value) {
                Ok(address) => WriteAck::Address(address),
                Err(_) => WriteAck::Unrecognized { register, value },
            },
            _ => WriteAck::Unrecognized { register, value },
        };
        if let WriteAck::Unrecognized { .. } = ack {
            log::warn!(
                "Unknown valid response to write single register - buffer={:02X?}",
                rx_buffer
            );
        }
        ack
    }
}

/// The closed set of frame layouts the meter answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    InputRegisterBlock,
    HoldingRegisterPair,
    WriteAck,
    BareAck(FunctionCode),
    Unrecognized,
}

impl Shape {
    /// Classifies a checksum-valid frame by function code, byte count and length.
    pub fn classify(buffer: &[u8]) -> Self {
        let function_code = buffer.get(1).copied();
        let byte_count = buffer.get(2).copied();
        match (function_code, byte_count, buffer.len()) {
            (Some(0x04), Some(0x14), len) if len == Measurement::reply_size() => {
                Shape::InputRegisterBlock
            }
            (Some(0x03), Some(0x04), len) if len == Settings::reply_size() => {
                Shape::HoldingRegisterPair
            }
            (Some(0x06), _, len) if len == write_register_reply_size() => Shape::WriteAck,
            (Some(0x42), _, len) if len == user_function_reply_size() => {
                Shape::BareAck(FunctionCode::ResetEnergy)
            }
            (Some(0x41), _, len) if len == user_function_reply_size() => {
                Shape::BareAck(FunctionCode::Calibration)
            }
            _ => Shape::Unrecognized,
        }
    }
}

/// A decoded, checksum-valid reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Response {
    InputRegisterBlock(Measurement),
    HoldingRegisterPair(Settings),
    WriteAck(WriteAck),
    BareAck(FunctionCode),
}

impl Response {
    pub fn decode(rx_buffer: &[u8]) -> Result<Self, Error> {
        validate_len(rx_buffer)?;
        validate_checksum(rx_buffer)?;
        let response = match Shape::classify(rx_buffer) {
            Shape::InputRegisterBlock => Response::InputRegisterBlock(Measurement::decode(rx_buffer)),
            Shape::HoldingRegisterPair => Response::HoldingRegisterPair(Settings::decode(rx_buffer)?),
            Shape::WriteAck => Response::WriteAck(WriteAck::decode(rx_buffer)),
            Shape::BareAck(function_code) => Response::BareAck(function_code),
            Shape::Unrecognized => {
                log::warn!("Unknown valid message - buffer={:02X?}", rx_buffer);
                return Err(Error::UnrecognizedResponse(rx_buffer.to_vec()));
            }
        };
        log::debug!("Decoded {:?}", response);
        Ok(response)
    }
}

/// Last known values of one meter. Only ever updated from a decoded [`Response`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    pub measurement: Option<Measurement>,
    pub threshold: Option<f32>,
    pub address: u8,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            measurement: None,
            threshold: None,
            address: FACTORY_DEFAULT_ADDRESS,
        }
    }
}

impl DeviceState {
    pub fn apply(&mut self, response: &Response) {
        match *response {
            Response::InputRegisterBlock(measurement) => self.measurement = Some(measurement),
            Response::HoldingRegisterPair(settings) => {
                self.threshold = Some(settings.threshold);
                self.address = settings.address;
            }
            Response::WriteAck(WriteAck::Threshold(threshold)) => self.threshold = Some(threshold),
            Response::WriteAck(WriteAck::Address(address)) => self.address = address,
            Response::WriteAck(WriteAck::Unrecognized { .. }) | Response::BareAck(_) => {}
        }
    }
}
