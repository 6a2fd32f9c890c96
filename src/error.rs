/// Errors reported by the power meter protocol and the serial client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The retry budget ran out before the expected number of bytes arrived.
    #[error("Timeout - expected {expected} bytes, received {received}")]
    Timeout { expected: usize, received: usize },
    /// The trailing CRC16 does not match the frame body.
    #[error("Invalid checksum - calculated={calculated:04X} received={received:04X}")]
    ChecksumError { calculated: u16, received: u16 },
    /// Fewer than 4 bytes, not even a bare acknowledgment.
    #[error("Frame too short ({0} bytes)")]
    ShortFrame(usize),
    /// Checksum-valid frame whose shape is not one this device sends.
    #[error("Unrecognized response: {0:02X?}")]
    UnrecognizedResponse(Vec<u8>),
    /// Only the two read function codes are accepted for register reads.
    #[error("Function code {0:#04X} is not a register read")]
    InvalidFunctionCode(u8),
    #[error("Power alarm threshold {0} W out of range (0..=32767)")]
    ThresholdOutOfRange(i32),
    #[error("Slave address {0} out of range (0..=247)")]
    AddressOutOfRange(i32),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "serialport")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl Error {
    /// Protocol faults are transient link problems, the caller retries next cycle.
    /// Everything else is a programming error or a broken port.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::ChecksumError { .. }
                | Error::ShortFrame(_)
                | Error::UnrecognizedResponse(_)
        )
    }
}
