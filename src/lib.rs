#![cfg_attr(docsrs, feature(doc_cfg))]
//! # acpowermeter_lib
//!
//! This crate provides a library for reading single phase AC power meters
//! (PZEM style modules) over an RS485 or USB serial link. The meter speaks a
//! small subset of Modbus RTU plus two vendor defined function codes.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `acpowermeter` command-line tool and pulls in `serialport` and `serde`.
//!
//! ### Client Features
//! - `serialport`: Enables the **synchronous** client using the `serialport` crate.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing the decoded measurement structures.
//! - `bin-dependencies`: Enables all features required by the `acpowermeter` binary executable.

/// Contains error types for the library.
mod error;
/// Frame building, checksum and reply decoding for the power meter.
pub mod protocol;

pub use error::Error;

/// Synchronous client for power meter communication.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;
