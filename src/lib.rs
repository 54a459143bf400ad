//! # sd-supervisor
//!
//! > A supervisor, block driver and SPI protocol engine for a single SD/MMC
//! > card slot.
//!
//! This crate owns the hard, real-time-adjacent core of an SD/MMC-over-SPI
//! subsystem: a wire-protocol driver (command framing, init, block I/O, a
//! DMA-driven sub-sector read fast path), a supervisory state machine that
//! tracks card presence/power and serializes client access, and the power
//! and path helpers those two lean on. It does not implement a filesystem;
//! pair it with your FAT (or other) library of choice through the
//! [`fs::Filesystem`] trait.
//!
//! ## Using the crate
//!
//! You need something that implements [`transport::Transport`] — the SPI
//! byte-exchange, DMA-burst, chip-select and clock-frequency contract the
//! driver is built on — plus [`power::PowerControl`] and the small
//! concurrency traits in [`supervisor`] (`CommandQueue`, `AccessSemaphore`,
//! `CardDetect`) bound to whatever RTOS you're running.
//!
//! ```rust,no_run
//! use sd_supervisor::driver::CardDriver;
//! use sd_supervisor::transport::Transport;
//! use sd_supervisor::blockdevice::{Block, BlockIdx};
//!
//! fn example<T: Transport>(transport: T) -> Result<(), sd_supervisor::driver::Error> {
//!     let driver = CardDriver::new(transport);
//!     driver.initialize()?;
//!     let mut blocks = [Block { contents: [0u8; Block::LEN] }];
//!     driver.read_sectors(&mut blocks, BlockIdx(0))?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! * `log`: Enabled by default. Generates log messages using the `log` crate.
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over defmt
//!   instead.
//!
//! You cannot enable both the `log` feature and the `defmt-log` feature.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[cfg(test)]
#[macro_use]
extern crate hex_literal;

#[macro_use]
mod structure;

pub mod blockdevice;
pub mod cli;
pub mod driver;
pub mod fs;
pub mod path;
pub mod power;
pub mod proto;
pub mod supervisor;
pub mod transport;

#[doc(inline)]
pub use crate::blockdevice::{Block, BlockCount, BlockDevice, BlockIdx};

#[doc(inline)]
pub use crate::driver::{AcquireOpts, CardDriver, CardType, DiskStatus};

#[doc(inline)]
pub use crate::supervisor::{Supervisor, SupervisorConfig};

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::debug! but does nothing at all
macro_rules! debug {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::trace! but does nothing at all
macro_rules! trace {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::warn! but does nothing at all
macro_rules! warn {
    ($($arg:tt)+) => {};
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
