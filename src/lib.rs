//! Acquisition and amplitude calibration for the oscillo bitstream

#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod args;
pub mod calibrate;
pub mod common;
pub mod device;
pub mod fft;
pub mod mmap;
pub mod oscillo;
pub mod probe;
pub mod sim;
pub mod spectrum;
pub mod transfer;
