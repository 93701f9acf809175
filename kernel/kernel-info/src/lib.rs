//! # Kernel boot contract
//!
//! Types and constants shared between the loader and the kernel proper:
//! the firmware memory map handed over at boot, and the fixed virtual
//! memory layout the kernel runs under.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod boot;
pub mod memory;

pub use boot::{BootInfo, MemoryRegion, RegionKind};
