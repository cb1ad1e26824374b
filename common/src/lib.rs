//! Shared types and utilities for the perf buffer monitor
//!
//! This crate provides the event-type catalogue and the binary layouts
//! shared between the eBPF programs and the userspace monitor.

#![no_std]

pub mod constants;
pub mod event;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use event::{EventType, MAX_EVENT_TYPE};
pub use types::{EventHeader, NotEnoughData, PerfMapStats};
