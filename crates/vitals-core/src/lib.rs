//! Hardware-independent runtime coordination core for vitals-rs
//!
//! This crate contains the platform-agnostic coordination layer of the
//! wearable firmware: sensor bus arbitration, button debouncing, the
//! application state machine, telemetry dispatch with backpressure, and the
//! uplink connectivity state machine.
//!
//! It is `#![no_std]` so it compiles on both embedded targets and desktop
//! hosts (for the simulator and tests). Hardware plugs in at narrow seams:
//! [`bus::BusTransport`] for the shared sensor bus,
//! [`telemetry::TransportSender`] for outbound telemetry,
//! [`connectivity::LinkDriver`] for the wireless uplink, and
//! [`ui::RenderSurface`] for the display.

#![cfg_attr(not(test), no_std)]

pub mod bus;
pub mod config;
pub mod connectivity;
pub mod input;
pub mod sensors;
pub mod state;
pub mod telemetry;
pub mod ui;
