//! # lib_common
//!
//! Shared engine for the PPE relay gateway. Browser clients stream encoded
//! video frames over a WebSocket; the engine relays them, one at a time, to a
//! long-running detection worker process and turns the worker's detections
//! into one-shot safety-violation alerts.
//!
//! Every folder is gated behind a cargo feature of the same name so binaries
//! only pull the dependencies they use:
//!
//! - **`vision`**: box overlap, the detection wire shape, and the per-track
//!   violation debouncer.
//! - **`inference`**: the line-framed worker protocol and the single-inflight
//!   worker channel.
//! - **`core`**: session registry, flow controller, alert sinks and the
//!   relay controller event loop.
//! - **`connections`**: PostgreSQL persistence for violation records.
//! - **`retrieve`**: outbound HTTP (webhook notifications and the streaming
//!   range proxy).

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "vision")]
pub mod vision;

#[cfg(feature = "inference")]
pub mod inference;

#[cfg(feature = "core")]
pub mod core;

#[cfg(feature = "connections")]
pub mod connections;

#[cfg(feature = "retrieve")]
pub mod retrieve;
