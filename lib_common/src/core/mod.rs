//! # Core Relay Module
//!
//! The stateful heart of the relay. It turns connection traffic into worker
//! submissions and worker results into client events and alerts.
//!
//! ## Core Components:
//!
//! - **`registry`**: one `ClientSession` per live connection, each holding at
//!   most one pending frame and its meta. Newer frames overwrite older ones.
//!
//! - **`scheduler`**: whenever the worker is idle, picks the first session
//!   (in connection order) with a complete pending pair and submits it.
//!
//! - **`events`**: the JSON messages pushed to browsers (`hello`,
//!   `inference`, `violation`).
//!
//! - **`sinks`**: fire-and-forget fan-out of violation records to the
//!   optional persistence and notification collaborators.
//!
//! - **`controller`**: the actor that owns all of the above plus the worker
//!   channel and the debounce engine, and processes every event to
//!   completion before taking the next.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Connection-to-session bookkeeping.
pub mod registry;
/// Single-inflight submission policy.
pub mod scheduler;
/// Server-to-client messages.
pub mod events;
/// Best-effort alert collaborators.
pub mod sinks;
/// The event loop owning all relay state.
pub mod controller;

// --- Public API Re-exports ---
pub use controller::{ControllerConfig, RelayCommand, RelayController, RelayError, RelayHandle};
pub use events::ServerEvent;
pub use registry::{FrameMeta, FrameOutcome, SessionId, SessionRegistry};
pub use sinks::{AlertSink, AlertSinks, ViolationRecord};
