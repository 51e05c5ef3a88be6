//! # Vision Module
//!
//! Pure, synchronous building blocks that interpret worker detections.
//!
//! - **`geometry`**: axis-aligned rectangles and intersection-over-union.
//! - **`detection`**: the typed `DetectionBox` view of the boxes the worker
//!   reports, tolerant of its legacy field spellings.
//! - **`debounce`**: the stateful engine that converts a stream of detections
//!   into deduplicated equipment-violation alerts.

/// Axis-aligned rectangles and overlap scoring.
pub mod geometry;
/// Detection boxes as produced by the worker.
pub mod detection;
/// Per-track violation debouncing with TTL eviction.
pub mod debounce;

pub use debounce::{Alert, DebounceConfig, TrackAlertState, ViolationDebouncer};
pub use detection::DetectionBox;
pub use geometry::{iou, Rect};
