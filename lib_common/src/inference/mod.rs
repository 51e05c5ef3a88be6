//! # Inference Module
//!
//! Everything needed to talk to the external detection worker.
//!
//! ## Contained Modules:
//!
//! - **`codec`**: the wire format. Requests are a one-line JSON header
//!   (`{"sessionId": .., "clientId": .., "len": ..}`, both ids
//!   carrying the same value) followed by exactly `len` raw frame
//!   bytes; responses are newline-delimited JSON results. Requests and
//!   responses are correlated only by `sessionId`, which is sound only while
//!   at most one request is outstanding. Running several requests
//!   concurrently would require adding a request id to the protocol first.
//! - **`channel`**: owns the worker's stdin/stdout, runs the writer and
//!   reader tasks, and enforces the single-inflight contract through an
//!   explicit `Idle`/`Busy` state.

/// Line-framed request/response codec for the worker pipe.
pub mod codec;
/// Single-inflight channel to the worker process.
pub mod channel;

pub use channel::{spawn_worker, FrameSubmitter, SubmitError, WorkerChannel, WorkerError, WorkerEvent, WorkerProcess};
pub use codec::{CodecError, WorkerCodec, WorkerRequest, WorkerResult};
