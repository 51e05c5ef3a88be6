//! # Flow Control
//!
//! Moves at most one buffered frame to the worker whenever it is idle.
//! Sessions are scanned in registration order and the first one holding a
//! complete `(meta, frame)` pair wins. Its pending pair is cleared at
//! submission time so the client can buffer the next frame while this one
//! is in flight.
//!
//! First-ready-wins can starve later sessions while an earlier one always
//! has a frame ready. That ordering is kept as is.

use bytes::Bytes;
use tokio::time::Instant;

use super::registry::{FrameMeta, SessionId, SessionRegistry};
use crate::inference::channel::{FrameSubmitter, SubmitError};
use crate::inference::codec::WorkerRequest;

/// A frame taken out of the registry on its way to the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSubmission {
    pub session_id: SessionId,
    pub meta: FrameMeta,
    pub frame: Bytes,
}

/// Bookkeeping for the one outstanding worker request.
#[derive(Debug, Clone, Copy)]
pub struct InFlight {
    pub session_id: SessionId,
    pub meta: FrameMeta,
    pub submitted_at: Instant,
}

/// Takes the pending pair of the first ready session.
pub fn next_ready(registry: &mut SessionRegistry) -> Option<PendingSubmission> {
    registry.iter_mut().find_map(|session| {
        let session_id = session.id();
        session.take_pending().map(|(meta, frame)| PendingSubmission {
            session_id,
            meta,
            frame,
        })
    })
}

/// Submits one ready frame if the worker is idle.
pub fn pump<S>(registry: &mut SessionRegistry, submitter: &mut S) -> Option<InFlight>
where
    S: FrameSubmitter + ?Sized,
{
    if !submitter.is_idle() {
        return None;
    }
    let next = next_ready(registry)?;
    let request = WorkerRequest {
        session_id: next.session_id.to_string(),
        frame: next.frame,
    };

    match submitter.try_submit(request) {
        Ok(()) => {
            log::debug!(
                "Submitted frame for session {} ({}x{})",
                next.session_id,
                next.meta.width,
                next.meta.height
            );
            Some(InFlight {
                session_id: next.session_id,
                meta: next.meta,
                submitted_at: Instant::now(),
            })
        }
        Err(SubmitError::Busy(request)) => {
            registry.restore_pending(next.session_id, next.meta, request.frame);
            None
        }
        Err(SubmitError::Disconnected) => {
            log::error!("Worker input is gone, frame for session {} dropped", next.session_id);
            None
        }
    }
}
