//! # Worker Channel
//!
//! Owns the two pipes to the detection worker. Writes run in a dedicated
//! task fed by a queue that the `Busy` state keeps to one request per answer; reads run in another task that decodes
//! result lines and forwards them as [`WorkerEvent`]s. The channel itself
//! only tracks whether a request is outstanding. Whoever drives it (the
//! relay controller) calls [`FrameSubmitter::mark_idle`] once the matching
//! result or a write failure has been observed.

use std::process::Stdio;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{WorkerCodec, WorkerRequest, WorkerResult};

/// Why a frame could not be handed to the worker.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// A request is already outstanding. The rejected request is returned.
    #[error("Worker is busy with session {}", .0.session_id)]
    Busy(WorkerRequest),

    #[error("Worker input pipe is gone")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker process has no {0} pipe")]
    MissingPipe(&'static str),
}

/// Something the worker tasks observed.
#[derive(Debug)]
pub enum WorkerEvent {
    Result(WorkerResult),
    /// Writing the request for `session_id` failed; no result will follow.
    WriteFailed { session_id: String, error: String },
    /// The worker's output reached end of stream.
    OutputClosed,
}

/// The single-inflight contract between the scheduler and the worker.
pub trait FrameSubmitter: Send {
    fn is_idle(&self) -> bool;

    /// Hands `request` to the worker and flips to busy. Fails without side
    /// effects when a request is already outstanding.
    fn try_submit(&mut self, request: WorkerRequest) -> Result<(), SubmitError>;

    fn mark_idle(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Idle,
    Busy,
}

pub struct WorkerChannel {
    state: ChannelState,
    requests: mpsc::UnboundedSender<WorkerRequest>,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

impl WorkerChannel {
    /// Starts the writer and reader tasks over an arbitrary pipe pair.
    pub fn attach<W, R>(writer: W, reader: R, events: mpsc::UnboundedSender<WorkerEvent>) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (requests, queue) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_loop(writer, queue, events.clone()));
        let reader_task = tokio::spawn(read_loop(reader, events));
        Self {
            state: ChannelState::Idle,
            requests,
            writer_task,
            reader_task,
        }
    }

    /// Stops both pipe tasks. Dropping the writer closes the worker's stdin.
    pub fn close(self) {
        self.writer_task.abort();
        self.reader_task.abort();
    }
}

impl FrameSubmitter for WorkerChannel {
    fn is_idle(&self) -> bool {
        self.state == ChannelState::Idle
    }

    fn try_submit(&mut self, request: WorkerRequest) -> Result<(), SubmitError> {
        if self.state == ChannelState::Busy {
            return Err(SubmitError::Busy(request));
        }
        // Accepted whether or not the writer has drained the previous request.
        self.requests
            .send(request)
            .map_err(|_| SubmitError::Disconnected)?;
        self.state = ChannelState::Busy;
        Ok(())
    }

    fn mark_idle(&mut self) {
        self.state = ChannelState::Idle;
    }
}

async fn write_loop<W>(
    writer: W,
    mut queue: mpsc::UnboundedReceiver<WorkerRequest>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(writer, WorkerCodec::new());
    while let Some(request) = queue.recv().await {
        let session_id = request.session_id.clone();
        let len = request.frame.len();
        match framed.send(request).await {
            Ok(()) => log::debug!("Sent {} bytes to worker for session {}", len, session_id),
            Err(e) => {
                log::error!("Write to worker failed for session {}: {}", session_id, e);
                if events
                    .send(WorkerEvent::WriteFailed {
                        session_id,
                        error: e.to_string(),
                    })
                    .is_err()
                {
                    break;
                }
            }
        }
    }
    log::debug!("Worker writer stopped");
}

async fn read_loop<R>(reader: R, events: mpsc::UnboundedSender<WorkerEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut framed = FramedRead::new(reader, WorkerCodec::new());
    while let Some(item) = framed.next().await {
        match item {
            Ok(result) => {
                if events.send(WorkerEvent::Result(result)).is_err() {
                    return;
                }
            }
            Err(e) => {
                log::error!("Reading worker output failed: {}", e);
                break;
            }
        }
    }
    let _ = events.send(WorkerEvent::OutputClosed);
}

/// Handle on the spawned worker process.
pub struct WorkerProcess {
    child: Child,
}

impl WorkerProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub async fn shutdown(mut self) {
        if let Err(e) = self.child.start_kill() {
            log::debug!("Worker already exited: {}", e);
        }
        match self.child.wait().await {
            Ok(status) => log::info!("Worker exited with {}", status),
            Err(e) => log::warn!("Failed to reap worker: {}", e),
        }
    }
}

/// Launches the worker with piped stdin/stdout and attaches a channel to it.
/// The worker's stderr is inherited so its diagnostics reach our console.
pub fn spawn_worker(
    program: &str,
    args: &[String],
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> Result<(WorkerChannel, WorkerProcess), WorkerError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| WorkerError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdin = child.stdin.take().ok_or(WorkerError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(WorkerError::MissingPipe("stdout"))?;
    log::info!("Spawned worker '{}' {:?} (pid {:?})", program, args, child.id());

    Ok((WorkerChannel::attach(stdin, stdout, events), WorkerProcess { child }))
}
