//! # Relay Controller
//!
//! The single owner of all mutable relay state: the session registry, the
//! worker channel, the per-track debounce state and the in-flight
//! bookkeeping. It runs as one task and processes one event at a time
//! (a client command, a worker event or a watchdog tick) to completion, so
//! none of that state needs a lock.
//!
//! Connection tasks talk to it through a cloneable [`RelayHandle`].

use std::ops::ControlFlow;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::events::ServerEvent;
use super::registry::{FrameMeta, FrameOutcome, SessionId, SessionRegistry};
use super::scheduler::{self, InFlight};
use super::sinks::{AlertSinks, ViolationRecord};
use crate::inference::channel::{FrameSubmitter, WorkerEvent};
use crate::inference::codec::WorkerResult;
use crate::vision::debounce::{DebounceConfig, ViolationDebouncer};

const WATCHDOG_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay controller has stopped")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub debounce: DebounceConfig,
    /// Warn once when a submission has been outstanding this long.
    pub stall_warn_after: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            debounce: DebounceConfig::default(),
            stall_warn_after: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug)]
pub enum RelayCommand {
    Connect {
        outbound: mpsc::Sender<ServerEvent>,
        reply: oneshot::Sender<SessionId>,
    },
    FrameMeta {
        session_id: SessionId,
        meta: FrameMeta,
    },
    FrameData {
        session_id: SessionId,
        frame: Bytes,
    },
    Disconnect {
        session_id: SessionId,
    },
    Shutdown,
}

#[derive(Clone)]
pub struct RelayHandle {
    commands: mpsc::UnboundedSender<RelayCommand>,
}

impl RelayHandle {
    /// Registers a connection. `outbound` receives the `hello` event first.
    pub async fn connect(&self, outbound: mpsc::Sender<ServerEvent>) -> Result<SessionId, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.send(RelayCommand::Connect { outbound, reply })?;
        rx.await.map_err(|_| RelayError::Closed)
    }

    pub fn frame_meta(&self, session_id: SessionId, meta: FrameMeta) -> Result<(), RelayError> {
        self.send(RelayCommand::FrameMeta { session_id, meta })
    }

    pub fn frame_data(&self, session_id: SessionId, frame: Bytes) -> Result<(), RelayError> {
        self.send(RelayCommand::FrameData { session_id, frame })
    }

    pub fn disconnect(&self, session_id: SessionId) -> Result<(), RelayError> {
        self.send(RelayCommand::Disconnect { session_id })
    }

    pub fn shutdown(&self) -> Result<(), RelayError> {
        self.send(RelayCommand::Shutdown)
    }

    fn send(&self, command: RelayCommand) -> Result<(), RelayError> {
        self.commands.send(command).map_err(|_| RelayError::Closed)
    }
}

pub struct RelayController<S> {
    registry: SessionRegistry,
    submitter: S,
    debouncer: ViolationDebouncer<SessionId>,
    sinks: AlertSinks,
    in_flight: Option<InFlight>,
    stall_warn_after: Option<Duration>,
    stall_warned: bool,
    commands: mpsc::UnboundedReceiver<RelayCommand>,
    worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl<S> RelayController<S>
where
    S: FrameSubmitter + 'static,
{
    pub fn new(
        config: ControllerConfig,
        submitter: S,
        worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
        sinks: AlertSinks,
    ) -> (Self, RelayHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let controller = Self {
            registry: SessionRegistry::new(),
            submitter,
            debouncer: ViolationDebouncer::new(config.debounce),
            sinks,
            in_flight: None,
            stall_warn_after: config.stall_warn_after,
            stall_warned: false,
            commands,
            worker_events,
        };
        (controller, RelayHandle { commands: tx })
    }

    /// Runs the controller on its own task. The task resolves to the worker
    /// submitter once the controller has torn down.
    pub fn spawn(self) -> JoinHandle<S> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> S {
        let mut watchdog = tokio::time::interval(WATCHDOG_PERIOD);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut worker_open = true;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).is_break() {
                            break;
                        }
                    }
                    None => break,
                },
                event = self.worker_events.recv(), if worker_open => match event {
                    Some(event) => self.handle_worker_event(event, now_ms()),
                    None => worker_open = false,
                },
                _ = watchdog.tick() => self.check_stall(Instant::now()),
            }
        }

        self.teardown()
    }

    pub fn handle_command(&mut self, command: RelayCommand) -> ControlFlow<()> {
        match command {
            RelayCommand::Connect { outbound, reply } => {
                let session_id = self.registry.register(outbound);
                log::info!("Session {} connected ({} live)", session_id, self.registry.len());
                if let Some(session) = self.registry.get(session_id) {
                    session.send(ServerEvent::Hello { session_id });
                }
                if reply.send(session_id).is_err() {
                    // The connection went away before it learned its id.
                    self.disconnect(session_id);
                }
            }
            RelayCommand::FrameMeta { session_id, meta } => {
                if !self.registry.set_pending_meta(session_id, meta) {
                    log::debug!("Frame meta for unknown session {}", session_id);
                }
            }
            RelayCommand::FrameData { session_id, frame } => {
                match self.registry.set_pending_frame(session_id, frame) {
                    FrameOutcome::Buffered => {}
                    FrameOutcome::Replaced => {
                        log::trace!("Session {} replaced a pending frame", session_id)
                    }
                    FrameOutcome::NoMeta => {
                        log::debug!("Session {} sent a frame without meta, dropped", session_id)
                    }
                    FrameOutcome::UnknownSession => {
                        log::debug!("Frame for unknown session {}", session_id)
                    }
                }
                self.pump();
            }
            RelayCommand::Disconnect { session_id } => self.disconnect(session_id),
            RelayCommand::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    pub fn handle_worker_event(&mut self, event: WorkerEvent, now_ms: u64) {
        match event {
            WorkerEvent::Result(result) => self.on_result(result, now_ms),
            WorkerEvent::WriteFailed { session_id, error } => {
                log::error!("Frame for session {} lost: {}", session_id, error);
                self.finish_in_flight();
                self.pump();
            }
            WorkerEvent::OutputClosed => {
                log::error!("Worker output closed; no further results will arrive");
            }
        }
    }

    fn on_result(&mut self, result: WorkerResult, now_ms: u64) {
        let in_flight = self.finish_in_flight();

        let session_id = match result.session() {
            Some(raw) => match raw.parse::<SessionId>() {
                Ok(session_id) => Some(session_id),
                Err(_) => {
                    log::warn!("Worker result names unknown session '{}'", raw);
                    None
                }
            },
            // One request at a time, so an unlabelled answer belongs to it.
            None => {
                let owner = in_flight.map(|f| f.session_id);
                log::debug!("Worker result without session id, attributed to {:?}", owner);
                owner
            }
        };

        if let Some(session_id) = session_id {
            if let Some(sent) = in_flight.filter(|f| f.session_id != session_id) {
                log::warn!(
                    "Worker answered for session {} while {} was in flight",
                    session_id,
                    sent.session_id
                );
            }
            let meta = in_flight.filter(|f| f.session_id == session_id).map(|f| f.meta);
            self.deliver(session_id, result, meta, now_ms);
        }

        self.pump();
    }

    fn deliver(&mut self, session_id: SessionId, result: WorkerResult, meta: Option<FrameMeta>, now_ms: u64) {
        let Some(session) = self.registry.get(session_id) else {
            log::debug!("Discarding result for departed session {}", session_id);
            return;
        };

        let alert = self.debouncer.process(&session_id, &result.detections(), now_ms);
        session.send(ServerEvent::Inference { boxes: result.boxes });

        let Some(alert) = alert else {
            return;
        };
        log::info!(
            "Violation in session {}: missing {:?} on tracks {:?}",
            session_id,
            alert.missing_items,
            alert.track_ids
        );
        session.send(ServerEvent::Violation {
            session_id,
            missing_items: alert.missing_items.clone(),
            tracks: alert.track_ids.clone(),
        });
        self.sinks.dispatch(ViolationRecord {
            session_id: session_id.to_string(),
            missing_items: alert.missing_items,
            track_ids: alert.track_ids,
            frame_width: meta.map(|m| m.width),
            frame_height: meta.map(|m| m.height),
            detected_at: chrono::Utc::now(),
        });
    }

    fn disconnect(&mut self, session_id: SessionId) {
        if self.registry.unregister(session_id).is_none() {
            return;
        }
        let evicted = self.debouncer.evict_session(&session_id);
        log::info!(
            "Session {} disconnected ({} tracks dropped, {} live)",
            session_id,
            evicted,
            self.registry.len()
        );
    }

    fn finish_in_flight(&mut self) -> Option<InFlight> {
        self.submitter.mark_idle();
        self.stall_warned = false;
        self.in_flight.take()
    }

    fn pump(&mut self) {
        if let Some(in_flight) = scheduler::pump(&mut self.registry, &mut self.submitter) {
            self.in_flight = Some(in_flight);
            self.stall_warned = false;
        }
    }

    /// Logs once per submission when the worker has been busy too long.
    /// Never changes channel state.
    pub fn check_stall(&mut self, now: Instant) {
        let (Some(limit), Some(in_flight)) = (self.stall_warn_after, self.in_flight) else {
            return;
        };
        if self.stall_warned {
            return;
        }
        let waited = now.saturating_duration_since(in_flight.submitted_at);
        if waited >= limit {
            log::warn!(
                "Worker has not answered session {} for {:.1}s",
                in_flight.session_id,
                waited.as_secs_f64()
            );
            self.stall_warned = true;
        }
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_stall_warned(&self) -> bool {
        self.stall_warned
    }

    fn teardown(mut self) -> S {
        log::info!("Relay controller stopping with {} live sessions", self.registry.len());
        self.registry.clear();
        self.debouncer.clear();
        self.in_flight = None;
        self.submitter
    }
}

fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduler::tests::FakeSubmitter;
    use crate::core::sinks::tests::RecordingSink;
    use serde_json::{json, Value};
    use std::sync::Arc;

    type Controller = RelayController<FakeSubmitter>;

    fn controller(sinks: AlertSinks) -> (Controller, FakeSubmitter, mpsc::UnboundedSender<WorkerEvent>) {
        let worker = FakeSubmitter::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ctl, _handle) = RelayController::new(ControllerConfig::default(), worker.clone(), events_rx, sinks);
        (ctl, worker, events_tx)
    }

    fn connect(ctl: &mut Controller) -> (SessionId, mpsc::Receiver<ServerEvent>) {
        let (outbound, rx) = mpsc::channel(16);
        let (reply, mut id) = oneshot::channel();
        assert!(ctl.handle_command(RelayCommand::Connect { outbound, reply }).is_continue());
        (id.try_recv().unwrap(), rx)
    }

    fn send_frame(ctl: &mut Controller, session_id: SessionId, frame: &'static [u8]) {
        let meta = FrameMeta {
            width: 640,
            height: 480,
            byte_size: frame.len() as u64,
        };
        let _ = ctl.handle_command(RelayCommand::FrameMeta { session_id, meta });
        let _ = ctl.handle_command(RelayCommand::FrameData {
            session_id,
            frame: Bytes::from_static(frame),
        });
    }

    fn result(session_id: SessionId, boxes: Vec<Value>) -> WorkerEvent {
        WorkerEvent::Result(WorkerResult::new(session_id.to_string(), boxes))
    }

    fn unprotected_person(track: i64) -> Vec<Value> {
        vec![json!({"name": "person", "class": 0, "id": track, "conf": 0.8,
                    "x1": 0, "y1": 0, "x2": 10, "y2": 10})]
    }

    #[test]
    fn connect_sends_hello() {
        let (mut ctl, _, _) = controller(AlertSinks::new());
        let (id, mut rx) = connect(&mut ctl);
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::Hello { session_id: id });
        assert_eq!(ctl.session_count(), 1);
    }

    #[test]
    fn binary_before_meta_is_not_submitted() {
        let (mut ctl, worker, _) = controller(AlertSinks::new());
        let (id, _rx) = connect(&mut ctl);
        let _ = ctl.handle_command(RelayCommand::FrameData {
            session_id: id,
            frame: Bytes::from_static(b"jpeg"),
        });
        assert!(worker.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn one_submission_in_flight_across_sessions() {
        let (mut ctl, worker, _) = controller(AlertSinks::new());
        let (a, _ra) = connect(&mut ctl);
        let (b, _rb) = connect(&mut ctl);
        let (c, _rc) = connect(&mut ctl);

        send_frame(&mut ctl, a, b"a");
        send_frame(&mut ctl, b, b"b");
        send_frame(&mut ctl, c, b"c");
        assert_eq!(worker.sent_sessions(), vec![a.to_string()]);

        ctl.handle_worker_event(result(a, vec![]), 0);
        assert_eq!(worker.sent_sessions(), vec![a.to_string(), b.to_string()]);

        ctl.handle_worker_event(result(b, vec![]), 0);
        ctl.handle_worker_event(result(c, vec![]), 0);
        assert_eq!(
            worker.sent_sessions(),
            vec![a.to_string(), b.to_string(), c.to_string()]
        );
    }

    #[test]
    fn frames_arriving_while_busy_keep_only_the_latest() {
        let (mut ctl, worker, _) = controller(AlertSinks::new());
        let (a, _ra) = connect(&mut ctl);
        send_frame(&mut ctl, a, b"1");
        send_frame(&mut ctl, a, b"2");
        send_frame(&mut ctl, a, b"3");

        ctl.handle_worker_event(result(a, vec![]), 0);
        let sent = worker.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[0].frame[..], b"1");
        assert_eq!(&sent[1].frame[..], b"3");
    }

    #[tokio::test]
    async fn result_yields_inference_then_violation_and_record() {
        let (tx, mut records) = mpsc::unbounded_channel();
        let mut sinks = AlertSinks::new();
        sinks.push(Arc::new(RecordingSink { tx }));
        let (mut ctl, _, _) = controller(sinks);
        let (a, mut rx) = connect(&mut ctl);
        let _ = rx.try_recv();

        send_frame(&mut ctl, a, b"frame");
        ctl.handle_worker_event(result(a, unprotected_person(5)), 1_000);

        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::Inference { boxes } if boxes.len() == 1));
        match rx.try_recv().unwrap() {
            ServerEvent::Violation {
                session_id,
                missing_items,
                tracks,
            } => {
                assert_eq!(session_id, a);
                assert_eq!(missing_items, vec!["boots", "glove", "helmet", "vest"]);
                assert_eq!(tracks, vec![5]);
            }
            other => panic!("expected violation, got {:?}", other),
        }

        let record = records.recv().await.unwrap();
        assert_eq!(record.session_id, a.to_string());
        assert_eq!(record.frame_width, Some(640));
        assert_eq!(record.frame_height, Some(480));

        // Same state again: inference only.
        send_frame(&mut ctl, a, b"frame");
        ctl.handle_worker_event(result(a, unprotected_person(5)), 2_000);
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::Inference { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn write_failure_frees_the_worker() {
        let (mut ctl, worker, _) = controller(AlertSinks::new());
        let (a, _ra) = connect(&mut ctl);
        let (b, _rb) = connect(&mut ctl);
        send_frame(&mut ctl, a, b"a");
        send_frame(&mut ctl, b, b"b");

        ctl.handle_worker_event(
            WorkerEvent::WriteFailed {
                session_id: a.to_string(),
                error: "broken pipe".into(),
            },
            0,
        );
        assert_eq!(worker.sent_sessions(), vec![a.to_string(), b.to_string()]);
    }

    #[test]
    fn results_for_departed_sessions_are_discarded() {
        let (mut ctl, worker, _) = controller(AlertSinks::new());
        let (a, _ra) = connect(&mut ctl);
        let (b, _rb) = connect(&mut ctl);
        send_frame(&mut ctl, a, b"a");
        send_frame(&mut ctl, b, b"b");
        let _ = ctl.handle_command(RelayCommand::Disconnect { session_id: a });

        ctl.handle_worker_event(result(a, unprotected_person(1)), 0);
        assert_eq!(ctl.debouncer.tracked_count(&a), 0);
        // The worker was still released for the next session.
        assert_eq!(worker.sent_sessions(), vec![a.to_string(), b.to_string()]);
    }

    #[test]
    fn result_without_session_id_goes_to_the_in_flight_session() {
        let (mut ctl, worker, _) = controller(AlertSinks::new());
        let (a, mut ra) = connect(&mut ctl);
        let (b, _rb) = connect(&mut ctl);
        let _ = ra.try_recv();
        send_frame(&mut ctl, a, b"a");
        send_frame(&mut ctl, b, b"b");

        // Error replies from the worker carry neither id.
        let anonymous = WorkerResult {
            boxes: unprotected_person(2),
            ..WorkerResult::default()
        };
        ctl.handle_worker_event(WorkerEvent::Result(anonymous), 0);

        match ra.try_recv().unwrap() {
            ServerEvent::Inference { boxes } => assert_eq!(boxes, unprotected_person(2)),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(ctl.debouncer.tracked_count(&a), 1);
        assert_eq!(worker.sent_sessions(), vec![a.to_string(), b.to_string()]);
    }

    #[test]
    fn client_id_alone_routes_the_result() {
        let (mut ctl, _, _) = controller(AlertSinks::new());
        let (a, mut ra) = connect(&mut ctl);
        let _ = ra.try_recv();
        send_frame(&mut ctl, a, b"a");

        let echoed = WorkerResult {
            client_id: Some(a.to_string()),
            boxes: vec![],
            ..WorkerResult::default()
        };
        ctl.handle_worker_event(WorkerEvent::Result(echoed), 0);
        assert!(matches!(ra.try_recv().unwrap(), ServerEvent::Inference { boxes } if boxes.is_empty()));
    }

    #[test]
    fn disconnect_drops_track_state() {
        let (mut ctl, _, _) = controller(AlertSinks::new());
        let (a, _ra) = connect(&mut ctl);
        send_frame(&mut ctl, a, b"a");
        // No sinks configured, so no runtime is needed for the alert.
        ctl.handle_worker_event(result(a, unprotected_person(1)), 0);
        assert_eq!(ctl.debouncer.tracked_count(&a), 1);

        let _ = ctl.handle_command(RelayCommand::Disconnect { session_id: a });
        assert_eq!(ctl.debouncer.tracked_count(&a), 0);
        assert_eq!(ctl.session_count(), 0);
    }

    #[test]
    fn stall_is_reported_once_per_submission() {
        let (mut ctl, _, _) = controller(AlertSinks::new());
        let (a, _ra) = connect(&mut ctl);
        send_frame(&mut ctl, a, b"a");

        let submitted = ctl.in_flight.unwrap().submitted_at;
        ctl.check_stall(submitted + Duration::from_secs(5));
        assert!(!ctl.is_stall_warned());
        ctl.check_stall(submitted + Duration::from_secs(31));
        assert!(ctl.is_stall_warned());

        ctl.handle_worker_event(result(a, vec![]), 0);
        assert!(!ctl.is_stall_warned());
    }

    #[tokio::test]
    async fn handle_drives_running_controller() {
        let worker = FakeSubmitter::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ctl, handle) =
            RelayController::new(ControllerConfig::default(), worker.clone(), events_rx, AlertSinks::new());
        let task = ctl.spawn();

        let (outbound, mut rx) = mpsc::channel(8);
        let id = handle.connect(outbound).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), ServerEvent::Hello { session_id: id });

        handle
            .frame_meta(
                id,
                FrameMeta {
                    width: 2,
                    height: 2,
                    byte_size: 3,
                },
            )
            .unwrap();
        handle.frame_data(id, Bytes::from_static(b"abc")).unwrap();
        while worker.sent_sessions().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(worker.sent_sessions(), vec![id.to_string()]);

        events_tx.send(result(id, vec![])).unwrap();
        assert_eq!(rx.recv().await.unwrap(), ServerEvent::Inference { boxes: vec![] });

        handle.shutdown().unwrap();
        let returned = task.await.unwrap();
        assert!(returned.is_idle());
        // Teardown dropped the session, closing its queue.
        assert!(rx.recv().await.is_none());
        assert!(matches!(handle.disconnect(id), Err(RelayError::Closed)));
    }
}
