//! The controller loop.
//!
//! A session acquires the buffer pool, the notification waiter and the
//! queue, in that order, then drains the queue until shutdown is requested.
//! Resources live in [`ControllerSession`] and are released in reverse order
//! when it is dropped, on every exit path.

use std::{collections::HashMap, fmt, time::Duration};

use bytes::BytesMut;
use log::{debug, error, info, warn};
use nke_common::SocketEventKind;

use crate::{
    decoder::{RECORD_SIZE, SocketEvent, decode},
    display::{OutputFormat, format_event_with_payload, format_json},
    error::{ControllerError, FilterError, QueueError},
    filter::{FilterService, Mapping, Region},
    pool::BufferPool,
    queue::{NotificationQueue, NotificationWaiter},
    responder::{Decision, PermissionPolicy, Responder},
    shutdown::ShutdownEventFd,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Connecting,
    BuffersMapping,
    QueueMapping,
    Draining,
    Teardown,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub format: OutputFormat,
    /// Payload bytes shown per gating event; 0 disables the preview.
    pub payload_bytes: usize,
    /// Decisions slower than this are logged.
    pub slow_decision: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            payload_bytes: 0,
            slow_decision: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub total: usize,
    pub counters: HashMap<SocketEventKind, usize>,
    pub allowed: usize,
    pub denied: usize,
    pub failed_closed: usize,
    /// Records skipped as malformed or naming unknown buffer slots.
    pub dropped: usize,
}

impl SessionStats {
    fn record_decision(&mut self, decision: Decision) {
        match decision {
            Decision::Allowed => self.allowed += 1,
            Decision::Denied => self.denied += 1,
            Decision::FailedClosed => self.failed_closed += 1,
        }
    }
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} events", self.total)?;
        let mut kinds: Vec<_> = self.counters.iter().collect();
        kinds.sort_by_key(|(kind, _)| **kind as u32);
        for (kind, count) in kinds {
            write!(f, ", {kind}: {count}")?;
        }
        write!(
            f,
            "; allowed {}, denied {}, failed closed {}, dropped {}",
            self.allowed, self.denied, self.failed_closed, self.dropped
        )
    }
}

/// Everything a draining session holds. Fields drop in declaration order,
/// which is the reverse of acquisition.
struct ControllerSession<'a, S: FilterService + ?Sized> {
    queue: NotificationQueue<'a, S>,
    waiter: NotificationWaiter<'a, S>,
    pool: BufferPool<'a, S>,
    record: BytesMut,
}

pub struct Controller<'a, P> {
    responder: Responder<P>,
    shutdown: &'a ShutdownEventFd,
    config: ControllerConfig,
    state: SessionState,
    stats: SessionStats,
}

impl<'a, P: PermissionPolicy> Controller<'a, P> {
    pub fn new(policy: P, shutdown: &'a ShutdownEventFd, config: ControllerConfig) -> Self {
        Self {
            responder: Responder::new(policy, config.slow_decision),
            shutdown,
            config,
            state: SessionState::Uninitialized,
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    fn transition(&mut self, next: SessionState) {
        debug!("session {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Opens the filter connection. The caller owns it and hands it to
    /// [`Controller::run`]; dropping it closes the connection.
    pub fn connect<S, F>(&mut self, connect: F) -> Result<S, ControllerError>
    where
        F: FnOnce() -> Result<S, FilterError>,
    {
        self.transition(SessionState::Connecting);
        connect().map_err(|e| {
            self.transition(SessionState::Teardown);
            self.transition(SessionState::Closed);
            e.into()
        })
    }

    /// Runs one session against `service` until shutdown is requested or a
    /// fatal error occurs.
    pub fn run<S: FilterService + ?Sized>(
        &mut self,
        service: &S,
    ) -> Result<SessionStats, ControllerError> {
        let result = self
            .open(service)
            .and_then(|session| self.drain_until_closed(service, session));
        self.transition(SessionState::Closed);
        result.map(|()| self.stats.clone())
    }

    fn open<'s, S: FilterService + ?Sized>(
        &mut self,
        service: &'s S,
    ) -> Result<ControllerSession<'s, S>, ControllerError> {
        self.transition(SessionState::BuffersMapping);
        let pool = BufferPool::map_all(service).map_err(|e| self.abort(e))?;
        let waiter = NotificationWaiter::register(service).map_err(|e| self.abort(e))?;

        self.transition(SessionState::QueueMapping);
        let mapping =
            Mapping::new(service, Region::NotificationQueue).map_err(|e| self.abort(e))?;
        let queue = NotificationQueue::attach(mapping).map_err(|e| self.abort(e))?;

        Ok(ControllerSession {
            queue,
            waiter,
            pool,
            record: BytesMut::with_capacity(RECORD_SIZE),
        })
    }

    /// Logs a startup failure and enters teardown. Called while the
    /// resources acquired so far are still held, so their release follows.
    fn abort(&mut self, e: impl Into<ControllerError>) -> ControllerError {
        let e = e.into();
        error!("session startup failed during {:?}: {e}", self.state);
        self.transition(SessionState::Teardown);
        e
    }

    fn drain_until_closed<S: FilterService + ?Sized>(
        &mut self,
        service: &S,
        mut session: ControllerSession<'_, S>,
    ) -> Result<(), ControllerError> {
        self.transition(SessionState::Draining);
        let result = loop {
            match session.waiter.wait_for_data(&session.queue, self.shutdown) {
                Ok(()) => {
                    if let Err(e) = self.drain(service, &mut session) {
                        error!("{e}");
                        break Err(e.into());
                    }
                }
                Err(QueueError::Closed) => {
                    info!("notification queue closed");
                    break Ok(());
                }
                Err(e) => {
                    error!("{e}");
                    break Err(e.into());
                }
            }
        };

        self.transition(SessionState::Teardown);
        drop(session);
        result
    }

    /// Handles every record currently queued. Returns how many were dequeued.
    fn drain<S: FilterService + ?Sized>(
        &mut self,
        service: &S,
        session: &mut ControllerSession<'_, S>,
    ) -> Result<usize, QueueError> {
        let mut drained = 0;
        while session.queue.dequeue(&mut session.record)?.is_some() {
            drained += 1;
            self.handle_record(service, &session.pool, &session.record);
        }
        Ok(drained)
    }

    fn handle_record<S: FilterService + ?Sized>(
        &mut self,
        service: &S,
        pool: &BufferPool<'_, S>,
        record: &[u8],
    ) {
        let event = match decode(record) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping record: {e}");
                self.stats.dropped += 1;
                return;
            }
        };
        self.stats.total += 1;
        *self.stats.counters.entry(event.kind).or_default() += 1;

        let Some(payload) = event.payload else {
            self.report(&event, &[]);
            return;
        };
        let data = match pool.payload(&payload) {
            Ok(data) => data,
            Err(e) => {
                warn!("skipping {} for socket {}: {e}", event.kind, event.socket_id);
                self.stats.dropped += 1;
                return;
            }
        };

        self.report(&event, data);
        let decision = self.responder.respond(service, &event, &payload, data);
        self.stats.record_decision(decision);
    }

    fn report(&self, event: &SocketEvent, data: &[u8]) {
        match self.config.format {
            OutputFormat::Text => info!(
                "{}",
                format_event_with_payload(event, data, self.config.payload_bytes)
            ),
            OutputFormat::Json => println!("{}", format_json(event, data, self.config.payload_bytes)),
        }
    }
}
