use std::time::{Duration, Instant};

use clap::ValueEnum;
use log::{debug, error, warn};
use nke_common::{SocketDataProperty, SocketFilterResponse};

use crate::{
    decoder::{DataPayload, SocketEvent},
    filter::FilterService,
};

/// Decides whether the data behind a gating event may reach its socket.
pub trait PermissionPolicy {
    fn allow_data(&self, event: &SocketEvent, payload: &[u8]) -> bool;
}

impl<F> PermissionPolicy for F
where
    F: Fn(&SocketEvent, &[u8]) -> bool,
{
    fn allow_data(&self, event: &SocketEvent, payload: &[u8]) -> bool {
        self(event, payload)
    }
}

/// Policies selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DefaultPolicy {
    /// Pass every chunk through
    #[default]
    Allow,
    /// Hold back every chunk
    Deny,
}

impl PermissionPolicy for DefaultPolicy {
    fn allow_data(&self, _event: &SocketEvent, _payload: &[u8]) -> bool {
        matches!(self, DefaultPolicy::Allow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied,
    /// The filter never received the decision; the data is treated as denied.
    FailedClosed,
}

/// Builds the response for a gating event: release the event's slots and
/// grant or refuse the chunk identified by `(socket_id, data_index)`.
///
/// Only the slots before the first unused entry are released, the same ones
/// the buffer pool checked. Anything after that entry is never echoed back.
pub fn build_response(socket_id: u64, payload: &DataPayload, allow: bool) -> SocketFilterResponse {
    let mut response = SocketFilterResponse::empty();
    for (release, index) in response.buffers_to_release.iter_mut().zip(payload.slot_indices()) {
        *release = index;
    }
    response.property[0] = SocketDataProperty::permission(socket_id, payload.data_index, allow);
    response.property[1] = SocketDataProperty::terminator();
    response
}

pub struct Responder<P> {
    policy: P,
    slow_decision: Duration,
}

impl<P: PermissionPolicy> Responder<P> {
    pub fn new(policy: P, slow_decision: Duration) -> Self {
        Self {
            policy,
            slow_decision,
        }
    }

    /// Sends the decision for `event` and waits for the filter to take it.
    pub fn respond<S: FilterService + ?Sized>(
        &self,
        service: &S,
        event: &SocketEvent,
        payload: &DataPayload,
        data: &[u8],
    ) -> Decision {
        let allow = self.policy.allow_data(event, data);
        let response = build_response(event.socket_id, payload, allow);

        let started = Instant::now();
        let sent = service.send_decision(&response);
        let elapsed = started.elapsed();
        if elapsed >= self.slow_decision {
            warn!(
                "decision for socket {} index {} took {:?}",
                event.socket_id, payload.data_index, elapsed
            );
        }

        match sent {
            Ok(()) => {
                debug!(
                    "socket {} index {}: {}",
                    event.socket_id,
                    payload.data_index,
                    if allow { "allowed" } else { "denied" }
                );
                if allow {
                    Decision::Allowed
                } else {
                    Decision::Denied
                }
            }
            Err(e) => {
                error!(
                    "decision for socket {} index {} not delivered: {e}",
                    event.socket_id, payload.data_index
                );
                Decision::FailedClosed
            }
        }
    }
}
