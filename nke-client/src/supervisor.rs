//! Ties the controller worker to diversion and process signals.
//!
//! Diversion is only enabled once the worker reports a filter connection,
//! and only disabled if enabling went through. Whatever wakes us first, the
//! worker is always joined.

use std::future::Future;

use anyhow::Context as _;
use log::{debug, warn};
use tokio::{
    sync::oneshot,
    task::{JoinError, JoinHandle},
};

use crate::{
    controller::SessionStats, diversion::DiversionControl, error::ControllerError,
    shutdown::ShutdownEventFd,
};

pub type WorkerResult = Result<SessionStats, ControllerError>;

enum Wake {
    Finished(Result<WorkerResult, JoinError>),
    Connected,
    Stopped,
}

pub async fn supervise<D, F>(
    mut worker: JoinHandle<WorkerResult>,
    connected: oneshot::Receiver<()>,
    stop: F,
    diversion: Option<&D>,
    shutdown: &ShutdownEventFd,
) -> anyhow::Result<SessionStats>
where
    D: DiversionControl + ?Sized,
    F: Future<Output = ()>,
{
    tokio::pin!(stop);

    let mut wake = tokio::select! {
        biased;
        joined = &mut worker => Wake::Finished(joined),
        Ok(()) = connected => Wake::Connected,
        () = &mut stop => Wake::Stopped,
    };

    let mut enabled = false;
    if let Wake::Connected = wake {
        if let Some(diversion) = diversion {
            match diversion.enable() {
                Ok(()) => enabled = true,
                Err(e) => warn!("failed to enable diversion: {e}"),
            }
        }
        wake = tokio::select! {
            joined = &mut worker => Wake::Finished(joined),
            () = &mut stop => Wake::Stopped,
        };
    }

    // Stop diverting before the controller stops answering.
    if enabled {
        if let Some(diversion) = diversion {
            if let Err(e) = diversion.disable() {
                warn!("failed to disable diversion: {e}");
            }
        }
    }

    let joined = match wake {
        Wake::Finished(joined) => joined,
        Wake::Connected | Wake::Stopped => {
            debug!("stopping controller worker");
            shutdown.request().context("failed to signal the controller")?;
            worker.await
        }
    };

    joined
        .context("controller worker panicked")?
        .context("controller session failed")
}
