use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context as _;
use clap::Parser;
use log::{debug, info};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::oneshot,
    task,
};

use crate::{
    controller::{Controller, ControllerConfig},
    device::DeviceFilter,
    display::OutputFormat,
    diversion::DiversionSwitch,
    responder::DefaultPolicy,
    shutdown::ShutdownEventFd,
    supervisor::supervise,
};

mod controller;
mod decoder;
mod device;
mod display;
mod diversion;
mod error;
mod filter;
mod pool;
mod queue;
mod responder;
mod shutdown;
mod supervisor;
#[cfg(test)]
mod testing;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Opt {
    /// Socket filter service device
    #[clap(long, default_value = "/dev/nke")]
    service: PathBuf,

    /// Control device used to start and stop diversion
    #[clap(long, default_value = "/dev/archon")]
    control_device: PathBuf,

    /// Do not touch diversion at startup or shutdown
    #[clap(long)]
    no_divert: bool,

    /// Event output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Payload bytes to show for DataIn/DataOut events
    #[clap(long, default_value = "0")]
    payload_bytes: usize,

    /// Decision returned for every DataIn/DataOut event
    #[clap(long, value_enum, default_value_t = DefaultPolicy::Allow)]
    policy: DefaultPolicy,

    /// Warn when the filter takes longer than this to accept a decision
    #[clap(long, default_value = "100")]
    slow_decision_ms: u64,

    /// Log debug information
    #[clap(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::new()
        .filter_level(if opt.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .init();

    info!("filter service: {}", opt.service.display());
    info!("policy: {:?}, format: {:?}", opt.policy, opt.format);
    if opt.payload_bytes > 0 {
        info!("payload preview: {} bytes", opt.payload_bytes);
    }

    let shutdown = Arc::new(ShutdownEventFd::new().context("failed to create shutdown eventfd")?);
    let diversion = (!opt.no_divert).then(|| DiversionSwitch::new(&opt.control_device));
    if let Some(diversion) = &diversion {
        info!("diversion control device: {}", diversion.path().display());
    }
    let config = ControllerConfig {
        format: opt.format,
        payload_bytes: opt.payload_bytes,
        slow_decision: Duration::from_millis(opt.slow_decision_ms),
    };

    // poll() blocks, so the controller gets a thread of its own
    let (connected_tx, connected_rx) = oneshot::channel();
    let worker = {
        let shutdown = shutdown.clone();
        let service_path = opt.service.clone();
        let policy = opt.policy;
        task::spawn_blocking(move || {
            let mut controller = Controller::new(policy, &shutdown, config);
            let service = controller.connect(|| DeviceFilter::connect(&service_path))?;
            let _ = connected_tx.send(());
            let result = controller.run(&service);
            debug!("controller finished in state {:?}", controller.state());
            result
        })
    };

    let mut sig_term = signal(SignalKind::terminate())?;
    let stop = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sig_term.recv() => info!("SIGTERM received"),
        }
    };

    let stats = supervise(worker, connected_rx, stop, diversion.as_ref(), &shutdown).await?;
    info!("{stats}");
    Ok(())
}
