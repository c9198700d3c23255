use std::{
    fs::OpenOptions,
    io,
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use log::info;
use nke_common::{NKE_START_DIVERTING, NKE_STOP_DIVERTING};

/// Something that can start and stop diverting socket traffic to the filter.
pub trait DiversionControl {
    fn enable(&self) -> io::Result<()>;

    fn disable(&self) -> io::Result<()>;
}

/// Starts and stops traffic diversion through the control device.
#[derive(Debug, Clone)]
pub struct DiversionSwitch {
    path: PathBuf,
}

impl DiversionSwitch {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn send(&self, request: u32) -> io::Result<()> {
        let device = OpenOptions::new().read(true).write(true).open(&self.path)?;
        // SAFETY: both requests take no argument
        let ret = unsafe { libc::ioctl(device.as_raw_fd(), request as libc::Ioctl) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl DiversionControl for DiversionSwitch {
    fn enable(&self) -> io::Result<()> {
        self.send(NKE_START_DIVERTING)?;
        info!("diversion enabled via {}", self.path.display());
        Ok(())
    }

    fn disable(&self) -> io::Result<()> {
        self.send(NKE_STOP_DIVERTING)?;
        info!("diversion disabled");
        Ok(())
    }
}
