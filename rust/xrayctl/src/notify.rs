//! Tell the running daemon to pick up a committed change.
//!
//! Failures are the caller's to log; a reload problem never undoes a commit.

use anyhow::{bail, Context, Result};
use log::info;
use std::{fs, path::PathBuf, time::Duration};

use crate::{config::Config, shell};

pub trait Notifier {
    fn notify(&self) -> Result<()>;
}

/// Runs a shell line such as `systemctl restart xray`.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    pub command: String,
    pub timeout: Duration,
}

impl Notifier for CommandNotifier {
    fn notify(&self) -> Result<()> {
        shell::ok_sh_timeout(&self.command, self.timeout)
            .with_context(|| format!("reload command: {}", self.command))?;
        info!("reload: ran '{}'", self.command);
        Ok(())
    }
}

/// Sends SIGHUP to the pid written in `pid_file`.
#[derive(Debug, Clone)]
pub struct SignalNotifier {
    pub pid_file: PathBuf,
}

impl Notifier for SignalNotifier {
    fn notify(&self) -> Result<()> {
        let raw = fs::read_to_string(&self.pid_file)
            .with_context(|| format!("read pid file {}", self.pid_file.display()))?;
        let pid: i32 = raw
            .trim()
            .parse()
            .with_context(|| format!("bad pid in {}: '{}'", self.pid_file.display(), raw.trim()))?;
        if pid <= 1 {
            bail!("refusing to signal pid {pid} from {}", self.pid_file.display());
        }
        let rc = unsafe { libc::kill(pid, libc::SIGHUP) };
        if rc != 0 {
            let e = std::io::Error::last_os_error();
            bail!("SIGHUP pid={pid}: {e}");
        }
        info!("reload: SIGHUP pid={pid}");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self) -> Result<()> {
        Ok(())
    }
}

/// A configured command wins over a pid file. Neither means no reload.
pub fn from_config(cfg: &Config) -> Box<dyn Notifier> {
    let timeout = Duration::from_millis(cfg.reload.timeout_ms.max(1));
    if let Some(cmd) = cfg.reload.command.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        return Box::new(CommandNotifier { command: cmd.to_string(), timeout });
    }
    if let Some(p) = &cfg.reload.pid_file {
        return Box::new(SignalNotifier { pid_file: p.clone() });
    }
    Box::new(NoopNotifier)
}
