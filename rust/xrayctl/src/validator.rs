//! The external check run after every mutation: xray's own `-test` mode.

use anyhow::Result;
use log::{debug, info};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{config::Config, error::ConfError, shell};

pub trait Validator {
    /// `Err` carrying [`ConfError::ValidationFailed`] when the directory would not load.
    fn validate(&self, confdir: &Path) -> Result<()>;
}

/// `xray run -test -confdir <dir>`.
#[derive(Debug, Clone)]
pub struct XrayValidator {
    pub bin: PathBuf,
    pub timeout: Duration,
}

impl XrayValidator {
    pub fn new(bin: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self { bin: bin.into(), timeout }
    }
}

impl Validator for XrayValidator {
    fn validate(&self, confdir: &Path) -> Result<()> {
        let dir = confdir.to_string_lossy();
        let out = shell::run_timeout(&self.bin, &["run", "-test", "-confdir", &dir], self.timeout)
            .map_err(|e| ConfError::ValidationFailed {
                dir: confdir.to_path_buf(),
                output: format!("{e:#}"),
            })?;

        if out.timed_out {
            return Err(ConfError::ValidationFailed {
                dir: confdir.to_path_buf(),
                output: format!("{} timed out after {:?}", self.bin.display(), self.timeout),
            }
            .into());
        }
        if out.code != 0 || !out.stderr.trim().is_empty() {
            return Err(ConfError::ValidationFailed {
                dir: confdir.to_path_buf(),
                output: format!("exit={} {}", out.code, out.combined()),
            }
            .into());
        }
        debug!("validate: ok dir={}", confdir.display());
        Ok(())
    }
}

/// Accepts everything. Selected by `skip_validation` / `XRAYCTL_SKIP_VALIDATE`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipValidator;

impl Validator for SkipValidator {
    fn validate(&self, confdir: &Path) -> Result<()> {
        debug!("validate: skipped dir={}", confdir.display());
        Ok(())
    }
}

pub fn from_config(cfg: &Config) -> Box<dyn Validator> {
    if cfg.skip_validation {
        info!("validate: external check disabled");
        return Box::new(SkipValidator);
    }
    Box::new(XrayValidator::new(cfg.xray_bin.clone(), cfg.validate_timeout()))
}
