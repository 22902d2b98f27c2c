use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/xrayctl/config.json";
pub const SKIP_VALIDATE_ENV: &str = "XRAYCTL_SKIP_VALIDATE";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory of JSON fragments loaded by `xray run -confdir`.
    pub confdir: PathBuf,

    /// Default destination for user-requested backups.
    pub backup_dir: PathBuf,

    /// Ephemeral snapshots, archive extraction and the lock file.
    /// Must not live inside `confdir`.
    pub scratch_dir: PathBuf,

    /// Where the pre-restore safety backup goes. Falls back to `backup_dir`.
    pub safety_dir: Option<PathBuf>,

    pub xray_bin: PathBuf,

    pub validate_timeout_ms: u64,

    pub skip_validation: bool,

    /// Address placed in share URLs for units that carry no domain.
    pub public_host: Option<String>,

    /// Default location of `<domain>.crt` / `<domain>.key`.
    pub cert_dir: PathBuf,

    pub reload: ReloadConfig,

    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,

    /// If set, logs will also be appended here.
    pub file: Option<PathBuf>,

    /// Short capped journal of committed mutations.
    pub journal: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level(), file: None, journal: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReloadConfig {
    /// Shell line run after a committed mutation, e.g. `systemctl restart xray`.
    pub command: Option<String>,

    /// Alternatively send SIGHUP to the pid in this file.
    pub pid_file: Option<PathBuf>,

    pub timeout_ms: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self { command: None, pid_file: None, timeout_ms: 15_000 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            confdir: PathBuf::from("/usr/local/etc/xray/confs"),
            backup_dir: PathBuf::from("/usr/local/etc/xray/backups"),
            scratch_dir: env::temp_dir().join("xrayctl"),
            safety_dir: None,
            xray_bin: PathBuf::from("/usr/local/bin/xray"),
            validate_timeout_ms: 10_000,
            skip_validation: false,
            public_host: None,
            cert_dir: PathBuf::from("/usr/local/etc/xray/certs"),
            reload: ReloadConfig::default(),
            log: LogConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config =
            serde_json::from_str(&s).with_context(|| format!("parse json {}", path.display()))?;

        if let Some(d) = &cfg.safety_dir {
            if d.as_os_str().is_empty() {
                cfg.safety_dir = None;
            }
        }
        Ok(cfg)
    }

    /// Explicit file, else the system-wide file when present, else defaults.
    /// Environment overrides are applied last.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let mut cfg = match explicit {
            Some(p) => Self::load(p)?,
            None => {
                let p = Path::new(DEFAULT_CONFIG_PATH);
                if p.is_file() {
                    Self::load(p)?
                } else {
                    Self::default()
                }
            }
        };
        cfg.apply_env(|k| env::var(k).ok());
        Ok(cfg)
    }

    pub fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, var: F) {
        if let Some(v) = var("XRAYCTL_CONFDIR").filter(|v| !v.is_empty()) {
            self.confdir = PathBuf::from(v);
        }
        if let Some(v) = var("XRAYCTL_BACKUP_DIR").filter(|v| !v.is_empty()) {
            self.backup_dir = PathBuf::from(v);
        }
        if let Some(v) = var("XRAYCTL_XRAY_BIN").filter(|v| !v.is_empty()) {
            self.xray_bin = PathBuf::from(v);
        }
        if let Some(v) = var("XRAYCTL_LOG_LEVEL").filter(|v| !v.is_empty()) {
            self.log.level = v;
        }
        if let Some(v) = var("XRAYCTL_PUBLIC_HOST").filter(|v| !v.is_empty()) {
            self.public_host = Some(v);
        }
        if let Some(v) = var(SKIP_VALIDATE_ENV) {
            self.skip_validation = matches!(v.trim(), "1" | "true" | "yes");
        }
    }

    pub fn safety_dir(&self) -> &Path {
        self.safety_dir.as_deref().unwrap_or(&self.backup_dir)
    }

    pub fn validate_timeout(&self) -> Duration {
        Duration::from_millis(self.validate_timeout_ms.max(1))
    }

    /// Layout rooted in one directory, for tests.
    pub fn rooted(root: &Path) -> Self {
        Self {
            confdir: root.join("confs"),
            backup_dir: root.join("backups"),
            scratch_dir: root.join("scratch"),
            cert_dir: root.join("certs"),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("config.json");
        fs::write(&p, r#"{"confdir": "/etc/xray/confs", "log": {"level": "debug"}, "safety_dir": ""}"#)
            .unwrap();

        let cfg = Config::load(&p).unwrap();
        assert_eq!(cfg.confdir, PathBuf::from("/etc/xray/confs"));
        assert_eq!(cfg.log.level, "debug");
        assert_eq!(cfg.validate_timeout_ms, 10_000);
        assert!(cfg.safety_dir.is_none());
        assert_eq!(cfg.safety_dir(), cfg.backup_dir.as_path());
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("XRAYCTL_CONFDIR", "/srv/confs"),
            ("XRAYCTL_SKIP_VALIDATE", "1"),
            ("XRAYCTL_PUBLIC_HOST", "203.0.113.7"),
        ]
        .into_iter()
        .collect();

        let mut cfg = Config::default();
        cfg.apply_env(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.confdir, PathBuf::from("/srv/confs"));
        assert!(cfg.skip_validation);
        assert_eq!(cfg.public_host.as_deref(), Some("203.0.113.7"));
        assert_eq!(cfg.xray_bin, PathBuf::from("/usr/local/bin/xray"));
    }

    #[test]
    fn bad_json_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("config.json");
        fs::write(&p, "{ nope").unwrap();
        let err = Config::load(&p).unwrap_err();
        assert!(format!("{err:#}").contains("config.json"));
    }
}
