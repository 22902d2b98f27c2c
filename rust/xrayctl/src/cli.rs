use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "xrayctl",
    version,
    about = "Manage an xray confdir of JSON fragments",
    long_about = "xrayctl adds, updates and removes inbound units in a directory loaded by `xray run -confdir`. \
Every change is snapshotted, checked with `xray run -test` and rolled back if the check fails.",
    after_help = r#"EXAMPLES
  xrayctl init
  xrayctl add vless-reality --tag vr1
  xrayctl add ss --tag ss1 --port 8388
  xrayctl add vless-ws-tls --set domain=example.com --set path=/ray
  xrayctl update vr1 --set port=8443
  xrayctl share vr1
  xrayctl backup
  xrayctl restore /usr/local/etc/xray/backups/xray-backup-20260101-120000.tar.gz

EXIT CODES
  0 ok, 1 write/other failure (rolled back), 2 bad input, 3 state conflict or not found,
  4 xray rejected the result (rolled back), 5 backup/restore failure

ENVIRONMENT
  XRAYCTL_CONFDIR, XRAYCTL_BACKUP_DIR, XRAYCTL_XRAY_BIN, XRAYCTL_LOG_LEVEL,
  XRAYCTL_PUBLIC_HOST, XRAYCTL_SKIP_VALIDATE=1
"#,
    arg_required_else_help = true
)]
pub struct Args {
    /// JSON config file (default /etc/xrayctl/config.json when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the fragment directory.
    #[arg(long, global = true)]
    pub confdir: Option<PathBuf>,

    /// Skip `xray run -test` after mutations.
    #[arg(long, global = true, default_value_t = false)]
    pub no_validate: bool,

    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Cmd {
    /// Create the confdir and the shared base/dns/outbound/routing fragments.
    Init,

    /// Add a protocol unit.
    Add {
        /// Protocol name or alias (see `protocols`).
        protocol: String,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Extra option, repeatable: uuid, password, method, path, host, domain, dest, ...
        #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_kv)]
        set: Vec<(String, String)>,
    },

    /// Remove every fragment referencing a tag.
    Remove { tag: String },

    /// Patch a unit in place: port, uuid, password, path; other keys go into the inbound.
    Update {
        tag: String,
        #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_kv)]
        set: Vec<(String, String)>,
    },

    /// List protocol units.
    List {
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Show one unit as JSON.
    Info { tag: String },

    /// Print a client share link.
    Share { tag: String },

    /// Archive the confdir (default: timestamped file in backup_dir).
    Backup { path: Option<PathBuf> },

    /// Replace the confdir with an archive.
    Restore { path: PathBuf },

    /// List archives in backup_dir.
    Backups,

    /// Local checks plus `xray run -test`.
    Validate,

    /// Show supported protocols.
    Protocols,
}

pub fn parse_kv(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_add_with_sets() {
        let a = Args::try_parse_from([
            "xrayctl", "--no-validate", "add", "vless-ws-tls", "--tag", "w1", "--set", "domain=example.com",
            "--set", "path=/a=b",
        ])
        .unwrap();
        assert!(a.no_validate);
        match a.cmd {
            Cmd::Add { protocol, tag, port, set } => {
                assert_eq!(protocol, "vless-ws-tls");
                assert_eq!(tag.as_deref(), Some("w1"));
                assert_eq!(port, None);
                assert_eq!(set[1], ("path".to_string(), "/a=b".to_string()));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn rejects_bad_kv() {
        assert!(parse_kv("novalue").is_err());
        assert!(parse_kv("=x").is_err());
        assert!(Args::try_parse_from(["xrayctl", "update", "t", "--set", "oops"]).is_err());
    }
}
