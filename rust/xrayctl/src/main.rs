mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error};
use std::{path::Path, process::ExitCode};

use cli::{Args, Cmd};
use xrayctl::{
    catalog::Catalog,
    config::Config,
    error,
    logging,
    manager::{Manager, ProtocolOptions, UpdateOptions},
};

fn main() -> ExitCode {
    let args = Args::parse();

    let cfg = match load_config(&args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("xrayctl: {e:#}");
            return ExitCode::from(error::kind_of(&e).exit_code() as u8);
        }
    };

    if let Err(e) = logging::init(&cfg.log) {
        eprintln!("xrayctl: logging disabled: {e:#}");
    }
    debug!("confdir={} backup_dir={}", cfg.confdir.display(), cfg.backup_dir.display());

    match run(args.cmd, cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let kind = error::kind_of(&e);
            error!("{e:#}");
            ExitCode::from(kind.exit_code() as u8)
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut cfg = Config::resolve(args.config.as_deref())?;
    if let Some(d) = &args.confdir {
        cfg.confdir = d.clone();
    }
    if args.no_validate {
        cfg.skip_validation = true;
    }
    if let Some(l) = &args.log_level {
        cfg.log.level = l.clone();
    }
    Ok(cfg)
}

fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

fn run(cmd: Cmd, cfg: Config) -> Result<()> {
    let catalog = Catalog::builtin().context("catalog")?;

    if let Cmd::Protocols = cmd {
        for d in catalog.descriptors() {
            println!(
                "{:<18} port={:<5} tls={:<5} aliases={:<24} {}",
                d.name,
                d.default_port,
                d.requires_tls,
                d.aliases.join(","),
                d.description
            );
        }
        return Ok(());
    }

    let mgr = Manager::new(cfg, catalog);

    match cmd {
        Cmd::Init => {
            let written = mgr.initialize()?;
            if written.is_empty() {
                println!("{} already initialized", mgr.store().dir().display());
            }
            for p in written {
                println!("created {}", p.display());
            }
        }
        Cmd::Add { protocol, tag, port, set } => {
            let mut opts = ProtocolOptions::from_pairs(&set)?;
            if port.is_some() {
                opts.port = port;
            }
            let info = mgr.add_protocol(&protocol, tag.as_deref(), &opts)?;
            print_json(&info)?;
        }
        Cmd::Remove { tag } => {
            for p in mgr.remove_protocol(&tag)? {
                println!("removed {}", p.display());
            }
        }
        Cmd::Update { tag, set } => {
            let opts = UpdateOptions::from_pairs(&set)?;
            let info = mgr.update_protocol(&tag, &opts)?;
            print_json(&info)?;
        }
        Cmd::List { json } => {
            let units = mgr.list_protocols()?;
            if json {
                print_json(&units)?;
            } else {
                println!("{:<24} {:<20} {:>5}  FILE", "TAG", "TYPE", "PORT");
                for u in units {
                    let file = u.file.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_default();
                    println!("{:<24} {:<20} {:>5}  {}", u.tag, u.protocol_type, u.port, file);
                }
            }
        }
        Cmd::Info { tag } => print_json(&mgr.get_protocol_info(&tag)?)?,
        Cmd::Share { tag } => println!("{}", mgr.generate_share_url(&tag)?),
        Cmd::Backup { path } => {
            let archive = mgr.backup_config(path.as_deref())?;
            println!("{}", archive.display());
        }
        Cmd::Restore { path } => {
            let m = mgr.restore_config(&path)?;
            println!("restored {} ({} files, taken {})", path.display(), m.files.len(), m.timestamp);
        }
        Cmd::Backups => {
            for b in mgr.list_backups()? {
                println!(
                    "{}  {}  tags={}",
                    b.manifest.timestamp,
                    display_name(&b.path),
                    b.manifest.protocols.join(",")
                );
            }
        }
        Cmd::Validate => {
            let report = mgr.validate_config()?;
            for w in &report.warnings {
                println!("warning: {w}");
            }
            println!("ok: {} fragments", report.fragments);
        }
        Cmd::Protocols => {}
    }
    Ok(())
}

fn display_name(p: &Path) -> String {
    p.file_name().map(|f| f.to_string_lossy().into_owned()).unwrap_or_else(|| p.display().to_string())
}
