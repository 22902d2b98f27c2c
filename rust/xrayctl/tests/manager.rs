use anyhow::Result;
use serde_json::Value;
use std::{
    cell::Cell,
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    rc::Rc,
};
use tempfile::TempDir;

use xrayctl::{
    catalog::Catalog,
    config::Config,
    error::{self, ConfError, ErrorKind},
    manager::{Manager, ProtocolOptions, UnitStatus, UpdateOptions},
    notify::Notifier,
    ports::PortProbe,
    validator::{SkipValidator, Validator},
};

struct Busy(BTreeSet<u16>);

impl PortProbe for Busy {
    fn is_free(&self, port: u16) -> bool {
        !self.0.contains(&port)
    }
}

/// Rejects every directory, like xray would for a broken config.
struct Rejecting;

impl Validator for Rejecting {
    fn validate(&self, confdir: &Path) -> Result<()> {
        Err(ConfError::ValidationFailed { dir: confdir.to_path_buf(), output: "rejected".into() }.into())
    }
}

#[derive(Clone, Default)]
struct CountingNotifier(Rc<Cell<u32>>);

impl Notifier for CountingNotifier {
    fn notify(&self) -> Result<()> {
        self.0.set(self.0.get() + 1);
        Ok(())
    }
}

struct Env {
    dir: TempDir,
}

impl Env {
    fn new() -> Self {
        Self { dir: tempfile::tempdir().unwrap() }
    }

    fn config(&self) -> Config {
        let mut cfg = Config::rooted(self.dir.path());
        cfg.public_host = Some("203.0.113.7".into());
        cfg
    }

    fn manager(&self) -> Manager {
        self.manager_with(&[])
    }

    fn manager_with(&self, busy: &[u16]) -> Manager {
        Manager::new(self.config(), Catalog::builtin().unwrap())
            .with_validator(SkipValidator)
            .with_probe(Busy(busy.iter().copied().collect()))
            .with_notifier(CountingNotifier::default())
    }

    fn rejecting(&self) -> Manager {
        self.manager().with_validator(Rejecting)
    }

    fn confdir(&self) -> PathBuf {
        self.dir.path().join("confs")
    }

    /// Every file in the confdir with its bytes.
    fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        let mut out = BTreeMap::new();
        if let Ok(rd) = fs::read_dir(self.confdir()) {
            for e in rd.flatten() {
                out.insert(e.file_name().to_string_lossy().into_owned(), fs::read(e.path()).unwrap());
            }
        }
        out
    }
}

fn port_opts(port: u16) -> ProtocolOptions {
    ProtocolOptions { port: Some(port), ..Default::default() }
}

fn conf_err(err: &anyhow::Error) -> &ConfError {
    error::find(err).unwrap_or_else(|| panic!("uncategorized error: {err:#}"))
}

#[test]
fn basic_shadowsocks_add() {
    let env = Env::new();
    let m = env.manager();
    m.initialize().unwrap();

    m.add_protocol("shadowsocks", Some("ss1"), &port_opts(8388)).unwrap();
    let info = m.get_protocol_info("ss1").unwrap();
    assert_eq!(info.protocol_type, "shadowsocks");
    assert_eq!(info.port, 8388);
    assert_eq!(info.status, UnitStatus::Configured);
    let pw = info.settings["password"].as_str().unwrap();
    assert!(!pw.is_empty());
    assert!(info.file.ends_with("10-inbound-ss1.json"));
}

#[test]
fn reality_defaults() {
    let env = Env::new();
    let m = env.manager();
    let info = m.add_protocol("vless-reality", Some("vr1"), &ProtocolOptions::default()).unwrap();

    assert_eq!(info.settings["dest"], "www.microsoft.com");
    assert_eq!(info.settings["server_name"], "www.microsoft.com");
    assert!(!info.settings["private_key"].as_str().unwrap().is_empty());
    assert!(info.settings.contains_key("public_key"));
    let sid = info.settings["short_id"].as_str().unwrap();
    assert_eq!(sid.len(), 8);
    assert!(sid.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(info.port, 443);
}

#[test]
fn tag_conflict_fails_before_touching_files() {
    let env = Env::new();
    let m = env.manager();
    m.initialize().unwrap();
    m.add_protocol("ss", Some("dup"), &port_opts(8388)).unwrap();
    let before = env.snapshot();

    for proto in ["ss", "vless-reality"] {
        let err = m.add_protocol(proto, Some("dup"), &ProtocolOptions::default()).unwrap_err();
        assert!(matches!(conf_err(&err), ConfError::ConfigConflict { tag, .. } if tag == "dup"));
        assert_eq!(error::kind_of(&err), ErrorKind::State);
    }
    assert_eq!(env.snapshot(), before);
    // no snapshot archives were left behind either
    let scratch: Vec<_> = fs::read_dir(env.dir.path().join("scratch"))
        .map(|rd| rd.flatten().filter(|e| e.path().to_string_lossy().ends_with(".tar.gz")).collect())
        .unwrap_or_default();
    assert!(scratch.is_empty());
}

#[test]
fn explicit_busy_port_is_not_substituted() {
    let env = Env::new();
    let m = env.manager_with(&[443]);
    m.initialize().unwrap();
    let before = env.snapshot();

    let err = m.add_protocol("vless-reality", Some("vr2"), &port_opts(443)).unwrap_err();
    assert!(matches!(conf_err(&err), ConfError::PortUnavailable { port: 443 }));
    assert_eq!(error::kind_of(&err), ErrorKind::Input);
    assert!(!env.confdir().join("10-inbound-vr2.json").exists());
    assert_eq!(env.snapshot(), before);

    // without an explicit port the allocator moves on
    let info = m.add_protocol("vless-reality", Some("vr2"), &ProtocolOptions::default()).unwrap();
    assert_eq!(info.port, 8443);
}

#[test]
fn ports_of_existing_fragments_are_reserved() {
    let env = Env::new();
    let m = env.manager();
    m.add_protocol("ss", Some("a"), &port_opts(9000)).unwrap();
    let err = m.add_protocol("ss", Some("b"), &port_opts(9000)).unwrap_err();
    assert!(matches!(conf_err(&err), ConfError::PortUnavailable { port: 9000 }));
}

#[test]
fn validation_failure_rolls_back_every_mutation() {
    let env = Env::new();
    let ok = env.manager();
    ok.initialize().unwrap();
    ok.add_protocol("vless-reality", Some("vr1"), &ProtocolOptions::default()).unwrap();
    ok.add_protocol("ss", Some("ss1"), &port_opts(8388)).unwrap();
    let before = env.snapshot();

    let bad = env.rejecting();

    let err = bad.add_protocol("ss", Some("ss2"), &port_opts(8390)).unwrap_err();
    assert!(matches!(conf_err(&err), ConfError::ValidationFailed { .. }));
    assert_eq!(error::kind_of(&err).exit_code(), 4);
    assert_eq!(env.snapshot(), before);

    bad.remove_protocol("ss1").unwrap_err();
    assert_eq!(env.snapshot(), before);

    let upd = UpdateOptions { port: Some(9443), ..Default::default() };
    bad.update_protocol("vr1", &upd).unwrap_err();
    assert_eq!(env.snapshot(), before);

    // nothing left in scratch once the rollback is done
    let leftovers = fs::read_dir(env.dir.path().join("scratch"))
        .unwrap()
        .flatten()
        .filter(|e| e.file_name() != "xrayctl.lock")
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn empty_update_is_byte_identical() {
    let env = Env::new();
    let m = env.manager();
    let info = m.add_protocol("vless-reality", Some("vr1"), &ProtocolOptions::default()).unwrap();
    let before = fs::read(&info.file).unwrap();

    m.update_protocol("vr1", &UpdateOptions::default()).unwrap();
    assert_eq!(fs::read(&info.file).unwrap(), before);

    // setting the current port again is a no-op too
    m.update_protocol("vr1", &UpdateOptions { port: Some(info.port), ..Default::default() }).unwrap();
    assert_eq!(fs::read(&info.file).unwrap(), before);
}

#[test]
fn update_rejects_malformed_path() {
    let env = Env::new();
    let m = env.manager();
    let info = m.add_protocol("vless-reality", Some("vr1"), &ProtocolOptions::default()).unwrap();
    let before = fs::read(&info.file).unwrap();

    let err = m
        .update_protocol("vr1", &UpdateOptions { path: Some("nope".into()), ..Default::default() })
        .unwrap_err();
    assert!(matches!(conf_err(&err), ConfError::InvalidInput { field, .. } if field == "path"));
    assert_eq!(fs::read(&info.file).unwrap(), before);

    // well-formed, but REALITY has no path to patch
    let err = m
        .update_protocol("vr1", &UpdateOptions { path: Some("/ok".into()), ..Default::default() })
        .unwrap_err();
    assert!(matches!(conf_err(&err), ConfError::InvalidInput { field, .. } if field == "path"));
    assert_eq!(fs::read(&info.file).unwrap(), before);
}

#[test]
fn update_patches_recognized_and_passthrough_keys() {
    let env = Env::new();
    let m = env.manager();
    m.add_protocol(
        "vless-ws-tls",
        Some("w1"),
        &ProtocolOptions { domain: Some("example.com".into()), ..Default::default() },
    )
    .unwrap();

    let uuid = "6f1c2d3e-4b5a-4c6d-8e7f-9a0b1c2d3e4f";
    let opts = UpdateOptions::from_pairs(&[
        ("port".into(), "2096".into()),
        ("uuid".into(), uuid.into()),
        ("path".into(), "/ray".into()),
        ("listen".into(), "127.0.0.1".into()),
        ("sniffing".into(), r#"{"enabled": true}"#.into()),
    ])
    .unwrap();
    let info = m.update_protocol("w1", &opts).unwrap();
    assert_eq!(info.port, 2096);
    assert_eq!(info.settings["listen"], "127.0.0.1");
    assert_eq!(info.settings["sniffing"], serde_json::json!({"enabled": true}));
    assert_eq!(info.settings["uuid"], uuid);
    assert_eq!(info.settings["path"], "/ray");

    let doc: Value = serde_json::from_str(&fs::read_to_string(&info.file).unwrap()).unwrap();
    assert_eq!(doc["inbounds"][0]["listen"], "127.0.0.1");
    assert!(doc.get("listen").is_none());

    let bad = UpdateOptions { uuid: Some("not-a-uuid".into()), ..Default::default() };
    assert!(m.update_protocol("w1", &bad).is_err());
    let short = UpdateOptions { password: Some("short".into()), ..Default::default() };
    assert!(m.update_protocol("w1", &short).is_err());
}

#[test]
fn update_password_for_shadowsocks() {
    let env = Env::new();
    let m = env.manager();
    m.add_protocol("ss", Some("ss1"), &port_opts(8388)).unwrap();
    let info = m
        .update_protocol("ss1", &UpdateOptions { password: Some("a-much-longer-secret".into()), ..Default::default() })
        .unwrap();
    assert_eq!(info.settings["password"], "a-much-longer-secret");

    // 2022 ciphers need a key of the right size
    m.add_protocol("ss2022", Some("s22"), &port_opts(8390)).unwrap();
    let err = m
        .update_protocol("s22", &UpdateOptions { password: Some("not-base64-key!!".into()), ..Default::default() })
        .unwrap_err();
    assert!(matches!(conf_err(&err), ConfError::InvalidInput { field, .. } if field == "password"));
}

#[test]
fn update_and_remove_unknown_tag() {
    let env = Env::new();
    let m = env.manager();
    m.initialize().unwrap();
    let err = m.update_protocol("ghost", &UpdateOptions::default()).unwrap_err();
    assert!(matches!(conf_err(&err), ConfError::TagNotFound { .. }));
    let err = m.remove_protocol("ghost").unwrap_err();
    assert!(matches!(conf_err(&err), ConfError::TagNotFound { .. }));
    assert_eq!(error::kind_of(&err).exit_code(), 3);
}

#[test]
fn remove_deletes_all_fragments_for_tag() {
    let env = Env::new();
    let m = env.manager();
    m.initialize().unwrap();
    m.add_protocol("ss", Some("ss1"), &port_opts(8388)).unwrap();
    // a hand-written outbound sharing the tag
    fs::write(
        env.confdir().join("22-outbound-ss1.json"),
        r#"{"outbounds": [{"tag": "ss1", "protocol": "freedom"}]}"#,
    )
    .unwrap();

    let removed = m.remove_protocol("ss1").unwrap();
    assert_eq!(removed.len(), 2);
    assert!(m.store().find_by_tag("ss1").unwrap().is_empty());
    assert!(env.confdir().join("20-outbound-direct.json").exists());
}

#[test]
fn list_is_in_priority_order_and_marks_custom() {
    let env = Env::new();
    let m = env.manager();
    m.initialize().unwrap();
    m.add_protocol("ss", Some("zz"), &port_opts(8388)).unwrap();
    m.add_protocol("vless-reality", Some("aa"), &ProtocolOptions::default()).unwrap();
    fs::write(
        env.confdir().join("05-base-api.json"),
        r#"{"inbounds": [{"tag": "api", "port": 10085, "protocol": "dokodemo-door"}]}"#,
    )
    .unwrap();

    let list = m.list_protocols().unwrap();
    let tags: Vec<&str> = list.iter().map(|i| i.tag.as_str()).collect();
    assert_eq!(tags, ["api", "aa", "zz"]);
    assert_eq!(list[0].status, UnitStatus::Custom);
    assert_eq!(list[0].protocol_type, "dokodemo-door");

    let fragments = m.store().list().unwrap();
    assert!(fragments.windows(2).all(|w| w[0].name.priority <= w[1].name.priority));
}

#[test]
fn backup_restore_round_trip() {
    let env = Env::new();
    let m = env.manager();
    m.initialize().unwrap();
    m.add_protocol("vless-reality", Some("vr1"), &ProtocolOptions::default()).unwrap();
    m.add_protocol("ss", Some("ss1"), &port_opts(8388)).unwrap();

    let key = |m: &Manager| -> BTreeSet<(String, String, u16)> {
        m.list_protocols().unwrap().into_iter().map(|i| (i.tag, i.protocol_type, i.port)).collect()
    };
    let before = key(&m);
    let files_before = env.snapshot();

    let archive = m.backup_config(None).unwrap();
    m.remove_protocol("ss1").unwrap();
    m.add_protocol("trojan", Some("t1"), &ProtocolOptions { domain: Some("example.com".into()), ..Default::default() })
        .unwrap();

    let manifest = m.restore_config(&archive).unwrap();
    assert_eq!(manifest.protocols, ["ss1", "vr1"]);
    assert_eq!(key(&m), before);
    assert_eq!(env.snapshot(), files_before);

    let listed = m.list_backups().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].path, archive);
}

#[test]
fn restore_rejects_missing_and_corrupt_archives() {
    let env = Env::new();
    let m = env.manager();
    m.initialize().unwrap();
    let before = env.snapshot();
    let err = m.restore_config(&env.dir.path().join("nope.tar.gz")).unwrap_err();
    assert!(matches!(conf_err(&err), ConfError::FileNotFound { .. }));

    let garbage = env.dir.path().join("garbage.tar.gz");
    fs::write(&garbage, b"definitely not gzip").unwrap();
    let err = m.restore_config(&garbage).unwrap_err();
    assert_eq!(error::kind_of(&err), ErrorKind::Backup);
    assert_eq!(env.snapshot(), before);
}

#[test]
fn input_errors_come_first() {
    let env = Env::new();
    let m = env.manager();

    let err = m.add_protocol("wireguard", None, &ProtocolOptions::default()).unwrap_err();
    assert!(matches!(conf_err(&err), ConfError::ProtocolNotSupported { .. }));

    let err = m.add_protocol("vless-ws-tls", None, &ProtocolOptions::default()).unwrap_err();
    assert!(matches!(conf_err(&err), ConfError::InvalidInput { field, .. } if field == "domain"));

    let err = m.add_protocol("ss", Some("bad/tag"), &ProtocolOptions::default()).unwrap_err();
    assert!(matches!(conf_err(&err), ConfError::InvalidInput { field, .. } if field == "tag"));

    let opts = ProtocolOptions { password: Some("short".into()), ..Default::default() };
    let err = m.add_protocol("trojan", None, &ProtocolOptions { domain: Some("e.com".into()), ..opts }).unwrap_err();
    assert!(matches!(conf_err(&err), ConfError::InvalidInput { field, .. } if field == "password"));

    assert!(env.snapshot().is_empty());
}

#[test]
fn share_links() {
    let env = Env::new();
    let m = env.manager();
    m.add_protocol("vless-reality", Some("vr1"), &ProtocolOptions::default()).unwrap();
    m.add_protocol("ss", Some("ss1"), &port_opts(8388)).unwrap();

    let url = m.generate_share_url("vr1").unwrap();
    assert!(url.starts_with("vless://"));
    assert!(url.contains("@203.0.113.7:443?"));
    assert!(url.contains("security=reality"));

    let url = m.generate_share_url("ss1").unwrap();
    assert!(url.starts_with("ss://") && url.ends_with("@203.0.113.7:8388#ss1"), "{url}");

    assert!(m.generate_share_url("ghost").is_err());
}

#[test]
fn validate_reports_local_problems() {
    let env = Env::new();
    let m = env.manager();
    m.initialize().unwrap();
    m.add_protocol("ss", Some("ss1"), &port_opts(8388)).unwrap();
    fs::write(env.confdir().join("notes.json"), "{}").unwrap();
    fs::write(
        env.confdir().join("11-inbound-copy.json"),
        r#"{"inbounds": [{"tag": "ss1", "port": 8388, "protocol": "shadowsocks"}]}"#,
    )
    .unwrap();

    let report = m.validate_config().unwrap();
    assert_eq!(report.fragments, 8);
    assert!(report.external);
    let all = report.warnings.join("\n");
    assert!(all.contains("notes.json"), "{all}");
    assert!(all.contains("duplicate inbound tag 'ss1'"), "{all}");
    assert!(all.contains("port 8388"), "{all}");

    assert!(env.rejecting().validate_config().is_err());
}

#[test]
fn committed_mutations_notify_and_journal() {
    let env = Env::new();
    let counter = CountingNotifier::default();
    let mut cfg = env.config();
    cfg.log.journal = Some(env.dir.path().join("journal.log"));
    let m = Manager::new(cfg, Catalog::builtin().unwrap())
        .with_validator(SkipValidator)
        .with_probe(Busy(BTreeSet::new()))
        .with_notifier(counter.clone());

    m.add_protocol("ss", Some("ss1"), &port_opts(8388)).unwrap();
    m.update_protocol("ss1", &UpdateOptions::default()).unwrap();
    for port in [9000, 9001] {
        m.update_protocol("ss1", &UpdateOptions { port: Some(port), ..Default::default() }).unwrap();
    }
    m.remove_protocol("ss1").unwrap();
    assert_eq!(counter.0.get(), 4);

    let journal = fs::read_to_string(env.dir.path().join("journal.log")).unwrap();
    let lines: Vec<&str> = journal.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].ends_with("add tag=ss1 type=shadowsocks"));
    assert!(lines[1].ends_with("update tag=ss1 keys=port port=9000"));
    assert!(lines[2].ends_with("update tag=ss1 keys=port port=9001"));
    assert!(lines[3].ends_with("remove tag=ss1 files=1"));
}
