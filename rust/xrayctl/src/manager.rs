//! Protocol units on top of the fragment store.
//!
//! Every mutation runs as one [`Transaction`]:
//! `Idle -> BackedUp -> Mutated -> Validated -> Committed`, or
//! `RolledBack` from any point after the snapshot. Input and state errors
//! are raised before the snapshot is taken.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

use crate::{
    backup::{BackupEntry, BackupStore, Manifest},
    catalog::{Catalog, ProtocolDescriptor, ProtocolFamily, DEFAULT_REALITY_DEST},
    config::Config,
    error::ConfError,
    fragments::{self, Category, FragmentMeta, FragmentName, FragmentStore},
    keys,
    lock::MutationLock,
    logging,
    notify::{self, Notifier},
    ports::{PortAllocator, PortProbe, SystemProbe},
    share,
    template::{self, Credential, RealityParams, TemplateParams, TlsParams, TransportParams},
    validator::{self, Validator},
};

const DEFAULT_PASSWORD_LEN: usize = 24;
const SHORT_ID_BYTES: usize = 4;

/// Shared fragments laid down by [`Manager::initialize`].
const SHARED_FRAGMENTS: &[(u8, Category, &str, &str)] = &[
    (0, Category::Base, "system", "base_system"),
    (1, Category::Dns, "default", "dns_default"),
    (20, Category::Outbound, "direct", "outbound_direct"),
    (21, Category::Outbound, "block", "outbound_block"),
    (90, Category::Routing, "basic", "routing_basic"),
];

// --- options -----------------------------------------------------------------

/// Caller-supplied knobs for a new unit. Anything left empty is defaulted or generated.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolOptions {
    pub port: Option<u16>,
    pub uuid: Option<String>,
    pub password: Option<String>,
    pub method: Option<String>,
    pub transport: Option<String>,
    pub path: Option<String>,
    pub host: Option<String>,
    pub domain: Option<String>,
    /// REALITY target, `host` or `host:port`.
    pub dest: Option<String>,
    pub server_name: Option<String>,
    pub private_key: Option<String>,
    pub short_id: Option<String>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// `port` is numeric; everything else is taken as a string.
fn pairs_to_map(pairs: &[(String, String)], json_extra: bool, known: &[&str]) -> Result<Map<String, Value>, ConfError> {
    let mut m = Map::new();
    for (k, v) in pairs {
        let k = k.trim();
        if k.is_empty() {
            return Err(ConfError::invalid("options", "empty key"));
        }
        let value = if k == "port" {
            let p: u64 = v
                .trim()
                .parse()
                .map_err(|_| ConfError::invalid("port", format!("'{v}' is not a number")))?;
            Value::from(p)
        } else if json_extra && !known.contains(&k) {
            serde_json::from_str(v).unwrap_or_else(|_| Value::String(v.clone()))
        } else {
            Value::String(v.clone())
        };
        m.insert(k.to_string(), value);
    }
    Ok(m)
}

impl ProtocolOptions {
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self, ConfError> {
        let m = pairs_to_map(pairs, false, &[])?;
        serde_json::from_value(Value::Object(m)).map_err(|e| ConfError::invalid("options", e.to_string()))
    }
}

/// Recognized keys get schema-aware patches. The rest are merged verbatim
/// into the unit's inbound object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateOptions {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UpdateOptions {
    /// Extra values are parsed as JSON when they parse, else kept as strings.
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self, ConfError> {
        let m = pairs_to_map(pairs, true, &["password", "uuid", "path"])?;
        serde_json::from_value(Value::Object(m)).map_err(|e| ConfError::invalid("options", e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.port.is_none()
            && self.password.is_none()
            && self.uuid.is_none()
            && self.path.is_none()
            && self.extra.is_empty()
    }
}

// --- views -------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    /// Matches a catalog protocol.
    Configured,
    /// Hand-written inbound this tool can list but not share.
    Custom,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtocolInfo {
    pub tag: String,
    #[serde(rename = "type")]
    pub protocol_type: String,
    pub port: u16,
    pub file: PathBuf,
    pub settings: Map<String, Value>,
    pub status: UnitStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub fragments: usize,
    pub warnings: Vec<String>,
    pub external: bool,
}

// --- transaction -------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    BackedUp,
    Mutated,
    Validated,
    Committed,
    RolledBack,
}

/// One mutation: snapshot, change, validate, then commit or roll back.
///
/// A failed snapshot is logged and the mutation proceeds without one.
struct Transaction<'a> {
    backups: &'a BackupStore,
    op: String,
    state: TxState,
    snapshot: Option<PathBuf>,
    history: Vec<TxState>,
}

impl<'a> Transaction<'a> {
    fn begin(backups: &'a BackupStore, op: String) -> Self {
        let snapshot = match backups.snapshot() {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("tx: op={op} snapshot failed, continuing without rollback: {e:#}");
                None
            }
        };
        let mut tx = Self { backups, op, state: TxState::Idle, snapshot, history: vec![TxState::Idle] };
        tx.advance(TxState::BackedUp);
        tx
    }

    fn advance(&mut self, next: TxState) {
        debug!("tx: op={} {:?} -> {:?}", self.op, self.state, next);
        self.state = next;
        self.history.push(next);
    }

    fn commit(&mut self) {
        if let Some(p) = self.snapshot.take() {
            self.backups.discard(&p);
        }
        self.advance(TxState::Committed);
        debug!("tx: op={} done {:?}", self.op, self.history);
    }

    fn rollback(&mut self, cause: &anyhow::Error) {
        warn!("tx: op={} failed in {:?}: {cause:#}", self.op, self.state);
        match self.snapshot.take() {
            Some(p) => {
                if let Err(e) = self.backups.rollback(&p) {
                    error!("tx: op={} rollback failed, snapshot kept at {}: {e:#}", self.op, p.display());
                } else {
                    self.backups.discard(&p);
                }
            }
            None => error!("tx: op={} no snapshot to roll back to", self.op),
        }
        self.advance(TxState::RolledBack);
        debug!("tx: op={} done {:?}", self.op, self.history);
    }
}

// --- manager -----------------------------------------------------------------

pub struct Manager {
    config: Config,
    catalog: Catalog,
    store: FragmentStore,
    backups: BackupStore,
    validator: Box<dyn Validator>,
    probe: Box<dyn PortProbe>,
    notifier: Box<dyn Notifier>,
}

impl Manager {
    /// Real validator, probe and notifier as the config describes them.
    pub fn new(config: Config, catalog: Catalog) -> Self {
        Self {
            store: FragmentStore::new(config.confdir.clone()),
            backups: BackupStore::from_config(&config),
            validator: validator::from_config(&config),
            probe: Box::new(SystemProbe),
            notifier: notify::from_config(&config),
            catalog,
            config,
        }
    }

    pub fn with_validator(mut self, v: impl Validator + 'static) -> Self {
        self.validator = Box::new(v);
        self
    }

    pub fn with_probe(mut self, p: impl PortProbe + 'static) -> Self {
        self.probe = Box::new(p);
        self
    }

    pub fn with_notifier(mut self, n: impl Notifier + 'static) -> Self {
        self.notifier = Box::new(n);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn store(&self) -> &FragmentStore {
        &self.store
    }

    /// Run `mutate` inside a transaction. The caller holds the lock.
    fn transact<T>(&self, op: String, mutate: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut tx = Transaction::begin(&self.backups, op);
        let res = self.run_tx(&mut tx, mutate);
        match res {
            Ok(v) => {
                tx.commit();
                logging::journal(self.config.log.journal.as_deref(), &tx.op);
                info!("{}", tx.op);
                if let Err(e) = self.notifier.notify() {
                    warn!("reload failed (change is committed): {e:#}");
                }
                Ok(v)
            }
            Err(e) => {
                tx.rollback(&e);
                Err(e)
            }
        }
    }

    fn run_tx<T>(&self, tx: &mut Transaction<'_>, mutate: impl FnOnce() -> Result<T>) -> Result<T> {
        let v = mutate()?;
        tx.advance(TxState::Mutated);
        self.validator.validate(self.store.dir())?;
        tx.advance(TxState::Validated);
        Ok(v)
    }

    fn lock(&self) -> Result<MutationLock> {
        MutationLock::acquire(&self.config.scratch_dir)
    }

    // --- Initialize ------------------------------------------------------------

    /// Create the confdir and any missing shared fragments. Existing files are left alone.
    pub fn initialize(&self) -> Result<Vec<PathBuf>> {
        let _lock = self.lock()?;
        self.store.ensure_dir()?;

        let mut missing: Vec<(FragmentName, &str)> = SHARED_FRAGMENTS
            .iter()
            .map(|&(prio, cat, name, tpl)| (FragmentName::with_priority(prio, cat, name), tpl))
            .collect();
        missing.push((FragmentName::routing_tail("tail"), "routing_tail"));
        missing.retain(|(name, _)| !self.store.path_of(name).exists());

        if missing.is_empty() {
            info!("init: confdir={} already initialized", self.store.dir().display());
            return Ok(Vec::new());
        }

        let files: Vec<String> = missing.iter().map(|(n, _)| n.file_name()).collect();
        self.transact(format!("init files={}", files.join(",")), || {
            let mut written = Vec::new();
            for (name, tpl) in &missing {
                let doc = template::render(tpl, &TemplateParams::default())?;
                written.push(self.store.create(name, &doc)?);
            }
            Ok(written)
        })
    }

    // --- AddProtocol -----------------------------------------------------------

    pub fn add_protocol(&self, protocol: &str, tag: Option<&str>, opts: &ProtocolOptions) -> Result<ProtocolInfo> {
        let desc = self.catalog.resolve(protocol)?;
        let _lock = self.lock()?;

        let tag = match tag.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => {
                fragments::validate_name(t)?;
                if let Some(path) = self.tag_owner(t)? {
                    return Err(ConfError::ConfigConflict { tag: t.to_string(), path }.into());
                }
                t.to_string()
            }
            None => self.derive_tag(desc.name)?,
        };

        self.check_add_options(desc, opts)?;

        let name = FragmentName::inbound(&tag);
        let op = format!("add tag={tag} type={}", desc.name);
        let path = self.transact(op, || {
            let mut params = self.build_params(desc, &tag, opts)?;
            let allocator = PortAllocator::new(&*self.probe, self.store.used_ports()?);
            params.port = allocator.suggest(desc.family, opts.port.unwrap_or(0))?;
            let doc = template::render(desc.template, &params)?;
            let path = self.store.create(&name, &doc)?;
            info!("add: tag={tag} port={} file={}", params.port, path.display());
            Ok(path)
        })?;
        debug!("add: committed {}", path.display());
        self.get_protocol_info(&tag)
    }

    /// Fragment already claiming `tag`, by content or by filename.
    fn tag_owner(&self, tag: &str) -> Result<Option<PathBuf>> {
        if let Some(m) = self.store.find_by_tag(tag)?.into_iter().next() {
            return Ok(Some(m.path));
        }
        let p = self.store.path_of(&FragmentName::inbound(tag));
        Ok(p.exists().then_some(p))
    }

    /// `name`, then `name-2`, `name-3`, ...
    fn derive_tag(&self, base: &str) -> Result<String> {
        if self.tag_owner(base)?.is_none() {
            return Ok(base.to_string());
        }
        for n in 2..1000 {
            let candidate = format!("{base}-{n}");
            if self.tag_owner(&candidate)?.is_none() {
                return Ok(candidate);
            }
        }
        Err(ConfError::invalid("tag", format!("no free tag derived from '{base}'")).into())
    }

    /// Shape checks that must fail before the snapshot.
    fn check_add_options(&self, desc: &ProtocolDescriptor, opts: &ProtocolOptions) -> Result<(), ConfError> {
        let mut settings = self.catalog.default_settings(desc.name)?;
        if let Some(p) = opts.port {
            settings.insert("port".into(), Value::from(p));
        }
        if let Some(d) = &opts.domain {
            settings.insert("domain".into(), Value::from(d.clone()));
        }
        if let Some(t) = &opts.transport {
            settings.insert("transport".into(), Value::from(t.clone()));
        }
        if let Some(m) = &opts.method {
            settings.insert("method".into(), Value::from(m.clone()));
        }
        self.catalog.validate_settings(desc.name, &settings)?;

        if let Some(u) = &opts.uuid {
            if !desc.uses_uuid() {
                return Err(ConfError::invalid("uuid", format!("{} authenticates by password", desc.name)));
            }
            check_uuid(u)?;
        }
        if let Some(p) = &opts.password {
            if desc.uses_uuid() {
                return Err(ConfError::invalid("password", format!("{} authenticates by uuid", desc.name)));
            }
            check_password(desc, &method_for(desc, opts), p)?;
        }
        if let Some(p) = &opts.path {
            if !desc.family.uses_path() {
                return Err(ConfError::invalid("path", format!("{} has no path", desc.name)));
            }
            check_path(p)?;
        }
        if desc.family == ProtocolFamily::Reality {
            if let Some(d) = &opts.dest {
                split_dest(d)?;
            }
            if let Some(k) = &opts.private_key {
                keys::x25519_public_from_private(k)
                    .map_err(|e| ConfError::invalid("private_key", format!("{e:#}")))?;
            }
            if let Some(s) = &opts.short_id {
                if s.len() > 16 || s.len() % 2 != 0 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(ConfError::invalid("short_id", "expected up to 16 hex chars, even length"));
                }
            }
        }
        Ok(())
    }

    /// Explicit options first, then descriptor defaults, then generated secrets.
    fn build_params(&self, desc: &ProtocolDescriptor, tag: &str, opts: &ProtocolOptions) -> Result<TemplateParams> {
        let defaults = self.catalog.default_settings(desc.name)?;
        let default_str = |k: &str| defaults.get(k).and_then(Value::as_str).map(str::to_string);

        let mut p = TemplateParams { tag: tag.to_string(), ..Default::default() };

        p.credential = Some(if desc.uses_uuid() {
            Credential::Uuid(opts.uuid.clone().unwrap_or_else(keys::uuid_v4))
        } else {
            let method = method_for(desc, opts);
            let pw = match &opts.password {
                Some(pw) => pw.clone(),
                None if desc.family == ProtocolFamily::Shadowsocks2022 => keys::ss2022_key(&method)?,
                None => keys::password(DEFAULT_PASSWORD_LEN),
            };
            if matches!(desc.family, ProtocolFamily::Shadowsocks | ProtocolFamily::Shadowsocks2022) {
                p.method = Some(method);
            }
            Credential::Password(pw)
        });

        if desc.family.uses_path() {
            p.transport = Some(TransportParams {
                path: opts.path.clone().or_else(|| default_str("path")).unwrap_or_else(|| "/".into()),
                host: opts.host.clone(),
            });
        }

        if desc.family.is_tls_fronted() {
            let domain = opts
                .domain
                .clone()
                .ok_or_else(|| ConfError::invalid("domain", format!("{} requires a domain", desc.name)))?;
            let cert_dir = &self.config.cert_dir;
            let cert = opts.cert_file.clone().unwrap_or_else(|| cert_dir.join(format!("{domain}.crt")));
            let key = opts.key_file.clone().unwrap_or_else(|| cert_dir.join(format!("{domain}.key")));
            p.tls = Some(TlsParams {
                domain,
                cert_file: cert.to_string_lossy().into_owned(),
                key_file: key.to_string_lossy().into_owned(),
            });
        }

        if desc.family == ProtocolFamily::Reality {
            let (dest, dest_port) = match &opts.dest {
                Some(d) => split_dest(d)?,
                None => (DEFAULT_REALITY_DEST.to_string(), 443),
            };
            let private_key = match &opts.private_key {
                Some(k) => k.clone(),
                None => keys::x25519_pair().private_key,
            };
            p.reality = Some(RealityParams {
                server_name: opts.server_name.clone().unwrap_or_else(|| dest.clone()),
                dest,
                dest_port,
                private_key,
                short_id: opts.short_id.clone().unwrap_or_else(|| keys::short_id(SHORT_ID_BYTES)),
            });
        }
        Ok(p)
    }

    // --- RemoveProtocol --------------------------------------------------------

    /// Delete every fragment that references `tag`, all or nothing.
    pub fn remove_protocol(&self, tag: &str) -> Result<Vec<PathBuf>> {
        let _lock = self.lock()?;
        let metas = self.store.find_by_tag(tag)?;
        if metas.is_empty() {
            return Err(ConfError::TagNotFound { tag: tag.to_string() }.into());
        }
        let paths: Vec<PathBuf> = metas.iter().map(|m| m.path.clone()).collect();
        self.transact(format!("remove tag={tag} files={}", metas.len()), || {
            self.store
                .remove(&metas)
                .with_context(|| format!("remove unit '{tag}'"))?;
            Ok(())
        })?;
        Ok(paths)
    }

    // --- UpdateProtocol --------------------------------------------------------

    pub fn update_protocol(&self, tag: &str, opts: &UpdateOptions) -> Result<ProtocolInfo> {
        check_update_shape(opts)?;
        let _lock = self.lock()?;

        let (meta, doc) = self.primary_fragment(tag)?;
        let patched = self.patch_document(&doc, tag, opts)?;
        if patched == doc {
            debug!("update: tag={tag} nothing to change");
            return self.get_protocol_info(tag);
        }

        self.transact(update_summary(tag, opts), || {
            self.store.rewrite(&meta, &patched)
        })?;
        self.get_protocol_info(tag)
    }

    /// The fragment holding the inbound tagged `tag`, preferring the inbound category.
    fn primary_fragment(&self, tag: &str) -> Result<(FragmentMeta, Value)> {
        let mut found: Option<(FragmentMeta, Value)> = None;
        for meta in self.store.find_by_tag(tag)? {
            let doc = self.store.read(&meta)?;
            if !inbounds_of(&doc).any(|ib| inbound_tag(ib) == Some(tag)) {
                continue;
            }
            let better = match &found {
                None => true,
                Some((m, _)) => m.name.category != Category::Inbound && meta.name.category == Category::Inbound,
            };
            if better {
                found = Some((meta, doc));
            }
        }
        found.ok_or_else(|| ConfError::TagNotFound { tag: tag.to_string() }.into())
    }

    fn patch_document(&self, doc: &Value, tag: &str, opts: &UpdateOptions) -> Result<Value> {
        let mut out = doc.clone();
        let inbounds = out
            .get_mut("inbounds")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| ConfError::TagNotFound { tag: tag.to_string() })?;

        if let Some(port) = opts.port {
            let current: BTreeSet<u16> = inbounds.iter().filter_map(fragments::inbound_port).collect();
            if !current.contains(&port) {
                let mut reserved = self.store.used_ports()?;
                for p in &current {
                    reserved.remove(p);
                }
                let allocator = PortAllocator::new(&*self.probe, reserved);
                if !allocator.is_available(port) {
                    return Err(ConfError::PortUnavailable { port }.into());
                }
            }
            for ib in inbounds.iter_mut() {
                if let Some(o) = ib.as_object_mut() {
                    o.insert("port".into(), Value::from(port));
                }
            }
        }

        if let Some(uuid) = &opts.uuid {
            let mut hit = false;
            for client in clients_mut(inbounds) {
                if client.contains_key("id") {
                    client.insert("id".into(), Value::from(uuid.clone()));
                    hit = true;
                }
            }
            if !hit {
                return Err(ConfError::invalid("uuid", format!("unit '{tag}' has no uuid clients")).into());
            }
        }

        if let Some(pw) = &opts.password {
            let mut hit = false;
            for ib in inbounds.iter_mut() {
                let Some(settings) = ib.get_mut("settings").and_then(Value::as_object_mut) else {
                    continue;
                };
                if settings.contains_key("password") {
                    let method = settings.get("method").and_then(Value::as_str).unwrap_or("");
                    if keys::ss2022_key_len(method).is_some() {
                        keys::check_ss2022_key(method, pw)?;
                    }
                    settings.insert("password".into(), Value::from(pw.clone()));
                    hit = true;
                }
            }
            for client in clients_mut(inbounds) {
                if client.contains_key("password") {
                    client.insert("password".into(), Value::from(pw.clone()));
                    hit = true;
                }
            }
            if !hit {
                return Err(ConfError::invalid("password", format!("unit '{tag}' has no password")).into());
            }
        }

        if let Some(path) = &opts.path {
            let mut hit = false;
            for ib in inbounds.iter_mut() {
                for key in ["wsSettings", "httpupgradeSettings"] {
                    if let Some(t) = ib
                        .get_mut("streamSettings")
                        .and_then(|s| s.get_mut(key))
                        .and_then(Value::as_object_mut)
                    {
                        t.insert("path".into(), Value::from(path.clone()));
                        hit = true;
                    }
                }
            }
            if !hit {
                return Err(ConfError::invalid("path", format!("unit '{tag}' has no ws/httpupgrade transport")).into());
            }
        }

        if !opts.extra.is_empty() {
            let target = inbounds
                .iter_mut()
                .find(|ib| inbound_tag(ib) == Some(tag))
                .and_then(Value::as_object_mut)
                .ok_or_else(|| ConfError::TagNotFound { tag: tag.to_string() })?;
            for (k, v) in &opts.extra {
                target.insert(k.clone(), v.clone());
            }
        }
        Ok(out)
    }

    // --- ListProtocols / GetProtocolInfo ---------------------------------------

    /// Every tagged inbound, in load order.
    pub fn list_protocols(&self) -> Result<Vec<ProtocolInfo>> {
        Ok(self
            .store
            .inbounds()?
            .into_iter()
            .filter_map(|(meta, ib)| {
                let tag = inbound_tag(&ib)?.to_string();
                Some(self.info_for(tag, &meta, &ib))
            })
            .collect())
    }

    pub fn get_protocol_info(&self, tag: &str) -> Result<ProtocolInfo> {
        let (meta, ib) = self.find_inbound(tag)?;
        Ok(self.info_for(tag.to_string(), &meta, &ib))
    }

    fn find_inbound(&self, tag: &str) -> Result<(FragmentMeta, Value)> {
        self.store
            .inbounds()?
            .into_iter()
            .find(|(_, ib)| inbound_tag(ib) == Some(tag))
            .ok_or_else(|| ConfError::TagNotFound { tag: tag.to_string() }.into())
    }

    fn info_for(&self, tag: String, meta: &FragmentMeta, ib: &Value) -> ProtocolInfo {
        let desc = self.catalog.identify(ib);
        ProtocolInfo {
            tag,
            protocol_type: desc
                .map(|d| d.name.to_string())
                .or_else(|| ib.get("protocol").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| "unknown".into()),
            port: fragments::inbound_port(ib).unwrap_or(0),
            file: meta.path.clone(),
            settings: settings_bag(ib),
            status: if desc.is_some() { UnitStatus::Configured } else { UnitStatus::Custom },
        }
    }

    // --- GenerateShareURL ------------------------------------------------------

    pub fn generate_share_url(&self, tag: &str) -> Result<String> {
        let (_, ib) = self.find_inbound(tag)?;
        let desc = self.catalog.identify(&ib).ok_or_else(|| ConfError::ProtocolNotSupported {
            name: format!("custom inbound '{tag}'"),
        })?;
        let host = share::resolve_host(desc, &ib, self.config.public_host.as_deref())?;
        share::share_url(desc, &ib, &host).with_context(|| format!("share link for '{tag}'"))
    }

    // --- BackupConfig / RestoreConfig ------------------------------------------

    pub fn backup_config(&self, path: Option<&Path>) -> Result<PathBuf> {
        let archive = self.backups.backup(path)?;
        logging::journal(self.config.log.journal.as_deref(), &format!("backup file={}", archive.display()));
        Ok(archive)
    }

    /// Replace the confdir with an archive. The safety copy lives in `safety_dir`.
    pub fn restore_config(&self, archive: &Path) -> Result<Manifest> {
        let _lock = self.lock()?;
        let manifest = self.backups.restore(archive)?;
        logging::journal(
            self.config.log.journal.as_deref(),
            &format!("restore file={} tags={}", archive.display(), manifest.protocols.join(",")),
        );
        if let Err(e) = self.notifier.notify() {
            warn!("reload failed (restore is done): {e:#}");
        }
        Ok(manifest)
    }

    pub fn list_backups(&self) -> Result<Vec<BackupEntry>> {
        self.backups.list()
    }

    // --- ValidateConfig --------------------------------------------------------

    /// Local consistency checks, then the external hook.
    pub fn validate_config(&self) -> Result<ValidationReport> {
        let scan = self.store.scan()?;
        let mut report = ValidationReport { fragments: scan.fragments.len(), ..Default::default() };

        for p in &scan.ignored {
            report.warnings.push(format!("ignored: {} does not follow NN-category-name.json", p.display()));
        }

        let mut tags: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut ports: BTreeMap<u16, Vec<String>> = BTreeMap::new();
        for meta in &scan.fragments {
            let file = meta.name.file_name();
            let doc = match self.store.read(meta) {
                Ok(d) => d,
                Err(e) => {
                    report.warnings.push(format!("unreadable: {e:#}"));
                    continue;
                }
            };
            for ib in inbounds_of(&doc) {
                if let Some(t) = inbound_tag(ib) {
                    tags.entry(t.to_string()).or_default().push(file.clone());
                }
                if let Some(p) = fragments::inbound_port(ib) {
                    ports.entry(p).or_default().push(file.clone());
                }
            }
        }
        for (t, files) in tags.iter().filter(|(_, f)| f.len() > 1) {
            report.warnings.push(format!("duplicate inbound tag '{t}' in {}", files.join(", ")));
        }
        for (p, files) in ports.iter().filter(|(_, f)| f.len() > 1) {
            report.warnings.push(format!("port {p} declared by {}", files.join(", ")));
        }
        for w in &report.warnings {
            warn!("validate: {w}");
        }

        self.validator.validate(self.store.dir())?;
        report.external = true;
        Ok(report)
    }
}

// --- helpers -----------------------------------------------------------------

fn inbounds_of(doc: &Value) -> impl Iterator<Item = &Value> {
    doc.get("inbounds").and_then(Value::as_array).into_iter().flatten()
}

fn inbound_tag(ib: &Value) -> Option<&str> {
    ib.get("tag").and_then(Value::as_str)
}

fn clients_mut(inbounds: &mut [Value]) -> impl Iterator<Item = &mut Map<String, Value>> {
    inbounds
        .iter_mut()
        .filter_map(|ib| ib.pointer_mut("/settings/clients").and_then(Value::as_array_mut))
        .flatten()
        .filter_map(Value::as_object_mut)
}

fn method_for(desc: &ProtocolDescriptor, opts: &ProtocolOptions) -> String {
    match (&opts.method, desc.family) {
        (Some(m), _) => m.clone(),
        (None, ProtocolFamily::Shadowsocks2022) => crate::catalog::DEFAULT_SS2022_METHOD.to_string(),
        (None, _) => crate::catalog::DEFAULT_SS_METHOD.to_string(),
    }
}

fn check_uuid(u: &str) -> Result<(), ConfError> {
    if keys::is_uuid(u) {
        Ok(())
    } else {
        Err(ConfError::invalid("uuid", format!("'{u}' is not a UUID")))
    }
}

fn check_path(p: &str) -> Result<(), ConfError> {
    if p.starts_with('/') && !p.chars().any(char::is_whitespace) {
        Ok(())
    } else {
        Err(ConfError::invalid("path", format!("'{p}' must start with '/' and contain no spaces")))
    }
}

fn check_password(desc: &ProtocolDescriptor, method: &str, pw: &str) -> Result<(), ConfError> {
    if desc.family == ProtocolFamily::Shadowsocks2022 {
        return keys::check_ss2022_key(method, pw);
    }
    if pw.chars().count() < keys::MIN_PASSWORD_LEN {
        return Err(ConfError::invalid(
            "password",
            format!("at least {} characters required", keys::MIN_PASSWORD_LEN),
        ));
    }
    Ok(())
}

/// Per-key checks that need no disk access. 2022 key sizing is checked
/// against the unit's cipher while patching.
fn check_update_shape(opts: &UpdateOptions) -> Result<(), ConfError> {
    if opts.port == Some(0) {
        return Err(ConfError::invalid("port", "0 is not in 1-65535"));
    }
    if let Some(u) = &opts.uuid {
        check_uuid(u)?;
    }
    if let Some(p) = &opts.path {
        check_path(p)?;
    }
    if let Some(pw) = &opts.password {
        // 2022 keys are base64 of 16+ bytes, so the length floor holds for them too.
        if pw.chars().count() < keys::MIN_PASSWORD_LEN {
            return Err(ConfError::invalid(
                "password",
                format!("at least {} characters required", keys::MIN_PASSWORD_LEN),
            ));
        }
    }
    if opts.extra.contains_key("tag") {
        return Err(ConfError::invalid("tag", "a unit's tag cannot be changed by update"));
    }
    Ok(())
}

fn update_keys(opts: &UpdateOptions) -> Vec<&str> {
    let mut keys = Vec::new();
    for (k, set) in [
        ("port", opts.port.is_some()),
        ("password", opts.password.is_some()),
        ("uuid", opts.uuid.is_some()),
        ("path", opts.path.is_some()),
    ] {
        if set {
            keys.push(k);
        }
    }
    keys.extend(opts.extra.keys().map(String::as_str));
    keys
}

/// Journal line for an update. Secrets are named, never printed.
fn update_summary(tag: &str, opts: &UpdateOptions) -> String {
    let mut line = format!("update tag={tag} keys={}", update_keys(opts).join(","));
    if let Some(port) = opts.port {
        line.push_str(&format!(" port={port}"));
    }
    if let Some(path) = &opts.path {
        line.push_str(&format!(" path={path}"));
    }
    line
}

/// `host[:port]`, port defaulting to 443.
fn split_dest(d: &str) -> Result<(String, u16), ConfError> {
    let d = d.trim();
    let (host, port) = match d.rsplit_once(':') {
        Some((h, p)) if !h.contains(':') => {
            let port: u16 = p
                .parse()
                .ok()
                .filter(|&p| p != 0)
                .ok_or_else(|| ConfError::invalid("dest", format!("bad port in '{d}'")))?;
            (h, port)
        }
        _ => (d, 443),
    };
    if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(ConfError::invalid("dest", format!("'{d}' is not a host")));
    }
    Ok((host.to_string(), port))
}

/// Flat view of the fields this tool reads or writes in an inbound.
fn settings_bag(ib: &Value) -> Map<String, Value> {
    let mut m = Map::new();
    let mut put = |k: &str, v: Option<&Value>| {
        if let Some(v) = v.filter(|v| !v.is_null()) {
            m.insert(k.to_string(), v.clone());
        }
    };
    put("listen", ib.get("listen"));
    put("protocol", ib.get("protocol"));
    put("transport", ib.pointer("/streamSettings/network"));
    put("security", ib.pointer("/streamSettings/security"));
    put("uuid", ib.pointer("/settings/clients/0/id"));
    put("flow", ib.pointer("/settings/clients/0/flow"));
    put(
        "password",
        ib.pointer("/settings/clients/0/password").or_else(|| ib.pointer("/settings/password")),
    );
    put("method", ib.pointer("/settings/method"));
    for t in ["wsSettings", "httpupgradeSettings"] {
        put("path", ib.pointer(&format!("/streamSettings/{t}/path")));
        put("host", ib.pointer(&format!("/streamSettings/{t}/host")));
    }
    put("domain", ib.pointer("/streamSettings/tlsSettings/serverName"));
    put("cert_file", ib.pointer("/streamSettings/tlsSettings/certificates/0/certificateFile"));
    put("key_file", ib.pointer("/streamSettings/tlsSettings/certificates/0/keyFile"));
    put("server_name", ib.pointer("/streamSettings/realitySettings/serverNames/0"));
    put("private_key", ib.pointer("/streamSettings/realitySettings/privateKey"));
    put("short_id", ib.pointer("/streamSettings/realitySettings/shortIds/0"));

    if let Some(dest) = ib.pointer("/streamSettings/realitySettings/dest").and_then(Value::as_str) {
        match split_dest(dest) {
            Ok((host, port)) => {
                m.insert("dest".into(), Value::from(host));
                m.insert("dest_port".into(), Value::from(port));
            }
            Err(_) => {
                m.insert("dest".into(), Value::from(dest));
            }
        }
    }
    if let Some(pk) = m.get("private_key").and_then(Value::as_str) {
        if let Ok(public) = keys::x25519_public_from_private(pk) {
            m.insert("public_key".into(), Value::from(public));
        }
    }

    // Other top-level inbound keys (sniffing, allocate, ...) as written.
    if let Some(obj) = ib.as_object() {
        for (k, v) in obj {
            if matches!(k.as_str(), "tag" | "port" | "settings" | "streamSettings") || m.contains_key(k) {
                continue;
            }
            m.insert(k.clone(), v.clone());
        }
    }
    m
}
