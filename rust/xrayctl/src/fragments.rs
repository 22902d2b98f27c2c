//! The confdir: one JSON fragment per file, named `{priority:02}-{category}-{name}[-tail].json`.
//!
//! This module is the only place that builds or parses fragment filenames.
//! Nothing here validates content; that happens a layer up.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde_json::Value;
use std::{
    collections::BTreeSet,
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::error::ConfError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Base,
    Dns,
    Inbound,
    Outbound,
    Routing,
}

impl Category {
    pub const ALL: [Category; 5] =
        [Category::Base, Category::Dns, Category::Inbound, Category::Outbound, Category::Routing];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Base => "base",
            Category::Dns => "dns",
            Category::Inbound => "inbound",
            Category::Outbound => "outbound",
            Category::Routing => "routing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }

    /// Reserved priority block. 99 inside routing is kept for tail rules.
    pub fn priority_range(self) -> (u8, u8) {
        match self {
            Category::Base | Category::Dns => (0, 9),
            Category::Inbound => (10, 19),
            Category::Outbound => (20, 29),
            Category::Routing => (90, 99),
        }
    }

    pub fn default_priority(self) -> u8 {
        match self {
            Category::Base => 0,
            Category::Dns => 1,
            Category::Inbound => 10,
            Category::Outbound => 20,
            Category::Routing => 90,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const TAIL_PRIORITY: u8 = 99;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentName {
    pub priority: u8,
    pub category: Category,
    pub name: String,
    /// Routing rules that load after every other routing fragment.
    pub tail: bool,
}

impl FragmentName {
    pub fn new(category: Category, name: &str) -> Self {
        Self::with_priority(category.default_priority(), category, name)
    }

    pub fn with_priority(priority: u8, category: Category, name: &str) -> Self {
        Self { priority, category, name: name.to_string(), tail: false }
    }

    pub fn inbound(tag: &str) -> Self {
        Self::new(Category::Inbound, tag)
    }

    pub fn routing_tail(name: &str) -> Self {
        Self { priority: TAIL_PRIORITY, category: Category::Routing, name: name.to_string(), tail: true }
    }

    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".json")?;
        let prio = stem.get(..2)?;
        let rest = stem.get(2..)?;
        if !prio.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let priority: u8 = prio.parse().ok()?;
        let rest = rest.strip_prefix('-')?;
        let (cat, name) = rest.split_once('-')?;
        let category = Category::parse(cat)?;
        if name.is_empty() {
            return None;
        }

        if category == Category::Routing {
            if name == "tail" {
                return Some(Self { priority, category, name: name.to_string(), tail: true });
            }
            if let Some(base) = name.strip_suffix("-tail").filter(|b| !b.is_empty()) {
                return Some(Self { priority, category, name: base.to_string(), tail: true });
            }
        }
        Some(Self { priority, category, name: name.to_string(), tail: false })
    }

    pub fn file_name(&self) -> String {
        if self.tail && self.category == Category::Routing && self.name != "tail" {
            format!("{:02}-{}-{}-tail.json", self.priority, self.category, self.name)
        } else {
            format!("{:02}-{}-{}.json", self.priority, self.category, self.name)
        }
    }
}

impl fmt::Display for FragmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentMeta {
    pub name: FragmentName,
    pub path: PathBuf,
}

/// Result of a directory scan: fragments in load order plus `*.json` files
/// whose names don't follow the grammar.
#[derive(Debug, Default)]
pub struct Scan {
    pub fragments: Vec<FragmentMeta>,
    pub ignored: Vec<PathBuf>,
}

/// Tag rules shared by every fragment name component.
pub fn validate_name(name: &str) -> Result<(), ConfError> {
    if name.is_empty() {
        return Err(ConfError::invalid("tag", "tag is empty"));
    }
    if name.len() > 64 {
        return Err(ConfError::invalid("tag", "tag longer than 64 characters"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')) {
        return Err(ConfError::invalid("tag", format!("'{name}' may only contain letters, digits, _ - .")));
    }
    if name.starts_with('.') {
        return Err(ConfError::invalid("tag", "tag may not start with '.'"));
    }
    Ok(())
}

/// Tags of every inbound and outbound entry in a fragment.
pub fn entry_tags(doc: &Value) -> impl Iterator<Item = &str> {
    ["inbounds", "outbounds"]
        .into_iter()
        .filter_map(move |k| doc.get(k).and_then(Value::as_array))
        .flatten()
        .filter_map(|e| e.get("tag").and_then(Value::as_str))
}

pub fn inbound_port(inbound: &Value) -> Option<u16> {
    inbound.get("port").and_then(Value::as_u64).and_then(|p| u16::try_from(p).ok())
}

#[derive(Debug, Clone)]
pub struct FragmentStore {
    dir: PathBuf,
}

impl FragmentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| format!("mkdir {}", self.dir.display()))
    }

    pub fn path_of(&self, name: &FragmentName) -> PathBuf {
        self.dir.join(name.file_name())
    }

    pub fn scan(&self) -> Result<Scan> {
        let mut scan = Scan::default();
        let rd = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(scan),
            Err(e) => return Err(e).with_context(|| format!("read dir {}", self.dir.display())),
        };

        for ent in rd.flatten() {
            let path = ent.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if !file_name.ends_with(".json") {
                continue;
            }
            match FragmentName::parse(file_name) {
                Some(name) => scan.fragments.push(FragmentMeta { name, path }),
                None => {
                    debug!("fragments: ignoring {}", path.display());
                    scan.ignored.push(path);
                }
            }
        }

        // Directory order is arbitrary: fix it by name, then order by priority (stable).
        scan.fragments.sort_by(|a, b| a.path.cmp(&b.path));
        scan.fragments.sort_by_key(|f| f.name.priority);
        scan.ignored.sort();
        Ok(scan)
    }

    /// Fragments in load order (non-decreasing priority).
    pub fn list(&self) -> Result<Vec<FragmentMeta>> {
        Ok(self.scan()?.fragments)
    }

    pub fn read(&self, meta: &FragmentMeta) -> Result<Value> {
        read_json(&meta.path)
    }

    /// Every fragment holding an inbound or outbound tagged `tag`.
    /// No index: each fragment is opened and parsed.
    pub fn find_by_tag(&self, tag: &str) -> Result<Vec<FragmentMeta>> {
        let mut out = Vec::new();
        for meta in self.list()? {
            let doc = match self.read(&meta) {
                Ok(v) => v,
                Err(e) => {
                    warn!("fragments: skip unreadable {}: {e:#}", meta.path.display());
                    continue;
                }
            };
            if entry_tags(&doc).any(|t| t == tag) {
                out.push(meta);
            }
        }
        Ok(out)
    }

    /// All inbounds on disk with the fragment they live in.
    pub fn inbounds(&self) -> Result<Vec<(FragmentMeta, Value)>> {
        let mut out = Vec::new();
        for meta in self.list()? {
            let doc = match self.read(&meta) {
                Ok(v) => v,
                Err(e) => {
                    warn!("fragments: skip unreadable {}: {e:#}", meta.path.display());
                    continue;
                }
            };
            if let Some(arr) = doc.get("inbounds").and_then(Value::as_array) {
                for ib in arr {
                    out.push((meta.clone(), ib.clone()));
                }
            }
        }
        Ok(out)
    }

    pub fn used_ports(&self) -> Result<BTreeSet<u16>> {
        Ok(self.inbounds()?.iter().filter_map(|(_, ib)| inbound_port(ib)).collect())
    }

    pub fn tags(&self) -> Result<Vec<String>> {
        let mut tags: Vec<String> = self
            .inbounds()?
            .iter()
            .filter_map(|(_, ib)| ib.get("tag").and_then(Value::as_str).map(str::to_string))
            .collect();
        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    /// Write (or overwrite) `{category default priority}-{category}-{name}.json`.
    pub fn write(&self, category: Category, name: &str, content: &Value) -> Result<PathBuf> {
        self.write_named(&FragmentName::new(category, name), content)
    }

    pub fn write_named(&self, name: &FragmentName, content: &Value) -> Result<PathBuf> {
        let path = self.path_of(name);
        write_json_pretty(&path, content)?;
        Ok(path)
    }

    /// Like `write_named`, but never replaces an existing file.
    pub fn create(&self, name: &FragmentName, content: &Value) -> Result<PathBuf> {
        let path = self.path_of(name);
        if path.exists() {
            return Err(ConfError::ConfigConflict { tag: name.name.clone(), path }.into());
        }
        write_json_pretty(&path, content)?;
        Ok(path)
    }

    pub fn rewrite(&self, meta: &FragmentMeta, content: &Value) -> Result<()> {
        write_json_pretty(&meta.path, content)
    }

    /// Stops at the first failure; the caller rolls back.
    pub fn remove(&self, fragments: &[FragmentMeta]) -> Result<()> {
        for f in fragments {
            fs::remove_file(&f.path).with_context(|| format!("remove {}", f.path.display()))?;
        }
        Ok(())
    }
}

pub fn read_json(p: &Path) -> Result<Value> {
    let txt = match fs::read_to_string(p) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfError::FileNotFound { path: p.to_path_buf() }.into())
        }
        Err(e) => return Err(e).with_context(|| format!("read {}", p.display())),
    };
    serde_json::from_str(&txt).with_context(|| format!("bad JSON {}", p.display()))
}

/// Serialize the way every fragment is written: pretty, trailing newline.
pub fn to_pretty(v: &Value) -> Result<String> {
    let mut txt = serde_json::to_string_pretty(v)?;
    txt.push('\n');
    Ok(txt)
}

/// tmp + rename so xray never sees a half-written fragment.
pub fn write_json_pretty(p: &Path, v: &Value) -> Result<()> {
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
    }
    let tmp = p.with_extension("json.tmp");
    let txt = to_pretty(v)?;
    fs::write(&tmp, txt.as_bytes()).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, p).with_context(|| format!("rename {} -> {}", tmp.display(), p.display()))?;
    Ok(())
}
