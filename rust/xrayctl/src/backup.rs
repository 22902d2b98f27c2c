//! Confdir archives: `backup-info.json` + `confs/` in a gzip tar.
//!
//! Used for user backups, for the safety copy taken before a restore, and
//! as the ephemeral snapshot a mutation rolls back to.

use anyhow::{Context, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::BTreeSet,
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{config::Config, error::ConfError, fragments::FragmentStore};

pub const MANIFEST_NAME: &str = "backup-info.json";
pub const CONFS_DIR: &str = "confs";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    /// Path under `confs/`, `/`-separated.
    pub name: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub timestamp: String,
    pub source_dir: PathBuf,
    pub protocols: Vec<String>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub manifest: Manifest,
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    confdir: PathBuf,
    backup_dir: PathBuf,
    scratch_dir: PathBuf,
    safety_dir: PathBuf,
}

/// Removed on drop, whichever way the restore went.
struct ScratchDir(PathBuf);

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("backup: failed to clean {}: {e}", self.0.display());
            }
        }
    }
}

fn unique_suffix() -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_nanos();
    format!("{}-{ts}", std::process::id())
}

fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Regular files under `root`, relative, sorted.
fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    if !root.is_dir() {
        return Ok(out);
    }
    let mut stack = vec![PathBuf::new()];
    while let Some(rel) = stack.pop() {
        let abs = root.join(&rel);
        for ent in fs::read_dir(&abs).with_context(|| format!("read dir {}", abs.display()))? {
            let ent = ent.with_context(|| format!("read dir {}", abs.display()))?;
            let ft = ent.file_type().with_context(|| format!("stat {}", ent.path().display()))?;
            let child = rel.join(ent.file_name());
            if ft.is_dir() {
                stack.push(child);
            } else if ft.is_file() {
                out.push(child);
            }
        }
    }
    out.sort();
    Ok(out)
}

fn rel_name(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if src.is_dir() {
        fs::create_dir_all(dst).with_context(|| format!("mkdir {}", dst.display()))?;
        for ent in fs::read_dir(src).with_context(|| format!("read dir {}", src.display()))? {
            let ent = ent.with_context(|| format!("read dir {}", src.display()))?;
            copy_tree(&ent.path(), &dst.join(ent.file_name()))?;
        }
    } else {
        fs::copy(src, dst).with_context(|| format!("copy {} -> {}", src.display(), dst.display()))?;
    }
    Ok(())
}

/// Make `dst` hold exactly what `src` holds. `dst` itself is kept (it may be a mount point).
fn replace_dir_contents(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("mkdir {}", dst.display()))?;
    for ent in fs::read_dir(dst).with_context(|| format!("read dir {}", dst.display()))? {
        let p = ent.with_context(|| format!("read dir {}", dst.display()))?.path();
        if p.is_dir() {
            fs::remove_dir_all(&p).with_context(|| format!("remove {}", p.display()))?;
        } else {
            fs::remove_file(&p).with_context(|| format!("remove {}", p.display()))?;
        }
    }
    if !src.is_dir() {
        return Ok(());
    }
    for ent in fs::read_dir(src).with_context(|| format!("read dir {}", src.display()))? {
        let ent = ent.with_context(|| format!("read dir {}", src.display()))?;
        let from = ent.path();
        let to = dst.join(ent.file_name());
        // rename fails across filesystems; fall back to copying.
        if fs::rename(&from, &to).is_err() {
            copy_tree(&from, &to)?;
        }
    }
    Ok(())
}

impl BackupStore {
    pub fn new(confdir: PathBuf, backup_dir: PathBuf, scratch_dir: PathBuf, safety_dir: PathBuf) -> Self {
        Self { confdir, backup_dir, scratch_dir, safety_dir }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.confdir.clone(),
            cfg.backup_dir.clone(),
            cfg.scratch_dir.clone(),
            cfg.safety_dir().to_path_buf(),
        )
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn default_archive_path(&self) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let mut p = self.backup_dir.join(format!("xray-backup-{stamp}.tar.gz"));
        let mut n = 1;
        while p.exists() {
            n += 1;
            p = self.backup_dir.join(format!("xray-backup-{stamp}-{n}.tar.gz"));
        }
        p
    }

    /// Archive the confdir. An empty/absent `path` means a timestamped file in `backup_dir`.
    pub fn backup(&self, path: Option<&Path>) -> Result<PathBuf> {
        let target = match path.filter(|p| !p.as_os_str().is_empty()) {
            Some(p) => p.to_path_buf(),
            None => self.default_archive_path(),
        };
        let manifest = self.write_archive(&target)?;
        info!(
            "backup: wrote {} files={} protocols={}",
            target.display(),
            manifest.files.len(),
            manifest.protocols.len()
        );
        Ok(target)
    }

    /// Ephemeral pre-mutation copy in `scratch_dir`.
    pub fn snapshot(&self) -> Result<PathBuf> {
        let target = self.scratch_dir.join(format!("snapshot-{}.tar.gz", unique_suffix()));
        self.write_archive(&target)?;
        debug!("backup: snapshot {}", target.display());
        Ok(target)
    }

    /// Put a snapshot back. No safety copy: the snapshot is the safety copy.
    pub fn rollback(&self, snapshot: &Path) -> Result<()> {
        self.apply_archive(snapshot)?;
        info!("backup: rolled back to {}", snapshot.display());
        Ok(())
    }

    pub fn discard(&self, snapshot: &Path) {
        if let Err(e) = fs::remove_file(snapshot) {
            warn!("backup: failed to remove snapshot {}: {e}", snapshot.display());
        }
    }

    fn write_archive(&self, target: &Path) -> Result<Manifest> {
        let err = |message: String| ConfError::Backup { path: target.to_path_buf(), message };

        let rels = collect_files(&self.confdir).map_err(|e| err(format!("{e:#}")))?;
        let mut files = Vec::with_capacity(rels.len());
        let mut blobs = Vec::with_capacity(rels.len());
        for rel in &rels {
            let abs = self.confdir.join(rel);
            let data = fs::read(&abs).map_err(|e| err(format!("read {}: {e}", abs.display())))?;
            files.push(FileEntry { name: rel_name(rel), size: data.len() as u64, sha256: sha256_hex(&data) });
            blobs.push(data);
        }

        let protocols = FragmentStore::new(&self.confdir).tags().unwrap_or_else(|e| {
            warn!("backup: could not collect tags from {}: {e:#}", self.confdir.display());
            Vec::new()
        });

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            timestamp: chrono::Utc::now().to_rfc3339(),
            source_dir: self.confdir.clone(),
            protocols,
            files,
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| err(format!("mkdir {}: {e}", parent.display())))?;
        }
        let tmp = target.with_extension("partial");
        let res = (|| -> Result<()> {
            let f = File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
            let mut tar = tar::Builder::new(GzEncoder::new(f, Compression::default()));
            let mtime = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::from_secs(0))
                .as_secs();

            let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
            append_bytes(&mut tar, MANIFEST_NAME, &manifest_bytes, mtime)?;

            let mut dir_header = tar::Header::new_gnu();
            dir_header.set_entry_type(tar::EntryType::Directory);
            dir_header.set_mode(0o755);
            dir_header.set_size(0);
            dir_header.set_mtime(mtime);
            dir_header.set_cksum();
            tar.append_data(&mut dir_header, format!("{CONFS_DIR}/"), std::io::empty())?;

            for (entry, data) in manifest.files.iter().zip(&blobs) {
                append_bytes(&mut tar, &format!("{CONFS_DIR}/{}", entry.name), data, mtime)?;
            }

            let gz = tar.into_inner()?;
            let f = gz.finish()?;
            f.sync_all()?;
            fs::rename(&tmp, target)
                .with_context(|| format!("rename {} -> {}", tmp.display(), target.display()))?;
            Ok(())
        })();

        if let Err(e) = res {
            let _ = fs::remove_file(&tmp);
            return Err(err(format!("{e:#}")).into());
        }
        Ok(manifest)
    }

    pub fn read_manifest(archive: &Path) -> Result<Manifest> {
        let f = File::open(archive).map_err(|e| open_error(archive, e))?;
        let mut ar = tar::Archive::new(GzDecoder::new(f));
        for entry in ar.entries().with_context(|| format!("read {}", archive.display()))? {
            let mut entry = entry.with_context(|| format!("read {}", archive.display()))?;
            if entry.path()?.as_os_str() == MANIFEST_NAME {
                let mut s = String::new();
                entry.read_to_string(&mut s)?;
                return parse_manifest(archive, &s);
            }
        }
        Err(ConfError::Backup { path: archive.to_path_buf(), message: format!("{MANIFEST_NAME} missing") }.into())
    }

    /// Replace the live confdir with the archive's content.
    ///
    /// A safety backup of the live directory is written to `safety_dir` first.
    /// If that fails the restore is aborted; if the swap fails the safety
    /// backup is put back. On success the safety backup is removed.
    pub fn restore(&self, archive: &Path) -> Result<Manifest> {
        let (scratch, manifest) = self.extract_verified(archive)?;

        let safety = self.safety_dir.join(format!("pre-restore-{}.tar.gz", unique_suffix()));
        self.write_archive(&safety).map_err(|e| ConfError::Backup {
            path: safety.clone(),
            message: format!("safety backup failed, restore aborted: {e:#}"),
        })?;
        info!("restore: safety backup {}", safety.display());

        if let Err(e) = replace_dir_contents(&scratch.0.join(CONFS_DIR), &self.confdir) {
            warn!("restore: swap failed ({e:#}); putting safety backup back");
            if let Err(e2) = self.apply_archive(&safety) {
                return Err(ConfError::Backup {
                    path: safety,
                    message: format!("restore failed ({e:#}) and recovery failed ({e2:#}); safety backup kept"),
                }
                .into());
            }
            let _ = fs::remove_file(&safety);
            return Err(e.context(format!("restore {}", archive.display())));
        }

        if let Err(e) = fs::remove_file(&safety) {
            warn!("restore: could not remove safety backup {}: {e}", safety.display());
        }
        info!(
            "restore: {} -> {} protocols={}",
            archive.display(),
            self.confdir.display(),
            manifest.protocols.join(",")
        );
        Ok(manifest)
    }

    fn apply_archive(&self, archive: &Path) -> Result<Manifest> {
        let (scratch, manifest) = self.extract_verified(archive)?;
        replace_dir_contents(&scratch.0.join(CONFS_DIR), &self.confdir)
            .with_context(|| format!("apply {}", archive.display()))?;
        Ok(manifest)
    }

    fn extract_verified(&self, archive: &Path) -> Result<(ScratchDir, Manifest)> {
        let berr = |message: String| ConfError::Backup { path: archive.to_path_buf(), message };

        let f = File::open(archive).map_err(|e| open_error(archive, e))?;
        let scratch = ScratchDir(self.scratch_dir.join(format!("extract-{}", unique_suffix())));
        fs::create_dir_all(&scratch.0).with_context(|| format!("mkdir {}", scratch.0.display()))?;

        let mut ar = tar::Archive::new(GzDecoder::new(f));
        let entries = ar.entries().map_err(|e| berr(format!("not a tar.gz archive: {e}")))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| berr(format!("corrupt archive: {e}")))?;
            let shown = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
            let unpacked = entry
                .unpack_in(&scratch.0)
                .map_err(|e| berr(format!("unpack {shown}: {e}")))?;
            if !unpacked {
                return Err(berr(format!("entry escapes archive root: {shown}")).into());
            }
        }

        let manifest_path = scratch.0.join(MANIFEST_NAME);
        let raw = fs::read_to_string(&manifest_path).map_err(|_| berr(format!("{MANIFEST_NAME} missing")))?;
        let manifest = parse_manifest(archive, &raw)?;

        let confs = scratch.0.join(CONFS_DIR);
        for fe in &manifest.files {
            let p = confs.join(&fe.name);
            let data = fs::read(&p).map_err(|_| berr(format!("{} listed but missing", fe.name)))?;
            if data.len() as u64 != fe.size || sha256_hex(&data) != fe.sha256 {
                return Err(berr(format!("{} does not match its checksum", fe.name)).into());
            }
        }

        let listed: BTreeSet<&str> = manifest.files.iter().map(|fe| fe.name.as_str()).collect();
        let unlisted: Vec<String> = collect_files(&confs)?
            .iter()
            .map(|rel| rel_name(rel))
            .filter(|name| !listed.contains(name.as_str()))
            .collect();
        if !unlisted.is_empty() {
            return Err(berr(format!("files not in {MANIFEST_NAME}: {}", unlisted.join(", "))).into());
        }
        Ok((scratch, manifest))
    }

    /// Archives in `backup_dir` with readable manifests, oldest first.
    pub fn list(&self) -> Result<Vec<BackupEntry>> {
        let rd = match fs::read_dir(&self.backup_dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read dir {}", self.backup_dir.display())),
        };
        let mut paths: Vec<PathBuf> = rd
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.to_string_lossy().ends_with(".tar.gz"))
            .collect();
        paths.sort();

        let mut out = Vec::new();
        for path in paths {
            match Self::read_manifest(&path) {
                Ok(manifest) => out.push(BackupEntry { path, manifest }),
                Err(e) => debug!("backup: skip {}: {e:#}", path.display()),
            }
        }
        Ok(out)
    }
}

fn open_error(archive: &Path, e: std::io::Error) -> anyhow::Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        ConfError::FileNotFound { path: archive.to_path_buf() }.into()
    } else {
        anyhow::Error::new(e).context(format!("open {}", archive.display()))
    }
}

fn parse_manifest(archive: &Path, raw: &str) -> Result<Manifest> {
    let manifest: Manifest = serde_json::from_str(raw).map_err(|e| ConfError::Backup {
        path: archive.to_path_buf(),
        message: format!("bad {MANIFEST_NAME}: {e}"),
    })?;
    if manifest.version == 0 || manifest.version > MANIFEST_VERSION {
        return Err(ConfError::Backup {
            path: archive.to_path_buf(),
            message: format!("unsupported manifest version {}", manifest.version),
        }
        .into());
    }
    Ok(manifest)
}

fn append_bytes<W: std::io::Write>(tar: &mut tar::Builder<W>, name: &str, data: &[u8], mtime: u64) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_cksum();
    tar.append_data(&mut header, name, data)
        .with_context(|| format!("append {name}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn store(root: &Path) -> BackupStore {
        BackupStore::from_config(&Config::rooted(root))
    }

    fn tree(dir: &Path) -> BTreeMap<String, Vec<u8>> {
        collect_files(dir)
            .unwrap()
            .into_iter()
            .map(|rel| (rel_name(&rel), fs::read(dir.join(&rel)).unwrap()))
            .collect()
    }

    fn seed(root: &Path) -> PathBuf {
        let confs = root.join("confs");
        fs::create_dir_all(confs.join("extra")).unwrap();
        fs::write(confs.join("00-base-system.json"), "{\"log\": {}}\n").unwrap();
        fs::write(confs.join("10-inbound-a.json"), r#"{"inbounds": [{"tag": "a", "port": 1234}]}"#).unwrap();
        fs::write(confs.join("extra/readme.txt"), "nested").unwrap();
        confs
    }

    #[test]
    fn backup_then_restore_reproduces_tree() {
        let dir = tempfile::tempdir().unwrap();
        let confs = seed(dir.path());
        let bs = store(dir.path());
        let before = tree(&confs);

        let archive = bs.backup(None).unwrap();
        assert!(archive.starts_with(dir.path().join("backups")));

        let m = BackupStore::read_manifest(&archive).unwrap();
        assert_eq!(m.protocols, ["a"]);
        assert_eq!(m.files.len(), 3);
        assert_eq!(m.version, MANIFEST_VERSION);

        fs::remove_file(confs.join("10-inbound-a.json")).unwrap();
        fs::write(confs.join("10-inbound-b.json"), "{}").unwrap();

        bs.restore(&archive).unwrap();
        assert_eq!(tree(&confs), before);

        // safety backup and scratch are gone
        let left: Vec<_> = fs::read_dir(dir.path().join("backups")).unwrap().flatten().collect();
        assert_eq!(left.len(), 1);
        let scratch_left = fs::read_dir(dir.path().join("scratch")).map(|rd| rd.count()).unwrap_or(0);
        assert_eq!(scratch_left, 0);
    }

    #[test]
    fn snapshot_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let confs = seed(dir.path());
        let bs = store(dir.path());
        let before = tree(&confs);

        let snap = bs.snapshot().unwrap();
        fs::write(confs.join("10-inbound-a.json"), "changed").unwrap();
        fs::write(confs.join("10-inbound-new.json"), "{}").unwrap();
        bs.rollback(&snap).unwrap();
        assert_eq!(tree(&confs), before);

        bs.discard(&snap);
        assert!(!snap.exists());
    }

    #[test]
    fn tampered_archive_is_rejected_and_live_dir_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let confs = seed(dir.path());
        let bs = store(dir.path());

        // Hand-built archive whose file doesn't match the manifest.
        let bad = dir.path().join("bad.tar.gz");
        {
            let manifest = Manifest {
                version: 1,
                timestamp: "2026-01-01T00:00:00Z".into(),
                source_dir: confs.clone(),
                protocols: vec![],
                files: vec![FileEntry { name: "10-inbound-x.json".into(), size: 2, sha256: "00".into() }],
            };
            let f = File::create(&bad).unwrap();
            let mut tar = tar::Builder::new(GzEncoder::new(f, Compression::default()));
            append_bytes(&mut tar, MANIFEST_NAME, &serde_json::to_vec(&manifest).unwrap(), 0).unwrap();
            append_bytes(&mut tar, "confs/10-inbound-x.json", b"{}", 0).unwrap();
            tar.into_inner().unwrap().finish().unwrap();
        }

        let before = tree(&confs);
        let err = bs.restore(&bad).unwrap_err();
        assert!(matches!(crate::error::find(&err), Some(ConfError::Backup { .. })), "{err:#}");
        assert_eq!(tree(&confs), before);

        // Checksums fine, but carries a fragment the manifest never mentions.
        let smuggled = dir.path().join("smuggled.tar.gz");
        {
            let manifest = Manifest {
                version: 1,
                timestamp: "2026-01-01T00:00:00Z".into(),
                source_dir: confs.clone(),
                protocols: vec![],
                files: vec![],
            };
            let f = File::create(&smuggled).unwrap();
            let mut tar = tar::Builder::new(GzEncoder::new(f, Compression::default()));
            append_bytes(&mut tar, MANIFEST_NAME, &serde_json::to_vec(&manifest).unwrap(), 0).unwrap();
            append_bytes(&mut tar, "confs/10-inbound-evil.json", b"{}", 0).unwrap();
            tar.into_inner().unwrap().finish().unwrap();
        }
        let err = bs.restore(&smuggled).unwrap_err();
        assert!(matches!(crate::error::find(&err), Some(ConfError::Backup { .. })), "{err:#}");
        assert!(format!("{err:#}").contains("10-inbound-evil.json"), "{err:#}");
        assert_eq!(tree(&confs), before);
    }

    #[test]
    fn missing_archive_and_future_version() {
        let dir = tempfile::tempdir().unwrap();
        let bs = store(dir.path());
        let err = bs.restore(&dir.path().join("nope.tar.gz")).unwrap_err();
        assert!(matches!(crate::error::find(&err), Some(ConfError::FileNotFound { .. })));

        let err = parse_manifest(Path::new("x"), r#"{"version": 9, "timestamp": "", "source_dir": "/", "protocols": []}"#)
            .unwrap_err();
        assert!(err.to_string().contains("version 9"));
    }

    #[test]
    fn list_reads_manifests() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path());
        let bs = store(dir.path());
        let a = bs.backup(None).unwrap();
        let b = bs.backup(Some(&dir.path().join("backups/manual.tar.gz"))).unwrap();
        fs::write(dir.path().join("backups/junk.tar.gz"), b"nope").unwrap();

        let listed: Vec<PathBuf> = bs.list().unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&a) && listed.contains(&b));
    }
}
