//! Static registry of the protocol units this tool knows how to create.
//!
//! The catalog is built once at startup and handed to the [`Manager`](crate::manager::Manager);
//! nothing here is process-global.

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::error::ConfError;

/// Template/port family. Decides which parameters have to be generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolFamily {
    Reality,
    WebSocketTls,
    HttpUpgrade,
    Shadowsocks,
    Shadowsocks2022,
}

impl ProtocolFamily {
    pub fn is_tls_fronted(self) -> bool {
        matches!(self, ProtocolFamily::WebSocketTls | ProtocolFamily::HttpUpgrade)
    }

    pub fn uses_path(self) -> bool {
        self.is_tls_fronted()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtocolDescriptor {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    /// Inbound `protocol` field as xray spells it.
    pub protocol: &'static str,
    pub family: ProtocolFamily,
    pub default_port: u16,
    pub requires_tls: bool,
    pub requires_domain: bool,
    pub transports: &'static [&'static str],
    pub template: &'static str,
    pub description: &'static str,
}

impl ProtocolDescriptor {
    pub fn default_transport(&self) -> &'static str {
        self.transports.first().copied().unwrap_or("tcp")
    }

    /// Whether the unit authenticates clients by UUID (vless/vmess) rather than password.
    pub fn uses_uuid(&self) -> bool {
        matches!(self.protocol, "vless" | "vmess")
    }
}

pub const DEFAULT_REALITY_DEST: &str = "www.microsoft.com";
pub const DEFAULT_SS_METHOD: &str = "aes-256-gcm";
pub const DEFAULT_SS2022_METHOD: &str = "2022-blake3-aes-128-gcm";

pub const SS_METHODS: &[&str] = &[
    "aes-128-gcm",
    "aes-256-gcm",
    "chacha20-poly1305",
    "chacha20-ietf-poly1305",
    "xchacha20-poly1305",
];

pub const SS2022_METHODS: &[&str] = &[
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "2022-blake3-chacha20-poly1305",
];

const BUILTIN: &[ProtocolDescriptor] = &[
    ProtocolDescriptor {
        name: "vless-reality",
        aliases: &["vr", "reality", "vless-r"],
        protocol: "vless",
        family: ProtocolFamily::Reality,
        default_port: 443,
        requires_tls: false,
        requires_domain: false,
        transports: &["tcp"],
        template: "vless_reality",
        description: "VLESS + XTLS Vision over REALITY, no certificate needed",
    },
    ProtocolDescriptor {
        name: "vless-ws-tls",
        aliases: &["vless-ws", "vw"],
        protocol: "vless",
        family: ProtocolFamily::WebSocketTls,
        default_port: 443,
        requires_tls: true,
        requires_domain: true,
        transports: &["ws"],
        template: "vless_ws_tls",
        description: "VLESS over WebSocket with TLS",
    },
    ProtocolDescriptor {
        name: "vless-httpupgrade",
        aliases: &["vless-hu", "vhu"],
        protocol: "vless",
        family: ProtocolFamily::HttpUpgrade,
        default_port: 443,
        requires_tls: true,
        requires_domain: true,
        transports: &["httpupgrade"],
        template: "vless_httpupgrade",
        description: "VLESS over HTTP upgrade with TLS",
    },
    ProtocolDescriptor {
        name: "vmess-ws-tls",
        aliases: &["vmess-ws", "vmess", "mw"],
        protocol: "vmess",
        family: ProtocolFamily::WebSocketTls,
        default_port: 443,
        requires_tls: true,
        requires_domain: true,
        transports: &["ws"],
        template: "vmess_ws_tls",
        description: "VMess over WebSocket with TLS",
    },
    ProtocolDescriptor {
        name: "vmess-httpupgrade",
        aliases: &["vmess-hu", "mhu"],
        protocol: "vmess",
        family: ProtocolFamily::HttpUpgrade,
        default_port: 443,
        requires_tls: true,
        requires_domain: true,
        transports: &["httpupgrade"],
        template: "vmess_httpupgrade",
        description: "VMess over HTTP upgrade with TLS",
    },
    ProtocolDescriptor {
        name: "trojan-ws-tls",
        aliases: &["trojan-ws", "trojan", "tw"],
        protocol: "trojan",
        family: ProtocolFamily::WebSocketTls,
        default_port: 443,
        requires_tls: true,
        requires_domain: true,
        transports: &["ws"],
        template: "trojan_ws_tls",
        description: "Trojan over WebSocket with TLS",
    },
    ProtocolDescriptor {
        name: "shadowsocks",
        aliases: &["ss"],
        protocol: "shadowsocks",
        family: ProtocolFamily::Shadowsocks,
        default_port: 8388,
        requires_tls: false,
        requires_domain: false,
        transports: &["tcp", "udp"],
        template: "shadowsocks",
        description: "Shadowsocks AEAD",
    },
    ProtocolDescriptor {
        name: "shadowsocks-2022",
        aliases: &["ss2022", "ss-2022"],
        protocol: "shadowsocks",
        family: ProtocolFamily::Shadowsocks2022,
        default_port: 8388,
        requires_tls: false,
        requires_domain: false,
        transports: &["tcp", "udp"],
        template: "shadowsocks_2022",
        description: "Shadowsocks 2022 (BLAKE3 key derivation)",
    },
];

#[derive(Debug, Clone)]
pub struct Catalog {
    descriptors: Vec<ProtocolDescriptor>,
    by_name: HashMap<String, usize>,
    by_alias: HashMap<String, usize>,
}

impl Catalog {
    pub fn builtin() -> Result<Self> {
        Self::new(BUILTIN.to_vec())
    }

    /// Fails if two descriptors share a name or an alias.
    pub fn new(descriptors: Vec<ProtocolDescriptor>) -> Result<Self> {
        let mut by_name = HashMap::new();
        let mut by_alias = HashMap::new();
        for (i, d) in descriptors.iter().enumerate() {
            if by_name.insert(d.name.to_ascii_lowercase(), i).is_some() {
                anyhow::bail!("duplicate protocol name in catalog: {}", d.name);
            }
        }
        for (i, d) in descriptors.iter().enumerate() {
            for a in d.aliases {
                let key = a.to_ascii_lowercase();
                if by_name.contains_key(&key) {
                    anyhow::bail!("alias '{a}' of {} shadows a protocol name", d.name);
                }
                if let Some(prev) = by_alias.insert(key, i) {
                    anyhow::bail!(
                        "alias '{a}' claimed by both {} and {}",
                        descriptors[prev].name,
                        d.name
                    );
                }
            }
        }
        Ok(Self { descriptors, by_name, by_alias })
    }

    pub fn descriptors(&self) -> &[ProtocolDescriptor] {
        &self.descriptors
    }

    /// Case-insensitive lookup: canonical names first, then aliases.
    pub fn resolve(&self, name_or_alias: &str) -> Result<&ProtocolDescriptor, ConfError> {
        let key = name_or_alias.trim().to_ascii_lowercase();
        self.by_name
            .get(&key)
            .or_else(|| self.by_alias.get(&key))
            .map(|&i| &self.descriptors[i])
            .ok_or_else(|| ConfError::ProtocolNotSupported { name: name_or_alias.to_string() })
    }

    /// Starter settings: descriptor flags plus family defaults.
    pub fn default_settings(&self, name: &str) -> Result<Map<String, Value>, ConfError> {
        let d = self.resolve(name)?;
        let mut m = Map::new();
        m.insert("port".into(), json!(d.default_port));
        m.insert("tls".into(), json!(d.requires_tls));
        m.insert("domain_required".into(), json!(d.requires_domain));
        m.insert("transport".into(), json!(d.default_transport()));
        match d.family {
            ProtocolFamily::Reality => {
                m.insert("dest".into(), json!(DEFAULT_REALITY_DEST));
                m.insert("server_name".into(), json!(DEFAULT_REALITY_DEST));
            }
            ProtocolFamily::WebSocketTls => {
                m.insert("path".into(), json!("/ws"));
            }
            ProtocolFamily::HttpUpgrade => {
                m.insert("path".into(), json!("/upgrade"));
            }
            ProtocolFamily::Shadowsocks => {
                m.insert("method".into(), json!(DEFAULT_SS_METHOD));
            }
            ProtocolFamily::Shadowsocks2022 => {
                m.insert("method".into(), json!(DEFAULT_SS2022_METHOD));
            }
        }
        Ok(m)
    }

    /// Port range, domain presence and transport membership.
    pub fn validate_settings(&self, name: &str, settings: &Map<String, Value>) -> Result<(), ConfError> {
        let d = self.resolve(name)?;

        if let Some(v) = settings.get("port") {
            match v.as_u64() {
                Some(p) if (1..=65535).contains(&p) => {}
                Some(0) => {} // 0 means "pick one"
                _ => return Err(ConfError::invalid("port", format!("{v} is not in 1-65535"))),
            }
        }

        if d.requires_domain {
            let domain = settings.get("domain").and_then(Value::as_str).unwrap_or("").trim();
            if domain.is_empty() {
                return Err(ConfError::invalid("domain", format!("{} requires a domain", d.name)));
            }
        }

        if let Some(t) = settings.get("transport").and_then(Value::as_str) {
            if !d.transports.contains(&t) {
                return Err(ConfError::invalid(
                    "transport",
                    format!("{} supports {:?}, got '{t}'", d.name, d.transports),
                ));
            }
        }

        if let Some(m) = settings.get("method").and_then(Value::as_str) {
            let allowed = match d.family {
                ProtocolFamily::Shadowsocks => SS_METHODS,
                ProtocolFamily::Shadowsocks2022 => SS2022_METHODS,
                _ => return Ok(()),
            };
            if !allowed.contains(&m) {
                return Err(ConfError::invalid("method", format!("{m} is not valid for {}", d.name)));
            }
        }
        Ok(())
    }

    /// Map a parsed inbound back to the descriptor that would have produced it.
    pub fn identify(&self, inbound: &Value) -> Option<&ProtocolDescriptor> {
        let protocol = inbound.get("protocol")?.as_str()?;
        let stream = inbound.get("streamSettings");
        let network = stream
            .and_then(|s| s.get("network"))
            .and_then(Value::as_str)
            .unwrap_or("tcp");
        let security = stream
            .and_then(|s| s.get("security"))
            .and_then(Value::as_str)
            .unwrap_or("none");
        let method = inbound
            .pointer("/settings/method")
            .and_then(Value::as_str)
            .unwrap_or("");

        self.descriptors.iter().find(|d| {
            if d.protocol != protocol {
                return false;
            }
            match d.family {
                ProtocolFamily::Reality => security == "reality",
                ProtocolFamily::WebSocketTls | ProtocolFamily::HttpUpgrade => {
                    d.transports.contains(&network)
                }
                ProtocolFamily::Shadowsocks => !method.starts_with("2022-"),
                ProtocolFamily::Shadowsocks2022 => method.starts_with("2022-"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_names_and_aliases_case_insensitively() {
        let c = Catalog::builtin().unwrap();
        assert_eq!(c.resolve("VLESS-Reality").unwrap().name, "vless-reality");
        assert_eq!(c.resolve("ss").unwrap().name, "shadowsocks");
        assert_eq!(c.resolve("SS2022").unwrap().name, "shadowsocks-2022");
        assert_eq!(c.resolve("trojan").unwrap().name, "trojan-ws-tls");
        assert!(matches!(
            c.resolve("wireguard"),
            Err(ConfError::ProtocolNotSupported { name }) if name == "wireguard"
        ));
    }

    #[test]
    fn rejects_alias_claimed_twice() {
        let mut ds = BUILTIN.to_vec();
        ds[1].aliases = &["vr"];
        let err = Catalog::new(ds).unwrap_err();
        assert!(err.to_string().contains("'vr'"));
    }

    #[test]
    fn reality_defaults() {
        let c = Catalog::builtin().unwrap();
        let m = c.default_settings("vr").unwrap();
        assert_eq!(m["dest"], "www.microsoft.com");
        assert_eq!(m["port"], 443);
        assert_eq!(m["transport"], "tcp");
        assert_eq!(m["tls"], false);
    }

    #[test]
    fn validate_settings_checks_domain_transport_port() {
        let c = Catalog::builtin().unwrap();
        let mut m = c.default_settings("vless-ws-tls").unwrap();
        assert!(matches!(
            c.validate_settings("vless-ws-tls", &m),
            Err(ConfError::InvalidInput { field, .. }) if field == "domain"
        ));

        m.insert("domain".into(), json!("example.com"));
        c.validate_settings("vless-ws-tls", &m).unwrap();

        m.insert("transport".into(), json!("grpc"));
        assert!(c.validate_settings("vless-ws-tls", &m).is_err());

        let mut ss = c.default_settings("ss").unwrap();
        ss.insert("port".into(), json!(70000));
        assert!(c.validate_settings("ss", &ss).is_err());
        ss.insert("port".into(), json!(8388));
        ss.insert("method".into(), json!("2022-blake3-aes-128-gcm"));
        assert!(c.validate_settings("ss", &ss).is_err());
    }

    #[test]
    fn identify_inbounds() {
        let c = Catalog::builtin().unwrap();
        let reality = json!({
            "protocol": "vless",
            "streamSettings": {"network": "tcp", "security": "reality"}
        });
        assert_eq!(c.identify(&reality).unwrap().name, "vless-reality");

        let hu = json!({
            "protocol": "vmess",
            "streamSettings": {"network": "httpupgrade", "security": "tls"}
        });
        assert_eq!(c.identify(&hu).unwrap().name, "vmess-httpupgrade");

        let ss22 = json!({"protocol": "shadowsocks", "settings": {"method": "2022-blake3-aes-256-gcm"}});
        assert_eq!(c.identify(&ss22).unwrap().name, "shadowsocks-2022");

        assert!(c.identify(&json!({"protocol": "dokodemo-door"})).is_none());
    }
}
