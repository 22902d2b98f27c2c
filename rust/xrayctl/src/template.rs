//! Named JSON text templates for xray fragments.
//!
//! Syntax:
//! - `{{key}}` is replaced by the parameter value. Strings are JSON-escaped
//!   (the template supplies the quotes), numbers are emitted bare.
//! - `{{#key}} ... {{/key}}` is kept only when `key` has a value.
//!
//! A plain `{{key}}` whose value is missing is an error. Only a section can
//! drop it.

use anyhow::Result;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::error::ConfError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Uuid(String),
    Password(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportParams {
    pub path: String,
    pub host: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealityParams {
    pub dest: String,
    pub dest_port: u16,
    pub server_name: String,
    pub private_key: String,
    pub short_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsParams {
    pub domain: String,
    pub cert_file: String,
    pub key_file: String,
}

/// Everything a protocol template can reference. Built fresh for every mutation.
#[derive(Debug, Clone, Default)]
pub struct TemplateParams {
    pub tag: String,
    pub port: u16,
    pub credential: Option<Credential>,
    pub method: Option<String>,
    pub transport: Option<TransportParams>,
    pub reality: Option<RealityParams>,
    pub tls: Option<TlsParams>,
}

enum Slot {
    Str(String),
    Num(u64),
}

impl TemplateParams {
    fn slot(&self, key: &str) -> Option<Slot> {
        let s = |v: &str| Some(Slot::Str(v.to_string()));
        match key {
            "tag" if !self.tag.is_empty() => s(&self.tag),
            "port" if self.port != 0 => Some(Slot::Num(self.port as u64)),
            "uuid" => match &self.credential {
                Some(Credential::Uuid(u)) => s(u),
                _ => None,
            },
            "password" => match &self.credential {
                Some(Credential::Password(p)) => s(p),
                _ => None,
            },
            "method" => self.method.as_deref().and_then(s),
            "path" => self.transport.as_ref().and_then(|t| s(&t.path)),
            "host" => self
                .transport
                .as_ref()
                .and_then(|t| t.host.as_deref())
                .filter(|h| !h.is_empty())
                .and_then(s),
            "dest" => self.reality.as_ref().and_then(|r| s(&r.dest)),
            "dest_port" => self.reality.as_ref().map(|r| Slot::Num(r.dest_port as u64)),
            "server_name" => self.reality.as_ref().and_then(|r| s(&r.server_name)),
            "private_key" => self.reality.as_ref().and_then(|r| s(&r.private_key)),
            "short_id" => self.reality.as_ref().and_then(|r| s(&r.short_id)),
            "domain" => self.tls.as_ref().and_then(|t| s(&t.domain)),
            "cert_file" => self.tls.as_ref().and_then(|t| s(&t.cert_file)),
            "key_file" => self.tls.as_ref().and_then(|t| s(&t.key_file)),
            _ => None,
        }
    }
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([#/]?)([a-z_]+)\s*\}\}").expect("static regex"))
}

pub fn template_source(id: &str) -> Option<&'static str> {
    TEMPLATES.iter().find(|(name, _)| *name == id).map(|(_, src)| *src)
}

pub fn template_ids() -> impl Iterator<Item = &'static str> {
    TEMPLATES.iter().map(|(name, _)| *name)
}

/// Render `template_id` against `params` and parse the result as JSON.
pub fn render(template_id: &str, params: &TemplateParams) -> Result<Value, ConfError> {
    let src = template_source(template_id).ok_or_else(|| ConfError::Template {
        template: template_id.to_string(),
        message: "unknown template".to_string(),
    })?;
    let text = render_text(template_id, src, params)?;
    serde_json::from_str(&text).map_err(|e| ConfError::Template {
        template: template_id.to_string(),
        message: format!("rendered output is not valid JSON: {e}"),
    })
}

fn render_text(template_id: &str, src: &str, params: &TemplateParams) -> Result<String, ConfError> {
    let err = |message: String| ConfError::Template { template: template_id.to_string(), message };
    let re = placeholder_re();

    let mut out = String::with_capacity(src.len());
    let mut rest = src;
    let mut missing: Vec<String> = Vec::new();

    while let Some(caps) = re.captures(rest) {
        let m = caps.get(0).expect("group 0");
        let sigil = &caps[1];
        let key = caps[2].to_string();
        out.push_str(&rest[..m.start()]);
        let after = &rest[m.end()..];

        match sigil {
            "#" => {
                let close = format!("{{{{/{key}}}}}");
                let end = after
                    .find(&close)
                    .ok_or_else(|| err(format!("section '{key}' is not closed")))?;
                let inner = &after[..end];
                if params.slot(&key).is_some() {
                    out.push_str(&render_text(template_id, inner, params)?);
                }
                rest = &after[end + close.len()..];
                continue;
            }
            "/" => return Err(err(format!("unexpected close of section '{key}'"))),
            _ => match params.slot(&key) {
                Some(Slot::Str(v)) => {
                    let quoted = Value::String(v).to_string();
                    out.push_str(&quoted[1..quoted.len() - 1]);
                }
                Some(Slot::Num(n)) => out.push_str(&n.to_string()),
                None => missing.push(key),
            },
        }
        rest = after;
    }
    out.push_str(rest);

    if !missing.is_empty() {
        missing.dedup();
        return Err(err(format!("missing parameters: {}", missing.join(", "))));
    }
    Ok(out)
}

macro_rules! sniffing {
    () => {
        r#""sniffing": {"enabled": true, "destOverride": ["http", "tls", "quic"]}"#
    };
}

const TEMPLATES: &[(&str, &str)] = &[
    (
        "vless_reality",
        concat!(
            r#"{"inbounds": [{
  "tag": "{{tag}}", "listen": "0.0.0.0", "port": {{port}}, "protocol": "vless",
  "settings": {"clients": [{"id": "{{uuid}}", "flow": "xtls-rprx-vision"}], "decryption": "none"},
  "streamSettings": {
    "network": "tcp", "security": "reality",
    "realitySettings": {
      "show": false, "dest": "{{dest}}:{{dest_port}}", "xver": 0,
      "serverNames": ["{{server_name}}"], "privateKey": "{{private_key}}", "shortIds": ["{{short_id}}"]
    }
  },
  "#,
            sniffing!(),
            "}]}"
        ),
    ),
    (
        "vless_ws_tls",
        concat!(
            r#"{"inbounds": [{
  "tag": "{{tag}}", "listen": "0.0.0.0", "port": {{port}}, "protocol": "vless",
  "settings": {"clients": [{"id": "{{uuid}}"}], "decryption": "none"},
  "streamSettings": {
    "network": "ws", "security": "tls",
    "tlsSettings": {"serverName": "{{domain}}", "certificates": [{"certificateFile": "{{cert_file}}", "keyFile": "{{key_file}}"}]},
    "wsSettings": {{{#host}}"host": "{{host}}", {{/host}}"path": "{{path}}"}
  },
  "#,
            sniffing!(),
            "}]}"
        ),
    ),
    (
        "vless_httpupgrade",
        concat!(
            r#"{"inbounds": [{
  "tag": "{{tag}}", "listen": "0.0.0.0", "port": {{port}}, "protocol": "vless",
  "settings": {"clients": [{"id": "{{uuid}}"}], "decryption": "none"},
  "streamSettings": {
    "network": "httpupgrade", "security": "tls",
    "tlsSettings": {"serverName": "{{domain}}", "certificates": [{"certificateFile": "{{cert_file}}", "keyFile": "{{key_file}}"}]},
    "httpupgradeSettings": {{{#host}}"host": "{{host}}", {{/host}}"path": "{{path}}"}
  },
  "#,
            sniffing!(),
            "}]}"
        ),
    ),
    (
        "vmess_ws_tls",
        concat!(
            r#"{"inbounds": [{
  "tag": "{{tag}}", "listen": "0.0.0.0", "port": {{port}}, "protocol": "vmess",
  "settings": {"clients": [{"id": "{{uuid}}", "alterId": 0}]},
  "streamSettings": {
    "network": "ws", "security": "tls",
    "tlsSettings": {"serverName": "{{domain}}", "certificates": [{"certificateFile": "{{cert_file}}", "keyFile": "{{key_file}}"}]},
    "wsSettings": {{{#host}}"host": "{{host}}", {{/host}}"path": "{{path}}"}
  },
  "#,
            sniffing!(),
            "}]}"
        ),
    ),
    (
        "vmess_httpupgrade",
        concat!(
            r#"{"inbounds": [{
  "tag": "{{tag}}", "listen": "0.0.0.0", "port": {{port}}, "protocol": "vmess",
  "settings": {"clients": [{"id": "{{uuid}}", "alterId": 0}]},
  "streamSettings": {
    "network": "httpupgrade", "security": "tls",
    "tlsSettings": {"serverName": "{{domain}}", "certificates": [{"certificateFile": "{{cert_file}}", "keyFile": "{{key_file}}"}]},
    "httpupgradeSettings": {{{#host}}"host": "{{host}}", {{/host}}"path": "{{path}}"}
  },
  "#,
            sniffing!(),
            "}]}"
        ),
    ),
    (
        "trojan_ws_tls",
        concat!(
            r#"{"inbounds": [{
  "tag": "{{tag}}", "listen": "0.0.0.0", "port": {{port}}, "protocol": "trojan",
  "settings": {"clients": [{"password": "{{password}}"}]},
  "streamSettings": {
    "network": "ws", "security": "tls",
    "tlsSettings": {"serverName": "{{domain}}", "certificates": [{"certificateFile": "{{cert_file}}", "keyFile": "{{key_file}}"}]},
    "wsSettings": {{{#host}}"host": "{{host}}", {{/host}}"path": "{{path}}"}
  },
  "#,
            sniffing!(),
            "}]}"
        ),
    ),
    (
        "shadowsocks",
        r#"{"inbounds": [{
  "tag": "{{tag}}", "listen": "0.0.0.0", "port": {{port}}, "protocol": "shadowsocks",
  "settings": {"method": "{{method}}", "password": "{{password}}", "network": "tcp,udp"}
}]}"#,
    ),
    (
        "shadowsocks_2022",
        r#"{"inbounds": [{
  "tag": "{{tag}}", "listen": "0.0.0.0", "port": {{port}}, "protocol": "shadowsocks",
  "settings": {"method": "{{method}}", "password": "{{password}}", "network": "tcp,udp"}
}]}"#,
    ),
    // Shared fragments written once by `initialize`.
    ("base_system", r#"{"log": {"loglevel": "warning", "access": "none"}}"#),
    (
        "dns_default",
        r#"{"dns": {"servers": ["https+local://1.1.1.1/dns-query", "localhost"], "queryStrategy": "UseIP"}}"#,
    ),
    (
        "outbound_direct",
        r#"{"outbounds": [{"tag": "direct", "protocol": "freedom", "settings": {"domainStrategy": "UseIP"}}]}"#,
    ),
    ("outbound_block", r#"{"outbounds": [{"tag": "block", "protocol": "blackhole"}]}"#),
    (
        "routing_basic",
        r#"{"routing": {"domainStrategy": "IPIfNonMatch", "rules": [
  {"type": "field", "ip": ["geoip:private"], "outboundTag": "block"},
  {"type": "field", "protocol": ["bittorrent"], "outboundTag": "block"}
]}}"#,
    ),
    (
        "routing_tail",
        r#"{"routing": {"rules": [{"type": "field", "network": "tcp,udp", "outboundTag": "direct"}]}}"#,
    ),
];
