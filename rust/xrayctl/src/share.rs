//! Client share links built from an inbound as it sits on disk.

use anyhow::Result;
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use serde_json::{json, Value};
use urlencoding::encode;

use crate::{
    catalog::{ProtocolDescriptor, ProtocolFamily},
    error::ConfError,
    keys,
};

/// Fields a link needs, pulled out of one inbound.
#[derive(Debug, Clone, Default)]
struct LinkFields {
    tag: String,
    port: u16,
    uuid: Option<String>,
    password: Option<String>,
    method: Option<String>,
    network: String,
    path: Option<String>,
    host_header: Option<String>,
    sni: Option<String>,
    flow: Option<String>,
    reality_private_key: Option<String>,
    short_id: Option<String>,
}

fn str_at<'a>(v: &'a Value, ptr: &str) -> Option<&'a str> {
    v.pointer(ptr).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn fields(inbound: &Value) -> LinkFields {
    let network = str_at(inbound, "/streamSettings/network").unwrap_or("tcp").to_string();
    let transport = match network.as_str() {
        "ws" => "/streamSettings/wsSettings",
        "httpupgrade" => "/streamSettings/httpupgradeSettings",
        _ => "",
    };
    let sub = |k: &str| {
        if transport.is_empty() {
            None
        } else {
            str_at(inbound, &format!("{transport}/{k}")).map(str::to_string)
        }
    };
    LinkFields {
        tag: str_at(inbound, "/tag").unwrap_or_default().to_string(),
        port: crate::fragments::inbound_port(inbound).unwrap_or(0),
        uuid: str_at(inbound, "/settings/clients/0/id").map(str::to_string),
        password: str_at(inbound, "/settings/clients/0/password")
            .or_else(|| str_at(inbound, "/settings/password"))
            .map(str::to_string),
        method: str_at(inbound, "/settings/method").map(str::to_string),
        path: sub("path"),
        host_header: sub("host"),
        sni: str_at(inbound, "/streamSettings/tlsSettings/serverName")
            .or_else(|| str_at(inbound, "/streamSettings/realitySettings/serverNames/0"))
            .map(str::to_string),
        flow: str_at(inbound, "/settings/clients/0/flow").map(str::to_string),
        reality_private_key: str_at(inbound, "/streamSettings/realitySettings/privateKey").map(str::to_string),
        short_id: inbound
            .pointer("/streamSettings/realitySettings/shortIds/0")
            .and_then(Value::as_str)
            .map(str::to_string),
        network,
    }
}

/// Host clients dial: the configured public address, else the TLS domain.
/// REALITY's server name is someone else's site and never qualifies.
pub fn resolve_host(desc: &ProtocolDescriptor, inbound: &Value, public_host: Option<&str>) -> Result<String, ConfError> {
    if let Some(h) = public_host.map(str::trim).filter(|h| !h.is_empty()) {
        return Ok(h.to_string());
    }
    if desc.family.is_tls_fronted() {
        if let Some(d) = str_at(inbound, "/streamSettings/tlsSettings/serverName") {
            return Ok(d.to_string());
        }
    }
    Err(ConfError::invalid(
        "public_host",
        format!("{} has no domain; set public_host in the config or XRAYCTL_PUBLIC_HOST", desc.name),
    ))
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn need(v: Option<String>, field: &str, tag: &str) -> Result<String, ConfError> {
    v.ok_or_else(|| ConfError::invalid(field, format!("unit '{tag}' has no {field}")))
}

fn query(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| format!("{k}={}", encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

pub fn share_url(desc: &ProtocolDescriptor, inbound: &Value, host: &str) -> Result<String> {
    let f = fields(inbound);
    let addr = authority(host, f.port);
    let name = encode(&f.tag);

    let url = match (desc.protocol, desc.family) {
        ("vless", ProtocolFamily::Reality) => {
            let uuid = need(f.uuid.clone(), "uuid", &f.tag)?;
            let private = need(f.reality_private_key.clone(), "private_key", &f.tag)?;
            let pbk = keys::x25519_public_from_private(&private)?;
            let q = query(&[
                ("encryption", "none"),
                ("flow", f.flow.as_deref().unwrap_or("")),
                ("security", "reality"),
                ("sni", f.sni.as_deref().unwrap_or("")),
                ("fp", "chrome"),
                ("pbk", pbk.as_str()),
                ("sid", f.short_id.as_deref().unwrap_or("")),
                ("type", f.network.as_str()),
            ]);
            format!("vless://{uuid}@{addr}?{q}#{name}")
        }
        ("vless", _) => {
            let uuid = need(f.uuid.clone(), "uuid", &f.tag)?;
            let sni = f.sni.as_deref().unwrap_or(host);
            let q = query(&[
                ("encryption", "none"),
                ("security", "tls"),
                ("sni", sni),
                ("type", f.network.as_str()),
                ("host", f.host_header.as_deref().unwrap_or(sni)),
                ("path", f.path.as_deref().unwrap_or("/")),
            ]);
            format!("vless://{uuid}@{addr}?{q}#{name}")
        }
        ("vmess", _) => {
            let uuid = need(f.uuid.clone(), "uuid", &f.tag)?;
            let sni = f.sni.as_deref().unwrap_or(host);
            let body = json!({
                "v": "2",
                "ps": f.tag,
                "add": host,
                "port": f.port.to_string(),
                "id": uuid,
                "aid": "0",
                "scy": "auto",
                "net": f.network,
                "type": "none",
                "host": f.host_header.as_deref().unwrap_or(sni),
                "path": f.path.as_deref().unwrap_or("/"),
                "tls": "tls",
                "sni": sni,
            });
            format!("vmess://{}", STANDARD.encode(body.to_string()))
        }
        ("trojan", _) => {
            let password = need(f.password.clone(), "password", &f.tag)?;
            let sni = f.sni.as_deref().unwrap_or(host);
            let q = query(&[
                ("security", "tls"),
                ("sni", sni),
                ("type", f.network.as_str()),
                ("host", f.host_header.as_deref().unwrap_or(sni)),
                ("path", f.path.as_deref().unwrap_or("/")),
            ]);
            format!("trojan://{}@{addr}?{q}#{name}", encode(&password))
        }
        ("shadowsocks", family) => {
            let method = need(f.method.clone(), "method", &f.tag)?;
            let password = need(f.password.clone(), "password", &f.tag)?;
            // SIP002: 2022 ciphers take a plain percent-encoded userinfo.
            let userinfo = if family == ProtocolFamily::Shadowsocks2022 {
                format!("{}:{}", encode(&method), encode(&password))
            } else {
                URL_SAFE_NO_PAD.encode(format!("{method}:{password}"))
            };
            format!("ss://{userinfo}@{addr}#{name}")
        }
        (other, _) => {
            return Err(ConfError::ProtocolNotSupported { name: format!("share link for {other}") }.into())
        }
    };
    Ok(url)
}
