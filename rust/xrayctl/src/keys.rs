use anyhow::{Context, Result};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use rand::{distributions::Alphanumeric, Rng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::ConfError;

pub const MIN_PASSWORD_LEN: usize = 8;

pub fn uuid_v4() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn is_uuid(s: &str) -> bool {
    uuid::Uuid::parse_str(s).is_ok()
}

pub fn password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len.max(MIN_PASSWORD_LEN))
        .map(char::from)
        .collect()
}

/// Lowercase hex of `len_bytes` random bytes.
pub fn short_id(len_bytes: usize) -> String {
    let mut buf = vec![0u8; len_bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    let mut out = String::with_capacity(len_bytes * 2);
    for b in buf {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[derive(Debug, Clone)]
pub struct X25519Pair {
    pub private_key: String,
    pub public_key: String,
}

/// Key pair in the encoding `xray x25519` prints (base64url, no padding).
pub fn x25519_pair() -> X25519Pair {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    let secret = StaticSecret::from(raw);
    let public = PublicKey::from(&secret);
    X25519Pair {
        private_key: URL_SAFE_NO_PAD.encode(secret.to_bytes()),
        public_key: URL_SAFE_NO_PAD.encode(public.as_bytes()),
    }
}

/// Recover the public half from a stored REALITY private key.
pub fn x25519_public_from_private(private_key: &str) -> Result<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(private_key.trim().trim_end_matches('='))
        .context("decode x25519 private key")?;
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("x25519 private key must be 32 bytes"))?;
    let public = PublicKey::from(&StaticSecret::from(raw));
    Ok(URL_SAFE_NO_PAD.encode(public.as_bytes()))
}

/// Pre-shared key length for a Shadowsocks-2022 cipher.
pub fn ss2022_key_len(method: &str) -> Option<usize> {
    match method {
        "2022-blake3-aes-128-gcm" => Some(16),
        "2022-blake3-aes-256-gcm" | "2022-blake3-chacha20-poly1305" => Some(32),
        _ => None,
    }
}

pub fn ss2022_key(method: &str) -> Result<String, ConfError> {
    let len = ss2022_key_len(method)
        .ok_or_else(|| ConfError::invalid("method", format!("{method} is not a 2022 cipher")))?;
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    Ok(STANDARD.encode(buf))
}

pub fn check_ss2022_key(method: &str, key: &str) -> Result<(), ConfError> {
    let len = ss2022_key_len(method)
        .ok_or_else(|| ConfError::invalid("method", format!("{method} is not a 2022 cipher")))?;
    match STANDARD.decode(key.trim()) {
        Ok(b) if b.len() == len => Ok(()),
        Ok(b) => Err(ConfError::invalid(
            "password",
            format!("{method} needs a {len}-byte base64 key, got {} bytes", b.len()),
        )),
        Err(_) => Err(ConfError::invalid("password", format!("{method} needs a base64 key"))),
    }
}
