use base64::{
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
    Engine as _,
};
use hmac::{Hmac, Mac};
use log::trace;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::AcmeError;

type HmacSha256 = Hmac<Sha256>;

const DOMAIN_REGEX: &str = r"^(?i)([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z][a-z0-9-]{0,61}[a-z0-9]$";
const TIP_REGEX_FAILED: &str = "Match Regex Failed.";

// base64url without padding, rfc7515 s2
pub fn base64(s: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(s)
}

// accepts padded or unpadded base64url
pub fn base64_decode(s: &str) -> Result<Vec<u8>, AcmeError> {
    let trimmed = s.trim().trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| URL_SAFE.decode(s.trim()))
        .map_err(|e| AcmeError::Tip(format!("Invalid base64url: {}", e)))
}

pub fn sha256_bytes(p: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(p);
    hasher.finalize().to_vec()
}

pub fn base64_sha256(p: &[u8]) -> String {
    let b64_hash = base64(&sha256_bytes(p));
    trace!("sha2 sha256 base64: {}", b64_hash);
    b64_hash
}

pub fn sha256(p: &str) -> String {
    let hex_hash = hex::encode(sha256_bytes(p.as_bytes()));
    trace!("sha2 sha256 hex: {}", hex_hash);
    hex_hash
}

pub fn hmac256(key: &[u8], s: &str) -> Vec<u8> {
    // hmac accepts keys of any length, new_from_slice never fails for it
    match HmacSha256::new_from_slice(key) {
        Ok(mut mac) => {
            mac.update(s.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
        Err(_) => Vec::new(),
    }
}

pub fn hex_hmac256(key: &[u8], s: &str) -> String {
    hex::encode(hmac256(key, s))
}

// key is the base64url shared secret handed out by the ca for eab
pub fn base64_hmac256(key: &str, s: &str) -> Result<String, AcmeError> {
    let key = base64_decode(key)?;
    if key.is_empty() {
        return AcmeError::tip("Empty hmac key");
    }
    Ok(base64(&hmac256(&key, s)))
}

pub fn regx1(text: &str, reg: &str) -> Result<String, AcmeError> {
    let re = Regex::new(reg)?;
    match re.captures(text) {
        Some(cap) => Ok(cap.get(1).map_or("", |m| m.as_str()).to_string()),
        None => AcmeError::tip(TIP_REGEX_FAILED),
    }
}

/// Syntactic check of a fully qualified domain. `*.` is only accepted when `allow_wildcard`.
pub fn domain_valid(domain: &str, allow_wildcard: bool) -> bool {
    let domain = match domain.strip_prefix("*.") {
        Some(rest) if allow_wildcard => rest,
        Some(_) => return false,
        None => domain,
    };
    if domain.len() > 253 {
        return false;
    }
    Regex::new(DOMAIN_REGEX).map(|re| re.is_match(domain)).unwrap_or(false)
}

// second level + tld, e.g. _acme-challenge.www.ai8.rs -> ai8.rs
pub fn root_domain(name: &str) -> Option<String> {
    let parts: Vec<&str> = name.trim_end_matches('.').split('.').collect();
    if parts.len() < 2 {
        return None;
    }
    Some(parts[parts.len() - 2..].join("."))
}
