//! OneNET authorization tokens.
//!
//! A token signs `"{et}\n{method}\n{res}\n{version}"` with an HMAC keyed by
//! the base64-decoded access key, then packs the parameters into a query
//! string that goes into the `authorization` or `token` header.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use sha2::Sha256;

use crate::error::TokenError;

pub const PRODUCT_TOKEN_VERSION: &str = "2018-10-31";
pub const USER_TOKEN_VERSION: &str = "2022-05-01";
pub const DEVICE_TOKEN_VERSION: &str = "2018-10-31";

pub const PRODUCT_TOKEN_TTL_DAYS: i64 = 365;
pub const USER_TOKEN_TTL_DAYS: i64 = 100;
pub const DEVICE_TOKEN_TTL_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignMethod {
    Md5,
    Sha1,
    Sha256,
}

impl SignMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            SignMethod::Md5 => "md5",
            SignMethod::Sha1 => "sha1",
            SignMethod::Sha256 => "sha256",
        }
    }
}

/// How the access key string turns into HMAC key bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEncoding {
    /// The key must be valid base64.
    Base64,
    /// Base64 when it decodes, otherwise the raw string bytes. Product-level
    /// registration keys have been provisioned both ways.
    Base64OrRaw,
}

fn key_bytes(key: &str, encoding: KeyEncoding) -> Result<Vec<u8>, TokenError> {
    match (STANDARD.decode(key), encoding) {
        (Ok(bytes), _) => Ok(bytes),
        (Err(_), KeyEncoding::Base64OrRaw) => {
            log::warn!("Access key is not base64, signing with raw key bytes");
            Ok(key.as_bytes().to_vec())
        }
        (Err(e), KeyEncoding::Base64) => Err(TokenError::KeyDecode(e)),
    }
}

fn digest(method: SignMethod, key: &[u8], message: &[u8]) -> Result<Vec<u8>, TokenError> {
    fn run<M: Mac + hmac::digest::KeyInit>(key: &[u8], message: &[u8]) -> Result<Vec<u8>, TokenError> {
        let mut mac = <M as Mac>::new_from_slice(key).map_err(|_| TokenError::InvalidKey)?;
        mac.update(message);
        Ok(mac.finalize().into_bytes().to_vec())
    }
    match method {
        SignMethod::Md5 => run::<Hmac<Md5>>(key, message),
        SignMethod::Sha1 => run::<Hmac<Sha1>>(key, message),
        SignMethod::Sha256 => run::<Hmac<Sha256>>(key, message),
    }
}

/// Percent-encodes the three characters standard base64 emits that the
/// service does not accept verbatim. Everything else passes through.
pub fn encode_signature(sig: &str) -> String {
    let mut out = String::with_capacity(sig.len() + 8);
    for c in sig.chars() {
        match c {
            '+' => out.push_str("%2B"),
            '/' => out.push_str("%2F"),
            '=' => out.push_str("%3D"),
            other => out.push(other),
        }
    }
    out
}

/// Builds a token that expires at the unix timestamp `expires_at`.
pub fn sign_at(
    resource: &str,
    method: SignMethod,
    version: &str,
    key: &str,
    encoding: KeyEncoding,
    expires_at: i64,
) -> Result<String, TokenError> {
    let key = key_bytes(key, encoding)?;
    let string_to_sign = format!("{}\n{}\n{}\n{}", expires_at, method.as_str(), resource, version);
    let raw = digest(method, &key, string_to_sign.as_bytes())?;
    let sign = encode_signature(&STANDARD.encode(raw));

    Ok(format!(
        "version={}&res={}&et={}&method={}&sign={}",
        version,
        urlencoding::encode(resource),
        expires_at,
        method.as_str(),
        sign
    ))
}

/// Builds a token valid for `ttl` from now.
pub fn sign(
    resource: &str,
    method: SignMethod,
    version: &str,
    key: &str,
    encoding: KeyEncoding,
    ttl: Duration,
) -> Result<String, TokenError> {
    let expires_at = (Utc::now() + ttl).timestamp();
    sign_at(resource, method, version, key, encoding, expires_at)
}

/// Product-level token used for device registration.
pub fn product_token(product_id: &str, access_key: &str) -> Result<String, TokenError> {
    sign(
        &format!("products/{}", product_id),
        SignMethod::Md5,
        PRODUCT_TOKEN_VERSION,
        access_key,
        KeyEncoding::Base64OrRaw,
        Duration::days(PRODUCT_TOKEN_TTL_DAYS),
    )
}

/// User-level token used for file upload.
pub fn user_token(user_id: &str, access_key: &str) -> Result<String, TokenError> {
    sign(
        &format!("userid/{}", user_id),
        SignMethod::Sha1,
        USER_TOKEN_VERSION,
        access_key,
        KeyEncoding::Base64,
        Duration::days(USER_TOKEN_TTL_DAYS),
    )
}

/// Device-level token used for online, property and pack calls.
pub fn device_token(product_id: &str, device_name: &str, sec_key: &str) -> Result<String, TokenError> {
    sign(
        &format!("products/{}/devices/{}", product_id, device_name),
        SignMethod::Sha256,
        DEVICE_TOKEN_VERSION,
        sec_key,
        KeyEncoding::Base64,
        Duration::days(DEVICE_TOKEN_TTL_DAYS),
    )
}
