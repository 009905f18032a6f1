//! RTSP authentication.
//!
//! Two independent checks live here: RFC 2069-style Digest authorization
//! on the Authorization header, and an optional signed-URL scheme carried
//! in query parameters (`expires`, `salt`, `signature`) used by publish
//! and describe requests.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use lazy_static::lazy_static;
use md5::{Digest, Md5};
use regex::Regex;
use sha2::Sha512;
use url::Url;

use crate::error::{Error, Result};
use crate::util::short_id;

type HmacSha512 = Hmac<Sha512>;

lazy_static! {
    static ref REALM_RE: Regex = Regex::new(r#"realm="(.*?)""#).unwrap();
    static ref NONCE_RE: Regex = Regex::new(r#"nonce="(.*?)""#).unwrap();
    static ref USERNAME_RE: Regex = Regex::new(r#"username="(.*?)""#).unwrap();
    static ref RESPONSE_RE: Regex = Regex::new(r#"response="(.*?)""#).unwrap();
    static ref URI_RE: Regex = Regex::new(r#"uri="(.*?)""#).unwrap();
}

fn md5_hex(data: &str) -> String {
    hex::encode(Md5::digest(data.as_bytes()))
}

fn capture(re: &Regex, line: &str, field: &'static str) -> Result<String> {
    re.captures(line)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_owned())
        .ok_or(Error::ErrAuthHeaderMalformed(field))
}

/// Fresh nonce for a WWW-Authenticate challenge.
pub fn generate_nonce() -> String {
    md5_hex(&short_id())
}

/// The Digest challenge line for a 401 response.
pub fn challenge(realm: &str, nonce: &str) -> String {
    format!(r#"Digest realm="{realm}", nonce="{nonce}", algorithm="MD5""#)
}

/// Validate a client's Digest Authorization header against the nonce we
/// issued and the configured user table.
pub fn check_digest(
    auth_line: &str,
    method: &str,
    session_nonce: &str,
    users: &HashMap<String, String>,
) -> Result<()> {
    let realm = capture(&REALM_RE, auth_line, "realm")?;
    let nonce = capture(&NONCE_RE, auth_line, "nonce")?;
    if session_nonce.is_empty() || nonce != session_nonce {
        return Err(Error::ErrAuthFailed);
    }
    let username = capture(&USERNAME_RE, auth_line, "username")?;
    let response = capture(&RESPONSE_RE, auth_line, "response")?;
    let uri = capture(&URI_RE, auth_line, "uri")?;

    let password = users.get(&username).ok_or(Error::ErrAuthFailed)?;

    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    let expected = md5_hex(&format!("{ha1}:{nonce}:{ha2}"));

    // Byte-wise comparison over fixed-length hex digests.
    let matches = expected.len() == response.len()
        && expected
            .bytes()
            .zip(response.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0;
    if matches {
        Ok(())
    } else {
        Err(Error::ErrAuthFailed)
    }
}

fn url_with_default_port(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw).map_err(|_| Error::ErrInvalidUrl(raw.to_owned()))?;
    if url.port().is_none() {
        let _ = url.set_port(Some(554));
    }
    Ok(url)
}

/// Compute a Digest Authorization header from a server challenge, for the
/// pull client. Credentials come from the URL userinfo.
pub fn digest_authorization(challenge_line: &str, method: &str, raw_url: &str) -> Result<String> {
    let realm = capture(&REALM_RE, challenge_line, "realm")?;
    let nonce = capture(&NONCE_RE, challenge_line, "nonce")?;

    let url = url_with_default_port(raw_url)?;
    let username = url.username().to_owned();
    let password = url.password().unwrap_or("").to_owned();

    let mut bare = url.clone();
    let _ = bare.set_username("");
    let _ = bare.set_password(None);
    let uri = bare.to_string();

    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    let response = md5_hex(&format!("{ha1}:{nonce}:{ha2}"));

    Ok(format!(
        r#"Digest username="{username}", realm="{realm}", nonce="{nonce}", uri="{uri}", response="{response}""#
    ))
}

/// Compute a Basic Authorization header from URL credentials.
pub fn basic_authorization(raw_url: &str) -> Result<String> {
    let url = Url::parse(raw_url).map_err(|_| Error::ErrInvalidUrl(raw_url.to_owned()))?;
    let username = url.username();
    let password = url.password().unwrap_or("");
    Ok(format!(
        "Basic {}",
        BASE64.encode(format!("{username}:{password}"))
    ))
}

/// Pick an Authorization header matching a WWW-Authenticate challenge.
pub fn authorization_for_challenge(
    challenge_line: &str,
    method: &str,
    raw_url: &str,
) -> Result<String> {
    if challenge_line.trim_start().starts_with("Digest") {
        digest_authorization(challenge_line, method, raw_url)
    } else if challenge_line.trim_start().starts_with("Basic") {
        basic_authorization(raw_url)
    } else {
        Err(Error::ErrAuthHeaderMalformed("scheme"))
    }
}

/// Result of the signed-URL check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureOutcome {
    Authorized,
    /// `expires` lies in the past: semantically a 403.
    Expired,
    /// Missing parameters or signature mismatch: a 401.
    Invalid,
}

fn hmac_sha512(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    let mut mac = HmacSha512::new_from_slice(key).expect("hmac key");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Validate the `expires`/`salt`/`signature` query parameters of a
/// publish or describe URL.
///
/// The signing key is derived as `HMAC("TV" || hex(stream_secret), salt)`;
/// the expected signature is `base64(HMAC(signing_key,
/// "METHOD\nPATH\nFIRST_QUERY_PARAM"))`.
pub fn check_url_signature(raw_url: &str, method: &str, stream_secret: &str) -> SignatureOutcome {
    let url = match Url::parse(raw_url) {
        Ok(url) => url,
        Err(_) => return SignatureOutcome::Invalid,
    };
    let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
    let (expires, salt, signature) = match (
        query.get("expires"),
        query.get("salt"),
        query.get("signature"),
    ) {
        (Some(expires), Some(salt), Some(signature))
            if !expires.is_empty() && !salt.is_empty() && !signature.is_empty() =>
        {
            (expires, salt, signature)
        }
        _ => return SignatureOutcome::Invalid,
    };

    let expires_at = match NaiveDateTime::parse_from_str(expires, "%Y-%m-%dT%H:%M:%SZ") {
        Ok(naive) => naive.and_utc(),
        Err(_) => return SignatureOutcome::Invalid,
    };
    if Utc::now() > expires_at {
        return SignatureOutcome::Expired;
    }

    let raw_query = url.query().unwrap_or("");
    let first_param = raw_query.split('&').next().unwrap_or("");

    let mut key = b"TV".to_vec();
    key.extend_from_slice(&hex::decode(stream_secret).unwrap_or_default());
    let salt_raw = BASE64.decode(salt.as_bytes()).unwrap_or_default();
    let signing_key = hmac_sha512(&key, &salt_raw);

    let request = format!("{method}\n{}\n{first_param}", url.path());
    let expected = BASE64.encode(hmac_sha512(&signing_key, request.as_bytes()));

    if &expected == signature {
        SignatureOutcome::Authorized
    } else {
        SignatureOutcome::Invalid
    }
}
