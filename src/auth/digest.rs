//! RFC 2617-style Digest challenge/response (4.3): MD5 by default, optional
//! SHA-256, constant-time response comparison, qop=auth support.

use std::collections::HashMap;

use sha2::Digest as _;
use subtle::ConstantTimeEq;

use crate::message::params::split_top_level;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Sha256,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Sha256 => "SHA-256",
        }
    }

    fn hash_hex(&self, input: &str) -> String {
        match self {
            Algorithm::Md5 => format!("{:x}", md5::compute(input.as_bytes())),
            Algorithm::Sha256 => {
                let mut hasher = sha2::Sha256::new();
                hasher.update(input.as_bytes());
                hex::encode_lower(hasher.finalize())
            }
        }
    }
}

/// Looked-up account used to compute HA1. The realm's password table never
/// stores the response itself, only what's needed to recompute it — storage
/// of the password itself is an external collaborator's concern (Non-goal).
pub struct Credentials<'a> {
    pub username: &'a str,
    pub realm: &'a str,
    pub password: &'a str,
}

impl<'a> Credentials<'a> {
    fn ha1(&self, algorithm: Algorithm) -> String {
        algorithm.hash_hex(&format!("{}:{}:{}", self.username, self.realm, self.password))
    }
}

/// A 401/407 challenge to be rendered into `WWW-Authenticate`/
/// `Proxy-Authenticate`.
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub algorithm: Algorithm,
    pub qop: bool,
}

impl Challenge {
    pub fn render(&self) -> String {
        let mut s = format!(
            "Digest realm=\"{}\", nonce=\"{}\", algorithm={}",
            self.realm,
            self.nonce,
            self.algorithm.as_str()
        );
        if self.qop {
            s.push_str(", qop=\"auth\"");
        }
        s
    }
}

/// Parsed `Authorization`/`Proxy-Authorization` header value.
#[derive(Debug, Default)]
pub struct AuthParams {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
    pub cnonce: Option<String>,
    pub nc: Option<String>,
}

pub fn parse_authorization(raw: &str) -> Option<AuthParams> {
    let rest = raw.trim().strip_prefix("Digest ")?;
    let mut map: HashMap<String, String> = HashMap::new();
    for part in split_top_level(rest, ',') {
        let part = part.trim();
        let (k, v) = part.split_once('=')?;
        let v = v.trim().trim_matches('"');
        map.insert(k.trim().to_ascii_lowercase(), v.to_string());
    }
    Some(AuthParams {
        username: map.remove("username")?,
        realm: map.remove("realm")?,
        nonce: map.remove("nonce")?,
        uri: map.remove("uri")?,
        response: map.remove("response")?,
        algorithm: map.remove("algorithm"),
        qop: map.remove("qop"),
        cnonce: map.remove("cnonce"),
        nc: map.remove("nc"),
    })
}

/// Verifies a request's Digest response against the account's password
/// (4.3). `method` is the SIP method of the request being authenticated
/// (the A2 input); constant-time comparison prevents a timing oracle on the
/// final response string.
pub fn verify_response(creds: &Credentials, method: &str, params: &AuthParams) -> bool {
    let algorithm = match params.algorithm.as_deref() {
        Some("SHA-256") => Algorithm::Sha256,
        _ => Algorithm::Md5,
    };
    let ha1 = creds.ha1(algorithm);
    let ha2 = algorithm.hash_hex(&format!("{}:{}", method, params.uri));

    let expected = if let (Some(qop), Some(cnonce), Some(nc)) =
        (params.qop.as_deref(), params.cnonce.as_deref(), params.nc.as_deref())
    {
        algorithm.hash_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, params.nonce, nc, cnonce, qop, ha2
        ))
    } else {
        algorithm.hash_hex(&format!("{}:{}:{}", ha1, params.nonce, ha2))
    };

    expected.as_bytes().ct_eq(params.response.as_bytes()).into()
}

mod hex {
    pub fn encode_lower(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}
