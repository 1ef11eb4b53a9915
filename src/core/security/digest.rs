//! HTTP Digest (RFC 7616, SHA-256) response parsing and verification.
use std::collections::HashMap;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Parsed `Authorization: Digest ...` credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestResponse {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    method: String,
}

impl DigestResponse {
    /// Parse the value of an `Authorization` header. Returns `None` for other
    /// schemes or when a mandatory parameter is missing.
    pub fn parse(header: &str, method: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return None;
        }

        let mut fields = parse_params(params);
        let mut take = |name: &str| fields.remove(name);

        Some(Self {
            username: take("username")?,
            realm: take("realm")?,
            nonce: take("nonce")?,
            uri: take("uri")?,
            response: take("response")?,
            qop: take("qop"),
            nc: take("nc"),
            cnonce: take("cnonce"),
            opaque: take("opaque"),
            algorithm: take("algorithm"),
            method: method.to_string(),
        })
    }

    /// Compare the client's response against one computed from `ha1`.
    pub fn matches_ha1(&self, ha1: &str) -> bool {
        let expected = self.expected_response(ha1);
        bool::from(expected.as_bytes().ct_eq(self.response.to_ascii_lowercase().as_bytes()))
    }

    fn expected_response(&self, ha1: &str) -> String {
        let ha2 = sha256_hex(&format!("{}:{}", self.method, self.uri));
        match (&self.qop, &self.nc, &self.cnonce) {
            (Some(qop), Some(nc), Some(cnonce)) => sha256_hex(&format!(
                "{ha1}:{}:{nc}:{cnonce}:{qop}:{ha2}",
                self.nonce
            )),
            _ => sha256_hex(&format!("{ha1}:{}:{ha2}", self.nonce)),
        }
    }
}

/// `hex(sha256(principal:realm:password))`
pub fn ha1(principal: &str, realm: &str, password: &str) -> String {
    sha256_hex(&format!("{principal}:{realm}:{password}"))
}

pub fn sha256_hex(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn parse_params(params: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut rest = params.trim();

    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after = after.trim_start();

        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after.find(',') {
                Some(end) => (after[..end].trim(), &after[end..]),
                None => (after.trim(), ""),
            }
        };

        fields.insert(key, value.to_string());
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }

    fields
}
