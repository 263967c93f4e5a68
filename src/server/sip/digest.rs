//! SIP digest authentication (RFC 2617 / RFC 3261 §22)

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DigestError {
    #[error("Unsupported authentication scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Challenge is missing {0}")]
    MissingParameter(&'static str),
}

/// Parsed `WWW-Authenticate` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    /// True when the server offers `qop=auth`
    pub qop_auth: bool,
}

impl DigestChallenge {
    /// Parse a header value such as `Digest realm="x", nonce="y", qop="auth"`
    pub fn parse(value: &str) -> Result<Self, DigestError> {
        let value = value.trim();
        let (scheme, params) = value.split_once(char::is_whitespace).unwrap_or((value, ""));
        if !scheme.eq_ignore_ascii_case("Digest") {
            return Err(DigestError::UnsupportedScheme(scheme.to_string()));
        }

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut algorithm = None;
        let mut qop_auth = false;

        for (key, val) in split_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(val),
                "nonce" => nonce = Some(val),
                "opaque" => opaque = Some(val),
                "algorithm" => algorithm = Some(val),
                "qop" => {
                    qop_auth = val
                        .split(',')
                        .any(|q| q.trim().eq_ignore_ascii_case("auth"))
                }
                _ => {}
            }
        }

        if let Some(alg) = &algorithm {
            if !alg.eq_ignore_ascii_case("MD5") {
                return Err(DigestError::UnsupportedAlgorithm(alg.clone()));
            }
        }

        Ok(Self {
            realm: realm.ok_or(DigestError::MissingParameter("realm"))?,
            nonce: nonce.ok_or(DigestError::MissingParameter("nonce"))?,
            opaque,
            algorithm,
            qop_auth,
        })
    }
}

/// Split `k1="v1", k2=v2` honouring commas inside quotes
fn split_params(params: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    let mut flush = |part: &str| {
        if let Some((k, v)) = part.split_once('=') {
            let k = k.trim();
            if !k.is_empty() {
                out.push((k.to_string(), v.trim().trim_matches('"').to_string()));
            }
        }
    };

    for c in params.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => {
                flush(&current);
                current.clear();
            }
            _ => current.push(c),
        }
    }
    flush(&current);

    out
}

fn md5_hex(parts: &[&str]) -> String {
    format!("{:x}", md5::compute(parts.join(":")))
}

/// Digest response without qop: `MD5(HA1:nonce:HA2)`
pub fn digest_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
) -> String {
    let ha1 = md5_hex(&[username, realm, password]);
    let ha2 = md5_hex(&[method, uri]);
    md5_hex(&[&ha1, nonce, &ha2])
}

/// Digest response with `qop=auth`: `MD5(HA1:nonce:nc:cnonce:auth:HA2)`
#[allow(clippy::too_many_arguments)]
pub fn digest_response_qop(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
) -> String {
    let ha1 = md5_hex(&[username, realm, password]);
    let ha2 = md5_hex(&[method, uri]);
    md5_hex(&[&ha1, nonce, nc, cnonce, "auth", &ha2])
}

/// Build the `Authorization` header value answering `challenge`
pub fn authorization_value(
    challenge: &DigestChallenge,
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
) -> String {
    let mut value = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
        username, challenge.realm, challenge.nonce, uri
    );

    if challenge.qop_auth {
        let nc = "00000001";
        let cnonce = format!("{:08x}", rand::random::<u32>());
        let response = digest_response_qop(
            username,
            &challenge.realm,
            password,
            method,
            uri,
            &challenge.nonce,
            nc,
            &cnonce,
        );
        value.push_str(&format!(
            ", response=\"{}\", qop=auth, nc={}, cnonce=\"{}\"",
            response, nc, cnonce
        ));
    } else {
        let response = digest_response(username, &challenge.realm, password, method, uri, &challenge.nonce);
        value.push_str(&format!(", response=\"{}\"", response));
    }

    value.push_str(", algorithm=MD5");
    if let Some(opaque) = &challenge.opaque {
        value.push_str(&format!(", opaque=\"{}\"", opaque));
    }

    value
}
