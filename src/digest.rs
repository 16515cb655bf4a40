//! HTTP Digest access authentication (RFC 7616, RFC 2617) for the client side.
//!
//! Only the parts the AiSEG2 web server uses are covered: parsing a `WWW-Authenticate:
//! Digest` challenge and building the matching `Authorization` header for `qop=auth`
//! or the legacy no-qop form.

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::error::AuthError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl Algorithm {
    fn parse(token: &str) -> Result<Self, AuthError> {
        match token.to_ascii_uppercase().as_str() {
            "MD5" => Ok(Algorithm::Md5),
            "MD5-SESS" => Ok(Algorithm::Md5Sess),
            "SHA-256" => Ok(Algorithm::Sha256),
            "SHA-256-SESS" => Ok(Algorithm::Sha256Sess),
            other => Err(AuthError::BadChallenge(format!(
                "unsupported algorithm {other}"
            ))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Md5Sess => "MD5-sess",
            Algorithm::Sha256 => "SHA-256",
            Algorithm::Sha256Sess => "SHA-256-sess",
        }
    }

    fn is_session(self) -> bool {
        matches!(self, Algorithm::Md5Sess | Algorithm::Sha256Sess)
    }

    fn hash(self, input: &str) -> String {
        match self {
            Algorithm::Md5 | Algorithm::Md5Sess => hex_digest::<Md5>(input),
            Algorithm::Sha256 | Algorithm::Sha256Sess => hex_digest::<Sha256>(input),
        }
    }
}

fn hex_digest<D: Digest>(input: &str) -> String {
    D::digest(input.as_bytes())
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// A parsed `Digest` challenge from a 401 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Algorithm,
    /// `true` when the server offered `qop=auth`; `false` selects RFC 2069 responses.
    pub qop_auth: bool,
    pub stale: bool,
}

impl Challenge {
    /// Parses the value of a `WWW-Authenticate` header. Other schemes sharing the
    /// header (e.g. `Basic`) are skipped.
    pub fn parse(header: &str) -> Result<Self, AuthError> {
        let params = digest_params(header).ok_or(AuthError::MissingChallenge)?;

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut algorithm = Algorithm::Md5;
        let mut qop = None;
        let mut stale = false;

        for (key, value) in params {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "algorithm" => algorithm = Algorithm::parse(&value)?,
                "qop" => qop = Some(value),
                "stale" => stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        let qop_auth = match qop {
            None => false,
            Some(offered) => {
                if offered
                    .split(',')
                    .any(|q| q.trim().eq_ignore_ascii_case("auth"))
                {
                    true
                } else {
                    return Err(AuthError::BadChallenge(format!(
                        "no supported qop in `{offered}`"
                    )));
                }
            }
        };

        Ok(Self {
            realm: realm.ok_or_else(|| AuthError::BadChallenge("missing realm".into()))?,
            nonce: nonce.ok_or_else(|| AuthError::BadChallenge("missing nonce".into()))?,
            opaque,
            algorithm,
            qop_auth,
            stale,
        })
    }

    /// Computes the `response` hash for one request.
    pub fn response(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        nonce_count: u32,
        cnonce: &str,
    ) -> String {
        let alg = self.algorithm;
        let mut ha1 = alg.hash(&format!("{username}:{}:{password}", self.realm));
        if alg.is_session() {
            ha1 = alg.hash(&format!("{ha1}:{}:{cnonce}", self.nonce));
        }
        let ha2 = alg.hash(&format!("{method}:{uri}"));

        if self.qop_auth {
            alg.hash(&format!(
                "{ha1}:{}:{nonce_count:08x}:{cnonce}:auth:{ha2}",
                self.nonce
            ))
        } else {
            alg.hash(&format!("{ha1}:{}:{ha2}", self.nonce))
        }
    }

    /// Builds the full `Authorization` header value.
    pub fn authorization(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        nonce_count: u32,
        cnonce: &str,
    ) -> String {
        let response = self.response(username, password, method, uri, nonce_count, cnonce);
        let mut header = format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", algorithm={}, response=\"{response}\"",
            self.realm,
            self.nonce,
            self.algorithm.as_str(),
        );
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        if self.qop_auth {
            header.push_str(&format!(
                ", qop=auth, nc={nonce_count:08x}, cnonce=\"{cnonce}\""
            ));
        }
        header
    }
}

/// Fresh client nonce for one authenticated request.
pub fn client_nonce() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Splits the parameters of the `Digest` challenge out of a header that may carry
/// several schemes.
fn digest_params(header: &str) -> Option<Vec<(String, String)>> {
    let lower = header.to_ascii_lowercase();
    let start = lower
        .match_indices("digest")
        .map(|(idx, _)| idx)
        .find(|&idx| {
            let before_ok = idx == 0 || matches!(lower.as_bytes()[idx - 1], b' ' | b',');
            let after = lower.as_bytes().get(idx + 6);
            before_ok && matches!(after, Some(b' ') | Some(b'\t'))
        })?;
    let mut rest = header[start + 6..].trim_start();
    let mut params = Vec::new();

    loop {
        rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        if rest.is_empty() {
            break;
        }
        let Some(eq) = rest.find('=') else {
            break;
        };
        let key = rest[..eq].trim();
        // A bare token followed by a space is the start of the next scheme.
        if key.contains(char::is_whitespace) {
            break;
        }
        rest = rest[eq + 1..].trim_start();
        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let mut value = String::new();
            let mut chars = quoted.char_indices();
            let mut end = quoted.len();
            while let Some((idx, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => {
                        end = idx + 1;
                        break;
                    }
                    _ => value.push(c),
                }
            }
            rest = &quoted[end.min(quoted.len())..];
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };
        params.push((key.to_string(), value));
    }

    Some(params)
}
