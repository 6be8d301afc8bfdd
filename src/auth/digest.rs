use std::collections::HashMap;

use rand::Rng;
use sha2::{Digest as _, Sha256};

use super::challenges;
use crate::http::method::HttpMethod;
use crate::http::request::ResolvedRequest;
use crate::http::response::ResponseRecord;
use crate::http::RequestError;

const NONCE_COUNT: &str = "00000001";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl Algorithm {
    fn parse(value: Option<&str>) -> Result<Self, RequestError> {
        match value.map(str::to_ascii_uppercase).as_deref() {
            None | Some("MD5") => Ok(Algorithm::Md5),
            Some("MD5-SESS") => Ok(Algorithm::Md5Sess),
            Some("SHA-256") => Ok(Algorithm::Sha256),
            Some("SHA-256-SESS") => Ok(Algorithm::Sha256Sess),
            Some(other) => Err(RequestError::Auth(format!(
                "Unsupported digest algorithm `{other}`"
            ))),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Algorithm::Md5 => "MD5",
            Algorithm::Md5Sess => "MD5-sess",
            Algorithm::Sha256 => "SHA-256",
            Algorithm::Sha256Sess => "SHA-256-sess",
        }
    }

    fn hash(self, input: &str) -> String {
        match self {
            Algorithm::Md5 | Algorithm::Md5Sess => format!("{:x}", md5::compute(input.as_bytes())),
            Algorithm::Sha256 | Algorithm::Sha256Sess => format!("{:x}", Sha256::digest(input.as_bytes())),
        }
    }

    fn is_session(self) -> bool {
        matches!(self, Algorithm::Md5Sess | Algorithm::Sha256Sess)
    }
}

/// Parameters of a `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Option<String>,
}

impl DigestChallenge {
    pub fn parse(header: &str) -> Result<Self, RequestError> {
        let trimmed = header.trim();
        let rest = match trimmed.get(..6) {
            Some(scheme) if scheme.eq_ignore_ascii_case("digest") => &trimmed[6..],
            _ => return Err(RequestError::Auth(format!("Not a digest challenge: `{header}`"))),
        };

        let mut params = parse_params(rest);
        let nonce = params
            .remove("nonce")
            .ok_or_else(|| RequestError::Auth("Digest challenge has no nonce".into()))?;

        Ok(Self {
            realm: params.remove("realm").unwrap_or_default(),
            nonce,
            opaque: params.remove("opaque"),
            algorithm: params.remove("algorithm"),
            qop: params.remove("qop"),
        })
    }
}

/// Split `key=value, key="quoted, value"` pairs. Keys are lowercased.
fn parse_params(input: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.trim().is_empty() {
            break;
        }
        if chars.next() != Some('=') {
            continue;
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    other => value.push(other),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }

        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    params
}

/// Build the `Authorization` value answering `challenge`.
pub fn digest_authorization(
    username: &str,
    password: &str,
    challenge: &DigestChallenge,
    method: HttpMethod,
    uri: &str,
    cnonce: &str,
) -> Result<String, RequestError> {
    let algorithm = Algorithm::parse(challenge.algorithm.as_deref())?;
    let qop = match challenge.qop.as_deref() {
        None => None,
        Some(offered) => {
            if offered.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")) {
                Some("auth")
            } else {
                return Err(RequestError::Auth(format!(
                    "Unsupported digest qop `{offered}`"
                )));
            }
        }
    };

    let mut ha1 = algorithm.hash(&format!("{username}:{}:{password}", challenge.realm));
    if algorithm.is_session() {
        ha1 = algorithm.hash(&format!("{ha1}:{}:{cnonce}", challenge.nonce));
    }
    let ha2 = algorithm.hash(&format!("{method}:{uri}"));

    let response = match qop {
        Some(qop) => algorithm.hash(&format!(
            "{ha1}:{}:{NONCE_COUNT}:{cnonce}:{qop}:{ha2}",
            challenge.nonce
        )),
        None => algorithm.hash(&format!("{ha1}:{}:{ha2}", challenge.nonce)),
    };

    let mut header = format!(
        "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", algorithm={}",
        challenge.realm,
        challenge.nonce,
        algorithm.label()
    );
    if let Some(qop) = qop {
        header.push_str(&format!(", qop={qop}, nc={NONCE_COUNT}, cnonce=\"{cnonce}\""));
    }
    header.push_str(&format!(", response=\"{response}\""));
    if let Some(opaque) = &challenge.opaque {
        header.push_str(&format!(", opaque=\"{opaque}\""));
    }
    Ok(header)
}

#[derive(Debug)]
pub struct DigestHandshake {
    username: String,
    password: String,
    answered: bool,
}

impl DigestHandshake {
    pub fn new(username: String, password: String) -> Self {
        Self {
            username,
            password,
            answered: false,
        }
    }

    /// Answer the first digest challenge; a second `401` is final.
    pub fn next_authorization(
        &mut self,
        request: &ResolvedRequest,
        response: &ResponseRecord,
    ) -> Result<Option<String>, RequestError> {
        if self.answered || response.status != 401 {
            return Ok(None);
        }
        let Some(header) = challenges(response, "digest").next() else {
            return Ok(None);
        };

        let challenge = DigestChallenge::parse(header)?;
        let url = request.parsed_url()?;
        let uri = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        };
        let cnonce = format!("{:016x}", rand::thread_rng().gen::<u64>());

        self.answered = true;
        digest_authorization(
            &self.username,
            &self.password,
            &challenge,
            request.method,
            &uri,
            &cnonce,
        )
        .map(Some)
    }
}
