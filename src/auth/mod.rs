//! # Authentication
//!
//! Static schemes (basic, bearer, API key, OAuth2 access token) are written
//! onto the request before it is sent. Challenge schemes (digest, NTLM) react
//! to a `401` and replay the request with the computed credentials.

mod digest;
mod ntlm;

pub use digest::{digest_authorization, DigestChallenge};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::environment::VariableScopes;
use crate::http::request::ResolvedRequest;
use crate::http::response::ResponseRecord;
use crate::http::RequestError;

/// Where to place an API key or access token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApiKeyLocation {
    #[default]
    Header,
    Query,
}

fn default_bearer_prefix() -> String {
    "Bearer".into()
}

fn default_token_param() -> String {
    "access_token".into()
}

/// Authentication attached to a request, folder or collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    /// Explicitly no auth. Stops inheritance from parents.
    Noauth,
    Basic {
        username: String,
        #[serde(default)]
        password: String,
    },
    Bearer {
        token: String,
    },
    Apikey {
        key: String,
        #[serde(default)]
        value: String,
        #[serde(default, rename = "in")]
        location: ApiKeyLocation,
    },
    Oauth2 {
        #[serde(rename = "accessToken")]
        access_token: String,
        #[serde(default = "default_bearer_prefix", rename = "headerPrefix")]
        header_prefix: String,
        #[serde(default, rename = "addTo")]
        add_to: ApiKeyLocation,
        #[serde(default = "default_token_param", rename = "queryParam")]
        query_param: String,
    },
    Digest {
        username: String,
        #[serde(default)]
        password: String,
    },
    Ntlm {
        username: String,
        #[serde(default)]
        password: String,
        #[serde(default)]
        domain: String,
        #[serde(default)]
        workstation: String,
    },
}

impl AuthConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthConfig::Noauth => "noauth",
            AuthConfig::Basic { .. } => "basic",
            AuthConfig::Bearer { .. } => "bearer",
            AuthConfig::Apikey { .. } => "apikey",
            AuthConfig::Oauth2 { .. } => "oauth2",
            AuthConfig::Digest { .. } => "digest",
            AuthConfig::Ntlm { .. } => "ntlm",
        }
    }

    /// Copy with every field interpolated.
    pub fn interpolated(&self, scopes: &VariableScopes) -> AuthConfig {
        let i = |value: &str| scopes.interpolate(value);
        match self {
            AuthConfig::Noauth => AuthConfig::Noauth,
            AuthConfig::Basic { username, password } => AuthConfig::Basic {
                username: i(username),
                password: i(password),
            },
            AuthConfig::Bearer { token } => AuthConfig::Bearer { token: i(token) },
            AuthConfig::Apikey {
                key,
                value,
                location,
            } => AuthConfig::Apikey {
                key: i(key),
                value: i(value),
                location: *location,
            },
            AuthConfig::Oauth2 {
                access_token,
                header_prefix,
                add_to,
                query_param,
            } => AuthConfig::Oauth2 {
                access_token: i(access_token),
                header_prefix: i(header_prefix),
                add_to: *add_to,
                query_param: i(query_param),
            },
            AuthConfig::Digest { username, password } => AuthConfig::Digest {
                username: i(username),
                password: i(password),
            },
            AuthConfig::Ntlm {
                username,
                password,
                domain,
                workstation,
            } => AuthConfig::Ntlm {
                username: i(username),
                password: i(password),
                domain: i(domain),
                workstation: i(workstation),
            },
        }
    }

    /// Write static credentials onto the request. Challenge schemes return
    /// a handshake that drives the replay after the first response.
    pub fn apply(&self, request: &mut ResolvedRequest) -> Result<Option<AuthHandshake>, RequestError> {
        match self {
            AuthConfig::Noauth => {}
            AuthConfig::Basic { username, password } => {
                if username.trim().is_empty() {
                    return Err(RequestError::Auth("Basic auth username cannot be empty".into()));
                }
                let encoded = BASE64.encode(format!("{username}:{password}"));
                request.set_header("Authorization", format!("Basic {encoded}"));
            }
            AuthConfig::Bearer { token } => {
                let token = token.trim();
                if token.is_empty() {
                    return Err(RequestError::Auth("Bearer token cannot be empty".into()));
                }
                request.set_header("Authorization", format!("Bearer {token}"));
            }
            AuthConfig::Apikey {
                key,
                value,
                location,
            } => {
                let key = key.trim();
                if key.is_empty() {
                    return Err(RequestError::Auth("API key name cannot be empty".into()));
                }
                match location {
                    ApiKeyLocation::Header => request.set_header(key, value.trim()),
                    ApiKeyLocation::Query => request.append_query(key, value.trim())?,
                }
            }
            AuthConfig::Oauth2 {
                access_token,
                header_prefix,
                add_to,
                query_param,
            } => {
                let token = access_token.trim();
                if token.is_empty() {
                    return Err(RequestError::Auth("OAuth2 access token cannot be empty".into()));
                }
                match add_to {
                    ApiKeyLocation::Header => {
                        let prefix = header_prefix.trim();
                        let value = if prefix.is_empty() {
                            token.to_string()
                        } else {
                            format!("{prefix} {token}")
                        };
                        request.set_header("Authorization", value);
                    }
                    ApiKeyLocation::Query => request.append_query(query_param.trim(), token)?,
                }
            }
            AuthConfig::Digest { username, password } => {
                if username.trim().is_empty() {
                    return Err(RequestError::Auth("Digest auth username cannot be empty".into()));
                }
                return Ok(Some(AuthHandshake::Digest(digest::DigestHandshake::new(
                    username.clone(),
                    password.clone(),
                ))));
            }
            AuthConfig::Ntlm {
                username,
                password,
                domain,
                workstation,
            } => {
                if username.trim().is_empty() {
                    return Err(RequestError::Auth("NTLM username cannot be empty".into()));
                }
                return Ok(Some(AuthHandshake::Ntlm(ntlm::NtlmHandshake::new(
                    username.clone(),
                    password.clone(),
                    domain.clone(),
                    workstation.clone(),
                ))));
            }
        }
        Ok(None)
    }
}

/// State of a challenge/response exchange for one request.
#[derive(Debug)]
pub enum AuthHandshake {
    Digest(digest::DigestHandshake),
    Ntlm(ntlm::NtlmHandshake),
}

impl AuthHandshake {
    /// Given the last response, return the `Authorization` value for the
    /// next round, or `None` when the handshake is finished.
    pub fn next_authorization(
        &mut self,
        request: &ResolvedRequest,
        response: &ResponseRecord,
    ) -> Result<Option<String>, RequestError> {
        match self {
            AuthHandshake::Digest(digest) => digest.next_authorization(request, response),
            AuthHandshake::Ntlm(ntlm) => ntlm.next_authorization(response),
        }
    }
}

/// Values of every `WWW-Authenticate` header whose scheme is `scheme`.
fn challenges<'a>(response: &'a ResponseRecord, scheme: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    response
        .header_values("www-authenticate")
        .map(str::trim)
        .filter(move |value| {
            value
                .get(..scheme.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::VariableList;
    use crate::http::method::HttpMethod;
    use crate::http::request::ResolvedBody;

    fn request() -> ResolvedRequest {
        ResolvedRequest {
            method: HttpMethod::Get,
            url: "https://api.example.com/users".into(),
            headers: Vec::new(),
            body: ResolvedBody::Empty,
        }
    }

    #[test]
    fn basic_sets_encoded_header() {
        let mut req = request();
        let auth = AuthConfig::Basic {
            username: "user".into(),
            password: "pass".into(),
        };
        assert!(auth.apply(&mut req).unwrap().is_none());
        assert_eq!(req.header("authorization"), Some("Basic dXNlcjpwYXNz"));
    }

    #[test]
    fn bearer_requires_token() {
        let mut req = request();
        let auth = AuthConfig::Bearer { token: "  ".into() };
        assert!(matches!(auth.apply(&mut req), Err(RequestError::Auth(_))));
    }

    #[test]
    fn bearer_replaces_existing_authorization() {
        let mut req = request();
        req.set_header("authorization", "Basic old");
        AuthConfig::Bearer { token: "t".into() }.apply(&mut req).unwrap();
        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.header("Authorization"), Some("Bearer t"));
    }

    #[test]
    fn apikey_in_query() {
        let mut req = request();
        let auth = AuthConfig::Apikey {
            key: "api_key".into(),
            value: "secret".into(),
            location: ApiKeyLocation::Query,
        };
        auth.apply(&mut req).unwrap();
        assert_eq!(req.url, "https://api.example.com/users?api_key=secret");
        assert!(req.headers.is_empty());
    }

    #[test]
    fn oauth2_header_prefix() {
        let mut req = request();
        let auth: AuthConfig =
            serde_json::from_str(r#"{"type":"oauth2","accessToken":"tok","headerPrefix":"Token"}"#).unwrap();
        auth.apply(&mut req).unwrap();
        assert_eq!(req.header("authorization"), Some("Token tok"));
    }

    #[test]
    fn challenge_schemes_return_handshakes() {
        let mut req = request();
        let digest = AuthConfig::Digest {
            username: "u".into(),
            password: "p".into(),
        };
        assert!(matches!(
            digest.apply(&mut req).unwrap(),
            Some(AuthHandshake::Digest(_))
        ));
        assert!(req.headers.is_empty());

        let ntlm = AuthConfig::Ntlm {
            username: "u".into(),
            password: "p".into(),
            domain: String::new(),
            workstation: String::new(),
        };
        assert!(matches!(
            ntlm.apply(&mut req).unwrap(),
            Some(AuthHandshake::Ntlm(_))
        ));
    }

    #[test]
    fn interpolates_fields() {
        let scopes = VariableScopes {
            environment: [("user".to_string(), "alice".to_string())]
                .into_iter()
                .collect::<VariableList>(),
            ..Default::default()
        };
        let auth = AuthConfig::Basic {
            username: "{{user}}".into(),
            password: "pw".into(),
        };
        assert_eq!(
            auth.interpolated(&scopes),
            AuthConfig::Basic {
                username: "alice".into(),
                password: "pw".into(),
            }
        );
    }

    #[test]
    fn deserializes_tagged_config() {
        let auth: AuthConfig = serde_json::from_str(r#"{"type":"noauth"}"#).unwrap();
        assert_eq!(auth, AuthConfig::Noauth);
        let auth: AuthConfig =
            serde_json::from_str(r#"{"type":"apikey","key":"X-Key","value":"v"}"#).unwrap();
        assert_eq!(auth.kind(), "apikey");
    }
}
