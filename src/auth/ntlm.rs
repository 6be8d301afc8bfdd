use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use super::challenges;
use crate::http::response::ResponseRecord;
use crate::http::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    Negotiated(Scheme),
    Done,
}

/// `WWW-Authenticate` scheme the server offered. Every leg uses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Ntlm,
    Negotiate,
}

impl Scheme {
    fn label(self) -> &'static str {
        match self {
            Scheme::Ntlm => "NTLM",
            Scheme::Negotiate => "Negotiate",
        }
    }

    fn offered(response: &ResponseRecord) -> Option<Scheme> {
        [Scheme::Ntlm, Scheme::Negotiate]
            .into_iter()
            .find(|scheme| challenges(response, scheme.label()).next().is_some())
    }

    /// Base64 payload following the scheme name, if any.
    fn token(self, response: &ResponseRecord) -> Option<&str> {
        let skip = self.label().len();
        challenges(response, self.label())
            .filter_map(move |value| value.get(skip..).map(str::trim))
            .find(|token| !token.is_empty())
    }
}

/// Three-message NTLM handshake: negotiate, challenge, authenticate.
pub struct NtlmHandshake {
    username: String,
    password: String,
    domain: String,
    workstation: String,
    stage: Stage,
}

impl fmt::Debug for NtlmHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NtlmHandshake")
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("workstation", &self.workstation)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

impl NtlmHandshake {
    pub fn new(username: String, password: String, domain: String, workstation: String) -> Self {
        Self {
            username,
            password,
            domain,
            workstation,
            stage: Stage::Start,
        }
    }

    fn credentials(&self) -> ntlmclient::Credentials {
        ntlmclient::Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
            domain: self.domain.clone(),
        }
    }

    pub fn next_authorization(&mut self, response: &ResponseRecord) -> Result<Option<String>, RequestError> {
        if response.status != 401 {
            self.stage = Stage::Done;
            return Ok(None);
        }

        match self.stage {
            Stage::Start => {
                let Some(scheme) = Scheme::offered(response) else {
                    self.stage = Stage::Done;
                    return Ok(None);
                };
                self.stage = Stage::Negotiated(scheme);
                Ok(Some(format!("{} {}", scheme.label(), self.negotiate_message()?)))
            }
            Stage::Negotiated(scheme) => {
                self.stage = Stage::Done;
                match scheme.token(response) {
                    Some(token) => Ok(Some(format!(
                        "{} {}",
                        scheme.label(),
                        self.authenticate_message(token)?
                    ))),
                    None => Ok(None),
                }
            }
            Stage::Done => Ok(None),
        }
    }

    fn negotiate_message(&self) -> Result<String, RequestError> {
        let flags = ntlmclient::Flags::NEGOTIATE_UNICODE
            | ntlmclient::Flags::REQUEST_TARGET
            | ntlmclient::Flags::NEGOTIATE_NTLM
            | ntlmclient::Flags::NEGOTIATE_WORKSTATION_SUPPLIED;
        let message = ntlmclient::Message::Negotiate(ntlmclient::NegotiateMessage {
            flags,
            supplied_domain: String::new(),
            supplied_workstation: self.workstation.clone(),
            os_version: Default::default(),
        });
        let bytes = message
            .to_bytes()
            .map_err(|err| RequestError::Auth(format!("Failed to encode NTLM negotiate message: {err:?}")))?;
        Ok(BASE64.encode(bytes))
    }

    fn authenticate_message(&self, challenge_b64: &str) -> Result<String, RequestError> {
        let challenge_bytes = BASE64
            .decode(challenge_b64)
            .map_err(|err| RequestError::Auth(format!("NTLM challenge is not valid base64: {err}")))?;
        let challenge = match ntlmclient::Message::try_from(challenge_bytes.as_slice()) {
            Ok(ntlmclient::Message::Challenge(challenge)) => challenge,
            Ok(other) => {
                return Err(RequestError::Auth(format!(
                    "Expected NTLM challenge message, got {other:?}"
                )))
            }
            Err(err) => {
                return Err(RequestError::Auth(format!(
                    "Failed to decode NTLM challenge: {err:?}"
                )))
            }
        };

        let target_info: Vec<u8> = challenge
            .target_information
            .iter()
            .flat_map(|entry| entry.to_bytes())
            .collect();
        let credentials = self.credentials();
        let response = ntlmclient::respond_challenge_ntlm_v2(
            challenge.challenge,
            &target_info,
            ntlmclient::get_ntlm_time(),
            &credentials,
        );

        let flags = ntlmclient::Flags::NEGOTIATE_UNICODE | ntlmclient::Flags::NEGOTIATE_NTLM;
        let message = response.to_message(&credentials, &self.workstation, flags);
        let bytes = message
            .to_bytes()
            .map_err(|err| RequestError::Auth(format!("Failed to encode NTLM authenticate message: {err:?}")))?;
        Ok(BASE64.encode(bytes))
    }
}
