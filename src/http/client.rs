use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Identity, Proxy};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::method::HttpMethod;
use super::policy::{host_matches, LoadedCertificate, RequestPolicy, RequesterOptions};
use super::request::{KeyValue, ResolvedBody, ResolvedRequest};
use super::response::ResponseRecord;
use super::RequestError;
use crate::auth::AuthHandshake;
use crate::history::{ExchangeKind, ExecutionHistory, HistoryEntry};
use crate::runner::control::ControlListener;

const TRACE_HEADER: &str = "Runman-Token";

/// Cookie visible to a URL at the time of the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
}

/// Result of executing one collection request, including every redirect
/// and auth round trip.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    /// The request as last sent, after redirects and auth.
    pub request: ResolvedRequest,
    pub result: Result<ResponseRecord, RequestError>,
    pub history: ExecutionHistory,
    pub elapsed_ms: u64,
}

/// Sends resolved requests for a run. Owns the cookie jar and the TLS
/// material shared by every request.
pub struct Requester {
    options: RequesterOptions,
    jar: Arc<Jar>,
    certificates: Vec<LoadedCertificate>,
    ca: Option<reqwest::Certificate>,
}

impl Requester {
    pub fn new(options: RequesterOptions) -> Result<Self, String> {
        let certificates = options
            .certificates
            .iter()
            .map(|rule| rule.load())
            .collect::<Result<Vec<_>, _>>()?;

        let ca = match &options.ca_file {
            Some(path) => {
                let pem = std::fs::read(path)
                    .map_err(|err| format!("Failed to read CA file `{}`: {err}", path.display()))?;
                Some(
                    reqwest::Certificate::from_pem(&pem)
                        .map_err(|err| format!("Invalid CA file `{}`: {err}", path.display()))?,
                )
            }
            None => None,
        };

        Ok(Self {
            options,
            jar: Arc::new(Jar::default()),
            certificates,
            ca,
        })
    }

    pub fn options(&self) -> &RequesterOptions {
        &self.options
    }

    /// Add a `Set-Cookie` style string to the jar as if `url` had sent it.
    pub fn add_cookie(&self, cookie: &str, url: &str) -> Result<(), RequestError> {
        let url = Url::parse(url).map_err(|err| RequestError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        self.jar.add_cookie_str(cookie, &url);
        Ok(())
    }

    pub fn cookies_for(&self, url: &str) -> Vec<CookieRecord> {
        let Ok(url) = Url::parse(url) else {
            return Vec::new();
        };
        let Some(header) = self.jar.cookies(&url) else {
            return Vec::new();
        };
        header
            .to_str()
            .unwrap_or_default()
            .split(';')
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                Some(CookieRecord {
                    name: name.to_string(),
                    value: value.to_string(),
                })
            })
            .collect()
    }

    /// Add the implicit headers every request carries.
    pub fn prepare(&self, request: &mut ResolvedRequest) {
        if !request.has_header("user-agent") {
            request
                .headers
                .push(KeyValue::new("User-Agent", concat!("runman/", env!("CARGO_PKG_VERSION"))));
        }
        if !request.has_header("accept") {
            request.headers.push(KeyValue::new("Accept", "*/*"));
        }
        if self.options.implicit_cache_control && !request.has_header("cache-control") {
            request.headers.push(KeyValue::new("Cache-Control", "no-cache"));
        }
        if self.options.implicit_trace_header && !request.has_header(TRACE_HEADER) {
            request
                .headers
                .push(KeyValue::new(TRACE_HEADER, Uuid::new_v4().to_string()));
        }
    }

    pub async fn execute(
        &self,
        mut request: ResolvedRequest,
        mut handshake: Option<AuthHandshake>,
        policy: &RequestPolicy,
        control: &mut ControlListener,
    ) -> RequestOutcome {
        let started = Instant::now();
        let mut history = ExecutionHistory::new();
        let mut clients = ClientCache::default();

        let mut result = self
            .send_following_redirects(
                &mut request,
                policy,
                ExchangeKind::Initial,
                &mut history,
                &mut clients,
                control,
            )
            .await;

        if let Some(handshake) = handshake.as_mut() {
            while let Ok(response) = &result {
                let authorization = match handshake.next_authorization(&request, response) {
                    Ok(Some(value)) => value,
                    Ok(None) => break,
                    Err(err) => {
                        result = Err(err);
                        break;
                    }
                };
                request.set_header("Authorization", authorization);
                result = self
                    .send_following_redirects(
                        &mut request,
                        policy,
                        ExchangeKind::Auth,
                        &mut history,
                        &mut clients,
                        control,
                    )
                    .await;
            }
        }

        RequestOutcome {
            request,
            result,
            history,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn send_following_redirects(
        &self,
        request: &mut ResolvedRequest,
        policy: &RequestPolicy,
        first_kind: ExchangeKind,
        history: &mut ExecutionHistory,
        clients: &mut ClientCache,
        control: &mut ControlListener,
    ) -> Result<ResponseRecord, RequestError> {
        let mut kind = first_kind;
        let mut redirects = 0u32;

        loop {
            let url = request.parsed_url()?;
            let host = url.host_str().unwrap_or_default().to_string();
            let client = clients.get_or_build(self, policy, &host)?;

            let timestamp = now_ms();
            let result = send_once(&client, request, control).await;
            history.push(HistoryEntry {
                timestamp,
                kind,
                method: request.method,
                url: request.url.clone(),
                request_headers: request.headers.clone(),
                status: result.as_ref().ok().map(|r| r.status),
                duration_ms: result.as_ref().map(|r| r.time).unwrap_or_default(),
            });
            let response = result?;
            debug!(
                method = %request.method,
                url = %request.url,
                status = response.status,
                elapsed_ms = response.time,
                "exchange completed"
            );

            if !policy.follow_redirects || !response.is_redirect() {
                return Ok(response);
            }
            if redirects >= policy.max_redirects {
                return Err(RequestError::TooManyRedirects {
                    max: policy.max_redirects,
                    url: request.url.clone(),
                });
            }
            redirects += 1;

            let location = response.header("location").unwrap_or_default();
            let next = url.join(location).map_err(|err| RequestError::InvalidUrl {
                url: location.to_string(),
                reason: err.to_string(),
            })?;
            redirect_request(request, &url, &next, response.status, policy);
            kind = ExchangeKind::Redirect;
        }
    }

    fn build_client(&self, policy: &RequestPolicy, host: &str) -> Result<Client, RequestError> {
        let mut builder = Client::builder().redirect(reqwest::redirect::Policy::none());

        // Timeout
        if let Some(ms) = self.options.timeout_ms {
            if ms > 0 {
                builder = builder.timeout(Duration::from_millis(ms));
            }
        }

        if policy.use_cookies {
            builder = builder.cookie_provider(self.jar.clone());
        }

        // SSL verification
        if !policy.strict_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(min) = policy.min_tls {
            builder = builder.min_tls_version(min.into());
        }
        if let Some(max) = policy.max_tls {
            builder = builder.max_tls_version(max.into());
        }
        if let Some(ciphers) = &policy.cipher_selection {
            warn!(
                host,
                ciphers = %ciphers.join(":"),
                "TLS cipher selection is not configurable with the rustls backend; using defaults"
            );
        }
        if let Some(ca) = &self.ca {
            builder = builder.add_root_certificate(ca.clone());
        }
        if let Some(cert) = self.certificates.iter().find(|c| host_matches(&c.host, host)) {
            let identity = Identity::from_pem(&cert.pem)
                .map_err(|err| RequestError::Client(format!("Invalid client certificate: {err}")))?;
            builder = builder.identity(identity);
        }

        // Proxy
        match self.options.proxies.iter().find(|rule| rule.applies_to(host)) {
            Some(rule) => {
                let mut proxy = Proxy::all(&rule.url)
                    .map_err(|err| RequestError::Client(format!("Invalid proxy URL: {err}")))?;
                if let Some(username) = &rule.username {
                    proxy = proxy.basic_auth(username, rule.password.as_deref().unwrap_or_default());
                }
                builder = builder.proxy(proxy);
            }
            None if !self.options.use_system_proxy => builder = builder.no_proxy(),
            None => {}
        }

        builder
            .build()
            .map_err(|err| RequestError::Client(err.to_string()))
    }
}

/// Clients keyed by host so an auth handshake keeps its connection.
#[derive(Default)]
struct ClientCache {
    entries: Vec<(String, Client)>,
}

impl ClientCache {
    fn get_or_build(
        &mut self,
        requester: &Requester,
        policy: &RequestPolicy,
        host: &str,
    ) -> Result<Client, RequestError> {
        if let Some((_, client)) = self.entries.iter().find(|(h, _)| h == host) {
            return Ok(client.clone());
        }
        let client = requester.build_client(policy, host)?;
        self.entries.push((host.to_string(), client.clone()));
        Ok(client)
    }
}

pub fn build_headers(input: &[KeyValue]) -> Result<HeaderMap, RequestError> {
    let mut headers = HeaderMap::new();

    for header in input {
        if header.key.is_empty() {
            continue;
        }

        let name = HeaderName::from_bytes(header.key.as_bytes())
            .map_err(|err| RequestError::InvalidHeader(format!("name `{}`: {err}", header.key)))?;
        let value = HeaderValue::from_str(&header.value)
            .map_err(|err| RequestError::InvalidHeader(format!("value for `{}`: {err}", header.key)))?;
        headers.append(name, value);
    }

    Ok(headers)
}

async fn send_once(
    client: &Client,
    request: &ResolvedRequest,
    control: &mut ControlListener,
) -> Result<ResponseRecord, RequestError> {
    let method: reqwest::Method = request.method.into();
    let mut builder = client
        .request(method, request.parsed_url()?)
        .headers(build_headers(&request.headers)?);

    match &request.body {
        ResolvedBody::Empty => {}
        ResolvedBody::Bytes(bytes) => builder = builder.body(bytes.clone()),
        ResolvedBody::Multipart(fields) => {
            let mut form = reqwest::multipart::Form::new();
            for (key, value) in fields {
                form = form.text(key.clone(), value.clone());
            }
            builder = builder.multipart(form);
        }
    }

    let start = Instant::now();

    let response = tokio::select! {
        res = builder.send() => res.map_err(|err| RequestError::from_reqwest(&err))?,
        _ = control.aborted() => return Err(RequestError::Cancelled),
    };

    let status = response.status();
    let status_text = status.canonical_reason().unwrap_or("Unknown").to_string();
    let headers: Vec<KeyValue> = response
        .headers()
        .iter()
        .map(|(key, value)| {
            KeyValue::new(
                key.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("text/plain")
        .to_string();

    let bytes = tokio::select! {
        body = response.bytes() => body.map_err(|err| RequestError::Read(err.to_string()))?,
        _ = control.aborted() => return Err(RequestError::Cancelled),
    };

    Ok(ResponseRecord {
        status: status.as_u16(),
        status_text,
        headers,
        body: String::from_utf8_lossy(&bytes).into_owned(),
        time: start.elapsed().as_millis() as u64,
        size: bytes.len() as u64,
        content_type,
    })
}

/// Rewrite `request` to follow a redirect from `from` to `to`.
fn redirect_request(
    request: &mut ResolvedRequest,
    from: &Url,
    to: &Url,
    status: u16,
    policy: &RequestPolicy,
) {
    let switch_to_get = match status {
        303 => request.method != HttpMethod::Head,
        301 | 302 => !policy.follow_original_http_method && request.method != HttpMethod::Head,
        _ => false,
    };
    if switch_to_get {
        request.method = HttpMethod::Get;
        request.body = ResolvedBody::Empty;
        request.remove_header("content-type");
        request.remove_header("content-length");
    }

    let same_origin =
        from.host_str() == to.host_str() && from.port_or_known_default() == to.port_or_known_default();
    if !same_origin && !policy.follow_authorization_header {
        request.remove_header("authorization");
    }

    if policy.remove_referer_header_on_redirect {
        request.remove_header("referer");
    } else {
        let mut referer = from.clone();
        referer.set_fragment(None);
        let _ = referer.set_password(None);
        let _ = referer.set_username("");
        request.set_header("Referer", referer.to_string());
    }

    request.url = to.to_string();
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or_default()
}
