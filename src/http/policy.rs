use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "TLSv1")]
    Tls1_0,
    #[serde(rename = "TLSv1.1")]
    Tls1_1,
    #[serde(rename = "TLSv1.2")]
    Tls1_2,
    #[serde(rename = "TLSv1.3")]
    Tls1_3,
}

impl TlsVersion {
    pub const ALL: [TlsVersion; 4] = [
        TlsVersion::Tls1_0,
        TlsVersion::Tls1_1,
        TlsVersion::Tls1_2,
        TlsVersion::Tls1_3,
    ];
}

impl From<TlsVersion> for reqwest::tls::Version {
    fn from(version: TlsVersion) -> Self {
        match version {
            TlsVersion::Tls1_0 => reqwest::tls::Version::TLS_1_0,
            TlsVersion::Tls1_1 => reqwest::tls::Version::TLS_1_1,
            TlsVersion::Tls1_2 => reqwest::tls::Version::TLS_1_2,
            TlsVersion::Tls1_3 => reqwest::tls::Version::TLS_1_3,
        }
    }
}

/// Per-request transport behaviour. Set on the collection, folders or the
/// item; the innermost value wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_redirects: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_redirects: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict_ssl: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_cookies: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_original_http_method: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follow_authorization_header: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_referer_header_on_redirect: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_body_pruning: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_disabled_protocols: Option<Vec<TlsVersion>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cipher_selection: Option<Vec<String>>,
}

impl ProtocolProfile {
    /// Overlay `inner` on top of `self`.
    pub fn merge(&self, inner: &ProtocolProfile) -> ProtocolProfile {
        ProtocolProfile {
            follow_redirects: inner.follow_redirects.or(self.follow_redirects),
            max_redirects: inner.max_redirects.or(self.max_redirects),
            strict_ssl: inner.strict_ssl.or(self.strict_ssl),
            disable_cookies: inner.disable_cookies.or(self.disable_cookies),
            follow_original_http_method: inner
                .follow_original_http_method
                .or(self.follow_original_http_method),
            follow_authorization_header: inner
                .follow_authorization_header
                .or(self.follow_authorization_header),
            remove_referer_header_on_redirect: inner
                .remove_referer_header_on_redirect
                .or(self.remove_referer_header_on_redirect),
            disable_body_pruning: inner.disable_body_pruning.or(self.disable_body_pruning),
            tls_disabled_protocols: inner
                .tls_disabled_protocols
                .clone()
                .or_else(|| self.tls_disabled_protocols.clone()),
            tls_cipher_selection: inner
                .tls_cipher_selection
                .clone()
                .or_else(|| self.tls_cipher_selection.clone()),
        }
    }
}

/// Route matching hosts through a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRule {
    pub url: String,
    #[serde(default = "match_all")]
    pub host: String,
    #[serde(default)]
    pub bypass: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyRule {
    pub fn applies_to(&self, host: &str) -> bool {
        host_matches(&self.host, host) && !self.bypass.iter().any(|b| host_matches(b, host))
    }
}

/// Client certificate presented to matching hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRule {
    #[serde(default = "match_all")]
    pub host: String,
    pub cert: PathBuf,
    pub key: PathBuf,
}

fn match_all() -> String {
    "*".into()
}

/// A certificate rule with its PEM material read from disk.
#[derive(Debug, Clone)]
pub struct LoadedCertificate {
    pub host: String,
    pub pem: Vec<u8>,
}

impl CertificateRule {
    pub fn load(&self) -> Result<LoadedCertificate, String> {
        let mut pem = fs::read(&self.cert).map_err(|err| {
            format!("Failed to read client certificate `{}`: {err}", self.cert.display())
        })?;
        let key = fs::read(&self.key)
            .map_err(|err| format!("Failed to read client key `{}`: {err}", self.key.display()))?;
        pem.push(b'\n');
        pem.extend_from_slice(&key);
        Ok(LoadedCertificate {
            host: self.host.clone(),
            pem,
        })
    }
}

/// Run-wide requester defaults. Protocol profiles override the redirect,
/// SSL and cookie switches per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequesterOptions {
    pub follow_redirects: bool,
    pub max_redirects: u32,
    pub strict_ssl: bool,
    pub cookie_jar: bool,
    pub implicit_cache_control: bool,
    pub implicit_trace_header: bool,
    pub use_system_proxy: bool,
    pub timeout_ms: Option<u64>,
    pub proxies: Vec<ProxyRule>,
    pub certificates: Vec<CertificateRule>,
    pub ca_file: Option<PathBuf>,
}

impl Default for RequesterOptions {
    fn default() -> Self {
        Self {
            follow_redirects: true,
            max_redirects: 10,
            strict_ssl: true,
            cookie_jar: true,
            implicit_cache_control: true,
            implicit_trace_header: true,
            use_system_proxy: false,
            timeout_ms: None,
            proxies: Vec::new(),
            certificates: Vec::new(),
            ca_file: None,
        }
    }
}

/// Effective policy for one request: run defaults with the merged profile
/// applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPolicy {
    pub follow_redirects: bool,
    pub max_redirects: u32,
    pub strict_ssl: bool,
    pub use_cookies: bool,
    pub follow_original_http_method: bool,
    pub follow_authorization_header: bool,
    pub remove_referer_header_on_redirect: bool,
    pub min_tls: Option<TlsVersion>,
    pub max_tls: Option<TlsVersion>,
    pub cipher_selection: Option<Vec<String>>,
}

impl RequestPolicy {
    pub fn new(options: &RequesterOptions, profile: &ProtocolProfile) -> Result<Self, RequestError> {
        let (min_tls, max_tls) = match &profile.tls_disabled_protocols {
            Some(disabled) if !disabled.is_empty() => {
                let (min, max) = enabled_tls_range(disabled)?;
                (Some(min), Some(max))
            }
            _ => (None, None),
        };

        Ok(Self {
            follow_redirects: profile.follow_redirects.unwrap_or(options.follow_redirects),
            max_redirects: profile.max_redirects.unwrap_or(options.max_redirects),
            strict_ssl: profile.strict_ssl.unwrap_or(options.strict_ssl),
            use_cookies: options.cookie_jar && !profile.disable_cookies.unwrap_or(false),
            follow_original_http_method: profile.follow_original_http_method.unwrap_or(false),
            follow_authorization_header: profile.follow_authorization_header.unwrap_or(false),
            remove_referer_header_on_redirect: profile
                .remove_referer_header_on_redirect
                .unwrap_or(false),
            min_tls,
            max_tls,
            cipher_selection: profile.tls_cipher_selection.clone().filter(|c| !c.is_empty()),
        })
    }
}

/// Highest contiguous run of versions not in `disabled`. A client can only
/// be given a min/max pair, so enabled versions below a disabled gap are
/// dropped.
fn enabled_tls_range(disabled: &[TlsVersion]) -> Result<(TlsVersion, TlsVersion), RequestError> {
    let enabled = |v: &TlsVersion| !disabled.contains(v);
    let max = TlsVersion::ALL
        .into_iter()
        .rev()
        .find(enabled)
        .ok_or_else(|| RequestError::Client("every TLS protocol version is disabled".into()))?;
    let min = TlsVersion::ALL
        .into_iter()
        .rev()
        .skip_while(|v| *v > max)
        .take_while(enabled)
        .last()
        .unwrap_or(max);

    let dropped: Vec<TlsVersion> = TlsVersion::ALL
        .into_iter()
        .filter(|v| *v < min && enabled(v))
        .collect();
    if !dropped.is_empty() {
        warn!(
            ?disabled,
            ?dropped,
            "disabled TLS versions leave a gap; only the highest contiguous range is allowed"
        );
    }
    Ok((min, max))
}

/// `*` matches everything, `*.example.com` matches any subdomain, anything
/// else is an exact, case-insensitive host match.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = pattern.trim();
    if pattern == "*" {
        return true;
    }
    match pattern.strip_prefix("*.") {
        Some(suffix) => {
            let host = host.to_ascii_lowercase();
            let suffix = suffix.to_ascii_lowercase();
            host.ends_with(&format!(".{suffix}"))
        }
        None => pattern.eq_ignore_ascii_case(host),
    }
}
