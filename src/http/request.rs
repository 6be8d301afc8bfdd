use std::fs;

use serde::{Deserialize, Serialize};
use url::Url;

use super::method::HttpMethod;
use super::RequestError;
use crate::auth::AuthConfig;
use crate::environment::VariableScopes;

/// Header, query parameter or form field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            disabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlBody {
    pub query: String,
    /// JSON text; interpolated before it is parsed.
    #[serde(default)]
    pub variables: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum RequestBody {
    Raw {
        raw: String,
        #[serde(default, rename = "contentType")]
        content_type: Option<String>,
    },
    Urlencoded {
        urlencoded: Vec<KeyValue>,
    },
    Formdata {
        formdata: Vec<KeyValue>,
    },
    Graphql {
        graphql: GraphqlBody,
    },
    File {
        src: String,
    },
}

/// A request as written in a collection, before variables are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestDefinition {
    #[serde(default)]
    pub method: HttpMethod,
    pub url: String,
    #[serde(default)]
    pub query: Vec<KeyValue>,
    #[serde(default)]
    pub headers: Vec<KeyValue>,
    #[serde(default)]
    pub body: Option<RequestBody>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

/// Body bytes ready to send. Multipart fields are kept as pairs because a
/// multipart form has to be rebuilt for every send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "data", rename_all = "camelCase")]
pub enum ResolvedBody {
    #[default]
    Empty,
    Bytes(Vec<u8>),
    Multipart(Vec<(String, String)>),
}

impl ResolvedBody {
    pub fn len(&self) -> u64 {
        match self {
            ResolvedBody::Empty => 0,
            ResolvedBody::Bytes(bytes) => bytes.len() as u64,
            ResolvedBody::Multipart(fields) => fields
                .iter()
                .map(|(k, v)| (k.len() + v.len()) as u64)
                .sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A request with every placeholder replaced, ready for the requester.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<KeyValue>,
    pub body: ResolvedBody,
}

impl ResolvedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Replace every header called `name` with a single entry.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.remove_header(name);
        self.headers.push(KeyValue::new(name, value));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|h| !h.key.eq_ignore_ascii_case(name));
    }

    pub fn parsed_url(&self) -> Result<Url, RequestError> {
        Url::parse(&self.url).map_err(|err| RequestError::InvalidUrl {
            url: self.url.clone(),
            reason: err.to_string(),
        })
    }

    /// Append a query parameter, keeping existing ones.
    pub fn append_query(&mut self, key: &str, value: &str) -> Result<(), RequestError> {
        let mut url = self.parsed_url()?;
        url.query_pairs_mut().append_pair(key, value);
        self.url = url.to_string();
        Ok(())
    }
}

impl RequestDefinition {
    /// Apply variables and build the concrete request. Auth is applied
    /// separately because it depends on the item's ancestors.
    pub fn resolve(
        &self,
        scopes: &VariableScopes,
        disable_body_pruning: bool,
    ) -> Result<ResolvedRequest, RequestError> {
        let raw_url = scopes.interpolate(self.url.trim());
        if raw_url.is_empty() {
            return Err(RequestError::InvalidUrl {
                url: raw_url,
                reason: "URL is empty".into(),
            });
        }

        let with_scheme = if raw_url.contains("://") {
            raw_url
        } else {
            format!("http://{raw_url}")
        };
        let mut url = Url::parse(&with_scheme).map_err(|err| RequestError::InvalidUrl {
            url: with_scheme.clone(),
            reason: err.to_string(),
        })?;

        let query: Vec<(String, String)> = self
            .query
            .iter()
            .filter(|q| !q.disabled && !q.key.is_empty())
            .map(|q| (scopes.interpolate(&q.key), scopes.interpolate(&q.value)))
            .collect();
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &query {
                pairs.append_pair(key, value);
            }
        }

        let mut headers: Vec<KeyValue> = self
            .headers
            .iter()
            .filter(|h| !h.disabled && !h.key.trim().is_empty())
            .map(|h| KeyValue::new(scopes.interpolate(h.key.trim()), scopes.interpolate(&h.value)))
            .collect();

        let body = if self.method.prunes_body() && !disable_body_pruning {
            ResolvedBody::Empty
        } else {
            match &self.body {
                Some(body) => resolve_body(body, scopes, &mut headers)?,
                None => ResolvedBody::Empty,
            }
        };

        Ok(ResolvedRequest {
            method: self.method,
            url: url.to_string(),
            headers,
            body,
        })
    }
}

fn resolve_body(
    body: &RequestBody,
    scopes: &VariableScopes,
    headers: &mut Vec<KeyValue>,
) -> Result<ResolvedBody, RequestError> {
    let has_content_type = headers.iter().any(|h| h.key.eq_ignore_ascii_case("content-type"));
    let mut default_content_type = |value: &str| {
        if !has_content_type {
            headers.push(KeyValue::new("Content-Type", value));
        }
    };

    match body {
        RequestBody::Raw { raw, content_type } => {
            if let Some(content_type) = content_type {
                default_content_type(content_type);
            }
            Ok(ResolvedBody::Bytes(scopes.interpolate(raw).into_bytes()))
        }
        RequestBody::Urlencoded { urlencoded } => {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for field in urlencoded.iter().filter(|f| !f.disabled && !f.key.is_empty()) {
                serializer.append_pair(&scopes.interpolate(&field.key), &scopes.interpolate(&field.value));
            }
            default_content_type("application/x-www-form-urlencoded");
            Ok(ResolvedBody::Bytes(serializer.finish().into_bytes()))
        }
        RequestBody::Formdata { formdata } => Ok(ResolvedBody::Multipart(
            formdata
                .iter()
                .filter(|f| !f.disabled && !f.key.is_empty())
                .map(|f| (scopes.interpolate(&f.key), scopes.interpolate(&f.value)))
                .collect(),
        )),
        RequestBody::Graphql { graphql } => {
            let mut payload = serde_json::Map::new();
            payload.insert(
                "query".into(),
                serde_json::Value::String(scopes.interpolate(&graphql.query)),
            );
            if let Some(variables) = graphql.variables.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                let variables: serde_json::Value = serde_json::from_str(&scopes.interpolate(variables))
                    .map_err(|err| RequestError::InvalidBody(format!("GraphQL variables are not valid JSON: {err}")))?;
                payload.insert("variables".into(), variables);
            }
            default_content_type("application/json");
            let bytes = serde_json::to_vec(&payload)
                .map_err(|err| RequestError::InvalidBody(format!("Failed to encode GraphQL body: {err}")))?;
            Ok(ResolvedBody::Bytes(bytes))
        }
        RequestBody::File { src } => {
            let path = scopes.interpolate(src);
            let bytes = fs::read(&path)
                .map_err(|err| RequestError::InvalidBody(format!("Failed to read body file `{path}`: {err}")))?;
            Ok(ResolvedBody::Bytes(bytes))
        }
    }
}
