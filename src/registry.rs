//! Hotkey registry - fetches and normalizes the shortcut configuration
//!
//! The registry is a loosely-typed JSON document maintained by hand. It may be
//! a bare array of records or an object wrapping the array under one of a few
//! field names, and every record field has aliases. Normalization drops what
//! it cannot use instead of failing the whole load.

use crate::hotkey::HotkeySpec;
use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

/// A normalized registry record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryItem {
    pub id: String,
    pub name: String,
    /// Dotted hook path; empty means feedback only
    pub hook: String,
    pub hotkey: Option<HotkeySpec>,
    /// Feedback target token
    pub node: Option<String>,
    /// Accent metadata, unused by the core
    pub color: Option<String>,
    /// The source record, verbatim
    pub meta: Value,
}

impl RegistryItem {
    /// Token used to locate this item's feedback target.
    pub fn feedback_token(&self) -> &str {
        if let Some(node) = &self.node {
            return node;
        }
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Field aliases accepted when normalizing records. Earlier names win.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Schema {
    /// Fields that may hold the record list when the document is an object
    pub list_fields: Vec<String>,
    pub id_fields: Vec<String>,
    pub name_fields: Vec<String>,
    pub hook_fields: Vec<String>,
    pub hotkey_fields: Vec<String>,
    pub node_fields: Vec<String>,
    pub color_fields: Vec<String>,
}

fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            list_fields: strings(&["items", "hotkeys", "registry"]),
            id_fields: strings(&["id", "key", "name"]),
            name_fields: strings(&["name"]),
            hook_fields: strings(&["hook", "fn", "call"]),
            hotkey_fields: strings(&["hotkey", "keybind", "shortcut"]),
            node_fields: strings(&["node", "dataNode", "nodeId"]),
            color_fields: strings(&["color", "accent"]),
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// First present field rendered as text.
///
/// Absent values are `null`, `false`, `0` and `""`; nested arrays and objects
/// are skipped as well.
fn first_text(record: &Map<String, Value>, fields: &[String]) -> Option<String> {
    fields.iter().find_map(|field| match record.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        Value::Bool(true) => Some("true".to_string()),
        _ => None,
    })
}

fn optional_text(record: &Map<String, Value>, fields: &[String]) -> Option<String> {
    first_text(record, fields)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Locate the record list inside a raw registry document.
fn record_list<'a>(raw: &'a Value, schema: &Schema) -> &'a [Value] {
    match raw {
        Value::Array(records) => records,
        Value::Object(obj) => schema
            .list_fields
            .iter()
            .find_map(|field| obj.get(field)?.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    }
}

fn normalize_record(record: &Value, schema: &Schema) -> Option<RegistryItem> {
    let obj = record.as_object()?;

    let id = first_text(obj, &schema.id_fields)?.trim().to_string();
    if id.is_empty() {
        trace!(?record, "record without id dropped");
        return None;
    }

    let name = optional_text(obj, &schema.name_fields).unwrap_or_else(|| id.clone());
    let hook = optional_text(obj, &schema.hook_fields).unwrap_or_default();
    let hotkey = first_text(obj, &schema.hotkey_fields).and_then(|raw| {
        HotkeySpec::parse(&raw)
            .inspect_err(|e| debug!(%id, hotkey = %raw, "unusable hotkey: {e}"))
            .ok()
    });

    Some(RegistryItem {
        name,
        hook,
        hotkey,
        node: optional_text(obj, &schema.node_fields),
        color: optional_text(obj, &schema.color_fields),
        meta: record.clone(),
        id,
    })
}

/// Normalize a raw registry document. Unknown shapes yield an empty list.
pub fn normalize_registry(raw: &Value, schema: &Schema) -> Vec<RegistryItem> {
    record_list(raw, schema)
        .iter()
        .filter_map(|record| normalize_record(record, schema))
        .collect()
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Errors raised while loading a registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no registry candidates to try")]
    NoCandidates,
    #[error("invalid registry location {candidate:?}: {message}")]
    InvalidLocation { candidate: String, message: String },
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("registry at {url} is not valid JSON: {source}")]
    Parse {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Where a registry candidate lives once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Http(Url),
    File(PathBuf),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(url) => write!(f, "{url}"),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

fn from_url(candidate: &str, url: Url) -> Result<Location, RegistryError> {
    let scheme = url.scheme().to_string();
    match scheme.as_str() {
        "http" | "https" => Ok(Location::Http(url)),
        "file" => url
            .to_file_path()
            .map(Location::File)
            .map_err(|()| RegistryError::InvalidLocation {
                candidate: candidate.to_string(),
                message: "not a local file URL".into(),
            }),
        other => Err(RegistryError::InvalidLocation {
            candidate: candidate.to_string(),
            message: format!("unsupported scheme {other:?}"),
        }),
    }
}

/// Resolve a candidate string.
///
/// Absolute `http(s)`/`file` URLs stand alone. Relative candidates are joined
/// onto `base` when given, otherwise read as local paths (query ignored).
pub fn resolve_location(candidate: &str, base: Option<&Url>) -> Result<Location, RegistryError> {
    if let Ok(url) = Url::parse(candidate) {
        return from_url(candidate, url);
    }
    if let Some(base) = base {
        let joined = base
            .join(candidate)
            .map_err(|e| RegistryError::InvalidLocation {
                candidate: candidate.to_string(),
                message: e.to_string(),
            })?;
        return from_url(candidate, joined);
    }
    let path = candidate.split_once('?').map_or(candidate, |(path, _)| path);
    Ok(Location::File(PathBuf::from(path)))
}

/// The record whose name is exactly `whoami`.
pub fn find_agent<'a>(items: &'a [RegistryItem], whoami: &str) -> Option<&'a RegistryItem> {
    items.iter().find(|item| item.name == whoami)
}

/// Whether `candidate` only differs from another candidate by its query
/// string once read as a local path. Such candidates are skipped without a
/// base URL.
fn is_cache_busted_path(candidate: &str) -> bool {
    Url::parse(candidate).is_err() && candidate.contains('?')
}

/// Built-in candidates: page-relative first, then an absolute fallback, the
/// last one cache-busted. The cache-busted one is only tried against a base
/// URL.
pub fn default_candidates() -> Vec<String> {
    vec![
        "./registry.json".to_string(),
        "../registry.json".to_string(),
        "/godex/registry.json".to_string(),
        format!(
            "/godex/registry.json?v={}",
            chrono::Utc::now().timestamp_millis()
        ),
    ]
}

/// Pick the candidate list: explicit override, else configured, else defaults.
pub fn candidates(explicit: &[String], configured: &[String]) -> Vec<String> {
    if !explicit.is_empty() {
        explicit.to_vec()
    } else if !configured.is_empty() {
        configured.to_vec()
    } else {
        default_candidates()
    }
}

/// Retrieves a raw registry document.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, location: &Location) -> Result<Value, RegistryError>;
}

/// Fetches over HTTP(S) with caching disabled, or from the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct SourceFetcher {
    client: reqwest::Client,
}

impl SourceFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Fetch for SourceFetcher {
    async fn fetch(&self, location: &Location) -> Result<Value, RegistryError> {
        let url = location.to_string();
        let body = match location {
            Location::Http(target) => {
                let response = self
                    .client
                    .get(target.clone())
                    .header(CACHE_CONTROL, "no-cache")
                    .header(PRAGMA, "no-cache")
                    .send()
                    .await
                    .map_err(|source| RegistryError::Request {
                        url: url.clone(),
                        source,
                    })?;
                let status = response.status();
                if !status.is_success() {
                    return Err(RegistryError::Status {
                        url,
                        status: status.as_u16(),
                    });
                }
                response
                    .text()
                    .await
                    .map_err(|source| RegistryError::Request {
                        url: url.clone(),
                        source,
                    })?
            }
            Location::File(path) => tokio::fs::read_to_string(path).await.map_err(|source| {
                RegistryError::Io {
                    path: path.clone(),
                    source,
                }
            })?,
        };
        serde_json::from_str(&body).map_err(|source| RegistryError::Parse { url, source })
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Result of a successful load.
#[derive(Debug, Clone)]
pub struct LoadedRegistry {
    /// The candidate that answered, resolved
    pub url: String,
    pub items: Arc<[RegistryItem]>,
    pub raw: Value,
}

/// Tries candidates in order and normalizes the first usable document.
#[derive(Clone)]
pub struct RegistryLoader {
    fetcher: Arc<dyn Fetch>,
    base: Option<Url>,
    schema: Schema,
}

impl Default for RegistryLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryLoader {
    pub fn new() -> Self {
        Self::with_fetcher(Arc::new(SourceFetcher::new()))
    }

    pub fn with_fetcher(fetcher: Arc<dyn Fetch>) -> Self {
        Self {
            fetcher,
            base: None,
            schema: Schema::default(),
        }
    }

    pub fn base_url(mut self, base: Option<Url>) -> Self {
        self.base = base;
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    /// Load the first candidate that answers with parseable JSON.
    ///
    /// Sources are never merged. When every candidate fails, the last error
    /// is returned.
    pub async fn load(&self, candidates: &[String]) -> Result<LoadedRegistry, RegistryError> {
        let mut last_err = None;

        for candidate in candidates {
            if self.base.is_none() && is_cache_busted_path(candidate) {
                trace!(%candidate, "query needs a base URL, skipping");
                continue;
            }
            let location = match resolve_location(candidate, self.base.as_ref()) {
                Ok(location) => location,
                Err(e) => {
                    debug!(%candidate, "skipping registry candidate: {e}");
                    last_err = Some(e);
                    continue;
                }
            };

            match self.fetcher.fetch(&location).await {
                Ok(raw) => {
                    let items = normalize_registry(&raw, &self.schema);
                    info!(url = %location, items = items.len(), "registry loaded");
                    return Ok(LoadedRegistry {
                        url: location.to_string(),
                        items: items.into(),
                        raw,
                    });
                }
                Err(e) => {
                    debug!(url = %location, "registry candidate failed: {e}");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or(RegistryError::NoCandidates))
    }
}

impl fmt::Debug for RegistryLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryLoader")
            .field("base", &self.base)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}
