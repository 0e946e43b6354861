//! URL transforms: relative-link resolution, storage-provider indirection and the
//! named transform registry used by field rules.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::app::ports::{HttpClientPort, HttpRequest};
use crate::error::ConfigError;
use crate::metrics::StateMetrics;
use crate::pipeline::storage::TransformCache;

const YANDEX_API: &str = "https://cloud-api.yandex.net/v1/disk/public/resources/download";
const YANDEX_PUBLIC_BASE: &str = "https://disk.yandex.ru/d/";
const GOOGLE_DOWNLOAD: &str = "https://drive.google.com/uc";

/// Where a transform is evaluated: the owning template and the source's base URL.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    pub template: &'a str,
    pub base_url: &'a str,
}

/// Source URL without query or fragment; relative links resolve against it.
pub fn strip_query(url: &str) -> String {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    url[..end].to_string()
}

/// Resolve `link` against `base`. Absolute links and unparsable bases pass through.
pub fn resolve_relative(link: &str, base: &str) -> String {
    let link = link.trim();
    if link.is_empty() {
        return String::new();
    }
    if Url::parse(link).is_ok() {
        return link.to_string();
    }
    match Url::parse(base).and_then(|b| b.join(link)) {
        Ok(joined) => joined.to_string(),
        Err(_) => link.to_string(),
    }
}

/// Cloud-storage hosts whose share links point at a landing page rather than the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageProvider {
    YandexDisk,
    GoogleDrive,
}

impl StorageProvider {
    pub fn detect(url: &str) -> Option<Self> {
        let host = Url::parse(url).ok()?.host_str()?.to_lowercase();
        if host.contains("disk.yandex.") || host == "yadi.sk" || host.ends_with(".yadi.sk") {
            Some(StorageProvider::YandexDisk)
        } else if host == "drive.google.com" {
            Some(StorageProvider::GoogleDrive)
        } else {
            None
        }
    }

    /// Name used as the transform key in the cache.
    pub fn transform_name(&self) -> &'static str {
        match self {
            StorageProvider::YandexDisk => "yandex_disk",
            StorageProvider::GoogleDrive => "google_drive",
        }
    }
}

/// Whether the URL names a downloadable asset: an allowed extension or a storage link.
pub fn is_downloadable(url: &str, extensions: &[String]) -> bool {
    if StorageProvider::detect(url).is_some() {
        return true;
    }
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().to_lowercase(),
        Err(_) => strip_query(url).to_lowercase(),
    };
    extensions.iter().any(|ext| {
        let ext = ext.trim().to_lowercase();
        let ext = if ext.starts_with('.') { ext } else { format!(".{ext}") };
        path.ends_with(&ext)
    })
}

/// Turns an indirect link into a direct download URL.
#[async_trait]
pub trait LinkResolver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn resolve(&self, template: &str, input: &str) -> anyhow::Result<String>;
}

#[async_trait]
impl LinkResolver for Box<dyn LinkResolver> {
    fn name(&self) -> &'static str {
        self.as_ref().name()
    }

    async fn resolve(&self, template: &str, input: &str) -> anyhow::Result<String> {
        self.as_ref().resolve(template, input).await
    }
}

/// Yandex Disk public links, resolved through the public-resources API.
pub struct YandexDiskResolver {
    http: Arc<dyn HttpClientPort>,
}

#[derive(Deserialize)]
struct YandexHref {
    #[serde(default)]
    href: String,
}

impl YandexDiskResolver {
    pub fn new(http: Arc<dyn HttpClientPort>) -> Self {
        Self { http }
    }

    fn public_key(url: &str) -> Option<String> {
        if let Ok(parsed) = Url::parse(url) {
            if let Some((_, key)) = parsed.query_pairs().find(|(k, _)| k == "public_key") {
                return Some(key.into_owned());
            }
        }
        let (_, after) = url.split_once("/d/")?;
        let key = after.split(['?', '#', '/']).next().unwrap_or_default();
        (!key.is_empty()).then(|| key.to_string())
    }
}

#[async_trait]
impl LinkResolver for YandexDiskResolver {
    fn name(&self) -> &'static str {
        StorageProvider::YandexDisk.transform_name()
    }

    async fn resolve(&self, _template: &str, input: &str) -> anyhow::Result<String> {
        if input.contains("downloader.disk.yandex.") {
            return Ok(input.to_string());
        }
        let Some(key) = Self::public_key(input) else {
            anyhow::bail!("no public key in {input}");
        };
        let public_url = if key.starts_with("http") {
            key
        } else {
            format!("{YANDEX_PUBLIC_BASE}{key}")
        };
        let api = Url::parse_with_params(YANDEX_API, &[("public_key", public_url.as_str())])?;
        let resp = self
            .http
            .get(&HttpRequest::get(api.as_str()))
            .await
            .map_err(anyhow::Error::from)?;
        if !resp.is_success() {
            anyhow::bail!("storage API returned {}", resp.status);
        }
        let body: YandexHref = serde_json::from_slice(&resp.bytes)?;
        if body.href.is_empty() {
            anyhow::bail!("storage API returned no href");
        }
        Ok(body.href)
    }
}

/// Google Drive `file/d/<id>` and `open?id=<id>` links rewritten to the direct form.
pub struct GoogleDriveResolver;

impl GoogleDriveResolver {
    fn file_id(url: &str) -> Option<String> {
        if let Some((_, after)) = url.split_once("/file/d/") {
            let id = after.split(['/', '?', '#']).next().unwrap_or_default();
            return (!id.is_empty()).then(|| id.to_string());
        }
        let parsed = Url::parse(url).ok()?;
        parsed
            .query_pairs()
            .find(|(k, _)| k == "id")
            .map(|(_, v)| v.into_owned())
    }
}

#[async_trait]
impl LinkResolver for GoogleDriveResolver {
    fn name(&self) -> &'static str {
        StorageProvider::GoogleDrive.transform_name()
    }

    async fn resolve(&self, _template: &str, input: &str) -> anyhow::Result<String> {
        let Some(id) = Self::file_id(input) else {
            anyhow::bail!("no file id in {input}");
        };
        let direct = Url::parse_with_params(GOOGLE_DOWNLOAD, &[("export", "download"), ("id", id.as_str())])?;
        Ok(direct.to_string())
    }
}

/// Memoizes another resolver through the transform cache. Failed resolutions are not stored.
pub struct Cached<R> {
    inner: R,
    cache: Arc<dyn TransformCache>,
    key_fn: fn(&str) -> String,
}

fn trimmed_key(input: &str) -> String {
    input.trim().to_string()
}

impl<R: LinkResolver> Cached<R> {
    pub fn new(inner: R, cache: Arc<dyn TransformCache>) -> Self {
        Self {
            inner,
            cache,
            key_fn: trimmed_key,
        }
    }

    pub fn with_key_fn(mut self, key_fn: fn(&str) -> String) -> Self {
        self.key_fn = key_fn;
        self
    }
}

#[async_trait]
impl<R: LinkResolver> LinkResolver for Cached<R> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn resolve(&self, template: &str, input: &str) -> anyhow::Result<String> {
        let key = (self.key_fn)(input);
        let name = self.inner.name();
        match self.cache.get(template, name, &key).await {
            Ok(Some(hit)) => {
                StateMetrics::record_cache_hit();
                debug!(transform = name, input = %key, "transform cache hit");
                return Ok(hit);
            }
            Ok(None) => StateMetrics::record_cache_miss(),
            Err(e) => {
                StateMetrics::record_store_error();
                warn!(transform = name, "transform cache lookup failed: {}", e);
            }
        }

        let output = self.inner.resolve(template, input).await?;
        if let Err(e) = self.cache.put(template, name, &key, &output).await {
            StateMetrics::record_store_error();
            warn!(transform = name, "transform cache write failed: {}", e);
        }
        Ok(output)
    }
}

/// Dispatches storage links to their provider resolver; everything else is local.
pub struct UrlResolver {
    providers: HashMap<StorageProvider, Box<dyn LinkResolver>>,
}

impl UrlResolver {
    /// Yandex Disk behind the transform cache, Google Drive as a pure rewrite.
    pub fn new(http: Arc<dyn HttpClientPort>, cache: Arc<dyn TransformCache>) -> Self {
        let mut providers: HashMap<StorageProvider, Box<dyn LinkResolver>> = HashMap::new();
        providers.insert(
            StorageProvider::YandexDisk,
            Box::new(Cached::new(YandexDiskResolver::new(http), cache)),
        );
        providers.insert(StorageProvider::GoogleDrive, Box::new(GoogleDriveResolver));
        Self { providers }
    }

    /// No provider resolution at all; storage links pass through unchanged.
    pub fn offline() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn with_provider(mut self, provider: StorageProvider, resolver: Box<dyn LinkResolver>) -> Self {
        self.providers.insert(provider, resolver);
        self
    }

    /// Direct link for a storage-provider URL. Returns the input when the URL is not a
    /// storage link or resolution fails.
    pub async fn storage_link(&self, template: &str, url: &str) -> String {
        let Some(resolver) = StorageProvider::detect(url).and_then(|p| self.providers.get(&p)) else {
            return url.to_string();
        };
        match resolver.resolve(template, url).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(url, transform = resolver.name(), "link resolution failed: {:#}", e);
                url.to_string()
            }
        }
    }

    /// Root-relative paths join the base URL, storage links are resolved, the rest pass.
    pub async fn smart_url(&self, url: &str, ctx: &TransformContext<'_>) -> String {
        let url = url.trim();
        if url.is_empty() {
            return String::new();
        }
        if url.starts_with('/') && !url.starts_with("//") {
            return resolve_relative(url, ctx.base_url);
        }
        self.storage_link(ctx.template, url).await
    }
}

pub type CustomTransform = Arc<dyn Fn(&str, &TransformContext<'_>) -> String + Send + Sync>;

/// A transform resolved by name when the extraction stage is built.
#[derive(Clone)]
pub enum NamedTransform {
    SmartUrl,
    StorageLink,
    AbsoluteUrl,
    Trim,
    Lower,
    Upper,
    StripTags,
    CollapseWs,
    Custom { name: String, apply: CustomTransform },
}

impl fmt::Debug for NamedTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const BUILT_INS: &[&str] = &[
    "smart_url",
    "storage_link",
    "absolute_url",
    "trim",
    "lower",
    "upper",
    "strip_tags",
    "collapse_ws",
];

pub fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Replace every `<...>` tag with a space. An unterminated `<` is kept as text.
pub fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        match rest[open..].find('>') {
            Some(close) => {
                out.push(' ');
                rest = &rest[open + close + 1..];
            }
            None => {
                rest = &rest[open..];
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

impl NamedTransform {
    pub fn name(&self) -> &str {
        match self {
            NamedTransform::SmartUrl => "smart_url",
            NamedTransform::StorageLink => "storage_link",
            NamedTransform::AbsoluteUrl => "absolute_url",
            NamedTransform::Trim => "trim",
            NamedTransform::Lower => "lower",
            NamedTransform::Upper => "upper",
            NamedTransform::StripTags => "strip_tags",
            NamedTransform::CollapseWs => "collapse_ws",
            NamedTransform::Custom { name, .. } => name,
        }
    }

    pub async fn apply(&self, raw: &str, ctx: &TransformContext<'_>, urls: &UrlResolver) -> String {
        match self {
            NamedTransform::SmartUrl => urls.smart_url(raw, ctx).await,
            NamedTransform::StorageLink => urls.storage_link(ctx.template, raw.trim()).await,
            NamedTransform::AbsoluteUrl => resolve_relative(raw, ctx.base_url),
            NamedTransform::Trim => raw.trim().to_string(),
            NamedTransform::Lower => raw.to_lowercase(),
            NamedTransform::Upper => raw.to_uppercase(),
            NamedTransform::StripTags => collapse_ws(&strip_tags(raw)),
            NamedTransform::CollapseWs => collapse_ws(raw),
            NamedTransform::Custom { apply, .. } => apply(raw, ctx),
        }
    }
}

/// Name -> transform lookup. Built-ins are always present; custom ones are registered.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    custom: HashMap<String, CustomTransform>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a custom transform. Built-in names cannot be shadowed.
    pub fn register<F>(&mut self, name: impl Into<String>, transform: F) -> Result<(), ConfigError>
    where
        F: Fn(&str, &TransformContext<'_>) -> String + Send + Sync + 'static,
    {
        let name = name.into();
        if BUILT_INS.contains(&name.as_str()) {
            return Err(ConfigError::Invalid {
                field: "transform".to_string(),
                message: format!("'{name}' is a built-in transform"),
            });
        }
        self.custom.insert(name, Arc::new(transform));
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<NamedTransform, ConfigError> {
        let transform = match name {
            "smart_url" => NamedTransform::SmartUrl,
            "storage_link" | "yandex_disk" => NamedTransform::StorageLink,
            "absolute_url" => NamedTransform::AbsoluteUrl,
            "trim" => NamedTransform::Trim,
            "lower" => NamedTransform::Lower,
            "upper" => NamedTransform::Upper,
            "strip_tags" => NamedTransform::StripTags,
            "collapse_ws" => NamedTransform::CollapseWs,
            other => match self.custom.get(other) {
                Some(apply) => NamedTransform::Custom {
                    name: other.to_string(),
                    apply: Arc::clone(apply),
                },
                None => {
                    return Err(ConfigError::Invalid {
                        field: "transform_type".to_string(),
                        message: format!("unknown transform '{other}'"),
                    })
                }
            },
        };
        Ok(transform)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = BUILT_INS.iter().map(|s| s.to_string()).collect();
        let mut custom: Vec<String> = self.custom.keys().cloned().collect();
        custom.sort();
        names.extend(custom);
        names
    }
}
