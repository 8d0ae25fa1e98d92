use std::{
    collections::HashSet,
    env, fs,
    io::Write,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use reqwest::header::IF_MODIFIED_SINCE;
use url::Url;
use zip::ZipArchive;

use crate::config::FetchSettings;
use crate::deferred::DeferredLog;
use crate::provider::ProfileProvider;

/// Name of the cache directory below the state dir.
pub const PROFILES_DIR: &str = "profiles";
/// File next to the cached profiles holding the last response's headers.
pub const ORIGIN_HEADERS_FILE: &str = ".originHeaders";
/// Environment variable overriding the download timeout in milliseconds.
pub const TIMEOUT_ENV_VAR: &str = "PREFLIGHT_FETCH_TIMEOUT_MS";
/// Default download timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

const ERROR_BODY_LIMIT: usize = 4096;

/// One HTTP exchange, reduced to what the fetcher needs.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// First header with the given name, matched ASCII-case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Transport used for the profile download; swapped for a stub in tests and
/// by embedders that route HTTP themselves.
pub trait ProfileTransport {
    fn get(
        &self,
        url: &Url,
        if_modified_since: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpResponse>;
}

/// Production transport. Proxy selection and redirects follow the client's
/// environment handling.
#[derive(Debug, Default)]
pub struct BlockingTransport;

impl ProfileTransport for BlockingTransport {
    fn get(
        &self,
        url: &Url,
        if_modified_since: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpResponse> {
        let client = Client::builder()
            .user_agent(concat!("preflight/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .context("Failed to build profile download client")?;

        let mut request = client.get(url.clone());
        if let Some(since) = if_modified_since {
            request = request.header(IF_MODIFIED_SINCE, since);
        }
        let response = request
            .send()
            .with_context(|| format!("Failed to reach profile server at {url}"))?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .map(|(key, value)| {
                (
                    key.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .with_context(|| format!("Failed to read response body from {url}"))?
            .to_vec();

        Ok(HttpResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().map(String::from),
            headers,
            body,
        })
    }
}

/// Download timeout, taking the environment override into account. An
/// unparsable override is reported and the configured value used.
pub fn resolve_timeout(settings: &FetchSettings, deferred: &mut DeferredLog) -> Duration {
    match env::var(TIMEOUT_ENV_VAR) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                deferred.warn(format!(
                    "Illegal timeout value \"{raw}\" in {TIMEOUT_ENV_VAR}, using {} ms",
                    settings.timeout_ms
                ));
                Duration::from_millis(settings.timeout_ms)
            }
        },
        Err(_) => Duration::from_millis(settings.timeout_ms),
    }
}

/// Resolves requested profiles into local directories, downloading and
/// caching remote content as needed.
pub struct ProfileFetcher<'a> {
    state_dir: PathBuf,
    timeout: Duration,
    transport: &'a dyn ProfileTransport,
}

impl<'a> ProfileFetcher<'a> {
    pub fn new(state_dir: &Path, timeout: Duration, transport: &'a dyn ProfileTransport) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            timeout,
            transport,
        }
    }

    /// Cache directory for remote profiles.
    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join(PROFILES_DIR)
    }

    /// Resolves the provider's request into profile directories, in request
    /// order. Fails only on misconfiguration (no or unsupported location);
    /// download problems degrade to whatever the cache still holds.
    pub fn resolve(
        &self,
        provider: &dyn ProfileProvider,
        deferred: &mut DeferredLog,
    ) -> Result<Vec<PathBuf>> {
        let profiles = provider.requested_profiles();
        if profiles.is_empty() {
            return Ok(Vec::new());
        }
        let Some(location) = provider.profiles_location() else {
            bail!("Profiles {profiles:?} were requested but no location is set");
        };
        let root = match location.scheme() {
            "file" => location
                .to_file_path()
                .map_err(|_| anyhow::anyhow!("Invalid file location {location}"))?,
            "http" | "https" => self.download(profiles, location, deferred),
            other => bail!("Unsupported scheme \"{other}\" for profile location {location}"),
        };
        Ok(filter_profile_dirs(&root, profiles))
    }

    /// Refreshes the cache from the remote endpoint. Never fails: any
    /// problem is reported and the cache path returned as-is, so startup can
    /// proceed with stale content or none at all.
    fn download(&self, profiles: &[String], location: &Url, deferred: &mut DeferredLog) -> PathBuf {
        let cache = self.cache_dir();
        if let Err(err) = self.refresh_cache(profiles, location, &cache) {
            let fallback = if cache.is_dir() {
                "will use the existing but possibly outdated profiles"
            } else {
                "no profiles will be applied"
            };
            deferred.error(format!(
                "Could not download profiles from {location}: {err:#}; {fallback}"
            ));
        }
        cache
    }

    fn refresh_cache(&self, profiles: &[String], location: &Url, cache: &Path) -> Result<()> {
        fs::create_dir_all(&self.state_dir).with_context(|| {
            format!("Failed to create state directory {}", self.state_dir.display())
        })?;

        let mut url = location.clone();
        url.query_pairs_mut()
            .append_pair("profiles", &profiles.join(","));

        let conditional = if_modified_since(profiles, cache)?;
        let response = self
            .transport
            .get(&url, conditional.as_deref(), self.timeout)?;

        match response.status {
            304 => write_origin_headers(&response.headers, cache),
            status if (200..300).contains(&status) => self.publish(&response, cache),
            _ => bail!("{}", status_diagnostic(&response)),
        }
    }

    /// Extracts the downloaded archive and swaps it into place. The cache
    /// path only ever holds a complete profile set: extraction happens in a
    /// staging directory on the same filesystem, published by rename.
    fn publish(&self, response: &HttpResponse, cache: &Path) -> Result<()> {
        let content_type = response.header("content-type").unwrap_or_default();
        if !content_type.starts_with("application/zip") {
            bail!("Server did not return a zip archive (Content-Type \"{content_type}\")");
        }

        let mut archive_file = tempfile::Builder::new()
            .prefix("profile-download")
            .suffix(".zip")
            .tempfile_in(&self.state_dir)
            .context("Failed to create download staging file")?;
        archive_file
            .write_all(&response.body)
            .context("Failed to write downloaded archive")?;

        let staging = tempfile::Builder::new()
            .prefix("profile-download")
            .tempdir_in(&self.state_dir)
            .context("Failed to create extraction staging directory")?;
        let mut archive = ZipArchive::new(archive_file.reopen()?)
            .context("Downloaded profile archive is not a valid zip file")?;
        archive
            .extract(staging.path())
            .context("Failed to extract profile archive")?;

        if cache.exists() {
            fs::remove_dir_all(cache)
                .with_context(|| format!("Failed to remove old cache {}", cache.display()))?;
        }
        let staged = staging.into_path();
        fs::rename(&staged, cache).with_context(|| {
            format!(
                "Failed to move {} into place at {}",
                staged.display(),
                cache.display()
            )
        })?;
        write_origin_headers(&response.headers, cache)
        // the staging zip is removed when archive_file drops
    }
}

/// The conditional request header, sent only when every requested profile is
/// already cached; a new name forces a full download.
fn if_modified_since(profiles: &[String], cache: &Path) -> Result<Option<String>> {
    if !cache.is_dir() {
        return Ok(None);
    }
    let mut cached = HashSet::new();
    for entry in fs::read_dir(cache)
        .with_context(|| format!("Failed to list cache directory {}", cache.display()))?
    {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Ok(name) = entry.file_name().into_string() {
                cached.insert(name);
            }
        }
    }
    if profiles.iter().any(|name| !cached.contains(name)) {
        return Ok(None);
    }
    let modified = fs::metadata(cache)?.modified()?;
    let stamp = DateTime::<Utc>::from(modified).format("%a, %d %b %Y %H:%M:%S GMT");
    Ok(Some(stamp.to_string()))
}

/// Persists the response headers next to the cached profiles. Rewritten on
/// both 200 and 304 so `${origin:...}` variables always reflect the last
/// successful exchange.
fn write_origin_headers(headers: &[(String, String)], cache: &Path) -> Result<()> {
    fs::create_dir_all(cache)
        .with_context(|| format!("Failed to create cache directory {}", cache.display()))?;
    let mut snapshot = crate::properties::PropertySet::new();
    for (name, value) in headers {
        snapshot.insert(name.clone(), value.clone());
    }
    snapshot.write(&cache.join(ORIGIN_HEADERS_FILE))
}

/// Human-readable failure for an unexpected status: the body if it is
/// textual, else the reason phrase, else the bare status code.
fn status_diagnostic(response: &HttpResponse) -> String {
    let textual = response
        .header("content-type")
        .map(|ct| ct.starts_with("text/"))
        .unwrap_or(false);
    if textual && !response.body.is_empty() {
        let cut = response.body.len().min(ERROR_BODY_LIMIT);
        let text = String::from_utf8_lossy(&response.body[..cut]);
        let text = text.trim();
        if !text.is_empty() {
            return format!("Server responded: {text}");
        }
    }
    match &response.reason {
        Some(reason) => format!("Server returned {} {reason}", response.status),
        None => format!("Server returned status {}", response.status),
    }
}

/// Keeps only requested names that are direct children of the root after
/// lexical normalization, so `../` segments can never escape it.
fn filter_profile_dirs(root: &Path, profiles: &[String]) -> Vec<PathBuf> {
    let root = normalize_lexically(root);
    profiles
        .iter()
        .map(|name| normalize_lexically(&root.join(name)))
        .filter(|candidate| candidate.parent() == Some(root.as_path()) && candidate.is_dir())
        .collect()
}

/// Removes `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
