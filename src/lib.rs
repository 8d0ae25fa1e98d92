pub mod cli;
pub mod config;
pub mod deferred;
pub mod fetch;
pub mod merge;
pub mod properties;
pub mod provider;
pub mod vars;

use std::path::PathBuf;

use anyhow::Result;
use url::Url;

use crate::config::{Settings, default_config_path};
use crate::deferred::{DeferredLog, LogRecord};
use crate::fetch::{
    BlockingTransport, ORIGIN_HEADERS_FILE, ProfileFetcher, ProfileTransport, resolve_timeout,
};
use crate::merge::{COMBINED_FILE_NAME, MergeOutcome, PreferenceMerger};
use crate::properties::PropertySet;
use crate::provider::{CommandlineProvider, ConfiguredProvider, ProfileProvider, WorkspaceProvider};

/// Orchestrator for startup profile provisioning: selects a provider once at
/// construction, then drives fetch and merge in a single `apply` pass.
///
/// Failures along the way degrade to "profiles not applied" plus a log
/// entry; nothing here may abort the host's startup. Log output is buffered
/// until the combined preference file is in place, because the host's logging
/// may itself be configured by the preferences being written.
pub struct ProfileManager {
    settings: Settings,
    state_dir: PathBuf,
    provider: Box<dyn ProfileProvider>,
    transport: Box<dyn ProfileTransport>,
    deferred: DeferredLog,
}

impl ProfileManager {
    /// Load configuration from default path and construct the manager.
    pub fn bootstrap(
        config_path_override: Option<PathBuf>,
        commandline: Option<CommandlineProvider>,
    ) -> Result<Self> {
        let config_path = match config_path_override {
            Some(path) => path,
            None => default_config_path()?,
        };
        let settings = Settings::load_or_default(&config_path)?;
        Self::from_settings(settings, commandline)
    }

    /// Construct the manager from explicit settings. Provider candidates are
    /// evaluated in priority order: command line, workspace marker,
    /// configured provider; the first with a non-empty request wins.
    pub fn from_settings(
        settings: Settings,
        commandline: Option<CommandlineProvider>,
    ) -> Result<Self> {
        let mut deferred = DeferredLog::default();
        let workspace = settings.resolve_workspace_dir()?;

        let mut candidates: Vec<Box<dyn ProfileProvider>> = Vec::new();
        if let Some(provider) = commandline {
            candidates.push(Box::new(provider));
        }
        candidates.push(Box::new(WorkspaceProvider::discover(
            &workspace,
            &mut deferred,
        )));
        if let Some(provider) = ConfiguredProvider::from_settings(&settings.provider, &mut deferred)
        {
            candidates.push(Box::new(provider));
        }
        let provider = provider::select(candidates);
        let state_dir = settings.resolve_state_dir()?;

        Ok(Self {
            settings,
            state_dir,
            provider,
            transport: Box::new(BlockingTransport),
            deferred,
        })
    }

    /// Replaces the selected provider. For hosts that own their profile
    /// source and inject it instead of going through the candidate chain.
    pub fn with_provider(mut self, provider: Box<dyn ProfileProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Replaces the download transport; used by tests and embedders that
    /// route HTTP themselves.
    pub fn with_transport(mut self, transport: Box<dyn ProfileTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Profile names the selected provider requests, in application order.
    pub fn requested_profiles(&self) -> &[String] {
        self.provider.requested_profiles()
    }

    /// Where the selected provider's profiles are served from.
    pub fn profiles_location(&self) -> Option<&Url> {
        self.provider.profiles_location()
    }

    /// The directory the profiles are (or would be) read from: the source
    /// directory for file locations, the cache for remote ones.
    pub fn local_profiles_location(&self) -> Option<PathBuf> {
        let location = self.provider.profiles_location()?;
        match location.scheme() {
            "file" => location.to_file_path().ok(),
            "http" | "https" => Some(self.state_dir.join(fetch::PROFILES_DIR)),
            _ => None,
        }
    }

    /// Snapshot of the provider selection and on-disk state, without
    /// touching the network.
    pub fn status(&self) -> StatusReport {
        let cache_dir = self.state_dir.join(fetch::PROFILES_DIR);
        let origin_header_count = PropertySet::load(&cache_dir.join(ORIGIN_HEADERS_FILE))
            .map(|set| set.len())
            .unwrap_or(0);
        let combined_file = self.state_dir.join(COMBINED_FILE_NAME);
        StatusReport {
            provider: self.provider.label(),
            requested_profiles: self.provider.requested_profiles().to_vec(),
            profiles_location: self.provider.profiles_location().cloned(),
            local_profiles_location: self.local_profiles_location(),
            cache_exists: cache_dir.is_dir(),
            cache_dir,
            origin_header_count,
            combined_file_exists: combined_file.is_file(),
            combined_file,
        }
    }

    /// Fetches and merges the selected profiles, then flushes the deferred
    /// log. Consumes the manager: provisioning runs once per start.
    pub fn apply(mut self) -> ApplyReport {
        let timeout = resolve_timeout(&self.settings.fetch, &mut self.deferred);
        let fetcher = ProfileFetcher::new(&self.state_dir, timeout, self.transport.as_ref());

        let (profile_dirs, fetch_error) =
            match fetcher.resolve(self.provider.as_ref(), &mut self.deferred) {
                Ok(dirs) => (dirs, None),
                Err(err) => {
                    let message = format!("Could not resolve profiles: {err:#}");
                    self.deferred.error(message.clone());
                    (Vec::new(), Some(message))
                }
            };

        let merger = PreferenceMerger::new(
            &self.state_dir,
            &self.settings.properties,
            self.provider.as_ref(),
        );
        let (merge, merge_error) = match merger.apply(
            &profile_dirs,
            self.settings.customization_file.as_deref(),
            &mut self.deferred,
        ) {
            Ok(outcome) => (Some(outcome), None),
            Err(err) => {
                let message = format!("Could not apply preferences: {err:#}");
                self.deferred.error(message.clone());
                (None, Some(message))
            }
        };

        // the barrier: preferences are in place, logging is safe now
        let log_records = self.deferred.flush();

        ApplyReport {
            provider: self.provider.label(),
            requested_profiles: self.provider.requested_profiles().to_vec(),
            profile_dirs,
            merge,
            fetch_error,
            merge_error,
            log_records,
        }
    }
}

/// Result of one provisioning run.
#[derive(Debug)]
pub struct ApplyReport {
    pub provider: &'static str,
    pub requested_profiles: Vec<String>,
    /// Resolved profile directories, in application order.
    pub profile_dirs: Vec<PathBuf>,
    /// Where the combined preference file went, if the merge ran to the end.
    pub merge: Option<MergeOutcome>,
    pub fetch_error: Option<String>,
    pub merge_error: Option<String>,
    /// Everything logged during provisioning, flushed and retained.
    pub log_records: Vec<LogRecord>,
}

impl ApplyReport {
    /// True when both fetch and merge completed without errors.
    pub fn succeeded(&self) -> bool {
        self.fetch_error.is_none() && self.merge_error.is_none()
    }
}

/// Snapshot of the provider selection and on-disk provisioning state.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub provider: &'static str,
    pub requested_profiles: Vec<String>,
    pub profiles_location: Option<Url>,
    pub local_profiles_location: Option<PathBuf>,
    pub cache_dir: PathBuf,
    pub cache_exists: bool,
    pub origin_header_count: usize,
    pub combined_file: PathBuf,
    pub combined_file_exists: bool,
}
