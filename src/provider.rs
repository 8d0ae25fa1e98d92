use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use url::Url;

use crate::config::ProviderSettings;
use crate::deferred::DeferredLog;
use crate::properties::PropertySet;

/// A source of profile requests: which profiles to apply and where they live.
pub trait ProfileProvider {
    /// Profile names in application order.
    fn requested_profiles(&self) -> &[String];

    /// Where the profile content is served from, if anywhere.
    fn profiles_location(&self) -> Option<&Url>;

    /// Hook backing `${custom:...}` variables.
    fn resolve_custom_variable(&self, _name: &str) -> Option<String> {
        None
    }

    /// Short label for reports.
    fn label(&self) -> &'static str;
}

/// Picks the first candidate that actually requests profiles.
pub fn select(candidates: Vec<Box<dyn ProfileProvider>>) -> Box<dyn ProfileProvider> {
    candidates
        .into_iter()
        .find(|candidate| !candidate.requested_profiles().is_empty())
        .unwrap_or_else(|| Box::new(EmptyProvider))
}

/// Profiles passed explicitly on the command line.
pub struct CommandlineProvider {
    profiles: Vec<String>,
    location: Option<Url>,
}

impl CommandlineProvider {
    pub fn new(profiles: Vec<String>, location: Option<Url>) -> Self {
        Self { profiles, location }
    }

    /// Splits a comma-joined profile list, dropping empty segments.
    pub fn parse_profile_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect()
    }
}

impl ProfileProvider for CommandlineProvider {
    fn requested_profiles(&self) -> &[String] {
        &self.profiles
    }

    fn profiles_location(&self) -> Option<&Url> {
        self.location.as_ref()
    }

    fn label(&self) -> &'static str {
        "commandline"
    }
}

/// Profiles requested by a marker file inside the workspace.
pub struct WorkspaceProvider {
    profiles: Vec<String>,
    location: Option<Url>,
}

impl WorkspaceProvider {
    pub const MARKER_FILE: &'static str = ".profiles";

    /// Reads `<workspace>/.profiles`; a missing, unreadable, or malformed
    /// marker yields an empty request.
    pub fn discover(workspace: &Path, deferred: &mut DeferredLog) -> Self {
        let marker = workspace.join(Self::MARKER_FILE);
        if !marker.is_file() {
            return Self::empty();
        }
        match Self::parse_marker(&marker) {
            Ok(provider) => provider,
            Err(err) => {
                deferred.warn(format!(
                    "Ignoring profile marker {}: {err:#}",
                    marker.display()
                ));
                Self::empty()
            }
        }
    }

    fn empty() -> Self {
        Self {
            profiles: Vec::new(),
            location: None,
        }
    }

    fn parse_marker(marker: &Path) -> Result<Self> {
        let props = PropertySet::load(marker)?;
        let profiles = props
            .get("profiles")
            .map(CommandlineProvider::parse_profile_list)
            .unwrap_or_default();
        let location = match props.get("location") {
            Some(raw) => Some(
                Url::parse(raw).with_context(|| format!("Invalid profile location \"{raw}\""))?,
            ),
            None => None,
        };
        Ok(Self { profiles, location })
    }
}

impl ProfileProvider for WorkspaceProvider {
    fn requested_profiles(&self) -> &[String] {
        &self.profiles
    }

    fn profiles_location(&self) -> Option<&Url> {
        self.location.as_ref()
    }

    fn label(&self) -> &'static str {
        "workspace"
    }
}

/// Provider declared in the settings file, for installations that pin their
/// profile source instead of passing it on every start.
pub struct ConfiguredProvider {
    profiles: Vec<String>,
    location: Option<Url>,
    variables: BTreeMap<String, String>,
}

impl ConfiguredProvider {
    /// Builds the provider from settings; a broken declaration is logged and
    /// treated as if no provider were configured.
    pub fn from_settings(settings: &ProviderSettings, deferred: &mut DeferredLog) -> Option<Self> {
        if settings.profiles.is_empty() && settings.location.is_none() {
            return None;
        }
        let location = match &settings.location {
            Some(raw) => match Url::parse(raw) {
                Ok(url) => Some(url),
                Err(err) => {
                    deferred.error(format!(
                        "Could not create the configured profile provider: invalid location \"{raw}\": {err}"
                    ));
                    return None;
                }
            },
            None => None,
        };
        Some(Self {
            profiles: settings.profiles.clone(),
            location,
            variables: settings.variables.clone(),
        })
    }
}

impl ProfileProvider for ConfiguredProvider {
    fn requested_profiles(&self) -> &[String] {
        &self.profiles
    }

    fn profiles_location(&self) -> Option<&Url> {
        self.location.as_ref()
    }

    fn resolve_custom_variable(&self, name: &str) -> Option<String> {
        self.variables.get(name).cloned()
    }

    fn label(&self) -> &'static str {
        "configured"
    }
}

/// Fallback provider that requests nothing.
#[derive(Default)]
pub struct EmptyProvider;

impl ProfileProvider for EmptyProvider {
    fn requested_profiles(&self) -> &[String] {
        &[]
    }

    fn profiles_location(&self) -> Option<&Url> {
        None
    }

    fn label(&self) -> &'static str {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn file_url(path: &Path) -> Url {
        Url::from_file_path(path).unwrap()
    }

    #[test]
    fn selection_prefers_the_first_non_empty_candidate() {
        let root = tempdir().unwrap();
        let commandline =
            CommandlineProvider::new(vec!["alpha".into()], Some(file_url(root.path())));
        let workspace = WorkspaceProvider {
            profiles: vec!["beta".into()],
            location: Some(file_url(root.path())),
        };

        let selected = select(vec![Box::new(commandline), Box::new(workspace)]);
        assert_eq!(selected.label(), "commandline");
        assert_eq!(selected.requested_profiles(), ["alpha".to_string()]);
    }

    #[test]
    fn selection_skips_candidates_with_empty_requests() {
        let root = tempdir().unwrap();
        let commandline = CommandlineProvider::new(Vec::new(), None);
        let workspace = WorkspaceProvider {
            profiles: vec!["beta".into()],
            location: Some(file_url(root.path())),
        };

        let selected = select(vec![Box::new(commandline), Box::new(workspace)]);
        assert_eq!(selected.label(), "workspace");
    }

    #[test]
    fn selection_falls_back_to_the_empty_provider() {
        let selected = select(Vec::new());
        assert_eq!(selected.label(), "none");
        assert!(selected.requested_profiles().is_empty());
        assert!(selected.profiles_location().is_none());
    }

    #[test]
    fn workspace_discover_reads_the_marker_file() {
        let workspace = tempdir().unwrap();
        let location = file_url(workspace.path());
        fs::write(
            workspace.path().join(WorkspaceProvider::MARKER_FILE),
            format!("profiles=alpha, beta\nlocation={location}\n"),
        )
        .unwrap();

        let mut deferred = DeferredLog::default();
        let provider = WorkspaceProvider::discover(workspace.path(), &mut deferred);
        assert_eq!(
            provider.requested_profiles(),
            ["alpha".to_string(), "beta".to_string()]
        );
        assert_eq!(provider.profiles_location(), Some(&location));
        assert!(deferred.is_empty());
    }

    #[test]
    fn workspace_discover_tolerates_a_missing_marker() {
        let workspace = tempdir().unwrap();
        let mut deferred = DeferredLog::default();
        let provider = WorkspaceProvider::discover(workspace.path(), &mut deferred);
        assert!(provider.requested_profiles().is_empty());
        assert!(deferred.is_empty());
    }

    #[test]
    fn workspace_discover_logs_a_malformed_marker() {
        let workspace = tempdir().unwrap();
        fs::write(
            workspace.path().join(WorkspaceProvider::MARKER_FILE),
            "profiles=alpha\nlocation=::not a url::\n",
        )
        .unwrap();

        let mut deferred = DeferredLog::default();
        let provider = WorkspaceProvider::discover(workspace.path(), &mut deferred);
        assert!(provider.requested_profiles().is_empty());
        assert_eq!(deferred.records().len(), 1);
        assert!(deferred.records()[0].message.contains("Ignoring profile marker"));
    }

    #[test]
    fn configured_provider_rejects_an_invalid_location() {
        let settings = ProviderSettings {
            profiles: vec!["alpha".into()],
            location: Some("::not a url::".into()),
            variables: BTreeMap::new(),
        };

        let mut deferred = DeferredLog::default();
        assert!(ConfiguredProvider::from_settings(&settings, &mut deferred).is_none());
        assert_eq!(deferred.records().len(), 1);
    }

    #[test]
    fn configured_provider_resolves_custom_variables() {
        let mut variables = BTreeMap::new();
        variables.insert("mirror".to_string(), "https://mirror.example".to_string());
        let settings = ProviderSettings {
            profiles: vec!["alpha".into()],
            location: Some("https://profiles.example/hub".into()),
            variables,
        };

        let mut deferred = DeferredLog::default();
        let provider = ConfiguredProvider::from_settings(&settings, &mut deferred).unwrap();
        assert_eq!(
            provider.resolve_custom_variable("mirror").as_deref(),
            Some("https://mirror.example")
        );
        assert_eq!(provider.resolve_custom_variable("absent"), None);
        assert_eq!(provider.label(), "configured");
    }

    #[test]
    fn parse_profile_list_trims_and_drops_empty_segments() {
        assert_eq!(
            CommandlineProvider::parse_profile_list(" alpha , ,beta,"),
            vec!["alpha".to_string(), "beta".to_string()]
        );
        assert!(CommandlineProvider::parse_profile_list(" , ").is_empty());
    }
}
