use std::{
    collections::BTreeMap,
    fs::OpenOptions,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use crate::deferred::DeferredLog;
use crate::properties::PropertySet;
use crate::provider::ProfileProvider;
use crate::vars::{chain_for_profile, replace_value};

/// Name of the combined preference file below the state dir.
pub const COMBINED_FILE_NAME: &str = "combined-preferences.epf";

const PROFILE_FILE_EXTENSION: &str = "epf";
const INSTANCE_PREFIX: &str = "/instance/";

/// Where the combined preference file ended up.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub path: PathBuf,
    pub action: MergeAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// Written to the regular location in the state dir.
    Written,
    /// The regular location was not writable; written to a kept temp file.
    Redirected,
    /// An external customization file is already set; nothing was written.
    Skipped,
}

/// Merges resolved profile directories into one combined preference file.
pub struct PreferenceMerger<'a> {
    state_dir: &'a Path,
    properties: &'a BTreeMap<String, String>,
    provider: &'a dyn ProfileProvider,
}

impl<'a> PreferenceMerger<'a> {
    pub fn new(
        state_dir: &'a Path,
        properties: &'a BTreeMap<String, String>,
        provider: &'a dyn ProfileProvider,
    ) -> Self {
        Self {
            state_dir,
            properties,
            provider,
        }
    }

    /// Merges the profiles in order and writes the combined file. An empty
    /// profile set still writes the (header-only) file; a caller-provided
    /// customization file short-circuits the whole merge.
    pub fn apply(
        &self,
        profile_dirs: &[PathBuf],
        customization_file: Option<&Path>,
        deferred: &mut DeferredLog,
    ) -> Result<MergeOutcome> {
        if let Some(existing) = customization_file {
            deferred.info(format!(
                "Preference customization {} is already set, not applying profiles",
                existing.display()
            ));
            return Ok(MergeOutcome {
                path: existing.to_path_buf(),
                action: MergeAction::Skipped,
            });
        }

        let mut combined = PropertySet::new();
        for dir in profile_dirs {
            combined.merge_from(self.load_profile(dir, deferred)?);
        }
        let combined = strip_instance_prefix(combined);
        self.write_combined(&combined, deferred)
    }

    /// Loads one profile: every `.epf` file below the directory in path
    /// order, then the variable replacer chain over each value.
    fn load_profile(&self, dir: &Path, deferred: &mut DeferredLog) -> Result<PropertySet> {
        let mut raw = PropertySet::new();
        for path in preference_files(dir, deferred) {
            raw.merge_from(PropertySet::load(&path)?);
        }

        let replacers = chain_for_profile(dir, self.properties, self.provider)?;
        let mut replaced = PropertySet::new();
        for (key, value) in raw.iter() {
            replaced.insert(key.to_string(), replace_value(value, &replacers, deferred));
        }
        Ok(replaced)
    }

    fn write_combined(
        &self,
        combined: &PropertySet,
        deferred: &mut DeferredLog,
    ) -> Result<MergeOutcome> {
        let target = self.state_dir.join(COMBINED_FILE_NAME);
        if target.exists() && !is_writable(&target) {
            let temp = tempfile::Builder::new()
                .prefix("combined-preferences")
                .suffix(".epf")
                .tempfile()
                .context("Failed to create replacement preference file")?;
            let (_, path) = temp
                .keep()
                .context("Failed to keep replacement preference file")?;
            combined.write(&path)?;
            deferred.warn(format!(
                "Preference file {} is not writable, wrote combined preferences to {} instead",
                target.display(),
                path.display()
            ));
            return Ok(MergeOutcome {
                path,
                action: MergeAction::Redirected,
            });
        }
        combined.write(&target)?;
        Ok(MergeOutcome {
            path: target,
            action: MergeAction::Written,
        })
    }
}

/// All `.epf` files below the profile directory, sorted by path.
fn preference_files(dir: &Path, deferred: &mut DeferredLog) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file()
                    && entry.path().extension().is_some_and(|ext| ext == PROFILE_FILE_EXTENSION)
                {
                    files.push(entry.into_path());
                }
            }
            Err(err) => deferred.warn(format!(
                "Skipping unreadable entry below {}: {err}",
                dir.display()
            )),
        }
    }
    files.sort();
    files
}

/// Rewrites `/instance/`-scoped keys as plain keys. The rebuild runs in
/// sorted key order, so a bare key merged alongside its `/instance/` twin is
/// written last and wins.
fn strip_instance_prefix(set: PropertySet) -> PropertySet {
    let mut stripped = PropertySet::new();
    for (key, value) in set.iter() {
        let key = key.strip_prefix(INSTANCE_PREFIX).unwrap_or(key);
        stripped.insert(key.to_string(), value.to_string());
    }
    stripped
}

fn is_writable(path: &Path) -> bool {
    OpenOptions::new().append(true).open(path).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    use crate::provider::CommandlineProvider;

    fn no_provider() -> CommandlineProvider {
        CommandlineProvider::new(Vec::new(), None)
    }

    fn merge(
        state_dir: &Path,
        profile_dirs: &[PathBuf],
        properties: &BTreeMap<String, String>,
    ) -> (MergeOutcome, DeferredLog) {
        let provider = no_provider();
        let merger = PreferenceMerger::new(state_dir, properties, &provider);
        let mut deferred = DeferredLog::default();
        let outcome = merger.apply(profile_dirs, None, &mut deferred).unwrap();
        (outcome, deferred)
    }

    /// Lines after the two-line comment header.
    fn body_lines(path: &Path) -> Vec<String> {
        let text = fs::read_to_string(path).unwrap();
        text.lines().skip(2).map(String::from).collect()
    }

    fn profile(root: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (file, content) in files {
            let path = dir.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        dir
    }

    #[test]
    fn later_files_override_earlier_ones_within_a_profile() {
        let root = tempdir().unwrap();
        let state = tempdir().unwrap();
        let dir = profile(
            root.path(),
            "alpha",
            &[
                ("10-base.epf", "key=base\nkept=yes\n"),
                ("20-site.epf", "key=site\n"),
                ("notes.txt", "key=ignored\n"),
            ],
        );

        let (outcome, _) = merge(state.path(), &[dir], &BTreeMap::new());
        assert_eq!(outcome.action, MergeAction::Written);
        assert_eq!(body_lines(&outcome.path), ["kept=yes", "key=site"]);
    }

    #[test]
    fn nested_files_are_collected_in_path_order() {
        let root = tempdir().unwrap();
        let state = tempdir().unwrap();
        let dir = profile(
            root.path(),
            "alpha",
            &[
                ("sub/override.epf", "key=nested\n"),
                ("base.epf", "key=top\n"),
            ],
        );

        let (outcome, _) = merge(state.path(), &[dir], &BTreeMap::new());
        // "base.epf" sorts before "sub/override.epf"
        assert_eq!(body_lines(&outcome.path), ["key=nested"]);
    }

    #[test]
    fn later_profiles_override_earlier_ones() {
        let root = tempdir().unwrap();
        let state = tempdir().unwrap();
        let first = profile(root.path(), "first", &[("a.epf", "shared=first\nonly=1\n")]);
        let second = profile(root.path(), "second", &[("a.epf", "shared=second\n")]);

        let (outcome, _) = merge(state.path(), &[first, second], &BTreeMap::new());
        assert_eq!(body_lines(&outcome.path), ["only=1", "shared=second"]);
    }

    #[test]
    fn instance_prefix_is_stripped_and_bare_keys_win() {
        let root = tempdir().unwrap();
        let state = tempdir().unwrap();
        let dir = profile(
            root.path(),
            "alpha",
            &[(
                "a.epf",
                "/instance/plugin/key=scoped\n/instance/other=v\nplugin/key=bare\n",
            )],
        );

        let (outcome, _) = merge(state.path(), &[dir], &BTreeMap::new());
        assert_eq!(body_lines(&outcome.path), ["other=v", "plugin/key=bare"]);
    }

    #[test]
    fn values_run_through_the_replacer_chain() {
        let root = tempdir().unwrap();
        let state = tempdir().unwrap();
        let dir = profile(
            root.path(),
            "alpha",
            &[(
                "a.epf",
                "drivers=${profile:location}/drivers\nescaped=bla/$${custom:var}/foo\n",
            )],
        );

        let (outcome, deferred) = merge(state.path(), &[dir.clone()], &BTreeMap::new());
        let text = fs::read_to_string(&outcome.path).unwrap();
        assert!(text.contains(&format!("drivers={}/drivers", escaped(&dir))));
        assert!(text.contains("escaped=bla/${custom\\:var}/foo"));
        assert!(deferred.is_empty());
    }

    /// The profile path as it appears in the stored file (separators escaped).
    fn escaped(dir: &Path) -> String {
        dir.display().to_string().replace(':', "\\:")
    }

    #[test]
    fn merge_is_idempotent_except_for_the_header() {
        let root = tempdir().unwrap();
        let state = tempdir().unwrap();
        let dir = profile(
            root.path(),
            "alpha",
            &[("a.epf", "key=value\nother=${env:PREFLIGHT_UNSET}\n")],
        );

        let (first, _) = merge(state.path(), &[dir.clone()], &BTreeMap::new());
        let first_body = body_lines(&first.path);
        let (second, _) = merge(state.path(), &[dir], &BTreeMap::new());
        assert_eq!(body_lines(&second.path), first_body);
    }

    #[test]
    fn an_empty_profile_set_still_writes_the_combined_file() {
        let state = tempdir().unwrap();
        let (outcome, _) = merge(state.path(), &[], &BTreeMap::new());
        assert_eq!(outcome.action, MergeAction::Written);
        assert!(body_lines(&outcome.path).is_empty());
        assert!(outcome.path.exists());
    }

    #[test]
    fn an_external_customization_file_skips_the_merge() {
        let state = tempdir().unwrap();
        let external = state.path().join("custom.epf");
        let provider = no_provider();
        let properties = BTreeMap::new();
        let merger = PreferenceMerger::new(state.path(), &properties, &provider);

        let mut deferred = DeferredLog::default();
        let outcome = merger.apply(&[], Some(&external), &mut deferred).unwrap();
        assert_eq!(outcome.action, MergeAction::Skipped);
        assert_eq!(outcome.path, external);
        assert!(!state.path().join(COMBINED_FILE_NAME).exists());
        assert_eq!(deferred.records().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn an_unwritable_target_redirects_to_a_temp_file() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempdir().unwrap();
        let state = tempdir().unwrap();
        let target = state.path().join(COMBINED_FILE_NAME);
        fs::write(&target, "#\n#old\n").unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o444)).unwrap();
        if is_writable(&target) {
            // permission bits are not enforced for root
            return;
        }

        let dir = profile(root.path(), "alpha", &[("a.epf", "key=value\n")]);
        let (outcome, deferred) = merge(state.path(), &[dir], &BTreeMap::new());
        assert_eq!(outcome.action, MergeAction::Redirected);
        assert_ne!(outcome.path, target);
        assert_eq!(body_lines(&outcome.path), ["key=value"]);
        assert_eq!(fs::read_to_string(&target).unwrap(), "#\n#old\n");
        assert!(deferred.records()[0].message.contains("not writable"));

        fs::set_permissions(&target, fs::Permissions::from_mode(0o644)).unwrap();
        fs::remove_file(&outcome.path).unwrap();
    }
}
