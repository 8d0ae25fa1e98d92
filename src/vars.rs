use std::{
    collections::BTreeMap,
    env,
    path::{Path, PathBuf},
};

use anyhow::Result;

use crate::deferred::DeferredLog;
use crate::fetch::ORIGIN_HEADERS_FILE;
use crate::properties::PropertySet;
use crate::provider::ProfileProvider;

/// Resolves one bracketed tag family (`${kind:name}`) inside property values.
pub trait VariableReplacer {
    fn kind(&self) -> &'static str;
    fn resolve(&self, name: &str) -> Option<String>;
}

/// `${env:NAME}` from the process environment.
pub struct EnvReplacer;

impl VariableReplacer for EnvReplacer {
    fn kind(&self) -> &'static str {
        "env"
    }

    fn resolve(&self, name: &str) -> Option<String> {
        env::var(name).ok()
    }
}

/// `${sysprop:NAME}` from the application property table.
pub struct PropertyTableReplacer<'a> {
    table: &'a BTreeMap<String, String>,
}

impl<'a> PropertyTableReplacer<'a> {
    pub fn new(table: &'a BTreeMap<String, String>) -> Self {
        Self { table }
    }
}

impl VariableReplacer for PropertyTableReplacer<'_> {
    fn kind(&self) -> &'static str {
        "sysprop"
    }

    fn resolve(&self, name: &str) -> Option<String> {
        self.table.get(name).cloned()
    }
}

/// `${profile:location}` as the absolute path of the profile directory.
pub struct ProfileDirReplacer {
    dir: PathBuf,
}

impl ProfileDirReplacer {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

impl VariableReplacer for ProfileDirReplacer {
    fn kind(&self) -> &'static str {
        "profile"
    }

    fn resolve(&self, name: &str) -> Option<String> {
        (name == "location").then(|| self.dir.display().to_string())
    }
}

/// `${origin:Header}` from the header snapshot of the last download.
pub struct OriginHeaderReplacer {
    headers: PropertySet,
}

impl OriginHeaderReplacer {
    /// Reads `.originHeaders` from the parent of the profile directory.
    pub fn for_profile(profile_dir: &Path) -> Result<Self> {
        let mut headers = PropertySet::new();
        if let Some(parent) = profile_dir.parent() {
            let path = parent.join(ORIGIN_HEADERS_FILE);
            if path.is_file() {
                headers = PropertySet::load(&path)?;
            }
        }
        Ok(Self { headers })
    }
}

impl VariableReplacer for OriginHeaderReplacer {
    fn kind(&self) -> &'static str {
        "origin"
    }

    // Header names are matched case-insensitively; the HTTP client lowercases
    // them on receipt while servers pick their own casing.
    fn resolve(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.to_string())
    }
}

/// `${custom:NAME}` through the provider hook.
pub struct CustomReplacer<'a> {
    provider: &'a dyn ProfileProvider,
}

impl<'a> CustomReplacer<'a> {
    pub fn new(provider: &'a dyn ProfileProvider) -> Self {
        Self { provider }
    }
}

impl VariableReplacer for CustomReplacer<'_> {
    fn kind(&self) -> &'static str {
        "custom"
    }

    fn resolve(&self, name: &str) -> Option<String> {
        self.provider.resolve_custom_variable(name)
    }
}

/// Builds the replacer chain for one profile directory, in application order.
pub fn chain_for_profile<'a>(
    profile_dir: &Path,
    table: &'a BTreeMap<String, String>,
    provider: &'a dyn ProfileProvider,
) -> Result<Vec<Box<dyn VariableReplacer + 'a>>> {
    Ok(vec![
        Box::new(EnvReplacer),
        Box::new(PropertyTableReplacer::new(table)),
        Box::new(ProfileDirReplacer::new(profile_dir)),
        Box::new(OriginHeaderReplacer::for_profile(profile_dir)?),
        Box::new(CustomReplacer::new(provider)),
    ])
}

/// Runs every replacer over the value in order, then unescapes
/// `$$`-protected tags.
pub fn replace_value(
    value: &str,
    replacers: &[Box<dyn VariableReplacer + '_>],
    deferred: &mut DeferredLog,
) -> String {
    let mut current = value.to_string();
    for replacer in replacers {
        current = substitute(&current, replacer.as_ref(), deferred);
    }
    unescape_literal_tags(&current)
}

/// Substitutes all `${kind:name}` tags of one replacer. Tags preceded by a
/// `$` are escaped and left for the final unescape pass; substituted text is
/// not rescanned.
fn substitute(value: &str, replacer: &dyn VariableReplacer, deferred: &mut DeferredLog) -> String {
    let marker = format!("${{{}:", replacer.kind());
    let mut out = String::with_capacity(value.len());
    let mut cursor = 0;
    while let Some(found) = value[cursor..].find(&marker) {
        let start = cursor + found;
        out.push_str(&value[cursor..start]);
        let Some(close) = value[start..].find('}') else {
            out.push_str(&value[start..]);
            return out;
        };
        let end = start + close + 1;
        let name = &value[start + marker.len()..end - 1];
        let escaped = value[..start].ends_with('$');
        if escaped || name.is_empty() {
            out.push_str(&value[start..end]);
        } else if let Some(resolved) = replacer.resolve(name) {
            out.push_str(&resolved);
        } else {
            deferred.warn(format!(
                "Variable \"${{{}:{}}}\" cannot be resolved, leaving it untouched",
                replacer.kind(),
                name
            ));
            out.push_str(&value[start..end]);
        }
        cursor = end;
    }
    out.push_str(&value[cursor..]);
    out
}

/// Rewrites `$${kind:name}` to `${kind:name}` for well-formed tags.
fn unescape_literal_tags(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let mut out = String::with_capacity(value.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' && i + 1 < chars.len() && chars[i + 1] == '$' {
            if let Some(tag_len) = well_formed_tag(&chars[i + 1..]) {
                out.extend(&chars[i + 1..i + 1 + tag_len]);
                i += 1 + tag_len;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Length of a `${kind:name}` tag starting at `chars[0]`, if well formed.
fn well_formed_tag(chars: &[char]) -> Option<usize> {
    if chars.len() < 2 || chars[0] != '$' || chars[1] != '{' {
        return None;
    }
    let mut i = 2;
    let kind_start = i;
    while i < chars.len() && chars[i] != ':' && chars[i] != '}' {
        i += 1;
    }
    if i == kind_start || i >= chars.len() || chars[i] != ':' {
        return None;
    }
    i += 1;
    let name_start = i;
    while i < chars.len() && chars[i] != '}' {
        i += 1;
    }
    if i == name_start || i >= chars.len() {
        return None;
    }
    Some(i + 1)
}
