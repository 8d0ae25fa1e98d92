use std::{collections::BTreeMap, fs, path::Path, str::Chars};

use anyhow::{Context, Result};
use chrono::Utc;

/// A sorted set of preference keys and values, as stored in `.epf` files.
///
/// Parsing accepts the classic property-file syntax: `#`/`!` comments,
/// `=`/`:`/whitespace separators, backslash line continuations, and the
/// `\t \n \r \f \uXXXX` escapes. Serialization emits pure ASCII bytes with
/// everything outside the printable range escaped per UTF-16 unit, the
/// encoding the host preference loader decodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertySet {
    entries: BTreeMap<String, String>,
}

impl PropertySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads and parses a property file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Parses property text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();
        let mut lines = text.lines();
        while let Some(raw) = lines.next() {
            let line = raw.trim_start_matches(is_property_whitespace);
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let mut logical = line.to_string();
            while ends_with_odd_backslashes(&logical) {
                logical.pop();
                match lines.next() {
                    Some(next) => logical.push_str(next.trim_start_matches(is_property_whitespace)),
                    None => break,
                }
            }
            let (key, value) = split_entry(&logical);
            entries.insert(unescape(key)?, unescape(value)?);
        }
        Ok(Self { entries })
    }

    /// Writes the set to disk in the byte-oriented store format.
    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Serializes the set, including the two comment header lines.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"#\n");
        let stamp = Utc::now().format("%a %b %d %H:%M:%S UTC %Y");
        out.extend_from_slice(format!("#{stamp}\n").as_bytes());
        let mut line = String::new();
        for (key, value) in &self.entries {
            line.clear();
            escape_into(key, true, &mut line);
            line.push('=');
            escape_into(value, false, &mut line);
            line.push('\n');
            out.extend_from_slice(line.as_bytes());
        }
        out
    }

    pub fn insert(&mut self, key: String, value: String) {
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Entries in sorted key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Folds `other` into this set; entries from `other` win on clashes.
    pub fn merge_from(&mut self, other: PropertySet) {
        self.entries.extend(other.entries);
    }
}

fn is_property_whitespace(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\u{c}')
}

fn ends_with_odd_backslashes(line: &str) -> bool {
    let trailing = line.chars().rev().take_while(|c| *c == '\\').count();
    trailing % 2 == 1
}

/// Splits a logical line into raw (still escaped) key and value parts.
fn split_entry(line: &str) -> (&str, &str) {
    let chars: Vec<(usize, char)> = line.char_indices().collect();
    let mut key_end = line.len();
    let mut index = 0;
    let mut separator_seen = false;
    while index < chars.len() {
        let (pos, c) = chars[index];
        match c {
            '\\' => index += 2,
            '=' | ':' => {
                key_end = pos;
                separator_seen = true;
                index += 1;
                break;
            }
            c if is_property_whitespace(c) => {
                key_end = pos;
                index += 1;
                break;
            }
            _ => index += 1,
        }
    }
    if key_end == line.len() {
        return (line, "");
    }
    while index < chars.len() && is_property_whitespace(chars[index].1) {
        index += 1;
    }
    if !separator_seen && index < chars.len() && matches!(chars[index].1, '=' | ':') {
        index += 1;
        while index < chars.len() && is_property_whitespace(chars[index].1) {
            index += 1;
        }
    }
    let value_start = chars.get(index).map(|(pos, _)| *pos).unwrap_or(line.len());
    (&line[..key_end], &line[value_start..])
}

/// Resolves backslash escapes, recombining surrogate pairs from `\uXXXX` units.
fn unescape(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\u{c}'),
            Some('u') => push_unicode(&mut chars, &mut out)?,
            Some(other) => out.push(other),
            None => {}
        }
    }
    Ok(out)
}

fn push_unicode(chars: &mut Chars<'_>, out: &mut String) -> Result<()> {
    let unit = read_hex_unit(chars)?;
    if let Some(c) = char::from_u32(u32::from(unit)) {
        out.push(c);
        return Ok(());
    }
    // UTF-16 surrogate: pair it with an immediately following \uXXXX escape
    let mut rest = chars.clone();
    if rest.next() == Some('\\') && rest.next() == Some('u') {
        let low = read_hex_unit(&mut rest)?;
        if let Some(Ok(c)) = char::decode_utf16([unit, low]).next() {
            out.push(c);
            *chars = rest;
            return Ok(());
        }
    }
    out.push(char::REPLACEMENT_CHARACTER);
    Ok(())
}

fn read_hex_unit(chars: &mut Chars<'_>) -> Result<u16> {
    let mut unit: u32 = 0;
    for _ in 0..4 {
        let digit = chars
            .next()
            .and_then(|c| c.to_digit(16))
            .context("Malformed \\uxxxx encoding in property text")?;
        unit = unit * 16 + digit;
    }
    Ok(unit as u16)
}

/// Escapes one key or value for the store format. Keys escape every space,
/// values only a leading one.
fn escape_into(text: &str, escape_all_spaces: bool, out: &mut String) {
    let mut first = true;
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ' ' => {
                if escape_all_spaces || first {
                    out.push('\\');
                }
                out.push(' ');
            }
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{c}' => out.push_str("\\f"),
            '=' | ':' | '#' | '!' => {
                out.push('\\');
                out.push(c);
            }
            c if (' '..='\u{7e}').contains(&c) => out.push(c),
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units).iter() {
                    out.push_str(&format!("\\u{unit:04X}"));
                }
            }
        }
        first = false;
    }
}
