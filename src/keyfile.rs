/// Key-file metadata format used by deploy metadata, per-app overrides and
/// the instance info file.
///
/// The format is INI-style groups with `key=value` entries. List values are
/// `;`-separated with a trailing separator. Values use backslash escapes for
/// leading spaces, tabs, newlines and the list separator. Groups and keys
/// keep insertion order so serialized output is stable.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyFileError {
    #[error("line {0}: entry appears before any group header")]
    EntryOutsideGroup(usize),

    #[error("line {0}: malformed line: {1}")]
    MalformedLine(usize, String),

    #[error("line {0}: unterminated group header")]
    UnterminatedGroupHeader(usize),
}

#[derive(Debug, Clone, Default)]
struct Group {
    name: String,
    /// Values are stored in their escaped on-disk form.
    entries: Vec<(String, String)>,
}

/// An ordered group/key/value store matching the metadata file format.
#[derive(Debug, Clone, Default)]
pub struct KeyFile {
    groups: Vec<Group>,
}

impl KeyFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(data: &str) -> Result<Self, KeyFileError> {
        let mut kf = KeyFile::new();
        let mut current: Option<usize> = None;

        for (idx, raw_line) in data.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw_line.trim_end_matches('\r');
            let trimmed = line.trim_start();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if trimmed.starts_with('[') {
                let name = trimmed
                    .strip_prefix('[')
                    .and_then(|s| s.strip_suffix(']'))
                    .ok_or(KeyFileError::UnterminatedGroupHeader(lineno))?;
                current = Some(kf.group_index_or_insert(name));
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| KeyFileError::MalformedLine(lineno, line.to_string()))?;
            let group = current.ok_or(KeyFileError::EntryOutsideGroup(lineno))?;
            let key = key.trim().to_string();
            let value = value.to_string();

            let entries = &mut kf.groups[group].entries;
            if let Some(entry) = entries.iter_mut().find(|(k, _)| *k == key) {
                entry.1 = value;
            } else {
                entries.push((key, value));
            }
        }

        Ok(kf)
    }

    fn group_index_or_insert(&mut self, name: &str) -> usize {
        if let Some(idx) = self.groups.iter().position(|g| g.name == name) {
            return idx;
        }
        self.groups.push(Group {
            name: name.to_string(),
            entries: Vec::new(),
        });
        self.groups.len() - 1
    }

    fn find_group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.name == name)
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.name.as_str())
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.find_group(name).is_some()
    }

    pub fn has_key(&self, group: &str, key: &str) -> bool {
        self.find_group(group)
            .map(|g| g.entries.iter().any(|(k, _)| k == key))
            .unwrap_or(false)
    }

    pub fn keys(&self, group: &str) -> Vec<String> {
        self.find_group(group)
            .map(|g| g.entries.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default()
    }

    pub fn get_string(&self, group: &str, key: &str) -> Option<String> {
        let raw = self.get_raw(group, key)?;
        Some(unescape(raw, false))
    }

    pub fn get_string_list(&self, group: &str, key: &str) -> Option<Vec<String>> {
        let raw = self.get_raw(group, key)?;
        Some(
            split_list(raw)
                .into_iter()
                .map(|item| unescape(&item, true))
                .collect(),
        )
    }

    pub fn get_boolean(&self, group: &str, key: &str) -> Option<bool> {
        match self.get_raw(group, key)? {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    fn get_raw(&self, group: &str, key: &str) -> Option<&str> {
        self.find_group(group)?
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_string(&mut self, group: &str, key: &str, value: &str) {
        self.set_raw(group, key, escape(value, false));
    }

    pub fn set_string_list<S: AsRef<str>>(&mut self, group: &str, key: &str, values: &[S]) {
        let mut raw = String::new();
        for v in values {
            raw.push_str(&escape(v.as_ref(), true));
            raw.push(';');
        }
        self.set_raw(group, key, raw);
    }

    pub fn set_boolean(&mut self, group: &str, key: &str, value: bool) {
        self.set_raw(group, key, if value { "true" } else { "false" }.to_string());
    }

    fn set_raw(&mut self, group: &str, key: &str, value: String) {
        let idx = self.group_index_or_insert(group);
        let entries = &mut self.groups[idx].entries;
        if let Some(entry) = entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            entries.push((key.to_string(), value));
        }
    }

    pub fn remove_key(&mut self, group: &str, key: &str) {
        if let Some(g) = self.groups.iter_mut().find(|g| g.name == group) {
            g.entries.retain(|(k, _)| k != key);
        }
    }

    pub fn remove_group(&mut self, group: &str) {
        self.groups.retain(|g| g.name != group);
    }

    pub fn to_string(&self) -> String {
        let mut out = String::new();
        for (i, group) in self.groups.iter().enumerate() {
            if group.entries.is_empty() {
                continue;
            }
            if i > 0 && !out.is_empty() {
                out.push('\n');
            }
            out.push('[');
            out.push_str(&group.name);
            out.push_str("]\n");
            for (key, value) in &group.entries {
                out.push_str(key);
                out.push('=');
                out.push_str(value);
                out.push('\n');
            }
        }
        out
    }
}

/// Split a raw list value on unescaped separators. A trailing separator does
/// not produce an empty final item.
fn split_list(raw: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push('\\');
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ';' => {
                items.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        items.push(current);
    }
    items
}

fn escape(value: &str, is_list_item: bool) -> String {
    let mut out = String::with_capacity(value.len());
    let mut leading = true;
    for c in value.chars() {
        match c {
            ' ' if leading => out.push_str("\\s"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            ';' if is_list_item => out.push_str("\\;"),
            _ => out.push(c),
        }
        if c != ' ' {
            leading = false;
        }
    }
    out
}

fn unescape(raw: &str, is_list_item: bool) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(';') if is_list_item => out.push(';'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
