//! Reader/writer for `/etc/sysconfig` style key/value files.
//!
//! Both daemons are configured through shell-compatible `KEY="value"` files.
//! Comments and the order of existing lines survive a load/save round trip so
//! `init-server` can rewrite a hand-edited file without destroying it.

use crate::error::{KeywardenError, KeywardenResult};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

#[derive(Debug, Clone)]
enum Line {
    /// Comment or blank line, reproduced verbatim.
    Verbatim(String),
    Pair { key: String, value: String },
}

/// An ordered key/value document with shell-style quoting.
#[derive(Debug, Clone, Default)]
pub struct Sysconfig {
    lines: Vec<Line>,
    index: HashMap<String, usize>,
}

impl Sysconfig {
    /// Parse a sysconfig document. Lines that are not `KEY=value` pairs are
    /// kept verbatim so they can be written back unchanged.
    pub fn parse(text: &str) -> Self {
        let mut cfg = Sysconfig::default();
        for raw in text.lines() {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                cfg.lines.push(Line::Verbatim(raw.to_string()));
                continue;
            }
            match trimmed.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim().to_string();
                    let value = unquote(value.trim());
                    cfg.index.insert(key.clone(), cfg.lines.len());
                    cfg.lines.push(Line::Pair { key, value });
                }
                None => cfg.lines.push(Line::Verbatim(raw.to_string())),
            }
        }
        cfg
    }

    /// Load a file, treating a missing file as an empty document.
    pub fn load<P: AsRef<Path>>(path: P) -> KeywardenResult<Self> {
        match fs::read_to_string(path.as_ref()) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(KeywardenError::Io(err)),
        }
    }

    /// Serialise back to text, quoting every value.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Verbatim(raw) => out.push_str(raw),
                Line::Pair { key, value } => {
                    out.push_str(key);
                    out.push_str("=\"");
                    out.push_str(&value.replace('\\', "\\\\").replace('"', "\\\""));
                    out.push('"');
                }
            }
            out.push('\n');
        }
        out
    }

    /// Write the document to `path` with owner-only permissions.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> KeywardenResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_text())?;
        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        match self.index.get(key) {
            Some(&at) => match &self.lines[at] {
                Line::Pair { value, .. } => value.clone(),
                Line::Verbatim(_) => default.to_string(),
            },
            None => default.to_string(),
        }
    }

    pub fn get_int<T>(&self, key: &str, default: T) -> T
    where
        T: std::str::FromStr + Copy,
    {
        let raw = self.get_str(key, "");
        if raw.is_empty() {
            return default;
        }
        raw.trim().parse().unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        let raw = self.get_str(key, "");
        if raw.is_empty() {
            return default;
        }
        matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "yes" | "true" | "1" | "on"
        )
    }

    /// Whitespace-separated list value.
    pub fn get_str_list(&self, key: &str) -> Vec<String> {
        self.get_str(key, "")
            .split_whitespace()
            .map(|item| item.to_string())
            .collect()
    }

    /// Set a key, replacing an existing pair in place or appending a new one.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.index.get(key) {
            Some(&at) => {
                self.lines[at] = Line::Pair {
                    key: key.to_string(),
                    value,
                };
            }
            None => {
                self.index.insert(key.to_string(), self.lines.len());
                self.lines.push(Line::Pair {
                    key: key.to_string(),
                    value,
                });
            }
        }
    }

    pub fn set_int(&mut self, key: &str, value: impl ToString) {
        self.set(key, value.to_string());
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.set(key, if value { "yes" } else { "no" });
    }
}

fn unquote(value: &str) -> String {
    let stripped = value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .or_else(|| {
            value
                .strip_prefix('\'')
                .and_then(|rest| rest.strip_suffix('\''))
        });
    match stripped {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => value.to_string(),
    }
}
