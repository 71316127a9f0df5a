//! Mapping from abstract [`Handle`]s to backend paths or object keys.
//!
//! Every function here is pure: the same layout and handle always produce the
//! same path, so backends never keep hidden naming state.

use crate::{Error, FileType, Handle, Result};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    /// Packs sharded into subdirectories named after the first two hex chars.
    Default,
    /// Same directory names as `Default`, no sharding (REST style).
    Flat,
    /// Singular directory names, no sharding.
    S3Legacy,
}

impl LayoutKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "default" => Ok(LayoutKind::Default),
            "flat" | "rest" => Ok(LayoutKind::Flat),
            "s3legacy" => Ok(LayoutKind::S3Legacy),
            other => Err(Error::Config(format!("unknown backend layout {other:?}"))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            LayoutKind::Default => "default",
            LayoutKind::Flat => "rest",
            LayoutKind::S3Legacy => "s3legacy",
        }
    }

    fn dir(self, file_type: FileType) -> &'static str {
        match (self, file_type) {
            (_, FileType::Config) => "",
            (_, FileType::Pack) => "data",
            (_, FileType::Index) => "index",
            (LayoutKind::S3Legacy, FileType::Snapshot) => "snapshot",
            (LayoutKind::S3Legacy, FileType::Key) => "key",
            (LayoutKind::S3Legacy, FileType::Lock) => "lock",
            (_, FileType::Snapshot) => "snapshots",
            (_, FileType::Key) => "keys",
            (_, FileType::Lock) => "locks",
        }
    }

    fn sharded(self, file_type: FileType) -> bool {
        self == LayoutKind::Default && file_type == FileType::Pack
    }
}

impl fmt::Display for LayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A layout variant rooted at a path prefix. Paths use `/` separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    kind: LayoutKind,
    root: String,
}

impl Layout {
    pub fn new(kind: LayoutKind, root: impl Into<String>) -> Self {
        let root = root.into();
        let root = if root.len() > 1 {
            root.trim_end_matches('/').to_string()
        } else {
            root
        };
        Self { kind, root }
    }

    pub fn kind(&self) -> LayoutKind {
        self.kind
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    fn join(&self, parts: &[&str]) -> String {
        let mut path = self.root.clone();
        for part in parts.iter().filter(|p| !p.is_empty()) {
            if !path.is_empty() && !path.ends_with('/') {
                path.push('/');
            }
            path.push_str(part);
        }
        path
    }

    pub fn dirname(&self, handle: &Handle) -> String {
        let dir = self.kind.dir(handle.file_type);
        match handle.name.get(..2) {
            Some(shard) if self.kind.sharded(handle.file_type) => self.join(&[dir, shard]),
            _ => self.join(&[dir]),
        }
    }

    pub fn filename(&self, handle: &Handle) -> String {
        if handle.file_type == FileType::Config {
            return self.join(&["config"]);
        }
        let dir = self.dirname(handle);
        if dir.is_empty() {
            handle.name.clone()
        } else {
            format!("{}/{}", dir, handle.name)
        }
    }

    /// Every directory a fresh repository needs.
    pub fn paths(&self) -> Vec<String> {
        let mut dirs = Vec::new();
        for file_type in FileType::ALL {
            if file_type == FileType::Config {
                continue;
            }
            let base = self.join(&[self.kind.dir(file_type)]);
            if self.kind.sharded(file_type) {
                dirs.extend((0..=255u8).map(|b| format!("{base}/{b:02x}")));
            }
            dirs.push(base);
        }
        dirs
    }

    /// Directory holding files of `file_type` and whether it has subdirectories.
    pub fn basedir(&self, file_type: FileType) -> (String, bool) {
        (
            self.join(&[self.kind.dir(file_type)]),
            self.kind.sharded(file_type),
        )
    }
}

/// Picks a layout from the relative paths found under a repository root
/// (files and directories, `/`-separated). `None` when nothing identifies one.
pub fn detect_layout<S: AsRef<str>>(entries: &[S]) -> Option<LayoutKind> {
    let mut has_keys = false;
    let mut has_key = false;
    let mut sharded_data = false;
    let mut flat_data = false;

    for entry in entries {
        let mut parts = entry.as_ref().trim_matches('/').split('/');
        let first = parts.next().unwrap_or_default();
        let second = parts.next();
        match first {
            "keys" | "snapshots" | "locks" => has_keys = true,
            "key" | "snapshot" | "lock" => has_key = true,
            "data" => match second {
                Some(s) if s.len() == 2 && s.chars().all(|c| c.is_ascii_hexdigit()) => {
                    sharded_data = true
                }
                Some(s) if s.len() > 2 => flat_data = true,
                _ => {}
            },
            _ => {}
        }
    }

    if has_key && !has_keys {
        return Some(LayoutKind::S3Legacy);
    }
    if sharded_data {
        return Some(LayoutKind::Default);
    }
    if flat_data {
        return Some(LayoutKind::Flat);
    }
    if has_keys {
        return Some(LayoutKind::Default);
    }
    None
}
