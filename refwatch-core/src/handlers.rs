use crate::atomic::AtomicWriter;
use crate::error::{retry_io, Error, Result};
use bstr::ByteSlice;
use memmap2::Mmap;
use regex::bytes::{Captures, Regex, RegexBuilder};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Container extensions and their handler kind. Closed set.
pub const CONTAINER_EXTENSIONS: &[&str] = &[".mtl", ".xml", ".lay", ".lyr", ".cdf", ".lua"];

/// Attribute keys whose quoted values are treated as asset references.
const REFERENCE_KEYS: &str = "File|Texture|filename|path|Material";

/// Files above this size are read instead of memory-mapped.
const MMAP_THRESHOLD: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// `KEY = "value"` attribute assignments (.mtl, .xml, .lay, .lyr, .cdf).
    Attribute,
    /// Bare quoted string literals (.lua).
    StringLiteral,
}

pub fn handler_for(ext: &str) -> Option<HandlerKind> {
    match ext {
        ".mtl" | ".xml" | ".lay" | ".lyr" | ".cdf" => Some(HandlerKind::Attribute),
        ".lua" => Some(HandlerKind::StringLiteral),
        _ => None,
    }
}

pub fn kind_for_path(path: &Path) -> Option<HandlerKind> {
    crate::ext_of(path).and_then(|ext| handler_for(&ext))
}

pub fn is_container_path(path: &Path) -> bool {
    kind_for_path(path).is_some()
}

/// The substitution to perform on matched reference values.
#[derive(Debug, Clone)]
pub enum Replacements {
    /// Lowercased old reference → new reference (original case).
    Exact(HashMap<String, String>),
    /// Prefix substitution for a directory move.
    DirMove { old_dir: String, new_dir: String },
}

impl Replacements {
    pub fn exact<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Self::Exact(
            pairs
                .into_iter()
                .map(|(old, new)| (old.to_lowercase(), new))
                .collect(),
        )
    }

    pub fn dir_move(old_dir: impl Into<String>, new_dir: impl Into<String>) -> Self {
        Self::DirMove {
            old_dir: old_dir.into(),
            new_dir: new_dir.into(),
        }
    }

    /// New value for a matched reference, or `None` to leave it alone.
    fn apply(&self, raw_value: &[u8]) -> Option<String> {
        let normalized = normalize_value(raw_value);
        let lower = normalized.to_lowercase();
        match self {
            Self::Exact(map) => map.get(&lower).cloned(),
            Self::DirMove { old_dir, new_dir } => {
                let prefix = format!("{}/", old_dir.to_lowercase());
                if !lower.starts_with(&prefix) {
                    return None;
                }
                // Tail keeps the reference's original case, including the slash.
                normalized
                    .get(old_dir.len()..)
                    .map(|tail| format!("{new_dir}{tail}"))
            },
        }
    }
}

/// Trim, normalize separators to forward slashes, keep original case.
fn normalize_value(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw.trim()).replace('\\', "/")
}

/// Lowercased lookup form of a reference value.
fn normalize_key(raw: &[u8]) -> String {
    normalize_value(raw).to_lowercase()
}

/// Compiled reference patterns for both handler kinds.
///
/// The patterns are built once from the tracked-extension set; quote pairing
/// (`"..."` vs `'...'`) is enforced in the match callbacks because the regex
/// engine has no backreferences.
#[derive(Debug, Clone)]
pub struct HandlerSet {
    attribute: Regex,
    material: Regex,
    literal: Regex,
}

impl HandlerSet {
    pub fn new(tracked: &HashSet<String>) -> std::result::Result<Self, regex::Error> {
        let mut exts: Vec<&String> = tracked.iter().collect();
        exts.sort();
        let ext_alt = if exts.is_empty() {
            // Never matches.
            "[^\\s\\S]".to_string()
        } else {
            exts.iter()
                .map(|ext| regex::escape(ext))
                .collect::<Vec<_>>()
                .join("|")
        };

        let build = |pattern: &str| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .unicode(false)
                .build()
        };

        let attribute = build(&format!(
            r#"(\b(?:{REFERENCE_KEYS})\s*=\s*)(["'])([^"']+(?:{ext_alt}))(["'])"#
        ))?;
        // Materials are referenced without their extension too; those values
        // carry no suffix the tracked-extension pattern could anchor on.
        let material = build(r#"(\bMaterial\s*=\s*)(["'])([^"'\r\n]+)(["'])"#)?;
        let literal = build(&format!(r#"(["'])([^"']+(?:{ext_alt}))(["'])"#))?;

        Ok(Self {
            attribute,
            material,
            literal,
        })
    }

    /// Extract all normalized reference keys from a container file.
    ///
    /// Empty files yield the empty set. Read errors propagate after the
    /// transient-retry loop so callers can skip or retry.
    pub fn parse_file(&self, path: &Path) -> io::Result<HashSet<String>> {
        let Some(kind) = kind_for_path(path) else {
            return Ok(HashSet::new());
        };
        let content = retry_io(|| read_file_content(path))?;
        Ok(self.parse_bytes(kind, &content))
    }

    pub fn parse_bytes(&self, kind: HandlerKind, content: &[u8]) -> HashSet<String> {
        let mut refs = HashSet::new();
        match kind {
            HandlerKind::Attribute => {
                for caps in self.attribute.captures_iter(content) {
                    if caps[2] == caps[4] {
                        refs.insert(normalize_key(&caps[3]));
                    }
                }
                for caps in self.material.captures_iter(content) {
                    if caps[2] == caps[4] {
                        refs.insert(normalize_key(&caps[3]));
                    }
                }
            },
            HandlerKind::StringLiteral => {
                for caps in self.literal.captures_iter(content) {
                    if caps[1] == caps[3] {
                        refs.insert(normalize_key(&caps[2]));
                    }
                }
            },
        }
        refs.retain(|r| !r.is_empty());
        refs
    }

    /// Substitute matched references and write the file back atomically.
    ///
    /// Quote style, whitespace and every unmatched byte are preserved
    /// verbatim; nothing is written when no reference changed. Returns
    /// whether a write happened.
    pub fn rewrite_file(
        &self,
        path: &Path,
        replacements: &Replacements,
        writer: &AtomicWriter,
    ) -> Result<bool> {
        let Some(kind) = kind_for_path(path) else {
            return Ok(false);
        };
        let content = retry_io(|| read_file_content(path)).map_err(|source| Error::Rewrite {
            path: path.to_path_buf(),
            source,
        })?;

        let updated = self.rewrite_bytes(kind, &content, replacements);
        if updated == content {
            return Ok(false);
        }

        writer
            .write(path, &updated)
            .map_err(|source| Error::Rewrite {
                path: path.to_path_buf(),
                source,
            })
    }

    pub fn rewrite_bytes(
        &self,
        kind: HandlerKind,
        content: &[u8],
        replacements: &Replacements,
    ) -> Vec<u8> {
        match kind {
            HandlerKind::Attribute => {
                let pass = substitute_keyed(&self.attribute, content, replacements);
                substitute_keyed(&self.material, &pass, replacements)
            },
            HandlerKind::StringLiteral => {
                let rewritten = self.literal.replace_all(content, |caps: &Captures| {
                    if caps[1] != caps[3] {
                        return caps[0].to_vec();
                    }
                    match replacements.apply(&caps[2]) {
                        Some(new_value) => {
                            let mut out = caps[1].to_vec();
                            out.extend_from_slice(new_value.as_bytes());
                            out.extend_from_slice(&caps[3]);
                            out
                        },
                        None => caps[0].to_vec(),
                    }
                });
                rewritten.into_owned()
            },
        }
    }
}

/// Substitution pass for a `(prefix)(quote)(value)(quote)` pattern.
fn substitute_keyed(regex: &Regex, content: &[u8], replacements: &Replacements) -> Vec<u8> {
    regex
        .replace_all(content, |caps: &Captures| {
            if caps[2] != caps[4] {
                return caps[0].to_vec();
            }
            match replacements.apply(&caps[3]) {
                Some(new_value) => {
                    let mut out = caps[1].to_vec();
                    out.extend_from_slice(&caps[2]);
                    out.extend_from_slice(new_value.as_bytes());
                    out.extend_from_slice(&caps[4]);
                    out
                },
                None => caps[0].to_vec(),
            }
        })
        .into_owned()
}

fn read_file_content(path: &Path) -> io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;

    if metadata.len() == 0 {
        Ok(Vec::new())
    } else if metadata.len() > MMAP_THRESHOLD {
        let mut content = Vec::new();
        File::open(path)?.read_to_end(&mut content)?;
        Ok(content)
    } else {
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(mmap.to_vec())
    }
}
