//! URL space: `(method, pattern)` entries resolved by specificity.
//!
//! A pattern is a directory path, optionally ending in a wildcard
//! filename component (`/docs/*.adp`). Plain entries apply to their whole
//! subtree unless registered no-inherit, in which case only the exact
//! path matches. The most specific entry wins: deeper directories first,
//! and at equal depth an entry with a filename filter beats one without.

use std::sync::Arc;

use globset::{Glob, GlobMatcher};

use crate::Limits;

pub struct UrlSpace {
    entries: Vec<Entry>,
}

struct Entry {
    method: String,
    /// Directory part, normalized without a trailing slash (root is "").
    dir: String,
    depth: usize,
    filter: Option<GlobMatcher>,
    noinherit: bool,
    limits: Arc<Limits>,
}

fn has_wildcard(segment: &str) -> bool {
    segment.contains(['*', '?', '['])
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

impl UrlSpace {
    pub fn new() -> Self {
        UrlSpace {
            entries: Vec::new(),
        }
    }

    /// Install an entry. The last pattern segment becomes a filename
    /// filter when it contains wildcard characters.
    pub fn insert(
        &mut self,
        method: &str,
        pattern: &str,
        noinherit: bool,
        limits: Arc<Limits>,
    ) -> Result<(), globset::Error> {
        let pattern = normalize(pattern);
        let (dir, filter) = match pattern.rsplit_once('/') {
            Some((dir, last)) if has_wildcard(last) => {
                let matcher = Glob::new(last)?.compile_matcher();
                (dir.to_string(), Some(matcher))
            }
            _ => (pattern.clone(), None),
        };
        let depth = dir.matches('/').count();
        self.entries.push(Entry {
            method: method.to_string(),
            dir,
            depth,
            filter,
            noinherit,
            limits,
        });
        Ok(())
    }

    /// Resolve the most specific entry for a request.
    pub fn find(&self, method: &str, url: &str) -> Option<Arc<Limits>> {
        let url = normalize(url);
        let filename = url.rsplit_once('/').map(|(_, f)| f).unwrap_or("");

        let mut best: Option<(&Entry, usize)> = None;
        for entry in &self.entries {
            if entry.method != method {
                continue;
            }
            let applies = if entry.noinherit {
                url == entry.dir
            } else if entry.dir.is_empty() {
                true
            } else {
                url == entry.dir
                    || url
                        .strip_prefix(entry.dir.as_str())
                        .map(|rest| rest.starts_with('/'))
                        .unwrap_or(false)
            };
            if !applies {
                continue;
            }
            if let Some(filter) = &entry.filter {
                if !filter.is_match(filename) {
                    continue;
                }
            }
            let score = entry.depth * 2 + usize::from(entry.filter.is_some());
            match best {
                Some((_, existing)) if existing >= score => {}
                _ => best = Some((entry, score)),
            }
        }
        best.map(|(entry, _)| Arc::clone(&entry.limits))
    }
}

impl Default for UrlSpace {
    fn default() -> Self {
        UrlSpace::new()
    }
}
