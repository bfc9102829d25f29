//! Diff normalization
//!
//! Wildcard patterns replace cosmetic, per-device variation (addresses,
//! timestamps, generated ids) with positional placeholders so that diffs of
//! different services become textually comparable.
//!
//! Patterns are applied in list order. Every match of the pattern at
//! position `n` (1-based) becomes `*WILDCARD<n>*`, and later patterns only
//! ever replace text that no earlier pattern replaced. Placeholder tokens
//! already present in the input are left untouched.
//!
//! Every pattern is matched against the whole text, so anchors and word
//! boundaries see the real neighbours of a match. Passes over the pattern
//! list repeat until nothing changes, which makes normalization idempotent.

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::types::{DeviceOutput, Preview};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*WILDCARD\d+\*").expect("placeholder pattern is valid"));

/// Placeholder token for the pattern at 1-based `position`
pub fn placeholder(position: usize) -> String {
    format!("*WILDCARD{position}*")
}

/// Ordered list of compiled wildcard patterns
#[derive(Debug, Clone, Default)]
pub struct WildcardPatterns {
    patterns: Vec<Regex>,
}

/// Text under normalization, with the byte ranges no pattern may touch
struct Masked {
    text: String,
    closed: Vec<Range<usize>>,
}

impl WildcardPatterns {
    /// Compile a pattern list, naming the first invalid entry
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                Regex::new(p.as_ref()).map_err(|source| Error::InvalidPattern {
                    index: i + 1,
                    pattern: p.as_ref().to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Pattern sources in order
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(Regex::as_str)
    }

    /// Normalize one device's text
    pub fn normalize(&self, text: &str) -> String {
        if self.patterns.is_empty() {
            return text.to_string();
        }

        let mut masked = Masked::protect(text);
        loop {
            let mut changed = false;
            for (i, pattern) in self.patterns.iter().enumerate() {
                changed |= masked.substitute(pattern, &placeholder(i + 1));
            }
            if !changed {
                return masked.text;
            }
        }
    }

    /// Normalize every device's output, keeping device order
    pub fn normalize_devices(&self, raw: &[DeviceOutput]) -> Vec<DeviceOutput> {
        raw.iter()
            .map(|d| DeviceOutput::new(d.device.clone(), self.normalize(&d.output)))
            .collect()
    }

    /// Build a preview that keeps the unaltered output alongside
    pub fn preview(&self, raw: Vec<DeviceOutput>, fetched_at: DateTime<Utc>) -> Preview {
        Preview {
            fetched_at,
            normalized_output_by_device: self.normalize_devices(&raw),
            raw_output_by_device: raw,
        }
    }
}

impl Masked {
    fn protect(text: &str) -> Self {
        Self {
            text: text.to_string(),
            closed: PLACEHOLDER_RE.find_iter(text).map(|m| m.range()).collect(),
        }
    }

    fn is_open(&self, range: &Range<usize>) -> bool {
        !self
            .closed
            .iter()
            .any(|c| c.start < range.end && range.start < c.end)
    }

    /// Replace every open, non-empty match; returns whether anything changed
    fn substitute(&mut self, pattern: &Regex, token: &str) -> bool {
        let text = &self.text;
        let mut hits = Vec::new();
        let mut pos = 0;
        while let Some(m) = pattern.find_at(text, pos) {
            let range = m.range();
            if !range.is_empty() && self.is_open(&range) {
                pos = range.end;
                hits.push(range);
            } else {
                let step = text[range.start..].chars().next().map_or(1, char::len_utf8);
                pos = range.start + step;
            }
            if pos > text.len() {
                break;
            }
        }
        if hits.is_empty() {
            return false;
        }

        let mut out = String::with_capacity(text.len());
        let mut closed = Vec::with_capacity(self.closed.len() + hits.len());
        let mut kept = self.closed.iter().cloned().peekable();
        let mut last = 0;
        for hit in hits {
            let base = out.len();
            while let Some(c) = kept.next_if(|c| c.end <= hit.start) {
                closed.push(base + c.start - last..base + c.end - last);
            }
            out.push_str(&text[last..hit.start]);
            closed.push(out.len()..out.len() + token.len());
            out.push_str(token);
            last = hit.end;
        }
        let base = out.len();
        closed.extend(kept.map(|c| base + c.start - last..base + c.end - last));
        out.push_str(&text[last..]);

        self.text = out;
        self.closed = closed;
        true
    }
}

// ============================================================================
// Registry-wide Operations
// ============================================================================

/// Re-derive every stored normalized output from its unaltered copy
///
/// Covers top-level and sublayer previews. Returns the number of previews
/// rewritten.
pub fn update(registry: &Registry, patterns: &WildcardPatterns) -> usize {
    let mut updated = 0;
    registry.for_each_mut(|entry| {
        let previews = entry
            .preview
            .iter_mut()
            .chain(entry.modified_services.iter_mut().filter_map(|s| s.preview.as_mut()));
        for preview in previews {
            preview.normalized_output_by_device =
                patterns.normalize_devices(&preview.raw_output_by_device);
            updated += 1;
        }
    });
    log::info!("Re-normalized {updated} previews with {} wildcards", patterns.len());
    updated
}

/// Restore every stored normalized output to its unaltered form
///
/// Approved diffs are not touched.
pub fn rollback(registry: &Registry) -> usize {
    let mut restored = 0;
    registry.for_each_mut(|entry| {
        let previews = entry
            .preview
            .iter_mut()
            .chain(entry.modified_services.iter_mut().filter_map(|s| s.preview.as_mut()));
        for preview in previews {
            preview.rollback();
            restored += 1;
        }
    });
    log::info!("Rolled back {restored} previews to unaltered output");
    restored
}
