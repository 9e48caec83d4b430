//! Restoration of original values in upstream replies
//!
//! Completion models often echo only part of a multi-word synthetic value,
//! e.g. the first name of a generated full name. Restoration therefore runs
//! in two ordered phases:
//!
//! 1. **Fragment normalization.** For each multi-word synthetic value,
//!    longest first, standalone occurrences of its words are upgraded to the
//!    full synthetic value. Words already inside an occurrence of any
//!    synthetic value are left alone, as are words that are themselves a
//!    complete synthetic value or start lowercase (connectives such as the
//!    `and` in a company name).
//! 2. **Substitution.** Whole-word occurrences of each synthetic value,
//!    longest first, are replaced by the original. A shorter value never
//!    matches inside a span already claimed by a longer one.
//!
//! Reordering either phase changes results. A synthetic value that turns up
//! in the reply as unrelated content is restored anyway; that over-restoration
//! is accepted.

use crate::detection::whole_word_regex;
use crate::error::Result;
use crate::mapping::{FakeMapping, MappingStore};
use std::ops::Range;
use tracing::{debug, info};

pub struct DeanonymizationEngine {
    store: MappingStore,
}

impl DeanonymizationEngine {
    pub fn new(store: MappingStore) -> Self {
        Self { store }
    }

    /// Consumes the request's mapping and restores `text` with it. The record
    /// is spent even if nothing in `text` matches; a second call fails with
    /// `NotFound`.
    pub async fn deanonymize(&self, text: &str, request_id: &str) -> Result<String> {
        let mapping = self.store.consume(request_id).await?;
        let restored = restore(text, &mapping)?;
        info!(
            "Deanonymized reply for request '{}' ({} synthetic values known)",
            request_id,
            mapping.len()
        );
        Ok(restored)
    }
}

/// Both phases, in order.
pub fn restore(text: &str, mapping: &FakeMapping) -> Result<String> {
    if mapping.is_empty() || text.is_empty() {
        return Ok(text.to_string());
    }
    let normalized = normalize_fragments(text, mapping)?;
    substitute(&normalized, mapping)
}

/// Phase 1: upgrade standalone fragments of multi-word synthetic values to
/// the full value.
pub fn normalize_fragments(text: &str, mapping: &FakeMapping) -> Result<String> {
    let fakes = mapping.fakes_longest_first();
    let mut result = text.to_string();

    for fake in &fakes {
        let mut components: Vec<&str> = fake
            .split_whitespace()
            .map(|c| c.trim_matches(|ch: char| !ch.is_alphanumeric()))
            .filter(|c| !c.is_empty())
            .collect();
        if components.len() < 2 {
            continue;
        }
        components.dedup();

        for component in components {
            if mapping.contains_fake(component) || component.starts_with(char::is_lowercase) {
                continue;
            }

            let protected = occurrences_of_all(&result, &fakes)?;
            let matcher = whole_word_regex(component)?;
            let fragments: Vec<Range<usize>> = matcher
                .find_iter(&result)
                .map(|m| m.range())
                .filter(|r| !protected.iter().any(|p| overlaps(p, r)))
                .collect();

            if fragments.is_empty() {
                continue;
            }
            debug!(
                "Upgrading {} standalone fragment(s) to a full synthetic value",
                fragments.len()
            );
            for range in fragments.into_iter().rev() {
                result.replace_range(range, fake);
            }
        }
    }

    Ok(result)
}

/// Phase 2: replace every whole-word synthetic value with its original.
pub fn substitute(text: &str, mapping: &FakeMapping) -> Result<String> {
    let mut claimed: Vec<(Range<usize>, &str)> = Vec::new();

    for fake in mapping.fakes_longest_first() {
        let Some(original) = mapping.original_for(fake) else {
            continue;
        };
        let matcher = whole_word_regex(fake)?;
        for m in matcher.find_iter(text) {
            let range = m.range();
            if claimed.iter().any(|(c, _)| overlaps(c, &range)) {
                continue;
            }
            claimed.push((range, original));
        }
    }

    claimed.sort_by(|a, b| b.0.start.cmp(&a.0.start));
    let mut result = text.to_string();
    for (range, original) in claimed {
        result.replace_range(range, original);
    }
    Ok(result)
}

fn occurrences_of_all(text: &str, fakes: &[&str]) -> Result<Vec<Range<usize>>> {
    let mut ranges = Vec::new();
    for fake in fakes {
        let matcher = whole_word_regex(fake)?;
        ranges.extend(matcher.find_iter(text).map(|m| m.range()));
    }
    Ok(ranges)
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}
