//! Record merging for both merge modes. Merges only add information:
//! importance takes the max, pinned is sticky, tags are unioned.

use chrono::Utc;

use super::classifier::FactCandidate;
use super::text::{contains_ci, truncate_chars};
use super::types::MemoryRecord;
use crate::config::SUMMARY_MAX_CHARS;

/// Build a fresh record from a trigger candidate
pub fn candidate_record(owner_id: &str, candidate: &FactCandidate, source: &str) -> MemoryRecord {
    let mut record = MemoryRecord::new(
        owner_id,
        super::types::MemoryType::Semantic,
        candidate.category.clone(),
        candidate.summary.clone(),
        candidate.importance,
    )
    .with_tags(candidate.tags.iter().cloned())
    .with_source(source)
    .pinned(candidate.pinned);

    if let Some(display) = &candidate.display_summary {
        record.display_summary = display.clone();
    }
    record
}

/// The text shown for a merge: the containing one if either contains the
/// other, else the longer
pub fn merge_display(existing: &str, candidate: &str) -> String {
    if contains_ci(existing, candidate) {
        return existing.to_string();
    }
    if contains_ci(candidate, existing) {
        return candidate.to_string();
    }
    if candidate.chars().count() > existing.chars().count() {
        candidate.to_string()
    } else {
        existing.to_string()
    }
}

/// Merged summary when the summarizer is unavailable
pub fn fallback_summary(existing: &str, candidate: &str) -> String {
    if contains_ci(candidate, existing) {
        return truncate_chars(candidate, SUMMARY_MAX_CHARS);
    }
    if contains_ci(existing, candidate) {
        return truncate_chars(existing, SUMMARY_MAX_CHARS);
    }
    let existing = existing.trim_end_matches(|c: char| c == '.' || c.is_whitespace());
    truncate_chars(&format!("{}; {}", existing, candidate), SUMMARY_MAX_CHARS)
}

fn absorb_flags(target: &mut MemoryRecord, existing: &MemoryRecord, candidate: &FactCandidate) {
    target.importance = existing.importance.max(candidate.importance);
    target.pinned = existing.pinned || candidate.pinned;
    target.tags = existing.tags.clone();
    target.tags.extend(candidate.tags.iter().cloned());
}

/// Update-in-place: same id, longer summary wins
pub fn apply_update(existing: &MemoryRecord, candidate: &FactCandidate) -> MemoryRecord {
    let mut merged = existing.clone();

    if candidate.summary.chars().count() > existing.summary.chars().count() {
        merged.set_summary(&candidate.summary);
    }
    merged.display_summary = match &candidate.display_summary {
        Some(display) => display.clone(),
        None => merge_display(&existing.display_summary, &candidate.summary),
    };
    absorb_flags(&mut merged, existing, candidate);
    merged.last_accessed = Utc::now();
    merged.refresh_derived();
    merged
}

/// Recreate: new id carrying the original `created_at`
pub fn compose_recreated(
    existing: &MemoryRecord,
    candidate: &FactCandidate,
    merged_summary: &str,
) -> MemoryRecord {
    let candidate_display = candidate
        .display_summary
        .as_deref()
        .unwrap_or(&candidate.summary);

    let mut merged = MemoryRecord::new(
        existing.owner_id.clone(),
        existing.memory_type,
        existing.category.clone(),
        merged_summary,
        existing.importance,
    )
    .with_source(existing.source.clone());

    merged.display_summary = merge_display(&existing.display_summary, candidate_display);
    merged.created_at = existing.created_at;
    merged.extra = existing.extra.clone();
    absorb_flags(&mut merged, existing, candidate);
    merged.refresh_derived();
    merged
}
