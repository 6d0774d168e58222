//! Filename helpers for client-supplied upload names.
//!
//! Upload names are untrusted: they may carry directory components, path
//! separators from another platform, or characters that are awkward on disk.
//! Everything written under a job directory goes through [`sanitize_filename`]
//! and [`dedupe_filename`] first.

use std::collections::HashSet;
use std::path::Path;

const FALLBACK_NAME: &str = "file";

fn is_allowed(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Turns an arbitrary client filename into a safe on-disk name.
///
/// Each run of disallowed characters becomes a single `_`.
///
/// - `../../etc/passwd` → `passwd`
/// - `C:\Users\me\my photo (1).jpg` → `my_photo_1_.jpg`
/// - `..` → `file`
pub fn sanitize_filename(name: &str) -> String {
    // Both separators are stripped: clients on any platform may upload.
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");

    let mut cleaned = String::with_capacity(base.len());
    let mut in_run = false;
    for c in base.chars() {
        if is_allowed(c) {
            cleaned.push(c);
            in_run = false;
        } else if !in_run {
            cleaned.push('_');
            in_run = true;
        }
    }

    match cleaned.as_str() {
        "" | "." | ".." => FALLBACK_NAME.to_string(),
        _ => cleaned,
    }
}

/// Splits `name` into stem and extension (extension includes the dot).
///
/// A leading dot does not start an extension: `.hidden` has none.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

/// Returns `desired` if it is not in `existing`, otherwise the first of
/// `stem_1.ext`, `stem_2.ext`, … that is not taken.
pub fn dedupe_filename<S>(existing: &HashSet<S>, desired: &str) -> String
where
    S: std::borrow::Borrow<str> + std::hash::Hash + Eq,
{
    if !existing.contains(desired) {
        return desired.to_string();
    }

    let (stem, ext) = split_extension(desired);
    let mut counter: u64 = 1;
    loop {
        let candidate = format!("{}_{}{}", stem, counter, ext);
        if !existing.contains(candidate.as_str()) {
            return candidate;
        }
        counter += 1;
    }
}

/// Returns only the filename component of a path (no directory).
///
/// Used for log fields so full storage paths stay out of the logs.
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}
