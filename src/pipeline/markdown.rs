//! Markdown-side helpers: result-file selection and preamble trimming.
//!
//! Both the result cache and the archive extractor must agree on which
//! Markdown file in an output directory is *the* result, so the policy lives
//! here and is used by both. The tie-break is deterministic: reproducible
//! lookups are what make the cache and the tests trustworthy.

use std::path::{Path, PathBuf};

/// Recursively collect every `.md` file under `dir`.
///
/// Unreadable subdirectories are skipped rather than failing the walk: the
/// cache scans directories it does not own.
pub fn find_markdown_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("md"))
            {
                found.push(path);
            }
        }
    }
    found
}

/// Pick the canonical Markdown file among candidates.
///
/// Preference order:
/// 1. a path containing a `markdown` segment (the bundle convention);
/// 2. the lexicographically first path, compared ASCII-case-insensitively —
///    locale-neutral so the choice is identical on every machine.
pub fn select_markdown_file(candidates: &[PathBuf]) -> Option<PathBuf> {
    let key = |p: &PathBuf| p.to_string_lossy().to_ascii_lowercase();

    let mut preferred: Vec<&PathBuf> = candidates
        .iter()
        .filter(|p| {
            p.components().any(|c| {
                c.as_os_str()
                    .to_string_lossy()
                    .eq_ignore_ascii_case("markdown")
            })
        })
        .collect();
    if preferred.is_empty() {
        preferred = candidates.iter().collect();
    }
    preferred.sort_by_key(|p| key(p));
    preferred.first().map(|p| (*p).clone())
}

/// Strip everything before the first Markdown heading.
///
/// Remote OCR output often opens with running headers, page numbers, or DOI
/// banners before the real title heading. Content without any heading is
/// returned unchanged.
pub fn trim_preamble(markdown: &str) -> &str {
    for (offset, line) in markdown
        .lines()
        .map(|l| (l.as_ptr() as usize - markdown.as_ptr() as usize, l))
    {
        if line.trim_start().starts_with('#') {
            return &markdown[offset..];
        }
    }
    markdown
}
