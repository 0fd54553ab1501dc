//! Result-bundle extraction.
//!
//! The parsing service returns a zip archive holding the Markdown result
//! (canonically under a `markdown/` segment) and the referenced images at
//! relative paths. Entry paths are attacker-controlled, so every name is
//! validated before a single byte is written: absolute paths, drive-letter
//! prefixes, and `.`/`..` segments abort the whole extraction as a
//! [`ParseError::MaliciousArchive`]. Validation runs as a pre-pass over all
//! entries — a malicious archive leaves no partial tree behind.

use crate::error::ParseError;
use crate::pipeline::markdown::{find_markdown_files, select_markdown_file};
use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::ZipArchive;

/// Normalize one archive entry name to a safe relative path.
///
/// Returns `None` for names that must not be written: absolute paths,
/// Windows drive-letter paths, and any `.` or `..` segment. An empty result
/// after normalization is only acceptable for directory markers; the caller
/// decides.
fn sanitize_entry_path(name: &str) -> Option<PathBuf> {
    let unified = name.replace('\\', "/");
    if unified.starts_with('/') {
        return None;
    }
    // "C:/..." or "C:..." style prefixes
    let bytes = unified.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return None;
    }
    let mut out = PathBuf::new();
    for segment in unified.split('/') {
        match segment {
            "" => continue,
            "." | ".." => return None,
            s => out.push(s),
        }
    }
    Some(out)
}

/// Expand `bytes` into `out_dir` and return the canonical Markdown path.
///
/// Selection follows [`select_markdown_file`]; an archive without any `.md`
/// file yields [`ParseError::MarkdownMissing`].
pub fn extract_bundle(bytes: &[u8], out_dir: &Path) -> Result<PathBuf, ParseError> {
    extract_archive(bytes, out_dir)?;
    let candidates = find_markdown_files(out_dir);
    select_markdown_file(&candidates).ok_or_else(|| ParseError::MarkdownMissing {
        dir: out_dir.to_path_buf(),
    })
}

/// Expand every entry of the archive into `out_dir`.
pub fn extract_archive(bytes: &[u8], out_dir: &Path) -> Result<(), ParseError> {
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| ParseError::ArchiveCorrupt {
            detail: e.to_string(),
        })?;

    // Validation pre-pass: no file is written until every entry name is safe.
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(|e| ParseError::ArchiveCorrupt {
            detail: e.to_string(),
        })?;
        let name = entry.name().to_string();
        let is_dir = entry.is_dir();
        match sanitize_entry_path(&name) {
            Some(p) if p.as_os_str().is_empty() && !is_dir => {
                return Err(ParseError::MaliciousArchive { entry: name });
            }
            Some(_) => {}
            None => {
                return Err(ParseError::MaliciousArchive { entry: name });
            }
        }
    }

    std::fs::create_dir_all(out_dir).map_err(|e| ParseError::io(out_dir, e))?;
    // Parent creation is memoized per run; bundles hold many images per dir.
    let mut created: HashSet<PathBuf> = HashSet::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| ParseError::ArchiveCorrupt {
            detail: e.to_string(),
        })?;
        // Already validated above.
        let Some(rel) = sanitize_entry_path(entry.name()) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = out_dir.join(&rel);

        if entry.is_dir() {
            if created.insert(target.clone()) {
                std::fs::create_dir_all(&target).map_err(|e| ParseError::io(&target, e))?;
            }
            continue;
        }

        if let Some(parent) = target.parent() {
            if created.insert(parent.to_path_buf()) {
                std::fs::create_dir_all(parent).map_err(|e| ParseError::io(parent, e))?;
            }
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| ParseError::ArchiveCorrupt {
                detail: e.to_string(),
            })?;
        std::fs::write(&target, data).map_err(|e| ParseError::io(&target, e))?;
    }

    debug!("Extracted {} entries into {}", archive.len(), out_dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut w = ZipWriter::new(Cursor::new(Vec::new()));
        let opts = SimpleFileOptions::default();
        for (name, data) in entries {
            if name.ends_with('/') {
                w.add_directory(name.trim_end_matches('/'), opts).unwrap();
            } else {
                w.start_file(*name, opts).unwrap();
                w.write_all(data).unwrap();
            }
        }
        w.finish().unwrap().into_inner()
    }

    #[test]
    fn sanitize_accepts_plain_relative() {
        assert_eq!(
            sanitize_entry_path("markdown/full.md"),
            Some(PathBuf::from("markdown/full.md"))
        );
        assert_eq!(
            sanitize_entry_path("images//fig1.png"),
            Some(PathBuf::from("images/fig1.png"))
        );
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert_eq!(sanitize_entry_path("../evil.md"), None);
        assert_eq!(sanitize_entry_path("a/../../evil.md"), None);
        assert_eq!(sanitize_entry_path("/etc/passwd"), None);
        assert_eq!(sanitize_entry_path("C:/windows/system32"), None);
        assert_eq!(sanitize_entry_path("c:\\boot.ini"), None);
        assert_eq!(sanitize_entry_path("./a/./b"), None);
    }

    #[test]
    fn extract_and_select() {
        let bytes = build_zip(&[
            ("markdown/full.md", b"# Title\nbody\n"),
            ("images/fig1.png", &[1, 2, 3]),
            ("layout.json", b"{}"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let md = extract_bundle(&bytes, dir.path()).unwrap();
        assert_eq!(md, dir.path().join("markdown/full.md"));
        assert_eq!(std::fs::read_to_string(&md).unwrap(), "# Title\nbody\n");
        assert_eq!(
            std::fs::read(dir.path().join("images/fig1.png")).unwrap(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn extraction_is_idempotent() {
        let bytes = build_zip(&[
            ("b/out.md", b"beta"),
            ("markdown/out.md", b"# canonical\n"),
            ("a/out.md", b"alpha"),
        ]);
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();
        let m1 = extract_bundle(&bytes, d1.path()).unwrap();
        let m2 = extract_bundle(&bytes, d2.path()).unwrap();
        assert_eq!(m1.strip_prefix(d1.path()).unwrap(), m2.strip_prefix(d2.path()).unwrap());
        assert_eq!(
            std::fs::read(&m1).unwrap(),
            std::fs::read(&m2).unwrap()
        );
    }

    #[test]
    fn traversal_entry_aborts_without_partial_tree() {
        let bytes = build_zip(&[
            ("markdown/full.md", b"# ok\n"),
            ("../outside.md", b"evil"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let err = extract_bundle(&bytes, &out).unwrap_err();
        assert!(matches!(err, ParseError::MaliciousArchive { .. }));
        // Pre-pass validation: nothing was written at all.
        assert!(!out.exists());
    }

    #[test]
    fn absolute_entry_aborts() {
        let bytes = build_zip(&[("/etc/cron.d/x", b"evil")]);
        let dir = tempfile::tempdir().unwrap();
        let err = extract_archive(&bytes, dir.path()).unwrap_err();
        assert!(matches!(err, ParseError::MaliciousArchive { .. }));
    }

    #[test]
    fn directory_entries_created() {
        let bytes = build_zip(&[("images/", b""), ("images/fig.png", &[9])]);
        let dir = tempfile::tempdir().unwrap();
        extract_archive(&bytes, dir.path()).unwrap();
        assert!(dir.path().join("images").is_dir());
        assert!(dir.path().join("images/fig.png").is_file());
    }

    #[test]
    fn garbage_is_corrupt_not_malicious() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_archive(b"not a zip at all", dir.path()).unwrap_err();
        assert!(matches!(err, ParseError::ArchiveCorrupt { .. }));
    }

    #[test]
    fn no_markdown_in_bundle() {
        let bytes = build_zip(&[("images/fig.png", &[1])]);
        let dir = tempfile::tempdir().unwrap();
        let err = extract_bundle(&bytes, dir.path()).unwrap_err();
        assert!(matches!(err, ParseError::MarkdownMissing { .. }));
    }
}
