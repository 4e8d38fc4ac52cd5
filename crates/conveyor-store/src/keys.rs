//! Cache key resolution.
//!
//! Keys are built by substituting instance attributes and content hashes
//! into a template. Resolution is strict: an unknown placeholder is a
//! definition error, never an empty string, so a template typo can not
//! collapse two cache axes into one.

use conveyor_core::definition::{DimensionAssignment, dimension_value_str};
use conveyor_core::{Error, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").unwrap());

/// Attributes a key template may reference.
#[derive(Debug, Clone, Copy)]
pub struct KeyContext<'a> {
    pub job: &'a str,
    pub assignment: &'a DimensionAssignment,
    /// Hash over the step's declared `hash-files`, when any.
    pub content_hash: Option<&'a str>,
}

/// Substitute `${{ ... }}` placeholders in a key template.
///
/// Supported: `matrix.<dimension>`, `job.name`, `hash`.
pub fn resolve_key(template: &str, ctx: &KeyContext<'_>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER.captures_iter(template) {
        let whole = caps.get(0).unwrap();
        out.push_str(&template[last..whole.start()]);
        let expr = caps[1].trim();

        let value = if let Some(dim) = expr.strip_prefix("matrix.") {
            ctx.assignment.get(dim).map(dimension_value_str)
        } else {
            match expr {
                "job.name" => Some(ctx.job.to_string()),
                "hash" => ctx.content_hash.map(str::to_string),
                _ => None,
            }
        };

        match value {
            Some(v) => out.push_str(&v),
            None => return Err(Error::UnresolvedPlaceholder(expr.to_string())),
        }
        last = whole.end();
    }

    out.push_str(&template[last..]);
    Ok(out)
}

/// Deterministic hash over the byte contents of the named files, in
/// declared order. Unreadable files contribute nothing, so a missing
/// lock file degrades to a stable (if less specific) key.
pub fn hash_files(base: &Path, files: &[String]) -> String {
    let mut hasher = Sha256::new();
    for file in files {
        if let Ok(contents) = std::fs::read(base.join(file)) {
            hasher.update(&contents);
        }
    }
    hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assignment() -> DimensionAssignment {
        [
            ("os".to_string(), json!("ubuntu")),
            ("python-version".to_string(), json!(3.11)),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_resolve_substitutes_all_placeholders() {
        let a = assignment();
        let ctx = KeyContext {
            job: "tests",
            assignment: &a,
            content_hash: Some("abc123"),
        };
        let key = resolve_key(
            "pip-${{ job.name }}-${{ matrix.os }}-${{ matrix.python-version }}-${{ hash }}",
            &ctx,
        )
        .unwrap();
        assert_eq!(key, "pip-tests-ubuntu-3.11-abc123");
    }

    #[test]
    fn test_unknown_placeholder_is_an_error() {
        let a = assignment();
        let ctx = KeyContext {
            job: "tests",
            assignment: &a,
            content_hash: None,
        };
        // A typo must fail rather than resolve to an empty segment that
        // another axis could collide with.
        let err = resolve_key("pip-${{ matrix.oss }}", &ctx).unwrap_err();
        assert!(matches!(err, Error::UnresolvedPlaceholder(_)));

        let err = resolve_key("pip-${{ hash }}", &ctx).unwrap_err();
        assert!(matches!(err, Error::UnresolvedPlaceholder(_)));
    }

    #[test]
    fn test_template_without_placeholders_passes_through() {
        let a = DimensionAssignment::new();
        let ctx = KeyContext {
            job: "docs",
            assignment: &a,
            content_hash: None,
        };
        assert_eq!(resolve_key("static-key", &ctx).unwrap(), "static-key");
    }

    #[test]
    fn test_hash_files_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("poetry.lock"), b"locked").unwrap();

        let files = vec!["poetry.lock".to_string()];
        let first = hash_files(dir.path(), &files);
        let second = hash_files(dir.path(), &files);
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);

        std::fs::write(dir.path().join("poetry.lock"), b"changed").unwrap();
        assert_ne!(hash_files(dir.path(), &files), first);
    }
}
