// src/config/alias.rs

//! Alias preprocessing.
//!
//! Before structural parsing, every `<directive><name>` token in the raw
//! document is replaced by its alias value. The pass runs exactly once;
//! substituted content is never re-expanded. A doubled directive escapes
//! to a single literal directive, and undefined names are left verbatim.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::config::model::AliasConfig;
use crate::errors::LoadError;

/// Directive used when the document declares none.
pub const DEFAULT_DIRECTIVE: char = '$';

/// Minimal probe that pulls the `alias` block out of a raw document.
/// Structural errors are deferred to the loader, which parses the full
/// document after substitution.
#[derive(Debug, Default, Deserialize)]
struct AliasProbe {
    #[serde(default)]
    alias: Option<AliasConfig>,
}

/// Run the alias preprocessor over a raw task document.
///
/// `base_dir` anchors relative `alias.src` paths; pass the directory the
/// document was read from.
pub fn preprocess(doc: &str, base_dir: &Path) -> Result<String, LoadError> {
    let alias = match serde_yaml::from_str::<AliasProbe>(doc) {
        Ok(probe) => probe.alias.unwrap_or_default(),
        // Not a parseable document; let the loader report it.
        Err(_) => return Ok(doc.to_string()),
    };

    let directive = parse_directive(alias.directive.as_deref())?;
    let values = collect_values(&alias, base_dir)?;

    debug!(
        directive = %directive,
        values = values.len(),
        "preprocessing aliases"
    );
    Ok(substitute(doc, directive, &values))
}

/// Validate that the declared directive is exactly one character.
fn parse_directive(declared: Option<&str>) -> Result<char, LoadError> {
    match declared {
        None => Ok(DEFAULT_DIRECTIVE),
        Some(s) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(c),
                _ => Err(LoadError::InvalidAliasDirective(s.to_string())),
            }
        }
    }
}

/// Merge alias values from `src` documents and inline `values`.
/// Later sources override earlier ones; inline values override all.
fn collect_values(
    alias: &AliasConfig,
    base_dir: &Path,
) -> Result<BTreeMap<String, String>, LoadError> {
    let mut values = BTreeMap::new();

    for src in &alias.src {
        let path = base_dir.join(src);
        let contents =
            fs::read_to_string(&path).map_err(|source| LoadError::AliasSourceUnreadable {
                path: src.clone(),
                source,
            })?;
        let external: BTreeMap<String, String> =
            serde_yaml::from_str(&contents).map_err(LoadError::Parse)?;
        values.extend(external);
    }

    values.extend(alias.values.clone());
    Ok(values)
}

/// Single-pass substitution of `<directive><ident>` tokens.
///
/// An identifier is the longest run of letters and digits after the
/// directive. `<directive><directive>` produces one literal directive and
/// suppresses recognition at that position.
pub fn substitute(doc: &str, directive: char, values: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(doc.len());
    let mut chars = doc.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != directive {
            out.push(ch);
            continue;
        }

        if chars.peek() == Some(&directive) {
            chars.next();
            out.push(directive);
            continue;
        }

        let mut ident = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_alphanumeric() {
                ident.push(c);
                chars.next();
            } else {
                break;
            }
        }

        if ident.is_empty() {
            out.push(directive);
        } else if let Some(value) = values.get(&ident) {
            out.push_str(value);
        } else {
            out.push(directive);
            out.push_str(&ident);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_defined_names() {
        let v = values(&[("image", "ubuntu:22.04")]);
        assert_eq!(substitute("cmd: $image echo", '$', &v), "cmd: ubuntu:22.04 echo");
    }

    #[test]
    fn doubled_directive_escapes() {
        let v = values(&[("image", "ubuntu")]);
        assert_eq!(substitute("cost: $$image", '$', &v), "cost: $image");
    }

    #[test]
    fn undefined_names_are_left_verbatim() {
        let v = values(&[]);
        assert_eq!(substitute("cmd: $missing", '$', &v), "cmd: $missing");
    }

    #[test]
    fn identifier_matching_is_greedy() {
        let v = values(&[("a", "short"), ("abc", "long")]);
        assert_eq!(substitute("$abc", '$', &v), "long");
        assert_eq!(substitute("$a-b", '$', &v), "short-b");
    }

    #[test]
    fn trailing_directive_is_preserved() {
        let v = values(&[]);
        assert_eq!(substitute("price: $", '$', &v), "price: $");
    }

    #[test]
    fn multi_byte_directive_works() {
        let v = values(&[("img", "alpine")]);
        assert_eq!(substitute("run 🐳img and 🐳🐳img", '🐳', &v), "run alpine and 🐳img");
    }
}
