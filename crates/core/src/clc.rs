//! Class-loader contexts
//!
//! A class-loader context (CLC) string encodes the parent chain of class
//! loaders a container is loaded with, e.g. `PCL[/a/base.apk:/a/split.apk]`.
//! Primary containers derive theirs from the package manifest; secondary
//! containers report theirs through the dex-use registry.

use crate::errors::{DexoptError, Result};
use crate::package::PackageState;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;

/// Marker for a secondary container loaded with a loader type the compiler
/// cannot reason about.
pub const UNSUPPORTED_CLASS_LOADER_CONTEXT: &str = "=UnsupportedClassLoaderContext=";

/// Marker for a secondary container observed under more than one distinct
/// context. Such a container cannot be compiled, though its vdex remains
/// usable.
pub const VARYING_CLASS_LOADER_CONTEXTS: &str = "=VaryingClassLoaderContexts=";

// One loader element: PCL or DLC over a colon-separated (possibly empty)
// path list. Nesting is checked separately.
static CLC_ELEMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(PCL|DLC)\[[^\[\]{}]*\]").expect("static regex"));

/// Syntactic validation of a class-loader context string.
///
/// Accepts the special markers as well; callers that must not see them check
/// separately. The check is shallow by design: element heads must parse and
/// braces must balance, but path contents are opaque.
pub fn validate_class_loader_context(clc: &str) -> Result<()> {
    if clc == UNSUPPORTED_CLASS_LOADER_CONTEXT || clc == VARYING_CLASS_LOADER_CONTEXTS {
        return Ok(());
    }
    if clc.is_empty() {
        return Err(DexoptError::invalid_argument("empty class loader context"));
    }
    let mut rest = clc;
    let mut depth: i32 = 0;
    loop {
        let m = CLC_ELEMENT.find(rest).ok_or_else(|| {
            DexoptError::invalid_argument(format!("malformed class loader context \"{clc}\""))
        })?;
        rest = &rest[m.end()..];
        loop {
            if let Some(r) = rest.strip_prefix('{') {
                depth += 1;
                rest = r;
            } else if let Some(r) = rest.strip_prefix('}') {
                depth -= 1;
                if depth < 0 {
                    return Err(DexoptError::invalid_argument(format!(
                        "unbalanced braces in class loader context \"{clc}\""
                    )));
                }
                rest = r;
            } else if let Some(r) = rest.strip_prefix(';') {
                // Sibling shared-library element follows.
                rest = r;
                break;
            } else {
                break;
            }
        }
        if rest.is_empty() {
            break;
        }
        if !rest.starts_with("PCL") && !rest.starts_with("DLC") {
            return Err(DexoptError::invalid_argument(format!(
                "trailing garbage in class loader context \"{clc}\""
            )));
        }
    }
    if depth != 0 {
        return Err(DexoptError::invalid_argument(format!(
            "unbalanced braces in class loader context \"{clc}\""
        )));
    }
    Ok(())
}

/// Validate an absolute dex container path.
pub fn validate_dex_path(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(DexoptError::invalid_argument(format!(
            "dex path {path:?} is not absolute"
        )));
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some("apk") | Some("jar") | Some("dex") => Ok(()),
        _ => Err(DexoptError::invalid_argument(format!(
            "dex path {path:?} has an unexpected extension"
        ))),
    }
}

fn path_list(paths: &[&Path]) -> String {
    paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Derive the context for each code-bearing primary split of a package, in
/// split order. Index 0 is the base container.
///
/// Two manifest forms exist. In the *shared* form all splits load into one
/// class loader in manifest order, so split i sees every earlier split on
/// its classpath. In the *isolated* form every split gets its own loader
/// whose parent chain runs through the declared parent splits up to the
/// base.
pub fn derive_primary_contexts(pkg: &PackageState) -> Vec<String> {
    let splits = pkg.code_splits();
    if pkg.isolated_split_loading {
        splits
            .iter()
            .map(|split| {
                let mut chain = Vec::new();
                let mut parent = split.parent_split.as_deref();
                while let Some(name) = parent {
                    match splits.iter().find(|s| s.split_name.as_deref() == Some(name)) {
                        Some(p) => {
                            chain.push(p.path.as_path());
                            parent = p.parent_split.as_deref();
                        }
                        None => break,
                    }
                }
                // Ultimate parent is always the base container, except for
                // the base itself.
                if split.split_name.is_some() {
                    if let Some(base) = splits.iter().find(|s| s.split_name.is_none()) {
                        if chain.last().copied() != Some(base.path.as_path()) {
                            chain.push(base.path.as_path());
                        }
                    }
                }
                if chain.is_empty() {
                    String::from("PCL[]")
                } else {
                    // Nested parent chain, innermost is the base.
                    let mut nested = format!("PCL[{}]", chain[chain.len() - 1].display());
                    for ancestor in chain.iter().rev().skip(1) {
                        nested = format!("PCL[{}]{{{nested}}}", ancestor.display());
                    }
                    format!("PCL[]{{{nested}}}")
                }
            })
            .collect()
    } else {
        (0..splits.len())
            .map(|i| {
                let before: Vec<&Path> = splits[..i].iter().map(|s| s.path.as_path()).collect();
                format!("PCL[{}]", path_list(&before))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::SplitInfo;
    use std::path::PathBuf;

    fn pkg(isolated: bool, splits: Vec<SplitInfo>) -> PackageState {
        PackageState {
            isolated_split_loading: isolated,
            splits,
            ..PackageState::new("com.example")
        }
    }

    fn split(name: Option<&str>, path: &str, parent: Option<&str>) -> SplitInfo {
        SplitInfo {
            split_name: name.map(str::to_string),
            path: PathBuf::from(path),
            has_code: true,
            parent_split: parent.map(str::to_string),
        }
    }

    #[test]
    fn test_validate_accepts_common_forms() {
        validate_class_loader_context("PCL[]").unwrap();
        validate_class_loader_context("PCL[/a/base.apk:/a/s1.apk]").unwrap();
        validate_class_loader_context("PCL[]{PCL[/a/base.apk]}").unwrap();
        validate_class_loader_context("DLC[/x.jar];PCL[/lib.jar]").unwrap();
        validate_class_loader_context(UNSUPPORTED_CLASS_LOADER_CONTEXT).unwrap();
        validate_class_loader_context(VARYING_CLASS_LOADER_CONTEXTS).unwrap();
    }

    #[test]
    fn test_validate_rejects_malformed() {
        assert!(validate_class_loader_context("").is_err());
        assert!(validate_class_loader_context("XYZ[/a.apk]").is_err());
        assert!(validate_class_loader_context("PCL[/a.apk").is_err());
        assert!(validate_class_loader_context("PCL[]{PCL[/a.apk]").is_err());
        assert!(validate_class_loader_context("PCL[]}").is_err());
        assert!(validate_class_loader_context("PCL[]garbage").is_err());
    }

    #[test]
    fn test_validate_dex_path() {
        validate_dex_path(Path::new("/data/app/com.example/base.apk")).unwrap();
        validate_dex_path(Path::new("/data/user/0/com.example/files/x.jar")).unwrap();
        assert!(validate_dex_path(Path::new("relative/base.apk")).is_err());
        assert!(validate_dex_path(Path::new("/data/app/readme.txt")).is_err());
    }

    #[test]
    fn test_shared_form_contexts() {
        let pkg = pkg(
            false,
            vec![
                split(None, "/a/base.apk", None),
                split(Some("feature1"), "/a/split_feature1.apk", None),
                split(Some("feature2"), "/a/split_feature2.apk", None),
            ],
        );
        let contexts = derive_primary_contexts(&pkg);
        assert_eq!(
            contexts,
            vec![
                "PCL[]",
                "PCL[/a/base.apk]",
                "PCL[/a/base.apk:/a/split_feature1.apk]",
            ]
        );
    }

    #[test]
    fn test_isolated_form_contexts() {
        let pkg = pkg(
            true,
            vec![
                split(None, "/a/base.apk", None),
                split(Some("feature1"), "/a/split_feature1.apk", None),
                split(Some("feature2"), "/a/split_feature2.apk", Some("feature1")),
            ],
        );
        let contexts = derive_primary_contexts(&pkg);
        assert_eq!(contexts[0], "PCL[]");
        assert_eq!(contexts[1], "PCL[]{PCL[/a/base.apk]}");
        assert_eq!(
            contexts[2],
            "PCL[]{PCL[/a/split_feature1.apk]{PCL[/a/base.apk]}}"
        );
        for ctx in &contexts {
            validate_class_loader_context(ctx).unwrap();
        }
    }
}
