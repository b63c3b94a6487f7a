use std::path::{Path, PathBuf};

use crate::error::{DepotError, Result};

/// Map a manifest-relative path (`/`-separated) to an output path under
/// `root`.
///
/// Colons are stripped from every component, a compatibility affordance for
/// paths recorded with legacy drive-letter prefixes; this applies only to
/// filesystem materialization, never to displayed manifest names. `..` and
/// `.` components are refused so a hostile manifest cannot climb out of the
/// output root.
pub fn materialize_path(root: &Path, rel: &str) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    for comp in rel.split('/') {
        if comp == ".." || comp == "." {
            return Err(DepotError::UnsafePath(rel.to_string()));
        }
        let comp = sanitize_component(comp);
        if comp.is_empty() {
            continue;
        }
        out.push(&*comp);
    }
    Ok(out)
}

/// Strip the colon character from one path component.
pub fn sanitize_component(comp: &str) -> std::borrow::Cow<'_, str> {
    if comp.contains(':') {
        std::borrow::Cow::Owned(comp.replace(':', ""))
    } else {
        std::borrow::Cow::Borrowed(comp)
    }
}
