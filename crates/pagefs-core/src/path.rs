//! Path splitting and validation.
//!
//! Paths arrive from the host without a leading slash; `""` denotes the
//! root. Consecutive slashes collapse, so `"a//b"` and `"a/b"` name the
//! same node. Components longer than `NAME_MAX` bytes are rejected
//! rather than truncated.

use pagefs_error::{PfsError, Result};
use pagefs_types::NAME_MAX;

/// Split a path into its non-empty components.
pub fn components(path: &str) -> Result<Vec<&str>> {
    let mut out = Vec::new();
    for comp in path.split('/') {
        if comp.is_empty() {
            continue;
        }
        if comp.len() > NAME_MAX {
            return Err(PfsError::NameTooLong);
        }
        out.push(comp);
    }
    Ok(out)
}

/// Split a path into the components of its parent and the final
/// component. Fails for the root path, which has no final component.
pub fn split_leaf(path: &str) -> Result<(Vec<&str>, &str)> {
    let mut comps = components(path)?;
    let leaf = comps
        .pop()
        .ok_or(PfsError::InvalidArgument("path has no final component"))?;
    Ok((comps, leaf))
}
