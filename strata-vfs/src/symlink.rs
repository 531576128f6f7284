use crate::root::Root;
use strata_core::{Error, Result};

/// Symlink chains longer than this fail with a loop error.
const MAX_LINK_DEPTH: usize = 40;

/// Resolve a user-supplied relative path under a VFS root, following
/// symlinks component by component.
///
/// Two invariants hold for every return value:
/// - the resolved path stays lexically within the root (`..` that would
///   climb out fails with `OutsideRoot`), and
/// - at most `MAX_LINK_DEPTH` links are followed.
///
/// Idempotent: the result contains no symlinks, so evaluating it again
/// returns it unchanged.
pub async fn eval_symlinks(root: &Root, path: &str) -> Result<String> {
    let mut pending: Vec<String> = path.split('/').rev().map(|s| s.to_string()).collect();
    let mut resolved: Vec<String> = Vec::new();
    let mut links = 0usize;

    while let Some(part) = pending.pop() {
        match part.as_str() {
            "" | "." => continue,
            ".." => {
                if resolved.pop().is_none() {
                    return Err(Error::OutsideRoot(path.to_string()));
                }
                continue;
            }
            _ => {}
        }

        resolved.push(part);
        let candidate = resolved.join("/");

        let info = root.lstat(&candidate).await?;
        if !info.is_symlink() {
            continue;
        }

        links += 1;
        if links > MAX_LINK_DEPTH {
            return Err(Error::SymlinkLoop(path.to_string()));
        }

        let target = root.read_link(&candidate).await?;
        resolved.pop();

        // An absolute target is rebased on the site root.
        if target.starts_with('/') {
            resolved.clear();
        }
        for piece in target.split('/').rev() {
            pending.push(piece.to_string());
        }
    }

    Ok(resolved.join("/"))
}
