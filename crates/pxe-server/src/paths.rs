//! Mapping client-supplied paths onto served directories

use crate::error::PxeError;
use std::path::{Component, Path, PathBuf};

/// Join a client-supplied path under `root`
///
/// Leading slashes are ignored; `..`, root and prefix components are
/// refused so the result never escapes `root`.
pub fn safe_join(root: &Path, requested: &str) -> Result<PathBuf, PxeError> {
    let relative = Path::new(requested.trim_start_matches('/'));
    let mut joined = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            _ => {
                return Err(PxeError::InvalidRequest(format!(
                    "Path {} escapes the served root",
                    requested
                )));
            }
        }
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_join_stays_under_root() {
        let root = Path::new("/srv/public");

        assert_eq!(
            safe_join(root, "/alpine/netboot/vmlinuz-lts").unwrap(),
            PathBuf::from("/srv/public/alpine/netboot/vmlinuz-lts")
        );
        assert_eq!(safe_join(root, "./ipxe.efi").unwrap(), PathBuf::from("/srv/public/ipxe.efi"));
        assert!(safe_join(root, "/alpine/../../etc/shadow").is_err());
        assert!(safe_join(root, "..").is_err());
    }
}
