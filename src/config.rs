use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::ProtocolError;

/// `${XDG_RUNTIME_DIR}`, mandatory unless the caller passed an explicit
/// `--pidfile`.
pub fn runtime_dir() -> Result<PathBuf> {
    std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .ok_or_else(|| {
            ProtocolError::Input("environment XDG_RUNTIME_DIR not set".to_string()).into()
        })
}

/// `${XDG_RUNTIME_DIR}/userns`, the canonical directory for pidfiles.
pub fn pidfile_dir() -> Result<PathBuf> {
    Ok(runtime_dir()?.join("userns"))
}

/// Create the pidfile directory (mode `0700`) if it doesn't already exist.
pub fn ensure_pidfile_dir(dir: &Path) -> Result<()> {
    match std::fs::DirBuilder::new().mode(0o700).create(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => {
            Err(e).with_context(|| format!("Failed to create directory: {}", dir.display()))
        }
    }
}

/// Split an explicit `--pidfile PATH` into (directory, basename), or derive
/// the canonical `(${XDG_RUNTIME_DIR}/userns, name)` pair from `--name`.
pub fn resolve_pidfile_location(
    explicit_path: Option<&str>,
    name: Option<&str>,
) -> Result<(PathBuf, String)> {
    if let Some(path) = explicit_path {
        let path = Path::new(path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let name = path
            .file_name()
            .ok_or_else(|| ProtocolError::Input("--pidfile has no file name".to_string()))?
            .to_string_lossy()
            .into_owned();
        return Ok((dir, name));
    }

    let name = name
        .ok_or_else(|| ProtocolError::Input("missing name".to_string()))?
        .to_string();
    Ok((pidfile_dir()?, name))
}

/// Resolve the effective pidfile path, for read-only consumers (Enterer,
/// Checker) that don't need the split directory/basename the publication
/// protocol uses.
pub fn resolve_pidfile_path(explicit_path: Option<&str>, name: Option<&str>) -> Result<PathBuf> {
    let (dir, name) = resolve_pidfile_location(explicit_path, name)?;
    Ok(dir.join(name))
}

/// `--domain`, falling back to `$USERNS_DOMAIN`, falling back to `localdomain`.
pub fn resolve_domain(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var("USERNS_DOMAIN").ok())
        .unwrap_or_else(|| "localdomain".to_string())
}

/// The default command vector when none is given on the command line:
/// `$SHELL`, falling back to `/bin/sh`.
pub fn default_command() -> Vec<String> {
    vec![std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_pidfile_splits_dir_and_name() {
        let (dir, name) = resolve_pidfile_location(Some("/run/user/1000/foo.pid"), None).unwrap();
        assert_eq!(dir, Path::new("/run/user/1000"));
        assert_eq!(name, "foo.pid");
    }

    #[test]
    fn explicit_pidfile_with_bare_name_uses_cwd() {
        let (dir, name) = resolve_pidfile_location(Some("foo.pid"), None).unwrap();
        assert_eq!(dir, Path::new("."));
        assert_eq!(name, "foo.pid");
    }

    #[test]
    fn missing_name_and_pidfile_is_input_error() {
        let err = resolve_pidfile_location(None, None).unwrap_err();
        assert!(err.to_string().contains("missing name"));
    }

    #[test]
    fn domain_precedence() {
        assert_eq!(resolve_domain(Some("example.com")), "example.com");
    }
}
