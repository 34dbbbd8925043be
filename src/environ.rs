use std::io::Read;

use anyhow::{Context, Result};
use nix::unistd::Pid;

/// Read `/proc/<pid>/environ` into `(key, value)` pairs.
///
/// The kernel always reports this file's size as zero, so callers can't
/// preallocate; this grows a plain read loop instead of `mmap`-ing anything.
pub fn read_environ(pid: Pid) -> Result<Vec<(String, String)>> {
    let path = format!("/proc/{}/environ", pid);
    let mut file =
        std::fs::File::open(&path).with_context(|| format!("Failed to open {}", path))?;

    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];
    loop {
        let n = file
            .read(&mut chunk)
            .with_context(|| format!("Failed to read {}", path))?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Ok(parse_environ(&buf))
}

fn parse_environ(buf: &[u8]) -> Vec<(String, String)> {
    buf.split(|&b| b == 0)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let text = String::from_utf8_lossy(entry);
            text.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

/// Replace the calling process's entire environment with `vars`.
pub fn install_environ(vars: &[(String, String)]) {
    let existing: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for k in existing {
        std::env::remove_var(k);
    }
    for (k, v) in vars {
        std::env::set_var(k, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_environ_splits_nul_separated_pairs() {
        let buf = b"HOME=/root\0SHELL=/bin/bash\0TERM=xterm\0";
        let vars = parse_environ(buf);
        assert_eq!(vars.len(), 3);
        assert!(vars.contains(&("HOME".to_string(), "/root".to_string())));
        assert!(vars.contains(&("SHELL".to_string(), "/bin/bash".to_string())));
    }

    #[test]
    fn parse_environ_tolerates_trailing_nul_and_value_containing_equals() {
        let buf = b"A=b=c\0";
        let vars = parse_environ(buf);
        assert_eq!(vars, vec![("A".to_string(), "b=c".to_string())]);
    }

    #[test]
    fn parse_environ_handles_empty_buffer() {
        assert!(parse_environ(b"").is_empty());
    }
}
