//! Parses a hosts file (`/etc/hosts` or a Windows equivalent) once and
//! caches it immutably: address-first lines, `#`-comments stripped, names
//! matched case-insensitively.

use std::collections::HashMap;
use std::net::IpAddr;

#[derive(Debug, Default)]
pub struct HostsFile {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl HostsFile {
    pub fn parse(contents: &str) -> HostsFile {
        let mut entries: HashMap<String, Vec<IpAddr>> = HashMap::new();
        for raw_line in contents.lines() {
            let line = match raw_line.split('#').next() {
                Some(l) => l.trim(),
                None => continue,
            };
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(addr) = parts.next().and_then(|a| a.parse::<IpAddr>().ok()) else {
                continue;
            };
            for name in parts {
                entries.entry(name.to_ascii_lowercase()).or_default().push(addr);
            }
        }
        HostsFile { entries }
    }

    pub fn load(path: &str) -> HostsFile {
        match std::fs::read_to_string(path) {
            Ok(contents) => HostsFile::parse(&contents),
            Err(e) => {
                log::debug!("hosts file {path:?} not readable ({e}); proceeding with an empty map");
                HostsFile::default()
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&[IpAddr]> {
        self.entries.get(&name.to_ascii_lowercase()).map(|v| v.as_slice())
    }
}

#[cfg(test)]
#[path = "tests/hosts_tests.rs"]
mod tests;
