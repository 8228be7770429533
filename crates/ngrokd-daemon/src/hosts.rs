//! Managed section of the system hosts file.
//!
//! Everything between the BEGIN/END markers belongs to the daemon; all
//! other lines are preserved verbatim. Updates go through a temp file and
//! rename, with an in-place rewrite fallback for mounts where rename across
//! the bind boundary fails (containers).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MARKER_START: &str = "# BEGIN ngrokd managed section";
const MARKER_END: &str = "# END ngrokd managed section";

/// Environment override for test harnesses and non-root runs.
const HOSTS_PATH_ENV: &str = "NGROKD_HOSTS_PATH";

/// Rewrites the managed section of the hosts file.
pub struct Manager {
    hosts_path: PathBuf,
}

impl Manager {
    pub fn new() -> Self {
        let hosts_path = std::env::var(HOSTS_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(default_hosts_path()));
        Self { hosts_path }
    }

    /// Manage a specific file instead of the system hosts file.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            hosts_path: path.into(),
        }
    }

    /// Replace the managed section with `mappings`.
    pub fn update_hosts(&self, mappings: &HashMap<String, Ipv4Addr>) -> std::io::Result<()> {
        info!(entries = mappings.len(), path = %self.hosts_path.display(), "updating hosts file");

        let lines = self.read_lines()?;
        let filtered = remove_managed_section(&lines);
        let updated = add_managed_section(filtered, mappings);
        self.write_atomic(&updated)?;

        debug!("hosts file updated");
        Ok(())
    }

    /// Parse the managed section back into a hostname → IP map.
    pub fn current_mappings(&self) -> std::io::Result<HashMap<String, Ipv4Addr>> {
        let lines = self.read_lines()?;

        let mut mappings = HashMap::new();
        let mut in_section = false;
        for line in &lines {
            if line.contains(MARKER_START) {
                in_section = true;
                continue;
            }
            if line.contains(MARKER_END) {
                break;
            }
            if !in_section || line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            if let (Some(ip), Some(hostname)) = (fields.next(), fields.next()) {
                if let Ok(ip) = ip.parse::<Ipv4Addr>() {
                    mappings.insert(hostname.to_string(), ip);
                }
            }
        }

        Ok(mappings)
    }

    /// Drop the managed section entirely.
    pub fn remove_all(&self) -> std::io::Result<()> {
        self.update_hosts(&HashMap::new())
    }

    fn read_lines(&self) -> std::io::Result<Vec<String>> {
        let content = std::fs::read_to_string(&self.hosts_path)?;
        Ok(content.lines().map(str::to_string).collect())
    }

    fn write_atomic(&self, lines: &[String]) -> std::io::Result<()> {
        let mut content = lines.join("\n");
        content.push('\n');

        let temp_path = PathBuf::from(format!("{}.ngrokd.tmp", self.hosts_path.display()));
        std::fs::write(&temp_path, &content)?;

        if let Err(rename_err) = std::fs::rename(&temp_path, &self.hosts_path) {
            // Bind-mounted hosts files reject cross-device renames; fall back
            // to rewriting in place.
            warn!(error = %rename_err, "rename failed, writing hosts file in place");
            let result = std::fs::write(&self.hosts_path, &content);
            let _ = std::fs::remove_file(&temp_path);
            result?;
        }

        Ok(())
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn default_hosts_path() -> &'static str {
    "/etc/hosts"
}

#[cfg(windows)]
fn default_hosts_path() -> &'static str {
    r"C:\Windows\System32\drivers\etc\hosts"
}

fn remove_managed_section(lines: &[String]) -> Vec<String> {
    let mut result = Vec::with_capacity(lines.len());
    let mut in_section = false;

    for line in lines {
        if line.contains(MARKER_START) {
            in_section = true;
            continue;
        }
        if line.contains(MARKER_END) {
            in_section = false;
            continue;
        }
        if !in_section {
            result.push(line.clone());
        }
    }

    result
}

fn add_managed_section(
    mut lines: Vec<String>,
    mappings: &HashMap<String, Ipv4Addr>,
) -> Vec<String> {
    if mappings.is_empty() {
        return lines;
    }

    if let Some(last) = lines.last() {
        if !last.is_empty() {
            lines.push(String::new());
        }
    }

    lines.push(MARKER_START.to_string());
    let mut entries: Vec<_> = mappings.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    for (hostname, ip) in entries {
        lines.push(format!("{ip}\t{hostname}"));
    }
    lines.push(MARKER_END.to_string());

    lines
}
