//! Replication endpoints and target-list handling

use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// One destination node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A forwarding edge installed into a parent node: where to forward and
/// which token the child minted for this transfer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainTarget {
    pub host: String,
    pub port: u16,
    pub file_token: String,
}

/// Parse `host:port`. The port must be non-zero.
pub fn parse_target(arg: &str) -> Result<RemoteTarget> {
    let Some((host, port)) = arg.rsplit_once(':') else {
        bail!("target {:?} is not host:port", arg);
    };

    if host.is_empty() {
        bail!("target {:?} has an empty host", arg);
    }

    let port: u16 = port
        .parse()
        .ok()
        .filter(|&p| p > 0)
        .with_context(|| format!("target {:?} has a bad port", arg))?;

    Ok(RemoteTarget {
        host: host.to_string(),
        port,
    })
}

/// Read one `host:port` per line, skipping blank lines and `#` comments.
pub fn read_target_list(path: &Path) -> Result<Vec<RemoteTarget>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read target list {}", path.display()))?;

    let mut targets = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        targets.push(parse_target(line)?);
    }

    Ok(targets)
}

/// Reject duplicate targets and, when `local_addrs` is given, targets
/// that point back at this host. Runs before any network I/O.
pub fn validate_targets(targets: &[RemoteTarget], local_addrs: Option<&[IpAddr]>) -> Result<()> {
    if targets.is_empty() {
        bail!("no targets given");
    }

    for (i, t) in targets.iter().enumerate() {
        if targets[..i].contains(t) {
            bail!("duplicate target {}", t);
        }

        if let Some(addrs) = local_addrs {
            let is_self = match t.host.parse::<IpAddr>() {
                Ok(ip) => addrs.contains(&ip),
                Err(_) => t.host == "localhost",
            };
            if is_self {
                bail!("target {} is this host", t);
            }
        }
    }

    Ok(())
}
