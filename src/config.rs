//! Configuration file handling.
//!
//! The format is line oriented: `key value` pairs, `#` comments and
//! blank lines ignored. Recognised keys:
//!
//! ```text
//! peer 203.0.113.10:4500
//! local 0.0.0.0:4500
//! run clear as _signsky-clear
//! run crypto as _signsky-crypto
//! keying /tmp/signsky-keying
//! keying-owner root
//! status /tmp/signsky-status
//! status-owner root
//! ```

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::proc::Stage;

pub const DEFAULT_KEYING_PATH: &str = "/tmp/signsky-keying";
pub const DEFAULT_STATUS_PATH: &str = "/tmp/signsky-status";

#[derive(Debug)]
pub struct Config {
    /// Initial peer endpoint; updated at runtime when the peer roams.
    pub peer: SocketAddrV4,
    /// Local UDP bind address.
    pub local: SocketAddrV4,
    /// Per-stage user to drop privileges to. Stages without an entry
    /// keep the invoking user's credentials.
    pub runas: HashMap<Stage, String>,
    pub keying_path: PathBuf,
    pub keying_owner: Option<String>,
    pub status_path: PathBuf,
    pub status_owner: Option<String>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file {:?}", path.as_ref()))?;
        Config::parse(&content)
    }

    fn parse(content: &str) -> Result<Config> {
        let mut peer = None;
        let mut local = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        let mut runas = HashMap::new();
        let mut keying_path = PathBuf::from(DEFAULT_KEYING_PATH);
        let mut keying_owner = None;
        let mut status_path = PathBuf::from(DEFAULT_STATUS_PATH);
        let mut status_owner = None;

        for (lineno, raw) in content.lines().enumerate() {
            let line = raw.replace('\t', " ");
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (option, value) = line
                .split_once(' ')
                .with_context(|| format!("malformed option '{}' on line {}", line, lineno + 1))?;
            let value = value.trim();

            match option {
                "peer" => peer = Some(parse_host(value)?),
                "local" => local = parse_host(value)?,
                "run" => {
                    let (stage, user) = parse_runas(value)
                        .with_context(|| format!("option 'run {}' invalid", value))?;
                    if runas.insert(stage, user).is_some() {
                        bail!("user for stage '{}' already set", stage.name());
                    }
                }
                "keying" => keying_path = PathBuf::from(value),
                "keying-owner" => keying_owner = Some(value.to_string()),
                "status" => status_path = PathBuf::from(value),
                "status-owner" => status_owner = Some(value.to_string()),
                _ => bail!("unknown option '{}' on line {}", option, lineno + 1),
            }
        }

        let peer = peer.context("no peer configured")?;

        Ok(Config {
            peer,
            local,
            runas,
            keying_path,
            keying_owner,
            status_path,
            status_owner,
        })
    }
}

fn parse_host(value: &str) -> Result<SocketAddrV4> {
    value
        .parse::<SocketAddrV4>()
        .with_context(|| format!("'{}' must be an ip:port pair", value))
}

fn parse_runas(value: &str) -> Result<(Stage, String)> {
    let mut parts = value.split_whitespace();
    let (stage, kw, user) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(stage), Some(kw), Some(user), None) => (stage, kw, user),
        _ => bail!("expected '<stage> as <user>'"),
    };
    if kw != "as" {
        bail!("expected '<stage> as <user>'");
    }
    let stage = Stage::from_name(stage).with_context(|| format!("stage '{}' is unknown", stage))?;
    Ok((stage, user.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_config() {
        let cfg = Config::parse(
            "# signsky test config\n\
             peer 203.0.113.10:4500\n\
             local 192.0.2.1:4500\n\
             \n\
             run clear as _clear\n\
             run\tcrypto\tas\t_crypto\n\
             keying /run/signsky/keying\n\
             keying-owner root\n\
             status /run/signsky/status\n\
             status-owner operator\n",
        )
        .unwrap();

        assert_eq!(
            cfg.peer,
            SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 10), 4500)
        );
        assert_eq!(
            cfg.local,
            SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 4500)
        );
        assert_eq!(cfg.runas.get(&Stage::Clear).map(String::as_str), Some("_clear"));
        assert_eq!(cfg.runas.get(&Stage::Crypto).map(String::as_str), Some("_crypto"));
        assert_eq!(cfg.runas.get(&Stage::Encrypt), None);
        assert_eq!(cfg.keying_path, PathBuf::from("/run/signsky/keying"));
        assert_eq!(cfg.keying_owner.as_deref(), Some("root"));
        assert_eq!(cfg.status_owner.as_deref(), Some("operator"));
    }

    #[test]
    fn defaults_apply_when_only_peer_is_given() {
        let cfg = Config::parse("peer 203.0.113.10:4500\n").unwrap();
        assert_eq!(cfg.local, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        assert_eq!(cfg.keying_path, PathBuf::from(DEFAULT_KEYING_PATH));
        assert!(cfg.runas.is_empty());
    }

    #[test]
    fn missing_peer_is_an_error() {
        assert!(Config::parse("local 0.0.0.0:4500\n").is_err());
    }

    #[test]
    fn unknown_option_is_an_error() {
        assert!(Config::parse("peer 203.0.113.10:4500\nwombat yes\n").is_err());
    }

    #[test]
    fn malformed_runas_is_an_error() {
        assert!(Config::parse("peer 203.0.113.10:4500\nrun clear _clear\n").is_err());
        assert!(Config::parse("peer 203.0.113.10:4500\nrun status as root\n").is_err());
    }

    #[test]
    fn duplicate_runas_is_an_error() {
        assert!(Config::parse(
            "peer 203.0.113.10:4500\nrun clear as a\nrun clear as b\n"
        )
        .is_err());
    }

    #[test]
    fn bad_endpoint_is_an_error() {
        assert!(Config::parse("peer not-an-address\n").is_err());
        assert!(Config::parse("peer 203.0.113.10\n").is_err());
    }
}
