// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration snapshot.
//!
//! Command-line options merged with an optional TOML file produce one
//! immutable [`Config`] value shared by reference among all long-lived
//! components. A reload builds a fresh snapshot; nothing mutates an
//! existing one.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use uuid::Uuid;

/// Namespace for deriving the stable endpoint UUID from the host name.
const ENDPOINT_UUID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x49, 0xda, 0xc2, 0x91, 0x06, 0x08, 0x41, 0xc9, 0x94, 0x1c, 0xed, 0x0e, 0x7a, 0xcc, 0xde, 0x1e,
]);

/// `--hostname` sentinel requesting the NetBIOS-style (uppercased) name.
pub const NETBIOS_HOSTNAME: &str = ":NETBIOS:";

/// Address families the daemon may serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AddressFamily {
    #[serde(rename = "IPv4")]
    IPv4,
    #[serde(rename = "IPv6")]
    IPv6,
    #[serde(rename = "Both")]
    Both,
}

impl AddressFamily {
    pub fn allows_v4(self) -> bool {
        matches!(self, AddressFamily::IPv4 | AddressFamily::Both)
    }

    pub fn allows_v6(self) -> bool {
        matches!(self, AddressFamily::IPv6 | AddressFamily::Both)
    }
}

/// Windows network membership of this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberOf {
    Workgroup(String),
    Domain(String),
}

impl MemberOf {
    pub fn name(&self) -> &str {
        match self {
            MemberOf::Workgroup(name) | MemberOf::Domain(name) => name,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            MemberOf::Workgroup(_) => "Workgroup",
            MemberOf::Domain(_) => "Domain",
        }
    }
}

/// Naming information advertised to Windows peers.
#[derive(Debug, Clone)]
pub struct WinNetInfo {
    pub host_name: String,
    pub host_description: String,
    pub member_of: MemberOf,
}

/// Configuration errors. Fatal at load time; never reach the request path.
#[derive(Debug, Clone)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    InvalidValue(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "I/O error: {}", msg),
            ConfigError::Parse(msg) => write!(f, "parse error: {}", msg),
            ConfigError::InvalidValue(msg) => write!(f, "invalid value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// The TOML configuration file. All keys optional; the command line wins
/// where both are given.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileConfig {
    pub interfaces: Option<Vec<String>>,
    pub allowed_address_family: Option<AddressFamily>,
    pub hoplimit: Option<u32>,
    pub source_port: Option<u16>,
    pub uuid: Option<String>,
    pub hostname: Option<String>,
    pub workgroup: Option<String>,
    pub domain: Option<String>,
    pub metadata: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub user: Option<String>,
    pub chroot: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io(format!("{}: {}", path.display(), err)))?;
        toml::from_str(&content)
            .map_err(|err| ConfigError::Parse(format!("{}: {}", path.display(), err)))
    }
}

/// Options after merging the command line over the file. Input to
/// [`Config::build`].
#[derive(Debug, Default, Clone)]
pub struct Options {
    pub interfaces: Vec<String>,
    pub address_family: Option<AddressFamily>,
    pub hoplimit: Option<u32>,
    pub source_port: Option<u16>,
    pub uuid: Option<String>,
    pub hostname: Option<String>,
    pub workgroup: Option<String>,
    pub domain: Option<String>,
    pub metadata: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
    pub user: Option<String>,
    pub chroot: Option<PathBuf>,
}

impl Options {
    /// Fill unset fields from the configuration file.
    pub fn overlay_file(&mut self, file: FileConfig) {
        if self.interfaces.is_empty() {
            self.interfaces = file.interfaces.unwrap_or_default();
        }
        merge(&mut self.address_family, file.allowed_address_family);
        merge(&mut self.hoplimit, file.hoplimit);
        merge(&mut self.source_port, file.source_port);
        merge(&mut self.uuid, file.uuid);
        merge(&mut self.hostname, file.hostname);
        merge(&mut self.workgroup, file.workgroup);
        merge(&mut self.domain, file.domain);
        merge(&mut self.metadata, file.metadata);
        merge(&mut self.log_level, file.log_level);
        merge(&mut self.log_file, file.log_file);
        merge(&mut self.pid_file, file.pid_file);
        merge(&mut self.user, file.user);
        merge(&mut self.chroot, file.chroot);
    }
}

fn merge<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

/// Immutable configuration snapshot.
#[derive(Debug)]
pub struct Config {
    /// Monotonic restart token (seconds since epoch at snapshot build).
    pub instance_id: u64,
    /// Stable URN-form UUID identifying this host.
    pub endpoint_urn: String,
    /// The plain UUID string; the only valid HTTP path is `/<http_path>`.
    pub http_path: String,
    pub win_net_info: WinNetInfo,
    pub hop_limit: u32,
    pub source_port: u16,
    pub address_family: AddressFamily,
    /// Empty means every interface is allowed.
    pub interface_whitelist: BTreeSet<String>,
    pub page_size: usize,
    /// Validated XML source of the metadata template, if configured.
    pub metadata_template: Option<String>,
    pub log_level: log::LevelFilter,
    pub log_file: Option<PathBuf>,
    // Plumbing values carried for the daemon wrapper; unused by the core.
    pub pid_file: Option<PathBuf>,
    pub run_as: Option<String>,
    pub chroot_dir: Option<PathBuf>,
}

impl Config {
    pub fn build(opts: &Options) -> Result<Self, ConfigError> {
        let full_host_name = host_name();
        let simple_host_name = full_host_name
            .split('.')
            .next()
            .unwrap_or(&full_host_name)
            .to_owned();

        let uuid = match &opts.uuid {
            Some(value) => Uuid::parse_str(value)
                .map_err(|_| ConfigError::InvalidValue(format!("invalid uuid '{}'", value)))?,
            None => Uuid::new_v5(&ENDPOINT_UUID_NAMESPACE, full_host_name.as_bytes()),
        };

        let hop_limit = opts.hoplimit.unwrap_or(1);
        if hop_limit < 1 {
            return Err(ConfigError::InvalidValue("hoplimit must be >= 1".into()));
        }

        let member_of = match (&opts.workgroup, &opts.domain) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidValue(
                    "workgroup and domain are mutually exclusive".into(),
                ))
            }
            (Some(workgroup), None) => MemberOf::Workgroup(workgroup.clone()),
            (None, Some(domain)) => MemberOf::Domain(domain.clone()),
            (None, None) => MemberOf::Workgroup("WORKGROUP".into()),
        };

        let use_netbios = opts.hostname.as_deref() == Some(NETBIOS_HOSTNAME);
        let host_name_value = match &opts.hostname {
            Some(name) if !use_netbios => name.clone(),
            _ if use_netbios => simple_host_name.to_uppercase(),
            _ => simple_host_name.clone(),
        };
        let host_description = match &opts.hostname {
            Some(name) if !use_netbios => name.clone(),
            _ => simple_host_name.clone(),
        };

        let metadata_template = match &opts.metadata {
            Some(path) => Some(load_metadata_template(path)?),
            None => None,
        };

        let log_level = match &opts.log_level {
            Some(level) => level.parse::<log::LevelFilter>().map_err(|_| {
                ConfigError::InvalidValue(format!("unknown log level '{}'", level))
            })?,
            None => log::LevelFilter::Info,
        };

        let instance_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);

        let config = Self {
            instance_id,
            endpoint_urn: uuid.urn().to_string(),
            http_path: uuid.to_string(),
            win_net_info: WinNetInfo {
                host_name: host_name_value,
                host_description,
                member_of,
            },
            hop_limit,
            source_port: opts.source_port.unwrap_or(0),
            address_family: opts.address_family.unwrap_or(AddressFamily::Both),
            interface_whitelist: opts.interfaces.iter().cloned().collect(),
            page_size: page_size(),
            metadata_template,
            log_level,
            log_file: opts.log_file.clone(),
            pid_file: opts.pid_file.clone(),
            run_as: opts.user.clone(),
            chroot_dir: opts.chroot.clone(),
        };

        log::info!(
            "Configuration:\n    Hostname: {}\n    {}: {}\n    Description: {}\n    Identifier: {}\n    Metadata: {}",
            config.win_net_info.host_name,
            config.win_net_info.member_of.tag(),
            config.win_net_info.member_of.name(),
            config.win_net_info.host_description,
            config.endpoint_urn,
            opts.metadata
                .as_deref()
                .map_or_else(|| "default".into(), |path| path.display().to_string()),
        );

        Ok(config)
    }

    pub fn enable_ipv4(&self) -> bool {
        self.address_family.allows_v4()
    }

    pub fn enable_ipv6(&self) -> bool {
        self.address_family.allows_v6()
    }

    pub fn is_allowed_interface(&self, name: &str) -> bool {
        self.interface_whitelist.is_empty() || self.interface_whitelist.contains(name)
    }
}

fn host_name() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name constant; no pointers involved.
    let value = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if value > 0 {
        value as usize
    } else {
        4096
    }
}

fn load_metadata_template(path: &Path) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| ConfigError::Io(format!("metadata file {}: {}", path.display(), err)))?;
    roxmltree::Document::parse(&content).map_err(|err| {
        ConfigError::Parse(format!(
            "metadata file {} is not well formed XML: {}",
            path.display(),
            err
        ))
    })?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = Config::build(&Options::default()).unwrap();
        assert_eq!(config.hop_limit, 1);
        assert_eq!(config.source_port, 0);
        assert_eq!(config.address_family, AddressFamily::Both);
        assert!(config.interface_whitelist.is_empty());
        assert!(config.is_allowed_interface("eth0"));
        assert_eq!(config.win_net_info.member_of, MemberOf::Workgroup("WORKGROUP".into()));
        assert!(config.endpoint_urn.starts_with("urn:uuid:"));
        assert_eq!(
            config.endpoint_urn,
            format!("urn:uuid:{}", config.http_path)
        );
    }

    #[test]
    fn endpoint_uuid_is_stable_across_builds() {
        let first = Config::build(&Options::default()).unwrap();
        let second = Config::build(&Options::default()).unwrap();
        assert_eq!(first.endpoint_urn, second.endpoint_urn);
    }

    #[test]
    fn explicit_uuid_wins() {
        let opts = Options {
            uuid: Some("0f202b95-2f9d-4c3d-9aa1-9e675c29d0f1".into()),
            ..Options::default()
        };
        let config = Config::build(&opts).unwrap();
        assert_eq!(config.http_path, "0f202b95-2f9d-4c3d-9aa1-9e675c29d0f1");
    }

    #[test]
    fn bad_uuid_is_rejected() {
        let opts = Options {
            uuid: Some("not-a-uuid".into()),
            ..Options::default()
        };
        assert!(matches!(
            Config::build(&opts),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn workgroup_and_domain_conflict() {
        let opts = Options {
            workgroup: Some("A".into()),
            domain: Some("B".into()),
            ..Options::default()
        };
        assert!(Config::build(&opts).is_err());
    }

    #[test]
    fn netbios_sentinel_uppercases() {
        let opts = Options {
            hostname: Some(NETBIOS_HOSTNAME.into()),
            ..Options::default()
        };
        let config = Config::build(&opts).unwrap();
        assert_eq!(
            config.win_net_info.host_name,
            config.win_net_info.host_name.to_uppercase()
        );
    }

    #[test]
    fn whitelist_filters() {
        let opts = Options {
            interfaces: vec!["eth0".into()],
            ..Options::default()
        };
        let config = Config::build(&opts).unwrap();
        assert!(config.is_allowed_interface("eth0"));
        assert!(!config.is_allowed_interface("wlan0"));
    }

    #[test]
    fn file_overlay_respects_cli_priority() {
        let file = FileConfig {
            hoplimit: Some(4),
            hostname: Some("from-file".into()),
            ..FileConfig::default()
        };
        let mut opts = Options {
            hoplimit: Some(2),
            ..Options::default()
        };
        opts.overlay_file(file);
        assert_eq!(opts.hoplimit, Some(2));
        assert_eq!(opts.hostname.as_deref(), Some("from-file"));
    }

    #[test]
    fn toml_file_parses() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "interfaces = [\"eth0\", \"eth1\"]\nallowed-address-family = \"IPv4\"\nhoplimit = 2\nsource-port = 0"
        )
        .unwrap();
        let parsed = FileConfig::load(file.path()).unwrap();
        assert_eq!(parsed.interfaces.as_deref(), Some(&["eth0".to_string(), "eth1".to_string()][..]));
        assert_eq!(parsed.allowed_address_family, Some(AddressFamily::IPv4));
        assert_eq!(parsed.hoplimit, Some(2));
    }

    #[test]
    fn unknown_toml_key_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "no-such-option = true").unwrap();
        assert!(matches!(
            FileConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn metadata_template_must_be_xml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "<metadata><unclosed></metadata>").unwrap();
        let opts = Options {
            metadata: Some(file.path().to_path_buf()),
            ..Options::default()
        };
        assert!(Config::build(&opts).is_err());

        let mut good = tempfile::NamedTempFile::new().unwrap();
        writeln!(good, "<metadata/>").unwrap();
        let opts = Options {
            metadata: Some(good.path().to_path_buf()),
            ..Options::default()
        };
        let config = Config::build(&opts).unwrap();
        assert!(config.metadata_template.is_some());
    }
}
