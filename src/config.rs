use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use matrix_sdk::ruma::OwnedRoomId;
use serde::Deserialize;

use crate::delivery::{Destination, FileDestination, MatrixDestination};
use crate::route::{MappingEntry, RouteTable};
use crate::tls::CertStore;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:25";
const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;
const DEFAULT_MAX_ERRORS: usize = 10;
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// On-disk configuration, deserialized verbatim from the TOML file.
/// Mapping and certificate tables keep their file order; routing is
/// first-match-wins.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    hostname: Option<String>,
    bind_addresses: Option<Vec<String>>,
    unix_user: Option<String>,
    unix_group: Option<String>,
    default_path: Option<PathBuf>,
    max_message_size: Option<usize>,
    max_errors: Option<usize>,
    timeout_secs: Option<u64>,
    max_connections_per_minute: Option<usize>,
    pid_file: Option<PathBuf>,
    #[serde(default)]
    certificates: IndexMap<String, CertificateConfig>,
    #[serde(default)]
    mappings: IndexMap<String, MappingConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertificateConfig {
    pub cert_file: PathBuf,
    pub private_key_file: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MappingConfig {
    address: String,
    dest_path: Option<PathBuf>,
    matrix_homeserver: Option<String>,
    matrix_username: Option<String>,
    matrix_password: Option<String>,
    matrix_session_file: Option<PathBuf>,
    matrix_room_id: Option<String>,
}

/// Validated runtime settings for everything except routing and TLS.
#[derive(Debug, Clone)]
pub struct Settings {
    pub hostname: String,
    pub bind_addresses: Vec<SocketAddr>,
    pub unix_user: Option<String>,
    pub unix_group: Option<String>,
    pub max_message_size: usize,
    pub max_errors: usize,
    pub timeout: Duration,
    pub max_connections_per_minute: usize,
    pub pid_file: PathBuf,
}

pub struct Loaded {
    pub settings: Settings,
    pub routes: RouteTable,
    pub certs: CertStore,
}

impl std::fmt::Debug for Loaded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loaded")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

pub fn load(path: &Path) -> Result<Loaded> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("could not read configuration file {:?}", path))?;
    parse(&raw)
}

fn parse(raw: &str) -> Result<Loaded> {
    let file: ConfigFile = toml::from_str(raw).context("could not parse configuration")?;

    let mut bind_addresses = Vec::new();
    for value in file
        .bind_addresses
        .unwrap_or_else(|| vec![DEFAULT_BIND_ADDRESS.to_string()])
    {
        let addr = value
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .with_context(|| format!("could not resolve bind address '{}'", value))?;
        bind_addresses.push(addr);
    }

    let settings = Settings {
        hostname: file.hostname.unwrap_or_else(|| "kutsche".to_string()),
        bind_addresses,
        unix_user: file.unix_user,
        unix_group: file.unix_group,
        max_message_size: file.max_message_size.unwrap_or(DEFAULT_MAX_MESSAGE_SIZE),
        max_errors: file.max_errors.unwrap_or(DEFAULT_MAX_ERRORS),
        timeout: Duration::from_secs(file.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
        max_connections_per_minute: file.max_connections_per_minute.unwrap_or(0),
        pid_file: file
            .pid_file
            .unwrap_or_else(|| PathBuf::from("/tmp/kutsche.pid")),
    };

    let certs = CertStore::load(&file.certificates)?;

    let mut entries = Vec::new();
    for (name, mapping) in file.mappings {
        entries.push(build_mapping(&name, mapping, file.default_path.as_deref())?);
    }
    if let Some(default_path) = &file.default_path {
        std::fs::create_dir_all(default_path)
            .with_context(|| format!("could not create default path {:?}", default_path))?;
    }
    let routes = RouteTable::new(entries, file.default_path);

    Ok(Loaded {
        settings,
        routes,
        certs,
    })
}

fn build_mapping(
    name: &str,
    mapping: MappingConfig,
    default_path: Option<&Path>,
) -> Result<MappingEntry> {
    let destination = if let Some(homeserver) = mapping.matrix_homeserver {
        if mapping.dest_path.is_some() {
            bail!(
                "mapping '{}' configures both dest_path and a matrix destination",
                name
            );
        }
        let room = mapping
            .matrix_room_id
            .with_context(|| format!("mapping '{}' is missing matrix_room_id", name))?;
        let room_id = OwnedRoomId::try_from(room)
            .map_err(|e| anyhow::anyhow!("mapping '{}' has an invalid room id: {}", name, e))?;
        let credentials = match (mapping.matrix_username, mapping.matrix_password) {
            (Some(username), Some(password)) => Some((username, password)),
            (None, None) => None,
            _ => bail!(
                "mapping '{}' needs both matrix_username and matrix_password",
                name
            ),
        };
        Destination::Matrix(
            MatrixDestination::new(homeserver, credentials, mapping.matrix_session_file, room_id)
                .with_context(|| format!("mapping '{}'", name))?,
        )
    } else {
        if mapping.matrix_username.is_some()
            || mapping.matrix_password.is_some()
            || mapping.matrix_session_file.is_some()
            || mapping.matrix_room_id.is_some()
        {
            bail!(
                "mapping '{}' sets matrix options but no matrix_homeserver",
                name
            );
        }
        let dir = match (mapping.dest_path, default_path) {
            (Some(dir), _) => dir,
            // Without an explicit dest_path the mapping gets its own
            // subdirectory of the default path.
            (None, Some(base)) => base.join(&mapping.address),
            (None, None) => bail!("missing destination for mapping '{}'", name),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("could not create directory {:?} for mapping '{}'", dir, name))?;
        Destination::File(FileDestination::new(dir))
    };

    Ok(MappingEntry {
        address: mapping.address,
        destination,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_complete_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let raw = format!(
            r#"
            hostname = "mx.example.com"
            bind_addresses = ["127.0.0.1:2525", "127.0.0.1:465"]
            unix_user = "kutsche"
            default_path = "{base}/fallback"
            max_message_size = 1048576
            timeout_secs = 60

            [mappings.user]
            address = "user@example.com"
            dest_path = "{base}/user"

            [mappings.other]
            address = "other@example.com"
            "#,
            base = dir.path().display()
        );

        let loaded = parse(&raw).unwrap();
        assert_eq!(loaded.settings.hostname, "mx.example.com");
        assert_eq!(loaded.settings.bind_addresses.len(), 2);
        assert_eq!(loaded.settings.unix_user.as_deref(), Some("kutsche"));
        assert_eq!(loaded.settings.max_message_size, 1048576);
        assert_eq!(loaded.settings.timeout, Duration::from_secs(60));
        assert!(!loaded.certs.is_configured());

        // Explicit mapping, implicit per-address subdirectory, default path.
        assert!(loaded.routes.route("user@example.com").is_some());
        assert!(loaded.routes.route("other@example.com").is_some());
        assert!(loaded.routes.route("unknown@example.com").is_some());
        assert!(dir.path().join("fallback/other@example.com").is_dir());
    }

    #[test]
    fn defaults_are_applied() {
        let loaded = parse("").unwrap();
        assert_eq!(loaded.settings.hostname, "kutsche");
        assert_eq!(
            loaded.settings.bind_addresses,
            vec![DEFAULT_BIND_ADDRESS.parse::<SocketAddr>().unwrap()]
        );
        assert_eq!(loaded.settings.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
        assert_eq!(loaded.settings.max_errors, DEFAULT_MAX_ERRORS);
        assert!(loaded.routes.route("anyone@example.com").is_none());
    }

    #[test]
    fn mapping_order_decides_ties() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let raw = format!(
            r#"
            [mappings.one]
            address = "user@example.com"
            dest_path = "{}"

            [mappings.two]
            address = "user@example.com"
            dest_path = "{}"
            "#,
            first.path().display(),
            second.path().display()
        );

        let loaded = parse(&raw).unwrap();
        match loaded.routes.route("user@example.com").unwrap() {
            Destination::File(dest) => assert_eq!(dest.dir(), first.path()),
            Destination::Matrix(_) => panic!("expected a file destination"),
        }
    }

    #[test]
    fn mapping_without_any_destination_is_an_error() {
        let raw = r#"
            [mappings.broken]
            address = "user@example.com"
        "#;
        let error = parse(raw).unwrap_err();
        assert!(error.to_string().contains("missing destination"));
    }

    #[test]
    fn matrix_mapping_requires_a_room_id() {
        let raw = r#"
            [mappings.chat]
            address = "chat@example.com"
            matrix_homeserver = "https://matrix.example.com"
            matrix_username = "bot"
            matrix_password = "secret"
        "#;
        let error = parse(raw).unwrap_err();
        assert!(error.to_string().contains("matrix_room_id"));
    }

    #[test]
    fn matrix_mapping_with_incomplete_credentials_is_an_error() {
        let raw = r#"
            [mappings.chat]
            address = "chat@example.com"
            matrix_homeserver = "https://matrix.example.com"
            matrix_username = "bot"
            matrix_room_id = "!room:example.com"
        "#;
        let error = parse(raw).unwrap_err();
        assert!(error.to_string().contains("matrix_password"));
    }

    #[test]
    fn matrix_mapping_without_session_or_credentials_fails_at_startup() {
        let raw = r#"
            [mappings.chat]
            address = "chat@example.com"
            matrix_homeserver = "https://matrix.example.com"
            matrix_session_file = "/nonexistent/kutsche.session"
            matrix_room_id = "!room:example.com"
        "#;
        assert!(parse(raw).is_err());
    }

    #[test]
    fn matrix_mapping_with_credentials_is_accepted() {
        let raw = r#"
            [mappings.chat]
            address = "chat@example.com"
            matrix_homeserver = "https://matrix.example.com"
            matrix_username = "bot"
            matrix_password = "secret"
            matrix_room_id = "!room:example.com"
        "#;
        let loaded = parse(raw).unwrap();
        match loaded.routes.route("chat@example.com").unwrap() {
            Destination::Matrix(dest) => {
                assert_eq!(dest.room_id().as_str(), "!room:example.com");
            }
            Destination::File(_) => panic!("expected a matrix destination"),
        }
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(parse("no_such_option = true").is_err());
    }
}
