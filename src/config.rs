//! Plain-text configuration: one `KEY<TAB>VALUE` pair per line. Each role
//! reads its own key set; anything missing or malformed is fatal at startup.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

/// Maximum stored length of the shared credentials; the AUTH frame carries
/// exactly 16 bytes per field.
pub const CREDENTIAL_LEN: usize = 16;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Mode {
    LocalStandalone,
    LocalFront,
    RemoteStandalone,
    RemoteForward,
    Invalid,
}

/// Which executable is loading the file; decides the key set in play.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Local,
    Remote,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    MissingKey(&'static str),
    BadValue(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "config file unreadable: {}", err),
            ConfigError::MissingKey(key) => write!(f, "config key missing: {}", key),
            ConfigError::BadValue(key) => write!(f, "config value invalid: {}", key),
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> ConfigError {
        ConfigError::Io(err)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    /// Address this role binds: the SOCKS listener (local) or the carrier
    /// listener (remote).
    pub local_ip: String,
    pub local_port: u16,
    /// Carrier target, LOCAL_FRONT only.
    pub remote_ip: String,
    pub remote_port: u16,
    /// Fixed upstream, REMOTE_FORWARD only.
    pub forward_ip: String,
    pub forward_port: u16,
    pub username: String,
    pub password: String,
    pub debug_file: String,
    pub run_daemon: bool,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P, role: Role) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path)?;
        Config::parse(&content, role)
    }

    pub fn parse(content: &str, role: Role) -> Result<Config, ConfigError> {
        let entries: Vec<(&str, &str)> = content
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(2, '\t');
                match (parts.next(), parts.next()) {
                    (Some(key), Some(value)) => Some((key.trim(), value.trim())),
                    _ => None,
                }
            })
            .collect();

        let value_of = |key: &str| -> Option<&str> {
            entries
                .iter()
                .find(|(entry_key, _)| *entry_key == key)
                .map(|(_, value)| *value)
        };

        let mode = match role {
            Role::Local => match value_of("LOCAL_MODE") {
                Some("FRONT") => Mode::LocalFront,
                Some("STANDALONE") => Mode::LocalStandalone,
                Some(_) => Mode::Invalid,
                None => return Err(ConfigError::MissingKey("LOCAL_MODE")),
            },
            Role::Remote => match value_of("REMOTE_MODE") {
                Some("STANDALONE") => Mode::RemoteStandalone,
                Some("FORWARD") => Mode::RemoteForward,
                Some(_) => Mode::Invalid,
                None => return Err(ConfigError::MissingKey("REMOTE_MODE")),
            },
        };

        let parse_port = |key: &'static str| -> Result<u16, ConfigError> {
            value_of(key)
                .ok_or(ConfigError::MissingKey(key))?
                .parse::<u16>()
                .map_err(|_| ConfigError::BadValue(key))
        };

        // The remote role listens on its REMOTE_* keys
        let (local_ip, local_port) = match role {
            Role::Local => (
                value_of("LOCAL_IP")
                    .ok_or(ConfigError::MissingKey("LOCAL_IP"))?
                    .to_string(),
                parse_port("LOCAL_PORT")?,
            ),
            Role::Remote => (
                value_of("REMOTE_IP")
                    .ok_or(ConfigError::MissingKey("REMOTE_IP"))?
                    .to_string(),
                parse_port("REMOTE_PORT")?,
            ),
        };

        let (remote_ip, remote_port) = if mode == Mode::LocalFront {
            (
                value_of("REMOTE_IP")
                    .ok_or(ConfigError::MissingKey("REMOTE_IP"))?
                    .to_string(),
                parse_port("REMOTE_PORT")?,
            )
        } else {
            (String::new(), 0)
        };

        let (forward_ip, forward_port) = if mode == Mode::RemoteForward {
            (
                value_of("FORWARD_IP")
                    .ok_or(ConfigError::MissingKey("FORWARD_IP"))?
                    .to_string(),
                parse_port("FORWARD_PORT")?,
            )
        } else {
            (String::new(), 0)
        };

        Ok(Config {
            mode,
            local_ip,
            local_port,
            remote_ip,
            remote_port,
            forward_ip,
            forward_port,
            username: credential(value_of("REMOTE_USERNAME")),
            password: credential(value_of("REMOTE_PASSWORD")),
            debug_file: value_of("DEBUG_FILE").unwrap_or("").to_string(),
            run_daemon: value_of("RUN_DAEMON") == Some("YES"),
        })
    }
}

fn credential(value: Option<&str>) -> String {
    let mut cred = value.unwrap_or("").to_string();
    cred.truncate(CREDENTIAL_LEN);
    cred
}
