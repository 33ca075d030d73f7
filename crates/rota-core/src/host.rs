//! Host specs: `[user@]hostname[:port]`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RotaError;

/// A remote host address as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub user: Option<String>,
    pub hostname: String,
    pub port: Option<u16>,
}

impl HostSpec {
    /// Fill in user and port from defaults where the host string omits them.
    /// An empty default user leaves the user unset.
    pub fn qualify(mut self, default_user: &str, default_port: u16) -> Self {
        if self.user.is_none() && !default_user.is_empty() {
            self.user = Some(default_user.to_string());
        }
        if self.port.is_none() {
            self.port = Some(default_port);
        }
        self
    }

    /// Port to connect to, 22 when unset.
    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(22)
    }
}

impl FromStr for HostSpec {
    type Err = RotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (user, rest) = match s.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return Err(RotaError::Config(format!("empty user in host spec '{s}'"))),
            None => (None, s),
        };
        let (hostname, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| RotaError::Config(format!("bad port in host spec '{s}'")))?;
                (host, Some(port))
            }
            None => (rest, None),
        };
        if hostname.is_empty() || hostname.chars().any(char::is_whitespace) {
            return Err(RotaError::Config(format!("bad hostname in host spec '{s}'")));
        }
        Ok(Self {
            user,
            hostname: hostname.to_string(),
            port,
        })
    }
}

impl fmt::Display for HostSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.hostname)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

/// Parse and qualify a host string in one step.
pub fn qualify_host(raw: &str, default_user: &str, default_port: u16) -> crate::Result<String> {
    let spec: HostSpec = raw.parse()?;
    Ok(spec.qualify(default_user, default_port).to_string())
}
