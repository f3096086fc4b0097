use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tether_ssh::{Auth, ConnectOptions, DEFAULT_PORT};

use crate::cli::TargetArgs;

const FALLBACK_USER: &str = "root";

/// Connection defaults stored as JSON.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub key: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub agent: bool,
    pub options: ConnectOptions,
}

/// Fully resolved connection parameters.
pub struct Target {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub auth: Auth,
    pub options: ConnectOptions,
}

/// Load a profile from `path`; a missing file yields the defaults.
pub fn load_profile(path: &Path) -> Result<Profile> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log::warn!(
                "profile {} not found, using defaults",
                path.display()
            );
            return Ok(Profile::default());
        },
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read profile {}", path.display())
            });
        },
    };

    serde_json::from_str(&content)
        .with_context(|| format!("invalid profile {}", path.display()))
}

impl Profile {
    /// Apply command line flags on top of the profile.
    pub fn merge(mut self, args: &TargetArgs) -> Self {
        if let Some(host) = &args.host {
            self.host = Some(host.clone());
        }
        if let Some(port) = args.port {
            self.port = Some(port);
        }
        if let Some(user) = &args.user {
            self.user = Some(user.clone());
        }
        if let Some(password) = &args.password {
            self.password = Some(password.clone());
        }
        if let Some(key) = &args.key {
            self.key = Some(key.clone());
        }
        if let Some(passphrase) = &args.passphrase {
            self.passphrase = Some(passphrase.clone());
        }
        if let Some(timeout_ms) = args.timeout_ms {
            self.options.timeout_ms = timeout_ms;
        }
        self.agent |= args.agent;
        self.options.compress |= args.compress;
        self
    }

    /// Turn the merged profile into connection parameters. `default_user` is
    /// used when neither the profile nor the flags name a user.
    pub fn resolve(self, default_user: Option<String>) -> Result<Target> {
        let Some(host) = self.host.filter(|host| !host.is_empty()) else {
            bail!("no host given; pass --host or set it in the profile");
        };

        let user = self
            .user
            .or(default_user)
            .unwrap_or_else(|| FALLBACK_USER.to_owned());
        let auth = Auth::select(
            self.agent,
            self.key,
            self.passphrase,
            self.password.clone(),
        );

        Ok(Target {
            host,
            port: self.port.unwrap_or(DEFAULT_PORT),
            user,
            password: self.password,
            auth,
            options: self.options,
        })
    }
}
