use std::fmt;
use std::path::{Path, PathBuf};

use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use serde::Deserialize;

use dp_core::models::{HostTarget, PlatformSettings};

pub const CONFIG_FILENAME: &str = "dp-server.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub state_file: PathBuf,
    pub jwt_secret: Option<String>,
    /// Daily-rolling log files go here when set; otherwise logs go to stdout.
    pub log_dir: Option<PathBuf>,
    pub platform: PlatformSettings,
    pub default_host: Option<DefaultHost>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            state_file: PathBuf::from("data/state.json"),
            jwt_secret: None,
            log_dir: None,
            platform: PlatformSettings::default(),
            default_host: None,
        }
    }
}

/// Docker host used when no host record is active.
#[derive(Clone, Deserialize)]
pub struct DefaultHost {
    pub host: String,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
}

impl DefaultHost {
    pub fn target(&self) -> HostTarget {
        HostTarget::new(self.host.clone(), self.user.clone(), self.password.clone())
    }
}

impl fmt::Debug for DefaultHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultHost")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Read the YAML config. An explicit path must exist; without one,
/// `dp-server.yaml` in the working directory is used if present.
pub fn load(path: Option<&Path>) -> Result<ServerConfig> {
    let path = match path {
        Some(p) if !p.exists() => return Err(eyre!("config file {} not found", p.display())),
        Some(p) => p.to_path_buf(),
        None => {
            let default = PathBuf::from(CONFIG_FILENAME);
            if !default.exists() {
                return Ok(ServerConfig::default());
            }
            default
        }
    };
    let contents = std::fs::read_to_string(&path)
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    if contents.trim().is_empty() {
        return Ok(ServerConfig::default());
    }
    serde_yaml::from_str(&contents).wrap_err_with(|| format!("invalid config in {}", path.display()))
}

impl ServerConfig {
    /// Apply `DP_*` overrides from `lookup` (the process environment in
    /// production).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = lookup("DP_LISTEN") {
            self.listen = listen;
        }
        if let Some(state_file) = lookup("DP_STATE_FILE") {
            self.state_file = PathBuf::from(state_file);
        }
        if let Some(secret) = lookup("DP_JWT_SECRET") {
            self.jwt_secret = Some(secret);
        }
        if let Some(host) = lookup("DP_DOCKER_HOST") {
            let user = lookup("DP_DOCKER_USER")
                .or_else(|| self.default_host.as_ref().map(|h| h.user.clone()))
                .unwrap_or_else(|| "root".to_string());
            let password = lookup("DP_DOCKER_PASSWORD")
                .or_else(|| self.default_host.as_ref().and_then(|h| h.password.clone()));
            self.default_host = Some(DefaultHost {
                host,
                user,
                password,
            });
        }
    }

    /// The signing secret, which must be set one way or another.
    pub fn jwt_secret(&self) -> Result<&str> {
        self.jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| eyre!("jwt_secret must be set in the config file or DP_JWT_SECRET"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dp_core::models::ProbeFailurePolicy;
    use std::collections::HashMap;
    use std::fs;

    #[test]
    fn parse_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILENAME);
        let yaml = r#"
listen: 127.0.0.1:9000
state_file: /var/lib/dp/state.json
jwt_secret: s3cret
platform:
  remote_root: /srv/deploy
  port_range_start: 9100
  probe_failure_policy: strict
  timeouts:
    build_secs: 600
default_host:
  host: docker.internal
  user: deploy
"#;
        fs::write(&path, yaml).unwrap();
        let config = load(Some(&path)).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.jwt_secret().unwrap(), "s3cret");
        assert_eq!(config.platform.remote_root, "/srv/deploy");
        assert_eq!(config.platform.port_range_start, 9100);
        assert_eq!(config.platform.port_search_span, 1000);
        assert_eq!(config.platform.probe_failure_policy, ProbeFailurePolicy::Strict);
        assert_eq!(config.platform.timeouts.build_secs, 600);
        assert_eq!(config.platform.timeouts.probe_secs, 15);
        let target = config.default_host.unwrap().target();
        assert_eq!(target.login(), "deploy@docker.internal");
        assert!(target.password.is_none());
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("nope.yaml"))).is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = ServerConfig::default();
        let env: HashMap<&str, &str> = [
            ("DP_LISTEN", "0.0.0.0:3001"),
            ("DP_JWT_SECRET", "from-env"),
            ("DP_DOCKER_HOST", "10.0.0.5"),
            ("DP_DOCKER_PASSWORD", "pw"),
        ]
        .into_iter()
        .collect();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.listen, "0.0.0.0:3001");
        assert_eq!(config.jwt_secret().unwrap(), "from-env");
        let host = config.default_host.unwrap();
        assert_eq!(host.user, "root");
        assert_eq!(host.password.as_deref(), Some("pw"));
        assert!(!format!("{host:?}").contains("pw\""));
    }

    #[test]
    fn secret_is_required() {
        assert!(ServerConfig::default().jwt_secret().is_err());
    }
}
