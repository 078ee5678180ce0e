use crate::error::{Result, SetupError};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable pointing at an alternative config file
pub const CONFIG_ENV_VAR: &str = "TRAEFIK_BOOTSTRAP_CONFIG";

/// Config file read when present and no override is given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/traefik-bootstrap.toml";

/// Global configuration for the provisioning tool
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Filesystem layout
    #[serde(default)]
    pub paths: PathsConfig,

    /// Long-lived proxy service
    #[serde(default)]
    pub proxy: ProxyServiceConfig,

    /// Disposable test page
    #[serde(default)]
    pub test_page: TestPageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Directory holding traefik.yml (default: /etc/traefik)
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    /// ACME certificate storage directory (default: /etc/traefik/certs)
    #[serde(default = "default_certs_dir")]
    pub certs_dir: PathBuf,

    /// Directory holding the compose manifests and .env (default: /opt/traefik)
    #[serde(default = "default_compose_dir")]
    pub compose_dir: PathBuf,

    /// Teardown records and watcher log (default: /var/lib/traefik-bootstrap)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            certs_dir: default_certs_dir(),
            compose_dir: default_compose_dir(),
            state_dir: default_state_dir(),
        }
    }
}

impl PathsConfig {
    /// All paths rooted under a single directory (used for sandboxed runs and tests)
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            config_dir: root.join("etc/traefik"),
            certs_dir: root.join("etc/traefik/certs"),
            compose_dir: root.join("opt/traefik"),
            state_dir: root.join("var/lib/traefik-bootstrap"),
        }
    }

    pub fn proxy_config_file(&self) -> PathBuf {
        self.config_dir.join("traefik.yml")
    }

    pub fn acme_storage_file(&self) -> PathBuf {
        self.certs_dir.join("acme.json")
    }

    pub fn proxy_manifest(&self) -> PathBuf {
        self.compose_dir.join("docker-compose.yml")
    }

    pub fn test_manifest(&self) -> PathBuf {
        self.compose_dir.join("docker-compose-test.yml")
    }

    pub fn env_file(&self) -> PathBuf {
        self.compose_dir.join(".env")
    }
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/traefik")
}

fn default_certs_dir() -> PathBuf {
    PathBuf::from("/etc/traefik/certs")
}

fn default_compose_dir() -> PathBuf {
    PathBuf::from("/opt/traefik")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/traefik-bootstrap")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyServiceConfig {
    /// Traefik image reference (default: traefik:v2.10)
    #[serde(default = "default_proxy_image")]
    pub image: String,

    /// Container name (default: traefik)
    #[serde(default = "default_proxy_container")]
    pub container_name: String,

    /// Shared external network (default: traefik)
    #[serde(default = "default_network")]
    pub network: String,

    /// ACME contact used when none is entered (default: admin@example.com)
    #[serde(default = "default_fallback_email")]
    pub fallback_email: String,

    /// Docker socket mounted into the proxy (default: /var/run/docker.sock)
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,
}

impl Default for ProxyServiceConfig {
    fn default() -> Self {
        Self {
            image: default_proxy_image(),
            container_name: default_proxy_container(),
            network: default_network(),
            fallback_email: default_fallback_email(),
            docker_socket: default_docker_socket(),
        }
    }
}

fn default_proxy_image() -> String {
    "traefik:v2.10".to_string()
}

fn default_proxy_container() -> String {
    "traefik".to_string()
}

fn default_network() -> String {
    "traefik".to_string()
}

fn default_fallback_email() -> String {
    "admin@example.com".to_string()
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TestPageConfig {
    /// Test page image (default: softsweb/traefik-test-page:latest)
    #[serde(default = "default_test_image")]
    pub image: String,

    /// Container name (default: traefik-test-page)
    #[serde(default = "default_test_container")]
    pub container_name: String,
}

impl Default for TestPageConfig {
    fn default() -> Self {
        Self {
            image: default_test_image(),
            container_name: default_test_container(),
        }
    }
}

fn default_test_image() -> String {
    "softsweb/traefik-test-page:latest".to_string()
}

fn default_test_container() -> String {
    "traefik-test-page".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SetupError::Config(format!("cannot read '{}': {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| SetupError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config source: env override, then the default file, then built-ins
    pub fn discover() -> Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::load(path);
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.exists() {
            return Self::load(default_path);
        }
        Ok(Self::default())
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        for (name, path) in [
            ("paths.config_dir", &self.paths.config_dir),
            ("paths.certs_dir", &self.paths.certs_dir),
            ("paths.compose_dir", &self.paths.compose_dir),
            ("paths.state_dir", &self.paths.state_dir),
        ] {
            if !path.is_absolute() {
                errors.push(format!("{} must be an absolute path, got '{}'", name, path.display()));
            }
        }

        for (name, value) in [
            ("proxy.image", &self.proxy.image),
            ("proxy.container_name", &self.proxy.container_name),
            ("proxy.network", &self.proxy.network),
            ("proxy.fallback_email", &self.proxy.fallback_email),
            ("proxy.docker_socket", &self.proxy.docker_socket),
            ("test_page.image", &self.test_page.image),
            ("test_page.container_name", &self.test_page.container_name),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("{} must not be empty", name));
            }
        }

        if !errors.is_empty() {
            return Err(SetupError::Config(format!(
                "Configuration errors:\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(())
    }
}
