//! Rendering and writing of the proxy configuration artifacts
//!
//! Both YAML artifacts are serialized from typed models, so operator input
//! (emails, domains) is always quoted as needed and never read back as YAML
//! syntax. Maps are `BTreeMap`s and label lists are `Vec`s: identical inputs
//! give byte-identical files. Writes overwrite whatever was there.

use crate::config::Config;
use crate::error::{Result, SetupError};
use crate::prompt::SetupInputs;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Certificate resolver name shared by the proxy config and router labels
pub const CERT_RESOLVER: &str = "letsencrypt";

/// Compose substitution variable carrying the test domain
pub const DOMAIN_VAR: &str = "TEST_DOMAIN";

/// Compose file format version written into every manifest
const COMPOSE_VERSION: &str = "3.8";

/// Where the proxy container sees its static config
const CONTAINER_CONFIG_FILE: &str = "/etc/traefik/traefik.yml";

/// Where the proxy container sees the certificate store
const CONTAINER_CERTS_DIR: &str = "/etc/traefik/certs";

const PROXY_CONFIG_HEADER: &str = "# Traefik Global Configuration\n";

fn to_yaml<T: Serialize>(artifact: &str, value: &T) -> Result<String> {
    serde_yaml_ng::to_string(value).map_err(|e| SetupError::Render {
        artifact: artifact.to_string(),
        reason: e.to_string(),
    })
}

/// Traefik static configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub contact_email: Option<String>,
    pub storage_path: PathBuf,
}

impl ProxyConfig {
    /// Render traefik.yml.
    ///
    /// The dashboard runs in insecure mode (served on :8080 without auth).
    /// That is a demo posture and is called out in the final summary.
    pub fn render(&self, fallback_email: &str, docker_socket: &str) -> Result<String> {
        let email = self.contact_email.as_deref().unwrap_or(fallback_email);

        let mut entry_points = BTreeMap::new();
        entry_points.insert(
            "web",
            EntryPoint {
                address: ":80".to_string(),
                http: Some(EntryPointHttp {
                    redirections: Redirections {
                        entry_point: RedirectTarget {
                            to: "websecure",
                            scheme: "https",
                        },
                    },
                }),
            },
        );
        entry_points.insert(
            "websecure",
            EntryPoint {
                address: ":443".to_string(),
                http: None,
            },
        );

        let mut resolvers = BTreeMap::new();
        resolvers.insert(
            CERT_RESOLVER,
            CertResolver {
                acme: Acme {
                    email: email.to_string(),
                    storage: self.storage_path.display().to_string(),
                    http_challenge: HttpChallenge { entry_point: "web" },
                },
            },
        );

        let document = TraefikStatic {
            api: Api {
                dashboard: true,
                insecure: true,
            },
            entry_points,
            providers: Providers {
                docker: DockerProvider {
                    endpoint: format!("unix://{}", docker_socket),
                    exposed_by_default: false,
                },
            },
            certificates_resolvers: resolvers,
        };

        Ok(format!("{}{}", PROXY_CONFIG_HEADER, to_yaml("traefik.yml", &document)?))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TraefikStatic {
    api: Api,
    entry_points: BTreeMap<&'static str, EntryPoint>,
    providers: Providers,
    certificates_resolvers: BTreeMap<&'static str, CertResolver>,
}

#[derive(Serialize)]
struct Api {
    dashboard: bool,
    insecure: bool,
}

#[derive(Serialize)]
struct EntryPoint {
    address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    http: Option<EntryPointHttp>,
}

#[derive(Serialize)]
struct EntryPointHttp {
    redirections: Redirections,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Redirections {
    entry_point: RedirectTarget,
}

#[derive(Serialize)]
struct RedirectTarget {
    to: &'static str,
    scheme: &'static str,
}

#[derive(Serialize)]
struct Providers {
    docker: DockerProvider,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DockerProvider {
    endpoint: String,
    exposed_by_default: bool,
}

#[derive(Serialize)]
struct CertResolver {
    acme: Acme,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Acme {
    email: String,
    storage: String,
    http_challenge: HttpChallenge,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HttpChallenge {
    entry_point: &'static str,
}

/// Compose restart policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RestartPolicy {
    #[serde(rename = "unless-stopped")]
    UnlessStopped,
    #[serde(rename = "no")]
    No,
}

/// One-service compose file routed through the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeManifest {
    pub service_name: String,
    pub container_name: String,
    pub image_ref: String,
    pub restart: RestartPolicy,
    pub network_ref: String,
    pub port_bindings: Vec<String>,
    pub volumes: Vec<String>,
    /// Router name used in the traefik labels
    pub router: String,
    pub routing_rule: String,
    /// Explicit router target, e.g. `api@internal` for the dashboard
    pub router_service: Option<String>,
}

#[derive(Serialize)]
struct ComposeFile<'a> {
    version: &'static str,
    services: BTreeMap<&'a str, ComposeService<'a>>,
    networks: BTreeMap<&'a str, ExternalNetwork<'a>>,
}

#[derive(Serialize)]
struct ComposeService<'a> {
    image: &'a str,
    container_name: &'a str,
    restart: RestartPolicy,
    networks: Vec<&'a str>,
    #[serde(skip_serializing_if = "is_empty")]
    ports: &'a [String],
    #[serde(skip_serializing_if = "is_empty")]
    volumes: &'a [String],
    labels: Vec<String>,
}

fn is_empty(values: &&[String]) -> bool {
    values.is_empty()
}

#[derive(Serialize)]
struct ExternalNetwork<'a> {
    external: bool,
    name: &'a str,
}

impl ComposeManifest {
    /// The long-lived proxy, routed at `traefik.${TEST_DOMAIN:-localhost}`
    pub fn proxy(config: &Config) -> Self {
        let paths = &config.paths;
        Self {
            service_name: "traefik".to_string(),
            container_name: config.proxy.container_name.clone(),
            image_ref: config.proxy.image.clone(),
            restart: RestartPolicy::UnlessStopped,
            network_ref: config.proxy.network.clone(),
            port_bindings: vec!["80:80".to_string(), "443:443".to_string()],
            volumes: vec![
                format!("{0}:{0}:ro", config.proxy.docker_socket),
                format!("{}:{}:ro", paths.proxy_config_file().display(), CONTAINER_CONFIG_FILE),
                format!("{}:{}", paths.certs_dir.display(), CONTAINER_CERTS_DIR),
            ],
            router: "traefik".to_string(),
            routing_rule: format!("Host(`traefik.${{{}:-localhost}}`)", DOMAIN_VAR),
            router_service: Some("api@internal".to_string()),
        }
    }

    /// The disposable test page, routed at exactly `domain`
    pub fn test_page(config: &Config, domain: &str) -> Self {
        Self {
            service_name: "test-page".to_string(),
            container_name: config.test_page.container_name.clone(),
            image_ref: config.test_page.image.clone(),
            restart: RestartPolicy::No,
            network_ref: config.proxy.network.clone(),
            port_bindings: Vec::new(),
            volumes: Vec::new(),
            router: "test-page".to_string(),
            routing_rule: format!("Host(`{}`)", domain),
            router_service: None,
        }
    }

    pub fn render(&self) -> Result<String> {
        let mut services = BTreeMap::new();
        services.insert(
            self.service_name.as_str(),
            ComposeService {
                image: &self.image_ref,
                container_name: &self.container_name,
                restart: self.restart,
                networks: vec![self.network_ref.as_str()],
                ports: &self.port_bindings,
                volumes: &self.volumes,
                labels: self.labels(),
            },
        );

        let mut networks = BTreeMap::new();
        networks.insert(
            self.network_ref.as_str(),
            ExternalNetwork {
                external: true,
                name: &self.network_ref,
            },
        );

        let file = ComposeFile {
            version: COMPOSE_VERSION,
            services,
            networks,
        };
        to_yaml(&format!("{} compose manifest", self.service_name), &file)
    }

    fn labels(&self) -> Vec<String> {
        let prefix = format!("traefik.http.routers.{}", self.router);
        let mut labels = vec![
            "traefik.enable=true".to_string(),
            format!("{}.rule={}", prefix, self.routing_rule),
        ];
        if let Some(ref service) = self.router_service {
            labels.push(format!("{}.service={}", prefix, service));
        }
        labels.push(format!("{}.entrypoints=websecure", prefix));
        labels.push(format!("{}.tls.certresolver={}", prefix, CERT_RESOLVER));
        labels
    }
}

/// Contents of the compose `.env` file
pub fn render_env_file(domain: &str) -> String {
    format!("{}={}\n", DOMAIN_VAR, domain)
}

/// Paths written by a materialization run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedArtifacts {
    pub proxy_config: PathBuf,
    pub proxy_manifest: PathBuf,
    pub test_manifest: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

/// Create the directory layout and write every artifact for `inputs`
pub fn materialize(config: &Config, inputs: &SetupInputs) -> Result<MaterializedArtifacts> {
    let paths = &config.paths;

    for dir in [&paths.compose_dir, &paths.config_dir, &paths.certs_dir] {
        std::fs::create_dir_all(dir).map_err(|e| SetupError::filesystem(dir, e))?;
    }
    debug!("Directories created");

    // The storage path is read inside the container, not on the host
    let proxy_config = ProxyConfig {
        contact_email: inputs.contact_email.clone(),
        storage_path: Path::new(CONTAINER_CERTS_DIR).join("acme.json"),
    };
    let proxy_config_path = paths.proxy_config_file();
    write_artifact(
        &proxy_config_path,
        &proxy_config.render(&config.proxy.fallback_email, &config.proxy.docker_socket)?,
    )?;
    info!(path = %proxy_config_path.display(), "Traefik configuration written");

    let proxy_manifest_path = paths.proxy_manifest();
    write_artifact(&proxy_manifest_path, &ComposeManifest::proxy(config).render()?)?;
    info!(path = %proxy_manifest_path.display(), "Proxy compose manifest written");

    let (test_manifest, env_file) = match inputs.test_domain.as_deref() {
        Some(domain) => {
            let manifest_path = paths.test_manifest();
            write_artifact(&manifest_path, &ComposeManifest::test_page(config, domain).render()?)?;
            info!(path = %manifest_path.display(), domain, "Test page compose manifest written");

            let env_path = paths.env_file();
            write_artifact(&env_path, &render_env_file(domain))?;
            info!(path = %env_path.display(), "Environment file written");

            (Some(manifest_path), Some(env_path))
        }
        None => (None, None),
    };

    Ok(MaterializedArtifacts {
        proxy_config: proxy_config_path,
        proxy_manifest: proxy_manifest_path,
        test_manifest,
        env_file,
    })
}

fn write_artifact(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SetupError::filesystem(parent, e))?;
    }
    std::fs::write(path, content).map_err(|e| SetupError::filesystem(path, e))
}
