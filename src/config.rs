use std::path::Path;
use std::time::Duration;

use facet::Facet;

use crate::error::ProvisionError;

// ── [host] ────────────────────────────────────────────────

/// Resources held back for the host operating system.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct HostConfig {
    #[facet(default)]
    pub os_system_memory_mb: u64,
    #[facet(default)]
    pub disk_space_allocated_to_os_percent: u64,
    #[facet(default)]
    pub os_system_cores: u32,
    #[facet(default = "/")]
    pub default_mount_point: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            os_system_memory_mb: 0,
            disk_space_allocated_to_os_percent: 0,
            os_system_cores: 0,
            default_mount_point: "/".into(),
        }
    }
}

// ── [installer] ───────────────────────────────────────────

#[derive(Debug, Clone, Facet)]
pub struct InstallerConfig {
    #[facet(default = "qemu:///system")]
    pub libvirt_uri: String,
    /// Kernel command line typed at the `boot:` prompt.
    pub boot_line: String,
    #[facet(default = 300)]
    pub default_timeout_s: u64,
    #[facet(default = 3600)]
    pub boot_timeout_s: u64,
    #[facet(default = 7200)]
    pub config_timeout_s: u64,
    #[facet(default = "sudo config_controller")]
    pub config_command: String,
    /// Configuration file on the installed machine, applied after network setup.
    #[facet(default)]
    pub config_file: Option<String>,
    #[facet(default)]
    pub markers: MarkersConfig,
}

impl InstallerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_s)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_s)
    }

    pub fn config_timeout(&self) -> Duration {
        Duration::from_secs(self.config_timeout_s)
    }
}

/// Console text the installer prints at each step.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct MarkersConfig {
    #[facet(default = "Escape character")]
    pub escape: String,
    #[facet(default = "boot:")]
    pub boot_prompt: String,
    #[facet(default = "Loading vmlinuz")]
    pub kernel: String,
    #[facet(default = "Loading initrd.img")]
    pub initrd: String,
    #[facet(default = "Starting installer, one moment...")]
    pub installer_start: String,
    #[facet(default = "Performing post-installation setup tasks")]
    pub post_install: String,
    #[facet(default = "localhost login:")]
    pub login: String,
    #[facet(default = "Password:")]
    pub password: String,
    #[facet(default = "UNIX password:")]
    pub current_password: String,
    #[facet(default = "New password:")]
    pub new_password: String,
    #[facet(default = "Retype new password:")]
    pub retype_password: String,
    #[facet(default = "$")]
    pub shell_prompt: String,
    #[facet(default = "1 packets transmitted")]
    pub probe_ack: String,
    #[facet(default = "Configuration was applied")]
    pub config_applied: String,
}

impl Default for MarkersConfig {
    fn default() -> Self {
        Self {
            escape: "Escape character".into(),
            boot_prompt: "boot:".into(),
            kernel: "Loading vmlinuz".into(),
            initrd: "Loading initrd.img".into(),
            installer_start: "Starting installer, one moment...".into(),
            post_install: "Performing post-installation setup tasks".into(),
            login: "localhost login:".into(),
            password: "Password:".into(),
            current_password: "UNIX password:".into(),
            new_password: "New password:".into(),
            retype_password: "Retype new password:".into(),
            shell_prompt: "$".into(),
            probe_ack: "1 packets transmitted".into(),
            config_applied: "Configuration was applied".into(),
        }
    }
}

impl MarkersConfig {
    fn entries(&self) -> [(&'static str, &str); 14] {
        [
            ("escape", self.escape.as_str()),
            ("boot_prompt", self.boot_prompt.as_str()),
            ("kernel", self.kernel.as_str()),
            ("initrd", self.initrd.as_str()),
            ("installer_start", self.installer_start.as_str()),
            ("post_install", self.post_install.as_str()),
            ("login", self.login.as_str()),
            ("password", self.password.as_str()),
            ("current_password", self.current_password.as_str()),
            ("new_password", self.new_password.as_str()),
            ("retype_password", self.retype_password.as_str()),
            ("shell_prompt", self.shell_prompt.as_str()),
            ("probe_ack", self.probe_ack.as_str()),
            ("config_applied", self.config_applied.as_str()),
        ]
    }
}

// ── [credentials] ─────────────────────────────────────────

#[derive(Debug, Clone, Facet)]
pub struct CredentialsConfig {
    #[facet(default = "sysadmin")]
    pub username: String,
    /// Password the freshly installed system accepts on first login.
    /// Empty means "same as the username".
    #[facet(default)]
    pub initial_password: String,
    pub password: String,
    #[facet(default = true)]
    pub force_password_change: bool,
}

impl CredentialsConfig {
    pub fn initial_password(&self) -> &str {
        if self.initial_password.is_empty() {
            &self.username
        } else {
            &self.initial_password
        }
    }
}

// ── [temp_network] ────────────────────────────────────────

#[derive(Debug, Clone, Facet)]
pub struct TempNetworkConfig {
    pub address: String,
    #[facet(default = 24)]
    pub prefix: u8,
    pub interface: String,
    pub gateway: String,
    #[facet(default = "127.0.0.1")]
    pub probe_target: String,
}

// ── [libvirt] ─────────────────────────────────────────────

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct LibvirtConfig {
    #[facet(default = "/var/lib/libvirt/images")]
    pub images_dir: String,
    #[facet(default = "kvm")]
    pub domain_type: String,
    #[facet(default)]
    pub bridges: Vec<String>,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            images_dir: "/var/lib/libvirt/images".into(),
            domain_type: "kvm".into(),
            bridges: Vec::new(),
        }
    }
}

impl LibvirtConfig {
    /// Configured bridges, or the four host bridges the installer expects.
    pub fn bridges(&self) -> Vec<String> {
        if self.bridges.is_empty() {
            (1..=4).map(|i| format!("virbr{i}")).collect()
        } else {
            self.bridges.clone()
        }
    }
}

// ── [[configurations]] ────────────────────────────────────

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct NodeResourcesConfig {
    pub partition_a_gb: u64,
    pub partition_b_gb: u64,
    pub memory_mb: u64,
    pub cores: u32,
}

/// One controller and the computes attached to it.
#[derive(Debug, Clone, Facet)]
pub struct ConfigurationConfig {
    pub controller: NodeResourcesConfig,
    #[facet(default)]
    pub computes: Vec<NodeResourcesConfig>,
}

// ── Config ────────────────────────────────────────────────

#[derive(Debug, Clone, Facet)]
pub struct Config {
    #[facet(default)]
    pub host: HostConfig,
    pub installer: InstallerConfig,
    pub credentials: CredentialsConfig,
    pub temp_network: TempNetworkConfig,
    #[facet(default)]
    pub libvirt: LibvirtConfig,
    #[facet(default)]
    pub configurations: Vec<ConfigurationConfig>,
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), ProvisionError> {
    if config.configurations.is_empty() {
        return Err(ProvisionError::Validation {
            message: "at least one [[configurations]] entry is required".into(),
        });
    }

    if config.host.disk_space_allocated_to_os_percent > 100 {
        return Err(ProvisionError::Validation {
            message: format!(
                "host.disk_space_allocated_to_os_percent must be at most 100 (got {})",
                config.host.disk_space_allocated_to_os_percent
            ),
        });
    }

    let installer = &config.installer;
    if installer.boot_line.trim().is_empty() {
        return Err(ProvisionError::Validation {
            message: "installer.boot_line must not be empty".into(),
        });
    }
    for (key, value) in [
        ("default_timeout_s", installer.default_timeout_s),
        ("boot_timeout_s", installer.boot_timeout_s),
        ("config_timeout_s", installer.config_timeout_s),
    ] {
        if value == 0 {
            return Err(ProvisionError::Validation {
                message: format!("installer.{key} must be at least 1"),
            });
        }
    }
    for (key, marker) in installer.markers.entries() {
        if marker.is_empty() {
            return Err(ProvisionError::Validation {
                message: format!("installer.markers.{key} must not be empty"),
            });
        }
    }

    if config.credentials.username.is_empty() {
        return Err(ProvisionError::Validation {
            message: "credentials.username must not be empty".into(),
        });
    }
    if config.credentials.password.is_empty() {
        return Err(ProvisionError::Validation {
            message: "credentials.password must not be empty".into(),
        });
    }

    let net = &config.temp_network;
    if net.prefix > 32 {
        return Err(ProvisionError::Validation {
            message: format!("temp_network.prefix must be at most 32 (got {})", net.prefix),
        });
    }
    for (key, value) in [
        ("address", &net.address),
        ("interface", &net.interface),
        ("gateway", &net.gateway),
    ] {
        if value.is_empty() {
            return Err(ProvisionError::Validation {
                message: format!("temp_network.{key} must not be empty"),
            });
        }
    }

    Ok(())
}

// ── public API ────────────────────────────────────────────

pub fn load_config(path: &Path) -> Result<Config, ProvisionError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ProvisionError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config = parse_config(&contents).map_err(|e| match e {
        ProvisionError::ConfigParse { message, .. } => ProvisionError::ConfigParse {
            path: path.display().to_string(),
            message,
        },
        other => other,
    })?;

    tracing::debug!(
        path = %path.display(),
        configurations = config.configurations.len(),
        "config loaded"
    );
    Ok(config)
}

/// Parse and validate config text.
pub fn parse_config(contents: &str) -> Result<Config, ProvisionError> {
    let config: Config = facet_toml::from_str(contents).map_err(|e| ProvisionError::ConfigParse {
        path: "<inline>".into(),
        message: e.to_string(),
    })?;
    validate_config(&config)?;
    Ok(config)
}
