use config::{Config, ConfigError};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub database: DatabaseSettings,
    #[serde(default)]
    pub paths: PathSettings,
    pub hypervisor: HypervisorSettings,
    #[serde(default)]
    pub builds: BuildSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub license: LicenseSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_install_dir() -> PathBuf {
    PathBuf::from("/opt/labrange")
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathSettings {
    /// Root of the installation; tenant workspaces live under `<install_dir>/users`
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            install_dir: default_install_dir(),
        }
    }
}

fn default_hypervisor_url() -> String {
    "https://127.0.0.1:8006".to_string()
}

fn default_invalid_cert() -> bool {
    true
}

fn default_storage_pool() -> String {
    "local".to_string()
}

fn default_storage_format() -> String {
    "qcow2".to_string()
}

fn default_nat_interface() -> String {
    "vmbr0".to_string()
}

/// Connection parameters of the hypervisor node that builds and ranges run against
#[derive(Debug, Deserialize, Clone)]
pub struct HypervisorSettings {
    pub node: String,
    #[serde(default = "default_hypervisor_url")]
    pub url: String,
    /// Defaults to `node` when unset
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default = "default_invalid_cert")]
    pub invalid_cert: bool,
    #[serde(default = "default_storage_pool")]
    pub vm_storage_pool: String,
    #[serde(default = "default_storage_format")]
    pub vm_storage_format: String,
    #[serde(default = "default_storage_pool")]
    pub iso_storage_pool: String,
    #[serde(default = "default_nat_interface")]
    pub nat_interface: String,
    /// API token used to list template VMs (`user@realm!tokenid=secret`)
    #[serde(default)]
    pub api_token: Option<String>,
}

impl HypervisorSettings {
    pub fn hostname(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.node)
    }
}

fn default_launch_spacing() -> u64 {
    3
}

fn default_cancel_window() -> u64 {
    10
}

fn default_max_parallelism() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuildSettings {
    /// Delay in seconds between two build admissions (default: 3)
    #[serde(default = "default_launch_spacing")]
    pub launch_spacing_secs: u64,

    /// Freshness window in seconds of the abort canary file (default: 10)
    #[serde(default = "default_cancel_window")]
    pub cancel_window_secs: u64,

    /// Upper bound for the per-request parallelism (default: 16)
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
}

impl BuildSettings {
    pub fn launch_spacing(&self) -> Duration {
        Duration::from_secs(self.launch_spacing_secs)
    }

    pub fn cancel_window(&self) -> Duration {
        Duration::from_secs(self.cancel_window_secs)
    }
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            launch_spacing_secs: default_launch_spacing(),
            cancel_window_secs: default_cancel_window(),
            max_parallelism: default_max_parallelism(),
        }
    }
}

fn default_max_capture_bytes() -> usize {
    16 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExecutorSettings {
    /// Bytes of process output kept in memory; the log file always has everything
    #[serde(default = "default_max_capture_bytes")]
    pub max_capture_bytes: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_capture_bytes: default_max_capture_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LicenseSettings {
    /// Exposed to playbooks as `enterprise_license`
    #[serde(default)]
    pub enterprise: bool,
}

impl Settings {
    /// Substitute environment variables in a string value
    /// Replaces ${VAR_NAME} or ${VAR_NAME:-default} with environment variable values
    fn substitute_env_vars_in_string(s: &str) -> String {
        lazy_static::lazy_static! {
            static ref ENV_VAR_RE: regex::Regex =
                regex::Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("valid regex");
        }

        ENV_VAR_RE
            .replace_all(s, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map(|m| m.as_str());

                match env::var(var_name) {
                    Ok(val) => val,
                    Err(_) => default_value.unwrap_or("").to_string(),
                }
            })
            .to_string()
    }

    /// Convert a config::Value to a serde_json::Value, performing environment variable substitution
    fn config_value_to_json(value: &config::Value) -> serde_json::Value {
        use config::ValueKind;

        match &value.kind {
            ValueKind::Nil => serde_json::Value::Null,
            ValueKind::Boolean(b) => serde_json::Value::Bool(*b),
            ValueKind::I64(i) => serde_json::Value::Number((*i).into()),
            ValueKind::I128(i) => serde_json::Value::Number((*i as i64).into()),
            ValueKind::U64(u) => serde_json::Value::Number((*u).into()),
            ValueKind::U128(u) => serde_json::Value::Number((*u as u64).into()),
            ValueKind::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueKind::String(s) => {
                serde_json::Value::String(Self::substitute_env_vars_in_string(s))
            }
            ValueKind::Table(table) => {
                let mut map = serde_json::Map::new();
                for (k, v) in table.iter() {
                    map.insert(k.clone(), Self::config_value_to_json(v));
                }
                serde_json::Value::Object(map)
            }
            ValueKind::Array(arr) => {
                let vec: Vec<serde_json::Value> =
                    arr.iter().map(Self::config_value_to_json).collect();
                serde_json::Value::Array(vec)
            }
        }
    }

    /// Try to add a config file with multiple extension attempts (.toml, .yaml, .yml)
    /// Returns Ok(true) if a file was loaded, Ok(false) if no file found (when not required)
    fn try_add_config_file(
        builder: &mut config::ConfigBuilder<config::builder::DefaultState>,
        config_dir: &str,
        name: &str,
        required: bool,
    ) -> Result<bool, ConfigError> {
        let extensions = ["toml", "yaml", "yml"];

        for ext in extensions {
            let path = format!("{}/{}.{}", config_dir, name, ext);
            if std::path::Path::new(&path).exists() {
                tracing::info!("Loading config file: {}", path);
                *builder = builder
                    .clone()
                    .add_source(config::File::with_name(&format!("{}/{}", config_dir, name)));
                return Ok(true);
            }
        }

        if required {
            Err(ConfigError::Message(format!(
                "Required config file not found: {}/{}.{{toml,yaml,yml}}",
                config_dir, name
            )))
        } else {
            tracing::debug!(
                "Optional config file not found: {}/{}.{{toml,yaml,yml}}",
                config_dir,
                name
            );
            Ok(false)
        }
    }

    pub fn new() -> Result<Self, ConfigError> {
        let run_mode =
            env::var("LABRANGE_CONFIG_RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = env::var("LABRANGE_CONFIG_DIR").unwrap_or_else(|_| "config".into());

        let mut settings = Self::load(&config_dir, &run_mode)?;

        // DATABASE_URL takes precedence over the config files
        if let Ok(database_url) = env::var("DATABASE_URL") {
            if !database_url.is_empty() {
                settings.database.url = database_url;
            }
        }

        if settings.database.url.is_empty() {
            return Err(ConfigError::Message(
                "Database URL not configured. Set DATABASE_URL environment variable or [database] url in config".to_string()
            ));
        }

        Ok(settings)
    }

    /// Load `default`, `<run_mode>` and `local` from `config_dir`, later files winning
    pub fn load(config_dir: &str, run_mode: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        Self::try_add_config_file(&mut builder, config_dir, "default", true)?;
        Self::try_add_config_file(&mut builder, config_dir, run_mode, false)?;
        Self::try_add_config_file(&mut builder, config_dir, "local", false)?;

        let config = builder.build()?;

        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;

        let mut json_map = serde_json::Map::new();
        for (k, v) in root_value.iter() {
            json_map.insert(k.clone(), Self::config_value_to_json(v));
        }
        let json_value = serde_json::Value::Object(json_map);

        let mut unused_fields = Vec::new();
        let settings: Settings = serde_ignored::deserialize(json_value, |path| {
            unused_fields.push(path.to_string());
        })
        .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field in backend config: {}", field);
        }

        if settings.builds.max_parallelism == 0 {
            return Err(ConfigError::Message(
                "builds.max_parallelism must be at least 1".to_string(),
            ));
        }

        Ok(settings)
    }
}
