//! Provisioning configuration and built-in profiles.
//!
//! A [`ProvisionConfig`] is plain data loaded from JSON. The plan builder
//! turns it into steps; nothing here runs commands.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use strum::{Display, EnumIter, EnumString};

use crate::step::FailurePolicy;
use crate::unit_file::{RestartPolicy, UnitDefinition};

/// A program and its arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandLine {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Vendor installer downloaded when the primary install method fails
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackInstaller {
    /// HTTPS URL of the installer artifact
    pub url: String,
    /// File name the artifact is saved under
    pub file_name: String,
    /// Silent-install flags
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Version probe, e.g. `python3 --version`
    pub probe: CommandLine,
    pub primary_install: CommandLine,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackInstaller>,
    /// Shown to the user when nothing automatic worked
    pub manual_url: String,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default = "default_install_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSetConfig {
    /// Interpreter used as `<python> -m pip`
    pub python: String,
    /// Package name -> pinned version (null for any)
    pub packages: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default = "default_install_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvFileConfig {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PathBuf>,
    /// Values that mean "not filled in yet"
    #[serde(default)]
    pub placeholders: Vec<String>,
    #[serde(default = "continue_policy")]
    pub on_failure: FailurePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub unit: UnitDefinition,
    /// Overrides `/etc/systemd/system/<name>.service`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_path: Option<PathBuf>,
    #[serde(default = "default_systemctl")]
    pub systemctl: String,
    #[serde(default = "default_service_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

impl ServiceConfig {
    pub fn unit_path(&self) -> PathBuf {
        self.unit_path
            .clone()
            .unwrap_or_else(|| self.unit.default_path())
    }
}

fn default_install_timeout() -> u64 {
    900
}

fn default_service_timeout() -> u64 {
    60
}

fn default_systemctl() -> String {
    "systemctl".to_string()
}

fn continue_policy() -> FailurePolicy {
    FailurePolicy::Continue
}

/// Everything needed to build a provisioning plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionConfig {
    pub runtime: RuntimeConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packages: Option<PackageSetConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<EnvFileConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceConfig>,
    /// Directories added to PATH once they exist (installer targets)
    #[serde(default)]
    pub extra_path_dirs: Vec<PathBuf>,
}

impl ProvisionConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Write a starting configuration for `botstrap init`. An existing file
    /// is only replaced when `overwrite` is set.
    pub fn init_file<P: AsRef<Path>>(&self, path: P, overwrite: bool) -> Result<()> {
        let path = path.as_ref();
        if path.exists() && !overwrite {
            anyhow::bail!("{:?} already exists; pass --force to replace it", path);
        }
        self.save_to_file(path)
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let runtime = &self.runtime;
        if runtime.probe.program.trim().is_empty() {
            anyhow::bail!("Runtime probe program must be specified");
        }
        if runtime.primary_install.program.trim().is_empty() {
            anyhow::bail!("Runtime install program must be specified");
        }
        if runtime.timeout_secs == 0 {
            anyhow::bail!("Runtime timeout must be positive");
        }
        // every retry would download and run the fallback installer again
        if matches!(runtime.on_failure, FailurePolicy::Retry(_)) {
            anyhow::bail!(
                "Runtime step does not support a retry policy; use abort-plan or continue"
            );
        }
        if let Some(fallback) = &runtime.fallback {
            if !fallback.url.starts_with("https://") {
                anyhow::bail!("Fallback installer URL must use https://");
            }
            if fallback.file_name.trim().is_empty()
                || fallback.file_name.contains(['/', '\\'])
            {
                anyhow::bail!("Fallback installer file name must be a plain file name");
            }
        }

        if let Some(packages) = &self.packages {
            if packages.python.trim().is_empty() {
                anyhow::bail!("Package interpreter must be specified");
            }
            if packages.timeout_secs == 0 {
                anyhow::bail!("Package install timeout must be positive");
            }
            for (name, version) in &packages.packages {
                if name.trim().is_empty() || name.contains(char::is_whitespace) {
                    anyhow::bail!("Invalid package name {:?}", name);
                }
                if version.as_deref().is_some_and(|v| v.trim().is_empty()) {
                    anyhow::bail!("Package {} has an empty version pin", name);
                }
            }
        }

        if let Some(env_file) = &self.env_file {
            if env_file.path.as_os_str().is_empty() {
                anyhow::bail!("Env file path must be specified");
            }
        }

        if let Some(service) = &self.service {
            let unit = &service.unit;
            if unit.name.trim().is_empty() {
                anyhow::bail!("Service name must be specified");
            }
            if !unit
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
            {
                anyhow::bail!(
                    "Service name can only contain letters, numbers, '-', '_', '.' and '@'"
                );
            }
            if unit.exec_start.trim().is_empty() {
                anyhow::bail!("Service ExecStart must be specified");
            }
            if !unit.working_directory.is_absolute() {
                anyhow::bail!("Service working directory must be an absolute path");
            }
            // systemd rejects multi-line values in unit settings
            if [&unit.description, &unit.exec_start]
                .iter()
                .any(|v| v.contains('\n'))
            {
                anyhow::bail!("Service description and ExecStart must be single lines");
            }
            if service.timeout_secs == 0 {
                anyhow::bail!("Service timeout must be positive");
            }
        }

        Ok(())
    }
}

/// Built-in configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum Profile {
    /// Linux host running the Telegram bot as a systemd service
    LinuxService,
    /// Windows workstation that only needs Python and the bot's packages
    WindowsRuntime,
}

const BOT_DIR: &str = "/opt/telegram-bot";
const PYTHON_DOWNLOADS: &str = "https://www.python.org/downloads/";
const ENV_PLACEHOLDERS: [&str; 2] = ["YOUR_TOKEN_HERE", "YOUR_ORG_ID_HERE"];

fn bot_packages(python: &str) -> PackageSetConfig {
    let packages = [
        ("requests", None),
        ("python-telegram-bot", Some("21.0")),
        ("python-dotenv", Some("1.0.1")),
    ]
    .into_iter()
    .map(|(name, version)| (name.to_string(), version.map(str::to_string)))
    .collect();
    PackageSetConfig {
        python: python.to_string(),
        packages,
        extra_args: Vec::new(),
        on_failure: FailurePolicy::Retry(1),
        timeout_secs: default_install_timeout(),
    }
}

fn env_file(path: PathBuf, template: PathBuf) -> EnvFileConfig {
    EnvFileConfig {
        path,
        template: Some(template),
        placeholders: ENV_PLACEHOLDERS.iter().map(|p| p.to_string()).collect(),
        on_failure: FailurePolicy::Continue,
    }
}

impl Profile {
    pub fn config(self) -> ProvisionConfig {
        match self {
            Profile::LinuxService => linux_service(),
            Profile::WindowsRuntime => windows_runtime(),
        }
    }
}

fn linux_service() -> ProvisionConfig {
    let bot_dir = PathBuf::from(BOT_DIR);
    ProvisionConfig {
        runtime: RuntimeConfig {
            probe: CommandLine::new("python3", ["--version"]),
            primary_install: CommandLine::new(
                "sh",
                [
                    "-c",
                    "apt-get update && apt-get install -y python3 python3-pip",
                ],
            ),
            fallback: None,
            manual_url: PYTHON_DOWNLOADS.to_string(),
            on_failure: FailurePolicy::Abort,
            timeout_secs: default_install_timeout(),
        },
        packages: Some(bot_packages("python3")),
        env_file: Some(env_file(bot_dir.join(".env"), bot_dir.join(".env.example"))),
        service: Some(ServiceConfig {
            unit: UnitDefinition {
                name: "telegram-bot".to_string(),
                description: "Telegram Tracker Bot".to_string(),
                exec_start: format!("/usr/bin/python3 {}/bot.py", BOT_DIR),
                working_directory: bot_dir.clone(),
                user: None,
                environment_file: Some(bot_dir.join(".env")),
                restart: RestartPolicy::Always,
                restart_sec: 10,
            },
            unit_path: None,
            systemctl: default_systemctl(),
            timeout_secs: default_service_timeout(),
            on_failure: FailurePolicy::Abort,
        }),
        extra_path_dirs: Vec::new(),
    }
}

fn windows_runtime() -> ProvisionConfig {
    let install_dir = PathBuf::from(r"C:\Program Files\Python312");
    ProvisionConfig {
        runtime: RuntimeConfig {
            probe: CommandLine::new("python", ["--version"]),
            primary_install: CommandLine::new(
                "winget",
                [
                    "install",
                    "-e",
                    "--id",
                    "Python.Python.3.12",
                    "--silent",
                    "--accept-package-agreements",
                    "--accept-source-agreements",
                ],
            ),
            fallback: Some(FallbackInstaller {
                url: "https://www.python.org/ftp/python/3.12.0/python-3.12.0-amd64.exe"
                    .to_string(),
                file_name: "python-3.12.0-amd64.exe".to_string(),
                args: ["/quiet", "InstallAllUsers=1", "PrependPath=1", "Include_pip=1"]
                    .iter()
                    .map(|a| a.to_string())
                    .collect(),
            }),
            manual_url: PYTHON_DOWNLOADS.to_string(),
            on_failure: FailurePolicy::Abort,
            timeout_secs: default_install_timeout(),
        },
        packages: Some(bot_packages("python")),
        env_file: Some(env_file(PathBuf::from(".env"), PathBuf::from(".env.example"))),
        service: None,
        extra_path_dirs: vec![install_dir.join("Scripts"), install_dir],
    }
}
