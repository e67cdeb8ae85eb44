//! systemd unit definition for the managed service

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use strum::{Display, EnumString};

/// Directory systemd reads administrator-provided units from
pub const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

/// `Restart=` policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Always,
    OnFailure,
    No,
}

/// Fields of a `[Unit]`/`[Service]`/`[Install]` service file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDefinition {
    /// Unit name without the `.service` suffix
    pub name: String,
    pub description: String,
    pub exec_start: String,
    pub working_directory: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_file: Option<PathBuf>,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default = "default_restart_sec")]
    pub restart_sec: u32,
}

fn default_restart_sec() -> u32 {
    10
}

impl UnitDefinition {
    pub fn unit_name(&self) -> String {
        format!("{}.service", self.name)
    }

    pub fn default_path(&self) -> PathBuf {
        PathBuf::from(SYSTEMD_UNIT_DIR).join(self.unit_name())
    }

    /// Render the unit file. Output is deterministic, so comparing rendered
    /// text with the file on disk is a valid up-to-date check.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[Unit]");
        let _ = writeln!(out, "Description={}", self.description);
        let _ = writeln!(out, "After=network.target");
        let _ = writeln!(out);
        let _ = writeln!(out, "[Service]");
        let _ = writeln!(out, "Type=simple");
        if let Some(user) = &self.user {
            let _ = writeln!(out, "User={}", user);
        }
        let _ = writeln!(out, "WorkingDirectory={}", self.working_directory.display());
        if let Some(env_file) = &self.environment_file {
            let _ = writeln!(out, "EnvironmentFile={}", env_file.display());
        }
        let _ = writeln!(out, "ExecStart={}", self.exec_start);
        let _ = writeln!(out, "Restart={}", self.restart);
        let _ = writeln!(out, "RestartSec={}", self.restart_sec);
        let _ = writeln!(out, "StandardOutput=journal");
        let _ = writeln!(out, "StandardError=journal");
        let _ = writeln!(out);
        let _ = writeln!(out, "[Install]");
        let _ = writeln!(out, "WantedBy=multi-user.target");
        out
    }
}
