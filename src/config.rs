//! Supervisor configuration and the layered settings it is derived from.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "webpack.config.js";
pub const DEFAULT_BUILD_TOOL: &str = "webpack";
pub const PROJECT_SETTINGS_FILE: &str = ".watch-runner.json";

/// One field of a configuration update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Patch<T> {
    /// Keep the current value
    Unchanged,
    /// Remove the current value
    Clear,
    /// Replace the current value
    Set(T),
}

impl<T> Default for Patch<T> {
    fn default() -> Self {
        Patch::Unchanged
    }
}

impl<T> Patch<T> {
    /// A freshly read setting: present sets, absent clears.
    pub fn from_setting(value: Option<T>) -> Self {
        match value {
            Some(value) => Patch::Set(value),
            None => Patch::Clear,
        }
    }

    fn apply(self, slot: &mut Option<T>) {
        match self {
            Patch::Unchanged => {}
            Patch::Clear => *slot = None,
            Patch::Set(value) => *slot = Some(value),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    pub working_directory: Option<PathBuf>,
    /// Relative to `working_directory`.
    pub config_file: Option<PathBuf>,
}

impl Configuration {
    pub fn merge(&mut self, patch: ConfigPatch) {
        patch.working_directory.apply(&mut self.working_directory);
        patch.config_file.apply(&mut self.config_file);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigPatch {
    pub working_directory: Patch<PathBuf>,
    pub config_file: Patch<PathBuf>,
}

/// One layer of settings as stored on disk or given on the command line.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsLayer {
    pub execution_directory: Option<String>,
    pub config_file: Option<String>,
    pub start_on_activation: Option<bool>,
    pub build_tool: Option<String>,
}

impl SettingsLayer {
    fn read(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings {}", path.display()))?;
        let layer = serde_json::from_str(&text)
            .with_context(|| format!("Invalid settings file {}", path.display()))?;
        Ok(Some(layer))
    }

    fn overlay(&mut self, other: SettingsLayer) {
        if other.execution_directory.is_some() {
            self.execution_directory = other.execution_directory;
        }
        if other.config_file.is_some() {
            self.config_file = other.config_file;
        }
        if other.start_on_activation.is_some() {
            self.start_on_activation = other.start_on_activation;
        }
        if other.build_tool.is_some() {
            self.build_tool = other.build_tool;
        }
    }
}

/// Read-only settings source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    project_dir: Option<PathBuf>,
    execution_directory: Option<String>,
    config_file: String,
    start_on_activation: bool,
    build_tool: String,
}

impl Settings {
    /// Defaults, then the user settings file, then the project file, then `overrides`.
    pub fn load(project_dir: Option<&Path>, overrides: SettingsLayer) -> Result<Self> {
        let mut layers = Vec::new();
        if let Some(dir) = dirs::config_dir() {
            layers.extend(SettingsLayer::read(&dir.join("watch-runner").join("settings.json"))?);
        }
        if let Some(dir) = project_dir {
            layers.extend(SettingsLayer::read(&dir.join(PROJECT_SETTINGS_FILE))?);
        }
        layers.push(overrides);
        Ok(Self::from_layers(project_dir, layers))
    }

    pub fn from_layers(
        project_dir: Option<&Path>,
        layers: impl IntoIterator<Item = SettingsLayer>,
    ) -> Self {
        let mut merged = SettingsLayer::default();
        for layer in layers {
            merged.overlay(layer);
        }
        Settings {
            project_dir: project_dir.map(Path::to_path_buf),
            execution_directory: merged.execution_directory,
            config_file: merged
                .config_file
                .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string()),
            start_on_activation: merged.start_on_activation.unwrap_or(true),
            build_tool: merged
                .build_tool
                .unwrap_or_else(|| DEFAULT_BUILD_TOOL.to_string()),
        }
    }

    /// The execution directory, or the project directory when it is unset or empty.
    pub fn working_directory(&self) -> Option<PathBuf> {
        match self.execution_directory.as_deref() {
            Some(dir) if !dir.is_empty() => {
                let dir = Path::new(dir);
                match &self.project_dir {
                    Some(project) if dir.is_relative() => Some(project.join(dir)),
                    _ => Some(dir.to_path_buf()),
                }
            }
            _ => self.project_dir.clone(),
        }
    }

    /// `None` when configured as an empty string.
    pub fn config_file(&self) -> Option<PathBuf> {
        if self.config_file.is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.config_file))
        }
    }

    pub fn start_on_activation(&self) -> bool {
        self.start_on_activation
    }

    pub fn build_tool(&self) -> &str {
        &self.build_tool
    }

    /// Whether autostart should fire: enabled, and the config file is present.
    pub fn should_autostart(&self) -> bool {
        if !self.start_on_activation() {
            return false;
        }
        match (self.working_directory(), self.config_file()) {
            (Some(dir), Some(file)) => dir.join(file).exists(),
            _ => false,
        }
    }

    /// Every field is restated, so a setting that disappeared clears its value.
    pub fn to_patch(&self) -> ConfigPatch {
        ConfigPatch {
            working_directory: Patch::from_setting(self.working_directory()),
            config_file: Patch::from_setting(self.config_file()),
        }
    }
}
