//! Distribution configuration.
//!
//! [`DistributionConfig`] is immutable once built. Options accumulate on a
//! [`DistributionConfigBuilder`], either through the fluent API or from a TOML
//! file, and are validated only in [`DistributionConfigBuilder::build`].

use crate::error::{HarnessError, Result};
use crate::installation::{Installation, InstallationBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// `group:artifact` of the reference distribution looked up in the repository.
pub const DEFAULT_HOME_ARTIFACT: &str = "org.distribution:server-home";
/// Launcher executable, relative to the home directory.
pub const DEFAULT_LAUNCHER: &str = "bin/server";
/// Deployment directory, relative to the base directory.
pub const DEFAULT_DEPLOY_DIR: &str = "webapps";

/// Validated, immutable configuration for one distribution under test.
#[derive(Debug, Clone, Serialize)]
pub struct DistributionConfig {
    server_version: String,
    repository_path: PathBuf,
    options: BTreeMap<String, String>,
    home: Option<PathBuf>,
    base: Option<PathBuf>,
    home_artifact: String,
    launcher: PathBuf,
    launcher_args: Vec<String>,
    env: BTreeMap<String, String>,
    deploy_dir: String,
}

impl DistributionConfig {
    pub fn builder() -> DistributionConfigBuilder {
        DistributionConfigBuilder::new()
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn repository_path(&self) -> &Path {
        &self.repository_path
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub fn home(&self) -> Option<&Path> {
        self.home.as_deref()
    }

    pub fn base(&self) -> Option<&Path> {
        self.base.as_deref()
    }

    pub fn home_artifact(&self) -> &str {
        &self.home_artifact
    }

    pub fn launcher(&self) -> &Path {
        &self.launcher
    }

    pub fn launcher_args(&self) -> &[String] {
        &self.launcher_args
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn deploy_dir(&self) -> &str {
        &self.deploy_dir
    }

    /// Extra options rendered as `key=value` launch arguments.
    pub fn option_args(&self) -> Vec<String> {
        self.options
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }
}

/// Builder for [`DistributionConfig`].
///
/// Doubles as the TOML schema: every field is optional on disk and checked
/// at build time, exactly like the fluent setters.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DistributionConfigBuilder {
    server_version: Option<String>,
    repository_path: Option<PathBuf>,
    options: BTreeMap<String, String>,
    home: Option<PathBuf>,
    base: Option<PathBuf>,
    home_artifact: Option<String>,
    launcher: Option<PathBuf>,
    launcher_args: Vec<String>,
    env: BTreeMap<String, String>,
    deploy_dir: Option<String>,
}

impl DistributionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse builder options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read builder options from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;
        Self::from_toml_str(&text)
    }

    /// Version of the server distribution (required).
    pub fn server_version(mut self, version: &str) -> Self {
        self.server_version = Some(version.to_string());
        self
    }

    /// Local artifact repository root (required).
    pub fn repository_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.repository_path = Some(path.into());
        self
    }

    /// Extra option forwarded to every launch as `key=value`.
    pub fn option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }

    /// Use this reference distribution instead of resolving one.
    pub fn home(mut self, path: impl Into<PathBuf>) -> Self {
        self.home = Some(path.into());
        self
    }

    /// Provision into this directory instead of a fresh temp dir.
    pub fn base(mut self, path: impl Into<PathBuf>) -> Self {
        self.base = Some(path.into());
        self
    }

    /// `group:artifact` of the reference distribution.
    pub fn home_artifact(mut self, coordinates: &str) -> Self {
        self.home_artifact = Some(coordinates.to_string());
        self
    }

    /// Launcher path relative to the home directory.
    pub fn launcher(mut self, path: impl Into<PathBuf>) -> Self {
        self.launcher = Some(path.into());
        self
    }

    /// Argument placed before options and caller arguments on every launch.
    pub fn launcher_arg(mut self, arg: &str) -> Self {
        self.launcher_args.push(arg.to_string());
        self
    }

    /// Environment variable for the launched process.
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Deployment directory relative to the base.
    pub fn deploy_dir(mut self, dir: &str) -> Self {
        self.deploy_dir = Some(dir.to_string());
        self
    }

    pub fn build(self) -> Result<DistributionConfig> {
        let server_version = self
            .server_version
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| HarnessError::Configuration("server version is required".into()))?;
        let repository_path = self
            .repository_path
            .ok_or_else(|| HarnessError::Configuration("repository path is required".into()))?;

        let launcher = self.launcher.unwrap_or_else(|| PathBuf::from(DEFAULT_LAUNCHER));
        if !is_contained(&launcher) {
            return Err(HarnessError::Configuration(format!(
                "launcher must be relative to the home directory: {}",
                launcher.display()
            )));
        }

        let deploy_dir = self
            .deploy_dir
            .unwrap_or_else(|| DEFAULT_DEPLOY_DIR.to_string());
        if deploy_dir.is_empty() || !is_contained(Path::new(&deploy_dir)) {
            return Err(HarnessError::Configuration(format!(
                "deploy dir must be relative to the base directory: {:?}",
                deploy_dir
            )));
        }

        let home_artifact = self
            .home_artifact
            .unwrap_or_else(|| DEFAULT_HOME_ARTIFACT.to_string());
        if home_artifact.split(':').count() != 2 {
            return Err(HarnessError::Configuration(format!(
                "home artifact must be group:artifact, got {:?}",
                home_artifact
            )));
        }

        Ok(DistributionConfig {
            server_version,
            repository_path,
            options: self.options,
            home: self.home,
            base: self.base,
            home_artifact,
            launcher,
            launcher_args: self.launcher_args,
            env: self.env,
            deploy_dir,
        })
    }

    /// Validate and provision an installation in one step.
    pub fn build_installation(self) -> Result<Installation> {
        InstallationBuilder::new(self.build()?).build()
    }
}

/// True for non-empty relative paths that cannot climb out of their root.
pub(crate) fn is_contained(path: &Path) -> bool {
    path.components().next().is_some()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_version() {
        let err = DistributionConfig::builder()
            .repository_path("/tmp/repo")
            .build()
            .unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(_)));
        assert!(err.to_string().contains("server version"));
    }

    #[test]
    fn test_build_requires_repository() {
        let err = DistributionConfig::builder()
            .server_version("1.0.0")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("repository path"));
    }

    #[test]
    fn test_defaults_and_option_args() {
        let config = DistributionConfig::builder()
            .server_version("1.0.0")
            .repository_path("/tmp/repo")
            .option("http.port", "8080")
            .option("a.b", "c")
            .build()
            .unwrap();
        assert_eq!(config.launcher(), Path::new(DEFAULT_LAUNCHER));
        assert_eq!(config.deploy_dir(), DEFAULT_DEPLOY_DIR);
        assert_eq!(config.home_artifact(), DEFAULT_HOME_ARTIFACT);
        // BTreeMap keeps forwarded options in a stable order.
        assert_eq!(config.option_args(), vec!["a.b=c", "http.port=8080"]);
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let base = || {
            DistributionConfig::builder()
                .server_version("1.0.0")
                .repository_path("/tmp/repo")
        };
        assert!(base().launcher("/usr/bin/env").build().is_err());
        assert!(base().deploy_dir("../elsewhere").build().is_err());
        assert!(base().home_artifact("no-group").build().is_err());
    }

    #[test]
    fn test_from_toml_str() {
        let builder = DistributionConfigBuilder::from_toml_str(
            r#"
            server_version = "2.1.0"
            repository_path = "/srv/repo"
            launcher_args = ["-v"]

            [options]
            "http.port" = "9090"

            [env]
            LANG = "C"
            "#,
        )
        .unwrap();
        let config = builder.build().unwrap();
        assert_eq!(config.server_version(), "2.1.0");
        assert_eq!(config.repository_path(), Path::new("/srv/repo"));
        assert_eq!(config.launcher_args(), ["-v".to_string()]);
        assert_eq!(config.env().get("LANG").map(String::as_str), Some("C"));
        assert_eq!(config.option_args(), vec!["http.port=9090"]);
    }

    #[test]
    fn test_from_toml_validates_at_build() {
        let builder = DistributionConfigBuilder::from_toml_str("server_version = \"1\"").unwrap();
        assert!(builder.build().is_err());
        assert!(DistributionConfigBuilder::from_toml_str("bogus = 1").is_err());
    }
}
