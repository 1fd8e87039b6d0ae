//! Provisioned server installations.
//!
//! An [`Installation`] pairs a read-only *home* (the reference distribution,
//! shared between installations) with a private *base* directory it owns.
//! Artifacts are installed into the base before a [`Run`] is started.
//!
//! Nothing is deleted implicitly. Call [`Installation::cleanup`] at teardown.

pub mod artifact;

use crate::config::{is_contained, DistributionConfig};
use crate::error::{HarnessError, Result};
use crate::port;
use crate::run::Run;
use artifact::ArtifactCoordinates;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Descriptor written into every base directory.
pub const DESCRIPTOR_FILE: &str = "distribution.toml";
/// Directory inside the home copied into each new base, when present.
pub const BASE_TEMPLATE_DIR: &str = "base-template";

/// Contents of [`DESCRIPTOR_FILE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationDescriptor {
    pub server_version: String,
    pub home: PathBuf,
    pub base: PathBuf,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl InstallationDescriptor {
    /// Read the descriptor from a base directory.
    pub fn load(base: &Path) -> Result<Self> {
        let path = base.join(DESCRIPTOR_FILE);
        let text = fs::read_to_string(&path).map_err(|e| HarnessError::io(&path, e))?;
        Ok(toml::from_str(&text)?)
    }

    fn save(&self) -> Result<()> {
        let path = self.base.join(DESCRIPTOR_FILE);
        let text = toml::to_string_pretty(self)?;
        fs::write(&path, text).map_err(|e| HarnessError::io(&path, e))
    }
}

/// Builds an [`Installation`] on disk from a validated configuration.
pub struct InstallationBuilder {
    config: DistributionConfig,
}

impl InstallationBuilder {
    pub fn new(config: DistributionConfig) -> Self {
        Self { config }
    }

    /// Provision the base directory synchronously.
    ///
    /// The reference distribution must exist and contain the launcher. A base
    /// created here is removed again if provisioning fails half way.
    pub fn build(self) -> Result<Installation> {
        let home = self.locate_home()?;

        let launcher = home.join(self.config.launcher());
        if !launcher.is_file() {
            return Err(HarnessError::Configuration(format!(
                "launcher {} not found in reference distribution",
                launcher.display()
            )));
        }

        let (base, created) = self.create_base()?;
        match self.populate(&home, &base) {
            Ok(()) => {
                tracing::info!(
                    home = %home.display(),
                    base = %base.display(),
                    version = self.config.server_version(),
                    "provisioned installation"
                );
                Ok(Installation {
                    config: self.config,
                    home,
                    base,
                })
            }
            Err(e) => {
                if created {
                    if let Err(cleanup) = fs::remove_dir_all(&base) {
                        tracing::warn!(base = %base.display(), %cleanup, "failed to remove partial base");
                    }
                }
                Err(e)
            }
        }
    }

    fn locate_home(&self) -> Result<PathBuf> {
        let home = match self.config.home() {
            Some(home) => home.to_path_buf(),
            None => {
                let coordinates = format!(
                    "{}:{}:{}",
                    self.config.home_artifact(),
                    artifact::DIRECTORY_EXTENSION,
                    self.config.server_version()
                );
                ArtifactCoordinates::parse(&coordinates)
                    .and_then(|c| c.resolve(self.config.repository_path()))
                    .map_err(|e| {
                        HarnessError::Configuration(format!(
                            "reference distribution cannot be located: {}",
                            e
                        ))
                    })?
            }
        };

        if !home.is_dir() {
            return Err(HarnessError::Configuration(format!(
                "reference distribution not found at {}",
                home.display()
            )));
        }
        fs::canonicalize(&home).map_err(|e| HarnessError::io(&home, e))
    }

    /// Returns the base and whether this call created it.
    fn create_base(&self) -> Result<(PathBuf, bool)> {
        match self.config.base() {
            Some(base) => {
                let existed = base.exists();
                if existed {
                    let mut entries = fs::read_dir(base).map_err(|e| HarnessError::io(base, e))?;
                    if entries.next().is_some() {
                        return Err(HarnessError::Configuration(format!(
                            "base directory {} is not empty",
                            base.display()
                        )));
                    }
                } else {
                    fs::create_dir_all(base).map_err(|e| HarnessError::io(base, e))?;
                }
                let base = fs::canonicalize(base).map_err(|e| HarnessError::io(base, e))?;
                Ok((base, !existed))
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("dist-base-")
                    .tempdir()
                    .map_err(|e| HarnessError::io(std::env::temp_dir(), e))?;
                Ok((dir.keep(), true))
            }
        }
    }

    fn populate(&self, home: &Path, base: &Path) -> Result<()> {
        let template = home.join(BASE_TEMPLATE_DIR);
        if template.is_dir() {
            artifact::copy_tree(&template, base)?;
        }

        let deploy = base.join(self.config.deploy_dir());
        fs::create_dir_all(&deploy).map_err(|e| HarnessError::io(&deploy, e))?;

        InstallationDescriptor {
            server_version: self.config.server_version().to_string(),
            home: home.to_path_buf(),
            base: base.to_path_buf(),
            options: self.config.options().clone(),
        }
        .save()
    }
}

/// A filesystem-resident copy of the distribution, owned by one test.
#[derive(Debug)]
pub struct Installation {
    config: DistributionConfig,
    home: PathBuf,
    base: PathBuf,
}

impl Installation {
    pub fn config(&self) -> &DistributionConfig {
        &self.config
    }

    /// Shared reference distribution. Never written to.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Owned base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn deploy_dir(&self) -> PathBuf {
        self.base.join(self.config.deploy_dir())
    }

    pub fn launcher(&self) -> PathBuf {
        self.home.join(self.config.launcher())
    }

    /// Join a base-relative path, refusing anything that escapes the base.
    pub fn resolve(&self, relative: impl AsRef<Path>) -> Result<PathBuf> {
        let relative = relative.as_ref();
        if !is_contained(relative) {
            return Err(HarnessError::io(
                relative,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "path must stay inside the base directory",
                ),
            ));
        }
        Ok(self.base.join(relative))
    }

    /// Free port for the server under test. See [`port::free_port`].
    pub fn free_port(&self) -> Result<u16> {
        port::free_port()
    }

    /// Locate an artifact in the configured repository.
    pub fn resolve_artifact(&self, coordinates: &str) -> Result<PathBuf> {
        ArtifactCoordinates::parse(coordinates)?.resolve(self.config.repository_path())
    }

    /// Resolve an artifact and install it under `name` in the deployment area.
    pub fn install_artifact(&self, coordinates: &str, name: &str) -> Result<PathBuf> {
        let src = self.resolve_artifact(coordinates)?;
        self.install_artifact_path(&src, name)
    }

    /// Install a local artifact file or exploded directory under `name`.
    pub fn install_artifact_path(&self, src: &Path, name: &str) -> Result<PathBuf> {
        check_name(name)?;
        let dest = artifact::install_into(&self.deploy_dir(), src, name)?;
        tracing::info!(src = %src.display(), dest = %dest.display(), "installed artifact");
        Ok(dest)
    }

    /// Copy a file or directory to a location relative to the base.
    pub fn install_base_resource(&self, src: &Path, relative_dest: &str) -> Result<PathBuf> {
        let dest = self.resolve(relative_dest)?;
        let meta = fs::metadata(src).map_err(|e| HarnessError::io(src, e))?;
        if meta.is_dir() {
            artifact::copy_tree(src, &dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| HarnessError::io(parent, e))?;
            }
            fs::copy(src, &dest).map_err(|e| HarnessError::io(&dest, e))?;
        }
        tracing::debug!(src = %src.display(), dest = %dest.display(), "installed base resource");
        Ok(dest)
    }

    /// Delete a file inside the base. Returns whether something was removed.
    pub fn remove_file(&self, relative: &str) -> Result<bool> {
        let path = self.resolve(relative)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(HarnessError::io(path, e)),
        }
    }

    /// Apply an arbitrary caller-supplied mutation before the next start.
    pub fn configure<F, E>(&self, hook: F) -> std::result::Result<(), E>
    where
        F: FnOnce(&Installation) -> std::result::Result<(), E>,
    {
        hook(self)
    }

    /// Launch the distribution with `args`.
    ///
    /// The command line is `launcher_args ++ options ++ args`, run from the
    /// base directory with `DIST_HOME` and `DIST_BASE` exported.
    pub fn start<I, S>(&self, args: I) -> Result<Run>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut argv: Vec<String> = self.config.launcher_args().to_vec();
        argv.extend(self.config.option_args());
        argv.extend(args.into_iter().map(|a| a.as_ref().to_string()));

        let launcher = self.launcher();
        let mut cmd = Command::new(&launcher);
        cmd.args(&argv)
            .current_dir(&self.base)
            .env("DIST_HOME", &self.home)
            .env("DIST_BASE", &self.base)
            .envs(self.config.env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        Run::spawn(cmd, launcher, argv)
    }

    /// Delete the base directory. The home is left untouched.
    pub fn cleanup(self) -> Result<()> {
        tracing::debug!(base = %self.base.display(), "removing installation");
        fs::remove_dir_all(&self.base).map_err(|e| HarnessError::io(&self.base, e))
    }
}

fn check_name(name: &str) -> Result<()> {
    let single = Path::new(name).components().count() == 1;
    if !single || !is_contained(Path::new(name)) || name == "." {
        return Err(HarnessError::io(
            name,
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "artifact name must be a single path component",
            ),
        ));
    }
    Ok(())
}
