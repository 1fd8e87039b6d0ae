//! Artifact coordinates, repository resolution and copying into a base.

use crate::error::{HarnessError, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

/// Extension used for exploded (directory) artifacts; it adds no file suffix.
pub const DIRECTORY_EXTENSION: &str = "dir";

const DEFAULT_EXTENSION: &str = "jar";

/// `group:artifact[:extension[:classifier]]:version`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactCoordinates {
    pub group: String,
    pub artifact: String,
    pub extension: String,
    pub classifier: Option<String>,
    pub version: String,
}

impl ArtifactCoordinates {
    pub fn parse(coordinates: &str) -> Result<Self> {
        let parts: Vec<&str> = coordinates.split(':').collect();
        let malformed = || HarnessError::ArtifactNotFound {
            coordinates: coordinates.to_string(),
            path: PathBuf::new(),
        };
        if parts.iter().any(|p| p.trim().is_empty()) {
            return Err(malformed());
        }

        let (group, artifact, extension, classifier, version) = match parts.as_slice() {
            [g, a, v] => (*g, *a, DEFAULT_EXTENSION, None, *v),
            [g, a, e, v] => (*g, *a, *e, None, *v),
            [g, a, e, c, v] => (*g, *a, *e, Some(*c), *v),
            _ => return Err(malformed()),
        };

        Ok(Self {
            group: group.to_string(),
            artifact: artifact.to_string(),
            extension: extension.to_string(),
            classifier: classifier.map(str::to_string),
            version: version.to_string(),
        })
    }

    pub fn is_directory(&self) -> bool {
        self.extension == DIRECTORY_EXTENSION
    }

    /// Location of this artifact inside a local repository.
    pub fn repository_path(&self, repository: &Path) -> PathBuf {
        let mut path = repository.to_path_buf();
        for segment in self.group.split('.') {
            path.push(segment);
        }
        path.push(&self.artifact);
        path.push(&self.version);

        let mut file_name = format!("{}-{}", self.artifact, self.version);
        if let Some(classifier) = &self.classifier {
            file_name.push('-');
            file_name.push_str(classifier);
        }
        if !self.is_directory() {
            file_name.push('.');
            file_name.push_str(&self.extension);
        }
        path.push(file_name);
        path
    }

    /// Resolve against a repository, failing if nothing is there.
    pub fn resolve(&self, repository: &Path) -> Result<PathBuf> {
        let path = self.repository_path(repository);
        let present = if self.is_directory() {
            path.is_dir()
        } else {
            path.is_file()
        };
        if !present {
            return Err(HarnessError::ArtifactNotFound {
                coordinates: self.to_string(),
                path,
            });
        }
        Ok(path)
    }
}

impl fmt::Display for ArtifactCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.group, self.artifact, self.extension)?;
        if let Some(classifier) = &self.classifier {
            write!(f, ":{}", classifier)?;
        }
        write!(f, ":{}", self.version)
    }
}

impl FromStr for ArtifactCoordinates {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Copy `src` into `deploy_dir` under the logical `name`.
///
/// Directories land at `<deploy>/<name>/`, files at `<deploy>/<name>.<ext>`.
/// Anything previously installed under the same name is removed first.
pub(crate) fn install_into(deploy_dir: &Path, src: &Path, name: &str) -> Result<PathBuf> {
    let meta = fs::metadata(src).map_err(|e| HarnessError::io(src, e))?;
    fs::create_dir_all(deploy_dir).map_err(|e| HarnessError::io(deploy_dir, e))?;
    remove_previous(deploy_dir, name)?;

    if meta.is_dir() {
        let dest = deploy_dir.join(name);
        copy_tree(src, &dest)?;
        Ok(dest)
    } else {
        let dest = match src.extension() {
            Some(ext) => deploy_dir.join(format!("{}.{}", name, ext.to_string_lossy())),
            None => deploy_dir.join(name),
        };
        fs::copy(src, &dest).map_err(|e| HarnessError::io(&dest, e))?;
        Ok(dest)
    }
}

fn remove_previous(deploy_dir: &Path, name: &str) -> Result<()> {
    let entries = fs::read_dir(deploy_dir).map_err(|e| HarnessError::io(deploy_dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| HarnessError::io(deploy_dir, e))?;
        let is_file = entry.file_type().map(|t| !t.is_dir()).unwrap_or(false);
        if !is_previous_install(&entry.file_name().to_string_lossy(), name, is_file) {
            continue;
        }
        remove_path(&entry.path())?;
    }
    Ok(())
}

/// `name` itself, or a file `name.<ext>` with a single extension.
///
/// `demo.v2` and `demo.v2.war` belong to the distinct name `demo.v2`.
fn is_previous_install(file_name: &str, name: &str, is_file: bool) -> bool {
    if file_name == name {
        return true;
    }
    match file_name.strip_prefix(name).and_then(|rest| rest.strip_prefix('.')) {
        Some(ext) => is_file && !ext.is_empty() && !ext.contains('.'),
        None => false,
    }
}

/// Remove a file or a whole directory tree.
pub(crate) fn remove_path(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path).map_err(|e| HarnessError::io(path, e))?;
    if meta.is_dir() {
        fs::remove_dir_all(path).map_err(|e| HarnessError::io(path, e))
    } else {
        fs::remove_file(path).map_err(|e| HarnessError::io(path, e))
    }
}

/// Recursively copy `src` to `dest`, keeping file permissions.
pub(crate) fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| src.to_path_buf());
            HarnessError::io(path, e.into())
        })?;
        let Ok(relative) = entry.path().strip_prefix(src) else {
            continue;
        };
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| HarnessError::io(&target, e))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| HarnessError::io(parent, e))?;
            }
            fs::copy(entry.path(), &target).map_err(|e| HarnessError::io(&target, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let c = ArtifactCoordinates::parse("org.example:app:1.0").unwrap();
        assert_eq!(c.extension, "jar");
        assert_eq!(c.classifier, None);

        let c = ArtifactCoordinates::parse("org.example:app:war:1.0").unwrap();
        assert_eq!(c.extension, "war");
        assert_eq!(c.to_string(), "org.example:app:war:1.0");

        let c: ArtifactCoordinates = "org.example:app:zip:config:1.0".parse().unwrap();
        assert_eq!(c.classifier.as_deref(), Some("config"));
        assert_eq!(c.to_string(), "org.example:app:zip:config:1.0");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "a", "a:b", "a::1.0", "a:b:c:d:e:f"] {
            let err = ArtifactCoordinates::parse(bad).unwrap_err();
            assert!(matches!(err, HarnessError::ArtifactNotFound { .. }), "{bad}");
        }
    }

    #[test]
    fn test_repository_path_layout() {
        let repo = Path::new("/repo");
        let c = ArtifactCoordinates::parse("org.example.web:demo:war:2.0").unwrap();
        assert_eq!(
            c.repository_path(repo),
            Path::new("/repo/org/example/web/demo/2.0/demo-2.0.war")
        );

        let c = ArtifactCoordinates::parse("org.example:demo:dir:exploded:2.0").unwrap();
        assert_eq!(
            c.repository_path(repo),
            Path::new("/repo/org/example/demo/2.0/demo-2.0-exploded")
        );
    }

    #[test]
    fn test_resolve_missing_reports_path() {
        let repo = tempfile::tempdir().unwrap();
        let c = ArtifactCoordinates::parse("org.example:demo:war:1.0").unwrap();
        match c.resolve(repo.path()).unwrap_err() {
            HarnessError::ArtifactNotFound { path, .. } => {
                assert!(path.ends_with("org/example/demo/1.0/demo-1.0.war"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_install_replaces_same_name() {
        let scratch = tempfile::tempdir().unwrap();
        let deploy = scratch.path().join("webapps");

        let tree = scratch.path().join("tree");
        fs::create_dir_all(tree.join("WEB-INF")).unwrap();
        fs::write(tree.join("WEB-INF/web.xml"), "<web-app/>").unwrap();
        let installed = install_into(&deploy, &tree, "demo").unwrap();
        assert!(installed.join("WEB-INF/web.xml").is_file());

        let file = scratch.path().join("demo-1.0.war");
        fs::write(&file, "packed").unwrap();
        let installed = install_into(&deploy, &file, "demo").unwrap();
        assert_eq!(installed, deploy.join("demo.war"));
        assert!(!deploy.join("demo").exists());
        assert_eq!(fs::read_to_string(installed).unwrap(), "packed");
    }

    #[test]
    fn test_install_keeps_names_sharing_a_prefix() {
        let scratch = tempfile::tempdir().unwrap();
        let deploy = scratch.path().join("webapps");

        let tree = scratch.path().join("tree");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("index.html"), "hello").unwrap();
        let packed = scratch.path().join("app-1.0.war");
        fs::write(&packed, "packed").unwrap();

        let v2_dir = install_into(&deploy, &tree, "demo.v2").unwrap();
        let v2_war = install_into(&deploy, &packed, "demo.v2").unwrap();
        assert_eq!(v2_war, deploy.join("demo.v2.war"));
        assert!(!v2_dir.exists());
        let v2_dir = install_into(&deploy, &tree, "demo.v2").unwrap();
        fs::write(deploy.join("demo.v2.war"), "packed").unwrap();

        let demo = install_into(&deploy, &tree, "demo").unwrap();
        assert!(demo.join("index.html").is_file());
        assert!(v2_dir.join("index.html").is_file());
        assert!(v2_war.is_file());

        install_into(&deploy, &packed, "demo").unwrap();
        assert!(!demo.exists());
        assert!(deploy.join("demo.war").is_file());
        assert!(v2_dir.is_dir());
        assert!(v2_war.is_file());
    }

    #[test]
    fn test_previous_install_matching() {
        assert!(is_previous_install("demo", "demo", false));
        assert!(is_previous_install("demo.war", "demo", true));
        assert!(!is_previous_install("demo.war", "demo", false));
        assert!(!is_previous_install("demo.v2.war", "demo", true));
        assert!(!is_previous_install("demo2", "demo", false));
        assert!(!is_previous_install("demo.", "demo", true));
    }
}
