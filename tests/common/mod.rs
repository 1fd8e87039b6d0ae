//! Shared fixtures for the distribution integration tests.
//!
//! Lays out a local repository holding a reference distribution whose
//! launcher is the `demo-server` binary, plus an exploded test webapp.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::Duration;

use distribution_tests::{logging, DistributionConfigBuilder};
use tempfile::TempDir;

pub const VERSION: &str = "1.2.3";
pub const WEBAPP: &str = "org.example:test-webapp:dir:1.2.3";
pub const GREETING: &str = "Hello GreetingsServlet";
pub const LAUNCHER: &str = env!("CARGO_BIN_EXE_demo-server");

pub const START_TIMEOUT: Duration = Duration::from_secs(10);
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Repo {
    pub dir: TempDir,
}

impl Repo {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn home(&self) -> PathBuf {
        self.path()
            .join("org/distribution/server-home")
            .join(VERSION)
            .join(format!("server-home-{}", VERSION))
    }

    /// Config with the required options filled in.
    pub fn config(&self) -> DistributionConfigBuilder {
        DistributionConfigBuilder::new()
            .server_version(VERSION)
            .repository_path(self.path())
    }
}

/// Create a fresh repository fixture.
pub fn repo() -> Repo {
    logging::init_for_tests();
    let repo = Repo {
        dir: tempfile::tempdir().expect("creating repository dir"),
    };

    let bin = repo.home().join("bin");
    fs::create_dir_all(&bin).unwrap();
    // Linked, not copied: exec of a freshly written copy races with forks
    // in sibling test threads (ETXTBSY).
    symlink(LAUNCHER, bin.join("server")).expect("linking launcher");

    let webapp = repo
        .path()
        .join("org/example/test-webapp")
        .join(VERSION)
        .join(format!("test-webapp-{}", VERSION));
    fs::create_dir_all(webapp.join("WEB-INF")).unwrap();
    fs::write(webapp.join("greetings"), format!("{}\n", GREETING)).unwrap();
    fs::write(webapp.join("index.html"), "<html>demo</html>").unwrap();
    fs::write(webapp.join("WEB-INF/server-web.xml"), "<configure/>").unwrap();

    repo
}

/// GET against localhost, returning (status, server header, body).
pub fn get(port: u16, path: &str) -> (u16, String, String) {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let response = client
        .get(format!("http://localhost:{}{}", port, path))
        .send()
        .expect("sending request");
    let status = response.status().as_u16();
    let server = response
        .headers()
        .get("server")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = response.text().expect("reading body");
    (status, server, body)
}
