//! demo-server - minimal distribution launcher used as a test payload.
//!
//! Behaves like a small servlet-container start script:
//!
//! - `--create-startd` creates `start.d/` in the base and exits
//! - `--add-to-start=a,b` enables modules (`start.d/<m>.ini`) and exits
//! - `--version` prints the installed version and exits
//! - `key=value` arguments set properties (`http.port`, `deploy.dir`)
//!
//! Otherwise it requires the `http` module, binds `127.0.0.1:<http.port>`,
//! prints `Started @<ms>ms` on stderr and serves files from
//! `<base>/<deploy.dir>/<context>/...` until terminated.

use anyhow::{bail, Context, Result};
use distribution_tests::{patterns, InstallationDescriptor};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

const DEFAULT_PORT: &str = "8080";
const DEFAULT_DEPLOY_DIR: &str = "webapps";
const START_D: &str = "start.d";

struct Launch {
    base: PathBuf,
    version: String,
    properties: BTreeMap<String, String>,
    modules_to_add: Vec<String>,
    create_startd: bool,
    print_version: bool,
}

fn main() -> Result<()> {
    let started = Instant::now();
    let launch = parse_launch()?;

    if launch.print_version {
        println!("demo-server {}", launch.version);
        return Ok(());
    }

    if launch.create_startd || !launch.modules_to_add.is_empty() {
        configure_modules(&launch)?;
        return Ok(());
    }

    let start_d = launch.base.join(START_D);
    if !start_d.join("http.ini").is_file() {
        eprintln!("FAILED no http module enabled in {}", start_d.display());
        std::process::exit(1);
    }

    let port = launch
        .properties
        .get("http.port")
        .map(String::as_str)
        .unwrap_or(DEFAULT_PORT);
    let listener = match TcpListener::bind(format!("127.0.0.1:{}", port)) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("FAILED connector on port {}: {}", port, e);
            std::process::exit(2);
        }
    };

    let deploy = launch.base.join(
        launch
            .properties
            .get("deploy.dir")
            .map(String::as_str)
            .unwrap_or(DEFAULT_DEPLOY_DIR),
    );
    eprintln!("demo-server {} serving {}", launch.version, deploy.display());
    eprintln!(
        "{}{}ms on port {}",
        patterns::STARTED,
        started.elapsed().as_millis(),
        port
    );

    let server_header = format!("demo-server/{}", launch.version);
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("WARN accept failed: {}", e);
                continue;
            }
        };
        let deploy = deploy.clone();
        let server_header = server_header.clone();
        std::thread::spawn(move || {
            if let Err(e) = handle(stream, &deploy, &server_header) {
                eprintln!("WARN request failed: {:#}", e);
            }
        });
    }
    Ok(())
}

fn parse_launch() -> Result<Launch> {
    let base = match std::env::var_os("DIST_BASE") {
        Some(base) => PathBuf::from(base),
        None => std::env::current_dir().context("reading working directory")?,
    };
    let version = InstallationDescriptor::load(&base)
        .map(|d| d.server_version)
        .unwrap_or_else(|_| "unknown".to_string());

    let mut launch = Launch {
        base,
        version,
        properties: BTreeMap::new(),
        modules_to_add: Vec::new(),
        create_startd: false,
        print_version: false,
    };

    for arg in std::env::args().skip(1) {
        if arg == "--create-startd" {
            launch.create_startd = true;
        } else if arg == "--version" {
            launch.print_version = true;
        } else if let Some(modules) = arg.strip_prefix("--add-to-start=") {
            launch
                .modules_to_add
                .extend(modules.split(',').filter(|m| !m.is_empty()).map(str::to_string));
        } else if arg.starts_with("--") {
            // Unknown switches are accepted and ignored, like most launchers.
            continue;
        } else if let Some((key, value)) = arg.split_once('=') {
            launch.properties.insert(key.to_string(), value.to_string());
        } else {
            bail!("unrecognised argument {:?}", arg);
        }
    }
    Ok(launch)
}

fn configure_modules(launch: &Launch) -> Result<()> {
    let start_d = launch.base.join(START_D);
    std::fs::create_dir_all(&start_d).with_context(|| format!("creating {}", start_d.display()))?;
    for module in &launch.modules_to_add {
        let ini = start_d.join(format!("{}.ini", module));
        std::fs::write(&ini, format!("--module={}\n", module))
            .with_context(|| format!("writing {}", ini.display()))?;
        println!("INFO  : {:<15} initialized in {}", module, ini.display());
    }
    println!("INFO  : Base directory was modified");
    Ok(())
}

fn handle(stream: TcpStream, deploy: &Path, server_header: &str) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    // Drain headers; bodies are not supported.
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header.trim().is_empty() {
            break;
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or("/");
    let path = target.split('?').next().unwrap_or("/");

    let (status, body) = if method != "GET" {
        ("405 Method Not Allowed", b"method not allowed\n".to_vec())
    } else {
        match lookup(deploy, path) {
            Some(file) => match std::fs::read(&file) {
                Ok(body) => ("200 OK", body),
                Err(_) => ("500 Internal Server Error", b"unreadable\n".to_vec()),
            },
            None => ("404 Not Found", b"not found\n".to_vec()),
        }
    };

    let mut stream = stream;
    write!(
        stream,
        "HTTP/1.1 {}\r\nServer: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        server_header,
        body.len()
    )?;
    stream.write_all(&body)?;
    stream.flush()?;
    Ok(())
}

/// Map `/<context>/<rest>` onto the deployment directory.
fn lookup(deploy: &Path, url_path: &str) -> Option<PathBuf> {
    let relative = Path::new(url_path.trim_start_matches('/'));
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return None;
    }
    let candidate = deploy.join(relative);
    if candidate.is_file() {
        return Some(candidate);
    }
    let index = candidate.join("index.html");
    index.is_file().then_some(index)
}
