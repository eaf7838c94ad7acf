//! Line echo server with zero-downtime restarts
//!
//! Send SIGUSR1 to hot restart, SIGTERM to drain and exit.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use seamless::{Configuration, Connection, Server};
use std::env;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "seamless-echo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Bind URI, e.g. tcp://127.0.0.1:8080 or unix:///tmp/echo.sock
    #[arg(short, long)]
    bind: Option<String>,

    /// Port to bind when no bind URI is given (falls back to PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind when no bind URI is given
    #[arg(long)]
    bind_address: Option<String>,

    /// Write the process id here (falls back to PID_FILE)
    #[arg(long)]
    pidfile: Option<PathBuf>,

    /// Append logs to this file instead of stdout
    #[arg(long)]
    log_path: Option<PathBuf>,

    /// trace, debug, info, warn or error (falls back to LOG_LEVEL)
    #[arg(long)]
    log_level: Option<String>,

    /// Enable TLS: TLSv1_2 or TLSv1_3 (falls back to TLS_VERSION)
    #[arg(long)]
    tls_version: Option<String>,

    /// PEM private key file
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// PEM certificate chain file
    #[arg(long)]
    tls_certificate: Option<PathBuf>,

    /// Require client certificates signed by --client-tls-certificate-ca
    #[arg(long)]
    verify_client_tls: bool,

    /// PEM CA bundle for client certificates
    #[arg(long)]
    client_tls_certificate_ca: Option<PathBuf>,

    /// CIDR range allowed to connect, repeatable
    #[arg(long = "allowed-network")]
    allowed_networks: Vec<String>,

    /// Seconds a restarted successor has to take over the socket
    #[arg(long)]
    handoff_timeout_secs: Option<u64>,

    /// Command that starts a successor on restart (defaults to this command line)
    #[arg(last = true)]
    start_command: Vec<String>,
}

impl Cli {
    fn into_configuration(self) -> Result<Configuration> {
        let mut configuration = Configuration::new().with_start_command(self.resolve_start_command()?);

        if let Some(bind) = self.bind {
            configuration = configuration.with_bind(bind);
        }
        if let Some(port) = self.port {
            configuration = configuration.with_bind_port(port);
        }
        if let Some(address) = self.bind_address {
            configuration = configuration.with_bind_address(address);
        }
        if let Some(path) = self.pidfile {
            configuration = configuration.with_pidfile_path(path);
        }
        if let Some(path) = self.log_path {
            configuration = configuration.with_log_path(path);
        }
        if let Some(level) = self.log_level {
            configuration = configuration.with_log_level(level);
        }
        if let Some(version) = self.tls_version {
            configuration = configuration.with_tls_version(version);
        }
        if let Some(path) = &self.tls_key {
            configuration = configuration.with_tls_key(read_pem(path)?);
        }
        if let Some(path) = &self.tls_certificate {
            configuration = configuration.with_tls_certificate(read_pem(path)?);
        }
        if self.verify_client_tls {
            configuration = configuration.with_verify_client_tls_certificate(true);
        }
        if let Some(path) = &self.client_tls_certificate_ca {
            configuration = configuration.with_client_tls_certificate_ca(read_pem(path)?);
        }
        if !self.allowed_networks.is_empty() {
            configuration = configuration.with_allowed_networks(self.allowed_networks);
        }
        if let Some(secs) = self.handoff_timeout_secs {
            configuration = configuration.with_handoff_timeout(Duration::from_secs(secs));
        }

        Ok(configuration)
    }

    /// A successor runs exactly what was run to start us
    fn resolve_start_command(&self) -> Result<Vec<String>> {
        if !self.start_command.is_empty() {
            return Ok(self.start_command.clone());
        }
        let exe = env::current_exe().context("Failed to locate the running executable")?;
        let mut argv = vec![exe.to_string_lossy().into_owned()];
        argv.extend(env::args().skip(1));
        Ok(argv)
    }
}

fn read_pem(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Read one line and send it straight back
fn echo(connection: &mut Connection) -> anyhow::Result<()> {
    let mut line = String::new();
    BufReader::new(&mut *connection).read_line(&mut line)?;
    debug!(bytes = line.len(), peer = ?connection.peer_addr(), "Echoing line");
    connection.write_all(line.as_bytes())?;
    connection.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let configuration = Cli::parse().into_configuration()?;
    seamless::logging::init(&configuration)?;

    let server = Server::new(configuration, echo).context("Invalid configuration")?;
    let status = server.run().context("Server failed")?;
    process::exit(status)
}
