//! sevhello CLI: run the hello guest, optionally under SEV and migration

use clap::Parser;
use sevhello_protocol::DEFAULT_MIGRATION_FILE;
use sevhello_vmm::certs::{CertError, TransportCertificates};
use sevhello_vmm::guest::GuestImage;
use sevhello_vmm::memory::DEFAULT_MEMORY_SIZE;
use sevhello_vmm::runner;
use sevhello_vmm::{MigrationRole, PrivilegeMode, VmConfig, VmError};
use snafu::Snafu;
use std::io;
use std::path::PathBuf;

/// CLI errors for the sevhello binary.
#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("VM error ({}): {source}", source.kind()), context(false))]
    Vm { source: VmError },
    #[snafu(display("Certificate error: {source}"), context(false))]
    Certs { source: CertError },
}

#[derive(Parser)]
#[command(name = "sevhello")]
#[command(about = "Run a hello-world guest on KVM, optionally SEV-encrypted and migrated")]
#[command(version)]
struct Cli {
    /// Privilege mode the guest runs in
    #[arg(short, long, value_enum)]
    mode: Mode,

    /// SEV migration role (default: plain guest, no SEV)
    #[arg(short, long, value_enum, default_value = "none")]
    role: Role,

    /// Guest memory size in bytes
    #[arg(long, default_value_t = DEFAULT_MEMORY_SIZE)]
    memory_size: usize,

    /// Migration stream written by sources and read by the sink
    #[arg(long, default_value = DEFAULT_MIGRATION_FILE)]
    migration_file: PathBuf,

    /// Directory with this platform's pdh.cert, ask.cert and ark.cert
    #[arg(long, default_value = "certs")]
    local_certs: PathBuf,

    /// Directory with the destination's pdh/pek/oca/cek certificates
    #[arg(long, default_value = "remote-certs")]
    remote_certs: PathBuf,

    /// Flat binary to run instead of the built-in guest
    #[arg(long)]
    image: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Mode {
    Real,
    Protected,
    Paged32,
    Long,
}

impl From<Mode> for PrivilegeMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Real => PrivilegeMode::Real,
            Mode::Protected => PrivilegeMode::Protected,
            Mode::Paged32 => PrivilegeMode::Paged32,
            Mode::Long => PrivilegeMode::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Role {
    None,
    SourceLocal,
    SourceRemote,
    Sink,
}

impl From<Role> for MigrationRole {
    fn from(role: Role) -> Self {
        match role {
            Role::None => MigrationRole::None,
            Role::SourceLocal => MigrationRole::SourceLocal,
            Role::SourceRemote => MigrationRole::SourceRemote,
            Role::Sink => MigrationRole::Sink,
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cmd_run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Returns whether the post-halt check passed.
fn cmd_run(cli: Cli) -> Result<bool, CliError> {
    let mode = PrivilegeMode::from(cli.mode);
    let role = MigrationRole::from(cli.role);
    let config = VmConfig::new(mode, role).with_memory_size(cli.memory_size);

    let image = match &cli.image {
        Some(path) => GuestImage::from_file(path)?,
        None => GuestImage::for_mode(mode),
    };

    let certs = if role.is_source() {
        Some(TransportCertificates::for_role(
            role,
            &cli.local_certs,
            &cli.remote_certs,
        )?)
    } else {
        None
    };

    let report = runner::run(
        config,
        &image,
        certs.as_ref(),
        &cli.migration_file,
        io::stdout(),
    )?;

    if let Some(measurement) = &report.measurement {
        println!("Launch measurement: {} bytes", measurement.len());
    }
    if let Some(sent) = &report.sent {
        println!(
            "Sent {} chunks ({} bytes) to {}",
            sent.chunks,
            sent.bytes,
            cli.migration_file.display()
        );
    }
    if let Some(received) = &report.received {
        println!("Received {} chunks ({} bytes)", received.chunks, received.bytes);
    }

    println!(
        "{} mode: rax={} data={} (raw {:#x}) -> {}",
        report.mode,
        report.rax,
        report.data_value,
        report.raw_data_value,
        if report.passed() { "PASS" } else { "FAIL" }
    );
    Ok(report.passed())
}
