//! One complete run: VM setup, optional SEV launch or receive, guest
//! execution and the post-halt check.
//!
//! Ordering matters under SEV.  `KVM_SEV_INIT` and the start of the
//! launch (or the whole receive) happen before the vCPU exists, and
//! guest memory is encrypted only after the layout has been written.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use log::{debug, info, log_enabled, Level};
use sevhello_protocol::{EXPECTED_RESULT, GREETING};

use crate::certs::TransportCertificates;
use crate::config::{MigrationRole, PrivilegeMode, VmConfig};
use crate::devices::console::Console;
use crate::guest::GuestImage;
use crate::layout;
use crate::memory::{hex_dump, DUMP_LEN};
use crate::migration::{ReceiveSummary, SendSummary};
use crate::vm::{VirtualMachine, VmError};

/// Outcome of a run that reached `hlt`.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub mode: PrivilegeMode,
    pub role: MigrationRole,
    pub rax: u64,
    /// Data slot as the guest sees it (decrypted under SEV).
    pub data_value: u64,
    /// Data slot as read directly from host memory.
    pub raw_data_value: u64,
    pub console: Vec<u8>,
    pub measurement: Option<Vec<u8>>,
    pub sent: Option<SendSummary>,
    pub received: Option<ReceiveSummary>,
}

impl RunReport {
    /// Greeting printed, accumulator and data slot both 42.
    pub fn passed(&self) -> bool {
        self.rax == EXPECTED_RESULT && self.data_value == EXPECTED_RESULT && self.console == GREETING
    }
}

/// Run `image` under `config`.
///
/// Source roles write the migration stream to `migration_path` before the
/// guest runs; the sink reads it instead of loading `image`.
pub fn run<W: Write>(
    config: VmConfig,
    image: &GuestImage,
    certs: Option<&TransportCertificates>,
    migration_path: &Path,
    console_out: W,
) -> Result<RunReport, VmError> {
    let mode = config.mode;
    let role = config.role;
    let certs = match (role.is_source(), certs) {
        (true, None) => return Err(VmError::MissingCertificates { role }),
        (true, Some(certs)) => Some(certs),
        (false, _) => None,
    };

    let mut vm = VirtualMachine::open(config)?;
    let mut received = None;

    if role.is_confidential() {
        vm.sev_init()?;
        if role.is_sink() {
            let file = File::open(migration_path).map_err(|source| VmError::MigrationFile {
                path: migration_path.to_path_buf(),
                source,
            })?;
            received = Some(vm.receive(BufReader::new(file))?);
        } else {
            vm.launch_start()?;
        }
    }

    let mut vcpu = vm.create_vcpu()?;

    if !role.is_sink() {
        let tables = layout::prepare_memory(vm.memory(), mode, image.as_bytes(), vm.c_bit())?;
        debug!("Guest layout written: {tables:?}");
    }
    vcpu.configure(mode)?;

    let mut measurement = None;
    let mut sent = None;
    if let Some(certs) = certs {
        measurement = Some(vm.launch()?);
        let file = File::create(migration_path).map_err(|source| VmError::MigrationFile {
            path: migration_path.to_path_buf(),
            source,
        })?;
        sent = Some(vm.send(certs, BufWriter::new(file))?);
        info!("Migration stream written to {}", migration_path.display());
    }

    let mut console = Console::new(console_out);
    let regs = vcpu.run(&mut console)?;

    let (data_value, raw_data_value) = check_data_slot(&mut vm)?;
    vm.log_guest_status();

    let report = RunReport {
        mode,
        role,
        rax: regs.rax,
        data_value,
        raw_data_value,
        console: console.into_transcript(),
        measurement,
        sent,
        received,
    };
    info!(
        "{mode} guest halted: rax={} data={} raw={:#x} console={:?}",
        report.rax,
        report.data_value,
        report.raw_data_value,
        String::from_utf8_lossy(&report.console)
    );
    Ok(report)
}

/// Read the data slot at the mode's width, through the firmware when the
/// guest is encrypted.  Returns the guest's view and the raw host view.
fn check_data_slot(vm: &mut VirtualMachine) -> Result<(u64, u64), VmError> {
    if log_enabled!(Level::Debug) {
        debug!("Guest memory (host view):\n{}", hex_dump(&vm.memory().dump(DUMP_LEN)?));
        if vm.is_confidential() {
            let plain = vm.decrypt(0, DUMP_LEN)?;
            debug!("Guest memory (decrypted):\n{}", hex_dump(&plain));
        }
    }

    let width = vm.config().mode.check_width();
    vm.data_slot(width)
}
