//! Single vCPU and its exit dispatch loop.
//!
//! The loop runs until the guest halts.  Console I/O on port `0xE9` is
//! serviced in place; every other exit faults the vCPU and surfaces as
//! [`VmError::UnexpectedExit`] carrying the raw `KVM_EXIT_*` code.

use std::io::Write;

use kvm_bindings::{
    kvm_regs, kvm_sregs, KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_IO,
    KVM_EXIT_MMIO, KVM_EXIT_SHUTDOWN, KVM_EXIT_SYSTEM_EVENT, KVM_EXIT_UNKNOWN,
};
use kvm_ioctls::{VcpuExit, VcpuFd};
use log::{debug, info, warn};

use crate::config::PrivilegeMode;
use crate::devices::console::Console;
use crate::layout;
use crate::vm::VmError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Runnable,
    Halted,
    Faulted,
}

/// What the loop does after servicing an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    Continue,
    Halt,
}

pub struct VirtualCpu {
    fd: VcpuFd,
    state: VcpuState,
    exits: u64,
    mmap_size: usize,
}

impl VirtualCpu {
    pub(crate) fn new(fd: VcpuFd, mmap_size: usize) -> Self {
        Self {
            fd,
            state: VcpuState::Runnable,
            exits: 0,
            mmap_size,
        }
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    /// Exits serviced so far, including the final one.
    pub fn exits(&self) -> u64 {
        self.exits
    }

    /// Size of the shared `kvm_run` mapping.
    pub fn mmap_size(&self) -> usize {
        self.mmap_size
    }

    pub fn regs(&self) -> Result<kvm_regs, VmError> {
        self.fd.get_regs().map_err(VmError::GetRegisters)
    }

    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), VmError> {
        self.fd.set_regs(regs).map_err(VmError::SetRegisters)
    }

    pub fn sregs(&self) -> Result<kvm_sregs, VmError> {
        self.fd.get_sregs().map_err(VmError::GetSregs)
    }

    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), VmError> {
        self.fd.set_sregs(sregs).map_err(VmError::SetSregs)
    }

    /// Load the register state for `mode` on top of the reset state.
    pub fn configure(&self, mode: PrivilegeMode) -> Result<(), VmError> {
        let mut sregs = self.sregs()?;
        let mut regs = kvm_regs::default();
        layout::configure_registers(mode, &mut sregs, &mut regs);
        self.set_sregs(&sregs)?;
        self.set_regs(&regs)?;
        info!("vCPU configured for {mode} mode");
        Ok(())
    }

    /// Run until the guest halts and return its registers.
    pub fn run<W: Write>(&mut self, console: &mut Console<W>) -> Result<kvm_regs, VmError> {
        info!("Starting guest execution");

        loop {
            let exit = match self.fd.run() {
                Ok(exit) => exit,
                Err(e) => {
                    self.state = VcpuState::Faulted;
                    return Err(VmError::VcpuRun(e));
                }
            };
            let action = match exit {
                VcpuExit::IoOut(port, data) => handle_io_out(console, port, data),
                VcpuExit::IoIn(port, data) => handle_io_in(console, port, data),
                VcpuExit::Hlt => Ok(ExitAction::Halt),
                other => Err(VmError::UnexpectedExit {
                    reason: exit_code(&other),
                    detail: format!("{other:?}"),
                }),
            };
            self.exits += 1;

            match action {
                Ok(ExitAction::Continue) => {}
                Ok(ExitAction::Halt) => {
                    self.state = VcpuState::Halted;
                    info!("Guest halted after {} exits", self.exits);
                    return self.regs();
                }
                Err(e) => {
                    self.state = VcpuState::Faulted;
                    warn!("vCPU faulted: {e}");
                    return Err(e);
                }
            }
        }
    }
}

/// Guest `out`: forward to the console, or fault on any other port.
pub fn handle_io_out<W: Write>(
    console: &mut Console<W>,
    port: u16,
    data: &[u8],
) -> Result<ExitAction, VmError> {
    if !console.handles(port) {
        return Err(VmError::UnexpectedExit {
            reason: KVM_EXIT_IO,
            detail: format!("out of {} bytes to port {port:#x}", data.len()),
        });
    }
    console.write(data).map_err(VmError::Console)?;
    Ok(ExitAction::Continue)
}

/// Guest `in`: the console reads as zero; any other port faults.
pub fn handle_io_in<W: Write>(
    console: &mut Console<W>,
    port: u16,
    data: &mut [u8],
) -> Result<ExitAction, VmError> {
    if !console.handles(port) {
        return Err(VmError::UnexpectedExit {
            reason: KVM_EXIT_IO,
            detail: format!("in of {} bytes from port {port:#x}", data.len()),
        });
    }
    console.read(data);
    debug!("Console read of {} bytes", data.len());
    Ok(ExitAction::Continue)
}

/// Raw `KVM_EXIT_*` code of an exit.
pub fn exit_code(exit: &VcpuExit<'_>) -> u32 {
    match exit {
        VcpuExit::IoIn(..) | VcpuExit::IoOut(..) => KVM_EXIT_IO,
        VcpuExit::MmioRead(..) | VcpuExit::MmioWrite(..) => KVM_EXIT_MMIO,
        VcpuExit::Hlt => KVM_EXIT_HLT,
        VcpuExit::Shutdown => KVM_EXIT_SHUTDOWN,
        VcpuExit::FailEntry(..) => KVM_EXIT_FAIL_ENTRY,
        VcpuExit::InternalError => KVM_EXIT_INTERNAL_ERROR,
        VcpuExit::SystemEvent(..) => KVM_EXIT_SYSTEM_EVENT,
        VcpuExit::Unsupported(code) => *code,
        _ => KVM_EXIT_UNKNOWN,
    }
}
