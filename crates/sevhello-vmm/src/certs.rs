//! Certificates exchanged when exporting an SEV guest.
//!
//! The destination platform is identified by its PDH certificate and the
//! PEK/OCA/CEK chain that signs it; the AMD ASK/ARK chain roots the CEK.
//! The sender additionally embeds its own PDH in the migration stream so
//! the receiver can derive the transport keys.
//!
//! On disk each certificate is a separate file in AMD's binary format:
//!
//! | File        | Size | Directory            |
//! |-------------|------|----------------------|
//! | `pdh.cert`  | 2084 | local and remote     |
//! | `pek.cert`  | 2084 | remote               |
//! | `oca.cert`  | 2084 | remote               |
//! | `cek.cert`  | 2084 | remote               |
//! | `ask.cert`  | 832  | local                |
//! | `ark.cert`  | 832  | local                |

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::info;
use thiserror::Error;

use crate::config::MigrationRole;
use crate::vm::ErrorKind;

/// Size of a platform certificate (PDH, PEK, OCA, CEK).
pub const PLATFORM_CERT_LEN: usize = 2084;

/// Size of an AMD root certificate (ASK, ARK).
pub const AMD_CERT_LEN: usize = 832;

/// Files making up the destination platform chain, in wire order.
pub const PLATFORM_CHAIN: [&str; 3] = ["pek.cert", "oca.cert", "cek.cert"];

/// Files making up the AMD chain, in wire order.
pub const AMD_CHAIN: [&str; 2] = ["ask.cert", "ark.cert"];

pub const PDH_FILE: &str = "pdh.cert";

#[derive(Error, Debug)]
pub enum CertError {
    #[error("Failed to open certificate {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("Certificate {path} is shorter than {expected} bytes: {source}")]
    Short {
        path: PathBuf,
        expected: usize,
        source: io::Error,
    },

    #[error("Role {role} does not export memory and needs no certificates")]
    NotASource { role: MigrationRole },
}

impl CertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CertError::NotASource { .. } => ErrorKind::ProtocolError,
            _ => ErrorKind::IoError,
        }
    }
}

/// Certificate material handed to `SEND_START`.
#[derive(Clone, PartialEq, Eq)]
pub struct TransportCertificates {
    /// Sender's own PDH, written as the first stream frame.
    pub local_pdh: Vec<u8>,
    /// Destination PDH.
    pub remote_pdh: Vec<u8>,
    /// Destination PEK ‖ OCA ‖ CEK.
    pub remote_platform: Vec<u8>,
    /// ASK ‖ ARK.
    pub amd_chain: Vec<u8>,
}

impl std::fmt::Debug for TransportCertificates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCertificates")
            .field("local_pdh", &self.local_pdh.len())
            .field("remote_pdh", &self.remote_pdh.len())
            .field("remote_platform", &self.remote_platform.len())
            .field("amd_chain", &self.amd_chain.len())
            .finish()
    }
}

impl TransportCertificates {
    /// Load the certificates for `role`.
    ///
    /// `source-local` migrates to the same platform, so the local directory
    /// doubles as the destination.  `source-remote` reads the destination
    /// chain from `remote`.
    pub fn for_role(
        role: MigrationRole,
        local: &Path,
        remote: &Path,
    ) -> Result<Self, CertError> {
        match role {
            MigrationRole::SourceLocal => Self::load(local, local),
            MigrationRole::SourceRemote => Self::load(local, remote),
            MigrationRole::None | MigrationRole::Sink => Err(CertError::NotASource { role }),
        }
    }

    /// Read the local PDH and AMD chain from `local`, and the destination
    /// PDH and platform chain from `remote`.
    pub fn load(local: &Path, remote: &Path) -> Result<Self, CertError> {
        let local_pdh = read_cert(&local.join(PDH_FILE), PLATFORM_CERT_LEN)?;
        let remote_pdh = read_cert(&remote.join(PDH_FILE), PLATFORM_CERT_LEN)?;

        let mut remote_platform = Vec::with_capacity(PLATFORM_CHAIN.len() * PLATFORM_CERT_LEN);
        for name in PLATFORM_CHAIN {
            remote_platform.extend(read_cert(&remote.join(name), PLATFORM_CERT_LEN)?);
        }

        let mut amd_chain = Vec::with_capacity(AMD_CHAIN.len() * AMD_CERT_LEN);
        for name in AMD_CHAIN {
            amd_chain.extend(read_cert(&local.join(name), AMD_CERT_LEN)?);
        }

        info!(
            "Transport certificates loaded: local={}, remote={}",
            local.display(),
            remote.display()
        );

        Ok(Self {
            local_pdh,
            remote_pdh,
            remote_platform,
            amd_chain,
        })
    }
}

/// Read exactly `len` bytes from the start of `path`.
fn read_cert(path: &Path, len: usize) -> Result<Vec<u8>, CertError> {
    let mut file = File::open(path).map_err(|source| CertError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cert = vec![0u8; len];
    file.read_exact(&mut cert).map_err(|source| CertError::Short {
        path: path.to_path_buf(),
        expected: len,
        source,
    })?;
    Ok(cert)
}
