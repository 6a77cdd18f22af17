// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::device::{Device, DeviceError};
use log::info;
use thiserror::Error;
use tss_esapi::constants::SessionType;
use tss_esapi::handles::SessionHandle;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::{Nonce, SymmetricDefinition};

const SHA256_DIGEST_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("tpm error: {0}")]
    Tpm(#[from] tss_esapi::Error),
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("TPM did not return a session")]
    NoSession,
}

/// A started policy session, flushed by its [`Device`]
#[derive(Copy, Clone, Debug)]
pub struct PolicySession {
    session: AuthSession,
    tpm_handle: u32,
}

impl PolicySession {
    pub fn session(&self) -> AuthSession {
        self.session
    }

    /// Handle value assigned by the TPM, in the loaded session range
    pub fn tpm_handle(&self) -> u32 {
        self.tpm_handle
    }
}

/// Start an unbound, unsalted policy session with a SHA-256 auth hash. The caller nonce is
/// drawn from the TPM's RNG.
pub fn start_policy_session(device: &mut Device) -> Result<PolicySession, SessionError> {
    let context = device.context();
    let session = context.execute_without_session(|ctx| {
        let random = ctx.get_random(SHA256_DIGEST_SIZE)?;
        let nonce = Nonce::try_from(random.value().to_vec())?;
        ctx.start_auth_session(
            None,
            None,
            Some(nonce),
            SessionType::Policy,
            SymmetricDefinition::Null,
            HashingAlgorithm::Sha256,
        )
    })?;
    let session = session.ok_or(SessionError::NoSession)?;
    device.track_session(session);

    let handle: SessionHandle = session.into();
    let tpm_handle = device.tpm_handle(handle.into())?;
    info!("started policy session 0x{tpm_handle:08x}");

    Ok(PolicySession {
        session,
        tpm_handle,
    })
}
