// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use core::fmt;
use log::{debug, warn};
use std::str::FromStr;
use thiserror::Error;
use tss_esapi::constants::CapabilityType;
use tss_esapi::handles::{KeyHandle, ObjectHandle, SessionHandle};
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::CapabilityData;
use tss_esapi::tcti_ldr::{DeviceConfig, TctiNameConf};
use tss_esapi::Context;

// TPM 2.0 Part 2, 7.4: handle ranges
const HR_SHIFT: u32 = 24;
const TRANSIENT_FIRST: u32 = 0x80000000;
const LOADED_SESSION_FIRST: u32 = 0x02000000;
const MAX_CAP_HANDLES: u32 = 254;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("tpm error: {0}")]
    Tpm(#[from] tss_esapi::Error),
    #[error("unexpected capability data")]
    UnexpectedCapability,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyRole {
    Endorsement,
    Storage,
    Attestation,
}

impl fmt::Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyRole::Endorsement => "EK",
            KeyRole::Storage => "SRK",
            KeyRole::Attestation => "AIK",
        };
        f.write_str(name)
    }
}

/// An open TPM and the transient handles acquired through it.
///
/// Handles are registered when they are created. Dropping the device flushes every handle that
/// is still registered: sessions first, then keys in reverse order of creation.
pub struct Device {
    context: Context,
    keys: Vec<(KeyHandle, KeyRole)>,
    sessions: Vec<AuthSession>,
}

/// TCTI from `TPM2TOOLS_TCTI`, `TCTI` or `TEST_TCTI`, the kernel resource manager otherwise.
pub fn tcti_from_environment() -> TctiNameConf {
    TctiNameConf::from_environment_variable()
        .unwrap_or_else(|_| TctiNameConf::Device(DeviceConfig::default()))
}

impl Device {
    pub fn open(tcti: TctiNameConf) -> Result<Self, DeviceError> {
        let context = Context::new(tcti)?;
        debug!("opened TPM context");
        Ok(Self {
            context,
            keys: Vec::new(),
            sessions: Vec::new(),
        })
    }

    pub fn from_environment() -> Result<Self, DeviceError> {
        Self::open(tcti_from_environment())
    }

    /// Open a device from a TCTI string like `device:/dev/tpmrm0` or `mssim:host=localhost`
    pub fn from_tcti_str(conf: &str) -> Result<Self, DeviceError> {
        let tcti = TctiNameConf::from_str(conf)?;
        Self::open(tcti)
    }

    /// Authorize subsequent commands with a password session. The auth value used is the one
    /// set on the object being authorized, empty for the hierarchies.
    pub fn use_password_session(&mut self) {
        self.context
            .set_sessions((Some(AuthSession::Password), None, None));
    }

    /// Sessions the next command will be authorized with
    pub fn sessions(&self) -> (Option<AuthSession>, Option<AuthSession>, Option<AuthSession>) {
        self.context.sessions()
    }

    pub(crate) fn context(&mut self) -> &mut Context {
        &mut self.context
    }

    pub(crate) fn track_key(&mut self, handle: KeyHandle, role: KeyRole) {
        debug!("tracking {role} handle {handle:?}");
        self.keys.push((handle, role));
    }

    pub(crate) fn track_session(&mut self, session: AuthSession) {
        debug!("tracking session {session:?}");
        self.sessions.push(session);
    }

    /// Flush a session that was started on this device. Unknown or already flushed sessions are
    /// ignored.
    pub fn flush_session(&mut self, session: AuthSession) -> Result<(), DeviceError> {
        let Some(pos) = self.sessions.iter().position(|s| *s == session) else {
            return Ok(());
        };
        self.sessions.remove(pos);
        let handle: SessionHandle = session.into();
        self.context.flush_context(handle.into())?;
        debug!("flushed session {session:?}");
        Ok(())
    }

    /// Unload a key that was created on this device. Unknown or already unloaded keys are
    /// ignored.
    pub fn unload_key(&mut self, handle: KeyHandle) -> Result<(), DeviceError> {
        let Some(pos) = self.keys.iter().position(|(h, _)| *h == handle) else {
            return Ok(());
        };
        let (_, role) = self.keys.remove(pos);
        self.context.flush_context(handle.into())?;
        debug!("unloaded {role} handle {handle:?}");
        Ok(())
    }

    /// Release every registered handle and close the device. Returns the first release failure,
    /// after attempting all of them.
    pub fn close(mut self) -> Result<(), DeviceError> {
        self.release_all()
    }

    fn release_all(&mut self) -> Result<(), DeviceError> {
        let mut first_err = None;

        while let Some(session) = self.sessions.last().copied() {
            if let Err(e) = self.flush_session(session) {
                warn!("failed to flush session {session:?}: {e}");
                first_err.get_or_insert(e);
            }
        }
        while let Some((handle, role)) = self.keys.last().copied() {
            if let Err(e) = self.unload_key(handle) {
                warn!("failed to unload {role} handle {handle:?}: {e}");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// TPM handle value of an ESYS object, e.g. `0x80000000` for the first transient object
    pub fn tpm_handle(&mut self, object: ObjectHandle) -> Result<u32, DeviceError> {
        let handle = self.context.tr_get_tpm_handle(object)?;
        Ok(handle.into())
    }

    /// Transient object handles currently loaded in the TPM
    pub fn transient_handles(&mut self) -> Result<Vec<u32>, DeviceError> {
        self.handles(TRANSIENT_FIRST)
    }

    /// Session handles currently loaded in the TPM
    pub fn loaded_sessions(&mut self) -> Result<Vec<u32>, DeviceError> {
        self.handles(LOADED_SESSION_FIRST)
    }

    fn handles(&mut self, first: u32) -> Result<Vec<u32>, DeviceError> {
        let (data, _) = self.context.execute_without_session(|ctx| {
            ctx.get_capability(CapabilityType::Handles, first, MAX_CAP_HANDLES)
        })?;
        let CapabilityData::Handles(list) = data else {
            return Err(DeviceError::UnexpectedCapability);
        };

        let range = first >> HR_SHIFT;
        let handles = list
            .iter()
            .map(|handle| u32::from(*handle))
            .filter(|handle| handle >> HR_SHIFT == range)
            .collect();
        Ok(handles)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _ = self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_role_names() {
        assert_eq!(KeyRole::Endorsement.to_string(), "EK");
        assert_eq!(KeyRole::Storage.to_string(), "SRK");
        assert_eq!(KeyRole::Attestation.to_string(), "AIK");
    }

    #[test]
    fn handle_ranges() {
        assert_eq!(TRANSIENT_FIRST >> HR_SHIFT, 0x80);
        assert_eq!(LOADED_SESSION_FIRST >> HR_SHIFT, 0x02);
    }
}
