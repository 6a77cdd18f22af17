// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//!  Signed PCR measurements from a TPM 2.0 device or simulator.
//!
//!  The device is picked from an explicit TCTI string, or from the `TPM2TOOLS_TCTI`, `TCTI` and
//!  `TEST_TCTI` environment variables, or the kernel resource manager at `/dev/tpmrm0`.
//!
//!  #
//!  ```no_run
//!  use pcr_quote::{open_device, quote};
//!  use std::error::Error;
//!
//!  fn main() -> Result<(), Box<dyn Error>> {
//!    let mut device = open_device(Some("mssim:host=localhost,port=2321"))?;
//!    let config = quote::QuoteConfig {
//!      qualifying_data: b"challenge".to_vec(),
//!      ..Default::default()
//!    };
//!    let quote = quote::get_quote(&mut device, &config)?;
//!    quote.verify(b"challenge")?;
//!    device.close()?;
//!
//!    Ok(())
//!  }
//!  ```

pub use tpm_pcr_quote::{attest, device, keys, quote, session};

use device::{Device, DeviceError};
use log::debug;

/// Open the TPM named by `tcti`, or the one configured in the environment.
pub fn open_device(tcti: Option<&str>) -> Result<Device, DeviceError> {
    match tcti {
        Some(conf) => {
            debug!("opening TPM with TCTI {conf}");
            Device::from_tcti_str(conf)
        }
        None => Device::from_environment(),
    }
}
