// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//!  This library produces signed PCR measurements (TPM 2.0 Quotes). It creates an Endorsement
//!  Key, a password protected Storage Root Key and an Attestation Identity Key below it, and asks
//!  the TPM to sign a selection of PCRs with the AIK.
//!
//!  Every key and session handle is registered on the [`device::Device`] it was created with and
//!  released when the device goes out of scope, no matter which step failed.
//!
//!  # Quote PCR 16
//!
//!  ```no_run
//!  use tpm_pcr_quote::device::Device;
//!  use tpm_pcr_quote::quote::{self, QuoteConfig};
//!  use std::error::Error;
//!
//!  fn main() -> Result<(), Box<dyn Error>> {
//!    let mut device = Device::from_environment()?;
//!    let config = QuoteConfig::default();
//!    let quote = quote::get_quote(&mut device, &config)?;
//!
//!    let attested = quote.attested()?;
//!    assert!(attested.is_tpm_generated());
//!    println!("signed {} PCR bank(s)", attested.quote().unwrap().selection_count());
//!
//!    Ok(())
//!  }
//!  ```

pub mod attest;
pub mod device;
pub mod keys;
pub mod quote;
pub mod session;
