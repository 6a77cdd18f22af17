// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// Needs a TPM, e.g. `TCTI=mssim:host=localhost,port=2321 cargo test --features integration_test`

#[cfg(feature = "integration_test")]
mod tests {
    use pcr_quote::attest::ALG_SHA256;
    use pcr_quote::device::Device;
    use pcr_quote::keys::{self, KeyAlgorithm, KeyError};
    use pcr_quote::open_device;
    use pcr_quote::quote::{self, QuoteConfig, QuoteError, DEBUG_PCR};
    use std::sync::{Mutex, MutexGuard};
    use tss_esapi::interface_types::session_handles::AuthSession;

    // The TPM's handle slots are shared, one test at a time
    static TPM: Mutex<()> = Mutex::new(());

    fn lock_tpm() -> MutexGuard<'static, ()> {
        TPM.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn loaded_handles() -> (Vec<u32>, Vec<u32>) {
        let mut device = open_device(None).unwrap();
        let transient = device.transient_handles().unwrap();
        let sessions = device.loaded_sessions().unwrap();
        (transient, sessions)
    }

    #[test]
    fn quote_debug_pcr() {
        let _tpm = lock_tpm();
        let mut device = open_device(None).unwrap();
        let quote = quote::get_quote(&mut device, &QuoteConfig::default()).unwrap();

        let attested = quote.attested().unwrap();
        assert!(attested.is_tpm_generated());
        let info = attested.quote().unwrap();
        assert_eq!(info.selection_count(), 1);
        assert_eq!(info.selected_pcrs(ALG_SHA256), vec![DEBUG_PCR]);
        assert_eq!(quote.pcrs_sha256().count(), 1);

        device.close().unwrap();
    }

    #[test]
    fn quote_with_nonce_verifies() {
        let _tpm = lock_tpm();
        let mut device = open_device(None).unwrap();
        let nonce = "challenge".as_bytes().to_vec();
        let config = QuoteConfig {
            qualifying_data: nonce.clone(),
            ..Default::default()
        };
        let quote = quote::get_quote(&mut device, &config).unwrap();
        assert_eq!(quote.nonce().unwrap(), nonce);

        #[cfg(feature = "verifier")]
        quote.verify(&nonce).unwrap();
    }

    #[test]
    fn ecc_quote() {
        let _tpm = lock_tpm();
        let mut device = open_device(None).unwrap();
        let config = QuoteConfig {
            algorithm: KeyAlgorithm::Ecc,
            pcrs: vec![0, DEBUG_PCR],
            ..Default::default()
        };
        let quote = quote::get_quote(&mut device, &config).unwrap();
        let attested = quote.attested().unwrap();
        let info = attested.quote().unwrap();
        assert_eq!(info.selected_pcrs(ALG_SHA256), vec![0, DEBUG_PCR]);
        assert_eq!(quote.pcrs_sha256().count(), 2);

        #[cfg(feature = "verifier")]
        quote.verify(&[]).unwrap();
    }

    #[test]
    fn ek_keeps_password_session() {
        let _tpm = lock_tpm();
        let mut device = open_device(None).unwrap();
        device.use_password_session();

        let ek = keys::create_ek(&mut device, KeyAlgorithm::Rsa).unwrap();
        assert!(ek.public_size().unwrap() > 0);
        assert!(matches!(device.sessions().0, Some(AuthSession::Password)));

        device.unload_key(ek.handle()).unwrap();
    }

    #[test]
    fn no_handles_leak() {
        let _tpm = lock_tpm();
        let before = loaded_handles();

        let mut device = open_device(None).unwrap();
        quote::get_quote(&mut device, &QuoteConfig::default()).unwrap();
        drop(device);

        assert_eq!(loaded_handles(), before);
    }

    #[test]
    fn empty_storage_auth_fails_before_quoting() {
        let _tpm = lock_tpm();
        let before = loaded_handles();

        let mut device = open_device(None).unwrap();
        let config = QuoteConfig {
            storage_auth: Vec::new(),
            ..Default::default()
        };
        let error = quote::get_quote(&mut device, &config).unwrap_err();
        assert!(matches!(error, QuoteError::Storage(KeyError::EmptyAuth)));
        assert_ne!(error.exit_code(), 0);
        drop(device);

        assert_eq!(loaded_handles(), before);
    }

    #[test]
    fn empty_usage_auth_fails_before_quoting() {
        let _tpm = lock_tpm();
        let before = loaded_handles();

        let mut device: Device = open_device(None).unwrap();
        let config = QuoteConfig {
            usage_auth: Vec::new(),
            ..Default::default()
        };
        let mut quoted = false;
        let error = quote::get_quote_with_progress(&mut device, &config, |progress| {
            if let quote::Progress::Quoted { .. } = progress {
                quoted = true;
            }
        })
        .unwrap_err();
        assert!(matches!(error, QuoteError::Attestation(KeyError::EmptyAuth)));
        assert!(!quoted);
        drop(device);

        assert_eq!(loaded_handles(), before);
    }
}
