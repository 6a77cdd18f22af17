// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use super::{AkPublic, Quote, QuoteSignature};
use crate::attest::AttestError;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::ecdsa::EcdsaSig;
use openssl::error::ErrorStack;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Public};
use openssl::rsa::Rsa;
use openssl::{hash::MessageDigest, sign::Verifier};
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("openssl error")]
    OpenSsl(#[from] ErrorStack),
    #[error("attestation error: {0}")]
    Attest(#[from] AttestError),
    #[error("quote is not signed by key")]
    SignatureMismatch,
    #[error("nonce mismatch")]
    NonceMismatch,
    #[error("Not a quote, that should not occur")]
    NotAQuote,
    #[error("attested data not generated by the TPM (magic 0x{0:08X})")]
    NotTpmGenerated(u32),
    #[error("pcr mismatch")]
    PcrMismatch,
}

impl AkPublic {
    /// Convert into an OpenSSL public key
    pub fn to_pkey(&self) -> Result<PKey<Public>, VerifyError> {
        let pkey = match self {
            AkPublic::Rsa { n, e } => {
                let n = BigNum::from_slice(n)?;
                let e = BigNum::from_slice(e)?;
                PKey::from_rsa(Rsa::from_public_components(n, e)?)?
            }
            AkPublic::EccP256 { x, y } => {
                let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
                let x = BigNum::from_slice(x)?;
                let y = BigNum::from_slice(y)?;
                let ec_key = EcKey::from_public_key_affine_coordinates(&group, &x, &y)?;
                PKey::from_ec_key(ec_key)?
            }
        };
        Ok(pkey)
    }
}

impl Quote {
    /// Verify a Quote against the AIK public key bundled with it
    ///
    /// This proves the quote is consistent, not that the AIK lives in a genuine TPM.
    pub fn verify(&self, nonce: &[u8]) -> Result<(), VerifyError> {
        let pub_key = self.ak_pub.to_pkey()?;
        self.verify_with_key(&pub_key, nonce)
    }

    /// Verify a Quote's signature, magic, nonce and PCR digest
    ///
    /// # Arguments
    ///
    /// * `pub_key` - A public key to verify the Quote's signature
    ///
    /// * `nonce` - A byte slice to verify the Quote's nonce
    pub fn verify_with_key(&self, pub_key: &PKey<Public>, nonce: &[u8]) -> Result<(), VerifyError> {
        self.verify_signature(pub_key)?;

        let attested = self.attested()?;
        if !attested.is_tpm_generated() {
            return Err(VerifyError::NotTpmGenerated(attested.magic));
        }
        if nonce != attested.extra_data {
            return Err(VerifyError::NonceMismatch);
        }

        self.verify_pcrs()?;

        Ok(())
    }

    /// Verify a Quote's signature
    ///
    /// # Arguments
    ///
    /// * `pub_key` - A public key to verify the Quote's signature
    pub fn verify_signature(&self, pub_key: &PKey<Public>) -> Result<(), VerifyError> {
        let signature = match &self.signature {
            QuoteSignature::RsaSsa(signature) => signature.clone(),
            QuoteSignature::EcDsa { r, s } => {
                let r = BigNum::from_slice(r)?;
                let s = BigNum::from_slice(s)?;
                EcdsaSig::from_private_components(r, s)?.to_der()?
            }
        };

        let mut verifier = Verifier::new(MessageDigest::sha256(), pub_key)?;
        verifier.update(&self.message)?;
        let is_verified = verifier.verify(&signature)?;
        if !is_verified {
            return Err(VerifyError::SignatureMismatch);
        }
        Ok(())
    }

    /// Verify that the TPM Quote's PCR digest matches the digest of the bundled PCR values
    pub fn verify_pcrs(&self) -> Result<(), VerifyError> {
        let attested = self.attested()?;
        let Some(info) = attested.quote() else {
            return Err(VerifyError::NotAQuote);
        };

        if self.pcrs_digest()[..] != info.pcr_digest[..] {
            return Err(VerifyError::PcrMismatch);
        }

        Ok(())
    }
}
