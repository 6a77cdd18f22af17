// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::attest::{self, AttestError, AttestedData};
use crate::device::{Device, DeviceError, KeyRole};
use crate::keys::{self, KeyAlgorithm, KeyError, TpmKey};
use crate::session::{self, SessionError};
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tss_esapi::abstraction::pcr;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::pcr_selection_list::PcrSelectionListBuilder;
use tss_esapi::structures::pcr_slot::PcrSlot;
use tss_esapi::structures::{AttestInfo, Data, Public, Signature, SignatureScheme};
use tss_esapi::traits::Marshall;
use tss_esapi::tss2_esys::TSS2_RC;
use tss_esapi::WrapperErrorKind;

#[cfg(feature = "verifier")]
mod verify;

#[cfg(feature = "verifier")]
pub use verify::VerifyError;

/// PCR 16 is reserved for debugging and may be extended freely
pub const DEBUG_PCR: u8 = 16;
const RSA_DEFAULT_EXPONENT: u32 = 65537;
const PCR_SLOTS: [PcrSlot; 24] = [
    PcrSlot::Slot0,
    PcrSlot::Slot1,
    PcrSlot::Slot2,
    PcrSlot::Slot3,
    PcrSlot::Slot4,
    PcrSlot::Slot5,
    PcrSlot::Slot6,
    PcrSlot::Slot7,
    PcrSlot::Slot8,
    PcrSlot::Slot9,
    PcrSlot::Slot10,
    PcrSlot::Slot11,
    PcrSlot::Slot12,
    PcrSlot::Slot13,
    PcrSlot::Slot14,
    PcrSlot::Slot15,
    PcrSlot::Slot16,
    PcrSlot::Slot17,
    PcrSlot::Slot18,
    PcrSlot::Slot19,
    PcrSlot::Slot20,
    PcrSlot::Slot21,
    PcrSlot::Slot22,
    PcrSlot::Slot23,
];

fn to_pcr_slots(pcrs: &[u8]) -> Result<Vec<PcrSlot>, QuoteError> {
    if pcrs.is_empty() {
        return Err(QuoteError::NoPcrs);
    }
    let mut pcrs = pcrs.to_vec();
    pcrs.sort_unstable();
    pcrs.dedup();

    pcrs.into_iter()
        .map(|pcr| {
            PCR_SLOTS
                .get(usize::from(pcr))
                .copied()
                .ok_or(QuoteError::InvalidPcr(pcr))
        })
        .collect()
}

#[derive(Clone, Debug)]
pub struct QuoteConfig {
    pub algorithm: KeyAlgorithm,
    /// PCR indexes of the SHA-256 bank to sign
    pub pcrs: Vec<u8>,
    /// Caller supplied nonce, reflected as the attestation's extra data
    pub qualifying_data: Vec<u8>,
    /// Auth value of the Storage Root Key
    pub storage_auth: Vec<u8>,
    /// Auth value of the Attestation Identity Key
    pub usage_auth: Vec<u8>,
}

impl Default for QuoteConfig {
    fn default() -> Self {
        Self {
            algorithm: KeyAlgorithm::default(),
            pcrs: vec![DEBUG_PCR],
            qualifying_data: Vec::new(),
            storage_auth: b"srk-storage-password".to_vec(),
            usage_auth: b"aik-usage-auth".to_vec(),
        }
    }
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum QuoteError {
    #[error("quote failed: {0}")]
    Tpm(#[from] tss_esapi::Error),
    #[error("invalid PCR selection: {0}")]
    Selection(#[source] tss_esapi::Error),
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("creating the endorsement key failed: {0}")]
    Endorsement(#[source] KeyError),
    #[error("creating the storage root key failed: {0}")]
    Storage(#[source] KeyError),
    #[error("starting the policy session failed: {0}")]
    Session(#[from] SessionError),
    #[error("creating the attestation key failed: {0}")]
    Attestation(#[source] KeyError),
    #[error("parsing the attestation failed: {0}")]
    Parse(#[from] AttestError),
    #[error("attestation rejected, not generated by the TPM or malformed: {0}")]
    InvalidAttestation(#[source] tss_esapi::Error),
    #[error("attested data not generated by the TPM (magic 0x{0:08X})")]
    NotTpmGenerated(u32),
    #[error("data too large")]
    DataTooLarge,
    #[error("invalid pcr number {0} (expected 0-23)")]
    InvalidPcr(u8),
    #[error("no PCR selected")]
    NoPcrs,
    #[error("Not a quote, that should not occur")]
    NotAQuote,
    #[error("Wrong signature, that should not occur")]
    WrongSignature,
    #[error("unsupported attestation key")]
    UnsupportedKey,
    #[error("reading PCRs failed: {0}")]
    ReadPcrs(#[source] tss_esapi::Error),
    #[error("PCR bank not found")]
    PcrBankNotFound,
    #[error("PCR reading error")]
    PcrRead,
}

impl QuoteError {
    /// Process exit status identifying the failed step
    pub fn exit_code(&self) -> u8 {
        match self {
            QuoteError::DataTooLarge
            | QuoteError::InvalidPcr(_)
            | QuoteError::NoPcrs
            | QuoteError::Selection(_) => 2,
            QuoteError::Endorsement(_) => 3,
            QuoteError::Storage(_) => 4,
            QuoteError::Session(_) => 5,
            QuoteError::Attestation(_) | QuoteError::UnsupportedKey => 6,
            QuoteError::Tpm(_) | QuoteError::NotAQuote | QuoteError::WrongSignature => 7,
            QuoteError::Parse(_)
            | QuoteError::InvalidAttestation(_)
            | QuoteError::NotTpmGenerated(_) => 8,
            QuoteError::ReadPcrs(_) | QuoteError::PcrBankNotFound | QuoteError::PcrRead => 9,
            QuoteError::Device(_) => 10,
        }
    }

    /// Raw TSS2 response code of the failed TPM command, if a TPM command failed
    pub fn response_code(&self) -> Option<TSS2_RC> {
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = source {
            if let Some(tss_esapi::Error::Tss2Error(rc)) = err.downcast_ref::<tss_esapi::Error>() {
                return Some(TSS2_RC::from(*rc));
            }
            source = err.source();
        }
        None
    }
}

/// Reject attested data whose magic is not `TPM_GENERATED_VALUE`
pub fn check_magic(attested: &AttestedData) -> Result<(), QuoteError> {
    if !attested.is_tpm_generated() {
        return Err(QuoteError::NotTpmGenerated(attested.magic));
    }
    Ok(())
}

// tss-esapi refuses to unmarshal a TPMS_ATTEST without TPM_GENERATED_VALUE, that surfaces as
// InvalidParam from the quote command
fn quote_command_error(err: tss_esapi::Error) -> QuoteError {
    match err {
        tss_esapi::Error::WrapperError(WrapperErrorKind::InvalidParam) => {
            QuoteError::InvalidAttestation(err)
        }
        err => QuoteError::Tpm(err),
    }
}

/// Steps reported while a quote is produced
#[derive(Debug)]
pub enum Progress<'a> {
    KeyCreated {
        role: KeyRole,
        handle: u32,
        public_size: usize,
    },
    SessionStarted {
        handle: u32,
    },
    Quoted {
        attested: &'a AttestedData,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum QuoteSignature {
    RsaSsa(Vec<u8>),
    EcDsa { r: Vec<u8>, s: Vec<u8> },
}

/// Public part of the key that signed a quote, as big-endian unsigned integers
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum AkPublic {
    Rsa { n: Vec<u8>, e: Vec<u8> },
    EccP256 { x: Vec<u8>, y: Vec<u8> },
}

impl TryFrom<&Public> for AkPublic {
    type Error = QuoteError;

    fn try_from(public: &Public) -> Result<Self, Self::Error> {
        match public {
            Public::Rsa {
                parameters, unique, ..
            } => {
                let exponent = match parameters.exponent().value() {
                    0 => RSA_DEFAULT_EXPONENT,
                    e => e,
                };
                let e = exponent.to_be_bytes();
                let first = e.iter().position(|b| *b != 0).unwrap_or(e.len() - 1);
                Ok(AkPublic::Rsa {
                    n: unique.value().to_vec(),
                    e: e[first..].to_vec(),
                })
            }
            Public::Ecc { unique, .. } => Ok(AkPublic::EccP256 {
                x: unique.x().value().to_vec(),
                y: unique.y().value().to_vec(),
            }),
            _ => Err(QuoteError::UnsupportedKey),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Quote {
    signature: QuoteSignature,
    message: Vec<u8>,
    pcrs: Vec<[u8; 32]>,
    ak_pub: AkPublic,
}

impl Quote {
    /// Retrieve sha256 PCR values from a Quote
    pub fn pcrs_sha256(&self) -> impl Iterator<Item = &[u8; 32]> {
        self.pcrs.iter()
    }

    /// Extract nonce from a Quote
    pub fn nonce(&self) -> Result<Vec<u8>, QuoteError> {
        let attested = self.attested()?;
        Ok(attested.extra_data)
    }

    /// Extract message from a Quote
    pub fn message(&self) -> Vec<u8> {
        self.message.clone()
    }

    pub fn signature(&self) -> &QuoteSignature {
        &self.signature
    }

    /// Public key of the AIK that signed the quote. It is bundled by the attester and has to be
    /// tied to a trusted EK before it means anything.
    pub fn ak_pub(&self) -> &AkPublic {
        &self.ak_pub
    }

    /// Parse the signed attestation structure
    pub fn attested(&self) -> Result<AttestedData, AttestError> {
        attest::parse(&self.message)
    }

    /// Digest over the bundled PCR values, as a TPM computes the quote's `pcrDigest`
    pub fn pcrs_digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for pcr in self.pcrs.iter() {
            hasher.update(pcr);
        }
        hasher.finalize().into()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Get a signed Quote over the configured PCRs with a freshly created AIK
pub fn get_quote(device: &mut Device, config: &QuoteConfig) -> Result<Quote, QuoteError> {
    get_quote_with_progress(device, config, |_| {})
}

/// Like [`get_quote`], reporting each completed step to `on_progress`.
///
/// Keys and the policy session are released before returning. On failure they are released
/// when `device` is dropped.
pub fn get_quote_with_progress<F>(
    device: &mut Device,
    config: &QuoteConfig,
    mut on_progress: F,
) -> Result<Quote, QuoteError>
where
    F: FnMut(Progress),
{
    if config.qualifying_data.len() > Data::MAX_SIZE {
        return Err(QuoteError::DataTooLarge);
    }
    let hash_algo = HashingAlgorithm::Sha256;
    let slots = to_pcr_slots(&config.pcrs)?;
    let selection_list = PcrSelectionListBuilder::new()
        .with_selection(hash_algo, &slots)
        .build()
        .map_err(QuoteError::Selection)?;
    let algorithm = config.algorithm;

    device.use_password_session();

    let ek = keys::create_ek(device, algorithm).map_err(QuoteError::Endorsement)?;
    report_key(device, &ek, &mut on_progress).map_err(QuoteError::Endorsement)?;

    let srk = keys::create_srk(device, algorithm, &config.storage_auth)
        .map_err(QuoteError::Storage)?;
    report_key(device, &srk, &mut on_progress).map_err(QuoteError::Storage)?;

    let session = session::start_policy_session(device)?;
    on_progress(Progress::SessionStarted {
        handle: session.tpm_handle(),
    });

    let aik = keys::create_and_load_aik(device, algorithm, &srk, &config.usage_auth)
        .map_err(QuoteError::Attestation)?;
    report_key(device, &aik, &mut on_progress).map_err(QuoteError::Attestation)?;
    let ak_pub = AkPublic::try_from(aik.public())?;

    let quote_data: Data = config
        .qualifying_data
        .clone()
        .try_into()
        .map_err(|_| QuoteError::DataTooLarge)?;
    let scheme = SignatureScheme::Null;

    let context = device.context();
    let (attest, signature) = context
        .execute_with_session(Some(AuthSession::Password), |ctx| {
            ctx.quote(aik.handle(), quote_data, scheme, selection_list.clone())
        })
        .map_err(quote_command_error)?;
    info!("quote: success");

    let AttestInfo::Quote { .. } = attest.attested() else {
        return Err(QuoteError::NotAQuote);
    };
    let signature = match signature {
        Signature::RsaSsa(rsa_sig) => QuoteSignature::RsaSsa(rsa_sig.signature().value().to_vec()),
        Signature::EcDsa(ecc_sig) => QuoteSignature::EcDsa {
            r: ecc_sig.signature_r().value().to_vec(),
            s: ecc_sig.signature_s().value().to_vec(),
        },
        _ => return Err(QuoteError::WrongSignature),
    };

    let message = attest.marshall()?;
    let attested = attest::parse(&message)?;
    check_magic(&attested)?;
    on_progress(Progress::Quoted {
        attested: &attested,
    });

    context.clear_sessions();
    let pcr_data = pcr::read_all(context, selection_list).map_err(QuoteError::ReadPcrs)?;

    let pcr_bank = pcr_data
        .pcr_bank(hash_algo)
        .ok_or(QuoteError::PcrBankNotFound)?;

    let pcrs: Result<Vec<[u8; 32]>, _> = pcr_bank
        .into_iter()
        .map(|(_, digest)| digest.clone().try_into().map_err(|_| QuoteError::PcrRead))
        .collect();
    let pcrs = pcrs?;

    device.flush_session(session.session())?;
    for key in [&aik, &srk, &ek] {
        device.unload_key(key.handle())?;
    }

    Ok(Quote {
        signature,
        message,
        pcrs,
        ak_pub,
    })
}

fn report_key<F>(device: &mut Device, key: &TpmKey, on_progress: &mut F) -> Result<(), KeyError>
where
    F: FnMut(Progress),
{
    let handle = device.tpm_handle(key.handle().into())?;
    let public_size = key.public_size()?;
    on_progress(Progress::KeyCreated {
        role: key.role(),
        handle,
        public_size,
    });
    Ok(())
}
