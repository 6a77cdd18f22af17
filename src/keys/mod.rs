// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::device::{Device, DeviceError, KeyRole};
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tss_esapi::abstraction::ek;
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::handles::KeyHandle;
use tss_esapi::interface_types::algorithm::{
    AsymmetricAlgorithm, HashingAlgorithm, PublicAlgorithm,
};
use tss_esapi::interface_types::ecc::EccCurve;
use tss_esapi::interface_types::key_bits::RsaKeyBits;
use tss_esapi::interface_types::resource_handles::Hierarchy;
use tss_esapi::structures::{
    Auth, CreateKeyResult, CreatePrimaryKeyResult, EccPoint, EccScheme, HashScheme,
    KeyDerivationFunctionScheme, Public, PublicBuilder, PublicEccParametersBuilder,
    PublicKeyRsa, PublicRsaParametersBuilder, RsaExponent, RsaScheme, SymmetricDefinitionObject,
};
use tss_esapi::traits::Marshall;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("tpm error: {0}")]
    Tpm(#[from] tss_esapi::Error),
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("empty auth value")]
    EmptyAuth,
    #[error("auth value too large (max {max} bytes)")]
    AuthTooLarge { max: usize },
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    #[default]
    Rsa,
    Ecc,
}

impl KeyAlgorithm {
    fn asymmetric(self) -> AsymmetricAlgorithm {
        match self {
            KeyAlgorithm::Rsa => AsymmetricAlgorithm::Rsa,
            KeyAlgorithm::Ecc => AsymmetricAlgorithm::Ecc,
        }
    }
}

/// A key loaded in the TPM and registered on its [`Device`]
#[derive(Debug)]
pub struct TpmKey {
    handle: KeyHandle,
    role: KeyRole,
    algorithm: KeyAlgorithm,
    public: Public,
}

impl TpmKey {
    pub fn handle(&self) -> KeyHandle {
        self.handle
    }

    pub fn role(&self) -> KeyRole {
        self.role
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn public(&self) -> &Public {
        &self.public
    }

    /// Size of the marshaled public area in bytes
    pub fn public_size(&self) -> Result<usize, tss_esapi::Error> {
        Ok(self.public.marshall()?.len())
    }
}

/// Validate an auth value before it is handed to the TPM.
pub fn to_auth(value: &[u8]) -> Result<Auth, KeyError> {
    if value.is_empty() {
        return Err(KeyError::EmptyAuth);
    }
    if value.len() > Auth::MAX_SIZE {
        return Err(KeyError::AuthTooLarge {
            max: Auth::MAX_SIZE,
        });
    }
    Ok(Auth::try_from(value.to_vec())?)
}

/// Create the Endorsement Key from the default TCG template.
pub fn create_ek(device: &mut Device, algorithm: KeyAlgorithm) -> Result<TpmKey, KeyError> {
    let handle = ek::create_ek_object(device.context(), algorithm.asymmetric(), None)?;
    device.track_key(handle, KeyRole::Endorsement);
    // ReadPublic takes no authorization, a password session would be rejected
    let (public, _, _) = device
        .context()
        .execute_without_session(|ctx| ctx.read_public(handle))?;
    info!("created EK ({algorithm:?})");

    Ok(TpmKey {
        handle,
        role: KeyRole::Endorsement,
        algorithm,
        public,
    })
}

/// Create the Storage Root Key in the owner hierarchy, protected by `password`.
pub fn create_srk(
    device: &mut Device,
    algorithm: KeyAlgorithm,
    password: &[u8],
) -> Result<TpmKey, KeyError> {
    let auth = to_auth(password)?;
    let template = storage_template(algorithm)?;

    let context = device.context();
    let CreatePrimaryKeyResult {
        key_handle,
        out_public,
        ..
    } = context.create_primary(
        Hierarchy::Owner,
        template,
        Some(auth.clone()),
        None,
        None,
        None,
    )?;
    device.track_key(key_handle, KeyRole::Storage);
    device.context().tr_set_auth(key_handle.into(), auth)?;
    info!("created SRK ({algorithm:?})");

    Ok(TpmKey {
        handle: key_handle,
        role: KeyRole::Storage,
        algorithm,
        public: out_public,
    })
}

/// Create a restricted signing key under `parent` and load it. The parent's auth value must
/// already be set on its handle.
pub fn create_and_load_aik(
    device: &mut Device,
    algorithm: KeyAlgorithm,
    parent: &TpmKey,
    usage_auth: &[u8],
) -> Result<TpmKey, KeyError> {
    let auth = to_auth(usage_auth)?;
    let template = attestation_template(algorithm)?;

    let context = device.context();
    let CreateKeyResult {
        out_private,
        out_public,
        ..
    } = context.create(parent.handle, template, Some(auth.clone()), None, None, None)?;
    let handle = context.load(parent.handle, out_private, out_public.clone())?;
    device.track_key(handle, KeyRole::Attestation);
    device.context().tr_set_auth(handle.into(), auth)?;
    info!("created and loaded AIK ({algorithm:?})");

    Ok(TpmKey {
        handle,
        role: KeyRole::Attestation,
        algorithm,
        public: out_public,
    })
}

fn storage_template(algorithm: KeyAlgorithm) -> Result<Public, KeyError> {
    let attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_no_da(true)
        .with_restricted(true)
        .with_decrypt(true)
        .build()?;

    let builder = PublicBuilder::new()
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attributes);

    let public = match algorithm {
        KeyAlgorithm::Rsa => {
            let parameters = PublicRsaParametersBuilder::new()
                .with_symmetric(SymmetricDefinitionObject::AES_128_CFB)
                .with_scheme(RsaScheme::Null)
                .with_key_bits(RsaKeyBits::Rsa2048)
                .with_exponent(RsaExponent::default())
                .with_is_decryption_key(true)
                .with_restricted(true)
                .build()?;
            builder
                .with_public_algorithm(PublicAlgorithm::Rsa)
                .with_rsa_parameters(parameters)
                .with_rsa_unique_identifier(PublicKeyRsa::default())
                .build()?
        }
        KeyAlgorithm::Ecc => {
            let parameters = PublicEccParametersBuilder::new()
                .with_symmetric(SymmetricDefinitionObject::AES_128_CFB)
                .with_ecc_scheme(EccScheme::Null)
                .with_curve(EccCurve::NistP256)
                .with_key_derivation_function_scheme(KeyDerivationFunctionScheme::Null)
                .with_is_decryption_key(true)
                .with_restricted(true)
                .build()?;
            builder
                .with_public_algorithm(PublicAlgorithm::Ecc)
                .with_ecc_parameters(parameters)
                .with_ecc_unique_identifier(EccPoint::default())
                .build()?
        }
    };
    Ok(public)
}

fn attestation_template(algorithm: KeyAlgorithm) -> Result<Public, KeyError> {
    let attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_no_da(true)
        .with_restricted(true)
        .with_sign_encrypt(true)
        .build()?;

    let builder = PublicBuilder::new()
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attributes);
    let scheme = HashScheme::new(HashingAlgorithm::Sha256);

    let public = match algorithm {
        KeyAlgorithm::Rsa => {
            let parameters = PublicRsaParametersBuilder::new()
                .with_symmetric(SymmetricDefinitionObject::Null)
                .with_scheme(RsaScheme::RsaSsa(scheme))
                .with_key_bits(RsaKeyBits::Rsa2048)
                .with_exponent(RsaExponent::default())
                .with_is_signing_key(true)
                .with_restricted(true)
                .build()?;
            builder
                .with_public_algorithm(PublicAlgorithm::Rsa)
                .with_rsa_parameters(parameters)
                .with_rsa_unique_identifier(PublicKeyRsa::default())
                .build()?
        }
        KeyAlgorithm::Ecc => {
            let parameters = PublicEccParametersBuilder::new()
                .with_symmetric(SymmetricDefinitionObject::Null)
                .with_ecc_scheme(EccScheme::EcDsa(scheme))
                .with_curve(EccCurve::NistP256)
                .with_key_derivation_function_scheme(KeyDerivationFunctionScheme::Null)
                .with_is_signing_key(true)
                .with_restricted(true)
                .build()?;
            builder
                .with_public_algorithm(PublicAlgorithm::Ecc)
                .with_ecc_parameters(parameters)
                .with_ecc_unique_identifier(EccPoint::default())
                .build()?
        }
    };
    Ok(public)
}
