// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

// Layouts follow "TPM 2.0 Library Part 2: Structures", Section 10.12 (TPMS_ATTEST and its
// members). All integers are big endian.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zerocopy::byteorder::{BigEndian, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Magic of every structure signed by a TPM
pub const TPM_GENERATED_VALUE: u32 = 0xff544347;
/// `TPM_ST_ATTEST_QUOTE`
pub const ST_ATTEST_QUOTE: u16 = 0x8018;
/// Upper bound of a TPM response, and thereby of any attestation blob
pub const MAX_RESPONSE_SIZE: usize = 4096;
/// `TPM_ALG_SHA256`
pub const ALG_SHA256: u16 = 0x000b;

// HASH_COUNT and PCR_SELECT_MAX of the reference implementation
const MAX_PCR_BANKS: u32 = 16;
const MAX_PCR_SELECT: u8 = 4;

#[derive(Error, Debug, PartialEq)]
pub enum AttestError {
    #[error("attestation too large ({0} bytes)")]
    TooLarge(usize),
    #[error("attestation truncated")]
    Truncated,
    #[error("too many PCR selections ({0})")]
    TooManySelections(u32),
    #[error("PCR select bitmap too large ({0} bytes)")]
    SelectTooLarge(u8),
    #[error("{0} trailing bytes after attestation")]
    TrailingBytes(usize),
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Copy, Clone, Debug)]
struct RawHeader {
    magic: U32<BigEndian>,
    attest_type: U16<BigEndian>,
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Copy, Clone, Debug)]
struct RawClockInfo {
    clock: U64<BigEndian>,
    reset_count: U32<BigEndian>,
    restart_count: U32<BigEndian>,
    safe: u8,
}

#[repr(C)]
#[derive(FromZeroes, FromBytes, AsBytes, Copy, Clone, Debug)]
struct RawSelectionHeader {
    hash: U16<BigEndian>,
    size_of_select: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockInfo {
    pub clock: u64,
    pub reset_count: u32,
    pub restart_count: u32,
    pub safe: bool,
}

/// One bank of a `TPML_PCR_SELECTION`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrSelection {
    pub hash: u16,
    pub select: Vec<u8>,
}

impl PcrSelection {
    /// Selection of `pcrs` in the `hash` bank, with the 3 byte bitmap of a 24 PCR TPM
    pub fn new(hash: u16, pcrs: &[u8]) -> Self {
        let mut select = vec![0u8; 3];
        for &pcr in pcrs {
            let byte = usize::from(pcr / 8);
            if byte >= select.len() {
                select.resize(byte + 1, 0);
            }
            select[byte] |= 1 << (pcr % 8);
        }
        Self { hash, select }
    }

    /// Indexes of the selected PCRs in ascending order. Bits past PCR 255 are ignored.
    pub fn pcrs(&self) -> Vec<u8> {
        let mut pcrs = Vec::new();
        for (i, byte) in self.select.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) == 0 {
                    continue;
                }
                if let Ok(pcr) = u8::try_from(i * 8 + bit) {
                    pcrs.push(pcr);
                }
            }
        }
        pcrs
    }
}

/// `TPMS_QUOTE_INFO`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteInfo {
    pub pcr_select: Vec<PcrSelection>,
    pub pcr_digest: Vec<u8>,
}

impl QuoteInfo {
    /// Number of PCR banks covered by the quote
    pub fn selection_count(&self) -> usize {
        self.pcr_select.len()
    }

    /// PCRs selected in the given bank
    pub fn selected_pcrs(&self, hash: u16) -> Vec<u8> {
        self.pcr_select
            .iter()
            .filter(|s| s.hash == hash)
            .flat_map(PcrSelection::pcrs)
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attested {
    Quote(QuoteInfo),
    /// Attestation types other than quotes are kept unparsed
    Other(Vec<u8>),
}

/// A parsed `TPMS_ATTEST`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestedData {
    pub magic: u32,
    pub attest_type: u16,
    pub qualified_signer: Vec<u8>,
    pub extra_data: Vec<u8>,
    pub clock_info: ClockInfo,
    pub firmware_version: u64,
    pub attested: Attested,
}

impl AttestedData {
    pub fn is_tpm_generated(&self) -> bool {
        self.magic == TPM_GENERATED_VALUE
    }

    pub fn quote(&self) -> Option<&QuoteInfo> {
        match &self.attested {
            Attested::Quote(info) => Some(info),
            Attested::Other(_) => None,
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], AttestError> {
        if self.buf.len() < len {
            return Err(AttestError::Truncated);
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn read<T: FromBytes>(&mut self) -> Result<T, AttestError> {
        let bytes = self.take(core::mem::size_of::<T>())?;
        T::read_from(bytes).ok_or(AttestError::Truncated)
    }

    // TPM2B_*: u16 size followed by that many bytes
    fn sized(&mut self) -> Result<Vec<u8>, AttestError> {
        let size: U16<BigEndian> = self.read()?;
        Ok(self.take(usize::from(size.get()))?.to_vec())
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }
}

/// Parse a marshaled `TPMS_ATTEST`.
///
/// The magic is returned as found. Use [`AttestedData::is_tpm_generated`] to check it.
pub fn parse(bytes: &[u8]) -> Result<AttestedData, AttestError> {
    if bytes.len() > MAX_RESPONSE_SIZE {
        return Err(AttestError::TooLarge(bytes.len()));
    }
    let mut reader = Reader { buf: bytes };

    let header: RawHeader = reader.read()?;
    let qualified_signer = reader.sized()?;
    let extra_data = reader.sized()?;
    let clock: RawClockInfo = reader.read()?;
    let firmware_version: U64<BigEndian> = reader.read()?;

    let attest_type = header.attest_type.get();
    let attested = match attest_type {
        ST_ATTEST_QUOTE => Attested::Quote(parse_quote_info(&mut reader)?),
        _ => {
            let rest = reader.remaining();
            Attested::Other(reader.take(rest)?.to_vec())
        }
    };

    if reader.remaining() != 0 {
        return Err(AttestError::TrailingBytes(reader.remaining()));
    }

    Ok(AttestedData {
        magic: header.magic.get(),
        attest_type,
        qualified_signer,
        extra_data,
        clock_info: ClockInfo {
            clock: clock.clock.get(),
            reset_count: clock.reset_count.get(),
            restart_count: clock.restart_count.get(),
            safe: clock.safe != 0,
        },
        firmware_version: firmware_version.get(),
        attested,
    })
}

fn parse_quote_info(reader: &mut Reader) -> Result<QuoteInfo, AttestError> {
    let count: U32<BigEndian> = reader.read()?;
    let count = count.get();
    if count > MAX_PCR_BANKS {
        return Err(AttestError::TooManySelections(count));
    }

    let mut pcr_select = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let header: RawSelectionHeader = reader.read()?;
        if header.size_of_select > MAX_PCR_SELECT {
            return Err(AttestError::SelectTooLarge(header.size_of_select));
        }
        let select = reader.take(usize::from(header.size_of_select))?.to_vec();
        pcr_select.push(PcrSelection {
            hash: header.hash.get(),
            select,
        });
    }
    let pcr_digest = reader.sized()?;

    Ok(QuoteInfo {
        pcr_select,
        pcr_digest,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Marshal a quote attestation the way a TPM would
    pub(crate) fn quote_blob(magic: u32, nonce: &[u8], pcrs: &[u8], digest: &[u8]) -> Vec<u8> {
        let mut blob = Vec::new();
        let header = RawHeader {
            magic: U32::new(magic),
            attest_type: U16::new(ST_ATTEST_QUOTE),
        };
        blob.extend_from_slice(header.as_bytes());

        let signer = [0x00, 0x0b, 0xaa, 0xbb];
        blob.extend_from_slice(&(signer.len() as u16).to_be_bytes());
        blob.extend_from_slice(&signer);
        blob.extend_from_slice(&(nonce.len() as u16).to_be_bytes());
        blob.extend_from_slice(nonce);

        let clock = RawClockInfo {
            clock: U64::new(123456),
            reset_count: U32::new(2),
            restart_count: U32::new(1),
            safe: 1,
        };
        blob.extend_from_slice(clock.as_bytes());
        blob.extend_from_slice(&0x2001_0024_0000_0000u64.to_be_bytes());

        let selection = PcrSelection::new(ALG_SHA256, pcrs);
        blob.extend_from_slice(&1u32.to_be_bytes());
        let selection_header = RawSelectionHeader {
            hash: U16::new(selection.hash),
            size_of_select: selection.select.len() as u8,
        };
        blob.extend_from_slice(selection_header.as_bytes());
        blob.extend_from_slice(&selection.select);
        blob.extend_from_slice(&(digest.len() as u16).to_be_bytes());
        blob.extend_from_slice(digest);
        blob
    }

    #[test]
    fn selection_bitmap() {
        let selection = PcrSelection::new(ALG_SHA256, &[16]);
        assert_eq!(selection.select, vec![0x00, 0x00, 0x01]);
        assert_eq!(selection.pcrs(), vec![16]);

        let selection = PcrSelection::new(ALG_SHA256, &[0, 7, 8, 23]);
        assert_eq!(selection.select, vec![0x81, 0x01, 0x80]);
        assert_eq!(selection.pcrs(), vec![0, 7, 8, 23]);
    }

    #[test]
    fn wide_selection_bitmap() {
        let mut select = vec![0u8; 40];
        select[31] = 0x80;
        select[32] = 0x01;
        select[39] = 0xff;
        let selection = PcrSelection {
            hash: ALG_SHA256,
            select,
        };
        assert_eq!(selection.pcrs(), vec![255]);
    }

    #[test]
    fn parse_quote() {
        let digest = [0x5a; 32];
        let blob = quote_blob(TPM_GENERATED_VALUE, b"challenge", &[16], &digest);
        let attested = parse(&blob).unwrap();

        assert!(attested.is_tpm_generated());
        assert_eq!(attested.attest_type, ST_ATTEST_QUOTE);
        assert_eq!(attested.extra_data, b"challenge");
        assert_eq!(attested.qualified_signer, vec![0x00, 0x0b, 0xaa, 0xbb]);
        assert_eq!(attested.clock_info.clock, 123456);
        assert_eq!(attested.clock_info.reset_count, 2);
        assert!(attested.clock_info.safe);

        let info = attested.quote().unwrap();
        assert_eq!(info.selection_count(), 1);
        assert_eq!(info.selected_pcrs(ALG_SHA256), vec![16]);
        assert_eq!(info.pcr_digest, digest);
    }

    #[test]
    fn magic_is_reported_not_rejected() {
        let blob = quote_blob(0xdeadbeef, &[], &[16], &[0; 32]);
        let attested = parse(&blob).unwrap();
        assert!(!attested.is_tpm_generated());
        assert_eq!(attested.magic, 0xdeadbeef);
    }

    #[test]
    fn truncated_and_trailing() {
        let blob = quote_blob(TPM_GENERATED_VALUE, b"nonce", &[16], &[0; 32]);
        for len in [0, 5, 20, blob.len() - 1] {
            assert_eq!(parse(&blob[..len]), Err(AttestError::Truncated));
        }

        let mut longer = blob.clone();
        longer.extend_from_slice(&[0, 0]);
        assert_eq!(parse(&longer), Err(AttestError::TrailingBytes(2)));
    }

    #[test]
    fn oversized_input() {
        let blob = vec![0; MAX_RESPONSE_SIZE + 1];
        assert_eq!(
            parse(&blob),
            Err(AttestError::TooLarge(MAX_RESPONSE_SIZE + 1))
        );
    }

    #[test]
    fn bogus_selection() {
        let mut blob = quote_blob(TPM_GENERATED_VALUE, &[], &[16], &[0; 32]);
        // header(6) + signer(2+4) + extra(2) + clock(17) + firmware(8)
        let count_offset = 6 + 6 + 2 + 17 + 8;
        blob[count_offset..count_offset + 4].copy_from_slice(&17u32.to_be_bytes());
        assert_eq!(parse(&blob), Err(AttestError::TooManySelections(17)));

        let mut blob = quote_blob(TPM_GENERATED_VALUE, &[], &[16], &[0; 32]);
        blob[count_offset + 4 + 2] = 9;
        assert_eq!(parse(&blob), Err(AttestError::SelectTooLarge(9)));
    }

    #[test]
    fn other_attestation_types_stay_raw() {
        let mut blob = quote_blob(TPM_GENERATED_VALUE, &[], &[16], &[0; 32]);
        // TPM_ST_ATTEST_CERTIFY
        blob[4..6].copy_from_slice(&0x8017u16.to_be_bytes());
        let attested = parse(&blob).unwrap();
        assert!(attested.quote().is_none());
        assert!(matches!(attested.attested, Attested::Other(ref raw) if !raw.is_empty()));
    }
}
