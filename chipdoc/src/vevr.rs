//! Reading and verifying VEVR-01 vehicle registration cards.
//!
//! The registration application stores its data as BER-TLV streams in
//! transparent elementary files under one dedicated file: the registration
//! data itself, an X.509 certificate, and an ECDSA signature over the
//! concatenated registration data. Verification checks the signature
//! (ECDSA over SHA-256 on the P-256 curve) against the certificate's
//! subject public key.


use std::fmt;

use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use tracing::instrument;
use x509_cert::der::Decode;
use x509_cert::Certificate;

use crate::ber;
use crate::iso7816::apdu::{Apdu, CommandHeader, Data};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::iso7816::file::{self, ReadError};
use crate::iso7816::SW_OK;


/// Application identifier of the VEVR-01 registration application.
pub const APPLICATION_ID: [u8; 11] = [
    0xA0, 0x00, 0x00, 0x04, 0x56, 0x45, 0x56, 0x52, 0x2D, 0x30, 0x31,
];


/// The file identifiers making up one registration file set.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RegistrationLayout {
    /// Data files, in the order the signature covers them.
    pub data_files: Vec<u16>,
    pub certificate_file: u16,
    pub signature_file: u16,
}
impl Default for RegistrationLayout {
    fn default() -> Self {
        Self {
            data_files: vec![0xD001, 0xD011],
            certificate_file: 0xC001,
            signature_file: 0xE001,
        }
    }
}


/// One file as read from the card: its identifier and the unmodified
/// BER-TLV stream.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RegistrationFile {
    pub file_id: u16,
    pub contents: Vec<u8>,
}

/// A complete registration file set.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Registration {
    pub data_files: Vec<RegistrationFile>,
    pub certificate: Vec<u8>,
    pub signature: Vec<u8>,
}
impl Registration {
    /// The byte string the card's signature covers: the raw data files
    /// concatenated in layout order.
    pub fn signed_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        for file in &self.data_files {
            data.extend_from_slice(&file.contents);
        }
        data
    }

    /// Verifies the registration signature against the certificate.
    pub fn verify(&self) -> Result<(), Error> {
        verify_signature(&self.signed_data(), &self.certificate, &self.signature)
    }
}


#[derive(Debug)]
pub enum Error {
    Communication(CommunicationError),
    Read(ReadError),
    SelectFailed { sw: u16 },
    Tlv(ber::Error),
    Certificate,
    SignatureFormat,
    BadSignature,
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Communication(e)
                => write!(f, "communication failed: {}", e),
            Self::Read(e)
                => write!(f, "file read failed: {}", e),
            Self::SelectFailed { sw }
                => write!(f, "application selection failed with status code 0x{:04X}", sw),
            Self::Tlv(e)
                => write!(f, "registration data is not a valid TLV stream: {}", e),
            Self::Certificate
                => write!(f, "certificate cannot be parsed or carries no P-256 key"),
            Self::SignatureFormat
                => write!(f, "signature is neither DER nor 64 raw bytes"),
            Self::BadSignature
                => write!(f, "signature does not verify against the registration data"),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Communication(e) => Some(e),
            Self::Read(e) => Some(e),
            Self::Tlv(e) => Some(e),
            _ => None,
        }
    }
}
impl From<CommunicationError> for Error {
    fn from(value: CommunicationError) -> Self { Self::Communication(value) }
}
impl From<ReadError> for Error {
    fn from(value: ReadError) -> Self { Self::Read(value) }
}
impl From<ber::Error> for Error {
    fn from(value: ber::Error) -> Self { Self::Tlv(value) }
}


/// Selects the registration application by its DF name.
#[instrument(skip(card))]
pub fn select_application(card: &mut dyn SmartCard) -> Result<(), Error> {
    let request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0xA4, // SELECT
            p1: 0b000_001_00, // select by DF name (application identifier)
            p2: 0b0000_11_00, // return no metadata, return first or only occurrence
        },
        data: Data::RequestDataShort {
            request_data: APPLICATION_ID.to_vec(),
        },
    };
    let response = card.communicate(&request)?;
    if response.trailer.to_word() != SW_OK {
        return Err(Error::SelectFailed { sw: response.trailer.to_word() });
    }
    Ok(())
}

/// Reads a complete registration file set.
///
/// The data files must parse as TLV streams; the certificate and signature
/// files are taken as they come.
#[instrument(skip(card))]
pub fn read_registration(
    card: &mut dyn SmartCard,
    layout: &RegistrationLayout,
) -> Result<Registration, Error> {
    let mut data_files = Vec::with_capacity(layout.data_files.len());
    for &file_id in &layout.data_files {
        let contents = file::read_transparent(card, &file::select_ef(file_id))?;
        ber::decode_all(&contents)?;
        data_files.push(RegistrationFile { file_id, contents });
    }

    let certificate = file::read_transparent(card, &file::select_ef(layout.certificate_file))?;
    let signature = file::read_transparent(card, &file::select_ef(layout.signature_file))?;

    Ok(Registration {
        data_files,
        certificate,
        signature,
    })
}


/// Extracts the subject public key of a DER-encoded X.509 certificate as a
/// P-256 verifying key.
pub fn verifying_key_from_certificate(certificate_der: &[u8]) -> Result<VerifyingKey, Error> {
    let certificate = Certificate::from_der(certificate_der)
        .map_err(|_| Error::Certificate)?;
    let public_key = certificate.tbs_certificate.subject_public_key_info
        .subject_public_key
        .as_bytes()
        .ok_or(Error::Certificate)?;
    VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|_| Error::Certificate)
}

/// Peels a possible context-specific wrapper off the signature file: cards
/// either store the bare DER signature or tuck it into a single data object.
fn signature_bytes(contents: &[u8]) -> Vec<u8> {
    match ber::decode_one(contents) {
        Ok(Some((block, rest))) if rest.is_empty() && block.class == ber::Class::ContextSpecific => {
            match block.primitive_value() {
                Some(value) => value.to_vec(),
                None => contents.to_vec(),
            }
        },
        _ => contents.to_vec(),
    }
}

fn parse_signature(bytes: &[u8]) -> Result<Signature, Error> {
    if let Ok(signature) = Signature::from_der(bytes) {
        return Ok(signature);
    }
    // fixed-length r || s
    Signature::from_slice(bytes)
        .map_err(|_| Error::SignatureFormat)
}

/// Verifies an ECDSA-over-SHA256 signature on `data` using the subject
/// public key of `certificate_der`.
pub fn verify_signature(data: &[u8], certificate_der: &[u8], signature: &[u8]) -> Result<(), Error> {
    let verifying_key = verifying_key_from_certificate(certificate_der)?;
    let signature = parse_signature(&signature_bytes(signature))?;
    verifying_key.verify(data, &signature)
        .map_err(|_| Error::BadSignature)
}


#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::SigningKey;

    fn test_key() -> SigningKey {
        SigningKey::from_slice(&[0x01; 32]).unwrap()
    }

    #[test]
    fn test_parse_signature_der_and_raw() {
        let signing_key = test_key();
        let data = b"registration data";
        let signature: Signature = signing_key.sign(data);

        let from_der = parse_signature(signature.to_der().as_bytes()).unwrap();
        assert_eq!(from_der, signature);

        let from_raw = parse_signature(signature.to_bytes().as_slice()).unwrap();
        assert_eq!(from_raw, signature);

        assert!(matches!(
            parse_signature(&[0x01, 0x02, 0x03]),
            Err(Error::SignatureFormat),
        ));
    }

    #[test]
    fn test_signature_bytes_unwraps_data_object() {
        let signing_key = test_key();
        let signature: Signature = signing_key.sign(b"registration data");
        let der = signature.to_der();

        // bare
        assert_eq!(signature_bytes(der.as_bytes()), der.as_bytes());

        // wrapped in a context-specific data object
        let wrapped = ber::Block::primitive(ber::Class::ContextSpecific, 0x37, der.as_bytes().to_vec())
            .to_bytes();
        assert_eq!(signature_bytes(&wrapped), der.as_bytes());
    }

    #[test]
    fn test_verify_detached() {
        let signing_key = test_key();
        let verifying_key = VerifyingKey::from(&signing_key);
        let data = b"registration data";
        let signature: Signature = signing_key.sign(data);

        assert!(verifying_key.verify(data, &signature).is_ok());
        assert!(verifying_key.verify(b"tampered data", &signature).is_err());
    }

    #[test]
    fn test_garbage_certificate_is_rejected() {
        assert!(matches!(
            verifying_key_from_certificate(&[0x30, 0x03, 0x01, 0x02, 0x03]),
            Err(Error::Certificate),
        ));
    }
}
