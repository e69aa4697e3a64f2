use std::collections::HashMap;

use chipdoc::iso7816::apdu::{Apdu, Response, ResponseTrailer};
use chipdoc::iso7816::card::{CommunicationError, SmartCard};
use chipdoc::vevr;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};


/// A fake registration card: SELECT by application identifier, SELECT of an
/// elementary file by identifier, and chunked READ BINARY.
struct FakeRegistrationCard {
    files: HashMap<u16, Vec<u8>>,
    selected: Option<u16>,
}
impl FakeRegistrationCard {
    fn status(sw1: u8, sw2: u8) -> Result<Response, CommunicationError> {
        Ok(Response {
            data: Vec::with_capacity(0),
            trailer: ResponseTrailer::new(sw1, sw2),
        })
    }
}
impl SmartCard for FakeRegistrationCard {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        match request.header.to_be_u32() {
            0x00_A4_04_0C => {
                // SELECT by DF name
                if request.data.request_data() == Some(&vevr::APPLICATION_ID[..]) {
                    Self::status(0x90, 0x00)
                } else {
                    Self::status(0x6A, 0x82)
                }
            },
            0x00_A4_02_0C => {
                // SELECT EF by file identifier
                let Some(data) = request.data.request_data() else {
                    return Self::status(0x67, 0x00);
                };
                if data.len() != 2 {
                    return Self::status(0x67, 0x00);
                }
                let file_id = u16::from_be_bytes([data[0], data[1]]);
                if self.files.contains_key(&file_id) {
                    self.selected = Some(file_id);
                    Self::status(0x90, 0x00)
                } else {
                    Self::status(0x6A, 0x82)
                }
            },
            header if header >> 16 == 0x00_B0 => {
                // READ BINARY
                let Some(contents) = self.selected.and_then(|id| self.files.get(&id)) else {
                    return Self::status(0x69, 0x86);
                };
                let offset = usize::from(u16::from_be_bytes([request.header.p1, request.header.p2]));
                if offset > contents.len() {
                    return Self::status(0x6B, 0x00);
                }
                let end = contents.len().min(offset + 256);
                Ok(Response {
                    data: contents[offset..end].to_vec(),
                    trailer: ResponseTrailer::new(0x90, 0x00),
                })
            },
            _ => Self::status(0x69, 0x88),
        }
    }
}


fn registration_card() -> (FakeRegistrationCard, Vec<u8>, Vec<u8>) {
    // one file long enough to need two READ BINARY rounds
    let mut large_file = vec![0x04, 0x82, 0x01, 0x28];
    large_file.extend_from_slice(&[0xAB; 296]);
    let small_file = vec![0x5B, 0x03, 0x41, 0x42, 0x43];

    let mut signed_data = large_file.clone();
    signed_data.extend_from_slice(&small_file);

    let signing_key = SigningKey::from_slice(&[0x02; 32]).unwrap();
    let signature: Signature = signing_key.sign(&signed_data);
    let signature_der = signature.to_der().as_bytes().to_vec();

    let layout = vevr::RegistrationLayout::default();
    let mut files = HashMap::new();
    files.insert(layout.data_files[0], large_file);
    files.insert(layout.data_files[1], small_file);
    files.insert(layout.certificate_file, b"not a certificate".to_vec());
    files.insert(layout.signature_file, signature_der.clone());

    let card = FakeRegistrationCard {
        files,
        selected: None,
    };
    (card, signed_data, signature_der)
}

#[test]
fn test_read_registration() {
    let (mut card, signed_data, signature_der) = registration_card();
    let layout = vevr::RegistrationLayout::default();

    vevr::select_application(&mut card).expect("failed to select the application");
    let registration = vevr::read_registration(&mut card, &layout)
        .expect("failed to read the registration files");

    assert_eq!(registration.data_files.len(), 2);
    assert_eq!(registration.data_files[0].file_id, layout.data_files[0]);
    assert_eq!(registration.data_files[0].contents.len(), 300);
    assert_eq!(registration.data_files[1].contents, [0x5B, 0x03, 0x41, 0x42, 0x43]);
    assert_eq!(registration.signed_data(), signed_data);
    assert_eq!(registration.signature, signature_der);

    // the certificate file on this card is garbage, so verification must
    // fail at certificate parsing, not at the signature
    assert!(matches!(registration.verify(), Err(vevr::Error::Certificate)));
}

#[test]
fn test_read_registration_with_missing_file() {
    let (mut card, _signed_data, _signature_der) = registration_card();
    let layout = vevr::RegistrationLayout {
        data_files: vec![0xD0FF],
        ..vevr::RegistrationLayout::default()
    };

    vevr::select_application(&mut card).expect("failed to select the application");
    assert!(matches!(
        vevr::read_registration(&mut card, &layout),
        Err(vevr::Error::Read(chipdoc::iso7816::file::ReadError::FileNotFound)),
    ));
}
