use std::collections::VecDeque;

use chipdoc::ber::{Block, Class};
use chipdoc::crypt;
use chipdoc::iso7816::apdu::{Apdu, Case, CommandHeader, Data, Response, ResponseTrailer};
use chipdoc::iso7816::card::{CommunicationError, SmartCard};
use chipdoc::secure_messaging::{self, SecureChannel};
use hex_literal::hex;


// Material from the worked Secure Messaging example in ICAO Doc 9303
// Part 11 Appendix D.
const K_SEED: [u8; 16] = hex!("239AB9CB282DAF66231DC5A4DF6BFBAE");
const RND_IC: [u8; 8] = hex!("4608F91988702212");
const RND_IFD: [u8; 8] = hex!("781723860C06C226");
const K_IFD: [u8; 16] = hex!("0B795240CB7049B01C19B33E32804F0B");

// EXTERNAL AUTHENTICATE cryptogram and response, each E || MAC
const EIFD_AND_MIFD: [u8; 40] = hex!("
    72C29C2371CC9BDB65B779B8E8D37B29ECC154AA56A8799F
    AE2F498F76ED92F25F1448EEA8AD90A7
");
const EIC_AND_MIC: [u8; 40] = hex!("
    46B9342A41396CD7386BF5803104D7CEDC122B9132139BAF
    2EEDC94EE178534F2F2D235D074D7449
");

// ciphertexts and MACs of the wrapped exchanges that follow the handshake
const SELECT_COMMAND_CIPHERTEXT: [u8; 8] = hex!("6375432908C044F6");
const SELECT_COMMAND_MAC: [u8; 8] = hex!("BF8B92D635FF24F8");
const SELECT_RESPONSE_MAC: [u8; 8] = hex!("FA855A5D4C50A8ED");
const READ_4_COMMAND_MAC: [u8; 8] = hex!("ED6705417E96BA55");
const READ_4_RESPONSE_CIPHERTEXT: [u8; 8] = hex!("9FF0EC34F9922651");
const READ_4_RESPONSE_MAC: [u8; 8] = hex!("AD55CC17140B2DED");
const READ_REST_COMMAND_MAC: [u8; 8] = hex!("2EA28A70F3C7B535");
const READ_REST_RESPONSE_CIPHERTEXT: [u8; 24] = hex!("FB9235F4E4037F2327DCC8964F1F9B8C30F42C8E2FFF224A");
const READ_REST_RESPONSE_MAC: [u8; 8] = hex!("C8B2787EAEA07D74");

// the send-sequence counter once the wrapped SELECT and its response have
// each bumped it
const SSC_AFTER_SELECT_RESPONSE: [u8; 8] = hex!("887022120C06C228");


fn encrypted_object(ciphertext: &[u8]) -> Block {
    let mut value = Vec::with_capacity(1 + ciphertext.len());
    value.push(0x01); // ISO 7816 padding
    value.extend_from_slice(ciphertext);
    Block::primitive(Class::ContextSpecific, 0x07, value)
}

fn expected_length_object(length: u8) -> Block {
    Block::primitive(Class::ContextSpecific, 0x17, vec![length])
}

fn status_object(sw1: u8, sw2: u8) -> Block {
    Block::primitive(Class::ContextSpecific, 0x19, vec![sw1, sw2])
}

fn mac_object(mac: &[u8]) -> Block {
    Block::primitive(Class::ContextSpecific, 0x0E, mac.to_vec())
}

fn body_of(blocks: &[Block]) -> Vec<u8> {
    let mut body = Vec::new();
    for block in blocks {
        block.write_bytes(&mut body);
    }
    body
}

fn ok_with(data: Vec<u8>) -> Response {
    Response {
        data,
        trailer: ResponseTrailer::new(0x90, 0x00),
    }
}


/// One expected command and the canned answer to it.
struct Exchange {
    description: &'static str,
    header: u32,
    case: Case,
    command_body: Option<Vec<u8>>,
    response_length: Option<usize>,
    response: Response,
}

/// A card that plays back a fixed transcript, checking every incoming
/// command against the next expected one.
struct CardScript {
    exchanges: VecDeque<Exchange>,
}
impl CardScript {
    fn into_channel(self) -> SecureChannel {
        let card: Box<dyn SmartCard> = Box::new(self);
        chipdoc::bac::establish_from_values(card, &K_SEED, &RND_IC, &RND_IFD, &K_IFD)
            .expect("failed to establish the channel")
    }
}
impl SmartCard for CardScript {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        let Some(exchange) = self.exchanges.pop_front() else {
            panic!("command past the end of the script: {:?}", request);
        };
        assert_eq!(request.header.to_be_u32(), exchange.header, "{}: header", exchange.description);
        assert_eq!(request.data.case(), exchange.case, "{}: case", exchange.description);
        assert_eq!(request.data.request_data(), exchange.command_body.as_deref(), "{}: command body", exchange.description);
        assert_eq!(request.data.response_data_length(), exchange.response_length, "{}: expected length", exchange.description);
        Ok(exchange.response)
    }
}

fn handshake() -> Vec<Exchange> {
    vec![
        Exchange {
            description: "GET CHALLENGE",
            header: 0x00_84_00_00,
            case: Case::Case2Short,
            command_body: None,
            response_length: Some(8),
            response: ok_with(RND_IC.to_vec()),
        },
        Exchange {
            description: "EXTERNAL AUTHENTICATE",
            header: 0x00_82_00_00,
            case: Case::Case4Short,
            command_body: Some(EIFD_AND_MIFD.to_vec()),
            response_length: Some(0x28),
            response: ok_with(EIC_AND_MIC.to_vec()),
        },
    ]
}

/// The wrapped form of [`select_ef_com`]: every wrapped command goes out as
/// case 4 short asking for up to 256 bytes, whatever its original case was.
fn select_exchange(response: Response) -> Exchange {
    Exchange {
        description: "wrapped SELECT EF.COM",
        header: 0x0C_A4_02_0C,
        case: Case::Case4Short,
        command_body: Some(body_of(&[
            encrypted_object(&SELECT_COMMAND_CIPHERTEXT),
            mac_object(&SELECT_COMMAND_MAC),
        ])),
        response_length: Some(256),
        response,
    }
}

fn channel_for(extra: Vec<Exchange>) -> SecureChannel {
    let mut exchanges = handshake();
    exchanges.extend(extra);
    CardScript { exchanges: exchanges.into() }.into_channel()
}

fn select_ef_com() -> Apdu {
    Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0xA4,
            p1: 0x02,
            p2: 0x0C,
        },
        data: Data::RequestDataShort {
            request_data: vec![0x01, 0x1E],
        },
    }
}

fn read_binary(offset: u16, length: u8) -> Apdu {
    Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0xB0,
            p1: (offset >> 8) as u8,
            p2: (offset & 0xFF) as u8,
        },
        data: Data::ResponseDataShort {
            response_data_length: length,
        },
    }
}


#[test]
fn test_bac_and_secure_reads() {
    let mut channel = channel_for(vec![
        select_exchange(ok_with(body_of(&[
            status_object(0x90, 0x00),
            mac_object(&SELECT_RESPONSE_MAC),
        ]))),
        Exchange {
            description: "wrapped READ BINARY of the first four bytes",
            header: 0x0C_B0_00_00,
            case: Case::Case4Short,
            command_body: Some(body_of(&[
                expected_length_object(4),
                mac_object(&READ_4_COMMAND_MAC),
            ])),
            response_length: Some(256),
            response: ok_with(body_of(&[
                encrypted_object(&READ_4_RESPONSE_CIPHERTEXT),
                status_object(0x90, 0x00),
                mac_object(&READ_4_RESPONSE_MAC),
            ])),
        },
        Exchange {
            description: "wrapped READ BINARY of the remainder",
            header: 0x0C_B0_00_04,
            case: Case::Case4Short,
            command_body: Some(body_of(&[
                expected_length_object(0x12),
                mac_object(&READ_REST_COMMAND_MAC),
            ])),
            response_length: Some(256),
            response: ok_with(body_of(&[
                encrypted_object(&READ_REST_RESPONSE_CIPHERTEXT),
                status_object(0x90, 0x00),
                mac_object(&READ_REST_RESPONSE_MAC),
            ])),
        },
    ]);

    let select = channel.communicate(&select_ef_com())
        .expect("failed to select EF.COM");
    assert_eq!(select.trailer.to_word(), 0x9000);
    assert!(select.data.is_empty());

    let read_four = channel.communicate(&read_binary(0, 4))
        .expect("failed to read 4 bytes of EF.COM");
    assert_eq!(read_four.trailer.to_word(), 0x9000);
    assert_eq!(read_four.data, hex!("60145F01"));

    let read_rest = channel.communicate(&read_binary(4, 0x12))
        .expect("failed to read rest of EF.COM");
    assert_eq!(read_rest.trailer.to_word(), 0x9000);
    assert_eq!(read_rest.data, hex!("04303130365F36063034303030305C026175"));
}

#[test]
fn test_status_only_response_passes_through() {
    let mut channel = channel_for(vec![select_exchange(ok_with(Vec::new()))]);

    let response = channel.communicate(&select_ef_com()).expect("transmission failed");
    assert_eq!(response.trailer.to_word(), 0x9000);
    assert!(response.data.is_empty());
}

#[test]
fn test_missing_response_mac_is_tolerated() {
    // only a status object, no MAC: the channel skips verification
    let mut channel = channel_for(vec![select_exchange(ok_with(body_of(&[
        status_object(0x90, 0x00),
    ])))]);

    let response = channel.communicate(&select_ef_com()).expect("transmission failed");
    assert_eq!(response.trailer.to_word(), 0x9000);
    assert!(response.data.is_empty());
}

#[test]
fn test_corrupted_mac_poisons_channel() {
    let mut tampered_mac = SELECT_RESPONSE_MAC;
    tampered_mac[7] ^= 0x01;
    let mut channel = channel_for(vec![select_exchange(ok_with(body_of(&[
        status_object(0x90, 0x00),
        mac_object(&tampered_mac),
    ])))]);

    let error = channel.communicate(&select_ef_com())
        .expect_err("corrupted MAC was accepted");
    assert!(matches!(
        error,
        CommunicationError::SecureMessaging(secure_messaging::Error::ResponseMac { .. }),
    ));

    // the channel is poisoned and refuses further use
    let error = channel.communicate(&select_ef_com())
        .expect_err("poisoned channel still talks");
    assert!(matches!(
        error,
        CommunicationError::SecureMessaging(secure_messaging::Error::ChannelPoisoned),
    ));
}

/// Rebuilds the session MAC key the way the channel derives it, so tests
/// can authenticate hand-crafted responses.
fn session_mac_key() -> [u8; 16] {
    let k_enc = crypt::derive_encryption_key(&K_SEED);
    let iv = [0u8; crypt::BLOCK_SIZE];
    let mut material = EIC_AND_MIC[0..32].to_vec();
    crypt::decrypt_padded_data(&mut material, &k_enc, &iv);

    let mut seed = [0u8; 16];
    for (seed_byte, (ifd_byte, ic_byte)) in seed.iter_mut().zip(K_IFD.iter().zip(&material[16..32])) {
        *seed_byte = ifd_byte ^ ic_byte;
    }
    *crypt::derive_mac_key(&seed)
}

#[test]
fn test_non_canonical_response_length_still_verifies() {
    // a status object with a legal but non-shortest-form length; the MAC
    // covers the bytes exactly as the card sent them
    let status_object_long_form = hex!("99 8102 9000");
    let mut mac_input = SSC_AFTER_SELECT_RESPONSE.to_vec();
    mac_input.extend_from_slice(&status_object_long_form);
    mac_input.push(0x80);
    while mac_input.len() % crypt::BLOCK_SIZE != 0 {
        mac_input.push(0x00);
    }
    let mac = crypt::retail_mac(&session_mac_key(), &mac_input);

    let mut body = status_object_long_form.to_vec();
    mac_object(&mac).write_bytes(&mut body);

    let mut channel = channel_for(vec![select_exchange(ok_with(body))]);
    let response = channel.communicate(&select_ef_com()).expect("transmission failed");
    assert_eq!(response.trailer.to_word(), 0x9000);
    assert!(response.data.is_empty());
}
