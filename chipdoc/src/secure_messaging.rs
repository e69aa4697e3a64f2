//! Secure Messaging.
//!
//! Once Basic Access Control succeeds, every command is wrapped before it
//! reaches the card and every response is unwrapped on the way back: command
//! data travels 3DES-CBC-encrypted in a tag-0x87 data object, the expected
//! response length in a tag-0x97 object, and a Retail MAC over the
//! send-sequence counter, the rewritten header and the data objects in a
//! tag-0x8E object. Responses mirror the scheme with their status in a
//! tag-0x99 object.


use std::fmt;

use subtle::ConstantTimeEq;
use tracing::warn;
use zeroize::Zeroizing;
use zeroize_derive::ZeroizeOnDrop;

use crate::ber::{self, Block, Class};
use crate::crypt;
use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response, ResponseTrailer};
use crate::iso7816::card::{CommunicationError, SmartCard};


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    GetChallenge,
    ExternalAuthenticate,
    SecureTransmit,
}
impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetChallenge => write!(f, "GET CHALLENGE"),
            Self::ExternalAuthenticate => write!(f, "EXTERNAL AUTHENTICATE"),
            Self::SecureTransmit => write!(f, "secure transmission"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MismatchedValue {
    RndIc,
    RndIfd,
}


#[derive(Debug)]
pub enum Error {
    OperationFailed { operation: Operation, response: Response },
    LengthMismatch {
        operation: Operation,
        obtained: Vec<u8>,
        expected_length: usize,
    },
    CommandClass { cla: u8 },
    ResponseMac { operation: Operation },
    ValueMismatch { value: MismatchedValue },
    ResponseTlvFormat { error: ber::Error },
    StatusLength { obtained: Vec<u8> },
    MissingResponseData,
    UnknownPadding { padding_mode: u8 },
    InvalidPadding { last_byte: u8 },
    ChannelPoisoned,
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::OperationFailed { operation, response }
                => write!(f, "{} failed with response code 0x{:04X}", operation, response.trailer.to_word()),
            Self::LengthMismatch { operation, obtained, expected_length }
                => write!(f, "{} response has length {}, expected {}", operation, obtained.len(), expected_length),
            Self::CommandClass { cla }
                => write!(f, "command class 0x{:02X} cannot be wrapped", cla),
            Self::ResponseMac { operation }
                => write!(f, "{} response MAC incorrect", operation),
            Self::ValueMismatch { value }
                => write!(f, "{:?} mismatched", value),
            Self::ResponseTlvFormat { error }
                => write!(f, "response has an invalid TLV format: {}", error),
            Self::StatusLength { obtained }
                => write!(f, "status has unexpected length {}", obtained.len()),
            Self::MissingResponseData
                => write!(f, "response data object is empty"),
            Self::UnknownPadding { padding_mode }
                => write!(f, "response payload has unknown padding mode {}", padding_mode),
            Self::InvalidPadding { last_byte }
                => write!(f, "response payload ends in 0x{:02X} instead of valid padding", last_byte),
            Self::ChannelPoisoned
                => write!(f, "channel is poisoned by an earlier integrity failure"),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ResponseTlvFormat { error } => Some(error),
            _ => None,
        }
    }
}


// Secure Messaging data objects, all context-specific and primitive.
const TAG_ENCRYPTED_DATA: u64 = 0x07; // 0x87 on the wire
const TAG_EXPECTED_LENGTH: u64 = 0x17; // 0x97
const TAG_STATUS: u64 = 0x19; // 0x99
const TAG_MAC: u64 = 0x0E; // 0x8E

/// The class byte that marks a wrapped command.
const CLA_SECURE_MESSAGING: u8 = 0x0C;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
enum ChannelState {
    /// Established, nothing transmitted yet.
    Fresh,

    /// At least one exchange has completed.
    Live,

    /// An integrity check failed; the channel must not be used again.
    Poisoned,
}


/// An encrypted, authenticated channel to a card.
///
/// Owns the underlying card, both session keys and the send-sequence
/// counter; the keys are wiped when the channel is dropped. The counter is
/// incremented before wrapping a command and again before unwrapping its
/// response, binding each MAC to its position in the conversation.
#[derive(ZeroizeOnDrop)]
pub struct SecureChannel {
    #[zeroize(skip)] card: Option<Box<dyn SmartCard>>,
    k_session_enc: [u8; 16],
    k_session_mac: [u8; 16],
    send_sequence_counter: [u8; 8],
    #[zeroize(skip)] state: ChannelState,
}
impl SecureChannel {
    pub fn new(
        card: Box<dyn SmartCard>,
        k_session_enc: [u8; 16],
        k_session_mac: [u8; 16],
        send_sequence_counter: [u8; 8],
    ) -> Self {
        Self {
            card: Some(card),
            k_session_enc,
            k_session_mac,
            send_sequence_counter,
            state: ChannelState::Fresh,
        }
    }

    /// Drops the channel and returns the inner card.
    pub fn into_smart_card(mut self) -> Box<dyn SmartCard> {
        let card = std::mem::take(&mut self.card);
        card.unwrap()
    }

    /// Increment the send-sequence counter: big-endian, wrapping around to
    /// zero on overflow.
    fn increment_send_sequence_counter(&mut self) {
        for b in self.send_sequence_counter.iter_mut().rev() {
            if *b == 0xFF {
                *b = 0x00;
                // carry; keep going
            } else {
                *b += 1;
                // the buck stops here
                break;
            }
        }
    }

    fn encrypt_data(&self, data: &mut [u8]) {
        // the IV is always zero, see Doc 9303 Part 11 § 9.8.6.1
        let iv = [0u8; crypt::BLOCK_SIZE];
        crypt::encrypt_padded_data(data, &self.k_session_enc, &iv);
    }

    fn decrypt_data(&self, data: &mut [u8]) {
        let iv = [0u8; crypt::BLOCK_SIZE];
        crypt::decrypt_padded_data(data, &self.k_session_enc, &iv);
    }

    fn poison(&mut self) {
        self.state = ChannelState::Poisoned;
    }

    fn transmit_secure(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        if self.state == ChannelState::Poisoned {
            return Err(Error::ChannelPoisoned.into());
        }
        if request.header.cla != 0x00 {
            return Err(Error::CommandClass { cla: request.header.cla }.into());
        }

        let mut body_data = Vec::new();

        if let Some(request_data) = request.data.request_data() {
            // pad, encrypt, and wrap into data object 87 behind the
            // padding-mode byte (0x01 = ISO 7816 padding)
            let mut padded_data = Zeroizing::new(request_data.to_vec());
            padded_data.push(0x80);
            while padded_data.len() % crypt::BLOCK_SIZE != 0 {
                padded_data.push(0x00);
            }
            self.encrypt_data(&mut padded_data);

            let mut value = Vec::with_capacity(1 + padded_data.len());
            value.push(0x01);
            value.extend_from_slice(&padded_data);
            Block::primitive(Class::ContextSpecific, TAG_ENCRYPTED_DATA, value)
                .write_bytes(&mut body_data);
        }

        if request.data.is_receiving_data() {
            // data object 97: the expected length, one byte for the short
            // cases, two for the extended ones
            let value = match &request.data {
                Data::ResponseDataShort { response_data_length }
                | Data::BothDataShort { response_data_length, .. }
                    => vec![*response_data_length],
                Data::ResponseDataExtended { response_data_length }
                | Data::BothDataExtended { response_data_length, .. }
                    => response_data_length.to_be_bytes().to_vec(),
                _ => unreachable!(),
            };
            Block::primitive(Class::ContextSpecific, TAG_EXPECTED_LENGTH, value)
                .write_bytes(&mut body_data);
        }

        // the header participates in the MAC with the secure-messaging class
        // substituted and ISO 7816 padding appended
        let padded_header = [
            CLA_SECURE_MESSAGING, request.header.ins, request.header.p1, request.header.p2,
            0x80, 0x00, 0x00, 0x00,
        ];

        self.increment_send_sequence_counter();

        let mut mac_data = Zeroizing::new(Vec::with_capacity(8 + 8 + body_data.len() + 8));
        mac_data.extend_from_slice(&self.send_sequence_counter);
        mac_data.extend_from_slice(&padded_header);
        mac_data.extend_from_slice(&body_data);
        mac_data.push(0x80);
        while mac_data.len() % crypt::BLOCK_SIZE != 0 {
            mac_data.push(0x00);
        }
        let mac = crypt::retail_mac(&self.k_session_mac, &mac_data);

        Block::primitive(Class::ContextSpecific, TAG_MAC, mac.to_vec())
            .write_bytes(&mut body_data);

        // the original case is deliberately lost: every wrapped command goes
        // out as case 4 short with Le=0, "up to 256 bytes"
        let secure_request = Apdu {
            header: CommandHeader {
                cla: CLA_SECURE_MESSAGING,
                ins: request.header.ins,
                p1: request.header.p1,
                p2: request.header.p2,
            },
            data: Data::BothDataShort {
                request_data: body_data,
                response_data_length: 0,
            },
        };

        let response = {
            let card = self.card.as_mut().unwrap();
            card.communicate(&secure_request)?
        };

        // status-only responses pass through unwrapped
        if response.data.is_empty() {
            self.state = ChannelState::Live;
            return Ok(response);
        }

        let blocks = ber::decode_all_with_spans(&response.data)
            .map_err(|error| Error::ResponseTlvFormat { error })?;

        self.increment_send_sequence_counter();

        // recompute the MAC over everything except the MAC object itself,
        // using each object's bytes exactly as they came off the wire (the
        // card may use a non-canonical length form)
        let mut mac_data = Zeroizing::new(Vec::new());
        mac_data.extend_from_slice(&self.send_sequence_counter);
        for (block, span) in &blocks {
            if !block.is_primitive_named(Class::ContextSpecific, TAG_MAC) {
                mac_data.extend_from_slice(span);
            }
        }
        mac_data.push(0x80);
        while mac_data.len() % crypt::BLOCK_SIZE != 0 {
            mac_data.push(0x00);
        }

        let received_mac = blocks.iter()
            .find(|(block, _span)| block.is_primitive_named(Class::ContextSpecific, TAG_MAC))
            .and_then(|(block, _span)| block.primitive_value());
        match received_mac {
            Some(received_mac) => {
                let expected_mac = crypt::retail_mac(&self.k_session_mac, &mac_data);
                if !bool::from(expected_mac[..].ct_eq(received_mac)) {
                    self.poison();
                    return Err(Error::ResponseMac { operation: Operation::SecureTransmit }.into());
                }
            },
            None => {
                // some cards omit the MAC object on error statuses
                warn!("response carries no MAC data object; integrity not verified");
            },
        }

        // the status travels in data object 99; fall back to the outer
        // trailer if it is missing
        let trailer = match blocks.iter()
                .find(|(block, _span)| block.is_primitive_named(Class::ContextSpecific, TAG_STATUS)) {
            Some((block, _span)) => {
                let status = block.primitive_value().unwrap();
                if status.len() != 2 {
                    return Err(Error::StatusLength { obtained: status.to_vec() }.into());
                }
                ResponseTrailer {
                    sw1: status[0],
                    sw2: status[1],
                }
            },
            None => response.trailer.clone(),
        };

        let response_data = match blocks.iter()
                .find(|(block, _span)| block.is_primitive_named(Class::ContextSpecific, TAG_ENCRYPTED_DATA)) {
            None => Vec::with_capacity(0),
            Some((block, _span)) => {
                let value = block.primitive_value().unwrap();
                let Some((&padding_mode, ciphertext)) = value.split_first() else {
                    self.poison();
                    return Err(Error::MissingResponseData.into());
                };
                if padding_mode != 0x01 {
                    // not ISO 7816 padding
                    self.poison();
                    return Err(Error::UnknownPadding { padding_mode }.into());
                }

                let mut plaintext = Zeroizing::new(ciphertext.to_vec());
                self.decrypt_data(&mut plaintext);

                // strip the padding from the end: zeroes up to a 0x80 marker
                let mut end = plaintext.len();
                while end > 0 && plaintext[end-1] == 0x00 {
                    end -= 1;
                }
                if end == 0 {
                    // no marker at all; hand the payload back unchanged
                    warn!("decrypted payload has no padding marker; returning it whole");
                    plaintext.to_vec()
                } else if plaintext[end-1] == 0x80 {
                    plaintext[..end-1].to_vec()
                } else {
                    self.poison();
                    return Err(Error::InvalidPadding { last_byte: plaintext[end-1] }.into());
                }
            },
        };

        self.state = ChannelState::Live;
        Ok(Response {
            data: response_data,
            trailer,
        })
    }
}
impl SmartCard for SecureChannel {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        self.transmit_secure(request)
    }
}
