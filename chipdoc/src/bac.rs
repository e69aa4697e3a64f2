//! Basic Access Control.
//!
//! The handshake that turns knowledge of the machine-readable zone into an
//! encrypted, authenticated channel: keys are derived from the MRZ key
//! string, the card is challenged, both sides prove possession of the keys
//! through an EXTERNAL AUTHENTICATE exchange, and the session keys and the
//! initial send-sequence counter are derived from the exchanged material.


use block_padding::{Iso7816, RawPadding};
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tracing::instrument;
use zeroize::Zeroizing;

use crate::crypt;
use crate::iso7816::apdu::{Apdu, CommandHeader, Data};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::iso7816::SW_OK;
use crate::secure_messaging::{Error, MismatchedValue, Operation, SecureChannel};


/// The first 16 bytes of the SHA-1 hash of the MRZ key string.
pub fn mrz_key_seed(mrz_key: &[u8]) -> Zeroizing<[u8; 16]> {
    let mut sha1 = Sha1::new();
    Digest::update(&mut sha1, mrz_key);
    let sha1_hash = sha1.finalize();

    let mut k_seed = Zeroizing::new([0u8; 16]);
    k_seed.copy_from_slice(&sha1_hash[0..16]);
    k_seed
}

#[instrument(skip(card))]
fn get_challenge(card: &mut Box<dyn SmartCard>) -> Result<[u8; 8], CommunicationError> {
    let get_challenge_apdu = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0x84, // GET CHALLENGE
            p1: 0x00,
            p2: 0x00,
        },
        data: Data::ResponseDataShort {
            response_data_length: 8,
        },
    };
    let response = card.communicate(&get_challenge_apdu)?;
    if response.trailer.to_word() != SW_OK {
        return Err(Error::OperationFailed { operation: Operation::GetChallenge, response }.into());
    }
    if response.data.len() != 8 {
        return Err(Error::LengthMismatch {
            operation: Operation::GetChallenge,
            obtained: response.data.clone(),
            expected_length: 8,
        }.into());
    }
    let mut ret = [0u8; 8];
    ret.copy_from_slice(response.data.as_slice());
    Ok(ret)
}

/// Runs the EXTERNAL AUTHENTICATE exchange with the given key seed, card
/// challenge and terminal-side random material, and derives the session
/// state from the outcome.
#[instrument(skip_all)]
pub fn establish_from_values(
    mut card: Box<dyn SmartCard>,
    k_seed: &[u8],
    rnd_ic: &[u8],
    rnd_ifd: &[u8],
    k_ifd: &[u8],
) -> Result<SecureChannel, CommunicationError> {
    let k_enc = crypt::derive_encryption_key(k_seed);
    let k_mac = crypt::derive_mac_key(k_seed);

    // concatenate the three values
    let mut ext_auth_data = Zeroizing::new([0u8; 32+8]);
    ext_auth_data[0..8].copy_from_slice(rnd_ifd);
    ext_auth_data[8..16].copy_from_slice(rnd_ic);
    ext_auth_data[16..32].copy_from_slice(k_ifd);

    // encrypt with an all-zeroes IV and no padding
    let iv = [0u8; crypt::BLOCK_SIZE];
    crypt::encrypt_padded_data(&mut ext_auth_data[0..32], &k_enc, &iv);
    // ext_auth_data[0..32] is now encrypted

    // pad according to ISO 7816, then generate the MAC; it fits right where
    // the padding was
    Iso7816::raw_pad(&mut ext_auth_data[..], 32);
    let mac = crypt::retail_mac(&k_mac, &ext_auth_data[..]);
    ext_auth_data[32..32+8].copy_from_slice(&mac);

    // send EXTERNAL AUTHENTICATE
    let ext_auth_request = Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0x82, // EXTERNAL AUTHENTICATE
            p1: 0x00,
            p2: 0x00,
        },
        data: Data::BothDataShort {
            request_data: ext_auth_data.to_vec(),
            response_data_length: 40,
        },
    };
    let mut ext_auth_response = card.communicate(&ext_auth_request)?;
    if ext_auth_response.trailer.to_word() != SW_OK {
        return Err(Error::OperationFailed {
            operation: Operation::ExternalAuthenticate,
            response: ext_auth_response,
        }.into());
    }
    if ext_auth_response.data.len() != 40 {
        return Err(Error::LengthMismatch {
            operation: Operation::ExternalAuthenticate,
            obtained: ext_auth_response.data.clone(),
            expected_length: 40,
        }.into());
    }

    // verify the MAC of what we obtained
    let mut response_data_to_verify = Zeroizing::new([0u8; 32+8]);
    response_data_to_verify[0..32].copy_from_slice(&ext_auth_response.data[0..32]);
    Iso7816::raw_pad(&mut response_data_to_verify[..], 32);
    if !crypt::verify_retail_mac(&k_mac, &response_data_to_verify[..], &ext_auth_response.data[32..32+8]) {
        return Err(Error::ResponseMac { operation: Operation::ExternalAuthenticate }.into());
    }

    // decrypt
    crypt::decrypt_padded_data(&mut ext_auth_response.data[0..32], &k_enc, &iv);
    let decrypted_slice = &ext_auth_response.data[0..32];

    let mut rnd_ic_second = [0u8; 8];
    let mut rnd_ifd_second = [0u8; 8];
    let mut k_ic = Zeroizing::new([0u8; 16]);
    rnd_ic_second.copy_from_slice(&decrypted_slice[0..8]);
    rnd_ifd_second.copy_from_slice(&decrypted_slice[8..16]);
    k_ic.copy_from_slice(&decrypted_slice[16..32]);

    if rnd_ic != rnd_ic_second {
        return Err(Error::ValueMismatch { value: MismatchedValue::RndIc }.into());
    }
    if rnd_ifd != rnd_ifd_second {
        return Err(Error::ValueMismatch { value: MismatchedValue::RndIfd }.into());
    }

    let mut k_session_seed = Zeroizing::new([0u8; 16]);
    for ((seed_byte, ifd_byte), ic_byte) in k_session_seed.iter_mut().zip(k_ifd.iter()).zip(k_ic.iter()) {
        *seed_byte = *ifd_byte ^ *ic_byte;
    }

    let k_session_enc = crypt::derive_encryption_key(&k_session_seed[..]);
    let k_session_mac = crypt::derive_mac_key(&k_session_seed[..]);

    let mut send_sequence_counter = [0u8; 8];
    send_sequence_counter[0..4].copy_from_slice(&rnd_ic[4..8]);
    send_sequence_counter[4..8].copy_from_slice(&rnd_ifd[4..8]);

    Ok(SecureChannel::new(
        card,
        *k_session_enc,
        *k_session_mac,
        send_sequence_counter,
    ))
}

/// Establishes Basic Access Control over a bare card channel.
///
/// `mrz_key` is the key string from the machine-readable zone (see
/// [`crate::mrz::Data::bac_key`]).
#[instrument(skip_all)]
pub fn establish(mut card: Box<dyn SmartCard>, mrz_key: &[u8]) -> Result<SecureChannel, CommunicationError> {
    let k_seed = mrz_key_seed(mrz_key);

    // obtain the challenge
    let rnd_ic = get_challenge(&mut card)?;

    // generate some random bytes
    let mut rnd_ifd = [0u8; 8];
    let mut k_ifd = Zeroizing::new([0u8; 16]);
    OsRng.fill_bytes(&mut rnd_ifd);
    OsRng.fill_bytes(&mut k_ifd[..]);

    establish_from_values(card, &k_seed[..], &rnd_ic, &rnd_ifd, &k_ifd[..])
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_mrz_key_seed() {
        // ICAO Doc 9303 Part 11 Appendix D.2
        let seed = mrz_key_seed(b"L898902C<369080619406236");
        assert_eq!(*seed, hex!("239AB9CB282DAF66231DC5A4DF6BFBAE"));
    }
}
