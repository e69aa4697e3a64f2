//! Reading transparent elementary files.


use std::fmt;

use crate::iso7816::apdu::{Apdu, CommandHeader, Data, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::iso7816::{SW_END_OF_FILE, SW_EOF_WARNING, SW_NOT_FOUND, SW_OK};


#[derive(Debug)]
pub enum ReadError {
    Communication(CommunicationError),
    FileNotFound,
    SelectFailed(Response),
    ReadFailed(Response),
}
impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Communication(e)
                => write!(f, "communication failed: {}", e),
            Self::FileNotFound
                => write!(f, "file not found"),
            Self::SelectFailed(response)
                => write!(f, "SELECT operation failed with status code 0x{:04X}", response.trailer.to_word()),
            Self::ReadFailed(response)
                => write!(f, "READ BINARY operation failed with status code 0x{:04X}", response.trailer.to_word()),
        }
    }
}
impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Communication(e) => Some(e),
            Self::FileNotFound => None,
            Self::SelectFailed(_response) => None,
            Self::ReadFailed(_response) => None,
        }
    }
}
impl From<CommunicationError> for ReadError {
    fn from(value: CommunicationError) -> Self { Self::Communication(value) }
}


/// The SELECT command for an elementary file under the current dedicated
/// file, by file identifier, returning no metadata.
pub fn select_ef(file_id: u16) -> Apdu {
    Apdu {
        header: CommandHeader {
            cla: 0x00,
            ins: 0xA4, // SELECT
            p1: 0b000_000_10, // select EF under current DF
            p2: 0b0000_11_00, // return no metadata, return first or only occurrence
        },
        data: Data::RequestDataShort {
            request_data: file_id.to_be_bytes().to_vec(),
        },
    }
}

/// Selects a file and reads its whole body with a sequence of READ BINARY
/// commands, 256 bytes per round trip.
pub fn read_transparent<SC: SmartCard + ?Sized>(card: &mut SC, select: &Apdu) -> Result<Vec<u8>, ReadError> {
    let select_response = card.communicate(select)?;
    match select_response.trailer.to_word() {
        SW_OK | SW_EOF_WARNING => {},
        SW_NOT_FOUND => return Err(ReadError::FileNotFound),
        _ => return Err(ReadError::SelectFailed(select_response)),
    }

    let mut contents = Vec::new();
    loop {
        // READ BINARY carries a 15-bit offset in P1/P2
        let Ok(offset) = u16::try_from(contents.len()) else {
            break;
        };
        if offset >= 0x8000 {
            break;
        }

        let read_response = card.communicate(
            &Apdu {
                header: CommandHeader {
                    cla: 0x00,
                    ins: 0xB0, // READ BINARY
                    p1: (offset >> 8) as u8,
                    p2: (offset & 0xFF) as u8,
                },
                data: Data::ResponseDataShort {
                    response_data_length: 0, // up to 256 bytes
                },
            }
        )?;
        match read_response.trailer.to_word() {
            SW_OK => {
                let finished = read_response.data.len() < 256;
                contents.extend_from_slice(&read_response.data);
                if finished {
                    break;
                }
            },
            SW_EOF_WARNING => {
                contents.extend_from_slice(&read_response.data);
                break;
            },
            SW_END_OF_FILE => break,
            _ => return Err(ReadError::ReadFailed(read_response)),
        }
    }
    Ok(contents)
}
