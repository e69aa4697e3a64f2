//! Decoding of machine-readable zones.
//!
//! Three form factors are defined: TD1 (credit-card size, 3 lines of 30
//! characters), TD2 (ISO 216 size A7, 2 lines of 36) and TD3 (passport,
//! 2 lines of 44).
//!
//! The TD1 encoding is:
//! ```plain
//! TTSSSNNNNNNNNNCOOOOOOOOOOOOOOO
//! BBBBBBDXEEEEEEFAAAPPPPPPPPPPPG
//! IIIIIIIIIIIIIIIIIIIIIIIIIIIIII
//! ```
//! with
//! * `TT`: type of document (right-padded with `<`)
//! * `SSS`: issuing state or organization (right-padded with `<`)
//! * `NNNNNNNNN`: first 9 characters of the document number (right-padded
//!   with `<`)
//! * `C`: check digit of the document number, or `<` if the document number
//!   is longer than 9 characters
//! * `OOOOOOOOOOOOOOO`: optional data (right-padded with `<`); if the
//!   document number is longer than 9 characters, begins with the remaining
//!   characters of the document number, followed by its check digit,
//!   followed by `<`
//! * `BBBBBB`: date of birth as YYMMDD
//! * `D`: check digit of date of birth
//! * `X`: sex (`F`, `M`, or `<` for unspecified)
//! * `EEEEEE`: date of expiry as YYMMDD
//! * `F`: check digit of date of expiry
//! * `AAA`: nationality
//! * `PPPPPPPPPPP`: optional data (right-padded with `<`)
//! * `G`: composite check digit
//! * `IIII…`: name: primary identifier, then `<<` and the secondary
//!   identifier if there is one, then padding with `<`
//!
//! The TD2 encoding is:
//! ```plain
//! TTSSSIIIIIIIIIIIIIIIIIIIIIIIIIIIIIII
//! NNNNNNNNNCAAABBBBBBDXEEEEEEFOOOOOOOG
//! ```
//! with the same fields and the same document-number overflow rule as TD1.
//!
//! The TD3 encoding is:
//! ```plain
//! TTSSSIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIII
//! NNNNNNNNNCAAABBBBBBDXEEEEEEFOOOOOOOOOOOOOOQG
//! ```
//! where the document number never exceeds 9 characters and `Q` is a check
//! digit over the optional data (`<` when the optional data is empty).
//!
//! Parsing validates every check digit and fails on the first mismatch.


use std::fmt;
use std::fmt::Write;
use std::str::FromStr;

use smallstr::SmallString;


/// The padding character.
pub const FILLER: char = '<';


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Variant {
    Td1,
    Td2,
    Td3,
}

/// The fields protected by a check digit.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CheckedField {
    DocumentNumber,
    DateOfBirth,
    DateOfExpiry,
    OptionalData1,
    Composite,
}
impl fmt::Display for CheckedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DocumentNumber => write!(f, "document number"),
            Self::DateOfBirth => write!(f, "date of birth"),
            Self::DateOfExpiry => write!(f, "date of expiry"),
            Self::OptionalData1 => write!(f, "optional data"),
            Self::Composite => write!(f, "composite"),
        }
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Error {
    /// The line count and line length match none of the three form factors.
    UnknownFormat,

    /// A character outside of `<`, `0`-`9` and `A`-`Z` in a checked field.
    UnknownCharacter { c: char },

    /// A check digit does not match the data it protects.
    BadCheckDigit { which: CheckedField, read: char, computed: u8 },
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::UnknownFormat
                => write!(f, "line structure matches no known format"),
            Self::UnknownCharacter { c }
                => write!(f, "character {:?} has no check-digit value", c),
            Self::BadCheckDigit { which, read, computed }
                => write!(f, "{} check digit is {:?} but computes to {}", which, read, computed),
        }
    }
}
impl std::error::Error for Error {
}


// '<' and '0'-'9' map to their digit values, 'A'-'Z' to 10-35; -1 marks
// characters outside the alphabet. Indexed by byte value minus b'0'.
const CHAR_VALUES: [i8; 43] = [
     0,  1,  2,  3,  4,  5,  6,  7,  8,  9, // '0'-'9'
    -1, -1,                                 // ':' ';'
     0,                                     // '<'
    -1, -1, -1, -1,                         // '=' '>' '?' '@'
    10, 11, 12, 13, 14, 15, 16, 17, 18, 19, // 'A'-'J'
    20, 21, 22, 23, 24, 25, 26, 27, 28, 29, // 'K'-'T'
    30, 31, 32, 33, 34, 35,                 // 'U'-'Z'
];

fn char_value(c: char) -> Result<u8, Error> {
    let index = (c as usize).wrapping_sub(usize::from(b'0'));
    match CHAR_VALUES.get(index) {
        Some(&value) if value >= 0 => Ok(value as u8),
        _ => Err(Error::UnknownCharacter { c }),
    }
}

/// Computes the check digit over a string: character values weighted 7, 3, 1
/// cyclically, summed modulo 10.
pub fn check_digit(data: &str) -> Result<u8, Error> {
    const WEIGHTS: [u32; 3] = [7, 3, 1];

    let mut sum: u32 = 0;
    for (i, c) in data.chars().enumerate() {
        sum += u32::from(char_value(c)?) * WEIGHTS[i % WEIGHTS.len()];
    }
    Ok((sum % 10) as u8)
}

fn verify_check_digit(which: CheckedField, data: &str, read: char) -> Result<(), Error> {
    let computed = check_digit(data)?;
    if char_value(read)? != computed {
        return Err(Error::BadCheckDigit { which, read, computed });
    }
    Ok(())
}


/// A fully validated machine-readable zone.
///
/// Dates stay in their raw YYMMDD form, fillers included; all other string
/// fields have their trailing fillers removed.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Data {
    variant: Variant,

    /// Document type, e.g. `P` or `I`.
    pub document_type: SmallString<[u8; 2]>,

    /// Issuer state or organization of the document.
    pub issuer: SmallString<[u8; 3]>,

    /// Primary identifier (generally the family name).
    pub primary_identifier: SmallString<[u8; 0x40]>,

    /// Secondary identifier (generally the given names, separated by `<`),
    /// if the name has one.
    pub secondary_identifier: Option<SmallString<[u8; 0x40]>>,

    /// Whether the name filled its field completely, in which case it may
    /// have been cut off.
    pub name_might_be_truncated: bool,

    /// Number of the document. Can be alphanumeric; on TD1 and TD2 it may be
    /// longer than its nine-character field and spill into the optional
    /// data.
    pub document_number: SmallString<[u8; 22]>,

    /// Nationality of the holder.
    pub nationality: SmallString<[u8; 3]>,

    /// Date of birth as YYMMDD.
    pub date_of_birth: SmallString<[u8; 6]>,

    /// Sex: `F`, `M`, or `<` for unspecified.
    pub sex: char,

    /// Date of expiry as YYMMDD.
    pub date_of_expiry: SmallString<[u8; 6]>,

    /// Optional data 1. Empty if the document carries none.
    pub optional_data_1: SmallString<[u8; 15]>,

    /// Optional data 2. Only TD1 has a second optional-data field.
    pub optional_data_2: Option<SmallString<[u8; 11]>>,
}
impl Data {
    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// Builds the key string for Basic Access Control: the document number
    /// padded with fillers to at least nine characters, the date of birth
    /// and the date of expiry, each followed by its check digit.
    pub fn bac_key(&self) -> Result<String, Error> {
        let mut ret = String::with_capacity(9 + 1 + 6 + 1 + 6 + 1);
        ret.push_str(&self.document_number);
        for _ in self.document_number.len()..9 {
            ret.push(FILLER);
        }
        let document_number_check = check_digit(&ret)?;
        write!(ret, "{}", document_number_check).unwrap();

        let birth_check = check_digit(&self.date_of_birth)?;
        ret.push_str(&self.date_of_birth);
        write!(ret, "{}", birth_check).unwrap();

        let expiry_check = check_digit(&self.date_of_expiry)?;
        ret.push_str(&self.date_of_expiry);
        write!(ret, "{}", expiry_check).unwrap();

        Ok(ret)
    }
}
impl FromStr for Data {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lines: Vec<&str> = s.lines()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .collect();
        for line in &lines {
            if let Some(c) = line.chars().find(|c| !c.is_ascii()) {
                return Err(Error::UnknownCharacter { c });
            }
        }

        let line_lengths: Vec<usize> = lines.iter().map(|line| line.len()).collect();
        match line_lengths.as_slice() {
            [44, 44] => parse_td3(lines[0], lines[1]),
            [30, 30, 30] => parse_td1(lines[0], lines[1], lines[2]),
            [36, 36] => parse_td2(lines[0], lines[1]),
            _ => Err(Error::UnknownFormat),
        }
    }
}


fn right_trim(s: &str) -> &str {
    s.trim_end_matches(FILLER)
}

fn char_at(s: &str, index: usize) -> char {
    char::from(s.as_bytes()[index])
}

/// Splits a name field into primary and secondary identifiers at the first
/// `<<`. The secondary identifier keeps its inner single fillers (component
/// separators); an empty secondary identifier means there is none.
fn split_name(
    name_field: &str,
) -> (SmallString<[u8; 0x40]>, Option<SmallString<[u8; 0x40]>>, bool) {
    let might_be_truncated = !name_field.ends_with(FILLER);
    match name_field.find("<<") {
        None => (
            SmallString::from_str(right_trim(name_field)),
            None,
            might_be_truncated,
        ),
        Some(position) => {
            let primary = &name_field[..position];
            let secondary = right_trim(&name_field[position+2..]);
            (
                SmallString::from_str(primary),
                if secondary.is_empty() { None } else { Some(SmallString::from_str(secondary)) },
                might_be_truncated,
            )
        },
    }
}

/// Untangles a nine-character document-number field from the optional data
/// that follows it.
///
/// If the check-digit column holds a filler, the number is longer than the
/// field: it continues at the start of the optional data up to the next
/// filler, the character just before that filler being the real check digit.
/// Without a terminating filler the number runs to the penultimate column of
/// the region and the last column is the check digit.
///
/// Returns the document number, the string its check digit covers, the check
/// digit itself and the remaining optional data.
fn split_document_number<'a>(
    field: &'a str,
    check_column: char,
    optional_region: &'a str,
) -> (String, String, char, &'a str) {
    if check_column != FILLER {
        return (
            right_trim(field).to_owned(),
            field.to_owned(),
            check_column,
            optional_region,
        );
    }

    match optional_region.find(FILLER) {
        Some(0) => {
            // nothing actually spilled over
            (right_trim(field).to_owned(), field.to_owned(), FILLER, &optional_region[1..])
        },
        Some(position) => {
            let number = format!("{}{}", field, &optional_region[..position-1]);
            let check = char_at(optional_region, position - 1);
            (number.clone(), number, check, &optional_region[position+1..])
        },
        None => {
            let last = optional_region.len() - 1;
            let number = format!("{}{}", field, &optional_region[..last]);
            let check = char_at(optional_region, last);
            (number.clone(), number, check, "")
        },
    }
}


fn parse_td3(top: &str, bottom: &str) -> Result<Data, Error> {
    verify_check_digit(CheckedField::DocumentNumber, &bottom[0..9], char_at(bottom, 9))?;
    verify_check_digit(CheckedField::DateOfBirth, &bottom[13..19], char_at(bottom, 19))?;
    verify_check_digit(CheckedField::DateOfExpiry, &bottom[21..27], char_at(bottom, 27))?;
    if char_at(bottom, 42) != FILLER {
        verify_check_digit(CheckedField::OptionalData1, &bottom[28..42], char_at(bottom, 42))?;
    }
    let composite_data = format!("{}{}{}", &bottom[0..10], &bottom[13..20], &bottom[21..43]);
    verify_check_digit(CheckedField::Composite, &composite_data, char_at(bottom, 43))?;

    let (primary_identifier, secondary_identifier, name_might_be_truncated) =
        split_name(&top[5..44]);

    Ok(Data {
        variant: Variant::Td3,
        document_type: SmallString::from_str(right_trim(&top[0..2])),
        issuer: SmallString::from_str(right_trim(&top[2..5])),
        primary_identifier,
        secondary_identifier,
        name_might_be_truncated,
        document_number: SmallString::from_str(right_trim(&bottom[0..9])),
        nationality: SmallString::from_str(right_trim(&bottom[10..13])),
        date_of_birth: SmallString::from_str(&bottom[13..19]),
        sex: char_at(bottom, 20),
        date_of_expiry: SmallString::from_str(&bottom[21..27]),
        optional_data_1: SmallString::from_str(right_trim(&bottom[28..42])),
        optional_data_2: None,
    })
}

fn parse_td1(top: &str, middle: &str, bottom: &str) -> Result<Data, Error> {
    let (document_number, document_number_check_data, document_number_check, optional_rest) =
        split_document_number(&top[5..14], char_at(top, 14), &top[15..30]);

    verify_check_digit(CheckedField::DocumentNumber, &document_number_check_data, document_number_check)?;
    verify_check_digit(CheckedField::DateOfBirth, &middle[0..6], char_at(middle, 6))?;
    verify_check_digit(CheckedField::DateOfExpiry, &middle[8..14], char_at(middle, 14))?;
    // the composite digit covers the raw columns, overflowing document
    // number and all
    let composite_data = format!("{}{}{}{}", &top[5..30], &middle[0..7], &middle[8..15], &middle[18..29]);
    verify_check_digit(CheckedField::Composite, &composite_data, char_at(middle, 29))?;

    let (primary_identifier, secondary_identifier, name_might_be_truncated) =
        split_name(&bottom[0..30]);

    Ok(Data {
        variant: Variant::Td1,
        document_type: SmallString::from_str(right_trim(&top[0..2])),
        issuer: SmallString::from_str(right_trim(&top[2..5])),
        primary_identifier,
        secondary_identifier,
        name_might_be_truncated,
        document_number: SmallString::from_str(&document_number),
        nationality: SmallString::from_str(right_trim(&middle[15..18])),
        date_of_birth: SmallString::from_str(&middle[0..6]),
        sex: char_at(middle, 7),
        date_of_expiry: SmallString::from_str(&middle[8..14]),
        optional_data_1: SmallString::from_str(right_trim(optional_rest)),
        optional_data_2: Some(SmallString::from_str(right_trim(&middle[18..29]))),
    })
}

fn parse_td2(top: &str, bottom: &str) -> Result<Data, Error> {
    let (document_number, document_number_check_data, document_number_check, optional_rest) =
        split_document_number(&bottom[0..9], char_at(bottom, 9), &bottom[28..35]);

    verify_check_digit(CheckedField::DocumentNumber, &document_number_check_data, document_number_check)?;
    verify_check_digit(CheckedField::DateOfBirth, &bottom[13..19], char_at(bottom, 19))?;
    verify_check_digit(CheckedField::DateOfExpiry, &bottom[21..27], char_at(bottom, 27))?;
    let composite_data = format!("{}{}{}", &bottom[0..10], &bottom[13..20], &bottom[21..35]);
    verify_check_digit(CheckedField::Composite, &composite_data, char_at(bottom, 35))?;

    let (primary_identifier, secondary_identifier, name_might_be_truncated) =
        split_name(&top[5..36]);

    Ok(Data {
        variant: Variant::Td2,
        document_type: SmallString::from_str(right_trim(&top[0..2])),
        issuer: SmallString::from_str(right_trim(&top[2..5])),
        primary_identifier,
        secondary_identifier,
        name_might_be_truncated,
        document_number: SmallString::from_str(&document_number),
        nationality: SmallString::from_str(right_trim(&bottom[10..13])),
        date_of_birth: SmallString::from_str(&bottom[13..19]),
        sex: char_at(bottom, 20),
        date_of_expiry: SmallString::from_str(&bottom[21..27]),
        optional_data_1: SmallString::from_str(right_trim(optional_rest)),
        optional_data_2: None,
    })
}
