use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

/// A checksum-valid ISBN in both of its forms.
///
/// `isbn10` is only present for 978-prefixed ISBN-13s; 979 numbers have no
/// ISBN-10 equivalent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Isbn {
    pub isbn13: String,
    pub isbn10: Option<String>,
}

impl Isbn {
    /// Accepts hyphens and spaces; rejects anything failing its checksum.
    pub fn parse(input: &str) -> Result<Self> {
        let stripped = strip_isbn(input);
        match stripped.len() {
            13 if is_valid_isbn13(&stripped) => Ok(Self {
                isbn10: isbn13_to_isbn10(&stripped),
                isbn13: stripped,
            }),
            10 if is_valid_isbn10(&stripped) => Ok(Self {
                isbn13: isbn10_to_isbn13(&stripped)
                    .ok_or_else(|| CatalogError::InvalidIsbn(input.to_string()))?,
                isbn10: Some(stripped),
            }),
            _ => Err(CatalogError::InvalidIsbn(input.to_string())),
        }
    }

    /// `978-0-4410-1359-3` style grouping; registrant boundaries are not looked up.
    pub fn formatted(&self) -> String {
        let s = &self.isbn13;
        format!("{}-{}-{}-{}-{}", &s[0..3], &s[3..4], &s[4..8], &s[8..12], &s[12..13])
    }
}

/// Uppercased ASCII alphanumerics only, so `0-306-40615-x` becomes `030640615X`.
pub fn strip_isbn(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Thirteen digits whose alternating 1/3 weighted sum is divisible by 10.
pub fn is_valid_isbn13(s: &str) -> bool {
    if s.len() != 13 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let sum: u32 = s
        .bytes()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b - b'0');
            if i % 2 == 0 { d } else { d * 3 }
        })
        .sum();
    sum % 10 == 0
}

/// Nine digits plus a digit-or-`X` check, weighted 10..1, divisible by 11.
pub fn is_valid_isbn10(s: &str) -> bool {
    if s.len() != 10 {
        return false;
    }
    let mut sum = 0u32;
    for (i, b) in s.bytes().enumerate() {
        let d = match b {
            b'0'..=b'9' => u32::from(b - b'0'),
            b'X' | b'x' if i == 9 => 10,
            _ => return false,
        };
        sum += (10 - i as u32) * d;
    }
    sum % 11 == 0
}

pub fn isbn10_to_isbn13(isbn10: &str) -> Option<String> {
    if !is_valid_isbn10(isbn10) {
        return None;
    }
    let mut body = format!("978{}", &isbn10[..9]);
    let sum: u32 = body
        .bytes()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b - b'0');
            if i % 2 == 0 { d } else { d * 3 }
        })
        .sum();
    let check = (10 - sum % 10) % 10;
    body.push(char::from(b'0' + check as u8));
    Some(body)
}

pub fn isbn13_to_isbn10(isbn13: &str) -> Option<String> {
    if !is_valid_isbn13(isbn13) || !isbn13.starts_with("978") {
        return None;
    }
    let body = &isbn13[3..12];
    let sum: u32 = body
        .bytes()
        .enumerate()
        .map(|(i, b)| (10 - i as u32) * u32::from(b - b'0'))
        .sum();
    let check = (11 - sum % 11) % 11;
    let check_char = if check == 10 { 'X' } else { char::from(b'0' + check as u8) };
    Some(format!("{body}{check_char}"))
}

/// Pick the best checksum-valid ISBN-13 and ISBN-10 out of loosely formatted
/// upstream values. ISBN-13s win; a missing ISBN-13 is derived from a valid ISBN-10.
pub fn best_isbns<'a>(candidates: impl IntoIterator<Item = &'a str>) -> (Option<String>, Option<String>) {
    let mut isbn13 = None;
    let mut isbn10 = None;
    for raw in candidates {
        let stripped = strip_isbn(raw);
        if isbn13.is_none() && is_valid_isbn13(&stripped) {
            isbn13 = Some(stripped);
        } else if isbn10.is_none() && is_valid_isbn10(&stripped) {
            isbn10 = Some(stripped);
        }
    }
    if isbn13.is_none() {
        isbn13 = isbn10.as_deref().and_then(isbn10_to_isbn13);
    }
    (isbn13, isbn10)
}
