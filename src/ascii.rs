use alloc::string::String;
use alloc::vec::Vec;

pub(crate) const CR: u8 = 13;
pub(crate) const LF: u8 = 10;
pub(crate) const SP: u8 = 32;
pub(crate) const AMP: u8 = 38;
pub(crate) const EQ: u8 = 61;
pub(crate) const PERCENT: u8 = 37;
pub(crate) const PLUS: u8 = 43;
pub(crate) const DASH: u8 = 45;

pub(crate) fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode percent escapes and `+` as space.  A `%` that is not followed by two hex
/// digits is passed through literally.  Returns None if the decoded bytes are not
/// valid utf8.
pub(crate) fn url_decode(data: &str) -> Option<String> {
    let bytes = data.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());

    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            PLUS => {
                out.push(SP);
                i += 1;
            }
            PERCENT => match (
                bytes.get(i + 1).copied().and_then(hex_digit),
                bytes.get(i + 2).copied().and_then(hex_digit),
            ) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => {
                    out.push(PERCENT);
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn test_url_decode() {
        assert_eq!(url_decode("abc").unwrap(), "abc");
        assert_eq!(url_decode("a%20b").unwrap(), "a b");
        assert_eq!(url_decode("a+b").unwrap(), "a b");
        assert_eq!(url_decode("%41%42%43").unwrap(), "ABC");
        assert_eq!(url_decode("100%25").unwrap(), "100%");
        assert_eq!(url_decode("%2").unwrap(), "%2");
        assert_eq!(url_decode("%zz").unwrap(), "%zz");
        assert_eq!(url_decode("%E2%82%AC").unwrap(), "\u{20ac}");
        assert!(url_decode("%FF").is_none());
    }

    #[test]
    fn test_url_decode_round_trip() {
        // every printable ascii char percent encoded
        let mut encoded = String::new();
        let mut plain = String::new();
        for b in 0x20u8..0x7f {
            let hex = b"0123456789ABCDEF";
            encoded.push('%');
            encoded.push(hex[(b >> 4) as usize] as char);
            encoded.push(hex[(b & 0x0f) as usize] as char);
            plain.push(b as char);
        }
        assert_eq!(url_decode(&encoded).unwrap(), plain);
    }
}
