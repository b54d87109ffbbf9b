use std::num::ParseIntError;

/// Parses a `u32` from either a decimal literal or a `0x`-prefixed hex literal.
pub fn parse_u32(text: &str) -> Result<u32, ParseIntError> {
    if let Some(hex) = text.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else {
        text.parse()
    }
}

/// Parses a `u16` from either a decimal literal or a `0x`-prefixed hex literal.
pub fn parse_u16(text: &str) -> Result<u16, ParseIntError> {
    if let Some(hex) = text.strip_prefix("0x") {
        u16::from_str_radix(hex, 16)
    } else {
        text.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u32() {
        assert_eq!(parse_u32("0x2001000").unwrap(), 0x0200_1000);
        assert_eq!(parse_u32("1024").unwrap(), 1024);
        assert!(parse_u32("nope").is_err());
    }
}
