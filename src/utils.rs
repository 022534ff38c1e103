/// Formats bytes as uppercase hexadecimal pairs separated by spaces.
pub(crate) fn format_hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "<empty>".to_string();
    }

    bytes
        .chunks(1)
        .map(hex::encode_upper)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Formats an optional RSSI in dBm for terminal output.
pub(crate) fn format_rssi(rssi: Option<i16>) -> String {
    match rssi {
        Some(value) => format!("{value} dBm"),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn format_hex_handles_empty_payload() {
        assert_eq!("<empty>", format_hex(&[]));
    }

    #[test]
    fn format_hex_formats_uppercase_pairs() {
        assert_eq!("05 00 A1 FF", format_hex(&[0x05, 0x00, 0xA1, 0xFF]));
    }

    #[rstest]
    #[case::unknown(None, "-")]
    #[case::known(Some(-61), "-61 dBm")]
    fn format_rssi_renders_units(#[case] rssi: Option<i16>, #[case] expected: &str) {
        assert_eq!(expected, format_rssi(rssi));
    }
}
