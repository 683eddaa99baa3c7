const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Lowercase base-36 rendering, as used by the tracking tag for checksums
/// and client timestamps.
pub fn encode_base36(mut value: u64) -> String {
    let mut digits = Vec::new();
    loop {
        digits.push(BASE36_DIGITS[(value % 36) as usize]);
        value /= 36;
        if value == 0 {
            break;
        }
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

pub fn parse_base36(value: &str) -> Option<i64> {
    i64::from_str_radix(value, 36).ok()
}
