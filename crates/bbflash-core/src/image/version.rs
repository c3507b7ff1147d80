//! Firmware version strings.
//!
//! Version strings are `_`-separated. The firmware version is the first
//! token after the leading one that starts with four dot-separated digit
//! groups. A later `CFG.CFG` token immediately followed by a token starting
//! with digits supplies the configuration version, and the token before it
//! (when it isn't the firmware token or `?`) names the carrier:
//!
//! ```text
//! SWI9X30C_02.24.05.06_GENERIC_002.026_000.nvu
//!          ^ firmware  ^carrier ^ config
//! ```

use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedVersion {
    pub firmware: String,
    pub config: Option<String>,
    pub carrier: Option<String>,
}

impl fmt::Display for ParsedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.firmware)?;
        if let Some(config) = &self.config {
            write!(f, " config {config}")?;
        }
        if let Some(carrier) = &self.carrier {
            write!(f, " carrier {carrier}")?;
        }
        Ok(())
    }
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// `"03.05.29.03"` out of `"03.05.29.03"` or `"03.05.29.03.cwe"`.
fn firmware_prefix(token: &str) -> Option<String> {
    let groups: Vec<&str> = token.split('.').collect();
    if groups.len() < 4 || !groups[..4].iter().all(|g| all_digits(g)) {
        return None;
    }
    // A fifth numeric group means this isn't a firmware version at all.
    if groups.get(4).is_some_and(|g| all_digits(g)) {
        return None;
    }
    Some(groups[..4].join("."))
}

fn is_config_head(token: &str) -> bool {
    match token.split_once('.') {
        Some((a, b)) => all_digits(a) && all_digits(b),
        None => false,
    }
}

fn leading_digits(token: &str) -> &str {
    let end = token
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(token.len());
    &token[..end]
}

pub fn parse_version_string(s: &str) -> Option<ParsedVersion> {
    let tokens: Vec<&str> = s.trim().split('_').collect();

    let (fw_index, firmware) = tokens
        .iter()
        .enumerate()
        .skip(1)
        .find_map(|(i, t)| firmware_prefix(t).map(|fw| (i, fw)))?;

    let mut parsed = ParsedVersion {
        firmware,
        ..Default::default()
    };

    for j in fw_index + 1..tokens.len().saturating_sub(1) {
        let next = leading_digits(tokens[j + 1]);
        if !is_config_head(tokens[j]) || next.is_empty() {
            continue;
        }
        parsed.config = Some(format!("{}_{}", tokens[j], next));
        if j - 1 > fw_index && tokens[j - 1] != "?" {
            parsed.carrier = Some(tokens[j - 1].to_string());
        }
        break;
    }

    Some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spkg_version() {
        let v = parse_version_string(
            "9999999_9999999_9200_03.05.29.03_00_generic_000.000_001_SPKG_MC",
        )
        .unwrap();
        assert_eq!(v.firmware, "03.05.29.03");
        assert_eq!(v.config.as_deref(), Some("000.000_001"));
        assert_eq!(v.carrier.as_deref(), Some("generic"));
    }

    #[test]
    fn test_firmware_only() {
        let v = parse_version_string("INTERNAL_?_SWI9X15C_05.05.63.01_?_?_?_?").unwrap();
        assert_eq!(v.firmware, "05.05.63.01");
        assert_eq!(v.config, None);
        assert_eq!(v.carrier, None);
    }

    #[test]
    fn test_file_name() {
        let v = parse_version_string("SWI9X30C_02.24.05.06_GENERIC_002.026_000.nvu").unwrap();
        assert_eq!(v.firmware, "02.24.05.06");
        assert_eq!(v.config.as_deref(), Some("002.026_000"));
        assert_eq!(v.carrier.as_deref(), Some("GENERIC"));
    }

    #[test]
    fn test_firmware_with_suffix() {
        let v = parse_version_string("SWI9X30C_02.24.05.06.cwe").unwrap();
        assert_eq!(v.firmware, "02.24.05.06");
    }

    #[test]
    fn test_rejects_non_versions() {
        assert_eq!(parse_version_string(""), None);
        assert_eq!(parse_version_string("02.24.05.06"), None);
        assert_eq!(parse_version_string("X_1.2.3.4.5"), None);
        assert_eq!(parse_version_string("X_1.2.3"), None);
    }

    #[test]
    fn test_unknown_carrier() {
        let v = parse_version_string("X_02.24.05.06_?_002.026_000").unwrap();
        assert_eq!(v.config.as_deref(), Some("002.026_000"));
        assert_eq!(v.carrier, None);
    }

    #[test]
    fn test_config_right_after_firmware_has_no_carrier() {
        let v = parse_version_string("X_02.24.05.06_002.026_000").unwrap();
        assert_eq!(v.config.as_deref(), Some("002.026_000"));
        assert_eq!(v.carrier, None);
    }
}
