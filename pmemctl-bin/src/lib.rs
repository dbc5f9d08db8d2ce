//! Shared helpers for the pmemctl command line client.

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;

/// Sets up env_logger behind an indicatif multi-progress, so log lines and
/// progress bars do not fight over the terminal.
pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}

/// Parses a u64 that may be given as decimal or 0x-prefixed hex.
pub fn parse_u64(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| e.to_string())
    } else {
        s.parse().map_err(|e: std::num::ParseIntError| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::parse_u64;

    #[test]
    fn parses_decimal_and_hex() {
        assert_eq!(parse_u64("4096"), Ok(4096));
        assert_eq!(parse_u64("0x1000"), Ok(0x1000));
        assert_eq!(parse_u64("0XdeadBEEF"), Ok(0xdead_beef));
        assert!(parse_u64("0xnope").is_err());
        assert!(parse_u64("").is_err());
    }
}
