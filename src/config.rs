//! Command-line surface (spec.md §6 "Environment and CLI", expanded per
//! SPEC_FULL.md §6). Vendor/product IDs and interface selection are the
//! only inputs this daemon needs, since everything else about "which USB
//! device" is resolved by [`crate::discovery`].

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "usbpiper", about = "Bridge USB bulk/interrupt endpoints to character devices")]
pub struct Config {
    /// USB vendor ID, e.g. 0x1234 or 1234 (hex).
    #[arg(long, value_parser = parse_hex16)]
    pub vendor: u16,

    /// USB product ID, e.g. 0x5678 or 5678 (hex).
    #[arg(long, value_parser = parse_hex16)]
    pub product: u16,

    /// Interface number to claim.
    #[arg(long, default_value_t = 0)]
    pub interface: u8,

    /// Alternate setting to select on the claimed interface.
    #[arg(long = "alt-setting", default_value_t = 0)]
    pub alt_setting: u8,

    /// Increase log verbosity; repeatable (-v, -vv, -vvv, ...).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn parse_hex16(s: &str) -> Result<u16, String> {
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u16::from_str_radix(s, 16).map_err(|e| format!("invalid hex value {:?}: {}", s, e))
}

impl Config {
    pub fn log_level_filter(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_0x_prefixed_hex() {
        assert_eq!(parse_hex16("0x1234").unwrap(), 0x1234);
    }

    #[test]
    fn parses_bare_hex() {
        assert_eq!(parse_hex16("5678").unwrap(), 0x5678);
    }

    #[test]
    fn rejects_non_hex() {
        assert!(parse_hex16("zzzz").is_err());
    }

    #[test]
    fn verbosity_maps_to_level() {
        let cfg = Config {
            vendor: 0,
            product: 0,
            interface: 0,
            alt_setting: 0,
            verbose: 2,
        };
        assert_eq!(cfg.log_level_filter(), log::LevelFilter::Info);
    }
}
