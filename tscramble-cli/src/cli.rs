use std::path::PathBuf;

use clap::Parser;

/// DVB-CSA transport stream scrambler.
///
/// Reads a transport stream, scrambles the selected service and writes the
/// resulting stream. Control words either stay fixed (--control-word) or
/// rotate per crypto-period with ECMs generated by a DVB SimulCrypt ECMG
/// (--ecmg).
#[derive(Parser, Debug)]
#[command(name = "tscramble", version, about)]
pub struct Args {
    /// Service to scramble: a service id (decimal or 0x hex) or an SDT
    /// service name
    pub service: String,

    /// Fixed control word as 16 hexadecimal digits; no ECMG is used
    #[arg(short = 'c', long, value_name = "HEX16", conflicts_with = "ecmg")]
    pub control_word: Option<String>,

    /// ECM generator to connect to
    #[arg(short = 'e', long, value_name = "HOST:PORT")]
    pub ecmg: Option<String>,

    /// DVB SimulCrypt Super_CAS_Id, required with --ecmg
    #[arg(short = 's', long, value_name = "U32", value_parser = parse_u32)]
    pub super_cas_id: Option<u32>,

    /// DVB SimulCrypt ECM_channel_id
    #[arg(long, default_value_t = 1)]
    pub channel_id: u16,

    /// DVB SimulCrypt ECM_stream_id
    #[arg(long, default_value_t = 1)]
    pub stream_id: u16,

    /// DVB SimulCrypt ECM_id
    #[arg(short = 'i', long, default_value_t = 1)]
    pub ecm_id: u16,

    /// ECMG <=> SCS protocol version
    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(2..=3))]
    pub ecmg_scs_version: u8,

    /// Crypto-period duration in seconds
    #[arg(short = 'd', long, default_value_t = 10, value_name = "SECONDS")]
    pub cp_duration: u64,

    /// ECM PID bitrate in bits per second
    #[arg(short = 'b', long, default_value_t = 30_000, value_name = "BPS")]
    pub bitrate_ecm: u64,

    /// ECM PID (default: the first unused PID after the PMT's)
    #[arg(long, value_name = "PID", value_parser = parse_pid)]
    pub pid_ecm: Option<u16>,

    /// Access criteria sent to the ECMG, as hexadecimal digits
    #[arg(short = 'a', long, value_name = "HEX")]
    pub access_criteria: Option<String>,

    /// CA descriptor private data, as hexadecimal digits
    #[arg(short = 'p', long, value_name = "HEX")]
    pub private_data: Option<String>,

    /// Scramble only one packet out of this many
    #[arg(long, default_value_t = 1, value_name = "COUNT")]
    pub partial_scrambling: u64,

    /// Do not scramble audio components
    #[arg(long)]
    pub no_audio: bool,

    /// Do not scramble video components
    #[arg(long)]
    pub no_video: bool,

    /// Also scramble subtitle components
    #[arg(long)]
    pub subtitles: bool,

    /// Insert CA descriptors at component level instead of program level
    #[arg(long)]
    pub component_level: bool,

    /// Keep the full 64-bit CW instead of reducing entropy to 48 bits
    #[arg(short = 'n', long)]
    pub no_entropy_reduction: bool,

    /// Pass through packets that are already scrambled instead of failing
    #[arg(long)]
    pub ignore_scrambled: bool,

    /// Generate ECMs synchronously; use for offline processing
    #[arg(long)]
    pub synchronous: bool,

    /// Input transport stream file (default: stdin)
    #[arg(long, value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Output transport stream file (default: stdout)
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Transport stream bitrate in bits per second, needed to schedule
    /// crypto-periods when an ECMG is used
    #[arg(long, value_name = "BPS")]
    pub bitrate: Option<u64>,

    /// More detailed logging
    #[arg(long)]
    pub verbose: bool,

    /// Errors only
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

/// Parse a u32 accepting decimal or 0x-prefixed hexadecimal.
pub fn parse_u32(value: &str) -> Result<u32, String> {
    let parsed = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        value.parse()
    };
    parsed.map_err(|e| format!("invalid number \"{value}\": {e}"))
}

/// Parse a PID: decimal or 0x hex, within the assignable PID range
/// (reserved PIDs and the null PID are refused).
pub fn parse_pid(value: &str) -> Result<u16, String> {
    let raw = parse_u32(value)?;
    if !(0x0020..0x1FFF).contains(&raw) {
        return Err(format!("PID \"{value}\" out of the assignable range"));
    }
    Ok(raw as u16)
}

/// Decode a hexadecimal byte string (an even number of hex digits).
pub fn parse_hex(value: &str) -> Result<Vec<u8>, String> {
    if value.len() % 2 != 0 {
        return Err("specify an even number of hexadecimal digits".into());
    }
    (0..value.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&value[i..i + 2], 16)
                .map_err(|_| format!("invalid hexadecimal digits \"{}\"", &value[i..i + 2]))
        })
        .collect()
}

/// Decode a 16-hex-digit control word.
pub fn parse_control_word(value: &str) -> Result<[u8; 8], String> {
    let bytes = parse_hex(value)?;
    bytes
        .try_into()
        .map_err(|_| "control word must be 16 hexadecimal digits".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_u32_formats() {
        assert_eq!(parse_u32("1234").unwrap(), 1234);
        assert_eq!(parse_u32("0x12345678").unwrap(), 0x12345678);
        assert!(parse_u32("zz").is_err());
    }

    #[test]
    fn test_parse_pid_bounds() {
        assert_eq!(parse_pid("0x0100").unwrap(), 0x0100);
        assert!(parse_pid("0x1FFF").is_err()); // null PID
        assert!(parse_pid("0x0010").is_err()); // reserved
        assert!(parse_pid("0x2000").is_err()); // out of range
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("deadBEEF").unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(parse_hex("").unwrap(), Vec::<u8>::new());
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_parse_control_word() {
        assert_eq!(
            parse_control_word("0102030405060708").unwrap(),
            [1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert!(parse_control_word("0102").is_err());
    }

    #[test]
    fn test_args_parse_minimal() {
        let args = Args::try_parse_from(["tscramble", "0x1234", "-c", "0102030405060708"]).unwrap();
        assert_eq!(args.service, "0x1234");
        assert_eq!(args.cp_duration, 10);
        assert_eq!(args.bitrate_ecm, 30_000);
    }

    #[test]
    fn test_control_word_conflicts_with_ecmg() {
        assert!(
            Args::try_parse_from([
                "tscramble",
                "news",
                "-c",
                "0102030405060708",
                "-e",
                "ecmg:2222",
            ])
            .is_err()
        );
    }
}
