use crate::csa::{CW_SIZE, EntropyMode};

/// Default ECM PID bitrate in bits per second
pub const DEFAULT_ECM_BITRATE: u64 = 30_000;
/// Default crypto-period duration in milliseconds
pub const DEFAULT_CP_DURATION_MS: u64 = 10_000;

/// A reference to the service being scrambled: by id, by name, or both once
/// discovery has resolved the name. The PMT PID is learned from the PAT.
#[derive(Debug, Clone, Default)]
pub struct Service {
    name: Option<String>,
    id: Option<u16>,
    pmt_pid: Option<u16>,
}

impl Service {
    /// Interpret a user-supplied service reference: a decimal or `0x` hex
    /// integer is a service id, anything else a service name to resolve
    /// through the SDT.
    pub fn parse(value: &str) -> Service {
        let id = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
            u16::from_str_radix(hex, 16).ok()
        } else {
            value.parse::<u16>().ok()
        };
        match id {
            Some(id) => Service {
                id: Some(id),
                ..Default::default()
            },
            None => Service {
                name: Some(value.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn from_id(id: u16) -> Service {
        Service {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn has_name(&self) -> bool {
        self.name.is_some()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn has_id(&self, id: u16) -> bool {
        self.id == Some(id)
    }

    pub fn id(&self) -> Option<u16> {
        self.id
    }

    pub fn set_id(&mut self, id: u16) {
        self.id = Some(id);
    }

    pub fn pmt_pid(&self) -> Option<u16> {
        self.pmt_pid
    }

    pub fn set_pmt_pid(&mut self, pid: u16) {
        self.pmt_pid = Some(pid);
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.name, self.id) {
            (Some(name), Some(id)) => write!(f, "\"{name}\" ({id:#06x})"),
            (Some(name), None) => write!(f, "\"{name}\""),
            (None, Some(id)) => write!(f, "{id:#06x}"),
            (None, None) => write!(f, "<unspecified>"),
        }
    }
}

/// Static configuration of the scrambler plugin. Field defaults mirror the
/// operational defaults of the CLI surface.
#[derive(Debug, Clone)]
pub struct ScramblerConfig {
    pub service: Service,
    /// Fixed control word; no ECMG involved when set
    pub fixed_cw: Option<[u8; CW_SIZE]>,
    pub scramble_audio: bool,
    pub scramble_video: bool,
    pub scramble_subtitles: bool,
    /// Insert CA descriptors per scrambled component instead of at program
    /// level
    pub component_level: bool,
    /// Generate ECMs synchronously (offline processing)
    pub synchronous_ecmg: bool,
    /// Pass through packets that are already scrambled instead of aborting
    pub ignore_scrambled: bool,
    /// User-chosen ECM PID; allocated after the PMT PID when unset
    pub ecm_pid: Option<u16>,
    pub ecm_bitrate: u64,
    pub cp_duration_ms: u64,
    /// Scramble one packet out of this many; 1 scrambles everything
    pub partial_scrambling: u64,
    pub access_criteria: Vec<u8>,
    /// Private data of the inserted CA descriptor
    pub ca_private_data: Vec<u8>,
    pub super_cas_id: u32,
    pub entropy_mode: EntropyMode,
}

impl Default for ScramblerConfig {
    fn default() -> Self {
        ScramblerConfig {
            service: Service::default(),
            fixed_cw: None,
            scramble_audio: true,
            scramble_video: true,
            scramble_subtitles: false,
            component_level: false,
            synchronous_ecmg: false,
            ignore_scrambled: false,
            ecm_pid: None,
            ecm_bitrate: DEFAULT_ECM_BITRATE,
            cp_duration_ms: DEFAULT_CP_DURATION_MS,
            partial_scrambling: 1,
            access_criteria: Vec::new(),
            ca_private_data: Vec::new(),
            super_cas_id: 0,
            entropy_mode: EntropyMode::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_parse_decimal_id() {
        let service = Service::parse("4660");
        assert!(service.has_id(4660));
        assert!(!service.has_name());
    }

    #[test]
    fn test_service_parse_hex_id() {
        let service = Service::parse("0x1234");
        assert!(service.has_id(0x1234));
    }

    #[test]
    fn test_service_parse_name() {
        let service = Service::parse("News Channel");
        assert!(service.has_name());
        assert_eq!(service.name(), Some("News Channel"));
        assert_eq!(service.id(), None);
    }

    #[test]
    fn test_service_resolution() {
        let mut service = Service::parse("news");
        service.set_id(0x0042);
        service.set_pmt_pid(0x0100);
        assert!(service.has_id(0x0042));
        assert_eq!(service.pmt_pid(), Some(0x0100));
        assert!(service.has_name());
    }

    #[test]
    fn test_config_defaults() {
        let config = ScramblerConfig::default();
        assert!(config.scramble_audio);
        assert!(config.scramble_video);
        assert!(!config.scramble_subtitles);
        assert_eq!(config.ecm_bitrate, DEFAULT_ECM_BITRATE);
        assert_eq!(config.partial_scrambling, 1);
    }
}
