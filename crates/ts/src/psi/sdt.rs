use std::collections::BTreeMap;

use crate::psi::descriptor::{DescriptorList, TAG_SERVICE};
use crate::section::Section;
use crate::table::BinaryTable;
use crate::{Result, TsError};

/// Table id of the SDT for the actual transport stream
pub const TID_SDT_ACT: u8 = 0x42;

/// One service entry of an SDT.
#[derive(Debug, Clone, Default)]
pub struct SdtService {
    pub eit_schedule: bool,
    pub eit_present_following: bool,
    pub running_status: u8,
    pub free_ca_mode: bool,
    pub descriptors: DescriptorList,
}

impl SdtService {
    /// Service name from the service descriptor, when present.
    pub fn name(&self) -> Option<&[u8]> {
        let payload = self.descriptors.find(TAG_SERVICE)?;
        // service_type, provider name, service name
        let provider_len = *payload.get(1)? as usize;
        let name_len = *payload.get(2 + provider_len)? as usize;
        payload.get(3 + provider_len..3 + provider_len + name_len)
    }
}

/// Service Description Table of the actual transport stream.
#[derive(Debug, Clone, Default)]
pub struct Sdt {
    pub ts_id: u16,
    pub version: u8,
    pub original_network_id: u16,
    pub services: BTreeMap<u16, SdtService>,
}

impl Sdt {
    /// Parse an SDT from a complete table.
    pub fn from_table(table: &BinaryTable) -> Result<Self> {
        if table.table_id() != TID_SDT_ACT {
            return Err(TsError::InvalidTableId {
                expected: TID_SDT_ACT,
                actual: table.table_id(),
            });
        }
        let mut sdt = Sdt {
            ts_id: table.table_id_extension(),
            version: table.version(),
            ..Default::default()
        };
        for (index, sect) in table.sections().enumerate() {
            let payload = sect.payload();
            if payload.len() < 3 {
                return Err(TsError::InsufficientData {
                    expected: 3,
                    actual: payload.len(),
                });
            }
            if index == 0 {
                sdt.original_network_id = u16::from_be_bytes([payload[0], payload[1]]);
            }
            let mut pos = 3;
            while pos + 5 <= payload.len() {
                let service_id = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
                let flags = payload[pos + 2];
                let loop_info = u16::from_be_bytes([payload[pos + 3], payload[pos + 4]]);
                let desc_len = (loop_info & 0x0FFF) as usize;
                pos += 5;
                if payload.len() < pos + desc_len {
                    return Err(TsError::InsufficientData {
                        expected: pos + desc_len,
                        actual: payload.len(),
                    });
                }
                sdt.services.insert(
                    service_id,
                    SdtService {
                        eit_schedule: flags & 0x02 != 0,
                        eit_present_following: flags & 0x01 != 0,
                        running_status: ((loop_info >> 13) & 0x07) as u8,
                        free_ca_mode: loop_info & 0x1000 != 0,
                        descriptors: DescriptorList::from_slice(&payload[pos..pos + desc_len]),
                    },
                );
                pos += desc_len;
            }
        }
        Ok(sdt)
    }

    /// Locate a service by name. The comparison ignores case and blanks, so
    /// operator-typed names match the broadcast strings.
    pub fn find_service(&self, name: &str) -> Option<u16> {
        self.services
            .iter()
            .find(|(_, service)| {
                service
                    .name()
                    .is_some_and(|n| service_names_match(n, name.as_bytes()))
            })
            .map(|(&id, _)| id)
    }

    /// Serialize into a single section.
    pub fn to_section(&self) -> Result<Section> {
        let mut payload = Vec::with_capacity(64);
        payload.extend_from_slice(&self.original_network_id.to_be_bytes());
        payload.push(0xFF);
        for (&service_id, service) in &self.services {
            payload.extend_from_slice(&service_id.to_be_bytes());
            payload.push(
                0xFC | u8::from(service.eit_schedule) << 1
                    | u8::from(service.eit_present_following),
            );
            let loop_info = ((service.running_status as u16) << 13)
                | (u16::from(service.free_ca_mode) << 12)
                | service.descriptors.size() as u16;
            payload.extend_from_slice(&loop_info.to_be_bytes());
            payload.extend_from_slice(service.descriptors.as_slice());
        }
        Section::new_long(TID_SDT_ACT, self.ts_id, self.version, true, 0, 0, &payload)
    }
}

/// Compare a broadcast service name with a requested one: DVB control codes
/// (bytes below 0x20) and blanks are skipped, ASCII case is folded.
fn service_names_match(broadcast: &[u8], requested: &[u8]) -> bool {
    let canon = |bytes: &[u8]| -> Vec<u8> {
        bytes
            .iter()
            .filter(|&&b| b >= 0x20 && b != b' ')
            .map(|b| b.to_ascii_lowercase())
            .collect()
    };
    canon(broadcast) == canon(requested)
}
