use std::collections::BTreeMap;

use crate::section::Section;
use crate::table::BinaryTable;
use crate::{Result, TsError};

/// Table id of the Program Association Table
pub const TID_PAT: u8 = 0x00;
/// PID reserved for the NIT in the PAT's program 0 entry
const NIT_PROGRAM: u16 = 0;

/// Program Association Table: the map from service ids to PMT PIDs.
#[derive(Debug, Clone, Default)]
pub struct Pat {
    pub ts_id: u16,
    pub version: u8,
    pub nit_pid: Option<u16>,
    /// service_id -> PMT PID
    pub pmts: BTreeMap<u16, u16>,
}

impl Pat {
    /// Parse a PAT from a complete table.
    pub fn from_table(table: &BinaryTable) -> Result<Self> {
        if table.table_id() != TID_PAT {
            return Err(TsError::InvalidTableId {
                expected: TID_PAT,
                actual: table.table_id(),
            });
        }
        let mut pat = Pat {
            ts_id: table.table_id_extension(),
            version: table.version(),
            ..Default::default()
        };
        for sect in table.sections() {
            let payload = sect.payload();
            for entry in payload.chunks_exact(4) {
                let program = u16::from_be_bytes([entry[0], entry[1]]);
                let pid = u16::from_be_bytes([entry[2], entry[3]]) & 0x1FFF;
                if program == NIT_PROGRAM {
                    pat.nit_pid = Some(pid);
                } else {
                    pat.pmts.insert(program, pid);
                }
            }
        }
        Ok(pat)
    }

    /// Serialize into a single section.
    pub fn to_section(&self) -> Result<Section> {
        let mut payload = Vec::with_capacity(4 * (self.pmts.len() + 1));
        if let Some(nit) = self.nit_pid {
            payload.extend_from_slice(&NIT_PROGRAM.to_be_bytes());
            payload.extend_from_slice(&(0xE000 | nit).to_be_bytes());
        }
        for (&program, &pid) in &self.pmts {
            payload.extend_from_slice(&program.to_be_bytes());
            payload.extend_from_slice(&(0xE000 | pid).to_be_bytes());
        }
        Section::new_long(TID_PAT, self.ts_id, self.version, true, 0, 0, &payload)
    }
}
