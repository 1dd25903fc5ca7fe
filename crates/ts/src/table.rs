use crate::section::Section;
use crate::{Result, TsError};

/// A complete table: the ordered sections sharing one extended table id and
/// version, indexed 0..=last_section_number.
///
/// The demultiplexer only hands out complete tables, so construction checks
/// the full consistency once and accessors stay infallible.
#[derive(Debug, Clone)]
pub struct BinaryTable {
    sections: Vec<Section>,
}

impl BinaryTable {
    /// Assemble a table from its complete, ordered section list.
    pub fn from_sections(sections: Vec<Section>) -> Result<Self> {
        let first = sections
            .first()
            .ok_or_else(|| TsError::InconsistentTable("empty section list".into()))?;
        let etid = first.etid();
        let version = first.version();
        let expected = first.last_section_number() as usize + 1;
        if sections.len() != expected {
            return Err(TsError::InconsistentTable(format!(
                "{} sections, last_section_number {}",
                sections.len(),
                expected - 1
            )));
        }
        for (i, sect) in sections.iter().enumerate() {
            if sect.etid() != etid
                || sect.version() != version
                || sect.section_number() as usize != i
                || sect.last_section_number() as usize != expected - 1
            {
                return Err(TsError::InconsistentTable(format!(
                    "section {i} does not belong to table {etid:?} v{version}"
                )));
            }
        }
        Ok(BinaryTable { sections })
    }

    #[inline]
    pub fn table_id(&self) -> u8 {
        self.sections[0].table_id()
    }

    #[inline]
    pub fn table_id_extension(&self) -> u16 {
        self.sections[0].table_id_extension()
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.sections[0].version()
    }

    #[inline]
    pub fn source_pid(&self) -> u16 {
        self.sections[0].source_pid()
    }

    #[inline]
    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    pub fn section(&self, index: usize) -> &Section {
        &self.sections[index]
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    /// Sum of the on-wire sizes of all sections.
    pub fn total_size(&self) -> usize {
        self.sections.iter().map(Section::size).sum()
    }

    /// Concatenated on-wire bytes of all sections, in order. Byte-identical
    /// to the input the table was assembled from.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_size());
        for sect in &self.sections {
            out.extend_from_slice(sect.as_bytes());
        }
        out
    }
}
