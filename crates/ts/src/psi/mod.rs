//! Parsers and serializers for the PSI/SI tables a scrambler works with:
//! PAT, PMT and SDT, plus the descriptor loops they carry.

pub mod descriptor;
pub mod pat;
pub mod pmt;
pub mod sdt;

pub use descriptor::{CaDescriptor, DescriptorList, TAG_CA};
pub use pat::{Pat, TID_PAT};
pub use pmt::{Pmt, PmtStream, TID_PMT};
pub use sdt::{Sdt, SdtService, TID_SDT_ACT};
