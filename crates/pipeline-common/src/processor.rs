use std::sync::Arc;

use ts::TsPacket;

use crate::{PipelineError, StreamContext};

/// Verdict of a processor on one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// Pass the (possibly modified) packet downstream.
    Pass,
    /// Replace the packet with a null packet.
    Null,
    /// Remove the packet from the stream.
    Drop,
    /// Terminate the whole pipeline.
    End,
}

/// A pipeline stage processing one TS packet at a time.
///
/// `process` is invoked serially from the pipeline thread; a processor
/// never sees two packets concurrently. The packet is mutable in place:
/// stages rewrite headers and payloads rather than reallocating.
pub trait PacketProcessor: Send {
    /// Stage name used in logs and error reports.
    fn name(&self) -> &'static str;

    /// Called once before the first packet.
    fn start(&mut self, _ctx: &Arc<StreamContext>) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Process one packet and decide its fate.
    fn process(
        &mut self,
        ctx: &Arc<StreamContext>,
        pkt: &mut TsPacket,
    ) -> Result<PacketStatus, PipelineError>;

    /// Called once after the last packet, also on cancellation and
    /// termination.
    fn stop(&mut self, _ctx: &Arc<StreamContext>) {}
}
