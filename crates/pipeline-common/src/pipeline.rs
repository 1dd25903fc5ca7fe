//! The pipeline runner: input -> processors -> output.

use std::sync::Arc;

use tracing::debug;
use ts::TsPacket;

use crate::{PacketProcessor, PacketStatus, PipelineError, StreamContext};

/// A chain of packet processors driven over an input packet iterator.
///
/// Packets flow through the stages in order. A stage returning
/// [`PacketStatus::Null`] stuffs the packet (later stages still see it, as a
/// null packet); `Drop` removes it; `End` terminates the run with a
/// [`PipelineError::Terminated`] carrying the stage name. Cancellation is
/// honored between packets.
pub struct Pipeline {
    processors: Vec<Box<dyn PacketProcessor>>,
    context: Arc<StreamContext>,
}

impl Pipeline {
    pub fn new(context: Arc<StreamContext>) -> Self {
        Pipeline {
            processors: Vec::new(),
            context,
        }
    }

    /// Add a processor to the end of the chain. Returns self for chaining.
    pub fn add_processor<P: PacketProcessor + 'static>(mut self, processor: P) -> Self {
        self.processors.push(Box::new(processor));
        self
    }

    /// Run the pipeline to completion of the input.
    ///
    /// Processors are started before the first packet and stopped after the
    /// last one, also when the run ends early.
    pub fn run<I, O>(mut self, input: I, output: &mut O) -> Result<(), PipelineError>
    where
        I: IntoIterator<Item = Result<TsPacket, PipelineError>>,
        O: FnMut(&TsPacket) -> Result<(), PipelineError>,
    {
        for processor in &mut self.processors {
            processor.start(&self.context)?;
        }

        let result = self.run_inner(input, output);

        for processor in &mut self.processors {
            processor.stop(&self.context);
        }
        match &result {
            Ok(()) => debug!("{} pipeline completed", self.context.name),
            Err(e) => debug!("{} pipeline ended: {e}", self.context.name),
        }
        result
    }

    fn run_inner<I, O>(&mut self, input: I, output: &mut O) -> Result<(), PipelineError>
    where
        I: IntoIterator<Item = Result<TsPacket, PipelineError>>,
        O: FnMut(&TsPacket) -> Result<(), PipelineError>,
    {
        for item in input {
            if self.context.token.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let mut pkt = item?;
            let mut dropped = false;
            for processor in &mut self.processors {
                match processor.process(&self.context, &mut pkt)? {
                    PacketStatus::Pass => {}
                    PacketStatus::Null => pkt = TsPacket::null(),
                    PacketStatus::Drop => {
                        dropped = true;
                        break;
                    }
                    PacketStatus::End => {
                        return Err(PipelineError::Terminated(processor.name()));
                    }
                }
            }
            if !dropped {
                output(&pkt)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CancellationToken;

    /// Nullifies every packet on an even position, ends at a limit.
    struct TestStage {
        seen: u64,
        end_after: u64,
    }

    impl PacketProcessor for TestStage {
        fn name(&self) -> &'static str {
            "test-stage"
        }

        fn process(
            &mut self,
            _ctx: &Arc<StreamContext>,
            pkt: &mut TsPacket,
        ) -> Result<PacketStatus, PipelineError> {
            self.seen += 1;
            if self.seen > self.end_after {
                return Ok(PacketStatus::End);
            }
            if self.seen % 2 == 0 {
                return Ok(PacketStatus::Drop);
            }
            pkt.set_continuity_counter(9);
            Ok(PacketStatus::Pass)
        }
    }

    fn input_of(n: usize) -> Vec<Result<TsPacket, PipelineError>> {
        (0..n)
            .map(|_| {
                let mut pkt = TsPacket::null();
                pkt.set_pid(0x0100);
                Ok(pkt)
            })
            .collect()
    }

    #[test]
    fn test_pass_drop_and_mutation() {
        let ctx = StreamContext::arc_new(CancellationToken::new());
        let pipeline = Pipeline::new(ctx).add_processor(TestStage {
            seen: 0,
            end_after: u64::MAX,
        });

        let mut out = Vec::new();
        pipeline
            .run(input_of(4), &mut |pkt: &TsPacket| {
                out.push(*pkt);
                Ok(())
            })
            .unwrap();

        // Every second packet dropped, the rest mutated in place.
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|p| p.continuity_counter() == 9));
    }

    #[test]
    fn test_end_terminates_with_stage_name() {
        let ctx = StreamContext::arc_new(CancellationToken::new());
        let pipeline = Pipeline::new(ctx).add_processor(TestStage {
            seen: 0,
            end_after: 1,
        });

        let mut count = 0usize;
        let err = pipeline
            .run(input_of(10), &mut |_pkt: &TsPacket| {
                count += 1;
                Ok(())
            })
            .unwrap_err();

        assert!(matches!(err, PipelineError::Terminated("test-stage")));
        assert_eq!(count, 1);
    }

    #[test]
    fn test_cancellation_between_packets() {
        let token = CancellationToken::new();
        let ctx = StreamContext::arc_new(token.clone());
        let pipeline = Pipeline::new(ctx);
        token.cancel();

        let err = pipeline
            .run(input_of(3), &mut |_pkt: &TsPacket| Ok(()))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
