//! The scrambler plugin: service discovery, crypto-period scheduling and
//! per-packet scrambling.
//!
//! Crypto-period dynamics: two [`CryptoPeriod`] slots alternate. During
//! period N, scrambling uses CW(N); depending on the sign of the ECMG's
//! `delay_start`, the broadcast ECM switches shortly before or after the CW
//! does. As soon as the broadcast ECM and the scrambling CW point at the
//! same slot again, the other slot is re-armed with the following period,
//! giving the ECMG a full period to compute the next ECM.
//!
//! When a transition comes due and the next slot's ECM has not arrived yet,
//! the plugin enters degraded mode: transitions pause and the current CW
//! and ECM stay in use. Each time an ECM packet is inserted the plugin
//! checks whether the late ECM has arrived, and on recovery immediately
//! performs the overdue transition, rescheduling the other one
//! `|delay_start|` away per its sign.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pipeline_common::{PacketProcessor, PacketStatus, PipelineError, StreamContext};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, error, info, warn};

use ts::demux::{DemuxControl, DemuxHandler, SectionDemux};
use ts::packet::{PKT_SIZE, SC_EVEN_KEY};
use ts::pid::{PID_NULL, PID_PAT, PID_RESERVED_MAX, PID_SDT, PidSet};
use ts::psi::descriptor::CaDescriptor;
use ts::psi::pat::{Pat, TID_PAT};
use ts::psi::pmt::{Pmt, TID_PMT};
use ts::psi::sdt::{Sdt, TID_SDT_ACT};
use ts::table::BinaryTable;
use ts::{CyclingPacketizer, TsPacket};

use crate::Result;
use crate::config::{Service, ScramblerConfig};
use crate::crypto_period::{CryptoPeriod, EcmContext};
use crate::csa::CsaKey;
use crate::ecmg::EcmgSession;
use crate::error::ScramblerError;

/// Number of packets spanning `millis` milliseconds at `bitrate` bits per
/// second.
fn pkt_distance(bitrate: u64, millis: u64) -> u64 {
    bitrate.saturating_mul(millis) / (8 * PKT_SIZE as u64 * 1000)
}

/// The scrambler pipeline stage.
///
/// The demux lives next to the rest of the state so that table handling can
/// borrow the state while the demux drives it.
pub struct ScramblerPlugin {
    demux: SectionDemux,
    state: ScramblerState,
}

struct ScramblerState {
    config: ScramblerConfig,
    service: Service,
    ecmg: Option<EcmgSession>,
    /// `delay_start` from the ECMG, clamped to half a crypto-period
    delay_start_ms: i64,
    section_tspkt_flag: bool,
    cw_gen: StdRng,
    cp: [CryptoPeriod; 2],
    /// Slot whose CW drives scrambling
    current_cw: usize,
    /// Slot whose ECM is being broadcast
    current_ecm: usize,
    current_key: Option<CsaKey>,
    degraded: bool,
    abort: Arc<AtomicBool>,
    ready: bool,
    packet_count: u64,
    scrambled_count: u64,
    partial_clear: u64,
    pkt_insert_ecm: u64,
    pkt_change_cw: u64,
    pkt_change_ecm: u64,
    ts_bitrate: u64,
    ecm_pid: u16,
    ecm_pid_auto: bool,
    ecm_cc: u8,
    scrambled_pids: PidSet,
    conflict_pids: PidSet,
    input_pids: PidSet,
    pzer_pmt: CyclingPacketizer,
}

impl ScramblerPlugin {
    /// Build a plugin from its configuration and, unless a fixed control
    /// word is used, an established ECMG session.
    pub fn new(config: ScramblerConfig, ecmg: Option<EcmgSession>) -> Result<Self> {
        if config.fixed_cw.is_none() && ecmg.is_none() {
            return Err(ScramblerError::Config(
                "either a fixed control word or an ECMG session is required".into(),
            ));
        }
        if config.fixed_cw.is_some() && ecmg.is_some() {
            return Err(ScramblerError::Config(
                "a fixed control word does not use an ECMG".into(),
            ));
        }
        if !config.service.has_name() && config.service.id().is_none() {
            return Err(ScramblerError::Config("no service specified".into()));
        }
        if config.partial_scrambling == 0 {
            return Err(ScramblerError::Config(
                "partial scrambling count must be at least 1".into(),
            ));
        }
        if config.ecm_bitrate == 0 {
            return Err(ScramblerError::Config("ECM bitrate must be nonzero".into()));
        }
        if config.cp_duration_ms < 100 || config.cp_duration_ms / 100 > u16::MAX as u64 {
            return Err(ScramblerError::Config(format!(
                "invalid crypto-period duration: {} ms",
                config.cp_duration_ms
            )));
        }
        if let Some(pid) = config.ecm_pid
            && (pid <= PID_RESERVED_MAX || pid >= PID_NULL)
        {
            return Err(ScramblerError::Config(format!(
                "ECM PID {pid:#06x} is reserved"
            )));
        }

        let half_period = (config.cp_duration_ms / 2) as i64;
        let (delay_start_ms, section_tspkt_flag) = match &ecmg {
            Some(session) => (
                (session.channel.delay_start as i64).clamp(-half_period, half_period),
                session.channel.section_tspkt_flag,
            ),
            None => (0, true),
        };

        let service = config.service.clone();
        let ecm_pid = config.ecm_pid.unwrap_or(PID_NULL);
        Ok(ScramblerPlugin {
            demux: SectionDemux::new(),
            state: ScramblerState {
                config,
                service,
                ecmg,
                delay_start_ms,
                section_tspkt_flag,
                cw_gen: StdRng::from_os_rng(),
                cp: [CryptoPeriod::new(), CryptoPeriod::new()],
                current_cw: 0,
                current_ecm: 0,
                current_key: None,
                degraded: false,
                abort: Arc::new(AtomicBool::new(false)),
                ready: false,
                packet_count: 0,
                scrambled_count: 0,
                partial_clear: 0,
                pkt_insert_ecm: 0,
                pkt_change_cw: 0,
                pkt_change_ecm: 0,
                ts_bitrate: 0,
                ecm_pid,
                ecm_pid_auto: false,
                ecm_cc: 0,
                scrambled_pids: PidSet::new(),
                conflict_pids: PidSet::new(),
                input_pids: PidSet::new(),
                pzer_pmt: CyclingPacketizer::new(),
            },
        })
    }
}

impl ScramblerState {
    fn cp_duration_100ms(&self) -> u16 {
        (self.config.cp_duration_ms / 100) as u16
    }

    fn use_fixed_key(&self) -> bool {
        self.config.fixed_cw.is_some()
    }

    fn fail(&self, message: std::fmt::Arguments<'_>) {
        error!("{message}");
        self.abort.store(true, Ordering::Release);
    }

    /// Reset everything a run touches; called from `start`.
    fn reset_run_state(&mut self) {
        self.service = self.config.service.clone();
        self.delay_start_ms = self.delay_start_ms.clamp(
            -((self.config.cp_duration_ms / 2) as i64),
            (self.config.cp_duration_ms / 2) as i64,
        );
        self.cp = [CryptoPeriod::new(), CryptoPeriod::new()];
        self.current_cw = 0;
        self.current_ecm = 0;
        self.current_key = None;
        self.degraded = false;
        self.abort.store(false, Ordering::Release);
        self.ready = false;
        self.packet_count = 0;
        self.scrambled_count = 0;
        self.partial_clear = 0;
        self.pkt_insert_ecm = 0;
        self.pkt_change_cw = 0;
        self.pkt_change_ecm = 0;
        self.ts_bitrate = 0;
        self.ecm_pid = self.config.ecm_pid.unwrap_or(PID_NULL);
        self.ecm_pid_auto = false;
        self.ecm_cc = 0;
        self.scrambled_pids.clear_all();
        self.conflict_pids.clear_all();
        self.input_pids.clear_all();
        self.input_pids.set(PID_NULL);
        for pid in 0..=PID_RESERVED_MAX {
            self.input_pids.set(pid);
        }
        self.pzer_pmt = CyclingPacketizer::new();
    }

    /// Create the first two crypto-periods and apply CW(0).
    fn init_first_periods(&mut self) -> Result<()> {
        let synchronous = self.config.synchronous_ecmg;
        let cp_duration_100ms = self.cp_duration_100ms();
        let section_tspkt_flag = self.section_tspkt_flag;
        let ecm_pid = self.ecm_pid;
        let Some(session) = self.ecmg.as_mut() else {
            return Ok(());
        };
        let mut ctx = EcmContext {
            generator: session.generator.as_mut(),
            synchronous,
            access_criteria: &self.config.access_criteria,
            cp_duration_100ms,
            section_tspkt_flag,
            ecm_pid,
            abort: &self.abort,
            cw_gen: &mut self.cw_gen,
        };
        self.cp[0].init_cycle(0, &mut ctx)?;
        let (first_number, first_next) = (self.cp[0].cp_number(), self.cp[0].cw_next());
        self.cp[1].init_next(first_number, first_next, &mut ctx)?;
        self.current_key = Some(self.cp[0].csa_key(self.config.entropy_mode));
        Ok(())
    }

    /// Arm the slot opposite the scrambling CW with the following
    /// crypto-period.
    fn arm_next_period(&mut self) {
        let current = self.current_cw;
        let target = current ^ 1;
        let prev_number = self.cp[current].cp_number();
        let prev_next = self.cp[current].cw_next();
        let synchronous = self.config.synchronous_ecmg;
        let cp_duration_100ms = self.cp_duration_100ms();
        let section_tspkt_flag = self.section_tspkt_flag;
        let ecm_pid = self.ecm_pid;
        let Some(session) = self.ecmg.as_mut() else {
            return;
        };
        let mut ctx = EcmContext {
            generator: session.generator.as_mut(),
            synchronous,
            access_criteria: &self.config.access_criteria,
            cp_duration_100ms,
            section_tspkt_flag,
            ecm_pid,
            abort: &self.abort,
            cw_gen: &mut self.cw_gen,
        };
        if let Err(e) = self.cp[target].init_next(prev_number, prev_next, &mut ctx) {
            self.fail(format_args!("cannot start next crypto-period: {e}"));
        }
    }

    fn next_ecm(&self) -> &CryptoPeriod {
        &self.cp[self.current_ecm ^ 1]
    }

    /// Degraded-mode gate of every transition: entered when the next ECM is
    /// still missing at transition time.
    fn in_degraded_mode(&mut self) -> bool {
        if self.degraded {
            return true;
        }
        if self.next_ecm().ecm_ready() {
            return false;
        }
        warn!("next ECM not ready, entering degraded mode");
        self.degraded = true;
        true
    }

    /// Switch scrambling to the next crypto-period's CW.
    fn change_cw(&mut self) {
        if self.in_degraded_mode() {
            return;
        }
        self.current_cw ^= 1;
        self.current_key = Some(self.cp[self.current_cw].csa_key(self.config.entropy_mode));
        debug!(
            cp_number = self.cp[self.current_cw].cp_number(),
            "applying new control word"
        );
        self.pkt_change_cw =
            self.packet_count + pkt_distance(self.ts_bitrate, self.config.cp_duration_ms);
        if self.current_ecm == self.current_cw {
            self.arm_next_period();
        }
    }

    /// Switch the broadcast to the next crypto-period's ECM.
    fn change_ecm(&mut self) {
        if self.in_degraded_mode() {
            return;
        }
        self.current_ecm ^= 1;
        self.pkt_change_ecm =
            self.packet_count + pkt_distance(self.ts_bitrate, self.config.cp_duration_ms);
        if self.current_ecm == self.current_cw {
            self.arm_next_period();
        }
    }

    /// On each ECM insertion while degraded: leave degraded mode as soon as
    /// the late ECM arrived, catching up on the paused transition.
    fn try_exit_degraded_mode(&mut self) {
        if !self.degraded || !self.next_ecm().ecm_ready() {
            return;
        }
        info!("next ECM ready, exiting degraded mode");
        self.degraded = false;
        let delay = pkt_distance(self.ts_bitrate, self.delay_start_ms.unsigned_abs());
        if self.delay_start_ms < 0 {
            // ECM broadcast leads the crypto-period: switch it now and
            // postpone the CW change.
            self.change_ecm();
            self.pkt_change_cw = self.packet_count + delay;
        } else {
            self.change_cw();
            self.pkt_change_ecm = self.packet_count + delay;
        }
    }

    fn process_sdt(&mut self, sdt: &Sdt, ctrl: &mut DemuxControl) {
        let Some(name) = self.service.name().map(str::to_owned) else {
            return;
        };
        match sdt.find_service(&name) {
            Some(service_id) => {
                info!(service_id = format_args!("{service_id:#06x}"), "service found in SDT");
                self.service.set_id(service_id);
                ctrl.remove_pid(PID_SDT);
                ctrl.add_pid(PID_PAT);
            }
            None => self.fail(format_args!("service \"{name}\" not found in SDT")),
        }
    }

    fn process_pat(&mut self, pat: &Pat, ctrl: &mut DemuxControl) {
        // Every PMT PID of the multiplex is claimed, whichever service it
        // maps.
        for &pmt_pid in pat.pmts.values() {
            self.input_pids.set(pmt_pid);
        }
        let Some(service_id) = self.service.id() else {
            return;
        };
        match pat.pmts.get(&service_id) {
            Some(&pmt_pid) => {
                if let Some(previous) = self.service.pmt_pid()
                    && previous != pmt_pid
                {
                    ctrl.remove_pid(previous);
                }
                self.service.set_pmt_pid(pmt_pid);
                ctrl.add_pid(pmt_pid);
                self.pzer_pmt.set_pid(pmt_pid);
            }
            None => self.fail(format_args!(
                "service id {service_id} ({service_id:#06x}) not found in PAT"
            )),
        }
    }

    fn process_pmt(&mut self, mut pmt: Pmt, _ctrl: &mut DemuxControl) {
        // Derive the set of component PIDs to scramble.
        for (&pid, stream) in &pmt.streams {
            self.input_pids.set(pid);
            if (self.config.scramble_audio && stream.is_audio())
                || (self.config.scramble_video && stream.is_video())
                || (self.config.scramble_subtitles && stream.is_subtitles())
            {
                self.scrambled_pids.set(pid);
                info!(pid = format_args!("{pid:#06x}"), "starting scrambling");
            }
        }

        // Allocate the ECM PID: the first free PID after the PMT's,
        // skipping reserved and claimed PIDs.
        if self.ecm_pid == PID_NULL {
            let mut candidate = self.service.pmt_pid().unwrap_or(PID_PAT) + 1;
            while candidate < PID_NULL && self.input_pids.test(candidate) {
                candidate += 1;
            }
            if candidate >= PID_NULL {
                self.fail(format_args!(
                    "cannot find an unused PID for ECM, try --pid-ecm"
                ));
                return;
            }
            self.ecm_pid = candidate;
            self.ecm_pid_auto = true;
            info!(ecm_pid = format_args!("{candidate:#06x}"), "allocated ECM PID");
        }

        // Advertise the ECM PID through a CA descriptor, at program level
        // or once per scrambled component.
        let mut ca = CaDescriptor::new((self.config.super_cas_id >> 16) as u16, self.ecm_pid);
        ca.private_data = self.config.ca_private_data.clone();
        let injected = if self.config.component_level {
            let scrambled = &self.scrambled_pids;
            pmt.streams
                .iter_mut()
                .filter(|(pid, _)| scrambled.test(**pid))
                .try_for_each(|(_, stream)| ca.add_to(&mut stream.descriptors))
        } else {
            ca.add_to(&mut pmt.descriptors)
        };
        if let Err(e) = injected {
            self.fail(format_args!("cannot insert CA descriptor: {e}"));
            return;
        }

        self.pzer_pmt.remove_sections(TID_PMT, pmt.service_id);
        match pmt.to_section() {
            Ok(section) => self.pzer_pmt.add_section(section),
            Err(e) => {
                self.fail(format_args!("rebuilt PMT does not fit a section: {e}"));
                return;
            }
        }

        self.ready = true;

        // Crypto-period scheduling starts now and needs the TS bitrate.
        if self.ecmg.is_some() {
            if self.ts_bitrate == 0 {
                self.fail(format_args!("unknown bitrate, cannot schedule crypto-periods"));
                return;
            }
            self.pkt_insert_ecm = self.packet_count;
            self.pkt_change_cw =
                self.packet_count + pkt_distance(self.ts_bitrate, self.config.cp_duration_ms);
            let delay = pkt_distance(self.ts_bitrate, self.delay_start_ms.unsigned_abs());
            self.pkt_change_ecm = if self.delay_start_ms > 0 {
                self.pkt_change_cw + delay
            } else {
                self.pkt_change_cw - delay
            };
        }
    }
}

impl DemuxHandler for ScramblerState {
    fn handle_table(&mut self, ctrl: &mut DemuxControl, table: &BinaryTable) {
        match table.table_id() {
            TID_PAT if table.source_pid() == PID_PAT => {
                if let Ok(pat) = Pat::from_table(table) {
                    self.process_pat(&pat, ctrl);
                }
            }
            TID_SDT_ACT if table.source_pid() == PID_SDT => {
                if let Ok(sdt) = Sdt::from_table(table) {
                    self.process_sdt(&sdt, ctrl);
                }
            }
            TID_PMT => {
                if let Ok(pmt) = Pmt::from_table(table)
                    && self.service.has_id(pmt.service_id)
                {
                    self.process_pmt(pmt, ctrl);
                }
            }
            _ => {}
        }
    }
}

impl PacketProcessor for ScramblerPlugin {
    fn name(&self) -> &'static str {
        "scrambler"
    }

    fn start(&mut self, _ctx: &Arc<StreamContext>) -> std::result::Result<(), PipelineError> {
        self.state.reset_run_state();
        self.demux.reset();
        self.demux.add_pid(if self.state.service.has_name() {
            PID_SDT
        } else {
            PID_PAT
        });

        if let Some(cw) = self.state.config.fixed_cw {
            self.state.current_key = Some(CsaKey::new(&cw, self.state.config.entropy_mode));
            info!("using fixed control word");
        } else {
            self.state
                .init_first_periods()
                .map_err(|e| PipelineError::Processing(e.to_string()))?;
        }
        Ok(())
    }

    fn process(
        &mut self,
        ctx: &Arc<StreamContext>,
        pkt: &mut TsPacket,
    ) -> std::result::Result<PacketStatus, PipelineError> {
        self.state.packet_count += 1;
        let pid = pkt.pid();
        self.state.input_pids.set(pid);
        let bitrate = ctx.bitrate();
        if bitrate != 0 {
            self.state.ts_bitrate = bitrate;
        }

        // Let the demux drive discovery; table handling may flip the abort
        // flag or make us ready.
        self.demux.feed_packet(pkt, &mut self.state);

        let st = &mut self.state;
        if st.abort.load(Ordering::Acquire) {
            return Ok(PacketStatus::End);
        }

        // An input packet arriving on the auto-allocated ECM PID means the
        // allocation guess collided with a live PID.
        if st.ecm_pid_auto && pid == st.ecm_pid {
            error!(
                pid = format_args!("{pid:#06x}"),
                "ECM PID allocation conflict, try another --pid-ecm"
            );
            return Ok(PacketStatus::End);
        }

        // Until the modified PMT is ready nothing may leak through.
        if !st.ready {
            return Ok(PacketStatus::Null);
        }

        // The service PMT is replaced by the rebuilt one, at the original
        // cadence.
        if pid == st.pzer_pmt.pid() {
            *pkt = st.pzer_pmt.next_packet();
            return Ok(PacketStatus::Pass);
        }

        if st.ecmg.is_some() {
            if st.packet_count >= st.pkt_change_cw {
                st.change_cw();
            }
            if st.packet_count >= st.pkt_change_ecm {
                st.change_ecm();
            }
            // ECM packets ride in null-packet slots, paced by the ECM
            // bitrate.
            if pid == PID_NULL && st.packet_count >= st.pkt_insert_ecm {
                st.pkt_insert_ecm += st.ts_bitrate / st.config.ecm_bitrate;
                st.try_exit_degraded_mode();
                *pkt = st.cp[st.current_ecm].next_ecm_packet(st.ecm_pid, &mut st.ecm_cc);
                return Ok(PacketStatus::Pass);
            }
        }

        if !pkt.has_payload() || !st.scrambled_pids.test(pid) {
            return Ok(PacketStatus::Pass);
        }

        // Packets already scrambled upstream cannot be scrambled again.
        if pkt.is_scrambled() {
            if st.config.ignore_scrambled {
                if !st.conflict_pids.test(pid) {
                    info!(
                        pid = format_args!("{pid:#06x}"),
                        "input packets already scrambled, ignored"
                    );
                    st.conflict_pids.set(pid);
                }
                return Ok(PacketStatus::Pass);
            }
            error!(pid = format_args!("{pid:#06x}"), "packet already scrambled");
            return Ok(PacketStatus::End);
        }

        // Partial scrambling: one packet out of every N.
        if st.partial_clear > 0 {
            st.partial_clear -= 1;
            return Ok(PacketStatus::Pass);
        }
        st.partial_clear = st.config.partial_scrambling - 1;

        let Some(key) = st.current_key.as_ref() else {
            return Err(PipelineError::Processing(
                "scrambling key not initialized".into(),
            ));
        };
        if let Some(payload) = pkt.payload_mut() {
            key.encrypt(payload);
        }
        st.scrambled_count += 1;
        let sc = if st.use_fixed_key() {
            // A single fixed key: mark everything as even.
            SC_EVEN_KEY
        } else {
            st.cp[st.current_cw].scrambling_control()
        };
        pkt.set_scrambling_control(sc);
        Ok(PacketStatus::Pass)
    }

    fn stop(&mut self, _ctx: &Arc<StreamContext>) {
        if let Some(session) = self.state.ecmg.as_mut() {
            session.generator.disconnect();
        }
        debug!(
            packets = self.state.scrambled_count,
            pids = self.state.scrambled_pids.count(),
            "scrambling summary"
        );
        let status = self.demux.status();
        if status.has_errors() {
            warn!("section demux anomalies:\n{status}");
        }
    }
}
