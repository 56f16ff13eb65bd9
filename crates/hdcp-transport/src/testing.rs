//! Simulated receiver, cipher engine and key fuse.
//!
//! The simulators model register behaviour closely enough to drive a full
//! authentication: the engine raises its valid bits as the real block does,
//! and both sides derive Ri from the exchanged An/Aksv/Bksv with the same
//! stand-in function ([`link_value`]), so a correctly sequenced handshake
//! verifies and a mis-sequenced one does not. None of this is the HDCP
//! cipher.

use crate::regs::{bstatus, ddc, Bcaps, EngineReg, HdcpCtrl, KeyCtrl, KEY_DEBUG0_SRAM_BUSY};
use crate::traits::{
    BusCapabilities, BusError, CipherEngine, DdcBus, KeySource, KeySourceError, KeyTable,
    RevocationList, KEY_TABLE_WORDS,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Link status reported in the top bits of the simulated S' registers.
pub const SIM_LINK_STATUS: u16 = 0x0c01;

/// A hardware access observed by the simulators.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HwEvent {
    BusRead { offset: u8, len: usize },
    BusShortRead { len: usize },
    BusWrite { offset: u8, data: Vec<u8> },
    EngineWrite { reg: EngineReg, value: u32 },
}

/// Shared, ordered record of hardware accesses.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<HwEvent>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: HwEvent) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<HwEvent> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    /// Index of the first event matching `pred`.
    pub fn position(&self, pred: impl Fn(&HwEvent) -> bool) -> Option<usize> {
        self.0.lock().iter().position(pred)
    }

    pub fn count(&self, pred: impl Fn(&HwEvent) -> bool) -> usize {
        self.0.lock().iter().filter(|e| pred(e)).count()
    }

    /// Number of reads (long or short format) of `offset`.
    pub fn bus_reads(&self, offset: u8) -> usize {
        self.count(|e| match e {
            HwEvent::BusRead { offset: o, .. } => *o == offset,
            HwEvent::BusShortRead { .. } => offset == ddc::RI,
            _ => false,
        })
    }

    pub fn engine_writes(&self) -> usize {
        self.count(|e| matches!(e, HwEvent::EngineWrite { .. }))
    }
}

/// Deterministic well-formed KSV (exactly 20 of 40 bits set).
pub fn ksv_from_seed(seed: u64) -> u64 {
    let mut rng = StdRng::seed_from_u64(seed);
    index::sample(&mut rng, 40, 20)
        .iter()
        .fold(0u64, |acc, bit| acc | (1u64 << bit))
}

fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Stand-in for the R0/Ri derivation shared by both simulated ends. Never zero.
pub fn link_value(an: u64, aksv: u64, bksv: u64) -> u16 {
    let m = mix(an ^ aksv.rotate_left(13) ^ bksv.rotate_left(29));
    let folded = (m ^ (m >> 16) ^ (m >> 32) ^ (m >> 48)) as u16;
    if folded == 0 {
        1
    } else {
        folded
    }
}

fn le_bytes(value: u64, len: usize) -> Vec<u8> {
    value.to_le_bytes()[..len].to_vec()
}

fn from_le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (8 * i)))
}

// ============================================================================
// Receiver
// ============================================================================

/// What the simulated receiver advertises.
#[derive(Clone, Debug)]
pub struct ReceiverProfile {
    pub bksv: u64,
    pub bcaps: Bcaps,
    /// Downstream KSVs reported through the KSV FIFO (repeaters only).
    pub downstream: Vec<u64>,
    pub depth: u8,
    /// Extra Bstatus bits, e.g. `MAX_DEVS_EXCEEDED`.
    pub bstatus_flags: u16,
    /// Bcaps polls before `READY` is reported.
    pub ready_after_polls: u32,
    pub v_prime: [u8; ddc::V_PRIME_LEN],
}

impl ReceiverProfile {
    /// A plain HDMI sink with 1.1 features.
    pub fn sink(seed: u64) -> Self {
        Self {
            bksv: ksv_from_seed(seed ^ 0x5a5a_5a5a),
            bcaps: Bcaps::HDMI_RESERVED | Bcaps::FEATURES_1_1,
            downstream: Vec::new(),
            depth: 0,
            bstatus_flags: bstatus::HDMI_MODE,
            ready_after_polls: 0,
            v_prime: [0; ddc::V_PRIME_LEN],
        }
    }

    /// A repeater with `devices` downstream sinks.
    pub fn repeater(seed: u64, devices: u8) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut v_prime = [0u8; ddc::V_PRIME_LEN];
        rng.fill(&mut v_prime[..]);
        Self {
            bcaps: Bcaps::HDMI_RESERVED | Bcaps::REPEATER | Bcaps::FEATURES_1_1,
            downstream: (0..devices)
                .map(|i| ksv_from_seed(seed.wrapping_add(1000 + u64::from(i))))
                .collect(),
            depth: 1,
            ready_after_polls: 2,
            v_prime,
            ..Self::sink(seed)
        }
    }
}

type AccessHook = Box<dyn FnOnce() + Send>;

struct ReceiverState {
    profile: ReceiverProfile,
    an: u64,
    aksv: u64,
    ainfo: u8,
    r0: u16,
    ri_override: Option<u16>,
    ri_sequence: VecDeque<u16>,
    read_failures: HashMap<u8, u32>,
    write_failures: HashMap<u8, u32>,
    bcaps_polls: u32,
    short_read: bool,
    hooks: HashMap<u8, Vec<AccessHook>>,
}

/// Simulated downstream receiver behind a DDC bus.
pub struct SimulatedReceiver {
    state: Mutex<ReceiverState>,
    connected: AtomicBool,
    log: EventLog,
}

impl SimulatedReceiver {
    pub fn new(profile: ReceiverProfile, log: EventLog) -> Self {
        Self {
            state: Mutex::new(ReceiverState {
                profile,
                an: 0,
                aksv: 0,
                ainfo: 0,
                r0: 0,
                ri_override: None,
                ri_sequence: VecDeque::new(),
                read_failures: HashMap::new(),
                write_failures: HashMap::new(),
                bcaps_polls: 0,
                short_read: false,
                hooks: HashMap::new(),
            }),
            connected: AtomicBool::new(true),
            log,
        }
    }

    /// A disconnected receiver NAKs every transaction.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Fail the next `count` reads of `offset` with a NAK.
    pub fn fail_reads(&self, offset: u8, count: u32) {
        self.state.lock().read_failures.insert(offset, count);
    }

    /// Fail the next `count` writes to `offset` with a NAK.
    pub fn fail_writes(&self, offset: u8, count: u32) {
        self.state.lock().write_failures.insert(offset, count);
    }

    /// Report `value` as Ri' instead of the derived one.
    pub fn set_ri_override(&self, value: Option<u16>) {
        self.state.lock().ri_override = value;
    }

    /// Report these values as Ri', one per read, before falling back to
    /// the override or the derived value.
    pub fn set_ri_sequence(&self, values: impl IntoIterator<Item = u16>) {
        self.state.lock().ri_sequence = values.into_iter().collect();
    }

    /// Run `hook` once, just before the next transaction touching `offset`.
    pub fn on_access(&self, offset: u8, hook: impl FnOnce() + Send + 'static) {
        self.state
            .lock()
            .hooks
            .entry(offset)
            .or_default()
            .push(Box::new(hook));
    }

    pub fn enable_short_read(&self) {
        self.state.lock().short_read = true;
    }

    pub fn bksv(&self) -> u64 {
        self.state.lock().profile.bksv
    }

    pub fn set_bksv(&self, bksv: u64) {
        self.state.lock().profile.bksv = bksv;
    }

    pub fn observed_an(&self) -> u64 {
        self.state.lock().an
    }

    pub fn observed_aksv(&self) -> u64 {
        self.state.lock().aksv
    }

    pub fn observed_ainfo(&self) -> u8 {
        self.state.lock().ainfo
    }

    pub fn profile(&self) -> ReceiverProfile {
        self.state.lock().profile.clone()
    }

    fn run_hooks(&self, offset: u8) {
        let hooks = self.state.lock().hooks.remove(&offset).unwrap_or_default();
        for hook in hooks {
            hook();
        }
    }

    fn next_ri(state: &mut ReceiverState) -> u16 {
        state
            .ri_sequence
            .pop_front()
            .or(state.ri_override)
            .unwrap_or(state.r0)
    }

    fn register_bytes(state: &mut ReceiverState, offset: u8, len: usize) -> Vec<u8> {
        if offset == ddc::RI {
            let mut bytes = Self::next_ri(state).to_le_bytes().to_vec();
            bytes.resize(len, 0);
            return bytes;
        }
        let profile = &state.profile;
        let mut bytes = match offset {
            ddc::BKSV => le_bytes(profile.bksv, ddc::KSV_LEN),
            ddc::BCAPS => {
                let mut bcaps = profile.bcaps;
                if bcaps.contains(Bcaps::REPEATER) {
                    state.bcaps_polls += 1;
                    if state.bcaps_polls > state.profile.ready_after_polls {
                        bcaps |= Bcaps::READY;
                    }
                }
                vec![bcaps.bits()]
            }
            ddc::BSTATUS => {
                let count = profile.downstream.len() as u16 & bstatus::DEVICE_COUNT_MASK;
                let depth = (u16::from(profile.depth) & bstatus::DEPTH_MASK) << bstatus::DEPTH_SHIFT;
                (count | depth | profile.bstatus_flags).to_le_bytes().to_vec()
            }
            ddc::KSV_FIFO => profile
                .downstream
                .iter()
                .flat_map(|ksv| le_bytes(*ksv, ddc::KSV_LEN))
                .collect(),
            ddc::V_PRIME => profile.v_prime.to_vec(),
            _ => Vec::new(),
        };
        bytes.resize(len, 0);
        bytes
    }
}

#[async_trait]
impl DdcBus for SimulatedReceiver {
    async fn read(&self, offset: u8, buf: &mut [u8]) -> Result<(), BusError> {
        self.run_hooks(offset);
        self.log.record(HwEvent::BusRead {
            offset,
            len: buf.len(),
        });
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::Nak { offset });
        }
        let mut state = self.state.lock();
        if let Some(left) = state.read_failures.get_mut(&offset) {
            if *left > 0 {
                *left -= 1;
                return Err(BusError::Nak { offset });
            }
        }
        let bytes = Self::register_bytes(&mut state, offset, buf.len());
        buf.copy_from_slice(&bytes);
        Ok(())
    }

    async fn write(&self, offset: u8, data: &[u8]) -> Result<(), BusError> {
        self.run_hooks(offset);
        self.log.record(HwEvent::BusWrite {
            offset,
            data: data.to_vec(),
        });
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::Nak { offset });
        }
        let mut state = self.state.lock();
        if let Some(left) = state.write_failures.get_mut(&offset) {
            if *left > 0 {
                *left -= 1;
                return Err(BusError::Nak { offset });
            }
        }
        match offset {
            ddc::AINFO => state.ainfo = data.first().copied().unwrap_or(0),
            ddc::AN => state.an = from_le(data),
            ddc::AKSV => {
                state.aksv = from_le(data) & 0xff_ffff_ffff;
                state.r0 = link_value(state.an, state.aksv, state.profile.bksv);
            }
            _ => {}
        }
        Ok(())
    }

    async fn read_current(&self, buf: &mut [u8]) -> Result<(), BusError> {
        self.run_hooks(ddc::RI);
        self.log.record(HwEvent::BusShortRead { len: buf.len() });
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BusError::Nak { offset: ddc::RI });
        }
        let mut state = self.state.lock();
        if !state.short_read {
            return Err(BusError::Unsupported);
        }
        let bytes = Self::register_bytes(&mut state, ddc::RI, buf.len());
        buf.copy_from_slice(&bytes);
        Ok(())
    }

    fn capabilities(&self) -> BusCapabilities {
        BusCapabilities {
            short_read: self.state.lock().short_read,
        }
    }
}

// ============================================================================
// Cipher engine
// ============================================================================

/// How the simulated cipher engine behaves.
#[derive(Clone, Debug)]
pub struct EngineProfile {
    pub aksv: u64,
    pub an: u64,
    /// Report a key SROM error instead of An/Aksv.
    pub srom_error: bool,
    /// Status bits the engine never raises.
    pub stalled: HdcpCtrl,
    /// Connection-state value, when the engine supports it.
    pub cs: Option<u32>,
    pub key_reload_stuck: bool,
    pub sram_busy: bool,
}

impl EngineProfile {
    pub fn healthy(seed: u64) -> Self {
        Self {
            aksv: ksv_from_seed(seed),
            an: mix(seed),
            srom_error: false,
            stalled: HdcpCtrl::empty(),
            cs: None,
            key_reload_stuck: false,
            sram_busy: false,
        }
    }
}

struct EngineState {
    profile: EngineProfile,
    regs: HashMap<EngineReg, u32>,
    key_words_loaded: usize,
    ri_override: Option<u16>,
    ri_sequence: VecDeque<u16>,
}

impl EngineState {
    fn reg(&self, reg: EngineReg) -> u32 {
        self.regs.get(&reg).copied().unwrap_or(0)
    }

    fn pair(&self, msb: EngineReg, lsb: EngineReg) -> u64 {
        (u64::from(self.reg(msb)) << 32) | u64::from(self.reg(lsb))
    }

    fn raise(&mut self, bits: HdcpCtrl) {
        let bits = bits.difference(self.profile.stalled);
        let ctrl = self.reg(EngineReg::Ctrl) | bits.bits();
        self.regs.insert(EngineReg::Ctrl, ctrl);
    }

    fn write_ctrl(&mut self, value: u32) {
        let old = HdcpCtrl::from_bits_truncate(self.reg(EngineReg::Ctrl));
        let writable = HdcpCtrl::from_bits_truncate(value) & HdcpCtrl::WRITABLE;
        let mut status = old.difference(HdcpCtrl::WRITABLE);
        if !writable.contains(HdcpCtrl::RUN) {
            status = HdcpCtrl::empty();
        }
        if self.profile.cs.is_some() {
            status |= HdcpCtrl::CS_SUPPORTED;
        }
        self.regs.insert(EngineReg::Ctrl, (writable | status).bits());

        if writable.contains(HdcpCtrl::RUN) && !old.contains(HdcpCtrl::RUN) {
            if self.profile.srom_error {
                self.raise(HdcpCtrl::SROM_ERR);
            } else {
                let (an, aksv) = (self.profile.an, self.profile.aksv);
                self.regs.insert(EngineReg::AnMsb, (an >> 32) as u32);
                self.regs.insert(EngineReg::AnLsb, an as u32);
                self.regs.insert(EngineReg::AksvMsb, (aksv >> 32) as u32);
                self.regs.insert(EngineReg::AksvLsb, aksv as u32);
                self.raise(HdcpCtrl::AN_VALID);
            }
        }
    }

    fn commit_bksv(&mut self, msb: u32) {
        let bksv = (u64::from(msb & 0xff) << 32) | u64::from(self.reg(EngineReg::BksvLsb));
        let an = self.pair(EngineReg::AnMsb, EngineReg::AnLsb);
        let aksv = self.pair(EngineReg::AksvMsb, EngineReg::AksvLsb);
        self.regs
            .insert(EngineReg::Ri, u32::from(link_value(an, aksv, bksv)));
        self.raise(HdcpCtrl::R0_VALID);
    }

    fn derive(&mut self, cksv_msb: u32) {
        let cn = self.pair(EngineReg::CnMsb, EngineReg::CnLsb);
        let cksv = (u64::from(cksv_msb & 0xff) << 32) | u64::from(self.reg(EngineReg::CksvLsb));
        let bksv = self.pair(EngineReg::BksvMsb, EngineReg::BksvLsb) & 0xff_ffff_ffff;
        let d = mix(cn ^ cksv.rotate_left(7) ^ bksv);
        let status = u32::from(SIM_LINK_STATUS);
        self.regs.insert(EngineReg::SprimeLsb1, d as u32);
        self.regs.insert(
            EngineReg::SprimeLsb2,
            ((d >> 32) as u32 & 0x00ff_ffff) | ((status & 0xff) << 24),
        );
        self.regs.insert(EngineReg::SprimeMsb, status >> 8);
        let m = mix(d);
        self.regs.insert(EngineReg::MprimeMsb, (m >> 32) as u32);
        self.regs.insert(EngineReg::MprimeLsb, m as u32);
        if let Some(cs) = self.profile.cs {
            self.regs.insert(EngineReg::CsLsb, cs);
            self.regs.insert(EngineReg::CsMsb, 0);
        }
        self.raise(HdcpCtrl::SPRIME_VALID | HdcpCtrl::MPRIME_VALID);
    }

    fn write_key_ctrl(&mut self, value: u32) {
        let mut ctrl = KeyCtrl::from_bits_truncate(value);
        if ctrl.contains(KeyCtrl::PKEY_RELOAD_TRIGGER) {
            ctrl.remove(KeyCtrl::PKEY_RELOAD_TRIGGER);
            if !self.profile.key_reload_stuck {
                ctrl.insert(KeyCtrl::PKEY_LOADED);
            }
        }
        if ctrl.contains(KeyCtrl::WRITE16) {
            self.key_words_loaded += 4;
        }
        self.regs.insert(EngineReg::KeyCtrl, ctrl.bits());
    }
}

/// Simulated HDCP cipher block.
pub struct SimulatedEngine {
    state: Mutex<EngineState>,
    log: EventLog,
}

impl SimulatedEngine {
    pub fn new(profile: EngineProfile, log: EventLog) -> Self {
        Self {
            state: Mutex::new(EngineState {
                profile,
                regs: HashMap::new(),
                key_words_loaded: 0,
                ri_override: None,
                ri_sequence: VecDeque::new(),
            }),
            log,
        }
    }

    pub fn ctrl(&self) -> HdcpCtrl {
        HdcpCtrl::from_bits_truncate(self.state.lock().reg(EngineReg::Ctrl))
    }

    /// Report `value` as the local Ri instead of the derived one.
    pub fn set_ri_override(&self, value: Option<u16>) {
        self.state.lock().ri_override = value;
    }

    /// Report these values as the local Ri, one per read, e.g. to model a
    /// rollover between two reads of the same round.
    pub fn set_ri_sequence(&self, values: impl IntoIterator<Item = u16>) {
        self.state.lock().ri_sequence = values.into_iter().collect();
    }

    pub fn key_words_loaded(&self) -> usize {
        self.state.lock().key_words_loaded
    }

    pub fn committed_bksv(&self) -> u64 {
        self.state
            .lock()
            .pair(EngineReg::BksvMsb, EngineReg::BksvLsb)
            & 0xff_ffff_ffff
    }

    pub fn profile(&self) -> EngineProfile {
        self.state.lock().profile.clone()
    }
}

#[async_trait]
impl CipherEngine for SimulatedEngine {
    fn read(&self, reg: EngineReg) -> u32 {
        let mut state = self.state.lock();
        match reg {
            EngineReg::Ri => match state.ri_sequence.pop_front().or(state.ri_override) {
                Some(ri) => u32::from(ri),
                None => state.reg(EngineReg::Ri),
            },
            EngineReg::KeyDebug0 if state.profile.sram_busy => KEY_DEBUG0_SRAM_BUSY,
            _ => state.reg(reg),
        }
    }

    fn write(&self, reg: EngineReg, value: u32) {
        self.log.record(HwEvent::EngineWrite { reg, value });
        let mut state = self.state.lock();
        match reg {
            EngineReg::Ctrl => state.write_ctrl(value),
            EngineReg::KeyCtrl => state.write_key_ctrl(value),
            EngineReg::BksvMsb => {
                state.regs.insert(reg, value);
                state.commit_bksv(value);
            }
            EngineReg::CksvMsb => {
                state.regs.insert(reg, value);
                state.derive(value);
            }
            _ => {
                state.regs.insert(reg, value);
            }
        }
    }
}

// ============================================================================
// Key fuse and revocation list
// ============================================================================

/// Key source returning a fixed table.
pub struct StaticKeySource {
    words: [u32; KEY_TABLE_WORDS],
    fail: AtomicBool,
    reads: AtomicU32,
}

impl StaticKeySource {
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut words = [0u32; KEY_TABLE_WORDS];
        rng.fill(&mut words[..]);
        Self {
            words,
            fail: AtomicBool::new(false),
            reads: AtomicU32::new(0),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

impl KeySource for StaticKeySource {
    fn read_key_table(&self) -> Result<KeyTable, KeySourceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(KeySourceError::ReadFailed("simulated fuse fault".into()));
        }
        Ok(KeyTable::new(self.words))
    }
}

/// Mutable revocation set.
#[derive(Default)]
pub struct RevocationSet(Mutex<HashSet<u64>>);

impl RevocationSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revoke(&self, ksv: u64) {
        self.0.lock().insert(ksv);
    }
}

impl RevocationList for RevocationSet {
    fn is_revoked(&self, ksv: u64) -> bool {
        self.0.lock().contains(&ksv)
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// One simulated link: receiver, engine, key fuse and revocation set sharing
/// an event log.
#[derive(Clone)]
pub struct SimulatedLink {
    pub receiver: Arc<SimulatedReceiver>,
    pub engine: Arc<SimulatedEngine>,
    pub keys: Arc<StaticKeySource>,
    pub revocation: Arc<RevocationSet>,
    pub log: EventLog,
}

impl SimulatedLink {
    /// A healthy sink link.
    pub fn new(seed: u64) -> Self {
        Self::with_profiles(seed, ReceiverProfile::sink(seed), EngineProfile::healthy(seed))
    }

    pub fn with_profiles(seed: u64, receiver: ReceiverProfile, engine: EngineProfile) -> Self {
        let log = EventLog::new();
        Self {
            receiver: Arc::new(SimulatedReceiver::new(receiver, log.clone())),
            engine: Arc::new(SimulatedEngine::new(engine, log.clone())),
            keys: Arc::new(StaticKeySource::from_seed(seed)),
            revocation: Arc::new(RevocationSet::new()),
            log,
        }
    }
}
