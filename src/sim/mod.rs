//! Software implementation of the driver library.
//!
//! [`Sim`] implements every trait in [`ddk`](crate::ddk) in process memory:
//! a DMA pool, an SA/token codec, a packet engine that executes AES, GCM,
//! CCM, HMAC and hash commands synchronously at submit time, and a
//! classifier with CDRT, rule and flow tables. Tests use its call log,
//! fault switches and result holding to observe and steer the pipeline.
//!
//! DES and 3DES SAs build, but commands on them complete with an
//! "unsupported" error code.

mod builder;
mod cipher;
mod digest;
mod exec;

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use slab::Slab;

use crate::ddk::{
    Bank, CdrtDescriptor, CdrtEntry, CdrtKind, Classifier, ClassifierRule, DdkError, DmaHandle,
    DmaProperties, DmaService, FlowHash, FlowSelector, Notifier, ResultDescriptor, RuleHandle,
    SaDirection, SaParams, Services,
};

pub use exec::{ERR_INVALID_SA, ERR_LENGTH, ERR_UNSUPPORTED};

/// CDRT entries available.
const CDRT_ENTRIES: usize = 64;

/// A driver call observed by the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    DmaAlloc(DmaHandle, Bank),
    DmaRelease(DmaHandle),
    ParticlesAlloc(DmaHandle),
    ParticlesRelease(DmaHandle),
    SaRegister(usize, DmaHandle),
    SaUnregister(usize, DmaHandle),
    Submit {
        ring: usize,
        id: u64,
        src_len: usize,
        dst_len: usize,
    },
    NotifyRegistered(usize),
    CdrtAlloc(u16),
    CdrtWrite(u16, CdrtDescriptor),
    CdrtFree(u16),
    RuleInstall(RuleHandle),
    RuleRemove(RuleHandle),
    TransformRegister(DmaHandle),
    TransformUnregister(DmaHandle),
    FlowAdd(DmaHandle),
    FlowRemove(DmaHandle),
    Invalidate(DmaHandle),
}

/// Fault switches. Each stays set until cleared.
#[derive(Debug, Default)]
pub struct Faults {
    /// Fail contiguous allocations from this bank.
    pub fail_alloc_bank: Option<Bank>,
    pub fail_particles: bool,
    pub fail_sa_register: bool,
    /// Refuse submissions as busy.
    pub fail_submit: bool,
    pub fail_cdrt_alloc: bool,
    pub fail_transform_register: bool,
    pub fail_rule_install: bool,
    /// Fail flow insertion for SAs of this direction.
    pub fail_flow_add: Option<SaDirection>,
}

struct Buffer {
    handle: DmaHandle,
    bank: Option<Bank>,
    data: Vec<u8>,
}

#[derive(Default)]
struct State {
    buffers: Slab<Buffer>,
    generation: u64,
    double_releases: usize,
    registered: HashSet<(usize, DmaHandle)>,
    cdrt: Vec<Option<CdrtDescriptor>>,
    rules: HashMap<u32, ClassifierRule>,
    next_rule: u32,
    transforms: HashSet<DmaHandle>,
    flows: HashMap<DmaHandle, FlowHash>,
    calls: Vec<Call>,
}

impl State {
    fn insert(&mut self, bank: Option<Bank>, size: usize) -> DmaHandle {
        self.generation += 1;
        let entry = self.buffers.vacant_entry();
        let handle = DmaHandle((self.generation << 32) | entry.key() as u64);
        entry.insert(Buffer {
            handle,
            bank,
            data: vec![0; size],
        });
        handle
    }

    fn key(&self, handle: DmaHandle) -> Option<usize> {
        let key = (handle.0 & 0xFFFF_FFFF) as usize;
        self.buffers
            .get(key)
            .filter(|b| b.handle == handle)
            .map(|_| key)
    }

    fn is_live(&self, handle: DmaHandle) -> bool {
        self.key(handle).is_some()
    }

    fn buffer(&self, handle: DmaHandle) -> Option<&Buffer> {
        self.key(handle).map(|k| &self.buffers[k])
    }

    fn buffer_mut(&mut self, handle: DmaHandle) -> Option<&mut Buffer> {
        self.key(handle).map(|k| &mut self.buffers[k])
    }

    fn bytes(&self, handle: DmaHandle) -> Option<&[u8]> {
        self.buffer(handle).map(|b| b.data.as_slice())
    }

    /// Free a buffer of the expected layout.
    fn remove(&mut self, handle: DmaHandle, particles: bool) -> Result<(), DdkError> {
        match self.key(handle) {
            Some(k) if self.buffers[k].bank.is_none() == particles => {
                self.buffers.remove(k);
                Ok(())
            }
            Some(_) => Err(DdkError::InvalidParameter),
            None => {
                self.double_releases += 1;
                Err(DdkError::InvalidHandle)
            }
        }
    }

    fn cdrt_slot(&mut self, index: u16) -> Result<&mut Option<CdrtDescriptor>, DdkError> {
        self.cdrt
            .get_mut(index as usize)
            .ok_or(DdkError::OutOfRange)
    }
}

#[derive(Default)]
struct RingState {
    ready: VecDeque<ResultDescriptor>,
    hold: bool,
    notifier: Option<Notifier>,
}

impl RingState {
    /// Notifier to fire when results are deliverable.
    fn due(&mut self) -> Option<Notifier> {
        if self.hold || self.ready.is_empty() {
            return None;
        }
        self.notifier.take()
    }
}

/// In-process driver library.
pub struct Sim {
    state: Mutex<State>,
    faults: Mutex<Faults>,
    rings: Vec<Mutex<RingState>>,
    injected: Mutex<VecDeque<u32>>,
}

impl Sim {
    /// A simulator with `rings` packet-engine rings.
    pub fn new(rings: usize) -> Arc<Self> {
        let state = State {
            cdrt: vec![None; CDRT_ENTRIES],
            ..State::default()
        };
        Arc::new(Self {
            state: Mutex::new(state),
            faults: Mutex::new(Faults::default()),
            rings: (0..rings).map(|_| Mutex::new(RingState::default())).collect(),
            injected: Mutex::new(VecDeque::new()),
        })
    }

    /// The simulator behind every driver service.
    pub fn services(self: &Arc<Self>) -> Services {
        Services {
            dma: self.clone(),
            sa: self.clone(),
            token: self.clone(),
            packet: self.clone(),
            classifier: self.clone(),
        }
    }

    pub fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock()
    }

    /// Report `code` in the next result instead of its real status.
    pub fn inject_error(&self, code: u32) {
        self.injected.lock().push_back(code);
    }

    /// Hold results of `ring` back from polling and notification until
    /// released.
    pub fn hold_results(&self, ring: usize, hold: bool) {
        let Some(r) = self.rings.get(ring) else {
            return;
        };
        let due = {
            let mut r = r.lock();
            r.hold = hold;
            r.due()
        };
        if let Some(n) = due {
            n.notify();
        }
    }

    /// Results waiting on `ring`, held or not.
    pub fn pending_results(&self, ring: usize) -> usize {
        self.rings.get(ring).map_or(0, |r| r.lock().ready.len())
    }

    /// Buffers and particle lists not yet released.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Releases of handles that were not live.
    pub fn double_releases(&self) -> usize {
        self.state.lock().double_releases
    }

    pub fn buffer_len(&self, handle: DmaHandle) -> Option<usize> {
        self.state.lock().bytes(handle).map(<[u8]>::len)
    }

    pub fn sa_registered(&self, ring: usize, sa: DmaHandle) -> bool {
        self.state.lock().registered.contains(&(ring, sa))
    }

    /// Decoded contents of an SA buffer.
    pub fn sa_params(&self, sa: DmaHandle) -> Option<SaParams> {
        let state = self.state.lock();
        builder::decode_sa(state.bytes(sa)?).ok()
    }

    pub fn cdrt(&self, index: u16) -> Option<CdrtDescriptor> {
        self.state.lock().cdrt.get(index as usize).copied().flatten()
    }

    pub fn cdrt_in_use(&self) -> usize {
        self.state.lock().cdrt.iter().filter(|e| e.is_some()).count()
    }

    pub fn rules(&self) -> Vec<ClassifierRule> {
        self.state.lock().rules.values().copied().collect()
    }

    pub fn transform_registered(&self, sa: DmaHandle) -> bool {
        self.state.lock().transforms.contains(&sa)
    }

    pub fn flow_count(&self) -> usize {
        self.state.lock().flows.len()
    }

    /// Every call observed so far, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Direction of the SA image in `sa`, if it decodes.
    fn sa_direction(state: &State, sa: DmaHandle) -> Option<SaDirection> {
        builder::decode_sa(state.bytes(sa)?).ok().map(|p| p.direction)
    }
}

impl std::fmt::Debug for Sim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sim")
            .field("rings", &self.rings.len())
            .field("live_buffers", &self.live_buffers())
            .finish()
    }
}

// ── DMA ─────────────────────────────────────────────────────────────

impl DmaService for Sim {
    fn alloc(&self, props: DmaProperties) -> Result<DmaHandle, DdkError> {
        if self.faults.lock().fail_alloc_bank == Some(props.bank) {
            return Err(DdkError::NoMemory);
        }
        if props.alignment == 0 || !props.alignment.is_power_of_two() {
            return Err(DdkError::InvalidParameter);
        }
        let mut state = self.state.lock();
        let handle = state.insert(Some(props.bank), props.size);
        state.calls.push(Call::DmaAlloc(handle, props.bank));
        Ok(handle)
    }

    fn release(&self, handle: DmaHandle) -> Result<(), DdkError> {
        let mut state = self.state.lock();
        state.remove(handle, false)?;
        state.calls.push(Call::DmaRelease(handle));
        Ok(())
    }

    fn write(&self, handle: DmaHandle, offset: usize, data: &[u8]) -> Result<(), DdkError> {
        let mut state = self.state.lock();
        let buf = state.buffer_mut(handle).ok_or(DdkError::InvalidHandle)?;
        let end = offset.checked_add(data.len()).ok_or(DdkError::OutOfRange)?;
        buf.data
            .get_mut(offset..end)
            .ok_or(DdkError::OutOfRange)?
            .copy_from_slice(data);
        Ok(())
    }

    fn read(&self, handle: DmaHandle, offset: usize, out: &mut [u8]) -> Result<(), DdkError> {
        let state = self.state.lock();
        let bytes = state.bytes(handle).ok_or(DdkError::InvalidHandle)?;
        let end = offset.checked_add(out.len()).ok_or(DdkError::OutOfRange)?;
        out.copy_from_slice(bytes.get(offset..end).ok_or(DdkError::OutOfRange)?);
        Ok(())
    }

    fn bus_address(&self, handle: DmaHandle) -> Result<u64, DdkError> {
        let state = self.state.lock();
        let key = state.key(handle).ok_or(DdkError::InvalidHandle)?;
        Ok((1 << 32) | ((key as u64) << 12))
    }

    fn alloc_particles(&self, lens: &[usize]) -> Result<DmaHandle, DdkError> {
        if self.faults.lock().fail_particles {
            return Err(DdkError::NoMemory);
        }
        let mut state = self.state.lock();
        let handle = state.insert(None, lens.iter().sum());
        state.calls.push(Call::ParticlesAlloc(handle));
        Ok(handle)
    }

    fn release_particles(&self, list: DmaHandle) -> Result<(), DdkError> {
        let mut state = self.state.lock();
        state.remove(list, true)?;
        state.calls.push(Call::ParticlesRelease(list));
        Ok(())
    }
}

// ── Classifier ──────────────────────────────────────────────────────

impl Classifier for Sim {
    fn cdrt_alloc(&self, kind: CdrtKind) -> Result<CdrtEntry, DdkError> {
        if self.faults.lock().fail_cdrt_alloc {
            return Err(DdkError::NoMemory);
        }
        let mut state = self.state.lock();
        let index = state
            .cdrt
            .iter()
            .position(Option::is_none)
            .ok_or(DdkError::NoMemory)?;
        state.cdrt[index] = Some(CdrtDescriptor::CLEARED);
        let index = index as u16;
        state.calls.push(Call::CdrtAlloc(index));
        Ok(CdrtEntry { index, kind })
    }

    fn cdrt_write(&self, entry: &CdrtEntry, desc: &CdrtDescriptor) -> Result<(), DdkError> {
        let mut state = self.state.lock();
        let slot = state.cdrt_slot(entry.index)?;
        let Some(current) = slot.as_mut() else {
            return Err(DdkError::InvalidHandle);
        };
        *current = *desc;
        state.calls.push(Call::CdrtWrite(entry.index, *desc));
        Ok(())
    }

    fn cdrt_free(&self, entry: CdrtEntry) {
        let mut state = self.state.lock();
        let freed = state
            .cdrt_slot(entry.index)
            .ok()
            .and_then(Option::take)
            .is_some();
        if freed {
            state.calls.push(Call::CdrtFree(entry.index));
        }
    }

    fn rule_install(&self, rule: &ClassifierRule) -> Result<RuleHandle, DdkError> {
        if self.faults.lock().fail_rule_install {
            return Err(DdkError::NoMemory);
        }
        let mut state = self.state.lock();
        if !matches!(state.cdrt.get(rule.cdrt_index as usize), Some(Some(_))) {
            return Err(DdkError::InvalidParameter);
        }
        state.next_rule += 1;
        let handle = RuleHandle(state.next_rule);
        state.rules.insert(handle.0, *rule);
        state.calls.push(Call::RuleInstall(handle));
        Ok(handle)
    }

    fn rule_remove(&self, rule: RuleHandle) {
        let mut state = self.state.lock();
        if state.rules.remove(&rule.0).is_some() {
            state.calls.push(Call::RuleRemove(rule));
        }
    }

    fn transform_register(&self, sa: DmaHandle) -> Result<(), DdkError> {
        if self.faults.lock().fail_transform_register {
            return Err(DdkError::NoMemory);
        }
        let mut state = self.state.lock();
        if !state.is_live(sa) {
            return Err(DdkError::InvalidHandle);
        }
        state.transforms.insert(sa);
        state.calls.push(Call::TransformRegister(sa));
        Ok(())
    }

    fn transform_unregister(&self, sa: DmaHandle) -> Result<(), DdkError> {
        let mut state = self.state.lock();
        if !state.transforms.remove(&sa) {
            return Err(DdkError::InvalidHandle);
        }
        state.calls.push(Call::TransformUnregister(sa));
        Ok(())
    }

    fn flow_hash(&self, selector: &FlowSelector) -> Result<FlowHash, DdkError> {
        let mut h = DefaultHasher::new();
        let addr = |ip: &IpAddr| match ip {
            IpAddr::V4(a) => a.to_ipv6_mapped().octets(),
            IpAddr::V6(a) => a.octets(),
        };
        addr(&selector.src).hash(&mut h);
        addr(&selector.dst).hash(&mut h);
        (selector.src_port, selector.dst_port, selector.ip_proto).hash(&mut h);
        let mixed = h.finish();
        Ok(FlowHash([
            mixed as u32,
            (mixed >> 32) as u32,
            u32::from(selector.epoch),
            selector.spi,
        ]))
    }

    fn flow_add(&self, hash: &FlowHash, sa: DmaHandle) -> Result<(), DdkError> {
        let fail_for = self.faults.lock().fail_flow_add;
        let mut state = self.state.lock();
        if !state.is_live(sa) {
            return Err(DdkError::InvalidHandle);
        }
        if fail_for.is_some() && Self::sa_direction(&state, sa) == fail_for {
            return Err(DdkError::NoMemory);
        }
        if state.flows.values().any(|h| h == hash) {
            return Err(DdkError::Busy);
        }
        state.flows.insert(sa, *hash);
        state.calls.push(Call::FlowAdd(sa));
        Ok(())
    }

    fn flow_remove(&self, sa: DmaHandle) -> Result<(), DdkError> {
        let mut state = self.state.lock();
        if state.flows.remove(&sa).is_none() {
            return Err(DdkError::InvalidHandle);
        }
        state.calls.push(Call::FlowRemove(sa));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddk::L4Match;

    #[test]
    fn handles_are_not_reused() {
        let sim = Sim::new(1);
        let a = sim.alloc(DmaProperties::new(Bank::Packet, 8)).unwrap();
        sim.release(a).unwrap();
        let b = sim.alloc(DmaProperties::new(Bank::Packet, 8)).unwrap();
        assert_ne!(a, b);
        assert_eq!(sim.release(a), Err(DdkError::InvalidHandle));
        assert_eq!(sim.double_releases(), 1);
        assert_eq!(sim.live_buffers(), 1);
    }

    #[test]
    fn release_checks_layout() {
        let sim = Sim::new(1);
        let list = sim.alloc_particles(&[4, 4]).unwrap();
        assert_eq!(sim.release(list), Err(DdkError::InvalidParameter));
        sim.release_particles(list).unwrap();
        assert_eq!(sim.live_buffers(), 0);
    }

    #[test]
    fn out_of_range_access_fails() {
        let sim = Sim::new(1);
        let h = sim.alloc(DmaProperties::new(Bank::Token, 4)).unwrap();
        assert_eq!(sim.write(h, 2, &[0; 4]), Err(DdkError::OutOfRange));
        let mut out = [0u8; 8];
        assert_eq!(sim.read(h, 0, &mut out), Err(DdkError::OutOfRange));
    }

    #[test]
    fn rules_need_an_allocated_entry() {
        let sim = Sim::new(1);
        let rule = ClassifierRule {
            cdrt_index: 3,
            spi: 7,
            l4: L4Match::Esp,
        };
        assert_eq!(sim.rule_install(&rule), Err(DdkError::InvalidParameter));
        let entry = sim.cdrt_alloc(CdrtKind::Decrypt).unwrap();
        let rule = ClassifierRule {
            cdrt_index: entry.index,
            ..rule
        };
        let handle = sim.rule_install(&rule).unwrap();
        assert_eq!(sim.rules(), vec![rule]);
        sim.rule_remove(handle);
        sim.cdrt_free(entry);
        assert_eq!(sim.cdrt_in_use(), 0);
    }

    #[test]
    fn duplicate_flows_are_refused() {
        let sim = Sim::new(1);
        let selector = FlowSelector {
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
            src_port: 5246,
            dst_port: 5246,
            ip_proto: 17,
            epoch: 1,
            spi: 0,
        };
        let hash = sim.flow_hash(&selector).unwrap();
        assert_eq!(hash, sim.flow_hash(&selector).unwrap());
        let a = sim.alloc(DmaProperties::new(Bank::Transform, 64)).unwrap();
        let b = sim.alloc(DmaProperties::new(Bank::Transform, 64)).unwrap();
        sim.flow_add(&hash, a).unwrap();
        assert_eq!(sim.flow_add(&hash, b), Err(DdkError::Busy));
        sim.flow_remove(a).unwrap();
        assert_eq!(sim.flow_remove(a), Err(DdkError::InvalidHandle));
    }
}
