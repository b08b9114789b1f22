//! The deoptimization runtime.
//!
//! A [`Runtime`] owns everything compiled code needs at run time: the
//! published deopt metadata, one [`CodeRuntime`] per installed unit and the
//! native footers of suspended generators. Published metadata is immutable.
//! Its table is appended to from inside the compile section while units are
//! installed or discarded; readers take only the table's read lock.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use lumen_codegen::{
    compile_function, compile_parallel, CompiledUnit, DeoptMetadata, DeoptNonce, DeoptReason,
};
use lumen_core::code::CodeUnit;
use lumen_core::strings::{InternTable, Symbol};
use lumen_core::sync::CompileSection;
use lumen_core::values::{GenStatus, Heap, ObjRef, Object};
use lumen_hir::Function;

use crate::config::JitConfig;
use crate::error::RuntimeError;
use crate::frame::{CallChain, FrameId, FrameStatus, InterpreterFrame, MachineSnapshot};
use crate::materialize::{materialize_frames, release_native_references};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Index of a published [`DeoptMetadata`]. Native code passes it to the
/// runtime when a deopt is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeoptId(pub u32);

impl fmt::Display for DeoptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deopt#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u32);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Runtime data of one installed unit.
#[derive(Debug, Clone)]
pub struct CodeRuntime {
    pub id: UnitId,
    pub name: Symbol,
    pub code: Arc<CodeUnit>,
    /// Native frame size in bytes.
    pub frame_size: usize,
    /// Metadata of the unit's deopt sites, in the unit's site order.
    pub deopt_ids: Vec<DeoptId>,
}

/// Published metadata, indexed by [`DeoptId`]. Discarded entries are `None`.
type MetadataTable = RwLock<Vec<Option<Arc<DeoptMetadata>>>>;

/// State shared across units. Lives inside the compile section.
#[derive(Debug, Default)]
struct Registry {
    metadata: Arc<MetadataTable>,
    units: BTreeMap<UnitId, CodeRuntime>,
    next_unit: u32,
    names: InternTable,
}

impl Registry {
    fn add_metadata(&mut self, meta: DeoptMetadata) -> Result<DeoptId, RuntimeError> {
        if !meta.is_fully_located() {
            return Err(RuntimeError::UnlocatedMetadata { nonce: meta.nonce });
        }
        let mut table = self.metadata.write();
        let id = DeoptId(u32::try_from(table.len()).expect("deopt id space exhausted"));
        table.push(Some(Arc::new(meta)));
        Ok(id)
    }

    fn install(&mut self, unit: CompiledUnit) -> Result<UnitId, RuntimeError> {
        // All or nothing: a unit with one unusable record publishes none.
        if let Some(meta) = unit.deopt_metadata.iter().find(|m| !m.is_fully_located()) {
            return Err(RuntimeError::UnlocatedMetadata { nonce: meta.nonce });
        }
        let frame_size = unit.frame_size();
        let mut deopt_ids = Vec::with_capacity(unit.deopt_metadata.len());
        for meta in unit.deopt_metadata {
            deopt_ids.push(self.add_metadata(meta)?);
        }
        let id = UnitId(self.next_unit);
        self.next_unit += 1;
        let name = self.names.intern(&unit.name);
        tracing::debug!(unit = %unit.name, %id, deopt_sites = deopt_ids.len(), "installed unit");
        self.units.insert(
            id,
            CodeRuntime {
                id,
                name,
                code: unit.code,
                frame_size,
                deopt_ids,
            },
        );
        Ok(id)
    }

    fn discard(&mut self, id: UnitId) -> Result<CodeRuntime, RuntimeError> {
        let unit = self.units.remove(&id).ok_or(RuntimeError::UnknownUnit(id))?;
        let mut table = self.metadata.write();
        for deopt in &unit.deopt_ids {
            if let Some(slot) = table.get_mut(deopt.0 as usize) {
                *slot = None;
            }
        }
        tracing::debug!(%id, outstanding = self.units.len(), "discarded unit");
        Ok(unit)
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Deoptimization counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeoptStats {
    pub deopts: u64,
    pub frames_materialized: u64,
    pub suspended_generators: u64,
    pub by_reason: BTreeMap<&'static str, u64>,
}

impl DeoptStats {
    pub fn count(&self, reason: DeoptReason) -> u64 {
        let key: &'static str = reason.into();
        self.by_reason.get(key).copied().unwrap_or(0)
    }

    fn record(&mut self, reason: DeoptReason) {
        self.deopts += 1;
        *self.by_reason.entry(reason.into()).or_default() += 1;
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Generator footers
// ---------------------------------------------------------------------------

/// Native state of a compiled generator between suspensions.
#[derive(Debug, Clone)]
pub struct GeneratorFooter {
    pub unit: UnitId,
    /// Non-owning back-pointer to the generator object.
    pub gen: ObjRef,
    /// The yield the generator is suspended at, or last resumed from.
    pub yield_point: DeoptId,
    meta: Arc<DeoptMetadata>,
    /// Saved spill area. Holds the native frame's owned references while
    /// suspended; empty while running.
    spill: Vec<u64>,
    status: GenStatus,
}

impl GeneratorFooter {
    pub fn status(&self) -> GenStatus {
        self.status
    }

    pub fn is_suspended(&self) -> bool {
        self.status == GenStatus::Suspended
    }
}

/// What native code needs to continue a suspended generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorResume {
    pub unit: UnitId,
    pub yield_point: DeoptId,
    pub spill: Vec<u64>,
}

fn set_generator_status(heap: &mut Heap, gen: ObjRef, status: GenStatus) {
    match heap.get_mut(gen) {
        Object::Generator(g) => g.status = status,
        other => panic!("{gen} is a {}, not a generator", other.kind()),
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct Runtime {
    config: JitConfig,
    nonce: DeoptNonce,
    metadata: Arc<MetadataTable>,
    registry: CompileSection<Registry>,
    generators: Mutex<HashMap<ObjRef, GeneratorFooter>>,
    stats: Mutex<DeoptStats>,
}

impl Runtime {
    pub fn new(config: JitConfig) -> Self {
        let metadata = Arc::new(MetadataTable::default());
        Self {
            config,
            nonce: DeoptNonce::new(),
            registry: CompileSection::new(Registry {
                metadata: Arc::clone(&metadata),
                ..Registry::default()
            }),
            metadata,
            generators: Mutex::new(HashMap::new()),
            stats: Mutex::new(DeoptStats::default()),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    // -- compilation --------------------------------------------------------

    /// Compile `func` and install the result.
    pub fn compile(&self, func: &Function) -> Result<UnitId, RuntimeError> {
        let unit = compile_function(func, &self.config.compile, &self.nonce)?;
        self.install(unit)
    }

    /// Compile and install `funcs` on the configured worker threads.
    /// Results are in input order.
    pub fn compile_all(&self, funcs: Vec<Function>) -> Vec<Result<UnitId, RuntimeError>> {
        compile_parallel(
            funcs,
            &self.config.compile,
            &self.nonce,
            &self.registry,
            Registry::install,
        )
        .into_iter()
        .map(|result| result.map_err(RuntimeError::from).and_then(|installed| installed))
        .collect()
    }

    /// Publish a compiled unit's metadata and create its [`CodeRuntime`].
    pub fn install(&self, unit: CompiledUnit) -> Result<UnitId, RuntimeError> {
        self.registry.with(|registry| registry.install(unit))
    }

    /// Discard an installed unit together with its metadata.
    pub fn discard(&self, id: UnitId) -> Result<(), RuntimeError> {
        self.registry.with(|registry| registry.discard(id)).map(drop)
    }

    pub fn code_runtime(&self, id: UnitId) -> Option<CodeRuntime> {
        self.registry.with(|registry| registry.units.get(&id).cloned())
    }

    /// Qualified name a unit was installed under.
    pub fn unit_name(&self, id: UnitId) -> Option<String> {
        self.registry.with(|registry| {
            let unit = registry.units.get(&id)?;
            registry.names.resolve(unit.name).map(str::to_string)
        })
    }

    /// Number of installed units.
    pub fn outstanding_units(&self) -> usize {
        self.registry.with(|registry| registry.units.len())
    }

    // -- metadata -----------------------------------------------------------

    /// Publish one record. Fails if any live value has no location.
    pub fn add_deopt_metadata(&self, meta: DeoptMetadata) -> Result<DeoptId, RuntimeError> {
        self.registry.with(|registry| registry.add_metadata(meta))
    }

    /// Look up a published record. Never enters the compile section.
    pub fn get_deopt_metadata(&self, id: DeoptId) -> Result<Arc<DeoptMetadata>, RuntimeError> {
        self.metadata
            .read()
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .map(Arc::clone)
            .ok_or(RuntimeError::UnknownDeopt(id))
    }

    // -- deoptimization -----------------------------------------------------

    /// Materialize the frames of deopt `id` into `targets`, outermost first.
    /// Frames that are already materialized are left untouched.
    pub fn materialize_frame(
        &self,
        heap: &mut Heap,
        id: DeoptId,
        snapshot: &MachineSnapshot,
        targets: &mut [InterpreterFrame],
    ) -> Result<(), RuntimeError> {
        let meta = self.get_deopt_metadata(id)?;
        let fresh = materialize_frames(heap, &meta, snapshot, targets);
        if self.config.deopt.collect_stats {
            self.stats.lock().frames_materialized += fresh as u64;
        }
        Ok(())
    }

    /// Take deopt `id`: rebuild its frames, push them onto `chain` and
    /// release the native frame's owned references. Returns the new frames,
    /// outermost first.
    pub fn deoptimize(
        &self,
        heap: &mut Heap,
        id: DeoptId,
        snapshot: &MachineSnapshot,
        chain: &mut CallChain,
    ) -> Result<Vec<FrameId>, RuntimeError> {
        self.deoptimize_into_chain(heap, id, snapshot, chain, None)
    }

    /// Like [`Runtime::deoptimize`], for a running compiled generator. The
    /// generator stays in the interpreter afterwards, so its footer is freed.
    pub fn deoptimize_running_generator(
        &self,
        heap: &mut Heap,
        gen: ObjRef,
        id: DeoptId,
        snapshot: &MachineSnapshot,
        chain: &mut CallChain,
    ) -> Result<Vec<FrameId>, RuntimeError> {
        if let Some(footer) = self.generators.lock().remove(&gen) {
            debug_assert!(footer.spill.is_empty(), "running generator {gen} has a saved spill area");
        }
        set_generator_status(heap, gen, GenStatus::Running);
        self.deoptimize_into_chain(heap, id, snapshot, chain, Some(gen))
    }

    fn deoptimize_into_chain(
        &self,
        heap: &mut Heap,
        id: DeoptId,
        snapshot: &MachineSnapshot,
        chain: &mut CallChain,
        gen: Option<ObjRef>,
    ) -> Result<Vec<FrameId>, RuntimeError> {
        let meta = self.get_deopt_metadata(id)?;
        let mut frames: Vec<InterpreterFrame> = meta
            .frames
            .iter()
            .map(|frame| InterpreterFrame::new(Arc::clone(&frame.code)))
            .collect();
        if let Some(outermost) = frames.first_mut() {
            outermost.gen = gen;
        }
        let fresh = materialize_frames(heap, &meta, snapshot, &mut frames);
        release_native_references(heap, &meta, snapshot);
        self.record_deopt(&meta, id, fresh);

        // A generator propagating an exception may sit on the chain without
        // being linked; the rebuilt frames return to the nearest linked one.
        let mut back = chain.nearest_linked();
        let ids = frames
            .into_iter()
            .map(|frame| {
                let frame_id = chain.push_with_back(frame, true, back);
                back = Some(frame_id);
                frame_id
            })
            .collect();
        Ok(ids)
    }

    fn record_deopt(&self, meta: &DeoptMetadata, id: DeoptId, frames: usize) {
        if self.config.deopt.collect_stats {
            let mut stats = self.stats.lock();
            stats.record(meta.reason);
            stats.frames_materialized += frames as u64;
        }
        if self.config.deopt.log_deopts {
            let frame = meta.innermost_frame();
            tracing::info!(
                %id,
                reason = %meta.reason,
                unit = %frame.code.qualname,
                offset = %frame.cause_offset,
                guilty = ?meta.guilty().map(|value| value.reg),
                descr = meta.descr.as_deref().unwrap_or(""),
                "deoptimized"
            );
        }
    }

    pub fn stats(&self) -> DeoptStats {
        self.stats.lock().clone()
    }

    // -- generators ---------------------------------------------------------

    /// Record that compiled generator `gen` suspended at `yield_point`,
    /// taking over the owned references in `spill`. Creates the footer on
    /// first suspension.
    ///
    /// # Panics
    /// Panics if the generator is already suspended.
    pub fn suspend_generator(
        &self,
        heap: &mut Heap,
        gen: ObjRef,
        unit: UnitId,
        yield_point: DeoptId,
        spill: Vec<u64>,
    ) -> Result<(), RuntimeError> {
        if self.code_runtime(unit).is_none() {
            return Err(RuntimeError::UnknownUnit(unit));
        }
        let meta = self.get_deopt_metadata(yield_point)?;
        debug_assert_eq!(meta.reason, DeoptReason::GeneratorYield);

        let mut generators = self.generators.lock();
        match generators.get_mut(&gen) {
            Some(footer) => {
                assert!(!footer.is_suspended(), "generator {gen} is already suspended");
                footer.unit = unit;
                footer.yield_point = yield_point;
                footer.meta = meta;
                footer.spill = spill;
                footer.status = GenStatus::Suspended;
            }
            None => {
                tracing::debug!(%gen, %unit, "created generator footer");
                generators.insert(
                    gen,
                    GeneratorFooter {
                        unit,
                        gen,
                        yield_point,
                        meta,
                        spill,
                        status: GenStatus::Suspended,
                    },
                );
            }
        }
        set_generator_status(heap, gen, GenStatus::Suspended);
        Ok(())
    }

    /// Hand a suspended generator's saved state back to native code.
    pub fn resume_generator(
        &self,
        heap: &mut Heap,
        gen: ObjRef,
    ) -> Result<GeneratorResume, RuntimeError> {
        let mut generators = self.generators.lock();
        let footer = generators
            .get_mut(&gen)
            .ok_or(RuntimeError::UnknownGenerator(gen))?;
        if !footer.is_suspended() {
            return Err(RuntimeError::GeneratorNotSuspended(gen));
        }
        footer.status = GenStatus::Running;
        let resume = GeneratorResume {
            unit: footer.unit,
            yield_point: footer.yield_point,
            spill: std::mem::take(&mut footer.spill),
        };
        drop(generators);
        set_generator_status(heap, gen, GenStatus::Running);
        Ok(resume)
    }

    /// Rebuild the interpreter frame of a suspended compiled generator from
    /// its footer, so the interpreter can resume it after the yield. The
    /// footer is freed.
    pub fn deopt_suspended_generator(
        &self,
        heap: &mut Heap,
        gen: ObjRef,
    ) -> Result<InterpreterFrame, RuntimeError> {
        let footer = match self.generators.lock().entry(gen) {
            Entry::Vacant(_) => return Err(RuntimeError::UnknownGenerator(gen)),
            Entry::Occupied(entry) if !entry.get().is_suspended() => {
                return Err(RuntimeError::GeneratorNotSuspended(gen))
            }
            Entry::Occupied(entry) => entry.remove(),
        };
        let meta = &footer.meta;
        assert_eq!(
            meta.frames.len(),
            1,
            "yield site {} of generator {gen} spans inlined frames",
            footer.yield_point
        );

        let snapshot = MachineSnapshot::from_spill(footer.spill);
        let mut frames = vec![InterpreterFrame::new(Arc::clone(&meta.outermost_frame().code))];
        let fresh = materialize_frames(heap, meta, &snapshot, &mut frames);
        release_native_references(heap, meta, &snapshot);

        let mut frame = frames.swap_remove(0);
        frame.gen = Some(gen);
        frame.status = FrameStatus::Suspended;
        if self.config.deopt.collect_stats {
            self.stats.lock().suspended_generators += 1;
        }
        self.record_deopt(meta, footer.yield_point, fresh);
        Ok(frame)
    }

    /// Free the footer of a generator that is being destroyed, releasing
    /// the references saved in its spill area. Returns whether a footer
    /// existed.
    pub fn release_generator(&self, heap: &mut Heap, gen: ObjRef) -> bool {
        let Some(footer) = self.generators.lock().remove(&gen) else {
            return false;
        };
        if footer.is_suspended() {
            let snapshot = MachineSnapshot::from_spill(footer.spill);
            release_native_references(heap, &footer.meta, &snapshot);
        }
        tracing::debug!(%gen, "released generator footer");
        true
    }

    pub fn generator_footer(&self, gen: ObjRef) -> Option<GeneratorFooter> {
        self.generators.lock().get(&gen).cloned()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(JitConfig::default())
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("generators", &self.generators.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_codegen::{DeoptFrameMetadata, LiveValue, Location, PhysReg, ValueSource};
    use lumen_core::code::{BcOffset, CodeId};
    use lumen_hir::{BlockStack, Environment, RefKind, ValueKind};

    fn record(location: Option<Location>) -> DeoptMetadata {
        let mut env = Environment::new();
        DeoptMetadata {
            live_values: vec![LiveValue {
                reg: env.allocate_register(),
                location,
                ref_kind: RefKind::Borrowed,
                value_kind: ValueKind::Object,
                source: ValueSource::Unknown,
                expands_to_two_slots: false,
            }],
            frames: vec![DeoptFrameMetadata {
                code: Arc::new(CodeUnit::new(CodeId(1), "f").with_locals(&["a"])),
                localsplus: vec![0],
                stack: Vec::new(),
                block_stack: BlockStack::new(),
                cause_offset: BcOffset::new(0),
            }],
            reason: DeoptReason::GuardFailure,
            guilty_value: None,
            descr: None,
            nonce: 3,
        }
    }

    #[test]
    fn metadata_ids_are_sequential() {
        let rt = Runtime::default();
        let a = rt.add_deopt_metadata(record(Some(Location::Reg(PhysReg(0))))).unwrap();
        let b = rt.add_deopt_metadata(record(Some(Location::Stack(0)))).unwrap();
        assert_eq!((a, b), (DeoptId(0), DeoptId(1)));
        assert_eq!(rt.get_deopt_metadata(b).unwrap().nonce, 3);
        assert!(matches!(
            rt.get_deopt_metadata(DeoptId(9)),
            Err(RuntimeError::UnknownDeopt(DeoptId(9)))
        ));
    }

    #[test]
    fn unlocated_metadata_is_rejected() {
        let rt = Runtime::default();
        assert!(matches!(
            rt.add_deopt_metadata(record(None)),
            Err(RuntimeError::UnlocatedMetadata { nonce: 3 })
        ));
    }

    #[test]
    fn stats_serialize_by_reason() {
        let mut stats = DeoptStats::default();
        stats.record(DeoptReason::GuardFailure);
        stats.record(DeoptReason::GuardFailure);
        assert_eq!(stats.count(DeoptReason::GuardFailure), 2);
        assert_eq!(stats.count(DeoptReason::Raise), 0);
        let json = stats.to_json().unwrap();
        assert!(json.contains("\"GuardFailure\":2"));
    }

    #[test]
    fn discard_unknown_unit_fails() {
        let rt = Runtime::default();
        assert!(matches!(
            rt.discard(UnitId(4)),
            Err(RuntimeError::UnknownUnit(UnitId(4)))
        ));
    }
}
