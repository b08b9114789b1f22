//! Per-unit compilation and the parallel compile driver.

use std::sync::Arc;

use serde::Deserialize;

use lumen_core::code::CodeUnit;
use lumen_core::sync::CompileSection;
use lumen_hir::{validate_function, Function, InstrRef};

use crate::deopt::{DeoptMetadata, DeoptNonce, MetadataBuilder};
use crate::error::CodegenError;
use crate::layout::{assign_locations, FrameLayout};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Code generation settings, read from `[jit.compile]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CodegenSettings {
    /// Machine registers available for live values.
    pub register_budget: usize,
    /// Run the IR validation pass before generating metadata.
    pub validate_ir: bool,
    /// Worker threads used by [`compile_parallel`].
    pub workers: usize,
    /// Bytes per spill slot.
    pub stack_slot_size: usize,
}

impl Default for CodegenSettings {
    fn default() -> Self {
        Self {
            register_budget: 6,
            validate_ir: true,
            workers: num_cpus::get(),
            stack_slot_size: 8,
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled units
// ---------------------------------------------------------------------------

/// Output of compiling one function, ready to be installed in a runtime.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub name: String,
    pub code: Arc<CodeUnit>,
    /// One record per deopt site, in reverse post-order.
    pub deopt_metadata: Vec<DeoptMetadata>,
    /// The instruction each record was built from.
    pub deopt_sites: Vec<InstrRef>,
    pub layout: FrameLayout,
}

impl CompiledUnit {
    pub fn frame_size(&self) -> usize {
        self.layout.frame_size
    }

    /// Index of the metadata built for the instruction at `site`.
    pub fn metadata_index(&self, site: InstrRef) -> Option<usize> {
        self.deopt_sites.iter().position(|&s| s == site)
    }
}

/// Compile one function: validate it, build metadata for every reachable
/// deopt site and assign machine locations.
pub fn compile_function(
    func: &Function,
    settings: &CodegenSettings,
    nonce: &DeoptNonce,
) -> Result<CompiledUnit, CodegenError> {
    if settings.validate_ir {
        validate_function(func)?;
    }

    let sites = func.deopt_instrs();
    let builder = MetadataBuilder::new(func, nonce);
    let mut deopt_metadata = Vec::new();
    deopt_metadata.try_reserve_exact(sites.len())?;
    for &site in &sites {
        deopt_metadata.push(builder.build(func.instr(site))?);
    }

    let layout = assign_locations(
        &mut deopt_metadata,
        settings,
        func.code.is_generator_like(),
    )?;

    tracing::info!(
        unit = %func.name,
        instrs = func.num_instrs(),
        deopt_sites = deopt_metadata.len(),
        frame_size = layout.frame_size,
        "compiled unit"
    );
    Ok(CompiledUnit {
        name: func.name.clone(),
        code: Arc::clone(&func.code),
        deopt_metadata,
        deopt_sites: sites,
        layout,
    })
}

/// Compile `funcs` on up to `settings.workers` threads.
///
/// A threaded compile episode is active on `section` for the duration, so
/// `publish` (which runs on the worker that compiled the unit, inside the
/// section) is serialized. Results are returned in input order.
pub fn compile_parallel<T, R>(
    funcs: Vec<Function>,
    settings: &CodegenSettings,
    nonce: &DeoptNonce,
    section: &CompileSection<T>,
    publish: impl Fn(&mut T, CompiledUnit) -> R + Sync,
) -> Vec<Result<R, CodegenError>>
where
    T: Send,
    R: Send,
{
    let total = funcs.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = settings.workers.clamp(1, total);

    let (job_tx, job_rx) = crossbeam_channel::unbounded::<(usize, Function)>();
    let (done_tx, done_rx) = crossbeam_channel::unbounded();
    for job in funcs.into_iter().enumerate() {
        // The receiver is alive until the scope below ends.
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    let episode = section.begin_threaded();
    tracing::debug!(units = total, workers, "starting parallel compile");
    std::thread::scope(|scope| {
        for _ in 0..workers {
            let job_rx = job_rx.clone();
            let done_tx = done_tx.clone();
            let publish = &publish;
            scope.spawn(move || {
                for (index, func) in job_rx.iter() {
                    let result = compile_function(&func, settings, nonce)
                        .map(|unit| section.with(|shared| publish(shared, unit)));
                    if let Err(err) = &result {
                        tracing::warn!(unit = %func.name, error = %err, "compilation failed");
                    }
                    let _ = done_tx.send((index, result));
                }
            });
        }
    });
    drop(done_tx);
    drop(episode);

    let mut results: Vec<Option<Result<R, CodegenError>>> = (0..total).map(|_| None).collect();
    for (index, result) in done_rx.iter() {
        results[index] = Some(result);
    }
    results
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| panic!("compile worker dropped a unit")))
        .collect()
}
