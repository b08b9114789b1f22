//! Deoptimization metadata.
//!
//! For every deopt-capable instruction the code generator records a
//! [`DeoptMetadata`]: the values that must be read back from machine state
//! ([`LiveValue`]s), and for each frame of the inlining chain how those
//! values populate the interpreter's locals, operand stack and handler
//! stack. Frames are ordered outermost first; the last frame is the one the
//! deoptimizing instruction belongs to.
//!
//! Machine locations are left empty here and filled in by
//! [`assign_locations`](crate::layout::assign_locations).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strum::{Display, EnumIter, IntoStaticStr};

use lumen_core::code::{BcOffset, CodeUnit};
use lumen_hir::{
    BlockStack, FrameState, Function, Instr, IrError, Opcode, RefKind, RegId, ValueKind,
};

use crate::error::CodegenError;

/// Live-value index recorded for a slot with no value.
pub const DEAD_SLOT: i32 = -1;

// ---------------------------------------------------------------------------
// Locations and live values
// ---------------------------------------------------------------------------

/// A machine register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysReg(pub u8);

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Where a live value sits when the deopt is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Reg(PhysReg),
    /// Byte offset into the native frame's spill area.
    Stack(i32),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Reg(reg) => write!(f, "{reg}"),
            Location::Stack(offset) => write!(f, "[spill+{offset}]"),
        }
    }
}

/// Where a live value came from, when that affects reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ValueSource {
    Unknown,
    /// Result of a method lookup; stands for two interpreter stack slots.
    LoadMethod,
}

/// A value that must be recovered from machine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveValue {
    pub reg: RegId,
    pub location: Option<Location>,
    pub ref_kind: RefKind,
    pub value_kind: ValueKind,
    pub source: ValueSource,
    /// The value occupies two interpreter stack slots (callable and
    /// receiver). See [`StackEntry::MethodPair`].
    pub expands_to_two_slots: bool,
}

impl fmt::Display for LiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.reg, self.ref_kind, self.value_kind)?;
        if let Some(location) = self.location {
            write!(f, "@{location}")?;
        }
        if self.source != ValueSource::Unknown {
            write!(f, " ({})", self.source)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One operand-stack entry of a reconstructed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackEntry {
    /// A single slot holding live value `index`, or [`DEAD_SLOT`].
    Value(i32),
    /// A method lookup result occupying two slots. If the callable is a
    /// plain function the slots are `[callable, receiver]`; otherwise the
    /// lookup already bound the receiver and the slots are
    /// `[<empty>, callable]`. A dead lookup result has both indices set to
    /// [`DEAD_SLOT`] and leaves two empty slots.
    MethodPair { callable: i32, receiver: i32 },
}

impl StackEntry {
    /// Interpreter stack slots covered by this entry.
    pub fn num_slots(self) -> usize {
        match self {
            StackEntry::Value(_) => 1,
            StackEntry::MethodPair { .. } => 2,
        }
    }
}

/// Reconstruction recipe for one interpreter frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DeoptFrameMetadata {
    pub code: Arc<CodeUnit>,
    /// Live-value index per local, cell and free variable slot.
    pub localsplus: Vec<i32>,
    /// Operand stack, bottom first.
    pub stack: Vec<StackEntry>,
    pub block_stack: BlockStack,
    /// Offset of the instruction that caused the deopt, or of the call
    /// site for caller frames.
    pub cause_offset: BcOffset,
}

impl DeoptFrameMetadata {
    /// Interpreter stack depth after reconstruction.
    pub fn stack_depth(&self) -> usize {
        self.stack.iter().map(|entry| entry.num_slots()).sum()
    }
}

// ---------------------------------------------------------------------------
// Reasons
// ---------------------------------------------------------------------------

/// Why a deopt was taken. Drives where the interpreter resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, EnumIter)]
pub enum DeoptReason {
    GuardFailure,
    YieldFrom,
    GeneratorYield,
    Raise,
    RaiseStatic,
    Reraise,
    UnhandledException,
    UnhandledUnboundLocal,
    UnhandledUnboundFreevar,
    UnhandledNullField,
    /// Requested by the runtime, e.g. after patching a patchpoint.
    Forced,
}

impl DeoptReason {
    pub fn from_opcode(opcode: Opcode) -> DeoptReason {
        match opcode {
            Opcode::CheckVar => DeoptReason::UnhandledUnboundLocal,
            Opcode::CheckFreevar => DeoptReason::UnhandledUnboundFreevar,
            Opcode::CheckField => DeoptReason::UnhandledNullField,
            Opcode::Guard | Opcode::GuardType | Opcode::GuardIs | Opcode::Deopt => {
                DeoptReason::GuardFailure
            }
            Opcode::DeoptPatchpoint => DeoptReason::Forced,
            Opcode::Raise => DeoptReason::Raise,
            Opcode::YieldFrom => DeoptReason::YieldFrom,
            Opcode::InitialYield | Opcode::YieldValue => DeoptReason::GeneratorYield,
            _ => DeoptReason::UnhandledException,
        }
    }

    /// Whether the deopt propagates an exception into the interpreter.
    pub fn is_exception(self) -> bool {
        matches!(
            self,
            DeoptReason::Raise
                | DeoptReason::RaiseStatic
                | DeoptReason::Reraise
                | DeoptReason::UnhandledException
                | DeoptReason::UnhandledUnboundLocal
                | DeoptReason::UnhandledUnboundFreevar
                | DeoptReason::UnhandledNullField
        )
    }

    /// Offset the interpreter resumes at in a frame whose causing
    /// instruction is at `cause`.
    ///
    /// In the innermost frame a failed guard or a propagating exception
    /// re-executes the causing instruction; caller frames already performed
    /// their call, so they continue after it. Forced deopts and `yield from`
    /// re-execute at every depth. Generator yields always continue after
    /// the yield.
    pub fn resume_offset(self, innermost: bool, cause: BcOffset) -> BcOffset {
        match self {
            DeoptReason::Forced | DeoptReason::YieldFrom => cause,
            DeoptReason::GeneratorYield => cause.next(),
            reason => {
                debug_assert!(reason == DeoptReason::GuardFailure || reason.is_exception());
                if innermost {
                    cause
                } else {
                    cause.next()
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// DeoptMetadata
// ---------------------------------------------------------------------------

/// Everything needed to rebuild the interpreter frames at one deopt site.
#[derive(Debug, Clone, PartialEq)]
pub struct DeoptMetadata {
    pub live_values: Vec<LiveValue>,
    /// Outermost first.
    pub frames: Vec<DeoptFrameMetadata>,
    pub reason: DeoptReason,
    /// Live-value index of the value blamed for the deopt.
    pub guilty_value: Option<usize>,
    pub descr: Option<String>,
    pub nonce: u64,
}

impl DeoptMetadata {
    pub fn innermost_frame(&self) -> &DeoptFrameMetadata {
        self.frames
            .last()
            .unwrap_or_else(|| panic!("deopt metadata {} has no frames", self.nonce))
    }

    pub fn outermost_frame(&self) -> &DeoptFrameMetadata {
        self.frames
            .first()
            .unwrap_or_else(|| panic!("deopt metadata {} has no frames", self.nonce))
    }

    pub fn inline_depth(&self) -> usize {
        self.frames.len().saturating_sub(1)
    }

    /// The live value at `index`, or `None` for [`DEAD_SLOT`].
    ///
    /// # Panics
    /// Panics if `index` is neither dead nor a valid live-value index.
    pub fn live_value(&self, index: i32) -> Option<&LiveValue> {
        if index == DEAD_SLOT {
            return None;
        }
        let value = usize::try_from(index)
            .ok()
            .and_then(|i| self.live_values.get(i));
        match value {
            Some(value) => Some(value),
            None => panic!(
                "live value index {index} out of range ({} live values) in deopt metadata {}",
                self.live_values.len(),
                self.nonce
            ),
        }
    }

    pub fn guilty(&self) -> Option<&LiveValue> {
        self.guilty_value.and_then(|i| self.live_values.get(i))
    }

    /// Whether every live value has a machine location.
    pub fn is_fully_located(&self) -> bool {
        self.live_values.iter().all(|v| v.location.is_some())
    }
}

/// Source of monotonically increasing metadata nonces, shared by every
/// compiling thread.
#[derive(Debug, Default)]
pub struct DeoptNonce(AtomicU64);

impl DeoptNonce {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// The nonce the next call to [`DeoptNonce::next`] would hand out.
    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Builds metadata for the deopt sites of one function.
pub struct MetadataBuilder<'f> {
    func: &'f Function,
    defs: HashMap<RegId, &'f Instr>,
    nonce: &'f DeoptNonce,
}

impl<'f> MetadataBuilder<'f> {
    pub fn new(func: &'f Function, nonce: &'f DeoptNonce) -> Self {
        Self {
            func,
            defs: func.definitions(),
            nonce,
        }
    }

    /// Build the metadata for `instr`.
    ///
    /// # Panics
    /// Panics if a method lookup result on the operand stack is live but its
    /// receiver is not.
    pub fn build(&self, instr: &Instr) -> Result<DeoptMetadata, CodegenError> {
        let opcode = instr.opcode();
        let Some(fs) = instr.frame_state() else {
            return Err(IrError::MissingFrameState {
                block: instr
                    .block()
                    .unwrap_or_else(|| self.func.cfg.entry()),
                opcode,
            }
            .into());
        };

        let live_regs = instr.live_regs();
        let mut live_values: Vec<LiveValue> = Vec::new();
        live_values.try_reserve_exact(live_regs.len() + 1)?;
        let mut index_of: HashMap<RegId, usize> = HashMap::new();
        index_of.try_reserve(live_regs.len() + 1)?;
        for state in live_regs {
            index_of.entry(state.reg).or_insert_with(|| {
                live_values.push(LiveValue {
                    reg: state.reg,
                    location: None,
                    ref_kind: state.ref_kind,
                    value_kind: state.value_kind,
                    source: ValueSource::Unknown,
                    expands_to_two_slots: false,
                });
                live_values.len() - 1
            });
        }

        // The guilty value must be recoverable for the error report. If the
        // register is not otherwise live it is captured as a borrowed value
        // so deopt does not release it. It stays out of `index_of`: frame
        // slots holding it remain dead.
        let guilty_value = instr.guilty_reg().map(|reg| match index_of.get(&reg) {
            Some(&index) => index,
            None => {
                let state = self.func.reg_state(reg, RefKind::Borrowed);
                live_values.push(LiveValue {
                    reg,
                    location: None,
                    ref_kind: state.ref_kind,
                    value_kind: state.value_kind,
                    source: ValueSource::Unknown,
                    expands_to_two_slots: false,
                });
                live_values.len() - 1
            }
        });

        let chain = fs.frames();
        let mut frames = Vec::new();
        frames.try_reserve_exact(chain.len())?;
        for frame in chain {
            frames.push(self.build_frame(frame, &index_of, &mut live_values)?);
        }

        let reason = DeoptReason::from_opcode(opcode);
        let descr = instr
            .descr()
            .map(str::to_string)
            .or_else(|| Some(opcode.name().to_string()));
        let meta = DeoptMetadata {
            live_values,
            frames,
            reason,
            guilty_value,
            descr,
            nonce: self.nonce.next(),
        };
        tracing::debug!(
            unit = %self.func.name,
            nonce = meta.nonce,
            %reason,
            live = meta.live_values.len(),
            depth = meta.inline_depth(),
            "built deopt metadata"
        );
        Ok(meta)
    }

    fn build_frame(
        &self,
        fs: &FrameState,
        index_of: &HashMap<RegId, usize>,
        live_values: &mut [LiveValue],
    ) -> Result<DeoptFrameMetadata, CodegenError> {
        let index = |reg: Option<RegId>| -> i32 {
            reg.and_then(|r| index_of.get(&r))
                .map_or(DEAD_SLOT, |&i| live_index(i))
        };

        let mut localsplus = Vec::new();
        localsplus.try_reserve_exact(fs.locals.len() + fs.cells.len())?;
        localsplus.extend(fs.localsplus().map(index));

        let mut stack = Vec::new();
        stack.try_reserve_exact(fs.stack.len())?;
        for &reg in fs.stack.iter() {
            let callable = index(Some(reg));
            let method_receiver = match self.defs.get(&reg) {
                Some(def) if def.opcode() == Opcode::LoadMethod => Some(def.operand(0)),
                _ => None,
            };
            match method_receiver {
                // A dead lookup result still occupies two interpreter slots.
                Some(_) if callable == DEAD_SLOT => stack.push(StackEntry::MethodPair {
                    callable: DEAD_SLOT,
                    receiver: DEAD_SLOT,
                }),
                Some(receiver_reg) => {
                    let receiver = index(Some(receiver_reg));
                    assert!(
                        receiver != DEAD_SLOT,
                        "receiver {receiver_reg} of method lookup {reg} is not live at {}@{}",
                        fs.code.qualname,
                        fs.cur_instr_offs
                    );
                    let value = &mut live_values[callable as usize];
                    value.source = ValueSource::LoadMethod;
                    value.expands_to_two_slots = true;
                    stack.push(StackEntry::MethodPair { callable, receiver });
                }
                None => stack.push(StackEntry::Value(callable)),
            }
        }

        Ok(DeoptFrameMetadata {
            code: Arc::clone(&fs.code),
            localsplus,
            stack,
            block_stack: fs.block_stack.clone(),
            cause_offset: fs.cur_instr_offs,
        })
    }
}

fn live_index(i: usize) -> i32 {
    i32::try_from(i).unwrap_or_else(|_| panic!("live value index {i} does not fit in i32"))
}

/// Build metadata for a single instruction of `func`.
pub fn build_deopt_metadata(
    func: &Function,
    instr: &Instr,
    nonce: &DeoptNonce,
) -> Result<DeoptMetadata, CodegenError> {
    MetadataBuilder::new(func, nonce).build(instr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_hir::{ExecutionBlock, HandlerKind, InstrKind, RegState};
    use lumen_core::code::CodeId;
    use strum::IntoEnumIterator;

    fn code(name: &str, locals: &[&str], stack: usize) -> Arc<CodeUnit> {
        Arc::new(
            CodeUnit::new(CodeId(3), name)
                .with_locals(locals)
                .with_stack_size(stack)
                .with_code_len(64),
        )
    }

    #[test]
    fn resume_policy_table() {
        let cause = BcOffset::new(10);
        assert_eq!(DeoptReason::GuardFailure.resume_offset(true, cause), cause);
        assert_eq!(DeoptReason::GuardFailure.resume_offset(false, cause), cause.next());
        assert_eq!(DeoptReason::UnhandledException.resume_offset(true, cause), cause);
        assert_eq!(DeoptReason::Raise.resume_offset(false, cause), cause.next());
        assert_eq!(DeoptReason::Forced.resume_offset(false, cause), cause);
        assert_eq!(DeoptReason::YieldFrom.resume_offset(true, cause), cause);
        assert_eq!(DeoptReason::GeneratorYield.resume_offset(true, cause), cause.next());
    }

    #[test]
    fn every_reason_has_a_policy() {
        for reason in DeoptReason::iter() {
            let cause = BcOffset::new(4);
            let resumed = reason.resume_offset(true, cause);
            assert!(resumed == cause || resumed == cause.next(), "{reason}");
        }
    }

    #[test]
    fn reason_follows_opcode() {
        assert_eq!(DeoptReason::from_opcode(Opcode::CheckVar), DeoptReason::UnhandledUnboundLocal);
        assert_eq!(DeoptReason::from_opcode(Opcode::CheckField), DeoptReason::UnhandledNullField);
        assert_eq!(DeoptReason::from_opcode(Opcode::GuardIs), DeoptReason::GuardFailure);
        assert_eq!(DeoptReason::from_opcode(Opcode::DeoptPatchpoint), DeoptReason::Forced);
        assert_eq!(DeoptReason::from_opcode(Opcode::YieldValue), DeoptReason::GeneratorYield);
        assert_eq!(DeoptReason::from_opcode(Opcode::LoadAttr), DeoptReason::UnhandledException);
    }

    #[test]
    fn frame_slots_translate_to_live_indices() {
        let code = code("f", &["a", "b", "c"], 3);
        let mut func = Function::new(Arc::clone(&code));
        let entry = func.cfg.entry();
        let a = func.emit(entry, InstrKind::LoadArg { index: 0 }, &[]).unwrap();
        let b = func.emit(entry, InstrKind::LoadArg { index: 1 }, &[]).unwrap();
        let mut fs = FrameState::new(code).at(BcOffset::new(8));
        fs.locals = vec![Some(a), None, Some(b)];
        fs.stack.push(b);
        fs.block_stack
            .push(ExecutionBlock::new(HandlerKind::SetupFinally, BcOffset::new(30), 0));
        func.emit_with_state(entry, InstrKind::LoadAttr { name: "x".into() }, &[a], fs);
        let at = func.last_instr(entry);
        func.instr_mut(at).add_live_reg(RegState::borrowed(b));
        func.instr_mut(at).add_live_reg(RegState::owned(a));

        let nonce = DeoptNonce::new();
        let meta = build_deopt_metadata(&func, func.instr(at), &nonce).unwrap();
        assert_eq!(meta.live_values.len(), 2);
        let frame = meta.innermost_frame();
        assert_eq!(frame.localsplus, vec![1, DEAD_SLOT, 0]);
        assert_eq!(frame.stack, vec![StackEntry::Value(0)]);
        assert_eq!(frame.block_stack.len(), 1);
        assert_eq!(frame.cause_offset, BcOffset::new(8));
        assert_eq!(meta.live_value(1).unwrap().ref_kind, RefKind::Owned);
        assert_eq!(meta.reason, DeoptReason::UnhandledException);
        assert_eq!(meta.descr.as_deref(), Some("LoadAttr"));
        assert!(!meta.is_fully_located());
    }

    #[test]
    fn guilty_register_is_captured_even_if_not_live() {
        let code = code("f", &["a"], 1);
        let mut func = Function::new(Arc::clone(&code));
        let entry = func.cfg.entry();
        let obj = func.emit(entry, InstrKind::LoadArg { index: 0 }, &[]).unwrap();
        let field = func
            .emit(
                entry,
                InstrKind::LoadField {
                    index: 0,
                    name: "f".into(),
                },
                &[obj],
            )
            .unwrap();
        func.emit_with_state(
            entry,
            InstrKind::CheckField { name: "f".into() },
            &[field],
            FrameState::new(code),
        );
        let at = func.last_instr(entry);
        let nonce = DeoptNonce::new();
        let meta = build_deopt_metadata(&func, func.instr(at), &nonce).unwrap();
        assert_eq!(meta.reason, DeoptReason::UnhandledNullField);
        let guilty = meta.guilty().unwrap();
        assert_eq!(guilty.reg, field);
        assert_eq!(guilty.ref_kind, RefKind::Borrowed);
    }

    #[test]
    fn method_lookup_becomes_a_pair() {
        let code = code("f", &["o"], 2);
        let mut func = Function::new(Arc::clone(&code));
        let entry = func.cfg.entry();
        let recv = func.emit(entry, InstrKind::LoadArg { index: 0 }, &[]).unwrap();
        let mut fs = FrameState::new(Arc::clone(&code)).at(BcOffset::new(2));
        fs.locals[0] = Some(recv);
        let meth = func
            .emit_with_state(entry, InstrKind::LoadMethod { name: "m".into() }, &[recv], fs)
            .unwrap();

        let mut fs = FrameState::new(code).at(BcOffset::new(4));
        fs.locals[0] = Some(recv);
        fs.stack.push(meth);
        func.emit_with_state(entry, InstrKind::RunPeriodicTasks, &[], fs);
        let at = func.last_instr(entry);
        func.instr_mut(at).add_live_reg(RegState::borrowed(recv));
        func.instr_mut(at).add_live_reg(RegState::owned(meth));

        let nonce = DeoptNonce::new();
        let meta = build_deopt_metadata(&func, func.instr(at), &nonce).unwrap();
        let frame = meta.innermost_frame();
        assert_eq!(
            frame.stack,
            vec![StackEntry::MethodPair {
                callable: 1,
                receiver: 0
            }]
        );
        assert_eq!(frame.stack_depth(), 2);
        let callable = meta.live_value(1).unwrap();
        assert!(callable.expands_to_two_slots);
        assert_eq!(callable.source, ValueSource::LoadMethod);
        assert!(!meta.live_value(0).unwrap().expands_to_two_slots);
    }

    #[test]
    #[should_panic(expected = "is not live")]
    fn method_pair_requires_live_receiver() {
        let code = code("f", &["o"], 2);
        let mut func = Function::new(Arc::clone(&code));
        let entry = func.cfg.entry();
        let recv = func.emit(entry, InstrKind::LoadArg { index: 0 }, &[]).unwrap();
        let meth = func
            .emit_with_state(
                entry,
                InstrKind::LoadMethod { name: "m".into() },
                &[recv],
                FrameState::new(Arc::clone(&code)),
            )
            .unwrap();
        let mut fs = FrameState::new(code);
        fs.stack.push(meth);
        func.emit_with_state(entry, InstrKind::RunPeriodicTasks, &[], fs);
        let at = func.last_instr(entry);
        func.instr_mut(at).add_live_reg(RegState::owned(meth));
        let nonce = DeoptNonce::new();
        let _ = build_deopt_metadata(&func, func.instr(at), &nonce);
    }

    #[test]
    fn dead_method_lookup_keeps_two_empty_slots() {
        let code = code("f", &["o"], 3);
        let mut func = Function::new(Arc::clone(&code));
        let entry = func.cfg.entry();
        let recv = func.emit(entry, InstrKind::LoadArg { index: 0 }, &[]).unwrap();
        let meth = func
            .emit_with_state(
                entry,
                InstrKind::LoadMethod { name: "m".into() },
                &[recv],
                FrameState::new(Arc::clone(&code)),
            )
            .unwrap();
        let mut fs = FrameState::new(code).at(BcOffset::new(6));
        fs.stack.push(meth);
        fs.stack.push(recv);
        func.emit_with_state(entry, InstrKind::RunPeriodicTasks, &[], fs);
        let at = func.last_instr(entry);
        func.instr_mut(at).add_live_reg(RegState::borrowed(recv));

        let nonce = DeoptNonce::new();
        let meta = build_deopt_metadata(&func, func.instr(at), &nonce).unwrap();
        let frame = meta.innermost_frame();
        assert_eq!(
            frame.stack,
            vec![
                StackEntry::MethodPair {
                    callable: DEAD_SLOT,
                    receiver: DEAD_SLOT
                },
                StackEntry::Value(0),
            ]
        );
        assert_eq!(frame.stack_depth(), 3);
        assert_eq!(meta.live_values.len(), 1);
    }

    #[test]
    fn guilty_register_does_not_revive_frame_slots() {
        let code = code("f", &["a"], 1);
        let mut func = Function::new(Arc::clone(&code));
        let entry = func.cfg.entry();
        let obj = func.emit(entry, InstrKind::LoadArg { index: 0 }, &[]).unwrap();
        let field = func
            .emit(
                entry,
                InstrKind::LoadField {
                    index: 0,
                    name: "f".into(),
                },
                &[obj],
            )
            .unwrap();
        let mut fs = FrameState::new(code);
        fs.locals[0] = Some(field);
        func.emit_with_state(entry, InstrKind::CheckField { name: "f".into() }, &[field], fs);
        let at = func.last_instr(entry);

        let nonce = DeoptNonce::new();
        let meta = build_deopt_metadata(&func, func.instr(at), &nonce).unwrap();
        assert_eq!(meta.guilty().unwrap().reg, field);
        assert_eq!(meta.innermost_frame().localsplus, vec![DEAD_SLOT]);
    }

    #[test]
    fn nonces_increase() {
        let nonce = DeoptNonce::new();
        let a = nonce.next();
        let b = nonce.next();
        assert!(b > a);
        assert_eq!(nonce.peek(), b + 1);
    }

    #[test]
    fn missing_frame_state_is_a_validation_error() {
        let mut func = Function::new(code("f", &[], 1));
        let entry = func.cfg.entry();
        let a = func.emit(entry, InstrKind::LoadArg { index: 0 }, &[]).unwrap();
        func.emit(entry, InstrKind::Guard, &[a]);
        let at = func.last_instr(entry);
        let nonce = DeoptNonce::new();
        let err = build_deopt_metadata(&func, func.instr(at), &nonce).unwrap_err();
        assert!(matches!(err, CodegenError::Validation(IrError::MissingFrameState { .. })));
    }
}
