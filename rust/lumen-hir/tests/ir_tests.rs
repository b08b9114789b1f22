//! Integration tests for the IR data model: instruction arity and operand
//! access, cloning, and the validation pass.

use std::sync::Arc;

use lumen_core::code::{BcOffset, CodeId, CodeUnit};
use lumen_hir::*;

fn code(name: &str, locals: &[&str], stack: usize) -> Arc<CodeUnit> {
    Arc::new(
        CodeUnit::new(CodeId(1), name)
            .with_locals(locals)
            .with_stack_size(stack)
            .with_code_len(64),
    )
}

// ===========================================================================
// Arity and operand access
// ===========================================================================

#[test]
fn operand_count_matches_construction() {
    let mut env = Environment::new();
    let regs: Vec<RegId> = (0..5).map(|_| env.allocate_register()).collect();

    let call = Instr::new(InstrKind::VectorCall { nargs: 4 }, &regs, Some(regs[0]));
    assert_eq!(call.num_operands(), 5);
    for (i, reg) in regs.iter().enumerate() {
        assert_eq!(call.operand(i), *reg);
    }

    let tuple = Instr::new(InstrKind::MakeTuple { nvalues: 0 }, &[], Some(regs[0]));
    assert_eq!(tuple.num_operands(), 0);
}

#[test]
fn set_operand_within_bounds() {
    let mut env = Environment::new();
    let a = env.allocate_register();
    let b = env.allocate_register();
    let c = env.allocate_register();
    let mut cmp = Instr::new(InstrKind::Compare { op: CompareOp::LessThan }, &[a, b], Some(c));
    cmp.set_operand(1, a);
    assert_eq!(cmp.operands(), &[a, a]);
}

#[test]
#[should_panic(expected = "out of bounds")]
fn get_operand_past_end_panics() {
    let mut env = Environment::new();
    let a = env.allocate_register();
    let ret = Instr::new(InstrKind::Return, &[a], None);
    ret.operand(1);
}

#[test]
#[should_panic(expected = "out of bounds")]
fn set_operand_past_end_panics() {
    let mut env = Environment::new();
    let a = env.allocate_register();
    let mut ret = Instr::new(InstrKind::Return, &[a], None);
    ret.set_operand(1, a);
}

#[test]
#[should_panic(expected = "takes 2 operands")]
fn wrong_arity_panics() {
    let mut env = Environment::new();
    let a = env.allocate_register();
    Instr::new(InstrKind::StoreAttr { name: "x".into() }, &[a], None);
}

#[test]
#[should_panic(expected = "single-value type")]
fn load_const_of_non_single_type_panics() {
    let mut env = Environment::new();
    let out = env.allocate_register();
    Instr::new(InstrKind::LoadConst { ty: Type::LONG }, &[], Some(out));
}

// ===========================================================================
// Cloning
// ===========================================================================

#[test]
fn clone_copies_state_and_is_unlinked() {
    let code = code("f", &["a", "b"], 2);
    let mut func = Function::new(Arc::clone(&code));
    let entry = func.cfg.entry();
    let a = func.emit(entry, InstrKind::LoadArg { index: 0 }, &[]).unwrap();
    let mut fs = FrameState::new(code).at(BcOffset::new(4));
    fs.locals[0] = Some(a);
    fs.stack.push(a);
    func.emit_with_state(entry, InstrKind::LoadAttr { name: "y".into() }, &[a], fs);
    let at = func.last_instr(entry);
    func.instr_mut(at).add_live_reg(RegState::owned(a));
    func.instr_mut(at).set_descr("attribute load");

    let original = func.instr(at);
    let copy = original.clone();
    assert_eq!(copy.operands(), original.operands());
    assert_eq!(copy.frame_state(), original.frame_state());
    assert!(!std::ptr::eq(
        copy.frame_state().unwrap(),
        original.frame_state().unwrap()
    ));
    assert_eq!(copy.live_regs(), original.live_regs());
    assert_eq!(copy.descr(), Some("attribute load"));
    assert_eq!(copy.block(), None);
    assert_eq!(copy.bc_offset(), None);
    assert_eq!(original.block(), Some(entry));
    assert_eq!(original.bc_offset(), Some(BcOffset::new(4)));
}

#[test]
fn clone_can_be_linked_elsewhere() {
    let code = code("f", &[], 1);
    let mut func = Function::new(code);
    let entry = func.cfg.entry();
    let other = func.cfg.alloc_block();
    func.emit(entry, InstrKind::Branch { target: other }, &[]);
    let copy = func.instr(func.last_instr(entry)).clone();
    func.cfg.block_mut(other).push(copy);
    assert_eq!(func.cfg.block(other).instr(0).block(), Some(other));
}

// ===========================================================================
// Validation
// ===========================================================================

fn straight_line() -> Function {
    let code = code("f", &["a"], 2);
    let mut func = Function::new(Arc::clone(&code));
    let entry = func.cfg.entry();
    let a = func.emit(entry, InstrKind::LoadArg { index: 0 }, &[]).unwrap();
    let mut fs = FrameState::new(code).at(BcOffset::new(2));
    fs.locals[0] = Some(a);
    let g = func
        .emit_with_state(entry, InstrKind::GuardType { ty: Type::LONG_EXACT }, &[a], fs)
        .unwrap();
    func.emit(entry, InstrKind::Return, &[g]);
    func
}

#[test]
fn well_formed_function_validates() {
    assert_eq!(validate_function(&straight_line()), Ok(()));
}

#[test]
fn missing_terminator_is_rejected() {
    let mut func = straight_line();
    let entry = func.cfg.entry();
    let last = func.last_instr(entry);
    func.cfg.block_mut(entry).remove(last.index);
    assert_eq!(
        validate_function(&func),
        Err(IrError::MissingTerminator { block: entry })
    );
}

#[test]
fn terminator_in_the_middle_is_rejected() {
    let mut func = straight_line();
    let entry = func.cfg.entry();
    func.cfg
        .block_mut(entry)
        .insert(0, Instr::new(InstrKind::Unreachable, &[], None));
    assert!(matches!(
        validate_function(&func),
        Err(IrError::MisplacedTerminator { index: 0, .. })
    ));
}

#[test]
fn branch_to_removed_block_is_rejected() {
    let code = code("f", &[], 1);
    let mut func = Function::new(code);
    let entry = func.cfg.entry();
    let target = func.cfg.alloc_block();
    func.emit(entry, InstrKind::Branch { target }, &[]);
    func.emit(target, InstrKind::Unreachable, &[]);
    func.cfg.remove_block(target);
    assert_eq!(
        validate_function(&func),
        Err(IrError::UnknownBlock {
            block: entry,
            target
        })
    );
}

#[test]
fn deopt_instruction_without_frame_state_is_rejected() {
    let code = code("f", &["a"], 1);
    let mut func = Function::new(code);
    let entry = func.cfg.entry();
    let a = func.emit(entry, InstrKind::LoadArg { index: 0 }, &[]).unwrap();
    func.emit(entry, InstrKind::Guard, &[a]);
    func.emit(entry, InstrKind::Return, &[a]);
    assert_eq!(
        validate_function(&func),
        Err(IrError::MissingFrameState {
            block: entry,
            opcode: Opcode::Guard
        })
    );
}

#[test]
fn frame_state_shape_is_checked() {
    let code = code("f", &["a"], 1);
    let mut func = Function::new(Arc::clone(&code));
    let entry = func.cfg.entry();
    let a = func.emit(entry, InstrKind::LoadArg { index: 0 }, &[]).unwrap();
    let mut fs = FrameState::new(code);
    fs.locals.push(None);
    func.emit_with_state(entry, InstrKind::Guard, &[a], fs);
    func.emit(entry, InstrKind::Return, &[a]);
    assert!(matches!(
        validate_function(&func),
        Err(IrError::FrameShape { .. })
    ));
}

#[test]
fn phi_arity_must_match_predecessors() {
    let code = code("f", &[], 1);
    let mut func = Function::new(code);
    let entry = func.cfg.entry();
    let join = func.cfg.alloc_block();
    let a = func
        .emit(entry, InstrKind::LoadConst { ty: Type::NONE_TYPE }, &[])
        .unwrap();
    func.emit(entry, InstrKind::Branch { target: join }, &[]);
    let phi = func
        .emit(
            join,
            InstrKind::Phi {
                blocks: vec![entry, entry],
            },
            &[a, a],
        )
        .unwrap();
    func.emit(join, InstrKind::Return, &[phi]);
    assert_eq!(
        validate_function(&func),
        Err(IrError::PhiArity {
            block: join,
            expected: 1,
            found: 2
        })
    );
}

#[test]
fn inline_depth_must_match_frame_state_chain() {
    let outer = code("outer", &["a"], 2);
    let inner = code("inner", &["x"], 1);
    let mut func = Function::new(Arc::clone(&outer));
    let entry = func.cfg.entry();
    let a = func.emit(entry, InstrKind::LoadArg { index: 0 }, &[]).unwrap();

    let caller = FrameState::new(Arc::clone(&outer)).at(BcOffset::new(6));
    func.emit_with_state(
        entry,
        InstrKind::BeginInlinedFunction { callee: inner.id },
        &[],
        caller.clone(),
    );
    let callee = FrameState::new(Arc::clone(&inner))
        .at(BcOffset::new(0))
        .with_parent(caller);
    func.emit_with_state(entry, InstrKind::Guard, &[a], callee);
    func.emit(entry, InstrKind::EndInlinedFunction, &[]);
    func.emit(entry, InstrKind::Return, &[a]);
    assert_eq!(validate_function(&func), Ok(()));

    // A guard after the inlined region must not carry a nested state.
    let mut bad = func.clone();
    let ret = bad.last_instr(entry);
    let nested = FrameState::new(Arc::clone(&inner))
        .with_parent(FrameState::new(Arc::clone(&outer)));
    let mut guard = Instr::new(InstrKind::Guard, &[a], None);
    guard.set_frame_state(nested);
    bad.cfg.block_mut(entry).insert(ret.index, guard);
    assert_eq!(
        validate_function(&bad),
        Err(IrError::InlineDepth {
            block: entry,
            expected: 0,
            found: 1
        })
    );
}

#[test]
fn paths_must_agree_on_inline_depth() {
    let outer = code("outer", &[], 1);
    let inner = code("inner", &[], 1);
    let mut func = Function::new(Arc::clone(&outer));
    let entry = func.cfg.entry();
    let left = func.cfg.alloc_block();
    let right = func.cfg.alloc_block();
    let join = func.cfg.alloc_block();
    let c = func.emit(entry, InstrKind::LoadArg { index: 0 }, &[]).unwrap();
    func.emit(
        entry,
        InstrKind::CondBranch {
            if_true: left,
            if_false: right,
        },
        &[c],
    );
    func.emit_with_state(
        left,
        InstrKind::BeginInlinedFunction { callee: inner.id },
        &[],
        FrameState::new(Arc::clone(&outer)),
    );
    func.emit(left, InstrKind::Branch { target: join }, &[]);
    func.emit(right, InstrKind::Branch { target: join }, &[]);
    func.emit(join, InstrKind::Return, &[c]);
    assert!(matches!(
        validate_function(&func),
        Err(IrError::InlineDepth { block, .. }) if block == join
    ));
}

#[test]
fn unknown_register_is_rejected() {
    let code = code("f", &[], 1);
    let mut func = Function::new(code);
    let entry = func.cfg.entry();
    let mut other = Environment::new();
    other.allocate_register();
    let stray = other.allocate_register();
    func.emit(entry, InstrKind::Return, &[stray]);
    assert!(matches!(
        validate_function(&func),
        Err(IrError::UnknownRegister { reg, .. }) if reg == stray
    ));
}
