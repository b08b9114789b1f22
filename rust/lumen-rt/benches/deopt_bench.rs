use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lumen_codegen::{compile_function, CodegenSettings, DeoptNonce};
use lumen_core::code::{BcOffset, CodeId, CodeUnit};
use lumen_core::values::{Heap, Object};
use lumen_hir::{FrameState, Function, InstrKind, RegState};
use lumen_rt::{materialize_frames, InterpreterFrame, MachineSnapshot};

/// A function with `width` arguments, all live at one guard and all held in
/// both a local and a stack slot.
fn wide_guard(width: usize) -> Function {
    let names: Vec<String> = (0..width).map(|i| format!("v{i}")).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let code = Arc::new(
        CodeUnit::new(CodeId(1), "wide")
            .with_locals(&names)
            .with_stack_size(width)
            .with_code_len(64)
            .with_lines(&[(0, 1)]),
    );
    let mut func = Function::new(Arc::clone(&code));
    let entry = func.cfg.entry();
    let args: Vec<_> = (0..width)
        .map(|index| func.emit(entry, InstrKind::LoadArg { index }, &[]).unwrap())
        .collect();
    let mut fs = FrameState::new(code).at(BcOffset::new(8));
    for (slot, &arg) in args.iter().enumerate() {
        fs.locals[slot] = Some(arg);
        fs.stack.push(arg);
    }
    func.emit_with_state(entry, InstrKind::Guard, &[args[0]], fs);
    let at = func.last_instr(entry);
    for &arg in &args {
        func.instr_mut(at).add_live_reg(RegState::borrowed(arg));
    }
    func.emit(entry, InstrKind::Return, &[args[0]]);
    func
}

fn deopt_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("deopt");
    let settings = CodegenSettings::default();

    for width in [4usize, 16, 64] {
        let func = wide_guard(width);

        group.bench_with_input(BenchmarkId::new("build_metadata", width), &func, |b, func| {
            let nonce = DeoptNonce::new();
            b.iter(|| black_box(compile_function(black_box(func), &settings, &nonce).unwrap()));
        });

        let unit = compile_function(&func, &settings, &DeoptNonce::new()).unwrap();
        let meta = &unit.deopt_metadata[0];
        let mut heap = Heap::new();
        let mut snapshot = MachineSnapshot::default();
        for (i, value) in meta.live_values.iter().enumerate() {
            let obj = heap.alloc(Object::Int(i as i64));
            snapshot.set(value.location.unwrap(), obj.to_word());
        }

        group.bench_with_input(BenchmarkId::new("materialize", width), meta, |b, meta| {
            b.iter(|| {
                let mut frames = vec![InterpreterFrame::new(Arc::clone(&meta.frames[0].code))];
                materialize_frames(&mut heap, meta, &snapshot, &mut frames);
                black_box(&frames);
                frames[0].clear(&mut heap);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, deopt_benchmark);
criterion_main!(benches);
