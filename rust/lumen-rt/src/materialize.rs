//! Frame materialization: rebuilding interpreter frames from deopt metadata
//! and captured machine state.
//!
//! Each target frame moves from not-materialized to materialized exactly
//! once. Materializing an already-materialized frame is a no-op, so a repeated
//! request never takes a second share of any reference.
//!
//! Every reference stored into a frame slot is a new share taken here. The
//! shares the native frame held for its owned live values are released
//! separately, once per deopt, by [`release_native_references`].

use lumen_codegen::{
    DeoptFrameMetadata, DeoptMetadata, LiveValue, Location, StackEntry, DEAD_SLOT,
};
use lumen_core::values::{Heap, ObjRef};
use lumen_hir::{RefKind, ValueKind};

use crate::frame::{FrameStatus, InterpreterFrame, MachineSnapshot};

/// A live value as read from machine state.
#[derive(Debug, Clone, Copy)]
enum Decoded {
    /// The null sentinel: no value.
    Empty,
    /// A reference owned elsewhere; slots take their own share.
    Peek(ObjRef),
    /// A primitive boxed during this frame's materialization. The decoder
    /// holds the allocation share until the frame is done.
    Boxed(ObjRef),
}

impl Decoded {
    fn object(self) -> Option<ObjRef> {
        match self {
            Decoded::Empty => None,
            Decoded::Peek(obj) | Decoded::Boxed(obj) => Some(obj),
        }
    }
}

fn location_of(meta: &DeoptMetadata, value: &LiveValue) -> Location {
    value.location.unwrap_or_else(|| {
        panic!(
            "live value {} of deopt metadata {} has no machine location",
            value.reg, meta.nonce
        )
    })
}

/// Per-frame decoder reading each live value at most once.
struct FrameDecoder<'a> {
    meta: &'a DeoptMetadata,
    snapshot: &'a MachineSnapshot,
    decoded: Vec<Option<Decoded>>,
}

impl<'a> FrameDecoder<'a> {
    fn new(meta: &'a DeoptMetadata, snapshot: &'a MachineSnapshot) -> Self {
        Self {
            meta,
            snapshot,
            decoded: vec![None; meta.live_values.len()],
        }
    }

    fn decode(&mut self, heap: &mut Heap, index: i32) -> Decoded {
        let Some(value) = self.meta.live_value(index) else {
            return Decoded::Empty;
        };
        let slot = index as usize;
        if let Some(decoded) = self.decoded[slot] {
            return decoded;
        }
        let word = self.snapshot.read(location_of(self.meta, value));
        let decoded = match value.value_kind {
            ValueKind::Object => match ObjRef::from_word(word) {
                None => Decoded::Empty,
                Some(obj) => {
                    assert!(
                        heap.is_live(obj),
                        "live value {} of deopt metadata {} refers to freed object {obj}",
                        value.reg,
                        self.meta.nonce
                    );
                    Decoded::Peek(obj)
                }
            },
            ValueKind::Signed => Decoded::Boxed(heap.box_signed(word as i64)),
            ValueKind::Unsigned => Decoded::Boxed(heap.box_unsigned(word)),
            ValueKind::Double => Decoded::Boxed(heap.box_double(f64::from_bits(word))),
            ValueKind::Bool => Decoded::Boxed(heap.box_bool(word != 0)),
        };
        self.decoded[slot] = Some(decoded);
        decoded
    }

    /// Decode `index` and take a new share for a frame slot.
    fn slot(&mut self, heap: &mut Heap, index: i32) -> Option<ObjRef> {
        let obj = self.decode(heap, index).object();
        if let Some(obj) = obj {
            heap.incref(obj);
        }
        obj
    }

    /// Drop the allocation shares of boxed primitives.
    fn finish(self, heap: &mut Heap) {
        for decoded in self.decoded.into_iter().flatten() {
            if let Decoded::Boxed(obj) = decoded {
                heap.decref(obj);
            }
        }
    }
}

/// Materialize every frame of `meta` into `targets`, ordered outermost
/// first. Returns the number of frames that were not yet materialized.
///
/// # Panics
/// Panics if `targets` does not match the shape recorded in `meta`, or if
/// the machine state holds a reference to a freed object.
pub fn materialize_frames(
    heap: &mut Heap,
    meta: &DeoptMetadata,
    snapshot: &MachineSnapshot,
    targets: &mut [InterpreterFrame],
) -> usize {
    assert_eq!(
        targets.len(),
        meta.frames.len(),
        "deopt metadata {} describes {} frames but {} targets were given",
        meta.nonce,
        meta.frames.len(),
        targets.len()
    );
    let innermost = meta.frames.len().saturating_sub(1);
    let mut fresh = 0;
    for (depth, (frame_meta, target)) in meta.frames.iter().zip(targets.iter_mut()).enumerate() {
        if target.is_materialized() {
            continue;
        }
        materialize_one(heap, meta, snapshot, frame_meta, depth == innermost, target);
        fresh += 1;
    }
    fresh
}

fn materialize_one(
    heap: &mut Heap,
    meta: &DeoptMetadata,
    snapshot: &MachineSnapshot,
    frame_meta: &DeoptFrameMetadata,
    innermost: bool,
    target: &mut InterpreterFrame,
) {
    let code = &frame_meta.code;
    assert_eq!(
        target.code.id, code.id,
        "deopt metadata {} frame for {} materialized into a frame of {}",
        meta.nonce, code.id, target.code.id
    );
    assert_eq!(
        target.localsplus.len(),
        frame_meta.localsplus.len(),
        "deopt metadata {} records {} slots for {} but the frame has {}",
        meta.nonce,
        frame_meta.localsplus.len(),
        code.qualname,
        target.localsplus.len()
    );

    let mut decoder = FrameDecoder::new(meta, snapshot);

    for (slot, &index) in frame_meta.localsplus.iter().enumerate() {
        let value = decoder.slot(heap, index);
        tracing::trace!(unit = %code.qualname, slot, ?value, "materialized local");
        heap.xdecref(std::mem::replace(&mut target.localsplus[slot], value));
    }

    // Fill from the top down.
    let depth = frame_meta.stack_depth();
    let mut stack = vec![None; depth];
    let mut sp = depth;
    for entry in frame_meta.stack.iter().rev() {
        match *entry {
            StackEntry::Value(index) => {
                sp -= 1;
                stack[sp] = decoder.slot(heap, index);
            }
            StackEntry::MethodPair { callable, .. } if callable == DEAD_SLOT => {
                sp -= 2;
            }
            StackEntry::MethodPair { callable, receiver } => {
                sp -= 2;
                let Some(func) = decoder.decode(heap, callable).object() else {
                    panic!(
                        "method lookup in deopt metadata {} produced no callable",
                        meta.nonce
                    );
                };
                if heap.is_plain_function(func) {
                    stack[sp] = decoder.slot(heap, callable);
                    stack[sp + 1] = decoder.slot(heap, receiver);
                } else {
                    stack[sp] = None;
                    stack[sp + 1] = decoder.slot(heap, callable);
                }
            }
        }
    }
    debug_assert_eq!(sp, 0);
    for old in std::mem::replace(&mut target.stack, stack) {
        heap.xdecref(old);
    }

    target.block_stack = frame_meta.block_stack.as_slice().to_vec();

    target.next_instr = meta.reason.resume_offset(innermost, frame_meta.cause_offset);
    target.line = code.line_for(target.next_instr);
    if target.line.is_none() {
        tracing::warn!(
            unit = %code.qualname,
            offset = %target.next_instr,
            "no line information for resume offset"
        );
    }
    target.status = FrameStatus::Executing;

    decoder.finish(heap);
    target.mark_materialized();
    tracing::debug!(
        unit = %code.qualname,
        resume = %target.next_instr,
        stack_depth = depth,
        innermost,
        "materialized frame"
    );
}

/// Release the shares the native frame held for its owned references.
/// Called once per deopt, after materialization.
pub fn release_native_references(heap: &mut Heap, meta: &DeoptMetadata, snapshot: &MachineSnapshot) {
    for value in &meta.live_values {
        if value.ref_kind != RefKind::Owned || value.value_kind != ValueKind::Object {
            continue;
        }
        if let Some(obj) = ObjRef::from_word(snapshot.read(location_of(meta, value))) {
            heap.decref(obj);
        }
    }
}
