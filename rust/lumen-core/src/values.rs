//! Reference-counted object heap.
//!
//! Interpreter frames, compiled code and the deoptimization runtime all refer
//! to objects through [`ObjRef`] handles. Every handle held by a frame slot,
//! container or native frame accounts for exactly one share of the object's
//! reference count; the object is freed when the count reaches zero.
//!
//! Native code sees references as raw machine words. [`ObjRef::to_word`] and
//! [`ObjRef::from_word`] define that encoding: handles are laid out like
//! 8-byte aligned addresses and the all-zero word is the null sentinel.

use std::fmt;
use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};
use strum::{Display, IntoStaticStr};

use crate::code::CodeId;

/// Raw word used by native code for "no object".
pub const NULL_WORD: u64 = 0;

/// Low bits that are always zero in an encoded reference.
const WORD_ALIGN_MASK: u64 = 0b111;
const WORD_SHIFT: u32 = 3;

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Handle to a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjRef(NonZeroU32);

impl ObjRef {
    fn from_index(index: usize) -> Self {
        let raw = u32::try_from(index + 1).expect("heap exceeded u32 handle space");
        // index + 1 is never zero.
        Self(NonZeroU32::new(raw).expect("non-zero handle"))
    }

    /// Slot index inside the heap.
    pub fn index(self) -> usize {
        self.0.get() as usize - 1
    }

    /// Encode this handle as the raw word native code stores in registers
    /// and spill slots.
    pub fn to_word(self) -> u64 {
        (self.0.get() as u64) << WORD_SHIFT
    }

    /// Decode a raw word. Returns `None` for the null sentinel.
    ///
    /// # Panics
    /// Panics if the word is not a valid encoded handle (misaligned or out of
    /// range); such a word can only come from corrupted machine state.
    pub fn from_word(word: u64) -> Option<Self> {
        if word == NULL_WORD {
            return None;
        }
        assert!(
            word & WORD_ALIGN_MASK == 0,
            "raw word {word:#x} is not an encoded object reference"
        );
        let raw = u32::try_from(word >> WORD_SHIFT)
            .unwrap_or_else(|_| panic!("raw word {word:#x} is out of handle range"));
        Some(Self(NonZeroU32::new(raw).expect("non-zero handle")))
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Identity of a user-defined class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub u32);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// Lifecycle of a generator object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum GenStatus {
    /// Created but never resumed.
    JustStarted,
    /// Currently executing (possibly without being linked into the call chain).
    Running,
    /// Suspended at a yield.
    Suspended,
    /// Returned or raised; cannot be resumed.
    Completed,
}

/// A generator object.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratorObject {
    pub code: CodeId,
    pub status: GenStatus,
}

/// A function object.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionObject {
    pub name: String,
    pub code: Option<CodeId>,
}

/// Heap object payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    /// An integer above `i64::MAX`. Smaller values are always `Int`.
    UInt(u64),
    Float(f64),
    Str(String),
    Tuple(Vec<ObjRef>),
    List(Vec<ObjRef>),
    Function(FunctionObject),
    /// A callable bound to its receiver.
    BoundMethod { func: ObjRef, receiver: ObjRef },
    /// A closure cell; `None` while unbound.
    Cell(Option<ObjRef>),
    Generator(GeneratorObject),
    /// Instance of a user class with fixed field slots.
    Instance {
        class: ClassId,
        fields: Vec<Option<ObjRef>>,
    },
}

/// Payload-free kind of an [`Object`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
pub enum ObjectKind {
    None,
    Bool,
    Int,
    Float,
    Str,
    Tuple,
    List,
    Function,
    BoundMethod,
    Cell,
    Generator,
    Instance,
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::None => ObjectKind::None,
            Object::Bool(_) => ObjectKind::Bool,
            Object::Int(_) | Object::UInt(_) => ObjectKind::Int,
            Object::Float(_) => ObjectKind::Float,
            Object::Str(_) => ObjectKind::Str,
            Object::Tuple(_) => ObjectKind::Tuple,
            Object::List(_) => ObjectKind::List,
            Object::Function(_) => ObjectKind::Function,
            Object::BoundMethod { .. } => ObjectKind::BoundMethod,
            Object::Cell(_) => ObjectKind::Cell,
            Object::Generator(_) => ObjectKind::Generator,
            Object::Instance { .. } => ObjectKind::Instance,
        }
    }

    /// References this object holds a share of.
    fn children(&self) -> Vec<ObjRef> {
        match self {
            Object::Tuple(items) | Object::List(items) => items.clone(),
            Object::BoundMethod { func, receiver } => vec![*func, *receiver],
            Object::Cell(contents) => contents.iter().copied().collect(),
            Object::Instance { fields, .. } => fields.iter().flatten().copied().collect(),
            _ => Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct HeapCell {
    object: Object,
    refcnt: u32,
    /// Immortal objects are never freed, whatever their count.
    immortal: bool,
}

/// The object heap.
///
/// The heap is owned by the interpreter thread. It is `Send` but deliberately
/// not shared: compilation threads never touch objects directly.
pub struct Heap {
    cells: Vec<Option<HeapCell>>,
    free: Vec<usize>,
    live: usize,
    none: ObjRef,
    true_obj: ObjRef,
    false_obj: ObjRef,
}

impl Heap {
    /// Create a heap pre-populated with the immortal `None`, `True` and
    /// `False` singletons.
    pub fn new() -> Self {
        let placeholder = ObjRef::from_index(0);
        let mut heap = Self {
            cells: Vec::new(),
            free: Vec::new(),
            live: 0,
            none: placeholder,
            true_obj: placeholder,
            false_obj: placeholder,
        };
        heap.none = heap.alloc_immortal(Object::None);
        heap.true_obj = heap.alloc_immortal(Object::Bool(true));
        heap.false_obj = heap.alloc_immortal(Object::Bool(false));
        heap
    }

    /// The `None` singleton. The returned handle is borrowed.
    pub fn none(&self) -> ObjRef {
        self.none
    }

    /// The `True`/`False` singleton. The returned handle is borrowed.
    pub fn bool_singleton(&self, value: bool) -> ObjRef {
        if value {
            self.true_obj
        } else {
            self.false_obj
        }
    }

    /// Allocate an object with a reference count of one, owned by the caller.
    pub fn alloc(&mut self, object: Object) -> ObjRef {
        self.alloc_cell(HeapCell {
            object,
            refcnt: 1,
            immortal: false,
        })
    }

    /// Allocate an object that is never freed.
    pub fn alloc_immortal(&mut self, object: Object) -> ObjRef {
        self.alloc_cell(HeapCell {
            object,
            refcnt: 1,
            immortal: true,
        })
    }

    fn alloc_cell(&mut self, cell: HeapCell) -> ObjRef {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            self.cells[index] = Some(cell);
            return ObjRef::from_index(index);
        }
        self.cells.push(Some(cell));
        ObjRef::from_index(self.cells.len() - 1)
    }

    /// Box a signed machine integer into a new owned `Int` object.
    pub fn box_signed(&mut self, value: i64) -> ObjRef {
        self.alloc(Object::Int(value))
    }

    /// Box an unsigned machine integer, keeping its full value.
    pub fn box_unsigned(&mut self, value: u64) -> ObjRef {
        match i64::try_from(value) {
            Ok(small) => self.alloc(Object::Int(small)),
            Err(_) => self.alloc(Object::UInt(value)),
        }
    }

    pub fn box_double(&mut self, value: f64) -> ObjRef {
        self.alloc(Object::Float(value))
    }

    /// Return a new owned reference to the `True`/`False` singleton.
    pub fn box_bool(&mut self, value: bool) -> ObjRef {
        let obj = self.bool_singleton(value);
        self.incref(obj);
        obj
    }

    fn cell(&self, obj: ObjRef) -> &HeapCell {
        self.cells
            .get(obj.index())
            .and_then(Option::as_ref)
            .unwrap_or_else(|| panic!("dangling object reference {obj}"))
    }

    fn cell_mut(&mut self, obj: ObjRef) -> &mut HeapCell {
        self.cells
            .get_mut(obj.index())
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("dangling object reference {obj}"))
    }

    /// Borrow an object.
    ///
    /// # Panics
    /// Panics if `obj` has been freed.
    pub fn get(&self, obj: ObjRef) -> &Object {
        &self.cell(obj).object
    }

    pub fn get_mut(&mut self, obj: ObjRef) -> &mut Object {
        &mut self.cell_mut(obj).object
    }

    pub fn try_get(&self, obj: ObjRef) -> Option<&Object> {
        self.cells
            .get(obj.index())
            .and_then(Option::as_ref)
            .map(|cell| &cell.object)
    }

    pub fn is_live(&self, obj: ObjRef) -> bool {
        self.try_get(obj).is_some()
    }

    /// Current share count, or `None` if the object has been freed.
    pub fn refcount(&self, obj: ObjRef) -> Option<u32> {
        self.cells
            .get(obj.index())
            .and_then(Option::as_ref)
            .map(|cell| cell.refcnt)
    }

    /// Number of objects currently allocated.
    pub fn live_objects(&self) -> usize {
        self.live
    }

    /// Take an additional share of `obj`.
    pub fn incref(&mut self, obj: ObjRef) {
        let cell = self.cell_mut(obj);
        cell.refcnt = cell
            .refcnt
            .checked_add(1)
            .unwrap_or_else(|| panic!("reference count overflow on {obj}"));
    }

    /// Release one share of `obj`, freeing it (and releasing its children)
    /// when the count reaches zero.
    pub fn decref(&mut self, obj: ObjRef) {
        let mut pending = vec![obj];
        while let Some(obj) = pending.pop() {
            let cell = self.cell_mut(obj);
            assert!(cell.refcnt > 0, "reference count underflow on {obj}");
            cell.refcnt -= 1;
            if cell.refcnt > 0 || cell.immortal {
                continue;
            }
            let freed = self.cells[obj.index()]
                .take()
                .expect("cell checked live above");
            self.free.push(obj.index());
            self.live -= 1;
            pending.extend(freed.object.children());
        }
    }

    /// Release one share of `obj` if present.
    pub fn xdecref(&mut self, obj: Option<ObjRef>) {
        if let Some(obj) = obj {
            self.decref(obj);
        }
    }

    /// Whether `obj` is a plain function (as opposed to a bound method or any
    /// other callable). Method lookups return plain functions together with
    /// their receiver.
    pub fn is_plain_function(&self, obj: ObjRef) -> bool {
        matches!(self.get(obj), Object::Function(_))
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("live", &self.live)
            .field("capacity", &self.cells.len())
            .field("free", &self.free.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_encoding_is_aligned_and_null_is_zero() {
        let mut heap = Heap::new();
        let obj = heap.alloc(Object::Int(7));
        let word = obj.to_word();
        assert_eq!(word & WORD_ALIGN_MASK, 0);
        assert_ne!(word, NULL_WORD);
        assert_eq!(ObjRef::from_word(word), Some(obj));
        assert_eq!(ObjRef::from_word(NULL_WORD), None);
    }

    #[test]
    #[should_panic(expected = "not an encoded object reference")]
    fn misaligned_word_is_rejected() {
        ObjRef::from_word(0x11);
    }

    #[test]
    fn decref_frees_at_zero_and_releases_children() {
        let mut heap = Heap::new();
        let baseline = heap.live_objects();
        let a = heap.alloc(Object::Int(1));
        let b = heap.alloc(Object::Str("b".into()));
        // The tuple takes over the allocation shares of `a` and `b`.
        let t = heap.alloc(Object::Tuple(vec![a, b]));
        assert_eq!(heap.live_objects(), baseline + 3);

        heap.incref(a);
        heap.decref(t);
        assert!(!heap.is_live(t));
        assert!(!heap.is_live(b));
        assert_eq!(heap.refcount(a), Some(1));

        heap.decref(a);
        assert_eq!(heap.live_objects(), baseline);
    }

    #[test]
    fn singletons_survive_decref() {
        let mut heap = Heap::new();
        let t = heap.box_bool(true);
        assert_eq!(t, heap.bool_singleton(true));
        assert_eq!(heap.refcount(t), Some(2));
        heap.decref(t);
        heap.decref(t);
        assert!(heap.is_live(t));
        assert_eq!(heap.refcount(t), Some(0));
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new();
        let a = heap.alloc(Object::Int(1));
        heap.decref(a);
        let b = heap.alloc(Object::Int(2));
        assert_eq!(a.index(), b.index());
        assert_eq!(heap.get(b), &Object::Int(2));
    }

    #[test]
    fn unsigned_boxing_keeps_full_range() {
        let mut heap = Heap::new();
        let big = heap.box_unsigned(u64::MAX);
        assert_eq!(heap.get(big), &Object::UInt(u64::MAX));
        assert_eq!(heap.get(big).kind(), ObjectKind::Int);
        let small = heap.box_unsigned(42);
        assert_eq!(heap.get(small), &Object::Int(42));
    }

    #[test]
    fn object_kinds() {
        assert_eq!(Object::None.kind(), ObjectKind::None);
        assert_eq!(Object::Cell(None).kind().to_string(), "Cell");
    }
}
