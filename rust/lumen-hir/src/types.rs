//! The JIT type lattice.
//!
//! A [`Type`] is a set of possible runtime representations: a bit mask over
//! basic kinds (boxed object kinds and primitive machine kinds) plus an
//! optional specialisation narrowing the set further (a class, a specific
//! object, or a specific primitive value).
//!
//! `a <= b` holds when every value described by `a` is also described by
//! `b`. [`Type::BOTTOM`] is the empty set and [`Type::TOP`] contains
//! everything.

use std::fmt;
use std::ops::{BitAnd, BitOr};

use lumen_core::values::{ClassId, Heap, ObjRef, Object};

// ---------------------------------------------------------------------------
// Basic kinds
// ---------------------------------------------------------------------------

const NONE_TYPE: u64 = 1 << 0;
const BOOL: u64 = 1 << 1;
const LONG_EXACT: u64 = 1 << 2;
const LONG_USER: u64 = 1 << 3;
const FLOAT_EXACT: u64 = 1 << 4;
const FLOAT_USER: u64 = 1 << 5;
const STR_EXACT: u64 = 1 << 6;
const STR_USER: u64 = 1 << 7;
const TUPLE_EXACT: u64 = 1 << 8;
const TUPLE_USER: u64 = 1 << 9;
const LIST_EXACT: u64 = 1 << 10;
const LIST_USER: u64 = 1 << 11;
const DICT_EXACT: u64 = 1 << 12;
const DICT_USER: u64 = 1 << 13;
const FUNC: u64 = 1 << 14;
const CODE: u64 = 1 << 15;
const GEN: u64 = 1 << 16;
const CELL: u64 = 1 << 17;
const TYPE_EXACT: u64 = 1 << 18;
const TYPE_USER: u64 = 1 << 19;
const OBJECT_EXACT: u64 = 1 << 20;
const OBJECT_USER: u64 = 1 << 21;

const CBOOL: u64 = 1 << 22;
const CINT8: u64 = 1 << 23;
const CINT16: u64 = 1 << 24;
const CINT32: u64 = 1 << 25;
const CINT64: u64 = 1 << 26;
const CUINT8: u64 = 1 << 27;
const CUINT16: u64 = 1 << 28;
const CUINT32: u64 = 1 << 29;
const CUINT64: u64 = 1 << 30;
const CDOUBLE: u64 = 1 << 31;
const CPTR: u64 = 1 << 32;
const NULLPTR: u64 = 1 << 33;

const OBJECT: u64 = (1 << 22) - 1;
const CSIGNED: u64 = CINT8 | CINT16 | CINT32 | CINT64;
const CUNSIGNED: u64 = CUINT8 | CUINT16 | CUINT32 | CUINT64;
const PRIMITIVE: u64 = CBOOL | CSIGNED | CUNSIGNED | CDOUBLE | CPTR | NULLPTR;
const TOP: u64 = OBJECT | PRIMITIVE;
const USER_KINDS: u64 = LONG_USER
    | FLOAT_USER
    | STR_USER
    | TUPLE_USER
    | LIST_USER
    | DICT_USER
    | TYPE_USER
    | OBJECT_USER;

/// Basic kinds in bit order, used for printing unions.
const BASIC_NAMES: &[(&str, u64)] = &[
    ("NoneType", NONE_TYPE),
    ("Bool", BOOL),
    ("LongExact", LONG_EXACT),
    ("LongUser", LONG_USER),
    ("FloatExact", FLOAT_EXACT),
    ("FloatUser", FLOAT_USER),
    ("StrExact", STR_EXACT),
    ("StrUser", STR_USER),
    ("TupleExact", TUPLE_EXACT),
    ("TupleUser", TUPLE_USER),
    ("ListExact", LIST_EXACT),
    ("ListUser", LIST_USER),
    ("DictExact", DICT_EXACT),
    ("DictUser", DICT_USER),
    ("Func", FUNC),
    ("Code", CODE),
    ("Gen", GEN),
    ("Cell", CELL),
    ("TypeExact", TYPE_EXACT),
    ("TypeUser", TYPE_USER),
    ("ObjectExact", OBJECT_EXACT),
    ("ObjectUser", OBJECT_USER),
    ("CBool", CBOOL),
    ("CInt8", CINT8),
    ("CInt16", CINT16),
    ("CInt32", CINT32),
    ("CInt64", CINT64),
    ("CUInt8", CUINT8),
    ("CUInt16", CUINT16),
    ("CUInt32", CUINT32),
    ("CUInt64", CUINT64),
    ("CDouble", CDOUBLE),
    ("CPtr", CPTR),
    ("Nullptr", NULLPTR),
];

/// Predefined unions that print under their own name.
const UNION_NAMES: &[(&str, u64)] = &[
    ("Top", TOP),
    ("Object", OBJECT),
    ("OptObject", OBJECT | NULLPTR),
    ("Long", BOOL | LONG_EXACT | LONG_USER),
    ("Float", FLOAT_EXACT | FLOAT_USER),
    ("Str", STR_EXACT | STR_USER),
    ("Tuple", TUPLE_EXACT | TUPLE_USER),
    ("List", LIST_EXACT | LIST_USER),
    ("Dict", DICT_EXACT | DICT_USER),
    ("Type", TYPE_EXACT | TYPE_USER),
    ("Primitive", PRIMITIVE),
    ("CInt", CSIGNED | CUNSIGNED),
    ("CSigned", CSIGNED),
    ("CUnsigned", CUNSIGNED),
];

// ---------------------------------------------------------------------------
// Specialisation
// ---------------------------------------------------------------------------

/// Narrowing of a type beyond its bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Spec {
    /// No specialisation.
    None,
    /// Instances of the class or of its subclasses.
    Class(ClassId),
    /// Instances of exactly the class.
    ExactClass(ClassId),
    /// Exactly this object (compared by identity).
    Object(ObjRef),
    /// A primitive integer or boolean value.
    Int(i64),
    /// A primitive double, stored as raw bits so equality is bitwise.
    Double(u64),
}

impl Spec {
    fn le(self, other: Spec) -> bool {
        match (self, other) {
            (_, Spec::None) => true,
            (Spec::None, _) => false,
            (Spec::ExactClass(a), Spec::Class(b)) => a == b,
            (a, b) => a == b,
        }
    }

    fn join(self, other: Spec) -> Spec {
        match (self, other) {
            (a, b) if a == b => a,
            (Spec::ExactClass(a), Spec::Class(b)) | (Spec::Class(a), Spec::ExactClass(b))
                if a == b =>
            {
                Spec::Class(a)
            }
            _ => Spec::None,
        }
    }
}

// ---------------------------------------------------------------------------
// Type
// ---------------------------------------------------------------------------

/// An immutable element of the type lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Type {
    bits: u64,
    spec: Spec,
}

impl Type {
    pub const BOTTOM: Type = Type::from_bits(0);
    pub const TOP: Type = Type::from_bits(TOP);

    pub const NONE_TYPE: Type = Type::from_bits(NONE_TYPE);
    pub const BOOL: Type = Type::from_bits(BOOL);
    pub const LONG_EXACT: Type = Type::from_bits(LONG_EXACT);
    pub const LONG_USER: Type = Type::from_bits(LONG_USER);
    pub const LONG: Type = Type::from_bits(BOOL | LONG_EXACT | LONG_USER);
    pub const FLOAT_EXACT: Type = Type::from_bits(FLOAT_EXACT);
    pub const FLOAT: Type = Type::from_bits(FLOAT_EXACT | FLOAT_USER);
    pub const STR_EXACT: Type = Type::from_bits(STR_EXACT);
    pub const STR: Type = Type::from_bits(STR_EXACT | STR_USER);
    pub const TUPLE_EXACT: Type = Type::from_bits(TUPLE_EXACT);
    pub const TUPLE: Type = Type::from_bits(TUPLE_EXACT | TUPLE_USER);
    pub const LIST_EXACT: Type = Type::from_bits(LIST_EXACT);
    pub const LIST: Type = Type::from_bits(LIST_EXACT | LIST_USER);
    pub const DICT_EXACT: Type = Type::from_bits(DICT_EXACT);
    pub const DICT: Type = Type::from_bits(DICT_EXACT | DICT_USER);
    pub const FUNC: Type = Type::from_bits(FUNC);
    pub const CODE: Type = Type::from_bits(CODE);
    pub const GEN: Type = Type::from_bits(GEN);
    pub const CELL: Type = Type::from_bits(CELL);
    pub const TYPE: Type = Type::from_bits(TYPE_EXACT | TYPE_USER);
    pub const OBJECT_EXACT: Type = Type::from_bits(OBJECT_EXACT);
    pub const OBJECT_USER: Type = Type::from_bits(OBJECT_USER);
    pub const OBJECT: Type = Type::from_bits(OBJECT);
    pub const OPT_OBJECT: Type = Type::from_bits(OBJECT | NULLPTR);

    pub const CBOOL: Type = Type::from_bits(CBOOL);
    pub const CINT8: Type = Type::from_bits(CINT8);
    pub const CINT16: Type = Type::from_bits(CINT16);
    pub const CINT32: Type = Type::from_bits(CINT32);
    pub const CINT64: Type = Type::from_bits(CINT64);
    pub const CUINT8: Type = Type::from_bits(CUINT8);
    pub const CUINT16: Type = Type::from_bits(CUINT16);
    pub const CUINT32: Type = Type::from_bits(CUINT32);
    pub const CUINT64: Type = Type::from_bits(CUINT64);
    pub const CSIGNED: Type = Type::from_bits(CSIGNED);
    pub const CUNSIGNED: Type = Type::from_bits(CUNSIGNED);
    pub const CINT: Type = Type::from_bits(CSIGNED | CUNSIGNED);
    pub const CDOUBLE: Type = Type::from_bits(CDOUBLE);
    pub const CPTR: Type = Type::from_bits(CPTR);
    pub const NULLPTR: Type = Type::from_bits(NULLPTR);
    pub const PRIMITIVE: Type = Type::from_bits(PRIMITIVE);

    pub const fn from_bits(bits: u64) -> Type {
        Type {
            bits,
            spec: Spec::None,
        }
    }

    fn with_spec(bits: u64, spec: Spec) -> Type {
        if bits == 0 {
            return Type::BOTTOM;
        }
        Type { bits, spec }
    }

    /// A primitive integer of the given primitive kind with a known value.
    ///
    /// # Panics
    /// Panics if `kind` is not exactly one of the `CInt*`/`CUInt*`/`CBool`
    /// kinds.
    pub fn from_cint(kind: Type, value: i64) -> Type {
        assert!(
            kind.spec == Spec::None
                && kind.bits.count_ones() == 1
                && kind.bits & (CSIGNED | CUNSIGNED | CBOOL) != 0,
            "{kind} is not a single primitive integer kind"
        );
        Type::with_spec(kind.bits, Spec::Int(value))
    }

    pub fn from_cbool(value: bool) -> Type {
        Type::with_spec(CBOOL, Spec::Int(value as i64))
    }

    pub fn from_cdouble(value: f64) -> Type {
        Type::with_spec(CDOUBLE, Spec::Double(value.to_bits()))
    }

    /// Instances of a user class (`exact` excludes subclasses).
    pub fn from_class(class: ClassId, exact: bool) -> Type {
        let spec = if exact {
            Spec::ExactClass(class)
        } else {
            Spec::Class(class)
        };
        Type::with_spec(OBJECT_USER, spec)
    }

    /// The most specific type for a known constant object.
    pub fn from_object(heap: &Heap, obj: ObjRef) -> Type {
        let bits = match heap.get(obj) {
            // NoneType already denotes a single value.
            Object::None => return Type::NONE_TYPE,
            Object::Bool(_) => BOOL,
            Object::Int(_) | Object::UInt(_) => LONG_EXACT,
            Object::Float(_) => FLOAT_EXACT,
            Object::Str(_) => STR_EXACT,
            Object::Tuple(_) => TUPLE_EXACT,
            Object::List(_) => LIST_EXACT,
            Object::Function(_) => FUNC,
            Object::Cell(_) => CELL,
            Object::Generator(_) => GEN,
            Object::BoundMethod { .. } => OBJECT_EXACT,
            Object::Instance { .. } => OBJECT_USER,
        };
        Type::with_spec(bits, Spec::Object(obj))
    }

    pub fn bits(self) -> u64 {
        self.bits
    }

    pub fn spec(self) -> Spec {
        self.spec
    }

    /// The type with its specialisation removed.
    pub fn unspecialized(self) -> Type {
        Type::from_bits(self.bits)
    }

    pub fn is_bottom(self) -> bool {
        self.bits == 0
    }

    /// The subtype relation `self <= other`.
    pub fn is_subtype_of(self, other: Type) -> bool {
        if self.bits == 0 {
            return true;
        }
        self.bits & !other.bits == 0 && self.spec.le(other.spec)
    }

    /// Whether some value could be described by both types.
    pub fn could_be(self, other: Type) -> bool {
        !(self & other).is_bottom()
    }

    /// True iff the type denotes exactly one runtime value.
    pub fn is_single_value(self) -> bool {
        match self.spec {
            Spec::Object(_) => true,
            Spec::Int(_) | Spec::Double(_) => self.bits.count_ones() == 1,
            _ => self.bits == NONE_TYPE || self.bits == NULLPTR,
        }
    }

    /// Whether all values of this type are unboxed machine values.
    pub fn is_primitive(self) -> bool {
        self.bits != 0 && self.bits & !PRIMITIVE == 0
    }

    /// Whether all values of this type are object references.
    pub fn is_object(self) -> bool {
        self.bits != 0 && self.bits & !OBJECT == 0
    }

    /// Whether the type pins down the exact runtime class of its values.
    pub fn is_exact(self) -> bool {
        match self.spec {
            Spec::ExactClass(_) | Spec::Object(_) => true,
            Spec::Class(_) => false,
            _ => {
                self.bits.count_ones() == 1
                    && self.bits & OBJECT != 0
                    && self.bits & USER_KINDS == 0
            }
        }
    }

    pub fn int_spec(self) -> Option<i64> {
        match self.spec {
            Spec::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn double_spec(self) -> Option<f64> {
        match self.spec {
            Spec::Double(bits) => Some(f64::from_bits(bits)),
            _ => None,
        }
    }

    pub fn object_spec(self) -> Option<ObjRef> {
        match self.spec {
            Spec::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Primitive integer width in bits, if the type is a single sized
    /// integer kind.
    pub fn int_width(self) -> Option<u32> {
        match self.bits {
            CINT8 | CUINT8 => Some(8),
            CINT16 | CUINT16 => Some(16),
            CINT32 | CUINT32 => Some(32),
            CINT64 | CUINT64 => Some(64),
            _ => None,
        }
    }

    fn bits_name(bits: u64) -> String {
        if bits == 0 {
            return "Bottom".to_string();
        }
        if let Some((name, _)) = BASIC_NAMES.iter().find(|(_, b)| *b == bits) {
            return (*name).to_string();
        }
        if let Some((name, _)) = UNION_NAMES.iter().find(|(_, b)| *b == bits) {
            return (*name).to_string();
        }
        let parts: Vec<&str> = BASIC_NAMES
            .iter()
            .filter(|(_, b)| bits & b != 0)
            .map(|(name, _)| *name)
            .collect();
        format!("{{{}}}", parts.join("|"))
    }
}

impl BitOr for Type {
    type Output = Type;

    /// Join: the smallest type containing both operands.
    fn bitor(self, other: Type) -> Type {
        if self.is_bottom() {
            return other;
        }
        if other.is_bottom() {
            return self;
        }
        Type::with_spec(self.bits | other.bits, self.spec.join(other.spec))
    }
}

impl BitAnd for Type {
    type Output = Type;

    /// Meet: the largest type contained in both operands.
    fn bitand(self, other: Type) -> Type {
        let bits = self.bits & other.bits;
        let spec = if self.spec.le(other.spec) {
            self.spec
        } else if other.spec.le(self.spec) {
            other.spec
        } else {
            return Type::BOTTOM;
        };
        Type::with_spec(bits, spec)
    }
}

impl PartialOrd for Type {
    fn partial_cmp(&self, other: &Type) -> Option<std::cmp::Ordering> {
        use std::cmp::Ordering;
        match (self.is_subtype_of(*other), other.is_subtype_of(*self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&Type::bits_name(self.bits))?;
        match self.spec {
            Spec::None => Ok(()),
            Spec::Class(class) => write!(f, "[{class}]"),
            Spec::ExactClass(class) => write!(f, "[{class}:Exact]"),
            Spec::Object(obj) => write!(f, "[{obj}]"),
            Spec::Int(v) if self.bits == CBOOL => write!(f, "[{}]", v != 0),
            Spec::Int(v) => write!(f, "[{v}]"),
            Spec::Double(bits) => write!(f, "[{}]", f64::from_bits(bits)),
        }
    }
}
