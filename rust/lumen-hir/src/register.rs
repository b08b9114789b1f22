//! Virtual registers.
//!
//! Registers live in a per-function [`Environment`] and are referred to by
//! stable [`RegId`] handles. Instructions and frame states store handles
//! only, so rewriting an operand never touches the register itself.

use std::fmt;

use crate::types::Type;

/// Handle to a register in an [`Environment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegId(u32);

impl RegId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A virtual register.
#[derive(Debug, Clone, PartialEq)]
pub struct Register {
    id: RegId,
    ty: Type,
}

impl Register {
    pub fn id(&self) -> RegId {
        self.id
    }

    /// The inferred type. `Top` until type inference has run.
    pub fn ty(&self) -> Type {
        self.ty
    }

    pub fn name(&self) -> String {
        self.id.to_string()
    }
}

/// Owner of all registers of one compiled unit.
///
/// Registers are never removed; they are discarded with the environment.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    registers: Vec<Register>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_register(&mut self) -> RegId {
        let id = RegId(u32::try_from(self.registers.len()).expect("register space exhausted"));
        self.registers.push(Register { id, ty: Type::TOP });
        id
    }

    /// Look up a register.
    ///
    /// # Panics
    /// Panics if `id` does not belong to this environment.
    pub fn register(&self, id: RegId) -> &Register {
        self.registers
            .get(id.index())
            .unwrap_or_else(|| panic!("{id} is not a register of this environment"))
    }

    pub fn get(&self, id: RegId) -> Option<&Register> {
        self.registers.get(id.index())
    }

    pub fn contains(&self, id: RegId) -> bool {
        id.index() < self.registers.len()
    }

    pub fn type_of(&self, id: RegId) -> Type {
        self.register(id).ty
    }

    /// Record the inferred type of a register.
    pub fn set_type(&mut self, id: RegId, ty: Type) {
        let index = id.index();
        let reg = self
            .registers
            .get_mut(index)
            .unwrap_or_else(|| panic!("{id} is not a register of this environment"));
        reg.ty = ty;
    }

    pub fn num_registers(&self) -> usize {
        self.registers.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Register> {
        self.registers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_have_stable_ids() {
        let mut env = Environment::new();
        let a = env.allocate_register();
        let b = env.allocate_register();
        assert_ne!(a, b);
        assert_eq!(env.register(b).id(), b);
        assert_eq!(env.register(a).name(), "v0");
        assert_eq!(env.type_of(a), Type::TOP);
        assert_eq!(env.num_registers(), 2);
    }

    #[test]
    fn inferred_type_is_set_post_hoc() {
        let mut env = Environment::new();
        let r = env.allocate_register();
        env.set_type(r, Type::LONG_EXACT);
        assert_eq!(env.type_of(r), Type::LONG_EXACT);
    }
}
