//! Machine location assignment for live values.
//!
//! Stands in for the register allocator: every register that is live at
//! some deopt site gets one location for the whole unit. The first
//! `register_budget` registers (in first-use order) go to machine registers
//! and the rest to spill slots. Generator-like units spill everything,
//! because their state must survive suspension in the spill area.

use std::collections::HashMap;

use lumen_hir::RegId;

use crate::compile::CodegenSettings;
use crate::deopt::{DeoptMetadata, Location, PhysReg};
use crate::error::CodegenError;

/// Size of one spill slot in the machine snapshot.
pub const WORD_SIZE: usize = 8;

/// Result of location assignment for one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameLayout {
    pub locations: HashMap<RegId, Location>,
    pub num_spill_slots: usize,
    /// Native frame size in bytes.
    pub frame_size: usize,
}

impl FrameLayout {
    pub fn location_of(&self, reg: RegId) -> Option<Location> {
        self.locations.get(&reg).copied()
    }
}

/// Assign a location to every live value of `metas` and fill them in.
pub fn assign_locations(
    metas: &mut [DeoptMetadata],
    settings: &CodegenSettings,
    spill_all: bool,
) -> Result<FrameLayout, CodegenError> {
    let slot_size = settings.stack_slot_size;
    if slot_size == 0 || slot_size % WORD_SIZE != 0 {
        return Err(CodegenError::UnsupportedLocation(format!(
            "stack slot size {slot_size} is not a positive multiple of {WORD_SIZE}"
        )));
    }
    let budget = if spill_all { 0 } else { settings.register_budget };
    if budget > usize::from(u8::MAX) + 1 {
        return Err(CodegenError::UnsupportedLocation(format!(
            "register budget {budget} exceeds the register file"
        )));
    }

    let mut layout = FrameLayout::default();
    let mut next_reg = 0usize;
    for meta in metas.iter_mut() {
        for value in meta.live_values.iter_mut() {
            let location = match layout.locations.get(&value.reg) {
                Some(&location) => location,
                None => {
                    let location = if next_reg < budget {
                        let reg = PhysReg(u8::try_from(next_reg).map_err(|_| {
                            CodegenError::UnsupportedLocation(format!("register {next_reg}"))
                        })?);
                        next_reg += 1;
                        Location::Reg(reg)
                    } else {
                        let offset = layout.num_spill_slots * slot_size;
                        let offset = i32::try_from(offset).map_err(|_| {
                            CodegenError::UnsupportedLocation(format!("spill offset {offset}"))
                        })?;
                        layout.num_spill_slots += 1;
                        Location::Stack(offset)
                    };
                    layout.locations.try_reserve(1)?;
                    layout.locations.insert(value.reg, location);
                    location
                }
            };
            value.location = Some(location);
        }
    }
    layout.frame_size = layout.num_spill_slots * slot_size;
    tracing::trace!(
        registers = next_reg,
        spill_slots = layout.num_spill_slots,
        frame_size = layout.frame_size,
        "assigned live value locations"
    );
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deopt::{DeoptFrameMetadata, DeoptReason, LiveValue, ValueSource};
    use lumen_hir::{Environment, RefKind, ValueKind};

    fn meta(regs: &[RegId]) -> DeoptMetadata {
        DeoptMetadata {
            live_values: regs
                .iter()
                .map(|&reg| LiveValue {
                    reg,
                    location: None,
                    ref_kind: RefKind::Owned,
                    value_kind: ValueKind::Object,
                    source: ValueSource::Unknown,
                    expands_to_two_slots: false,
                })
                .collect(),
            frames: Vec::<DeoptFrameMetadata>::new(),
            reason: DeoptReason::GuardFailure,
            guilty_value: None,
            descr: None,
            nonce: 0,
        }
    }

    #[test]
    fn registers_then_spill_slots() {
        let mut env = Environment::new();
        let regs: Vec<RegId> = (0..4).map(|_| env.allocate_register()).collect();
        let mut metas = vec![meta(&regs[..3]), meta(&[regs[3], regs[0]])];
        let settings = CodegenSettings {
            register_budget: 2,
            ..CodegenSettings::default()
        };
        let layout = assign_locations(&mut metas, &settings, false).unwrap();
        assert_eq!(layout.location_of(regs[0]), Some(Location::Reg(PhysReg(0))));
        assert_eq!(layout.location_of(regs[1]), Some(Location::Reg(PhysReg(1))));
        assert_eq!(layout.location_of(regs[2]), Some(Location::Stack(0)));
        assert_eq!(layout.location_of(regs[3]), Some(Location::Stack(8)));
        assert_eq!(layout.frame_size, 16);
        // The same register has the same location at every site.
        assert_eq!(metas[1].live_values[1].location, Some(Location::Reg(PhysReg(0))));
        assert!(metas.iter().all(DeoptMetadata::is_fully_located));
    }

    #[test]
    fn generators_spill_everything() {
        let mut env = Environment::new();
        let regs: Vec<RegId> = (0..2).map(|_| env.allocate_register()).collect();
        let mut metas = vec![meta(&regs)];
        let layout = assign_locations(&mut metas, &CodegenSettings::default(), true).unwrap();
        assert_eq!(layout.location_of(regs[0]), Some(Location::Stack(0)));
        assert_eq!(layout.location_of(regs[1]), Some(Location::Stack(8)));
        assert_eq!(layout.num_spill_slots, 2);
    }

    #[test]
    fn odd_slot_size_is_rejected() {
        let settings = CodegenSettings {
            stack_slot_size: 12,
            ..CodegenSettings::default()
        };
        assert!(matches!(
            assign_locations(&mut [], &settings, false),
            Err(CodegenError::UnsupportedLocation(_))
        ));
    }
}
