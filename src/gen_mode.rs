//! Generator mode state. The mode is a set of cooperative flags with two
//! layers: a push/pop stack for scoped changes and a free-standing overlay
//! for enable/disable without ordering. Enabling a flag the stack already
//! carries is a no-op for the overlay, so a later pop still unwinds the
//! stack correctly.

use bitflags::bitflags;
use log::debug;

bitflags! {
    /// Cooperative generator mode flags.
    pub struct GenModeFlags: u32 {
        /// Simulation is off; committed instructions are not stepped.
        const SIM_OFF          = 1 << 0;
        /// No ISS is attached at all.
        const NO_ISS           = 1 << 1;
        /// Re-executing previously generated code.
        const RE_EXE           = 1 << 2;
        /// Servicing an exception.
        const EXCEPTION        = 1 << 3;
        /// Instructions must not be skipped.
        const NO_SKIP          = 1 << 4;
        /// Inside a loop body.
        const IN_LOOP          = 1 << 5;
        /// Delay register/memory initialisation.
        const DELAY_INIT       = 1 << 6;
        /// Branch targets must stay local.
        const NO_JUMP          = 1 << 7;
        /// Low power state reached.
        const LOW_POWER        = 1 << 8;
        /// Recording state deltas for a restore loop.
        const RECORDING_STATE  = 1 << 9;
        /// Inside a restore-state loop.
        const RESTORE_STATE_LOOP = 1 << 10;
        /// Generating filler instructions.
        const FILLER           = 1 << 11;
        /// Generating a speculative path.
        const SPECULATIVE      = 1 << 12;
        /// Usable address space is running short.
        const ADDRESS_SHORTAGE = 1 << 13;
        /// Escape checking is disabled.
        const NO_ESCAPE        = 1 << 14;
    }
}

/// The generator mode: current flags, the mode stack and the overlay.
pub struct GenMode {
    mode: GenModeFlags,
    overlay: GenModeFlags,
    stack: Vec<GenModeFlags>,
}

impl GenMode {
    pub fn new(initial: GenModeFlags) -> Self {
        Self { mode: initial, overlay: GenModeFlags::empty(), stack: Vec::new() }
    }

    /// The current mode, overlay included.
    pub fn current_mode(&self) -> GenModeFlags {
        self.mode
    }

    pub fn check_escape(&self) -> bool {
        !self.mode.contains(GenModeFlags::NO_ESCAPE)
    }

    pub fn simulation_enabled(&self) -> bool {
        !self.mode.contains(GenModeFlags::SIM_OFF)
    }

    pub fn has_iss(&self) -> bool {
        !self.mode.contains(GenModeFlags::NO_ISS)
    }

    pub fn re_execution(&self) -> bool {
        self.mode.contains(GenModeFlags::RE_EXE)
    }

    pub fn in_exception(&self) -> bool {
        self.mode.contains(GenModeFlags::EXCEPTION)
    }

    pub fn no_skip(&self) -> bool {
        self.mode.contains(GenModeFlags::NO_SKIP)
    }

    pub fn in_loop(&self) -> bool {
        self.mode.contains(GenModeFlags::IN_LOOP)
    }

    pub fn delay_init(&self) -> bool {
        self.mode.contains(GenModeFlags::DELAY_INIT)
    }

    pub fn no_jump(&self) -> bool {
        self.mode.contains(GenModeFlags::NO_JUMP)
    }

    pub fn low_power(&self) -> bool {
        self.mode.contains(GenModeFlags::LOW_POWER)
    }

    pub fn recording_state(&self) -> bool {
        self.mode.contains(GenModeFlags::RECORDING_STATE)
    }

    pub fn restore_state_loop(&self) -> bool {
        self.mode.contains(GenModeFlags::RESTORE_STATE_LOOP)
    }

    pub fn is_filler(&self) -> bool {
        self.mode.contains(GenModeFlags::FILLER)
    }

    pub fn is_speculative(&self) -> bool {
        self.mode.contains(GenModeFlags::SPECULATIVE)
    }

    pub fn is_address_shortage(&self) -> bool {
        self.mode.contains(GenModeFlags::ADDRESS_SHORTAGE)
    }

    /// Whether the generator is in a mode that needs address protection.
    pub fn address_protection(&self) -> bool {
        self.in_loop() && !self.recording_state()
    }

    /// Pushes a scoped mode change; the flags are ORed onto the current
    /// mode and the pre-change stack value (without overlay) is saved.
    pub fn push_gen_mode(&mut self, flags: GenModeFlags) {
        self.stack.push(self.mode & !self.overlay);
        self.set_mode_value(self.mode | flags);
    }

    /// Pops a scoped mode change. The popped flags must all be present in
    /// the current mode; the mode then returns to the saved stack value plus
    /// the overlay.
    pub fn pop_gen_mode(&mut self, flags: GenModeFlags) {
        assert!(
            self.mode.contains(flags),
            "pop-gen-mode-check-failed: popping {:?} from {:?}",
            flags,
            self.mode
        );
        let previous = self.stack.pop().expect("pop-empty-mode-stack");
        self.set_mode_value(previous | self.overlay);
    }

    /// Replaces the whole mode, clearing the overlay.
    pub fn set_gen_mode(&mut self, flags: GenModeFlags) {
        self.overlay = GenModeFlags::empty();
        self.set_mode_value(flags);
    }

    /// Enables flags outside the stack discipline. Flags the mode already
    /// carries are left to their current owner so a later pop is unaffected;
    /// enabling a flag twice through the overlay is an invariant violation.
    pub fn enable_gen_mode(&mut self, flags: GenModeFlags) {
        assert!(
            !self.overlay.contains(flags),
            "mode-already-enabled: {:?} overlay {:?}",
            flags,
            self.overlay
        );
        let to_add = (self.mode ^ flags) & flags;
        self.overlay |= to_add;
        self.set_mode_value(self.mode | to_add);
    }

    /// Disables flags previously enabled through the overlay. Flags owned by
    /// the stack are left in place.
    pub fn disable_gen_mode(&mut self, flags: GenModeFlags) {
        assert!(
            self.mode.contains(flags),
            "disable-gen-mode-check-failed: disabling {:?} from {:?}",
            flags,
            self.mode
        );
        let to_remove = self.overlay & flags;
        self.overlay &= !to_remove;
        self.set_mode_value(self.mode & !to_remove);
    }

    fn set_mode_value(&mut self, flags: GenModeFlags) {
        if flags != self.mode {
            debug!("generator mode {:?} -> {:?}", self.mode, flags);
        }
        self.mode = flags;
    }
}

impl Default for GenMode {
    fn default() -> Self {
        Self::new(GenModeFlags::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_round_trips() {
        // Push Speculative|NoEscape then pop leaves the mode
        // unchanged.
        let mut mode = GenMode::new(GenModeFlags::empty());
        let change = GenModeFlags::SPECULATIVE | GenModeFlags::NO_ESCAPE;
        mode.push_gen_mode(change);
        assert!(mode.is_speculative());
        assert!(!mode.check_escape());
        mode.pop_gen_mode(change);
        assert_eq!(mode.current_mode(), GenModeFlags::empty());
    }

    #[test]
    fn pop_of_subset_restores_saved_frame() {
        // The pop check is containment only; a subset pop still unwinds the
        // whole frame back to the saved stack value.
        let mut mode = GenMode::new(GenModeFlags::empty());
        mode.push_gen_mode(GenModeFlags::SPECULATIVE | GenModeFlags::NO_ESCAPE);
        mode.pop_gen_mode(GenModeFlags::NO_ESCAPE);
        assert_eq!(mode.current_mode(), GenModeFlags::empty());
    }

    #[test]
    fn pop_of_unset_flag_is_fatal() {
        let result = std::panic::catch_unwind(|| {
            let mut mode = GenMode::new(GenModeFlags::empty());
            mode.push_gen_mode(GenModeFlags::SPECULATIVE);
            mode.pop_gen_mode(GenModeFlags::NO_ESCAPE);
        });
        assert!(result.is_err());
    }

    #[test]
    fn overlay_does_not_disturb_stack() {
        let mut mode = GenMode::new(GenModeFlags::empty());
        mode.push_gen_mode(GenModeFlags::IN_LOOP);
        // Enabling a flag the stack owns leaves the overlay empty.
        mode.enable_gen_mode(GenModeFlags::IN_LOOP | GenModeFlags::NO_JUMP);
        assert!(mode.in_loop() && mode.no_jump());
        mode.pop_gen_mode(GenModeFlags::IN_LOOP);
        // The overlay keeps NoJump alive across the pop.
        assert!(mode.no_jump());
        assert!(!mode.in_loop());
        mode.disable_gen_mode(GenModeFlags::NO_JUMP);
        assert_eq!(mode.current_mode(), GenModeFlags::empty());
    }

    #[test]
    fn disable_leaves_stack_owned_flags() {
        let mut mode = GenMode::new(GenModeFlags::empty());
        mode.push_gen_mode(GenModeFlags::SIM_OFF);
        mode.enable_gen_mode(GenModeFlags::NO_SKIP);
        // Disabling both only clears the overlay's contribution.
        mode.disable_gen_mode(GenModeFlags::SIM_OFF | GenModeFlags::NO_SKIP);
        assert!(mode.current_mode().contains(GenModeFlags::SIM_OFF));
        assert!(!mode.no_skip());
        mode.pop_gen_mode(GenModeFlags::SIM_OFF);
        assert_eq!(mode.current_mode(), GenModeFlags::empty());
    }

    #[test]
    #[should_panic(expected = "pop-empty-mode-stack")]
    fn pop_on_empty_stack_is_fatal() {
        let mut mode = GenMode::new(GenModeFlags::SIM_OFF);
        mode.pop_gen_mode(GenModeFlags::SIM_OFF);
    }
}
