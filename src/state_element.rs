//! State elements: declarative descriptions of architectural state the test
//! wants established, with priorities and bit masks. Duplicate elements
//! describing the same underlying state merge as long as their masks do not
//! overlap; the transition manager orders the surviving elements and emits
//! the requests that realise them.

use log::debug;

use crate::memory::MemBank;
use crate::request::{GenRequest, GenSequenceRequest, GenStateAction, GenStateRequest, GenStateSpec};

/// What a state element describes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateElementId {
    /// A chunk of memory starting at a virtual address.
    Memory { start_address: u64, bank: MemBank },
    /// A whole register by name and index.
    Register { name: String, index: u32 },
    /// One field of a translation control register.
    VmContext { register: String, field: String },
    /// The privilege level.
    PrivilegeLevel,
    /// The PC.
    Pc,
}

impl StateElementId {
    fn name(&self) -> String {
        match self {
            StateElementId::Memory { start_address, .. } => format!("0x{:x}", start_address),
            StateElementId::Register { name, .. } => name.clone(),
            StateElementId::VmContext { register, field } => format!("{}.{}", register, field),
            StateElementId::PrivilegeLevel => "PrivilegeLevel".to_string(),
            StateElementId::Pc => "PC".to_string(),
        }
    }
}

/// A value relevant to the state of the simulation.
#[derive(Clone, Debug)]
pub struct StateElement {
    id: StateElementId,
    values: Vec<u64>,
    masks: Vec<u64>,
    priority: u32,
}

impl StateElement {
    pub fn new(id: StateElementId, values: Vec<u64>, masks: Vec<u64>, priority: u32) -> Self {
        assert_eq!(values.len(), masks.len(), "state-element-value-mask-mismatch");
        Self { id, values, masks, priority }
    }

    /// A single-chunk memory element.
    pub fn memory(start_address: u64, bank: MemBank, value: u64, mask: u64, priority: u32) -> Self {
        Self::new(StateElementId::Memory { start_address, bank }, vec![value], vec![mask], priority)
    }

    /// A whole-register element.
    pub fn register(name: &str, index: u32, value: u64, priority: u32) -> Self {
        Self::new(
            StateElementId::Register { name: name.to_string(), index },
            vec![value],
            vec![u64::MAX],
            priority,
        )
    }

    /// A VM context field element.
    pub fn vm_context(register: &str, field: &str, value: u64, priority: u32) -> Self {
        Self::new(
            StateElementId::VmContext { register: register.to_string(), field: field.to_string() },
            vec![value],
            vec![u64::MAX],
            priority,
        )
    }

    /// A PC element.
    pub fn pc(value: u64, priority: u32) -> Self {
        Self::new(StateElementId::Pc, vec![value], vec![u64::MAX], priority)
    }

    /// A privilege-level element.
    pub fn privilege_level(level: u64, priority: u32) -> Self {
        Self::new(StateElementId::PrivilegeLevel, vec![level], vec![u64::MAX], priority)
    }

    pub fn id(&self) -> &StateElementId {
        &self.id
    }

    pub fn name(&self) -> String {
        self.id.name()
    }

    pub fn values(&self) -> &[u64] {
        &self.values
    }

    pub fn masks(&self) -> &[u64] {
        &self.masks
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Whether the two elements describe the same underlying state.
    pub fn is_duplicate(&self, other: &StateElement) -> bool {
        self.id == other.id
    }

    /// Whether [`StateElement::merge`] would succeed: same underlying state,
    /// matching shapes, and no overlapping mask bits.
    pub fn can_merge(&self, other: &StateElement) -> bool {
        self.is_duplicate(other)
            && self.values.len() == other.values.len()
            && self
                .masks
                .iter()
                .zip(other.masks.iter())
                .all(|(mine, theirs)| mine & theirs == 0)
    }

    /// Merges another element's values and masks into this one. The masks
    /// must not overlap; the priority becomes the more urgent of the two.
    pub fn merge(&mut self, other: &StateElement) {
        assert!(
            self.can_merge(other),
            "state-element-merge-failure: cannot merge {} with {}",
            other.name(),
            self.name()
        );
        for index in 0..self.values.len() {
            let mine = self.values[index] & self.masks[index];
            let theirs = other.values[index] & other.masks[index];
            self.values[index] = mine | theirs;
            self.masks[index] |= other.masks[index];
        }
        if other.priority < self.priority {
            self.priority = other.priority;
        }
    }
}

/// Collects state elements, merges duplicates, and emits the ordered request
/// sequence that realises them.
#[derive(Default)]
pub struct StateTransitionManager {
    elements: Vec<StateElement>,
}

impl StateTransitionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an element, merging it into an existing duplicate when allowed.
    pub fn add_element(&mut self, element: StateElement) {
        if let Some(existing) = self.elements.iter_mut().find(|e| e.is_duplicate(&element)) {
            debug!("merging state element {}", element.name());
            existing.merge(&element);
            return;
        }
        self.elements.push(element);
    }

    pub fn elements(&self) -> &[StateElement] {
        &self.elements
    }

    /// Drains the elements in processing order (most urgent priority first,
    /// insertion order within a priority) and returns the realising
    /// requests.
    pub fn generate_transition(&mut self) -> Vec<GenRequest> {
        let mut ordered: Vec<(usize, StateElement)> =
            std::mem::take(&mut self.elements).into_iter().enumerate().collect();
        ordered.sort_by_key(|(index, element)| (element.priority(), *index));

        let mut requests = Vec::new();
        for (_, element) in ordered {
            match element.id() {
                StateElementId::Memory { start_address, bank } => {
                    // Little-endian: the low byte of each value chunk lands
                    // at the lowest address. Only fully specified bytes are
                    // written, one request per contiguous run so gaps in the
                    // mask never shift later bytes onto the wrong address.
                    let mut run_start: Option<u64> = None;
                    let mut run_bytes: Vec<u8> = Vec::new();
                    for (chunk, (value, mask)) in
                        element.values().iter().zip(element.masks()).enumerate()
                    {
                        for byte in 0..8u32 {
                            let offset = chunk as u64 * 8 + u64::from(byte);
                            if (mask >> (byte * 8)) as u8 == 0xff {
                                if run_start.is_none() {
                                    run_start = Some(offset);
                                }
                                run_bytes.push((value >> (byte * 8)) as u8);
                            } else if let Some(run) = run_start.take() {
                                requests.push(GenRequest::Sequence(
                                    GenSequenceRequest::WriteMemoryBlock {
                                        bank: *bank,
                                        pa: *start_address + run,
                                        va: *start_address + run,
                                        bytes: std::mem::take(&mut run_bytes),
                                    },
                                ));
                            }
                        }
                    }
                    if let Some(run) = run_start {
                        requests.push(GenRequest::Sequence(GenSequenceRequest::WriteMemoryBlock {
                            bank: *bank,
                            pa: *start_address + run,
                            va: *start_address + run,
                            bytes: run_bytes,
                        }));
                    }
                }
                StateElementId::Register { name, .. } => {
                    requests.push(GenRequest::Sequence(GenSequenceRequest::SetRegister {
                        name: name.clone(),
                        value: element.values()[0],
                        mask: element.masks()[0],
                    }));
                }
                StateElementId::VmContext { register, field } => {
                    requests.push(GenRequest::Sequence(GenSequenceRequest::UpdateRegisterField {
                        register: register.clone(),
                        field: field.clone(),
                        value: element.values()[0],
                    }));
                }
                StateElementId::PrivilegeLevel => {
                    requests.push(GenRequest::State(GenStateRequest {
                        action: GenStateAction::Set,
                        state: GenStateSpec::PrivilegeLevel(element.values()[0] as u32),
                    }));
                }
                StateElementId::Pc => {
                    requests.push(GenRequest::State(GenStateRequest {
                        action: GenStateAction::Set,
                        state: GenStateSpec::Pc(element.values()[0]),
                    }));
                }
            }
        }
        requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_combines_masked_values_and_min_priority() {
        // Merging partial memory values combines the masked
        // bytes and keeps the more urgent priority.
        let mut base = StateElement::memory(
            0xf5b20,
            MemBank::Default,
            0x9987_c34b_0000,
            0xffff_ffff_0000,
            1,
        );
        let other =
            StateElement::memory(0xf5b20, MemBank::Default, 0x8564, 0xffff, 2);
        assert!(base.can_merge(&other));
        base.merge(&other);
        assert_eq!(base.values()[0], 0x9987_c34b_8564);
        assert_eq!(base.masks()[0], 0xffff_ffff_ffff);
        assert_eq!(base.priority(), 1);
    }

    #[test]
    fn overlapping_masks_cannot_merge() {
        let base = StateElement::memory(0x100, MemBank::Default, 0x11, 0xff, 1);
        let overlap = StateElement::memory(0x100, MemBank::Default, 0x22, 0xff, 1);
        assert!(!base.can_merge(&overlap));
    }

    #[test]
    fn manager_orders_by_priority_then_insertion() {
        let mut manager = StateTransitionManager::new();
        manager.add_element(StateElement::register("x5", 5, 0x55, 3));
        manager.add_element(StateElement::pc(0x8000_0000, 1));
        manager.add_element(StateElement::register("x6", 6, 0x66, 3));
        let requests = manager.generate_transition();
        assert_eq!(requests.len(), 3);
        assert!(matches!(requests[0], GenRequest::State(_)));
        match &requests[1] {
            GenRequest::Sequence(GenSequenceRequest::SetRegister { name, .. }) => {
                assert_eq!(name, "x5")
            }
            _ => panic!("expected x5 first among equal priorities"),
        }
    }

    #[test]
    fn memory_emission_is_little_endian_per_masked_run() {
        let mut manager = StateTransitionManager::new();
        // Bytes 0-1 and 4-5 fully specified, a hole at bytes 2-3.
        manager.add_element(StateElement::memory(
            0x1000,
            MemBank::Default,
            0x0000_bbaa_0000_2211,
            0x0000_ffff_0000_ffff,
            1,
        ));
        let requests = manager.generate_transition();
        assert_eq!(requests.len(), 2);
        match &requests[0] {
            GenRequest::Sequence(GenSequenceRequest::WriteMemoryBlock { pa, bytes, .. }) => {
                assert_eq!(*pa, 0x1000);
                assert_eq!(bytes, &[0x11, 0x22]);
            }
            _ => panic!("expected low run first"),
        }
        match &requests[1] {
            GenRequest::Sequence(GenSequenceRequest::WriteMemoryBlock { pa, bytes, .. }) => {
                assert_eq!(*pa, 0x1004);
                assert_eq!(bytes, &[0xaa, 0xbb]);
            }
            _ => panic!("expected high run second"),
        }
    }

    #[test]
    fn duplicate_elements_merge_on_add() {
        let mut manager = StateTransitionManager::new();
        manager.add_element(StateElement::memory(0x200, MemBank::Default, 0xaa, 0xff, 5));
        manager.add_element(StateElement::memory(0x200, MemBank::Default, 0xbb00, 0xff00, 4));
        assert_eq!(manager.elements().len(), 1);
        assert_eq!(manager.elements()[0].priority(), 4);
        assert_eq!(manager.elements()[0].values()[0], 0xbbaa);
    }
}
