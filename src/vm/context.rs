//! Translation context modelling. A [`VmContext`] is the ordered tuple of
//! architectural control register field values that defines a translation
//! regime's mapping; two contexts are equal exactly when every enumerated
//! field is equal.

use std::collections::BTreeMap;

/// The ordered field tuple of one translation context.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmContext {
    fields: BTreeMap<String, u64>,
}

impl VmContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one context field, e.g. `satp.MODE` or `privilege`.
    pub fn set_field(&mut self, name: &str, value: u64) -> &mut Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    /// Builder form of [`VmContext::set_field`].
    pub fn with_field(mut self, name: &str, value: u64) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    /// Value of one context field.
    pub fn field(&self, name: &str) -> Option<u64> {
        self.fields.get(name).copied()
    }

    /// Fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, u64)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), *value))
    }

    /// Fields on which this context differs from the current machine state,
    /// as reported by the caller's lookup.
    pub fn delta<F>(&self, mut current: F) -> Vec<(String, u64)>
    where
        F: FnMut(&str) -> Option<u64>,
    {
        self.fields
            .iter()
            .filter(|(name, value)| current(name) != Some(**value))
            .map(|(name, value)| (name.clone(), *value))
            .collect()
    }

    /// Whether the two contexts agree on every field that affects the
    /// placement of translation tables; address spaces with matching roots
    /// may share one page table tree.
    pub fn compatible_root(&self, other: &VmContext) -> bool {
        const ROOT_FIELDS: [&str; 2] = ["satp.MODE", "satp.PPN"];
        ROOT_FIELDS.iter().all(|name| self.field(name) == other.field(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_field_wise() {
        let a = VmContext::new()
            .with_field("satp.MODE", 8)
            .with_field("satp.ASID", 3)
            .with_field("satp.PPN", 0x80000);
        let b = VmContext::new()
            .with_field("satp.ASID", 3)
            .with_field("satp.MODE", 8)
            .with_field("satp.PPN", 0x80000);
        assert_eq!(a, b);
        let c = b.clone().with_field("satp.ASID", 4);
        assert_ne!(a, c);
        // Same root, different ASID: the tree may be shared.
        assert!(a.compatible_root(&c));
    }

    #[test]
    fn delta_reports_divergent_fields() {
        let target = VmContext::new().with_field("satp.MODE", 8).with_field("satp.ASID", 7);
        let delta = target.delta(|name| match name {
            "satp.MODE" => Some(8),
            "satp.ASID" => Some(1),
            _ => None,
        });
        assert_eq!(delta, vec![("satp.ASID".to_string(), 7)]);
    }
}
