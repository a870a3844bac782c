//! Resource dependence tracking. Recent register reads and writes are kept
//! in an age-indexed queue per resource class; operand selection consults
//! the queue to bias source and target indices toward recently used
//! resources, steered by the configured choice values.

use std::collections::VecDeque;

use log::trace;

use crate::config::{
    Config, DEP_CHOICE_INTER, DEP_CHOICE_INTRA, DEP_DIRECTION_NEAREST, DEP_ON_READ,
    DEP_PRIORITY_SOURCE,
};
use crate::constraint::ConstraintSet;
use crate::register::reserver::AccessType;
use crate::rng::Rng;

/// Resource classes tracked for dependence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceType {
    GprRes = 0,
    FprRes = 1,
    VecRegRes = 2,
}

const RESOURCE_TYPE_COUNT: usize = 3;

/// Accesses of one committed instruction, per resource class.
#[derive(Clone, Debug, Default)]
pub struct ResourceAccessStage {
    reads: [ConstraintSet; RESOURCE_TYPE_COUNT],
    writes: [ConstraintSet; RESOURCE_TYPE_COUNT],
}

impl ResourceAccessStage {
    fn record(&mut self, res_type: ResourceType, index: u64, access: AccessType) {
        if matches!(access, AccessType::Read | AccessType::ReadWrite) {
            self.reads[res_type as usize].add_value(index);
        }
        if matches!(access, AccessType::Write | AccessType::ReadWrite) {
            self.writes[res_type as usize].add_value(index);
        }
    }

    /// Indices the stage accessed with the given kind.
    pub fn accesses(&self, res_type: ResourceType, on_reads: bool) -> &ConstraintSet {
        if on_reads {
            &self.reads[res_type as usize]
        } else {
            &self.writes[res_type as usize]
        }
    }

    fn is_empty(&self) -> bool {
        self.reads.iter().all(ConstraintSet::is_empty)
            && self.writes.iter().all(ConstraintSet::is_empty)
    }
}

/// Weighted choice bundle resolved once from the configuration.
#[derive(Clone, Debug)]
struct DependenceChoices {
    dependency: Vec<(u64, u32)>,
    source: Vec<(u64, u32)>,
    target: Vec<(u64, u32)>,
    priority: Vec<(u64, u32)>,
    direction: Vec<(u64, u32)>,
    window: u64,
}

fn flatten(config: &Config, name: &str) -> Vec<(u64, u32)> {
    config.choices(name).iter().map(|c| (c.value, c.weight)).collect()
}

fn pick(rng: &mut Rng, choices: &[(u64, u32)], default: u64) -> u64 {
    let weights: Vec<u32> = choices.iter().map(|(_, w)| *w).collect();
    match rng.pick_weighted(&weights) {
        Some(index) => choices[index].0,
        None => default,
    }
}

/// The dependence tracker; owns the access history and the choosers.
#[derive(Clone, Debug)]
pub struct ResourceDependence {
    history: VecDeque<ResourceAccessStage>,
    depth: usize,
    current: ResourceAccessStage,
    choices: DependenceChoices,
}

impl ResourceDependence {
    pub fn new(config: &Config) -> Self {
        Self {
            history: VecDeque::new(),
            depth: config.limits.dependence_history_depth as usize,
            current: ResourceAccessStage::default(),
            choices: DependenceChoices {
                dependency: flatten(config, "Register Dependency"),
                source: flatten(config, "Source Dependency"),
                target: flatten(config, "Target Dependency"),
                priority: flatten(config, "Dependency Priority"),
                direction: flatten(config, "Optimal Direction"),
                window: config.variable_or("Dependency Window", 8),
            },
        }
    }

    /// Records one operand access of the instruction being generated.
    pub fn record_access(&mut self, res_type: ResourceType, index: u64, access: AccessType) {
        self.current.record(res_type, index, access);
    }

    /// Retires the instruction being generated into the history queue.
    pub fn commit_instruction(&mut self) {
        let stage = std::mem::take(&mut self.current);
        if stage.is_empty() {
            return;
        }
        self.history.push_back(stage);
        while self.history.len() > self.depth {
            self.history.pop_front();
        }
    }

    /// Whether source or target operands get the dependence bias this time.
    pub fn choose_priority_is_source(&self, rng: &mut Rng) -> bool {
        pick(rng, &self.choices.priority, DEP_PRIORITY_SOURCE) == DEP_PRIORITY_SOURCE
    }

    /// Resolves a dependence constraint for one operand: a set of resource
    /// indices the operand should be drawn from, or `None` when the chooser
    /// elected no dependence (or nothing usable is in the window).
    pub fn get_dependence_constraint(
        &self,
        rng: &mut Rng,
        access: AccessType,
        res_type: ResourceType,
    ) -> Option<ConstraintSet> {
        let dependency = pick(rng, &self.choices.dependency, 0);
        if dependency == DEP_CHOICE_INTRA {
            return self.intra_dependence(rng, access, res_type);
        }
        if dependency == DEP_CHOICE_INTER {
            return self.inter_dependence(rng, access, res_type);
        }
        None
    }

    /// Dependence on the instruction currently being assembled.
    fn intra_dependence(
        &self,
        rng: &mut Rng,
        access: AccessType,
        res_type: ResourceType,
    ) -> Option<ConstraintSet> {
        let on_reads = self.access_bias(rng, access);
        let indices = self.current.accesses(res_type, on_reads);
        if indices.is_empty() {
            None
        } else {
            Some(indices.clone())
        }
    }

    /// Dependence on a prior instruction inside the lookback window. The
    /// direction choice steers toward the most recent or the oldest
    /// qualifying stage.
    fn inter_dependence(
        &self,
        rng: &mut Rng,
        access: AccessType,
        res_type: ResourceType,
    ) -> Option<ConstraintSet> {
        if self.history.is_empty() {
            return None;
        }
        let on_reads = self.access_bias(rng, access);
        let window = (self.choices.window as usize).min(self.history.len()).max(1);
        let nearest = pick(rng, &self.choices.direction, DEP_DIRECTION_NEAREST)
            == DEP_DIRECTION_NEAREST;

        let stages: Vec<&ResourceAccessStage> = self.history.iter().rev().take(window).collect();
        let ordered: Box<dyn Iterator<Item = &&ResourceAccessStage>> = if nearest {
            Box::new(stages.iter())
        } else {
            Box::new(stages.iter().rev())
        };
        for stage in ordered {
            let indices = stage.accesses(res_type, on_reads);
            if !indices.is_empty() {
                trace!(
                    "dependence hit {:?} on_reads={} indices={}",
                    res_type,
                    on_reads,
                    indices.to_simple_string()
                );
                return Some(indices.clone());
            }
        }
        None
    }

    /// Whether the bias looks at prior reads or prior writes.
    fn access_bias(&self, rng: &mut Rng, access: AccessType) -> bool {
        let choices = match access {
            AccessType::Read => &self.choices.source,
            _ => &self.choices.target,
        };
        pick(rng, choices, DEP_ON_READ) == DEP_ON_READ
    }

    /// Copies the tracker so a speculative context can restore it after
    /// rollback.
    pub fn snapshot(&self) -> ResourceDependence {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Choice;

    fn biased_config() -> Config {
        let mut config = Config::default();
        // Force inter-dependence on writes, nearest first.
        config.set_choices("Register Dependency", vec![Choice::new(DEP_CHOICE_INTER, 1)]);
        config.set_choices(
            "Source Dependency",
            vec![Choice::new(crate::config::DEP_ON_WRITE, 1)],
        );
        config.set_choices("Optimal Direction", vec![Choice::new(DEP_DIRECTION_NEAREST, 1)]);
        config
    }

    #[test]
    fn inter_dependence_prefers_recent_writes() {
        let config = biased_config();
        let mut dependence = ResourceDependence::new(&config);
        let mut rng = Rng::new(11);

        dependence.record_access(ResourceType::GprRes, 4, AccessType::Write);
        dependence.commit_instruction();
        dependence.record_access(ResourceType::GprRes, 9, AccessType::Write);
        dependence.commit_instruction();

        let constraint = dependence
            .get_dependence_constraint(&mut rng, AccessType::Read, ResourceType::GprRes)
            .unwrap();
        assert!(constraint.contains_value(9));
        assert!(!constraint.contains_value(4));
    }

    #[test]
    fn empty_history_yields_no_constraint() {
        let config = biased_config();
        let dependence = ResourceDependence::new(&config);
        let mut rng = Rng::new(2);
        assert!(dependence
            .get_dependence_constraint(&mut rng, AccessType::Read, ResourceType::GprRes)
            .is_none());
    }

    #[test]
    fn snapshot_restores_pre_speculative_state() {
        let config = biased_config();
        let mut dependence = ResourceDependence::new(&config);
        dependence.record_access(ResourceType::GprRes, 4, AccessType::Write);
        dependence.commit_instruction();
        let snapshot = dependence.snapshot();

        dependence.record_access(ResourceType::GprRes, 20, AccessType::Write);
        dependence.commit_instruction();
        dependence = snapshot;

        let mut rng = Rng::new(11);
        let constraint = dependence
            .get_dependence_constraint(&mut rng, AccessType::Read, ResourceType::GprRes)
            .unwrap();
        assert!(constraint.contains_value(4));
        assert!(!constraint.contains_value(20));
    }

    #[test]
    fn history_depth_is_bounded() {
        let mut config = biased_config();
        config.limits.dependence_history_depth = 2;
        let mut dependence = ResourceDependence::new(&config);
        for index in 0..5 {
            dependence.record_access(ResourceType::GprRes, index, AccessType::Write);
            dependence.commit_instruction();
        }
        assert!(dependence.history.len() <= 2);
    }
}
