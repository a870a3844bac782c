//! Setup-time configuration. Options, limits and named choice values are
//! consumed during generator construction only; nothing here changes while a
//! test is being generated.

use std::collections::HashMap;

/// A weighted choice, the flattened form of one choice-tree leaf.
#[derive(Clone, Debug)]
pub struct Choice {
    /// Value the choice resolves to.
    pub value: u64,
    /// Relative weight; zero disables the choice.
    pub weight: u32,
}

impl Choice {
    pub fn new(value: u64, weight: u32) -> Self {
        Self { value, weight }
    }
}

/// Hard limits guarding recursive generation features.
#[derive(Clone, Debug)]
pub struct Limits {
    /// Maximum nesting of branch-not-taken path generation.
    pub branch_not_taken_limit: u32,
    /// Maximum nesting of speculative BNT path generation.
    pub speculative_bnt_level_limit: u32,
    /// Maximum instructions speculated along one BNT path.
    pub speculative_bnt_instruction_limit: u32,
    /// Maximum instructions executed during one re-execution request.
    pub max_re_execution_instructions: u32,
    /// Maximum instructions committed in total before the test ends.
    pub max_instructions: u64,
    /// Depth of the per-class resource access history.
    pub dependence_history_depth: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            branch_not_taken_limit: 3,
            speculative_bnt_level_limit: 2,
            speculative_bnt_instruction_limit: 20,
            max_re_execution_instructions: 100,
            max_instructions: 10_000,
            dependence_history_depth: 16,
        }
    }
}

/// Configuration for one generator instance.
#[derive(Clone, Debug)]
pub struct Config {
    /// Seed for the deterministic RNG.
    pub seed: u64,
    /// PC the simulator resets to.
    pub reset_pc: u64,
    /// PC the generated boot code jumps to.
    pub boot_pc: u64,
    /// Base address of the exception handler table.
    pub exception_handler_base: u64,
    /// Whether an exception arriving while one is being handled is legal.
    pub allow_exception_in_exception: bool,
    /// Whether boot code generation is skipped.
    pub skip_boot_code: bool,
    /// Hard limits.
    pub limits: Limits,
    /// Named choice sets, flattened from the choices files.
    choices: HashMap<String, Vec<Choice>>,
    /// Named scalar variables (e.g. dependence window bounds).
    variables: HashMap<String, u64>,
}

impl Default for Config {
    fn default() -> Self {
        let mut config = Self {
            seed: 0x5eed,
            reset_pc: 0x8000_0000,
            boot_pc: 0x8000_1000,
            exception_handler_base: 0x8000_8000,
            allow_exception_in_exception: false,
            skip_boot_code: false,
            limits: Limits::default(),
            choices: HashMap::new(),
            variables: HashMap::new(),
        };

        // Baseline choice values a choices file would normally provide.
        config.set_choices(
            "Register Dependency",
            vec![
                Choice::new(DEP_CHOICE_NONE, 50),
                Choice::new(DEP_CHOICE_INTER, 25),
                Choice::new(DEP_CHOICE_INTRA, 25),
            ],
        );
        config.set_choices(
            "Source Dependency",
            vec![Choice::new(DEP_ON_READ, 50), Choice::new(DEP_ON_WRITE, 50)],
        );
        config.set_choices(
            "Target Dependency",
            vec![Choice::new(DEP_ON_READ, 50), Choice::new(DEP_ON_WRITE, 50)],
        );
        config.set_choices(
            "Dependency Priority",
            vec![Choice::new(DEP_PRIORITY_SOURCE, 50), Choice::new(DEP_PRIORITY_TARGET, 50)],
        );
        config.set_choices(
            "Optimal Direction",
            vec![Choice::new(DEP_DIRECTION_NEAREST, 50), Choice::new(DEP_DIRECTION_FARTHEST, 50)],
        );
        config.set_variable("Dependency Window", 8);
        config
    }
}

impl Config {
    /// Installs or replaces a named choice set.
    pub fn set_choices(&mut self, name: &str, choices: Vec<Choice>) {
        self.choices.insert(name.to_string(), choices);
    }

    /// Returns a named choice set, empty slice when absent.
    pub fn choices(&self, name: &str) -> &[Choice] {
        self.choices.get(name).map(|c| c.as_slice()).unwrap_or(&[])
    }

    /// Installs or replaces a named scalar variable.
    pub fn set_variable(&mut self, name: &str, value: u64) {
        self.variables.insert(name.to_string(), value);
    }

    /// Returns a named scalar variable, or the provided default.
    pub fn variable_or(&self, name: &str, default: u64) -> u64 {
        self.variables.get(name).copied().unwrap_or(default)
    }
}

/// Dependence choice values, matching the "Register Dependency" choice set.
pub const DEP_CHOICE_NONE: u64 = 0;
pub const DEP_CHOICE_INTER: u64 = 1;
pub const DEP_CHOICE_INTRA: u64 = 2;

/// Source/target dependence access bias values.
pub const DEP_ON_READ: u64 = 0;
pub const DEP_ON_WRITE: u64 = 1;

/// Dependency priority values.
pub const DEP_PRIORITY_SOURCE: u64 = 0;
pub const DEP_PRIORITY_TARGET: u64 = 1;

/// Optimal-direction steering values.
pub const DEP_DIRECTION_NEAREST: u64 = 0;
pub const DEP_DIRECTION_FARTHEST: u64 = 1;
