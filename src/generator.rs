//! The per-hart generator: owns every subsystem, drains generation rounds,
//! commits instructions and keeps the modelled world consistent with the
//! simulator. One instance serves one logical hart; several instances may
//! share one [`MemoryManager`].

use log::{debug, info, warn};
use num_traits::FromPrimitive as _;

use crate::agent;
use crate::arch::riscv64::{self, PrivilegeLevel};
use crate::bnt::{BntHookManager, BntNodeManager, SpeculativeBntNode};
use crate::config::Config;
use crate::constraint::ConstraintSet;
use crate::data_station::DataStation;
use crate::error::Error;
use crate::gen_mode::{GenMode, GenModeFlags};
use crate::gen_pc::GenPC;
use crate::memory::{
    MemBank, MemoryAttributes, MemoryInitRecord, MemoryManager, SharedMemoryManager,
};
use crate::register::dependence::ResourceDependence;
use crate::register::reserver::{AccessType, RegReserveType, RegisterReserver};
use crate::register::{RegisterFile, RegisterType};
use crate::request::{
    GenInstructionRequest, GenQueryResult, GenRequest, GenRequestQueue, OperandKind,
};
use crate::restore::RestoreLoopManager;
use crate::results::InstructionResults;
use crate::rng::Rng;
use crate::sim::SimApi;
use crate::state_element::StateTransitionManager;
use crate::vm::{GenPageRequest, VmManager};

/// One chosen operand of a committed instruction.
#[derive(Clone, Debug)]
pub struct OperandRecord {
    pub name: String,
    pub kind: OperandKind,
    /// Register index or immediate value.
    pub value: u64,
}

/// A committed instruction.
#[derive(Clone, Debug)]
pub struct Instruction {
    pub name: String,
    /// Final encoding with operand fields filled in.
    pub opcode: u32,
    /// Size in bytes.
    pub size: u32,
    pub va: u64,
    pub pa: u64,
    pub bank: MemBank,
    pub is_branch: bool,
    pub is_conditional: bool,
    pub branch_target: Option<u64>,
    pub operands: Vec<OperandRecord>,
    /// Whether the instruction was generated on a speculative path.
    pub speculative: bool,
}

/// A pending exception frame.
#[derive(Clone, Debug)]
pub struct ExceptionContext {
    pub id: u32,
    pub description: String,
    /// PC at the time the exception was dispatched.
    pub saved_pc: u64,
}

/// The generator.
pub struct Generator {
    pub(crate) thread_id: u32,
    pub(crate) config: Config,
    pub(crate) rng: Rng,
    pub(crate) mode: GenMode,
    pub(crate) gen_pc: GenPC,
    pub(crate) queue: GenRequestQueue,
    pub(crate) registers: RegisterFile,
    pub(crate) reserver: RegisterReserver,
    pub(crate) dependence: ResourceDependence,
    pub(crate) memory: SharedMemoryManager,
    pub(crate) vm: VmManager,
    pub(crate) bnt_manager: BntNodeManager,
    pub(crate) bnt_hooks: BntHookManager,
    pub(crate) bnt_level: u32,
    pub(crate) speculative_nodes: Vec<SpeculativeBntNode>,
    pub(crate) restore_loops: RestoreLoopManager,
    pub(crate) data_station: DataStation,
    pub(crate) results: InstructionResults,
    pub(crate) state_transitions: StateTransitionManager,
    pub(crate) query_results: Vec<GenQueryResult>,
    pub(crate) exception_stack: Vec<ExceptionContext>,
    pub(crate) instructions_simulated: u64,
    pub(crate) end_of_test: bool,
    sim: Option<Box<dyn SimApi>>,
}

impl Generator {
    /// Builds a generator sharing the given memory manager.
    pub fn new(thread_id: u32, config: Config, memory: SharedMemoryManager) -> Self {
        let rng = Rng::new(config.seed ^ u64::from(thread_id));
        let dependence = ResourceDependence::new(&config);
        let mut generator = Self {
            thread_id,
            rng,
            mode: GenMode::new(GenModeFlags::empty()),
            gen_pc: GenPC::new(riscv64::PC_ALIGN_MASK),
            queue: GenRequestQueue::new(),
            registers: riscv64::build_register_file(),
            reserver: RegisterReserver::new(),
            dependence,
            memory,
            vm: VmManager::new_riscv(MemBank::Default),
            bnt_manager: BntNodeManager::new(),
            bnt_hooks: BntHookManager::new(),
            bnt_level: 0,
            speculative_nodes: Vec::new(),
            restore_loops: RestoreLoopManager::new(),
            data_station: DataStation::new(),
            results: InstructionResults::new(),
            state_transitions: StateTransitionManager::new(),
            query_results: Vec::new(),
            exception_stack: Vec::new(),
            instructions_simulated: 0,
            end_of_test: false,
            sim: None,
            config,
        };
        generator.setup();
        generator
    }

    /// Builds a standalone generator with a default memory layout.
    pub fn new_riscv(thread_id: u32, config: Config) -> Self {
        let memory = MemoryManager::new_shared();
        memory.borrow_mut().add_memory_range(MemBank::Default, 0x8000_0000, 0xbfff_ffff);
        Self::new(thread_id, config, memory)
    }

    fn setup(&mut self) {
        self.bnt_hooks.setup();
        // Machine mode out of reset; translation off.
        self.registers.write_register("PRIV", PrivilegeLevel::Machine as u64).expect("PRIV");
        let _ = self.registers.take_config_updates();
        self.gen_pc.set(self.config.reset_pc);
        let no_iss = GenModeFlags::NO_ISS;
        self.mode.enable_gen_mode(no_iss);
        info!("generator thread {} ready at PC 0x{:x}", self.thread_id, self.config.reset_pc);
    }

    // --- basic accessors -------------------------------------------------

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pc(&self) -> u64 {
        self.gen_pc.value()
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.gen_pc.set(pc);
    }

    pub fn mode(&self) -> &GenMode {
        &self.mode
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.registers
    }

    pub fn vm(&self) -> &VmManager {
        &self.vm
    }

    pub fn memory(&self) -> &SharedMemoryManager {
        &self.memory
    }

    pub fn results(&self) -> &InstructionResults {
        &self.results
    }

    pub fn instructions_simulated(&self) -> u64 {
        self.instructions_simulated
    }

    /// Whether the end-of-test sequence has run.
    pub fn is_end_of_test(&self) -> bool {
        self.end_of_test
    }

    pub fn exception_stack(&self) -> &[ExceptionContext] {
        &self.exception_stack
    }

    /// Attaches the simulator and clears the no-ISS mode.
    pub fn attach_simulator(&mut self, sim: Box<dyn SimApi>) {
        self.sim = Some(sim);
        self.mode.disable_gen_mode(GenModeFlags::NO_ISS);
    }

    /// Removes and returns the simulator; used internally around step calls.
    pub(crate) fn take_sim(&mut self) -> Option<Box<dyn SimApi>> {
        self.sim.take()
    }

    pub(crate) fn put_sim(&mut self, sim: Box<dyn SimApi>) {
        self.sim = Some(sim);
    }

    /// Whether committed instructions get stepped on the simulator.
    pub fn simulation_active(&self) -> bool {
        self.sim.is_some() && self.mode.has_iss() && self.mode.simulation_enabled()
    }

    // --- request plumbing ------------------------------------------------

    /// Appends a request to the back of the queue.
    pub fn enqueue_request(&mut self, request: GenRequest) {
        self.queue.enqueue(request);
    }

    /// Prepends a request, scheduling it before all queued work.
    pub fn prepend_request(&mut self, request: GenRequest) {
        self.queue.prepend_request(request);
    }

    /// Prepends a batch preserving its order.
    pub fn prepend_requests(&mut self, requests: Vec<GenRequest>) {
        self.queue.prepend_requests(requests);
    }

    /// Executes one request to completion: the request and every sub-request
    /// it spawns run before anything already queued.
    pub fn execute_request(&mut self, request: GenRequest) -> Result<(), Error> {
        let mark = self.queue.start_round();
        self.queue.prepend_request(request);
        while !self.queue.round_finished(mark) {
            let next = self.queue.pop_front().expect("round accounting broken");
            agent::dispatch(self, next)?;
        }
        Ok(())
    }

    /// Drains the whole queue.
    pub fn drain_queue(&mut self) -> Result<(), Error> {
        while let Some(request) = self.queue.pop_front() {
            agent::dispatch(self, request)?;
        }
        Ok(())
    }

    // --- convenience front-end API ---------------------------------------

    /// Generates one instruction and returns the committed record.
    pub fn gen_instruction(&mut self, request: GenInstructionRequest) -> Result<Instruction, Error> {
        let before = self.results.count();
        self.execute_request(GenRequest::Instruction(request))?;
        self.results
            .instructions()
            .get(before)
            .cloned()
            .ok_or_else(|| Error::ConstraintExhausted("instruction was not committed".to_string()))
    }

    /// Generates a virtual address satisfying alignment and size.
    pub fn gen_va(&mut self, size: u64, align: u64, is_instr: bool) -> Result<u64, Error> {
        self.execute_request(GenRequest::VirtualMemory(
            crate::request::GenVirtualMemoryRequest::GenVa { size, align, is_instr, range: None },
        ))?;
        match self.query_results.pop() {
            Some(GenQueryResult::Value(va)) => Ok(va),
            _ => Err(Error::ConstraintExhausted("no VA result".to_string())),
        }
    }

    /// Maps a virtual address range in the current regime.
    pub fn map_address_range(
        &mut self,
        va: u64,
        size: u64,
        is_instr: bool,
        request: &GenPageRequest,
    ) -> Result<(), Error> {
        let memory = self.memory.clone();
        let mut memory = memory.borrow_mut();
        self.vm.map_address_range(va, size, is_instr, request, &mut memory, &mut self.rng)
    }

    /// Translates a VA through the current mapper.
    pub fn translate_va_to_pa(&self, va: u64) -> Result<(u64, MemBank), Error> {
        self.vm.translate_va_to_pa(va)
    }

    /// Reverse-translates a PA through the current mapper.
    pub fn translate_pa_to_va(&self, pa: u64, bank: MemBank) -> Result<u64, Error> {
        self.vm.translate_pa_to_va(pa, bank)
    }

    // --- generator state -------------------------------------------------

    pub fn push_gen_mode(&mut self, flags: GenModeFlags) {
        self.mode.push_gen_mode(flags);
    }

    pub fn pop_gen_mode(&mut self, flags: GenModeFlags) {
        self.mode.pop_gen_mode(flags);
    }

    pub fn enable_gen_mode(&mut self, flags: GenModeFlags) {
        self.mode.enable_gen_mode(flags);
    }

    pub fn disable_gen_mode(&mut self, flags: GenModeFlags) {
        self.mode.disable_gen_mode(flags);
    }

    /// Current privilege level as modelled by the PRIV register.
    pub fn privilege_level(&self) -> PrivilegeLevel {
        let raw = self.registers.register_value("PRIV").unwrap_or(3);
        PrivilegeLevel::from_u64(raw).unwrap_or(PrivilegeLevel::Machine)
    }

    /// Sets the privilege level and re-derives the translation state.
    pub fn set_privilege_level(&mut self, level: PrivilegeLevel) -> Result<(), Error> {
        self.registers.write_register("PRIV", level as u64)?;
        self.update_vm()
    }

    /// Re-derives the translation state from the live control registers and
    /// refreshes the PC translation cache.
    pub fn update_vm(&mut self) -> Result<(), Error> {
        let _ = self.registers.take_config_updates();
        let privilege = self.privilege_level();
        let satp = self
            .registers
            .physical_id("satp")
            .map(|id| self.registers.physical(id))
            .filter(|phys| phys.is_initialized(phys.mask()))
            .map(|phys| phys.raw_value())
            .unwrap_or(0);
        let mstatus_known = matches!(self.registers.is_initialized("mstatus"), Ok((true, _)));
        let sum = if mstatus_known {
            self.registers.register_field_value("mstatus", "SUM").unwrap_or(0)
        } else {
            0
        };
        let mxr = if mstatus_known {
            self.registers.register_field_value("mstatus", "MXR").unwrap_or(0)
        } else {
            0
        };
        let memory = self.memory.clone();
        let mut memory = memory.borrow_mut();
        let switched = self.vm.update_translation_state(
            privilege,
            satp,
            (sum, mxr),
            &mut memory,
            &mut self.rng,
        )?;
        if switched {
            debug!("translation regime switched");
        }
        self.gen_pc.invalidate();
        Ok(())
    }

    /// Applies pending configure-register notifications (satp, mstatus,
    /// PRIV writes) to the virtual memory layer.
    pub fn apply_register_updates_to_vm(&mut self) -> Result<(), Error> {
        let updates = self.registers.take_config_updates();
        if updates.is_empty() {
            return Ok(());
        }
        debug!("translation control registers changed: {:?}", updates);
        self.update_vm()
    }

    // --- register services ----------------------------------------------

    /// Reserves a register by name.
    pub fn reserve_register(
        &mut self,
        name: &str,
        access: AccessType,
        reserve_type: RegReserveType,
    ) -> Result<(), Error> {
        self.reserver.reserve_by_name(&self.registers, name, access, reserve_type)
    }

    /// Releases a register reservation by name.
    pub fn unreserve_register(
        &mut self,
        name: &str,
        access: AccessType,
        reserve_type: RegReserveType,
    ) -> Result<(), Error> {
        self.reserver.unreserve_by_name(&self.registers, name, access, reserve_type)
    }

    /// Whether a register is reserved for the access by any reserver.
    pub fn is_register_reserved(&self, name: &str, access: AccessType) -> Result<bool, Error> {
        let register = self.registers.register(name)?;
        let indices = ConstraintSet::from_value(register.index as u64);
        Ok(self.reserver.is_reserved_by_any(register.reg_type, &indices, access))
    }

    /// Writes a register on the model and, when attached, the simulator.
    pub fn set_register(&mut self, name: &str, value: u64, mask: u64) -> Result<(), Error> {
        self.registers.write_physical_by_name(name, value, mask).or_else(|_| {
            // Fall back to the logical register path for composed names.
            self.registers.write_register(name, value)
        })?;
        if let Some(sim) = self.sim.as_mut() {
            sim.write_register(self.thread_id, name, value, mask);
        }
        self.apply_register_updates_to_vm()
    }

    // --- memory services -------------------------------------------------

    /// Initialises memory on model and simulator and tracks the attributes.
    pub fn initialize_memory(
        &mut self,
        bank: MemBank,
        pa: u64,
        data: Vec<u8>,
        attributes: MemoryAttributes,
    ) {
        if let Some(sim) = self.sim.as_mut() {
            sim.write_physical_memory(bank.number(), pa, &data);
        }
        let record = MemoryInitRecord::new(bank, pa, data, attributes);
        self.memory.borrow_mut().initialize_memory(&record);
    }

    /// Reads memory that may be only partially initialised.
    pub fn read_memory_partially_initialized(
        &self,
        bank: MemBank,
        pa: u64,
        buffer: &mut [u8],
    ) -> u64 {
        self.memory.borrow().bank(bank).read_memory_partially_initialized(pa, buffer)
    }

    // --- speculative bookkeeping -----------------------------------------

    pub fn speculative_bnt_level(&self) -> u32 {
        self.speculative_nodes.len() as u32
    }

    pub fn in_speculative_mode(&self) -> bool {
        !self.speculative_nodes.is_empty()
    }

    // --- summaries -------------------------------------------------------

    /// A short generation summary.
    pub fn gen_summary(&self) -> String {
        format!(
            "thread {}: {} committed, {} simulated, PC 0x{:x}, mode {:?}",
            self.thread_id,
            self.results.count(),
            self.instructions_simulated,
            self.gen_pc.value(),
            self.mode.current_mode()
        )
    }

    /// Commits a fully generated instruction: writes its bytes, records it,
    /// retires its operand accesses and steps the simulator when active.
    pub fn commit_instruction_final(&mut self, instruction: Instruction) -> Result<(), Error> {
        debug!(
            "committing {} at va 0x{:x} pa 0x{:x} encoding 0x{:08x}",
            instruction.name, instruction.va, instruction.pa, instruction.opcode
        );
        let bytes: Vec<u8> =
            instruction.opcode.to_le_bytes()[..instruction.size as usize].to_vec();
        self.initialize_memory(
            instruction.bank,
            instruction.pa,
            bytes,
            MemoryAttributes::INSTRUCTION,
        );

        if let Some(node) = self.speculative_nodes.last_mut() {
            node.record_execution();
            if node.execution_is_overflow() {
                warn!("speculative path instruction budget exhausted");
            }
        }

        self.dependence.commit_instruction();
        let committed = instruction.clone();
        self.results.add_instruction(instruction);

        if self.simulation_active() {
            agent::instruction::step_instruction(self, &committed)
        } else {
            agent::instruction::step_instruction_no_simulation(self, &committed);
            Ok(())
        }
    }

    /// Provides mutable access to the memory manager for agents.
    pub(crate) fn with_memory<R>(&mut self, f: impl FnOnce(&mut Self, &mut MemoryManager) -> R) -> R {
        let memory = self.memory.clone();
        let mut memory = memory.borrow_mut();
        f(self, &mut memory)
    }

    /// The usable-for-generation VA constraint of the current regime.
    pub fn virtual_usable_constraint(&self, is_instr: bool) -> ConstraintSet {
        let regime = self.vm.current_regime();
        if regime.paging_enabled() {
            regime.paging_mapper().virtual_usable_constraint(is_instr)
        } else {
            self.memory.borrow().bank(regime.default_memory_bank()).usable().clone()
        }
    }

    /// Picks a free GPR index outside reservations, for scratch use.
    pub fn choose_free_gpr(&mut self, access: AccessType) -> Result<u64, Error> {
        let mut usable = self.reserver.usable_index_constraint(RegisterType::Gpr, access);
        for exclude in riscv64::gpr_excludes() {
            usable.sub_value(u64::from(*exclude));
        }
        usable.choose_value(&mut self.rng)
    }
}
