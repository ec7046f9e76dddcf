use std::sync::Arc;

use rxcl_spec::{
    decode_rx_parameters, kernels as entry, set_nonce, COMPILED_PROGRAM_SIZE, ENTROPY_SIZE,
    INITIAL_HASH_SIZE, INTERMEDIATE_PROGRAM_SIZE, LOCAL_GROUP_SIZE, OUTPUT_HASH_SIZE,
    REGISTERS_SIZE, REGISTER_FOLD_OFFSET, ROUNDING_SIZE, SCRATCHPAD_SLACK, VM_STATE_SIZE,
};

use crate::dataset::Dataset;
use crate::device::{BufferId, DeviceError, KernelArg};
use crate::refhash::{self, PROGRAM_SIZE};

pub(super) type HostKernelFn = fn(&Launch<'_>, &mut HostMemory) -> Result<(), DeviceError>;

const TABLE: [(&str, HostKernelFn); 10] = [
    (entry::INITIAL_HASH, initial_hash),
    (entry::FILL_SCRATCHPAD, fill_scratchpad),
    (entry::FILL_ENTROPY, fill_entropy),
    (entry::FOLD_SCRATCHPAD, fold_scratchpad),
    (entry::HASH_REGISTERS_32, hash_registers_32),
    (entry::HASH_REGISTERS_64, hash_registers_64),
    (entry::PORTABLE_INIT, init_vm),
    (entry::PORTABLE_EXECUTE, execute_vm),
    (entry::NATIVE_INIT, native_init),
    (entry::NATIVE_RUN, native_run),
];

pub(super) fn lookup(name: &str) -> Option<(&'static str, HostKernelFn)> {
    TABLE.iter().find(|(entry, _)| *entry == name).copied()
}

pub(super) enum Slot {
    Owned(Vec<u8>),
    Mapped(Arc<Dataset>),
}

impl Slot {
    pub(super) fn bytes(&self) -> &[u8] {
        match self {
            Self::Owned(bytes) => bytes,
            Self::Mapped(dataset) => dataset.bytes(),
        }
    }

    pub(super) fn bytes_mut(&mut self) -> Result<&mut [u8], DeviceError> {
        match self {
            Self::Owned(bytes) => Ok(bytes),
            Self::Mapped(_) => Err(DeviceError::Api {
                call: "write",
                message: "host-mapped buffers are read-only".to_string(),
            }),
        }
    }
}

#[derive(Default)]
pub(super) struct HostMemory {
    slots: Vec<Option<Slot>>,
}

impl HostMemory {
    pub(super) fn insert(&mut self, slot: Slot) -> BufferId {
        self.slots.push(Some(slot));
        BufferId(self.slots.len() - 1)
    }

    pub(super) fn remove(&mut self, id: BufferId) -> Option<Slot> {
        self.slots.get_mut(id.0).and_then(Option::take)
    }

    pub(super) fn slot(&self, id: BufferId) -> Result<&Slot, DeviceError> {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| released(id))
    }

    pub(super) fn slot_mut(&mut self, id: BufferId) -> Result<&mut Slot, DeviceError> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| released(id))
    }

    fn disjoint<const N: usize>(
        &mut self,
        ids: [BufferId; N],
    ) -> Result<[&mut Option<Slot>; N], DeviceError> {
        self.slots
            .get_disjoint_mut(ids.map(|id| id.0))
            .map_err(|_| DeviceError::Api {
                call: "enqueue_kernel",
                message: format!("kernel arguments {ids:?} must be distinct live buffers"),
            })
    }
}

fn released(id: BufferId) -> DeviceError {
    DeviceError::Api {
        call: "buffer",
        message: format!("buffer {} is not allocated", id.0),
    }
}

fn live(slot: &mut Option<Slot>, id: BufferId) -> Result<&mut Slot, DeviceError> {
    slot.as_mut().ok_or_else(|| released(id))
}

pub(super) struct Launch<'a> {
    pub(super) entry: &'a str,
    pub(super) global: usize,
    pub(super) local: usize,
    pub(super) args: &'a [Option<KernelArg>],
}

impl Launch<'_> {
    fn error(&self, message: impl Into<String>) -> DeviceError {
        DeviceError::Api {
            call: "enqueue_kernel",
            message: format!("{}: {}", self.entry, message.into()),
        }
    }

    fn buffer(&self, index: usize) -> Result<BufferId, DeviceError> {
        match self.args.get(index) {
            Some(Some(KernelArg::Buffer(id))) => Ok(*id),
            other => Err(self.error(format!("argument {index} must be a buffer, found {other:?}"))),
        }
    }

    fn scalar(&self, index: usize) -> Result<u32, DeviceError> {
        match self.args.get(index) {
            Some(Some(KernelArg::U32(value))) => Ok(*value),
            other => Err(self.error(format!("argument {index} must be a u32, found {other:?}"))),
        }
    }

    fn lanes(&self, threads_per_lane: usize, local: usize) -> Result<usize, DeviceError> {
        if self.local != local {
            return Err(self.error(format!("local size {} (expected {local})", self.local)));
        }
        if self.global == 0 || !self.global.is_multiple_of(threads_per_lane * LOCAL_GROUP_SIZE) {
            return Err(self.error(format!(
                "global size {} is not {threads_per_lane} threads per lane over whole groups",
                self.global
            )));
        }
        Ok(self.global / threads_per_lane)
    }

    fn batch(&self, index: usize, threads_per_lane: usize, local: usize) -> Result<usize, DeviceError> {
        let lanes = self.lanes(threads_per_lane, local)?;
        let declared = self.scalar(index)? as usize;
        if declared != lanes {
            return Err(self.error(format!("batch argument {declared} does not match {lanes} launched lanes")));
        }
        Ok(lanes)
    }

    fn require(&self, what: &str, len: usize, needed: usize) -> Result<(), DeviceError> {
        if len < needed {
            return Err(self.error(format!("{what} buffer holds {len} bytes, needs {needed}")));
        }
        Ok(())
    }

    fn scratchpad_size(&self, len: usize, lanes: usize) -> Result<usize, DeviceError> {
        let stride = len / lanes;
        if stride <= SCRATCHPAD_SLACK || !stride.is_multiple_of(64) {
            return Err(self.error(format!("scratchpad stride {stride} is unusable")));
        }
        Ok(stride)
    }
}

fn read_hash(hashes: &[u8], lane: usize) -> [u8; INITIAL_HASH_SIZE] {
    let mut hash = [0u8; INITIAL_HASH_SIZE];
    hash.copy_from_slice(&hashes[lane * INITIAL_HASH_SIZE..(lane + 1) * INITIAL_HASH_SIZE]);
    hash
}

fn read_rounding(rounding: &[u8], lane: usize) -> u32 {
    let mut word = [0u8; ROUNDING_SIZE];
    word.copy_from_slice(&rounding[lane * ROUNDING_SIZE..(lane + 1) * ROUNDING_SIZE]);
    u32::from_le_bytes(word)
}

fn write_rounding(rounding: &mut [u8], lane: usize, value: u32) {
    rounding[lane * ROUNDING_SIZE..(lane + 1) * ROUNDING_SIZE].copy_from_slice(&value.to_le_bytes());
}

fn initial_hash(launch: &Launch<'_>, memory: &mut HostMemory) -> Result<(), DeviceError> {
    let lanes = launch.lanes(1, LOCAL_GROUP_SIZE)?;
    let (hashes_id, template_id) = (launch.buffer(0)?, launch.buffer(1)?);
    let start_nonce = launch.scalar(2)?;
    let [hashes, template] = memory.disjoint([hashes_id, template_id])?;
    let hashes = live(hashes, hashes_id)?.bytes_mut()?;
    let template = live(template, template_id)?.bytes();
    launch.require("hash", hashes.len(), lanes * INITIAL_HASH_SIZE)?;

    let mut message = template[..template.len() / lanes].to_vec();
    for lane in 0..lanes {
        set_nonce(&mut message, start_nonce.wrapping_add(lane as u32));
        let hash = refhash::initial_hash(&message);
        hashes[lane * INITIAL_HASH_SIZE..(lane + 1) * INITIAL_HASH_SIZE].copy_from_slice(&hash);
    }
    Ok(())
}

fn fill_scratchpad(launch: &Launch<'_>, memory: &mut HostMemory) -> Result<(), DeviceError> {
    let lanes = launch.batch(2, 4, LOCAL_GROUP_SIZE)?;
    let (hashes_id, scratch_id) = (launch.buffer(0)?, launch.buffer(1)?);
    let [hashes, scratch] = memory.disjoint([hashes_id, scratch_id])?;
    let hashes = live(hashes, hashes_id)?.bytes_mut()?;
    let scratch = live(scratch, scratch_id)?.bytes_mut()?;
    launch.require("hash", hashes.len(), lanes * INITIAL_HASH_SIZE)?;
    let stride = launch.scratchpad_size(scratch.len(), lanes)?;
    let size = stride - SCRATCHPAD_SLACK;

    for lane in 0..lanes {
        let mut hash = read_hash(hashes, lane);
        refhash::fill_scratchpad(&mut hash, &mut scratch[lane * stride..lane * stride + size]);
        hashes[lane * INITIAL_HASH_SIZE..(lane + 1) * INITIAL_HASH_SIZE].copy_from_slice(&hash);
    }
    Ok(())
}

fn fill_entropy(launch: &Launch<'_>, memory: &mut HostMemory) -> Result<(), DeviceError> {
    let lanes = launch.batch(2, 4, LOCAL_GROUP_SIZE)?;
    let (hashes_id, entropy_id) = (launch.buffer(0)?, launch.buffer(1)?);
    let [hashes, entropy] = memory.disjoint([hashes_id, entropy_id])?;
    let hashes = live(hashes, hashes_id)?.bytes();
    let entropy = live(entropy, entropy_id)?.bytes_mut()?;
    launch.require("hash", hashes.len(), lanes * INITIAL_HASH_SIZE)?;
    launch.require("entropy", entropy.len(), lanes * ENTROPY_SIZE)?;

    for lane in 0..lanes {
        let hash = read_hash(hashes, lane);
        refhash::fill_entropy(&hash, &mut entropy[lane * ENTROPY_SIZE..(lane + 1) * ENTROPY_SIZE]);
    }
    Ok(())
}

fn fold_scratchpad(launch: &Launch<'_>, memory: &mut HostMemory) -> Result<(), DeviceError> {
    let lanes = launch.batch(4, 4, LOCAL_GROUP_SIZE)?;
    let (scratch_id, states_id) = (launch.buffer(0)?, launch.buffer(1)?);
    let offset = launch.scalar(2)?;
    let state_stride = launch.scalar(3)? as usize;
    if offset != REGISTER_FOLD_OFFSET {
        return Err(launch.error(format!("fold offset {offset} (expected {REGISTER_FOLD_OFFSET})")));
    }
    let [scratch, states] = memory.disjoint([scratch_id, states_id])?;
    let scratch = live(scratch, scratch_id)?.bytes();
    let states = live(states, states_id)?.bytes_mut()?;
    let stride = launch.scratchpad_size(scratch.len(), lanes)?;
    let size = stride - SCRATCHPAD_SLACK;
    launch.require("VM state", states.len(), lanes * state_stride)?;
    if state_stride < REGISTERS_SIZE {
        return Err(launch.error(format!("register stride {state_stride} is below {REGISTERS_SIZE}")));
    }

    for lane in 0..lanes {
        refhash::fold_scratchpad(
            &scratch[lane * stride..lane * stride + size],
            &mut states[lane * state_stride..lane * state_stride + REGISTERS_SIZE],
        );
    }
    Ok(())
}

fn hash_registers_32(launch: &Launch<'_>, memory: &mut HostMemory) -> Result<(), DeviceError> {
    hash_registers(launch, memory, OUTPUT_HASH_SIZE)
}

fn hash_registers_64(launch: &Launch<'_>, memory: &mut HostMemory) -> Result<(), DeviceError> {
    hash_registers(launch, memory, INITIAL_HASH_SIZE)
}

/// Output is packed at `width` bytes per lane.
fn hash_registers(launch: &Launch<'_>, memory: &mut HostMemory, width: usize) -> Result<(), DeviceError> {
    let lanes = launch.lanes(1, LOCAL_GROUP_SIZE)?;
    let (hashes_id, states_id) = (launch.buffer(0)?, launch.buffer(1)?);
    let state_stride = launch.scalar(2)? as usize;
    if state_stride < REGISTERS_SIZE {
        return Err(launch.error(format!("register stride {state_stride} is below {REGISTERS_SIZE}")));
    }
    let [hashes, states] = memory.disjoint([hashes_id, states_id])?;
    let hashes = live(hashes, hashes_id)?.bytes_mut()?;
    let states = live(states, states_id)?.bytes();
    launch.require("hash", hashes.len(), lanes * width)?;
    launch.require("VM state", states.len(), lanes * state_stride)?;

    for lane in 0..lanes {
        let registers = &states[lane * state_stride..lane * state_stride + REGISTERS_SIZE];
        let out = &mut hashes[lane * width..(lane + 1) * width];
        if width == OUTPUT_HASH_SIZE {
            out.copy_from_slice(&refhash::hash_registers_32(registers));
        } else {
            out.copy_from_slice(&refhash::hash_registers_64(registers));
        }
    }
    Ok(())
}

fn init_vm(launch: &Launch<'_>, memory: &mut HostMemory) -> Result<(), DeviceError> {
    let lanes = launch.lanes(8, 32)?;
    let (entropy_id, states_id) = (launch.buffer(0)?, launch.buffer(1)?);
    let [entropy, states] = memory.disjoint([entropy_id, states_id])?;
    let entropy = live(entropy, entropy_id)?.bytes();
    let states = live(states, states_id)?.bytes_mut()?;
    launch.require("entropy", entropy.len(), lanes * ENTROPY_SIZE)?;
    launch.require("VM state", states.len(), lanes * VM_STATE_SIZE)?;

    for lane in 0..lanes {
        let lane_entropy = &entropy[lane * ENTROPY_SIZE..(lane + 1) * ENTROPY_SIZE];
        let state = &mut states[lane * VM_STATE_SIZE..(lane + 1) * VM_STATE_SIZE];
        let (registers, program) = state.split_at_mut(REGISTERS_SIZE);
        refhash::load_registers(lane_entropy, registers);
        refhash::load_program(lane_entropy, program);
    }
    Ok(())
}

fn execute_vm(launch: &Launch<'_>, memory: &mut HostMemory) -> Result<(), DeviceError> {
    let lanes = match launch.local {
        32 => launch.batch(4, 16, 32)?,
        _ => launch.batch(4, 8, 16)?,
    };
    let ids = [
        launch.buffer(0)?,
        launch.buffer(1)?,
        launch.buffer(2)?,
        launch.buffer(3)?,
    ];
    let iterations = launch.scalar(5)?;
    let first = launch.scalar(6)? != 0;
    let last = launch.scalar(7)? != 0;
    let [states, rounding, scratch, dataset] = memory.disjoint(ids)?;
    let states = live(states, ids[0])?.bytes_mut()?;
    let rounding = live(rounding, ids[1])?.bytes_mut()?;
    let scratch = live(scratch, ids[2])?.bytes_mut()?;
    let dataset = live(dataset, ids[3])?.bytes();
    launch.require("VM state", states.len(), lanes * VM_STATE_SIZE)?;
    launch.require("rounding", rounding.len(), lanes * ROUNDING_SIZE)?;
    let stride = launch.scratchpad_size(scratch.len(), lanes)?;
    let size = stride - SCRATCHPAD_SLACK;

    for lane in 0..lanes {
        let state = &mut states[lane * VM_STATE_SIZE..(lane + 1) * VM_STATE_SIZE];
        let (registers, program) = state.split_at_mut(REGISTERS_SIZE);
        if first {
            refhash::begin_program(registers);
        }
        refhash::run_iterations(
            registers,
            program,
            &mut scratch[lane * stride..lane * stride + size],
            dataset,
            iterations,
        );
        if last {
            let mut value = read_rounding(rounding, lane);
            refhash::end_program(registers, &mut value);
            write_rounding(rounding, lane, value);
        }
    }
    Ok(())
}

fn native_init(launch: &Launch<'_>, memory: &mut HostMemory) -> Result<(), DeviceError> {
    let lanes = launch.batch(4, 1, LOCAL_GROUP_SIZE)?;
    let ids = [
        launch.buffer(0)?,
        launch.buffer(1)?,
        launch.buffer(2)?,
        launch.buffer(3)?,
    ];
    let [entropy, registers, intermediate, compiled] = memory.disjoint(ids)?;
    let entropy = live(entropy, ids[0])?.bytes();
    let registers = live(registers, ids[1])?.bytes_mut()?;
    let intermediate = live(intermediate, ids[2])?.bytes_mut()?;
    let compiled = live(compiled, ids[3])?.bytes_mut()?;
    launch.require("entropy", entropy.len(), lanes * ENTROPY_SIZE)?;
    launch.require("register", registers.len(), lanes * REGISTERS_SIZE)?;
    launch.require("intermediate program", intermediate.len(), lanes * INTERMEDIATE_PROGRAM_SIZE)?;
    launch.require("compiled program", compiled.len(), lanes * COMPILED_PROGRAM_SIZE)?;

    for lane in 0..lanes {
        let lane_entropy = &entropy[lane * ENTROPY_SIZE..(lane + 1) * ENTROPY_SIZE];
        refhash::load_registers(
            lane_entropy,
            &mut registers[lane * REGISTERS_SIZE..(lane + 1) * REGISTERS_SIZE],
        );
        let decoded = &mut intermediate[lane * INTERMEDIATE_PROGRAM_SIZE..];
        refhash::load_program(lane_entropy, decoded);
        let program = &mut compiled[lane * COMPILED_PROGRAM_SIZE..];
        program[..PROGRAM_SIZE].copy_from_slice(&decoded[..PROGRAM_SIZE]);
    }
    Ok(())
}

fn native_run(launch: &Launch<'_>, memory: &mut HostMemory) -> Result<(), DeviceError> {
    let lanes = launch.batch(5, 64, LOCAL_GROUP_SIZE)?;
    let parameters = decode_rx_parameters(launch.scalar(6)?);
    let ids = [
        launch.buffer(0)?,
        launch.buffer(1)?,
        launch.buffer(2)?,
        launch.buffer(3)?,
        launch.buffer(4)?,
    ];
    let [dataset, scratch, registers, rounding, compiled] = memory.disjoint(ids)?;
    let dataset = live(dataset, ids[0])?.bytes();
    let scratch = live(scratch, ids[1])?.bytes_mut()?;
    let registers = live(registers, ids[2])?.bytes_mut()?;
    let rounding = live(rounding, ids[3])?.bytes_mut()?;
    let compiled = live(compiled, ids[4])?.bytes();
    let stride = launch.scratchpad_size(scratch.len(), lanes)?;
    if stride - SCRATCHPAD_SLACK != parameters.scratchpad_l3 {
        return Err(launch.error(format!(
            "parameter word L3 {} does not match scratchpad stride {stride}",
            parameters.scratchpad_l3
        )));
    }
    launch.require("register", registers.len(), lanes * REGISTERS_SIZE)?;
    launch.require("rounding", rounding.len(), lanes * ROUNDING_SIZE)?;
    launch.require("compiled program", compiled.len(), lanes * COMPILED_PROGRAM_SIZE)?;

    for lane in 0..lanes {
        let lane_registers = &mut registers[lane * REGISTERS_SIZE..(lane + 1) * REGISTERS_SIZE];
        let program = &compiled[lane * COMPILED_PROGRAM_SIZE..lane * COMPILED_PROGRAM_SIZE + PROGRAM_SIZE];
        refhash::begin_program(lane_registers);
        refhash::run_iterations(
            lane_registers,
            program,
            &mut scratch[lane * stride..lane * stride + parameters.scratchpad_l3],
            dataset,
            parameters.program_iterations,
        );
        let mut value = read_rounding(rounding, lane);
        refhash::end_program(lane_registers, &mut value);
        write_rounding(rounding, lane, value);
    }
    Ok(())
}
