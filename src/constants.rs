//! Fixed dimensions of the Xenon machine: the memory map of spec §3, the
//! instruction-memory size implied by `CALL`'s 12-bit address field, and
//! the framebuffer's pixel grid.

/// Number of scratch-register cells `r0..r15` at the bottom of memory.
pub const TEMP_REGISTER_COUNT: u16 = 16;

/// First address available to the compiler's variable/array bump allocator.
pub const VARS_BASE: u16 = TEMP_REGISTER_COUNT;

/// Pixel-X port: write here before `PLOT`.
pub const PORT_X: u16 = 2048;
/// Pixel-Y port: write here before `PLOT`.
pub const PORT_Y: u16 = 2049;
/// Input port. Part of the memory map but not wired to any device.
pub const PORT_INPUT: u16 = 2050;

/// Size of the data memory array: temp registers + variable pool + 3 ports.
pub const MEMORY_SIZE: usize = PORT_INPUT as usize + 1;

/// Instruction memory is padded to this many words before a run starts.
/// Bounded by `CALL`'s 12-bit immediate, which can only address 4096 words.
pub const PROGRAM_MEMORY_SIZE: usize = 4096;

/// Maximum nested `CALL`s before the call stack overflows.
pub const CALL_STACK_DEPTH: usize = 16;

pub const FRAMEBUFFER_WIDTH: i16 = 48;
pub const FRAMEBUFFER_HEIGHT: i16 = 28;

pub const OPCODE_MASK: u16 = 0b11;

pub const OPCODE_LDIA: u16 = 0b10;
pub const OPCODE_COMP: u16 = 0b11;
pub const OPCODE_IO: u16 = 0b01;
pub const OPCODE_SYSTEM: u16 = 0b00;
