mod decode;

use std::error::Error;
use std::fmt;

use self::decode::TickResult;
use crate::constants;
use crate::framebuffer::Framebuffer;
use crate::memory::Memory;

/// A runtime error distinguishable from a normal `HALT`. Any of these stops
/// `run`/`step` immediately; the processor's state at the moment of the
/// fault is left as-is for inspection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VmFault {
    InvalidOpcode(u16),
    PixelOutOfBounds { x: i16, y: i16 },
    CallStackOverflow,
    CallStackUnderflow,
    ProgramCounterOutOfRange(usize),
}

impl fmt::Display for VmFault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VmFault::InvalidOpcode(word) => write!(f, "unrecognized instruction word {:#06x}", word),
            VmFault::PixelOutOfBounds { x, y } => {
                write!(f, "PLOT address ({}, {}) is outside the 48x28 framebuffer", x, y)
            }
            VmFault::CallStackOverflow => write!(
                f,
                "call stack exceeded its maximum depth of {}",
                constants::CALL_STACK_DEPTH
            ),
            VmFault::CallStackUnderflow => write!(f, "RETN executed with an empty call stack"),
            VmFault::ProgramCounterOutOfRange(pc) => {
                write!(f, "program counter {} ran past the end of instruction memory", pc)
            }
        }
    }
}

impl Error for VmFault {}

/// Outcome of a bounded [`Processor::run`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RunOutcome {
    Halted { steps: u64 },
    StepLimitReached,
}

/// The Xenon machine: `A`/`D` registers, program counter, data memory,
/// call stack and framebuffer. Instruction memory (the assembled program)
/// is supplied to `step`/`run` rather than owned here, so the same
/// processor can be re-run against different binaries without reloading
/// state by hand.
pub struct Processor {
    a: i16,
    d: i16,
    pc: usize,
    memory: Memory,
    framebuffer: Framebuffer,
    call_stack: Vec<usize>,
}

impl Processor {
    pub fn new() -> Processor {
        Processor {
            a: 0,
            d: 0,
            pc: 0,
            memory: Memory::new(),
            framebuffer: Framebuffer::new(),
            call_stack: Vec::with_capacity(constants::CALL_STACK_DEPTH),
        }
    }

    pub fn a(&self) -> i16 {
        self.a
    }

    pub fn d(&self) -> i16 {
        self.d
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    /// Executes exactly one instruction from `program`. Returns `true` if
    /// that instruction was `HALT`.
    pub fn step(&mut self, program: &[u16]) -> Result<bool, VmFault> {
        let word = *program
            .get(self.pc)
            .ok_or(VmFault::ProgramCounterOutOfRange(self.pc))?;

        let result = decode::tick(
            word,
            &mut self.a,
            &mut self.d,
            &mut self.memory,
            &mut self.framebuffer,
            &mut self.call_stack,
            self.pc,
        )?;

        tracing::trace!(pc = self.pc, word, a = self.a, d = self.d, "executed instruction");

        match result {
            TickResult::Next => self.pc += 1,
            TickResult::Jump(target) => self.pc = target,
            TickResult::Halt => return Ok(true),
        }

        Ok(false)
    }

    /// Runs to `HALT`, or until `max_steps` instructions have executed.
    /// `max_steps = None` runs unbounded (the "instant" mode of spec §5,
    /// where the caller is trusted to supply a program that terminates).
    pub fn run(&mut self, program: &[u16], max_steps: Option<u64>) -> Result<RunOutcome, VmFault> {
        let mut steps: u64 = 0;
        loop {
            if let Some(limit) = max_steps {
                if steps >= limit {
                    tracing::debug!(steps, "step limit reached without halting");
                    return Ok(RunOutcome::StepLimitReached);
                }
            }

            let halted = self.step(program)?;
            steps += 1;

            if halted {
                tracing::debug!(steps, "halted");
                return Ok(RunOutcome::Halted { steps });
            }
        }
    }
}

impl Default for Processor {
    fn default() -> Processor {
        Processor::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pad(mut words: Vec<u16>) -> Vec<u16> {
        words.resize(constants::PROGRAM_MEMORY_SIZE, 0);
        words
    }

    #[test]
    fn halt_stops_immediately() {
        let mut cpu = Processor::new();
        let program = pad(vec![0b0000_0000_0000_0100]);
        let outcome = cpu.run(&program, None).unwrap();
        assert_eq!(outcome, RunOutcome::Halted { steps: 1 });
    }

    #[test]
    fn ldia_then_store_to_d() {
        let mut cpu = Processor::new();
        // LDIA 42, then COMP D=A (select A as the operand, D starts at 0 so
        // D+A = A; store into D only).
        let ldia = (42u16 << 2) | 0b10;
        let code: u16 = 0b1001_0000; // select_a, add_family
        let dest: u16 = 0b100; // D flag only
        let comp = (code << 8) | (dest << 5) | 0b11;
        let halt = 0b0000_0000_0000_0100;
        let program = pad(vec![ldia, comp, halt]);

        let outcome = cpu.run(&program, None).unwrap();
        assert_eq!(outcome, RunOutcome::Halted { steps: 3 });
        assert_eq!(cpu.a(), 42);
        assert_eq!(cpu.d(), 42);
    }

    #[test]
    fn ldia_negative_round_trips_in_signed_range() {
        for v in [-8192i32, -1, 0, 1, 8191] {
            let mut cpu = Processor::new();
            let encoded = if v < 0 { (16384 + v) as u16 } else { v as u16 };
            let ldia = (encoded << 2) | 0b10;
            let halt = 0b0000_0000_0000_0100;
            let program = pad(vec![ldia, halt]);
            cpu.run(&program, None).unwrap();
            assert_eq!(cpu.a() as i32, v);
        }
    }

    #[test]
    fn call_and_retn_round_trip_pc() {
        let mut cpu = Processor::new();
        // CALL 2 ; HALT ; RETN
        let call = (2u16 << 4) | 0b1000;
        let halt = 0b0000_0000_0000_0100;
        let retn = 0b0000_0000_0000_1100;
        let program = pad(vec![call, halt, retn]);

        assert!(!cpu.step(&program).unwrap()); // CALL, pc -> 2
        assert_eq!(cpu.pc(), 2);
        assert!(!cpu.step(&program).unwrap()); // RETN, pc -> 1 (return address)
        assert_eq!(cpu.pc(), 1);
        assert!(cpu.step(&program).unwrap()); // HALT
    }

    #[test]
    fn call_stack_overflow_faults() {
        let mut cpu = Processor::new();
        let call_self = 0b1000u16; // CALL 0 -- calls its own address forever
        let program = pad(vec![call_self]);
        let err = cpu.run(&program, None).unwrap_err();
        assert_eq!(err, VmFault::CallStackOverflow);
    }

    #[test]
    fn plot_out_of_bounds_faults() {
        let mut cpu = Processor::new();
        // D = 100 (via A), then A = port_x address, then mem[A] = D (pass D
        // through unchanged: AND with an all-ones operand), then PLOT.
        let ldia_100 = (100u16 << 2) | 0b10;
        let a_to_d_code: u16 = 0b1001_0000; // select_a, add_family -> res = A
        let a_to_d = (a_to_d_code << 8) | (0b100 << 5) | 0b11; // dest D

        let ldia_port_x = (constants::PORT_X << 2) | 0b10;
        let pass_d_code: u16 = 0b0000_0110; // zero_a, invert_a -> AND with -1 == D
        let store_d = (pass_d_code << 8) | (0b001 << 5) | 0b11; // dest M

        let plot = 0b1101u16; // bit2=1 (PLOT), bit3=1 (value=1)
        let program = pad(vec![ldia_100, a_to_d, ldia_port_x, store_d, plot]);

        let err = cpu.run(&program, None).unwrap_err();
        assert_eq!(err, VmFault::PixelOutOfBounds { x: 100, y: 0 });
    }

    #[test]
    fn alu_add_wraps_on_overflow() {
        let mut cpu = Processor::new();
        let a_code: u16 = 224; // "A"
        let d_plus_a_code: u16 = 144; // "D+A"
        let dest_d: u16 = 0b100;
        let dest_a: u16 = 0b010;

        // LDIA's immediate is 14-bit signed, so values above 8191 must be
        // built up by repeated addition: 8000*3 + 6000 = 30000, then
        // doubling 30000 (60000) wraps mod 2^16 to -5536.
        let ldia = |v: u16| (v << 2) | 0b10;
        let d_eq_a = (a_code << 8) | (dest_d << 5) | 0b11;
        let a_eq_d_plus_a = (d_plus_a_code << 8) | (dest_a << 5) | 0b11;
        let d_eq_d_plus_a = (d_plus_a_code << 8) | (dest_d << 5) | 0b11;
        let halt = 0b0000_0000_0000_0100;

        let program = pad(vec![
            ldia(8000),
            d_eq_a,
            ldia(8000),
            a_eq_d_plus_a, // A = 16000
            d_eq_a,
            ldia(8000),
            a_eq_d_plus_a, // A = 24000
            d_eq_a,
            ldia(6000),
            a_eq_d_plus_a, // A = 30000
            d_eq_a,        // D = 30000
            d_eq_d_plus_a, // D = 60000, wraps to -5536
            halt,
        ]);

        cpu.run(&program, None).unwrap();
        assert_eq!(cpu.a(), 30000);
        assert_eq!(cpu.d(), -5536);
    }

    #[test]
    fn step_limit_reached_without_halting() {
        let mut cpu = Processor::new();
        let noop = 0u16;
        let program = pad(vec![noop]);
        let outcome = cpu.run(&program, Some(5)).unwrap();
        assert_eq!(outcome, RunOutcome::StepLimitReached);
    }
}
