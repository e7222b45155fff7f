//! Toolchain driver (spec §6.1): pipes X# source through the compiler,
//! assembler and VM behind three functions, one per stage, plus a
//! `ToolchainError` that wraps each stage's own error type — mirrored on
//! `vex/src/main.rs`'s local `Error` enum wrapping `vex::Error` and
//! `clap::Error` in one place.

use std::error::Error;
use std::fmt;

use xenon::{Processor, RunOutcome, VmFault};

/// The literal word the VM must find somewhere in a binary before it will
/// run (spec §6.1): `HALT`, encoded `0000000000000100`.
pub const HALT_WORD: &str = "0000000000000100";

#[derive(Debug)]
pub enum ToolchainError {
    Parse(xsc::ParseError),
    Lex(xsc::LexError),
    Compile(xsc::CompileError),
    Assemble(xasm::AssembleError),
    Bin(xbin::BinError),
    Vm(VmFault),
    MissingHalt,
}

impl fmt::Display for ToolchainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ToolchainError::Parse(e) => write!(f, "parse error: {}", e),
            ToolchainError::Lex(e) => write!(f, "lex error: {}", e),
            ToolchainError::Compile(e) => write!(f, "compile error: {}", e),
            ToolchainError::Assemble(e) => write!(f, "assemble error: {}", e),
            ToolchainError::Bin(e) => write!(f, "binary error: {}", e),
            ToolchainError::Vm(e) => write!(f, "vm error: {}", e),
            ToolchainError::MissingHalt => {
                write!(f, "binary contains no HALT instruction; the VM refuses to start")
            }
        }
    }
}

impl Error for ToolchainError {}

impl From<xsc::ParseError> for ToolchainError {
    fn from(e: xsc::ParseError) -> Self {
        ToolchainError::Parse(e)
    }
}
impl From<xsc::LexError> for ToolchainError {
    fn from(e: xsc::LexError) -> Self {
        ToolchainError::Lex(e)
    }
}
impl From<xsc::CompileError> for ToolchainError {
    fn from(e: xsc::CompileError) -> Self {
        ToolchainError::Compile(e)
    }
}
impl From<xasm::AssembleError> for ToolchainError {
    fn from(e: xasm::AssembleError) -> Self {
        ToolchainError::Assemble(e)
    }
}
impl From<xbin::BinError> for ToolchainError {
    fn from(e: xbin::BinError) -> Self {
        ToolchainError::Bin(e)
    }
}
impl From<VmFault> for ToolchainError {
    fn from(e: VmFault) -> Self {
        ToolchainError::Vm(e)
    }
}

/// Lexes, parses and compiles `source` to XAssembly lines (spec §4).
pub fn compile(source: &str, strip_trailing_load_result: bool) -> Result<Vec<String>, ToolchainError> {
    let tokens = xsc::lex("<source>", source, None, true)?;
    let ast = xsc::parse(tokens)?;
    let instructions = xsc::compile(&ast, strip_trailing_load_result)?;
    tracing::info!(lines = instructions.len(), "compiled to xassembly");
    Ok(instructions)
}

/// Assembles XAssembly text to `[01]{16}`-per-line binary text (spec §4.4).
pub fn assemble(assembly: &[String]) -> Result<Vec<String>, ToolchainError> {
    let source = assembly.join("\n");
    let lines = xasm::assemble(&source)?;
    tracing::info!(words = lines.len(), "assembled to binary");
    Ok(lines)
}

/// Outcome of running a binary to completion or to its step limit.
#[derive(Debug)]
pub struct RunResult {
    pub halted: bool,
    pub timeout: bool,
    pub a: i16,
    pub d: i16,
    pub memory: Vec<i16>,
    pub lit_pixels: Vec<(i16, i16)>,
}

fn load_program(binary: &[String]) -> Result<Vec<u16>, ToolchainError> {
    if !binary.iter().any(|line| line.trim() == HALT_WORD) {
        return Err(ToolchainError::MissingHalt);
    }
    let mut program = xbin::parse(&binary.join("\n"))?;
    program.resize(xenon::constants::PROGRAM_MEMORY_SIZE, 0);
    Ok(program)
}

fn to_run_result(cpu: &Processor, outcome: RunOutcome) -> RunResult {
    let memory = (0..xenon::constants::MEMORY_SIZE as u16).map(|addr| cpu.memory().read(addr)).collect();
    let lit_pixels = cpu.framebuffer().screen().iter().copied().collect();

    RunResult {
        halted: matches!(outcome, RunOutcome::Halted { .. }),
        timeout: matches!(outcome, RunOutcome::StepLimitReached),
        a: cpu.a(),
        d: cpu.d(),
        memory,
        lit_pixels,
    }
}

/// Runs assembled binary text on a fresh [`Processor`] in instant mode
/// (spec §4.5/§6.1/§5): a synchronous loop bounded only by `max_steps`.
/// Refuses to start unless `binary` contains a `HALT` word somewhere.
pub fn run(binary: &[String], max_steps: Option<u64>) -> Result<RunResult, ToolchainError> {
    let program = load_program(binary)?;
    let mut cpu = Processor::new();
    let outcome = cpu.run(&program, max_steps)?;
    Ok(to_run_result(&cpu, outcome))
}

/// Runs in clocked mode (spec §5): one `step` per host tick at `hz`,
/// rather than a tight synchronous loop. Behaviorally identical to
/// [`run`] — same `step` function, same fault/halt semantics — just
/// paced for a caller that wants to observe the machine mid-flight
/// (e.g. a UI watching the framebuffer update in real time).
pub fn run_clocked(binary: &[String], hz: u32, max_steps: Option<u64>) -> Result<RunResult, ToolchainError> {
    let program = load_program(binary)?;
    let period = std::time::Duration::from_secs_f64(1.0 / hz.max(1) as f64);

    let mut cpu = Processor::new();
    let mut steps: u64 = 0;
    let outcome = loop {
        if let Some(limit) = max_steps {
            if steps >= limit {
                break RunOutcome::StepLimitReached;
            }
        }
        let halted = cpu.step(&program)?;
        steps += 1;
        if halted {
            break RunOutcome::Halted { steps };
        }
        std::thread::sleep(period);
    };

    Ok(to_run_result(&cpu, outcome))
}

/// Runs all three stages in one shot: source → assembly → binary → outcome.
pub fn pipeline(source: &str, strip_trailing_load_result: bool, max_steps: Option<u64>) -> Result<RunResult, ToolchainError> {
    let assembly = compile(source, strip_trailing_load_result)?;
    let binary = assemble(&assembly)?;
    run(&binary, max_steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_source(source: &str) -> RunResult {
        pipeline(source, false, Some(10_000)).unwrap()
    }

    #[test]
    fn scenario_arithmetic_fold() {
        let result = run_source("include operations\nconst x 3 + 4 * 5\nx");
        assert_eq!(result.d, 23);
        assert!(result.halted);
    }

    #[test]
    fn scenario_for_loop_sum() {
        let result = run_source(
            "var s: int = 0\n\
             for i start: 1 end: 10 step: 1 {\n\
             \ts = s + i\n\
             }\n",
        );
        assert!(result.halted);
        // s occupies 16 (declared first); the for loop's iterator auto-allocates 17.
        assert_eq!(result.memory[16], 55);
    }

    #[test]
    fn scenario_while_countdown() {
        let result = run_source(
            "var n: int = 5\n\
             while n {\n\
             \tn = n - 1\n\
             }\n",
        );
        assert!(result.halted);
        assert_eq!(result.memory[16], 0);
    }

    #[test]
    fn scenario_conditional() {
        let result = run_source(
            "var x: int = 7\n\
             if x > 5 {\n\
             \tx = 1\n\
             } else {\n\
             \tx = 0\n\
             }\n",
        );
        assert!(result.halted);
        assert_eq!(result.memory[16], 1);
    }

    #[test]
    fn scenario_else_does_not_see_if_branch_assignments() {
        let result = run_source(
            "var x: int = 5\n\
             if x > 100 {\n\
             \tx = 1\n\
             } else {\n\
             \tx = x + 2\n\
             }\n",
        );
        assert!(result.halted);
        assert_eq!(result.memory[16], 7);
    }

    #[test]
    fn scenario_elseif_condition_does_not_see_prior_case_assignments() {
        let result = run_source(
            "var x: int = 5\n\
             if x > 100 {\n\
             \tx = 1\n\
             } elseif x > 3 {\n\
             \tx = 9\n\
             }\n",
        );
        assert!(result.halted);
        assert_eq!(result.memory[16], 9);
    }

    #[test]
    fn scenario_array_set_get() {
        let result = run_source(
            "var a: int[3] = [10, 20, 30]\n\
             var y: int = a[2]\n",
        );
        assert!(result.halted);
        // a occupies 16..19, y is the next free cell.
        assert_eq!(result.memory[19], 30);
    }

    #[test]
    fn scenario_plot_and_flip() {
        let result = run_source("plot(3, 4, 1)\nplot(5, 4, 1)\nflip()\n");
        assert!(result.halted);
        let mut pixels = result.lit_pixels;
        pixels.sort();
        assert_eq!(pixels, vec![(3, 4), (5, 4)]);
    }

    #[test]
    fn scenario_runtime_shift_by_zero() {
        let result = run_source(
            "var arr: int[1] = [0]\n\
             var x: int = 8\n\
             var y: int = x << arr[0]\n",
        );
        assert!(result.halted);
        // arr occupies 16, x occupies 17, y is the next free cell.
        assert_eq!(result.memory[18], 8);
    }

    #[test]
    fn scenario_runtime_divide_by_zero() {
        let result = run_source(
            "include operations\n\
             var arr: int[1] = [0]\n\
             var x: int = 8\n\
             var y: int = x / arr[0]\n",
        );
        assert!(result.halted);
        assert_eq!(result.memory[18], 0);
    }

    #[test]
    fn run_refuses_a_binary_without_halt() {
        let err = run(&["0000000000000000".to_string()], Some(10)).unwrap_err();
        assert!(matches!(err, ToolchainError::MissingHalt));
    }
}
