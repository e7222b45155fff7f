use std::error::Error;
use std::fmt;

/// An assembly failure, always anchored to the 1-indexed source line that
/// produced it so a driver can report it verbatim.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum AssembleError {
    UnknownMnemonic { line: usize, mnemonic: String },
    UnknownAluCode { line: usize, mnemonic: String },
    UnknownJumpCode { line: usize, mnemonic: String },
    UnboundLabel { line: usize, label: String },
    Arity { line: usize, message: String },
}

impl fmt::Display for AssembleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AssembleError::UnknownMnemonic { line, mnemonic } => {
                write!(f, "line {}: unknown mnemonic \"{}\"", line, mnemonic)
            }
            AssembleError::UnknownAluCode { line, mnemonic } => {
                write!(f, "line {}: unknown ALU code \"{}\"", line, mnemonic)
            }
            AssembleError::UnknownJumpCode { line, mnemonic } => {
                write!(f, "line {}: unknown jump mnemonic \"{}\"", line, mnemonic)
            }
            AssembleError::UnboundLabel { line, label } => {
                write!(f, "line {}: unbound label \"{}\"", line, label)
            }
            AssembleError::Arity { line, message } => {
                write!(f, "line {}: {}", line, message)
            }
        }
    }
}

impl Error for AssembleError {}
