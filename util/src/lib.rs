use std::{error::Error, fmt};

/// Error produced when a mnemonic token doesn't match any variant of an
/// [`EnumFromStr`] enum.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ParseEnumError {
    pub value: String,
    pub enum_name: &'static str,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\" is not a valid {}",
            &self.value, &self.enum_name
        )
    }
}

impl Error for ParseEnumError {}

pub trait EnumFromStr: Sized {
    fn from_str(s: &str) -> Result<Self, ParseEnumError>;
}
