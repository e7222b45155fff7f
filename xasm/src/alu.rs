//! Lookup table from `COMP` ALU mnemonics to the 8-bit code field decoded
//! by the VM (spec §4.5): bit7 selects `A` over `mem[A]`, bit6/bit5 zero
//! and invert `D`, bit4 picks the add family over the and family, bit3
//! inverts the final result, bit2/bit1 zero and invert the `A`-or-`M`
//! operand, and bit0 is xor-instead-of-add (add family) or
//! shift-instead-of-and (and family).
//!
//! The 37 values below are the ones this machine has shipped with from the
//! start; `>>D`/`>>M` were added for the shift operator and derived from
//! the same bit semantics (zero+invert the unused operand to make it the
//! AND-identity `-1`, keep the live one untouched, then set the shift bit).

pub fn alu_code(mnemonic: &str) -> Option<u8> {
    let code = match mnemonic {
        "0" => 36,
        "1" => 126,
        "-1" => 44,
        "-2" => 118,
        "D" => 6,
        "A" => 224,
        "M" => 96,
        "!D" => 14,
        "!A" => 232,
        "!M" => 104,
        "-D" => 30,
        "-A" => 248,
        "-M" => 120,
        "D++" => 94,
        "A++" => 250,
        "M++" => 122,
        "D--" => 22,
        "A--" => 240,
        "M--" => 112,
        "D+A" => 144,
        "D+M" => 16,
        "D-A" => 216,
        "D-M" => 88,
        "A-D" => 154,
        "M-D" => 26,
        "D&A" => 128,
        "D&M" => 0,
        "!(D&A)" => 136,
        "!(D&M)" => 8,
        "D|A" => 202,
        "D|M" => 74,
        "!(D|A)" => 194,
        "!(D|M)" => 66,
        "D^A" => 129,
        "D^M" => 1,
        "!(D^A)" => 137,
        "!(D^M)" => 9,
        ">>D" => 7,
        ">>M" => 97,
        _ => return None,
    };
    Some(code)
}

use util::EnumFromStr;
use util_derive::EnumFromStr;

/// Jump mnemonics are plain identifiers, unlike the symbolic ALU codes, so
/// they round-trip through the same `EnumFromStr` derive the compiler uses
/// for keyword tables.
#[derive(Clone, Copy, Eq, PartialEq, Debug, EnumFromStr)]
pub enum Jump {
    JLT,
    JEQ,
    JLE,
    JGT,
    JNE,
    JGE,
    JMP,
}

pub fn jump_code(mnemonic: &str) -> Option<u8> {
    let jump = Jump::from_str(mnemonic).ok()?;
    Some(match jump {
        Jump::JLT => 1,
        Jump::JEQ => 2,
        Jump::JLE => 3,
        Jump::JGT => 4,
        Jump::JNE => 5,
        Jump::JGE => 6,
        Jump::JMP => 7,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_and_one_are_distinct() {
        assert_ne!(alu_code("0"), alu_code("1"));
    }

    #[test]
    fn shift_variants_resolve() {
        assert_eq!(alu_code(">>D"), Some(7));
        assert_eq!(alu_code(">>M"), Some(97));
    }

    #[test]
    fn unknown_mnemonic_is_none() {
        assert_eq!(alu_code("D%A"), None);
    }

    #[test]
    fn all_seven_jumps_are_distinct_and_1_indexed() {
        let codes: Vec<u8> = ["JLT", "JEQ", "JLE", "JGT", "JNE", "JGE", "JMP"]
            .iter()
            .map(|m| jump_code(m).unwrap())
            .collect();
        assert_eq!(codes, vec![1, 2, 3, 4, 5, 6, 7]);
    }
}
