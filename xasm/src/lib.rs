//! Assembler for XAssembly, the symbolic instruction language emitted by
//! the X# compiler.
//!
//! A program is a sequence of lines, one instruction per line. Labels are
//! lines beginning with `.` and containing no whitespace; they resolve to
//! the address of the next real instruction. `//` starts a line comment.
//! Blank lines assemble to `NOOP` so line numbers keep tracking addresses.
//!
//! Assembly is two passes: the first walks the (comment-stripped,
//! register-substituted) lines to build the label table, the second
//! encodes every non-label line into a 16-bit word.

mod alu;
mod error;

use std::collections::HashMap;

pub use error::AssembleError;

/// Assembles XAssembly source into one 16-character `0`/`1` string per
/// instruction word, matching spec's `assemble(text) -> lines[]`.
pub fn assemble(source: &str) -> Result<Vec<String>, AssembleError> {
    let words = assemble_to_words(source)?;
    Ok(words.iter().map(|w| format!("{:016b}", w)).collect())
}

/// Assembles XAssembly source directly into 16-bit words, for callers
/// (the VM, the driver) that want binary rather than text.
pub fn assemble_to_words(source: &str) -> Result<Vec<u16>, AssembleError> {
    let lines: Vec<String> = source.lines().map(preprocess_line).collect();
    let labels = resolve_labels(&lines);

    let mut words = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        let line_no = i + 1;
        if is_label(line) {
            continue;
        }
        if line.is_empty() {
            words.push(0);
            continue;
        }
        let word = encode_line(line, &labels, line_no)?;
        tracing::trace!(line_no, word, "encoded instruction");
        words.push(word);
    }
    tracing::info!(words = words.len(), labels = labels.len(), "assembly complete");
    Ok(words)
}

fn preprocess_line(raw: &str) -> String {
    let without_comment = match raw.find("//") {
        Some(idx) => &raw[..idx],
        None => raw,
    };
    substitute_registers(without_comment.trim())
}

fn is_label(line: &str) -> bool {
    line.starts_with('.') && !line.contains(' ') && !line.is_empty()
}

/// Replaces whole-token `r0`..`r15` with their literal integer value.
fn substitute_registers(line: &str) -> String {
    line.split_whitespace()
        .map(|tok| match register_shorthand(tok) {
            Some(n) => n.to_string(),
            None => tok.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn register_shorthand(tok: &str) -> Option<u8> {
    let digits = tok.strip_prefix('r')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: u16 = digits.parse().ok()?;
    if n <= 15 {
        Some(n as u8)
    } else {
        None
    }
}

fn resolve_labels(lines: &[String]) -> HashMap<String, u16> {
    let mut labels = HashMap::new();
    let mut address: u16 = 0;
    for line in lines {
        if is_label(line) {
            tracing::debug!(label = %line, address, "resolved label");
            labels.insert(line.clone(), address);
        } else {
            address += 1;
        }
    }
    labels
}

fn resolve_immediate(
    token: &str,
    labels: &HashMap<String, u16>,
    line_no: usize,
) -> Result<i32, AssembleError> {
    if let Ok(n) = token.parse::<i32>() {
        return Ok(n);
    }
    labels
        .get(token)
        .map(|&addr| addr as i32)
        .ok_or_else(|| AssembleError::UnboundLabel {
            line: line_no,
            label: token.to_string(),
        })
}

fn encode_line(
    line: &str,
    labels: &HashMap<String, u16>,
    line_no: usize,
) -> Result<u16, AssembleError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mnemonic = tokens[0];
    let args = &tokens[1..];

    match mnemonic {
        "NOOP" => Ok(0b0000_0000_0000_0000),
        "HALT" => Ok(0b0000_0000_0000_0100),
        "RETN" => Ok(0b0000_0000_0000_1100),
        "LDIA" => {
            require_args(args, 1, line_no)?;
            let value = resolve_immediate(args[0], labels, line_no)?;
            let encoded14 = (if value < 0 { 16384 + value } else { value }) as u16 & 0x3FFF;
            Ok((encoded14 << 2) | 0b10)
        }
        "CALL" => {
            require_args(args, 1, line_no)?;
            let target = resolve_immediate(args[0], labels, line_no)? as u16 & 0x0FFF;
            Ok((target << 4) | 0b1000)
        }
        "PLOT" => {
            require_args(args, 1, line_no)?;
            let value: u16 = match args[0] {
                "0" => 0,
                "1" => 1,
                other => {
                    return Err(AssembleError::Arity {
                        line: line_no,
                        message: format!("PLOT expects 0 or 1, got \"{}\"", other),
                    })
                }
            };
            Ok((value << 3) | 0b101)
        }
        "BUFR" => {
            require_args(args, 1, line_no)?;
            let op: u16 = match args[0] {
                "move" => 0b10,
                "update" => 0b00,
                other => {
                    return Err(AssembleError::Arity {
                        line: line_no,
                        message: format!("BUFR expects move|update, got \"{}\"", other),
                    })
                }
            };
            Ok((op << 3) | 0b001)
        }
        "COMP" => encode_comp(args, line_no),
        other => Err(AssembleError::UnknownMnemonic {
            line: line_no,
            mnemonic: other.to_string(),
        }),
    }
}

fn encode_comp(args: &[&str], line_no: usize) -> Result<u16, AssembleError> {
    if args.is_empty() {
        return Err(AssembleError::Arity {
            line: line_no,
            message: "COMP requires an ALU code argument".to_string(),
        });
    }

    let code_mnemonic = args[0];
    let mut idx = 1;
    let mut dest = "";
    if idx < args.len() && is_dest_token(args[idx]) {
        dest = args[idx];
        idx += 1;
    }
    let jump_mnemonic = args.get(idx).copied().unwrap_or("");

    let code = alu::alu_code(code_mnemonic).ok_or_else(|| AssembleError::UnknownAluCode {
        line: line_no,
        mnemonic: code_mnemonic.to_string(),
    })?;

    let dest_bits: u16 = (dest.contains('D') as u16) << 2
        | (dest.contains('A') as u16) << 1
        | (dest.contains('M') as u16);

    let jump_bits: u16 = if jump_mnemonic.is_empty() {
        0
    } else {
        alu::jump_code(jump_mnemonic).ok_or_else(|| AssembleError::UnknownJumpCode {
            line: line_no,
            mnemonic: jump_mnemonic.to_string(),
        })? as u16
    };

    Ok((code as u16) << 8 | dest_bits << 5 | jump_bits << 2 | 0b11)
}

fn is_dest_token(tok: &str) -> bool {
    !tok.is_empty() && tok.chars().all(|c| matches!(c, 'D' | 'A' | 'M'))
}

fn require_args(args: &[&str], expected: usize, line_no: usize) -> Result<(), AssembleError> {
    if args.len() != expected {
        return Err(AssembleError::Arity {
            line: line_no,
            message: format!("expected {} argument(s), got {}", expected, args.len()),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halt_only() {
        let words = assemble_to_words("HALT").unwrap();
        assert_eq!(words, vec![0b0000_0000_0000_0100]);
    }

    #[test]
    fn blank_lines_preserve_addresses() {
        let words = assemble_to_words("HALT\n\nHALT").unwrap();
        assert_eq!(words.len(), 3);
        assert_eq!(words[1], 0);
    }

    #[test]
    fn comments_are_stripped() {
        let words = assemble_to_words("HALT // stop here").unwrap();
        assert_eq!(words, vec![0b0000_0000_0000_0100]);
    }

    #[test]
    fn label_resolves_to_next_instruction_address() {
        let src = ".loop\nNOOP\nLDIA .loop";
        let words = assemble_to_words(src).unwrap();
        // .loop -> address 0 (the NOOP), LDIA emits imm=0
        assert_eq!(words[1] >> 2, 0);
    }

    #[test]
    fn register_shorthand_is_substituted() {
        let words = assemble_to_words("LDIA r3").unwrap();
        assert_eq!(words[0] >> 2, 3);
    }

    #[test]
    fn negative_ldia_immediate_is_biased() {
        let words = assemble_to_words("LDIA -1").unwrap();
        assert_eq!(words[0] >> 2, 0x3FFF); // 16384 - 1
    }

    #[test]
    fn comp_with_dest_and_jump() {
        let words = assemble_to_words("COMP D+A DM JGT").unwrap();
        let word = words[0];
        assert_eq!(word & 0b11, 0b11);
        assert_eq!((word >> 8) & 0xFF, 144); // D+A code
        assert_eq!((word >> 5) & 0b111, 0b101); // D and M
        assert_eq!((word >> 2) & 0b111, 4); // JGT
    }

    #[test]
    fn bufr_move_and_update() {
        assert_eq!(assemble_to_words("BUFR move").unwrap(), vec![0b0001_0001]);
        assert_eq!(assemble_to_words("BUFR update").unwrap(), vec![0b0000_0001]);
    }

    #[test]
    fn call_and_retn() {
        let words = assemble_to_words("CALL 5\nRETN").unwrap();
        assert_eq!(words[0], (5u16 << 4) | 0b1000);
        assert_eq!(words[1], 0b0000_0000_0000_1100);
    }

    #[test]
    fn unknown_mnemonic_errors() {
        let err = assemble_to_words("FROB 1").unwrap_err();
        assert!(matches!(err, AssembleError::UnknownMnemonic { .. }));
    }

    #[test]
    fn unbound_label_errors() {
        let err = assemble_to_words("LDIA .nowhere").unwrap_err();
        assert!(matches!(err, AssembleError::UnboundLabel { .. }));
    }

    #[test]
    fn unknown_alu_code_errors() {
        let err = assemble_to_words("COMP D%A").unwrap_err();
        assert!(matches!(err, AssembleError::UnknownAluCode { .. }));
    }

    #[test]
    fn text_output_is_sixteen_char_binary_strings() {
        let lines = assemble("HALT").unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), 16);
        assert!(lines[0].chars().all(|c| c == '0' || c == '1'));
    }
}
