#![cfg(test)]

use super::*;

#[test]
fn write_read_round_trip() {
    let path = std::env::temp_dir().join("xbin_write_read_round_trip.xbin");
    let words = vec![0b1000_0000_0000_0010u16, 0b0000_0000_0000_0100, 0];

    write_file(&path, &words).unwrap();
    let read_back = read_file(&path).unwrap();

    assert_eq!(words, read_back);
    std::fs::remove_file(&path).unwrap();
}

#[test]
fn render_produces_sixteen_char_binary_lines() {
    let text = render(&[0b0000_0000_0000_0100]);
    assert_eq!(text, "0000000000000100\n");
}

#[test]
fn parse_rejects_short_line() {
    let err = parse("0101\n").unwrap_err();
    assert_eq!(err.line, 1);
}

#[test]
fn parse_rejects_non_binary_character() {
    let err = parse("000000000000010x\n").unwrap_err();
    assert_eq!(err.line, 1);
}

#[test]
fn parse_skips_trailing_blank_line() {
    let words = parse("0000000000000100\n\n").unwrap();
    assert_eq!(words, vec![0b0000_0000_0000_0100]);
}
