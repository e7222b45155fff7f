//! Character stream to token stream (spec §4.1).
//!
//! Mirrors the character-class dispatch of original_source's lexer
//! (`xsharp_lexer.py`'s big `if`/`elif` chain over `current_char`), extended
//! with the full operator set of §6.2 and the `include` preprocessing pass.

use std::error::Error;
use std::fmt;
use std::path::Path;
use std::rc::Rc;

use crate::position::{Position, Span};

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Keyword {
    Const,
    Var,
    For,
    Start,
    End,
    Step,
    While,
    If,
    Elseif,
    Else,
    Include,
    Sub,
}

impl Keyword {
    fn from_ident(s: &str) -> Option<Keyword> {
        Some(match s {
            "const" => Keyword::Const,
            "var" => Keyword::Var,
            "for" => Keyword::For,
            "start" => Keyword::Start,
            "end" => Keyword::End,
            "step" => Keyword::Step,
            "while" => Keyword::While,
            "if" => Keyword::If,
            "elseif" => Keyword::Elseif,
            "else" => Keyword::Else,
            "include" => Keyword::Include,
            "sub" => Keyword::Sub,
            _ => return None,
        })
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum TokenKind {
    Int(u16),
    Ident(String),
    Keyword(Keyword),
    Newline(char),
    Eof,
    Add,
    Sub,
    Inc,
    Dec,
    And,
    Or,
    Not,
    Xor,
    Shl,
    Shr,
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
    Assign,
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Colon,
    Comma,
    Hash,
    Dollar,
    At,
    Mul,
    Div,
}

#[derive(Clone, Debug)]
pub struct Token {
    pub span: Span,
    pub kind: TokenKind,
}

impl Token {
    fn new(span: Span, kind: TokenKind) -> Token {
        Token { span, kind }
    }
}

#[derive(Clone, Debug)]
pub enum LexError {
    UnexpectedCharacter(Span, char),
    UnknownLibrary(Span, String),
    IntegerOverflow(Span),
    UnterminatedComment(Span),
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LexError::UnexpectedCharacter(span, c) => {
                write!(f, "{}: unexpected character: '{}'", span, c)
            }
            LexError::UnknownLibrary(span, name) => {
                write!(f, "{}: unknown library: '{}'", span, name)
            }
            LexError::IntegerOverflow(span) => {
                write!(f, "{}: integer literal does not fit in 16 bits", span)
            }
            LexError::UnterminatedComment(span) => {
                write!(f, "{}: unterminated block comment", span)
            }
        }
    }
}

impl Error for LexError {}

/// Lexes `text`, honoring any leading `include` lines. `programs_dir` is
/// where `include NAME.xs` looks for `NAME.xs`; `running_from_bot` disables
/// file inclusion (only `include operations` is allowed) to keep untrusted
/// callers from reading the host's filesystem.
pub fn lex(
    filename: &str,
    text: &str,
    programs_dir: Option<&Path>,
    running_from_bot: bool,
) -> Result<Vec<Token>, LexError> {
    let (text, operations) = preprocess_includes(filename, text, programs_dir, running_from_bot)?;
    tracing::debug!(operations, "include preprocessing complete");
    Lexer::new(filename, &text, operations).lex()
}

/// Scans raw lines for `include NAME[, NAME...]`, expanding `.xs` names by
/// textual prepending and recognizing the built-in `operations` module.
fn preprocess_includes(
    filename: &str,
    text: &str,
    programs_dir: Option<&Path>,
    running_from_bot: bool,
) -> Result<(String, bool), LexError> {
    let mut operations = false;
    let mut prelude = String::new();
    let mut body = String::new();

    for (line_no, raw_line) in text.split_inclusive('\n').enumerate() {
        let line = raw_line.trim_end_matches(['\n', '\r']);
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("include ") {
            for raw_name in rest.split(',') {
                let name = raw_name.trim();
                let column = line.len() - line.trim_start().len() + rest.find(name).unwrap_or(0);
                let span = single_char_span(filename, text, line_no, column, name.chars().count());

                if name == "operations" {
                    operations = true;
                } else if let Some(base) = name.strip_suffix(".xs") {
                    if running_from_bot {
                        return Err(LexError::UnknownLibrary(span, name.to_string()));
                    }
                    let dir = programs_dir.ok_or_else(|| {
                        LexError::UnknownLibrary(span.clone(), name.to_string())
                    })?;
                    let included = std::fs::read_to_string(dir.join(format!("{}.xs", base)))
                        .map_err(|_| LexError::UnknownLibrary(span, name.to_string()))?;
                    prelude.push_str(&included);
                    prelude.push('\n');
                } else {
                    return Err(LexError::UnknownLibrary(span, name.to_string()));
                }
            }
            continue;
        }
        body.push_str(raw_line);
    }

    prelude.push_str(&body);
    Ok((prelude, operations))
}

fn single_char_span(filename: &str, text: &str, line: usize, column: usize, len: usize) -> Span {
    let filename: Rc<str> = Rc::from(filename);
    let source: Rc<str> = Rc::from(text);
    let start = Position { byte_index: 0, line, column, filename: filename.clone(), source: source.clone() };
    let end = Position { byte_index: 0, line, column: column + len, filename, source };
    Span::new(start, end)
}

struct Lexer {
    chars: Vec<char>,
    pos: Position,
    current: Option<char>,
    operations: bool,
}

impl Lexer {
    fn new(filename: &str, text: &str, operations: bool) -> Lexer {
        let filename: Rc<str> = Rc::from(filename);
        let source: Rc<str> = Rc::from(text);
        let chars: Vec<char> = text.chars().collect();
        let current = chars.first().copied();
        Lexer {
            chars,
            pos: Position::start(filename, source),
            current,
            operations,
        }
    }

    fn advance(&mut self) {
        self.pos.advance(self.current);
        self.current = self.chars.get(self.pos.byte_index).copied();
    }

    fn pos_copy(&self) -> Position {
        self.pos.clone()
    }

    fn lex(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();

        while let Some(c) = self.current {
            match c {
                ' ' | '\t' => self.advance(),
                '\n' | '\r' | ';' => {
                    let start = self.pos_copy();
                    self.advance();
                    tokens.push(Token::new(Span::new(start, self.pos_copy()), TokenKind::Newline(c)));
                }
                '&' => tokens.push(self.single(TokenKind::And)),
                '|' => tokens.push(self.single(TokenKind::Or)),
                '~' => tokens.push(self.single(TokenKind::Not)),
                '^' => tokens.push(self.single(TokenKind::Xor)),
                '(' => tokens.push(self.single(TokenKind::LParen)),
                ')' => tokens.push(self.single(TokenKind::RParen)),
                '{' => tokens.push(self.single(TokenKind::LBrace)),
                '}' => tokens.push(self.single(TokenKind::RBrace)),
                '[' => tokens.push(self.single(TokenKind::LBracket)),
                ']' => tokens.push(self.single(TokenKind::RBracket)),
                ':' => tokens.push(self.single(TokenKind::Colon)),
                ',' => tokens.push(self.single(TokenKind::Comma)),
                '#' => tokens.push(self.single(TokenKind::Hash)),
                '$' => tokens.push(self.single(TokenKind::Dollar)),
                '@' => tokens.push(self.single(TokenKind::At)),
                '+' => tokens.push(self.one_or_two('+', TokenKind::Add, TokenKind::Inc)),
                '-' => tokens.push(self.one_or_two('-', TokenKind::Sub, TokenKind::Dec)),
                '<' => {
                    let start = self.pos_copy();
                    self.advance();
                    let kind = match self.current {
                        Some('=') => {
                            self.advance();
                            TokenKind::Le
                        }
                        Some('<') => {
                            self.advance();
                            TokenKind::Shl
                        }
                        _ => TokenKind::Lt,
                    };
                    tokens.push(Token::new(Span::new(start, self.pos_copy()), kind));
                }
                '>' => {
                    let start = self.pos_copy();
                    self.advance();
                    let kind = match self.current {
                        Some('=') => {
                            self.advance();
                            TokenKind::Ge
                        }
                        Some('>') => {
                            self.advance();
                            TokenKind::Shr
                        }
                        _ => TokenKind::Gt,
                    };
                    tokens.push(Token::new(Span::new(start, self.pos_copy()), kind));
                }
                '=' => tokens.push(self.one_or_two('=', TokenKind::Assign, TokenKind::Eq)),
                '!' => {
                    let start = self.pos_copy();
                    self.advance();
                    if self.current != Some('=') {
                        return Err(LexError::UnexpectedCharacter(Span::new(start, self.pos_copy()), '!'));
                    }
                    self.advance();
                    tokens.push(Token::new(Span::new(start, self.pos_copy()), TokenKind::Ne));
                }
                '*' => {
                    let start = self.pos_copy();
                    if !self.operations {
                        self.advance();
                        return Err(LexError::UnexpectedCharacter(Span::new(start, self.pos_copy()), '*'));
                    }
                    tokens.push(self.single(TokenKind::Mul));
                }
                '/' => {
                    if let Some(tok) = self.slash_or_comment()? {
                        tokens.push(tok);
                    }
                }
                c if c.is_ascii_digit() => tokens.push(self.number()?),
                c if c.is_ascii_alphabetic() || c == '_' => tokens.push(self.ident()),
                other => {
                    let start = self.pos_copy();
                    self.advance();
                    return Err(LexError::UnexpectedCharacter(Span::new(start, self.pos_copy()), other));
                }
            }
        }

        let eof_pos = self.pos_copy();
        tokens.push(Token::new(Span::new(eof_pos.clone(), eof_pos), TokenKind::Eof));
        Ok(tokens)
    }

    fn single(&mut self, kind: TokenKind) -> Token {
        let start = self.pos_copy();
        self.advance();
        Token::new(Span::new(start, self.pos_copy()), kind)
    }

    fn one_or_two(&mut self, second: char, one: TokenKind, two: TokenKind) -> Token {
        let start = self.pos_copy();
        self.advance();
        let kind = if self.current == Some(second) {
            self.advance();
            two
        } else {
            one
        };
        Token::new(Span::new(start, self.pos_copy()), kind)
    }

    fn slash_or_comment(&mut self) -> Result<Option<Token>, LexError> {
        let start = self.pos_copy();
        self.advance();
        match self.current {
            Some('/') => {
                self.advance();
                while let Some(c) = self.current {
                    if c == '\n' || c == '\r' {
                        break;
                    }
                    self.advance();
                }
                Ok(None)
            }
            Some('*') => {
                self.advance();
                loop {
                    match self.current {
                        None => return Err(LexError::UnterminatedComment(Span::new(start, self.pos_copy()))),
                        Some('*') => {
                            self.advance();
                            if self.current == Some('/') {
                                self.advance();
                                return Ok(None);
                            }
                        }
                        Some(_) => self.advance(),
                    }
                }
            }
            _ if self.operations => Ok(Some(Token::new(Span::new(start.clone(), self.pos_copy()), TokenKind::Div))),
            _ => Err(LexError::UnexpectedCharacter(Span::new(start, self.pos_copy()), '/')),
        }
    }

    fn number(&mut self) -> Result<Token, LexError> {
        let start = self.pos_copy();
        let mut digits = String::new();
        while let Some(c) = self.current {
            if !c.is_ascii_digit() {
                break;
            }
            digits.push(c);
            self.advance();
        }
        let span = Span::new(start, self.pos_copy());
        let value: u32 = digits.parse().unwrap_or(u32::MAX);
        if value > u16::MAX as u32 {
            return Err(LexError::IntegerOverflow(span));
        }
        Ok(Token::new(span, TokenKind::Int(value as u16)))
    }

    fn ident(&mut self) -> Token {
        let start = self.pos_copy();
        let mut ident = String::new();
        while let Some(c) = self.current {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }
            ident.push(c);
            self.advance();
        }
        let span = Span::new(start, self.pos_copy());
        let kind = match Keyword::from_ident(&ident) {
            Some(kw) => TokenKind::Keyword(kw),
            None => TokenKind::Ident(ident),
        };
        Token::new(span, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(text: &str) -> Vec<TokenKind> {
        lex("<test>", text, None, false).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn whitespace_and_int() {
        assert_eq!(kinds("  42  "), vec![TokenKind::Int(42), TokenKind::Eof]);
    }

    #[test]
    fn increment_is_two_chars() {
        assert_eq!(kinds("++"), vec![TokenKind::Inc, TokenKind::Eof]);
        assert_eq!(kinds("+"), vec![TokenKind::Add, TokenKind::Eof]);
    }

    #[test]
    fn keyword_vs_identifier() {
        assert_eq!(kinds("var"), vec![TokenKind::Keyword(Keyword::Var), TokenKind::Eof]);
        assert_eq!(kinds("variable"), vec![TokenKind::Ident("variable".to_string()), TokenKind::Eof]);
    }

    #[test]
    fn line_comment_is_skipped() {
        assert_eq!(kinds("1 // two\n2"), vec![
            TokenKind::Int(1),
            TokenKind::Newline('\n'),
            TokenKind::Int(2),
            TokenKind::Eof,
        ]);
    }

    #[test]
    fn block_comment_is_skipped() {
        assert_eq!(kinds("1 /* skip\nme */ 2"), vec![TokenKind::Int(1), TokenKind::Int(2), TokenKind::Eof]);
    }

    #[test]
    fn unterminated_block_comment_errors() {
        let err = lex("<test>", "/* oops", None, false).unwrap_err();
        assert!(matches!(err, LexError::UnterminatedComment(_)));
    }

    #[test]
    fn mul_div_require_operations() {
        assert!(matches!(lex("<test>", "*", None, false), Err(LexError::UnexpectedCharacter(_, '*'))));
        assert_eq!(
            kinds("include operations\n3 * 4"),
            vec![TokenKind::Int(3), TokenKind::Mul, TokenKind::Int(4), TokenKind::Eof],
        );
    }

    #[test]
    fn bare_slash_is_division_only_when_operations_enabled() {
        assert!(matches!(lex("<test>", "6 / 2", None, false), Err(LexError::UnexpectedCharacter(_, '/'))));
        assert_eq!(
            kinds("include operations\n6 / 2"),
            vec![TokenKind::Int(6), TokenKind::Div, TokenKind::Int(2), TokenKind::Eof],
        );
    }

    #[test]
    fn bang_without_equals_errors() {
        let err = lex("<test>", "!1", None, false).unwrap_err();
        assert!(matches!(err, LexError::UnexpectedCharacter(_, '!')));
    }

    #[test]
    fn not_equal_is_recognized() {
        assert_eq!(kinds("1 != 2"), vec![TokenKind::Int(1), TokenKind::Ne, TokenKind::Int(2), TokenKind::Eof]);
    }

    #[test]
    fn include_operations_enables_mul_div() {
        let tokens = kinds("include operations\n3 * 4");
        assert!(tokens.contains(&TokenKind::Mul));
    }

    #[test]
    fn include_unknown_library_errors() {
        let err = lex("<test>", "include nonsense", None, false).unwrap_err();
        assert!(matches!(err, LexError::UnknownLibrary(_, name) if name == "nonsense"));
    }

    #[test]
    fn integer_overflow_errors() {
        let err = lex("<test>", "70000", None, false).unwrap_err();
        assert!(matches!(err, LexError::IntegerOverflow(_)));
    }
}
