//! Source locations: a single point (`Position`) and a range (`Span`)
//! attached to every token and AST node, per spec §3.

use std::fmt;
use std::rc::Rc;

/// A point in a source file. `byte_index` is into `source`, `line`/`column`
/// are 0-indexed during lexing and rendered 1-indexed by `Display`.
#[derive(Clone, Debug)]
pub struct Position {
    pub byte_index: usize,
    pub line: usize,
    pub column: usize,
    pub filename: Rc<str>,
    pub source: Rc<str>,
}

impl Position {
    pub fn start(filename: Rc<str>, source: Rc<str>) -> Position {
        Position { byte_index: 0, line: 0, column: 0, filename, source }
    }

    /// Advances past `current`, tracking the line/column reset on `\n`.
    pub fn advance(&mut self, current: Option<char>) {
        self.byte_index += 1;
        self.column += 1;
        if current == Some('\n') {
            self.line += 1;
            self.column = 0;
        }
    }
}

impl PartialEq for Position {
    fn eq(&self, other: &Position) -> bool {
        self.byte_index == other.byte_index && self.filename == other.filename
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}, line {}, column {}", self.filename, self.line + 1, self.column + 1)
    }
}

/// A half-open range between two `Position`s, attached to every token and
/// AST node so compile errors can point at their source.
#[derive(Clone, Debug, PartialEq)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn new(start: Position, end: Position) -> Span {
        Span { start, end }
    }

    pub fn to(&self, end: &Span) -> Span {
        Span { start: self.start.clone(), end: end.end.clone() }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.start)
    }
}
