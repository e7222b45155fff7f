//! AST → XAssembly code generation (spec §4.3), the largest stage of the
//! toolchain. Grounded on original_source's `xsharp_compiler.py`
//! `Compiler` class for the register/shadow-state model and the `+ - & |
//! ^` codegen shape; arrays, subroutines, `while`, `if`, shift and
//! multiply are this crate's own extension of that shape since the
//! retrieved original predates them.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use crate::ast::{ArrayLength, BinOp, Block, CompareOp, DataType, Expr, Stmt, StepOp, UnOp};
use crate::position::Span;

/// One of the 22 numeric codes in spec §4.3's error table.
#[derive(Clone, Debug)]
pub struct CompileError {
    pub code: u8,
    pub span: Span,
    pub message: String,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: error {}: {}", self.span, self.code, self.message)
    }
}

impl Error for CompileError {}

type CResult<T> = Result<T, CompileError>;

fn err(code: u8, span: &Span, message: impl Into<String>) -> CompileError {
    CompileError { code, span: span.clone(), message: message.into() }
}

#[derive(Clone, Debug)]
enum Symbol {
    Const(i16),
    Var(u16),
    Array { addr: u16, len: u16 },
    Subroutine { param_addrs: Vec<u16> },
    NativeSub { arity: usize },
}

/// Shadow state for the `A` register, used to elide redundant `LDIA`
/// (spec §9, "shadow-state tracking"). Invalidated (`Unknown`) at every
/// label, since control flow may enter a label with any value in `A`.
#[derive(Clone, PartialEq, Debug)]
enum AShadow {
    Unknown,
    Int(i16),
    Label(String),
}

/// Compiles a parsed program to XAssembly, matching `compile(ast,
/// removeTrailing?) -> (instructions[], error?)` of spec §4.3/§6.1.
pub fn compile(ast: &Block, strip_trailing_load_result: bool) -> CResult<Vec<String>> {
    let mut c = Compiler::new();
    c.register_native_subs();
    c.block(ast)?;

    if strip_trailing_load_result && c.instructions.last().map(String::as_str) == Some("COMP A D") {
        tracing::debug!("stripping trailing COMP A D per strip_trailing_load_result");
        c.instructions.pop();
    }

    c.epilogue();
    c.emit_deferred_subroutines()?;

    let mut instructions = c.instructions;
    peephole(&mut instructions);
    Ok(instructions)
}

struct Compiler {
    instructions: Vec<String>,
    symbols: HashMap<String, Symbol>,
    /// Last-known compile-time value per variable address, for constant
    /// propagation only (spec §3's `memory` field) — never authoritative.
    memory: HashMap<u16, i16>,
    available: Vec<u8>,
    next_var: u16,
    jumps: u32,
    a_reg: AShadow,
    depth: usize,
    any_plot: bool,
    any_move_call: bool,
    deferred_subs: Vec<(String, Vec<u16>, Block)>,
}

const NATIVE_SUBS: &[(&str, usize)] = &[("update", 0), ("flip", 0), ("halt", 0), ("plot", 3)];

impl Compiler {
    fn new() -> Compiler {
        Compiler {
            instructions: Vec::new(),
            symbols: HashMap::new(),
            memory: HashMap::new(),
            available: (0..16u8).rev().collect(),
            next_var: 16,
            jumps: 0,
            a_reg: AShadow::Unknown,
            depth: 0,
            any_plot: false,
            any_move_call: false,
            deferred_subs: Vec::new(),
        }
    }

    fn register_native_subs(&mut self) {
        for &(name, arity) in NATIVE_SUBS {
            self.symbols.insert(name.to_string(), Symbol::NativeSub { arity });
        }
        // Boolean literals (spec §6.2: true = -1, false = 0) ride the
        // same symbol table as `const`, since the lexer has no dedicated
        // token for them.
        self.symbols.insert("true".to_string(), Symbol::Const(-1));
        self.symbols.insert("false".to_string(), Symbol::Const(0));
    }

    fn next_jump(&mut self) -> u32 {
        self.jumps += 1;
        self.jumps
    }

    // --- emission -------------------------------------------------------

    fn emit(&mut self, line: impl Into<String>) {
        self.instructions.push(format!("{}{}", "\t".repeat(self.depth), line.into()));
    }

    fn emit_label(&mut self, label: &str) {
        self.instructions.push(label.to_string());
        self.a_reg = AShadow::Unknown;
    }

    fn emit_comp(&mut self, code: &str, dest: &str, jump: &str) {
        let mut line = format!("COMP {}", code);
        if !dest.is_empty() {
            line.push(' ');
            line.push_str(dest);
        }
        if !jump.is_empty() {
            line.push(' ');
            line.push_str(jump);
        }
        self.emit(line);
        if dest.contains('A') {
            self.a_reg = AShadow::Unknown;
        }
    }

    fn load_a_int(&mut self, value: i16) {
        if self.a_reg != AShadow::Int(value) {
            self.emit(format!("LDIA {}", value));
            self.a_reg = AShadow::Int(value);
        }
    }

    fn load_a_addr(&mut self, addr: u16) {
        self.load_a_int(addr as i16);
    }

    fn load_a_label(&mut self, label: &str) {
        if self.a_reg != AShadow::Label(label.to_string()) {
            self.emit(format!("LDIA {}", label));
            self.a_reg = AShadow::Label(label.to_string());
        }
    }

    /// `COMP k D` for the four known values, `LDIA k; COMP A D` otherwise
    /// (spec's "known-value optimization").
    fn emit_const_to_d(&mut self, value: i16) {
        if (-2..=1).contains(&value) {
            self.emit_comp(&value.to_string(), "D", "");
        } else {
            self.load_a_int(value);
            self.emit_comp("A", "D", "");
        }
    }

    fn store_d(&mut self, addr: u16) {
        self.load_a_addr(addr);
        self.emit_comp("D", "M", "");
    }

    fn load_d(&mut self, addr: u16) {
        self.load_a_addr(addr);
        self.emit_comp("M", "D", "");
    }

    /// Tests the current `D` value and jumps to `label` on `jump`.
    fn test_and_branch(&mut self, label: &str, jump: &str) {
        self.load_a_label(label);
        self.emit_comp("D", "", jump);
    }

    fn jump_to(&mut self, label: &str) {
        self.load_a_label(label);
        self.emit_comp("0", "", "JMP");
    }

    fn checkpoint(&self) -> (usize, AShadow) {
        (self.instructions.len(), self.a_reg.clone())
    }

    fn rollback(&mut self, cp: (usize, AShadow)) {
        self.instructions.truncate(cp.0);
        self.a_reg = cp.1;
    }

    // --- register allocation --------------------------------------------

    fn alloc_reg(&mut self, span: &Span) -> CResult<u8> {
        self.available.pop().ok_or_else(|| err(0, span, "Allocation limit exceeded"))
    }

    fn free_reg(&mut self, reg: u8) {
        self.available.push(reg);
    }

    fn store_d_to_reg(&mut self, reg: u8) {
        self.store_d(reg as u16);
    }

    fn load_reg_to_d(&mut self, reg: u8) {
        self.load_d(reg as u16);
    }

    fn alloc_var(&mut self, count: u16) -> u16 {
        let addr = self.next_var;
        self.next_var += count;
        addr
    }

    // --- blocks / statements ---------------------------------------------

    fn block(&mut self, block: &Block) -> CResult<()> {
        for stmt in &block.body {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> CResult<()> {
        match stmt {
            Stmt::ConstDef { name, value, span } => self.const_def(name, value, span),
            Stmt::VarDecl { name, data_type, length, value, span } => {
                self.var_decl(name, data_type, length, value, span)
            }
            Stmt::ForLoop { var, start, end, step, body, span } => {
                self.for_loop(var, start, end, step, body, span)
            }
            Stmt::CForLoop { var, start, end_op, end, step_op, step, body, span } => {
                self.c_for_loop(var, start, *end_op, end, *step_op, step, body, span)
            }
            Stmt::WhileLoop { condition, body, .. } => self.while_loop(condition, body),
            Stmt::IfStatement { cases, else_case, .. } => self.if_statement(cases, else_case),
            Stmt::SubroutineDef { name, parameters, body, span } => {
                self.subroutine_def(name, parameters, body, span)
            }
            Stmt::Expr(e) => {
                self.expr(e)?;
                Ok(())
            }
        }
    }

    fn check_redefinition(&self, name: &str, span: &Span) -> CResult<()> {
        match self.symbols.get(name) {
            Some(Symbol::Subroutine { .. }) | Some(Symbol::NativeSub { .. }) => {
                Err(err(10, span, format!("'{}' is already defined as a subroutine", name)))
            }
            Some(_) => Err(err(9, span, format!("'{}' is already defined", name))),
            None => Ok(()),
        }
    }

    fn const_def(&mut self, name: &str, value: &Expr, span: &Span) -> CResult<()> {
        self.check_redefinition(name, span)?;
        let cp = self.checkpoint();
        let folded = self.expr(value)?;
        let Some(v) = folded else {
            return Err(err(3, span, "const value must be a compile-time constant"));
        };
        // const definitions emit no code of their own; discard whatever
        // the (now-folded) evaluation produced.
        self.rollback(cp);
        self.symbols.insert(name.to_string(), Symbol::Const(v));
        Ok(())
    }

    fn resolve_array_length(&self, length: &ArrayLength, span: &Span) -> CResult<u16> {
        match length {
            ArrayLength::Literal(n) => Ok(*n),
            ArrayLength::Const(name) => match self.symbols.get(name) {
                Some(Symbol::Const(v)) if *v >= 0 => Ok(*v as u16),
                _ => Err(err(21, span, format!("'{}' is not a constant array length", name))),
            },
        }
    }

    fn var_decl(
        &mut self,
        name: &str,
        data_type: &DataType,
        length: &Option<ArrayLength>,
        value: &Option<Expr>,
        span: &Span,
    ) -> CResult<()> {
        self.check_redefinition(name, span)?;

        match data_type {
            DataType::Array => {
                let len = self.resolve_array_length(length.as_ref().unwrap(), span)?;
                let addr = self.alloc_var(len);
                if let Some(Expr::ArrayLiteral { elements, span: lit_span }) = value {
                    if elements.len() as u16 != len {
                        return Err(err(
                            11,
                            lit_span,
                            format!("array literal has {} elements, declared length is {}", elements.len(), len),
                        ));
                    }
                    for (i, el) in elements.iter().enumerate() {
                        let folded = self.expr(el)?;
                        self.store_d(addr + i as u16);
                        if let Some(v) = folded {
                            self.memory.insert(addr + i as u16, v);
                        }
                    }
                } else if let Some(other) = value {
                    return Err(err(1, other.span(), "array initializer must be an array literal"));
                }
                self.symbols.insert(name.to_string(), Symbol::Array { addr, len });
            }
            DataType::Int | DataType::Bool => {
                let addr = self.alloc_var(1);
                match value {
                    Some(e) => {
                        let folded = self.expr(e)?;
                        self.store_d(addr);
                        match folded {
                            Some(v) => {
                                self.memory.insert(addr, v);
                            }
                            None => {
                                self.memory.remove(&addr);
                            }
                        }
                    }
                    None => {
                        // Omitted scalar initializer: leave the cell at
                        // its natural zero, same as an array's slack.
                        self.memory.insert(addr, 0);
                    }
                }
                self.symbols.insert(name.to_string(), Symbol::Var(addr));
            }
        }
        Ok(())
    }

    fn var_addr(&self, name: &str) -> Option<u16> {
        match self.symbols.get(name) {
            Some(Symbol::Var(addr)) => Some(*addr),
            _ => None,
        }
    }

    fn for_loop(&mut self, var: &str, start: &Expr, end: &Expr, step: &Expr, body: &Block, span: &Span) -> CResult<()> {
        let addr = match self.symbols.get(var) {
            Some(Symbol::Var(addr)) => *addr,
            Some(_) => return Err(err(14, span, format!("'{}' is not a variable", var))),
            None => {
                let addr = self.alloc_var(1);
                self.symbols.insert(var.to_string(), Symbol::Var(addr));
                addr
            }
        };

        self.expr(start)?;
        self.store_d(addr);
        self.memory.remove(&addr);

        let label = format!(".for{}", self.next_jump());
        self.emit_label(&label);
        // The body re-enters here on every iteration, so any value known at
        // compile time from before the loop can no longer be trusted.
        self.memory.clear();
        self.depth += 1;
        self.block(body)?;
        self.depth -= 1;

        let step_cp = self.checkpoint();
        let step_value = self.expr(step)?;
        let step_sign = if let Some(v) = step_value {
            self.rollback(step_cp);
            self.emit_const_to_d(v);
            v
        } else {
            0
        };
        self.load_a_addr(addr);
        self.emit_comp("D+M", "M", "");

        let end_reg = self.alloc_reg(span)?;
        self.expr(end)?;
        self.store_d_to_reg(end_reg);
        self.load_d(addr);
        self.load_a_addr(end_reg as u16);
        self.emit_comp("M-D", "D", "");
        self.free_reg(end_reg);

        // §9 reads as JGT/JLT (exclusive of `end`), but the `end` bound is
        // inclusive (§8's sum-to-10 scenario only totals 55 if i=10 runs);
        // JGE/JLE is the only reading consistent with that.
        let jump = if step_sign < 0 { "JLE" } else { "JGE" };
        self.test_and_branch(&label, jump);
        self.memory.remove(&addr);
        Ok(())
    }

    fn c_for_loop(
        &mut self,
        var: &str,
        start: &Expr,
        end_op: CompareOp,
        end: &Expr,
        step_op: StepOp,
        step: &Expr,
        body: &Block,
        span: &Span,
    ) -> CResult<()> {
        let Some(addr) = self.var_addr(var) else {
            return Err(err(14, span, format!("'{}' is not a variable", var)));
        };

        self.expr(start)?;
        self.store_d(addr);
        self.memory.remove(&addr);

        let label = format!(".for{}", self.next_jump());
        self.emit_label(&label);
        // The body re-enters here on every iteration, so any value known at
        // compile time from before the loop can no longer be trusted.
        self.memory.clear();
        self.depth += 1;
        self.block(body)?;
        self.depth -= 1;

        self.expr(step)?;
        self.load_a_addr(addr);
        let step_code = match step_op {
            StepOp::Add => "D+M",
            StepOp::Sub => "M-D",
        };
        self.emit_comp(step_code, "M", "");

        let end_reg = self.alloc_reg(span)?;
        self.expr(end)?;
        self.store_d_to_reg(end_reg);
        self.load_d(addr);
        self.load_a_addr(end_reg as u16);
        self.emit_comp("M-D", "D", "");
        self.free_reg(end_reg);

        let jump = match end_op {
            CompareOp::Lt => "JLT",
            CompareOp::Le => "JLE",
            CompareOp::Gt => "JGT",
            CompareOp::Ge => "JGE",
        };
        self.test_and_branch(&label, jump);
        self.memory.remove(&addr);
        Ok(())
    }

    fn while_loop(&mut self, condition: &Expr, body: &Block) -> CResult<()> {
        let id = self.next_jump();
        let start = format!(".while{}", id);
        let end = format!(".endwhile{}", id);

        self.emit_label(&start);
        // The condition re-evaluates here on every iteration, so any value
        // known at compile time from before the loop can no longer be trusted.
        self.memory.clear();
        self.expr(condition)?;
        // §9's "while ... JLE" conflicts with comparisons folding true to
        // -1 (§3); JEQ matches the if-statement's own falsy test and is
        // the only reading consistent with -1 == true everywhere else.
        self.test_and_branch(&end, "JEQ");
        self.depth += 1;
        self.block(body)?;
        self.depth -= 1;
        self.jump_to(&start);
        self.emit_label(&end);
        Ok(())
    }

    fn if_statement(&mut self, cases: &[(Expr, Block)], else_case: &Option<Block>) -> CResult<()> {
        let id = self.next_jump();
        let endif = format!(".endif{}", id);
        let n = cases.len();
        // Every case's condition and body is reached only when none of the
        // earlier, mutually-exclusive cases in this chain ran -- restore
        // the pre-`if` known values before each one rather than trusting
        // whatever a sibling body folded.
        let pre_if_memory = self.memory.clone();

        for (i, (cond, body)) in cases.iter().enumerate() {
            let is_last = i + 1 == n && else_case.is_none();
            let skip_label = if is_last { endif.clone() } else { format!(".ifcase{}_{}", id, i + 1) };

            self.memory = pre_if_memory.clone();
            self.expr(cond)?;
            self.test_and_branch(&skip_label, "JEQ");
            self.depth += 1;
            self.block(body)?;
            self.depth -= 1;

            if !is_last {
                self.jump_to(&endif);
                self.emit_label(&skip_label);
            }
        }

        if let Some(body) = else_case {
            self.memory = pre_if_memory.clone();
            self.depth += 1;
            self.block(body)?;
            self.depth -= 1;
        }

        self.emit_label(&endif);
        // Every case's body may have taken a different path to get here, so
        // no value known at compile time before the branch still holds.
        self.memory.clear();
        Ok(())
    }

    fn subroutine_def(&mut self, name: &str, parameters: &[String], body: &Block, span: &Span) -> CResult<()> {
        if matches!(self.symbols.get(name), Some(Symbol::Subroutine { .. }) | Some(Symbol::NativeSub { .. })) {
            return Err(err(10, span, format!("subroutine '{}' is already defined", name)));
        } else if self.symbols.contains_key(name) {
            return Err(err(10, span, format!("'{}' is already defined", name)));
        }

        let param_addrs: Vec<u16> = parameters.iter().map(|_| self.alloc_var(1)).collect();
        for (p, addr) in parameters.iter().zip(&param_addrs) {
            self.symbols.insert(p.clone(), Symbol::Var(*addr));
        }

        let info_cell = self.alloc_var(1);
        self.emit_const_to_d(parameters.len() as i16);
        self.store_d(info_cell);

        self.symbols.insert(name.to_string(), Symbol::Subroutine { param_addrs: param_addrs.clone() });
        self.deferred_subs.push((name.to_string(), param_addrs, body.clone()));
        Ok(())
    }

    fn emit_deferred_subroutines(&mut self) -> CResult<()> {
        let subs = std::mem::take(&mut self.deferred_subs);
        for (name, _params, body) in subs {
            self.emit_label(&format!(".sub_{}", name));
            self.depth += 1;
            self.block(&body)?;
            self.depth -= 1;
            self.emit("RETN");
        }
        Ok(())
    }

    fn epilogue(&mut self) {
        if self.any_plot && !self.any_move_call {
            // Only `BUFR move` actually commits buffer to screen (spec
            // §4.5's decode table); `update` is inert, so the epilogue's
            // stated purpose of "ensure the final frame is visible" is
            // only satisfied by emitting `move` here.
            self.emit("BUFR move");
        }
        self.emit("HALT");
    }

    // --- expressions ------------------------------------------------------

    fn expr(&mut self, e: &Expr) -> CResult<Option<i16>> {
        match e {
            Expr::IntLiteral { value, .. } => {
                let v = *value as i16;
                self.emit_const_to_d(v);
                Ok(Some(v))
            }
            Expr::Identifier { name, span } => self.identifier(name, span),
            Expr::ArrayLiteral { span, .. } => Err(err(1, span, "array literal used outside a variable initializer")),
            Expr::ArrayAccess { array, index, span } => self.array_access(array, index, span),
            Expr::ArraySet { array, index, value, span } => self.array_set(array, index, value, span),
            Expr::BinaryOp { op, left, right, span } => self.binary_op(*op, left, right, span),
            Expr::UnaryOp { op, value, postfix, span } => {
                if *postfix {
                    self.postfix_incdec(*op, value, span)
                } else {
                    self.unary_op(*op, value, span)
                }
            }
            Expr::Assignment { target, value, span } => self.assignment(target, value, span),
            Expr::Call { name, args, span } => self.call(name, args, span),
        }
    }

    fn identifier(&mut self, name: &str, span: &Span) -> CResult<Option<i16>> {
        match self.symbols.get(name).cloned() {
            Some(Symbol::Const(v)) => {
                self.emit_const_to_d(v);
                Ok(Some(v))
            }
            Some(Symbol::Var(addr)) => {
                if let Some(&v) = self.memory.get(&addr) {
                    self.emit_const_to_d(v);
                    Ok(Some(v))
                } else {
                    self.load_d(addr);
                    Ok(None)
                }
            }
            Some(Symbol::Array { .. }) => Err(err(8, span, format!("'{}' is an array, not a value", name))),
            Some(Symbol::Subroutine { .. }) | Some(Symbol::NativeSub { .. }) => {
                Err(err(8, span, format!("'{}' is a subroutine, not a value", name)))
            }
            None => Err(err(8, span, format!("undefined symbol '{}'", name))),
        }
    }

    /// Computes `base + index` and leaves the *address value* (not the
    /// dereferenced cell) in `D`, so callers can stash it in a scratch
    /// register before computing anything that would clobber `A`.
    fn array_element_address_to_d(&mut self, base: u16, index: &Expr, span: &Span) -> CResult<()> {
        self.expr(index)?;
        let idx_reg = self.alloc_reg(span)?;
        self.store_d_to_reg(idx_reg);
        self.load_a_int(base as i16);
        self.emit_comp("A", "D", "");
        self.load_a_addr(idx_reg as u16);
        self.emit_comp("D+M", "A", "");
        self.emit_comp("A", "D", "");
        self.free_reg(idx_reg);
        Ok(())
    }

    fn array_symbol(&self, array: &Expr, span: &Span) -> CResult<(u16, u16)> {
        let Expr::Identifier { name, .. } = array else {
            return Err(err(15, span, "expected an array identifier"));
        };
        match self.symbols.get(name) {
            Some(Symbol::Array { addr, len }) => Ok((*addr, *len)),
            Some(_) => Err(err(15, span, format!("'{}' is not an array", name))),
            None => Err(err(15, span, format!("undefined array '{}'", name))),
        }
    }

    fn array_access(&mut self, array: &Expr, index: &Expr, span: &Span) -> CResult<Option<i16>> {
        let (base, len) = self.array_symbol(array, span)?;
        if let Expr::IntLiteral { value, .. } = index {
            if *value >= len {
                return Err(err(17, span, format!("index {} is out of bounds for array of length {}", value, len)));
            }
        }

        self.array_element_address_to_d(base, index, span)?;
        let addr_reg = self.alloc_reg(span)?;
        self.store_d_to_reg(addr_reg);
        self.load_a_addr(addr_reg as u16);
        self.emit_comp("M", "A", "");
        self.emit_comp("M", "D", "");
        self.free_reg(addr_reg);
        Ok(None)
    }

    fn array_set(&mut self, array: &Expr, index: &Expr, value: &Expr, span: &Span) -> CResult<Option<i16>> {
        let (base, len) = self.array_symbol(array, span)?;
        if let Expr::IntLiteral { value: n, .. } = index {
            if *n >= len {
                return Err(err(17, span, format!("index {} is out of bounds for array of length {}", n, len)));
            }
        }

        self.array_element_address_to_d(base, index, span)?;
        let addr_reg = self.alloc_reg(span)?;
        self.store_d_to_reg(addr_reg);
        self.expr(value)?;
        self.load_a_addr(addr_reg as u16);
        self.emit_comp("M", "A", "");
        self.emit_comp("D", "M", "");
        self.free_reg(addr_reg);
        Ok(None)
    }

    fn assignment(&mut self, target: &Expr, value: &Expr, span: &Span) -> CResult<Option<i16>> {
        let Expr::Identifier { name, .. } = target else {
            return Err(err(13, span, "assignment target must be a variable"));
        };
        match self.symbols.get(name).cloned() {
            Some(Symbol::Const(_)) => Err(err(12, span, format!("cannot assign to constant '{}'", name))),
            Some(Symbol::Var(addr)) => {
                let folded = self.expr(value)?;
                self.store_d(addr);
                match folded {
                    Some(v) => {
                        self.memory.insert(addr, v);
                    }
                    None => {
                        self.memory.remove(&addr);
                    }
                }
                Ok(folded)
            }
            Some(_) => Err(err(13, span, format!("'{}' is not an assignable variable", name))),
            None => Err(err(13, span, format!("undefined variable '{}'", name))),
        }
    }

    fn call(&mut self, name: &str, args: &[Expr], span: &Span) -> CResult<Option<i16>> {
        match self.symbols.get(name).cloned() {
            Some(Symbol::NativeSub { arity }) => self.call_native(name, args, arity, span),
            Some(Symbol::Subroutine { param_addrs }) => self.call_subroutine(name, args, &param_addrs, span),
            Some(_) => Err(err(18, span, format!("'{}' is not a subroutine", name))),
            None => Err(err(18, span, format!("undefined subroutine '{}'", name))),
        }
    }

    fn call_subroutine(&mut self, name: &str, args: &[Expr], param_addrs: &[u16], span: &Span) -> CResult<Option<i16>> {
        if args.len() != param_addrs.len() {
            return Err(err(
                19,
                span,
                format!("'{}' takes {} argument(s), {} given", name, param_addrs.len(), args.len()),
            ));
        }
        for (arg, &addr) in args.iter().zip(param_addrs) {
            self.expr(arg)?;
            self.store_d(addr);
        }
        self.emit(format!("CALL .sub_{}", name));
        // The callee may do anything to A; its shadow can't be trusted.
        self.a_reg = AShadow::Unknown;
        // The callee may write any global through the flat symbol table.
        self.memory.clear();
        Ok(None)
    }

    fn call_native(&mut self, name: &str, args: &[Expr], arity: usize, span: &Span) -> CResult<Option<i16>> {
        if args.len() != arity {
            return Err(err(19, span, format!("'{}' takes {} argument(s), {} given", name, arity, args.len())));
        }
        match name {
            "update" => self.emit("BUFR update"),
            "flip" => {
                self.emit("BUFR move");
                self.any_move_call = true;
            }
            "halt" => self.emit("HALT"),
            "plot" => self.plot(&args[0], &args[1], &args[2], span)?,
            other => return Err(err(18, span, format!("unknown native subroutine '{}'", other))),
        }
        Ok(None)
    }

    fn plot(&mut self, x: &Expr, y: &Expr, v: &Expr, span: &Span) -> CResult<()> {
        self.expr(x)?;
        self.store_d(2048);
        self.expr(y)?;
        self.store_d(2049);
        let Expr::IntLiteral { value, .. } = v else {
            return Err(err(20, span, "plot's third argument must be the literal 0 or 1"));
        };
        if *value != 0 && *value != 1 {
            return Err(err(20, span, "plot's third argument must be 0 or 1"));
        }
        self.emit(format!("PLOT {}", value));
        self.any_plot = true;
        Ok(())
    }

    fn postfix_incdec(&mut self, op: UnOp, value: &Expr, span: &Span) -> CResult<Option<i16>> {
        let Expr::Identifier { name, .. } = value else {
            return Err(err(13, span, "'++'/'--' target must be a variable"));
        };
        let Some(addr) = self.var_addr(name) else {
            return Err(err(13, span, format!("'{}' is not a variable", name)));
        };
        let code = match op {
            UnOp::Inc => "M++",
            UnOp::Dec => "M--",
            _ => unreachable!("postfix is only built for Inc/Dec"),
        };
        self.load_a_addr(addr);
        self.emit_comp(code, "DM", "");
        self.memory.remove(&addr);
        Ok(None)
    }

    fn address_of(&mut self, value: &Expr, span: &Span) -> CResult<Option<i16>> {
        let Expr::Identifier { name, .. } = value else {
            return Err(err(4, span, "'@' requires an identifier"));
        };
        match self.symbols.get(name).cloned() {
            Some(Symbol::Var(addr)) => {
                self.load_a_addr(addr);
                self.emit_comp("A", "D", "");
                Ok(None)
            }
            Some(Symbol::Array { addr, .. }) => {
                self.load_a_addr(addr);
                self.emit_comp("A", "D", "");
                Ok(None)
            }
            Some(_) => Err(err(6, span, format!("'{}' has no address", name))),
            None => Err(err(4, span, format!("undefined variable '{}'", name))),
        }
    }

    fn unary_op(&mut self, op: UnOp, value: &Expr, span: &Span) -> CResult<Option<i16>> {
        match op {
            UnOp::Pos => self.expr(value),
            UnOp::Addr => self.address_of(value, span),
            UnOp::Neg => self.unary_fold_or_emit(value, span, |v| wrap16(-(v as i32)), "COMP -D D"),
            UnOp::Not => self.unary_not(value, span),
            UnOp::Abs => self.unary_abs(value, span),
            UnOp::Sign => self.unary_sign(value, span),
            UnOp::Inc | UnOp::Dec => Err(err(5, span, "'++'/'--' must be postfix")),
        }
    }

    fn unary_fold_or_emit(
        &mut self,
        value: &Expr,
        _span: &Span,
        fold: impl Fn(i16) -> i16,
        instr: &str,
    ) -> CResult<Option<i16>> {
        let cp = self.checkpoint();
        match self.expr(value)? {
            Some(v) => {
                self.rollback(cp);
                let folded = fold(v);
                self.emit_const_to_d(folded);
                Ok(Some(folded))
            }
            None => {
                self.emit(instr);
                Ok(None)
            }
        }
    }

    fn unary_not(&mut self, value: &Expr, _span: &Span) -> CResult<Option<i16>> {
        let cp = self.checkpoint();
        match self.expr(value)? {
            Some(v) => {
                self.rollback(cp);
                let folded = !v;
                self.emit_const_to_d(folded);
                Ok(Some(folded))
            }
            None => {
                if !self.rewrite_last_as_inverted() {
                    self.emit("COMP !D D");
                }
                Ok(None)
            }
        }
    }

    /// `~` following a binary `&`/`|`/`^` can fold into the preceding
    /// `COMP` as `!(<op>)` instead of an extra instruction (spec §4.3).
    fn rewrite_last_as_inverted(&mut self) -> bool {
        const INVERTIBLE: &[(&str, &str)] =
            &[("D&A", "!(D&A)"), ("D&M", "!(D&M)"), ("D|A", "!(D|A)"), ("D|M", "!(D|M)"), ("D^A", "!(D^A)"), ("D^M", "!(D^M)")];

        let Some(last) = self.instructions.last() else { return false };
        let trimmed = last.trim_start();
        for &(plain, inverted) in INVERTIBLE {
            let needle = format!("COMP {} D", plain);
            if trimmed == needle {
                let indent = &last[..last.len() - trimmed.len()];
                let rewritten = format!("{}COMP {} D", indent, inverted);
                *self.instructions.last_mut().unwrap() = rewritten;
                return true;
            }
        }
        false
    }

    fn unary_abs(&mut self, value: &Expr, span: &Span) -> CResult<Option<i16>> {
        let cp = self.checkpoint();
        match self.expr(value)? {
            Some(v) => {
                self.rollback(cp);
                let folded = wrap16((v as i32).abs());
                self.emit_const_to_d(folded);
                Ok(Some(folded))
            }
            None => {
                let label = format!(".abs{}", self.next_jump());
                self.test_and_branch(&label, "JGE");
                self.emit("COMP -D D");
                self.emit_label(&label);
                let _ = span;
                Ok(None)
            }
        }
    }

    fn unary_sign(&mut self, value: &Expr, span: &Span) -> CResult<Option<i16>> {
        let cp = self.checkpoint();
        match self.expr(value)? {
            Some(v) => {
                self.rollback(cp);
                let folded: i16 = match v.cmp(&0) {
                    std::cmp::Ordering::Greater => 1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Less => -1,
                };
                self.emit_const_to_d(folded);
                Ok(Some(folded))
            }
            None => {
                let id = self.next_jump();
                let nonzero = format!(".signnz{}", id);
                let negative = format!(".signneg{}", id);
                let end = format!(".signend{}", id);

                self.test_and_branch(&nonzero, "JNE");
                self.emit_comp("0", "D", "");
                self.jump_to(&end);

                self.emit_label(&nonzero);
                self.test_and_branch(&negative, "JLT");
                self.emit_comp("1", "D", "");
                self.jump_to(&end);

                self.emit_label(&negative);
                self.emit_comp("-1", "D", "");

                self.emit_label(&end);
                let _ = span;
                Ok(None)
            }
        }
    }

    fn try_incdec_fastpath(&mut self, op: BinOp, left: &Expr, right: &Expr) -> CResult<Option<Option<i16>>> {
        let is_one = |e: &Expr| matches!(e, Expr::IntLiteral { value: 1, .. });
        let target = match op {
            BinOp::Add if is_one(right) => self.var_addr_of(left),
            BinOp::Add if is_one(left) => self.var_addr_of(right),
            BinOp::Sub if is_one(right) => self.var_addr_of(left),
            _ => None,
        };
        let Some(addr) = target else { return Ok(None) };
        let code = if matches!(op, BinOp::Sub) { "M--" } else { "M++" };
        self.load_a_addr(addr);
        self.emit_comp(code, "D", "");
        self.memory.remove(&addr);
        Ok(Some(None))
    }

    fn var_addr_of(&self, e: &Expr) -> Option<u16> {
        match e {
            Expr::Identifier { name, .. } => self.var_addr(name),
            _ => None,
        }
    }

    fn fold_binop(&self, op: BinOp, l: i16, r: i16, span: &Span) -> CResult<i16> {
        let a = l as i32;
        let b = r as i32;
        let v = match op {
            BinOp::Add => wrap16(a + b),
            BinOp::Sub => wrap16(a - b),
            BinOp::Mul => wrap16(a * b),
            BinOp::Div => {
                if b == 0 {
                    return Err(err(2, span, "division by zero in a constant expression"));
                }
                wrap16(a / b)
            }
            BinOp::And => wrap16(a & b),
            BinOp::Or => wrap16(a | b),
            BinOp::Xor => wrap16(a ^ b),
            BinOp::Shl => wrap16(a.wrapping_shl((b as u32) & 0xF)),
            BinOp::Shr => wrap16((l as i32).wrapping_shr((b as u32) & 0xF)),
            BinOp::Lt => bool16(l < r),
            BinOp::Le => bool16(l <= r),
            BinOp::Eq => bool16(l == r),
            BinOp::Ne => bool16(l != r),
            BinOp::Gt => bool16(l > r),
            BinOp::Ge => bool16(l >= r),
        };
        Ok(v)
    }

    fn binary_op(&mut self, op: BinOp, left: &Expr, right: &Expr, span: &Span) -> CResult<Option<i16>> {
        match op {
            BinOp::Lt | BinOp::Le | BinOp::Eq | BinOp::Ne | BinOp::Gt | BinOp::Ge => {
                return self.comparison(op, left, right, span)
            }
            BinOp::Shl | BinOp::Shr => return self.shift(op, left, right, span),
            BinOp::Mul => return self.multiply(left, right, span),
            BinOp::Div => return self.divide(left, right, span),
            _ => {}
        }

        if matches!(op, BinOp::Add | BinOp::Sub) {
            if let Some(result) = self.try_incdec_fastpath(op, left, right)? {
                return Ok(result);
            }
        }

        let start = self.checkpoint();
        let lval = self.expr(left)?;
        let reg1 = self.alloc_reg(span)?;
        self.store_d_to_reg(reg1);

        let rval = self.expr(right)?;
        let reg2 = self.alloc_reg(span)?;
        self.store_d_to_reg(reg2);

        if let (Some(l), Some(r)) = (lval, rval) {
            self.rollback(start);
            let folded = self.fold_binop(op, l, r, span)?;
            self.free_reg(reg1);
            self.free_reg(reg2);
            self.emit_const_to_d(folded);
            return Ok(Some(folded));
        }

        self.load_reg_to_d(reg1);
        self.load_a_addr(reg2 as u16);
        let code = match op {
            BinOp::Add => "D+M",
            BinOp::Sub => "D-M",
            BinOp::And => "D&M",
            BinOp::Or => "D|M",
            BinOp::Xor => "D^M",
            _ => unreachable!("handled above"),
        };
        self.emit_comp(code, "D", "");
        self.free_reg(reg1);
        self.free_reg(reg2);
        Ok(None)
    }

    fn comparison(&mut self, op: BinOp, left: &Expr, right: &Expr, span: &Span) -> CResult<Option<i16>> {
        let start = self.checkpoint();
        let lval = self.expr(left)?;
        let reg = self.alloc_reg(span)?;
        self.store_d_to_reg(reg);
        let rval = self.expr(right)?;

        if let (Some(l), Some(r)) = (lval, rval) {
            self.rollback(start);
            let folded = self.fold_binop(op, l, r, span)?;
            self.free_reg(reg);
            self.emit_const_to_d(folded);
            return Ok(Some(folded));
        }

        self.load_a_addr(reg as u16);
        self.emit_comp("M-D", "D", "");
        self.free_reg(reg);

        let id = self.next_jump();
        let true_label = format!(".true{}", id);
        let false_label = format!(".false{}", id);
        let jump = match op {
            BinOp::Lt => "JLT",
            BinOp::Le => "JLE",
            BinOp::Eq => "JEQ",
            BinOp::Ne => "JNE",
            BinOp::Gt => "JGT",
            BinOp::Ge => "JGE",
            _ => unreachable!("only comparison ops reach here"),
        };
        self.test_and_branch(&true_label, jump);
        self.emit_comp("0", "D", "");
        self.jump_to(&false_label);
        self.emit_label(&true_label);
        self.emit_comp("-1", "D", "");
        self.emit_label(&false_label);
        Ok(None)
    }

    /// `<<`/`>>`: 0 shortcuts to nothing, 1 to a single shift step, the
    /// general case to a countdown loop (spec §4.3).
    fn shift(&mut self, op: BinOp, left: &Expr, right: &Expr, span: &Span) -> CResult<Option<i16>> {
        let start = self.checkpoint();
        let lval = self.expr(left)?;
        let reg = self.alloc_reg(span)?;
        self.store_d_to_reg(reg);
        let rval = self.expr(right)?;

        if let (Some(l), Some(r)) = (lval, rval) {
            self.rollback(start);
            let folded = self.fold_binop(op, l, r, span)?;
            self.free_reg(reg);
            self.emit_const_to_d(folded);
            return Ok(Some(folded));
        }

        if let Some(n) = rval {
            self.emit_single_shift_step(op, reg, n);
            self.load_reg_to_d(reg);
            self.free_reg(reg);
            return Ok(None);
        }

        let count_reg = self.alloc_reg(span)?;
        self.store_d_to_reg(count_reg);

        let id = self.next_jump();
        let label = format!(".shift{}", id);
        let done = format!(".shiftdone{}", id);
        self.emit_label(&label);
        self.load_a_addr(count_reg as u16);
        self.emit_comp("M", "D", "");
        self.test_and_branch(&done, "JEQ");
        self.emit_single_shift_step(op, reg, 1);
        self.load_a_addr(count_reg as u16);
        self.emit_comp("M--", "M", "");
        self.jump_to(&label);
        self.emit_label(&done);

        self.load_reg_to_d(reg);
        self.free_reg(reg);
        self.free_reg(count_reg);
        Ok(None)
    }

    fn emit_single_shift_step(&mut self, op: BinOp, reg: u8, count: i16) {
        for _ in 0..count.max(0) {
            match op {
                BinOp::Shl => {
                    self.load_a_addr(reg as u16);
                    self.emit_comp("M", "D", "");
                    self.emit_comp("D+M", "M", "");
                }
                BinOp::Shr => {
                    self.load_a_addr(reg as u16);
                    self.emit_comp(">>M", "M", "");
                }
                _ => unreachable!("only shift ops reach here"),
            }
        }
    }

    /// Shift-and-add multiply, 16 iterations (spec §4.3).
    fn multiply(&mut self, left: &Expr, right: &Expr, span: &Span) -> CResult<Option<i16>> {
        let start = self.checkpoint();
        let lval = self.expr(left)?;
        let multiplier = self.alloc_reg(span)?;
        self.store_d_to_reg(multiplier);
        let rval = self.expr(right)?;
        let multiplicand = self.alloc_reg(span)?;
        self.store_d_to_reg(multiplicand);

        if let (Some(l), Some(r)) = (lval, rval) {
            self.rollback(start);
            let folded = self.fold_binop(BinOp::Mul, l, r, span)?;
            self.free_reg(multiplier);
            self.free_reg(multiplicand);
            self.emit_const_to_d(folded);
            return Ok(Some(folded));
        }

        let product = self.alloc_reg(span)?;
        self.emit_const_to_d(0);
        self.store_d_to_reg(product);

        let counter = self.alloc_reg(span)?;
        self.emit_const_to_d(15);
        self.store_d_to_reg(counter);

        let id = self.next_jump();
        let loop_label = format!(".mul{}", id);
        let skip_add = format!(".mulskip{}", id);

        self.emit_label(&loop_label);
        self.load_a_addr(multiplicand as u16);
        self.emit_comp("M", "D", "");
        self.load_a_int(1);
        self.emit_comp("D&A", "D", "");
        self.test_and_branch(&skip_add, "JEQ");

        self.load_a_addr(multiplier as u16);
        self.emit_comp("M", "D", "");
        self.load_a_addr(product as u16);
        self.emit_comp("D+M", "M", "");
        self.emit_label(&skip_add);

        self.load_a_addr(multiplier as u16);
        self.emit_comp("M", "D", "");
        self.emit_comp("D+M", "M", "");

        self.load_a_addr(multiplicand as u16);
        self.emit_comp(">>M", "M", "");

        self.load_a_addr(counter as u16);
        self.emit_comp("M--", "DM", "");
        self.test_and_branch(&loop_label, "JGE");

        self.load_reg_to_d(product);
        self.free_reg(multiplier);
        self.free_reg(multiplicand);
        self.free_reg(product);
        self.free_reg(counter);
        Ok(None)
    }

    /// spec.md describes `*` but is silent on `/`'s runtime codegen, and
    /// original_source never implements division either; this is this
    /// crate's own repeated-subtraction long division over absolute
    /// values, with the quotient's sign corrected afterward.
    fn divide(&mut self, left: &Expr, right: &Expr, span: &Span) -> CResult<Option<i16>> {
        let start = self.checkpoint();
        let lval = self.expr(left)?;
        let left_reg = self.alloc_reg(span)?;
        self.store_d_to_reg(left_reg);
        let rval = self.expr(right)?;
        let right_reg = self.alloc_reg(span)?;
        self.store_d_to_reg(right_reg);

        if let (Some(l), Some(r)) = (lval, rval) {
            self.rollback(start);
            let folded = self.fold_binop(BinOp::Div, l, r, span)?;
            self.free_reg(left_reg);
            self.free_reg(right_reg);
            self.emit_const_to_d(folded);
            return Ok(Some(folded));
        }

        let a = self.alloc_reg(span)?;
        let b = self.alloc_reg(span)?;
        self.load_reg_to_d(left_reg);
        self.store_d_to_reg(a);
        self.load_reg_to_d(right_reg);
        self.store_d_to_reg(b);
        self.abs_reg(a);
        self.abs_reg(b);

        let quotient = self.alloc_reg(span)?;
        self.emit_const_to_d(0);
        self.store_d_to_reg(quotient);

        let id = self.next_jump();
        let loop_label = format!(".div{}", id);
        let done_label = format!(".divdone{}", id);

        // Division by zero would otherwise subtract forever without ever
        // going negative; leave the quotient at its initialized 0 instead.
        self.load_reg_to_d(b);
        self.test_and_branch(&done_label, "JEQ");

        self.emit_label(&loop_label);
        self.load_reg_to_d(a);
        self.load_a_addr(b as u16);
        self.emit_comp("D-M", "D", "");
        self.test_and_branch(&done_label, "JLT");
        self.store_d_to_reg(a);
        self.load_a_addr(quotient as u16);
        self.emit_comp("M++", "M", "");
        self.jump_to(&loop_label);
        self.emit_label(&done_label);

        let sign_id = self.next_jump();
        let left_neg = format!(".divleftneg{}", sign_id);
        let negate = format!(".divnegate{}", sign_id);
        let sign_done = format!(".divsigndone{}", sign_id);

        self.load_reg_to_d(left_reg);
        self.test_and_branch(&left_neg, "JLT");
        self.load_reg_to_d(right_reg);
        self.test_and_branch(&negate, "JLT");
        self.jump_to(&sign_done);

        self.emit_label(&left_neg);
        self.load_reg_to_d(right_reg);
        self.test_and_branch(&sign_done, "JLT");

        self.emit_label(&negate);
        self.load_a_addr(quotient as u16);
        self.emit_comp("-M", "M", "");

        self.emit_label(&sign_done);

        self.load_reg_to_d(quotient);
        self.free_reg(left_reg);
        self.free_reg(right_reg);
        self.free_reg(a);
        self.free_reg(b);
        self.free_reg(quotient);
        Ok(None)
    }

    /// In-place absolute value of a scratch register.
    fn abs_reg(&mut self, reg: u8) {
        let label = format!(".absreg{}", self.next_jump());
        self.load_reg_to_d(reg);
        self.test_and_branch(&label, "JGE");
        self.emit("COMP -D D");
        self.store_d_to_reg(reg);
        self.emit_label(&label);
    }
}

fn wrap16(v: i32) -> i16 {
    let w = v.rem_euclid(65536);
    if w > 32767 {
        (w - 65536) as i16
    } else {
        w as i16
    }
}

fn bool16(b: bool) -> i16 {
    if b {
        -1
    } else {
        0
    }
}

/// Final pass (spec §4.3): drop a redundant consecutive `LDIA`, and
/// cancel a back-to-back `COMP -D D` / `COMP -D D` double negation.
/// Deliberately tiny: no data-flow analysis, so it stays idempotent.
fn peephole(instructions: &mut Vec<String>) {
    let mut out: Vec<String> = Vec::with_capacity(instructions.len());
    for line in instructions.drain(..) {
        let trimmed = line.trim_start();
        if trimmed.starts_with("LDIA ") {
            if let Some(prev) = out.last() {
                if prev.trim_start().starts_with("LDIA ") {
                    out.pop();
                }
            }
        }
        if trimmed == "COMP -D D" {
            if let Some(prev) = out.last() {
                if prev.trim_start() == "COMP -D D" {
                    out.pop();
                    continue;
                }
            }
        }
        out.push(line);
    }
    *instructions = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lex, parse};

    fn compile_source(src: &str) -> Vec<String> {
        let tokens = lex("test.xs", src, None, true).unwrap();
        let ast = parse(tokens).unwrap();
        compile(&ast, false).unwrap()
    }

    #[test]
    fn appends_exactly_one_halt() {
        let out = compile_source("var x: int = 1");
        assert_eq!(out.iter().filter(|l| l.trim() == "HALT").count(), 1);
        assert_eq!(out.last().map(String::as_str), Some("HALT"));
    }

    #[test]
    fn constant_folds_arithmetic() {
        let out = compile_source("include operations\nconst x 3 + 4 * 5");
        // Folds entirely at compile time; no runtime ALU chain for the sum.
        assert!(!out.iter().any(|l| l.contains("D+M") || l.contains("D+A")));
    }

    #[test]
    fn redefining_a_native_sub_is_an_error() {
        let tokens = crate::lex("t.xs", "sub update() {\n}\n", None, true).unwrap();
        let ast = crate::parse(tokens).unwrap();
        let err = compile(&ast, false).unwrap_err();
        assert_eq!(err.code, 10);
    }

    #[test]
    fn assignment_to_const_is_an_error() {
        let tokens = crate::lex("t.xs", "const x 5\nx = 6\n", None, true).unwrap();
        let ast = crate::parse(tokens).unwrap();
        let err = compile(&ast, false).unwrap_err();
        assert_eq!(err.code, 12);
    }

    #[test]
    fn undefined_symbol_is_an_error() {
        let tokens = crate::lex("t.xs", "var y: int = z\n", None, true).unwrap();
        let ast = crate::parse(tokens).unwrap();
        let err = compile(&ast, false).unwrap_err();
        assert_eq!(err.code, 8);
    }

    #[test]
    fn register_allocation_is_balanced() {
        // Each completed `+` frees its two operand registers; reading an
        // array element is never constant-folded, so chaining 40 of them
        // would exceed the 16 available scratch registers if a prior
        // operation leaked its allocation.
        let decls: String =
            (0..40).map(|i| format!("var x{}: int = arr[0] + {}\n", i, i)).collect();
        let chain: String = (1..40).map(|i| format!(" + x{}", i)).collect();
        let src = format!("var arr: int[1] = [0]\n{decls}var total: int = x0{chain}");
        compile_source(&src);
    }
}
