//! The single-pass Pratt compiler.
//!
//! Parsing and bytecode emission are the same walk: there is no
//! intermediate syntax tree. Each statement or expression is parsed and
//! immediately turned into opcodes against the function currently being
//! compiled, which is why `states` is a stack rather than a single value —
//! compiling a nested `def` pushes a fresh [`FuncState`], compiles its body
//! against it, and pops it back into a `PushClosure` emitted into the
//! enclosing function.

use std::cell::RefCell;
use std::ptr::NonNull;

use pocket_runtime::{
    module_cell, GcBox, GcHeap, HeapObject, PkClosure, PkFunction, PkModule, PkString, ScriptBody,
    Value,
};

use crate::error::{CompileError, CompileOutcome};
use crate::import::ImportHost;
use crate::lexer::tokenize;
use crate::opcode::{patch_u16, Op};
use crate::token::{Token, TokenKind};

struct Local {
    name: String,
    scope_depth: i32,
    is_captured: bool,
}

/// `is_immediate`: the upvalue closes over a local slot of the immediately
/// enclosing function. Otherwise it closes over an upvalue one level
/// further out, found by recursing through `resolve_upvalue`.
struct UpvalueDesc {
    name: String,
    is_immediate: bool,
    index: u8,
}

struct LoopCtx {
    loop_start: usize,
    break_jumps: Vec<usize>,
    /// The first local slot this loop's own machinery (iteration vars,
    /// body-local declarations) introduced; `break`/`continue` close
    /// upvalues at-or-above this threshold before jumping.
    local_base: u8,
}

struct FuncState {
    name: String,
    arity: i32,
    locals: Vec<Local>,
    scope_depth: i32,
    upvalues: Vec<UpvalueDesc>,
    code: Vec<u8>,
    lines: Vec<u32>,
    loops: Vec<LoopCtx>,
}

impl FuncState {
    fn new(name: impl Into<String>, arity: i32) -> Self {
        FuncState {
            name: name.into(),
            arity,
            locals: Vec::new(),
            scope_depth: 0,
            upvalues: Vec::new(),
            code: Vec::new(),
            lines: Vec::new(),
            loops: Vec::new(),
        }
    }
}

/// Entry point: compiles `source` as a fresh module, recursing into any
/// `import`s through `host`. Always returns a module pointer, even on
/// failure, so the caller can still register it (and so a cyclic import
/// resolves to *something* rather than panicking).
pub fn compile_module(
    source: &str,
    module_name: &str,
    module_path: &str,
    gc: &mut GcHeap,
    host: &mut dyn ImportHost,
) -> (NonNull<GcBox>, CompileOutcome) {
    let module_ptr = gc.alloc(HeapObject::Module(RefCell::new(PkModule::new(
        module_name,
        module_path,
    ))));
    host.register_module(module_path, module_ptr);

    let tokens = match tokenize(source) {
        Ok(t) => t,
        Err(message) => {
            // An unterminated string or escape is the lexer's own "ran out
            // of input" signal — same REPL continuation contract as a
            // missing `end` caught further down in the parser.
            if message.contains("unterminated") {
                return (module_ptr, CompileOutcome::UnexpectedEof);
            }
            let err = CompileError {
                message,
                path: module_path.to_string(),
                line: 0,
            };
            return (module_ptr, CompileOutcome::CompileError(vec![err]));
        }
    };

    let mut compiler = Compiler {
        states: vec![FuncState::new("main", 0)],
        gc,
        module_ptr,
        path: module_path.to_string(),
        tokens,
        pos: 0,
        errors: Vec::new(),
        hit_unexpected_eof: false,
        host,
    };

    compiler.skip_newlines();
    while !compiler.at_eof() {
        compiler.statement();
        compiler.skip_newlines();
    }

    let main_state = compiler.states.pop().expect("main state never popped early");
    let mut code = main_state.code;
    let mut lines = main_state.lines;
    let last_line = lines.last().copied().unwrap_or(1);
    code.push(Op::PushNull as u8);
    lines.push(last_line);
    code.push(Op::Return as u8);
    lines.push(last_line);
    let script = ScriptBody {
        code,
        lines,
        stack_size: (main_state.locals.len() as u32).max(1),
        upvalue_count: 0,
    };
    let main_fn = compiler
        .gc
        .alloc(HeapObject::Function(PkFunction::new_script(
            module_name,
            0,
            module_ptr,
            script,
        )));
    let main_closure = compiler
        .gc
        .alloc(HeapObject::Closure(RefCell::new(PkClosure::new(
            main_fn,
            Vec::new(),
        ))));
    unsafe {
        module_cell(module_ptr).borrow_mut().body = Some(main_closure);
    }

    let errors = std::mem::take(&mut compiler.errors);
    let outcome = if errors.is_empty() {
        if compiler.hit_unexpected_eof {
            CompileOutcome::UnexpectedEof
        } else {
            CompileOutcome::Success
        }
    } else {
        CompileOutcome::CompileError(errors)
    };
    (module_ptr, outcome)
}

struct Compiler<'h> {
    states: Vec<FuncState>,
    gc: &'h mut GcHeap,
    module_ptr: NonNull<GcBox>,
    path: String,
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<CompileError>,
    /// Set when a construct ran out of tokens expecting more (a missing
    /// `end`, an unclosed `(`, …) rather than seeing something it didn't
    /// understand — the REPL's cue to buffer another line instead of
    /// reporting a real syntax error.
    hit_unexpected_eof: bool,
    host: &'h mut dyn ImportHost,
}

impl<'h> Compiler<'h> {
    // ---- token stream -----------------------------------------------

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn current_line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), TokenKind::Eof)
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.tokens[self.pos].kind.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn optional(&mut self, kind: TokenKind) {
        self.match_token(&kind);
    }

    fn expect(&mut self, kind: TokenKind) {
        if !self.match_token(&kind) {
            if self.at_eof() {
                self.hit_unexpected_eof = true;
            } else {
                self.error(format!("expected {:?}, found {:?}", kind, self.peek()));
            }
        }
    }

    fn expect_identifier(&mut self) -> String {
        match self.peek().clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                name
            }
            TokenKind::Eof => {
                self.hit_unexpected_eof = true;
                String::new()
            }
            other => {
                self.error(format!("expected identifier, found {:?}", other));
                String::new()
            }
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), TokenKind::Newline) {
            self.advance();
        }
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(CompileError {
            message: message.into(),
            path: self.path.clone(),
            line: self.current_line(),
        });
    }

    // ---- function-state plumbing --------------------------------------

    fn current(&self) -> &FuncState {
        self.states.last().expect("at least one function state")
    }

    fn current_mut(&mut self) -> &mut FuncState {
        self.states.last_mut().expect("at least one function state")
    }

    /// A name assigned for the first time becomes a module global only at
    /// true top level (outside any `def`) — matching the common scripting
    /// convention that `if`/`while`/`for` bodies don't introduce their own
    /// scope the way a function body does.
    fn is_global_scope(&self) -> bool {
        self.states.len() == 1
    }

    fn declare_local(&mut self, name: &str) -> u8 {
        let depth = self.current().scope_depth;
        let state = self.current_mut();
        let idx = state.locals.len();
        if idx > u8::MAX as usize {
            // Practical ceiling; real programs never approach it.
            self.error("too many locals in one function");
            return 0;
        }
        state.locals.push(Local {
            name: name.to_string(),
            scope_depth: depth,
            is_captured: false,
        });
        idx as u8
    }

    fn intern_name(&mut self, name: &str) -> u16 {
        unsafe { module_cell(self.module_ptr) }.borrow_mut().intern_name(name) as u16
    }

    fn add_constant(&mut self, value: Value) -> u16 {
        unsafe { module_cell(self.module_ptr) }.borrow_mut().add_constant(value) as u16
    }

    // ---- bytecode emission ---------------------------------------------

    fn code_len(&self) -> usize {
        self.current().code.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.current_line();
        let state = self.current_mut();
        state.code.push(byte);
        state.lines.push(line);
    }

    fn emit_op(&mut self, op: Op) -> usize {
        let at = self.code_len();
        self.emit_byte(op as u8);
        at
    }

    fn emit_u16(&mut self, value: u16) {
        self.emit_byte((value >> 8) as u8);
        self.emit_byte((value & 0xFF) as u8);
    }

    fn emit_u16_op(&mut self, op: Op, operand: u16) {
        self.emit_op(op);
        self.emit_u16(operand);
    }

    fn patch_u16_at(&mut self, at: usize, value: u16) {
        patch_u16(&mut self.current_mut().code, at, value);
    }

    /// Emits a forward jump with a placeholder operand; returns the operand
    /// position for `patch_jump`.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        let at = self.code_len();
        self.emit_u16(0xFFFF);
        at
    }

    /// Patches a forward jump to land at the current position. The offset
    /// is relative to the byte right after the jump's own operand, which is
    /// where the VM's `ip` sits right after reading it.
    fn patch_jump(&mut self, operand_at: usize) {
        let target = self.code_len();
        let offset = (target - (operand_at + 2)) as u16;
        self.patch_u16_at(operand_at, offset);
    }

    /// Emits a backward jump to `loop_start`.
    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Op::Loop);
        let operand_at = self.code_len();
        self.emit_u16(0);
        let after = self.code_len();
        let offset = (after - loop_start) as u16;
        self.patch_u16_at(operand_at, offset);
    }

    fn emit_push_local(&mut self, slot: u8) {
        const SHORT: [Op; 9] = [
            Op::PushLocal0,
            Op::PushLocal1,
            Op::PushLocal2,
            Op::PushLocal3,
            Op::PushLocal4,
            Op::PushLocal5,
            Op::PushLocal6,
            Op::PushLocal7,
            Op::PushLocal8,
        ];
        if (slot as usize) < SHORT.len() {
            self.emit_op(SHORT[slot as usize]);
        } else {
            self.emit_op(Op::PushLocal);
            self.emit_byte(slot);
        }
    }

    fn emit_store_local(&mut self, slot: u8) {
        self.emit_op(Op::StoreLocal);
        self.emit_byte(slot);
    }

    fn emit_close_upvalue(&mut self, threshold: u8) {
        self.emit_op(Op::CloseUpvalue);
        self.emit_byte(threshold);
    }

    // ---- name resolution -------------------------------------------------

    fn resolve_local(state: &FuncState, name: &str) -> Option<u8> {
        state
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(i, _)| i as u8)
    }

    fn resolve_upvalue(states: &mut [FuncState], level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }
        if let Some(pos) = states[level].upvalues.iter().position(|u| u.name == name) {
            return Some(pos as u8);
        }
        let parent = level - 1;
        if let Some(local_idx) = Self::resolve_local(&states[parent], name) {
            states[parent].locals[local_idx as usize].is_captured = true;
            let idx = states[level].upvalues.len() as u8;
            states[level].upvalues.push(UpvalueDesc {
                name: name.to_string(),
                is_immediate: true,
                index: local_idx,
            });
            return Some(idx);
        }
        if let Some(up_idx) = Self::resolve_upvalue(states, parent, name) {
            let idx = states[level].upvalues.len() as u8;
            states[level].upvalues.push(UpvalueDesc {
                name: name.to_string(),
                is_immediate: false,
                index: up_idx,
            });
            return Some(idx);
        }
        None
    }

    /// Pushes the current value of `name` onto the stack: local, then
    /// upvalue, then (deferred to run time) global-or-builtin.
    fn emit_load_name(&mut self, name: &str) {
        if name == "self" {
            self.emit_op(Op::PushSelf);
            return;
        }
        if let Some(slot) = Self::resolve_local(self.current(), name) {
            self.emit_push_local(slot);
            return;
        }
        let level = self.states.len() - 1;
        if let Some(up) = Self::resolve_upvalue(&mut self.states, level, name) {
            self.emit_op(Op::PushUpvalue);
            self.emit_byte(up);
            return;
        }
        let idx = self.intern_name(name);
        self.emit_u16_op(Op::PushGlobal, idx);
    }

    /// Stores the top of stack into `name`: local, then upvalue, then
    /// global; a name that resolves to neither a local nor an upvalue
    /// becomes a brand new local (inside a function) or a module global
    /// (at true top level), per the first-assignment declaration rule.
    fn emit_store_name(&mut self, name: &str) {
        if name == "self" {
            self.error("cannot assign to self");
            return;
        }
        if let Some(slot) = Self::resolve_local(self.current(), name) {
            self.emit_store_local(slot);
            return;
        }
        let level = self.states.len() - 1;
        if let Some(up) = Self::resolve_upvalue(&mut self.states, level, name) {
            self.emit_op(Op::StoreUpvalue);
            self.emit_byte(up);
            return;
        }
        if self.is_global_scope() {
            let idx = self.intern_name(name);
            self.emit_u16_op(Op::StoreGlobal, idx);
        } else {
            let slot = self.declare_local(name);
            self.emit_store_local(slot);
        }
    }

    // ---- statements --------------------------------------------------

    fn block_until(&mut self, terminators: &[TokenKind]) {
        loop {
            self.skip_newlines();
            if terminators.iter().any(|t| self.check(t)) {
                return;
            }
            if self.at_eof() {
                self.hit_unexpected_eof = true;
                return;
            }
            self.statement();
        }
    }

    fn statement(&mut self) {
        match self.peek().clone() {
            TokenKind::Def => self.function_def_statement(),
            TokenKind::Class => self.class_def_statement(),
            TokenKind::If => self.if_statement(),
            TokenKind::While => self.while_statement(),
            TokenKind::For => self.for_statement(),
            TokenKind::Break => self.break_statement(),
            TokenKind::Continue => self.continue_statement(),
            TokenKind::Return => self.return_statement(),
            TokenKind::Import => self.import_statement(),
            _ => self.expression_or_assignment_statement(),
        }
    }

    fn looks_like_assignment(&self) -> bool {
        let mut i = self.pos;
        if !matches!(
            self.tokens.get(i).map(|t| &t.kind),
            Some(TokenKind::Identifier(_)) | Some(TokenKind::SelfKw)
        ) {
            return false;
        }
        i += 1;
        loop {
            match self.tokens.get(i).map(|t| &t.kind) {
                Some(TokenKind::Dot) => {
                    i += 1;
                    if !matches!(self.tokens.get(i).map(|t| &t.kind), Some(TokenKind::Identifier(_))) {
                        return false;
                    }
                    i += 1;
                }
                Some(TokenKind::LBracket) => {
                    i += 1;
                    let mut depth = 1i32;
                    while depth > 0 {
                        match self.tokens.get(i).map(|t| &t.kind) {
                            Some(TokenKind::LBracket) => depth += 1,
                            Some(TokenKind::RBracket) => depth -= 1,
                            Some(TokenKind::Eof) | None => return false,
                            _ => {}
                        }
                        i += 1;
                    }
                }
                _ => break,
            }
        }
        matches!(self.tokens.get(i).map(|t| &t.kind), Some(TokenKind::Eq))
    }

    fn expression_or_assignment_statement(&mut self) {
        if self.looks_like_assignment() {
            self.compile_assignment();
        } else {
            self.expression();
            self.emit_op(Op::Pop);
        }
    }

    fn compile_assignment(&mut self) {
        let name = match self.peek().clone() {
            TokenKind::Identifier(n) => {
                self.advance();
                n
            }
            TokenKind::SelfKw => {
                self.advance();
                self.error("cannot assign to self");
                return;
            }
            _ => unreachable!("looks_like_assignment already checked this"),
        };

        if matches!(self.peek(), TokenKind::Dot | TokenKind::LBracket) {
            self.emit_load_name(&name);
            loop {
                match self.peek().clone() {
                    TokenKind::Dot => {
                        self.advance();
                        let attr = self.expect_identifier();
                        if self.match_token(&TokenKind::Eq) {
                            self.expression();
                            let idx = self.intern_name(&attr);
                            self.emit_u16_op(Op::SetAttrib, idx);
                            return;
                        }
                        let idx = self.intern_name(&attr);
                        self.emit_u16_op(Op::GetAttrib, idx);
                    }
                    TokenKind::LBracket => {
                        self.advance();
                        self.expression();
                        self.expect(TokenKind::RBracket);
                        if self.match_token(&TokenKind::Eq) {
                            self.expression();
                            self.emit_op(Op::SetSubscript);
                            return;
                        }
                        self.emit_op(Op::GetSubscript);
                    }
                    _ => {
                        // A bare navigated value used as a statement; drop it.
                        self.emit_op(Op::Pop);
                        return;
                    }
                }
            }
        } else {
            self.expect(TokenKind::Eq);
            self.expression();
            self.emit_store_name(&name);
        }
    }

    fn if_statement(&mut self) {
        self.advance(); // 'if'
        let mut end_jumps = Vec::new();
        loop {
            self.expression();
            self.optional(TokenKind::Then);
            let else_jump = self.emit_jump(Op::JumpIfNot);
            self.skip_newlines();
            self.block_until(&[TokenKind::Elif, TokenKind::Else, TokenKind::End]);
            end_jumps.push(self.emit_jump(Op::Jump));
            self.patch_jump(else_jump);
            match self.peek().clone() {
                TokenKind::Elif => {
                    self.advance();
                    continue;
                }
                TokenKind::Else => {
                    self.advance();
                    self.skip_newlines();
                    self.block_until(&[TokenKind::End]);
                    break;
                }
                TokenKind::End => break,
                TokenKind::Eof => {
                    self.hit_unexpected_eof = true;
                    break;
                }
                _ => {
                    self.error("expected 'elif', 'else', or 'end'");
                    break;
                }
            }
        }
        self.expect(TokenKind::End);
        for j in end_jumps {
            self.patch_jump(j);
        }
    }

    fn while_statement(&mut self) {
        self.advance(); // 'while'
        let loop_start = self.code_len();
        self.expression();
        self.optional(TokenKind::Do);
        let exit_jump = self.emit_jump(Op::JumpIfNot);
        let local_base = self.current().locals.len() as u8;
        self.current_mut().loops.push(LoopCtx {
            loop_start,
            break_jumps: Vec::new(),
            local_base,
        });
        self.skip_newlines();
        self.block_until(&[TokenKind::End]);
        self.expect(TokenKind::End);
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        let loop_ctx = self.current_mut().loops.pop().expect("loop just pushed");
        for bj in loop_ctx.break_jumps {
            self.patch_jump(bj);
        }
        self.emit_close_upvalue(loop_ctx.local_base);
    }

    fn for_statement(&mut self) {
        self.advance(); // 'for'
        let var_name = self.expect_identifier();
        self.expect(TokenKind::In);

        let seq_slot = self.declare_local("$seq");
        self.expression();
        self.emit_store_local(seq_slot);

        let iter_slot = self.declare_local("$iter");
        self.emit_op(Op::PushZero);
        self.emit_store_local(iter_slot);

        let value_slot = self.declare_local(&var_name);
        self.emit_op(Op::PushNull);
        self.emit_store_local(value_slot);

        self.optional(TokenKind::Do);
        self.emit_op(Op::IterTest);
        self.emit_byte(seq_slot);

        let loop_start = self.code_len();
        self.current_mut().loops.push(LoopCtx {
            loop_start,
            break_jumps: Vec::new(),
            local_base: seq_slot,
        });

        self.emit_op(Op::Iter);
        self.emit_byte(seq_slot);
        self.emit_byte(iter_slot);
        self.emit_byte(value_slot);
        let exit_operand_at = self.code_len();
        self.emit_u16(0xFFFF);

        self.skip_newlines();
        self.block_until(&[TokenKind::End]);
        self.expect(TokenKind::End);
        self.emit_loop(loop_start);

        self.patch_jump(exit_operand_at);
        let loop_ctx = self.current_mut().loops.pop().expect("loop just pushed");
        for bj in loop_ctx.break_jumps {
            self.patch_jump(bj);
        }
        self.emit_close_upvalue(loop_ctx.local_base);
    }

    fn break_statement(&mut self) {
        self.advance();
        if self.current().loops.last().is_none() {
            self.error("'break' outside a loop");
            return;
        };
        // The landing pad all break jumps share already closes upvalues at
        // the loop's threshold, so there's no need to do it here too.
        let jump = self.emit_jump(Op::Jump);
        self.current_mut().loops.last_mut().unwrap().break_jumps.push(jump);
    }

    fn continue_statement(&mut self) {
        self.advance();
        let Some(loop_ctx) = self.current().loops.last() else {
            self.error("'continue' outside a loop");
            return;
        };
        let threshold = loop_ctx.local_base;
        let loop_start = loop_ctx.loop_start;
        self.emit_close_upvalue(threshold);
        self.emit_loop(loop_start);
    }

    fn return_statement(&mut self) {
        self.advance();
        if matches!(self.peek(), TokenKind::Newline | TokenKind::End | TokenKind::Eof) {
            self.emit_op(Op::PushNull);
        } else {
            let call_site = self.code_len();
            self.expression();
            // Tail-call rewrite: if the expression we just compiled is
            // exactly a direct call, the last thing emitted is a `Call`
            // opcode immediately followed by its one-byte argc operand —
            // rewrite it to `TailCall` in place (same operand shape).
            let state = self.current_mut();
            if state.code.len() >= call_site + 2 {
                let op_at = state.code.len() - 2;
                if state.code[op_at] == Op::Call as u8 {
                    state.code[op_at] = Op::TailCall as u8;
                }
            }
        }
        self.emit_op(Op::Return);
    }

    fn import_statement(&mut self) {
        self.advance();
        let target = match self.peek().clone() {
            TokenKind::Str(bytes) => {
                self.advance();
                String::from_utf8_lossy(&bytes).into_owned()
            }
            TokenKind::Identifier(name) => {
                self.advance();
                name
            }
            other => {
                self.error(format!("expected a module path after 'import', found {:?}", other));
                return;
            }
        };

        let Some(canonical) = self.host.resolve_path(&self.path, &target) else {
            self.error(format!("cannot resolve import '{}'", target));
            return;
        };
        if self.host.cached_module(&canonical).is_none() {
            let Some(source) = self.host.load_script(&canonical) else {
                self.error(format!("cannot read import '{}'", target));
                return;
            };
            let (_imported_ptr, outcome) =
                compile_module(&source, &target, &canonical, &mut *self.gc, &mut *self.host);
            if let CompileOutcome::CompileError(errs) = outcome {
                self.errors.extend(errs);
            }
        }

        let idx = self.intern_name(&target);
        self.emit_u16_op(Op::Import, idx);
        self.emit_store_name(&target);
    }

    fn function_def_statement(&mut self) {
        self.advance(); // 'def'
        let name = self.expect_identifier();
        self.compile_function(name, false);
    }

    /// Compiles a `def ... end` block (top-level function or method) into a
    /// fresh `FuncState`, then emits `PushClosure` for it into the
    /// *enclosing* function and binds the result to `name`. `is_method`
    /// only affects whether the binding step is skipped — class bodies
    /// bind methods with `BindMethod` instead of a name store.
    fn compile_function(&mut self, name: String, is_method: bool) -> u16 {
        self.expect(TokenKind::LParen);
        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                params.push(self.expect_identifier());
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen);
        self.skip_newlines();

        let arity = params.len() as i32;

        let declared_slot = if !is_method && !self.is_global_scope() {
            Some(self.declare_local(&name))
        } else {
            None
        };

        self.states.push(FuncState::new(&name, arity));
        for p in &params {
            self.declare_local(p);
        }
        self.block_until(&[TokenKind::End]);
        self.expect(TokenKind::End);

        let state = self.states.pop().expect("function state just pushed");
        let upvalue_count = state.upvalues.len() as u8;
        let mut code = state.code;
        let mut lines = state.lines;
        let last_line = lines.last().copied().unwrap_or(self.current_line());
        code.push(Op::PushNull as u8);
        lines.push(last_line);
        code.push(Op::Return as u8);
        lines.push(last_line);

        let script = ScriptBody {
            code,
            lines,
            stack_size: (state.locals.len() as u32).max(1),
            upvalue_count,
        };
        let fn_ptr = self.gc.alloc(HeapObject::Function(PkFunction::new_script(
            name.clone(),
            arity,
            self.module_ptr,
            script,
        )));
        let const_idx = self.add_constant(Value::object(fn_ptr));

        self.emit_u16_op(Op::PushClosure, const_idx);
        self.emit_byte(upvalue_count);
        for up in &state.upvalues {
            self.emit_byte(if up.is_immediate { 1 } else { 0 });
            self.emit_byte(up.index);
        }

        if !is_method {
            if let Some(slot) = declared_slot {
                self.emit_store_local(slot);
            } else {
                let idx = self.intern_name(&name);
                self.emit_u16_op(Op::StoreGlobal, idx);
            }
        }

        const_idx
    }

    fn class_def_statement(&mut self) {
        self.advance(); // 'class'
        let name = self.expect_identifier();

        if self.match_token(&TokenKind::Colon) {
            self.expression();
        } else {
            self.emit_op(Op::PushNull);
        }
        let name_idx = self.intern_name(&name);
        self.emit_u16_op(Op::CreateClass, name_idx);

        self.skip_newlines();
        loop {
            self.skip_newlines();
            match self.peek().clone() {
                TokenKind::End => break,
                TokenKind::Def => {
                    self.advance();
                    let method_name = self.expect_identifier();
                    self.compile_function(method_name.clone(), true);
                    let method_idx = self.intern_name(&method_name);
                    self.emit_u16_op(Op::BindMethod, method_idx);
                }
                TokenKind::Eof => {
                    self.hit_unexpected_eof = true;
                    break;
                }
                _ => {
                    self.error("expected a method definition or 'end' inside class body");
                    break;
                }
            }
        }
        self.expect(TokenKind::End);

        if self.is_global_scope() {
            let idx = self.intern_name(&name);
            self.emit_u16_op(Op::StoreGlobal, idx);
        } else {
            let slot = self.declare_local(&name);
            self.emit_store_local(slot);
        }
    }

    // ---- expressions (precedence climbing) ----------------------------

    fn expression(&mut self) {
        self.parse_or();
    }

    fn parse_or(&mut self) {
        self.parse_and();
        while self.match_token(&TokenKind::Or) {
            let jump = self.emit_jump(Op::Or);
            self.parse_and();
            self.patch_jump(jump);
        }
    }

    fn parse_and(&mut self) {
        self.parse_equality();
        while self.match_token(&TokenKind::And) {
            let jump = self.emit_jump(Op::And);
            self.parse_equality();
            self.patch_jump(jump);
        }
    }

    fn parse_equality(&mut self) {
        self.parse_comparison();
        loop {
            if self.match_token(&TokenKind::EqEq) {
                self.parse_comparison();
                self.emit_op(Op::EqEq);
            } else if self.match_token(&TokenKind::NotEq) {
                self.parse_comparison();
                self.emit_op(Op::NotEq);
            } else {
                break;
            }
        }
    }

    fn parse_comparison(&mut self) {
        self.parse_range();
        loop {
            if self.match_token(&TokenKind::Lt) {
                self.parse_range();
                self.emit_op(Op::Lt);
            } else if self.match_token(&TokenKind::LtEq) {
                self.parse_range();
                self.emit_op(Op::LtEq);
            } else if self.match_token(&TokenKind::Gt) {
                self.parse_range();
                self.emit_op(Op::Gt);
            } else if self.match_token(&TokenKind::GtEq) {
                self.parse_range();
                self.emit_op(Op::GtEq);
            } else if self.match_token(&TokenKind::In) {
                self.parse_range();
                self.emit_op(Op::In);
            } else if self.match_token(&TokenKind::Is) {
                self.parse_range();
                self.emit_op(Op::Is);
            } else {
                break;
            }
        }
    }

    fn parse_range(&mut self) {
        self.parse_bitor();
        if self.match_token(&TokenKind::DotDot) {
            self.parse_bitor();
            self.emit_op(Op::RangeExcl);
        } else if self.match_token(&TokenKind::DotDotDot) {
            self.parse_bitor();
            self.emit_op(Op::RangeIncl);
        }
    }

    fn parse_bitor(&mut self) {
        self.parse_bitxor();
        while self.match_token(&TokenKind::Pipe) {
            self.parse_bitxor();
            self.emit_op(Op::BitOr);
        }
    }

    fn parse_bitxor(&mut self) {
        self.parse_bitand();
        while self.match_token(&TokenKind::Caret) {
            self.parse_bitand();
            self.emit_op(Op::BitXor);
        }
    }

    fn parse_bitand(&mut self) {
        self.parse_shift();
        while self.match_token(&TokenKind::Amp) {
            self.parse_shift();
            self.emit_op(Op::BitAnd);
        }
    }

    fn parse_shift(&mut self) {
        self.parse_term();
        loop {
            if self.match_token(&TokenKind::LShift) {
                self.parse_term();
                self.emit_op(Op::BitLshift);
            } else if self.match_token(&TokenKind::RShift) {
                self.parse_term();
                self.emit_op(Op::BitRshift);
            } else {
                break;
            }
        }
    }

    fn parse_term(&mut self) {
        self.parse_factor();
        loop {
            if self.match_token(&TokenKind::Plus) {
                self.parse_factor();
                self.emit_op(Op::Add);
            } else if self.match_token(&TokenKind::Minus) {
                self.parse_factor();
                self.emit_op(Op::Sub);
            } else {
                break;
            }
        }
    }

    fn parse_factor(&mut self) {
        self.parse_unary();
        loop {
            if self.match_token(&TokenKind::Star) {
                self.parse_unary();
                self.emit_op(Op::Mul);
            } else if self.match_token(&TokenKind::Slash) {
                self.parse_unary();
                self.emit_op(Op::Div);
            } else if self.match_token(&TokenKind::Percent) {
                self.parse_unary();
                self.emit_op(Op::Mod);
            } else {
                break;
            }
        }
    }

    fn parse_unary(&mut self) {
        if self.match_token(&TokenKind::Not) {
            self.parse_unary();
            self.emit_op(Op::Not);
        } else if self.match_token(&TokenKind::Minus) {
            self.parse_unary();
            self.emit_op(Op::Negate);
        } else if self.match_token(&TokenKind::Tilde) {
            self.parse_unary();
            self.emit_op(Op::BitNot);
        } else {
            self.parse_postfix();
        }
    }

    fn parse_postfix(&mut self) {
        self.parse_primary();
        loop {
            match self.peek().clone() {
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_identifier();
                    if self.match_token(&TokenKind::LParen) {
                        let argc = self.parse_call_args();
                        let name_idx = self.intern_name(&name);
                        self.emit_op(Op::MethodCall);
                        self.emit_byte(argc);
                        self.emit_u16(name_idx);
                    } else {
                        let idx = self.intern_name(&name);
                        self.emit_u16_op(Op::GetAttrib, idx);
                    }
                }
                TokenKind::LBracket => {
                    self.advance();
                    self.expression();
                    self.expect(TokenKind::RBracket);
                    self.emit_op(Op::GetSubscript);
                }
                TokenKind::LParen => {
                    self.advance();
                    let argc = self.parse_call_args();
                    self.emit_op(Op::Call);
                    self.emit_byte(argc);
                }
                _ => break,
            }
        }
    }

    /// Parses a parenthesized, comma-separated argument list (the `(` is
    /// already consumed) and returns the argument count.
    fn parse_call_args(&mut self) -> u8 {
        let mut argc: u8 = 0;
        self.skip_newlines();
        if !self.check(&TokenKind::RParen) {
            loop {
                self.expression();
                argc = argc.saturating_add(1);
                self.skip_newlines();
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
            }
        }
        self.expect(TokenKind::RParen);
        argc
    }

    fn parse_primary(&mut self) {
        match self.peek().clone() {
            TokenKind::Int(n) => {
                self.advance();
                if n == 0 {
                    self.emit_op(Op::PushZero);
                } else {
                    let idx = self.add_constant(Value::int(n));
                    self.emit_u16_op(Op::Const, idx);
                }
            }
            TokenKind::Float(f) => {
                self.advance();
                let idx = self.add_constant(Value::float(f));
                self.emit_u16_op(Op::Const, idx);
            }
            TokenKind::Str(bytes) => {
                self.advance();
                let ptr = self
                    .gc
                    .alloc(HeapObject::String(PkString::new(bytes.into_boxed_slice())));
                let idx = self.add_constant(Value::object(ptr));
                self.emit_u16_op(Op::Const, idx);
            }
            TokenKind::True => {
                self.advance();
                self.emit_op(Op::PushTrue);
            }
            TokenKind::False => {
                self.advance();
                self.emit_op(Op::PushFalse);
            }
            TokenKind::Null => {
                self.advance();
                self.emit_op(Op::PushNull);
            }
            TokenKind::Undefined => {
                self.advance();
                let idx = self.add_constant(Value::undefined());
                self.emit_u16_op(Op::Const, idx);
            }
            TokenKind::SelfKw => {
                self.advance();
                self.emit_op(Op::PushSelf);
            }
            TokenKind::Identifier(name) => {
                self.advance();
                self.emit_load_name(&name);
            }
            TokenKind::LParen => {
                self.advance();
                self.skip_newlines();
                self.expression();
                self.skip_newlines();
                self.expect(TokenKind::RParen);
            }
            TokenKind::LBracket => self.parse_list_literal(),
            TokenKind::LBrace => self.parse_map_literal(),
            other => {
                self.error(format!("unexpected token {:?}", other));
                self.advance();
            }
        }
    }

    fn parse_list_literal(&mut self) {
        self.advance(); // '['
        self.emit_op(Op::PushEmptyList);
        let hint_at = self.code_len();
        self.emit_u16(0);

        let temp = self.declare_local("$list");
        self.emit_store_local(temp);

        let mut count: u16 = 0;
        self.skip_newlines();
        while !self.check(&TokenKind::RBracket) {
            let append_idx = self.intern_name("list_append");
            self.emit_u16_op(Op::PushGlobal, append_idx);
            self.emit_push_local(temp);
            self.expression();
            self.emit_op(Op::Call);
            self.emit_byte(2);
            self.emit_op(Op::Pop);
            count += 1;
            self.skip_newlines();
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(TokenKind::RBracket);
        self.patch_u16_at(hint_at, count);
        self.emit_push_local(temp);
    }

    fn parse_map_literal(&mut self) {
        self.advance(); // '{'
        self.emit_op(Op::PushEmptyMap);

        let temp = self.declare_local("$map");
        self.emit_store_local(temp);

        self.skip_newlines();
        while !self.check(&TokenKind::RBrace) {
            self.emit_push_local(temp);
            self.expression();
            self.expect(TokenKind::Colon);
            self.skip_newlines();
            self.expression();
            self.emit_op(Op::SetSubscript);
            self.skip_newlines();
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }
        self.expect(TokenKind::RBrace);
        self.emit_push_local(temp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHost;
    impl ImportHost for NullHost {
        fn resolve_path(&mut self, _from_path: &str, _target: &str) -> Option<String> {
            None
        }
        fn load_script(&mut self, _path: &str) -> Option<String> {
            None
        }
        fn cached_module(&mut self, _canonical_path: &str) -> Option<NonNull<GcBox>> {
            None
        }
        fn register_module(&mut self, _canonical_path: &str, _module: NonNull<GcBox>) {}
    }

    fn compile_ok(source: &str) -> NonNull<GcBox> {
        let mut gc = GcHeap::new();
        let mut host = NullHost;
        let (module, outcome) = compile_module(source, "main", "main.pk", &mut gc, &mut host);
        match &outcome {
            CompileOutcome::Success => {}
            other => panic!("expected successful compile, got {:?}", other),
        }
        module
    }

    #[test]
    fn compiles_trivial_assignment_without_errors() {
        compile_ok("x = 1\ny = x + 2\n");
    }

    #[test]
    fn compiles_if_elif_else_chain() {
        compile_ok("x = 1\nif x == 1\n  y = 1\nelif x == 2\n  y = 2\nelse\n  y = 3\nend\n");
    }

    #[test]
    fn compiles_while_with_break_and_continue() {
        compile_ok("x = 0\nwhile x < 10 do\n  x = x + 1\n  if x == 5\n    break\n  end\n  continue\nend\n");
    }

    #[test]
    fn compiles_for_loop_over_range() {
        compile_ok("for i in 0..3 do\n  y = i\nend\n");
    }

    #[test]
    fn compiles_function_definition_and_call() {
        compile_ok("def add(a, b)\n  return a + b\nend\nz = add(1, 2)\n");
    }

    #[test]
    fn compiles_closure_capturing_outer_local() {
        compile_ok(
            "def make_counter()\n  n = 0\n  def inc()\n    n = n + 1\n    return n\n  end\n  return inc\nend\n",
        );
    }

    #[test]
    fn compiles_class_with_methods() {
        compile_ok("class Foo\n  def _init(x)\n    self.x = x\n  end\n  def get()\n    return self.x\n  end\nend\nf = Foo(1)\n");
    }

    #[test]
    fn compiles_list_and_map_literals() {
        compile_ok("xs = [1, 2, 3]\nm = {\"a\": 1, \"b\": 2}\n");
    }

    #[test]
    fn tail_call_rewrites_trailing_call_opcode() {
        let module = compile_ok("def f(n)\n  return f(n)\nend\n");
        let cell = unsafe { module_cell(module) };
        let m = cell.borrow();
        let f_value = m
            .constants
            .iter()
            .find(|c| {
                c.as_object()
                    .map(|p| {
                        matches!(unsafe { &p.as_ref().data }, HeapObject::Function(f) if f.name == "f")
                    })
                    .unwrap_or(false)
            })
            .expect("function constant for 'f'");
        let ptr = f_value.as_object().unwrap();
        let code = match unsafe { &ptr.as_ref().data } {
            HeapObject::Function(f) => match &f.body {
                pocket_runtime::FunctionBody::Script(s) => s.code.clone(),
                _ => panic!("expected a script body"),
            },
            _ => panic!("expected a function"),
        };
        assert!(code.contains(&(Op::TailCall as u8)));
        assert!(!code.contains(&(Op::Call as u8)));
    }

    #[test]
    fn reports_error_on_break_outside_loop() {
        let mut gc = GcHeap::new();
        let mut host = NullHost;
        let (_module, outcome) = compile_module("break\n", "main", "main.pk", &mut gc, &mut host);
        match outcome {
            CompileOutcome::CompileError(errs) => assert!(!errs.is_empty()),
            other => panic!("expected a compile error, got {:?}", other),
        }
    }

    #[test]
    fn reports_unexpected_eof_on_unterminated_block() {
        let mut gc = GcHeap::new();
        let mut host = NullHost;
        let (_module, outcome) =
            compile_module("if x == 1\n  y = 1\n", "main", "main.pk", &mut gc, &mut host);
        assert!(matches!(outcome, CompileOutcome::UnexpectedEof));
    }

    #[test]
    fn reports_unexpected_eof_on_unterminated_string() {
        let mut gc = GcHeap::new();
        let mut host = NullHost;
        let (_module, outcome) = compile_module("x = \"abc\n", "main", "main.pk", &mut gc, &mut host);
        assert!(matches!(outcome, CompileOutcome::UnexpectedEof));
    }
}
