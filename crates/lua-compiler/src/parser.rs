//! Recursive-descent parser that generates code as it goes.
//!
//! There is no syntax tree: every production drives the [`FuncState`] of the
//! function being compiled directly. Nested function bodies push a fresh
//! `FuncState`; the enclosing ones are kept on a stack so upvalues can be
//! resolved outward.

use std::mem;

use lua_core::number::ArithOp;
use lua_core::{CompileError, LuaStr, OpCode, Proto, Rk, UpvalueDesc};
use lua_lexer::{Lexer, Token, TokenKind};

use crate::expdesc::{ExpDesc, ExpKind, JumpList};
use crate::func_state::{
    BinOpr, BlockScope, CResult, FuncState, GotoDesc, LabelDesc, UnOpr, MULTRET,
};

/// Nesting limit for blocks and expressions.
const MAX_SYNTAX_LEVELS: u32 = 200;
/// Remaining stack below which a nested production switches to a new segment.
const STACK_RED_ZONE: usize = 64 * 1024;
/// Size of each segment allocated for deep nesting.
const STACK_SEGMENT: usize = 1024 * 1024;
const UNARY_PRIORITY: u8 = 12;
/// NEWTABLE size hints are clamped to this.
const MAX_TABLE_HINT: u32 = 511;

pub struct Parser<'src> {
    lexer: Lexer<'src>,
    current: Token,
    ahead: Option<Token>,
    /// Line of the last consumed token.
    last_line: u32,
    fs: FuncState,
    enclosing: Vec<FuncState>,
    depth: u32,
    source: String,
    chunk: String,
}

/// Table constructor bookkeeping.
struct ConsControl {
    table: u8,
    pending: ExpDesc,
    array_items: u32,
    hash_items: u32,
    to_store: i32,
}

impl<'src> Parser<'src> {
    pub fn new(src: &'src [u8], chunk_name: &str) -> CResult<Self> {
        let mut lexer = Lexer::new(src, chunk_name);
        let chunk = lexer.chunk().to_string();
        let current = lexer.next_token()?;
        Ok(Self {
            lexer,
            current,
            ahead: None,
            last_line: 1,
            fs: FuncState::new(chunk_name, &chunk, 0),
            enclosing: Vec::new(),
            depth: 0,
            source: chunk_name.to_string(),
            chunk,
        })
    }

    /// Compile the whole chunk as a vararg main function.
    pub fn parse_main(mut self) -> CResult<Proto> {
        self.fs.proto.is_vararg = true;
        self.enter_block(false);
        self.statlist()?;
        self.check(&TokenKind::Eof)?;
        self.fs.ret(0, 0)?;
        self.leave_block()?;
        Ok(self.fs.into_proto())
    }

    // ── token plumbing ────────────────────────────────────────────────────

    fn next(&mut self) -> CResult<()> {
        self.last_line = self.current.line;
        self.current = match self.ahead.take() {
            Some(tok) => tok,
            None => self.lexer.next_token()?,
        };
        self.fs.line = self.last_line;
        Ok(())
    }

    fn lookahead_is(&mut self, kind: &TokenKind) -> CResult<bool> {
        let tok = match self.ahead.take() {
            Some(tok) => tok,
            None => self.lexer.next_token()?,
        };
        let is = tok.kind == *kind;
        self.ahead = Some(tok);
        Ok(is)
    }

    fn is(&self, kind: &TokenKind) -> bool {
        self.current.kind == *kind
    }

    fn error(&self, message: &str) -> CompileError {
        CompileError::Syntax {
            chunk: self.chunk.clone(),
            line: self.current.line,
            message: format!("{message} near {}", self.current.kind),
        }
    }

    fn error_expected(&self, kind: &TokenKind) -> CompileError {
        self.error(&format!("{} expected", expected_name(kind)))
    }

    fn check(&self, kind: &TokenKind) -> CResult<()> {
        if self.is(kind) {
            Ok(())
        } else {
            Err(self.error_expected(kind))
        }
    }

    fn checknext(&mut self, kind: &TokenKind) -> CResult<()> {
        self.check(kind)?;
        self.next()
    }

    fn testnext(&mut self, kind: &TokenKind) -> CResult<bool> {
        if self.is(kind) {
            self.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Expect `what` closing the `who` opened at `line`.
    fn check_match(&mut self, what: &TokenKind, who: &TokenKind, line: u32) -> CResult<()> {
        if self.testnext(what)? {
            return Ok(());
        }
        if line == self.current.line {
            Err(self.error_expected(what))
        } else {
            Err(self.error(&format!(
                "{} expected (to close {} at line {line})",
                expected_name(what),
                expected_name(who)
            )))
        }
    }

    fn str_checkname(&mut self) -> CResult<LuaStr> {
        let TokenKind::Name(name) = &self.current.kind else {
            return Err(self.error("<name> expected"));
        };
        let name = LuaStr::from(name.as_str());
        self.next()?;
        Ok(name)
    }

    fn enter_level(&mut self) -> CResult<()> {
        self.depth += 1;
        if self.depth > MAX_SYNTAX_LEVELS {
            return Err(self.error("chunk has too many syntax levels"));
        }
        Ok(())
    }

    fn leave_level(&mut self) {
        self.depth -= 1;
    }

    fn block_follow(&self, with_until: bool) -> bool {
        match self.current.kind {
            TokenKind::Else | TokenKind::Elseif | TokenKind::End | TokenKind::Eof => true,
            TokenKind::Until => with_until,
            _ => false,
        }
    }

    // ── scopes ────────────────────────────────────────────────────────────

    fn enter_block(&mut self, is_loop: bool) {
        let fs = &mut self.fs;
        fs.blocks.push(BlockScope {
            nactvar: fs.nactvar,
            has_upvalue: false,
            is_loop,
            break_list: JumpList::new(),
            first_label: fs.labels.len(),
            first_goto: fs.gotos.len(),
        });
        debug_assert_eq!(fs.free_reg, fs.nactvar);
    }

    fn leave_block(&mut self) -> CResult<()> {
        let Some(bl) = self.fs.blocks.pop() else {
            return Err(self.fs.error("unbalanced block"));
        };
        let nested = !self.fs.blocks.is_empty();
        if nested && bl.has_upvalue {
            self.fs.emit(OpCode::Close { from: bl.nactvar })?;
        }
        self.fs.remove_vars(bl.nactvar);
        self.fs.free_reg = self.fs.nactvar;
        self.fs.labels.truncate(bl.first_label);
        self.fs.patch_to_here(bl.break_list.clone());
        if nested {
            self.move_gotos_out(&bl)?;
        } else if let Some(gt) = self.fs.gotos.get(bl.first_goto) {
            return Err(self
                .fs
                .error(format!("no visible label '{}' for <goto> at line {}", gt.name.to_str_lossy(), gt.line)));
        }
        Ok(())
    }

    /// Pending gotos leave the block: their level drops to the block's and
    /// they may now match labels of the enclosing block.
    fn move_gotos_out(&mut self, bl: &BlockScope) -> CResult<()> {
        let mut i = bl.first_goto;
        while i < self.fs.gotos.len() {
            if self.fs.gotos[i].nactvar > bl.nactvar {
                if bl.has_upvalue {
                    let jumps = self.fs.gotos[i].jumps.clone();
                    self.fs.patch_close(&jumps, bl.nactvar);
                }
                self.fs.gotos[i].nactvar = bl.nactvar;
            }
            if !self.find_label(i)? {
                i += 1;
            }
        }
        Ok(())
    }

    /// Try to resolve goto `g` against the visible labels of the current block.
    fn find_label(&mut self, g: usize) -> CResult<bool> {
        let first = self.fs.blocks.last().map_or(0, |bl| bl.first_label);
        let name = self.fs.gotos[g].name.clone();
        let Some(label) = self.fs.labels[first..].iter().find(|lb| lb.name == name).cloned() else {
            return Ok(false);
        };
        let gt = &self.fs.gotos[g];
        if gt.nactvar > label.nactvar {
            let jumps = gt.jumps.clone();
            self.fs.patch_close(&jumps, label.nactvar);
        }
        self.close_goto(g, &label)?;
        Ok(true)
    }

    fn close_goto(&mut self, g: usize, label: &LabelDesc) -> CResult<()> {
        let gt = self.fs.gotos.remove(g);
        if gt.nactvar < label.nactvar {
            let var = self
                .fs
                .local_var_name(gt.nactvar)
                .map(|n| n.to_str_lossy().into_owned())
                .unwrap_or_default();
            return Err(self.fs.error(format!(
                "<goto {}> at line {} jumps into the scope of local '{var}'",
                gt.name.to_str_lossy(),
                gt.line
            )));
        }
        self.fs.patch_list(gt.jumps, label.pc)
    }

    /// Resolve pending gotos of the current block that target label `l`.
    fn find_gotos(&mut self, l: usize) -> CResult<()> {
        let first = self.fs.blocks.last().map_or(0, |bl| bl.first_goto);
        let label = self.fs.labels[l].clone();
        let mut i = first;
        while i < self.fs.gotos.len() {
            if self.fs.gotos[i].name == label.name {
                self.close_goto(i, &label)?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    // ── functions ─────────────────────────────────────────────────────────

    fn open_func(&mut self, line: u32) {
        let mut child = FuncState::new(&self.source, &self.chunk, line);
        child.line = self.last_line;
        let parent = mem::replace(&mut self.fs, child);
        self.enclosing.push(parent);
        self.enter_block(false);
    }

    fn close_func(&mut self) -> CResult<Proto> {
        self.fs.ret(0, 0)?;
        self.leave_block()?;
        let Some(parent) = self.enclosing.pop() else {
            return Err(self.fs.error("unbalanced function"));
        };
        let child = mem::replace(&mut self.fs, parent);
        self.fs.line = self.last_line;
        Ok(child.into_proto())
    }

    /// Resolve `name` as seen from function `level` (the current one is
    /// `enclosing.len()`).
    fn single_var_aux(&mut self, level: usize, name: &LuaStr, base: bool) -> CResult<ExpKind> {
        let depth = self.enclosing.len();
        let fs = if level == depth {
            &mut self.fs
        } else {
            &mut self.enclosing[level]
        };
        if let Some(reg) = fs.search_var(name) {
            if !base {
                fs.mark_upval(reg);
            }
            return Ok(ExpKind::Local(reg));
        }
        if let Some(idx) = fs.search_upvalue(name) {
            return Ok(ExpKind::Upval(idx));
        }
        if level == 0 {
            return Ok(ExpKind::Global(0));
        }
        let desc = match self.single_var_aux(level - 1, name, false)? {
            ExpKind::Local(reg) => UpvalueDesc::Stack(reg),
            ExpKind::Upval(idx) => UpvalueDesc::Upvalue(idx),
            other => return Ok(other),
        };
        let fs = if level == depth {
            &mut self.fs
        } else {
            &mut self.enclosing[level]
        };
        Ok(ExpKind::Upval(fs.new_upvalue(name.clone(), desc)?))
    }

    fn single_var(&mut self, name: LuaStr) -> CResult<ExpDesc> {
        let kind = match self.single_var_aux(self.enclosing.len(), &name, true)? {
            ExpKind::Global(_) => ExpKind::Global(self.fs.string_k(&name)?),
            kind => kind,
        };
        Ok(ExpDesc::new(kind))
    }

    /// `function` body: parameters, block and `end`; leaves the closure in
    /// the next free register.
    fn body(&mut self, is_method: bool, line: u32) -> CResult<ExpDesc> {
        self.open_func(line);
        self.checknext(&TokenKind::LParen)?;
        if is_method {
            self.fs.new_localvar(LuaStr::from("self"))?;
            self.fs.adjust_local_vars(1);
        }
        self.par_list()?;
        self.checknext(&TokenKind::RParen)?;
        self.statlist()?;
        self.fs.proto.last_line_defined = self.current.line;
        self.check_match(&TokenKind::End, &TokenKind::Function, line)?;
        let proto = self.close_func()?;
        let proto_idx = self.fs.add_proto(proto)?;
        let pc = self.fs.emit(OpCode::Closure { dst: 0, proto_idx })?;
        let mut e = ExpDesc::new(ExpKind::Reloc(pc));
        self.fs.exp_to_next_reg(&mut e)?;
        Ok(e)
    }

    fn par_list(&mut self) -> CResult<()> {
        let mut nparams = 0;
        if !self.is(&TokenKind::RParen) {
            loop {
                match self.current.kind {
                    TokenKind::Name(_) => {
                        let name = self.str_checkname()?;
                        self.fs.new_localvar(name)?;
                        nparams += 1;
                    }
                    TokenKind::DotDotDot => {
                        self.next()?;
                        self.fs.proto.is_vararg = true;
                        break;
                    }
                    _ => return Err(self.error("<name> expected")),
                }
                if !self.testnext(&TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.fs.adjust_local_vars(nparams);
        self.fs.proto.param_count = self.fs.nactvar;
        self.fs.reserve_regs(self.fs.nactvar as usize)
    }

    // ── statements ────────────────────────────────────────────────────────

    fn statlist(&mut self) -> CResult<()> {
        while !self.block_follow(true) {
            if self.is(&TokenKind::Return) {
                return self.statement();
            }
            self.statement()?;
        }
        Ok(())
    }

    fn block(&mut self) -> CResult<()> {
        self.enter_block(false);
        self.statlist()?;
        self.leave_block()
    }

    fn statement(&mut self) -> CResult<()> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT, || self.statement_body())
    }

    fn statement_body(&mut self) -> CResult<()> {
        let line = self.current.line;
        self.enter_level()?;
        match self.current.kind {
            TokenKind::Semicolon => self.next()?,
            TokenKind::If => self.if_stat(line)?,
            TokenKind::While => self.while_stat(line)?,
            TokenKind::Do => {
                self.next()?;
                self.block()?;
                self.check_match(&TokenKind::End, &TokenKind::Do, line)?;
            }
            TokenKind::For => self.for_stat(line)?,
            TokenKind::Repeat => self.repeat_stat(line)?,
            TokenKind::Function => self.func_stat(line)?,
            TokenKind::Local => {
                self.next()?;
                if self.testnext(&TokenKind::Function)? {
                    self.local_func()?;
                } else {
                    self.local_stat()?;
                }
            }
            TokenKind::ColonColon => {
                self.next()?;
                let name = self.str_checkname()?;
                self.label_stat(name, line)?;
            }
            TokenKind::Return => {
                self.next()?;
                self.ret_stat()?;
            }
            TokenKind::Break => self.break_stat()?,
            TokenKind::Goto => self.goto_stat()?,
            _ => self.expr_stat()?,
        }
        debug_assert!(self.fs.free_reg >= self.fs.nactvar);
        self.fs.free_reg = self.fs.nactvar;
        self.leave_level();
        Ok(())
    }

    fn cond(&mut self) -> CResult<JumpList> {
        let mut v = self.expr()?;
        if v.kind == ExpKind::Nil {
            v.kind = ExpKind::False;
        }
        self.fs.go_if_true(&mut v)?;
        Ok(v.f)
    }

    fn if_stat(&mut self, line: u32) -> CResult<()> {
        let mut escape = JumpList::new();
        self.test_then_block(&mut escape)?;
        while self.is(&TokenKind::Elseif) {
            self.test_then_block(&mut escape)?;
        }
        if self.testnext(&TokenKind::Else)? {
            self.block()?;
        }
        self.check_match(&TokenKind::End, &TokenKind::If, line)?;
        self.fs.patch_to_here(escape);
        Ok(())
    }

    fn test_then_block(&mut self, escape: &mut JumpList) -> CResult<()> {
        self.next()?;
        let cond_exit = self.cond()?;
        self.checknext(&TokenKind::Then)?;
        self.block()?;
        if matches!(self.current.kind, TokenKind::Else | TokenKind::Elseif) {
            escape.append(self.fs.jump()?);
        }
        self.fs.patch_to_here(cond_exit);
        Ok(())
    }

    fn while_stat(&mut self, line: u32) -> CResult<()> {
        self.next()?;
        let while_init = self.fs.get_label();
        let cond_exit = self.cond()?;
        self.enter_block(true);
        self.checknext(&TokenKind::Do)?;
        self.block()?;
        self.fs.jump_to(while_init)?;
        self.check_match(&TokenKind::End, &TokenKind::While, line)?;
        self.leave_block()?;
        self.fs.patch_to_here(cond_exit);
        Ok(())
    }

    fn repeat_stat(&mut self, line: u32) -> CResult<()> {
        let repeat_init = self.fs.get_label();
        self.enter_block(true);
        self.enter_block(false);
        self.next()?;
        self.statlist()?;
        self.check_match(&TokenKind::Until, &TokenKind::Repeat, line)?;
        // The condition sees the body's locals.
        let cond_exit = self.cond()?;
        if let Some(scope) = self.fs.blocks.last() {
            if scope.has_upvalue {
                let level = scope.nactvar;
                self.fs.patch_close(&cond_exit, level);
            }
        }
        self.leave_block()?;
        self.fs.patch_list(cond_exit, repeat_init)?;
        self.leave_block()
    }

    fn for_stat(&mut self, line: u32) -> CResult<()> {
        self.enter_block(true);
        self.next()?;
        let var = self.str_checkname()?;
        match self.current.kind {
            TokenKind::Assign => self.for_num(var, line)?,
            TokenKind::Comma | TokenKind::In => self.for_list(var)?,
            _ => return Err(self.error("'=' or 'in' expected")),
        }
        self.check_match(&TokenKind::End, &TokenKind::For, line)?;
        self.leave_block()
    }

    fn exp1(&mut self) -> CResult<()> {
        let mut e = self.expr()?;
        self.fs.exp_to_next_reg(&mut e)
    }

    fn for_num(&mut self, var: LuaStr, line: u32) -> CResult<()> {
        let base = self.fs.free_reg;
        self.fs.new_localvar(LuaStr::from("(for index)"))?;
        self.fs.new_localvar(LuaStr::from("(for limit)"))?;
        self.fs.new_localvar(LuaStr::from("(for step)"))?;
        self.fs.new_localvar(var)?;
        self.checknext(&TokenKind::Assign)?;
        self.exp1()?;
        self.checknext(&TokenKind::Comma)?;
        self.exp1()?;
        if self.testnext(&TokenKind::Comma)? {
            self.exp1()?;
        } else {
            let k = self.fs.int_k(1)?;
            let reg = self.fs.free_reg;
            self.fs.code_k(reg, k)?;
            self.fs.reserve_regs(1)?;
        }
        self.for_body(base, line, 1, true)
    }

    fn for_list(&mut self, index_name: LuaStr) -> CResult<()> {
        let base = self.fs.free_reg;
        self.fs.new_localvar(LuaStr::from("(for generator)"))?;
        self.fs.new_localvar(LuaStr::from("(for state)"))?;
        self.fs.new_localvar(LuaStr::from("(for control)"))?;
        self.fs.new_localvar(index_name)?;
        let mut nvars = 4;
        while self.testnext(&TokenKind::Comma)? {
            let name = self.str_checkname()?;
            self.fs.new_localvar(name)?;
            nvars += 1;
        }
        self.checknext(&TokenKind::In)?;
        let line = self.current.line;
        let (nexps, mut e) = self.explist()?;
        self.adjust_assign(3, nexps, &mut e)?;
        self.fs.check_stack(3)?;
        self.for_body(base, line, nvars - 3, false)
    }

    fn for_body(&mut self, base: u8, line: u32, nvars: usize, numeric: bool) -> CResult<()> {
        self.fs.adjust_local_vars(3);
        self.checknext(&TokenKind::Do)?;
        let (prep, entry) = if numeric {
            (self.fs.emit(OpCode::ForPrep { base, offset: 0 })?, JumpList::new())
        } else {
            let entry = self.fs.jump()?;
            (self.fs.pc() - 1, entry)
        };
        self.enter_block(false);
        self.fs.adjust_local_vars(nvars);
        self.fs.reserve_regs(nvars)?;
        self.block()?;
        self.leave_block()?;
        if numeric {
            let end = self.fs.emit(OpCode::ForLoop { base, offset: 0 })?;
            self.fs.fix_jump(end, prep + 1)?;
            self.fs.fix_jump(prep, end + 1)?;
        } else {
            self.fs.patch_to_here(entry);
            self.fs.emit(OpCode::TForCall { base, results: nvars as u8 })?;
            self.fs.fix_line(line);
            let end = self.fs.emit(OpCode::TForLoop { base, offset: 0 })?;
            self.fs.fix_jump(end, prep + 1)?;
        }
        self.fs.fix_line(line);
        Ok(())
    }

    fn func_stat(&mut self, line: u32) -> CResult<()> {
        self.next()?;
        let (var, is_method) = self.func_name()?;
        let mut b = self.body(is_method, line)?;
        self.fs.store_var(&var, &mut b)?;
        self.fs.fix_line(line);
        Ok(())
    }

    /// `Name {'.' Name} [':' Name]`
    fn func_name(&mut self) -> CResult<(ExpDesc, bool)> {
        let name = self.str_checkname()?;
        let mut v = self.single_var(name)?;
        while self.is(&TokenKind::Dot) {
            self.field_sel(&mut v)?;
        }
        let is_method = self.is(&TokenKind::Colon);
        if is_method {
            self.field_sel(&mut v)?;
        }
        Ok((v, is_method))
    }

    fn local_func(&mut self) -> CResult<()> {
        let name = self.str_checkname()?;
        self.fs.new_localvar(name)?;
        self.fs.adjust_local_vars(1);
        let line = self.current.line;
        self.body(false, line)?;
        // Debug info only sees the local once it holds the closure.
        let pc = self.fs.pc() as u32;
        let idx = self.fs.nactvar - 1;
        self.fs.local_var_mut(idx).start_pc = pc;
        Ok(())
    }

    fn local_stat(&mut self) -> CResult<()> {
        let mut nvars = 0;
        loop {
            let name = self.str_checkname()?;
            self.fs.new_localvar(name)?;
            nvars += 1;
            if !self.testnext(&TokenKind::Comma)? {
                break;
            }
        }
        let (nexps, mut e) = if self.testnext(&TokenKind::Assign)? {
            self.explist()?
        } else {
            (0, ExpDesc::void())
        };
        self.adjust_assign(nvars, nexps, &mut e)?;
        self.fs.adjust_local_vars(nvars as usize);
        Ok(())
    }

    fn label_stat(&mut self, name: LuaStr, line: u32) -> CResult<()> {
        let first = self.fs.blocks.last().map_or(0, |bl| bl.first_label);
        if let Some(prev) = self.fs.labels[first..].iter().find(|lb| lb.name == name) {
            return Err(self.fs.error(format!(
                "label '{}' already defined on line {}",
                name.to_str_lossy(),
                prev.line
            )));
        }
        self.checknext(&TokenKind::ColonColon)?;
        let pc = self.fs.get_label();
        let l = self.fs.labels.len();
        self.fs.labels.push(LabelDesc { name, pc, line, nactvar: self.fs.nactvar });
        // Skip other no-op statements.
        while matches!(self.current.kind, TokenKind::Semicolon | TokenKind::ColonColon) {
            self.statement()?;
        }
        if self.block_follow(false) {
            // Locals of the block are already dead at its last label.
            if let Some(bl) = self.fs.blocks.last() {
                self.fs.labels[l].nactvar = bl.nactvar;
            }
        }
        self.find_gotos(l)
    }

    fn goto_stat(&mut self) -> CResult<()> {
        let line = self.current.line;
        self.next()?;
        let name = self.str_checkname()?;
        let jumps = self.fs.jump()?;
        self.fs.gotos.push(GotoDesc { name, jumps, line, nactvar: self.fs.nactvar });
        let g = self.fs.gotos.len() - 1;
        self.find_label(g)?;
        Ok(())
    }

    fn break_stat(&mut self) -> CResult<()> {
        self.next()?;
        let Some(i) = self.fs.blocks.iter().rposition(|bl| bl.is_loop) else {
            return Err(self.error("no loop to break"));
        };
        let captured = self.fs.blocks[i + 1..].iter().any(|bl| bl.has_upvalue);
        let level = self.fs.blocks[i].nactvar;
        let list = self.fs.jump()?;
        if captured {
            self.fs.patch_close(&list, level);
        }
        self.fs.blocks[i].break_list.append(list);
        Ok(())
    }

    fn ret_stat(&mut self) -> CResult<()> {
        let (first, nret) = if self.block_follow(true) || self.is(&TokenKind::Semicolon) {
            (0, 0)
        } else {
            let (nexps, mut e) = self.explist()?;
            if e.has_multret() {
                self.fs.set_returns(&mut e, MULTRET)?;
                if let (ExpKind::Call(pc), 1) = (&e.kind, nexps) {
                    if let OpCode::Call { func, args, .. } = self.fs.proto.instructions[*pc] {
                        self.fs.proto.instructions[*pc] = OpCode::TailCall { func, args };
                    }
                }
                (self.fs.nactvar, MULTRET)
            } else if nexps == 1 {
                (self.fs.exp_to_any_reg(&mut e)?, 1)
            } else {
                self.fs.exp_to_next_reg(&mut e)?;
                (self.fs.nactvar, nexps)
            }
        };
        self.fs.ret(first, nret)?;
        self.testnext(&TokenKind::Semicolon)?;
        Ok(())
    }

    fn expr_stat(&mut self) -> CResult<()> {
        let v = self.suffixed_exp()?;
        if matches!(self.current.kind, TokenKind::Assign | TokenKind::Comma) {
            return self.assignment(v);
        }
        let ExpKind::Call(pc) = v.kind else {
            return Err(self.error("syntax error"));
        };
        if let OpCode::Call { results, .. } = &mut self.fs.proto.instructions[pc] {
            *results = 1;
        }
        Ok(())
    }

    fn check_assignable(&self, v: &ExpDesc) -> CResult<()> {
        match v.kind {
            ExpKind::Local(_) | ExpKind::Upval(_) | ExpKind::Global(_) | ExpKind::Indexed { .. } => Ok(()),
            _ => Err(self.error("syntax error")),
        }
    }

    fn assignment(&mut self, first: ExpDesc) -> CResult<()> {
        self.check_assignable(&first)?;
        let mut targets = vec![first];
        while self.testnext(&TokenKind::Comma)? {
            let v = self.suffixed_exp()?;
            self.check_assignable(&v)?;
            if let ExpKind::Local(reg) = v.kind {
                self.check_conflict(&mut targets, reg)?;
            }
            targets.push(v);
        }
        self.checknext(&TokenKind::Assign)?;
        let nvars = targets.len() as i32;
        let (nexps, mut e) = self.explist()?;
        if nexps != nvars {
            self.adjust_assign(nvars, nexps, &mut e)?;
            if nexps > nvars {
                self.fs.free_reg -= (nexps - nvars) as u8;
            }
        } else if let Some(last) = targets.pop() {
            self.fs.set_one_ret(&mut e);
            self.fs.store_var(&last, &mut e)?;
        }
        // Remaining values sit in consecutive registers; store right to left.
        while let Some(target) = targets.pop() {
            let mut e = ExpDesc::new(ExpKind::NonReloc(self.fs.free_reg - 1));
            self.fs.store_var(&target, &mut e)?;
        }
        Ok(())
    }

    /// A local assigned in a multiple assignment may also be used as a table
    /// or key by an earlier target; those must see the old value.
    fn check_conflict(&mut self, targets: &mut [ExpDesc], reg: u8) -> CResult<()> {
        let extra = self.fs.free_reg;
        let mut conflict = false;
        for t in targets.iter_mut() {
            if let ExpKind::Indexed { table, key } = &mut t.kind {
                if *table == reg {
                    conflict = true;
                    *table = extra;
                }
                if *key == Rk::Reg(reg) {
                    conflict = true;
                    *key = Rk::Reg(extra);
                }
            }
        }
        if conflict {
            self.fs.emit(OpCode::Move { dst: extra, src: reg })?;
            self.fs.reserve_regs(1)?;
        }
        Ok(())
    }

    fn adjust_assign(&mut self, nvars: i32, nexps: i32, e: &mut ExpDesc) -> CResult<()> {
        let mut extra = nvars - nexps;
        if e.has_multret() {
            extra = (extra + 1).max(0);
            self.fs.set_returns(e, extra)?;
            if extra > 1 {
                self.fs.reserve_regs(extra as usize - 1)?;
            }
        } else {
            if e.kind != ExpKind::Void {
                self.fs.exp_to_next_reg(e)?;
            }
            if extra > 0 {
                let reg = self.fs.free_reg;
                self.fs.reserve_regs(extra as usize)?;
                self.fs.code_nil(reg, extra as u8)?;
            }
        }
        Ok(())
    }

    // ── expressions ───────────────────────────────────────────────────────

    fn expr(&mut self) -> CResult<ExpDesc> {
        let mut v = ExpDesc::void();
        self.subexpr(&mut v, 0)?;
        Ok(v)
    }

    /// All values but the last go to consecutive registers; the last is
    /// returned undischarged.
    fn explist(&mut self) -> CResult<(i32, ExpDesc)> {
        let mut e = self.expr()?;
        let mut n = 1;
        while self.testnext(&TokenKind::Comma)? {
            self.fs.exp_to_next_reg(&mut e)?;
            e = self.expr()?;
            n += 1;
        }
        Ok((n, e))
    }

    /// `(simpleexp | unop subexpr) { binop subexpr }` where every binary
    /// operator binds tighter than `limit`.
    fn subexpr(&mut self, v: &mut ExpDesc, limit: u8) -> CResult<Option<BinOpr>> {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT, || self.subexpr_body(v, limit))
    }

    fn subexpr_body(&mut self, v: &mut ExpDesc, limit: u8) -> CResult<Option<BinOpr>> {
        self.enter_level()?;
        if let Some(op) = unary_op(&self.current.kind) {
            let line = self.current.line;
            self.next()?;
            self.subexpr(v, UNARY_PRIORITY)?;
            self.fs.prefix(op, v, line)?;
        } else {
            self.simple_exp(v)?;
        }
        let mut op = binary_op(&self.current.kind);
        while let Some(o) = op {
            let (left, right) = priority(o);
            if left <= limit {
                break;
            }
            let line = self.current.line;
            self.next()?;
            self.fs.infix(o, v)?;
            let mut v2 = ExpDesc::void();
            let next_op = self.subexpr(&mut v2, right)?;
            self.fs.posfix(o, v, v2, line)?;
            op = next_op;
        }
        self.leave_level();
        Ok(op)
    }

    fn simple_exp(&mut self, v: &mut ExpDesc) -> CResult<()> {
        let kind = match &self.current.kind {
            TokenKind::Float(f) => ExpKind::KFlt(*f),
            TokenKind::Integer(i) => ExpKind::KInt(*i),
            TokenKind::LuaString(s) => ExpKind::KStr(s.clone()),
            TokenKind::Nil => ExpKind::Nil,
            TokenKind::True => ExpKind::True,
            TokenKind::False => ExpKind::False,
            TokenKind::DotDotDot => {
                if !self.fs.proto.is_vararg {
                    return Err(self.error("cannot use '...' outside a vararg function"));
                }
                ExpKind::VarArg(self.fs.emit(OpCode::VarArg { dst: 0, count: 1 })?)
            }
            TokenKind::LBrace => {
                *v = self.constructor()?;
                return Ok(());
            }
            TokenKind::Function => {
                let line = self.current.line;
                self.next()?;
                *v = self.body(false, line)?;
                return Ok(());
            }
            _ => {
                *v = self.suffixed_exp()?;
                return Ok(());
            }
        };
        *v = ExpDesc::new(kind);
        self.next()
    }

    fn primary_exp(&mut self) -> CResult<ExpDesc> {
        match self.current.kind {
            TokenKind::Name(_) => {
                let name = self.str_checkname()?;
                self.single_var(name)
            }
            TokenKind::LParen => {
                let line = self.current.line;
                self.next()?;
                let mut v = self.expr()?;
                self.check_match(&TokenKind::RParen, &TokenKind::LParen, line)?;
                // Parentheses truncate to one value.
                self.fs.discharge_vars(&mut v)?;
                Ok(v)
            }
            _ => Err(self.error("unexpected symbol")),
        }
    }

    /// `primaryexp { '.' NAME | '[' exp ']' | ':' NAME funcargs | funcargs }`
    fn suffixed_exp(&mut self) -> CResult<ExpDesc> {
        let line = self.current.line;
        let mut v = self.primary_exp()?;
        loop {
            match self.current.kind {
                TokenKind::Dot => self.field_sel(&mut v)?,
                TokenKind::LBracket => {
                    self.fs.exp_to_any_reg(&mut v)?;
                    let mut key = self.yindex()?;
                    self.fs.indexed(&mut v, &mut key)?;
                }
                TokenKind::Colon => {
                    self.next()?;
                    let name = self.str_checkname()?;
                    let mut key = ExpDesc::new(ExpKind::KStr(name));
                    self.fs.self_op(&mut v, &mut key)?;
                    self.func_args(&mut v, line)?;
                }
                TokenKind::LParen | TokenKind::LuaString(_) | TokenKind::LBrace => {
                    self.fs.exp_to_next_reg(&mut v)?;
                    self.func_args(&mut v, line)?;
                }
                _ => return Ok(v),
            }
        }
    }

    /// `['.' | ':'] NAME`
    fn field_sel(&mut self, v: &mut ExpDesc) -> CResult<()> {
        self.fs.exp_to_any_reg(v)?;
        self.next()?;
        let name = self.str_checkname()?;
        let mut key = ExpDesc::new(ExpKind::KStr(name));
        self.fs.indexed(v, &mut key)
    }

    /// `'[' exp ']'`
    fn yindex(&mut self) -> CResult<ExpDesc> {
        self.next()?;
        let mut e = self.expr()?;
        self.fs.exp_to_val(&mut e)?;
        self.checknext(&TokenKind::RBracket)?;
        Ok(e)
    }

    fn func_args(&mut self, f: &mut ExpDesc, line: u32) -> CResult<()> {
        let mut args = match &self.current.kind {
            TokenKind::LParen => {
                self.next()?;
                let args = if self.is(&TokenKind::RParen) {
                    ExpDesc::void()
                } else {
                    let (_, mut e) = self.explist()?;
                    self.fs.set_returns(&mut e, MULTRET)?;
                    e
                };
                self.check_match(&TokenKind::RParen, &TokenKind::LParen, line)?;
                args
            }
            TokenKind::LBrace => self.constructor()?,
            TokenKind::LuaString(s) => {
                let e = ExpDesc::new(ExpKind::KStr(s.clone()));
                self.next()?;
                e
            }
            _ => return Err(self.error("function arguments expected")),
        };
        let ExpKind::NonReloc(base) = f.kind else {
            return Err(self.fs.error("function value not in a register"));
        };
        let nargs = if args.has_multret() {
            MULTRET
        } else {
            if args.kind != ExpKind::Void {
                self.fs.exp_to_next_reg(&mut args)?;
            }
            i32::from(self.fs.free_reg) - (i32::from(base) + 1)
        };
        let pc = self.fs.emit(OpCode::Call { func: base, args: (nargs + 1) as u16, results: 2 })?;
        self.fs.fix_line(line);
        f.kind = ExpKind::Call(pc);
        // The call leaves one result in `base` by default.
        self.fs.free_reg = base + 1;
        Ok(())
    }

    // ── table constructors ────────────────────────────────────────────────

    fn constructor(&mut self) -> CResult<ExpDesc> {
        let line = self.current.line;
        let pc = self.fs.emit(OpCode::NewTable { dst: 0, array_hint: 0, hash_hint: 0 })?;
        let mut t = ExpDesc::new(ExpKind::Reloc(pc));
        self.fs.exp_to_next_reg(&mut t)?;
        let ExpKind::NonReloc(table) = t.kind else {
            return Err(self.fs.error("table not in a register"));
        };
        let mut cc = ConsControl {
            table,
            pending: ExpDesc::void(),
            array_items: 0,
            hash_items: 0,
            to_store: 0,
        };
        self.checknext(&TokenKind::LBrace)?;
        loop {
            if self.is(&TokenKind::RBrace) {
                break;
            }
            self.close_list_field(&mut cc)?;
            self.field(&mut cc)?;
            if !self.testnext(&TokenKind::Comma)? && !self.testnext(&TokenKind::Semicolon)? {
                break;
            }
        }
        self.check_match(&TokenKind::RBrace, &TokenKind::LBrace, line)?;
        self.last_list_field(&mut cc)?;
        if let OpCode::NewTable { array_hint, hash_hint, .. } = &mut self.fs.proto.instructions[pc] {
            *array_hint = cc.array_items.min(MAX_TABLE_HINT) as u16;
            *hash_hint = cc.hash_items.min(MAX_TABLE_HINT) as u16;
        }
        Ok(t)
    }

    fn field(&mut self, cc: &mut ConsControl) -> CResult<()> {
        match self.current.kind {
            TokenKind::Name(_) => {
                if self.lookahead_is(&TokenKind::Assign)? {
                    self.rec_field(cc)
                } else {
                    self.list_field(cc)
                }
            }
            TokenKind::LBracket => self.rec_field(cc),
            _ => self.list_field(cc),
        }
    }

    fn rec_field(&mut self, cc: &mut ConsControl) -> CResult<()> {
        let reg = self.fs.free_reg;
        let mut key = if self.is(&TokenKind::LBracket) {
            self.yindex()?
        } else {
            ExpDesc::new(ExpKind::KStr(self.str_checkname()?))
        };
        cc.hash_items += 1;
        self.checknext(&TokenKind::Assign)?;
        let key = self.fs.exp_to_rk(&mut key)?;
        let mut val = self.expr()?;
        let val = self.fs.exp_to_rk(&mut val)?;
        self.fs.emit(OpCode::SetTable { table: cc.table, key, val })?;
        self.fs.free_reg = reg;
        Ok(())
    }

    fn list_field(&mut self, cc: &mut ConsControl) -> CResult<()> {
        cc.pending = self.expr()?;
        cc.array_items += 1;
        cc.to_store += 1;
        Ok(())
    }

    fn close_list_field(&mut self, cc: &mut ConsControl) -> CResult<()> {
        if cc.pending.kind == ExpKind::Void {
            return Ok(());
        }
        self.fs.exp_to_next_reg(&mut cc.pending)?;
        cc.pending = ExpDesc::void();
        if cc.to_store == lua_core::opcode::FIELDS_PER_FLUSH as i32 {
            self.fs.set_list(cc.table, cc.array_items, cc.to_store)?;
            cc.to_store = 0;
        }
        Ok(())
    }

    fn last_list_field(&mut self, cc: &mut ConsControl) -> CResult<()> {
        if cc.to_store == 0 {
            return Ok(());
        }
        if cc.pending.has_multret() {
            self.fs.set_returns(&mut cc.pending, MULTRET)?;
            self.fs.set_list(cc.table, cc.array_items, MULTRET)?;
            // The open item is not counted in the size hint.
            cc.array_items -= 1;
        } else {
            if cc.pending.kind != ExpKind::Void {
                self.fs.exp_to_next_reg(&mut cc.pending)?;
            }
            self.fs.set_list(cc.table, cc.array_items, cc.to_store)?;
        }
        Ok(())
    }
}

fn expected_name(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Name(_) => "<name>".to_string(),
        other => format!("'{}'", other.symbol().unwrap_or("?")),
    }
}

fn unary_op(kind: &TokenKind) -> Option<UnOpr> {
    Some(match kind {
        TokenKind::Not => UnOpr::Not,
        TokenKind::Minus => UnOpr::Minus,
        TokenKind::Tilde => UnOpr::BNot,
        TokenKind::Hash => UnOpr::Len,
        _ => return None,
    })
}

fn binary_op(kind: &TokenKind) -> Option<BinOpr> {
    Some(match kind {
        TokenKind::Plus => BinOpr::Arith(ArithOp::Add),
        TokenKind::Minus => BinOpr::Arith(ArithOp::Sub),
        TokenKind::Star => BinOpr::Arith(ArithOp::Mul),
        TokenKind::Slash => BinOpr::Arith(ArithOp::Div),
        TokenKind::SlashSlash => BinOpr::Arith(ArithOp::IDiv),
        TokenKind::Percent => BinOpr::Arith(ArithOp::Mod),
        TokenKind::Caret => BinOpr::Arith(ArithOp::Pow),
        TokenKind::Ampersand => BinOpr::Arith(ArithOp::BAnd),
        TokenKind::Pipe => BinOpr::Arith(ArithOp::BOr),
        TokenKind::Tilde => BinOpr::Arith(ArithOp::BXor),
        TokenKind::ShiftLeft => BinOpr::Arith(ArithOp::Shl),
        TokenKind::ShiftRight => BinOpr::Arith(ArithOp::Shr),
        TokenKind::DotDot => BinOpr::Concat,
        TokenKind::Eq => BinOpr::Eq,
        TokenKind::NotEq => BinOpr::Ne,
        TokenKind::Lt => BinOpr::Lt,
        TokenKind::LtEq => BinOpr::Le,
        TokenKind::Gt => BinOpr::Gt,
        TokenKind::GtEq => BinOpr::Ge,
        TokenKind::And => BinOpr::And,
        TokenKind::Or => BinOpr::Or,
        _ => return None,
    })
}

/// Left and right binding power; right-associative operators bind weaker
/// on the right.
fn priority(op: BinOpr) -> (u8, u8) {
    match op {
        BinOpr::Arith(ArithOp::Add | ArithOp::Sub) => (10, 10),
        BinOpr::Arith(ArithOp::Mul | ArithOp::Div | ArithOp::IDiv | ArithOp::Mod) => (11, 11),
        BinOpr::Arith(ArithOp::Pow) => (14, 13),
        BinOpr::Concat => (9, 8),
        BinOpr::Arith(ArithOp::Shl | ArithOp::Shr) => (7, 7),
        BinOpr::Arith(ArithOp::BAnd) => (6, 6),
        BinOpr::Arith(ArithOp::BXor) => (5, 5),
        BinOpr::Arith(ArithOp::BOr) => (4, 4),
        BinOpr::Arith(ArithOp::Unm | ArithOp::BNot) => (UNARY_PRIORITY, UNARY_PRIORITY),
        BinOpr::Eq | BinOpr::Ne | BinOpr::Lt | BinOpr::Le | BinOpr::Gt | BinOpr::Ge => (3, 3),
        BinOpr::And => (2, 2),
        BinOpr::Or => (1, 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> Proto {
        Parser::new(src.as_bytes(), "=test")
            .and_then(Parser::parse_main)
            .unwrap_or_else(|e| panic!("compile failed: {e}"))
    }

    fn compile_err(src: &str) -> String {
        match Parser::new(src.as_bytes(), "=test").and_then(Parser::parse_main) {
            Ok(_) => panic!("expected a compile error for {src:?}"),
            Err(e) => e.to_string(),
        }
    }

    #[test]
    fn empty_chunk_is_a_single_return() {
        let p = compile("");
        assert_eq!(p.instructions, vec![OpCode::Return { first: 0, count: 1 }]);
        assert!(p.is_vararg);
        assert_eq!(p.max_stack, 2);
    }

    #[test]
    fn local_with_constant() {
        let p = compile("local x = 10");
        assert_eq!(p.instructions[0], OpCode::LoadK { dst: 0, const_idx: 0 });
        assert_eq!(p.debug.local_vars[0].name, LuaStr::from("x"));
        assert_eq!(p.debug.local_vars[0].start_pc, 1);
    }

    #[test]
    fn constants_are_folded() {
        let p = compile("return 2 * 3 + 1");
        assert_eq!(p.constants, vec![lua_core::Constant::Integer(7)]);
    }

    #[test]
    fn division_by_zero_is_not_folded() {
        let p = compile("return 1 // 0");
        assert!(p.instructions.iter().any(|i| matches!(i, OpCode::IDiv { .. })));
    }

    #[test]
    fn single_call_return_is_a_tail_call() {
        let p = compile("local function f() return f() end");
        let inner = &p.protos[0];
        assert!(matches!(inner.instructions[1], OpCode::TailCall { .. }));
        assert!(matches!(inner.upvalue_descs[0], UpvalueDesc::Stack(0)));
    }

    #[test]
    fn globals_use_name_constants() {
        let p = compile("x = y");
        assert!(matches!(p.instructions[0], OpCode::GetGlobal { dst: 0, .. }));
        assert!(matches!(p.instructions[1], OpCode::SetGlobal { src: 0, .. }));
    }

    #[test]
    fn upvalues_resolve_through_levels() {
        let p = compile("local a; return function() return function() return a end end");
        let mid = &p.protos[0];
        let inner = &mid.protos[0];
        assert_eq!(mid.upvalue_descs, vec![UpvalueDesc::Stack(0)]);
        assert_eq!(inner.upvalue_descs, vec![UpvalueDesc::Upvalue(0)]);
    }

    #[test]
    fn numeric_for_jumps_are_balanced() {
        let p = compile("for i = 1, 3 do end");
        let prep = p
            .instructions
            .iter()
            .position(|i| matches!(i, OpCode::ForPrep { .. }))
            .unwrap();
        let lp = p
            .instructions
            .iter()
            .position(|i| matches!(i, OpCode::ForLoop { .. }))
            .unwrap();
        let OpCode::ForPrep { offset, .. } = p.instructions[prep] else { unreachable!() };
        let OpCode::ForLoop { offset: back, .. } = p.instructions[lp] else { unreachable!() };
        // FORPREP skips past the loop; FORLOOP returns to the body.
        assert_eq!(prep as i32 + 1 + offset, lp as i32 + 1);
        assert_eq!(lp as i32 + 1 + back, prep as i32 + 1);
    }

    #[test]
    fn closures_in_loops_close_upvalues() {
        let p = compile("for i = 1, 2 do local x = i; f = function() return x end end");
        assert!(p.instructions.iter().any(|i| matches!(i, OpCode::Close { .. })));
    }

    #[test]
    fn break_closes_captured_locals() {
        let p = compile("while true do local x; g = function() return x end; break end");
        assert!(p.instructions.iter().any(|i| matches!(i, OpCode::Jmp { close: 1, .. })));
    }

    #[test]
    fn long_constructors_flush_in_batches() {
        let items: Vec<String> = (1..=60).map(|i| i.to_string()).collect();
        let p = compile(&format!("return {{{}}}", items.join(",")));
        let batches: Vec<_> = p
            .instructions
            .iter()
            .filter_map(|i| match i {
                OpCode::SetList { count, batch, .. } => Some((*count, *batch)),
                _ => None,
            })
            .collect();
        assert_eq!(batches, vec![(50, 1), (10, 2)]);
        assert!(matches!(p.instructions[0], OpCode::NewTable { array_hint: 60, hash_hint: 0, .. }));
    }

    #[test]
    fn open_last_constructor_item() {
        let p = compile("return {f()}");
        assert!(p
            .instructions
            .iter()
            .any(|i| matches!(i, OpCode::SetList { count: 0, batch: 1, .. })));
    }

    #[test]
    fn method_definition_gets_self() {
        let p = compile("function a.b:c(x) return self end");
        let m = &p.protos[0];
        assert_eq!(m.param_count, 2);
        assert_eq!(m.debug.local_vars[0].name, LuaStr::from("self"));
    }

    #[test]
    fn assignment_conflict_uses_a_copy() {
        let p = compile("local a = {} a.x, a = 1, 2");
        assert!(p.instructions.iter().any(|i| matches!(i, OpCode::Move { dst: 1, src: 0 })));
    }

    #[test]
    fn goto_continue_is_allowed() {
        compile("for i = 1, 3 do local x = i if x then goto continue end ::continue:: end");
    }

    #[test]
    fn syntax_errors() {
        assert_eq!(compile_err("x = = 1"), "test:1: unexpected symbol near '='");
        assert_eq!(compile_err("x"), "test:1: syntax error near <eof>");
        assert_eq!(compile_err("break"), "test:1: no loop to break near <eof>");
        assert_eq!(
            compile_err("if x then\n\nx = 1"),
            "test:3: 'end' expected (to close 'if' at line 1) near <eof>"
        );
        assert_eq!(
            compile_err("function f() return ... end"),
            "test:1: cannot use '...' outside a vararg function near '...'"
        );
        assert_eq!(compile_err("return 1 2"), "test:1: '<eof>' expected near '2'");
    }

    #[test]
    fn goto_errors() {
        assert_eq!(compile_err("goto nowhere"), "test:1: no visible label 'nowhere' for <goto> at line 1");
        assert_eq!(
            compile_err("goto l; local x; ::l:: print(x)"),
            "test:1: <goto l> at line 1 jumps into the scope of local 'x'"
        );
        assert_eq!(
            compile_err("::a:: ::a::"),
            "test:1: label 'a' already defined on line 1"
        );
    }

    #[test]
    fn nesting_limit() {
        let src = format!("return {}1{}", "(".repeat(300), ")".repeat(300));
        assert!(compile_err(&src).contains("chunk has too many syntax levels"));
    }

    #[test]
    fn nesting_limit_on_a_default_thread_stack() {
        let handle = std::thread::spawn(|| {
            let exprs = format!("return {}1{}", "(".repeat(300), ")".repeat(300));
            let blocks = format!("{}{}", "do ".repeat(300), "end ".repeat(300));
            let tables = format!("return {}{}", "{".repeat(150), "}".repeat(150));
            (compile_err(&exprs), compile_err(&blocks), compile(&tables).instructions.len())
        });
        let (exprs, blocks, table_code) = handle.join().unwrap();
        assert!(exprs.contains("chunk has too many syntax levels"));
        assert!(blocks.contains("chunk has too many syntax levels"));
        assert!(table_code > 150);
    }

    #[test]
    fn line_info_follows_source() {
        let p = compile("local a = 1\n\nlocal b = a + x");
        assert_eq!(p.debug.line_info.len(), p.instructions.len());
        assert_eq!(p.debug.line_info[0], 1);
        assert!(p.debug.line_info.contains(&3));
    }
}
