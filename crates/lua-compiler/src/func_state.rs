//! Per-function code generation state: instruction buffer, constant pool,
//! register allocation, scopes and jump patching.

use std::sync::Arc;

use lua_core::number::{self, ArithOp, Number};
use lua_core::opcode::{FIELDS_PER_FLUSH, MAXARG_BX, MAXARG_C, MAXARG_SBX, MAX_INDEX_RK};
use lua_core::{CompileError, Constant, LocalVar, LuaStr, OpCode, Proto, Rk, UpvalueDesc};
use rustc_hash::FxHashMap;

use crate::expdesc::{ExpDesc, ExpKind, JumpList};

/// Registers available to one function.
pub const MAX_REGS: usize = 250;
/// Active locals per function.
pub const MAX_VARS: usize = 200;
/// Upvalues per function.
pub const MAX_UPVALUES: usize = 60;

/// Marks a `TestSet` whose destination has not been decided.
pub const NO_REG: u8 = u8::MAX;

/// `results`/`count` value meaning "all values".
pub const MULTRET: i32 = -1;

pub type CResult<T> = Result<T, CompileError>;

// ── Scopes ────────────────────────────────────────────────────────────────────

/// A lexical block: what to undo when it ends.
#[derive(Debug, Clone)]
pub struct BlockScope {
    /// Active locals outside the block.
    pub nactvar: u8,
    /// Some local of this block is captured by a closure.
    pub has_upvalue: bool,
    pub is_loop: bool,
    pub break_list: JumpList,
    pub first_label: usize,
    pub first_goto: usize,
}

#[derive(Debug, Clone)]
pub struct LabelDesc {
    pub name: LuaStr,
    pub pc: usize,
    pub line: u32,
    /// Active locals at the label.
    pub nactvar: u8,
}

/// A goto whose label has not been seen yet.
#[derive(Debug, Clone)]
pub struct GotoDesc {
    pub name: LuaStr,
    pub jumps: JumpList,
    pub line: u32,
    pub nactvar: u8,
}

/// Binary operators as the code generator sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOpr {
    Arith(ArithOp),
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOpr {
    Minus,
    BNot,
    Not,
    Len,
}

/// Structural constant key; `1` and `1.0` stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Nil,
    Bool(bool),
    Int(i64),
    Flt(u64),
    Str(LuaStr),
}

// ── FuncState ─────────────────────────────────────────────────────────────────

pub struct FuncState {
    pub proto: Proto,
    k_cache: FxHashMap<ConstKey, u32>,
    /// First free register.
    pub free_reg: u8,
    /// Number of active locals.
    pub nactvar: u8,
    /// Declared locals (active and pending) as indices into `local_vars`.
    actvar: Vec<usize>,
    pub blocks: Vec<BlockScope>,
    /// Jumps to the next instruction emitted.
    jpc: JumpList,
    pub labels: Vec<LabelDesc>,
    pub gotos: Vec<GotoDesc>,
    /// Line recorded for emitted instructions.
    pub line: u32,
    chunk: String,
}

impl FuncState {
    pub fn new(source: &str, chunk: &str, line_defined: u32) -> Self {
        let mut proto = Proto::new(source);
        proto.line_defined = line_defined;
        Self {
            proto,
            k_cache: FxHashMap::default(),
            free_reg: 0,
            nactvar: 0,
            actvar: Vec::new(),
            blocks: Vec::new(),
            jpc: JumpList::new(),
            labels: Vec::new(),
            gotos: Vec::new(),
            line: line_defined.max(1),
            chunk: chunk.to_string(),
        }
    }

    pub fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::Syntax {
            chunk: self.chunk.clone(),
            line: self.line,
            message: message.into(),
        }
    }

    fn error_limit(&self, limit: usize, what: &str) -> CompileError {
        let owner = if self.proto.line_defined == 0 {
            "main function".to_string()
        } else {
            format!("function at line {}", self.proto.line_defined)
        };
        self.error(format!("{owner} has more than {limit} {what}"))
    }

    pub fn pc(&self) -> usize {
        self.proto.instructions.len()
    }

    /// Finish the prototype; registers beyond the last use are dropped.
    pub fn into_proto(mut self) -> Proto {
        self.proto.max_stack = self.proto.max_stack.max(2);
        self.proto
    }

    // ── emission ──────────────────────────────────────────────────────────

    pub fn emit(&mut self, op: OpCode) -> CResult<usize> {
        self.discharge_jpc()?;
        self.proto.instructions.push(op);
        self.proto.debug.line_info.push(self.line);
        Ok(self.pc() - 1)
    }

    /// Attribute the last instruction to `line`.
    pub fn fix_line(&mut self, line: u32) {
        if let Some(last) = self.proto.debug.line_info.last_mut() {
            *last = line;
        }
    }

    fn remove_last(&mut self) {
        self.proto.instructions.pop();
        self.proto.debug.line_info.pop();
    }

    pub fn code_k(&mut self, reg: u8, k: u32) -> CResult<usize> {
        self.emit(OpCode::LoadK { dst: reg, const_idx: k })
    }

    pub fn code_nil(&mut self, from: u8, count: u8) -> CResult<usize> {
        self.emit(OpCode::LoadNil { dst: from, count })
    }

    pub fn ret(&mut self, first: u8, nret: i32) -> CResult<usize> {
        self.emit(OpCode::Return { first, count: (nret + 1) as u16 })
    }

    // ── constants ─────────────────────────────────────────────────────────

    fn add_constant(&mut self, key: ConstKey, value: Constant) -> CResult<u32> {
        if let Some(&idx) = self.k_cache.get(&key) {
            return Ok(idx);
        }
        let idx = self.proto.constants.len();
        if idx > MAXARG_BX as usize {
            return Err(self.error("constant table overflow"));
        }
        self.proto.constants.push(value);
        self.k_cache.insert(key, idx as u32);
        Ok(idx as u32)
    }

    pub fn string_k(&mut self, s: &LuaStr) -> CResult<u32> {
        self.add_constant(ConstKey::Str(s.clone()), Constant::Str(s.clone()))
    }

    pub fn int_k(&mut self, i: i64) -> CResult<u32> {
        self.add_constant(ConstKey::Int(i), Constant::Integer(i))
    }

    pub fn float_k(&mut self, f: f64) -> CResult<u32> {
        self.add_constant(ConstKey::Flt(f.to_bits()), Constant::Float(f))
    }

    fn bool_k(&mut self, b: bool) -> CResult<u32> {
        self.add_constant(ConstKey::Bool(b), Constant::Boolean(b))
    }

    fn nil_k(&mut self) -> CResult<u32> {
        self.add_constant(ConstKey::Nil, Constant::Nil)
    }

    pub fn add_proto(&mut self, proto: Proto) -> CResult<u32> {
        let idx = self.proto.protos.len();
        if idx >= MAXARG_BX as usize {
            return Err(self.error_limit(MAXARG_BX as usize, "functions"));
        }
        self.proto.protos.push(Arc::new(proto));
        Ok(idx as u32)
    }

    // ── registers ─────────────────────────────────────────────────────────

    pub fn check_stack(&mut self, n: usize) -> CResult<()> {
        let new_stack = self.free_reg as usize + n;
        if new_stack > self.proto.max_stack as usize {
            if new_stack >= MAX_REGS {
                return Err(self.error("function or expression too complex"));
            }
            self.proto.max_stack = new_stack as u8;
        }
        Ok(())
    }

    pub fn reserve_regs(&mut self, n: usize) -> CResult<()> {
        self.check_stack(n)?;
        self.free_reg += n as u8;
        Ok(())
    }

    fn free_reg(&mut self, reg: u8) {
        if reg >= self.nactvar && reg != NO_REG {
            self.free_reg -= 1;
            debug_assert_eq!(reg, self.free_reg);
        }
    }

    fn free_rk(&mut self, rk: Rk) {
        if let Rk::Reg(r) = rk {
            self.free_reg(r);
        }
    }

    pub fn free_exp(&mut self, e: &ExpDesc) {
        if let ExpKind::NonReloc(r) = e.kind {
            self.free_reg(r);
        }
    }

    /// Free two operands, higher register first.
    fn free_exps(&mut self, e1: &ExpDesc, e2: &ExpDesc) {
        let r1 = match e1.kind {
            ExpKind::NonReloc(r) => Some(r),
            _ => None,
        };
        let r2 = match e2.kind {
            ExpKind::NonReloc(r) => Some(r),
            _ => None,
        };
        if r1 > r2 {
            self.free_exp(e1);
            self.free_exp(e2);
        } else {
            self.free_exp(e2);
            self.free_exp(e1);
        }
    }

    // ── locals & upvalues ─────────────────────────────────────────────────

    pub fn new_localvar(&mut self, name: LuaStr) -> CResult<()> {
        if self.actvar.len() + 1 > MAX_VARS {
            return Err(self.error_limit(MAX_VARS, "local variables"));
        }
        self.proto.debug.local_vars.push(LocalVar { name, start_pc: 0, end_pc: 0 });
        self.actvar.push(self.proto.debug.local_vars.len() - 1);
        Ok(())
    }

    /// Activate the last `n` declared locals.
    pub fn adjust_local_vars(&mut self, n: usize) {
        let pc = self.pc() as u32;
        for _ in 0..n {
            let idx = self.actvar[self.nactvar as usize];
            self.proto.debug.local_vars[idx].start_pc = pc;
            self.nactvar += 1;
        }
    }

    pub fn remove_vars(&mut self, to_level: u8) {
        let pc = self.pc() as u32;
        while self.nactvar > to_level {
            self.nactvar -= 1;
            let idx = self.actvar[self.nactvar as usize];
            self.proto.debug.local_vars[idx].end_pc = pc;
        }
        self.actvar.truncate(to_level as usize);
    }

    /// Debug record of active local `i`.
    pub fn local_var_mut(&mut self, i: u8) -> &mut LocalVar {
        let idx = self.actvar[i as usize];
        &mut self.proto.debug.local_vars[idx]
    }

    pub fn local_var_name(&self, i: u8) -> Option<&LuaStr> {
        self.actvar
            .get(i as usize)
            .map(|&idx| &self.proto.debug.local_vars[idx].name)
    }

    /// Register of the innermost active local called `name`.
    pub fn search_var(&self, name: &LuaStr) -> Option<u8> {
        (0..self.nactvar)
            .rev()
            .find(|&i| self.local_var_name(i) == Some(name))
    }

    pub fn search_upvalue(&self, name: &LuaStr) -> Option<u8> {
        self.proto
            .debug
            .upvalue_names
            .iter()
            .position(|n| n == name)
            .map(|i| i as u8)
    }

    pub fn new_upvalue(&mut self, name: LuaStr, desc: UpvalueDesc) -> CResult<u8> {
        let idx = self.proto.upvalue_descs.len();
        if idx >= MAX_UPVALUES {
            return Err(self.error_limit(MAX_UPVALUES, "upvalues"));
        }
        self.proto.upvalue_descs.push(desc);
        self.proto.debug.upvalue_names.push(name);
        Ok(idx as u8)
    }

    /// Flag the block owning local `reg` as holding a captured variable.
    pub fn mark_upval(&mut self, reg: u8) {
        if let Some(bl) = self.blocks.iter_mut().rev().find(|bl| bl.nactvar <= reg) {
            bl.has_upvalue = true;
        }
    }

    // ── jumps ─────────────────────────────────────────────────────────────

    /// Mark the current pc as a jump target.
    pub fn get_label(&mut self) -> usize {
        self.pc()
    }

    /// Emit an unconditional jump, absorbing jumps pending to this point.
    pub fn jump(&mut self) -> CResult<JumpList> {
        let pending = self.jpc.take();
        let pc = self.emit(OpCode::Jmp { offset: 0, close: 0 })?;
        let mut list = JumpList::single(pc);
        list.append(pending);
        Ok(list)
    }

    /// Jump back to `target`.
    pub fn jump_to(&mut self, target: usize) -> CResult<()> {
        let list = self.jump()?;
        self.patch_list(list, target)
    }

    fn cond_jump(&mut self, op: OpCode) -> CResult<usize> {
        self.emit(op)?;
        let pc = self.emit(OpCode::Jmp { offset: 0, close: 0 })?;
        Ok(pc)
    }

    pub fn fix_jump(&mut self, pc: usize, dest: usize) -> CResult<()> {
        let offset = dest as i64 - (pc as i64 + 1);
        if offset.abs() > MAXARG_SBX as i64 {
            return Err(self.error("control structure too long"));
        }
        self.proto.instructions[pc].set_jump_offset(offset as i32);
        Ok(())
    }

    fn jump_control(&self, pc: usize) -> usize {
        if pc >= 1
            && matches!(
                self.proto.instructions[pc - 1],
                OpCode::Eq { .. }
                    | OpCode::Lt { .. }
                    | OpCode::Le { .. }
                    | OpCode::Test { .. }
                    | OpCode::TestSet { .. }
            )
        {
            pc - 1
        } else {
            pc
        }
    }

    /// Resolve a `TestSet` guarding the jump at `node`: give it destination
    /// `reg`, or degrade it to `Test` when no value is wanted.
    fn patch_test_reg(&mut self, node: usize, reg: u8) -> bool {
        let i = self.jump_control(node);
        let OpCode::TestSet { src, expect, .. } = self.proto.instructions[i] else {
            return false;
        };
        self.proto.instructions[i] = if reg != NO_REG && reg != src {
            OpCode::TestSet { dst: reg, src, expect }
        } else {
            OpCode::Test { src, expect }
        };
        true
    }

    fn remove_values(&mut self, list: &JumpList) {
        for pc in list.iter() {
            self.patch_test_reg(pc, NO_REG);
        }
    }

    fn patch_list_aux(&mut self, list: JumpList, vtarget: usize, reg: u8, dtarget: usize) -> CResult<()> {
        for pc in list.iter() {
            if self.patch_test_reg(pc, reg) {
                self.fix_jump(pc, vtarget)?;
            } else {
                self.fix_jump(pc, dtarget)?;
            }
        }
        Ok(())
    }

    fn discharge_jpc(&mut self) -> CResult<()> {
        let pc = self.pc();
        let list = self.jpc.take();
        self.patch_list_aux(list, pc, NO_REG, pc)
    }

    pub fn patch_list(&mut self, list: JumpList, target: usize) -> CResult<()> {
        if target == self.pc() {
            self.patch_to_here(list);
            Ok(())
        } else {
            self.patch_list_aux(list, target, NO_REG, target)
        }
    }

    pub fn patch_to_here(&mut self, list: JumpList) {
        self.get_label();
        self.jpc.append(list);
    }

    /// Make the jumps in `list` close upvalues from `level` up.
    pub fn patch_close(&mut self, list: &JumpList, level: u8) {
        for pc in list.iter() {
            if let OpCode::Jmp { close, .. } = &mut self.proto.instructions[pc] {
                *close = level + 1;
            }
        }
    }

    fn need_value(&self, list: &JumpList) -> bool {
        list.iter().any(|pc| {
            !matches!(
                self.proto.instructions[self.jump_control(pc)],
                OpCode::TestSet { .. }
            )
        })
    }

    fn invert_jump(&mut self, pc: usize) {
        let i = self.jump_control(pc);
        match &mut self.proto.instructions[i] {
            OpCode::Eq { expect, .. }
            | OpCode::Lt { expect, .. }
            | OpCode::Le { expect, .. }
            | OpCode::Test { expect, .. }
            | OpCode::TestSet { expect, .. } => *expect = !*expect,
            _ => {}
        }
    }

    // ── multiple results ──────────────────────────────────────────────────

    pub fn set_returns(&mut self, e: &mut ExpDesc, nresults: i32) -> CResult<()> {
        match e.kind {
            ExpKind::Call(pc) => {
                if let OpCode::Call { results, .. } = &mut self.proto.instructions[pc] {
                    *results = (nresults + 1) as u16;
                }
            }
            ExpKind::VarArg(pc) => {
                let free = self.free_reg;
                if let OpCode::VarArg { dst, count } = &mut self.proto.instructions[pc] {
                    *count = (nresults + 1) as u16;
                    *dst = free;
                }
                self.reserve_regs(1)?;
            }
            _ => {}
        }
        Ok(())
    }

    pub fn set_one_ret(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Call(pc) => {
                if let OpCode::Call { func, .. } = self.proto.instructions[pc] {
                    e.kind = ExpKind::NonReloc(func);
                }
            }
            ExpKind::VarArg(pc) => {
                if let OpCode::VarArg { count, .. } = &mut self.proto.instructions[pc] {
                    *count = 2;
                }
                e.kind = ExpKind::Reloc(pc);
            }
            _ => {}
        }
    }

    // ── discharging ───────────────────────────────────────────────────────

    pub fn discharge_vars(&mut self, e: &mut ExpDesc) -> CResult<()> {
        match e.kind {
            ExpKind::Local(r) => e.kind = ExpKind::NonReloc(r),
            ExpKind::Upval(idx) => {
                e.kind = ExpKind::Reloc(self.emit(OpCode::GetUpval { dst: 0, upval: idx })?);
            }
            ExpKind::Global(name) => {
                e.kind = ExpKind::Reloc(self.emit(OpCode::GetGlobal { dst: 0, name })?);
            }
            ExpKind::Indexed { table, key } => {
                self.free_rk(key);
                self.free_reg(table);
                e.kind = ExpKind::Reloc(self.emit(OpCode::GetTable { dst: 0, table, key })?);
            }
            ExpKind::Call(_) | ExpKind::VarArg(_) => self.set_one_ret(e),
            _ => {}
        }
        Ok(())
    }

    fn discharge_to_reg(&mut self, e: &mut ExpDesc, reg: u8) -> CResult<()> {
        self.discharge_vars(e)?;
        match e.kind.clone() {
            ExpKind::Nil => {
                self.code_nil(reg, 1)?;
            }
            ExpKind::False | ExpKind::True => {
                let value = e.kind == ExpKind::True;
                self.emit(OpCode::LoadBool { dst: reg, value, skip: false })?;
            }
            ExpKind::KStr(s) => {
                let k = self.string_k(&s)?;
                self.code_k(reg, k)?;
            }
            ExpKind::KInt(i) => {
                let k = self.int_k(i)?;
                self.code_k(reg, k)?;
            }
            ExpKind::KFlt(f) => {
                let k = self.float_k(f)?;
                self.code_k(reg, k)?;
            }
            ExpKind::Const(k) => {
                self.code_k(reg, k)?;
            }
            ExpKind::Reloc(pc) => set_dst(&mut self.proto.instructions[pc], reg),
            ExpKind::NonReloc(r) => {
                if r != reg {
                    self.emit(OpCode::Move { dst: reg, src: r })?;
                }
            }
            // Jumps are resolved by the caller.
            _ => return Ok(()),
        }
        e.kind = ExpKind::NonReloc(reg);
        Ok(())
    }

    fn discharge_to_any_reg(&mut self, e: &mut ExpDesc) -> CResult<()> {
        if !matches!(e.kind, ExpKind::NonReloc(_)) {
            self.reserve_regs(1)?;
            let reg = self.free_reg - 1;
            self.discharge_to_reg(e, reg)?;
        }
        Ok(())
    }

    fn code_label(&mut self, reg: u8, value: bool, skip: bool) -> CResult<usize> {
        self.get_label();
        self.emit(OpCode::LoadBool { dst: reg, value, skip })
    }

    fn exp_to_reg(&mut self, e: &mut ExpDesc, reg: u8) -> CResult<()> {
        self.discharge_to_reg(e, reg)?;
        let is_jump = matches!(e.kind, ExpKind::Jump(_));
        if let ExpKind::Jump(pc) = e.kind {
            e.t.push(pc);
        }
        if e.has_jumps() {
            let mut p_f = None;
            let mut p_t = None;
            if self.need_value(&e.t) || self.need_value(&e.f) {
                let fj = if is_jump { JumpList::new() } else { self.jump()? };
                p_f = Some(self.code_label(reg, false, true)?);
                p_t = Some(self.code_label(reg, true, false)?);
                self.patch_to_here(fj);
            }
            let end = self.get_label();
            let f = e.f.take();
            let t = e.t.take();
            self.patch_list_aux(f, end, reg, p_f.unwrap_or(end))?;
            self.patch_list_aux(t, end, reg, p_t.unwrap_or(end))?;
        }
        e.t = JumpList::new();
        e.f = JumpList::new();
        e.kind = ExpKind::NonReloc(reg);
        Ok(())
    }

    pub fn exp_to_next_reg(&mut self, e: &mut ExpDesc) -> CResult<()> {
        self.discharge_vars(e)?;
        self.free_exp(e);
        self.reserve_regs(1)?;
        let reg = self.free_reg - 1;
        self.exp_to_reg(e, reg)
    }

    pub fn exp_to_any_reg(&mut self, e: &mut ExpDesc) -> CResult<u8> {
        self.discharge_vars(e)?;
        if let ExpKind::NonReloc(r) = e.kind {
            if !e.has_jumps() {
                return Ok(r);
            }
            if r >= self.nactvar {
                self.exp_to_reg(e, r)?;
                return Ok(r);
            }
        }
        self.exp_to_next_reg(e)?;
        match e.kind {
            ExpKind::NonReloc(r) => Ok(r),
            _ => Err(self.error("expression did not reach a register")),
        }
    }

    pub fn exp_to_val(&mut self, e: &mut ExpDesc) -> CResult<()> {
        if e.has_jumps() {
            self.exp_to_any_reg(e)?;
            Ok(())
        } else {
            self.discharge_vars(e)
        }
    }

    pub fn exp_to_rk(&mut self, e: &mut ExpDesc) -> CResult<Rk> {
        self.exp_to_val(e)?;
        let k = match e.kind.clone() {
            ExpKind::Nil => Some(self.nil_k()?),
            ExpKind::True => Some(self.bool_k(true)?),
            ExpKind::False => Some(self.bool_k(false)?),
            ExpKind::KInt(i) => Some(self.int_k(i)?),
            ExpKind::KFlt(f) => Some(self.float_k(f)?),
            ExpKind::KStr(s) => Some(self.string_k(&s)?),
            ExpKind::Const(k) => Some(k),
            _ => None,
        };
        if let Some(k) = k {
            e.kind = ExpKind::Const(k);
            if k <= MAX_INDEX_RK {
                return Ok(Rk::Const(k as u8));
            }
        }
        Ok(Rk::Reg(self.exp_to_any_reg(e)?))
    }

    pub fn store_var(&mut self, var: &ExpDesc, ex: &mut ExpDesc) -> CResult<()> {
        match var.kind {
            ExpKind::Local(reg) => {
                self.free_exp(ex);
                return self.exp_to_reg(ex, reg);
            }
            ExpKind::Upval(upval) => {
                let src = self.exp_to_any_reg(ex)?;
                self.emit(OpCode::SetUpval { src, upval })?;
            }
            ExpKind::Global(name) => {
                let src = self.exp_to_any_reg(ex)?;
                self.emit(OpCode::SetGlobal { src, name })?;
            }
            ExpKind::Indexed { table, key } => {
                let val = self.exp_to_rk(ex)?;
                self.emit(OpCode::SetTable { table, key, val })?;
            }
            _ => return Err(self.error("syntax error")),
        }
        self.free_exp(ex);
        Ok(())
    }

    /// `e:key(...)` prologue: method in `R[func]`, receiver in `R[func+1]`.
    pub fn self_op(&mut self, e: &mut ExpDesc, key: &mut ExpDesc) -> CResult<()> {
        let obj = self.exp_to_any_reg(e)?;
        self.free_exp(e);
        let func = self.free_reg;
        self.reserve_regs(2)?;
        let key_rk = self.exp_to_rk(key)?;
        self.emit(OpCode::Method { dst: func, obj, key: key_rk })?;
        self.free_exp(key);
        e.kind = ExpKind::NonReloc(func);
        Ok(())
    }

    /// Turn `t` (in a register) into `t[k]`.
    pub fn indexed(&mut self, t: &mut ExpDesc, k: &mut ExpDesc) -> CResult<()> {
        let table = match t.kind {
            ExpKind::NonReloc(r) | ExpKind::Local(r) => r,
            _ => self.exp_to_any_reg(t)?,
        };
        let key = self.exp_to_rk(k)?;
        t.kind = ExpKind::Indexed { table, key };
        Ok(())
    }

    // ── conditionals ──────────────────────────────────────────────────────

    fn jump_on_cond(&mut self, e: &mut ExpDesc, cond: bool) -> CResult<usize> {
        if let ExpKind::Reloc(pc) = e.kind {
            if let (true, OpCode::Not { src, .. }) = (pc + 1 == self.pc(), self.proto.instructions[pc]) {
                // Drop the NOT and test its operand with the opposite sense.
                self.remove_last();
                return self.cond_jump(OpCode::Test { src, expect: !cond });
            }
        }
        self.discharge_to_any_reg(e)?;
        self.free_exp(e);
        let src = match e.kind {
            ExpKind::NonReloc(r) => r,
            _ => return Err(self.error("expression did not reach a register")),
        };
        self.cond_jump(OpCode::TestSet { dst: NO_REG, src, expect: cond })
    }

    /// Fall through when `e` is true; collect the false exits in `e.f`.
    pub fn go_if_true(&mut self, e: &mut ExpDesc) -> CResult<()> {
        self.discharge_vars(e)?;
        let pc = match e.kind {
            ExpKind::Jump(pc) => {
                self.invert_jump(pc);
                Some(pc)
            }
            ExpKind::KInt(_) | ExpKind::KFlt(_) | ExpKind::KStr(_) | ExpKind::Const(_) | ExpKind::True => {
                None
            }
            _ => Some(self.jump_on_cond(e, false)?),
        };
        if let Some(pc) = pc {
            e.f.push(pc);
        }
        let t = e.t.take();
        self.patch_to_here(t);
        Ok(())
    }

    /// Fall through when `e` is false; collect the true exits in `e.t`.
    pub fn go_if_false(&mut self, e: &mut ExpDesc) -> CResult<()> {
        self.discharge_vars(e)?;
        let pc = match e.kind {
            ExpKind::Jump(pc) => Some(pc),
            ExpKind::Nil | ExpKind::False => None,
            _ => Some(self.jump_on_cond(e, true)?),
        };
        if let Some(pc) = pc {
            e.t.push(pc);
        }
        let f = e.f.take();
        self.patch_to_here(f);
        Ok(())
    }

    fn code_not(&mut self, e: &mut ExpDesc) -> CResult<()> {
        self.discharge_vars(e)?;
        match e.kind {
            ExpKind::Nil | ExpKind::False => e.kind = ExpKind::True,
            ExpKind::KInt(_) | ExpKind::KFlt(_) | ExpKind::KStr(_) | ExpKind::Const(_) | ExpKind::True => {
                e.kind = ExpKind::False
            }
            ExpKind::Jump(pc) => self.invert_jump(pc),
            ExpKind::Reloc(_) | ExpKind::NonReloc(_) => {
                self.discharge_to_any_reg(e)?;
                self.free_exp(e);
                if let ExpKind::NonReloc(src) = e.kind {
                    e.kind = ExpKind::Reloc(self.emit(OpCode::Not { dst: 0, src })?);
                }
            }
            _ => return Err(self.error("cannot negate expression")),
        }
        std::mem::swap(&mut e.t, &mut e.f);
        self.remove_values(&e.f);
        self.remove_values(&e.t);
        Ok(())
    }

    // ── operators ─────────────────────────────────────────────────────────

    pub fn prefix(&mut self, op: UnOpr, e: &mut ExpDesc, line: u32) -> CResult<()> {
        match op {
            UnOpr::Minus | UnOpr::BNot => {
                let arith = if op == UnOpr::Minus { ArithOp::Unm } else { ArithOp::BNot };
                if let Some(n) = e.numeral() {
                    if let Some(kind) = fold(arith, n, Number::Int(0)) {
                        e.kind = kind;
                        return Ok(());
                    }
                }
                self.code_unary(op, e, line)
            }
            UnOpr::Len => self.code_unary(op, e, line),
            UnOpr::Not => self.code_not(e),
        }
    }

    fn code_unary(&mut self, op: UnOpr, e: &mut ExpDesc, line: u32) -> CResult<()> {
        let src = self.exp_to_any_reg(e)?;
        self.free_exp(e);
        let ins = match op {
            UnOpr::Minus => OpCode::Unm { dst: 0, src },
            UnOpr::BNot => OpCode::BNot { dst: 0, src },
            _ => OpCode::Len { dst: 0, src },
        };
        e.kind = ExpKind::Reloc(self.emit(ins)?);
        self.fix_line(line);
        Ok(())
    }

    /// Prepare the left operand before the right one is parsed.
    pub fn infix(&mut self, op: BinOpr, v: &mut ExpDesc) -> CResult<()> {
        match op {
            BinOpr::And => self.go_if_true(v),
            BinOpr::Or => self.go_if_false(v),
            BinOpr::Concat => self.exp_to_next_reg(v),
            BinOpr::Arith(_) => {
                if v.numeral().is_none() {
                    self.exp_to_rk(v)?;
                }
                Ok(())
            }
            _ => {
                self.exp_to_rk(v)?;
                Ok(())
            }
        }
    }

    pub fn posfix(&mut self, op: BinOpr, e1: &mut ExpDesc, mut e2: ExpDesc, line: u32) -> CResult<()> {
        match op {
            BinOpr::And => {
                debug_assert!(e1.t.is_empty());
                self.discharge_vars(&mut e2)?;
                let f = e1.f.take();
                e2.f.append(f);
                *e1 = e2;
            }
            BinOpr::Or => {
                debug_assert!(e1.f.is_empty());
                self.discharge_vars(&mut e2)?;
                let t = e1.t.take();
                e2.t.append(t);
                *e1 = e2;
            }
            BinOpr::Concat => {
                self.exp_to_val(&mut e2)?;
                let merged = match (e1.kind.clone(), e2.kind.clone()) {
                    (ExpKind::NonReloc(r), ExpKind::Reloc(pc)) => match &mut self.proto.instructions[pc] {
                        OpCode::Concat { first, .. } if *first == r + 1 => {
                            *first = r;
                            Some(pc)
                        }
                        _ => None,
                    },
                    _ => None,
                };
                if let Some(pc) = merged {
                    self.free_exp(e1);
                    e1.kind = ExpKind::Reloc(pc);
                } else {
                    self.exp_to_next_reg(&mut e2)?;
                    let (ExpKind::NonReloc(first), ExpKind::NonReloc(last)) = (e1.kind.clone(), e2.kind.clone())
                    else {
                        return Err(self.error("concatenation operands not in registers"));
                    };
                    self.free_exps(e1, &e2);
                    e1.kind = ExpKind::Reloc(self.emit(OpCode::Concat { dst: 0, first, last })?);
                    self.fix_line(line);
                }
            }
            BinOpr::Arith(arith) => {
                if let (Some(a), Some(b)) = (e1.numeral(), e2.numeral()) {
                    if let Some(kind) = fold(arith, a, b) {
                        e1.kind = kind;
                        return Ok(());
                    }
                }
                self.code_arith(arith, e1, &mut e2, line)?;
            }
            BinOpr::Eq => self.code_comp(CompareOp::Eq, true, e1, &mut e2)?,
            BinOpr::Ne => self.code_comp(CompareOp::Eq, false, e1, &mut e2)?,
            BinOpr::Lt => self.code_comp(CompareOp::Lt, true, e1, &mut e2)?,
            BinOpr::Le => self.code_comp(CompareOp::Le, true, e1, &mut e2)?,
            BinOpr::Gt => self.code_comp(CompareOp::Lt, false, e1, &mut e2)?,
            BinOpr::Ge => self.code_comp(CompareOp::Le, false, e1, &mut e2)?,
        }
        Ok(())
    }

    fn code_arith(&mut self, op: ArithOp, e1: &mut ExpDesc, e2: &mut ExpDesc, line: u32) -> CResult<()> {
        let rhs = self.exp_to_rk(e2)?;
        let lhs = self.exp_to_rk(e1)?;
        self.free_exps(e1, e2);
        let dst = 0;
        let ins = match op {
            ArithOp::Add => OpCode::Add { dst, lhs, rhs },
            ArithOp::Sub => OpCode::Sub { dst, lhs, rhs },
            ArithOp::Mul => OpCode::Mul { dst, lhs, rhs },
            ArithOp::Div => OpCode::Div { dst, lhs, rhs },
            ArithOp::Mod => OpCode::Mod { dst, lhs, rhs },
            ArithOp::Pow => OpCode::Pow { dst, lhs, rhs },
            ArithOp::IDiv => OpCode::IDiv { dst, lhs, rhs },
            ArithOp::BAnd => OpCode::BAnd { dst, lhs, rhs },
            ArithOp::BOr => OpCode::BOr { dst, lhs, rhs },
            ArithOp::BXor => OpCode::BXor { dst, lhs, rhs },
            ArithOp::Shl => OpCode::Shl { dst, lhs, rhs },
            ArithOp::Shr => OpCode::Shr { dst, lhs, rhs },
            ArithOp::Unm | ArithOp::BNot => return Err(self.error("unary operator used as binary")),
        };
        e1.kind = ExpKind::Reloc(self.emit(ins)?);
        self.fix_line(line);
        Ok(())
    }

    fn code_comp(&mut self, op: CompareOp, cond: bool, e1: &mut ExpDesc, e2: &mut ExpDesc) -> CResult<()> {
        let mut lhs = self.exp_to_rk(e1)?;
        let mut rhs = self.exp_to_rk(e2)?;
        self.free_exps(e1, e2);
        let mut expect = cond;
        if !cond && op != CompareOp::Eq {
            // a > b  ==>  b < a
            std::mem::swap(&mut lhs, &mut rhs);
            expect = true;
        }
        let ins = match op {
            CompareOp::Eq => OpCode::Eq { expect, lhs, rhs },
            CompareOp::Lt => OpCode::Lt { expect, lhs, rhs },
            CompareOp::Le => OpCode::Le { expect, lhs, rhs },
        };
        e1.kind = ExpKind::Jump(self.cond_jump(ins)?);
        Ok(())
    }

    // ── table constructors ────────────────────────────────────────────────

    /// Flush `to_store` pending list items (`MULTRET`: up to top) into the
    /// table at `base`, `nelems` items having been seen so far.
    pub fn set_list(&mut self, base: u8, nelems: u32, to_store: i32) -> CResult<()> {
        let batch = (nelems.saturating_sub(1)) / FIELDS_PER_FLUSH + 1;
        let count = if to_store == MULTRET { 0 } else { to_store as u16 };
        if batch <= MAXARG_C {
            self.emit(OpCode::SetList { table: base, count, batch: batch as u16 })?;
        } else {
            self.emit(OpCode::SetList { table: base, count, batch: 0 })?;
            self.emit(OpCode::ExtraArg { value: batch })?;
        }
        self.free_reg = base + 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Lt,
    Le,
}

/// Fold an operation on two numerals, unless it would raise or produce a
/// value that has no stable constant form (NaN, signed zero).
fn fold(op: ArithOp, a: Number, b: Number) -> Option<ExpKind> {
    if op.is_bitwise() && (a.to_integer().is_none() || b.to_integer().is_none()) {
        return None;
    }
    if matches!(op, ArithOp::Div | ArithOp::IDiv | ArithOp::Mod) && b.to_f64() == 0.0 {
        return None;
    }
    match number::arith(op, a, b).ok()? {
        Number::Int(i) => Some(ExpKind::KInt(i)),
        Number::Float(f) if f.is_nan() || f == 0.0 => None,
        Number::Float(f) => Some(ExpKind::KFlt(f)),
    }
}

/// Point the destination of a relocatable instruction at `reg`.
fn set_dst(ins: &mut OpCode, reg: u8) {
    match ins {
        OpCode::Move { dst, .. }
        | OpCode::LoadK { dst, .. }
        | OpCode::LoadBool { dst, .. }
        | OpCode::LoadNil { dst, .. }
        | OpCode::GetUpval { dst, .. }
        | OpCode::GetGlobal { dst, .. }
        | OpCode::GetTable { dst, .. }
        | OpCode::NewTable { dst, .. }
        | OpCode::Add { dst, .. }
        | OpCode::Sub { dst, .. }
        | OpCode::Mul { dst, .. }
        | OpCode::Div { dst, .. }
        | OpCode::Mod { dst, .. }
        | OpCode::Pow { dst, .. }
        | OpCode::IDiv { dst, .. }
        | OpCode::BAnd { dst, .. }
        | OpCode::BOr { dst, .. }
        | OpCode::BXor { dst, .. }
        | OpCode::Shl { dst, .. }
        | OpCode::Shr { dst, .. }
        | OpCode::Unm { dst, .. }
        | OpCode::BNot { dst, .. }
        | OpCode::Not { dst, .. }
        | OpCode::Len { dst, .. }
        | OpCode::Concat { dst, .. }
        | OpCode::Closure { dst, .. }
        | OpCode::VarArg { dst, .. } => *dst = reg,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs() -> FuncState {
        FuncState::new("=test", "test", 0)
    }

    #[test]
    fn constants_are_deduplicated_by_kind() {
        let mut fs = fs();
        let a = fs.int_k(1).unwrap();
        let b = fs.float_k(1.0).unwrap();
        let c = fs.int_k(1).unwrap();
        let s1 = fs.string_k(&LuaStr::from("x")).unwrap();
        let s2 = fs.string_k(&LuaStr::from("x")).unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(s1, s2);
        assert_eq!(fs.proto.constants.len(), 3);
    }

    #[test]
    fn register_limit_is_enforced() {
        let mut fs = fs();
        assert!(fs.reserve_regs(MAX_REGS - 1).is_ok());
        let err = fs.reserve_regs(1).unwrap_err();
        assert!(err.to_string().contains("function or expression too complex"));
    }

    #[test]
    fn local_limit_names_the_function() {
        let mut fs = fs();
        for i in 0..MAX_VARS {
            fs.new_localvar(LuaStr::from(format!("v{i}"))).unwrap();
        }
        let err = fs.new_localvar(LuaStr::from("extra")).unwrap_err();
        assert!(err.to_string().contains("main function has more than 200 local variables"));
    }

    #[test]
    fn jumps_to_here_resolve_on_next_emit() {
        let mut fs = fs();
        let j = fs.jump().unwrap();
        fs.patch_to_here(j);
        fs.emit(OpCode::Return { first: 0, count: 1 }).unwrap();
        assert_eq!(fs.proto.instructions[0], OpCode::Jmp { offset: 0, close: 0 });
    }

    #[test]
    fn backward_jump_offset() {
        let mut fs = fs();
        let top = fs.get_label();
        fs.emit(OpCode::Move { dst: 0, src: 1 }).unwrap();
        fs.jump_to(top).unwrap();
        assert_eq!(fs.proto.instructions[1].jump_offset(), Some(-2));
    }

    #[test]
    fn folding_skips_unsafe_results() {
        assert_eq!(fold(ArithOp::Add, Number::Int(2), Number::Int(3)), Some(ExpKind::KInt(5)));
        assert_eq!(fold(ArithOp::Div, Number::Int(1), Number::Int(0)), None);
        assert_eq!(fold(ArithOp::Mod, Number::Int(1), Number::Int(0)), None);
        assert_eq!(fold(ArithOp::Unm, Number::Float(0.0), Number::Int(0)), None);
        assert_eq!(fold(ArithOp::BOr, Number::Float(1.5), Number::Int(0)), None);
        assert_eq!(fold(ArithOp::Pow, Number::Int(2), Number::Int(10)), Some(ExpKind::KFlt(1024.0)));
    }
}
