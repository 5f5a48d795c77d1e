use lua_core::number::fmt_float;
use lua_core::{Constant, OpCode, Proto, Rk, UpvalueDesc};

/// Disassemble a [`Proto`] into a human-readable listing.
///
/// Recursively lists any nested `protos[]` so you see the full picture.
pub fn disassemble(proto: &Proto) -> String {
    let mut out = String::new();
    disasm_proto(proto, &mut out);
    out
}

fn disasm_proto(proto: &Proto, out: &mut String) {
    let kind = if proto.line_defined == 0 { "main" } else { "function" };
    out.push_str(&format!(
        "== {kind} <{}:{},{}> ==  (params={}{}, slots={}, upvalues={}, constants={}, functions={})\n",
        proto.chunk_id(),
        proto.line_defined,
        proto.last_line_defined,
        proto.param_count,
        if proto.is_vararg { "+" } else { "" },
        proto.max_stack,
        proto.upvalue_descs.len(),
        proto.constants.len(),
        proto.protos.len(),
    ));

    out.push_str("instructions:\n");
    for (pc, op) in proto.instructions.iter().enumerate() {
        let line = proto
            .line_at(pc)
            .map(|l| format!("[{l}]"))
            .unwrap_or_else(|| "[-]".to_string());
        out.push_str(&format!("  {:<4} {line:<6} {}\n", pc + 1, fmt_instruction(pc, op, proto)));
    }

    if !proto.constants.is_empty() {
        out.push_str("constants:\n");
        for (i, c) in proto.constants.iter().enumerate() {
            out.push_str(&format!("  [K{i}]  {}\n", fmt_constant(c)));
        }
    }

    if !proto.debug.local_vars.is_empty() {
        out.push_str("locals:\n");
        for (i, var) in proto.debug.local_vars.iter().enumerate() {
            out.push_str(&format!(
                "  [L{i}]  {}  {}..{}\n",
                var.name.to_str_lossy(),
                var.start_pc + 1,
                var.end_pc + 1
            ));
        }
    }

    if !proto.upvalue_descs.is_empty() {
        out.push_str("upvalues:\n");
        for (i, uv) in proto.upvalue_descs.iter().enumerate() {
            let desc = match uv {
                UpvalueDesc::Stack(reg) => format!("stack reg={reg}"),
                UpvalueDesc::Upvalue(idx) => format!("upvalue idx={idx}"),
            };
            let name = proto
                .debug
                .upvalue_names
                .get(i)
                .map(|n| n.to_str_lossy().into_owned())
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!("  [U{i}]  {name}  {desc}\n"));
        }
    }

    for sub in &proto.protos {
        out.push('\n');
        disasm_proto(sub, out);
    }
}

fn fmt_constant(c: &Constant) -> String {
    match c {
        Constant::Nil => "nil".to_string(),
        Constant::Boolean(b) => b.to_string(),
        Constant::Integer(n) => n.to_string(),
        Constant::Float(f) => fmt_float(*f),
        Constant::Str(s) => format!("{:?}", s.to_str_lossy()),
    }
}

fn fmt_rk(rk: Rk, proto: &Proto) -> String {
    match rk {
        Rk::Reg(r) => format!("R{r}"),
        Rk::Const(k) => match proto.constants.get(k as usize) {
            Some(c) => format!("K{k}({})", fmt_constant(c)),
            None => format!("K{k}(?)"),
        },
    }
}

fn fmt_k(idx: u32, proto: &Proto) -> String {
    proto
        .constants
        .get(idx as usize)
        .map(fmt_constant)
        .unwrap_or_else(|| "?".to_string())
}

fn fmt_count(n: u16) -> String {
    if n == 0 {
        "multi".to_string()
    } else {
        (n - 1).to_string()
    }
}

fn fmt_instruction(pc: usize, op: &OpCode, proto: &Proto) -> String {
    let name = op.name();
    let operands = match *op {
        OpCode::Move { dst, src } => format!("R{dst} R{src}"),
        OpCode::LoadK { dst, const_idx } => format!("R{dst} K{const_idx}({})", fmt_k(const_idx, proto)),
        OpCode::LoadBool { dst, value, skip } => {
            format!("R{dst} {value}{}", if skip { " skip" } else { "" })
        }
        OpCode::LoadNil { dst, count } => format!("R{dst} count={count}"),
        OpCode::GetUpval { dst, upval } => format!("R{dst} U{upval}"),
        OpCode::SetUpval { src, upval } => format!("U{upval} R{src}"),
        OpCode::GetGlobal { dst, name } => format!("R{dst} {}", fmt_k(name, proto)),
        OpCode::SetGlobal { src, name } => format!("{} R{src}", fmt_k(name, proto)),
        OpCode::GetTable { dst, table, key } => format!("R{dst} R{table}[{}]", fmt_rk(key, proto)),
        OpCode::SetTable { table, key, val } => {
            format!("R{table}[{}] {}", fmt_rk(key, proto), fmt_rk(val, proto))
        }
        OpCode::NewTable { dst, array_hint, hash_hint } => {
            format!("R{dst} array={array_hint} hash={hash_hint}")
        }
        OpCode::Method { dst, obj, key } => format!("R{dst} R{obj}:{}", fmt_rk(key, proto)),
        OpCode::Add { dst, lhs, rhs }
        | OpCode::Sub { dst, lhs, rhs }
        | OpCode::Mul { dst, lhs, rhs }
        | OpCode::Div { dst, lhs, rhs }
        | OpCode::Mod { dst, lhs, rhs }
        | OpCode::Pow { dst, lhs, rhs }
        | OpCode::IDiv { dst, lhs, rhs }
        | OpCode::BAnd { dst, lhs, rhs }
        | OpCode::BOr { dst, lhs, rhs }
        | OpCode::BXor { dst, lhs, rhs }
        | OpCode::Shl { dst, lhs, rhs }
        | OpCode::Shr { dst, lhs, rhs } => {
            format!("R{dst} {} {}", fmt_rk(lhs, proto), fmt_rk(rhs, proto))
        }
        OpCode::Unm { dst, src } | OpCode::BNot { dst, src } | OpCode::Not { dst, src } | OpCode::Len { dst, src } => {
            format!("R{dst} R{src}")
        }
        OpCode::Concat { dst, first, last } => format!("R{dst} R{first}..R{last}"),
        OpCode::Jmp { offset, close } => {
            let target = pc as i64 + 2 + offset as i64;
            if close > 0 {
                format!("to {target} close>=R{}", close - 1)
            } else {
                format!("to {target}")
            }
        }
        OpCode::Eq { expect, lhs, rhs } | OpCode::Lt { expect, lhs, rhs } | OpCode::Le { expect, lhs, rhs } => {
            format!("{} {} {}", expect as u8, fmt_rk(lhs, proto), fmt_rk(rhs, proto))
        }
        OpCode::Test { src, expect } => format!("R{src} {}", expect as u8),
        OpCode::TestSet { dst, src, expect } => format!("R{dst} R{src} {}", expect as u8),
        OpCode::Call { func, args, results } => {
            format!("R{func} args={} results={}", fmt_count(args), fmt_count(results))
        }
        OpCode::TailCall { func, args } => format!("R{func} args={}", fmt_count(args)),
        OpCode::Return { first, count } => format!("R{first} count={}", fmt_count(count)),
        OpCode::ForPrep { base, offset }
        | OpCode::ForLoop { base, offset }
        | OpCode::TForLoop { base, offset } => {
            format!("R{base} to {}", pc as i64 + 2 + offset as i64)
        }
        OpCode::TForCall { base, results } => format!("R{base} results={results}"),
        OpCode::SetList { table, count, batch } => {
            format!("R{table} count={} batch={batch}", fmt_count(count + 1))
        }
        OpCode::Close { from } => format!("R{from}"),
        OpCode::Closure { dst, proto_idx } => format!("R{dst} F{proto_idx}"),
        OpCode::VarArg { dst, count } => format!("R{dst} count={}", fmt_count(count)),
        OpCode::ExtraArg { value } => format!("{value}"),
    };
    format!("{name:<9} {operands}")
}
