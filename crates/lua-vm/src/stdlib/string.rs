use std::sync::Arc;

use lua_compiler::dump;
use lua_core::number::{format_a, format_e, format_f, format_g};
use lua_core::LuaStr;
use parking_lot::Mutex;

use super::pattern::{find_plain, is_plain, Capture, Matcher};
use super::{new_lib, str_index, Args, LibResult};
use crate::error::LuaError;
use crate::value::LuaValue;
use crate::vm::{first, Vm};

/// Longest string `rep` will build.
const MAX_STRING_SIZE: usize = 1 << 31;

pub(crate) fn open(vm: &mut Vm) {
    let lib = new_lib(
        vm,
        "string",
        &[
            ("byte", byte),
            ("char", char),
            ("dump", dump_fn),
            ("find", find),
            ("format", format),
            ("gmatch", gmatch),
            ("gsub", gsub),
            ("len", len),
            ("lower", lower),
            ("match", match_),
            ("rep", rep),
            ("reverse", reverse),
            ("sub", sub),
            ("upper", upper),
        ],
    );
    vm.string_meta.write().set_str("__index", LuaValue::Table(lib));
}

fn len(vm: &mut Vm, args: Args) -> LibResult {
    let s = args.string(vm, 0)?;
    Ok(vec![LuaValue::Integer(s.len() as i64)])
}

fn sub(vm: &mut Vm, args: Args) -> LibResult {
    let s = args.string(vm, 0)?;
    let l = s.len();
    let i = str_index(args.opt_int(vm, 1, 1)?, l).max(1);
    let j = str_index(args.opt_int(vm, 2, -1)?, l).min(l as i64);
    if i > j {
        return Ok(vec![LuaValue::from("")]);
    }
    Ok(vec![LuaValue::from(LuaStr::new(&s.as_bytes()[i as usize - 1..j as usize]))])
}

fn upper(vm: &mut Vm, args: Args) -> LibResult {
    let s = args.string(vm, 0)?;
    Ok(vec![LuaValue::from(LuaStr::from(s.as_bytes().to_ascii_uppercase()))])
}

fn lower(vm: &mut Vm, args: Args) -> LibResult {
    let s = args.string(vm, 0)?;
    Ok(vec![LuaValue::from(LuaStr::from(s.as_bytes().to_ascii_lowercase()))])
}

fn reverse(vm: &mut Vm, args: Args) -> LibResult {
    let s = args.string(vm, 0)?;
    let mut bytes = s.as_bytes().to_vec();
    bytes.reverse();
    Ok(vec![LuaValue::from(LuaStr::from(bytes))])
}

fn rep(vm: &mut Vm, args: Args) -> LibResult {
    let s = args.string(vm, 0)?;
    let n = args.int(vm, 1)?;
    let sep = args.opt_string(vm, 2)?.unwrap_or_else(|| LuaStr::from(""));
    if n <= 0 {
        return Ok(vec![LuaValue::from("")]);
    }
    let n = n as usize;
    let total = (s.len() + sep.len()).checked_mul(n).filter(|&t| t < MAX_STRING_SIZE);
    let Some(total) = total else {
        return Err(vm.runtime_error("resulting string too large"));
    };
    let mut out = Vec::with_capacity(total);
    for i in 0..n {
        if i > 0 {
            out.extend_from_slice(sep.as_bytes());
        }
        out.extend_from_slice(s.as_bytes());
    }
    Ok(vec![LuaValue::from(LuaStr::from(out))])
}

fn byte(vm: &mut Vm, args: Args) -> LibResult {
    let s = args.string(vm, 0)?;
    let l = s.len();
    let i = str_index(args.opt_int(vm, 1, 1)?, l);
    let j = str_index(args.opt_int(vm, 2, i)?, l).min(l as i64);
    let i = i.max(1);
    if i > j {
        return Ok(vec![]);
    }
    Ok(s.as_bytes()[i as usize - 1..j as usize]
        .iter()
        .map(|&b| LuaValue::Integer(b as i64))
        .collect())
}

fn char(vm: &mut Vm, args: Args) -> LibResult {
    let mut out = Vec::with_capacity(args.len());
    for i in 0..args.len() {
        let c = args.int(vm, i)?;
        let Ok(c) = u8::try_from(c) else {
            return Err(args.error(vm, i, "value out of range"));
        };
        out.push(c);
    }
    Ok(vec![LuaValue::from(LuaStr::from(out))])
}

fn dump_fn(vm: &mut Vm, args: Args) -> LibResult {
    let strip = args.get(1).is_truthy();
    match args.get(0) {
        LuaValue::Closure(c) => Ok(vec![LuaValue::from(LuaStr::from(dump(&c.proto, strip)))]),
        LuaValue::NativeFunction(_) => Err(vm.runtime_error("unable to dump given function")),
        _ => Err(args.type_error(vm, 0, "function")),
    }
}

// ── Pattern matching ──────────────────────────────────────────────────────────

fn capture_value(src: &[u8], cap: Capture) -> LuaValue {
    match cap {
        Capture::Span(a, b) => LuaValue::from(LuaStr::new(&src[a..b])),
        Capture::Position(p) => LuaValue::Integer(p as i64),
    }
}

fn find(vm: &mut Vm, args: Args) -> LibResult {
    find_aux(vm, args, true)
}

fn match_(vm: &mut Vm, args: Args) -> LibResult {
    find_aux(vm, args, false)
}

fn find_aux(vm: &mut Vm, args: Args, find: bool) -> LibResult {
    let s = args.string(vm, 0)?;
    let p = args.string(vm, 1)?;
    let (src, pat) = (s.as_bytes(), p.as_bytes());
    let init = str_index(args.opt_int(vm, 2, 1)?, src.len()).max(1);
    if init as usize > src.len() + 1 {
        return Ok(vec![LuaValue::Nil]);
    }
    let init = init as usize - 1;
    if find && (args.get(3).is_truthy() || is_plain(pat)) {
        return Ok(match find_plain(src, pat, init) {
            Some(start) => vec![
                LuaValue::Integer(start as i64 + 1),
                LuaValue::Integer((start + pat.len()) as i64),
            ],
            None => vec![LuaValue::Nil],
        });
    }
    let (anchor, p0) = if pat.first() == Some(&b'^') { (true, 1) } else { (false, 0) };
    let mut m = Matcher::new(src, pat);
    let mut start = init;
    loop {
        if let Some(end) = m.match_at(start, p0).map_err(|e| vm.runtime_error(e))? {
            let caps = m.captures(start, end, !find).map_err(|e| vm.runtime_error(e))?;
            let mut out = Vec::with_capacity(caps.len() + 2);
            if find {
                out.push(LuaValue::Integer(start as i64 + 1));
                out.push(LuaValue::Integer(end as i64));
            }
            out.extend(caps.into_iter().map(|c| capture_value(src, c)));
            return Ok(out);
        }
        start += 1;
        if anchor || start > src.len() {
            return Ok(vec![LuaValue::Nil]);
        }
    }
}

fn gmatch(vm: &mut Vm, args: Args) -> LibResult {
    let s = args.string(vm, 0)?;
    let p = args.string(vm, 1)?;
    // (next start, end of the last match)
    let state = Arc::new(Mutex::new((0usize, None::<usize>)));
    let iter = LuaValue::native("gmatch_iter", move |vm, _| {
        let (src, pat) = (s.as_bytes(), p.as_bytes());
        let mut st = state.lock();
        let mut m = Matcher::new(src, pat);
        let mut start = st.0;
        while start <= src.len() {
            if let Some(end) = m.match_at(start, 0).map_err(|e| vm.runtime_error(e))? {
                if Some(end) != st.1 {
                    *st = (end, Some(end));
                    let caps = m.captures(start, end, true).map_err(|e| vm.runtime_error(e))?;
                    return Ok(caps.into_iter().map(|c| capture_value(src, c)).collect());
                }
            }
            start += 1;
        }
        st.0 = start;
        Ok(vec![LuaValue::Nil])
    });
    Ok(vec![iter])
}

fn gsub(vm: &mut Vm, args: Args) -> LibResult {
    let s = args.string(vm, 0)?;
    let p = args.string(vm, 1)?;
    let repl = args.get(2);
    match repl {
        LuaValue::LuaString(_)
        | LuaValue::Integer(_)
        | LuaValue::Float(_)
        | LuaValue::Table(_)
        | LuaValue::NativeFunction(_)
        | LuaValue::Closure(_) => {}
        _ => return Err(args.type_error(vm, 2, "string/function/table")),
    }
    let max_n = args.opt_int(vm, 3, i64::MAX)?;
    let (src, pat) = (s.as_bytes(), p.as_bytes());
    let (anchor, p0) = if pat.first() == Some(&b'^') { (true, 1) } else { (false, 0) };
    let mut m = Matcher::new(src, pat);
    let mut out = Vec::with_capacity(src.len());
    let mut pos = 0;
    let mut last_match = None;
    let mut n = 0i64;
    while n < max_n {
        let end = m.match_at(pos, p0).map_err(|e| vm.runtime_error(e))?;
        match end {
            Some(end) if Some(end) != last_match => {
                n += 1;
                add_value(vm, &m, src, pos, end, &repl, &mut out)?;
                pos = end;
                last_match = Some(end);
            }
            _ if pos < src.len() => {
                out.push(src[pos]);
                pos += 1;
            }
            _ => break,
        }
        if anchor {
            break;
        }
    }
    out.extend_from_slice(&src[pos.min(src.len())..]);
    Ok(vec![LuaValue::from(LuaStr::from(out)), LuaValue::Integer(n)])
}

/// Append the replacement for the match `s..e` to `out`.
fn add_value(
    vm: &mut Vm,
    m: &Matcher<'_>,
    src: &[u8],
    s: usize,
    e: usize,
    repl: &LuaValue,
    out: &mut Vec<u8>,
) -> Result<(), LuaError> {
    let value = match repl {
        LuaValue::Table(_) => {
            let key = capture_value(src, m.capture(0, s, e).map_err(|e| vm.runtime_error(e))?);
            vm.index_value(repl, key)?
        }
        LuaValue::NativeFunction(_) | LuaValue::Closure(_) => {
            let caps = m.captures(s, e, true).map_err(|e| vm.runtime_error(e))?;
            let caps = caps.into_iter().map(|c| capture_value(src, c)).collect();
            first(vm.call_value(repl.clone(), caps)?)
        }
        other => {
            let Some(template) = other.to_lua_str() else {
                return Err(vm.runtime_error("invalid replacement value"));
            };
            let t = template.as_bytes();
            let mut i = 0;
            while i < t.len() {
                let c = t[i];
                i += 1;
                if c != b'%' {
                    out.push(c);
                    continue;
                }
                match t.get(i) {
                    Some(b'%') => out.push(b'%'),
                    Some(d) if d.is_ascii_digit() => {
                        let cap = if *d == b'0' {
                            Capture::Span(s, e)
                        } else {
                            m.capture((d - b'1') as usize, s, e).map_err(|e| vm.runtime_error(e))?
                        };
                        match capture_value(src, cap) {
                            LuaValue::LuaString(v) => out.extend_from_slice(v.as_bytes()),
                            v => out.extend_from_slice(v.to_string().as_bytes()),
                        }
                    }
                    _ => return Err(vm.runtime_error("invalid use of '%' in replacement string")),
                }
                i += 1;
            }
            return Ok(());
        }
    };
    match value {
        LuaValue::Nil | LuaValue::Boolean(false) => out.extend_from_slice(&src[s..e]),
        v => match v.to_lua_str() {
            Some(text) => out.extend_from_slice(text.as_bytes()),
            None => {
                return Err(vm.runtime_error(format!("invalid replacement value (a {})", v.type_name())));
            }
        },
    }
    Ok(())
}

// ── Formatting ────────────────────────────────────────────────────────────────

/// One `%` conversion: flags, width and precision.
#[derive(Debug, Default)]
struct Spec {
    left: bool,
    plus: bool,
    space: bool,
    alt: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

impl Spec {
    fn parse(fmt: &[u8], i: &mut usize) -> Result<Spec, String> {
        let mut spec = Spec::default();
        let start = *i;
        while let Some(&c) = fmt.get(*i) {
            match c {
                b'-' => spec.left = true,
                b'+' => spec.plus = true,
                b' ' => spec.space = true,
                b'#' => spec.alt = true,
                b'0' => spec.zero = true,
                _ => break,
            }
            *i += 1;
        }
        if *i - start > 5 {
            return Err("invalid format (repeated flags)".to_string());
        }
        spec.width = read_digits(fmt, i)?.unwrap_or(0);
        if fmt.get(*i) == Some(&b'.') {
            *i += 1;
            spec.precision = Some(read_digits(fmt, i)?.unwrap_or(0));
        }
        Ok(spec)
    }

    /// Apply the sign flags to a formatted non-negative number.
    fn sign(&self, negative: bool, body: String) -> String {
        if negative {
            format!("-{body}")
        } else if self.plus {
            format!("+{body}")
        } else if self.space {
            format!(" {body}")
        } else {
            body
        }
    }

    /// Pad to the field width. Zero padding goes after any sign or prefix.
    fn pad(&self, s: String, numeric: bool) -> String {
        let len = s.chars().count();
        if len >= self.width {
            return s;
        }
        let fill = self.width - len;
        if self.left {
            return format!("{s}{}", " ".repeat(fill));
        }
        if self.zero && numeric {
            let prefix_len = s
                .find(|c: char| c.is_ascii_alphanumeric())
                .map(|i| if s[i..].starts_with("0x") || s[i..].starts_with("0X") { i + 2 } else { i })
                .unwrap_or(0);
            let (prefix, digits) = s.split_at(prefix_len);
            return format!("{prefix}{}{digits}", "0".repeat(fill));
        }
        format!("{}{s}", " ".repeat(fill))
    }
}

fn read_digits(fmt: &[u8], i: &mut usize) -> Result<Option<usize>, String> {
    let start = *i;
    while fmt.get(*i).is_some_and(u8::is_ascii_digit) {
        *i += 1;
    }
    if *i - start > 2 {
        return Err("invalid format (width or precision too long)".to_string());
    }
    if *i == start {
        return Ok(None);
    }
    Ok(std::str::from_utf8(&fmt[start..*i]).ok().and_then(|d| d.parse().ok()))
}

fn format(vm: &mut Vm, args: Args) -> LibResult {
    let fmt = args.string(vm, 0)?;
    let fmt = fmt.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(fmt.len());
    let mut arg = 0;
    let mut i = 0;
    while i < fmt.len() {
        let c = fmt[i];
        i += 1;
        if c != b'%' {
            out.push(c);
            continue;
        }
        if fmt.get(i) == Some(&b'%') {
            out.push(b'%');
            i += 1;
            continue;
        }
        let spec = Spec::parse(fmt, &mut i).map_err(|e| vm.runtime_error(e))?;
        let Some(&conv) = fmt.get(i) else {
            return Err(vm.runtime_error("invalid conversion '%' to 'format'"));
        };
        i += 1;
        arg += 1;
        if arg >= args.len() {
            return Err(args.error(vm, arg, "no value"));
        }
        let text = match conv {
            b'c' => {
                let code = args.int(vm, arg)?;
                out.push(code as u8);
                continue;
            }
            b'd' | b'i' => {
                let n = args.int(vm, arg)?;
                let mut digits = n.unsigned_abs().to_string();
                if let Some(p) = spec.precision {
                    if digits.len() < p {
                        digits = format!("{}{digits}", "0".repeat(p - digits.len()));
                    }
                }
                spec.pad(spec.sign(n < 0, digits), spec.precision.is_none())
            }
            b'u' => spec.pad((args.int(vm, arg)? as u64).to_string(), true),
            b'o' | b'x' | b'X' => {
                let n = args.int(vm, arg)? as u64;
                let body = match conv {
                    b'o' => format!("{}{n:o}", if spec.alt { "0" } else { "" }),
                    b'x' => format!("{}{n:x}", if spec.alt { "0x" } else { "" }),
                    _ => format!("{}{n:X}", if spec.alt { "0X" } else { "" }),
                };
                spec.pad(body, true)
            }
            b'e' | b'E' | b'f' | b'F' | b'g' | b'G' => {
                let f = args.float(vm, arg)?;
                let prec = spec.precision.unwrap_or(6);
                let body = match conv {
                    b'e' => format_e(f.abs(), prec, false),
                    b'E' => format_e(f.abs(), prec, true),
                    b'f' | b'F' => format_f(f.abs(), prec),
                    b'g' => format_g(f.abs(), prec, false, spec.alt),
                    _ => format_g(f.abs(), prec, true, spec.alt),
                };
                let negative = f.is_sign_negative() && !f.is_nan();
                spec.pad(spec.sign(negative, body), f.is_finite())
            }
            b'a' | b'A' => {
                let f = args.float(vm, arg)?;
                let body = format_a(f.abs(), spec.precision, conv == b'A', spec.alt);
                let negative = f.is_sign_negative() && !f.is_nan();
                spec.pad(spec.sign(negative, body), f.is_finite())
            }
            b'q' => {
                quote(&args.get(arg), &mut out);
                continue;
            }
            b's' => {
                let v = args.any(vm, arg)?;
                let s = vm.tostring(&v)?;
                let bytes = match spec.precision {
                    Some(p) if p < s.len() => &s.as_bytes()[..p],
                    _ => s.as_bytes(),
                };
                if bytes.len() >= spec.width {
                    out.extend_from_slice(bytes);
                    continue;
                }
                spec.pad(String::from_utf8_lossy(bytes).into_owned(), false)
            }
            other => {
                return Err(vm.runtime_error(format!(
                    "invalid conversion '%{}' to 'format'",
                    other as char
                )));
            }
        };
        out.extend_from_slice(text.as_bytes());
    }
    Ok(vec![LuaValue::from(LuaStr::from(out))])
}

/// `%q`: a literal that reads back as the same value.
fn quote(v: &LuaValue, out: &mut Vec<u8>) {
    match v {
        LuaValue::LuaString(s) => {
            let bytes = s.as_bytes();
            out.push(b'"');
            for (i, &c) in bytes.iter().enumerate() {
                match c {
                    b'"' | b'\\' => {
                        out.push(b'\\');
                        out.push(c);
                    }
                    b'\n' => out.extend_from_slice(b"\\\n"),
                    b'\r' => out.extend_from_slice(b"\\r"),
                    0 => {
                        let next_is_digit = bytes.get(i + 1).is_some_and(u8::is_ascii_digit);
                        out.extend_from_slice(if next_is_digit { b"\\000" } else { b"\\0" });
                    }
                    c if c.is_ascii_control() => {
                        let next_is_digit = bytes.get(i + 1).is_some_and(u8::is_ascii_digit);
                        let esc = if next_is_digit { format!("\\{c:03}") } else { format!("\\{c}") };
                        out.extend_from_slice(esc.as_bytes());
                    }
                    c => out.push(c),
                }
            }
            out.push(b'"');
        }
        LuaValue::Integer(i) if *i == i64::MIN => out.extend_from_slice(b"0x8000000000000000"),
        LuaValue::Float(f) if f.is_nan() => out.extend_from_slice(b"(0/0)"),
        LuaValue::Float(f) if f.is_infinite() => {
            out.extend_from_slice(if *f > 0.0 { b"1e9999" } else { b"-1e9999" })
        }
        other => out.extend_from_slice(other.to_string().as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_all(src: &str) -> Vec<LuaValue> {
        Vm::new().exec(src, "=str").unwrap()
    }

    fn run(src: &str) -> LuaValue {
        first(run_all(src))
    }

    fn s(v: &str) -> LuaValue {
        LuaValue::from(v)
    }

    #[test]
    fn sub_handles_negative_and_out_of_range_indices() {
        assert_eq!(run("return ('hello'):sub(2, 4)"), s("ell"));
        assert_eq!(run("return ('hello'):sub(-3)"), s("llo"));
        assert_eq!(run("return ('hello'):sub(0)"), s("hello"));
        assert_eq!(run("return ('hello'):sub(4, 2)"), s(""));
        assert_eq!(run("return ('hello'):sub(-100, 100)"), s("hello"));
    }

    #[test]
    fn byte_char_and_case() {
        assert_eq!(
            run_all("return string.byte('ABC', 1, -1)"),
            vec![LuaValue::Integer(65), LuaValue::Integer(66), LuaValue::Integer(67)]
        );
        assert_eq!(run("return string.char(72, 105)"), s("Hi"));
        assert_eq!(run("return ('MiXeD'):lower() .. ('MiXeD'):upper()"), s("mixedMIXED"));
        assert_eq!(run("return ('abc'):reverse()"), s("cba"));
        assert_eq!(run("return ('ab'):rep(3, ',')"), s("ab,ab,ab"));
        let e = Vm::new().exec("string.char(256)", "=str").unwrap_err();
        assert!(e.to_string().contains("bad argument #1 to 'char' (value out of range)"));
    }

    #[test]
    fn find_plain_and_patterns() {
        assert_eq!(run_all("return ('a.b.c'):find('.', 1, true)"), vec![LuaValue::Integer(2), LuaValue::Integer(2)]);
        assert_eq!(
            run_all("return ('hello world'):find('o w')"),
            vec![LuaValue::Integer(5), LuaValue::Integer(7)]
        );
        assert_eq!(
            run_all("return ('key=val'):find('(%w+)=(%w+)')"),
            vec![LuaValue::Integer(1), LuaValue::Integer(7), s("key"), s("val")]
        );
        assert_eq!(run("return ('abc'):find('x')"), LuaValue::Nil);
        assert_eq!(run("return ('abc'):find('b', 10)"), LuaValue::Nil);
        assert_eq!(run_all("return ('abc'):find('', 4)"), vec![LuaValue::Integer(4), LuaValue::Integer(3)]);
    }

    #[test]
    fn match_returns_captures_or_whole() {
        assert_eq!(run("return ('  trim  '):match('^%s*(.-)%s*$')"), s("trim"));
        assert_eq!(run("return ('2024-01-15'):match('%d+')"), s("2024"));
        assert_eq!(
            run_all("return ('2024-01-15'):match('(%d+)-(%d+)-(%d+)')"),
            vec![s("2024"), s("01"), s("15")]
        );
        assert_eq!(run("return ('hello'):match('()ll')"), LuaValue::Integer(3));
    }

    #[test]
    fn gmatch_iterates_all_matches() {
        let src = "local out = {} for w in ('one two  three'):gmatch('%a+') do out[#out + 1] = w end return table.concat(out, ',')";
        assert_eq!(run(src), s("one,two,three"));
        let src = "local t = {} for k, v in ('a=1, b=2'):gmatch('(%w+)=(%w+)') do t[k] = tonumber(v) end return t.a + t.b";
        assert_eq!(run(src), LuaValue::Integer(3));
        let src = "local n = 0 for _ in ('abc'):gmatch('') do n = n + 1 end return n";
        assert_eq!(run(src), LuaValue::Integer(4));
    }

    #[test]
    fn gsub_with_every_replacement_kind() {
        assert_eq!(run_all("return ('hello world'):gsub('o', '0')"), vec![s("hell0 w0rld"), LuaValue::Integer(2)]);
        assert_eq!(run("return ('hello'):gsub('l', 'L', 1)"), s("heLlo"));
        assert_eq!(run("return ('abc'):gsub('%w', '%0%0')"), s("aabbcc"));
        assert_eq!(run("return ('hello world'):gsub('(%w+) (%w+)', '%2 %1')"), s("world hello"));
        assert_eq!(run("return ('$x and $y'):gsub('%$(%w+)', {x = 'X'})"), s("X and $y"));
        assert_eq!(run("return ('1 2 3'):gsub('%d', function(d) return d * 2 end)"), s("2 4 6"));
        assert_eq!(run_all("return ('abc'):gsub('', '-')"), vec![s("-a-b-c-"), LuaValue::Integer(4)]);
        assert_eq!(run("return ('  x'):gsub('^%s+', '')"), s("x"));
        let e = Vm::new().exec("return ('x'):gsub('x', '%9')", "=str").unwrap_err();
        assert!(e.to_string().contains("invalid capture index %9"));
    }

    #[test]
    fn format_conversions() {
        assert_eq!(run("return string.format('%d items', 3)"), s("3 items"));
        assert_eq!(run("return string.format('%5d|%-5d|%05d', 42, 42, -42)"), s("   42|42   |-0042"));
        assert_eq!(run("return string.format('%+d %x %X %#x %o', 5, 255, 255, 255, 8)"), s("+5 ff FF 0xff 10"));
        assert_eq!(run("return string.format('%.3f', 3.14159)"), s("3.142"));
        assert_eq!(run("return string.format('%e', 12345.678)"), s("1.234568e+04"));
        assert_eq!(run("return string.format('%g %g', 0.0001, 1e20)"), s("0.0001 1e+20"));
        assert_eq!(run("return string.format('%10.2f|', -1.5)"), s("     -1.50|"));
        assert_eq!(run("return string.format('%s %s %s', 1, 2.0, true)"), s("1 2.0 true"));
        assert_eq!(run("return string.format('%.2s|%5s', 'abc', 'x')"), s("ab|    x"));
        assert_eq!(run("return string.format('%c%c', 76, 117)"), s("Lu"));
        assert_eq!(run("return string.format('%q', 'a\\nb\"c')"), s("\"a\\\nb\\\"c\""));
        assert_eq!(run("return string.format('%5.1f%%', 99.44)"), s(" 99.4%"));
        assert_eq!(run("return string.format('%d', 3.0)"), s("3"));
    }

    #[test]
    fn format_errors() {
        let mut vm = Vm::new();
        let e = vm.exec("string.format('%d', 1.5)", "=f").unwrap_err();
        assert!(e.to_string().contains("number has no integer representation"));
        let e = vm.exec("string.format('%d')", "=f").unwrap_err();
        assert!(e.to_string().contains("bad argument #2 to 'format' (no value)"));
        let e = vm.exec("string.format('%y', 1)", "=f").unwrap_err();
        assert!(e.to_string().contains("invalid conversion '%y' to 'format'"));
    }

    #[test]
    fn format_hex_floats() {
        assert_eq!(run("return string.format('%a', 1)"), s("0x1p+0"));
        assert_eq!(run("return string.format('%a %A', -3.0, 0.5)"), s("-0x1.8p+1 0X1P-1"));
        assert_eq!(run("return string.format('%.2a', 0.1)"), s("0x1.9ap-4"));
        assert_eq!(run("return string.format('%+a|%12a|%-8a|', 2.0, 1.0, 1.0)"), s("+0x1p+1|      0x1p+0|0x1p+0  |"));
        assert_eq!(run("return string.format('%010a', 1.0)"), s("0x00001p+0"));
        assert_eq!(run("return tonumber(string.format('%a', 123.456))"), LuaValue::Float(123.456));
    }

    #[test]
    fn dump_round_trips_through_load() {
        let src = r#"
            local function add(a, b) return a + b end
            local bin = string.dump(add, true)
            return load(bin)(2, 3), #bin > 0
        "#;
        assert_eq!(run_all(src), vec![LuaValue::Integer(5), LuaValue::Boolean(true)]);
        let e = Vm::new().exec("string.dump(print)", "=d").unwrap_err();
        assert!(e.to_string().contains("unable to dump given function"));
    }
}
