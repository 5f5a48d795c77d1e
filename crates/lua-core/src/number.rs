//! Numeric semantics shared by the constant folder and the VM.
//!
//! Integers wrap on overflow, `//` and `%` use floor semantics, `/` and `^`
//! always produce floats, and bitwise operators require an exact integer
//! representation.

use std::fmt::Write;

/// A numeric value with its subtype.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn to_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    /// Exact integer value, if there is one.
    pub fn to_integer(self) -> Option<i64> {
        match self {
            Number::Int(i) => Some(i),
            Number::Float(f) => float_to_int(f),
        }
    }
}

/// Converts a float to an integer only when no information is lost.
pub fn float_to_int(f: f64) -> Option<i64> {
    // 2^63 is exactly representable; anything >= it does not fit.
    if f.floor() == f && f >= -9_223_372_036_854_775_808.0 && f < 9_223_372_036_854_775_808.0 {
        Some(f as i64)
    } else {
        None
    }
}

// ── Operators ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
}

impl ArithOp {
    /// Name of the metamethod consulted when an operand is not a number.
    pub fn event(self) -> &'static str {
        match self {
            ArithOp::Add => "__add",
            ArithOp::Sub => "__sub",
            ArithOp::Mul => "__mul",
            ArithOp::Div => "__div",
            ArithOp::Mod => "__mod",
            ArithOp::Pow => "__pow",
            ArithOp::IDiv => "__idiv",
            ArithOp::BAnd => "__band",
            ArithOp::BOr => "__bor",
            ArithOp::BXor => "__bxor",
            ArithOp::Shl => "__shl",
            ArithOp::Shr => "__shr",
            ArithOp::Unm => "__unm",
            ArithOp::BNot => "__bnot",
        }
    }

    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr | ArithOp::BNot
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithError {
    DivideByZero,
    ModuloByZero,
    NoIntegerRep,
}

impl ArithError {
    pub fn message(self) -> &'static str {
        match self {
            ArithError::DivideByZero => "attempt to perform 'n//0'",
            ArithError::ModuloByZero => "attempt to perform 'n%%0'",
            ArithError::NoIntegerRep => "number has no integer representation",
        }
    }
}

/// Apply `op` to two numbers. Unary operators ignore `b`.
pub fn arith(op: ArithOp, a: Number, b: Number) -> Result<Number, ArithError> {
    use Number::{Float, Int};
    if op.is_bitwise() {
        let x = a.to_integer().ok_or(ArithError::NoIntegerRep)?;
        let y = b.to_integer().ok_or(ArithError::NoIntegerRep)?;
        return Ok(Int(match op {
            ArithOp::BAnd => x & y,
            ArithOp::BOr => x | y,
            ArithOp::BXor => x ^ y,
            ArithOp::Shl => shift_left(x, y),
            ArithOp::Shr => shift_left(x, y.checked_neg().unwrap_or(i64::MAX)),
            _ => !x,
        }));
    }
    Ok(match (op, a, b) {
        (ArithOp::Unm, Int(x), _) => Int(x.wrapping_neg()),
        (ArithOp::Unm, Float(x), _) => Float(-x),
        (ArithOp::Div, x, y) => Float(x.to_f64() / y.to_f64()),
        (ArithOp::Pow, x, y) => Float(x.to_f64().powf(y.to_f64())),
        (_, Int(x), Int(y)) => Int(match op {
            ArithOp::Add => x.wrapping_add(y),
            ArithOp::Sub => x.wrapping_sub(y),
            ArithOp::Mul => x.wrapping_mul(y),
            ArithOp::IDiv => {
                if y == 0 {
                    return Err(ArithError::DivideByZero);
                }
                int_floor_div(x, y)
            }
            _ => {
                if y == 0 {
                    return Err(ArithError::ModuloByZero);
                }
                int_floor_mod(x, y)
            }
        }),
        (_, x, y) => {
            let (x, y) = (x.to_f64(), y.to_f64());
            Float(match op {
                ArithOp::Add => x + y,
                ArithOp::Sub => x - y,
                ArithOp::Mul => x * y,
                ArithOp::IDiv => (x / y).floor(),
                _ => float_mod(x, y),
            })
        }
    })
}

pub fn int_floor_div(a: i64, b: i64) -> i64 {
    if b == -1 {
        return a.wrapping_neg();
    }
    let q = a / b;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

pub fn int_floor_mod(a: i64, b: i64) -> i64 {
    if b == -1 {
        return 0;
    }
    let r = a % b;
    if r != 0 && (r ^ b) < 0 {
        r + b
    } else {
        r
    }
}

pub fn float_mod(a: f64, b: f64) -> f64 {
    let m = a % b;
    if (m > 0.0 && b < 0.0) || (m < 0.0 && b != m && b > 0.0) {
        m + b
    } else {
        m
    }
}

/// Logical shift; negative amounts shift right, |n| >= 64 clears.
pub fn shift_left(x: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((x as u64) << n) as i64
    } else {
        ((x as u64) >> (-n)) as i64
    }
}

// ── Comparison ────────────────────────────────────────────────────────────────

pub fn num_eq(a: Number, b: Number) -> bool {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => x == y,
        (Number::Float(x), Number::Float(y)) => x == y,
        (Number::Int(i), Number::Float(f)) | (Number::Float(f), Number::Int(i)) => {
            float_to_int(f) == Some(i)
        }
    }
}

pub fn num_lt(a: Number, b: Number) -> bool {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => x < y,
        (Number::Float(x), Number::Float(y)) => x < y,
        (Number::Int(i), Number::Float(f)) => int_lt_float(i, f),
        (Number::Float(f), Number::Int(i)) => float_lt_int(f, i),
    }
}

pub fn num_le(a: Number, b: Number) -> bool {
    match (a, b) {
        (Number::Int(x), Number::Int(y)) => x <= y,
        (Number::Float(x), Number::Float(y)) => x <= y,
        (Number::Int(i), Number::Float(f)) => int_le_float(i, f),
        (Number::Float(f), Number::Int(i)) => float_le_int(f, i),
    }
}

const TWO_63: f64 = 9_223_372_036_854_775_808.0;

fn int_lt_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        false
    } else if f >= TWO_63 {
        true
    } else if f > -TWO_63 {
        i < f.ceil() as i64
    } else {
        false
    }
}

fn int_le_float(i: i64, f: f64) -> bool {
    if f.is_nan() {
        false
    } else if f >= TWO_63 {
        true
    } else if f >= -TWO_63 {
        i <= f.floor() as i64
    } else {
        false
    }
}

fn float_lt_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        false
    } else if f >= TWO_63 {
        false
    } else if f >= -TWO_63 {
        (f.floor() as i64) < i
    } else {
        true
    }
}

fn float_le_int(f: f64, i: i64) -> bool {
    if f.is_nan() {
        false
    } else if f >= TWO_63 {
        false
    } else if f > -TWO_63 {
        (f.ceil() as i64) <= i
    } else {
        true
    }
}

// ── String → number ───────────────────────────────────────────────────────────

fn is_lua_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0b' | '\x0c')
}

/// Convert a numeral string (surrounding whitespace allowed) to a number.
///
/// Accepts decimal integers and floats, hexadecimal integers (which wrap
/// around) and hexadecimal floats with a binary exponent. Decimal integers
/// that overflow become floats.
pub fn parse_number(text: &str) -> Option<Number> {
    let s = text.trim_matches(is_lua_space);
    let (neg, body) = match s.as_bytes().first()? {
        b'-' => (true, &s[1..]),
        b'+' => (false, &s[1..]),
        _ => (false, s),
    };
    if body.len() > 2 && (body.starts_with("0x") || body.starts_with("0X")) {
        parse_hex(&body[2..], neg)
    } else {
        parse_decimal(body, neg)
    }
}

fn parse_decimal(body: &str, neg: bool) -> Option<Number> {
    let bytes = body.as_bytes();
    let mut i = 0;
    let mut digits = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
        digits += 1;
    }
    let mut is_float = false;
    if i < bytes.len() && bytes[i] == b'.' {
        is_float = true;
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
            digits += 1;
        }
    }
    if digits == 0 {
        return None;
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        is_float = true;
        i += 1;
        if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
            i += 1;
        }
        let exp_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i == exp_start {
            return None;
        }
    }
    if i != bytes.len() {
        return None;
    }
    if !is_float {
        let signed = if neg { format!("-{body}") } else { body.to_string() };
        if let Ok(n) = signed.parse::<i64>() {
            return Some(Number::Int(n));
        }
    }
    let f: f64 = body.parse().ok()?;
    Some(Number::Float(if neg { -f } else { f }))
}

fn parse_hex(body: &str, neg: bool) -> Option<Number> {
    let bytes = body.as_bytes();
    let mut i = 0;
    let mut int_acc: i64 = 0;
    let mut mantissa = 0.0f64;
    let mut exp: i64 = 0;
    let mut any_digit = false;
    let mut is_float = false;
    while i < bytes.len() {
        let c = bytes[i];
        if let Some(d) = (c as char).to_digit(16) {
            int_acc = int_acc.wrapping_mul(16).wrapping_add(d as i64);
            mantissa = mantissa * 16.0 + d as f64;
            if is_float {
                exp -= 4;
            }
            any_digit = true;
        } else if c == b'.' && !is_float {
            is_float = true;
        } else {
            break;
        }
        i += 1;
    }
    if !any_digit {
        return None;
    }
    if i < bytes.len() && (bytes[i] == b'p' || bytes[i] == b'P') {
        is_float = true;
        i += 1;
        let mut exp_neg = false;
        if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
            exp_neg = bytes[i] == b'-';
            i += 1;
        }
        let start = i;
        let mut e: i64 = 0;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            e = e.saturating_mul(10).saturating_add((bytes[i] - b'0') as i64);
            i += 1;
        }
        if i == start {
            return None;
        }
        exp += if exp_neg { -e } else { e };
    }
    if i != bytes.len() {
        return None;
    }
    if is_float {
        let exp = exp.clamp(-4000, 4000) as i32;
        let f = mantissa * 2f64.powi(exp);
        Some(Number::Float(if neg { -f } else { f }))
    } else {
        Some(Number::Int(if neg { int_acc.wrapping_neg() } else { int_acc }))
    }
}

// ── Number → string ───────────────────────────────────────────────────────────

/// `tostring` rendering of a float: `%.14g`, plus `.0` when the result would
/// otherwise read as an integer.
pub fn fmt_float(f: f64) -> String {
    let mut s = format_g(f, 14, false, false);
    if s.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
        s.push_str(".0");
    }
    s
}

fn non_finite(f: f64, upper: bool) -> Option<String> {
    let s = if f.is_nan() {
        if f.is_sign_negative() {
            "-nan"
        } else {
            "nan"
        }
    } else if f.is_infinite() {
        if f < 0.0 {
            "-inf"
        } else {
            "inf"
        }
    } else {
        return None;
    };
    Some(if upper { s.to_uppercase() } else { s.to_string() })
}

/// C-style `%.<prec>e`.
pub fn format_e(f: f64, prec: usize, upper: bool) -> String {
    if let Some(s) = non_finite(f, upper) {
        return s;
    }
    let raw = format!("{f:.prec$e}");
    let (mantissa, exp) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let mut out = String::with_capacity(mantissa.len() + 5);
    out.push_str(mantissa);
    out.push(if upper { 'E' } else { 'e' });
    out.push(if exp < 0 { '-' } else { '+' });
    let _ = write!(out, "{:02}", exp.abs());
    out
}

/// C-style `%a`: hexadecimal mantissa with a binary exponent. `prec` is the
/// number of hex digits after the point; `None` prints exactly as many as the
/// value needs. Subnormals keep a leading `0` and exponent `-1022`.
pub fn format_a(f: f64, prec: Option<usize>, upper: bool, alt: bool) -> String {
    if let Some(s) = non_finite(f, upper) {
        return s;
    }
    let bits = f.abs().to_bits();
    let biased = ((bits >> 52) & 0x7ff) as i32;
    let frac = bits & ((1u64 << 52) - 1);
    let (mut lead, exp) = match (biased, frac) {
        (0, 0) => (0u64, 0),
        (0, _) => (0, -1022),
        _ => (1, biased - 1023),
    };
    let digits = match prec {
        None => format!("{frac:013x}").trim_end_matches('0').to_string(),
        Some(p) if p >= 13 => format!("{frac:013x}{}", "0".repeat(p - 13)),
        Some(p) => {
            // Round to nearest, ties to even.
            let drop = (13 - p) * 4;
            let mut kept = frac >> drop;
            let rest = frac & ((1u64 << drop) - 1);
            let half = 1u64 << (drop - 1);
            let odd = if p == 0 { lead & 1 == 1 } else { kept & 1 == 1 };
            if rest > half || (rest == half && odd) {
                kept += 1;
            }
            if kept >> (p * 4) != 0 {
                lead += 1;
                kept = 0;
            }
            if p == 0 {
                String::new()
            } else {
                format!("{kept:0p$x}")
            }
        }
    };
    let mut out = format!("0x{lead:x}");
    if alt || !digits.is_empty() {
        out.push('.');
    }
    out.push_str(&digits);
    let _ = write!(out, "p{exp:+}");
    if upper {
        out.make_ascii_uppercase();
    }
    out
}

/// C-style `%.<prec>f`.
pub fn format_f(f: f64, prec: usize) -> String {
    if let Some(s) = non_finite(f, false) {
        return s;
    }
    format!("{f:.prec$}")
}

/// C-style `%.<prec>g`; `alt` keeps trailing zeros (`%#g`).
pub fn format_g(f: f64, prec: usize, upper: bool, alt: bool) -> String {
    if let Some(s) = non_finite(f, upper) {
        return s;
    }
    let p = prec.max(1);
    let exp = if f == 0.0 {
        0
    } else {
        let sci = format!("{:.*e}", p - 1, f);
        sci
            .split_once('e')
            .and_then(|(_, e)| e.parse::<i32>().ok())
            .unwrap_or(0)
    };
    let mut s = if exp < -4 || exp >= p as i32 {
        format_e(f, p - 1, upper)
    } else {
        format!("{:.*}", (p as i32 - 1 - exp) as usize, f)
    };
    if !alt {
        s = strip_fraction_zeros(&s);
    }
    s
}

fn strip_fraction_zeros(s: &str) -> String {
    let (num, exp) = match s.find(['e', 'E']) {
        Some(i) => (&s[..i], &s[i..]),
        None => (s, ""),
    };
    if !num.contains('.') {
        return s.to_string();
    }
    let trimmed = num.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed}{exp}")
}
