use std::f64::consts::PI;

use lua_core::number::{float_to_int, num_lt};
use lua_core::Number;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use super::{new_lib, Args, LibResult};
use crate::value::LuaValue;
use crate::vm::Vm;

pub(crate) fn open(vm: &mut Vm) {
    let lib = new_lib(
        vm,
        "math",
        &[
            ("abs", abs),
            ("acos", acos),
            ("asin", asin),
            ("atan", atan),
            ("ceil", ceil),
            ("cos", cos),
            ("deg", deg),
            ("exp", exp),
            ("floor", floor),
            ("fmod", fmod),
            ("log", log),
            ("max", max),
            ("min", min),
            ("modf", modf),
            ("rad", rad),
            ("random", random),
            ("randomseed", randomseed),
            ("sin", sin),
            ("sqrt", sqrt),
            ("tan", tan),
            ("tointeger", tointeger),
            ("type", type_),
            ("ult", ult),
        ],
    );
    let mut t = lib.write();
    t.set_str("pi", LuaValue::Float(PI));
    t.set_str("huge", LuaValue::Float(f64::INFINITY));
    t.set_str("maxinteger", LuaValue::Integer(i64::MAX));
    t.set_str("mininteger", LuaValue::Integer(i64::MIN));
}

fn unary(vm: &mut Vm, args: Args, f: fn(f64) -> f64) -> LibResult {
    Ok(vec![LuaValue::Float(f(args.float(vm, 0)?))])
}

fn acos(vm: &mut Vm, args: Args) -> LibResult {
    unary(vm, args, f64::acos)
}

fn asin(vm: &mut Vm, args: Args) -> LibResult {
    unary(vm, args, f64::asin)
}

fn cos(vm: &mut Vm, args: Args) -> LibResult {
    unary(vm, args, f64::cos)
}

fn deg(vm: &mut Vm, args: Args) -> LibResult {
    unary(vm, args, f64::to_degrees)
}

fn exp(vm: &mut Vm, args: Args) -> LibResult {
    unary(vm, args, f64::exp)
}

fn rad(vm: &mut Vm, args: Args) -> LibResult {
    unary(vm, args, f64::to_radians)
}

fn sin(vm: &mut Vm, args: Args) -> LibResult {
    unary(vm, args, f64::sin)
}

fn sqrt(vm: &mut Vm, args: Args) -> LibResult {
    unary(vm, args, f64::sqrt)
}

fn tan(vm: &mut Vm, args: Args) -> LibResult {
    unary(vm, args, f64::tan)
}

/// A float result as an integer when it has an exact representation.
fn int_or_float(f: f64) -> LuaValue {
    match float_to_int(f) {
        Some(i) => LuaValue::Integer(i),
        None => LuaValue::Float(f),
    }
}

fn abs(vm: &mut Vm, args: Args) -> LibResult {
    Ok(vec![match args.number(vm, 0)? {
        Number::Int(i) => LuaValue::Integer(i.wrapping_abs()),
        Number::Float(f) => LuaValue::Float(f.abs()),
    }])
}

fn floor(vm: &mut Vm, args: Args) -> LibResult {
    Ok(vec![match args.number(vm, 0)? {
        Number::Int(i) => LuaValue::Integer(i),
        Number::Float(f) => int_or_float(f.floor()),
    }])
}

fn ceil(vm: &mut Vm, args: Args) -> LibResult {
    Ok(vec![match args.number(vm, 0)? {
        Number::Int(i) => LuaValue::Integer(i),
        Number::Float(f) => int_or_float(f.ceil()),
    }])
}

fn fmod(vm: &mut Vm, args: Args) -> LibResult {
    match (args.number(vm, 0)?, args.number(vm, 1)?) {
        (Number::Int(a), Number::Int(b)) => {
            if b == 0 {
                return Err(args.error(vm, 1, "zero"));
            }
            // checked_rem fails only for MIN % -1, whose remainder is 0.
            Ok(vec![LuaValue::Integer(a.checked_rem(b).unwrap_or(0))])
        }
        (a, b) => Ok(vec![LuaValue::Float(a.to_f64() % b.to_f64())]),
    }
}

fn modf(vm: &mut Vm, args: Args) -> LibResult {
    let n = args.float(vm, 0)?;
    let ip = if n < 0.0 { n.ceil() } else { n.floor() };
    let frac = if n == ip { 0.0 } else { n - ip };
    Ok(vec![LuaValue::Float(ip), LuaValue::Float(frac)])
}

fn atan(vm: &mut Vm, args: Args) -> LibResult {
    let y = args.float(vm, 0)?;
    let x = if args.is_none_or_nil(1) { 1.0 } else { args.float(vm, 1)? };
    Ok(vec![LuaValue::Float(y.atan2(x))])
}

fn log(vm: &mut Vm, args: Args) -> LibResult {
    let x = args.float(vm, 0)?;
    let r = if args.is_none_or_nil(1) {
        x.ln()
    } else {
        match args.float(vm, 1)? {
            b if b == 2.0 => x.log2(),
            b if b == 10.0 => x.log10(),
            b => x.ln() / b.ln(),
        }
    };
    Ok(vec![LuaValue::Float(r)])
}

fn max(vm: &mut Vm, args: Args) -> LibResult {
    extreme(vm, args, |best, n| num_lt(best, n))
}

fn min(vm: &mut Vm, args: Args) -> LibResult {
    extreme(vm, args, |best, n| num_lt(n, best))
}

fn extreme(vm: &mut Vm, args: Args, better: fn(Number, Number) -> bool) -> LibResult {
    let mut best = args.number(vm, 0)?;
    for i in 1..args.len() {
        let n = args.number(vm, i)?;
        if better(best, n) {
            best = n;
        }
    }
    Ok(vec![LuaValue::from_number(best)])
}

fn random(vm: &mut Vm, args: Args) -> LibResult {
    let (lo, hi) = match args.len() {
        0 => return Ok(vec![LuaValue::Float(vm.rng.gen::<f64>())]),
        1 => (1, args.int(vm, 0)?),
        2 => (args.int(vm, 0)?, args.int(vm, 1)?),
        _ => return Err(vm.runtime_error("wrong number of arguments")),
    };
    if lo > hi {
        return Err(args.error(vm, args.len() - 1, "interval is empty"));
    }
    Ok(vec![LuaValue::Integer(vm.rng.gen_range(lo..=hi))])
}

fn randomseed(vm: &mut Vm, args: Args) -> LibResult {
    let seed = match args.number(vm, 0)? {
        Number::Int(i) => i as u64,
        Number::Float(f) => f.to_bits(),
    };
    vm.rng = StdRng::seed_from_u64(seed);
    Ok(vec![])
}

fn tointeger(_vm: &mut Vm, args: Args) -> LibResult {
    Ok(vec![match args.get(0) {
        LuaValue::Integer(i) => LuaValue::Integer(i),
        LuaValue::Float(f) => float_to_int(f).map_or(LuaValue::Nil, LuaValue::Integer),
        _ => LuaValue::Nil,
    }])
}

fn type_(vm: &mut Vm, args: Args) -> LibResult {
    Ok(vec![match args.any(vm, 0)? {
        LuaValue::Integer(_) => LuaValue::from("integer"),
        LuaValue::Float(_) => LuaValue::from("float"),
        _ => LuaValue::Nil,
    }])
}

fn ult(vm: &mut Vm, args: Args) -> LibResult {
    let (a, b) = (args.int(vm, 0)?, args.int(vm, 1)?);
    Ok(vec![LuaValue::Boolean((a as u64) < (b as u64))])
}
