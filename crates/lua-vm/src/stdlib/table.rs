use lua_core::LuaStr;

use super::{new_lib, Args, LibResult};
use crate::error::LuaError;
use crate::table::LuaTable;
use crate::value::LuaValue;
use crate::vm::{first, Vm};

/// Upper bound on the number of values `unpack` may produce.
const MAX_UNPACK: i64 = 1_000_000;

pub(crate) fn open(vm: &mut Vm) {
    new_lib(
        vm,
        "table",
        &[
            ("concat", concat),
            ("insert", insert),
            ("pack", pack),
            ("remove", remove),
            ("sort", sort),
            ("unpack", unpack),
        ],
    );
}

/// `#t`, honouring `__len`.
fn length(vm: &mut Vm, t: &LuaValue) -> Result<i64, LuaError> {
    match vm.length_of(t, None)? {
        LuaValue::Integer(n) => Ok(n),
        LuaValue::Float(f) if f.fract() == 0.0 => Ok(f as i64),
        _ => Err(vm.runtime_error("object length is not an integer")),
    }
}

fn concat(vm: &mut Vm, args: Args) -> LibResult {
    let t = LuaValue::Table(args.table(vm, 0)?);
    let sep = args.opt_string(vm, 1)?.unwrap_or_else(|| LuaStr::from(""));
    let i = args.opt_int(vm, 2, 1)?;
    let j = if args.is_none_or_nil(3) { length(vm, &t)? } else { args.int(vm, 3)? };
    let mut out = Vec::new();
    let mut k = i;
    while k <= j {
        let v = vm.index_value(&t, LuaValue::Integer(k))?;
        let Some(s) = (match &v {
            LuaValue::LuaString(_) | LuaValue::Integer(_) | LuaValue::Float(_) => v.to_lua_str(),
            _ => None,
        }) else {
            return Err(vm.runtime_error(format!(
                "invalid value (at index {k}) in table for 'concat'"
            )));
        };
        out.extend_from_slice(s.as_bytes());
        if k < j {
            out.extend_from_slice(sep.as_bytes());
        }
        // `j` may be i64::MAX.
        match k.checked_add(1) {
            Some(next) => k = next,
            None => break,
        }
    }
    Ok(vec![LuaValue::from(LuaStr::from(out))])
}

fn insert(vm: &mut Vm, args: Args) -> LibResult {
    let t = LuaValue::Table(args.table(vm, 0)?);
    let e = length(vm, &t)?.wrapping_add(1);
    match args.len() {
        2 => vm.set_index(&t, LuaValue::Integer(e), args.get(1))?,
        3 => {
            let pos = args.int(vm, 1)?;
            // Unsigned compare also rejects pos < 1.
            if (pos as u64).wrapping_sub(1) >= e as u64 {
                return Err(args.error(vm, 1, "position out of bounds"));
            }
            let mut i = e;
            while i > pos {
                let v = vm.index_value(&t, LuaValue::Integer(i - 1))?;
                vm.set_index(&t, LuaValue::Integer(i), v)?;
                i -= 1;
            }
            vm.set_index(&t, LuaValue::Integer(pos), args.get(2))?;
        }
        _ => return Err(vm.runtime_error("wrong number of arguments to 'insert'")),
    }
    Ok(vec![])
}

fn remove(vm: &mut Vm, args: Args) -> LibResult {
    let t = LuaValue::Table(args.table(vm, 0)?);
    let size = length(vm, &t)?;
    let mut pos = args.opt_int(vm, 1, size)?;
    // Removing at `#t + 1` is allowed.
    if pos != size && (pos as u64).wrapping_sub(1) > size as u64 {
        return Err(args.error(vm, 1, "position out of bounds"));
    }
    let removed = vm.index_value(&t, LuaValue::Integer(pos))?;
    while pos < size {
        let v = vm.index_value(&t, LuaValue::Integer(pos + 1))?;
        vm.set_index(&t, LuaValue::Integer(pos), v)?;
        pos += 1;
    }
    vm.set_index(&t, LuaValue::Integer(pos), LuaValue::Nil)?;
    Ok(vec![removed])
}

fn pack(_vm: &mut Vm, args: Args) -> LibResult {
    let n = args.len() as i64;
    let mut t = LuaTable::from_values(args.into_vec());
    t.set_str("n", LuaValue::Integer(n));
    Ok(vec![LuaValue::Table(t.into_ref())])
}

pub(crate) fn unpack(vm: &mut Vm, args: Args) -> LibResult {
    let t = args.get(0);
    let i = args.opt_int(vm, 1, 1)?;
    let j = if args.is_none_or_nil(2) { length(vm, &t)? } else { args.int(vm, 2)? };
    if i > j {
        return Ok(vec![]);
    }
    let n = (j as i128) - (i as i128) + 1;
    if n >= MAX_UNPACK as i128 {
        return Err(vm.runtime_error("too many results to unpack"));
    }
    let mut out = Vec::with_capacity(n as usize);
    for k in i..=j {
        out.push(vm.index_value(&t, LuaValue::Integer(k))?);
    }
    Ok(out)
}

// ── Sorting ───────────────────────────────────────────────────────────────────

fn sort(vm: &mut Vm, args: Args) -> LibResult {
    let t = LuaValue::Table(args.table(vm, 0)?);
    let n = length(vm, &t)?;
    if n > i32::MAX as i64 {
        return Err(args.error(vm, 0, "array too big"));
    }
    let comp = if args.is_none_or_nil(1) { None } else { Some(args.function(vm, 1)?) };
    let mut items = Vec::with_capacity(n.max(0) as usize);
    for i in 1..=n {
        items.push(vm.index_value(&t, LuaValue::Integer(i))?);
    }
    let mut less = |vm: &mut Vm, a: &LuaValue, b: &LuaValue| -> Result<bool, LuaError> {
        match &comp {
            Some(f) => Ok(first(vm.call_value(f.clone(), vec![a.clone(), b.clone()])?).is_truthy()),
            None => vm.less_than(a, b),
        }
    };
    merge_sort(vm, &mut items, &mut less)?;
    for (i, v) in items.into_iter().enumerate() {
        vm.set_index(&t, LuaValue::Integer(i as i64 + 1), v)?;
    }
    Ok(vec![])
}

/// Stable merge sort with a comparator that can fail.
fn merge_sort<F>(vm: &mut Vm, items: &mut Vec<LuaValue>, less: &mut F) -> Result<(), LuaError>
where
    F: FnMut(&mut Vm, &LuaValue, &LuaValue) -> Result<bool, LuaError>,
{
    let len = items.len();
    if len <= 1 {
        return Ok(());
    }
    let mut src = std::mem::take(items);
    let mut dst = Vec::with_capacity(len);
    let mut width = 1;
    while width < len {
        dst.clear();
        let mut lo = 0;
        while lo < len {
            let mid = (lo + width).min(len);
            let hi = (lo + 2 * width).min(len);
            let (mut a, mut b) = (lo, mid);
            while a < mid && b < hi {
                if less(vm, &src[b], &src[a])? {
                    dst.push(src[b].clone());
                    b += 1;
                } else {
                    dst.push(src[a].clone());
                    a += 1;
                }
            }
            dst.extend_from_slice(&src[a..mid]);
            dst.extend_from_slice(&src[b..hi]);
            lo = hi;
        }
        std::mem::swap(&mut src, &mut dst);
        width *= 2;
    }
    *items = src;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_all(src: &str) -> Vec<LuaValue> {
        Vm::new().exec(src, "=tbl").unwrap()
    }

    fn run(src: &str) -> LuaValue {
        first(run_all(src))
    }

    fn err(src: &str) -> String {
        Vm::new().exec(src, "=tbl").unwrap_err().to_string()
    }

    #[test]
    fn concat_joins_strings_and_numbers() {
        assert_eq!(run("return table.concat({1, 'two', 3.5}, ', ')"), LuaValue::from("1, two, 3.5"));
        assert_eq!(run("return table.concat({'a', 'b', 'c'}, '-', 2, 3)"), LuaValue::from("b-c"));
        assert_eq!(run("return table.concat({})"), LuaValue::from(""));
        assert_eq!(
            err("return table.concat({1, {}, 3})"),
            "tbl:1: invalid value (at index 2) in table for 'concat'"
        );
    }

    #[test]
    fn insert_and_remove_shift_elements() {
        let src = r#"
            local t = {1, 2, 3}
            table.insert(t, 4)
            table.insert(t, 1, 0)
            local r = table.remove(t, 2)
            local last = table.remove(t)
            return table.concat(t, ','), r, last, #t
        "#;
        assert_eq!(
            run_all(src),
            vec![LuaValue::from("0,2,3"), LuaValue::Integer(1), LuaValue::Integer(4), LuaValue::Integer(3)]
        );
        assert_eq!(run("local t = {} return table.remove(t)"), LuaValue::Nil);
    }

    #[test]
    fn insert_checks_position_and_arity() {
        assert!(err("table.insert({1, 2}, 5, 'x')").contains("bad argument #2 to 'insert' (position out of bounds)"));
        assert!(err("table.insert({}, 1, 2, 3)").contains("wrong number of arguments to 'insert'"));
        assert!(err("table.remove({1, 2}, 7)").contains("position out of bounds"));
    }

    #[test]
    fn pack_and_unpack() {
        assert_eq!(
            run_all("local t = table.pack(1, nil, 3) return t.n, t[1], t[3]"),
            vec![LuaValue::Integer(3), LuaValue::Integer(1), LuaValue::Integer(3)]
        );
        assert_eq!(
            run_all("return table.unpack({1, 2, 3}, 2)"),
            vec![LuaValue::Integer(2), LuaValue::Integer(3)]
        );
        assert_eq!(run_all("return unpack({1, 2}, 1, 3)").len(), 3);
        assert!(err("return table.unpack({}, 1, 1e8)").contains("too many results to unpack"));
    }

    #[test]
    fn sort_default_and_custom_order() {
        assert_eq!(
            run("local t = {5, 2, 8, 1, 9, 3} table.sort(t) return table.concat(t, ' ')"),
            LuaValue::from("1 2 3 5 8 9")
        );
        assert_eq!(
            run("local t = {'b', 'c', 'a'} table.sort(t, function(a, b) return a > b end) return table.concat(t)"),
            LuaValue::from("cba")
        );
        let src = r#"
            local t = {}
            for i = 1, 200 do t[i] = (i * 7919) % 1000 end
            table.sort(t)
            for i = 2, #t do if t[i - 1] > t[i] then return false end end
            return true
        "#;
        assert_eq!(run(src), LuaValue::Boolean(true));
    }

    #[test]
    fn sort_propagates_comparison_errors() {
        assert!(err("table.sort({1, 'x', 2})").contains("attempt to compare"));
        assert!(err("table.sort({3, 2, 1}, function() error('cmp', 0) end)").contains("cmp"));
    }

    #[test]
    fn length_metamethod_is_honoured() {
        let src = r#"
            local t = setmetatable({}, {__len = function() return 2 end, __index = function(_, k) return k * 10 end})
            return table.concat(t, ',')
        "#;
        assert_eq!(run(src), LuaValue::from("10,20"));
    }
}
