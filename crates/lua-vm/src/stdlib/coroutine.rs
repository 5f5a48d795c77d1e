use super::{new_lib, Args, LibResult};
use crate::coroutine::{wrap as wrap_coroutine, CoroutineRef};
use crate::error::LuaError;
use crate::value::LuaValue;
use crate::vm::Vm;

pub(crate) fn open(vm: &mut Vm) {
    new_lib(
        vm,
        "coroutine",
        &[
            ("create", create),
            ("isyieldable", isyieldable),
            ("resume", resume),
            ("running", running),
            ("status", status),
            ("wrap", wrap),
            ("yield", yield_),
        ],
    );
}

fn thread_arg(vm: &Vm, args: &Args, i: usize) -> Result<CoroutineRef, LuaError> {
    match args.get(i) {
        LuaValue::Coroutine(co) => Ok(co),
        _ => Err(args.type_error(vm, i, "coroutine")),
    }
}

fn create(vm: &mut Vm, args: Args) -> LibResult {
    let body = args.function(vm, 0)?;
    Ok(vec![LuaValue::Coroutine(vm.create_coroutine(body))])
}

fn resume(vm: &mut Vm, args: Args) -> LibResult {
    let co = thread_arg(vm, &args, 0)?;
    match vm.resume(&co, args.rest(1))? {
        Ok(mut vals) => {
            vals.insert(0, LuaValue::Boolean(true));
            Ok(vals)
        }
        Err(e) => Ok(vec![LuaValue::Boolean(false), e]),
    }
}

fn yield_(vm: &mut Vm, args: Args) -> LibResult {
    if vm.is_main_thread() {
        return Err(vm.runtime_error("attempt to yield from outside a coroutine"));
    }
    if !vm.is_yieldable() {
        return Err(vm.runtime_error("attempt to yield across a C-call boundary"));
    }
    Err(LuaError::Yield(args.into_vec()))
}

fn wrap(vm: &mut Vm, args: Args) -> LibResult {
    let body = args.function(vm, 0)?;
    let co = vm.create_coroutine(body);
    Ok(vec![wrap_coroutine(co)])
}

fn status(vm: &mut Vm, args: Args) -> LibResult {
    let co = thread_arg(vm, &args, 0)?;
    Ok(vec![LuaValue::from(vm.coroutine_status(&co).name())])
}

fn running(vm: &mut Vm, _args: Args) -> LibResult {
    Ok(vec![
        LuaValue::Coroutine(vm.running_coroutine()),
        LuaValue::Boolean(vm.is_main_thread()),
    ])
}

fn isyieldable(vm: &mut Vm, _args: Args) -> LibResult {
    Ok(vec![LuaValue::Boolean(vm.is_yieldable())])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_all(src: &str) -> Vec<LuaValue> {
        Vm::new().exec(src, "=colib").unwrap()
    }

    #[test]
    fn running_reports_the_main_thread() {
        let out = run_all("local co, main = coroutine.running() return type(co), main");
        assert_eq!(out, vec![LuaValue::from("thread"), LuaValue::Boolean(true)]);
        let src = r#"
            local co = coroutine.create(function()
                local me, main = coroutine.running()
                return type(me), main
            end)
            return coroutine.resume(co)
        "#;
        assert_eq!(
            run_all(src),
            vec![LuaValue::Boolean(true), LuaValue::from("thread"), LuaValue::Boolean(false)]
        );
    }

    #[test]
    fn argument_checks() {
        let e = Vm::new().exec("coroutine.create(1)", "=colib").unwrap_err();
        assert!(e.to_string().contains("bad argument #1 to 'create' (function expected, got number)"));
        let e = Vm::new().exec("coroutine.resume({})", "=colib").unwrap_err();
        assert!(e.to_string().contains("bad argument #1 to 'resume' (coroutine expected, got table)"));
    }

    #[test]
    fn producer_consumer() {
        let src = r#"
            local producer = coroutine.create(function()
                for _, item in ipairs({'a', 'b', 'c'}) do coroutine.yield(item) end
                return 'done'
            end)
            local got = {}
            while true do
                local ok, v = coroutine.resume(producer)
                if coroutine.status(producer) == 'dead' then got[#got + 1] = v break end
                got[#got + 1] = v
            end
            return table.concat(got, ' ')
        "#;
        assert_eq!(run_all(src), vec![LuaValue::from("a b c done")]);
    }

    #[test]
    fn yield_inside_metamethod_called_from_host_is_rejected() {
        let src = r#"
            local t = setmetatable({}, {__index = function() return coroutine.yield(1) end})
            local co = coroutine.create(function() return table.concat({t.x}) end)
            return coroutine.resume(co)
        "#;
        let out = run_all(src);
        assert_eq!(out[0], LuaValue::Boolean(false));
        assert!(out[1].to_string().contains("attempt to yield across a C-call boundary"));
    }
}
