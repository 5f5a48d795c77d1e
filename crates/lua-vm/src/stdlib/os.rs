use std::fmt::Write as _;
use std::sync::OnceLock;
use std::time::Instant;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Datelike, Local, NaiveDate, TimeDelta, TimeZone, Timelike, Utc};
use rand::Rng;

use super::io::io_failure;
use super::{new_lib, Args, LibResult};
use crate::error::LuaError;
use crate::table::{LuaTable, TableRef};
use crate::value::LuaValue;
use crate::vm::Vm;

static CLOCK_START: OnceLock<Instant> = OnceLock::new();

pub(crate) fn open(vm: &mut Vm) {
    CLOCK_START.get_or_init(Instant::now);
    new_lib(
        vm,
        "os",
        &[
            ("clock", clock),
            ("date", date),
            ("difftime", difftime),
            ("exit", exit),
            ("getenv", getenv),
            ("remove", remove),
            ("rename", rename),
            ("time", time),
            ("tmpname", tmpname),
        ],
    );
}

fn clock(_vm: &mut Vm, _args: Args) -> LibResult {
    let start = CLOCK_START.get_or_init(Instant::now);
    Ok(vec![LuaValue::Float(start.elapsed().as_secs_f64())])
}

fn difftime(vm: &mut Vm, args: Args) -> LibResult {
    let t2 = args.int(vm, 0)?;
    let t1 = args.opt_int(vm, 1, 0)?;
    Ok(vec![LuaValue::Float(t2 as f64 - t1 as f64)])
}

fn exit(vm: &mut Vm, args: Args) -> LibResult {
    let code = match args.get(0) {
        LuaValue::Nil | LuaValue::Boolean(true) => 0,
        LuaValue::Boolean(false) => 1,
        _ => args.int(vm, 0)? as i32,
    };
    let _ = vm.output().flush();
    std::process::exit(code)
}

fn getenv(vm: &mut Vm, args: Args) -> LibResult {
    let name = args.string(vm, 0)?;
    Ok(vec![match std::env::var(&*name.to_str_lossy()) {
        Ok(v) => LuaValue::from(v),
        Err(_) => LuaValue::Nil,
    }])
}

fn remove(vm: &mut Vm, args: Args) -> LibResult {
    let path = args.string(vm, 0)?.to_str_lossy().into_owned();
    let result = match std::fs::metadata(&path) {
        Ok(m) if m.is_dir() => std::fs::remove_dir(&path),
        _ => std::fs::remove_file(&path),
    };
    match result {
        Ok(()) => Ok(vec![LuaValue::Boolean(true)]),
        Err(e) => Ok(io_failure(&e, Some(&path))),
    }
}

fn rename(vm: &mut Vm, args: Args) -> LibResult {
    let from = args.string(vm, 0)?.to_str_lossy().into_owned();
    let to = args.string(vm, 1)?.to_str_lossy().into_owned();
    match std::fs::rename(&from, &to) {
        Ok(()) => Ok(vec![LuaValue::Boolean(true)]),
        Err(e) => Ok(io_failure(&e, Some(&from))),
    }
}

fn tmpname(vm: &mut Vm, _args: Args) -> LibResult {
    let dir = std::env::temp_dir();
    for _ in 0..16 {
        let mut name = String::from("lua_");
        for _ in 0..6 {
            let _ = write!(name, "{:x}", vm.rng.gen_range(0..16u8));
        }
        let path = dir.join(name);
        if std::fs::OpenOptions::new().write(true).create_new(true).open(&path).is_ok() {
            return Ok(vec![LuaValue::from(path.display().to_string())]);
        }
    }
    Err(vm.runtime_error("unable to generate a unique filename"))
}

// ── Dates ─────────────────────────────────────────────────────────────────────

fn date(vm: &mut Vm, args: Args) -> LibResult {
    let format = args.opt_string(vm, 0)?;
    let format = format.as_ref().map_or("%c".into(), |f| f.to_str_lossy());
    let t = if args.is_none_or_nil(1) { Utc::now().timestamp() } else { args.int(vm, 1)? };
    let (utc, format) = match format.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, &*format),
    };
    let Some(instant) = DateTime::from_timestamp(t, 0) else {
        return Err(vm.runtime_error("time result cannot be represented in this installation"));
    };
    if format.starts_with("*t") {
        let table = if utc {
            date_table(&instant)
        } else {
            date_table(&instant.with_timezone(&Local))
        };
        return Ok(vec![LuaValue::Table(table.into_ref())]);
    }
    let items: Vec<Item<'_>> = StrftimeItems::new(format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(args.error(vm, 0, "invalid conversion specifier"));
    }
    let text = if utc {
        instant.format_with_items(items.into_iter()).to_string()
    } else {
        instant.with_timezone(&Local).format_with_items(items.into_iter()).to_string()
    };
    Ok(vec![LuaValue::from(text)])
}

fn date_table<Tz: TimeZone>(dt: &DateTime<Tz>) -> LuaTable {
    let mut t = LuaTable::with_capacity(0, 9);
    t.set_str("year", LuaValue::Integer(dt.year() as i64));
    t.set_str("month", LuaValue::Integer(dt.month() as i64));
    t.set_str("day", LuaValue::Integer(dt.day() as i64));
    t.set_str("hour", LuaValue::Integer(dt.hour() as i64));
    t.set_str("min", LuaValue::Integer(dt.minute() as i64));
    t.set_str("sec", LuaValue::Integer(dt.second() as i64));
    t.set_str("wday", LuaValue::Integer(dt.weekday().num_days_from_sunday() as i64 + 1));
    t.set_str("yday", LuaValue::Integer(dt.ordinal() as i64));
    t.set_str("isdst", LuaValue::Boolean(false));
    t
}

/// Integer field of a date table; `default` of `None` makes it required.
fn date_field(vm: &Vm, t: &TableRef, key: &str, default: Option<i64>) -> Result<i64, LuaError> {
    match t.read().get_str(key) {
        LuaValue::Nil => default.ok_or_else(|| vm.runtime_error(format!("field '{key}' missing in date table"))),
        v => v
            .to_integer()
            .ok_or_else(|| vm.runtime_error(format!("field '{key}' is not an integer"))),
    }
}

fn time(vm: &mut Vm, args: Args) -> LibResult {
    if args.is_none_or_nil(0) {
        return Ok(vec![LuaValue::Integer(Utc::now().timestamp())]);
    }
    let t = args.table(vm, 0)?;
    let year = date_field(vm, &t, "year", None)?;
    let month = date_field(vm, &t, "month", None)?;
    let day = date_field(vm, &t, "day", None)?;
    let hour = date_field(vm, &t, "hour", Some(12))?;
    let min = date_field(vm, &t, "min", Some(0))?;
    let sec = date_field(vm, &t, "sec", Some(0))?;

    let local = normalize(year, month, day, hour, min, sec)
        .and_then(|naive| Local.from_local_datetime(&naive).earliest());
    let Some(local) = local else {
        return Err(vm.runtime_error("time result cannot be represented in this installation"));
    };
    // Write the normalized fields back.
    let fields = date_table(&local);
    {
        let mut target = t.write();
        let mut key = LuaValue::Nil;
        while let Some((k, v)) = fields.next(&key)? {
            target.set(k.clone(), v)?;
            key = k;
        }
    }
    Ok(vec![LuaValue::Integer(local.timestamp())])
}

/// Calendar arithmetic allowing out-of-range fields (month 13, day 0, ...).
fn normalize(year: i64, month: i64, day: i64, hour: i64, min: i64, sec: i64) -> Option<chrono::NaiveDateTime> {
    let m0 = month.checked_sub(1)?;
    let year = i32::try_from(year.checked_add(m0.div_euclid(12))?).ok()?;
    let month = (m0.rem_euclid(12) + 1) as u32;
    let base = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
    let offset = TimeDelta::try_days(day.checked_sub(1)?)?
        .checked_add(&TimeDelta::try_hours(hour)?)?
        .checked_add(&TimeDelta::try_minutes(min)?)?
        .checked_add(&TimeDelta::try_seconds(sec)?)?;
    base.checked_add_signed(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::first;

    fn run_all(src: &str) -> Vec<LuaValue> {
        Vm::new().exec(src, "=os").unwrap()
    }

    fn run(src: &str) -> LuaValue {
        first(run_all(src))
    }

    #[test]
    fn utc_dates_format_deterministically() {
        assert_eq!(run("return os.date('!%Y-%m-%d %H:%M:%S', 0)"), LuaValue::from("1970-01-01 00:00:00"));
        assert_eq!(run("return os.date('!%d/%m/%y', 86400 * 365)"), LuaValue::from("01/01/71"));
        assert_eq!(
            run_all("local t = os.date('!*t', 86400) return t.year, t.month, t.day, t.wday, t.yday"),
            vec![
                LuaValue::Integer(1970),
                LuaValue::Integer(1),
                LuaValue::Integer(2),
                LuaValue::Integer(6),
                LuaValue::Integer(2),
            ]
        );
    }

    #[test]
    fn time_and_date_round_trip_in_local_time() {
        let src = r#"
            local t = os.time({year = 2020, month = 2, day = 29, hour = 13, min = 45, sec = 10})
            local d = os.date('*t', t)
            return d.year, d.month, d.day, d.hour, d.min, d.sec
        "#;
        assert_eq!(
            run_all(src),
            vec![
                LuaValue::Integer(2020),
                LuaValue::Integer(2),
                LuaValue::Integer(29),
                LuaValue::Integer(13),
                LuaValue::Integer(45),
                LuaValue::Integer(10),
            ]
        );
    }

    #[test]
    fn time_normalizes_out_of_range_fields() {
        let src = r#"
            local a = os.time({year = 2000, month = 13, day = 1, hour = 0})
            local b = os.time({year = 2001, month = 1, day = 1, hour = 0})
            local t = {year = 2021, month = 3, day = 0}
            os.time(t)
            return a == b, t.month, t.day
        "#;
        assert_eq!(
            run_all(src),
            vec![LuaValue::Boolean(true), LuaValue::Integer(2), LuaValue::Integer(28)]
        );
    }

    #[test]
    fn time_requires_date_fields() {
        let e = Vm::new().exec("return os.time({year = 2000, month = 1})", "=os").unwrap_err();
        assert!(e.to_string().contains("field 'day' missing in date table"));
        let e = Vm::new().exec("return os.date('%Q')", "=os").unwrap_err();
        assert!(e.to_string().contains("invalid conversion specifier"));
    }

    #[test]
    fn clock_difftime_and_getenv() {
        assert_eq!(run("return os.clock() >= 0"), LuaValue::Boolean(true));
        assert_eq!(run("return os.difftime(10, 4)"), LuaValue::Float(6.0));
        assert_eq!(run("return os.getenv('LUA_RUST_SURELY_UNSET_VARIABLE')"), LuaValue::Nil);
        assert_eq!(run("return math.type(os.time())"), LuaValue::from("integer"));
    }

    #[test]
    fn file_management() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, "x").unwrap();
        let (pa, pb) = (a.display().to_string(), b.display().to_string());
        let src = format!(
            "local r = os.rename('{pa}', '{pb}') local d = os.remove('{pb}') return r, d, os.remove('{pb}')"
        );
        let out = Vm::new().exec(&src, "=os").unwrap();
        assert_eq!(out[0], LuaValue::Boolean(true));
        assert_eq!(out[1], LuaValue::Boolean(true));
        assert_eq!(out[2], LuaValue::Nil);
        assert_eq!(out[3], LuaValue::from(format!("{pb}: No such file or directory")));
        assert!(!b.exists());
    }

    #[test]
    fn tmpname_creates_a_fresh_file() {
        let name = run("return os.tmpname()").to_string();
        let path = std::path::Path::new(&name);
        assert!(path.exists());
        std::fs::remove_file(path).unwrap();
    }
}
