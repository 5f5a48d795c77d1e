//! `io` library: file handles as userdata over `std::fs::File`.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use lua_core::number::parse_number;
use lua_core::LuaStr;
use parking_lot::Mutex;
use tracing::debug;

use super::{native, Args, LibFn, LibResult};
use crate::error::LuaError;
use crate::table::{LuaTable, TableRef};
use crate::value::{LuaValue, UserData};
use crate::vm::Vm;

/// Longest numeral `read("n")` will consume.
const MAX_NUMERAL: usize = 200;

enum Stream {
    Stdin,
    Stdout,
    Stderr,
    Disk(BufReader<File>),
    Closed,
}

struct LuaFile {
    stream: Stream,
}

impl LuaFile {
    fn is_standard(&self) -> bool {
        matches!(self.stream, Stream::Stdin | Stream::Stdout | Stream::Stderr)
    }

    fn write(&mut self, vm: &mut Vm, bytes: &[u8]) -> io::Result<()> {
        match &mut self.stream {
            Stream::Stdout => vm.output().write_all(bytes),
            Stream::Stderr => io::stderr().write_all(bytes),
            Stream::Disk(reader) => {
                // Drop read-ahead so the write lands at the logical position.
                reader.seek(SeekFrom::Current(0))?;
                reader.get_mut().write_all(bytes)
            }
            Stream::Stdin | Stream::Closed => Err(bad_descriptor()),
        }
    }

    fn read(&mut self, formats: &[ReadFormat]) -> io::Result<Vec<LuaValue>> {
        match &mut self.stream {
            Stream::Stdin => read_formats(&mut io::stdin().lock(), formats),
            Stream::Disk(reader) => read_formats(reader, formats),
            _ => Err(bad_descriptor()),
        }
    }

    fn flush(&mut self, vm: &mut Vm) -> io::Result<()> {
        match &mut self.stream {
            Stream::Stdout => vm.output().flush(),
            Stream::Stderr => io::stderr().flush(),
            Stream::Disk(reader) => reader.get_mut().flush(),
            Stream::Stdin | Stream::Closed => Ok(()),
        }
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.stream {
            Stream::Disk(reader) => reader.seek(pos),
            _ => Err(io::Error::from_raw_os_error(29)),
        }
    }
}

fn bad_descriptor() -> io::Error {
    io::Error::from_raw_os_error(9)
}

/// errno-style wording for common I/O failures.
pub(crate) fn describe_io_error(e: &io::Error) -> String {
    match e.kind() {
        ErrorKind::NotFound => "No such file or directory".to_string(),
        ErrorKind::PermissionDenied => "Permission denied".to_string(),
        ErrorKind::AlreadyExists => "File exists".to_string(),
        _ => {
            let text = e.to_string();
            match text.find(" (os error") {
                Some(i) => text[..i].to_string(),
                None => text,
            }
        }
    }
}

/// `nil, message, code` as returned by failing io functions.
pub(crate) fn io_failure(e: &io::Error, name: Option<&str>) -> Vec<LuaValue> {
    let msg = match name {
        Some(name) => format!("{name}: {}", describe_io_error(e)),
        None => describe_io_error(e),
    };
    vec![
        LuaValue::Nil,
        LuaValue::from(msg),
        LuaValue::Integer(e.raw_os_error().unwrap_or(0) as i64),
    ]
}

// ── Reading ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum ReadFormat {
    Number,
    Line,
    LineWithEnd,
    All,
    Count(usize),
}

fn parse_formats(vm: &Vm, args: &Args, from: usize) -> Result<Vec<ReadFormat>, LuaError> {
    if args.len() <= from {
        return Ok(vec![ReadFormat::Line]);
    }
    (from..args.len())
        .map(|i| match args.get(i) {
            LuaValue::Integer(n) => Ok(ReadFormat::Count(n.max(0) as usize)),
            LuaValue::Float(_) => Ok(ReadFormat::Count(args.int(vm, i)?.max(0) as usize)),
            LuaValue::LuaString(s) => {
                let bytes = s.as_bytes();
                let spec = bytes.strip_prefix(b"*").unwrap_or(bytes);
                match spec.first() {
                    Some(b'n') => Ok(ReadFormat::Number),
                    Some(b'l') => Ok(ReadFormat::Line),
                    Some(b'L') => Ok(ReadFormat::LineWithEnd),
                    Some(b'a') => Ok(ReadFormat::All),
                    _ => Err(args.error(vm, i, "invalid format")),
                }
            }
            _ => Err(args.error(vm, i, "invalid format")),
        })
        .collect()
}

/// Read each format in turn, stopping after the first that fails.
fn read_formats<R: BufRead>(r: &mut R, formats: &[ReadFormat]) -> io::Result<Vec<LuaValue>> {
    let mut out = Vec::with_capacity(formats.len());
    for &format in formats {
        let value = match format {
            ReadFormat::Number => read_number(r)?,
            ReadFormat::Line => read_line(r, false)?,
            ReadFormat::LineWithEnd => read_line(r, true)?,
            ReadFormat::All => {
                let mut buf = Vec::new();
                r.read_to_end(&mut buf)?;
                LuaValue::from(LuaStr::from(buf))
            }
            ReadFormat::Count(0) => {
                if r.fill_buf()?.is_empty() {
                    LuaValue::Nil
                } else {
                    LuaValue::from("")
                }
            }
            ReadFormat::Count(n) => {
                let mut buf = Vec::with_capacity(n.min(1 << 16));
                r.by_ref().take(n as u64).read_to_end(&mut buf)?;
                if buf.is_empty() {
                    LuaValue::Nil
                } else {
                    LuaValue::from(LuaStr::from(buf))
                }
            }
        };
        let failed = value.is_nil();
        out.push(value);
        if failed {
            break;
        }
    }
    Ok(out)
}

fn read_line<R: BufRead>(r: &mut R, keep_newline: bool) -> io::Result<LuaValue> {
    let mut buf = Vec::new();
    if r.read_until(b'\n', &mut buf)? == 0 {
        return Ok(LuaValue::Nil);
    }
    if !keep_newline && buf.last() == Some(&b'\n') {
        buf.pop();
    }
    Ok(LuaValue::from(LuaStr::from(buf)))
}

fn peek<R: BufRead>(r: &mut R) -> io::Result<Option<u8>> {
    Ok(r.fill_buf()?.first().copied())
}

fn read_number<R: BufRead>(r: &mut R) -> io::Result<LuaValue> {
    while peek(r)?.is_some_and(|c| c.is_ascii_whitespace()) {
        r.consume(1);
    }
    let mut text = Vec::new();
    while text.len() < MAX_NUMERAL {
        let Some(c) = peek(r)? else { break };
        let accept = match c {
            b'+' | b'-' => text.is_empty() || matches!(text.last(), Some(b'e' | b'E' | b'p' | b'P')),
            b'.' | b'x' | b'X' | b'p' | b'P' => true,
            c => c.is_ascii_hexdigit(),
        };
        if !accept {
            break;
        }
        text.push(c);
        r.consume(1);
    }
    let parsed = std::str::from_utf8(&text).ok().and_then(parse_number);
    Ok(parsed.map_or(LuaValue::Nil, LuaValue::from_number))
}

// ── Handles ───────────────────────────────────────────────────────────────────

/// Library state shared by the `io` functions.
struct IoState {
    meta: TableRef,
    stdin: LuaValue,
    output: Mutex<LuaValue>,
}

impl IoState {
    fn new_file(&self, stream: Stream) -> LuaValue {
        LuaValue::UserData(Arc::new(UserData::new(LuaFile { stream }, Some(self.meta.clone()))))
    }
}

/// Run `f` on the open file passed as argument `i`.
fn with_file<T>(
    vm: &mut Vm,
    args: &Args,
    i: usize,
    f: impl FnOnce(&mut Vm, &mut LuaFile) -> T,
) -> Result<T, LuaError> {
    let LuaValue::UserData(ud) = args.get(i) else {
        return Err(args.type_error(vm, i, "FILE*"));
    };
    let mut data = ud.data.lock();
    let Some(file) = data.downcast_mut::<LuaFile>() else {
        return Err(args.type_error(vm, i, "FILE*"));
    };
    if matches!(file.stream, Stream::Closed) {
        return Err(vm.runtime_error("attempt to use a closed file"));
    }
    Ok(f(vm, file))
}

fn open_file(path: &str, mode: &str) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    let update = mode.contains('+');
    match mode.as_bytes().first() {
        Some(b'w') => opts.write(true).create(true).truncate(true).read(update),
        Some(b'a') => opts.append(true).create(true).read(update),
        _ => opts.read(true).write(update),
    };
    opts.open(path)
}

fn valid_mode(mode: &[u8]) -> bool {
    let Some((first, rest)) = mode.split_first() else {
        return false;
    };
    let rest = rest.strip_prefix(b"+").unwrap_or(rest);
    matches!(first, b'r' | b'w' | b'a') && rest.iter().all(|&c| c == b'b')
}

pub(crate) fn open(vm: &mut Vm) {
    let methods: &[(&'static str, LibFn)] = &[
        ("close", f_close),
        ("flush", f_flush),
        ("lines", f_lines),
        ("read", f_read),
        ("seek", f_seek),
        ("write", f_write),
    ];
    let meta = LuaTable::new_ref();
    {
        let mut index = LuaTable::new();
        for &(name, f) in methods {
            index.set_str(name, native(name, f));
        }
        let mut m = meta.write();
        m.set_str("__index", LuaValue::Table(index.into_ref()));
        m.set_str("__name", LuaValue::from("FILE*"));
        m.set_str("__tostring", native("tostring", f_tostring));
    }
    let stdin = LuaValue::UserData(Arc::new(UserData::new(LuaFile { stream: Stream::Stdin }, Some(meta.clone()))));
    let stdout = LuaValue::UserData(Arc::new(UserData::new(LuaFile { stream: Stream::Stdout }, Some(meta.clone()))));
    let stderr = LuaValue::UserData(Arc::new(UserData::new(LuaFile { stream: Stream::Stderr }, Some(meta.clone()))));
    let state = Arc::new(IoState {
        meta,
        stdin: stdin.clone(),
        output: Mutex::new(stdout.clone()),
    });

    let funcs: &[(&'static str, fn(&mut Vm, &IoState, Args) -> LibResult)] = &[
        ("close", io_close),
        ("lines", io_lines),
        ("open", io_open),
        ("output", io_output),
        ("read", io_read),
        ("type", io_type),
        ("write", io_write),
    ];
    let lib = LuaTable::new_ref();
    {
        let mut t = lib.write();
        for &(name, f) in funcs {
            let state = state.clone();
            t.set_str(name, LuaValue::native(name, move |vm, vals| f(vm, &state, Args::new(name, vals))));
        }
        t.set_str("stdin", stdin);
        t.set_str("stdout", stdout);
        t.set_str("stderr", stderr);
    }
    vm.set_global("io", LuaValue::Table(lib));
}

// ── io.* ──────────────────────────────────────────────────────────────────────

fn io_open(vm: &mut Vm, state: &IoState, args: Args) -> LibResult {
    let path = args.string(vm, 0)?;
    let mode = args.opt_string(vm, 1)?.unwrap_or_else(|| LuaStr::from("r"));
    if !valid_mode(mode.as_bytes()) {
        return Err(args.error(vm, 1, "invalid mode"));
    }
    let path = path.to_str_lossy();
    match open_file(&path, &mode.to_str_lossy()) {
        Ok(file) => {
            debug!(target: "lua::vm", path = %path, mode = %mode, "file opened");
            Ok(vec![state.new_file(Stream::Disk(BufReader::new(file)))])
        }
        Err(e) => Ok(io_failure(&e, Some(&*path))),
    }
}

fn io_close(vm: &mut Vm, state: &IoState, args: Args) -> LibResult {
    if args.is_none_or_nil(0) {
        let out = state.output.lock().clone();
        return f_close(vm, Args::new("close", vec![out]));
    }
    f_close(vm, args)
}

fn io_write(vm: &mut Vm, state: &IoState, args: Args) -> LibResult {
    let out = state.output.lock().clone();
    let mut vals = args.into_vec();
    vals.insert(0, out);
    f_write(vm, Args::new("write", vals))
}

fn io_read(vm: &mut Vm, state: &IoState, args: Args) -> LibResult {
    let mut vals = args.into_vec();
    vals.insert(0, state.stdin.clone());
    f_read(vm, Args::new("read", vals))
}

fn io_output(vm: &mut Vm, state: &IoState, args: Args) -> LibResult {
    match args.get(0) {
        LuaValue::Nil => {}
        LuaValue::UserData(_) => {
            with_file(vm, &args, 0, |_, _| ())?;
            *state.output.lock() = args.get(0);
        }
        _ => {
            let name = args.string(vm, 0)?;
            let path = name.to_str_lossy();
            let file = open_file(&path, "w")
                .map_err(|e| vm.runtime_error(format!("{path}: {}", describe_io_error(&e))))?;
            *state.output.lock() = state.new_file(Stream::Disk(BufReader::new(file)));
        }
    }
    Ok(vec![state.output.lock().clone()])
}

fn io_lines(vm: &mut Vm, state: &IoState, args: Args) -> LibResult {
    let formats = parse_formats(vm, &args, 1)?;
    if args.is_none_or_nil(0) {
        return Ok(vec![lines_iter(state.stdin.clone(), formats, false)]);
    }
    let name = args.string(vm, 0)?;
    let path = name.to_str_lossy();
    let file = open_file(&path, "r")
        .map_err(|e| vm.runtime_error(format!("{path}: {}", describe_io_error(&e))))?;
    let handle = state.new_file(Stream::Disk(BufReader::new(file)));
    Ok(vec![lines_iter(handle, formats, true)])
}

fn io_type(_vm: &mut Vm, state: &IoState, args: Args) -> LibResult {
    let LuaValue::UserData(ud) = args.get(0) else {
        return Ok(vec![LuaValue::Nil]);
    };
    let is_file = ud.metatable.read().as_ref().is_some_and(|m| Arc::ptr_eq(m, &state.meta));
    if !is_file {
        return Ok(vec![LuaValue::Nil]);
    }
    let data = ud.data.lock();
    Ok(vec![match data.downcast_ref::<LuaFile>() {
        Some(LuaFile { stream: Stream::Closed }) => LuaValue::from("closed file"),
        Some(_) => LuaValue::from("file"),
        None => LuaValue::Nil,
    }])
}

/// Iterator over `file` reading `formats` per step. Owned handles are
/// closed at end of input.
fn lines_iter(file: LuaValue, formats: Vec<ReadFormat>, owned: bool) -> LuaValue {
    LuaValue::native("lines_iter", move |vm, _| {
        let args = Args::new("lines", vec![file.clone()]);
        let read = with_file(vm, &args, 0, |_, f| f.read(&formats))?;
        let vals = read.map_err(|e| vm.runtime_error(describe_io_error(&e)))?;
        if vals.first().map_or(true, LuaValue::is_nil) && owned {
            with_file(vm, &args, 0, |_, f| f.stream = Stream::Closed)?;
        }
        Ok(vals)
    })
}

// ── File methods ──────────────────────────────────────────────────────────────

fn f_write(vm: &mut Vm, args: Args) -> LibResult {
    let mut chunks = Vec::with_capacity(args.len().saturating_sub(1));
    for i in 1..args.len() {
        match args.get(i) {
            v @ (LuaValue::LuaString(_) | LuaValue::Integer(_) | LuaValue::Float(_)) => {
                chunks.extend(v.to_lua_str());
            }
            _ => return Err(args.type_error(vm, i, "string")),
        }
    }
    let result = with_file(vm, &args, 0, |vm, f| {
        chunks.iter().try_for_each(|c| f.write(vm, c.as_bytes()))
    })?;
    match result {
        Ok(()) => Ok(vec![args.get(0)]),
        Err(e) => Ok(io_failure(&e, None)),
    }
}

fn f_read(vm: &mut Vm, args: Args) -> LibResult {
    let formats = parse_formats(vm, &args, 1)?;
    match with_file(vm, &args, 0, |_, f| f.read(&formats))? {
        Ok(vals) => Ok(vals),
        Err(e) => Ok(io_failure(&e, None)),
    }
}

fn f_lines(vm: &mut Vm, args: Args) -> LibResult {
    with_file(vm, &args, 0, |_, _| ())?;
    let formats = parse_formats(vm, &args, 1)?;
    Ok(vec![lines_iter(args.get(0), formats, false)])
}

fn f_seek(vm: &mut Vm, args: Args) -> LibResult {
    let whence = args.opt_string(vm, 1)?.unwrap_or_else(|| LuaStr::from("cur"));
    let offset = args.opt_int(vm, 2, 0)?;
    let pos = match whence.as_bytes() {
        b"set" => SeekFrom::Start(offset.max(0) as u64),
        b"cur" => SeekFrom::Current(offset),
        b"end" => SeekFrom::End(offset),
        other => {
            let msg = format!("invalid option '{}'", String::from_utf8_lossy(other));
            return Err(args.error(vm, 1, msg));
        }
    };
    match with_file(vm, &args, 0, |_, f| f.seek(pos))? {
        Ok(p) => Ok(vec![LuaValue::Integer(p as i64)]),
        Err(e) => Ok(io_failure(&e, None)),
    }
}

fn f_flush(vm: &mut Vm, args: Args) -> LibResult {
    match with_file(vm, &args, 0, |vm, f| f.flush(vm))? {
        Ok(()) => Ok(vec![args.get(0)]),
        Err(e) => Ok(io_failure(&e, None)),
    }
}

fn f_close(vm: &mut Vm, args: Args) -> LibResult {
    let result = with_file(vm, &args, 0, |vm, f| {
        if f.is_standard() {
            return Err("cannot close standard file");
        }
        let flushed = f.flush(vm);
        f.stream = Stream::Closed;
        Ok(flushed)
    })?;
    match result {
        Ok(Ok(())) => Ok(vec![LuaValue::Boolean(true)]),
        Ok(Err(e)) => Ok(io_failure(&e, None)),
        Err(msg) => Ok(vec![LuaValue::Nil, LuaValue::from(msg)]),
    }
}

fn f_tostring(_vm: &mut Vm, args: Args) -> LibResult {
    let LuaValue::UserData(ud) = args.get(0) else {
        return Ok(vec![LuaValue::from("file")]);
    };
    let closed = matches!(
        ud.data.lock().downcast_ref::<LuaFile>(),
        Some(LuaFile { stream: Stream::Closed })
    );
    let text = if closed {
        "file (closed)".to_string()
    } else {
        format!("file ({:p})", Arc::as_ptr(&ud))
    };
    Ok(vec![LuaValue::from(text)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::first;

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn lua_path(p: &std::path::Path) -> String {
        p.display().to_string().replace('\\', "/")
    }

    #[test]
    fn write_goes_to_the_output_sink() {
        let mut vm = Vm::new();
        let sink = Sink::default();
        vm.set_output(sink.clone());
        let out = vm.exec("return io.write('a', 1, ' ', 2.5, '\\n') == io.stdout", "=io").unwrap();
        assert_eq!(out, vec![LuaValue::Boolean(true)]);
        vm.exec("io.stdout:write('x'):write('y')", "=io").unwrap();
        assert_eq!(&*sink.0.lock(), b"a1 2.5\nxy");
    }

    #[test]
    fn files_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = lua_path(&dir.path().join("data.txt"));
        let src = format!(
            r#"
            local f = assert(io.open('{path}', 'w'))
            f:write('first line\n', 42, ' 3.5\n', 'tail')
            f:close()
            f = assert(io.open('{path}'))
            local line = f:read('l')
            local a, b = f:read('n', 'n')
            local rest = f:read('a')
            local eof = f:read('l')
            f:close()
            return line, a, b, rest, eof
            "#
        );
        let out = Vm::new().exec(&src, "=io").unwrap();
        assert_eq!(
            out,
            vec![
                LuaValue::from("first line"),
                LuaValue::Integer(42),
                LuaValue::Float(3.5),
                LuaValue::from("\ntail"),
                LuaValue::Nil,
            ]
        );
    }

    #[test]
    fn lines_iterates_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lines.txt");
        std::fs::write(&file, "one\ntwo\nthree").unwrap();
        let path = lua_path(&file);
        let src = format!(
            r#"
            local n, all = 0, ''
            for l in io.lines('{path}') do n = n + 1 all = all .. l end
            local f = io.open('{path}')
            local keep = {{}}
            for l in f:lines('L') do keep[#keep + 1] = l end
            f:close()
            return n, all, keep[1]
            "#
        );
        let out = Vm::new().exec(&src, "=io").unwrap();
        assert_eq!(out, vec![LuaValue::Integer(3), LuaValue::from("onetwothree"), LuaValue::from("one\n")]);
    }

    #[test]
    fn seek_and_append_modes() {
        let dir = tempfile::tempdir().unwrap();
        let path = lua_path(&dir.path().join("seek.txt"));
        let src = format!(
            r#"
            local f = io.open('{path}', 'w+')
            f:write('hello world')
            local size = f:seek('end')
            f:seek('set', 6)
            local word = f:read(5)
            f:close()
            f = io.open('{path}', 'a')
            f:write('!')
            f:close()
            f = io.open('{path}', 'r')
            local all = f:read('a')
            f:close()
            return size, word, all
            "#
        );
        let out = Vm::new().exec(&src, "=io").unwrap();
        assert_eq!(out, vec![LuaValue::Integer(11), LuaValue::from("world"), LuaValue::from("hello world!")]);
    }

    #[test]
    fn open_failures_return_nil_and_message() {
        let dir = tempfile::tempdir().unwrap();
        let path = lua_path(&dir.path().join("missing.txt"));
        let out = Vm::new().exec(&format!("return io.open('{path}')"), "=io").unwrap();
        assert_eq!(out[0], LuaValue::Nil);
        assert_eq!(out[1], LuaValue::from(format!("{path}: No such file or directory")));
        assert_eq!(out[2], LuaValue::Integer(2));
        let e = Vm::new().exec("io.open('x', 'rw')", "=io").unwrap_err();
        assert!(e.to_string().contains("bad argument #2 to 'open' (invalid mode)"));
    }

    #[test]
    fn closed_and_standard_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = lua_path(&dir.path().join("c.txt"));
        let mut vm = Vm::new();
        let src = format!(
            r#"
            local f = io.open('{path}', 'w')
            local open_type = io.type(f)
            f:close()
            return open_type, io.type(f), tostring(f), io.type(42), io.stdout:close()
            "#
        );
        let out = vm.exec(&src, "=io").unwrap();
        assert_eq!(out[0], LuaValue::from("file"));
        assert_eq!(out[1], LuaValue::from("closed file"));
        assert_eq!(out[2], LuaValue::from("file (closed)"));
        assert_eq!(out[3], LuaValue::Nil);
        assert_eq!(out[4], LuaValue::Nil);
        let e = vm
            .exec(&format!("local f = io.open('{path}') f:close() f:read()"), "=io")
            .unwrap_err();
        assert!(e.to_string().contains("attempt to use a closed file"));
        let s = first(vm.exec("return tostring(io.stdout)", "=io").unwrap());
        assert!(s.to_string().starts_with("file (0x"));
    }

    #[test]
    fn output_can_be_redirected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("out.txt");
        let path = lua_path(&file);
        let src = format!("io.output('{path}') io.write('redirected') io.close() io.output(io.stdout)");
        Vm::new().exec(&src, "=io").unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "redirected");
    }

    #[test]
    fn read_formats_from_memory() {
        let mut r = io::Cursor::new(b"  0x10 -2e1 word\nnext".to_vec());
        let vals = read_formats(&mut r, &[ReadFormat::Number, ReadFormat::Number, ReadFormat::Number]).unwrap();
        assert_eq!(vals, vec![LuaValue::Integer(16), LuaValue::Float(-20.0), LuaValue::Nil]);
        let vals = read_formats(&mut r, &[ReadFormat::Line, ReadFormat::Count(2), ReadFormat::Count(0)]).unwrap();
        assert_eq!(vals, vec![LuaValue::from("word"), LuaValue::from("ne"), LuaValue::from("")]);
    }
}
