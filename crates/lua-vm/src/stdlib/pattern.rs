//! Lua pattern matching over byte strings.

const MAX_CAPTURES: usize = 32;
const MAX_RECURSION: usize = 200;
const ESC: u8 = b'%';
const SPECIALS: &[u8] = b"^$*+?.([%-";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapLen {
    Open,
    Position,
    Len(usize),
}

/// A captured value: a byte range of the subject, or a 1-based position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Capture {
    Span(usize, usize),
    Position(usize),
}

pub(crate) type PatResult<T> = Result<T, String>;

/// Whether `pat` can be searched for as a plain substring.
pub(crate) fn is_plain(pat: &[u8]) -> bool {
    !pat.iter().any(|c| SPECIALS.contains(c))
}

/// Plain substring search starting at `from`.
pub(crate) fn find_plain(src: &[u8], pat: &[u8], from: usize) -> Option<usize> {
    if pat.is_empty() {
        return Some(from);
    }
    src.get(from..)?
        .windows(pat.len())
        .position(|w| w == pat)
        .map(|i| i + from)
}

pub(crate) struct Matcher<'a> {
    src: &'a [u8],
    pat: &'a [u8],
    depth: usize,
    captures: Vec<(usize, CapLen)>,
}

impl<'a> Matcher<'a> {
    pub(crate) fn new(src: &'a [u8], pat: &'a [u8]) -> Self {
        Self {
            src,
            pat,
            depth: MAX_RECURSION,
            captures: Vec::new(),
        }
    }

    /// Try to match the pattern from `p` against the subject at `s`.
    /// Returns the end of the match.
    pub(crate) fn match_at(&mut self, s: usize, p: usize) -> PatResult<Option<usize>> {
        self.captures.clear();
        self.depth = MAX_RECURSION;
        self.do_match(s, p)
    }

    /// Captures of the last successful match at `s..e`. Without explicit
    /// captures the whole match is returned when `whole` is set.
    pub(crate) fn captures(&self, s: usize, e: usize, whole: bool) -> PatResult<Vec<Capture>> {
        if self.captures.is_empty() {
            return Ok(if whole { vec![Capture::Span(s, e)] } else { Vec::new() });
        }
        (0..self.captures.len()).map(|i| self.capture(i, s, e)).collect()
    }

    /// Capture `i`, or the whole match for index 0 of a capture-less pattern.
    pub(crate) fn capture(&self, i: usize, s: usize, e: usize) -> PatResult<Capture> {
        if i >= self.captures.len() {
            if i == 0 {
                return Ok(Capture::Span(s, e));
            }
            return Err(format!("invalid capture index %{}", i + 1));
        }
        let (start, len) = self.captures[i];
        match len {
            CapLen::Open => Err("unfinished capture".to_string()),
            CapLen::Position => Ok(Capture::Position(start + 1)),
            CapLen::Len(n) => Ok(Capture::Span(start, start + n)),
        }
    }

    fn do_match(&mut self, s: usize, p: usize) -> PatResult<Option<usize>> {
        if self.depth == 0 {
            return Err("pattern too complex".to_string());
        }
        self.depth -= 1;
        let result = self.match_here(s, p);
        self.depth += 1;
        result
    }

    fn match_here(&mut self, mut s: usize, mut p: usize) -> PatResult<Option<usize>> {
        let pat = self.pat;
        loop {
            if p == pat.len() {
                return Ok(Some(s));
            }
            match pat[p] {
                b'(' => {
                    return if pat.get(p + 1) == Some(&b')') {
                        self.start_capture(s, p + 2, CapLen::Position)
                    } else {
                        self.start_capture(s, p + 1, CapLen::Open)
                    };
                }
                b')' => return self.end_capture(s, p + 1),
                b'$' if p + 1 == pat.len() => {
                    return Ok((s == self.src.len()).then_some(s));
                }
                ESC if pat.get(p + 1) == Some(&b'b') => match self.match_balance(s, p + 2)? {
                    Some(end) => {
                        s = end;
                        p += 4;
                        continue;
                    }
                    None => return Ok(None),
                },
                ESC if pat.get(p + 1) == Some(&b'f') => {
                    p += 2;
                    if pat.get(p) != Some(&b'[') {
                        return Err("missing '[' after '%f' in pattern".to_string());
                    }
                    let ep = self.class_end(p)?;
                    let prev = if s == 0 { 0 } else { self.src[s - 1] };
                    let cur = self.src.get(s).copied().unwrap_or(0);
                    if !self.match_bracket(prev, p, ep - 1) && self.match_bracket(cur, p, ep - 1) {
                        p = ep;
                        continue;
                    }
                    return Ok(None);
                }
                ESC if pat.get(p + 1).is_some_and(u8::is_ascii_digit) => {
                    match self.match_capture(s, pat[p + 1])? {
                        Some(end) => {
                            s = end;
                            p += 2;
                            continue;
                        }
                        None => return Ok(None),
                    }
                }
                _ => {}
            }
            let ep = self.class_end(p)?;
            let matched = s < self.src.len() && self.single_match(self.src[s], p, ep);
            match pat.get(ep) {
                Some(b'?') => {
                    if matched {
                        if let Some(end) = self.do_match(s + 1, ep + 1)? {
                            return Ok(Some(end));
                        }
                    }
                    p = ep + 1;
                }
                Some(b'+') => return if matched { self.max_expand(s + 1, p, ep) } else { Ok(None) },
                Some(b'*') => return self.max_expand(s, p, ep),
                Some(b'-') => return self.min_expand(s, p, ep),
                _ => {
                    if !matched {
                        return Ok(None);
                    }
                    s += 1;
                    p = ep;
                }
            }
        }
    }

    /// Index just past the single-character class starting at `p`.
    fn class_end(&self, mut p: usize) -> PatResult<usize> {
        let pat = self.pat;
        let c = pat[p];
        p += 1;
        if c == ESC {
            if p >= pat.len() {
                return Err("malformed pattern (ends with '%')".to_string());
            }
            return Ok(p + 1);
        }
        if c == b'[' {
            if pat.get(p) == Some(&b'^') {
                p += 1;
            }
            // The first character is always part of the set, so `[]]` works.
            loop {
                if p >= pat.len() {
                    return Err("malformed pattern (missing ']')".to_string());
                }
                let cc = pat[p];
                p += 1;
                if cc == ESC && p < pat.len() {
                    p += 1;
                }
                if pat.get(p) == Some(&b']') {
                    return Ok(p + 1);
                }
            }
        }
        Ok(p)
    }

    fn single_match(&self, c: u8, p: usize, ep: usize) -> bool {
        match self.pat[p] {
            b'.' => true,
            ESC => match_class(c, self.pat[p + 1]),
            b'[' => self.match_bracket(c, p, ep - 1),
            pc => pc == c,
        }
    }

    /// `pat[p]` is `[` and `pat[ec]` the closing `]`.
    fn match_bracket(&self, c: u8, mut p: usize, ec: usize) -> bool {
        let pat = self.pat;
        let mut sig = true;
        p += 1;
        if pat.get(p) == Some(&b'^') {
            sig = false;
            p += 1;
        }
        while p < ec {
            if pat[p] == ESC {
                p += 1;
                if p < ec && match_class(c, pat[p]) {
                    return sig;
                }
                p += 1;
            } else if pat.get(p + 1) == Some(&b'-') && p + 2 < ec {
                if pat[p] <= c && c <= pat[p + 2] {
                    return sig;
                }
                p += 3;
            } else {
                if pat[p] == c {
                    return sig;
                }
                p += 1;
            }
        }
        !sig
    }

    fn max_expand(&mut self, s: usize, p: usize, ep: usize) -> PatResult<Option<usize>> {
        let mut n = 0;
        while s + n < self.src.len() && self.single_match(self.src[s + n], p, ep) {
            n += 1;
        }
        loop {
            if let Some(end) = self.do_match(s + n, ep + 1)? {
                return Ok(Some(end));
            }
            if n == 0 {
                return Ok(None);
            }
            n -= 1;
        }
    }

    fn min_expand(&mut self, mut s: usize, p: usize, ep: usize) -> PatResult<Option<usize>> {
        loop {
            if let Some(end) = self.do_match(s, ep + 1)? {
                return Ok(Some(end));
            }
            if s < self.src.len() && self.single_match(self.src[s], p, ep) {
                s += 1;
            } else {
                return Ok(None);
            }
        }
    }

    fn start_capture(&mut self, s: usize, p: usize, what: CapLen) -> PatResult<Option<usize>> {
        if self.captures.len() >= MAX_CAPTURES {
            return Err("too many captures".to_string());
        }
        self.captures.push((s, what));
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.captures.pop();
        }
        Ok(result)
    }

    fn end_capture(&mut self, s: usize, p: usize) -> PatResult<Option<usize>> {
        let Some(l) = self.captures.iter().rposition(|(_, len)| *len == CapLen::Open) else {
            return Err("invalid pattern capture".to_string());
        };
        self.captures[l].1 = CapLen::Len(s - self.captures[l].0);
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.captures[l].1 = CapLen::Open;
        }
        Ok(result)
    }

    fn match_balance(&self, s: usize, p: usize) -> PatResult<Option<usize>> {
        if p + 1 >= self.pat.len() {
            return Err("malformed pattern (missing arguments to '%b')".to_string());
        }
        let (open, close) = (self.pat[p], self.pat[p + 1]);
        if self.src.get(s) != Some(&open) {
            return Ok(None);
        }
        let mut depth = 1;
        for (i, &c) in self.src.iter().enumerate().skip(s + 1) {
            if c == close {
                depth -= 1;
                if depth == 0 {
                    return Ok(Some(i + 1));
                }
            } else if c == open {
                depth += 1;
            }
        }
        Ok(None)
    }

    /// Back reference `%1`..`%9`.
    fn match_capture(&self, s: usize, digit: u8) -> PatResult<Option<usize>> {
        let idx = digit.wrapping_sub(b'1') as usize;
        let (start, len) = match self.captures.get(idx) {
            Some(&(start, CapLen::Len(n))) => (start, n),
            _ => return Err(format!("invalid capture index %{}", digit - b'0')),
        };
        let captured = &self.src[start..start + len];
        Ok(self.src.get(s..).filter(|rest| rest.starts_with(captured)).map(|_| s + len))
    }
}

fn match_class(c: u8, class: u8) -> bool {
    let res = match class.to_ascii_lowercase() {
        b'a' => c.is_ascii_alphabetic(),
        b'c' => c.is_ascii_control(),
        b'd' => c.is_ascii_digit(),
        b'g' => c.is_ascii_graphic(),
        b'l' => c.is_ascii_lowercase(),
        b'p' => c.is_ascii_punctuation(),
        b's' => c == b' ' || (b'\t'..=b'\r').contains(&c),
        b'u' => c.is_ascii_uppercase(),
        b'w' => c.is_ascii_alphanumeric(),
        b'x' => c.is_ascii_hexdigit(),
        _ => return class == c,
    };
    if class.is_ascii_uppercase() {
        !res
    } else {
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// First match of `pat` in `src` as `(start, end)`.
    fn find(src: &str, pat: &str) -> Option<(usize, usize)> {
        let (src, pat) = (src.as_bytes(), pat.as_bytes());
        let (anchor, p0) = if pat.first() == Some(&b'^') { (true, 1) } else { (false, 0) };
        let mut m = Matcher::new(src, pat);
        let mut s = 0;
        loop {
            if let Some(e) = m.match_at(s, p0).unwrap() {
                return Some((s, e));
            }
            s += 1;
            if anchor || s > src.len() {
                return None;
            }
        }
    }

    #[test]
    fn character_classes() {
        assert_eq!(find("abc 123", "%d+"), Some((4, 7)));
        assert_eq!(find("hello world", "%s"), Some((5, 6)));
        assert_eq!(find("x=1", "%p"), Some((1, 2)));
        assert_eq!(find("ABc", "%l"), Some((2, 3)));
        assert_eq!(find("ab12", "%A+"), Some((2, 4)));
    }

    #[test]
    fn sets_and_ranges() {
        assert_eq!(find("hello", "[aeiou]+"), Some((1, 2)));
        assert_eq!(find("x]y", "[]]"), Some((1, 2)));
        assert_eq!(find("abc-9", "[%d-]+"), Some((3, 5)));
        assert_eq!(find("abcXYZ", "[^a-z]"), Some((3, 4)));
    }

    #[test]
    fn quantifiers() {
        assert_eq!(find("aaab", "a-b"), Some((0, 4)));
        assert_eq!(find("<a><b>", "<.->"), Some((0, 3)));
        assert_eq!(find("<a><b>", "<.*>"), Some((0, 6)));
        assert_eq!(find("color", "colou?r"), Some((0, 5)));
        assert_eq!(find("b", "a*b"), Some((0, 1)));
    }

    #[test]
    fn anchors() {
        assert_eq!(find("abc", "^b"), None);
        assert_eq!(find("abc", "c$"), Some((2, 3)));
        assert_eq!(find("abc", "^abc$"), Some((0, 3)));
    }

    #[test]
    fn captures_and_back_references() {
        let src = b"key = value";
        let mut m = Matcher::new(src, b"(%w+)%s*=%s*(%w+)");
        let e = m.match_at(0, 0).unwrap().unwrap();
        assert_eq!(m.captures(0, e, true).unwrap(), vec![Capture::Span(0, 3), Capture::Span(6, 11)]);

        let mut m = Matcher::new(b"say 'hi' now", b"(['\"])(.-)%1");
        let e = m.match_at(4, 0).unwrap().unwrap();
        assert_eq!(m.captures(4, e, true).unwrap()[1], Capture::Span(5, 7));

        let mut m = Matcher::new(b"abc", b"a()b");
        let e = m.match_at(0, 0).unwrap().unwrap();
        assert_eq!(m.captures(0, e, true).unwrap(), vec![Capture::Position(2)]);
    }

    #[test]
    fn balance_and_frontier() {
        assert_eq!(find("f(a(b)c) d", "%b()"), Some((1, 8)));
        assert_eq!(find("THE (quick) fox", "%f[%a]%a+"), Some((0, 3)));
        assert_eq!(find("hello world", "%f[%w]world"), Some((6, 11)));
    }

    #[test]
    fn malformed_patterns() {
        let mut m = Matcher::new(b"abc", b"[a");
        assert_eq!(m.match_at(0, 0).unwrap_err(), "malformed pattern (missing ']')");
        let mut m = Matcher::new(b"abc", b"a%");
        assert_eq!(m.match_at(0, 0).unwrap_err(), "malformed pattern (ends with '%')");
        let mut m = Matcher::new(b"abc", b"a)");
        assert_eq!(m.match_at(0, 0).unwrap_err(), "invalid pattern capture");
        let mut m = Matcher::new(b"abc", b"%1");
        assert_eq!(m.match_at(0, 0).unwrap_err(), "invalid capture index %1");
    }

    #[test]
    fn plain_search() {
        assert!(is_plain(b"hello"));
        assert!(!is_plain(b"a.b"));
        assert_eq!(find_plain(b"a.b.c", b".c", 0), Some(3));
        assert_eq!(find_plain(b"abc", b"", 2), Some(2));
        assert_eq!(find_plain(b"abc", b"x", 0), None);
    }
}
