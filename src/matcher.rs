use crate::grammar::{Rule, RuleKind, RuleSet};
use once_cell::unsync::OnceCell;
use regex::Regex;
use std::rc::Rc;
use tracing::{debug, warn};

/// A line of text prepared for column-based matching. Columns are char
/// indices; byte offsets are kept alongside so regex rules can run on the
/// remaining byte slice directly.
pub struct LineText<'a> {
    text: &'a str,
    chars: Vec<char>,
    offsets: Vec<usize>,
}

impl<'a> LineText<'a> {
    pub fn new(text: &'a str) -> Self {
        let mut chars = Vec::with_capacity(text.len());
        let mut offsets = Vec::with_capacity(text.len() + 1);
        for (i, c) in text.char_indices() {
            offsets.push(i);
            chars.push(c);
        }
        offsets.push(text.len());
        LineText { text, chars, offsets }
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn char_at(&self, column: usize) -> Option<char> {
        self.chars.get(column).copied()
    }

    /// The text from `column` to the end of the line.
    pub fn rest(&self, column: usize) -> &'a str {
        &self.text[self.offsets[column]..]
    }

    pub fn only_space_before(&self, column: usize) -> bool {
        self.chars[..column].iter().all(|c| c.is_whitespace())
    }

    /// True if `column` starts a word: start of line, or preceded by
    /// whitespace or a delimiter character.
    pub fn is_word_start(&self, column: usize, set: &RuleSet) -> bool {
        match column.checked_sub(1).and_then(|i| self.chars.get(i)) {
            None => true,
            Some(&prev) => set.is_delimiter(prev),
        }
    }
}

/// Result of a successful rule match.
pub struct MatchOutcome {
    /// Consumed length in characters. Zero for look-ahead rules.
    pub length: usize,
    /// Capture groups of a regex match, for dynamic context pushes.
    pub captures: Option<Rc<[String]>>,
}

/// Substitute `%1`..`%9` placeholders with captured data. Placeholders
/// whose index exceeds the captured data are left verbatim. When `escape`
/// is set the substituted text is regex-escaped, so captured literals can
/// never be reinterpreted as sub-patterns.
pub fn substitute_dynamic(pattern: &str, captures: &[String], escape: bool) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut iter = pattern.chars().peekable();
    while let Some(c) = iter.next() {
        if c == '%' {
            if let Some(d) = iter.peek().copied().filter(char::is_ascii_digit) {
                let n = (d as u8 - b'0') as usize;
                if n >= 1 && n <= captures.len() {
                    iter.next();
                    if escape {
                        out.push_str(&regex::escape(&captures[n - 1]));
                    } else {
                        out.push_str(&captures[n - 1]);
                    }
                    continue;
                }
                debug!(placeholder = n, available = captures.len(), "dynamic placeholder out of range, left verbatim");
            }
        }
        out.push(c);
    }
    out
}

/// Try one rule at one column. Returns the consumed length (zero for
/// look-ahead rules) and any captured data. `IncludeRules` never matches
/// here; delegation is handled by the line parser.
pub fn try_match(
    rule: &Rule,
    set: &RuleSet,
    line: &LineText,
    column: usize,
    captures: Option<&Rc<[String]>>,
) -> Option<MatchOutcome> {
    if let Some(required) = rule.column {
        if required != column {
            return None;
        }
    }
    if rule.first_non_space && !line.only_space_before(column) {
        return None;
    }

    let empty: &[String] = &[];
    let caps = if rule.dynamic {
        captures.map(|c| c.as_ref()).unwrap_or(empty)
    } else {
        empty
    };

    let (length, new_captures) = match_kind(rule, set, line, column, caps)?;
    Some(MatchOutcome {
        length: if rule.look_ahead { 0 } else { length },
        captures: new_captures,
    })
}

fn match_kind(
    rule: &Rule,
    set: &RuleSet,
    line: &LineText,
    column: usize,
    caps: &[String],
) -> Option<(usize, Option<Rc<[String]>>)> {
    let length = match &rule.kind {
        RuleKind::DetectChar(c) => {
            if line.char_at(column)? == *c {
                1
            } else {
                return None;
            }
        }
        RuleKind::Detect2Chars(a, b) => {
            if line.char_at(column)? == *a && line.char_at(column + 1)? == *b {
                2
            } else {
                return None;
            }
        }
        RuleKind::AnyChar(chars) => {
            if chars.contains(&line.char_at(column)?) {
                1
            } else {
                return None;
            }
        }
        RuleKind::StringDetect { text, insensitive } => {
            let text = if rule.dynamic {
                std::borrow::Cow::Owned(substitute_dynamic(text, caps, false))
            } else {
                std::borrow::Cow::Borrowed(text.as_str())
            };
            match_literal(line, column, &text, *insensitive)?
        }
        RuleKind::WordDetect { word, insensitive } => {
            if !line.is_word_start(column, set) {
                return None;
            }
            let length = match_literal(line, column, word, *insensitive)?;
            // must also end at a word boundary
            if let Some(next) = line.char_at(column + length) {
                if !set.is_delimiter(next) {
                    return None;
                }
            }
            length
        }
        RuleKind::Keyword { list } => {
            if !line.is_word_start(column, set) {
                return None;
            }
            let mut end = column;
            while end < line.len() && !set.is_delimiter(line.char_at(end).unwrap()) {
                end += 1;
            }
            if end == column {
                return None;
            }
            let word: String = (column..end).map(|i| line.char_at(i).unwrap()).collect();
            let list = set.keyword_lists.get(*list)?;
            if list.contains(&word, set.case_sensitive) {
                end - column
            } else {
                return None;
            }
        }
        RuleKind::RegExpr { pattern, compiled } => {
            return match_regex(rule, pattern, compiled, set, line, column, caps);
        }
        RuleKind::Int { children } => {
            let body = match_digits(line, column, set, |c| c.is_ascii_digit())?;
            body + match_children(children, set, line, column + body)
        }
        RuleKind::Float { children } => {
            let body = match_float(line, column, set)?;
            body + match_children(children, set, line, column + body)
        }
        RuleKind::HlCOct => {
            if line.char_at(column)? != '0' || !line.is_word_start(column, set) {
                return None;
            }
            let digits = run_length(line, column + 1, |c| ('0'..='7').contains(&c));
            if digits == 0 {
                return None;
            }
            1 + digits
        }
        RuleKind::HlCHex => {
            if !line.is_word_start(column, set) || line.char_at(column)? != '0' {
                return None;
            }
            let x = line.char_at(column + 1)?;
            if x != 'x' && x != 'X' {
                return None;
            }
            let digits = run_length(line, column + 2, |c| c.is_ascii_hexdigit());
            if digits == 0 {
                return None;
            }
            2 + digits
        }
        RuleKind::HlCChar => match_c_char(line, column)?,
        RuleKind::HlCStringChar => match_escape(line, column)?,
        RuleKind::RangeDetect { begin, end } => {
            if line.char_at(column)? != *begin {
                return None;
            }
            let mut i = column + 1;
            loop {
                match line.char_at(i) {
                    Some(c) if c == *end => break i - column + 1,
                    Some(_) => i += 1,
                    None => return None,
                }
            }
        }
        RuleKind::LineContinue { marker } => {
            if line.char_at(column)? == *marker && column + 1 == line.len() {
                1
            } else {
                return None;
            }
        }
        RuleKind::DetectSpaces => {
            let n = run_length(line, column, |c| c == ' ' || c == '\t');
            if n == 0 {
                return None;
            }
            n
        }
        RuleKind::DetectIdentifier => {
            let first = line.char_at(column)?;
            if !first.is_ascii_alphabetic() && first != '_' {
                return None;
            }
            1 + run_length(line, column + 1, |c| c.is_ascii_alphanumeric() || c == '_')
        }
        RuleKind::IncludeRules { .. } => return None,
    };
    Some((length, None))
}

/// Literal text match at a column, optionally case-insensitive.
/// Returns the consumed length in characters. Case folding is Unicode
/// lowercasing, the same folding keyword lists use.
fn match_literal(line: &LineText, column: usize, text: &str, insensitive: bool) -> Option<usize> {
    let mut len = 0;
    for expected in text.chars() {
        let actual = line.char_at(column + len)?;
        let hit = if insensitive {
            actual.to_lowercase().eq(expected.to_lowercase())
        } else {
            actual == expected
        };
        if !hit {
            return None;
        }
        len += 1;
    }
    if len == 0 {
        None // empty pattern never matches
    } else {
        Some(len)
    }
}

fn run_length(line: &LineText, column: usize, pred: impl Fn(char) -> bool) -> usize {
    let mut n = 0;
    while let Some(c) = line.char_at(column + n) {
        if !pred(c) {
            break;
        }
        n += 1;
    }
    n
}

fn match_digits(
    line: &LineText,
    column: usize,
    set: &RuleSet,
    pred: impl Fn(char) -> bool,
) -> Option<usize> {
    if !line.is_word_start(column, set) {
        return None;
    }
    let n = run_length(line, column, pred);
    if n == 0 {
        None
    } else {
        Some(n)
    }
}

/// Floating point literal: `1.5`, `.5`, `1.`, `1e3`, `1.5e-3`. Requires a
/// decimal point or an exponent, otherwise it would shadow `Int`.
fn match_float(line: &LineText, column: usize, set: &RuleSet) -> Option<usize> {
    if !line.is_word_start(column, set) {
        return None;
    }
    let int_digits = run_length(line, column, |c| c.is_ascii_digit());
    let mut pos = column + int_digits;
    let mut has_point = false;
    if line.char_at(pos) == Some('.') {
        has_point = true;
        pos += 1;
        pos += run_length(line, pos, |c| c.is_ascii_digit());
    }
    if pos == column || (has_point && pos == column + 1 && int_digits == 0) {
        return None; // no digits at all, or a lone '.'
    }
    let mut has_exponent = false;
    if matches!(line.char_at(pos), Some('e') | Some('E')) {
        let mut exp = pos + 1;
        if matches!(line.char_at(exp), Some('+') | Some('-')) {
            exp += 1;
        }
        let exp_digits = run_length(line, exp, |c| c.is_ascii_digit());
        if exp_digits > 0 {
            pos = exp + exp_digits;
            has_exponent = true;
        }
    }
    if !has_point && !has_exponent {
        return None;
    }
    Some(pos - column)
}

/// C character literal: `'a'` or `'\n'`.
fn match_c_char(line: &LineText, column: usize) -> Option<usize> {
    if line.char_at(column)? != '\'' {
        return None;
    }
    let inner = match line.char_at(column + 1)? {
        '\\' => match_escape(line, column + 1)?,
        '\'' => return None, // empty literal
        _ => 1,
    };
    if line.char_at(column + 1 + inner)? != '\'' {
        return None;
    }
    Some(inner + 2)
}

/// C escape sequence: `\n`, `\x41`, `\033`, ...
fn match_escape(line: &LineText, column: usize) -> Option<usize> {
    if line.char_at(column)? != '\\' {
        return None;
    }
    let c = line.char_at(column + 1)?;
    let length = match c {
        'a' | 'b' | 'e' | 'f' | 'n' | 'r' | 't' | 'v' | '\'' | '"' | '?' | '\\' => 2,
        'x' | 'X' => {
            let digits = run_length(line, column + 2, |c| c.is_ascii_hexdigit());
            if digits == 0 {
                return None;
            }
            2 + digits
        }
        '0'..='7' => 1 + run_length(line, column + 1, |c| ('0'..='7').contains(&c)).min(3),
        _ => return None,
    };
    Some(length)
}

/// Child rules of numeric matchers extend the match immediately after the
/// numeric body; their own attribute and context switch are ignored, only
/// the consumed length counts.
fn match_children(children: &[Rule], set: &RuleSet, line: &LineText, column: usize) -> usize {
    for child in children {
        if let Some(outcome) = try_match(child, set, line, column, None) {
            return outcome.length;
        }
    }
    0
}

enum Anchor {
    None,
    LineStart,
    WordStart,
}

/// Split a leading fast-path anchor off a pattern. A `^` pattern can only
/// ever match at column 0, and a `\b` pattern only at a word start; both
/// are checked before the regex engine runs.
fn regex_anchor(pattern: &str) -> (Anchor, &str) {
    if let Some(rest) = pattern.strip_prefix('^') {
        (Anchor::LineStart, rest)
    } else if pattern.starts_with("\\b") {
        (Anchor::WordStart, pattern)
    } else {
        (Anchor::None, pattern)
    }
}

/// Compile a pattern anchored to the start of the haystack. Invalid
/// patterns compile to "never matches" so one malformed rule cannot take
/// down the whole grammar.
fn compile_regex(pattern: &str) -> Option<Regex> {
    match Regex::new(&format!(r"\A(?:{})", pattern)) {
        Ok(re) => Some(re),
        Err(err) => {
            warn!(pattern, %err, "invalid regex in grammar rule, rule disabled");
            None
        }
    }
}

fn match_regex(
    rule: &Rule,
    pattern: &str,
    compiled: &OnceCell<Option<Regex>>,
    set: &RuleSet,
    line: &LineText,
    column: usize,
    caps: &[String],
) -> Option<(usize, Option<Rc<[String]>>)> {
    let (anchor, body) = regex_anchor(pattern);
    match anchor {
        Anchor::LineStart if column != 0 => return None,
        Anchor::WordStart if !line.is_word_start(column, set) => return None,
        _ => {}
    }

    let substituted;
    let re = if rule.dynamic {
        // dynamic patterns change with the captured data, so they are
        // compiled per match rather than cached
        substituted = compile_regex(&substitute_dynamic(body, caps, true))?;
        &substituted
    } else {
        compiled.get_or_init(|| compile_regex(body)).as_ref()?
    };

    let haystack = line.rest(column);
    let m = re.captures(haystack)?;
    let whole = m.get(0)?;
    let length = whole.as_str().chars().count();
    if length == 0 && !rule.look_ahead {
        return None; // zero-width match would never advance
    }
    let captured: Option<Rc<[String]>> = if m.len() > 1 {
        Some(
            (1..m.len())
                .map(|i| m.get(i).map(|g| g.as_str().to_string()).unwrap_or_default())
                .collect::<Vec<_>>()
                .into(),
        )
    } else {
        None
    };
    Some((length, captured))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{AttrId, ContextSwitch};
    use rstest::rstest;

    fn rule(kind: RuleKind) -> Rule {
        Rule {
            kind,
            attribute: Some(AttrId(0)),
            switch: ContextSwitch::stay(),
            look_ahead: false,
            first_non_space: false,
            dynamic: false,
            column: None,
        }
    }

    fn len_of(rule: &Rule, text: &str, column: usize) -> Option<usize> {
        let set = RuleSet::plain();
        let line = LineText::new(text);
        try_match(rule, &set, &line, column, None).map(|m| m.length)
    }

    #[test]
    fn detect_char_and_two_chars() {
        assert_eq!(len_of(&rule(RuleKind::DetectChar(':')), "a:b", 1), Some(1));
        assert_eq!(len_of(&rule(RuleKind::DetectChar(':')), "a:b", 0), None);
        let two = rule(RuleKind::Detect2Chars('/', '*'));
        assert_eq!(len_of(&two, "/* x", 0), Some(2));
        assert_eq!(len_of(&two, "/x", 0), None);
        assert_eq!(len_of(&two, "/", 0), None); // truncated at end of line
    }

    #[test]
    fn string_detect_case_modes() {
        let exact = rule(RuleKind::StringDetect { text: "for".into(), insensitive: false });
        assert_eq!(len_of(&exact, "forx", 0), Some(3));
        assert_eq!(len_of(&exact, "FOR", 0), None);
        let loose = rule(RuleKind::StringDetect { text: "for".into(), insensitive: true });
        assert_eq!(len_of(&loose, "FoR", 0), Some(3));
        // folding is Unicode, not ASCII-only
        let accented = rule(RuleKind::StringDetect { text: "été".into(), insensitive: true });
        assert_eq!(len_of(&accented, "ÉTÉ", 0), Some(3));
    }

    #[test]
    fn word_detect_requires_boundaries() {
        let word = rule(RuleKind::WordDetect { word: "if".into(), insensitive: false });
        assert_eq!(len_of(&word, "if x", 0), Some(2));
        assert_eq!(len_of(&word, "(if)", 1), Some(2));
        assert_eq!(len_of(&word, "ifx", 0), None); // runs into a word
        assert_eq!(len_of(&word, "xif", 1), None); // not a word start
    }

    #[test]
    fn column_restriction_and_first_non_space() {
        let mut r = rule(RuleKind::DetectChar('#'));
        r.column = Some(3);
        assert_eq!(len_of(&r, "   #x", 3), Some(1));
        let line = LineText::new("#  #x");
        let set = RuleSet::plain();
        assert!(try_match(&r, &set, &line, 0, None).is_none());

        let mut r = rule(RuleKind::DetectChar('#'));
        r.first_non_space = true;
        assert_eq!(len_of(&r, "   #comment", 3), Some(1));
        assert_eq!(len_of(&r, "x #comment", 2), None);
    }

    #[test]
    fn look_ahead_consumes_nothing() {
        let mut r = rule(RuleKind::StringDetect { text: "end".into(), insensitive: false });
        r.look_ahead = true;
        assert_eq!(len_of(&r, "end", 0), Some(0));
        assert_eq!(len_of(&r, "nope", 0), None);
    }

    #[rstest]
    #[case("123 ", 0, Some(3))]
    #[case("x123", 1, None)] // inside a word
    #[case("abc", 0, None)]
    fn int_rule(#[case] text: &str, #[case] col: usize, #[case] expected: Option<usize>) {
        assert_eq!(len_of(&rule(RuleKind::Int { children: vec![] }), text, col), expected);
    }

    #[test]
    fn int_children_extend_the_match() {
        let suffix = rule(RuleKind::AnyChar(vec!['u', 'L']));
        let int = rule(RuleKind::Int { children: vec![suffix] });
        assert_eq!(len_of(&int, "42u;", 0), Some(3));
        assert_eq!(len_of(&int, "42;", 0), Some(2));
    }

    #[rstest]
    #[case("1.5", Some(3))]
    #[case(".5", Some(2))]
    #[case("1.", Some(2))]
    #[case("1e10", Some(4))]
    #[case("1.5e-3;", Some(6))]
    #[case("15", None)] // plain int is not a float
    #[case(".x", None)]
    fn float_rule(#[case] text: &str, #[case] expected: Option<usize>) {
        assert_eq!(len_of(&rule(RuleKind::Float { children: vec![] }), text, 0), expected);
    }

    #[rstest]
    #[case(RuleKind::HlCOct, "0755 ", Some(4))]
    #[case(RuleKind::HlCOct, "088", None)]
    #[case(RuleKind::HlCHex, "0xFF;", Some(4))]
    #[case(RuleKind::HlCHex, "0x", None)]
    #[case(RuleKind::HlCChar, "'a'", Some(3))]
    #[case(RuleKind::HlCChar, "'\\n'", Some(4))]
    #[case(RuleKind::HlCChar, "''", None)]
    #[case(RuleKind::HlCStringChar, "\\n", Some(2))]
    #[case(RuleKind::HlCStringChar, "\\x41", Some(4))]
    #[case(RuleKind::HlCStringChar, "\\q", None)]
    fn numeric_and_escape_rules(
        #[case] kind: RuleKind,
        #[case] text: &str,
        #[case] expected: Option<usize>,
    ) {
        assert_eq!(len_of(&rule(kind), text, 0), expected);
    }

    #[test]
    fn range_detect_stays_on_one_line() {
        let r = rule(RuleKind::RangeDetect { begin: '<', end: '>' });
        assert_eq!(len_of(&r, "<stdio.h> x", 0), Some(9));
        assert_eq!(len_of(&r, "<unclosed", 0), None);
    }

    #[test]
    fn line_continue_only_at_end() {
        let r = rule(RuleKind::LineContinue { marker: '\\' });
        assert_eq!(len_of(&r, "foo \\", 4), Some(1));
        assert_eq!(len_of(&r, "foo \\ ", 4), None);
    }

    #[test]
    fn convenience_detectors() {
        assert_eq!(len_of(&rule(RuleKind::DetectSpaces), "  \tx", 0), Some(3));
        assert_eq!(len_of(&rule(RuleKind::DetectSpaces), "x", 0), None);
        assert_eq!(len_of(&rule(RuleKind::DetectIdentifier), "foo_1+", 0), Some(5));
        assert_eq!(len_of(&rule(RuleKind::DetectIdentifier), "1foo", 0), None);
    }

    #[test]
    fn regex_anchoring_and_captures() {
        let r = rule(RuleKind::RegExpr {
            pattern: "[a-z]+".into(),
            compiled: OnceCell::new(),
        });
        assert_eq!(len_of(&r, "abc1", 0), Some(3));
        assert_eq!(len_of(&r, "1abc", 0), None); // must match at the column

        let anchored = rule(RuleKind::RegExpr {
            pattern: "^#\\w+".into(),
            compiled: OnceCell::new(),
        });
        assert_eq!(len_of(&anchored, "#if", 0), Some(3));
        assert_eq!(len_of(&anchored, " #if", 1), None); // ^ only at column 0

        let set = RuleSet::plain();
        let capturing = rule(RuleKind::RegExpr {
            pattern: "<<(\\w+)".into(),
            compiled: OnceCell::new(),
        });
        let line = LineText::new("<<EOF");
        let m = try_match(&capturing, &set, &line, 0, None).unwrap();
        assert_eq!(m.length, 5);
        assert_eq!(m.captures.unwrap().as_ref(), ["EOF".to_string()]);
    }

    #[test]
    fn invalid_regex_never_matches() {
        let r = rule(RuleKind::RegExpr {
            pattern: "([unclosed".into(),
            compiled: OnceCell::new(),
        });
        assert_eq!(len_of(&r, "anything", 0), None);
        assert_eq!(len_of(&r, "([unclosed", 0), None);
    }

    #[test]
    fn dynamic_substitution() {
        let caps = vec!["a".to_string(), "b".to_string()];
        assert_eq!(substitute_dynamic("a%1c%3", &caps, false), "aac%3");
        assert_eq!(substitute_dynamic("%2%1", &caps, false), "ba");
        // escaping keeps captured metacharacters literal
        let caps = vec!["a.b".to_string()];
        assert_eq!(substitute_dynamic("%1", &caps, true), "a\\.b");
    }

    #[test]
    fn dynamic_regex_matches_captured_text() {
        let set = RuleSet::plain();
        let mut r = rule(RuleKind::RegExpr {
            pattern: "%1\\b".into(),
            compiled: OnceCell::new(),
        });
        r.dynamic = true;
        let caps: Rc<[String]> = vec!["EOF".to_string()].into();
        let line = LineText::new("EOF");
        let m = try_match(&r, &set, &line, 0, Some(&caps)).unwrap();
        assert_eq!(m.length, 3);
        // without captured data the placeholder stays verbatim and misses
        let line = LineText::new("EOF");
        assert!(try_match(&r, &set, &line, 0, None).is_none());
    }

    #[test]
    fn dynamic_string_detect() {
        let set = RuleSet::plain();
        let mut r = rule(RuleKind::StringDetect { text: "%1".into(), insensitive: false });
        r.dynamic = true;
        let caps: Rc<[String]> = vec!["END".to_string()].into();
        let line = LineText::new("END of it");
        let m = try_match(&r, &set, &line, 0, Some(&caps)).unwrap();
        assert_eq!(m.length, 3);
    }
}
