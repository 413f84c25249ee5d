//! Wildcard matching for `match`/`imatch` terms and the glob generator.
//!
//! Semantics follow the usual wildmatch rules: `*` and `?` do not cross
//! directory separators, `**` does, `[...]` is a character class with
//! `!`/`^` negation and ranges, and backslash escapes the next character
//! unless `no_escape` is set. Unless `include_dot_files` is set, wildcards
//! will not match a `.` at the start of a path component.

use thiserror::Error;

use crate::query::CaseSensitivity;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GlobError {
    #[error("unterminated character class in pattern {0:?}")]
    UnterminatedClass(String),

    #[error("trailing escape in pattern {0:?}")]
    TrailingEscape(String),
}

#[derive(Debug, Clone)]
pub struct GlobPattern {
    pattern: Vec<char>,
    case_insensitive: bool,
    include_dot_files: bool,
    no_escape: bool,
}

impl GlobPattern {
    pub fn compile(
        pattern: &str,
        case: CaseSensitivity,
        include_dot_files: bool,
        no_escape: bool,
    ) -> Result<Self, GlobError> {
        let chars: Vec<char> = pattern.chars().collect();
        validate(&chars, no_escape).map_err(|kind| match kind {
            ValidateError::Class => GlobError::UnterminatedClass(pattern.to_string()),
            ValidateError::Escape => GlobError::TrailingEscape(pattern.to_string()),
        })?;
        Ok(Self {
            pattern: chars,
            case_insensitive: case == CaseSensitivity::Insensitive,
            include_dot_files,
            no_escape,
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        let text: Vec<char> = text.chars().collect();
        self.match_from(&self.pattern, &text, true)
    }

    fn chars_equal(&self, a: char, b: char) -> bool {
        if self.case_insensitive {
            a.eq_ignore_ascii_case(&b)
        } else {
            a == b
        }
    }

    /// True when a wildcard is barred from consuming `text[0]` here.
    fn wildcard_blocked(&self, text: &[char], at_component_start: bool) -> bool {
        !self.include_dot_files && at_component_start && text.first() == Some(&'.')
    }

    fn match_from(&self, pat: &[char], text: &[char], at_component_start: bool) -> bool {
        let Some(&p) = pat.first() else {
            return text.is_empty();
        };

        match p {
            '*' => {
                let crosses_separators = pat.get(1) == Some(&'*');
                let rest = if crosses_separators { &pat[2..] } else { &pat[1..] };
                // `**/` also matches zero directories, so the slash after
                // it may be skipped outright.
                let skip_slash = if crosses_separators && rest.first() == Some(&'/') {
                    Some(&rest[1..])
                } else {
                    None
                };
                // Try consuming 0..n characters.
                let mut i = 0;
                let mut comp_start = at_component_start;
                loop {
                    if self.match_from(rest, &text[i..], comp_start) {
                        return true;
                    }
                    if let Some(alt) = skip_slash
                        && self.match_from(alt, &text[i..], comp_start)
                    {
                        return true;
                    }
                    if i >= text.len() {
                        return false;
                    }
                    let c = text[i];
                    if c == '/' && !crosses_separators {
                        return false;
                    }
                    if comp_start && c == '.' && !self.include_dot_files {
                        // A wildcard may not swallow a leading dot.
                        return false;
                    }
                    comp_start = c == '/';
                    i += 1;
                }
            }
            '?' => {
                if self.wildcard_blocked(text, at_component_start) {
                    return false;
                }
                match text.first() {
                    Some(&c) if c != '/' => self.match_from(&pat[1..], &text[1..], false),
                    _ => false,
                }
            }
            '[' => {
                if self.wildcard_blocked(text, at_component_start) {
                    return false;
                }
                let Some(&c) = text.first() else {
                    return false;
                };
                if c == '/' {
                    return false;
                }
                let (matched, rest_pat) = self.match_class(&pat[1..], c);
                matched && self.match_from(rest_pat, &text[1..], false)
            }
            '\\' if !self.no_escape => {
                // Validation guarantees a following character.
                let literal = pat[1];
                match text.first() {
                    Some(&c) if self.chars_equal(c, literal) => {
                        self.match_from(&pat[2..], &text[1..], c == '/')
                    }
                    _ => false,
                }
            }
            _ => match text.first() {
                Some(&c) if self.chars_equal(c, p) => {
                    self.match_from(&pat[1..], &text[1..], c == '/')
                }
                _ => false,
            },
        }
    }

    /// Match `c` against the class at the head of `pat` (the leading `[`
    /// already consumed). Returns the match outcome and the pattern slice
    /// after the closing `]`.
    fn match_class<'p>(&self, pat: &'p [char], c: char) -> (bool, &'p [char]) {
        let mut i = 0;
        let negated = matches!(pat.first(), Some('!') | Some('^'));
        if negated {
            i += 1;
        }
        let mut matched = false;
        let mut first = true;
        while i < pat.len() {
            let pc = pat[i];
            if pc == ']' && !first {
                let result = matched != negated;
                return (result, &pat[i + 1..]);
            }
            first = false;
            // Range like a-z, unless '-' is the last class member.
            if i + 2 < pat.len() && pat[i + 1] == '-' && pat[i + 2] != ']' {
                let (lo, hi) = (pc, pat[i + 2]);
                if self.in_range(c, lo, hi) {
                    matched = true;
                }
                i += 3;
            } else {
                if self.chars_equal(c, pc) {
                    matched = true;
                }
                i += 1;
            }
        }
        // Unreachable for validated patterns.
        (false, &pat[pat.len()..])
    }

    fn in_range(&self, c: char, lo: char, hi: char) -> bool {
        if self.case_insensitive {
            let c = c.to_ascii_lowercase();
            (lo.to_ascii_lowercase()..=hi.to_ascii_lowercase()).contains(&c)
                || (lo.to_ascii_uppercase()..=hi.to_ascii_uppercase())
                    .contains(&c.to_ascii_uppercase())
        } else {
            (lo..=hi).contains(&c)
        }
    }
}

enum ValidateError {
    Class,
    Escape,
}

fn validate(pattern: &[char], no_escape: bool) -> Result<(), ValidateError> {
    let mut i = 0;
    while i < pattern.len() {
        match pattern[i] {
            '\\' if !no_escape => {
                if i + 1 >= pattern.len() {
                    return Err(ValidateError::Escape);
                }
                i += 2;
            }
            '[' => {
                let mut j = i + 1;
                if matches!(pattern.get(j), Some('!') | Some('^')) {
                    j += 1;
                }
                // First ']' is a literal class member.
                if pattern.get(j) == Some(&']') {
                    j += 1;
                }
                while j < pattern.len() && pattern[j] != ']' {
                    j += 1;
                }
                if j >= pattern.len() {
                    return Err(ValidateError::Class);
                }
                i = j + 1;
            }
            _ => i += 1,
        }
    }
    Ok(())
}
