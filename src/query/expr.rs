//! Expression tree nodes and their evaluation against candidate files.

use crate::daemon::view::{FileMeta, FileType};
use crate::query::glob::GlobPattern;
use crate::query::intcompare::IntCompare;
use crate::query::{CaseSensitivity, QueryExecError};

/// Which name a name-shaped term applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameScope {
    Basename,
    Wholename,
}

/// Field a `since` term compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinceField {
    OClock,
    CClock,
    Mtime,
    Ctime,
}

/// Resolved `since` operand: a tick basis or a unix timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinceOperand {
    Ticks(u64),
    Timestamp(u64),
}

/// One candidate file as presented to the expression tree: the wholename
/// already adjusted for `relative_root` plus the view's metadata.
#[derive(Debug, Clone, Copy)]
pub struct FileView<'a> {
    pub wholename: &'a str,
    pub meta: &'a FileMeta,
}

impl<'a> FileView<'a> {
    pub fn basename(&self) -> &'a str {
        self.wholename
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.wholename)
    }
}

/// An evaluable expression node.
#[derive(Debug)]
pub enum Expr {
    True,
    False,
    Not(Box<Expr>),
    AllOf(Vec<Expr>),
    AnyOf(Vec<Expr>),
    Name {
        names: Vec<String>,
        scope: NameScope,
        case: CaseSensitivity,
    },
    DirName {
        path: String,
        depth: IntCompare,
        case: CaseSensitivity,
    },
    Match {
        pattern: GlobPattern,
        scope: NameScope,
    },
    Type(FileType),
    Exists,
    Empty,
    Size(IntCompare),
    Suffix {
        /// Lowercased extensions, without the dot.
        suffixes: Vec<String>,
    },
    Since {
        spec: SinceOperand,
        field: SinceField,
    },
}

fn is_dir_sep(b: u8) -> bool {
    b == b'/' || b == b'\\'
}

fn str_eq(a: &str, b: &str, case: CaseSensitivity) -> bool {
    match case {
        CaseSensitivity::Sensitive => a == b,
        CaseSensitivity::Insensitive => a.eq_ignore_ascii_case(b),
    }
}

fn starts_with(s: &str, prefix: &str, case: CaseSensitivity) -> bool {
    let (s, prefix) = (s.as_bytes(), prefix.as_bytes());
    if s.len() < prefix.len() {
        return false;
    }
    match case {
        CaseSensitivity::Sensitive => &s[..prefix.len()] == prefix,
        CaseSensitivity::Insensitive => s[..prefix.len()].eq_ignore_ascii_case(prefix),
    }
}

impl Expr {
    pub fn evaluate(&self, file: &FileView<'_>) -> Result<bool, QueryExecError> {
        match self {
            Expr::True => Ok(true),
            Expr::False => Ok(false),
            Expr::Not(inner) => Ok(!inner.evaluate(file)?),
            Expr::AllOf(terms) => {
                for term in terms {
                    if !term.evaluate(file)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::AnyOf(terms) => {
                for term in terms {
                    if term.evaluate(file)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expr::Name { names, scope, case } => {
                let target = match scope {
                    NameScope::Basename => file.basename(),
                    NameScope::Wholename => file.wholename,
                };
                Ok(names.iter().any(|name| str_eq(target, name, *case)))
            }
            Expr::DirName { path, depth, case } => Ok(eval_dirname(file.wholename, path, depth, *case)),
            Expr::Match { pattern, scope } => {
                let target = match scope {
                    NameScope::Basename => file.basename(),
                    NameScope::Wholename => file.wholename,
                };
                Ok(pattern.matches(target))
            }
            Expr::Type(t) => Ok(file.meta.file_type == *t),
            Expr::Exists => Ok(file.meta.exists),
            Expr::Empty => Ok(file.meta.exists
                && file.meta.size == 0
                && matches!(file.meta.file_type, FileType::Regular | FileType::Directory)),
            Expr::Size(cmp) => Ok(file.meta.exists && cmp.eval(file.meta.size as i64)),
            Expr::Suffix { suffixes } => {
                let basename = file.basename();
                let Some((_, ext)) = basename.rsplit_once('.') else {
                    return Ok(false);
                };
                let ext = ext.to_ascii_lowercase();
                Ok(suffixes.iter().any(|s| *s == ext))
            }
            Expr::Since { spec, field } => Ok(eval_since(file.meta, *spec, *field)),
        }
    }
}

/// `dirname` acceptance: the wholename must be a proper child of `path`
/// and the number of separators past the prefix must satisfy `depth`.
fn eval_dirname(wholename: &str, path: &str, depth: &IntCompare, case: CaseSensitivity) -> bool {
    let w = wholename.as_bytes();

    if w.len() <= path.len() {
        // Best case the wholename equals the operand, which is not a
        // child of it.
        return false;
    }

    if !path.is_empty() && !is_dir_sep(w[path.len()]) {
        // Shares a prefix but is not a child.
        return false;
    }

    if !starts_with(wholename, path, case) {
        return false;
    }

    let actual_depth = w[path.len() + 1..].iter().filter(|&&b| is_dir_sep(b)).count() as i64;
    depth.eval(actual_depth)
}

fn eval_since(meta: &FileMeta, spec: SinceOperand, field: SinceField) -> bool {
    match (field, spec) {
        (SinceField::OClock, SinceOperand::Ticks(t)) => meta.otime.ticks > t,
        (SinceField::OClock, SinceOperand::Timestamp(ts)) => {
            meta.otime.wall_ms / 1000 >= ts
        }
        (SinceField::CClock, SinceOperand::Ticks(t)) => meta.created_tick > t,
        (SinceField::CClock, SinceOperand::Timestamp(ts)) => meta.ctime_ms / 1000 >= ts,
        (SinceField::Mtime, SinceOperand::Timestamp(ts)) => meta.mtime_ms / 1000 >= ts,
        (SinceField::Ctime, SinceOperand::Timestamp(ts)) => meta.ctime_ms / 1000 >= ts,
        // Parse rejects tick specs for wall-time fields.
        (SinceField::Mtime | SinceField::Ctime, SinceOperand::Ticks(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::clock::ClockPosition;
    use crate::query::intcompare::CompareOp;

    fn meta() -> FileMeta {
        FileMeta {
            exists: true,
            size: 10,
            mode: 0o644,
            mtime_ms: 2_000_000,
            ctime_ms: 1_000_000,
            otime: ClockPosition::new(7, 2_000_000),
            created_tick: 3,
            file_type: FileType::Regular,
        }
    }

    fn depth(op: CompareOp, operand: i64) -> IntCompare {
        IntCompare { op, operand }
    }

    fn dirname(w: &str, p: &str, cmp: IntCompare) -> bool {
        eval_dirname(w, p, &cmp, CaseSensitivity::Sensitive)
    }

    #[test]
    fn dirname_requires_proper_child() {
        let ge0 = depth(CompareOp::Ge, 0);
        assert!(!dirname("sub", "sub", ge0), "equal names never match");
        assert!(!dirname("su", "sub", ge0));
        assert!(!dirname("subdir/a", "sub", ge0), "prefix but not a child");
        assert!(dirname("sub/a", "sub", ge0));
        assert!(dirname("sub/a/b", "sub", ge0));
    }

    #[test]
    fn dirname_depth_counts_separators_past_prefix() {
        let eq1 = depth(CompareOp::Eq, 1);
        assert!(dirname("sub/a/b", "sub", eq1));
        assert!(!dirname("sub/a", "sub", eq1));
        assert!(!dirname("sub/a/b/c", "sub", eq1));

        let le1 = depth(CompareOp::Le, 1);
        assert!(dirname("sub/a", "sub", le1));
        assert!(dirname("sub/a/b", "sub", le1));
        assert!(!dirname("sub/a/b/c", "sub", le1));
    }

    #[test]
    fn dirname_empty_path_matches_everything_below_the_root() {
        let ge0 = depth(CompareOp::Ge, 0);
        assert!(dirname("a", "", ge0));
        let eq1 = depth(CompareOp::Eq, 1);
        assert!(dirname("a/b", "", eq1));
        assert!(!dirname("a", "", eq1));
    }

    #[test]
    fn dirname_case_modes() {
        let ge0 = depth(CompareOp::Ge, 0);
        assert!(!eval_dirname("SUB/a", "sub", &ge0, CaseSensitivity::Sensitive));
        assert!(eval_dirname("SUB/a", "sub", &ge0, CaseSensitivity::Insensitive));
    }

    #[test]
    fn name_scopes() {
        let m = meta();
        let file = FileView {
            wholename: "dir/main.c",
            meta: &m,
        };
        let base = Expr::Name {
            names: vec!["main.c".into()],
            scope: NameScope::Basename,
            case: CaseSensitivity::Sensitive,
        };
        assert!(base.evaluate(&file).unwrap());
        let whole = Expr::Name {
            names: vec!["main.c".into()],
            scope: NameScope::Wholename,
            case: CaseSensitivity::Sensitive,
        };
        assert!(!whole.evaluate(&file).unwrap());
    }

    #[test]
    fn logic_terms_compose() {
        let m = meta();
        let file = FileView {
            wholename: "x",
            meta: &m,
        };
        let expr = Expr::AllOf(vec![
            Expr::Exists,
            Expr::Not(Box::new(Expr::Empty)),
            Expr::AnyOf(vec![Expr::False, Expr::True]),
        ]);
        assert!(expr.evaluate(&file).unwrap());
    }

    #[test]
    fn size_and_empty_require_existence() {
        let mut m = meta();
        m.exists = false;
        let file = FileView {
            wholename: "x",
            meta: &m,
        };
        let size = Expr::Size(depth(CompareOp::Ge, 0));
        assert!(!size.evaluate(&file).unwrap());
        assert!(!Expr::Empty.evaluate(&file).unwrap());
    }

    #[test]
    fn suffix_is_case_insensitive_on_the_file_side() {
        let m = meta();
        let file = FileView {
            wholename: "a/B.TXT",
            meta: &m,
        };
        let expr = Expr::Suffix {
            suffixes: vec!["txt".into()],
        };
        assert!(expr.evaluate(&file).unwrap());
    }

    #[test]
    fn since_oclock_uses_ticks() {
        let m = meta();
        let file = FileView {
            wholename: "x",
            meta: &m,
        };
        let hit = Expr::Since {
            spec: SinceOperand::Ticks(6),
            field: SinceField::OClock,
        };
        assert!(hit.evaluate(&file).unwrap());
        let miss = Expr::Since {
            spec: SinceOperand::Ticks(7),
            field: SinceField::OClock,
        };
        assert!(!miss.evaluate(&file).unwrap());
    }
}
