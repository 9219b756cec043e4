//! Symbol pattern matching for version scripts and `--dynamic-list`
//!
//! Script files are parsed by the driver; this module evaluates the parsed
//! patterns. Patterns are shell globs (`*`, `?`, `[...]`). Exact patterns
//! are kept in a hash map; only genuine globs pay for a scan. `extern
//! "C++"` patterns match against a demangled rendering of the name.

use std::collections::HashMap;

use crate::options::VersionPattern;

/// True if `pattern` contains glob metacharacters
pub fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Glob matching over bytes, supporting `*`, `?` and `[...]` classes
/// (with ranges and leading-`!`/`^` negation)
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    glob_match_inner(&p, &n)
}

fn glob_match_inner(p: &[char], n: &[char]) -> bool {
    if p.is_empty() {
        return n.is_empty();
    }
    match p[0] {
        '*' => {
            // Collapse the star lazily: try to match the rest at every tail.
            for i in 0..=n.len() {
                if glob_match_inner(&p[1..], &n[i..]) {
                    return true;
                }
            }
            false
        }
        '?' => !n.is_empty() && glob_match_inner(&p[1..], &n[1..]),
        '[' => {
            let Some(close) = p.iter().position(|&c| c == ']').filter(|&i| i > 1) else {
                return !n.is_empty() && n[0] == '[' && glob_match_inner(&p[1..], &n[1..]);
            };
            if n.is_empty() {
                return false;
            }
            let mut class = &p[1..close];
            let negated = matches!(class.first(), Some('!' | '^'));
            if negated {
                class = &class[1..];
            }
            let mut matched = false;
            let mut i = 0;
            while i < class.len() {
                if i + 2 < class.len() && class[i + 1] == '-' {
                    if class[i] <= n[0] && n[0] <= class[i + 2] {
                        matched = true;
                    }
                    i += 3;
                } else {
                    if class[i] == n[0] {
                        matched = true;
                    }
                    i += 1;
                }
            }
            if matched == negated {
                return false;
            }
            glob_match_inner(&p[close + 1..], &n[1..])
        }
        c => !n.is_empty() && n[0] == c && glob_match_inner(&p[1..], &n[1..]),
    }
}

/// A light-weight rendition of an Itanium-mangled name, good enough for
/// `extern "C++"` pattern matching on plain (non-template) signatures.
pub fn demangle(name: &str) -> String {
    let Some(rest) = name.strip_prefix("_Z") else {
        return name.to_string();
    };
    let mut parts = Vec::new();
    let mut s = rest.strip_prefix('N').unwrap_or(rest);
    loop {
        let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            break;
        }
        let len: usize = match digits.parse() {
            Ok(len) => len,
            Err(_) => break,
        };
        s = &s[digits.len()..];
        if s.len() < len {
            return name.to_string();
        }
        parts.push(&s[..len]);
        s = &s[len..];
    }
    if parts.is_empty() {
        return name.to_string();
    }
    let s = s.strip_prefix('E').unwrap_or(s);
    let mut out = parts.join("::");
    if s.is_empty() || s == "v" {
        out.push_str("()");
    } else {
        // Argument types are not rendered; scripts almost always glob them.
        out.push_str("(...)");
    }
    out
}

/// Compiled form of a pattern list. Later patterns win over earlier ones,
/// matching what linkers do for version scripts.
pub struct VersionMatcher {
    exact: HashMap<String, u16>,
    globs: Vec<(String, u16)>,
    cpp_globs: Vec<(String, u16)>,
}

impl VersionMatcher {
    pub fn new(patterns: &[VersionPattern]) -> VersionMatcher {
        let mut exact = HashMap::new();
        let mut globs = Vec::new();
        let mut cpp_globs = Vec::new();
        for p in patterns {
            if p.is_cpp {
                cpp_globs.push((p.pattern.clone(), p.ver_idx));
            } else if is_glob(&p.pattern) {
                globs.push((p.pattern.clone(), p.ver_idx));
            } else {
                exact.insert(p.pattern.clone(), p.ver_idx);
            }
        }
        VersionMatcher {
            exact,
            globs,
            cpp_globs,
        }
    }

    pub fn match_name(&self, name: &str) -> Option<u16> {
        if let Some(&idx) = self.exact.get(name) {
            return Some(idx);
        }
        if let Some(&(_, idx)) = self
            .globs
            .iter()
            .rev()
            .find(|(pattern, _)| glob_match(pattern, name))
        {
            return Some(idx);
        }
        if self.cpp_globs.is_empty() {
            return None;
        }
        let demangled = demangle(name);
        self.cpp_globs
            .iter()
            .rev()
            .find(|(pattern, _)| glob_match(pattern, &demangled) || glob_match(pattern, name))
            .map(|&(_, idx)| idx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use crate::elf::VER_NDX_LOCAL;

    #[test]
    fn test_glob_basics() {
        assert!(glob_match("foo", "foo"));
        assert!(!glob_match("foo", "foobar"));
        assert!(glob_match("foo*", "foobar"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("f?o", "foo"));
        assert!(glob_match("[a-c]x", "bx"));
        assert!(!glob_match("[!a-c]x", "bx"));
        assert!(glob_match("lib*_[0-9].so", "libm_4.so"));
    }

    #[test]
    fn test_matcher_prefers_exact_then_last_glob() {
        let patterns = vec![
            VersionPattern {
                pattern: "glob*".into(),
                is_cpp: false,
                ver_idx: 2,
            },
            VersionPattern {
                pattern: "global_fn".into(),
                is_cpp: false,
                ver_idx: 3,
            },
            VersionPattern {
                pattern: "*".into(),
                is_cpp: false,
                ver_idx: VER_NDX_LOCAL,
            },
        ];
        let m = VersionMatcher::new(&patterns);
        assert_eq!(m.match_name("global_fn"), Some(3));
        assert_eq!(m.match_name("anything_else"), Some(VER_NDX_LOCAL));
        assert_eq!(m.match_name("globx"), Some(VER_NDX_LOCAL));
    }

    #[test]
    fn test_cpp_patterns_match_demangled() {
        let patterns = vec![VersionPattern {
            pattern: "ns::*".into(),
            is_cpp: true,
            ver_idx: 4,
        }];
        let m = VersionMatcher::new(&patterns);
        assert_eq!(m.match_name("_ZN2ns3fooEv"), Some(4));
        assert_eq!(m.match_name("_Z4mainv"), None);
    }

    #[test]
    fn test_demangle_simple_names() {
        assert_eq!(demangle("_ZN2ns3fooEv"), "ns::foo()");
        assert_eq!(demangle("plain_c_name"), "plain_c_name");
    }
}
