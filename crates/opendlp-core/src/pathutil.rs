//! Path template expansion for policy monitored paths.
//!
//! Server policies carry path templates like `$HOME/Documents` or
//! `%USERPROFILE%\Documents`. Both Unix- and Windows-style variable
//! references are expanded against the process environment so one bundle
//! can serve mixed fleets.

use std::path::PathBuf;

/// Expand environment references and a leading `~` in a path template.
///
/// Supports `${VAR}`, `$VAR`, `%VAR%`, and `~/`. Unknown variables expand
/// to the empty string, matching what the platform expansion calls do.
pub fn expand_path_template(template: &str) -> PathBuf {
    let mut s = template.to_string();

    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_default();
        s = format!("{home}/{rest}");
    }

    s = expand_unix_vars(&s);
    s = expand_windows_vars(&s);

    PathBuf::from(s)
}

fn expand_unix_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                for (_, nc) in chars.by_ref() {
                    if nc == '}' {
                        break;
                    }
                    name.push(nc);
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            Some((_, nc)) if nc.is_ascii_alphabetic() || *nc == '_' => {
                let mut name = String::new();
                while let Some((_, nc)) = chars.peek() {
                    if nc.is_ascii_alphanumeric() || *nc == '_' {
                        name.push(*nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }
    out
}

fn expand_windows_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('%') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                out.push_str(&std::env::var(name).unwrap_or_default());
                rest = &after[end + 1..];
            }
            _ => {
                out.push('%');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Case-insensitive extension of a path, including the leading dot.
pub fn lowercase_extension(path: &std::path::Path) -> Option<String> {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
}

/// True when `dir` is a path-prefix of `path` on component boundaries.
pub fn is_path_prefix(dir: &std::path::Path, path: &std::path::Path) -> bool {
    path.starts_with(dir)
}
