use crate::error::{Error, Result};

fn safe_char(c: char) -> bool {
    matches!(c, '_' | '.' | '/' | '-') || c.is_ascii_alphanumeric()
}

/// Quote a string so that a POSIX shell parses it as a single word with the
/// exact original contents.
///
/// The empty string becomes `''`, strings consisting only of safe characters
/// (`A-Za-z0-9_./-`) are passed through unchanged, and everything else is
/// wrapped in single quotes with embedded single quotes escaped as `'\''`.
///
/// # Example
///
/// ```
/// # use shpipe::shell_quote;
/// assert_eq!(shell_quote("foo"), "foo");
/// assert_eq!(shell_quote("*.py"), "'*.py'");
/// assert_eq!(shell_quote("don't"), r"'don'\''t'");
/// ```
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_owned();
    }
    if s.chars().all(safe_char) {
        return s.to_owned();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Format a template with positional arguments, quoting them for a POSIX
/// shell.
///
/// A `{n}` placeholder receives `shell_quote(args[n])`, a `{n!s}` placeholder
/// receives the argument verbatim, and `{{`/`}}` produce literal braces.
/// A placeholder that is malformed or out of range is an error.
///
/// # Example
///
/// ```
/// # use shpipe::shell_format;
/// assert_eq!(shell_format("ls {0}", &["*.py"]).unwrap(), "ls '*.py'");
/// assert_eq!(shell_format("ls {0!s}", &["*.py"]).unwrap(), "ls *.py");
/// ```
pub fn shell_format(template: &str, args: &[&str]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut index = String::new();
                while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    index.push(*d);
                    chars.next();
                }
                let raw = if chars.peek() == Some(&'!') {
                    chars.next();
                    match chars.next() {
                        Some('s') => true,
                        _ => return Err(Error::Parse("bad conversion in placeholder".into())),
                    }
                } else {
                    false
                };
                if index.is_empty() || chars.next() != Some('}') {
                    return Err(Error::Parse(format!("bad placeholder in {:?}", template)));
                }
                let n: usize = index
                    .parse()
                    .map_err(|_| Error::Parse(format!("bad placeholder index {:?}", index)))?;
                let arg = args
                    .get(n)
                    .ok_or_else(|| Error::Parse(format!("placeholder {{{}}} out of range", n)))?;
                if raw {
                    out.push_str(arg);
                } else {
                    out.push_str(&shell_quote(arg));
                }
            }
            '}' => return Err(Error::Parse("unmatched '}' in template".into())),
            c => out.push(c),
        }
    }
    Ok(out)
}
