use std::fs;

use tempfile::TempDir;

use crate::{Capture, Pipeline, shell_format, shell_quote};

#[test]
fn quote() {
    assert_eq!(shell_quote(""), "''");
    assert_eq!(shell_quote("a"), "a");
    assert_eq!(shell_quote("*"), "'*'");
    assert_eq!(shell_quote("foo"), "foo");
    assert_eq!(shell_quote("'*.py'"), r"''\''*.py'\'''");
    assert_eq!(
        shell_quote("'a'; rm -f b; true 'c'"),
        r"''\''a'\''; rm -f b; true '\''c'\'''"
    );
    assert_eq!(shell_quote("*.py"), "'*.py'");
    assert_eq!(shell_quote("'*.py"), r"''\''*.py'");
}

#[cfg(unix)]
#[test]
fn quote_with_shell() {
    let workdir = TempDir::new().unwrap();
    let dir = workdir.path().to_str().unwrap();

    // A string full of shell metacharacters comes back from echo intact,
    // and its embedded `touch` never runs.
    let s = format!("'\\\"; touch {}/foo #'", dir);
    let out = Capture::new();
    let p = Pipeline::shell(format!("echo {}", shell_quote(&s)))
        .stdout(out.clone())
        .run()
        .unwrap();
    assert!(p.exit_status().success());
    out.close(true);
    assert_eq!(out.text(), format!("{}\n", s));
    assert_eq!(fs::read_dir(workdir.path()).unwrap().count(), 0);

    // A quoted filename with glob characters is created literally.
    let fname = "'ab?'";
    let p = Pipeline::shell(format!("touch {}/{}", dir, shell_quote(fname)))
        .run()
        .unwrap();
    assert!(p.exit_status().success());
    let entries: Vec<_> = fs::read_dir(workdir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(entries, vec![fname]);
}

#[test]
fn formatter() {
    assert_eq!(shell_format("ls {0}", &["*.py"]).unwrap(), "ls '*.py'");
    assert_eq!(shell_format("ls {0!s}", &["*.py"]).unwrap(), "ls *.py");
    assert_eq!(
        shell_format("diff {0} {1}", &["old file", "new file"]).unwrap(),
        "diff 'old file' 'new file'"
    );
    assert_eq!(shell_format("find {{x}}", &[]).unwrap(), "find {x}");
}

#[test]
fn formatter_errors() {
    assert!(shell_format("ls {0}", &[]).is_err());
    assert!(shell_format("ls {x}", &["a"]).is_err());
    assert!(shell_format("ls {0", &["a"]).is_err());
    assert!(shell_format("ls {0!r}", &["a"]).is_err());
}
