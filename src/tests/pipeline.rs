use std::fs::{self, File};
use std::time::Duration;

use tempfile::TempDir;

use crate::{
    Capture, CaptureOptions, Error, Pipeline, capture_both, capture_stdout, get_both, get_stdout,
    run,
};

fn stdout_of(source: &str) -> String {
    let out = Capture::new();
    let p = Pipeline::new(source).stdout(out.clone()).run().unwrap();
    drop(p);
    out.close(true);
    out.text()
}

#[cfg(unix)]
fn stderr_of(source: &str) -> String {
    let err = Capture::new();
    let p = Pipeline::new(source).stderr(err.clone()).run().unwrap();
    drop(p);
    err.close(true);
    err.text()
}

#[test]
fn pipe_no_input_stdout() {
    assert_eq!(
        stdout_of("echo foo 2> /dev/null | cat | cat").trim(),
        "foo"
    );
}

#[test]
fn pipe_with_input() {
    let out = Capture::new();
    let input = "foo".repeat(1000);
    let p = Pipeline::new("cat 2>> /dev/null | cat | cat")
        .stdout(out.clone())
        .input(input.as_str())
        .run()
        .unwrap();
    assert!(p.exit_status().success());
    out.close(true);
    assert_eq!(out.text(), input);
}

#[cfg(unix)]
#[test]
fn pipe_no_input_stderr() {
    assert_eq!(
        stderr_of("echo foo 2> /dev/null | cat | cat >&2").trim(),
        "foo"
    );
}

#[cfg(unix)]
#[test]
fn pipe_both_stderr() {
    assert_eq!(
        stderr_of("echo foo 2> /dev/null | cat >&2 |& cat >&2").trim(),
        "foo"
    );
}

#[cfg(unix)]
#[test]
fn pipe_redirect_stderr() {
    assert_eq!(
        stderr_of("echo foo 2> /dev/null | cat 2>&1 | cat >&2").trim(),
        "foo"
    );
}

#[test]
fn swap_outputs() {
    let dir = TempDir::new().unwrap();
    let p = Pipeline::new("echo foo | tee stdout.log 3>&1 1>&2 2>&3 | tee stderr.log > /dev/null")
        .cwd(dir.path())
        .run()
        .unwrap();
    assert!(p.exit_status().success());
    drop(p);
    assert_eq!(
        fs::read_to_string(dir.path().join("stdout.log"))
            .unwrap()
            .trim(),
        "foo"
    );
    assert_eq!(
        fs::read_to_string(dir.path().join("stderr.log"))
            .unwrap()
            .trim(),
        "foo"
    );
}

#[test]
fn large_file_integrity() {
    // A deterministic pseudo-random blob, piped through several cats.
    let mut data = Vec::with_capacity(2 * 1024 * 1024);
    let mut x: u32 = 0x2545_f491;
    while data.len() < 2 * 1024 * 1024 {
        x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        data.extend_from_slice(&x.to_le_bytes());
    }
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("random.bin"), &data).unwrap();
    let p = Pipeline::new("cat random.bin | cat | cat | cat | cat | cat > dest.bin")
        .cwd(dir.path())
        .run()
        .unwrap();
    assert!(p.exit_status().success());
    drop(p);
    let copied = fs::read(dir.path().join("dest.bin")).unwrap();
    assert_eq!(copied, data);
}

#[test]
fn logical_and() {
    assert_eq!(stdout_of("false && echo foo").trim(), "");
    assert_eq!(stdout_of("true && echo foo").trim(), "foo");
    assert_eq!(stdout_of("false | cat && echo foo").trim(), "foo");
}

#[test]
fn logical_or() {
    assert_eq!(stdout_of("false || echo foo").trim(), "foo");
    assert_eq!(stdout_of("true || echo foo").trim(), "");
}

#[test]
fn skipped_commands_have_no_status() {
    let out = Capture::new();
    let p = Pipeline::new("false && echo foo")
        .stdout(out.clone())
        .run()
        .unwrap();
    let statuses = p.exit_statuses();
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].unwrap().code(), Some(1));
    assert!(statuses[1].is_none());
    out.close(true);
}

#[test]
fn sequence_list() {
    assert_eq!(stdout_of("echo foo > /dev/null; echo bar").trim(), "bar");
}

#[test]
fn sequence_merge() {
    let text = stdout_of("echo foo; echo bar; echo baz");
    assert_eq!(
        text.split_whitespace().collect::<Vec<_>>(),
        vec!["foo", "bar", "baz"]
    );
}

#[test]
fn capture_when_other_piped() {
    let text = stdout_of("echo foo; echo bar |& cat");
    assert_eq!(
        text.split_whitespace().collect::<Vec<_>>(),
        vec!["foo", "bar"]
    );
}

#[test]
fn exit_status_aggregation() {
    let p = run("false").unwrap();
    assert_eq!(p.exit_status().code(), Some(1));
    let p = capture_stdout("echo foo; echo bar; echo baz; false").unwrap();
    let codes: Vec<_> = p
        .exit_statuses()
        .iter()
        .map(|s| s.unwrap().code().unwrap())
        .collect();
    assert_eq!(codes, vec![0, 0, 0, 1]);
    assert_eq!(p.exit_status().code(), Some(1));
    assert!(p.processes().iter().all(Option::is_some));
    assert_eq!(
        p.stdout_capture()
            .unwrap()
            .text()
            .split_whitespace()
            .collect::<Vec<_>>(),
        vec!["foo", "bar", "baz"]
    );
}

#[test]
fn double_redirect_rejected() {
    let out = Capture::new();
    let result = Pipeline::new("echo foo > /dev/null").stdout(&out).run();
    assert!(matches!(result, Err(Error::Binding(_))));

    let out = Capture::new();
    let err = Capture::new();
    let result = Pipeline::new("echo foo 2> /dev/null")
        .stdout(&out)
        .stderr(&err)
        .run();
    assert!(matches!(result, Err(Error::Binding(_))));
}

#[test]
fn background_parts_interleave() {
    let out = Capture::new();
    let p = Pipeline::new("echo foo & (sleep 0.6; echo bar) & (sleep 0.3; echo baz)")
        .stdout(out.clone())
        .run()
        .unwrap();
    assert!(p.exit_status().success());
    drop(p);
    out.close(true);
    let items: Vec<String> = out.text().split_whitespace().map(str::to_owned).collect();
    for item in ["foo", "bar", "baz"] {
        assert!(items.iter().any(|i| i == item), "{} missing", item);
    }
    let bar = items.iter().position(|i| i == "bar").unwrap();
    let baz = items.iter().position(|i| i == "baz").unwrap();
    assert!(bar > baz);
}

#[test]
fn literal_input() {
    let out = Capture::new();
    let p = Pipeline::new("cat")
        .stdout(out.clone())
        .input("foo")
        .run()
        .unwrap();
    assert!(p.exit_status().success());
    out.close(true);
    assert_eq!(out.bytes(), b"foo");
}

#[test]
fn unread_input_is_not_an_error() {
    let p = Pipeline::new("true").input("xxx").run().unwrap();
    assert!(p.wait().unwrap().success());
}

#[test]
fn shell_mode_redirection() {
    let err = Capture::new();
    let p = Pipeline::shell("cat >&2")
        .stderr(err.clone())
        .input("bar")
        .run()
        .unwrap();
    assert!(p.exit_status().success());
    err.close(true);
    assert_eq!(err.bytes(), b"bar");
}

#[test]
fn argv_source() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lines.txt");
    fs::write(&path, "1\n2\n3\n").unwrap();
    let path = path.to_str().unwrap();
    let out = Capture::new();
    let p = Pipeline::new(vec!["cat", path, path])
        .stdout(out.clone())
        .run()
        .unwrap();
    assert!(p.exit_status().success());
    out.close(true);
    assert_eq!(out.readlines().len(), 6);
}

#[test]
fn stdin_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("input");
    fs::write(&path, "contents").unwrap();
    let out = Capture::new();
    let p = Pipeline::new("cat")
        .stdin(File::open(&path).unwrap())
        .stdout(out.clone())
        .run()
        .unwrap();
    assert!(p.exit_status().success());
    out.close(true);
    assert_eq!(out.text(), "contents");
}

#[test]
fn redirection_with_cwd() {
    let dir = TempDir::new().unwrap();
    let p = Pipeline::new("echo hello > world")
        .cwd(dir.path())
        .run()
        .unwrap();
    assert!(p.exit_status().success());
    assert_eq!(
        fs::read_to_string(dir.path().join("world")).unwrap().trim(),
        "hello"
    );
}

#[test]
fn append_redirection() {
    let dir = TempDir::new().unwrap();
    let p = Pipeline::new("echo one > log; echo two >> log; echo three >> log")
        .cwd(dir.path())
        .run()
        .unwrap();
    assert!(p.exit_status().success());
    assert_eq!(
        fs::read_to_string(dir.path().join("log")).unwrap(),
        "one\ntwo\nthree\n"
    );
}

#[test]
fn input_redirection() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("nums"), "3\n1\n2\n").unwrap();
    let out = Capture::new();
    let p = Pipeline::new("sort < nums")
        .cwd(dir.path())
        .stdout(out.clone())
        .run()
        .unwrap();
    assert!(p.exit_status().success());
    out.close(true);
    assert_eq!(out.text(), "1\n2\n3\n");
}

#[test]
fn group_redirection() {
    let dir = TempDir::new().unwrap();
    let p = Pipeline::new("(echo foo; echo bar) > both")
        .cwd(dir.path())
        .run()
        .unwrap();
    assert!(p.exit_status().success());
    assert_eq!(
        fs::read_to_string(dir.path().join("both")).unwrap(),
        "foo\nbar\n"
    );
}

#[test]
fn group_piped() {
    let out = Capture::new();
    let p = Pipeline::new("(echo b; echo a) | sort")
        .stdout(out.clone())
        .run()
        .unwrap();
    assert!(p.exit_status().success());
    out.close(true);
    assert_eq!(out.text(), "a\nb\n");
}

#[test]
fn nonexistent_command() {
    let p = Pipeline::new("nonesuch foo");
    assert!(p.commands().is_empty());
    let err = p.run().unwrap_err();
    assert!(matches!(&err, Error::NotFound(name) if name == "nonesuch"));
}

#[test]
fn nonexistent_in_pipe_surfaces() {
    let out = Capture::new();
    let result = Pipeline::new("echo foo | nonesuch").stdout(out.clone()).run();
    assert!(matches!(result, Err(Error::NotFound(_))));
    out.close(true);
}

#[test]
fn async_commands_populated_before_return() {
    let p = Pipeline::new("sleep 0.2; echo done")
        .stdout(Capture::new())
        .run_async()
        .unwrap();
    assert_eq!(p.commands().len(), 2);
    assert!(p.wait().unwrap().success());
}

#[test]
fn async_driver_error_surfaces_in_wait() {
    let p = Pipeline::new("sleep 0.1; nonesuch").run_async().unwrap();
    assert!(matches!(p.wait(), Err(Error::NotFound(_))));
}

#[test]
fn wait_timeout_then_wait() {
    let cap = Capture::with_options(CaptureOptions {
        buffer_size: 1,
        ..Default::default()
    });
    let p = Pipeline::new(r#"sh -c 'printf "Waiting ... "; sleep 1.2; echo done.'"#)
        .stdout(cap.clone())
        .run_async()
        .unwrap();
    match p.wait_timeout(Duration::from_millis(400)) {
        Err(Error::Timeout) => {}
        other => panic!("expected timeout, got {:?}", other.map(|_| ())),
    }
    assert_eq!(p.exit_statuses(), vec![None]);
    assert_eq!(cap.read_opts(-1, false, None), b"Waiting ... ");
    assert!(p.wait().unwrap().success());
    assert!(p.exit_statuses()[0].unwrap().success());
    assert_eq!(cap.read(-1), b"done.\n");
    cap.close(true);
}

#[test]
fn convenience_helpers() {
    let p = capture_stdout("echo foo").unwrap();
    assert_eq!(p.stdout_capture().unwrap().text().trim(), "foo");

    assert_eq!(
        get_stdout("echo foo; echo bar")
            .unwrap()
            .split_whitespace()
            .collect::<Vec<_>>(),
        vec!["foo", "bar"]
    );

    let p = capture_both("sh -c 'echo out; echo err >&2'").unwrap();
    assert_eq!(p.stdout_capture().unwrap().text().trim(), "out");
    assert_eq!(p.stderr_capture().unwrap().text().trim(), "err");

    let (out, err) = get_both("sh -c 'echo out; echo err >&2'").unwrap();
    assert_eq!(out.trim(), "out");
    assert_eq!(err.trim(), "err");
}

#[cfg(unix)]
#[test]
fn terminate_through_commands() {
    let p = Pipeline::new("sleep 100").run_async().unwrap();
    let commands = p.commands();
    // Give the driver a moment to spawn the child.
    let status = loop {
        if commands[0].process().is_some() {
            commands[0].terminate().unwrap();
            break commands[0].wait().unwrap();
        }
        std::thread::sleep(Duration::from_millis(10));
    };
    assert!(status.is_killed_by(libc::SIGTERM));
    let _ = p.wait();
}
