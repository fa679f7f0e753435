use std::io::Write;
use std::time::Duration;

use crate::spawn::make_pipe;
use crate::{Capture, CaptureOptions, Pipeline, capture_stdout};

fn send_to_capture(cap: &Capture, data: &[u8]) {
    let (read, mut write) = make_pipe().unwrap();
    cap.add_stream(read);
    write.write_all(data).unwrap();
    // Dropping the write end lets the reader thread see EOF.
}

#[test]
fn read_in_chunks() {
    let cap = Capture::new();
    send_to_capture(&cap, b"foofoo");
    assert_eq!(cap.read(3), b"foo");
    assert_eq!(cap.read(3), b"foo");
    assert_eq!(cap.read(-1), b"");
    cap.close(false);
}

#[test]
fn read_without_streams() {
    let cap = Capture::new();
    assert_eq!(cap.read(-1), b"");
    assert_eq!(cap.readline(), b"");
}

#[test]
fn nonblocking_read() {
    let cap = Capture::new();
    let (read, mut write) = make_pipe().unwrap();
    cap.add_stream(read);
    assert_eq!(cap.read_opts(10, false, None), b"");
    write.write_all(b"xyz").unwrap();
    drop(write);
    assert_eq!(cap.read_opts(10, true, None), b"xyz");
    cap.close(true);
}

#[test]
fn blocking_read_times_out() {
    let cap = Capture::new();
    let (read, write) = make_pipe().unwrap();
    cap.add_stream(read);
    let got = cap.read_opts(10, true, Some(Duration::from_millis(50)));
    assert_eq!(got, b"");
    drop(write);
    cap.close(true);
}

#[test]
fn readline_splits_lines() {
    let cap = Capture::new();
    send_to_capture(&cap, b"foo\nbar\n");
    assert_eq!(cap.readline(), b"foo\n");
    assert_eq!(cap.readline(), b"bar\n");
    assert_eq!(cap.readline(), b"");
    cap.close(false);
}

#[test]
fn readline_partial() {
    let p = capture_stdout("echo foobarbaz").unwrap();
    let out = p.stdout_capture().unwrap();
    assert_eq!(out.readline_opts(6, true, None), b"foobar");
    assert_eq!(out.readline(), b"baz\n");
}

#[test]
fn readlines() {
    let cap = Capture::new();
    send_to_capture(&cap, b"one\ntwo\nthree");
    cap.close(true);
    assert_eq!(cap.readlines(), vec![b"one\n".to_vec(), b"two\n".to_vec(), b"three".to_vec()]);
}

#[test]
fn line_iteration() {
    let p = capture_stdout("echo foo; echo bar").unwrap();
    let lines: Vec<String> = p
        .stdout_capture()
        .unwrap()
        .map(|line| String::from_utf8_lossy(&line).trim().to_owned())
        .collect();
    assert_eq!(lines, vec!["foo", "bar"]);
}

#[test]
fn bytes_and_text() {
    let cap = Capture::new();
    send_to_capture(&cap, b"bar");
    cap.close(true);
    assert_eq!(cap.bytes(), b"bar");
    assert_eq!(cap.text(), "bar");
    // The full contents remain available after reads consumed the cursor.
    assert_eq!(cap.read(-1), b"bar");
    assert_eq!(cap.bytes(), b"bar");
}

#[test]
fn interleaves_multiple_streams() {
    let cap = Capture::new();
    send_to_capture(&cap, b"aaa");
    cap.read_opts(3, true, Some(Duration::from_secs(5)));
    send_to_capture(&cap, b"bbb");
    cap.close(true);
    assert_eq!(cap.bytes(), b"aaabbb");
}

const LISTER: &str =
    r#"sh -c 'i=1; while [ $i -le 10 ]; do echo "line $i"; i=$((i+1)); sleep 0.01; done'"#;

#[test]
fn expect_walks_forward() {
    let cap = Capture::with_options(CaptureOptions {
        buffer_size: -1,
        ..Default::default()
    });
    let p = Pipeline::new(LISTER).stdout(cap.clone()).run_async().unwrap();
    let timeout = Some(Duration::from_secs(10));
    let m1 = cap.expect("^line 1\r?$", timeout).unwrap().unwrap();
    let m2 = cap.expect("^line 5\r?$", timeout).unwrap().unwrap();
    let m3 = cap.expect("^line 1.*\r?$", timeout).unwrap().unwrap();
    p.wait().unwrap();
    cap.close(true);
    let data = cap.bytes();
    assert_eq!(&data[m1.start..m1.end], b"line 1");
    assert_eq!(&data[m2.start..m2.end], b"line 5");
    assert_eq!(&data[m3.start..m3.end], b"line 10");
    assert_eq!(cap.match_span(), Some(m3));
}

#[test]
fn expect_timeout_returns_none() {
    let cap = Capture::new();
    let (read, write) = make_pipe().unwrap();
    cap.add_stream(read);
    let m = cap
        .expect("never appears", Some(Duration::from_millis(50)))
        .unwrap();
    assert!(m.is_none());
    drop(write);
    cap.close(true);
}

#[test]
fn expect_returns_after_streams_end() {
    let cap = Capture::new();
    send_to_capture(&cap, b"line 1\n");
    // Blocks until the stream reaches EOF, so the capture is fully drained
    // before the expects below.
    assert_eq!(cap.read(-1), b"line 1\n");
    let m = cap.expect("^line 1$", None).unwrap();
    assert!(m.is_some());
    // No close() and no timeout: with every stream at EOF this must return
    // instead of waiting for bytes that can never arrive.
    let m = cap.expect("^line 2$", None).unwrap();
    assert!(m.is_none());
}

#[test]
fn expect_bad_pattern() {
    let cap = Capture::new();
    assert!(cap.expect("(unclosed", None).is_err());
}

#[test]
fn block_buffered_reader() {
    let cap = Capture::with_options(CaptureOptions {
        buffer_size: 4,
        ..Default::default()
    });
    send_to_capture(&cap, b"0123456789");
    cap.close(true);
    assert_eq!(cap.bytes(), b"0123456789");
}
