use std::io::Read;

use crate::spawn::make_pipe;
use crate::{Capture, Error, Feeder, Pipeline};

const ECHOER: &str = r#"sh -c 'while read line; do echo "$line $line"; done'"#;

#[test]
fn feed_and_close() {
    let feeder = Feeder::new().unwrap();
    assert_eq!(feeder.feed("hello").unwrap(), 5);
    assert_eq!(feeder.feed(b"raw".as_slice()).unwrap(), 3);
    feeder.close().unwrap();
    assert!(matches!(feeder.feed("more"), Err(Error::Closed(_))));
}

#[test]
fn feeds_a_child() {
    let feeder = Feeder::new().unwrap();
    let out = Capture::new();
    let p = Pipeline::new("cat")
        .stdout(out.clone())
        .input(feeder.clone())
        .run_async()
        .unwrap();
    feeder.feed("ping\n").unwrap();
    assert_eq!(out.read_opts(5, true, None), b"ping\n");
    feeder.close().unwrap();
    p.wait().unwrap();
    out.close(true);
}

#[test]
fn echo_round_trip() {
    let feeder = Feeder::new().unwrap();
    let out = Capture::new();
    let p = Pipeline::new(ECHOER)
        .stdout(out.clone())
        .input(feeder.clone())
        .run_async()
        .unwrap();
    assert!(!p.commands().is_empty());
    feeder.feed("hello\n").unwrap();
    feeder.feed("goodbye\n").unwrap();
    feeder.close().unwrap();
    p.wait().unwrap();
    out.close(true);
    let lines: Vec<String> = out.text().lines().map(str::to_owned).collect();
    assert_eq!(lines, vec!["hello hello", "goodbye goodbye"]);
}

#[test]
fn executor_leaves_write_end_open() {
    // After the child is spawned, the feeder can still supply data; the
    // executor only duplicates the read end.
    let feeder = Feeder::new().unwrap();
    let mut reader = feeder.reader().unwrap();
    feeder.feed("late\n").unwrap();
    let mut buf = [0u8; 5];
    reader.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"late\n");
    feeder.close().unwrap();
}

#[test]
fn pipe_helper_round_trips() {
    let (mut read, mut write) = make_pipe().unwrap();
    use std::io::Write;
    write.write_all(b"x").unwrap();
    drop(write);
    let mut all = Vec::new();
    read.read_to_end(&mut all).unwrap();
    assert_eq!(all, b"x");
}
