//! Tests for the asynchronous file stream: open/write/close/read round
//! trips, offset tracking, end-of-file rejection, and queueing without
//! awaiting.

use std::cell::Cell;
use std::rc::Rc;

use super::*;

const CONTENT: &[u8] = b"an awesome message to keep";

fn scratch(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir creation failed");
    let path = dir.path().join(name);
    (dir, path)
}

/// Test that opening a nonexistent path creates the file, with the open
/// future settling during the run.
#[test]
fn open_creates_the_file() {
    let (_dir, path) = scratch("open-creates");
    let lp = Loop::new().expect("loop construction failed");
    let started = Rc::new(Cell::new(false));
    let opened = Rc::new(Cell::new(false));

    let file = File::new(&lp);
    file.open(&path).map({
        let started = started.clone();
        let opened = opened.clone();
        move |()| {
            assert!(started.get(), "open settled before the loop ran");
            opened.set(true);
        }
    });

    started.set(true);
    lp.run().expect("run failed");
    assert!(opened.get(), "open never settled");
    assert!(path.exists(), "open did not create the file");
}

/// Test an open-write-close chain, verifying the bytes on disk afterwards.
#[test]
fn write_reaches_the_disk() {
    let (_dir, path) = scratch("write-reaches");
    let lp = Loop::new().expect("loop construction failed");

    let file = File::new(&lp);
    {
        let write_file = file.clone();
        let close_file = file.clone();
        file.open(&path)
            .then(move |()| write_file.write(Bytes::from_static(CONTENT)))
            .then(move |()| close_file.close());
    }

    lp.run().expect("run failed");
    assert_eq!(
        std::fs::read(&path).expect("file missing after the run"),
        CONTENT,
        "bytes on disk differ from the write"
    );
}

/// Test the full round trip: write through one file stream, read the same
/// byte count back through a second one, and compare.
#[test]
fn round_trip_reads_back_the_written_bytes() {
    let (_dir, path) = scratch("round-trip");
    let lp = Loop::new().expect("loop construction failed");
    let made_it_to_the_end = Rc::new(Cell::new(false));

    let write_file = File::new(&lp);
    let read_file = File::new(&lp);
    {
        let w = write_file.clone();
        let wc = write_file.clone();
        let r = read_file.clone();
        let rr = read_file.clone();
        let made_it = made_it_to_the_end.clone();
        let read_path = path.clone();
        write_file
            .open(&path)
            .then(move |()| w.write(Bytes::from_static(CONTENT)))
            .then(move |()| wc.close())
            .then(move |()| r.open(read_path))
            .then(move |()| rr.read(CONTENT.len()))
            .map(move |data| {
                assert_eq!(&data[..], CONTENT, "read bytes differ from the write");
                made_it.set(true);
            });
    }

    lp.run().expect("run failed");
    assert!(made_it_to_the_end.get(), "chain never reached the end");
}

/// Test that requests may be queued back-to-back without awaiting: the
/// write and close are enqueued before the open has settled.
#[test]
fn requests_queue_without_awaiting() {
    let (_dir, path) = scratch("queued");
    let lp = Loop::new().expect("loop construction failed");
    let closed = Rc::new(Cell::new(false));

    let file = File::new(&lp);
    file.open(&path);
    file.write(Bytes::from_static(CONTENT));
    file.close().map({
        let closed = closed.clone();
        move |()| closed.set(true)
    });

    lp.run().expect("run failed");
    assert!(closed.get(), "queued close never settled");
    assert_eq!(std::fs::read(&path).expect("file missing"), CONTENT);
}

/// Test that successive reads advance the offset by the bytes delivered.
#[test]
fn reads_advance_the_offset() {
    let (_dir, path) = scratch("offsets");
    std::fs::write(&path, b"hello world").expect("seed write failed");

    let lp = Loop::new().expect("loop construction failed");
    let file = File::new(&lp);
    {
        let first = file.clone();
        let second = file.clone();
        let checker = file.clone();
        file.open(&path)
            .then(move |()| first.read(5))
            .then(move |head| {
                assert_eq!(&head[..], b"hello");
                second.read(6)
            })
            .map(move |tail| {
                assert_eq!(&tail[..], b" world");
                assert_eq!(checker.offset(), 11, "offset did not advance");
            });
    }

    lp.run().expect("run failed");
    assert_eq!(file.offset(), 11);
}

/// Test that writes advance the offset by the bytes accepted.
#[test]
fn writes_advance_the_offset() {
    let (_dir, path) = scratch("write-offsets");
    let lp = Loop::new().expect("loop construction failed");
    let file = File::new(&lp);
    {
        let w1 = file.clone();
        let w2 = file.clone();
        file.open(&path)
            .then(move |()| w1.write(Bytes::from_static(b"hello ")))
            .then(move |()| w2.write(Bytes::from_static(b"world")));
    }

    lp.run().expect("run failed");
    assert_eq!(file.offset(), 11);
    assert_eq!(std::fs::read(&path).expect("file missing"), b"hello world");
}

/// Test that a read at the end of the file rejects with the end-of-stream
/// error before any byte arrives.
#[test]
fn read_at_eof_rejects_with_end_of_stream() {
    let (_dir, path) = scratch("eof");
    std::fs::write(&path, b"").expect("seed write failed");

    let lp = Loop::new().expect("loop construction failed");
    let outcome = Rc::new(Cell::new(None::<ErrorKind>));

    let file = File::new(&lp);
    {
        let reader = file.clone();
        let outcome = outcome.clone();
        file.open(&path)
            .then(move |()| reader.read(16))
            .map_else(
                |_| panic!("read at EOF resolved"),
                move |error| outcome.set(Some(error.kind())),
            );
    }

    lp.run().expect("run failed");
    assert_eq!(outcome.get(), Some(ErrorKind::EndOfStream));
}

/// Test that operations against a stream that is not (projected to become)
/// open are rejected immediately.
#[test]
fn requests_against_a_closed_stream_are_rejected() {
    let (_dir, path) = scratch("closed");
    let lp = Loop::new().expect("loop construction failed");
    let write_rejected = Rc::new(Cell::new(false));

    let file = File::new(&lp);
    file.open(&path);
    file.close();
    file.write(Bytes::from_static(b"late")).map_else(
        |()| panic!("write accepted after close"),
        {
            let write_rejected = write_rejected.clone();
            move |error| {
                assert_eq!(error.kind(), ErrorKind::Stream);
                write_rejected.set(true);
            }
        },
    );
    assert!(
        write_rejected.get(),
        "write after close was not rejected at the call site"
    );

    lp.run().expect("run failed");
}

/// Test the lifecycle states across open and close.
#[test]
fn lifecycle_states_progress() {
    let (_dir, path) = scratch("lifecycle");
    let lp = Loop::new().expect("loop construction failed");

    let file = File::new(&lp);
    assert_eq!(file.state(), StreamState::Closed);

    let probe = file.clone();
    file.open(&path).map(move |()| {
        assert_eq!(probe.state(), StreamState::Open);
        probe.close();
    });

    lp.run().expect("run failed");
    assert_eq!(file.state(), StreamState::ClosedFinal);
}

/// Test that a second open is rejected while the first is still projected.
#[test]
fn double_open_is_rejected() {
    let (_dir, path) = scratch("double-open");
    let lp = Loop::new().expect("loop construction failed");
    let rejected = Rc::new(Cell::new(false));

    let file = File::new(&lp);
    file.open(&path);
    file.open(&path).map_else(
        |()| panic!("second open was accepted"),
        {
            let rejected = rejected.clone();
            move |error| {
                assert_eq!(error.kind(), ErrorKind::Stream);
                rejected.set(true);
            }
        },
    );
    assert!(rejected.get());

    lp.run().expect("run failed");
}
