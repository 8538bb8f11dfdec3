//! Copies one file into another through two file streams, chunk by chunk.
//!
//! Usage: file_copy <source> <destination>

use eddy::prelude::*;

const CHUNK: usize = 4096;

fn pump(source: File, destination: File, copied: usize) -> Future<usize> {
    let reader = source.clone();
    reader.read(CHUNK).then_else(
        move |chunk| {
            let grown = copied + chunk.len();
            let writer = destination.clone();
            writer
                .write(chunk.freeze())
                .then(move |()| pump(source, destination, grown))
        },
        move |error| {
            // End of the source ends the copy; anything else is fatal here.
            if error.kind() == ErrorKind::EndOfStream {
                Future::fulfilled(copied)
            } else {
                Future::rejected(error)
            }
        },
    )
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(from), Some(to)) = (args.next(), args.next()) else {
        eprintln!("usage: file_copy <source> <destination>");
        std::process::exit(2);
    };

    let lp = Loop::new().expect("loop construction failed");

    let source = File::new(&lp);
    let destination = File::new(&lp);
    {
        let source = source.clone();
        let destination = destination.clone();
        let open_to = destination.clone();
        source
            .open(from)
            .then(move |()| open_to.open(to))
            .then(move |()| pump(source, destination, 0))
            .map_else(
                |copied| tracing::info!(copied, "copy finished"),
                |error| tracing::error!(%error, "copy failed"),
            );
    }

    lp.run().expect("run failed");
}
