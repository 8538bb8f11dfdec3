//! One-shot echo over a named pipe endpoint: a server accepts a single
//! connection and echoes the message back to the client.

use eddy::prelude::*;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let dir = std::env::temp_dir().join(format!("eddy-echo-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("temp dir creation failed");
    let name = dir.join("echo.sock");

    let lp = Loop::new().expect("loop construction failed");

    let server = Pipe::new(&lp);
    server.bind(&name).expect("bind failed");
    server.accept().then(|conn| {
        let echo = conn.clone();
        conn.read(64)
            .then(move |buf| {
                tracing::info!(bytes = buf.len(), "server echoing");
                echo.write(buf.freeze())
            })
    });

    let client = Pipe::new(&lp);
    {
        let writer = client.clone();
        let reader = client.clone();
        client
            .connect(&name)
            .then(move |()| writer.write(Bytes::from_static(b"round and round")))
            .then(move |()| reader.read(64))
            .map(|buf| {
                tracing::info!(reply = %String::from_utf8_lossy(&buf), "client got the echo");
            });
    }

    lp.run().expect("run failed");
    let _ = std::fs::remove_dir_all(&dir);
}
