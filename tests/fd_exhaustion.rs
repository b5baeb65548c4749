//! Accepting survives the process running out of file descriptors.
//!
//! The descriptor limit is process-wide, so this lives in its own test binary.

#![cfg(unix)]

use axum::routing::get;
use axum::Router;
use serve_throttle::config::ServerConfig;
use serve_throttle::{LifecycleState, ServiceRuntime};
use std::fs::File;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Set the soft `RLIMIT_NOFILE`, returning the previous soft limit.
fn set_open_file_limit(limit: libc::rlim_t) -> libc::rlim_t {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: both calls get a pointer to a live, initialized rlimit
    unsafe {
        assert_eq!(libc::getrlimit(libc::RLIMIT_NOFILE, &mut current), 0);
        let lowered = libc::rlimit {
            rlim_cur: limit.min(current.rlim_max),
            rlim_max: current.rlim_max,
        };
        assert_eq!(libc::setrlimit(libc::RLIMIT_NOFILE, &lowered), 0);
    }
    current.rlim_cur
}

fn exhaust_descriptors() -> Vec<File> {
    let mut held = Vec::new();
    loop {
        match File::open("/dev/null") {
            Ok(file) => held.push(file),
            Err(err) => {
                assert_eq!(err.raw_os_error(), Some(libc::EMFILE));
                return held;
            }
        }
    }
}

#[tokio::test]
async fn test_accept_resumes_after_descriptor_exhaustion() {
    let runtime = Arc::new(
        ServiceRuntime::builder(Router::new().route("/", get(|| async { "still here" })))
            .config(ServerConfig::with_address("127.0.0.1:0"))
            .build()
            .unwrap(),
    );
    let run = {
        let runtime = Arc::clone(&runtime);
        tokio::spawn(async move { runtime.run().await })
    };
    runtime
        .lifecycle()
        .wait_for(|state| *state == LifecycleState::Serving)
        .await
        .unwrap();
    let addr = runtime.local_addr().unwrap();

    let previous_limit = set_open_file_limit(256);
    let mut held = exhaust_descriptors();
    assert!(!held.is_empty(), "test process already uses 256 descriptors");

    // Leave exactly one slot, taken by the client side of the connection
    drop(held.pop());
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    // The server side cannot get a descriptor and has to keep retrying
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!run.is_finished());
    assert_eq!(runtime.state(), LifecycleState::Serving);

    drop(held);
    set_open_file_limit(previous_limit);

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(5), client.read_to_string(&mut response))
        .await
        .expect("queued connection should be served once descriptors free up")
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("still here"));

    runtime.shutdown_handle().trigger();
    run.await.unwrap().expect("clean shutdown");
    assert_eq!(runtime.state(), LifecycleState::Terminated);
}
