use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use flood_core::clock::WallClock;
use flood_core::dispatcher::Dispatcher;
use flood_core::driver::Driver;
use flood_core::pacer::Pacer;
use flood_core::payload::{Payload, LINE_SEP};
use flood_core::session::{Request, Session};
use flood_core::stats::Controller;

/// Byte-for-byte echo sink. The client never parses response content, so a
/// verbatim echo satisfies the equal-length contract.
async fn echo_listener(received: Arc<AtomicUsize>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let received = received.clone();
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let mut buf = [0u8; 4096];
                loop {
                    let Ok(n) = tokio::io::AsyncReadExt::read(&mut read, &mut buf).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    received.fetch_add(n, Ordering::Relaxed);
                    if tokio::io::AsyncWriteExt::write_all(&mut write, &buf[..n])
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            });
        }
    });
    addr
}

fn block(len: usize) -> Bytes {
    let mut data = vec![b'A'; len];
    *data.last_mut().unwrap() = LINE_SEP;
    Bytes::from(data)
}

#[tokio::test]
async fn session_completes_pipelined_requests_in_submission_order() {
    let addr = echo_listener(Arc::new(AtomicUsize::new(0))).await;
    let stream = TcpStream::connect(addr).await.unwrap();

    let (done, mut completions) = mpsc::unbounded_channel();
    let mut session = Session::new(addr);
    session.start(stream, done).unwrap();

    // Burst-submit with varying sizes; the started field doubles as a
    // submission-order marker.
    for i in 0..50u64 {
        session.roundtrip(Request {
            block: block(1 + (i as usize * 7) % 64),
            started: Duration::from_secs(i),
        });
    }
    for i in 0..50u64 {
        let completion = timeout(Duration::from_secs(5), completions.recv())
            .await
            .expect("roundtrip timed out")
            .expect("pipeline closed");
        assert_eq!(completion.started, Duration::from_secs(i));
    }
}

#[tokio::test]
async fn bulk_connect_establishes_every_session_within_budget() {
    let addr = echo_listener(Arc::new(AtomicUsize::new(0))).await;
    let endpoints = vec![addr; 20];
    let mut dispatcher = Dispatcher::new(&endpoints);

    let (done, mut completions) = mpsc::unbounded_channel();
    dispatcher.connect_all(3, &done).await.unwrap();
    assert_eq!(dispatcher.len(), 20);

    // The budget bounds connect concurrency: attempts overlap up to it and
    // never beyond it.
    assert!(dispatcher.peak_connects() <= 3);
    assert_eq!(dispatcher.peak_connects(), 3);

    // Every session is usable after the bulk connect resolves.
    for i in 0..40u64 {
        dispatcher.roundtrip(Request {
            block: block(8),
            started: Duration::from_secs(i),
        });
    }
    for _ in 0..40 {
        timeout(Duration::from_secs(5), completions.recv())
            .await
            .expect("roundtrip timed out")
            .expect("pipeline closed");
    }
}

#[tokio::test]
async fn connect_failure_is_a_startup_error() {
    // Bind-then-drop to get a port with no listener behind it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut dispatcher = Dispatcher::new(&[addr]);
    let (done, _completions) = mpsc::unbounded_channel();
    assert!(dispatcher.connect_all(4, &done).await.is_err());
}

#[tokio::test]
async fn driver_pushes_traffic_at_the_configured_rate() {
    let received = Arc::new(AtomicUsize::new(0));
    let addr = echo_listener(received.clone()).await;

    let clock = WallClock::new();
    let start = clock.now();
    let controller = Arc::new(Controller::new(1, start));
    let pacer = Pacer::new(controller, start, 200.0, 2, start);
    let driver = Driver::new(
        clock,
        Dispatcher::new(&[addr, addr]),
        pacer,
        Payload::new(16),
        4,
    );

    // The driver runs until killed; give it a slice of wall time and check
    // that traffic actually flowed.
    let outcome = timeout(Duration::from_millis(400), driver.run()).await;
    assert!(outcome.is_err(), "driver exited early: {outcome:?}");
    assert!(received.load(Ordering::Relaxed) > 0);
}
