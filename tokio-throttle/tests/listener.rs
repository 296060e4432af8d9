use std::{
    future, io,
    num::NonZeroU64,
    task::{ready, Context, Poll},
};

use parking_lot::Mutex;
use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::{self, Duration, Instant},
};
use tokio_throttle::{
    io::{Accept, ThrottleListenerExt},
    utils::meter::ByteMeter,
    ThrottleCanceled, ThrottledListener,
};

/// Hands out the server ends of in-memory pipes queued by [`Dialer::dial`].
struct MemoryListener {
    incoming: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
}

struct Dialer {
    tx: mpsc::UnboundedSender<DuplexStream>,
}

impl Dialer {
    /// Queue a connection and return the client end.
    fn dial(&self) -> DuplexStream {
        let (client, server) = duplex(1024 * 1024);
        self.tx.send(server).unwrap();
        client
    }
}

fn memory_listener() -> (MemoryListener, Dialer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryListener {
            incoming: Mutex::new(rx),
        },
        Dialer { tx },
    )
}

impl Accept for MemoryListener {
    type Io = DuplexStream;
    type Addr = usize;

    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(DuplexStream, usize)>> {
        let mut incoming = self.incoming.lock();
        Poll::Ready(match ready!(incoming.poll_recv(cx)) {
            Some(io) => Ok((io, 0)),
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "memory listener closed",
            )),
        })
    }
}

fn small_burst(listener: MemoryListener) -> ThrottledListener<MemoryListener> {
    ThrottledListener::with_burst(listener, NonZeroU64::new(1000).unwrap())
}

/// Read everything the client end receives, returning the byte count.
fn drain(mut client: DuplexStream) -> tokio::task::JoinHandle<usize> {
    tokio::spawn(async move {
        let mut sink = Vec::new();
        client.read_to_end(&mut sink).await.unwrap();
        sink.len()
    })
}

#[tokio::test(start_paused = true)]
async fn lone_connection_is_bound_by_its_own_cap() {
    let (raw, dialer) = memory_listener();
    let listener = small_burst(raw);
    listener.set_limits(3000, 1000);

    let client = dialer.dial();
    let (mut conn, _) = listener.accept().await.unwrap();
    let reader = drain(client);

    let chunk = [0u8; 1000];
    let mut stamps = Vec::new();
    let start = Instant::now();
    for _ in 0..4 {
        conn.write_all(&chunk).await.unwrap();
        stamps.push(start.elapsed());
    }

    // One 1000-byte write per second once the initial burst is spent.
    for pair in stamps.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= Duration::from_millis(990) && gap <= Duration::from_millis(1010),
            "gap {:?}",
            gap
        );
    }

    drop(conn);
    assert_eq!(reader.await.unwrap(), 4000);
}

#[tokio::test(start_paused = true)]
async fn shared_global_cap_binds_when_connections_compete() {
    let (raw, dialer) = memory_listener();
    let listener = small_burst(raw);
    listener.set_limits(1500, 1000);

    let mut writers = Vec::new();
    let mut readers = Vec::new();
    for _ in 0..2 {
        readers.push(drain(dialer.dial()));
        let (conn, _) = listener.accept().await.unwrap();
        writers.push(tokio::spawn(async move {
            let mut conn = conn;
            for _ in 0..6 {
                conn.write_all(&[1u8; 1000]).await.unwrap();
            }
            Instant::now()
        }));
    }

    let start = Instant::now();
    let mut finished = Vec::new();
    for writer in writers {
        finished.push(writer.await.unwrap() - start);
    }

    // 12000 bytes through a 1500 B/s shared cap with a 1000 byte burst: ~7.3s.
    // Each connection alone would only need 5s for its 6000 bytes.
    let last = finished.iter().max().unwrap();
    assert!(
        *last >= Duration::from_millis(7300) && *last <= Duration::from_millis(7700),
        "last writer finished after {:?}",
        last
    );
    // Neither connection starved behind the other.
    let first = finished.iter().min().unwrap();
    assert!(
        *last - *first <= Duration::from_millis(1500),
        "finish times {:?}",
        finished
    );

    for reader in readers {
        assert_eq!(reader.await.unwrap(), 6000);
    }
}

#[tokio::test(start_paused = true)]
async fn private_caps_hold_under_a_loose_global_cap() {
    let (raw, dialer) = memory_listener();
    let listener = small_burst(raw);
    listener.set_limits(10_000, 1000);

    let mut meters = Vec::new();
    let mut tasks = Vec::new();
    for _ in 0..3 {
        let _reader = drain(dialer.dial());
        let (conn, _) = listener.accept().await.unwrap();
        let mut conn = ByteMeter::new(conn);
        meters.push(conn.counters());
        tasks.push(tokio::spawn(async move {
            while conn.write_all(&[0u8; 100]).await.is_ok() {}
        }));
    }

    time::sleep(Duration::from_secs(10)).await;
    for meter in &meters {
        // 1000 byte burst, then 1000 B/s, plus at most the chunk in flight
        let written = meter.written();
        assert!((10_800..=11_100).contains(&written), "written {written}");
        let paced = (written - 1000) as f64 / 10.0;
        assert!(paced <= 1010.0, "paced rate {paced}");
    }

    for task in tasks {
        task.abort();
    }
}

#[tokio::test(start_paused = true)]
async fn aggregate_throughput_converges_to_the_global_rate() {
    let (raw, dialer) = memory_listener();
    let listener = small_burst(raw);
    listener.set_global_limit(2000);

    let mut meters = Vec::new();
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let _reader = drain(dialer.dial());
        let (conn, _) = listener.accept().await.unwrap();
        let mut conn = ByteMeter::new(conn);
        meters.push(conn.counters());
        tasks.push(tokio::spawn(async move {
            loop {
                if conn.write_all(&[0u8; 100]).await.is_err() {
                    break;
                }
            }
        }));
    }

    time::sleep(Duration::from_secs(20)).await;
    let total: u64 = meters.iter().map(|m| m.written()).sum();
    // 1000 byte burst + 20s at 2000 B/s, give or take one chunk per writer.
    assert!((40_600..=41_400).contains(&total), "total {total}");
    for meter in &meters {
        assert!(meter.written() >= 8_000, "starved writer: {}", meter.written());
    }

    for task in tasks {
        task.abort();
    }
}

#[tokio::test(start_paused = true)]
async fn global_change_reaches_connections_already_accepted() {
    let (raw, dialer) = memory_listener();
    let listener = small_burst(raw);
    listener.set_global_limit(100);

    let _reader = drain(dialer.dial());
    let (mut conn, _) = listener.accept().await.unwrap();
    conn.write_all(&[0u8; 1000]).await.unwrap();
    assert_eq!(conn.global_limit().rate(), 100);

    listener.set_global_limit(1000);
    assert_eq!(conn.global_limit().rate(), 1000);

    // The replacement bucket starts full, so the next burst is immediate.
    let start = Instant::now();
    conn.write_all(&[0u8; 1000]).await.unwrap();
    assert_eq!(start.elapsed(), Duration::ZERO);

    conn.write_all(&[0u8; 500]).await.unwrap();
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(550),
        "elapsed {:?}",
        elapsed
    );
}

#[tokio::test(start_paused = true)]
async fn default_change_only_affects_later_connections() {
    let (raw, dialer) = memory_listener();
    let listener = small_burst(raw);
    listener.set_default_connection_limit(100);

    let _early_reader = drain(dialer.dial());
    let (early, _) = listener.accept().await.unwrap();

    listener.set_default_connection_limit(5000);
    let _late_reader = drain(dialer.dial());
    let (late, _) = listener.accept().await.unwrap();

    assert_eq!(early.limit().rate(), 100);
    assert_eq!(late.limit().rate(), 5000);

    // Per-connection overrides do not leak into the listener default or other connections.
    early.set_limit(200);
    assert_eq!(listener.default_connection_limit().rate(), 5000);
    assert_eq!(late.limit().rate(), 5000);
    assert_eq!(early.limit().rate(), 200);

    early.set_limit(0);
    assert_eq!(early.limit().rate(), 200);
}

#[tokio::test(start_paused = true)]
async fn canceling_the_listener_scope_aborts_every_connection() {
    let (raw, dialer) = memory_listener();
    let listener = small_burst(raw);
    listener.set_global_limit(10);

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let _reader = drain(dialer.dial());
        let (mut conn, _) = listener.accept().await.unwrap();
        tasks.push(tokio::spawn(async move { conn.write(&[0u8; 2000]).await }));
    }

    time::sleep(Duration::from_secs(1)).await;
    listener.cancel_scope().cancel();

    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        let canceled = ThrottleCanceled::from_io_error(&err).unwrap();
        assert_eq!(canceled.written, 2000);
    }
}

#[tokio::test]
async fn poll_accept_wraps_queued_connections() {
    let (raw, dialer) = memory_listener();
    let listener = small_burst(raw);
    listener.set_default_connection_limit(750);

    let pending = future::poll_fn(|cx| Poll::Ready(listener.poll_accept(cx).is_pending())).await;
    assert!(pending, "nothing queued yet");

    let _client = dialer.dial();
    let (conn, addr) = future::poll_fn(|cx| listener.poll_accept(cx)).await.unwrap();
    assert_eq!(addr, 0);
    assert_eq!(conn.limit().rate(), 750);
    assert_eq!(conn.limit().burst(), Some(1000));
}

#[tokio::test]
async fn accept_errors_propagate_unchanged() {
    let (raw, dialer) = memory_listener();
    let listener = small_burst(raw);
    drop(dialer);

    let err = listener.accept().await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    assert_eq!(err.to_string(), "memory listener closed");
}

#[tokio::test]
async fn tcp_round_trip_through_a_throttled_listener() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .throttled_with(0, 1024 * 1024);
    let addr = listener.local_addr().unwrap();

    let client = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"get\n").await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        reply
    });

    let (mut conn, peer) = listener.accept().await.unwrap();
    assert_eq!(conn.get_ref().peer_addr().unwrap(), peer);
    assert_eq!(conn.limit().rate(), 1024 * 1024);

    let mut request = [0u8; 4];
    conn.read_exact(&mut request).await.unwrap();
    assert_eq!(&request, b"get\n");

    conn.write_all(b"payload").await.unwrap();
    conn.close().await.unwrap();
    listener.close().unwrap();

    assert_eq!(client.await.unwrap(), b"payload");
}
