//! Integration tests for clamd-client.
//!
//! These tests run the client against stub daemons on real sockets.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clamd_client::protocol::ChunkBuffer;
use clamd_client::transport::{BoxFuture, Connection, Connector, Dialer};
use clamd_client::{
    Clamd, ClamdError, Interrupt, Network, Options, TransportStage, Verdict,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Accept connections forever, running `handler` on each.
async fn stub_server<F, Fut>(handler: F) -> String
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        loop {
            let (sock, _) = listener.accept().await.unwrap();
            let handler = handler.clone();
            tokio::spawn(async move { handler(sock).await });
        }
    });

    addr
}

/// Read the command header: up to and including `\n` or `\0`.
async fn read_header<R: AsyncReadExt + Unpin>(sock: &mut R) -> Vec<u8> {
    let mut header = Vec::new();
    loop {
        let byte = sock.read_u8().await.unwrap();
        header.push(byte);
        if byte == b'\n' || byte == b'\0' {
            return header;
        }
    }
}

fn client(addr: String) -> Clamd {
    Clamd::builder()
        .tcp(addr)
        .read_timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// PING against a daemon that answers PONG.
#[tokio::test]
async fn test_ping_pong() {
    let addr = stub_server(|mut sock| async move {
        assert_eq!(read_header(&mut sock).await, b"nPING\n");
        sock.write_all(b"PONG\n").await.unwrap();
    })
    .await;

    let reply = client(addr).ping().await.unwrap();

    assert!(reply.raw.starts_with("PONG"));
    assert_eq!(reply.attempts, 1);
}

/// PING fails when the daemon answers something else.
#[tokio::test]
async fn test_ping_unexpected_reply() {
    let addr = stub_server(|mut sock| async move {
        read_header(&mut sock).await;
        sock.write_all(b"UNKNOWN COMMAND\n").await.unwrap();
    })
    .await;

    let err = client(addr).ping().await.unwrap_err();
    assert!(matches!(err, ClamdError::Protocol(_)));
}

/// INSTREAM writes 1024 + 1024 + 452 bytes and a terminator, in order.
#[tokio::test]
async fn test_instream_chunk_layout() {
    let (sizes_tx, mut sizes_rx) = mpsc::unbounded_channel();

    let addr = stub_server(move |mut sock| {
        let sizes_tx = sizes_tx.clone();
        async move {
            assert_eq!(read_header(&mut sock).await, b"zINSTREAM\0");

            let mut decoder = ChunkBuffer::new();
            let mut chunks = Vec::new();
            let mut buf = [0u8; 700];
            while !decoder.is_finished() {
                let n = sock.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed mid-stream");
                chunks.extend(decoder.push(&buf[..n]).unwrap());
            }

            let data: Vec<u8> = chunks.iter().flat_map(|c| c.payload().to_vec()).collect();
            assert!(data.iter().enumerate().all(|(i, b)| *b == (i % 256) as u8));

            let sizes: Vec<u32> = chunks.iter().map(|c| c.declared_len()).collect();
            sizes_tx.send(sizes).unwrap();
            sock.write_all(b"stream: OK\0").await.unwrap();
        }
    })
    .await;

    let payload: Vec<u8> = (0..2500usize).map(|i| (i % 256) as u8).collect();
    let reply = client(addr).instream(&payload).await.unwrap();

    assert_eq!(sizes_rx.recv().await.unwrap(), vec![1024, 1024, 452, 0]);
    assert_eq!(reply.attempts, 1);
    assert!(reply.scan_report().unwrap().is_clean());
}

/// INSTREAM from an async reader, with an infected verdict.
#[tokio::test]
async fn test_instream_reader_found() {
    let addr = stub_server(|mut sock| async move {
        read_header(&mut sock).await;
        let mut decoder = ChunkBuffer::new();
        let mut buf = [0u8; 256];
        while !decoder.is_finished() {
            let n = sock.read(&mut buf).await.unwrap();
            decoder.push(&buf[..n]).unwrap();
        }
        sock.write_all(b"stream: Win.Test.EICAR_HDB-1 FOUND\0")
            .await
            .unwrap();
    })
    .await;

    let reader: &[u8] = b"not really eicar";
    let reply = client(addr).instream_reader(reader).await.unwrap();
    let report = reply.scan_report().unwrap();

    assert_eq!(
        report.results[0].verdict,
        Verdict::Infected("Win.Test.EICAR_HDB-1".into())
    );
}

/// Scan commands carry the path verbatim.
#[tokio::test]
async fn test_scan_commands_send_path() {
    let addr = stub_server(|mut sock| async move {
        let header = read_header(&mut sock).await;
        let line = String::from_utf8(header).unwrap();
        let path = line.trim_end().split_once(' ').unwrap().1.to_string();
        sock.write_all(format!("{path}: OK\n").as_bytes())
            .await
            .unwrap();
    })
    .await;
    let clamd = client(addr);

    let reply = clamd.contscan("/srv/data dir").await.unwrap();
    assert_eq!(reply.raw, "/srv/data dir: OK\n");

    assert!(clamd.allmatchscan("/x").await.is_ok());
    assert!(matches!(
        clamd.scan("").await,
        Err(ClamdError::InvalidArgument(_))
    ));
}

/// Responses bigger than any fixed buffer are read to EOF.
#[tokio::test]
async fn test_large_multiscan_response() {
    let addr = stub_server(|mut sock| async move {
        read_header(&mut sock).await;
        for i in 0..40_000 {
            let line = format!("/srv/tree/file-{i:06}.bin: OK\n");
            sock.write_all(line.as_bytes()).await.unwrap();
        }
    })
    .await;

    let reply = client(addr).multiscan("/srv/tree").await.unwrap();
    assert!(reply.raw.len() > 1024 * 1024);

    let report = reply.scan_report().unwrap();
    assert_eq!(report.results.len(), 40_000);
    assert!(report.is_clean());
}

/// Fails the first `failures` dials, then dials for real.
struct FlakyConnector {
    failures: AtomicU32,
    inner: Dialer,
}

impl Connector for FlakyConnector {
    type Stream = Connection;

    fn connect(&self) -> BoxFuture<'_, clamd_client::error::Result<Connection>> {
        let left = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        Box::pin(async move {
            if left.is_ok() {
                return Err(ClamdError::transport(
                    TransportStage::Dial,
                    io::Error::from(io::ErrorKind::ConnectionRefused),
                ));
            }
            self.inner.connect().await
        })
    }
}

/// Transient dial failures are retried and counted.
#[tokio::test]
async fn test_retry_reports_attempts() {
    let addr = stub_server(|mut sock| async move {
        read_header(&mut sock).await;
        sock.write_all(b"ClamAV 1.3.1/27300/Mon Jan  1 00:00:00 2024\n")
            .await
            .unwrap();
    })
    .await;

    let opts = Options::tcp(addr);
    let connector = FlakyConnector {
        failures: AtomicU32::new(2),
        inner: Dialer::new(&opts).unwrap(),
    };
    let clamd = Clamd::builder()
        .max_retries(4)
        .retry_backoff(Duration::from_millis(1), Duration::from_millis(4))
        .build_with_connector(connector)
        .unwrap();

    let reply = clamd.version().await.unwrap();
    assert!(reply.raw.starts_with("ClamAV"));
    assert_eq!(reply.attempts, 3);
}

/// Retry exhaustion surfaces the dial error.
#[tokio::test]
async fn test_retry_exhaustion() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let clamd = Clamd::builder()
        .tcp(addr)
        .max_retries(2)
        .retry_backoff(Duration::from_millis(1), Duration::from_millis(2))
        .build()
        .unwrap();

    let err = clamd.stats().await.unwrap_err();
    assert!(matches!(
        err,
        ClamdError::Transport {
            stage: TransportStage::Dial,
            ..
        }
    ));
}

/// Cancelling mid-call returns promptly and closes the socket.
#[tokio::test]
async fn test_cancel_closes_connection() {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let addr = stub_server(move |mut sock| {
        let events_tx = events_tx.clone();
        async move {
            read_header(&mut sock).await;
            events_tx.send("received").unwrap();
            // Never answer; wait until the client goes away.
            let mut rest = Vec::new();
            let _ = sock.read_to_end(&mut rest).await;
            events_tx.send("closed").unwrap();
        }
    })
    .await;

    let interrupt = Interrupt::new();
    let clamd = Clamd::builder()
        .tcp(addr)
        .read_timeout(Duration::from_secs(3600))
        .build()
        .unwrap()
        .with_interrupt(interrupt.clone());

    let call = tokio::spawn(async move { clamd.reload().await });

    assert_eq!(events_rx.recv().await, Some("received"));
    interrupt.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), call)
        .await
        .expect("call should return promptly")
        .unwrap();
    assert!(matches!(result, Err(ClamdError::Cancelled)));

    let closed = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
        .await
        .expect("server should see the connection close");
    assert_eq!(closed, Some("closed"));
}

/// Independent calls run concurrently, each on its own connection.
#[tokio::test]
async fn test_concurrent_calls() {
    let connections = Arc::new(AtomicU32::new(0));
    let counter = connections.clone();

    let addr = stub_server(move |mut sock| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            read_header(&mut sock).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            sock.write_all(b"PONG\n").await.unwrap();
        }
    })
    .await;

    let clamd = client(addr);
    let calls: Vec<_> = (0..8)
        .map(|_| {
            let clamd = clamd.clone();
            tokio::spawn(async move { clamd.ping().await })
        })
        .collect();

    for call in calls {
        assert_eq!(call.await.unwrap().unwrap().attempts, 1);
    }
    assert_eq!(connections.load(Ordering::SeqCst), 8);
}

/// Unix socket transport.
#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_version() {
    use tokio::net::UnixListener;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clamd.sock");
    let listener = UnixListener::bind(&path).unwrap();

    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        assert_eq!(read_header(&mut sock).await, b"nVERSION\n");
        sock.write_all(b"ClamAV 1.3.1\n").await.unwrap();
    });

    let clamd = Clamd::builder()
        .unix(path.to_string_lossy().into_owned())
        .build()
        .unwrap();

    let reply = clamd.version().await.unwrap();
    assert_eq!(reply.raw, "ClamAV 1.3.1\n");
}

/// Options parsed from JSON drive a working client.
#[tokio::test]
async fn test_client_from_json_options() {
    let addr = stub_server(|mut sock| async move {
        assert_eq!(read_header(&mut sock).await, b"nVERSIONCOMMANDS\n");
        sock.write_all(b"ClamAV 1.3.1| COMMANDS: SCAN PING\n")
            .await
            .unwrap();
    })
    .await;

    let opts = Options::from_json(&format!(
        r#"{{"network": "tcp", "address": "{addr}", "max_retries": 1}}"#
    ))
    .unwrap();
    let clamd = Clamd::new(opts).unwrap();

    let reply = clamd.version_commands().await.unwrap();
    assert!(reply.raw.contains("COMMANDS"));
}

/// The connect hook sees every dialed connection.
#[tokio::test]
async fn test_on_connect_hook() {
    let addr = stub_server(|mut sock| async move {
        read_header(&mut sock).await;
        sock.write_all(b"PONG\n").await.unwrap();
    })
    .await;

    let dials = Arc::new(AtomicU32::new(0));
    let counter = dials.clone();
    let clamd = Clamd::builder()
        .tcp(addr)
        .on_connect(move |conn| {
            assert_eq!(conn.network(), Network::Tcp);
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    clamd.ping().await.unwrap();
    clamd.ping().await.unwrap();
    assert_eq!(dials.load(Ordering::SeqCst), 2);
}

/// Multi-megabyte INSTREAM payloads arrive intact over a real socket.
#[tokio::test]
async fn test_instream_large_payload() {
    let addr = stub_server(|mut sock| async move {
        read_header(&mut sock).await;
        let mut decoder = ChunkBuffer::new();
        let mut received = 0usize;
        let mut chunks = 0usize;
        let mut buf = vec![0u8; 64 * 1024];
        while !decoder.is_finished() {
            let n = sock.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed mid-stream");
            for chunk in decoder.push(&buf[..n]).unwrap() {
                received += chunk.payload().len();
                chunks += 1;
            }
        }
        sock.write_all(format!("stream: {received} {chunks} OK\0").as_bytes())
            .await
            .unwrap();
    })
    .await;

    let payload = vec![0xa5u8; 8 * 1024 * 1024];
    let reply = client(addr).instream(&payload).await.unwrap();

    // 8192 data chunks of 1 KiB plus the terminator.
    assert_eq!(reply.raw, "stream: 8388608 8193 OK\0");
}
