//! Loopback tests of the full stack against local plain and TLS servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use super::{ClientConfig, ClientConfigBuilder, EngineMode, RetryPolicy, TcpClient};
use crate::core::{ClientError, ConnectErrorKind, TlsError};
use crate::events::{Event, InlineDispatch};
use crate::framing::{ByteOrder, DelimiterFramer, LengthPrefixedFramer, LengthWidth, TpduFramer};
use crate::tls::{TlsOptions, spki_pin};
use crate::transport::ConnectionState;

const MODES: [EngineMode; 2] = [EngineMode::Blocking, EngineMode::NonBlocking];

struct TestCert {
    der: CertificateDer<'static>,
    key: Vec<u8>,
}

fn test_cert(names: &[&str]) -> TestCert {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let params = rcgen::CertificateParams::new(names).unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    TestCert {
        der: cert.der().clone(),
        key: key_pair.serialize_der(),
    }
}

fn roots_for(cert: &TestCert) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.add(cert.der.clone()).unwrap();
    roots
}

async fn echo<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) {
    let mut buf = vec![0u8; 4096];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn plain_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(echo(stream));
        }
    });
    addr
}

async fn tls_echo_server(cert: &TestCert) -> SocketAddr {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key.clone()));
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert.der.clone()], key)
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    echo(tls).await;
                }
            });
        }
    });
    addr
}

/// Accepts connections, reads one chunk, then hangs up or stalls.
async fn misbehaving_server(hang_up: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                if !hang_up {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
            });
        }
    });
    addr
}

fn builder(addr: SocketAddr, mode: EngineMode) -> ClientConfigBuilder {
    ClientConfig::builder("127.0.0.1", addr.port())
        .mode(mode)
        .dispatch(InlineDispatch)
        .retry(RetryPolicy::disabled())
}

fn iso_request() -> Vec<u8> {
    let mut payload = b"0800".to_vec();
    payload.extend_from_slice(&[0x82, 0x20, 0, 0, 0, 0, 0, 0]);
    payload.extend_from_slice(b"00000001");
    payload
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_plain_exchange() {
    let addr = plain_echo_server().await;
    for mode in MODES {
        let client = TcpClient::new(builder(addr, mode).build().unwrap()).unwrap();
        client.connect().await.unwrap();
        assert!(client.is_ready(), "{mode:?}");

        let request = iso_request();
        for _ in 0..3 {
            let response = client.send_and_receive(&request).await.unwrap();
            assert_eq!(response.payload(), &request[..], "{mode:?}");
            assert_eq!(response.remote_addr(), Some(addr));
        }

        let metrics = client.metrics();
        assert_eq!(metrics.requests, 3);
        assert_eq!(metrics.bytes_sent, 3 * (request.len() as u64 + 2));
        assert_eq!(metrics.bytes_received, metrics.bytes_sent);
        client.close().await.unwrap();
        assert!(client.is_closed());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_delimiter_and_tpdu_framing() {
    let addr = plain_echo_server().await;
    for mode in MODES {
        let delimited = builder(addr, mode)
            .framer(DelimiterFramer::new(0x03))
            .build()
            .unwrap();
        let client = TcpClient::new(delimited).unwrap();
        client.connect().await.unwrap();
        let response = client.send_and_receive(b"hello").await.unwrap();
        assert_eq!(response.payload(), b"hello");
        client.close().await.unwrap();

        let tpdu =
            TpduFramer::new([0x60, 0x00, 0x03, 0x00, 0x00], LengthWidth::Two, ByteOrder::BigEndian)
                .unwrap();
        let client = TcpClient::new(builder(addr, mode).framer(tpdu).build().unwrap()).unwrap();
        client.connect().await.unwrap();
        let response = client.send_and_receive(&iso_request()).await.unwrap();
        assert_eq!(response.payload(), &iso_request()[..]);
        client.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tls_exchange_with_pin() {
    let cert = test_cert(&["127.0.0.1"]);
    let addr = tls_echo_server(&cert).await;
    let pin = spki_pin(&cert.der).unwrap();

    for mode in MODES {
        let tls = TlsOptions::enabled()
            .roots(roots_for(&cert))
            .pins([pin.clone()]);
        let client = TcpClient::new(builder(addr, mode).tls(tls).build().unwrap()).unwrap();
        client.connect().await.unwrap();

        let request = iso_request();
        let response = client.send_and_receive(&request).await.unwrap();
        assert_eq!(response.payload(), &request[..], "{mode:?}");
        let again = client.send_and_receive(b"second").await.unwrap();
        assert_eq!(again.payload(), b"second");
        client.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tls_pin_mismatch_is_rejected() {
    let cert = test_cert(&["127.0.0.1"]);
    let addr = tls_echo_server(&cert).await;
    let wrong_pin = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

    for mode in MODES {
        let tls = TlsOptions::enabled()
            .roots(roots_for(&cert))
            .pins([wrong_pin]);
        let client = TcpClient::new(
            builder(addr, mode)
                .tls(tls)
                .retry(RetryPolicy::default())
                .build()
                .unwrap(),
        )
        .unwrap();
        let err = client.connect().await.unwrap_err();
        assert!(
            matches!(err, ClientError::Tls(TlsError::PinningMismatch)),
            "{mode:?}: {err}"
        );
        assert_eq!(err.connect_kind(), ConnectErrorKind::TlsPinningMismatch);
        assert!(!client.is_connected());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tls_hostname_check() {
    let cert = test_cert(&["localhost"]);
    let addr = tls_echo_server(&cert).await;

    for mode in MODES {
        let strict = TlsOptions::enabled().roots(roots_for(&cert));
        let client = TcpClient::new(builder(addr, mode).tls(strict).build().unwrap()).unwrap();
        let err = client.connect().await.unwrap_err();
        assert!(
            matches!(err, ClientError::Tls(TlsError::HostnameMismatch(_))),
            "{mode:?}: {err}"
        );

        let relaxed = TlsOptions::enabled()
            .roots(roots_for(&cert))
            .verify_hostname(false);
        let client = TcpClient::new(builder(addr, mode).tls(relaxed).build().unwrap()).unwrap();
        client.connect().await.unwrap();
        assert_eq!(client.send_and_receive(b"ok").await.unwrap().payload(), b"ok");
        client.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_untrusted_certificate_is_rejected() {
    let served = test_cert(&["127.0.0.1"]);
    let other = test_cert(&["127.0.0.1"]);
    let addr = tls_echo_server(&served).await;

    for mode in MODES {
        let tls = TlsOptions::enabled().roots(roots_for(&other));
        let client = TcpClient::new(builder(addr, mode).tls(tls).build().unwrap()).unwrap();
        let err = client.connect().await.unwrap_err();
        assert!(
            matches!(err, ClientError::Tls(TlsError::Unverified(_))),
            "{mode:?}: {err}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    for mode in MODES {
        let client = TcpClient::new(builder(addr, mode).build().unwrap()).unwrap();
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.connect_kind(), ConnectErrorKind::ConnectionRefused, "{mode:?}");
        assert!(client.is_disconnected());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_hang_up_disconnects() {
    let addr = misbehaving_server(true).await;
    for mode in MODES {
        let states = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&states);
        let config = builder(addr, mode)
            .listener(move |event: &Event| {
                if let Event::StateChanged { state, .. } = event {
                    seen.lock().push(*state);
                }
            })
            .build()
            .unwrap();
        let client = TcpClient::new(config).unwrap();
        client.connect().await.unwrap();
        assert!(client.is_connected());

        let err = client.send_and_receive(b"ping").await.unwrap_err();
        assert!(err.is_transport_failure(), "{mode:?}: {err}");
        assert!(client.is_disconnected());
        assert!(!client.is_connected());
        assert!(client.last_disconnect_time().is_some());

        let states = states.lock().clone();
        let error_at = states
            .iter()
            .rposition(|s| *s == ConnectionState::Error)
            .unwrap_or_else(|| panic!("{mode:?}: no Error state in {states:?}"));
        assert_eq!(states[error_at + 1..], [ConnectionState::Disconnected], "{mode:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_peer_times_out() {
    let addr = misbehaving_server(false).await;
    for mode in MODES {
        let client = TcpClient::new(builder(addr, mode).build().unwrap()).unwrap();
        client.connect().await.unwrap();

        let err = client
            .send_and_receive_with_timeout(b"ping", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RequestTimeout(_)), "{mode:?}: {err}");
        client.close().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_frames_round_trip() {
    let cert = test_cert(&["127.0.0.1"]);
    let plain = plain_echo_server().await;
    let secure = tls_echo_server(&cert).await;
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

    for mode in MODES {
        for (addr, tls) in [
            (plain, TlsOptions::disabled()),
            (secure, TlsOptions::enabled().roots(roots_for(&cert))),
        ] {
            let secured = tls.enabled;
            let config = builder(addr, mode)
                .framer(LengthPrefixedFramer::new(
                    LengthWidth::Four,
                    ByteOrder::BigEndian,
                    false,
                ))
                .tls(tls)
                .build()
                .unwrap();
            let client = TcpClient::new(config).unwrap();
            client.connect().await.unwrap();

            for _ in 0..2 {
                let response = client
                    .send_and_receive_with_timeout(&payload, Duration::from_secs(10))
                    .await
                    .unwrap_or_else(|e| panic!("{mode:?} tls={secured}: {e}"));
                assert_eq!(response.payload().len(), payload.len());
                assert!(response.payload() == &payload[..], "{mode:?} tls={secured}");
            }
            client.close().await.unwrap();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_handshake_times_out() {
    let addr = misbehaving_server(false).await;
    let cert = test_cert(&["127.0.0.1"]);
    let handshake = Duration::from_millis(400);

    for mode in MODES {
        let config = builder(addr, mode)
            .tls(TlsOptions::enabled().roots(roots_for(&cert)))
            .handshake_timeout(handshake)
            .build()
            .unwrap();
        let client = TcpClient::new(config).unwrap();

        let connecting = client.clone();
        let attempt = tokio::spawn(async move { connecting.connect().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        // TCP is up but the handshake has not finished.
        assert!(client.is_connected(), "{mode:?}");
        assert!(!client.is_ready(), "{mode:?}");

        let started = std::time::Instant::now();
        let err = attempt.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::HandshakeTimeout(_)), "{mode:?}: {err}");
        assert_eq!(err.connect_kind(), ConnectErrorKind::HandshakeTimeout);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!client.is_connected());
    }
}
