//! End-to-end layering tests over localhost sockets.

use std::io;

use futures_util::{SinkExt, StreamExt};
use lumen_transport::{SaslCodec, SaslStep, SaslVerifier, TransportStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

async fn pair() -> (TransportStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (TransportStream::new(server), client)
}

#[tokio::test]
async fn plain_round_trip() {
    let (mut server, mut client) = pair().await;

    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    server.write_all(b"pong").await.unwrap();
    server.flush().await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
}

#[tokio::test]
async fn cork_holds_bytes_until_flush() {
    let (mut server, mut client) = pair().await;

    server.set_auto_flush(false).await.unwrap();
    server.write_all(b"abc").await.unwrap();
    server.writev(&[b"de", b"f"]).await.unwrap();

    // Nothing may arrive while corked.
    let probe = tokio::time::timeout(
        std::time::Duration::from_millis(100),
        client.read(&mut [0u8; 8]),
    )
    .await;
    assert!(probe.is_err(), "corked bytes leaked early");

    server.flush().await.unwrap();
    let mut buf = [0u8; 6];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"abcdef");
}

#[tokio::test]
async fn vectored_write_on_plain_layer() {
    let (mut server, mut client) = pair().await;
    assert!(server.supports_writev());
    server
        .writev(&[b"one-", b"two-", b"three"])
        .await
        .unwrap();
    let mut buf = [0u8; 13];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"one-two-three");
}

#[tokio::test]
async fn non_websocket_bytes_are_replayed_after_sniff() {
    let (mut server, mut client) = pair().await;

    client.write_all(b"LNK\0rest-of-link").await.unwrap();
    let detected = server.detect_websocket().await.unwrap();
    assert!(!detected);
    assert!(!server.is_websocket());

    let mut buf = [0u8; 16];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"LNK\0rest-of-link");
}

#[tokio::test]
async fn websocket_client_is_detected_and_framed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client_task = tokio::spawn(async move {
        let tcp = TcpStream::connect(addr).await.unwrap();
        let (mut ws, _) = tokio_tungstenite::client_async(format!("ws://{addr}/"), tcp)
            .await
            .unwrap();
        ws.send(Message::Binary(b"hello-ws".to_vec())).await.unwrap();
        match ws.next().await.unwrap().unwrap() {
            Message::Binary(data) => assert_eq!(data, b"reply"),
            other => panic!("unexpected frame: {other:?}"),
        }
    });

    let (tcp, _) = listener.accept().await.unwrap();
    let mut server = TransportStream::new(tcp);
    assert!(server.detect_websocket().await.unwrap());
    assert!(server.is_websocket());
    assert!(!server.supports_writev());

    let mut buf = [0u8; 8];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello-ws");
    server.write_all(b"reply").await.unwrap();
    server.flush().await.unwrap();

    client_task.await.unwrap();
}

/// A toy mechanism: single step, expects `user\0pass`, negotiates an SSF
/// of 64 with a rolling XOR codec. Enough to exercise the wire FSM and
/// the privacy-layer plumbing.
struct TestVerifier {
    ok: bool,
}

struct XorCodec {
    key: u8,
}

impl SaslCodec for XorCodec {
    fn encode(&mut self, plain: &[u8]) -> Vec<u8> {
        plain.iter().map(|b| b ^ self.key).collect()
    }

    fn decode(&mut self, wire: &[u8]) -> io::Result<Vec<u8>> {
        Ok(wire.iter().map(|b| b ^ self.key).collect())
    }
}

impl SaslVerifier for TestVerifier {
    fn mechanisms(&self) -> &str {
        "PLAIN,SCRAM-TEST"
    }

    fn start(&mut self, mechanism: &str, data: Option<&[u8]>) -> SaslStep {
        if mechanism == "PLAIN" && data == Some(b"user\0pass".as_slice()) {
            self.ok = true;
            SaslStep::Done(Vec::new())
        } else {
            SaslStep::Failed
        }
    }

    fn step(&mut self, _data: Option<&[u8]>) -> SaslStep {
        SaslStep::Failed
    }

    fn negotiated_ssf(&self) -> u32 {
        64
    }

    fn take_codec(&mut self) -> Option<Box<dyn SaslCodec>> {
        self.ok.then(|| Box::new(XorCodec { key: 0x5a }) as Box<dyn SaslCodec>)
    }
}

async fn client_read_u32(client: &mut TcpStream) -> u32 {
    let mut b = [0u8; 4];
    client.read_exact(&mut b).await.unwrap();
    u32::from_le_bytes(b)
}

#[tokio::test]
async fn sasl_negotiation_installs_privacy_layer() {
    let (mut server, mut client) = pair().await;

    let server_task = tokio::spawn(async move {
        let mut verifier = TestVerifier { ok: false };
        let outcome = server.start_sasl(&mut verifier).await.unwrap();
        assert_eq!(outcome.ssf, 64);
        assert!(outcome.privacy_layer);
        assert!(server.has_privacy_layer());
        assert!(!server.supports_writev());

        // Application traffic after negotiation flows through the codec.
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"secret");
        server.write_all(b"shh").await.unwrap();
        server.flush().await.unwrap();
    });

    // Mechanism list.
    let len = client_read_u32(&mut client).await;
    let mut list = vec![0u8; len as usize];
    client.read_exact(&mut list).await.unwrap();
    assert_eq!(list, b"PLAIN,SCRAM-TEST");

    // Select PLAIN and send the single step (wire carries a trailing NUL).
    client.write_all(&5u32.to_le_bytes()).await.unwrap();
    client.write_all(b"PLAIN").await.unwrap();
    let payload = b"user\0pass\0";
    client
        .write_all(&(payload.len() as u32).to_le_bytes())
        .await
        .unwrap();
    client.write_all(payload).await.unwrap();

    // Server answers: empty data, completion marker, accept word.
    assert_eq!(client_read_u32(&mut client).await, 0);
    let mut one = [0u8; 1];
    client.read_exact(&mut one).await.unwrap();
    assert_eq!(one[0], 1);
    assert_eq!(client_read_u32(&mut client).await, 0);

    // Speak through the XOR codec from the client side.
    let encoded: Vec<u8> = b"secret".iter().map(|b| b ^ 0x5a).collect();
    client.write_all(&encoded).await.unwrap();
    let mut reply = [0u8; 3];
    client.read_exact(&mut reply).await.unwrap();
    let decoded: Vec<u8> = reply.iter().map(|b| b ^ 0x5a).collect();
    assert_eq!(decoded, b"shh");

    server_task.await.unwrap();
}

#[tokio::test]
async fn weak_ssf_over_plain_tcp_is_rejected() {
    struct WeakVerifier;
    impl SaslVerifier for WeakVerifier {
        fn mechanisms(&self) -> &str {
            "PLAIN"
        }
        fn start(&mut self, _m: &str, _d: Option<&[u8]>) -> SaslStep {
            SaslStep::Done(Vec::new())
        }
        fn step(&mut self, _d: Option<&[u8]>) -> SaslStep {
            SaslStep::Failed
        }
        fn negotiated_ssf(&self) -> u32 {
            0
        }
        fn take_codec(&mut self) -> Option<Box<dyn SaslCodec>> {
            None
        }
    }

    let (mut server, mut client) = pair().await;
    let server_task = tokio::spawn(async move {
        let err = server.start_sasl(&mut WeakVerifier).await.unwrap_err();
        assert!(matches!(
            err,
            lumen_transport::TransportError::SaslWeakSsf { ssf: 0 }
        ));
    });

    let len = client_read_u32(&mut client).await;
    let mut list = vec![0u8; len as usize];
    client.read_exact(&mut list).await.unwrap();
    client.write_all(&5u32.to_le_bytes()).await.unwrap();
    client.write_all(b"PLAIN").await.unwrap();
    client.write_all(&0u32.to_le_bytes()).await.unwrap();

    // Empty server data, completion marker, then the reject word.
    assert_eq!(client_read_u32(&mut client).await, 0);
    let mut one = [0u8; 1];
    client.read_exact(&mut one).await.unwrap();
    assert_eq!(one[0], 1);
    assert_eq!(client_read_u32(&mut client).await, 1);

    server_task.await.unwrap();
}
