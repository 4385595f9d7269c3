//! Endpoint Module Tests
//!
//! Validates the framing codec and the lifecycle of the framed TCP endpoint.
//!
//! ## Test Scopes
//! - **Framing**: round-trips, clean EOF detection, oversize rejection.
//! - **Endpoint**: connect/accept event pairing, payload delivery, drop
//!   semantics for dead connections.

#[cfg(test)]
mod tests {
    use crate::endpoint::endpoint::{Endpoint, EndpointEvent};
    use crate::endpoint::framing::{read_frame, write_frame, MAX_FRAME_BYTES};
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<EndpointEvent>,
    ) -> EndpointEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for endpoint event")
            .expect("event channel closed")
    }

    // ============================================================
    // FRAMING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_frame(&mut a, b"hello").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        write_frame(&mut a, &[0xde, 0xad, 0xbe, 0xef]).await.unwrap();

        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"hello");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"");
        assert_eq!(
            read_frame(&mut b).await.unwrap().unwrap(),
            vec![0xde, 0xad, 0xbe, 0xef]
        );
    }

    #[tokio::test]
    async fn test_frame_clean_eof() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        write_frame(&mut a, b"last").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"last");
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_frame_truncated_is_error() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(4096);

        // Announce 100 bytes but deliver only 3.
        a.write_u32(100).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);

        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn test_frame_oversize_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(4096);

        a.write_u32(MAX_FRAME_BYTES as u32 + 1).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());

        let big = vec![0u8; MAX_FRAME_BYTES + 1];
        let (mut c, _d) = tokio::io::duplex(4096);
        assert!(write_frame(&mut c, &big).await.is_err());
    }

    // ============================================================
    // ENDPOINT TESTS
    // ============================================================

    #[tokio::test]
    async fn test_endpoint_connect_and_payload() {
        let (server, mut server_rx) = Endpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (client, mut client_rx) = Endpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let conn = client.handle().connect(vec![server.local_addr()]);
        // Queued before the socket is up; must still be delivered.
        client.handle().send(conn, b"ping".to_vec());

        match next_event(&mut client_rx).await {
            EndpointEvent::Opened { conn: c, outbound, .. } => {
                assert_eq!(c, conn);
                assert!(outbound);
            }
            other => panic!("expected Opened, got {:?}", other),
        }

        let server_conn = match next_event(&mut server_rx).await {
            EndpointEvent::Opened { conn, outbound, .. } => {
                assert!(!outbound);
                conn
            }
            other => panic!("expected Opened, got {:?}", other),
        };

        match next_event(&mut server_rx).await {
            EndpointEvent::Payload { conn, bytes } => {
                assert_eq!(conn, server_conn);
                assert_eq!(bytes, b"ping");
            }
            other => panic!("expected Payload, got {:?}", other),
        }

        // Reply in the other direction.
        server.handle().send(server_conn, b"pong".to_vec());
        match next_event(&mut client_rx).await {
            EndpointEvent::Payload { conn: c, bytes } => {
                assert_eq!(c, conn);
                assert_eq!(bytes, b"pong");
            }
            other => panic!("expected Payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_endpoint_close_reaches_peer() {
        let (server, mut server_rx) = Endpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let (client, mut client_rx) = Endpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let conn = client.handle().connect(vec![server.local_addr()]);

        match next_event(&mut client_rx).await {
            EndpointEvent::Opened { .. } => {}
            other => panic!("expected Opened, got {:?}", other),
        }
        let server_conn = match next_event(&mut server_rx).await {
            EndpointEvent::Opened { conn, .. } => conn,
            other => panic!("expected Opened, got {:?}", other),
        };

        // Closing locally emits no local event but the peer sees Closed.
        client.handle().close(conn);
        match next_event(&mut server_rx).await {
            EndpointEvent::Closed { conn } => assert_eq!(conn, server_conn),
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_endpoint_failed_connect_emits_closed() {
        let (client, mut client_rx) = Endpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        // Nothing listens here; bind-then-drop guarantees a refused port.
        let dead = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };

        let conn = client.handle().connect(vec![dead]);
        match next_event(&mut client_rx).await {
            EndpointEvent::Closed { conn: c } => assert_eq!(c, conn),
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_endpoint_send_to_unknown_is_dropped() {
        use crate::endpoint::endpoint::ConnId;

        let (client, mut client_rx) = Endpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        client.handle().send(ConnId(4242), b"nobody home".to_vec());
        match next_event(&mut client_rx).await {
            EndpointEvent::Dropped { conn } => assert_eq!(conn, ConnId(4242)),
            other => panic!("expected Dropped, got {:?}", other),
        }
    }
}
