// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use eddy::{
    websocket::{handshake, serve, CloseInitiator, CloseReason, ClosingData},
    Bytes, Dispatcher, Fail, Message, StreamSocket, Websocket,
};

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

mod common;

use common::*;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

fn ok_reason() -> CloseReason {
    CloseReason {
        code: 1000,
        reason: "OK".to_string(),
    }
}

/// Runs the opening handshake over a fresh loopback pair and wraps both ends.
fn websocket_pair(disp: &Dispatcher) -> (Websocket, Websocket) {
    let (client_sock, server_sock) = socket_pair(disp);

    let acceptor = server_sock.clone();
    let server_task =
        disp.spawn(async move { handshake::server_handshake(&acceptor, None, None).await });
    let initiator = client_sock.clone();
    let subprotocol = disp
        .run(async move {
            handshake::client_handshake(&initiator, "localhost", "/chat", None, None).await
        })
        .unwrap();
    assert!(subprotocol.is_none());
    let (path, negotiated) = disp.wait(server_task).unwrap();
    assert_eq!(path, "/chat");
    assert!(negotiated.is_none());

    let client = Websocket::new(disp, client_sock, false, true, 10);
    let server = Websocket::new(disp, server_sock, true, false, 10);
    (client, server)
}

/// Client closes with 1000 "OK"; the server observes a remote-initiated
/// closure carrying that reason, the client sees its own close acknowledged.
fn close_pair(disp: &Dispatcher, client: Websocket, server: Websocket) {
    let server_task = disp.spawn({
        let server = server.clone();
        async move {
            match server.recv().await {
                Err(Fail::WebsocketClosed {}) => (),
                other => panic!("expected closure, got {:?}", other),
            }
            server.close(CLOSE_TIMEOUT, ok_reason()).await
        }
    });

    let client_data = disp
        .run({
            let client = client.clone();
            async move { client.close(CLOSE_TIMEOUT, ok_reason()).await }
        })
        .unwrap();
    let server_data = disp.wait(server_task).unwrap();

    assert_eq!(
        server_data,
        ClosingData {
            initiator: CloseInitiator::ByRemote,
            response: None,
            reason: Some(ok_reason()),
        }
    );
    assert_eq!(client_data.initiator, CloseInitiator::ByLocal);
    assert_eq!(client_data.reason, Some(ok_reason()));
    assert_eq!(client_data.response, Some(ok_reason()));
}

//==============================================================================
// Data Frames
//==============================================================================

/// A single masked text frame arrives exactly once.
#[test]
fn single_text_frame() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let (client, server) = websocket_pair(&disp);

    let got = disp
        .run({
            let client = client.clone();
            let server = server.clone();
            async move {
                client.send(Message::Text("hello".to_string())).await?;
                server.recv().await
            }
        })
        .unwrap();
    assert_eq!(got, Message::Text("hello".to_string()));

    close_pair(&disp, client, server);
}

/// A 10,000-byte binary message splits into fragments of at most 4,096 bytes
/// and reassembles to the exact original payload.
#[test]
fn fragmented_binary_message() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let (client, server) = websocket_pair(&disp);

    let payload = Bytes::from_vec((0..10_000u32).map(|i| (i % 251) as u8).collect());
    let got = disp
        .run({
            let client = client.clone();
            let server = server.clone();
            let payload = payload.clone();
            async move {
                client.send(Message::Binary(payload)).await?;
                server.recv().await
            }
        })
        .unwrap();
    assert_eq!(got, Message::Binary(payload));

    close_pair(&disp, client, server);
}

/// Concurrent sends appear on the wire in call order.
#[test]
fn sends_are_serialized() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let (client, server) = websocket_pair(&disp);

    let sender = client.clone();
    let sends = disp.spawn(async move {
        let (a, b, c, d) = futures::join!(
            sender.send(Message::Text("msg-0".to_string())),
            sender.send(Message::Text("msg-1".to_string())),
            sender.send(Message::Text("msg-2".to_string())),
            sender.send(Message::Text("msg-3".to_string())),
        );
        a.and(b).and(c).and(d)
    });

    let received = disp
        .run({
            let server = server.clone();
            async move {
                let mut received = Vec::new();
                for _ in 0..4 {
                    received.push(server.recv().await?);
                }
                Ok(received)
            }
        })
        .unwrap();
    let expected: Vec<Message> = (0..4)
        .map(|index| Message::Text(format!("msg-{}", index)))
        .collect();
    assert_eq!(received, expected);
    disp.wait(sends).unwrap();

    close_pair(&disp, client, server);
}

//==============================================================================
// Control Frames
//==============================================================================

/// A ping resolves once the peer's pong comes back.
#[test]
fn ping_pong() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let (client, server) = websocket_pair(&disp);

    disp.run({
        let client = client.clone();
        async move { client.ping(Bytes::from(&b"ping-1"[..])).await }
    })
    .unwrap();

    close_pair(&disp, client, server);
}

/// A payload of exactly the receiver's size cap is accepted.
#[test]
fn max_size_boundary_accepted() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let (client, server) = websocket_pair(&disp);
    server.set_max_size(1024);

    let payload = Bytes::from_vec(vec![7u8; 1024]);
    let got = disp
        .run({
            let client = client.clone();
            let server = server.clone();
            let payload = payload.clone();
            async move {
                client.send(Message::Binary(payload)).await?;
                server.recv().await
            }
        })
        .unwrap();
    assert_eq!(got, Message::Binary(payload));

    close_pair(&disp, client, server);
}

/// A frame over the receiver's size cap fails the connection with 1009.
#[test]
fn oversize_payload_rejected() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let (client, server) = websocket_pair(&disp);
    server.set_max_size(1024);

    let server_task = disp.spawn({
        let server = server.clone();
        async move {
            match server.recv().await {
                Err(Fail::WebsocketClosed {}) => (),
                other => panic!("expected closure, got {:?}", other),
            }
            server.close(CLOSE_TIMEOUT, ok_reason()).await
        }
    });

    let client_data = disp
        .run({
            let client = client.clone();
            async move {
                client
                    .send(Message::Binary(Bytes::from_vec(vec![0u8; 2000])))
                    .await?;
                match client.recv().await {
                    Err(Fail::WebsocketClosed {}) => (),
                    other => panic!("expected closure, got {:?}", other),
                }
                client.close(CLOSE_TIMEOUT, ok_reason()).await
            }
        })
        .unwrap();
    let server_data = disp.wait(server_task).unwrap();

    assert_eq!(server_data.initiator, CloseInitiator::ByError);
    assert_eq!(server_data.reason.unwrap().code, 1009);
    assert_eq!(client_data.initiator, CloseInitiator::ByRemote);
    assert_eq!(client_data.reason.unwrap().code, 1009);
}

//==============================================================================
// Handshake
//==============================================================================

/// Subprotocol negotiation picks a protocol both sides support.
#[test]
fn subprotocol_negotiation() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let (client_sock, server_sock) = socket_pair(&disp);

    let acceptor = server_sock.clone();
    let server_task = disp.spawn(async move {
        handshake::server_handshake(&acceptor, None, Some(&["chat", "echo"])).await
    });
    let negotiated = disp
        .run({
            let client_sock = client_sock.clone();
            async move {
                handshake::client_handshake(
                    &client_sock,
                    "localhost",
                    "/",
                    Some("http://localhost"),
                    Some(&["chat"]),
                )
                .await
            }
        })
        .unwrap();
    let (_, server_protocol) = disp.wait(server_task).unwrap();

    assert_eq!(negotiated, Some("chat".to_string()));
    assert_eq!(server_protocol, Some("chat".to_string()));

    disp.run(async move { client_sock.close().await }).unwrap();
    disp.run(async move { server_sock.close().await }).unwrap();
}

/// A request that is not a WebSocket upgrade is refused.
#[test]
fn handshake_rejects_plain_http() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let (client_sock, server_sock) = socket_pair(&disp);

    let acceptor = server_sock.clone();
    let server_task =
        disp.spawn(async move { handshake::server_handshake(&acceptor, None, None).await });

    let result = disp.run({
        let client_sock = client_sock.clone();
        async move {
            client_sock
                .send(Bytes::from(
                    "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
                ))
                .await?;
            Ok(())
        }
    });
    result.unwrap();

    let handshake_result = disp.wait(server_task);
    assert_eq!(
        handshake_result,
        Err(Fail::Handshake {
            details: "missing websocket upgrade"
        })
    );

    disp.run({
        let client_sock = client_sock.clone();
        async move { client_sock.close().await }
    })
    .unwrap();
    disp.run(async move { server_sock.close().await }).unwrap();
}

//==============================================================================
// Server Loop
//==============================================================================

/// The accept-handshake-spawn loop serves an echoing connection end to end.
#[test]
fn serve_echo_connection() {
    init_logging();
    let disp = Dispatcher::new().unwrap();

    let listener =
        StreamSocket::listener(&disp, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 4).unwrap();
    let addr = listener.local_endpoint().unwrap();

    let loop_disp = disp.clone();
    let server_loop = disp.spawn({
        let listener = listener.clone();
        async move {
            serve(&loop_disp, listener, |websocket, _path| async move {
                loop {
                    match websocket.recv().await {
                        Ok(message) => websocket.send(message).await?,
                        Err(Fail::WebsocketClosed {}) => break,
                        Err(error) => return Err(error),
                    }
                }
                websocket.close(CLOSE_TIMEOUT, ok_reason()).await?;
                Ok(())
            })
            .await
        }
    });

    let client_sock = StreamSocket::new(&disp).unwrap();
    disp.wait(client_sock.connect(addr)).unwrap();
    disp.run({
        let client_sock = client_sock.clone();
        async move {
            handshake::client_handshake(&client_sock, "localhost", "/echo", None, None).await
        }
    })
    .unwrap();

    let client = Websocket::new(&disp, client_sock, false, true, 10);
    let reply = disp
        .run({
            let client = client.clone();
            async move {
                client.send(Message::Text("marco".to_string())).await?;
                client.recv().await
            }
        })
        .unwrap();
    assert_eq!(reply, Message::Text("marco".to_string()));

    disp.run({
        let client = client.clone();
        async move {
            client.close(CLOSE_TIMEOUT, ok_reason()).await?;
            Ok(())
        }
    })
    .unwrap();

    listener.force_close(Fail::QueueClosed {});
    disp.wait(server_loop).unwrap();
}
