// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use eddy::{Bytes, Dispatcher, Fail, StreamSocket};

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    time::Duration,
};

mod common;

use common::*;

//==============================================================================
// Connect
//==============================================================================

/// A connection is established over loopback and closed cleanly from both
/// ends.
#[test]
fn connect_and_close() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let (client, server) = socket_pair(&disp);

    disp.run({
        let client = client.clone();
        async move { client.close().await }
    })
    .unwrap();
    disp.run({
        let server = server.clone();
        async move { server.close().await }
    })
    .unwrap();
}

/// Connecting to a port nobody listens on is refused.
#[test]
fn connect_refused() {
    init_logging();
    let disp = Dispatcher::new().unwrap();

    // Grab an ephemeral port, then free it again.
    let probe = StreamSocket::listener(&disp, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 1).unwrap();
    let addr = probe.local_endpoint().unwrap();
    disp.run(async move { probe.close().await }).unwrap();

    let client = StreamSocket::new(&disp).unwrap();
    let result = disp.wait(client.connect(addr));
    assert_eq!(result, Err(Fail::ConnectionRefused {}));
}

//==============================================================================
// Send & Recv
//==============================================================================

/// Data echoes through a connected pair.
#[test]
fn echo_round_trip() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let (client, server) = socket_pair(&disp);

    let peer = server.clone();
    let echo = disp.spawn(async move {
        let data = peer.recv(5).await?;
        peer.send(data).await?;
        Ok(())
    });

    let reply = disp
        .run({
            let client = client.clone();
            async move {
                client.send(Bytes::from(&b"hello"[..])).await?;
                client.recv(5).await
            }
        })
        .unwrap();
    assert_eq!(reply, b"hello"[..]);
    disp.wait(echo).unwrap();

    disp.run({
        let client = client.clone();
        async move { client.close().await }
    })
    .unwrap();
    disp.run(async move { server.close().await }).unwrap();
}

/// A 10-byte receive spanning sends of 3, 4, and 3 bytes completes once the
/// full amount has arrived.
#[test]
fn recv_spans_chunked_sends() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let (client, server) = socket_pair(&disp);

    let pacer = disp.clone();
    let peer = client.clone();
    let feeder = disp.spawn(async move {
        for chunk in &[&b"abc"[..], &b"defg"[..], &b"hij"[..]] {
            peer.send(Bytes::from(*chunk)).await?;
            pacer.sleep(Duration::from_millis(2)).await?;
        }
        Ok(())
    });

    let block = disp.wait(server.recv(10)).unwrap();
    assert_eq!(block, b"abcdefghij"[..]);
    disp.wait(feeder).unwrap();

    disp.run({
        let client = client.clone();
        async move { client.close().await }
    })
    .unwrap();
    disp.run(async move { server.close().await }).unwrap();
}

//==============================================================================
// Teardown
//==============================================================================

/// A peer disappearing fails the pending receive with stream closure.
#[test]
fn peer_close_fails_pending_recv() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let (client, server) = socket_pair(&disp);

    let pending = server.recv(4);
    disp.run(async move { client.close().await }).unwrap();

    let result = disp.wait(pending);
    assert_eq!(result, Err(Fail::StreamClosed {}));

    disp.run(async move { server.close().await }).unwrap();
}

/// Sockets dropped without an explicit close still fail their pending
/// operations and balance every dispatcher registration; the dispatcher's
/// own drop asserts that nothing leaked.
#[test]
fn drop_without_close_releases_registrations() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let (client, server) = socket_pair(&disp);

    let pending = server.recv(4);
    drop(client);
    drop(server);

    let result = disp.wait(pending);
    assert_eq!(
        result,
        Err(Fail::InterruptedTransfer {
            details: "socket dropped"
        })
    );
}

/// A listener dropped with an accept in flight fails it and leaves no
/// registration behind.
#[test]
fn listener_drop_releases_registrations() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let listener =
        StreamSocket::listener(&disp, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 4).unwrap();

    let pending = listener.accept();
    drop(listener);

    let result = disp.wait(pending);
    assert_eq!(
        result,
        Err(Fail::InterruptedTransfer {
            details: "socket dropped"
        })
    );
}

/// Force-closing cancels pending operations with the supplied error.
#[test]
fn force_close_cancels_pending() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let (client, server) = socket_pair(&disp);

    let pending = client.recv(4);
    client.force_close(Fail::InterruptedTransfer {
        details: "torn down",
    });
    assert_eq!(
        disp.wait(pending),
        Err(Fail::InterruptedTransfer {
            details: "torn down"
        })
    );

    disp.run(async move { server.close().await }).unwrap();
}
