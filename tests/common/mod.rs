// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use eddy::{Dispatcher, StreamSocket};

use std::net::{Ipv4Addr, SocketAddrV4};

/// Initializes colored logging once per test binary; the filter comes from
/// `RUST_LOG` when set.
pub fn init_logging() {
    let _ = flexi_logger::Logger::with_env_or_str("warn").start();
}

/// Establishes a connected loopback socket pair on `disp`, closing the
/// ephemeral listener behind it.
pub fn socket_pair(disp: &Dispatcher) -> (StreamSocket, StreamSocket) {
    let listener = StreamSocket::listener(
        disp,
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
        4,
    )
    .unwrap();
    let addr = listener.local_endpoint().unwrap();

    let client = StreamSocket::new(disp).unwrap();
    let connected = client.connect(addr);
    let server = disp.wait(listener.accept()).unwrap();
    disp.wait(connected).unwrap();

    disp.run(async move { listener.close().await }).unwrap();
    (client, server)
}
