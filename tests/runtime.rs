// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use eddy::{
    cell::yield_low,
    streams::{ReadWrapper, StreamFd, HIGH_WATERMARK, LOW_WATERMARK},
    Dispatcher,
};

use nix::unistd;

use std::{cell::RefCell, rc::Rc, time::Duration};

mod common;

use common::*;

//==============================================================================
// Timers
//==============================================================================

/// Two interleaved sleeps complete in deadline order, whatever number of
/// low-priority yields runs in between.
#[test]
fn sleep_ordering() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let order = Rc::new(RefCell::new(Vec::new()));

    let log = order.clone();
    let timer = disp.clone();
    let slow = disp.spawn(async move {
        timer.sleep(Duration::from_millis(100)).await?;
        log.borrow_mut().push("slow");
        Ok(())
    });

    let log = order.clone();
    let timer = disp.clone();
    let fast = disp.spawn(async move {
        timer.sleep(Duration::from_millis(50)).await?;
        log.borrow_mut().push("fast");
        Ok(())
    });

    let yielder = disp.clone();
    let noise = disp.spawn(async move {
        for _ in 0..32 {
            yield_low(&yielder).await;
        }
        Ok(())
    });

    disp.wait(slow).unwrap();
    disp.wait(fast).unwrap();
    disp.wait(noise).unwrap();
    assert_eq!(*order.borrow(), vec!["fast", "slow"]);
}

/// `run` drives a task to completion and hands back its value.
#[test]
fn run_returns_value() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let timer = disp.clone();
    let value = disp
        .run(async move {
            timer.sleep(Duration::from_millis(1)).await?;
            Ok(40 + 2)
        })
        .unwrap();
    assert_eq!(value, 42);
}

//==============================================================================
// Poller
//==============================================================================

/// Recreating the poller preserves live registrations: a buffered reader
/// keeps receiving across a reset.
#[test]
fn poller_reset_preserves_registrations() {
    init_logging();
    let disp = Dispatcher::new().unwrap();
    let (rx, tx) = unistd::pipe().unwrap();
    let reader =
        ReadWrapper::new(&disp, StreamFd::new(rx), LOW_WATERMARK, HIGH_WATERMARK).unwrap();

    unistd::write(tx, b"before").unwrap();
    let block = disp.wait(reader.read(6)).unwrap();
    assert_eq!(block, b"before"[..]);

    disp.reset_poller().unwrap();

    unistd::write(tx, b"after").unwrap();
    let block = disp.wait(reader.read(5)).unwrap();
    assert_eq!(block, b"after"[..]);

    reader.release();
    unistd::close(rx).unwrap();
    unistd::close(tx).unwrap();
}
