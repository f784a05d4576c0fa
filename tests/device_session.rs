//! Exercises the reactor, wire codec and device session together against
//! an in-process loopback TCP listener standing in for a real device.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tuya_reactor::codec::{self, CMD_CONTROL, CMD_DP_QUERY};
use tuya_reactor::device::{Device, State};
use tuya_reactor::{Config, Loop};

const KEY: [u8; 16] = *b"0123456789abcdef";

fn run_until(loop_handle: &Loop, timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !done() {
        loop_handle.run_once(Duration::from_millis(50)).unwrap();
        assert!(Instant::now() < deadline, "condition never became true within timeout");
    }
}

#[test]
fn device_connects_queries_dps_and_completes_a_command() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let mut buf = vec![0u8; 4096];

        // Answer the initial DP_QUERY the session sends right after connect.
        let n = stream.read(&mut buf).unwrap();
        let (query, _) = codec::parse_one(&buf[..n], &KEY, true).unwrap();
        assert_eq!(query.cmd, CMD_DP_QUERY);
        let reply = codec::Message::new(query.seq_no, CMD_DP_QUERY, serde_json::json!({"dps": {"1": false}}));
        stream.write_all(&codec::serialize(&reply, &KEY, true)).unwrap();

        // Answer the set_on control command that follows.
        let n = stream.read(&mut buf).unwrap();
        let (control, _) = codec::parse_one(&buf[..n], &KEY, true).unwrap();
        assert_eq!(control.cmd, CMD_CONTROL);
        assert_eq!(control.data["dps"]["1"], serde_json::json!(true));
        let ack = codec::Message::new(control.seq_no, CMD_CONTROL, serde_json::Value::Null);
        stream.write_all(&codec::serialize(&ack, &KEY, true)).unwrap();
    });

    let loop_handle = Loop::new().unwrap();
    let config = Arc::new(Config::default());
    let dev = Device::spawn(
        loop_handle.clone(),
        addr,
        "gw1".to_string(),
        "dev1".to_string(),
        KEY,
        config,
        Some("test lamp".to_string()),
    );

    run_until(&loop_handle, Duration::from_secs(5), || dev.borrow().state() == State::Idle);
    assert_eq!(dev.borrow().is_on(), Ok(false));

    let result = Rc::new(std::cell::RefCell::new(None));
    let result_handle = result.clone();
    Device::set_on(&dev, true, move |r| {
        *result_handle.borrow_mut() = Some(r);
    })
    .unwrap();

    run_until(&loop_handle, Duration::from_secs(5), || result.borrow().is_some());
    assert!(matches!(&*result.borrow(), Some(Ok(_))));

    server.join().unwrap();
}

#[test]
fn a_second_command_is_rejected_while_one_is_in_flight() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = vec![0u8; 4096];
        // Accept the DP_QUERY but never reply — the caller only needs the
        // session to reach `Awaiting`, not `Idle`, for this test.
        let _ = stream.read(&mut buf).unwrap();
    });

    let loop_handle = Loop::new().unwrap();
    let config = Arc::new(Config::default());
    let dev = Device::spawn(
        loop_handle.clone(),
        addr,
        "gw1".to_string(),
        "dev1".to_string(),
        KEY,
        config,
        None,
    );

    run_until(&loop_handle, Duration::from_secs(5), || dev.borrow().state() == State::Awaiting);

    let result = Device::set_on(&dev, true, |_| panic!("callback should not run"));
    assert!(matches!(result, Err(tuya_reactor::DeviceError::Busy)));

    server.join().unwrap();
}
