//! Clock synchronization against a loopback time server

use castsink_io::{DatagramSocket, ManualClock};
use castsink_protocol::ntp::{NtpPacket, NtpTimestamp, NTP_MODE_SERVER, NTP_VERSION};
use castsink_protocol::{ClockState, ClockSync, ClockSyncConfig, SyncError};
use castsink_tests::{spawn_time_server, spawn_time_server_script};
use proptest::prelude::*;
use std::net::UdpSocket;
use std::time::Duration;

// 1/64 s: exact in both microseconds and NTP fixed point
const U: i64 = 15_625;
const WALL: i64 = 1_000_000_000;

fn loopback_config(port: u16) -> ClockSyncConfig {
    ClockSyncConfig {
        port,
        timeout: Duration::from_secs(2),
        batch_spacing: Duration::ZERO,
    }
}

#[test]
fn test_exchange_over_loopback() {
    let (addr, server) = spawn_time_server(1, 8 * U, 10 * U).unwrap();
    let clock = ManualClock::new(5_000_000, WALL);
    let sync = ClockSync::with_clock(clock.clone(), loopback_config(addr.port()));

    let state = sync.request_time("127.0.0.1").unwrap();
    server.join().unwrap().unwrap();

    // The manual clock does not move during the exchange, so the local
    // round trip is zero and the server's 2U of processing goes negative.
    assert_eq!(state.round_trip.as_micros(), -2 * U);
    assert_eq!(state.offset.as_micros(), 9 * U);
    assert_eq!(state.reference_local_us, 5_000_000);

    assert!(sync.is_synchronized());
    assert_eq!(sync.adjust_time_us(5_000_000).unwrap(), WALL + 9 * U);
    assert_eq!(sync.adjust_time_us(5_000_001).unwrap(), WALL + 9 * U + 1);

    clock.advance(Duration::from_millis(250));
    assert_eq!(sync.remote_now_us().unwrap(), WALL + 9 * U + 250_000);
}

#[test]
fn test_failed_exchange_keeps_previous_state() {
    let (addr, server) = spawn_time_server(1, 8 * U, 10 * U).unwrap();
    let sync = ClockSync::with_clock(ManualClock::new(0, WALL), loopback_config(addr.port()));
    let before = sync.request_time("127.0.0.1").unwrap();
    server.join().unwrap().unwrap();

    // A bound socket that never answers
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = silent.local_addr().unwrap().port();
    let socket = DatagramSocket::connect("127.0.0.1", port).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();

    let err = sync.exchange(&socket).unwrap_err();
    assert!(matches!(err, SyncError::TransportError(_)));
    assert_eq!(sync.state(), Some(before));
    drop(silent);
}

#[test]
fn test_short_response_is_malformed() {
    let server = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = server.local_addr().unwrap().port();
    let responder = std::thread::spawn(move || {
        let mut buf = [0u8; 64];
        let (_, peer) = server.recv_from(&mut buf).unwrap();
        server.send_to(&[0x1c; 20], peer).unwrap();
    });

    let sync = ClockSync::with_clock(ManualClock::new(0, WALL), loopback_config(port));
    let err = sync.request_time("127.0.0.1").unwrap_err();
    responder.join().unwrap();

    assert!(matches!(err, SyncError::MalformedResponse(_)));
    assert!(!sync.is_synchronized());
}

#[test]
fn test_repeated_exchange_replaces_state() {
    let (addr, server) = spawn_time_server(2, 8 * U, 10 * U).unwrap();
    let clock = ManualClock::new(0, WALL);
    let sync = ClockSync::with_clock(clock.clone(), loopback_config(addr.port()));

    let first = sync.request_time("127.0.0.1").unwrap();
    clock.advance_us(64 * U);
    let second = sync.request_time("127.0.0.1").unwrap();
    server.join().unwrap().unwrap();

    assert_eq!(first.offset, second.offset);
    assert_eq!(second.reference_local_us, 64 * U);
    assert_eq!(sync.state(), Some(second));
}

#[test]
fn test_batch_averages_shortest_round_trips() {
    // Round trip is rx - tx and offset (rx + tx) / 2 while the clock stands still
    let (addr, server) = spawn_time_server_script(vec![
        Some((8 * U, 10 * U)),
        Some((10 * U, 10 * U)),
        Some((3 * U, 9 * U)),
        Some((18 * U, 22 * U)),
        Some((0, 0)),
        Some((30 * U, 30 * U)),
    ])
    .unwrap();
    let sync = ClockSync::with_clock(ManualClock::new(0, WALL), loopback_config(addr.port()));

    let state = sync.request_time_best_of("127.0.0.1", 6).unwrap();
    server.join().unwrap().unwrap();

    // Best third: offsets 6U and 20U
    assert_eq!(state.round_trip.as_micros(), -6 * U);
    assert_eq!(state.offset.as_micros(), 13 * U);
    assert_eq!(sync.state(), Some(state));
    assert_eq!(sync.adjust_time_us(0).unwrap(), WALL + 13 * U);
}

#[test]
fn test_batch_survives_unanswered_request() {
    let (addr, server) =
        spawn_time_server_script(vec![Some((8 * U, 10 * U)), None, Some((8 * U, 10 * U))])
            .unwrap();
    let mut config = loopback_config(addr.port());
    config.timeout = Duration::from_millis(200);
    let sync = ClockSync::with_clock(ManualClock::new(0, WALL), config);

    let state = sync.request_time_best_of("127.0.0.1", 3).unwrap();
    server.join().unwrap().unwrap();

    assert_eq!(state.offset.as_micros(), 9 * U);
    assert!(sync.is_synchronized());
}

#[test]
fn test_batch_without_answers_fails() {
    let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut config = loopback_config(silent.local_addr().unwrap().port());
    config.timeout = Duration::from_millis(50);
    let sync = ClockSync::with_clock(ManualClock::new(0, WALL), config);

    let err = sync.request_time_best_of("127.0.0.1", 3).unwrap_err();
    assert!(matches!(err, SyncError::TransportError(_)));
    assert!(!sync.is_synchronized());
    drop(silent);
}

fn response(originate: NtpTimestamp, rx_us: i64, tx_us: i64) -> NtpPacket {
    NtpPacket {
        leap: 0,
        version: NTP_VERSION,
        mode: NTP_MODE_SERVER,
        stratum: 2,
        originate,
        receive: NtpTimestamp::from_unix_micros(rx_us),
        transmit: NtpTimestamp::from_unix_micros(tx_us),
    }
}

proptest! {
    #[test]
    fn prop_adjust_time_strictly_increasing(
        wall in 1_000_000_000_000_000i64..2_000_000_000_000_000,
        server_skew in -10_000_000i64..10_000_000,
        rtt in 0i64..500_000,
        processing in 0i64..1_000,
        a in 0i64..1_000_000_000,
        step in 1i64..1_000_000,
    ) {
        let request_ntp = NtpTimestamp::from_unix_micros(wall);
        let rx = wall + server_skew + rtt / 2;
        let packet = response(request_ntp, rx, rx + processing);
        let state = ClockState::from_exchange(request_ntp, 0, rtt + processing, &packet);

        let t1 = state.adjust_time_us(a);
        let t2 = state.adjust_time_us(a + step);
        prop_assert!(t2 > t1);
        prop_assert_eq!(t2 - t1, step);
    }
}
