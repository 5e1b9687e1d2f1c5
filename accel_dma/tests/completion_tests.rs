//! Completion state machine tests against a fabric with per-segment latency.

mod common;

use std::time::{Duration, Instant};

use accel_dma::sim::SimChannel;
use accel_dma::{
    CompletionState, Endpoint, EndpointConfig, Error, Outcome, RecvStatus, SendStatus,
    TransferChannel,
};

use common::{bound, bound_with_config, pattern, region, slow_fabric};

const SEGMENT_LATENCY: Duration = Duration::from_millis(2);
const SEGMENTS: usize = 20;
const SEG: usize = 64;

fn rank(status: RecvStatus) -> u8 {
    match status {
        RecvStatus::NotStarted => 0,
        RecvStatus::NotFinished => 1,
        _ => 2,
    }
}

#[test]
fn test_recv_states_are_monotonic() {
    let fabric = slow_fabric(SEGMENT_LATENCY);
    let (sender, _) = bound(&fabric, 1);
    let (receiver, receiver_addr) = bound(&fabric, 2);

    let src = region(&sender, SEG * SEGMENTS);
    unsafe { src.write_bytes(0, &pattern(SEG * SEGMENTS)) };
    let dst = region(&receiver, 2 * SEG * SEGMENTS);

    receiver.track_put(dst.addr(), 2 * SEG * SEGMENTS).unwrap();
    sender
        .scatter_put(receiver_addr, dst.addr(), src.addr(), SEG, SEG, SEGMENTS)
        .unwrap();

    let mut observed = vec![receiver.poll_recv()];
    let deadline = Instant::now() + Duration::from_secs(10);
    while !observed.last().unwrap().is_terminal() {
        assert!(Instant::now() < deadline, "transfer never completed");
        let status = receiver.poll_recv();
        if Some(&status) != observed.last() {
            observed.push(status);
        }
    }

    assert!(observed.windows(2).all(|w| rank(w[0]) < rank(w[1])));
    assert!(observed.contains(&RecvStatus::NotFinished));
    assert_eq!(observed.last(), Some(&RecvStatus::Success));
    assert_eq!(sender.wait_send(), SendStatus::Success);
}

#[test]
fn test_terminal_poll_is_idempotent() {
    let fabric = slow_fabric(Duration::ZERO);
    let (ep, addr) = bound(&fabric, 1);
    let buf = region(&ep, 128);

    ep.track_put(buf.addr_at(64), 64).unwrap();
    ep.put(addr, buf.addr_at(64), buf.addr(), 64).unwrap();
    assert_eq!(ep.wait_recv(), RecvStatus::Success);

    for _ in 0..1000 {
        assert_eq!(ep.poll_recv(), RecvStatus::Success);
    }
    // Puts outside the tracked range do not disturb the resolved slot.
    ep.put(addr, buf.addr(), buf.addr_at(64), 32).unwrap();
    ep.fence().unwrap();
    assert_eq!(ep.poll_recv(), RecvStatus::Success);
    assert_eq!(
        ep.channel().recv_state(),
        CompletionState::Done(Outcome::Success)
    );
}

#[test]
fn test_wait_falls_back_to_blocking() {
    let fabric = slow_fabric(SEGMENT_LATENCY);
    let config = EndpointConfig::default()
        .with_spin_bound(0)
        .with_block_timeout(Duration::from_millis(500));
    let (sender, _) = bound_with_config(&fabric, 1, config.clone());
    let (receiver, receiver_addr) = bound_with_config(&fabric, 2, config);

    let src = region(&sender, SEG * SEGMENTS);
    let dst = region(&receiver, SEG * SEGMENTS);
    unsafe { src.write_bytes(0, &pattern(SEG * SEGMENTS)) };

    receiver.track_put(dst.addr(), SEG * SEGMENTS).unwrap();
    sender
        .gather_put(receiver_addr, dst.addr(), src.addr(), SEG, 0, SEGMENTS)
        .unwrap();
    assert_eq!(sender.poll_send(), SendStatus::NotFinished);

    let start = Instant::now();
    assert_eq!(receiver.wait_recv(), RecvStatus::Success);
    assert_eq!(sender.wait_send(), SendStatus::Success);
    assert!(start.elapsed() >= SEGMENT_LATENCY);
    unsafe { assert_eq!(dst.read_bytes(0, SEG * SEGMENTS), src.read_bytes(0, SEG * SEGMENTS)) };
}

#[test]
fn test_send_status_before_any_issue() {
    let fabric = slow_fabric(Duration::ZERO);
    let (ep, _) = bound(&fabric, 1);
    assert_eq!(ep.poll_send(), SendStatus::Success);
    assert_eq!(ep.wait_send_with(0), SendStatus::Success);
    ep.fence().unwrap();
}

#[test]
fn test_rearm_after_terminal() {
    let fabric = slow_fabric(Duration::ZERO);
    let (ep, addr) = bound(&fabric, 1);
    let buf = region(&ep, 64);

    for round in 0..3u8 {
        unsafe { buf.write(0, round) };
        ep.track_put(buf.addr_at(32), 32).unwrap();
        assert_eq!(ep.poll_recv(), RecvStatus::NotStarted);
        ep.put(addr, buf.addr_at(32), buf.addr(), 1).unwrap();
        assert_eq!(ep.wait_recv(), RecvStatus::Success);
        assert_eq!(unsafe { buf.read::<u8>(32) }, round);
    }
}

/// Spin until the armed receive has been admitted and is copying.
fn wait_until_pending(ep: &Endpoint<SimChannel>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while ep.poll_recv() != RecvStatus::NotFinished {
        assert!(Instant::now() < deadline, "transfer never started");
        std::hint::spin_loop();
    }
}

#[test]
fn test_unbind_while_pending_resolves_no_route() {
    let fabric = slow_fabric(SEGMENT_LATENCY);
    let (sender, _) = bound(&fabric, 1);
    let (receiver, receiver_addr) = bound(&fabric, 2);

    let src = region(&sender, SEG * SEGMENTS);
    let dst = region(&receiver, SEG * SEGMENTS);
    receiver.track_put(dst.addr(), SEG * SEGMENTS).unwrap();
    sender
        .gather_put(receiver_addr, dst.addr(), src.addr(), SEG, 0, SEGMENTS)
        .unwrap();

    wait_until_pending(&receiver);
    receiver.unbind().unwrap();
    assert_eq!(receiver.wait_recv(), RecvStatus::NoRoute);

    // The copy already in progress finishes without reopening the slot.
    assert_eq!(sender.wait_send(), SendStatus::Success);
    assert_eq!(receiver.poll_recv(), RecvStatus::NoRoute);
    assert_eq!(
        receiver.channel().recv_state(),
        CompletionState::Done(Outcome::NoRoute)
    );

    // Rebinding starts a clean cycle.
    receiver.bind(receiver_addr).unwrap();
    receiver.track_put(dst.addr(), SEG * SEGMENTS).unwrap();
    sender.put(receiver_addr, dst.addr(), src.addr(), SEG).unwrap();
    assert_eq!(receiver.wait_recv(), RecvStatus::Success);
    assert_eq!(sender.wait_send(), SendStatus::Success);
}

#[test]
fn test_unbind_request_while_pending_resolves_no_route() {
    let fabric = slow_fabric(SEGMENT_LATENCY);
    let config = EndpointConfig::default()
        .with_spin_bound(0)
        .with_block_timeout(Duration::from_millis(5));
    let (sender, _) = bound(&fabric, 1);
    let (receiver, receiver_addr) = bound_with_config(&fabric, 2, config);

    let src = region(&sender, SEG * SEGMENTS);
    let dst = region(&receiver, SEG * SEGMENTS);
    receiver.track_put(dst.addr(), SEG * SEGMENTS).unwrap();
    sender
        .gather_put(receiver_addr, dst.addr(), src.addr(), SEG, 0, SEGMENTS)
        .unwrap();

    wait_until_pending(&receiver);
    receiver.unbind_handle().unbind();
    assert_eq!(receiver.wait_recv(), RecvStatus::NoRoute);
    assert_eq!(receiver.local_address(), None);
    assert_eq!(sender.wait_send(), SendStatus::Success);
    assert_eq!(receiver.poll_recv(), RecvStatus::NoRoute);
}

#[test]
fn test_dropping_fabric_resolves_queued_commands() {
    const QUEUED: usize = 8;

    let fabric = slow_fabric(SEGMENT_LATENCY);
    let (ep, addr) = bound(&fabric, 1);
    let src = region(&ep, SEG * SEGMENTS);
    let dst = region(&ep, SEG * SEGMENTS);

    // One slow transfer keeps the engine busy while the rest queue behind it.
    ep.track_put(dst.addr(), SEG * SEGMENTS).unwrap();
    ep.gather_put(addr, dst.addr(), src.addr(), SEG, 0, SEGMENTS)
        .unwrap();
    wait_until_pending(&ep);
    for i in 0..QUEUED {
        ep.put(addr, dst.addr_at(i * SEG), src.addr_at(i * SEG), SEG)
            .unwrap();
    }
    assert_eq!(ep.poll_send(), SendStatus::NotFinished);

    drop(fabric);

    assert_eq!(ep.wait_send(), SendStatus::NoRoute);
    // The transfer that was executing still delivered.
    assert_eq!(ep.wait_recv(), RecvStatus::Success);
    assert!(matches!(ep.put(addr, dst.addr(), src.addr(), SEG), Err(Error::Disconnected)));
}
