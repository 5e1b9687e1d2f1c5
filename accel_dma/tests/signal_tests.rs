//! Unbinding from a real signal handler.
//!
//! Each test owns one signal and one handle slot, since handlers are
//! process-wide.

use std::fmt;
use std::os::unix::thread::JoinHandleExt;
use std::sync::OnceLock;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use accel_dma::sim::{Fabric, SimChannel};
use accel_dma::{EndpointAddress, EndpointConfig, FabricConfig, RecvStatus, UnbindHandle};
use nix::sys::pthread::pthread_kill;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, raise, sigaction};
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

const SERVER_PORT: u16 = 1000;
const HANG_LIMIT: Duration = Duration::from_secs(5);

static WAITING_SERVER: OnceLock<UnbindHandle<SimChannel>> = OnceLock::new();
static ARMING_SERVER: OnceLock<UnbindHandle<SimChannel>> = OnceLock::new();

extern "C" fn unbind_waiting_server(_: libc::c_int) {
    if let Some(handle) = WAITING_SERVER.get() {
        handle.unbind();
    }
}

extern "C" fn unbind_arming_server(_: libc::c_int) {
    if let Some(handle) = ARMING_SERVER.get() {
        handle.unbind();
    }
}

fn install(signal: Signal, handler: extern "C" fn(libc::c_int)) {
    let action = SigAction::new(
        SigHandler::Handler(handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(signal, &action) }.unwrap();
}

fn server_config() -> EndpointConfig {
    EndpointConfig::default()
        .with_spin_bound(0)
        .with_block_timeout(Duration::from_millis(5))
}

#[test]
fn test_signal_unbinds_blocked_server() {
    let fabric = Fabric::new(FabricConfig::default()).unwrap();
    let server = fabric.endpoint_with_config(server_config());
    server.bind(EndpointAddress::local(SERVER_PORT)).unwrap();
    assert!(WAITING_SERVER.set(server.unbind_handle()).is_ok());
    install(Signal::SIGUSR1, unbind_waiting_server);

    let (armed_tx, armed_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    let server_thread = thread::spawn(move || {
        server.track_immediate().unwrap();
        armed_tx.send(()).unwrap();
        let status = server.wait_recv();
        done_tx.send((status, server.local_address())).unwrap();
    });

    armed_rx.recv().unwrap();
    thread::sleep(Duration::from_millis(20));
    pthread_kill(server_thread.as_pthread_t(), Signal::SIGUSR1).unwrap();

    let (status, addr) = done_rx.recv_timeout(HANG_LIMIT).expect("server hung");
    assert_eq!(status, RecvStatus::NoRoute);
    assert_eq!(addr, None);
    server_thread.join().unwrap();
    assert_eq!(fabric.bound_count(), 0);
}

/// Raises `SIGUSR2` on the calling thread when arming is logged, which happens
/// while the binding lock is held.
struct RaiseWhileArming;

struct ArmedEvent(bool);

impl Visit for ArmedEvent {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" && format!("{:?}", value) == "armed receive tracking" {
            self.0 = true;
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for RaiseWhileArming {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut armed = ArmedEvent(false);
        event.record(&mut armed);
        if armed.0 {
            raise(Signal::SIGUSR2).unwrap();
        }
    }
}

#[test]
fn test_signal_during_arm_does_not_deadlock() {
    let fabric = Fabric::new(FabricConfig::default()).unwrap();
    let server = fabric.endpoint_with_config(server_config());
    let addr = EndpointAddress::local(SERVER_PORT);
    server.bind(addr).unwrap();
    assert!(ARMING_SERVER.set(server.unbind_handle()).is_ok());
    install(Signal::SIGUSR2, unbind_arming_server);

    let (done_tx, done_rx) = mpsc::channel();
    let server_thread = thread::spawn(move || {
        let subscriber = tracing_subscriber::registry().with(RaiseWhileArming);
        let armed = tracing::subscriber::with_default(subscriber, || server.track_immediate());
        // The handler ran inside arm; the unbind is still pending here.
        let bound_after_arm = server.local_address();
        let status = server.wait_recv();
        done_tx
            .send((armed.is_ok(), bound_after_arm, status, server.local_address()))
            .unwrap();
    });

    let (armed, bound_after_arm, status, bound_after_wait) =
        done_rx.recv_timeout(HANG_LIMIT).expect("server hung");
    assert!(armed);
    assert_eq!(bound_after_arm, Some(addr));
    assert_eq!(status, RecvStatus::NoRoute);
    assert_eq!(bound_after_wait, None);
    server_thread.join().unwrap();
}
