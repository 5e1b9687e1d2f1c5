//! Transport test programs, run against the simulated fabric.
//!
//! Each scenario returns `Ok(())` or the first failing check. Checks are
//! tagged with a stage number; a failing status is reported packed into the
//! exit code as `stage | status code`.

use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use accel_dma::sim::{Access, Fabric, MemoryRegion, SimChannel};
use accel_dma::{Endpoint, EndpointAddress, Error, RecvStatus, SendStatus, UnbindHandle};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use shm_barrier::Barrier;
use tracing::{debug, info};

const INT: usize = size_of::<i32>();

/// First failing check of a scenario.
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    #[error("check {stage:#x} got status code {status}")]
    Status { stage: u32, status: u32 },
    #[error("check {stage:#x}: {detail}")]
    Check { stage: u32, detail: String },
    #[error(transparent)]
    Dma(#[from] Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

impl Failure {
    fn check(stage: u32, detail: impl Into<String>) -> Self {
        Self::Check {
            stage,
            detail: detail.into(),
        }
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        let code = match self {
            Self::Status { stage, status } => stage | status,
            Self::Check { stage, .. } => *stage,
            Self::Dma(Error::PageFault) => 0x80 | SendStatus::PageFault.code(),
            Self::Dma(Error::Nack) => 0x80 | SendStatus::Nack.code(),
            Self::Dma(Error::NoRoute) => 0x80 | SendStatus::NoRoute.code(),
            Self::Dma(_) | Self::Io(_) | Self::Panicked(_) => 0xff,
        };
        // Exit statuses are eight bits; keep a failure from wrapping to zero.
        match code as u8 {
            0 => 0xff,
            code => code,
        }
    }
}

fn expect_recv(status: RecvStatus, stage: u32) -> Result<(), Failure> {
    match status {
        RecvStatus::Success => Ok(()),
        other => Err(Failure::Status {
            stage,
            status: other.code(),
        }),
    }
}

fn expect_send(status: SendStatus, expected: SendStatus, stage: u32) -> Result<(), Failure> {
    if status == expected {
        Ok(())
    } else {
        Err(Failure::Status {
            stage,
            status: status.code(),
        })
    }
}

fn region(ep: &Endpoint<SimChannel>, len: usize) -> Result<MemoryRegion, Failure> {
    Ok(ep.channel().alloc_region(len, Access::all())?)
}

fn bind(fabric: &Fabric, port: u16) -> Result<(Endpoint<SimChannel>, EndpointAddress), Failure> {
    let ep = fabric.endpoint();
    let addr = EndpointAddress::local(port);
    ep.bind(addr)?;
    Ok((ep, addr))
}

// ============================================================================
// simple
// ============================================================================

/// Immediate to self, then a one-segment gather into a tracked buffer.
pub fn simple(fabric: &Fabric) -> Result<(), Failure> {
    const ARR_SIZE: usize = 64;
    const COPY_SIZE: usize = 32;
    const SRC_OFF: usize = 3;
    const DST_OFF: usize = 8;
    const PORT: u16 = 16;
    const IMMEDIATE: u64 = 108;

    let (ep, addr) = bind(fabric, PORT)?;
    let src_values: Vec<i32> = (0x10..0x10 + ARR_SIZE as i32).collect();
    let src = region(&ep, ARR_SIZE * INT)?;
    // Nothing has been issued yet.
    unsafe { src.write_slice(0, &src_values) };
    let dst = region(&ep, ARR_SIZE * INT)?;

    ep.track_immediate()?;
    let status = ep.poll_recv();
    if status != RecvStatus::NotStarted {
        return Err(Failure::Status {
            stage: 0,
            status: status.code(),
        });
    }

    ep.send_immediate(addr, IMMEDIATE)?;
    expect_recv(ep.wait_recv(), 0x10)?;
    match ep.read_immediate() {
        Some(IMMEDIATE) => {}
        other => return Err(Failure::check(0x20, format!("immediate was {:?}", other))),
    }
    match ep.read_source_address() {
        Some(source) if source.port == PORT => {}
        other => return Err(Failure::check(0x30, format!("source was {:?}", other))),
    }

    ep.track_put(dst.addr(), ARR_SIZE * INT)?;
    ep.gather_put(
        addr,
        dst.addr_at(DST_OFF * INT),
        src.addr_at(SRC_OFF * INT),
        COPY_SIZE * INT,
        0,
        1,
    )?;
    expect_recv(ep.wait_recv(), 0x40)?;
    ep.fence()?;

    let copied = DST_OFF..DST_OFF + COPY_SIZE;
    // Fenced above.
    let wrong = unsafe { dst.read_slice::<i32>(0, ARR_SIZE) }
        .iter()
        .enumerate()
        .filter(|&(i, &v)| {
            let expected = if copied.contains(&i) {
                src_values[i - DST_OFF + SRC_OFF]
            } else {
                0
            };
            v != expected
        })
        .count();
    if wrong > 0 {
        return Err(Failure::check(0x01, format!("{} words differ", wrong)));
    }

    info!("simple: ok");
    Ok(())
}

// ============================================================================
// error
// ============================================================================

/// Page fault with translation disabled, then a put to an unbound port.
pub fn error(fabric: &Fabric) -> Result<(), Failure> {
    const PORT: u16 = 100;
    const UNBOUND_PORT: u16 = 102;
    const WORDS: usize = 12;

    let (ep, addr) = bind(fabric, PORT)?;

    ep.channel().set_translation(false);
    match ep.put(addr, 0, 0, 1024) {
        Ok(()) | Err(Error::PageFault) => {}
        Err(e) => return Err(e.into()),
    }
    expect_send(ep.wait_send(), SendStatus::PageFault, 0x10)?;
    ep.channel().set_translation(true);

    let src = region(&ep, WORDS * INT)?;
    let dst = region(&ep, WORDS * INT)?;
    ep.put(
        EndpointAddress::local(UNBOUND_PORT),
        dst.addr(),
        src.addr(),
        WORDS * INT,
    )?;
    expect_send(ep.wait_send(), SendStatus::NoRoute, 0x20)?;

    info!("error: ok");
    Ok(())
}

// ============================================================================
// matrix
// ============================================================================

/// Placement of an `m`x`m` submatrix inside an `n`x`n` row-major matrix.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub n: usize,
    pub m: usize,
    pub row: usize,
    pub col: usize,
}

impl Layout {
    /// Reject placements outside the matrix and matrices whose entries do not
    /// fit in an `i32` index.
    fn validate(&self) -> Result<(), Failure> {
        let fits = |start: usize| start.checked_add(self.m).is_some_and(|end| end <= self.n);
        if self.m == 0 || !fits(self.row) || !fits(self.col) {
            return Err(Failure::check(
                0x01,
                format!("submatrix {:?} does not fit", self),
            ));
        }
        let cells = self
            .n
            .checked_mul(self.n)
            .filter(|&cells| i32::try_from(cells).is_ok() && cells.checked_mul(INT).is_some());
        if cells.is_none() {
            return Err(Failure::check(
                0x02,
                format!("{0}x{0} matrix is too large", self.n),
            ));
        }
        Ok(())
    }

    fn start_offset(&self) -> usize {
        (self.row * self.n + self.col) * INT
    }

    fn seg_size(&self) -> usize {
        self.m * INT
    }

    fn stride(&self) -> usize {
        (self.n - self.m) * INT
    }

    fn sub_len(&self) -> usize {
        self.m * self.m * INT
    }

    /// Entries of the submatrix of `mat_a` that differ from `mat_b`.
    ///
    /// # Safety
    /// No transfer may be in flight on either matrix.
    unsafe fn mismatches(&self, mat_a: &MemoryRegion, mat_b: &MemoryRegion) -> usize {
        let mut errors = 0;
        for i in 0..self.m {
            for j in 0..self.m {
                let a: i32 = unsafe { mat_a.read(((self.row + i) * self.n + self.col + j) * INT) };
                let b: i32 = unsafe { mat_b.read((i * self.m + j) * INT) };
                if a != b {
                    errors += 1;
                }
            }
        }
        errors
    }
}

const MASTER_PORT: u16 = 100;
const SLAVE_PORT: u16 = 101;

/// `n`x`n` matrix holding each entry's index. `n` has been validated.
fn identity_matrix(ep: &Endpoint<SimChannel>, n: usize) -> Result<MemoryRegion, Failure> {
    let cells = i32::try_from(n * n)
        .map_err(|_| Failure::check(0x02, format!("{0}x{0} matrix is too large", n)))?;
    let values: Vec<i32> = (0..cells).collect();
    let mat = region(ep, n * n * INT)?;
    // Fresh region.
    unsafe { mat.write_slice(0, &values) };
    Ok(mat)
}

fn doubled(v: i32) -> i32 {
    v.wrapping_mul(2)
}

/// Master and slave contexts, sequenced by a shared-memory barrier.
///
/// The master gathers its submatrix into the slave, the slave doubles it and
/// sends it back, and the master scatters the slave's copy into place.
pub fn matrix(fabric: &Fabric, layout: Layout) -> Result<(), Failure> {
    layout.validate()?;

    let name = format!("/dma-matrix-{}", uuid::Uuid::now_v7().simple());
    let barrier = Barrier::init(&name, 2)?;
    debug!(%name, "matrix barrier created");

    let result = run_matrix(fabric, &name, &barrier, layout);
    let closed = barrier.close();
    let unlinked = Barrier::unlink(&name);
    result?;
    closed?;
    unlinked?;

    info!(n = layout.n, m = layout.m, "matrix: ok");
    Ok(())
}

fn run_matrix(
    fabric: &Fabric,
    name: &str,
    barrier: &Barrier,
    layout: Layout,
) -> Result<(), Failure> {
    let (master, _) = bind(fabric, MASTER_PORT)?;
    let (slave, slave_addr) = bind(fabric, SLAVE_PORT)?;

    let slave_name = name.to_owned();
    let slave_thread = thread::Builder::new()
        .name("matrix-slave".into())
        .spawn(move || slave_process(slave, &slave_name, layout))
        .map_err(Failure::Io)?;

    let master_result = master_process(&master, slave_addr, barrier, layout);
    if master_result.is_err() {
        // The slave may be parked on the barrier; it is not joined.
        return master_result;
    }
    slave_thread
        .join()
        .map_err(|_| Failure::Panicked("matrix-slave"))?
}

fn master_process(
    master: &Endpoint<SimChannel>,
    slave_addr: EndpointAddress,
    barrier: &Barrier,
    layout: Layout,
) -> Result<(), Failure> {
    let mat_a = identity_matrix(master, layout.n)?;
    let mat_b = region(master, layout.sub_len())?;
    let start = mat_a.addr_at(layout.start_offset());

    master.track_immediate()?;
    barrier.wait()?;

    // Address exchange.
    master.send_immediate(slave_addr, mat_b.addr())?;
    expect_recv(master.wait_recv(), 0x10)?;
    let slave_b = master
        .read_immediate()
        .ok_or_else(|| Failure::check(0x10, "slave address missing"))?;
    master.fence()?;
    barrier.wait()?;

    // Send the cutout to the slave.
    master.gather_put(
        slave_addr,
        slave_b,
        start,
        layout.seg_size(),
        layout.stride(),
        layout.m,
    )?;
    master.fence()?;
    barrier.wait()?;

    // Every transfer so far has been fenced, on both sides of the barrier.
    let written = unsafe { mat_b.read_slice::<i32>(0, layout.m * layout.m) }
        .iter()
        .any(|&v| v != 0);
    if written {
        return Err(Failure::check(0x20, "master matrix B was written"));
    }
    // Slave doubles its copy.
    barrier.wait()?;

    master.scatter_get(
        slave_addr,
        start,
        slave_b,
        layout.seg_size(),
        layout.stride(),
        layout.m,
    )?;
    master.fence()?;
    // Slave sends its matrix B over.
    barrier.wait()?;

    // Both sides fenced before the barrier.
    let errors = unsafe { layout.mismatches(&mat_a, &mat_b) };
    if errors > 0 {
        return Err(Failure::check(
            0x30,
            format!("{} entries differ from the slave's copy", errors),
        ));
    }
    let first: i32 = unsafe { mat_a.read(layout.start_offset()) };
    let index = (layout.row * layout.n + layout.col) as i32;
    if first != doubled(index) {
        return Err(Failure::check(0x40, "submatrix was not doubled"));
    }
    Ok(())
}

fn slave_process(
    slave: Endpoint<SimChannel>,
    name: &str,
    layout: Layout,
) -> Result<(), Failure> {
    let barrier = Barrier::open(name, 2)?;
    let master_addr = EndpointAddress::local(MASTER_PORT);
    let mat_a = identity_matrix(&slave, layout.n)?;
    let mat_b = region(&slave, layout.sub_len())?;

    slave.track_immediate()?;
    barrier.wait()?;

    slave.send_immediate(master_addr, mat_b.addr())?;
    expect_recv(slave.wait_recv(), 0x50)?;
    let master_b = slave
        .read_immediate()
        .ok_or_else(|| Failure::check(0x50, "master address missing"))?;
    slave.fence()?;
    barrier.wait()?;

    // Master transmits.
    barrier.wait()?;
    // The master fenced its gather before the barrier.
    let errors = unsafe { layout.mismatches(&mat_a, &mat_b) };
    if errors > 0 {
        return Err(Failure::check(
            0x60,
            format!("{} entries differ from the master's cutout", errors),
        ));
    }
    for i in 0..layout.m * layout.m {
        unsafe {
            let v: i32 = mat_b.read(i * INT);
            mat_b.write(i * INT, doubled(v));
        }
    }
    barrier.wait()?;

    slave.put(master_addr, master_b, mat_b.addr(), layout.sub_len())?;
    slave.fence()?;
    barrier.wait()?;

    // No transfer targets the slave's matrix A.
    let untouched = unsafe { mat_a.read_slice::<i32>(0, layout.n * layout.n) }
        .iter()
        .enumerate()
        .all(|(i, &v)| v == i as i32);
    if !untouched {
        return Err(Failure::check(0x70, "slave matrix A was modified"));
    }
    barrier.close()?;
    Ok(())
}

// ============================================================================
// server-client
// ============================================================================

const SERVER_PORT: u16 = 1000;
const CLIENT_PORT_BASE: u16 = 1001;
const TABLE_LEN: usize = 100;
const REQUEST_ATTEMPTS: u32 = 10_000;
const REQUEST_BACKOFF: Duration = Duration::from_micros(50);

/// Most clients `server-client` will run.
pub const MAX_CLIENTS: u16 = 1000;

static SERVER_UNBIND: OnceLock<UnbindHandle<SimChannel>> = OnceLock::new();

extern "C" fn stop_server(_: libc::c_int) {
    if let Some(handle) = SERVER_UNBIND.get() {
        handle.unbind();
    }
}

/// Unbind `server` on SIGINT or SIGTERM, which stops [`serve`].
///
/// Only the first server of the process gets a handler.
fn install_stop_handler(server: &Endpoint<SimChannel>) -> Result<(), Failure> {
    if SERVER_UNBIND.set(server.unbind_handle()).is_err() {
        debug!("stop handler already installed");
        return Ok(());
    }
    let action = SigAction::new(
        SigHandler::Handler(stop_server),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // The handler only stores to an atomic.
        unsafe { sigaction(signal, &action) }.map_err(|e| Failure::Io(e.into()))?;
    }
    debug!("stop handler installed");
    Ok(())
}

/// One server publishing a table address to `clients` concurrent clients.
///
/// A zero immediate is a request; any other value stops the server. With
/// `stop_signals`, SIGINT and SIGTERM stop it too.
pub fn server_client(fabric: &Fabric, clients: u16, stop_signals: bool) -> Result<(), Failure> {
    let stopper_port = CLIENT_PORT_BASE
        .checked_add(clients)
        .filter(|_| clients <= MAX_CLIENTS)
        .ok_or_else(|| {
            Failure::check(0x01, format!("{} clients exceed {}", clients, MAX_CLIENTS))
        })?;

    let (server, server_addr) = bind(fabric, SERVER_PORT)?;
    if stop_signals {
        install_stop_handler(&server)?;
    }
    let table_values: Vec<i32> = (0..TABLE_LEN as i32).map(|i| i * 3).collect();
    let table = region(&server, TABLE_LEN * INT)?;
    // Nothing has been issued yet.
    unsafe { table.write_slice(0, &table_values) };

    let server_thread = thread::Builder::new()
        .name("server".into())
        .spawn(move || serve(&server, &table))
        .map_err(Failure::Io)?;

    let client_threads = (0..clients)
        .map(|i| {
            let client = fabric.endpoint();
            // Below the stopper's port, which did not overflow.
            let port = CLIENT_PORT_BASE + i;
            thread::Builder::new()
                .name(format!("client-{}", i))
                .spawn(move || run_client(client, port, server_addr))
                .map_err(Failure::Io)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut first_failure = None;
    for handle in client_threads {
        let result = handle
            .join()
            .map_err(|_| Failure::Panicked("client"))
            .and_then(|r| r);
        if let Err(e) = result {
            first_failure.get_or_insert(e);
        }
    }

    let (stopper, _) = bind(fabric, stopper_port)?;
    request(&stopper, server_addr, 1)?;

    let served = server_thread
        .join()
        .map_err(|_| Failure::Panicked("server"))??;
    if let Some(e) = first_failure {
        return Err(e);
    }
    if served != usize::from(clients) {
        return Err(Failure::check(
            0x50,
            format!("served {} of {} clients", served, clients),
        ));
    }

    info!(clients, "server-client: ok");
    Ok(())
}

/// Answer requests until told to stop or unbound. Returns the number served.
fn serve(server: &Endpoint<SimChannel>, table: &MemoryRegion) -> Result<usize, Failure> {
    let mut served = 0;
    loop {
        debug!("waiting for client");
        match server.track_immediate() {
            Err(Error::NotBound) => {
                info!(served, "server unbound");
                break;
            }
            armed => armed?,
        }
        match server.wait_recv() {
            RecvStatus::NoRoute => {
                info!(served, "server unbound");
                break;
            }
            status => expect_recv(status, 0x10)?,
        }

        match server.read_immediate() {
            Some(0) => {}
            Some(_) => break,
            None => return Err(Failure::check(0x10, "request without a value")),
        }
        let client = server
            .read_source_address()
            .ok_or_else(|| Failure::check(0x20, "request without a source"))?;
        debug!(%client, "received request");

        server.send_immediate(client, table.addr())?;
        expect_send(server.wait_send(), SendStatus::Success, 0x20)?;
        served += 1;
    }
    Ok(served)
}

/// Send `value` to the server, retrying while it is busy with another client.
fn request(
    client: &Endpoint<SimChannel>,
    server: EndpointAddress,
    value: u64,
) -> Result<(), Failure> {
    for attempt in 0..REQUEST_ATTEMPTS {
        client.send_immediate(server, value)?;
        match client.wait_send() {
            SendStatus::Success => return Ok(()),
            SendStatus::Nack => {
                debug!(attempt, "server busy, retrying");
                thread::sleep(REQUEST_BACKOFF);
            }
            other => {
                return Err(Failure::Status {
                    stage: 0x30,
                    status: other.code(),
                });
            }
        }
    }
    Err(Failure::Status {
        stage: 0x30,
        status: SendStatus::Nack.code(),
    })
}

fn run_client(
    client: Endpoint<SimChannel>,
    port: u16,
    server: EndpointAddress,
) -> Result<(), Failure> {
    client.bind(EndpointAddress::local(port))?;
    client.track_immediate()?;

    request(&client, server, 0)?;
    expect_recv(client.wait_recv(), 0x40)?;
    let table = client
        .read_immediate()
        .ok_or_else(|| Failure::check(0x40, "reply without a value"))?;
    debug!(port, table, "received address");

    let dst = region(&client, TABLE_LEN * INT)?;
    client.get(server, dst.addr(), table, TABLE_LEN * INT)?;
    client.fence()?;

    // Fenced above.
    let wrong = unsafe { dst.read_slice::<i32>(0, TABLE_LEN) }
        .iter()
        .enumerate()
        .filter(|&(i, &v)| v != i as i32 * 3)
        .count();
    if wrong > 0 {
        return Err(Failure::check(0x01, format!("{} table entries differ", wrong)));
    }
    Ok(())
}

// ============================================================================
// loopback
// ============================================================================

/// Contiguous self-put of `bytes` bytes between offset buffers.
pub fn loopback(fabric: &Fabric, bytes: usize) -> Result<(), Failure> {
    const PORT: u16 = 16;
    const SRC_OFF: usize = 5 * INT;
    const DST_OFF: usize = 2 * INT;
    const SLACK: usize = 16 * INT;

    let (ep, addr) = bind(fabric, PORT)?;
    let len = bytes
        .checked_add(SLACK)
        .ok_or_else(|| Failure::check(0x01, format!("{} bytes is too large", bytes)))?;
    let src = region(&ep, len)?;
    let dst = region(&ep, len)?;
    let pattern: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
    // Nothing has been issued yet.
    unsafe { src.write_bytes(0, &pattern) };

    ep.put(addr, dst.addr_at(DST_OFF), src.addr_at(SRC_OFF), bytes)?;
    ep.fence()?;

    let got = unsafe { dst.read_bytes(0, len) };
    if got[..DST_OFF].iter().any(|&b| b != 0) {
        return Err(Failure::check(0x10, "bytes before the copy were written"));
    }
    if got[DST_OFF..DST_OFF + bytes] != pattern[SRC_OFF..SRC_OFF + bytes] {
        return Err(Failure::check(0x20, "copied bytes differ"));
    }
    if got[DST_OFF + bytes..].iter().any(|&b| b != 0) {
        return Err(Failure::check(0x30, "bytes after the copy were written"));
    }

    info!(bytes, "loopback: ok");
    Ok(())
}
