//! Submatrix gather/scatter tests.
//!
//! A square submatrix is gathered out of a larger row-major `i32` matrix,
//! modified, and scattered back into place.

mod common;

use std::sync::Arc;
use std::thread;

use accel_dma::sim::{MemoryRegion, SimChannel};
use accel_dma::{Endpoint, EndpointAddress, RecvStatus};
use shm_barrier::Barrier;

use common::{bound, fabric, int_region, region, shm_name};

const INT: usize = size_of::<i32>();

struct Layout {
    n: usize,
    m: usize,
    row: usize,
    col: usize,
}

impl Layout {
    fn start_offset(&self) -> usize {
        (self.row * self.n + self.col) * INT
    }

    fn seg_size(&self) -> usize {
        self.m * INT
    }

    fn stride(&self) -> usize {
        (self.n - self.m) * INT
    }

    /// Entries of the submatrix of `mat_a` that differ from `mat_b`.
    ///
    /// Callers fence before comparing.
    fn mismatches(&self, mat_a: &MemoryRegion, mat_b: &MemoryRegion) -> usize {
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

fn identity_matrix(ep: &Endpoint<SimChannel>, n: usize) -> MemoryRegion {
    let values: Vec<i32> = (0..(n * n) as i32).collect();
    int_region(ep, &values)
}

/// Only called between fenced phases.
fn double_in_place(mat: &MemoryRegion, count: usize) {
    for i in 0..count {
        unsafe {
            let v: i32 = mat.read(i * INT);
            mat.write(i * INT, v * 2);
        }
    }
}

fn run_single_context(layout: Layout) {
    let fabric = fabric();
    let (ep, addr) = bound(&fabric, 16);

    let mat_a = identity_matrix(&ep, layout.n);
    let mat_b = region(&ep, layout.m * layout.m * INT);
    let start = mat_a.addr_at(layout.start_offset());

    ep.gather_put(
        addr,
        mat_b.addr(),
        start,
        layout.seg_size(),
        layout.stride(),
        layout.m,
    )
    .unwrap();
    ep.fence().unwrap();
    assert_eq!(layout.mismatches(&mat_a, &mat_b), 0);

    double_in_place(&mat_b, layout.m * layout.m);

    ep.scatter_get(
        addr,
        start,
        mat_b.addr(),
        layout.seg_size(),
        layout.stride(),
        layout.m,
    )
    .unwrap();
    ep.fence().unwrap();
    assert_eq!(layout.mismatches(&mat_a, &mat_b), 0);

    // Only the submatrix changed.
    for r in 0..layout.n {
        for c in 0..layout.n {
            let v: i32 = unsafe { mat_a.read((r * layout.n + c) * INT) };
            let inside = (layout.row..layout.row + layout.m).contains(&r)
                && (layout.col..layout.col + layout.m).contains(&c);
            let expected = (r * layout.n + c) as i32;
            assert_eq!(v, if inside { expected * 2 } else { expected });
        }
    }
}

#[test]
fn test_submatrix_32_of_128() {
    run_single_context(Layout {
        n: 128,
        m: 32,
        row: 32,
        col: 64,
    });
}

#[test]
fn test_submatrix_16_of_64() {
    run_single_context(Layout {
        n: 64,
        m: 16,
        row: 32,
        col: 16,
    });
}

const MASTER_PORT: u16 = 100;
const SLAVE_PORT: u16 = 101;

/// Two contexts sequenced by a process barrier, exchanging buffer addresses
/// through immediates.
#[test]
fn test_master_slave_with_barrier() {
    let layout = Arc::new(Layout {
        n: 128,
        m: 32,
        row: 32,
        col: 64,
    });
    let fabric = fabric();
    let name = shm_name("matrix-barrier");
    let barrier = Barrier::init(&name, 2).unwrap();

    let (master, _) = bound(&fabric, MASTER_PORT);
    let (slave, _) = bound(&fabric, SLAVE_PORT);
    let master_addr = EndpointAddress::local(MASTER_PORT);
    let slave_addr = EndpointAddress::local(SLAVE_PORT);

    let slave_layout = Arc::clone(&layout);
    let slave_name = name.clone();
    let slave_thread = thread::spawn(move || {
        let layout = slave_layout;
        let barrier = Barrier::open(&slave_name, 2).unwrap();
        let mat_a = identity_matrix(&slave, layout.n);
        let mat_b = region(&slave, layout.m * layout.m * INT);

        slave.track_immediate().unwrap();
        barrier.wait().unwrap();

        // Address exchange.
        slave
            .send_immediate(master_addr, mat_b.addr())
            .unwrap();
        assert_eq!(slave.wait_recv(), RecvStatus::Success);
        let master_b = slave.read_immediate().unwrap();
        slave.fence().unwrap();
        barrier.wait().unwrap();

        // Master transmits.
        barrier.wait().unwrap();
        assert_eq!(layout.mismatches(&mat_a, &mat_b), 0);
        double_in_place(&mat_b, layout.m * layout.m);
        barrier.wait().unwrap();

        // Master reads back; we send ours over.
        slave
            .put(master_addr, master_b, mat_b.addr(), layout.m * layout.m * INT)
            .unwrap();
        slave.fence().unwrap();
        barrier.wait().unwrap();

        // Our matrix A is untouched.
        let values = unsafe { mat_a.read_slice::<i32>(0, layout.n * layout.n) };
        assert!(values.iter().enumerate().all(|(i, &v)| v == i as i32));
        barrier.close().unwrap();
    });

    let mat_a = identity_matrix(&master, layout.n);
    let mat_b = region(&master, layout.m * layout.m * INT);
    let start = mat_a.addr_at(layout.start_offset());

    master.track_immediate().unwrap();
    barrier.wait().unwrap();

    master
        .send_immediate(slave_addr, mat_b.addr())
        .unwrap();
    assert_eq!(master.wait_recv(), RecvStatus::Success);
    let slave_b = master.read_immediate().unwrap();
    master.fence().unwrap();
    barrier.wait().unwrap();

    master
        .gather_put(
            slave_addr,
            slave_b,
            start,
            layout.seg_size(),
            layout.stride(),
            layout.m,
        )
        .unwrap();
    master.fence().unwrap();
    barrier.wait().unwrap();

    // Our matrix B is still zero.
    let untouched = unsafe { mat_b.read_slice::<i32>(0, layout.m * layout.m) };
    assert!(untouched.iter().all(|&v| v == 0));
    barrier.wait().unwrap();

    master
        .scatter_get(
            slave_addr,
            start,
            slave_b,
            layout.seg_size(),
            layout.stride(),
            layout.m,
        )
        .unwrap();
    master.fence().unwrap();
    barrier.wait().unwrap();

    assert_eq!(layout.mismatches(&mat_a, &mat_b), 0);
    let doubled: i32 = unsafe { mat_a.read(layout.start_offset()) };
    assert_eq!(doubled, ((layout.row * layout.n + layout.col) * 2) as i32);

    slave_thread.join().unwrap();
    barrier.close().unwrap();
    Barrier::unlink(&name).unwrap();
}
