//! End-to-end scenarios over the in-process acquisition path:
//! MockHost for the lifecycle, MemBacking as fake physical memory, and a
//! loopback transport between the client and the device handler.

use pmemctl::{AccessMode, ErrorKind, Pmem, PhysAddr};
use pmemctl_core::lifecycle::{LifecycleConfig, LifecycleManager, MockHost, ModuleHost};
use pmemctl_core::mapper::{Mapper, MapperConfig, MappingRequest, MemBacking, WindowPool};
use pmemctl_core::protocol::DeviceHandler;
use pmemctl_core::regions::ForbiddenRegions;
use rand::RngCore;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const MEM_SIZE: usize = 1 << 20;

struct Rig {
    pmem: Pmem,
    backing: MemBacking,
    handler: Arc<DeviceHandler>,
    host: Arc<MockHost>,
    pool: Arc<WindowPool>,
}

fn rig() -> Rig {
    let backing = MemBacking::new(MEM_SIZE);
    let mapper = Mapper::new(
        Box::new(backing.clone()),
        ForbiddenRegions::defaults(),
        MapperConfig {
            max_window: 64 << 10,
            window_slots: 4,
        },
    );
    let handler = Arc::new(DeviceHandler::new(mapper));
    let pool = Arc::clone(handler.mapper().pool());

    let host = MockHost::new();
    let mut config = LifecycleConfig::default();
    config.drain_timeout = Duration::from_millis(50);
    let mut lifecycle =
        LifecycleManager::new(Arc::clone(&host) as Arc<dyn ModuleHost>, config);
    lifecycle.set_window_pool(Arc::clone(&pool));

    let pmem = Pmem::loopback(lifecycle, Arc::clone(&handler));
    Rig {
        pmem,
        backing,
        handler,
        host,
        pool,
    }
}

fn image() -> &'static Path {
    Path::new("pmemctl.ko")
}

#[test]
fn known_pattern_read_back() {
    let mut rig = rig();
    let mut pattern = [0u8; 16];
    rand::rng().fill_bytes(&mut pattern);
    rig.backing.write(PhysAddr::new(0x1000), &pattern);

    rig.pmem.load(image()).unwrap();
    let bytes = rig.pmem.read(PhysAddr::new(0x1000), 16).unwrap();
    assert_eq!(bytes, pattern);
}

#[test]
fn load_read_unload_sequence() {
    let mut rig = rig();
    rig.backing.write(PhysAddr::new(0x4000), &[0x5a; 64]);

    rig.pmem.load(image()).unwrap();
    let bytes = rig.pmem.read(PhysAddr::new(0x4000), 64).unwrap();
    assert_eq!(bytes, vec![0x5a; 64]);

    rig.pmem.unload().unwrap();

    // the handle is invalidated; further reads fail cleanly
    let err = rig.pmem.read(PhysAddr::new(0x4000), 64).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
}

#[test]
fn scalar_reads_through_the_client() {
    let mut rig = rig();
    rig.backing
        .write(PhysAddr::new(0x2000), &[0xef, 0xbe, 0xad, 0xde]);

    rig.pmem.load(image()).unwrap();
    let value = rig
        .pmem
        .read_scalar(PhysAddr::new(0x2000), AccessMode::Dword)
        .unwrap();
    assert_eq!(value, 0xdeadbeef);
}

#[test]
fn query_reports_limits() {
    let mut rig = rig();
    rig.pmem.load(image()).unwrap();
    let info = rig.pmem.query().unwrap();
    assert_eq!(info.version_major, 1);
    assert_eq!(info.max_window, 64 << 10);
}

#[test]
fn forbidden_region_surfaces_through_the_client() {
    let mut rig = rig();
    rig.pmem.load(image()).unwrap();
    let err = rig.pmem.read(PhysAddr::new(0xb8000), 16).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ForbiddenRegion);
}

#[test]
fn pool_exhaustion_surfaces_as_out_of_resources() {
    let mut rig = rig();
    rig.pmem.load(image()).unwrap();

    let windows: Vec<_> = (0..4u64)
        .map(|i| {
            rig.handler
                .mapper()
                .map(MappingRequest::new(PhysAddr::new(0x1000 * (i + 1)), 16))
                .unwrap()
        })
        .collect();

    let err = rig.pmem.read(PhysAddr::new(0x8000), 16).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfResources);

    drop(windows);
    assert!(rig.pmem.read(PhysAddr::new(0x8000), 16).is_ok());
}

#[test]
fn unload_while_read_in_flight_is_busy() {
    let mut rig = rig();
    rig.pmem.load(image()).unwrap();

    // hold a mapping window, standing in for a read mid-copy
    let window = rig
        .handler
        .mapper()
        .map(MappingRequest::new(PhysAddr::new(0x3000), 32))
        .unwrap();

    let err = rig.pmem.unload().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Busy);

    drop(window);
    rig.pmem.unload().unwrap();
    assert_eq!(rig.pool.active(), 0);
}

#[test]
fn concurrent_load_fails_fast() {
    let host = MockHost::new();
    host.set_insert_delay(Duration::from_millis(100));
    let mgr = Arc::new(LifecycleManager::new(
        Arc::clone(&host) as Arc<dyn ModuleHost>,
        LifecycleConfig::default(),
    ));

    let first = {
        let mgr = Arc::clone(&mgr);
        thread::spawn(move || mgr.load(image()))
    };
    thread::sleep(Duration::from_millis(20));
    let second = mgr.load(image());
    assert_eq!(
        pmemctl::Error::from(second.unwrap_err()).kind(),
        ErrorKind::AlreadyInProgress
    );
    first.join().unwrap().unwrap();
}

#[test]
fn repeated_cycles_leak_nothing() {
    let mut rig = rig();
    for round in 0u64..100 {
        rig.pmem.load(image()).unwrap();
        let addr = PhysAddr::new(0x1000 + (round % 16) * 0x100);
        rig.pmem.read(addr, 64).unwrap();
        rig.pmem.unload().unwrap();
    }
    assert_eq!(rig.pool.active(), 0);
    assert_eq!(rig.host.module_count(), 0);
    assert_eq!(rig.host.node_count(), 0);
}
