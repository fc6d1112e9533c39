//! Stacked bdev demo
//!
//! Builds Malloc0 <- PT0 <- PT1 on a set of reactors, runs write/read
//! traffic through the top of the stack from every reactor, then removes
//! the base and watches the removal cascade up the stack.
//!
//! # Environment Variables
//!
//! - `IOCHAN_DEMO_REACTORS` - Number of reactors (default 2)
//! - `IOCHAN_DEMO_IOS` - Writes per reactor (default 64)
//! - `IOCHAN_REACTOR_PARK_US` - Reactor idle sleep in microseconds
//! - `RUST_LOG` - Log filter, e.g. `iochan_bdev=debug`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use iochan::bdev::{
    bdev_close, bdev_config_json, bdev_get_io_channel, bdev_list, bdev_module_register,
    bdev_modules_fini, bdev_open, bdev_read, bdev_write, create_malloc_disk, delete_malloc_disk,
    BdevDesc, HotRemoveFn, PassthruConfig, PassthruModule,
};
use iochan::thread::{lib_fini, lib_init, put_io_channel};
use iochan::{IoChannel, Reactor, ReactorConfig, ThreadLibConfig};
use iochan::env::env_get;

const BLOCK_SIZE: u32 = 512;
const BLOCK_COUNT: u64 = 1024;
const TOP: &str = "PT1";

type Slot = Arc<Mutex<Option<(BdevDesc, IoChannel)>>>;

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    verified: AtomicU64,
    failed: AtomicU64,
}

// RUST_LOG=info cargo run -p iochan-stack-demo
fn main() -> Result<(), Box<dyn std::error::Error>> {
    iochan::init_logging();
    lib_init(ThreadLibConfig::from_env())?;

    let reactor_count: usize = env_get("IOCHAN_DEMO_REACTORS", 2).max(1);
    let ios: u64 = env_get("IOCHAN_DEMO_IOS", 64u64).clamp(1, BLOCK_COUNT / reactor_count as u64);

    println!("=== iochan stack demo ===");
    println!("reactors: {}, writes per reactor: {}\n", reactor_count, ios);

    let reactors = (0..reactor_count)
        .map(|i| Reactor::spawn(ReactorConfig::from_env(format!("reactor{}", i))))
        .collect::<Result<Vec<_>, _>>()?;
    let app = &reactors[0];

    // Configure the stack before its base exists; examine builds it.
    app.call(|| -> iochan::bdev::Result<()> {
        let module = PassthruModule::with_config(vec![
            PassthruConfig {
                base_bdev_name: "PT0".into(),
                passthru_bdev_name: TOP.into(),
            },
            PassthruConfig {
                base_bdev_name: "Malloc0".into(),
                passthru_bdev_name: "PT0".into(),
            },
        ])?;
        bdev_module_register(module)?;
        create_malloc_disk("Malloc0", BLOCK_COUNT, BLOCK_SIZE)?;
        Ok(())
    })??;

    let names = app.call(|| bdev_list().iter().map(|b| b.name().to_string()).collect::<Vec<_>>())?;
    println!("bdevs: {}", names.join(" <- "));
    let config = app.call(bdev_config_json)?;
    println!("config:\n{}\n", serde_json::to_string_pretty(&config)?);

    // One consumer per reactor on the top of the stack
    let counters = Arc::new(Counters::default());
    let slots: Vec<Slot> = (0..reactor_count).map(|_| Slot::default()).collect();
    for (idx, reactor) in reactors.iter().enumerate() {
        let slot = slots[idx].clone();
        let counters = counters.clone();
        reactor.call(move || start_consumer(idx as u64, ios, slot, counters))??;
    }

    let total = ios * reactor_count as u64;
    let settled = wait_for(Duration::from_secs(10), || {
        counters.verified.load(Ordering::Acquire) + counters.failed.load(Ordering::Acquire) >= total
    });
    println!(
        "traffic: {} written, {} verified, {} failed{}",
        counters.written.load(Ordering::Acquire),
        counters.verified.load(Ordering::Acquire),
        counters.failed.load(Ordering::Acquire),
        if settled { "" } else { " (timed out)" }
    );

    // Pull the base out from under the stack
    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    app.call(move || {
        delete_malloc_disk(
            "Malloc0",
            Some(Box::new(move |status: iochan::bdev::Result<()>| {
                let _ = tx.send(status);
            })),
        )
    })??;
    match rx.recv_timeout(Duration::from_secs(10)) {
        Ok(status) => {
            status?;
            println!("base removed in {:?}", started.elapsed());
        }
        Err(_) => warn!("base removal did not complete"),
    }

    let open = slots.iter().filter(|s| s.lock().is_some()).count();
    let left = app.call(|| bdev_list().len())?;
    println!("consumers still open: {}, bdevs left: {}", open, left);

    app.call(bdev_modules_fini)?;
    for reactor in reactors {
        reactor.join();
    }
    let leaked = lib_fini();
    info!(leaked, "demo finished");
    println!("\n=== done ===");
    Ok(())
}

/// Open the top bdev on the calling reactor and write `ios` blocks; every
/// completed write is read back and checked
fn start_consumer(idx: u64, ios: u64, slot: Slot, counters: Arc<Counters>) -> iochan::bdev::Result<()> {
    let on_remove = slot.clone();
    let hot_remove: HotRemoveFn = Box::new(move || {
        let held = on_remove.lock().take();
        if let Some((desc, ch)) = held {
            put_io_channel(ch);
            bdev_close(desc);
            info!("consumer released {}", TOP);
        }
    });

    let desc = bdev_open(TOP, true, Some(hot_remove))?;
    let ch = bdev_get_io_channel(&desc)?;
    let pattern = (idx as u8).wrapping_add(0xa0);

    let submitted = (0..ios).try_for_each(|i| {
        let offset = idx * ios + i;
        let slot = slot.clone();
        let counters = counters.clone();
        bdev_write(&desc, &ch, offset, vec![pattern; BLOCK_SIZE as usize], move |io| {
            if !io.status().is_success() {
                counters.failed.fetch_add(1, Ordering::AcqRel);
                return;
            }
            counters.written.fetch_add(1, Ordering::AcqRel);

            let guard = slot.lock();
            let Some((desc, ch)) = guard.as_ref() else {
                counters.failed.fetch_add(1, Ordering::AcqRel);
                return;
            };
            let check = counters.clone();
            let submitted = bdev_read(desc, ch, offset, 1, move |mut io| {
                let ok = io.status().is_success() && io.take_buf().iter().all(|b| *b == pattern);
                let counter = if ok { &check.verified } else { &check.failed };
                counter.fetch_add(1, Ordering::AcqRel);
            });
            if submitted.is_err() {
                counters.failed.fetch_add(1, Ordering::AcqRel);
            }
        })
    });

    match submitted {
        Ok(()) => {
            *slot.lock() = Some((desc, ch));
            Ok(())
        }
        Err(err) => {
            put_io_channel(ch);
            bdev_close(desc);
            Err(err)
        }
    }
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}
