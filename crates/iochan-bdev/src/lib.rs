//! # iochan-bdev
//!
//! Block device layer built on iochan channels.
//!
//! - `bdev` - Bdev registry, descriptors, claims, modules and submission
//! - `io` - Block I/O requests and completion routing
//! - `malloc` - In-memory base bdev
//! - `vbdev` - Generic stackable bdev node
//! - `passthru` - Passthru module built on `vbdev`

pub mod bdev;
pub mod error;
pub mod io;
pub mod malloc;
pub mod passthru;
pub mod vbdev;

pub use bdev::{
    bdev_claim, bdev_close, bdev_config_json, bdev_flush, bdev_get_io_channel, bdev_list,
    bdev_module_names, bdev_module_register, bdev_modules_fini, bdev_open, bdev_read,
    bdev_register, bdev_reset, bdev_unmap, bdev_unregister, bdev_write, bdev_write_zeroes,
    get_bdev_by_name, submit_io, validate_io, Bdev, BdevDesc, BdevInfo, BdevModule, BdevOps,
    BdevUnregisterFn, HotRemoveFn,
};
pub use error::{BdevError, Result};
pub use io::{BdevIo, IoCompletion, IoStatus, IoType};
pub use malloc::{create_malloc_disk, delete_malloc_disk, MallocDisk, MALLOC_MODULE};
pub use passthru::{Passthru, PassthruConfig, PassthruModule, PASSTHRU_MODULE};
pub use vbdev::{IoTransform, VbdevChannel, VbdevNode};
