//! # UIO Triple Buffer
//!
//! Periodic process data exchange between a real-time control task and a
//! backplane bus driver that shares a memory region with it through a Linux
//! UIO device.
//!
//! The region holds two triple buffer sets, one per direction. Each side
//! writes into a buffer only it owns, then hands that buffer over by swapping
//! a one-byte index under a tiny spinlock. Payload bytes are never copied
//! between buffers and never read while being written, and neither side
//! holds the lock for more than a handful of stores.
//!
//! ```text
//!  0..4    magic  AB CD EF AB
//!  4..16   input  set: lock u32 | read | write | available | new_data | pad 4
//! 16..28   output set: same
//! 28..     input buffers 0 1 2, output buffers 0 1 2  (header + payload each)
//! ```
//!
//! ## Cycle
//!
//! A control task typically:
//!
//! 1. sets up its [`RealTimeConfig`] (FIFO priority, CPU pinning, locked
//!    memory),
//! 2. maps the region ([`UioRegion`]) and validates it ([`SharedImage::open`]),
//! 3. runs a [`Scheduler`] whose body fills the output write buffer and
//!    publishes it, then consumes the newest input if the device flagged one.
//!
//! ## Spin-Wait Behavior
//!
//! The lock is a test-and-set word in shared memory, also taken by the
//! driver. A waiter spins briefly and then sleeps in short fixed steps until
//! the word reads clear. There is no fairness and no timeout; both sides keep
//! their critical sections to a constant number of stores.
//!
//! ## Modules
//!
//! - [`layout`]: region geometry, directions, sides.
//! - [`buffer_set`]: index and lock metadata of one direction.
//! - [`lock`]: the triple-buffer spinlock.
//! - [`exchange`]: publish/consume protocol and endpoints.
//! - [`scheduler`]: absolute-deadline periodic loop.
//! - [`rt`]: real-time execution context.
//! - [`region`], [`image`]: mapped memory and its validated interpretation.
//! - [`config`]: TOML settings.
//! - [`device`]: in-process stand-in for the driver.
//!
//! ## License
//!
//! Licensed under the terms of the **GNU Lesser General Public License**,
//! version 3.0, or (at your option) any later version.
//!
//! See <https://www.gnu.org/licenses/lgpl-3.0.html> for details.

#[cfg(not(target_os = "linux"))]
compile_error!("This crate only supports Linux.");

pub mod buffer_set;
pub mod config;
pub mod device;
pub mod error;
pub mod exchange;
pub mod image;
pub mod layout;
pub mod lock;
mod mmap;
pub mod region;
pub mod rt;
pub mod scheduler;
mod utils;

pub use config::Config;
pub use device::SimulatedDevice;
pub use error::{ExchangeError, SetupError};
pub use exchange::{Consumer, Exchange, Published, Publisher};
pub use image::SharedImage;
pub use layout::{Direction, RegionLayout, Side};
pub use lock::LockConfig;
pub use region::{HeapRegion, Region, UioRegion};
pub use rt::RealTimeConfig;
pub use scheduler::{run, Cycle, CycleStats, PeriodState, Scheduler};
pub use utils::{mono_time_ns, Samples, Summary};
