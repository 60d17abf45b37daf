//! Mass-programmer for STM32 factory UART bootloaders (ST AN3155) on a
//! shared, typically RS-485, bus.
//!
//! One target at a time is placed in bootloader mode while the rest are
//! silenced through user-supplied [`hooks::ContextHooks`]; its flash is
//! erased sector-by-sector and written/verified page-by-page from an Intel
//! HEX image, then the target is released and the next one follows.
//!
//! # Example
//! ```no_run
//! use stm32_uart_prog::{
//!     device::McuDescriptor, fleet, fleet::FleetDriver, hooks::ManualHooks,
//!     image::HexImage, transport::SerialTransport,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let descriptor = McuDescriptor::stm32f40x();
//! let image = HexImage::from_hex_file(
//!     "firmware.hex",
//!     descriptor.flash_lo,
//!     descriptor.flash_hi,
//! )?;
//! let targets = fleet::parse_target_spec("1,3-5")?;
//!
//! let transport = SerialTransport::open("/dev/ttyUSB0", 115_200)?;
//! let mut driver = FleetDriver::new(transport, ManualHooks::default(), Default::default());
//! let report = driver.run(&targets, &image, &descriptor)?;
//! report.log_summary();
//! # Ok(())
//! # }
//! ```

pub mod bootloader;
pub mod device;
pub mod error;
pub mod fleet;
pub mod frame;
pub mod hooks;
pub mod image;
pub mod plan;
pub mod session;
pub mod transport;

pub use bootloader::{Bootloader, Timeouts};
pub use device::McuDescriptor;
pub use error::{Error, Result};
pub use fleet::{FleetConfig, FleetDriver, FleetReport};
pub use hooks::{ContextHooks, ManualHooks, TargetId};
pub use image::HexImage;
pub use plan::Plan;
pub use session::{CancelToken, RetryLimits, SessionConfig, TargetOutcome};
pub use transport::{SerialTransport, Transport, DEFAULT_BAUDRATE};
