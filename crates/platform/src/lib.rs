//! # Keryx Platform
//!
//! Kernel data-plane types and traits for the Keryx IKEv2 engine.
//!
//! The protocol engine in `keryx-proto` negotiates keys and selectors but
//! never touches the SPD/SAD itself; everything it needs from the
//! environment goes through the [`KernelIpsec`] trait defined here.
//!
//! # Examples
//!
//! ```
//! use keryx_platform::{KernelIpsec, NullKernel, PlatformResult};
//!
//! # fn main() -> PlatformResult<()> {
//! let mut kernel = NullKernel::default();
//! let cpi = kernel.get_my_cpi()?;
//! assert!(cpi >= keryx_platform::IPCOMP_FIRST_NEGOTIATED);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod traits;

pub use error::{PlatformError, PlatformResult};
pub use traits::{IpsecSaSpec, KernelIpsec, NullKernel, SaDirection, IPCOMP_FIRST_NEGOTIATED};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
