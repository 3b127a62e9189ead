//! Kernel data-plane traits consumed by the protocol engine

use crate::PlatformResult;

/// Lowest IPComp CPI value in the negotiated range (RFC 3173 section 3.3)
pub const IPCOMP_FIRST_NEGOTIATED: u16 = 256;

/// Direction of an installed kernel SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaDirection {
    /// Protects traffic we receive
    Inbound,
    /// Protects traffic we send
    Outbound,
}

/// Everything the kernel needs to install one ESP SA
#[derive(Debug, Clone)]
pub struct IpsecSaSpec {
    /// ESP Security Parameter Index
    pub spi: u32,

    /// Direction of this SA
    pub direction: SaDirection,

    /// Encryption key material
    pub encryption_key: Vec<u8>,

    /// Integrity key material (empty for AEAD ciphers)
    pub integrity_key: Vec<u8>,

    /// Local traffic selector, address range in presentation form
    pub local_ts: String,

    /// Remote traffic selector, address range in presentation form
    pub remote_ts: String,

    /// IPComp CPI when compression was negotiated
    pub ipcomp_cpi: Option<u16>,
}

/// Kernel SPD/SAD interface
///
/// The engine calls these when a CHILD SA reaches its established state or
/// is torn down. Implementations wrap XFRM/PF_KEY or are no-ops in tests.
pub trait KernelIpsec: Send {
    /// Allocate a local IPComp CPI
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel cannot allocate a CPI in the
    /// negotiated range.
    fn get_my_cpi(&mut self) -> PlatformResult<u16>;

    /// Install an ESP SA into the kernel
    ///
    /// # Errors
    ///
    /// Returns an error if the specification is rejected.
    fn install_ipsec_sa(&mut self, spec: &IpsecSaSpec) -> PlatformResult<()>;

    /// Remove a previously installed ESP SA
    ///
    /// # Errors
    ///
    /// Returns an error if the SA is unknown to the kernel.
    fn remove_ipsec_sa(&mut self, spi: u32, direction: SaDirection) -> PlatformResult<()>;
}

/// No-op kernel used in tests and dry runs
///
/// Hands out sequential CPIs and remembers installed SPIs so tests can
/// assert against them.
#[derive(Debug, Default)]
pub struct NullKernel {
    next_cpi: u16,
    installed: Vec<(u32, SaDirection)>,
}

impl NullKernel {
    /// SPIs currently installed, in installation order
    pub fn installed(&self) -> &[(u32, SaDirection)] {
        &self.installed
    }
}

impl KernelIpsec for NullKernel {
    fn get_my_cpi(&mut self) -> PlatformResult<u16> {
        let cpi = IPCOMP_FIRST_NEGOTIATED + self.next_cpi;
        self.next_cpi = self.next_cpi.wrapping_add(1);
        Ok(cpi)
    }

    fn install_ipsec_sa(&mut self, spec: &IpsecSaSpec) -> PlatformResult<()> {
        self.installed.push((spec.spi, spec.direction));
        Ok(())
    }

    fn remove_ipsec_sa(&mut self, spi: u32, direction: SaDirection) -> PlatformResult<()> {
        let before = self.installed.len();
        self.installed
            .retain(|(s, d)| !(*s == spi && *d == direction));
        if self.installed.len() == before {
            return Err(crate::PlatformError::NotFound(format!("SPI 0x{:08x}", spi)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_kernel_cpi_allocation() {
        let mut kernel = NullKernel::default();
        let first = kernel.get_my_cpi().unwrap();
        let second = kernel.get_my_cpi().unwrap();
        assert!(first >= IPCOMP_FIRST_NEGOTIATED);
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_null_kernel_install_remove() {
        let mut kernel = NullKernel::default();
        let spec = IpsecSaSpec {
            spi: 0xdead_beef,
            direction: SaDirection::Inbound,
            encryption_key: vec![0u8; 16],
            integrity_key: vec![],
            local_ts: "10.0.0.0/24".into(),
            remote_ts: "10.0.1.0/24".into(),
            ipcomp_cpi: None,
        };

        kernel.install_ipsec_sa(&spec).unwrap();
        assert_eq!(kernel.installed().len(), 1);

        kernel
            .remove_ipsec_sa(0xdead_beef, SaDirection::Inbound)
            .unwrap();
        assert!(kernel.installed().is_empty());

        // Removing twice is an error
        assert!(kernel
            .remove_ipsec_sa(0xdead_beef, SaDirection::Inbound)
            .is_err());
    }
}
