//! Boot configuration.

use core::fmt;

use crate::crypto::SignatureVerifier;

/// What an image must carry to be accepted.
#[derive(Clone, Copy)]
pub enum ValidationMode<'k> {
    /// A SHA256 TLV that matches the image.
    DigestOnly,
    /// The digest, plus a valid signature from one of the verifier's keys.
    DigestAndSignature(&'k dyn SignatureVerifier),
}

impl fmt::Debug for ValidationMode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationMode::DigestOnly => f.write_str("DigestOnly"),
            ValidationMode::DigestAndSignature(v) => {
                write!(f, "DigestAndSignature(0x{:x})", v.signature_kind().0)
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BootConfig<'k> {
    pub validation: ValidationMode<'k>,
    /// The platform can execute directly from the secondary slot.  When set,
    /// a primary image that fails verification (with no swap this boot) falls
    /// back to a valid secondary image.
    pub secondary_bootable: bool,
}

impl Default for BootConfig<'_> {
    fn default() -> Self {
        BootConfig {
            validation: ValidationMode::DigestOnly,
            secondary_bootable: true,
        }
    }
}
