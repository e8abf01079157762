//! This is a basic bootloader built for embedded rust.
//!
//! On every boot it decides which of two images to run, verifies the one it
//! picks, and, when a new image has been requested, exchanges the contents of
//! the primary and secondary slots one sector at a time through a scratch
//! area.  Progress is recorded in a trailer at the end of the primary slot so
//! that an exchange interrupted by a reset picks up where it left off.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

mod config;
mod crypto;
mod image;
mod loader;
mod resolve;
mod slots;
mod status;
mod swap;

pub use config::{BootConfig, ValidationMode};
#[cfg(feature = "p256")]
pub use crypto::P256Keys;
pub use crypto::{key_hash, Hash256, SignatureVerifier};
pub use image::{Image, ImageHeader, ImageVersion, TlvKind, IMAGE_MAGIC};
pub use loader::{BootLoader, BootResponse};
pub use resolve::{resolve, Decision, SwapRequest, SwapType};
pub use slots::{Geometry, Slot, Slots};
pub use status::{
    Flag, Ledger, SectorStatus, SlotInfo, StatusLayout, Trailer, TrailerStore, BOOT_MAGIC,
};

type Result<T> = core::result::Result<T, Error>;

// Use the error kind to avoid this depending on the particular flash.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Error {
    Flash(storage::Error),
    /// Malformed or out of range header or TLV block.  The image is treated
    /// as absent.
    InvalidHeader,
    /// Digest or signature mismatch.
    IntegrityFailed,
    /// A write or erase failed, or did not read back as written.
    FlashWriteFailed,
    /// The trailer magic is valid but its contents are not.
    TrailerCorrupt,
    /// The flash geometry cannot hold the trailer or the swap.
    InvalidLayout,
    /// A public key could not be decoded, or the key store is full.
    InvalidKey,
    /// Neither slot holds an image that can be booted.
    NoBootableImage,
}

/// Convert the nor flash error into our error type.
impl From<storage::Error> for Error {
    fn from(e: storage::Error) -> Self {
        Error::Flash(e)
    }
}

/// Some kinds of flash can be mapped into memory.  This is needed for XIP devices.
pub trait MappedFlash {
    /// Return the base address of this flash partition, as mapped into memory.
    fn get_base(&self) -> usize;
}
