//! Boot image support

use core::{cell::RefCell, mem::size_of};

use asraw::{AsMutRaw, AsRaw};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use storage::ReadFlash;

use crate::{crypto::Hash256, Error, MappedFlash, Result, ValidationMode};

/// The image header contains the following magic value, indicating the
/// interpretation of the rest of the image header.
pub const IMAGE_MAGIC: u32 = 0x96f3b83d;

/// Largest signature we will read onto the stack (RSA2048).
const MAX_SIGNATURE: usize = 256;

/// An image is a bootable image residing in a flash partition.  There is a
/// header at the beginning, and metadata immediately following the image.
/// This holds on to a RefCell to the flash to bind the data to a particular flash.
pub struct Image<'f, F> {
    flash: &'f RefCell<F>,
    pub header: ImageHeader,
    tlv_base: usize,
    tlv_size: usize,
}

impl<'f, F: ReadFlash> Image<'f, F> {
    /// Make an image from flash, if the image has a valid header. This does not
    /// indicate that the image itself is valid, merely that the header
    /// indicates an image is present.
    pub fn from_flash(flash: &'f RefCell<F>) -> Result<Image<'f, F>> {
        let limit = flash.borrow().capacity();
        Self::from_flash_within(flash, limit)
    }

    /// Like `from_flash`, but the whole image, TLV included, must end at or
    /// before `limit`.
    pub fn from_flash_within(flash: &'f RefCell<F>, limit: usize) -> Result<Image<'f, F>> {
        let mut header = ImageHeader::default();
        flash.borrow_mut().read(0, header.as_mut_raw())?;

        if header.magic != IMAGE_MAGIC {
            return Err(Error::InvalidHeader);
        }
        if (header.hdr_size as usize) < size_of::<ImageHeader>() {
            return Err(Error::InvalidHeader);
        }

        // Find the base address of the TLV.
        let tlv_base = (header.img_size as usize)
            .checked_add(header.hdr_size as usize)
            .ok_or(Error::InvalidHeader)?;
        let tlv_size = header.tlv_size as usize;
        let end = tlv_base.checked_add(tlv_size).ok_or(Error::InvalidHeader)?;
        if tlv_size < size_of::<TlvInfo>() || end > limit {
            return Err(Error::InvalidHeader);
        }

        let mut info = TlvInfo::default();
        flash.borrow_mut().read(tlv_base, info.as_mut_raw())?;

        if info.magic != TLV_INFO_MAGIC || info.len as usize != tlv_size {
            return Err(Error::InvalidHeader);
        }

        Ok(Image {
            flash,
            header,
            tlv_base,
            tlv_size,
        })
    }

    /// Iterate over the elements of the Tlv.  Each call scans again from the
    /// start of the block.
    pub fn tlvs<'a>(&'a self) -> TlvIter<'a, 'f, F> {
        TlvIter {
            image: self,
            pos: size_of::<TlvInfo>(),
            limit: self.tlv_size,
        }
    }

    /// Validate this image. Check the TLV entries, making sure that they are
    /// sufficient, and that indicated items, such as hashes and signatures are
    /// valid.  Returns the image digest.
    pub fn validate(&self, mode: &ValidationMode<'_>) -> Result<Hash256> {
        let image_hash = self.calculate_sha256()?;

        // Things we must see.
        let mut seen_sha = false;
        let mut valid_signature = false;
        // Key selected by the most recent KEYHASH.
        let mut key = None;

        for elt in self.tlvs() {
            let elt = elt?;
            match elt.kind() {
                TlvKind::SHA256 => {
                    if seen_sha {
                        warn!("Only a single hash is allowed");
                        return Err(Error::IntegrityFailed);
                    }
                    seen_sha = true;
                    if elt.data_len() != image_hash.len() {
                        return Err(Error::IntegrityFailed);
                    }
                    let mut hash = [0u8; 32];
                    elt.read_data(&mut hash)?;
                    if hash != image_hash {
                        warn!("Hash verification failure");
                        return Err(Error::IntegrityFailed);
                    }
                }
                TlvKind::KEYHASH => {
                    if let ValidationMode::DigestAndSignature(verifier) = mode {
                        let len = elt.data_len();
                        if len > 32 {
                            return Err(Error::IntegrityFailed);
                        }
                        let mut buf = [0u8; 32];
                        elt.read_data(&mut buf[..len])?;
                        // The key may not be found, which is acceptable.  There
                        // can be multiple signatures, each preceded by a key.
                        key = verifier.find_key(&buf[..len]);
                    }
                }
                kind => match mode {
                    ValidationMode::DigestAndSignature(verifier)
                        if kind == verifier.signature_kind() =>
                    {
                        let Some(key) = key.take() else {
                            debug!("Signature without a known key");
                            continue;
                        };
                        let len = elt.data_len();
                        if len > MAX_SIGNATURE {
                            return Err(Error::IntegrityFailed);
                        }
                        let mut sig = [0u8; MAX_SIGNATURE];
                        elt.read_data(&mut sig[..len])?;
                        if verifier.verify(key, &image_hash, &sig[..len]) {
                            valid_signature = true;
                        }
                    }
                    _ => debug!("Skipping TLV 0x{:x}", kind.0),
                },
            }
        }
        if !seen_sha {
            warn!("Expecting SHA TLV");
            return Err(Error::IntegrityFailed);
        }
        if let ValidationMode::DigestAndSignature(_) = mode {
            if !valid_signature {
                warn!("No valid signature");
                return Err(Error::IntegrityFailed);
            }
        }
        Ok(image_hash)
    }

    /// Compute the hash of the data portion of the image.
    fn calculate_sha256(&self) -> Result<Hash256> {
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 128];
        let mut pos = 0;
        while pos < self.tlv_base {
            let todo = (self.tlv_base - pos).min(buffer.len());
            let buf = &mut buffer[0..todo];
            self.flash.borrow_mut().read(pos, buf)?;
            hasher.update(buf);
            pos += todo;
        }
        let mut result = [0u8; 32];
        result.copy_from_slice(&hasher.finalize());
        Ok(result)
    }
}

impl<'a, F> Image<'a, F> {
    /// Return the size, in bytes, of the entire image, including the TLV.
    pub fn full_image_size(&self) -> usize {
        self.tlv_base + self.tlv_size
    }
}

pub struct TlvIter<'a, 'f, F> {
    image: &'a Image<'f, F>,
    pos: usize,
    limit: usize,
}

pub struct TlvIterEntry<'f, F> {
    flash: &'f RefCell<F>,
    kind: TlvKind,
    pos: usize,
    len: usize,
}

/// Helper like '?' for iterator operations, where errors should return
/// Some(Err(e)) instead of just the error.  This macro contains a return.
macro_rules! iter_try {
    ($self:ident, $e:expr) => {
        match $e {
            Ok(r) => r,
            Err(e) => {
                // Stop after the first error.
                $self.pos = $self.limit;
                return Some(Err(e.into()));
            }
        }
    };
}

impl<'a, 'f, F: ReadFlash> Iterator for TlvIter<'a, 'f, F> {
    type Item = Result<TlvIterEntry<'f, F>>;
    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.limit {
            return None;
        }

        // Sizes are bounded by the u16 length in the TLV info, so none of
        // this can overflow.
        let data_pos = self.pos + size_of::<TlvEntry>();
        if data_pos > self.limit {
            self.pos = self.limit;
            return Some(Err(Error::InvalidHeader));
        }

        let mut entry = TlvEntry::default();
        iter_try!(self, self
            .image
            .flash
            .borrow_mut()
            .read(self.image.tlv_base + self.pos, entry.as_mut_raw()));
        let next = data_pos + entry.len as usize;
        if next > self.limit {
            self.pos = self.limit;
            return Some(Err(Error::InvalidHeader));
        }
        self.pos = next;
        Some(Ok(TlvIterEntry {
            flash: self.image.flash,
            kind: TlvKind(entry.kind),
            pos: self.image.tlv_base + data_pos,
            len: entry.len as usize,
        }))
    }
}

impl<'f, F: ReadFlash> TlvIterEntry<'f, F> {
    /// What is the kind of this TLV entry.
    pub fn kind(&self) -> TlvKind {
        self.kind
    }

    /// What is the size of the payload.
    pub fn data_len(&self) -> usize {
        self.len
    }

    /// Offset of the payload within the slot.
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Read the payload into the given bytes.
    pub fn read_data(&self, data: &mut [u8]) -> Result<()> {
        if data.len() != self.len {
            return Err(Error::InvalidHeader);
        }
        self.flash.borrow_mut().read(self.pos, data)?;
        Ok(())
    }
}

/// For mapped flash, we can get the base address of the XIP area.
impl<'f, F: MappedFlash> Image<'f, F> {
    pub fn get_image_base(&self) -> usize {
        self.flash.borrow().get_base() + self.header.hdr_size as usize
    }
}

/// The image begins with the following header.  This is intended to be
/// interpreted as a C struct.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
#[repr(C)]
pub struct ImageHeader {
    /// Magic number, indicates this particular header.
    magic: u32,
    /// The size of the TLV block, including its info header.
    tlv_size: u16,
    /// Which key signed the image.  Informational, the KEYHASH TLV is what
    /// selects the key.
    key_id: u8,
    pad1: u8,
    /// The size of the header.  This struct is at the beginning, and there is
    /// some amount of padding before the actual image starts.  This is used
    /// because many architectures place alignment requirements on the runable
    /// image.
    hdr_size: u16,
    pad2: u16,
    /// The size of the image, not counting the header.
    img_size: u32,
    /// Flags for this image.  These indicate aspects, but are largely unused.
    flags: u32,
    /// Version of this particular image.
    version: ImageVersion,
    /// Padding, to reach a nicely aligned minimum size.
    pad3: u32,
}

impl AsRaw for ImageHeader {}
unsafe impl AsMutRaw for ImageHeader {}

impl ImageHeader {
    /// Position independent image.
    pub const F_PIC: u32 = 0x0000_0001;
    /// The image carries a SHA256 TLV.
    pub const F_SHA256: u32 = 0x0000_0002;
    /// The image is not meant to be booted.
    pub const F_NON_BOOTABLE: u32 = 0x0000_0010;

    pub fn hdr_size(&self) -> usize {
        self.hdr_size as usize
    }

    pub fn img_size(&self) -> usize {
        self.img_size as usize
    }

    pub fn tlv_size(&self) -> usize {
        self.tlv_size as usize
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn version(&self) -> ImageVersion {
        self.version
    }
}

/// Each image has a version.  This is a pseudo-semantic version used to
/// determine upgrade elligibility and compatible between multi-image setups.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
#[repr(C)]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build_num: u32,
}

/// The TLV block contains this header.
#[derive(Debug, Default)]
#[repr(C)]
struct TlvInfo {
    /// Always TLV_INFO_MAGIC.
    magic: u16,
    /// Length of TLV, including this header.
    len: u16,
}

const TLV_INFO_MAGIC: u16 = 0x6907;

impl AsRaw for TlvInfo {}
unsafe impl AsMutRaw for TlvInfo {}

/// Each TLV entry is preceeded by this header.
#[derive(Debug, Default)]
#[repr(C)]
struct TlvEntry {
    /// What this entry holds, see `TlvKind`.
    kind: u16,
    /// Length of the payload that follows.
    len: u16,
}

impl AsRaw for TlvEntry {}
unsafe impl AsMutRaw for TlvEntry {}

/// The type of a TLV entry.  New kinds can be given meaning without changing
/// the parser, anything not recognized is skipped.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct TlvKind(pub u16);

impl TlvKind {
    /// Hash of the public key that made the following signature.
    pub const KEYHASH: TlvKind = TlvKind(0x01);
    /// SHA256 of the header and payload.
    pub const SHA256: TlvKind = TlvKind(0x10);
    pub const RSA2048_PSS: TlvKind = TlvKind(0x20);
    pub const ECDSA224: TlvKind = TlvKind(0x21);
    pub const ECDSA256: TlvKind = TlvKind(0x22);
}
