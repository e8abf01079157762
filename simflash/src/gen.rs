//! Image generation.
//!
//! Builds images the way the signing tool lays them out: a header, a payload
//! of pseudo-random data, and a TLV block with the digest and, optionally, a
//! key hash and an ECDSA P-256 signature.

use anyhow::{anyhow, Result};
use p256::ecdsa::{signature::hazmat::PrehashSigner, Signature, SigningKey};
use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use sha2::{Digest, Sha256};

/// Values shared with the bootloader's image format.
pub const IMAGE_MAGIC: u32 = 0x96f3b83d;
pub const TLV_INFO_MAGIC: u16 = 0x6907;
pub const TLV_KEYHASH: u16 = 0x01;
pub const TLV_SHA256: u16 = 0x10;
pub const TLV_ECDSA256: u16 = 0x22;
pub const F_SHA256: u32 = 0x0000_0002;

pub struct GeneratedImage {
    pub data: Vec<u8>,
    /// The digest carried in the SHA256 TLV.
    pub hash: [u8; 32],
}

impl GeneratedImage {
    /// Offset of the first TLV entry.
    pub fn tlv_base(&self) -> usize {
        let hdr_size = u16::from_le_bytes([self.data[8], self.data[9]]) as usize;
        let img_size = u32::from_le_bytes([
            self.data[12],
            self.data[13],
            self.data[14],
            self.data[15],
        ]) as usize;
        hdr_size + img_size
    }
}

pub struct GenBuilder {
    /// Size of the zeroed header.
    header_size: usize,
    /// Total size of the image, not counting the TLV.
    size: usize,
    /// Seed for the PRNG
    seed: usize,
    /// Version, as "major.minor.revision+build".
    version: String,
    /// Key to sign with.
    key: Option<SigningKey>,
    /// Extra entries, added after the standard ones.
    extra: Vec<(u16, Vec<u8>)>,
}

impl Default for GenBuilder {
    fn default() -> Self {
        GenBuilder {
            header_size: 256,
            size: 76_137,
            seed: 1,
            version: "0.1.0".to_string(),
            key: None,
            extra: Vec::new(),
        }
    }
}

impl GenBuilder {
    pub fn size(&mut self, size: usize) -> &mut Self {
        self.size = size;
        self
    }

    pub fn seed(&mut self, seed: usize) -> &mut Self {
        self.seed = seed;
        self
    }

    pub fn header_size(&mut self, header_size: usize) -> &mut Self {
        self.header_size = header_size;
        self
    }

    pub fn version(&mut self, version: &str) -> &mut Self {
        self.version = version.to_string();
        self
    }

    pub fn sign(&mut self, key: &SigningKey) -> &mut Self {
        self.key = Some(key.clone());
        self
    }

    pub fn extra_tlv(&mut self, kind: u16, data: &[u8]) -> &mut Self {
        self.extra.push((kind, data.to_vec()));
        self
    }

    pub fn build(&self) -> Result<GeneratedImage> {
        if self.header_size < 32 || self.size < self.header_size {
            return Err(anyhow!(
                "Image of {} bytes can't hold a {} byte header",
                self.size,
                self.header_size
            ));
        }

        let mut rng = Xoshiro256Plus::seed_from_u64(self.seed as u64);
        let mut data = vec![0u8; self.size];
        rng.fill_bytes(&mut data);

        // The header is required to be zeros, so just fill that in.
        data[..self.header_size].fill(0);

        let mut tlv_size = 4 + 4 + 32;
        if self.key.is_some() {
            tlv_size += 4 + 32 + 4 + 64;
        }
        tlv_size += self.extra.iter().map(|(_, d)| 4 + d.len()).sum::<usize>();
        let tlv_size = u16::try_from(tlv_size)?;

        let (major, minor, revision, build) = parse_version(&self.version)?;
        let mut header = Vec::with_capacity(32);
        header.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
        header.extend_from_slice(&tlv_size.to_le_bytes());
        header.push(0);
        header.push(0);
        header.extend_from_slice(&u16::try_from(self.header_size)?.to_le_bytes());
        header.extend_from_slice(&[0, 0]);
        let img_size = u32::try_from(self.size - self.header_size)?;
        header.extend_from_slice(&img_size.to_le_bytes());
        header.extend_from_slice(&F_SHA256.to_le_bytes());
        header.push(major);
        header.push(minor);
        header.extend_from_slice(&revision.to_le_bytes());
        header.extend_from_slice(&build.to_le_bytes());
        header.extend_from_slice(&[0; 4]);
        data[..header.len()].copy_from_slice(&header);

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&Sha256::digest(&data));

        data.extend_from_slice(&TLV_INFO_MAGIC.to_le_bytes());
        data.extend_from_slice(&tlv_size.to_le_bytes());
        push_tlv(&mut data, TLV_SHA256, &hash)?;
        if let Some(key) = &self.key {
            let public = key.verifying_key().to_encoded_point(false);
            push_tlv(&mut data, TLV_KEYHASH, &Sha256::digest(public.as_bytes()))?;
            let signature: Signature = key
                .sign_prehash(&hash)
                .map_err(|e| anyhow!("Signing failed: {}", e))?;
            push_tlv(&mut data, TLV_ECDSA256, &signature.to_bytes())?;
        }
        for (kind, value) in &self.extra {
            push_tlv(&mut data, *kind, value)?;
        }

        Ok(GeneratedImage { data, hash })
    }
}

fn push_tlv(data: &mut Vec<u8>, kind: u16, value: &[u8]) -> Result<()> {
    data.extend_from_slice(&kind.to_le_bytes());
    data.extend_from_slice(&u16::try_from(value.len())?.to_le_bytes());
    data.extend_from_slice(value);
    Ok(())
}

fn parse_version(text: &str) -> Result<(u8, u8, u16, u32)> {
    let (text, build) = match text.split_once('+') {
        Some((text, build)) => (text, build.parse()?),
        None => (text, 0),
    };
    let mut parts = text.split('.');
    let mut next = || parts.next().unwrap_or("0");
    Ok((next().parse()?, next().parse()?, next().parse()?, build))
}

/// A signing key derived from a small seed, for tests.
pub fn test_key(seed: u8) -> Result<SigningKey> {
    let mut bytes = [0u8; 32];
    bytes[31] = seed.max(1);
    bytes[0] = 0x42;
    Ok(SigningKey::from_slice(&bytes)?)
}

/// The SEC1 encoding of the public half of `key`.
pub fn public_key(key: &SigningKey) -> Vec<u8> {
    key.verifying_key().to_encoded_point(false).as_bytes().to_vec()
}
