// Image testing.

use std::cell::RefCell;

use boot::{Error, Image, ImageHeader, P256Keys, TlvKind, ValidationMode};
use proptest::prelude::*;
use simflash::{
    gen::{public_key, test_key, GenBuilder},
    styles, SimFlash,
};

mod common;

fn install(data: &[u8]) -> RefCell<SimFlash> {
    let mut flash = styles::K64.primary.build().unwrap();
    flash.install(data, 0).unwrap();
    RefCell::new(flash)
}

#[test]
fn image_test() {
    common::init_logging();
    for dev in styles::all_devices() {
        let dev = dev.unwrap();
        let rig = common::Rig::new(dev);
        common::install_pair(&rig);

        // Validate that these are good images.
        let image = Image::from_flash(&rig.primary).unwrap();
        image.validate(&ValidationMode::DigestOnly).unwrap();
        let uimage = Image::from_flash(&rig.secondary).unwrap();
        uimage.validate(&ValidationMode::DigestOnly).unwrap();

        println!("---");
        println!("{} main: {:x?}", rig.name, image.header);
        println!("{} upgrade: {:x?}", rig.name, uimage.header);

        let geometry = *rig.loader().geometry();
        assert!(image.full_image_size() <= geometry.image_area);
        assert!(uimage.full_image_size() <= geometry.image_area);
        assert!(image.header.version() < uimage.header.version());
        assert_eq!(image.header.flags() & ImageHeader::F_SHA256, ImageHeader::F_SHA256);
    }
}

#[test]
fn tampered_payload() {
    let img = GenBuilder::default().size(20_000).build().unwrap();
    let flash = install(&img.data);
    assert_eq!(
        Image::from_flash(&flash)
            .unwrap()
            .validate(&ValidationMode::DigestOnly),
        Ok(img.hash)
    );

    flash.borrow_mut().corrupt(12_345, 0x01);
    assert_eq!(
        Image::from_flash(&flash)
            .unwrap()
            .validate(&ValidationMode::DigestOnly),
        Err(Error::IntegrityFailed)
    );
}

#[test]
fn tampered_digest() {
    let img = GenBuilder::default().size(20_000).build().unwrap();
    let flash = install(&img.data);
    // The SHA256 value follows the info header and its entry header.
    flash.borrow_mut().corrupt(img.tlv_base() + 8, 0x80);
    assert_eq!(
        Image::from_flash(&flash)
            .unwrap()
            .validate(&ValidationMode::DigestOnly),
        Err(Error::IntegrityFailed)
    );
}

#[test]
fn bad_headers() {
    let img = GenBuilder::default().size(20_000).build().unwrap();

    // Magic.
    let flash = install(&img.data);
    flash.borrow_mut().corrupt(0, 0xff);
    assert_eq!(Image::from_flash(&flash).err(), Some(Error::InvalidHeader));

    // TLV info magic.
    let flash = install(&img.data);
    flash.borrow_mut().corrupt(img.tlv_base(), 0x01);
    assert_eq!(Image::from_flash(&flash).err(), Some(Error::InvalidHeader));

    // Header and TLV sizes that disagree.
    let flash = install(&img.data);
    flash.borrow_mut().corrupt(4, 0x04);
    assert_eq!(Image::from_flash(&flash).err(), Some(Error::InvalidHeader));

    // Payload larger than the device.
    let flash = install(&img.data);
    flash.borrow_mut().corrupt(15, 0x10);
    assert_eq!(Image::from_flash(&flash).err(), Some(Error::InvalidHeader));

    // Blank flash.
    let flash = install(&[]);
    assert_eq!(Image::from_flash(&flash).err(), Some(Error::InvalidHeader));
}

#[test]
fn unknown_tlvs_skipped() {
    let img = GenBuilder::default()
        .size(3_000)
        .extra_tlv(0x0050, &[1, 2, 3])
        .extra_tlv(0x7fff, &[])
        .build()
        .unwrap();
    let flash = install(&img.data);
    let image = Image::from_flash(&flash).unwrap();

    let entries: Vec<_> = image
        .tlvs()
        .map(|e| {
            let e = e.unwrap();
            (e.kind(), e.data_len())
        })
        .collect();
    assert_eq!(
        entries,
        [(TlvKind::SHA256, 32), (TlvKind(0x0050), 3), (TlvKind(0x7fff), 0)]
    );
    // Restartable.
    assert_eq!(image.tlvs().count(), 3);
    image.validate(&ValidationMode::DigestOnly).unwrap();
}

#[test]
fn duplicate_digest() {
    let plain = GenBuilder::default().size(3_000).build().unwrap();
    let img = GenBuilder::default()
        .size(3_000)
        .extra_tlv(TlvKind::SHA256.0, &plain.hash)
        .build()
        .unwrap();
    let flash = install(&img.data);
    assert_eq!(
        Image::from_flash(&flash)
            .unwrap()
            .validate(&ValidationMode::DigestOnly),
        Err(Error::IntegrityFailed)
    );
}

#[test]
fn signatures() {
    let key = test_key(1).unwrap();
    let other = test_key(2).unwrap();

    let mut keys = P256Keys::new();
    keys.add(&public_key(&key)).unwrap();
    let mode = ValidationMode::DigestAndSignature(&keys);

    let signed = GenBuilder::default().size(10_000).sign(&key).build().unwrap();
    let flash = install(&signed.data);
    assert_eq!(Image::from_flash(&flash).unwrap().validate(&mode), Ok(signed.hash));

    // Unsigned.
    let plain = GenBuilder::default().size(10_000).build().unwrap();
    let flash = install(&plain.data);
    let image = Image::from_flash(&flash).unwrap();
    assert_eq!(image.validate(&mode), Err(Error::IntegrityFailed));
    assert!(image.validate(&ValidationMode::DigestOnly).is_ok());

    // Signed by a key we don't know.
    let stranger = GenBuilder::default().size(10_000).sign(&other).build().unwrap();
    let flash = install(&stranger.data);
    assert_eq!(
        Image::from_flash(&flash).unwrap().validate(&mode),
        Err(Error::IntegrityFailed)
    );

    // Broken signature, from the right key.
    let flash = install(&signed.data);
    let sig = signed.data.len() - 20;
    flash.borrow_mut().corrupt(sig, 0x04);
    assert_eq!(
        Image::from_flash(&flash).unwrap().validate(&mode),
        Err(Error::IntegrityFailed)
    );
}

#[test]
fn signature_over_digest() {
    use p256::ecdsa::signature::{hazmat::PrehashVerifier, Signer};
    use p256::ecdsa::Signature;

    let key = test_key(1).unwrap();
    let mut keys = P256Keys::new();
    keys.add(&public_key(&key)).unwrap();
    let mode = ValidationMode::DigestAndSignature(&keys);

    // The signature is the last entry, and is made over the digest itself.
    let signed = GenBuilder::default().size(10_000).sign(&key).build().unwrap();
    let sig_pos = signed.data.len() - 64;
    let sig = Signature::from_slice(&signed.data[sig_pos..]).unwrap();
    key.verifying_key().verify_prehash(&signed.hash, &sig).unwrap();

    // One made over the digest of the digest is not accepted.
    let rehashed: Signature = key.sign(&signed.hash);
    let mut data = signed.data.clone();
    data[sig_pos..].copy_from_slice(&rehashed.to_bytes());
    let flash = install(&data);
    assert_eq!(
        Image::from_flash(&flash).unwrap().validate(&mode),
        Err(Error::IntegrityFailed)
    );
}

#[test]
fn key_store() {
    let mut keys = P256Keys::new();
    assert!(keys.is_empty());
    assert_eq!(keys.add(&[0x04; 65]), Err(Error::InvalidKey));
    assert_eq!(keys.add(&[]), Err(Error::InvalidKey));
    for seed in 1..=4 {
        keys.add(&public_key(&test_key(seed).unwrap())).unwrap();
    }
    assert_eq!(keys.len(), 4);
    assert_eq!(
        keys.add(&public_key(&test_key(5).unwrap())),
        Err(Error::InvalidKey)
    );
}

proptest! {
    #[test]
    fn header_parser_total(data in proptest::collection::vec(any::<u8>(), 0..600)) {
        let mut flash = SimFlash::new(1, 4, 1024, 1).unwrap();
        flash.install(&data, 0).unwrap();
        let flash = RefCell::new(flash);
        if let Ok(image) = Image::from_flash(&flash) {
            prop_assert!(image.full_image_size() <= 1024);
            for entry in image.tlvs() {
                if entry.is_err() {
                    break;
                }
            }
            let _ = image.validate(&ValidationMode::DigestOnly);
        }
    }

    #[test]
    fn header_fields_fuzzed(offset in 0usize..32, xor in 1u8..=255) {
        let img = GenBuilder::default().size(300).header_size(32).build().unwrap();
        let flash = install(&img.data);
        flash.borrow_mut().corrupt(offset, xor);
        match Image::from_flash(&flash) {
            Ok(image) => {
                // Fields that pass the layout checks are still covered by
                // the digest.
                prop_assert_eq!(
                    image.validate(&ValidationMode::DigestOnly),
                    Err(Error::IntegrityFailed)
                );
            }
            Err(e) => {
                prop_assert_eq!(e, Error::InvalidHeader);
            }
        }
    }
}
