//! The boot entry point.

use log::{error, info, warn};
use storage::Flash;

use crate::{
    config::BootConfig,
    image::{Image, ImageHeader},
    resolve::{resolve, Decision, SwapRequest, SwapType},
    slots::{Geometry, Slot, Slots},
    status::{Flag, Ledger, Trailer, TrailerStore},
    swap::Swapper,
    Error, MappedFlash, Result,
};

/// What to boot.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BootResponse {
    /// The slot holding the image, primary unless falling back.
    pub slot: Slot,
    /// The exchange performed, or finished, during this boot.
    pub swap_type: SwapType,
    pub header: ImageHeader,
}

pub struct BootLoader<'f, 'k, F> {
    slots: Slots<'f, F>,
    geometry: Geometry,
    config: BootConfig<'k>,
}

impl<'f, 'k, F: Flash> BootLoader<'f, 'k, F> {
    pub fn new(slots: Slots<'f, F>, config: BootConfig<'k>) -> Result<BootLoader<'f, 'k, F>> {
        let geometry = Geometry::from_slots(&slots)?;
        Ok(BootLoader {
            slots,
            geometry,
            config,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn primary_trailer(&self) -> TrailerStore<'f, F> {
        TrailerStore::new(self.slots.primary, self.geometry.primary)
    }

    pub fn secondary_trailer(&self) -> TrailerStore<'f, F> {
        TrailerStore::new(self.slots.secondary, self.geometry.secondary)
    }

    /// Parse the image in a slot.
    pub fn image(&self, slot: Slot) -> Result<Image<'f, F>> {
        Image::from_flash_within(self.slots.get(slot), self.geometry.image_area)
    }

    /// Work out what a boot would do, without changing anything.
    pub fn decide(&self, request: Option<SwapRequest>) -> Result<Decision> {
        let trailer = self.read_trailer()?;
        let pending = self.pending_request()?;
        Ok(resolve(trailer.as_ref(), request, pending))
    }

    /// Perform this boot: finish or start any exchange, and pick the image
    /// to run.  `request` asks for an upgrade without one being stored in
    /// the secondary slot.  It is only acted on while the primary slot has no
    /// trailer; use [`BootLoader::request_swap`] to upgrade again after a
    /// finished exchange.
    pub fn boot_go(&self, request: Option<SwapRequest>) -> Result<BootResponse> {
        let trailer = self.read_trailer()?;
        let pending = self.pending_request()?;
        let decision = resolve(trailer.as_ref(), request, pending);
        info!("Boot decision: {:?}", decision);

        let performed = match (decision, trailer) {
            (Decision::Start(request), _) => self.start(request, pending.is_some())?,
            (Decision::Resume(swap_type), Some(trailer)) => {
                info!("Resuming interrupted {:?} swap", swap_type);
                self.finish(&trailer, pending.is_some())?;
                swap_type
            }
            (Decision::Revert, Some(trailer)) => {
                info!("Test image not confirmed, reverting");
                self.primary_trailer().set_flag(Flag::Revert)?;
                let trailer = Trailer {
                    revert: true,
                    ..trailer
                };
                self.finish(&trailer, false)?;
                SwapType::Revert
            }
            (Decision::Clear, _) => {
                self.primary_trailer().clear()?;
                SwapType::None
            }
            _ => SwapType::None,
        };

        self.select(performed)
    }

    /// Accept the running image, so that it is not reverted.
    pub fn confirm(&self) -> Result<()> {
        let primary = self.primary_trailer();
        match primary.read()? {
            Some(trailer) if trailer.copy_done && !trailer.revert && !trailer.image_ok => {
                info!("Image confirmed");
                primary.set_flag(Flag::ImageOk)
            }
            _ => Ok(()),
        }
    }

    /// Ask for the image in the secondary slot to be swapped in on the next
    /// boot.
    pub fn request_swap(&self, request: SwapRequest) -> Result<()> {
        info!("Requesting {:?} upgrade", request);
        self.secondary_trailer().write_request(request)
    }

    fn read_trailer(&self) -> Result<Option<Trailer>> {
        match self.primary_trailer().read() {
            Err(Error::TrailerCorrupt) => {
                warn!("Primary trailer corrupt, ignoring");
                Ok(None)
            }
            other => other,
        }
    }

    fn pending_request(&self) -> Result<Option<SwapRequest>> {
        match self.secondary_trailer().read_request() {
            Err(Error::TrailerCorrupt) => {
                warn!("Secondary trailer corrupt, ignoring request");
                Ok(None)
            }
            other => other,
        }
    }

    fn start(&self, request: SwapRequest, pending: bool) -> Result<SwapType> {
        let upgrade = self.image(Slot::Secondary).and_then(|image| {
            image.validate(&self.config.validation)?;
            Ok(image.full_image_size())
        });
        let upgrade = match upgrade {
            Ok(size) => size,
            Err(Error::Flash(e)) => return Err(Error::Flash(e)),
            Err(e) => {
                warn!("Secondary image rejected ({:?}), dropping request", e);
                if pending {
                    self.secondary_trailer().clear()?;
                }
                return Ok(SwapType::None);
            }
        };
        let current = match self.image(Slot::Primary) {
            Ok(image) => image.full_image_size(),
            Err(Error::Flash(e)) => return Err(Error::Flash(e)),
            Err(_) => 0,
        };

        let swap_size = upgrade.max(current);
        info!(
            "Starting {:?} swap of 0x{:x} bytes",
            request.swap_type(),
            swap_size
        );
        // The image area is far below 4GiB on any supported device.
        let trailer = Trailer::new(request.swap_type(), swap_size as u32);
        self.primary_trailer().write(&trailer)?;
        self.finish(&trailer, pending)?;
        Ok(request.swap_type())
    }

    /// Run the exchange the trailer records to the end.
    fn finish(&self, trailer: &Trailer, pending: bool) -> Result<()> {
        let status = self.primary_trailer();
        let ledger = trailer.ledger();
        if ledger == Ledger::Forward && pending {
            // The swap is recorded in the primary trailer now.
            self.secondary_trailer().clear()?;
        }

        Swapper::new(&self.slots, &self.geometry, &status)
            .run(ledger, trailer.swap_size as usize)?;

        match ledger {
            Ledger::Forward => status.set_flag(Flag::CopyDone)?,
            Ledger::Revert => {
                status.set_flag(Flag::RevertDone)?;
                status.clear()?;
            }
        }
        info!("Swap complete");
        Ok(())
    }

    /// Pick the image to run.
    fn select(&self, performed: SwapType) -> Result<BootResponse> {
        let error = match self.validated(Slot::Primary) {
            Ok(header) => {
                return Ok(BootResponse {
                    slot: Slot::Primary,
                    swap_type: performed,
                    header,
                })
            }
            Err(e) => e,
        };

        if performed != SwapType::None {
            error!(
                "Image failed verification after {:?} swap: {:?}",
                performed, error
            );
            return Err(error);
        }
        warn!("Primary image unusable: {:?}", error);

        if self.config.secondary_bootable {
            if let Ok(header) = self.validated(Slot::Secondary) {
                warn!("Booting from secondary slot");
                return Ok(BootResponse {
                    slot: Slot::Secondary,
                    swap_type: performed,
                    header,
                });
            }
        }
        error!("No bootable image");
        Err(Error::NoBootableImage)
    }

    fn validated(&self, slot: Slot) -> Result<ImageHeader> {
        let image = self.image(slot)?;
        image.validate(&self.config.validation)?;
        Ok(image.header)
    }
}

impl<'f, 'k, F: Flash + MappedFlash> BootLoader<'f, 'k, F> {
    /// The address to jump to for an image in memory mapped flash.
    pub fn image_base(&self, response: &BootResponse) -> usize {
        self.slots.get(response.slot).borrow().get_base() + response.header.hdr_size()
    }
}
