//! Deciding what a boot should do.

use crate::status::Trailer;

/// The kind of exchange a boot performs.  The values are the ones stored in
/// the trailer.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum SwapType {
    /// Boot the primary image as it is.
    None = 1,
    /// Swap, and swap back on the next boot unless the new image confirms.
    Test = 2,
    /// Swap for good.
    Perm = 3,
    /// Swap an unconfirmed test image back out.
    Revert = 4,
}

impl SwapType {
    pub fn from_raw(value: u8) -> Option<SwapType> {
        match value {
            1 => Some(SwapType::None),
            2 => Some(SwapType::Test),
            3 => Some(SwapType::Perm),
            4 => Some(SwapType::Revert),
            _ => None,
        }
    }
}

/// An upgrade asked for by the application.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SwapRequest {
    Test,
    Perm,
}

impl SwapRequest {
    pub fn swap_type(self) -> SwapType {
        match self {
            SwapRequest::Test => SwapType::Test,
            SwapRequest::Perm => SwapType::Perm,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Decision {
    /// Boot what is in the primary slot.
    None,
    /// Start a new exchange.
    Start(SwapRequest),
    /// An exchange was interrupted; finish it.
    Resume(SwapType),
    /// The test image was never confirmed; swap it back out.
    Revert,
    /// A revert finished but its trailer remains; erase it.
    Clear,
}

impl Decision {
    pub fn swap_type(&self) -> SwapType {
        match self {
            Decision::None | Decision::Clear => SwapType::None,
            Decision::Start(request) => request.swap_type(),
            Decision::Resume(swap_type) => *swap_type,
            Decision::Revert => SwapType::Revert,
        }
    }
}

/// Combine the primary trailer with any pending request.
///
/// This has no effects, the same inputs always give the same decision.  An
/// unfinished exchange always wins over a new request.  A request passed to
/// the boot only starts an exchange when there is no primary trailer at all,
/// so booting again with the same request does not undo a settled one.  A
/// request stored in the secondary slot is consumed once taken up, and may
/// start an exchange over a settled trailer.
pub fn resolve(
    primary: Option<&Trailer>,
    transient: Option<SwapRequest>,
    persisted: Option<SwapRequest>,
) -> Decision {
    let request = match primary {
        None => transient.or(persisted),
        Some(trailer) => {
            if !trailer.swap_done() {
                return Decision::Resume(trailer.effective_type());
            }
            if trailer.revert {
                return Decision::Clear;
            }
            if trailer.swap_type == SwapType::Test && !trailer.image_ok {
                return Decision::Revert;
            }
            persisted
        }
    };

    match request {
        Some(request) => Decision::Start(request),
        None => Decision::None,
    }
}
