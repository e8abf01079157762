//! AsRaw provides a safe way to view an on-flash record as its bytes, and an
//! unsafe way to have this as a mutable view.  Generally, this is safe and
//! meaningful for structures that are repr(C).  `as_mut_raw` is only safe in
//! this case.
//!
//! Flash records are rarely read with exactly their own size.  The status
//! trailer, for instance, pads every field out to the device write size.  The
//! `copy_to` and `copy_from` helpers move a record in and out of such larger
//! buffers.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

use core::{mem, slice};

pub trait AsRaw: Sized {
    fn as_raw(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self as *const _ as *const u8, mem::size_of::<Self>()) }
    }

    /// Copy the raw bytes of this record to the start of `dest`, returning the
    /// number of bytes written, or None if `dest` is too short.
    fn copy_to(&self, dest: &mut [u8]) -> Option<usize> {
        let raw = self.as_raw();
        dest.get_mut(..raw.len())?.copy_from_slice(raw);
        Some(raw.len())
    }
}

/// Provide a view into a structure.  This is an unsafe trait, because, in
/// general, it isn't safe to interpret arbitrary bytes as another type.
/// However, if the struct is `repr(C)`, and all types used are valid for all
/// possible values, this will be safe.
pub unsafe trait AsMutRaw: Sized {
    fn as_mut_raw(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self as *mut _ as *mut u8, mem::size_of::<Self>()) }
    }

    /// Build a record from the start of `src`.  Trailing bytes are ignored.
    /// Returns None if `src` is shorter than the record.
    fn copy_from(src: &[u8]) -> Option<Self>
    where
        Self: Default,
    {
        let mut item = Self::default();
        let raw = item.as_mut_raw();
        raw.copy_from_slice(src.get(..raw.len())?);
        Some(item)
    }
}
