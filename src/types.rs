// vim: tw=80
//! Common type definitions used throughout zraid

use divbuf::{DivBuf, DivBufMut};
use enum_primitive_derive::Primitive;
use num_traits::ToPrimitive;

/// "Private" trait; only exists to ensure that div_roundup will fail to compile
/// when used with signed numbers.  It would be nice to use a negative trait
/// bound like "+ !Neg", but Rust doesn't support negative trait bounds.
#[doc(hidden)]
pub trait RoundupAble {}
impl RoundupAble for u8 {}
impl RoundupAble for u16 {}
impl RoundupAble for u32 {}
impl RoundupAble for u64 {}
impl RoundupAble for usize {}

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so
/// it can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// Our scatter-gather list.  A slice of reference-counted `IoVec`s.
pub type SGList = Vec<IoVec>;

/// Mutable version of `SGList`.  Uniquely owned.
pub type SGListMut = Vec<IoVecMut>;

/// Indexes a zone on a zoned block device, whether logical or backend.
pub type ZoneT = u32;

/// zraid's error type.  Basically just an errno
#[derive(Clone, Copy, Debug, Eq, PartialEq, Primitive)]
pub enum Error {
    // Standard errnos
    EPERM           = libc::EPERM as isize,
    ENOENT          = libc::ENOENT as isize,
    EIO             = libc::EIO as isize,
    ENXIO           = libc::ENXIO as isize,
    EBADF           = libc::EBADF as isize,
    EBUSY           = libc::EBUSY as isize,
    ENODEV          = libc::ENODEV as isize,
    EINVAL          = libc::EINVAL as isize,
    ENOSPC          = libc::ENOSPC as isize,
    EROFS           = libc::EROFS as isize,
    EOPNOTSUPP      = libc::EOPNOTSUPP as isize,
    EOVERFLOW       = libc::EOVERFLOW as isize,

    //// zraid custom error types below
    EUNKNOWN        = 256,
    /// The backends of a RAID set disagree on block size, zone size, or zone
    /// count.
    EGEOMETRY       = 257,
}

pub type Result<T = ()> = std::result::Result<T, Error>;

impl From<Error> for i32 {
    fn from(e: Error) -> Self {
        match e {
            Error::EUNKNOWN =>
                panic!("Unknown error codes should never be exposed"),
            // Geometry mismatches are a special case of invalid configuration
            Error::EGEOMETRY => Error::EINVAL.to_i32().unwrap(),
            _ => e.to_i32().unwrap()
        }
    }
}

// LCOV_EXCL_STOP
