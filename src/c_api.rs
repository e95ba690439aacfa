#![allow(unsafe_code)]
//! C bindings, enabled by the `c_api` feature.
//!
//! ```c
//! AvifInfoFeatures features;
//! if (avifinfo_get_with_size(data, data_size, &features, file_size) == AVIFINFO_OK) {
//!     printf("%ux%u\n", features.width, features.height);
//! }
//! ```

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{Error, Features};

/// Outcome of a call. Anything but `NotEnoughData` is final for a given file.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvifInfoStatus {
    Ok = 0,
    NotEnoughData = 1,
    TooComplex = 2,
    InvalidFile = 3,
}

impl From<Error> for AvifInfoStatus {
    fn from(err: Error) -> Self {
        match err {
            Error::NotEnoughData => Self::NotEnoughData,
            Error::TooComplex => Self::TooComplex,
            Error::InvalidFile => Self::InvalidFile,
        }
    }
}

impl<T> From<crate::Result<T>> for AvifInfoStatus {
    fn from(result: crate::Result<T>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(err) => err.into(),
        }
    }
}

/// Same fields as [`Features`]. All zero unless the call returned `Ok`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AvifInfoFeatures {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u32,
    pub num_channels: u32,
}

impl From<Features> for AvifInfoFeatures {
    fn from(features: Features) -> Self {
        Self {
            width: features.width,
            height: features.height,
            bit_depth: features.bit_depth,
            num_channels: features.num_channels,
        }
    }
}

/// Checks whether the first `data_size` bytes of a file start like an AVIF file.
///
/// # Safety
///
/// `data` must be null or point to `data_size` readable bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn avifinfo_identify(data: *const u8, data_size: usize) -> AvifInfoStatus {
    // SAFETY: forwarded from the caller.
    match unsafe { input_slice(data, data_size) } {
        Some(data) => crate::identify(data).into(),
        None => AvifInfoStatus::NotEnoughData,
    }
}

/// Extracts the features from the first `data_size` bytes of a file of unknown size.
///
/// # Safety
///
/// `data` must be null or point to `data_size` readable bytes.
/// `features` must be null or point to writable memory.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn avifinfo_get(data: *const u8, data_size: usize, features: *mut AvifInfoFeatures) -> AvifInfoStatus {
    // SAFETY: forwarded from the caller.
    unsafe { avifinfo_get_with_size(data, data_size, features, usize::MAX) }
}

/// Extracts the features from the first `data_size` bytes of a file that is
/// `file_size` bytes long.
///
/// # Safety
///
/// `data` must be null or point to `data_size` readable bytes.
/// `features` must be null or point to writable memory.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn avifinfo_get_with_size(
    data: *const u8, data_size: usize, features: *mut AvifInfoFeatures, file_size: usize,
) -> AvifInfoStatus {
    // SAFETY: the caller guarantees `features` is null or writable.
    let mut output = unsafe { features.as_mut() };
    if let Some(output) = output.as_deref_mut() {
        *output = AvifInfoFeatures::default();
    }
    // SAFETY: forwarded from the caller.
    let Some(data) = (unsafe { input_slice(data, data_size) }) else {
        return AvifInfoStatus::NotEnoughData;
    };
    match crate::get_features_with_size(data, file_size) {
        Ok(parsed) => {
            if let Some(output) = output {
                *output = parsed.into();
            }
            AvifInfoStatus::Ok
        },
        Err(err) => err.into(),
    }
}

/// # Safety
///
/// `data` must be null or point to `data_size` readable bytes that outlive `'a`.
unsafe fn input_slice<'a>(data: *const u8, data_size: usize) -> Option<&'a [u8]> {
    if data.is_null() {
        return None;
    }
    // SAFETY: non-null, and the caller guarantees the length.
    Some(unsafe { std::slice::from_raw_parts(data, data_size) })
}

#[cfg(test)]
mod tests {
    use super::{AvifInfoFeatures, AvifInfoStatus, avifinfo_get, avifinfo_get_with_size, avifinfo_identify};
    use crate::tests::MINIMAL_AVIF;

    #[test]
    fn get() {
        let mut features = AvifInfoFeatures::default();
        let status = unsafe { avifinfo_get(MINIMAL_AVIF.as_ptr(), MINIMAL_AVIF.len(), &mut features) };
        assert_eq!(status, AvifInfoStatus::Ok);
        assert_eq!(features, AvifInfoFeatures { width: 1, height: 1, bit_depth: 8, num_channels: 3 });
    }

    #[test]
    fn null_features() {
        let status = unsafe { avifinfo_get(MINIMAL_AVIF.as_ptr(), MINIMAL_AVIF.len(), std::ptr::null_mut()) };
        assert_eq!(status, AvifInfoStatus::Ok);
    }

    #[test]
    fn null_data() {
        let mut features = AvifInfoFeatures { width: 7, height: 7, bit_depth: 7, num_channels: 7 };
        let status = unsafe { avifinfo_get(std::ptr::null(), 10, &mut features) };
        assert_eq!(status, AvifInfoStatus::NotEnoughData);
        assert_eq!(features, AvifInfoFeatures::default());
        assert_eq!(unsafe { avifinfo_identify(std::ptr::null(), 10) }, AvifInfoStatus::NotEnoughData);
    }

    #[test]
    fn failure_zeroes_features() {
        let mut features = AvifInfoFeatures { width: 7, height: 7, bit_depth: 7, num_channels: 7 };
        let truncated = &MINIMAL_AVIF[..MINIMAL_AVIF.len() - 1];
        let status = unsafe { avifinfo_get_with_size(truncated.as_ptr(), truncated.len(), &mut features, MINIMAL_AVIF.len()) };
        assert_eq!(status, AvifInfoStatus::NotEnoughData);
        assert_eq!(features, AvifInfoFeatures::default());

        let status = unsafe { avifinfo_get_with_size(truncated.as_ptr(), truncated.len(), &mut features, truncated.len()) };
        assert_eq!(status, AvifInfoStatus::InvalidFile);
    }

    #[test]
    fn identify() {
        let status = unsafe { avifinfo_identify(MINIMAL_AVIF.as_ptr(), 16) };
        assert_eq!(status, AvifInfoStatus::Ok);
        let status = unsafe { avifinfo_identify(MINIMAL_AVIF.as_ptr(), 10) };
        assert_eq!(status, AvifInfoStatus::NotEnoughData);
    }
}
