#![no_main]

use libfuzzer_sys::fuzz_target;
use zenavif_info::c_api::{AvifInfoFeatures, AvifInfoStatus, avifinfo_get_with_size};
use zenavif_info::get_features_with_size;

/// The first four bytes are the declared file size, the rest is the file.
fuzz_target!(|data: &[u8]| {
    let Some((size, file)) = data.split_first_chunk::<4>() else {
        return;
    };
    let file_size = u32::from_le_bytes(*size) as usize;

    let result = get_features_with_size(file, file_size);
    // Bytes past the declared end are ignored.
    let within = &file[..file.len().min(file_size)];
    if !within.is_empty() {
        assert_eq!(result, get_features_with_size(within, file_size));
    }

    let mut features = AvifInfoFeatures { width: 1, height: 1, bit_depth: 1, num_channels: 1 };
    let status = unsafe { avifinfo_get_with_size(file.as_ptr(), file.len(), &mut features, file_size) };
    match result {
        Ok(parsed) => {
            assert_eq!(status, AvifInfoStatus::Ok);
            assert_eq!(features, AvifInfoFeatures::from(parsed));
        },
        Err(err) => {
            assert_eq!(status, AvifInfoStatus::from(err));
            assert_eq!(features, AvifInfoFeatures::default());
        },
    }
});
