#![no_main]

use libfuzzer_sys::fuzz_target;
use zenavif_info::{Error, get_details, get_features, identify};

/// Feeds growing prefixes of the input. Once a prefix gives an answer other
/// than NotEnoughData, every longer prefix must give the same answer.
fuzz_target!(|data: &[u8]| {
    let mut previous_identity = Err(Error::NotEnoughData);
    let mut previous_features = Err(Error::NotEnoughData);
    let mut previous_details = Err(Error::NotEnoughData);

    let mut size = 0;
    while size <= data.len() {
        let prefix = &data[..size];
        let identity = identify(prefix);
        let features = get_features(prefix);
        assert_eq!(features, get_features(prefix));

        if previous_identity != Err(Error::NotEnoughData) {
            assert_eq!(identity, previous_identity);
        }
        if previous_features != Err(Error::NotEnoughData) {
            assert_eq!(features, previous_features);
        }
        let details = get_details(prefix);
        if previous_details != Err(Error::NotEnoughData) {
            assert_eq!(details, previous_details);
        }
        if let Ok(d) = details {
            assert_eq!(features, Ok(d.features));
            let location = d.primary_item_id_location;
            assert!(location.offset + usize::from(location.num_bytes) <= prefix.len());
        }
        if let Ok(f) = features {
            assert!(identity.is_ok());
            assert!(f.width != 0 && f.height != 0 && f.bit_depth != 0 && f.num_channels != 0);
        }
        previous_identity = identity;
        previous_features = features;
        previous_details = details;

        // Headers rarely need more than a few kilobytes.
        size += if size < 4096 { 1 } else { 512 };
    }
});
