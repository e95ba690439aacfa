// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

macro_rules! box_database {
    ($($(#[$attr:meta])* $boxenum:ident $boxtype:literal),*,) => {
        /// Kind of a box, decoded once from its four-character code.
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub enum BoxType {
            $($(#[$attr])* $boxenum),*,
            /// Any box this crate has no interest in.
            UnknownBox(u32),
            /// A known full box whose version is not supported. It never
            /// compares equal to the known kind so readers skip it.
            UnparsableBox(u32),
        }

        impl From<u32> for BoxType {
            fn from(t: u32) -> BoxType {
                use self::BoxType::*;
                match t {
                    $($(#[$attr])* $boxtype => $boxenum),*,
                    _ => UnknownBox(t),
                }
            }
        }

        impl From<BoxType> for u32 {
            fn from(b: BoxType) -> u32 {
                use self::BoxType::*;
                match b {
                    $($(#[$attr])* $boxenum => $boxtype),*,
                    UnknownBox(t) | UnparsableBox(t) => t,
                }
            }
        }

        impl fmt::Debug for BoxType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let fourcc = FourCC::from(*self);
                match self {
                    BoxType::UnparsableBox(_) => write!(f, "{fourcc} (unsupported version)"),
                    _ => write!(f, "{fourcc}"),
                }
            }
        }
    }
}

/// A four-character code, as found in box headers.
#[derive(PartialEq, Eq, Clone, Copy)]
pub struct FourCC {
    pub value: [u8; 4],
}

impl From<u32> for FourCC {
    fn from(number: u32) -> FourCC {
        FourCC { value: number.to_be_bytes() }
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> FourCC {
        From::from(u32::from(t))
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &byte in &self.value {
            if byte.is_ascii_graphic() || byte == b' ' {
                write!(f, "{}", char::from(byte))?;
            } else {
                write!(f, "\\x{byte:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{self}'")
    }
}

box_database!(
    FileTypeBox                       0x6674_7970, // "ftyp"
    MetadataBox                       0x6d65_7461, // "meta"
    PrimaryItemBox                    0x7069_746d, // "pitm"
    ItemInfoBox                       0x6969_6e66, // "iinf"
    ItemInfoEntry                     0x696e_6665, // "infe"
    ItemReferenceBox                  0x6972_6566, // "iref"
    DerivedImageReference             0x6469_6d67, // "dimg"
    ItemPropertiesBox                 0x6970_7270, // "iprp"
    ItemPropertyContainerBox          0x6970_636f, // "ipco"
    ItemPropertyAssociationBox        0x6970_6d61, // "ipma"
    ImageSpatialExtentsBox            0x6973_7065, // "ispe"
    PixelInformationBox               0x7069_7869, // "pixi"
    AV1CodecConfigurationBox          0x6176_3143, // "av1C"
    AuxiliaryTypeProperty             0x6175_7843, // "auxC"
);

impl BoxType {
    /// Highest supported version if this kind starts with a version and
    /// flags header (a "full box"), `None` for plain boxes.
    ///
    /// See AV1 Image File Format (AVIF) § 8.1
    #[must_use]
    pub fn max_fullbox_version(self) -> Option<u8> {
        match self {
            BoxType::MetadataBox
            | BoxType::ImageSpatialExtentsBox
            | BoxType::PixelInformationBox
            | BoxType::AuxiliaryTypeProperty => Some(0),
            BoxType::PrimaryItemBox
            | BoxType::ItemPropertyAssociationBox
            | BoxType::ItemReferenceBox => Some(1),
            _ => None,
        }
    }
}
