#![deny(unsafe_code)]
//! Extracts the dimensions, bit depth and channel count of an AVIF image
//! from the first bytes of the file, without decoding anything.
//!
//! Only the ISOBMFF box structure is walked. Every call is bounded: at most
//! 4096 boxes are looked at, nothing is allocated and nothing is read past
//! the bytes given. A prefix that is too short yields
//! [`Error::NotEnoughData`], so callers can feed a growing download until an
//! answer comes out.
//!
//! ```rust
//! use zenavif_info::{Error, get_features};
//!
//! // Not even a box size yet.
//! assert_eq!(get_features(b"\0\0\0"), Err(Error::NotEnoughData));
//! ```
//!
//! ```rust,no_run
//! let data = std::fs::read("image.avif")?;
//! let features = zenavif_info::get_features_with_size(&data[..data.len().min(1024)], data.len())?;
//! println!("{}x{}", features.width, features.height);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use bitreader::BitReader;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace, warn};

use std::panic::Location;

mod boxes;
use crate::boxes::{BoxType, FourCC};

/// This crate can be used from C.
#[cfg(feature = "c_api")]
pub mod c_api;

/// A trait to indicate a type can be infallibly converted to `usize`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

/// Statically verify that the given type can fit within a `usize`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self.try_into().ok().unwrap()
            }
        }
    };
}

impl_to_usize_from!(u32);

// To ensure we don't use stdlib allocating types by accident
#[allow(dead_code)]
struct Vec;
#[allow(dead_code)]
struct Box;
#[allow(dead_code)]
struct HashMap;
#[allow(dead_code)]
struct String;

/// Describes why the features could not be extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Everything seen so far is fine, but more bytes are needed.
    /// Retrying with a longer prefix of the same file may succeed.
    NotEnoughData,
    /// The file looked fine until it became too complex to keep going
    /// within the box budget, or a size overflowed.
    TooComplex,
    /// The bytes are not a valid AVIF file, or the file lacks the
    /// information. Retrying with more bytes will not help.
    InvalidFile,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NotEnoughData => "not enough data",
            Self::TooComplex => "too complex",
            Self::InvalidFile => "invalid AVIF file",
        })
    }
}

impl std::error::Error for Error {}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        let kind = match err {
            Error::NotEnoughData => std::io::ErrorKind::UnexpectedEof,
            Error::InvalidFile => std::io::ErrorKind::InvalidData,
            Error::TooComplex => std::io::ErrorKind::Other,
        };
        Self::new(kind, err)
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Structural information about the primary image item.
///
/// Only ever returned with all fields nonzero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    /// In pixels. Mirroring, rotation and cropping are ignored.
    pub width: u32,
    /// In pixels.
    pub height: u32,
    /// Bits per channel, likely 8, 10 or 12.
    pub bit_depth: u32,
    /// 1 for monochrome or 3 for color, plus 1 if there is an alpha plane.
    pub num_channels: u32,
}

impl Features {
    fn has_dimensions(&self) -> bool {
        self.width != 0 && self.height != 0
    }

    fn is_complete(&self) -> bool {
        self.has_dimensions() && self.bit_depth != 0 && self.num_channels != 0
    }
}

/// Where the primary item id is stored in the file, for tools that rewrite
/// it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryItemIdLocation {
    /// From the start of the file.
    pub offset: usize,
    /// 2 or 4.
    pub num_bytes: u8,
}

/// [`Features`] plus what else the metadata says about the primary item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Details {
    pub features: Features,
    pub primary_item_id: u32,
    pub primary_item_id_location: PrimaryItemIdLocation,
    /// The item holding an HDR gain map for the primary item, if any.
    pub gainmap_item_id: Option<u32>,
}

/// Why a search stopped without an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    /// The input is fine so far but lacks what was looked for, at least here.
    NotFound,
    /// The input is fine so far but the bytes ran out.
    Truncated,
    /// Stopped to stay within the box budget or to avoid an overflow.
    Aborted,
    /// The input is malformed.
    Invalid,
}

type ParseResult<T> = std::result::Result<T, Status>;

#[cold]
#[track_caller]
fn fail<T>(status: Status, why: &'static str) -> ParseResult<T> {
    if status != Status::NotFound {
        debug!("{status:?} at {}: {why}", Location::caller());
    }
    Err(status)
}

#[inline]
#[track_caller]
fn ensure(condition: bool, status: Status, why: &'static str) -> ParseResult<()> {
    if condition {
        Ok(())
    } else {
        fail(status, why)
    }
}

impl From<bitreader::BitReaderError> for Status {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::Invalid
    }
}

/// Box sizes, positions and the file size are all `u32`.
/// Larger inputs are clamped to this.
const MAX_SIZE: u32 = u32::MAX;

/// Headers parsed per call before giving up. Bounds the work done on
/// adversarial inputs such as millions of tiny boxes.
const MAX_NUM_BOXES: u32 = 4096;

const ALPHA_URN_SIZE: u32 = 44;
/// Null-terminated. See AV1 Image File Format (AVIF) § 4
const ALPHA_URN: &[u8; ALPHA_URN_SIZE as usize] = b"urn:mpeg:mpegB:cicp:systems:auxiliary:alpha\0";

const GAINMAP_URN_SIZE: u32 = 29;
/// Null-terminated. Marks a gain map in files written by Adobe tools.
const GAINMAP_URN: &[u8; GAINMAP_URN_SIZE as usize] = b"urn:com:photo:aux:hdrgainmap\0";

/// Decodes 1 to 4 big-endian bytes.
fn read_big_endian(bytes: &[u8]) -> u32 {
    match bytes.len() {
        1 => u32::from(bytes[0]),
        2 => u32::from(BigEndian::read_u16(bytes)),
        3 => BigEndian::read_u24(bytes),
        4 => BigEndian::read_u32(bytes),
        n => unreachable!("{n} bytes do not fit in a u32"),
    }
}

fn clamp_size(size: usize) -> u32 {
    u32::try_from(size).unwrap_or(MAX_SIZE)
}

/// Shared by every box parsed during one top-level call.
#[derive(Debug, Default)]
struct ParseState {
    num_parsed_boxes: u32,
}

impl ParseState {
    fn count_box(&mut self) -> ParseResult<()> {
        self.num_parsed_boxes = self.num_parsed_boxes.saturating_add(1);
        ensure(self.num_parsed_boxes <= MAX_NUM_BOXES, Status::Aborted, "too many boxes")
    }
}

/// A validated box header.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy)]
struct BoxHeader {
    /// `UnparsableBox` if this full box has an unsupported version.
    name: BoxType,
    /// Size of the whole box, header included.
    size: u32,
    /// Always 0 for plain boxes.
    version: u8,
    /// 24 bits. Always 0 for plain boxes.
    flags: u32,
    /// Start of the content, relative to the start of the enclosing container.
    content_offset: u32,
    content_size: u32,
}

/// A run of sibling boxes: the whole file, or the content of one box.
#[derive(Clone, Copy)]
struct Container<'a> {
    /// What is available now. Never longer than `size`.
    bytes: &'a [u8],
    /// What was declared, which may be more than what is available.
    size: u32,
}

impl<'a> Container<'a> {
    fn new(bytes: &'a [u8], size: u32) -> Self {
        let available = bytes.len().min(size.to_usize());
        Container { bytes: &bytes[..available], size }
    }

    fn num_bytes(&self) -> u32 {
        // Never more than `size`.
        clamp_size(self.bytes.len())
    }

    /// Reads and validates the header of the box starting at `position`.
    ///
    /// The checks happen in a fixed order so that the outcome never depends
    /// on how many bytes happen to be available, except for `Truncated`.
    fn parse_box(&self, position: u32, state: &mut ParseState) -> ParseResult<BoxHeader> {
        // See ISO 14496-12:2015 § 4.2
        let Some(header_end) = position.checked_add(8) else {
            return fail(Status::Aborted, "box position overflows");
        };
        ensure(header_end <= self.size, Status::Invalid, "box header exceeds its container")?;
        ensure(position + 4 <= self.num_bytes(), Status::Truncated, "box size is not available")?;
        let start = position.to_usize();
        let size = read_big_endian(&self.bytes[start..start + 4]);

        // 0 means the box extends to the end of the file and 1 means a 64-bit
        // size follows. Neither is supported.
        ensure(size >= 2, Status::Aborted, "unsupported box size")?;
        ensure(size >= 8, Status::Invalid, "box is smaller than its header")?;
        ensure(size <= MAX_SIZE - position, Status::Aborted, "box end overflows")?;
        ensure(position + size <= self.size, Status::Invalid, "box exceeds its container")?;
        ensure(header_end <= self.num_bytes(), Status::Truncated, "box type is not available")?;
        let mut name = BoxType::from(read_big_endian(&self.bytes[start + 4..start + 8]));

        let max_version = name.max_fullbox_version();
        let header_size = if max_version.is_some() { 12 } else { 8 };
        ensure(size >= header_size, Status::Invalid, "full box is smaller than its header")?;
        let content_offset = position + header_size;
        ensure(content_offset <= self.num_bytes(), Status::Truncated, "full box header is not available")?;

        state.count_box()?;

        let (mut version, mut flags) = (0, 0);
        if let Some(max_version) = max_version {
            version = self.bytes[start + 8];
            flags = read_big_endian(&self.bytes[start + 9..start + 12]);
            // See AV1 Image File Format (AVIF) § 8.1
            if version > max_version {
                debug!("skipping {name:?} box of unsupported version {version}");
                name = BoxType::UnparsableBox(name.into());
            }
        }
        trace!("{name:?} at {position}, {size} bytes, version {version}, flags {flags:#x}");
        Ok(BoxHeader {
            name,
            size,
            version,
            flags,
            content_offset,
            content_size: size - header_size,
        })
    }

    /// The content of `header` seen as a container of boxes.
    fn content(&self, header: &BoxHeader) -> Container<'a> {
        let start = header.content_offset.to_usize().min(self.bytes.len());
        Container::new(&self.bytes[start..], header.content_size)
    }

    /// Same as [`Container::content`], for boxes whose children follow
    /// `offset` bytes of fields.
    fn content_from(&self, header: &BoxHeader, offset: u32) -> ParseResult<Container<'a>> {
        ensure(offset <= header.content_size, Status::Invalid, "box content is too small")?;
        let start = (header.content_offset + offset).to_usize().min(self.bytes.len());
        Ok(Container::new(&self.bytes[start..], header.content_size - offset))
    }

    /// Returns `len` bytes at `offset` within the content of `header`.
    fn content_bytes(&self, header: &BoxHeader, offset: u32, len: u32) -> ParseResult<&'a [u8]> {
        let Some(end) = offset.checked_add(len) else {
            return fail(Status::Aborted, "content offset overflows");
        };
        ensure(end <= header.content_size, Status::Invalid, "box content is too small")?;
        // Both stay within `size`, so they cannot overflow.
        let start = header.content_offset + offset;
        let end = header.content_offset + end;
        ensure(end <= self.num_bytes(), Status::Truncated, "box content is not available")?;
        Ok(&self.bytes[start.to_usize()..end.to_usize()])
    }

    fn box_iter(self) -> BoxIter<'a> {
        BoxIter { container: self, position: 0 }
    }
}

/// Walks the siblings of a container in order.
struct BoxIter<'a> {
    container: Container<'a>,
    position: u32,
}

impl BoxIter<'_> {
    /// Returns `None` once the last box ended exactly where its container
    /// ends. A container always holds at least one box, so an empty one is
    /// invalid, and siblings that do not add up to the container size are
    /// caught when parsing the leftover.
    fn next_box(&mut self, state: &mut ParseState) -> ParseResult<Option<BoxHeader>> {
        if self.position != 0 && self.position == self.container.size {
            return Ok(None);
        }
        let header = self.container.parse_box(self.position, state)?;
        self.position += header.size;
        Ok(Some(header))
    }
}

/// Returns the first child of `container` named `name`, or `missing` once
/// all siblings were seen.
fn find_box(container: Container<'_>, name: BoxType, missing: Status, state: &mut ParseState) -> ParseResult<BoxHeader> {
    let mut iter = container.box_iter();
    while let Some(header) = iter.next_box(state)? {
        if header.name == name {
            return Ok(header);
        }
    }
    let fourcc = FourCC::from(name);
    trace!("no {fourcc} box");
    fail(missing, "box not found")
}

/// Checks that the file claims to be an AVIF image or sequence.
///
/// See ISO 14496-12:2015 § 4.3
fn parse_file_for_brand(file: Container<'_>, state: &mut ParseState) -> ParseResult<()> {
    // The file type box comes first, but some writers put other boxes before it.
    let ftyp = find_box(file, BoxType::FileTypeBox, Status::Invalid, state)?;
    // major_brand and minor_version
    ensure(ftyp.content_size >= 8, Status::Invalid, "ftyp is too small")?;
    let mut offset = 0;
    while offset < ftyp.content_size {
        let brand = file.content_bytes(&ftyp, offset, 4)?;
        // The second slot is minor_version, not a brand.
        if offset != 4 && matches!(brand, b"avif" | b"avis") {
            return Ok(());
        }
        offset += 4;
    }
    // Only one ftyp is allowed per file.
    fail(Status::Invalid, "no AVIF brand")
}

struct PrimaryItem {
    id: u32,
    id_location: PrimaryItemIdLocation,
}

/// See ISO 14496-12:2015 § 8.11.4
fn parse_file_for_primary_item(file: Container<'_>, state: &mut ParseState) -> ParseResult<PrimaryItem> {
    let meta = find_box(file, BoxType::MetadataBox, Status::Invalid, state)?;
    // The file starts at offset 0, so this one is absolute.
    let meta_offset = meta.content_offset;
    let meta = file.content(&meta);
    // There is at most one meta per file, so a missing pitm stays missing.
    let pitm = find_box(meta, BoxType::PrimaryItemBox, Status::Invalid, state)?;
    let id_size: u8 = if pitm.version == 0 { 2 } else { 4 };
    let id = read_big_endian(meta.content_bytes(&pitm, 0, u32::from(id_size))?);
    Ok(PrimaryItem {
        id,
        id_location: PrimaryItemIdLocation {
            // pitm lies within meta, which lies within the file.
            offset: (meta_offset + pitm.content_offset).to_usize(),
            num_bytes: id_size,
        },
    })
}

fn parse_file_for_features(file: Container<'_>, item_id: u32, state: &mut ParseState, features: &mut Features) -> ParseResult<()> {
    let meta = find_box(file, BoxType::MetadataBox, Status::Invalid, state)?;
    parse_meta_for_features(file.content(&meta), item_id, state, features)
}

fn parse_meta_for_features(meta: Container<'_>, item_id: u32, state: &mut ParseState, features: &mut Features) -> ParseResult<()> {
    let iprp = find_box(meta, BoxType::ItemPropertiesBox, Status::Invalid, state)?;
    parse_iprp_for_features(meta.content(&iprp), item_id, state, features)
}

/// Walks the (item id, property index) pairs of an `ipma` box in order.
///
/// See ISO/IEC 23008-12:2017 § 9.3
struct Associations<'a> {
    iprp: Container<'a>,
    ipma: BoxHeader,
    id_size: u32,
    index_size: u32,
    entries_left: u32,
    associations_left: u8,
    item_id: u32,
    offset: u32,
}

impl<'a> Associations<'a> {
    fn new(iprp: Container<'a>, ipma: BoxHeader) -> ParseResult<Self> {
        let entry_count = read_big_endian(iprp.content_bytes(&ipma, 0, 4)?);
        Ok(Associations {
            iprp,
            ipma,
            id_size: if ipma.version < 1 { 2 } else { 4 },
            index_size: if ipma.flags & 1 == 1 { 2 } else { 1 },
            entries_left: entry_count,
            associations_left: 0,
            item_id: 0,
            offset: 4,
        })
    }

    fn next_association(&mut self) -> ParseResult<Option<(u32, u16)>> {
        while self.associations_left == 0 {
            if self.entries_left == 0 {
                return Ok(None);
            }
            self.entries_left -= 1;
            let entry = self.iprp.content_bytes(&self.ipma, self.offset, self.id_size + 1)?;
            self.offset += self.id_size + 1;
            self.item_id = read_big_endian(&entry[..self.id_size.to_usize()]);
            self.associations_left = entry[self.id_size.to_usize()];
        }
        self.associations_left -= 1;
        let association = self.iprp.content_bytes(&self.ipma, self.offset, self.index_size)?;
        self.offset += self.index_size;

        let mut association = BitReader::new(association);
        let _essential = association.read_bool()?;
        let property_index = association.read_u16(if self.index_size == 2 { 15 } else { 7 })?;
        Ok(Some((self.item_id, property_index)))
    }
}

/// Follows the property associations of `item_id` until every feature is
/// known. Returns `NotFound` if the pixel format is missing, which is
/// expected for derived images such as grids.
fn parse_iprp_for_features(iprp: Container<'_>, item_id: u32, state: &mut ParseState, features: &mut Features) -> ParseResult<()> {
    let ipma = find_box(iprp, BoxType::ItemPropertyAssociationBox, Status::Invalid, state)?;
    let mut associations = Associations::new(iprp, ipma)?;
    while let Some((entry_item_id, property_index)) = associations.next_association()? {
        if entry_item_id != item_id {
            continue;
        }
        match parse_iprp_for_property(iprp, u32::from(property_index), state, features) {
            Ok(()) if features.is_complete() => return Ok(()),
            Ok(()) | Err(Status::NotFound) => {},
            Err(status) => return Err(status),
        }
    }

    // There is one ipma per iprp, so whatever is missing now is missing for good.
    if features.has_dimensions() {
        return Err(Status::NotFound);
    }
    fail(Status::Invalid, "no spatial extents for the item")
}

fn parse_iprp_for_property(iprp: Container<'_>, property_index: u32, state: &mut ParseState, features: &mut Features) -> ParseResult<()> {
    let ipco = find_box(iprp, BoxType::ItemPropertyContainerBox, Status::Invalid, state)?;
    parse_ipco_for_property(iprp.content(&ipco), property_index, state, features)
}

/// Reads the property at the 1-based `property_index` if it is one of
/// interest and still unknown.
///
/// The first property is always parsed, even for the invalid index 0.
fn parse_ipco_for_property(ipco: Container<'_>, property_index: u32, state: &mut ParseState, features: &mut Features) -> ParseResult<()> {
    let mut iter = ipco.box_iter();
    let mut index = 1;
    while let Some(property) = iter.next_box(state)? {
        if index == property_index {
            match property.name {
                BoxType::ImageSpatialExtentsBox if features.width == 0 => {
                    return read_ispe(ipco, &property, features);
                },
                BoxType::PixelInformationBox if features.num_channels == 0 => {
                    return read_pixi(ipco, &property, features);
                },
                BoxType::AV1CodecConfigurationBox if features.num_channels == 0 => {
                    return read_av1c(ipco, &property, features);
                },
                _ => {},
            }
        }
        index += 1;
        if index > property_index {
            break;
        }
    }
    Err(Status::NotFound)
}

/// See ISO/IEC 23008-12:2017 § 6.5.3
fn read_ispe(ipco: Container<'_>, ispe: &BoxHeader, features: &mut Features) -> ParseResult<()> {
    let extents = ipco.content_bytes(ispe, 0, 8)?;
    features.width = read_big_endian(&extents[..4]);
    features.height = read_big_endian(&extents[4..]);
    ensure(features.has_dimensions(), Status::Invalid, "zero image dimension")
}

/// See ISO/IEC 23008-12:2017 § 6.5.6
fn read_pixi(ipco: Container<'_>, pixi: &BoxHeader, features: &mut Features) -> ParseResult<()> {
    let num_channels = ipco.content_bytes(pixi, 0, 1)?[0];
    ensure(num_channels >= 1, Status::Invalid, "pixi without channels")?;
    let bits_per_channel = ipco.content_bytes(pixi, 1, u32::from(num_channels))?;
    let bit_depth = bits_per_channel[0];
    ensure(bit_depth >= 1, Status::Invalid, "zero bit depth")?;
    ensure(
        bits_per_channel.iter().all(|&bits| bits == bit_depth),
        Status::Invalid,
        "channels of different bit depths",
    )?;
    features.num_channels = u32::from(num_channels);
    features.bit_depth = u32::from(bit_depth);
    Ok(())
}

/// Only the third byte is needed. The rest is assumed to be valid.
///
/// See AV1 Codec ISO Media File Format Binding § 2.3.3
fn read_av1c(ipco: Container<'_>, av1c: &BoxHeader, features: &mut Features) -> ParseResult<()> {
    let mut fields = BitReader::new(ipco.content_bytes(av1c, 2, 1)?);
    let _seq_tier_0 = fields.read_bool()?;
    let high_bitdepth = fields.read_bool()?;
    let twelve_bit = fields.read_bool()?;
    let monochrome = fields.read_bool()?;
    ensure(high_bitdepth || !twelve_bit, Status::Invalid, "twelve_bit without high_bitdepth")?;
    features.bit_depth = match (high_bitdepth, twelve_bit) {
        (true, true) => 12,
        (true, false) => 10,
        _ => 8,
    };
    features.num_channels = if monochrome { 1 } else { 3 };
    Ok(())
}

/// Looks for the pixel format in the tiles the primary item is derived
/// from, for example the cells of a grid.
///
/// See ISO/IEC 23008-12:2017 § 6.6.1
fn parse_file_for_features_in_tiles(file: Container<'_>, primary_item_id: u32, state: &mut ParseState, features: &mut Features) -> ParseResult<()> {
    let meta = find_box(file, BoxType::MetadataBox, Status::Invalid, state)?;
    let meta = file.content(&meta);
    let iref = find_box(meta, BoxType::ItemReferenceBox, Status::NotFound, state)?;
    parse_iref_for_features_in_tiles(meta, &iref, primary_item_id, state, features)
}

/// The width of item ids in every reference depends on the iref version.
///
/// See ISO 14496-12:2015 § 8.11.12
fn iref_id_size(iref: &BoxHeader) -> u32 {
    if iref.version == 0 { 2 } else { 4 }
}

/// Reads the source item id and the reference count of a `dimg` reference.
fn read_dimg_header(references: Container<'_>, dimg: &BoxHeader, id_size: u32) -> ParseResult<(u32, u32)> {
    let head = references.content_bytes(dimg, 0, id_size + 2)?;
    let (from_item_id, reference_count) = head.split_at(id_size.to_usize());
    Ok((read_big_endian(from_item_id), read_big_endian(reference_count)))
}

fn parse_iref_for_features_in_tiles(
    meta: Container<'_>, iref: &BoxHeader, primary_item_id: u32, state: &mut ParseState, features: &mut Features,
) -> ParseResult<()> {
    let id_size = iref_id_size(iref);
    let references = meta.content(iref);
    let mut iter = references.box_iter();
    while let Some(reference) = iter.next_box(state)? {
        if reference.name != BoxType::DerivedImageReference {
            continue;
        }
        let (from_item_id, reference_count) = read_dimg_header(references, &reference, id_size)?;
        if from_item_id != primary_item_id {
            continue;
        }
        let mut offset = id_size + 2;
        for _ in 0..reference_count {
            let tile_item_id = read_big_endian(references.content_bytes(&reference, offset, id_size)?);
            offset += id_size;
            debug!("looking for the pixel format of item {primary_item_id} in tile {tile_item_id}");
            // The first tile should be enough, the others are tried just in case.
            match parse_meta_for_features(meta, tile_item_id, state, features) {
                Err(Status::NotFound) => {},
                result => return result,
            }
        }
    }
    Err(Status::NotFound)
}

/// Looks for an alpha auxiliary type anywhere in the property container.
/// It is not checked to be associated with the primary item.
///
/// See AV1 Image File Format (AVIF) § 4
fn parse_file_for_alpha(file: Container<'_>, state: &mut ParseState) -> ParseResult<()> {
    let meta = find_box(file, BoxType::MetadataBox, Status::Invalid, state)?;
    let meta = file.content(&meta);
    let iprp = find_box(meta, BoxType::ItemPropertiesBox, Status::Invalid, state)?;
    let iprp = meta.content(&iprp);
    let ipco = find_box(iprp, BoxType::ItemPropertyContainerBox, Status::Invalid, state)?;
    let ipco = iprp.content(&ipco);

    let mut iter = ipco.box_iter();
    while let Some(property) = iter.next_box(state)? {
        if is_auxiliary_type(ipco, &property, ALPHA_URN)? {
            return Ok(());
        }
    }
    Err(Status::NotFound)
}

/// Whether `property` is an `auxC` whose type starts with `urn`.
fn is_auxiliary_type(ipco: Container<'_>, property: &BoxHeader, urn: &[u8]) -> ParseResult<bool> {
    let urn_size = clamp_size(urn.len());
    Ok(property.name == BoxType::AuxiliaryTypeProperty
        && property.content_size >= urn_size
        && ipco.content_bytes(property, 0, urn_size)? == urn)
}

/// Looks for the HDR gain map of the primary item. A tone-mapped derived
/// item takes the base image and the gain map as its first two inputs.
/// Failing that, the gain map may be an auxiliary image of a dedicated type.
///
/// See ISO 21496-1
fn parse_file_for_gainmap(file: Container<'_>, state: &mut ParseState) -> ParseResult<u32> {
    let meta = find_box(file, BoxType::MetadataBox, Status::Invalid, state)?;
    let meta = file.content(&meta);
    match parse_meta_for_tone_map_item(meta, state) {
        Ok(tone_map_item_id) => match parse_meta_for_tone_map_input(meta, tone_map_item_id, state) {
            Err(Status::NotFound) => debug!("item {tone_map_item_id} tone maps without a gain map"),
            result => return result,
        },
        Err(Status::NotFound) => {},
        Err(status) => return Err(status),
    }
    parse_meta_for_gainmap_property(meta, state)
}

/// Returns the id of the first `tmap` item.
///
/// See ISO 14496-12:2015 § 8.11.6
fn parse_meta_for_tone_map_item(meta: Container<'_>, state: &mut ParseState) -> ParseResult<u32> {
    // iinf and infe are full boxes, but they are parsed as plain ones and
    // their version is read here.
    let iinf = find_box(meta, BoxType::ItemInfoBox, Status::NotFound, state)?;
    let version = meta.content_bytes(&iinf, 0, 1)?[0];
    if version > 1 {
        debug!("skipping iinf box of unsupported version {version}");
        return Err(Status::NotFound);
    }
    let count_size = if version == 0 { 2 } else { 4 };
    let entry_count = read_big_endian(meta.content_bytes(&iinf, 4, count_size)?);
    let entries = meta.content_from(&iinf, 4 + count_size)?;

    let mut iter = entries.box_iter();
    for _ in 0..entry_count {
        // entry_count may be larger than what the box holds.
        let Some(entry) = iter.next_box(state)? else {
            break;
        };
        if entry.name != BoxType::ItemInfoEntry {
            continue;
        }
        // Versions 0 and 1 have no item_type.
        let id_size = match entries.content_bytes(&entry, 0, 1)?[0] {
            2 => 2,
            3 => 4,
            _ => continue,
        };
        // item_ID, item_protection_index and item_type
        let info = entries.content_bytes(&entry, 4, id_size + 2 + 4)?;
        let (item_id, rest) = info.split_at(id_size.to_usize());
        if &rest[2..] == b"tmap" {
            return Ok(read_big_endian(item_id));
        }
    }
    Err(Status::NotFound)
}

/// Returns the second input of the `tmap` item, which is the gain map.
fn parse_meta_for_tone_map_input(meta: Container<'_>, tone_map_item_id: u32, state: &mut ParseState) -> ParseResult<u32> {
    let iref = find_box(meta, BoxType::ItemReferenceBox, Status::NotFound, state)?;
    let id_size = iref_id_size(&iref);
    let references = meta.content(&iref);
    let mut iter = references.box_iter();
    while let Some(reference) = iter.next_box(state)? {
        if reference.name != BoxType::DerivedImageReference {
            continue;
        }
        let (from_item_id, reference_count) = read_dimg_header(references, &reference, id_size)?;
        if from_item_id == tone_map_item_id && reference_count >= 2 {
            let gainmap = references.content_bytes(&reference, 2 + 2 * id_size, id_size)?;
            return Ok(read_big_endian(gainmap));
        }
    }
    Err(Status::NotFound)
}

/// Returns the first item associated with the gain map auxiliary type.
fn parse_meta_for_gainmap_property(meta: Container<'_>, state: &mut ParseState) -> ParseResult<u32> {
    let iprp = find_box(meta, BoxType::ItemPropertiesBox, Status::Invalid, state)?;
    let iprp = meta.content(&iprp);
    let ipco = find_box(iprp, BoxType::ItemPropertyContainerBox, Status::Invalid, state)?;
    let ipco = iprp.content(&ipco);

    let mut iter = ipco.box_iter();
    let mut index = 1;
    let gainmap_index = loop {
        let Some(property) = iter.next_box(state)? else {
            return Err(Status::NotFound);
        };
        if is_auxiliary_type(ipco, &property, GAINMAP_URN)? {
            break index;
        }
        index += 1;
    };

    let ipma = find_box(iprp, BoxType::ItemPropertyAssociationBox, Status::Invalid, state)?;
    let mut associations = Associations::new(iprp, ipma)?;
    while let Some((item_id, property_index)) = associations.next_association()? {
        if u32::from(property_index) == gainmap_index {
            return Ok(item_id);
        }
    }
    Err(Status::NotFound)
}

/// Runs every feature stage over the file, sharing one box budget.
fn parse_file_for_primary_item_features(file: Container<'_>, state: &mut ParseState) -> ParseResult<(PrimaryItem, Features)> {
    parse_file_for_brand(file, state)?;
    let primary_item = parse_file_for_primary_item(file, state)?;
    let primary_item_id = primary_item.id;

    let mut features = Features::default();
    match parse_file_for_features(file, primary_item_id, state, &mut features) {
        Err(Status::NotFound) => {
            debug!("no pixel format for item {primary_item_id}, trying its tiles");
            parse_file_for_features_in_tiles(file, primary_item_id, state, &mut features)?;
        },
        result => result?,
    }

    match parse_file_for_alpha(file, state) {
        Ok(()) => features.num_channels += 1,
        Err(Status::NotFound) => {},
        Err(status) => return Err(status),
    }
    debug_assert!(features.is_complete());
    Ok((primary_item, features))
}

fn parse_file(file: Container<'_>) -> ParseResult<Features> {
    let (_, features) = parse_file_for_primary_item_features(file, &mut ParseState::default())?;
    Ok(features)
}

fn parse_file_for_details(file: Container<'_>) -> ParseResult<Details> {
    let mut state = ParseState::default();
    let (primary_item, features) = parse_file_for_primary_item_features(file, &mut state)?;
    let gainmap_item_id = match parse_file_for_gainmap(file, &mut state) {
        Ok(item_id) => Some(item_id),
        Err(Status::NotFound) => None,
        Err(status) => return Err(status),
    };
    Ok(Details {
        features,
        primary_item_id: primary_item.id,
        primary_item_id_location: primary_item.id_location,
        gainmap_item_id,
    })
}

fn parse_input<T>(data: &[u8], file_size: usize, parse: impl FnOnce(Container<'_>) -> ParseResult<T>) -> Result<T> {
    if data.is_empty() {
        return Err(Error::NotEnoughData);
    }
    // Bytes past the end of the file belong to something else.
    let data = &data[..data.len().min(file_size)];
    parse(Container::new(data, clamp_size(file_size))).map_err(|status| match status {
        // Whatever is missing may still come with the rest of the file.
        Status::NotFound if data.len() < file_size => Error::NotEnoughData,
        Status::NotFound | Status::Invalid => Error::InvalidFile,
        Status::Truncated => Error::NotEnoughData,
        Status::Aborted => Error::TooComplex,
    })
}

/// Extracts the features of the primary image from a prefix of an AVIF
/// file whose total size is unknown.
///
/// Returns [`Error::NotEnoughData`] if the prefix is too short. Calling again
/// with a longer prefix of the same file may succeed. Any other outcome is
/// final: longer prefixes yield the same result.
pub fn get_features(data: &[u8]) -> Result<Features> {
    get_features_with_size(data, usize::MAX)
}

/// Same as [`get_features`], for a file known to be `file_size` bytes long.
///
/// Knowing where the file ends turns information that would otherwise only
/// be "not found yet" into [`Error::InvalidFile`]. Bytes of `data` past
/// `file_size` are ignored. Sizes are capped at `u32::MAX`.
pub fn get_features_with_size(data: &[u8], file_size: usize) -> Result<Features> {
    parse_input(data, file_size, parse_file)
}

/// Same as [`get_features`], plus the location of the primary item id and
/// the gain map item, if any.
///
/// The gain map search needs the whole `meta` box, so this may return
/// [`Error::NotEnoughData`] for a prefix that [`get_features`] accepts.
pub fn get_details(data: &[u8]) -> Result<Details> {
    get_details_with_size(data, usize::MAX)
}

/// Same as [`get_details`], for a file known to be `file_size` bytes long.
pub fn get_details_with_size(data: &[u8], file_size: usize) -> Result<Details> {
    parse_input(data, file_size, parse_file_for_details)
}

/// Checks whether a prefix of a file of unknown size starts like an AVIF file,
/// by looking at its brands only.
///
/// Returns [`Error::NotEnoughData`] if the prefix is too short to tell.
pub fn identify(data: &[u8]) -> Result<()> {
    identify_with_size(data, usize::MAX)
}

/// Same as [`identify`], for a file known to be `file_size` bytes long.
pub fn identify_with_size(data: &[u8], file_size: usize) -> Result<()> {
    parse_input(data, file_size, |file| parse_file_for_brand(file, &mut ParseState::default()))
}
