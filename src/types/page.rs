//! Shared on-disk page metadata used by pager components.

use super::{page_crc32, ArborError, PageId, Result};

/// Magic bytes at the start of every page.
pub const PAGE_MAGIC: [u8; 4] = *b"ARBR";
/// Version of the page layout written by this crate.
pub const PAGE_FORMAT_VERSION: u16 = 1;
/// Page size used when none is configured.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
/// Smallest supported page size.
pub const MIN_PAGE_SIZE: u32 = 512;
/// Largest supported page size (free offsets are stored as `u16`).
pub const MAX_PAGE_SIZE: u32 = 32 * 1024;
/// Length of the fixed header at the start of every page.
pub const PAGE_HDR_LEN: usize = 32;

pub mod header {
    //! Byte offsets for fixed header fields.
    use core::ops::Range;

    /// [`PAGE_MAGIC`](super::PAGE_MAGIC).
    pub const MAGIC: Range<usize> = 0..4;
    /// Layout version, big-endian `u16`.
    pub const FORMAT_VERSION: Range<usize> = 4..6;
    /// [`PageKind`](super::PageKind) tag.
    pub const PAGE_KIND: usize = 6;
    /// Always zero.
    pub const RESERVED: usize = 7;
    /// Id the page was written as.
    pub const PAGE_NO: Range<usize> = 8..16;
    /// Number of entries in the page body.
    pub const ENTRY_COUNT: Range<usize> = 16..18;
    /// End of the used part of the body.
    pub const FREE_OFFSET: Range<usize> = 18..20;
    /// Page size of the file.
    pub const PAGE_SIZE: Range<usize> = 20..24;
    /// Always zero.
    pub const RESERVED_2: Range<usize> = 24..28;
    /// Salted CRC32 of the page with this field zeroed.
    pub const CRC32: Range<usize> = 28..32;
}

/// Type tag stored in every page header.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// One of the two alternating meta pages.
    Meta = 1,
    /// A link in the persisted free list.
    FreeList = 2,
    /// B+tree interior node.
    Branch = 3,
    /// B+tree leaf node.
    Leaf = 4,
    /// Continuation page holding part of a large value.
    Overflow = 5,
}

impl PageKind {
    /// Returns the on-disk tag.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageKind {
    type Error = ArborError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PageKind::Meta),
            2 => Ok(PageKind::FreeList),
            3 => Ok(PageKind::Branch),
            4 => Ok(PageKind::Leaf),
            5 => Ok(PageKind::Overflow),
            _ => Err(ArborError::Corruption("unknown page kind")),
        }
    }
}

/// Decoded page header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Layout version.
    pub format_version: u16,
    /// Page type tag.
    pub kind: PageKind,
    /// Id the page was written under.
    pub page_no: PageId,
    /// Number of entries stored in the payload.
    pub entry_count: u16,
    /// Offset of the first unused byte (the free-space cursor).
    pub free_offset: u16,
    /// Page size of the file the page belongs to.
    pub page_size: u32,
    /// Salted CRC32 of the whole page with this field zeroed.
    pub crc32: u32,
}

impl PageHeader {
    /// Builds a header for a page of `kind` with an empty payload.
    pub fn new(page_no: PageId, kind: PageKind, page_size: u32) -> Result<Self> {
        if (page_size as usize) < PAGE_HDR_LEN {
            return Err(ArborError::Invalid("page size smaller than header"));
        }
        Ok(Self {
            format_version: PAGE_FORMAT_VERSION,
            kind,
            page_no,
            entry_count: 0,
            free_offset: PAGE_HDR_LEN as u16,
            page_size,
            crc32: 0,
        })
    }

    /// Sets the entry count and free-space cursor.
    pub fn with_layout(mut self, entry_count: u16, free_offset: u16) -> Self {
        self.entry_count = entry_count;
        self.free_offset = free_offset;
        self
    }

    /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PAGE_HDR_LEN {
            return Err(ArborError::Invalid("page header buffer too small"));
        }
        let hdr = &mut dst[..PAGE_HDR_LEN];
        hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
        hdr[header::FORMAT_VERSION].copy_from_slice(&self.format_version.to_be_bytes());
        hdr[header::PAGE_KIND] = self.kind.as_u8();
        hdr[header::RESERVED] = 0;
        hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
        hdr[header::ENTRY_COUNT].copy_from_slice(&self.entry_count.to_be_bytes());
        hdr[header::FREE_OFFSET].copy_from_slice(&self.free_offset.to_be_bytes());
        hdr[header::PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        hdr[header::RESERVED_2].fill(0);
        hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
        Ok(())
    }

    /// Parses a header, rejecting bad magic, versions and reserved bytes.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_HDR_LEN {
            return Err(ArborError::Corruption("page header truncated"));
        }
        let hdr = &src[..PAGE_HDR_LEN];
        if hdr[header::MAGIC] != PAGE_MAGIC {
            return Err(ArborError::Corruption("invalid page magic"));
        }
        let format_version = u16::from_be_bytes(read_array(hdr, header::FORMAT_VERSION));
        if format_version != PAGE_FORMAT_VERSION {
            return Err(ArborError::Corruption("unsupported page format version"));
        }
        if hdr[header::RESERVED] != 0 || hdr[header::RESERVED_2].iter().any(|b| *b != 0) {
            return Err(ArborError::Corruption("page header reserved bytes not zero"));
        }
        let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
        let page_no = PageId(u64::from_be_bytes(read_array(hdr, header::PAGE_NO)));
        let entry_count = u16::from_be_bytes(read_array(hdr, header::ENTRY_COUNT));
        let free_offset = u16::from_be_bytes(read_array(hdr, header::FREE_OFFSET));
        let page_size = u32::from_be_bytes(read_array(hdr, header::PAGE_SIZE));
        if (page_size as usize) < PAGE_HDR_LEN {
            return Err(ArborError::Corruption("page size smaller than header"));
        }
        if (free_offset as usize) < PAGE_HDR_LEN || free_offset as u32 > page_size {
            return Err(ArborError::Corruption("page free offset out of range"));
        }
        let crc32 = u32::from_be_bytes(read_array(hdr, header::CRC32));
        Ok(Self {
            format_version,
            kind,
            page_no,
            entry_count,
            free_offset,
            page_size,
            crc32,
        })
    }
}

/// Zeroes the CRC field of an encoded header.
pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
    if buf.len() < header::CRC32.end {
        return Err(ArborError::Invalid("page header buffer too small"));
    }
    buf[header::CRC32].fill(0);
    Ok(())
}

/// Computes the salted CRC of a fully encoded page and stores it in the header.
pub fn seal(buf: &mut [u8], page_no: PageId, salt: u64) -> Result<()> {
    clear_crc32(buf)?;
    let crc = page_crc32(page_no.0, salt, buf);
    buf[header::CRC32].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Decodes the header of `buf` and checks that it was written as page
/// `expected` of a file with `page_size` and `salt`.
pub fn verify(buf: &[u8], expected: PageId, page_size: usize, salt: u64) -> Result<PageHeader> {
    if buf.len() < page_size {
        return Err(ArborError::Corruption("page truncated"));
    }
    let header = PageHeader::decode(buf)?;
    if header.page_no != expected {
        return Err(ArborError::Corruption("page number mismatch"));
    }
    if header.page_size as usize != page_size {
        return Err(ArborError::Corruption("page size mismatch"));
    }
    let mut scratch = buf[..page_size].to_vec();
    clear_crc32(&mut scratch)?;
    if page_crc32(expected.0, salt, &scratch) != header.crc32 {
        return Err(ArborError::Corruption("page crc mismatch"));
    }
    Ok(header)
}

/// Returns true if `page_size` is a supported power of two.
pub fn is_valid_page_size(page_size: u32) -> bool {
    page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
}

pub(crate) fn read_array<const N: usize>(buf: &[u8], range: core::ops::Range<usize>) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[range]);
    out
}

pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes(read_array(buf, off..off + 2))
}

pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(read_array(buf, off..off + 4))
}

pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_be_bytes(read_array(buf, off..off + 8))
}
