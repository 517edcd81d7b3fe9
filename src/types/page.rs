//! Shared on-disk page metadata used by pager components.

use core::convert::TryFrom;

use super::{PageId, Result, TreeError};
use crate::primitives::bytes::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};

/// Magic bytes opening every page.
pub const PAGE_MAGIC: [u8; 4] = *b"GTRE";
/// Version of the page header layout.
pub const PAGE_FORMAT_VERSION: u16 = 1;
/// Page size used when none is configured.
pub const DEFAULT_PAGE_SIZE: u32 = 8192;
/// Smallest page size accepted by the pager.
pub const MIN_PAGE_SIZE: u32 = 512;
/// Length of the common page header.
pub const PAGE_HDR_LEN: usize = 32;

pub mod header {
    //! Byte offsets for fixed header fields.
    use core::ops::Range;

    /// Magic bytes.
    pub const MAGIC: Range<usize> = 0..4;
    /// Header layout version (u16).
    pub const FORMAT_VERSION: usize = 4;
    /// Page kind tag (u8).
    pub const PAGE_KIND: usize = 6;
    /// Must be zero.
    pub const RESERVED: usize = 7;
    /// Page size (u32).
    pub const PAGE_SIZE: usize = 8;
    /// Page number (u64).
    pub const PAGE_NO: usize = 12;
    /// File salt (u64).
    pub const SALT: usize = 20;
    /// Page checksum (u32).
    pub const CRC32: usize = 28;
}

/// Role of a page within the store file.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// Page 0: store format and layout identity.
    Meta = 1,
    /// Pages 1 and 2: alternating tree-state records.
    State = 2,
    /// Persisted free-list chain page.
    FreeList = 3,
    /// Tree leaf holding key/value entries.
    TreeLeaf = 4,
    /// Tree internal node holding separators and child pointers.
    TreeInternal = 5,
}

impl PageKind {
    /// Returns the on-disk tag.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageKind {
    type Error = TreeError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PageKind::Meta),
            2 => Ok(PageKind::State),
            3 => Ok(PageKind::FreeList),
            4 => Ok(PageKind::TreeLeaf),
            5 => Ok(PageKind::TreeInternal),
            _ => Err(TreeError::Corruption("unknown page kind")),
        }
    }
}

/// Decoded common page header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Header layout version.
    pub format_version: u16,
    /// What the page holds.
    pub kind: PageKind,
    /// Size of the page in bytes.
    pub page_size: u32,
    /// Page number the page was written at.
    pub page_no: PageId,
    /// Per-file salt mixed into the checksum.
    pub salt: u64,
    /// Checksum stamped by the pager on write-back.
    pub crc32: u32,
}

impl PageHeader {
    /// Builds a header for a fresh page.
    pub fn new(page_no: PageId, kind: PageKind, page_size: u32, salt: u64) -> Result<Self> {
        if (page_size as usize) < PAGE_HDR_LEN {
            return Err(TreeError::Invalid("page size smaller than header"));
        }
        Ok(Self {
            format_version: PAGE_FORMAT_VERSION,
            kind,
            page_size,
            page_no,
            salt,
            crc32: 0,
        })
    }

    /// Returns the header with a checksum attached.
    pub fn with_crc32(mut self, crc32: u32) -> Self {
        self.crc32 = crc32;
        self
    }

    /// Serializes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PAGE_HDR_LEN {
            return Err(TreeError::Invalid("page header buffer too small"));
        }
        let hdr = &mut dst[..PAGE_HDR_LEN];
        hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
        put_u16(hdr, header::FORMAT_VERSION, self.format_version);
        hdr[header::PAGE_KIND] = self.kind.as_u8();
        hdr[header::RESERVED] = 0;
        put_u32(hdr, header::PAGE_SIZE, self.page_size);
        put_u64(hdr, header::PAGE_NO, self.page_no.0);
        put_u64(hdr, header::SALT, self.salt);
        put_u32(hdr, header::CRC32, self.crc32);
        Ok(())
    }

    /// Parses and validates a header.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_HDR_LEN {
            return Err(TreeError::Corruption("page header truncated"));
        }
        let hdr = &src[..PAGE_HDR_LEN];
        if hdr[header::MAGIC] != PAGE_MAGIC {
            return Err(TreeError::Corruption("invalid page magic"));
        }
        let format_version = get_u16(hdr, header::FORMAT_VERSION)?;
        if format_version != PAGE_FORMAT_VERSION {
            return Err(TreeError::Corruption("unsupported page format version"));
        }
        if hdr[header::RESERVED] != 0 {
            return Err(TreeError::Corruption("page header reserved byte not zero"));
        }
        let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
        let page_size = get_u32(hdr, header::PAGE_SIZE)?;
        if (page_size as usize) < PAGE_HDR_LEN {
            return Err(TreeError::Corruption("page size smaller than header"));
        }
        Ok(Self {
            format_version,
            kind,
            page_size,
            page_no: PageId(get_u64(hdr, header::PAGE_NO)?),
            salt: get_u64(hdr, header::SALT)?,
            crc32: get_u32(hdr, header::CRC32)?,
        })
    }
}

/// Zeroes the checksum field of an encoded page.
pub fn clear_crc32(buf: &mut [u8]) -> Result<()> {
    if buf.len() < PAGE_HDR_LEN {
        return Err(TreeError::Invalid("page header buffer too small"));
    }
    put_u32(buf, header::CRC32, 0);
    Ok(())
}

/// Returns true when the page has never been formatted.
pub fn is_unformatted(buf: &[u8]) -> bool {
    buf.iter().take(PAGE_HDR_LEN).all(|&b| b == 0)
}
