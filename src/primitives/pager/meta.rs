use std::io::ErrorKind;
use std::ops::Range;

use rand::{rngs::OsRng, RngCore};

use crate::primitives::durability;
use crate::primitives::io::FileIo;
use crate::types::{
    page::{self, read_array, PageHeader, PageKind, PAGE_HDR_LEN},
    ArborError, KeyOrder, PageId, Result, TxnId,
};

/// Number of meta slots at the start of the file.
pub const META_SLOTS: u64 = 2;
/// First page id usable for tree, overflow and free-list pages.
pub const FIRST_DATA_PAGE: PageId = PageId(META_SLOTS);

const META_SALT: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 8;
const META_PAGE_SIZE: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 12;
const META_FORMAT_VERSION: Range<usize> = PAGE_HDR_LEN + 12..PAGE_HDR_LEN + 14;
const META_KEY_ORDER: usize = PAGE_HDR_LEN + 14;
const META_FLAGS: usize = PAGE_HDR_LEN + 15;
const META_TXN_ID: Range<usize> = PAGE_HDR_LEN + 16..PAGE_HDR_LEN + 24;
const META_ROOT: Range<usize> = PAGE_HDR_LEN + 24..PAGE_HDR_LEN + 32;
const META_FREE_HEAD: Range<usize> = PAGE_HDR_LEN + 32..PAGE_HDR_LEN + 40;
const META_NEXT_PAGE: Range<usize> = PAGE_HDR_LEN + 40..PAGE_HDR_LEN + 48;
const META_ENTRIES: Range<usize> = PAGE_HDR_LEN + 48..PAGE_HDR_LEN + 56;
const META_DEPTH: Range<usize> = PAGE_HDR_LEN + 56..PAGE_HDR_LEN + 60;
const META_HELD_EXTENTS: Range<usize> = PAGE_HDR_LEN + 60..PAGE_HDR_LEN + 64;
const META_END: usize = PAGE_HDR_LEN + 64;

/// Set on both slots of a file that a compaction has replaced.
const FLAG_RETIRED: u8 = 0x01;

/// Contents of one meta slot: the root of a committed snapshot plus the
/// file-wide settings fixed at creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    /// Size of each page in bytes.
    pub page_size: u32,
    /// Random salt mixed into every page checksum of this file.
    pub salt: u64,
    /// Database format version number.
    pub format_version: u16,
    /// Key collation chosen when the file was created.
    pub key_order: KeyOrder,
    /// Counter of the transaction that published this meta.
    pub txn_id: TxnId,
    /// Root page of the tree, or [`PageId::NONE`] when empty.
    pub root: PageId,
    /// First page of the persisted free-list chain.
    pub free_head: PageId,
    /// One past the highest page id ever allocated.
    pub next_page: PageId,
    /// Number of key/value pairs in the tree.
    pub entries: u64,
    /// Tree height; 0 when empty, 1 when the root is a leaf.
    pub depth: u32,
    /// Trailing extents of the free-list chain holding pages this commit
    /// released. The other slot still references them, so they stay unused
    /// until the next commit overwrites that slot.
    pub held_extents: u32,
    /// The file was replaced by a compacted copy; handles on it are stale.
    pub retired: bool,
}

impl Meta {
    /// Builds the meta of a freshly created, empty database.
    pub fn fresh(page_size: u32, key_order: KeyOrder) -> Result<Self> {
        if !page::is_valid_page_size(page_size) {
            return Err(ArborError::Invalid("page size must be a power of two in range"));
        }
        Ok(Self {
            page_size,
            salt: OsRng.next_u64(),
            format_version: page::PAGE_FORMAT_VERSION,
            key_order,
            txn_id: TxnId(0),
            root: PageId::NONE,
            free_head: PageId::NONE,
            next_page: FIRST_DATA_PAGE,
            entries: 0,
            depth: 0,
            held_extents: 0,
            retired: false,
        })
    }

    /// Slot this meta is written to: transactions alternate between pages 0 and 1.
    pub fn slot(&self) -> PageId {
        PageId(self.txn_id.0 % META_SLOTS)
    }
}

/// Encodes `meta` as the image of meta page `slot`.
pub fn encode_meta(meta: &Meta, slot: PageId) -> Result<Vec<u8>> {
    if slot.0 >= META_SLOTS {
        return Err(ArborError::Invalid("meta slot out of range"));
    }
    let page_size = meta.page_size as usize;
    if page_size < META_END {
        return Err(ArborError::Invalid("page size smaller than meta layout"));
    }
    let mut buf = vec![0u8; page_size];
    PageHeader::new(slot, PageKind::Meta, meta.page_size)?
        .with_layout(0, META_END as u16)
        .encode(&mut buf)?;
    buf[META_SALT].copy_from_slice(&meta.salt.to_be_bytes());
    buf[META_PAGE_SIZE].copy_from_slice(&meta.page_size.to_be_bytes());
    buf[META_FORMAT_VERSION].copy_from_slice(&meta.format_version.to_be_bytes());
    buf[META_KEY_ORDER] = meta.key_order.as_u8();
    buf[META_FLAGS] = if meta.retired { FLAG_RETIRED } else { 0 };
    buf[META_TXN_ID].copy_from_slice(&meta.txn_id.0.to_be_bytes());
    buf[META_ROOT].copy_from_slice(&meta.root.0.to_be_bytes());
    buf[META_FREE_HEAD].copy_from_slice(&meta.free_head.0.to_be_bytes());
    buf[META_NEXT_PAGE].copy_from_slice(&meta.next_page.0.to_be_bytes());
    buf[META_ENTRIES].copy_from_slice(&meta.entries.to_be_bytes());
    buf[META_DEPTH].copy_from_slice(&meta.depth.to_be_bytes());
    buf[META_HELD_EXTENTS].copy_from_slice(&meta.held_extents.to_be_bytes());
    page::seal(&mut buf, slot, meta.salt)?;
    Ok(buf)
}

/// Decodes and validates the meta page image `buf` read from `slot`.
pub fn decode_meta(buf: &[u8], slot: PageId) -> Result<Meta> {
    if buf.len() < META_END {
        return Err(ArborError::Corruption("meta page truncated"));
    }
    let header = PageHeader::decode(buf)?;
    if header.kind != PageKind::Meta {
        return Err(ArborError::Corruption("meta page kind mismatch"));
    }
    let salt = u64::from_be_bytes(read_array(buf, META_SALT));
    let page_size = u32::from_be_bytes(read_array(buf, META_PAGE_SIZE));
    if page_size != header.page_size || !page::is_valid_page_size(page_size) {
        return Err(ArborError::Corruption("meta page size invalid"));
    }
    page::verify(buf, slot, page_size as usize, salt)?;
    let format_version = u16::from_be_bytes(read_array(buf, META_FORMAT_VERSION));
    if format_version != page::PAGE_FORMAT_VERSION {
        return Err(ArborError::Corruption("unsupported meta format version"));
    }
    let flags = buf[META_FLAGS];
    if flags & !FLAG_RETIRED != 0 {
        return Err(ArborError::Corruption("unknown meta flags"));
    }
    let key_order = KeyOrder::from_u8(buf[META_KEY_ORDER])?;
    let meta = Meta {
        page_size,
        salt,
        format_version,
        key_order,
        txn_id: TxnId(u64::from_be_bytes(read_array(buf, META_TXN_ID))),
        root: PageId(u64::from_be_bytes(read_array(buf, META_ROOT))),
        free_head: PageId(u64::from_be_bytes(read_array(buf, META_FREE_HEAD))),
        next_page: PageId(u64::from_be_bytes(read_array(buf, META_NEXT_PAGE))),
        entries: u64::from_be_bytes(read_array(buf, META_ENTRIES)),
        depth: u32::from_be_bytes(read_array(buf, META_DEPTH)),
        held_extents: u32::from_be_bytes(read_array(buf, META_HELD_EXTENTS)),
        retired: flags & FLAG_RETIRED != 0,
    };
    if meta.next_page < FIRST_DATA_PAGE {
        return Err(ArborError::Corruption("meta next page inside meta slots"));
    }
    if meta.root.0 >= meta.next_page.0 || meta.free_head.0 >= meta.next_page.0 {
        return Err(ArborError::Corruption("meta references unallocated page"));
    }
    for page in [meta.root, meta.free_head] {
        if !page.is_none() && page < FIRST_DATA_PAGE {
            return Err(ArborError::Corruption("meta points into meta slots"));
        }
    }
    if meta.root.is_none() != (meta.depth == 0) {
        return Err(ArborError::Corruption("meta depth disagrees with root"));
    }
    Ok(meta)
}

/// Reads and validates meta page `slot` of a file with `page_size` pages.
pub fn read_slot(io: &dyn FileIo, slot: PageId, page_size: u32) -> Result<Meta> {
    let mut buf = vec![0u8; page_size as usize];
    match io.read_at(durability::offset(slot, page_size as usize)?, &mut buf) {
        Ok(()) => {}
        Err(ArborError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
            return Err(ArborError::Corruption("meta page truncated"));
        }
        Err(err) => return Err(err),
    }
    let meta = decode_meta(&buf, slot)?;
    if meta.page_size != page_size {
        return Err(ArborError::Corruption("meta page size mismatch"));
    }
    Ok(meta)
}

/// Writes `meta` into both slots and flushes; used when creating a file and
/// when publishing a compacted copy.
pub fn write_both_slots(io: &dyn FileIo, meta: &Meta) -> Result<()> {
    for slot in 0..META_SLOTS {
        let slot = PageId(slot);
        let buf = encode_meta(meta, slot)?;
        io.write_at(durability::offset(slot, meta.page_size as usize)?, &buf)?;
    }
    io.sync_all()
}

/// Picks the authoritative meta of an existing file.
///
/// The page size is not known up front, so every supported size is probed.
/// Among the slots that validate, the one with the highest transaction
/// counter wins; on a tie slot 0 is preferred.
pub fn load_meta(io: &dyn FileIo) -> Result<Meta> {
    let mut best: Option<Meta> = None;
    let mut size = page::MIN_PAGE_SIZE;
    while size <= page::MAX_PAGE_SIZE {
        for slot in 0..META_SLOTS {
            let Ok(meta) = read_slot(io, PageId(slot), size) else {
                continue;
            };
            let better = match &best {
                Some(current) => meta.txn_id > current.txn_id,
                None => true,
            };
            if better {
                best = Some(meta);
            }
        }
        size <<= 1;
    }
    best.ok_or(ArborError::Corruption("no valid meta page"))
}
