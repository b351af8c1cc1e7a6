//! Core header layout and the command word.
//!
//! Every frame starts with a 64-byte core header:
//!
//! ```text
//! 0x00 magic (2)      0x02 reserved (2)   0x04 salt (4)
//! 0x08 message id (8)
//! 0x10 circuit id (8)
//! 0x18 reserved (8)
//! 0x20 command (4)    0x24 aux crc (4)
//! 0x28 aux bytes (4)  0x2C error (4)
//! 0x30 aux descriptor (8)
//! 0x38 reserved (4)   0x3C header crc (4)
//! ```
//!
//! All multi-byte fields use the byte order selected by the magic. The
//! header may be extended by command-specific fields; its total size is the
//! low byte of the command word in units of [`ALIGN`].

use bytes::{Buf, BufMut, BytesMut};

/// Magic as read in the sender's byte order.
pub const MAGIC: u16 = 0x4832;

/// Magic as read when the sender used the opposite byte order.
pub const MAGIC_REV: u16 = 0x3248;

/// Alignment unit for header sizes and aux payloads.
pub const ALIGN: usize = 64;

/// Size of the core header.
pub const HDR_SIZE: usize = 64;

/// Largest header (core + extended) accepted.
pub const HDR_MAX: usize = 2048;

/// Largest aux payload accepted.
pub const AUX_MAX: usize = 65536;

/// Receive buffer size.
pub const BUF_SIZE: usize = HDR_MAX * 4;

/// Offset of the header CRC within the core header.
pub const HDR_CRC_OFFSET: usize = 0x3C;

/// Command word: open a transaction direction.
pub const CREATE: u32 = 0x8000_0000;
/// Command word: close a transaction direction.
pub const DELETE: u32 = 0x4000_0000;
/// Command word: frame belongs to the reply direction.
pub const REPLY: u32 = 0x2000_0000;
/// Command word: non-blocking create, or mid-stream cancel.
pub const ABORT: u32 = 0x1000_0000;

/// All transaction flag bits.
pub const TRANS_MASK: u32 = CREATE | DELETE | REPLY | ABORT;
/// Header size in alignment units.
pub const SIZE_MASK: u32 = 0x0000_00FF;
/// Base command within a protocol.
pub const BASECMD_MASK: u32 = 0x000F_FF00;
/// Protocol selector.
pub const PROTO_MASK: u32 = 0x00F0_0000;
/// Protocol and base command: what handlers switch on.
pub const CMDSW_MASK: u32 = PROTO_MASK | BASECMD_MASK;

/// Link-level protocol.
pub const PROTO_LNK: u32 = 0x0000_0000;
/// Debug protocol.
pub const PROTO_DBG: u32 = 0x0010_0000;

const fn core_cmd(proto: u32, base: u32) -> u32 {
    proto | (base << 8) | (HDR_SIZE / ALIGN) as u32
}

/// Padding / no-op.
pub const LNK_PAD: u32 = core_cmd(PROTO_LNK, 0x000);
/// Keepalive.
pub const LNK_PING: u32 = core_cmd(PROTO_LNK, 0x001);
/// Authentication exchange.
pub const LNK_AUTH: u32 = core_cmd(PROTO_LNK, 0x010);
/// Connection registration.
pub const LNK_CONN: u32 = core_cmd(PROTO_LNK, 0x011);
/// Span advertisement.
pub const LNK_SPAN: u32 = core_cmd(PROTO_LNK, 0x012);
/// Error / failure notification.
pub const LNK_ERROR: u32 = core_cmd(PROTO_LNK, 0xFFF);
/// Debug shell command.
pub const DBG_SHELL: u32 = core_cmd(PROTO_DBG, 0x001);

/// Round `n` up to the alignment unit.
pub const fn align(n: usize) -> usize {
    (n + ALIGN - 1) & !(ALIGN - 1)
}

/// Total header size declared by a command word.
pub fn header_size(cmd: u32) -> usize {
    (cmd & SIZE_MASK) as usize * ALIGN
}

/// Replace the declared header size of `cmd`.
///
/// `bytes` is rounded up to the alignment unit and never below the core
/// header.
pub fn with_header_size(cmd: u32, bytes: usize) -> u32 {
    let units = (align(bytes.max(HDR_SIZE)) / ALIGN) as u32;
    (cmd & !SIZE_MASK) | (units & SIZE_MASK)
}

/// Human-readable name of the command switch of `cmd`.
pub fn command_name(cmd: u32) -> &'static str {
    match cmd & CMDSW_MASK {
        c if c == LNK_PAD & CMDSW_MASK => "LNK_PAD",
        c if c == LNK_PING & CMDSW_MASK => "LNK_PING",
        c if c == LNK_AUTH & CMDSW_MASK => "LNK_AUTH",
        c if c == LNK_CONN & CMDSW_MASK => "LNK_CONN",
        c if c == LNK_SPAN & CMDSW_MASK => "LNK_SPAN",
        c if c == LNK_ERROR & CMDSW_MASK => "LNK_ERROR",
        c if c == DBG_SHELL & CMDSW_MASK => "DBG_SHELL",
        c if c & PROTO_MASK == PROTO_DBG => "DBG",
        _ => "USER",
    }
}

/// Render the transaction flag bits of `cmd`, e.g. `CREATE|DELETE`.
pub fn flags_name(cmd: u32) -> String {
    let names = [
        (CREATE, "CREATE"),
        (DELETE, "DELETE"),
        (REPLY, "REPLY"),
        (ABORT, "ABORT"),
    ];
    let parts: Vec<&str> = names
        .iter()
        .filter(|(bit, _)| cmd & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if parts.is_empty() {
        "-".to_string()
    } else {
        parts.join("|")
    }
}

/// Byte order of a frame, selected by its magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    /// Byte order of the host.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// Determine the byte order from the first two bytes of a frame.
    pub fn from_magic(bytes: [u8; 2]) -> Option<Self> {
        match u16::from_le_bytes(bytes) {
            MAGIC => Some(ByteOrder::Little),
            MAGIC_REV => Some(ByteOrder::Big),
            _ => None,
        }
    }

    /// Whether this order differs from the host's.
    pub fn is_swapped(self) -> bool {
        self != Self::native()
    }

    pub(crate) fn get_u16(self, src: &mut &[u8]) -> u16 {
        match self {
            ByteOrder::Little => src.get_u16_le(),
            ByteOrder::Big => src.get_u16(),
        }
    }

    pub(crate) fn get_u32(self, src: &mut &[u8]) -> u32 {
        match self {
            ByteOrder::Little => src.get_u32_le(),
            ByteOrder::Big => src.get_u32(),
        }
    }

    pub(crate) fn get_u64(self, src: &mut &[u8]) -> u64 {
        match self {
            ByteOrder::Little => src.get_u64_le(),
            ByteOrder::Big => src.get_u64(),
        }
    }

    pub(crate) fn put_u16(self, dst: &mut BytesMut, v: u16) {
        match self {
            ByteOrder::Little => dst.put_u16_le(v),
            ByteOrder::Big => dst.put_u16(v),
        }
    }

    pub(crate) fn put_u32(self, dst: &mut BytesMut, v: u32) {
        match self {
            ByteOrder::Little => dst.put_u32_le(v),
            ByteOrder::Big => dst.put_u32(v),
        }
    }

    pub(crate) fn put_u64(self, dst: &mut BytesMut, v: u64) {
        match self {
            ByteOrder::Little => dst.put_u64_le(v),
            ByteOrder::Big => dst.put_u64(v),
        }
    }

    pub(crate) fn u32_bytes(self, v: u32) -> [u8; 4] {
        match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        }
    }
}

impl Default for ByteOrder {
    fn default() -> Self {
        Self::native()
    }
}

/// Decoded core header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgHeader {
    pub reserved02: u16,
    pub salt: u32,
    pub msgid: u64,
    pub circuit: u64,
    pub reserved18: u64,
    pub cmd: u32,
    pub aux_crc: u32,
    pub aux_bytes: u32,
    pub error: u32,
    pub aux_descr: u64,
    pub reserved38: u32,
    pub hdr_crc: u32,
}

impl MsgHeader {
    /// Append the 64-byte core header to `dst` in `order`.
    pub fn put(&self, dst: &mut BytesMut, order: ByteOrder) {
        dst.reserve(HDR_SIZE);
        order.put_u16(dst, MAGIC);
        order.put_u16(dst, self.reserved02);
        order.put_u32(dst, self.salt);
        order.put_u64(dst, self.msgid);
        order.put_u64(dst, self.circuit);
        order.put_u64(dst, self.reserved18);
        order.put_u32(dst, self.cmd);
        order.put_u32(dst, self.aux_crc);
        order.put_u32(dst, self.aux_bytes);
        order.put_u32(dst, self.error);
        order.put_u64(dst, self.aux_descr);
        order.put_u32(dst, self.reserved38);
        order.put_u32(dst, self.hdr_crc);
    }

    /// Decode a core header. `src` must hold at least [`HDR_SIZE`] bytes.
    ///
    /// The magic is not checked here; callers determine `order` from it.
    pub fn get(mut src: &[u8], order: ByteOrder) -> Self {
        let src = &mut src;
        let _magic = order.get_u16(src);
        Self {
            reserved02: order.get_u16(src),
            salt: order.get_u32(src),
            msgid: order.get_u64(src),
            circuit: order.get_u64(src),
            reserved18: order.get_u64(src),
            cmd: order.get_u32(src),
            aux_crc: order.get_u32(src),
            aux_bytes: order.get_u32(src),
            error: order.get_u32(src),
            aux_descr: order.get_u64(src),
            reserved38: order.get_u32(src),
            hdr_crc: order.get_u32(src),
        }
    }

    /// Read only the command word from a raw core header.
    pub fn peek_cmd(src: &[u8], order: ByteOrder) -> u32 {
        let mut field = &src[0x20..0x24];
        order.get_u32(&mut field)
    }

    /// Read only the stored header CRC from a raw core header.
    pub fn peek_hdr_crc(src: &[u8], order: ByteOrder) -> u32 {
        let mut field = &src[HDR_CRC_OFFSET..HDR_CRC_OFFSET + 4];
        order.get_u32(&mut field)
    }

    /// Total header size declared by the command word.
    pub fn header_size(&self) -> usize {
        header_size(self.cmd)
    }
}
