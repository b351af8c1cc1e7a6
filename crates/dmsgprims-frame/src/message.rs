use crate::header::{
    align, header_size, with_header_size, ByteOrder, MsgHeader, ABORT, CMDSW_MASK, CREATE,
    DELETE, HDR_SIZE, REPLY, SIZE_MASK, TRANS_MASK,
};

/// Which side of the connection initiated a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Origin {
    /// Command initiated here; the peer replies.
    Local,
    /// Command initiated by the peer; we reply.
    Remote,
}

/// Key of a transaction: circuit, message id and initiating side.
///
/// Message ids are only unique per initiating side, so the origin is part
/// of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransRef {
    pub circuit: u64,
    pub msgid: u64,
    pub origin: Origin,
}

/// One wire-level frame: core header, extended header tail and aux payload.
///
/// A `Message` is owned by exactly one component at a time and is moved,
/// never shared. Containers are recycled through [`crate::pool::MessagePool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: MsgHeader,
    order: ByteOrder,
    ext: Vec<u8>,
    aux: Vec<u8>,
    aux_len: usize,
    trans: Option<TransRef>,
    circuit_ref: bool,
}

impl Message {
    /// Create a standalone message outside any pool.
    pub fn new(cmd: u32, aux_size: usize) -> Self {
        let mut msg = Self {
            header: MsgHeader::default(),
            order: ByteOrder::native(),
            ext: Vec::new(),
            aux: Vec::new(),
            aux_len: 0,
            trans: None,
            circuit_ref: false,
        };
        msg.reset(cmd, aux_size, ByteOrder::native());
        msg
    }

    /// Reset every field for a new occupant.
    ///
    /// The extended header and the whole aligned aux region are zeroed, so
    /// nothing from a previous occupant survives. The aux allocation is
    /// kept when it is large enough; returns `true` when it had to grow.
    pub fn reset(&mut self, cmd: u32, aux_size: usize, order: ByteOrder) -> bool {
        let cmd = if cmd & SIZE_MASK == 0 {
            with_header_size(cmd, HDR_SIZE)
        } else {
            cmd
        };
        self.header = MsgHeader {
            cmd,
            aux_bytes: aux_size as u32,
            ..MsgHeader::default()
        };
        self.order = order;
        self.trans = None;
        self.circuit_ref = false;

        self.ext.clear();
        self.ext.resize(header_size(cmd) - HDR_SIZE, 0);

        let aligned = align(aux_size);
        let grew = aligned > self.aux.capacity();
        self.aux.clear();
        self.aux.resize(aligned, 0);
        self.aux_len = aux_size;
        grew
    }

    /// The decoded core header.
    pub fn header(&self) -> &MsgHeader {
        &self.header
    }

    /// Byte order of this frame.
    pub fn order(&self) -> ByteOrder {
        self.order
    }

    /// Full command word.
    pub fn cmd(&self) -> u32 {
        self.header.cmd
    }

    /// Command switch (protocol and base command, no flags or size).
    pub fn cmd_switch(&self) -> u32 {
        self.header.cmd & CMDSW_MASK
    }

    /// Replace the transaction flag bits, keeping command and size.
    pub fn set_flags(&mut self, flags: u32) {
        self.header.cmd = (self.header.cmd & !TRANS_MASK) | (flags & TRANS_MASK);
    }

    pub fn is_create(&self) -> bool {
        self.header.cmd & CREATE != 0
    }

    pub fn is_delete(&self) -> bool {
        self.header.cmd & DELETE != 0
    }

    pub fn is_reply(&self) -> bool {
        self.header.cmd & REPLY != 0
    }

    pub fn is_abort(&self) -> bool {
        self.header.cmd & ABORT != 0
    }

    /// Whether this frame is a one-off outside any transaction.
    pub fn is_oneoff(&self) -> bool {
        self.header.msgid == 0 && self.header.cmd & TRANS_MASK == 0
    }

    pub fn msgid(&self) -> u64 {
        self.header.msgid
    }

    pub fn set_msgid(&mut self, msgid: u64) {
        self.header.msgid = msgid;
    }

    pub fn circuit(&self) -> u64 {
        self.header.circuit
    }

    pub fn set_circuit(&mut self, circuit: u64) {
        self.header.circuit = circuit;
    }

    pub fn error(&self) -> u32 {
        self.header.error
    }

    pub fn set_error(&mut self, error: u32) {
        self.header.error = error;
    }

    /// Opaque aux descriptor field, carried unchanged.
    pub fn aux_descr(&self) -> u64 {
        self.header.aux_descr
    }

    pub fn set_aux_descr(&mut self, descr: u64) {
        self.header.aux_descr = descr;
    }

    /// The aux payload, true length.
    pub fn aux(&self) -> &[u8] {
        &self.aux[..self.aux_len]
    }

    /// Mutable aux payload, true length.
    pub fn aux_mut(&mut self) -> &mut [u8] {
        &mut self.aux[..self.aux_len]
    }

    /// The aux payload including zero padding; what the aux CRC covers.
    pub fn aux_aligned(&self) -> &[u8] {
        &self.aux
    }

    pub(crate) fn aux_aligned_mut(&mut self) -> &mut [u8] {
        &mut self.aux
    }

    /// Fill the start of the aux payload from `data`.
    ///
    /// Copies at most the aux length; returns the number of bytes copied.
    pub fn write_aux(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.aux_len);
        self.aux[..n].copy_from_slice(&data[..n]);
        n
    }

    /// Extended header tail, i.e. the header bytes after the core header,
    /// in this frame's byte order.
    pub fn ext(&self) -> &[u8] {
        &self.ext
    }

    pub fn ext_mut(&mut self) -> &mut [u8] {
        &mut self.ext
    }

    /// Read a `u32` from the extended tail at `offset`, honouring the
    /// frame's byte order.
    pub fn ext_u32(&self, offset: usize) -> Option<u32> {
        let raw: [u8; 4] = self.ext.get(offset..offset + 4)?.try_into().ok()?;
        Some(match self.order {
            ByteOrder::Little => u32::from_le_bytes(raw),
            ByteOrder::Big => u32::from_be_bytes(raw),
        })
    }

    /// Read a `u64` from the extended tail at `offset`.
    pub fn ext_u64(&self, offset: usize) -> Option<u64> {
        let raw: [u8; 8] = self.ext.get(offset..offset + 8)?.try_into().ok()?;
        Some(match self.order {
            ByteOrder::Little => u64::from_le_bytes(raw),
            ByteOrder::Big => u64::from_be_bytes(raw),
        })
    }

    /// Store a `u32` into the extended tail. Returns `false` when out of range.
    pub fn set_ext_u32(&mut self, offset: usize, value: u32) -> bool {
        let bytes = self.order.u32_bytes(value);
        match self.ext.get_mut(offset..offset + 4) {
            Some(dst) => {
                dst.copy_from_slice(&bytes);
                true
            }
            None => false,
        }
    }

    /// Store a `u64` into the extended tail. Returns `false` when out of range.
    pub fn set_ext_u64(&mut self, offset: usize, value: u64) -> bool {
        let bytes = match self.order {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        match self.ext.get_mut(offset..offset + 8) {
            Some(dst) => {
                dst.copy_from_slice(&bytes);
                true
            }
            None => false,
        }
    }

    /// Transaction this message belongs to, if any.
    pub fn trans(&self) -> Option<TransRef> {
        self.trans
    }

    pub fn set_trans(&mut self, trans: Option<TransRef>) {
        self.trans = trans;
    }

    /// Whether this message holds a reference on a non-zero circuit.
    ///
    /// Maintained by the connection layer; released with the message.
    pub fn holds_circuit_ref(&self) -> bool {
        self.circuit_ref
    }

    pub fn set_circuit_ref(&mut self, held: bool) {
        self.circuit_ref = held;
    }

    /// Install a header decoded off the wire.
    pub(crate) fn set_received_header(&mut self, header: MsgHeader, ext: &[u8]) {
        self.header = header;
        self.ext.clear();
        self.ext.extend_from_slice(ext);
    }

    pub(crate) fn set_wire_fields(&mut self, salt: u32, aux_crc: u32) {
        self.header.salt = salt;
        self.header.aux_crc = aux_crc;
        self.header.aux_bytes = self.aux_len as u32;
        self.header.hdr_crc = 0;
    }

    /// Size of this frame on the wire.
    pub fn wire_size(&self) -> usize {
        header_size(self.header.cmd) + self.aux.len()
    }
}
