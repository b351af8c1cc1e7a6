use bytes::BytesMut;

use crate::crc::{crc32, seal_header};
use crate::error::{FrameError, Result};
use crate::header::{ByteOrder, AUX_MAX, HDR_MAX, HDR_SIZE};
use crate::message::Message;

/// Configuration for framing.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Largest aux payload accepted on receive. Capped at [`AUX_MAX`].
    pub max_aux_size: usize,
    /// Byte order for frames this side originates. Default: host order.
    pub wire_order: ByteOrder,
}

impl FrameConfig {
    /// Set the maximum accepted aux payload.
    pub fn with_max_aux_size(mut self, size: usize) -> Self {
        self.max_aux_size = size.min(AUX_MAX);
        self
    }

    /// Set the byte order of originated frames.
    pub fn with_wire_order(mut self, order: ByteOrder) -> Self {
        self.wire_order = order;
        self
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_aux_size: AUX_MAX,
            wire_order: ByteOrder::native(),
        }
    }
}

/// Encode `msg` into the wire format, appending to `dst`.
///
/// Fills in the salt and aux CRC/length fields of `msg`, then writes the
/// core header, the extended tail and the zero-padded aux payload in the
/// message's byte order. The header CRC covers the whole declared header
/// with the CRC field zeroed.
pub fn encode_frame(msg: &mut Message, salt: u32, dst: &mut BytesMut) -> Result<()> {
    let hbytes = HDR_SIZE + msg.ext().len();
    if hbytes > HDR_MAX {
        return Err(FrameError::HeaderSize {
            size: hbytes,
            max: HDR_MAX,
        });
    }
    if msg.aux().len() > AUX_MAX {
        return Err(FrameError::AuxTooLarge {
            size: msg.aux().len(),
            max: AUX_MAX,
        });
    }

    let aux_crc = crc32(msg.aux_aligned());
    msg.set_wire_fields(salt, aux_crc);

    let order = msg.order();
    let start = dst.len();
    dst.reserve(hbytes + msg.aux_aligned().len());
    msg.header().put(dst, order);
    dst.extend_from_slice(msg.ext());
    seal_header(&mut dst[start..start + hbytes], order);
    dst.extend_from_slice(msg.aux_aligned());
    Ok(())
}
