//! Cipher collaborator contract.
//!
//! The concrete negotiation and encryption algorithm lives outside this
//! crate. The framing queues only need three operations: negotiate once on
//! a fresh stream, decrypt received bytes in place, and encrypt outbound
//! frames into a staging buffer.

use bytes::BytesMut;
use dmsgprims_transport::DmsgStream;

use crate::error::CipherError;

/// Stream cipher plugged into the receive and transmit queues.
pub trait Cipher: Send {
    /// Name for diagnostics.
    fn name(&self) -> &'static str;

    /// Run the key exchange on a fresh stream, before any frame is sent.
    fn negotiate(&mut self, stream: &mut DmsgStream) -> Result<(), CipherError>;

    /// Whether frames are transformed at all.
    ///
    /// An inactive cipher lets the receive queue read aux payloads straight
    /// into the message buffer.
    fn is_active(&self) -> bool;

    /// Decrypt `region` in place.
    ///
    /// Returns how many leading bytes of `region` are now plaintext. A block
    /// cipher may return less than `region.len()` while a block is
    /// incomplete; the remainder is offered again with the next read.
    fn decrypt(&mut self, region: &mut [u8]) -> Result<usize, CipherError>;

    /// Encrypt the concatenation of `plain` and append it to `out`.
    fn encrypt(&mut self, plain: &[&[u8]], out: &mut BytesMut) -> Result<(), CipherError>;
}

/// The identity cipher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Plaintext;

impl Cipher for Plaintext {
    fn name(&self) -> &'static str {
        "plaintext"
    }

    fn negotiate(&mut self, _stream: &mut DmsgStream) -> Result<(), CipherError> {
        Ok(())
    }

    fn is_active(&self) -> bool {
        false
    }

    fn decrypt(&mut self, region: &mut [u8]) -> Result<usize, CipherError> {
        Ok(region.len())
    }

    fn encrypt(&mut self, plain: &[&[u8]], out: &mut BytesMut) -> Result<(), CipherError> {
        for part in plain {
            out.extend_from_slice(part);
        }
        Ok(())
    }
}
