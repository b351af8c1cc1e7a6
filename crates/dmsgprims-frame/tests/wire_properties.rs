use bytes::BytesMut;
use dmsgprims_frame::header::{align, with_header_size, HDR_CRC_OFFSET};
use dmsgprims_frame::{
    encode_frame, ByteOrder, FrameConfig, IoqError, Message, MessagePool, Plaintext, RxIoq,
    AUX_MAX, CREATE, HDR_MAX, HDR_SIZE, LNK_SPAN, REPLY,
};
use proptest::prelude::*;

fn decode_all(wire: &[u8]) -> Result<Vec<Message>, IoqError> {
    let mut rx = RxIoq::new(&FrameConfig::default());
    let mut pool = MessagePool::default();
    let mut rest = wire;
    let mut out = Vec::new();
    loop {
        let n = rx.feed(rest, &mut Plaintext)?;
        rest = &rest[n..];
        while let Some(msg) = rx.next_message(&mut pool)? {
            out.push(msg);
        }
        if rest.is_empty() {
            return Ok(out);
        }
    }
}

fn order_strategy() -> impl Strategy<Value = ByteOrder> {
    prop_oneof![Just(ByteOrder::Little), Just(ByteOrder::Big)]
}

fn build(order: ByteOrder, hbytes: usize, ext: &[u8], aux: &[u8], msgid: u64) -> Message {
    let mut pool = MessagePool::default();
    let mut msg = pool.checkout(with_header_size(LNK_SPAN | CREATE, hbytes), aux.len(), order);
    msg.set_msgid(msgid);
    msg.set_circuit(msgid.rotate_left(17));
    msg.set_error(msgid as u32 ^ 0x5A5A);
    msg.set_aux_descr(!msgid);
    let n = msg.ext().len().min(ext.len());
    msg.ext_mut()[..n].copy_from_slice(&ext[..n]);
    msg.write_aux(aux);
    msg
}

fn encode_one(mut msg: Message) -> Vec<u8> {
    let mut wire = BytesMut::new();
    encode_frame(&mut msg, 0xAB00, &mut wire).unwrap();
    wire.to_vec()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Every field and both payload regions survive the wire in either
    /// byte order.
    #[test]
    fn round_trip_preserves_frame(
        order in order_strategy(),
        hbytes in (HDR_SIZE..=HDR_MAX),
        ext in prop::collection::vec(any::<u8>(), 0..=HDR_MAX - HDR_SIZE),
        aux in prop::collection::vec(any::<u8>(), 1..=AUX_MAX),
        msgid in 1u64..u64::MAX,
    ) {
        let sent = build(order, hbytes, &ext, &aux, msgid);
        let wire = encode_one(sent.clone());
        prop_assert_eq!(wire.len(), align(hbytes) + align(aux.len()));

        let got = decode_all(&wire).unwrap();
        prop_assert_eq!(got.len(), 1);
        let got = &got[0];
        prop_assert_eq!(got.order(), order);
        prop_assert_eq!(got.cmd(), sent.cmd());
        prop_assert_eq!(got.msgid(), msgid);
        prop_assert_eq!(got.circuit(), sent.circuit());
        prop_assert_eq!(got.error(), sent.error());
        prop_assert_eq!(got.aux_descr(), sent.aux_descr());
        prop_assert_eq!(got.ext(), sent.ext());
        prop_assert_eq!(got.aux(), &aux[..]);
    }

    /// A single flipped bit anywhere in the CRC-covered header, other than
    /// the magic and the header size byte, is a header CRC error.
    #[test]
    fn header_bit_flip_detected(
        order in order_strategy(),
        aux in prop::collection::vec(any::<u8>(), 0..512),
        pick in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let hbytes = 2 * HDR_SIZE;
        let wire = encode_one(build(order, hbytes, &[7u8; 64], &aux, 3));
        // The command word's low byte declares the header size.
        let size_byte = match order {
            ByteOrder::Little => 0x20,
            ByteOrder::Big => 0x23,
        };
        let offsets: Vec<usize> = (2..HDR_CRC_OFFSET)
            .filter(|&offset| offset != size_byte)
            .chain(HDR_SIZE..hbytes)
            .collect();
        let offset = offsets[pick.index(offsets.len())];

        let mut corrupt = wire.clone();
        corrupt[offset] ^= 1 << bit;
        prop_assert_eq!(decode_all(&corrupt).unwrap_err(), IoqError::HeaderCrc);
    }

    /// A single flipped bit in the aligned aux region, padding included, is
    /// an aux CRC error.
    #[test]
    fn aux_bit_flip_detected(
        order in order_strategy(),
        aux in prop::collection::vec(any::<u8>(), 1..4096),
        pick in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let wire = encode_one(build(order, HDR_SIZE, &[], &aux, 11));
        let offset = HDR_SIZE + pick.index(align(aux.len()));

        let mut corrupt = wire.clone();
        corrupt[offset] ^= 1 << bit;
        prop_assert_eq!(decode_all(&corrupt).unwrap_err(), IoqError::AuxCrc);
    }
}

#[test]
fn streams_mix_byte_orders() {
    let mut wire = Vec::new();
    for (seq, order) in [ByteOrder::Big, ByteOrder::Little, ByteOrder::Big]
        .into_iter()
        .enumerate()
    {
        let mut msg = build(order, HDR_SIZE, &[], b"mixed", seq as u64 + 1);
        msg.set_flags(REPLY);
        let mut buf = BytesMut::new();
        encode_frame(&mut msg, seq as u32, &mut buf).unwrap();
        wire.extend_from_slice(&buf);
    }
    let got = decode_all(&wire).unwrap();
    let orders: Vec<ByteOrder> = got.iter().map(Message::order).collect();
    assert_eq!(orders, vec![ByteOrder::Big, ByteOrder::Little, ByteOrder::Big]);
    assert!(got.iter().all(|m| m.is_reply() && m.aux() == b"mixed"));
}
