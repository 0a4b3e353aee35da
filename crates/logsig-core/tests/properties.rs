//! TLV streams: whatever the writer emits, the reader gives back element
//! for element, and a stream cut short anywhere is a format error.

use logsig_core::tlv::{MAX_TAG, MAX_VALUE_LEN};
use logsig_core::{ErrorKind, Tlv, TlvReader, TlvWriter};
use proptest::prelude::*;
use std::io::Cursor;

/// Tag, non-critical and forward flags, value.
type Element = (u16, bool, bool, Vec<u8>);

fn element() -> impl Strategy<Value = Element> {
    (
        prop_oneof![0u16..=0x1f, 0x20u16..=MAX_TAG],
        any::<bool>(),
        any::<bool>(),
        prop_oneof![
            prop::collection::vec(any::<u8>(), 0..=0xff),
            prop::collection::vec(any::<u8>(), 0x100..0x400),
        ],
    )
}

fn encode(elements: &[Element]) -> Vec<u8> {
    let mut w = TlvWriter::new(Vec::new());
    for (tag, nc, fwd, value) in elements {
        w.write_tlv(&Tlv::with_flags(*tag, *nc, *fwd, value).unwrap())
            .unwrap();
    }
    w.into_inner()
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn reader_returns_what_the_writer_wrote(elements in prop::collection::vec(element(), 0..8)) {
        let bytes = encode(&elements);
        let mut r = TlvReader::new(Cursor::new(&bytes));
        for (tag, nc, fwd, value) in &elements {
            let t = r.read_tlv().unwrap().unwrap();
            prop_assert_eq!(t.tag(), *tag);
            prop_assert_eq!(t.is_non_critical(), *nc);
            prop_assert_eq!(t.is_forward(), *fwd);
            prop_assert_eq!(t.value(), value.as_slice());
            let short = *tag <= 0x1f && value.len() <= 0xff;
            prop_assert_eq!(t.header_len(), if short { 2 } else { 4 });
        }
        prop_assert!(r.read_tlv().unwrap().is_none());
        prop_assert_eq!(r.offset(), bytes.len() as u64);
    }

    #[test]
    fn any_cut_inside_an_element_is_truncation(
        elements in prop::collection::vec(element(), 1..4),
        cut in any::<prop::sample::Index>(),
    ) {
        let bytes = encode(&elements);
        let len = cut.index(bytes.len());
        let boundaries: Vec<usize> = elements
            .iter()
            .scan(0, |at, (tag, nc, fwd, value)| {
                *at += Tlv::with_flags(*tag, *nc, *fwd, value).unwrap().raw().len();
                Some(*at)
            })
            .collect();
        prop_assume!(len > 0 && !boundaries.contains(&len));

        let mut r = TlvReader::new(Cursor::new(&bytes[..len]));
        let mut buf = Vec::new();
        let e = loop {
            match r.read_tlv_into(&mut buf) {
                Ok(Some(_)) => {}
                Ok(None) => panic!("cut at {len} of {} read as a clean end", bytes.len()),
                Err(e) => break e,
            }
        };
        prop_assert_eq!(e.kind(), ErrorKind::InvalidInputFormat);
    }

    #[test]
    fn oversized_values_never_encode(extra in 1usize..64, tag in 0u16..=MAX_TAG) {
        let e = Tlv::new(tag, &vec![0u8; MAX_VALUE_LEN + extra]).unwrap_err();
        prop_assert_eq!(e.kind(), ErrorKind::IndexOverflow);
    }
}
