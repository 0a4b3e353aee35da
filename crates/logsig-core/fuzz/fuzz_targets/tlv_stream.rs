#![no_main]
use libfuzzer_sys::fuzz_target;
use logsig_core::{BlockHeader, BlockSignature, MetaRecord, TlvReader};

fuzz_target!(|data: &[u8]| {
    for tlv in TlvReader::new(data) {
        let Ok(tlv) = tlv else { break };
        let _ = BlockHeader::from_tlv(&tlv);
        let _ = BlockSignature::from_tlv(&tlv);
        let _ = MetaRecord::from_tlv(&tlv);
    }
});
