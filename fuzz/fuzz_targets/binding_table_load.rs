#![no_main]

use libfuzzer_sys::fuzz_target;
use trellis_routing::{BindingScope, BindingTable};

fuzz_target!(|data: &[u8]| {
    let Ok(table) = serde_json::from_slice::<BindingTable>(data) else {
        return;
    };
    for binding in &table.bindings {
        assert!(BindingScope::PRIORITY.contains(&binding.scope));
    }
    let encoded = serde_json::to_vec(&table).expect("table must re-encode");
    let reparsed: BindingTable = serde_json::from_slice(&encoded).expect("round trip");
    assert_eq!(table, reparsed);
});
