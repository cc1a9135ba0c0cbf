#![no_main]

use libfuzzer_sys::fuzz_target;
use trellis_gateway::wire::{
    best_effort_request_id, classify_parse_error, encode_frame, error_response, event_class,
    parse_frame, Frame,
};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    let maybe_id = best_effort_request_id(&raw);

    match parse_frame(&raw) {
        Ok(frame) => {
            if let Frame::Evt { event, .. } = &frame {
                assert!(event_class(event).len() <= event.len());
            }
            let encoded = encode_frame(&frame);
            let reparsed = parse_frame(&encoded).expect("encoded frame must reparse");
            assert_eq!(frame, reparsed);
        }
        Err(error) => {
            let message = error.to_string();
            let code = classify_parse_error(&message);
            assert!(!code.trim().is_empty());
            let id = maybe_id.as_deref().unwrap_or("unknown-request");
            let response = error_response(id, code, message);
            assert!(matches!(response, Frame::Res { ok: false, .. }));
        }
    }
});
