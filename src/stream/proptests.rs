//! Property-based tests for the decode pipeline
//!
//! The load-bearing property: how the transport splits the byte stream
//! must never change the decoded event sequence.

use super::classify::{classify_line, StreamEvent};
use super::frames::FrameReader;
use proptest::prelude::*;
use serde_json::json;

fn arb_line() -> impl Strategy<Value = String> {
    prop_oneof![
        ("[a-z0-9]{1,12}", "[a-z0-9-]{1,12}").prop_map(|(model, sid)| json!({
            "type": "system", "subtype": "init", "model": model, "session_id": sid,
        })
        .to_string()),
        "[a-zA-Z0-9 .,!?]{0,40}".prop_map(|text| json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": text}]}
        })
        .to_string()),
        "[a-zA-Z0-9 ]{0,40}".prop_map(|text| json!({
            "type": "assistant",
            "message": {"content": [{"type": "thinking", "thinking": text}]}
        })
        .to_string()),
        ("[a-z0-9]{4,10}", "[a-z_]{1,10}").prop_map(|(id, name)| json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "tool_use", "id": id, "name": name, "input": {"arg": 1}}
            ]}
        })
        .to_string()),
        ("[a-z0-9]{4,10}", "[a-zA-Z0-9 ]{0,30}", any::<bool>()).prop_map(
            |(id, result, is_error)| json!({
                "type": "user",
                "message": {"content": [
                    {"type": "tool_result", "tool_use_id": id, "content": result,
                     "is_error": is_error}
                ]}
            })
            .to_string()
        ),
        (0u64..100_000, any::<bool>()).prop_map(|(cents, is_error)| json!({
            "type": "result", "subtype": "success",
            "total_cost_usd": f64::from(u32::try_from(cents).unwrap_or(0)) / 100.0,
            "duration_ms": cents, "is_error": is_error,
        })
        .to_string()),
    ]
}

fn decode_chunks(chunks: &[String]) -> Vec<StreamEvent> {
    let mut reader = FrameReader::new();
    let mut events = Vec::new();
    for chunk in chunks {
        for frame in reader.push(chunk).expect("no overflow in test input") {
            events.extend(classify_line(&frame).expect("well-formed test input"));
        }
    }
    for frame in reader.finish().expect("no overflow in test input") {
        events.extend(classify_line(&frame).expect("well-formed test input"));
    }
    events
}

/// Split `input` at the given fractional positions (clamped to char
/// boundaries) to simulate arbitrary transport chunking.
fn split_at_fractions(input: &str, fractions: &[f64]) -> Vec<String> {
    let mut cuts: Vec<usize> = fractions
        .iter()
        .map(|f| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let mut idx = (f * input.len() as f64) as usize;
            while idx < input.len() && !input.is_char_boundary(idx) {
                idx += 1;
            }
            idx.min(input.len())
        })
        .collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut chunks = Vec::new();
    let mut start = 0;
    for cut in cuts {
        if cut > start {
            chunks.push(input.get(start..cut).unwrap_or_default().to_string());
            start = cut;
        }
    }
    if start < input.len() {
        chunks.push(input.get(start..).unwrap_or_default().to_string());
    }
    chunks
}

proptest! {
    /// Chunk-boundary invariance: any split of the byte stream decodes to
    /// the same event sequence as one big chunk.
    #[test]
    fn chunking_never_changes_decoded_events(
        lines in proptest::collection::vec(arb_line(), 1..8),
        fractions in proptest::collection::vec(0.0f64..1.0, 0..12),
    ) {
        let mut input = lines.join("\n");
        input.push('\n');

        let whole = decode_chunks(std::slice::from_ref(&input));
        let split = decode_chunks(&split_at_fractions(&input, &fractions));

        prop_assert_eq!(whole, split);
    }

    /// Byte-at-a-time delivery is the degenerate worst case.
    #[test]
    fn single_byte_chunks_decode_identically(
        lines in proptest::collection::vec(arb_line(), 1..4),
    ) {
        let mut input = lines.join("\n");
        input.push('\n');

        let whole = decode_chunks(std::slice::from_ref(&input));
        let bytes: Vec<String> = input.chars().map(|c| c.to_string()).collect();
        prop_assert_eq!(whole, decode_chunks(&bytes));
    }
}
