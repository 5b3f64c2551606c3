//! Property-based tests for the reconstructor
//!
//! The pending-tool invariant must hold at every point in processing, for
//! any event order the stream can produce.

use super::model::ToolStatus;
use super::reconstructor::Reconstructor;
use crate::notify::TurnOutcome;
use crate::stream::{StreamEvent, UsageDelta};
use proptest::prelude::*;
use std::collections::HashSet;

fn arb_event() -> impl Strategy<Value = StreamEvent> {
    prop_oneof![
        ("[a-z0-9]{1,8}", "[a-z0-9]{1,8}").prop_map(|(model, sid)| StreamEvent::SystemInit {
            model,
            session_id: sid,
            tools: vec![],
            capability_servers: vec![],
        }),
        "[a-zA-Z ]{0,30}".prop_map(|text| StreamEvent::TextDelta { text }),
        "[a-zA-Z ]{0,30}".prop_map(|text| StreamEvent::ThinkingDelta { text }),
        ("t[0-9]{1,2}", "[a-z]{1,8}").prop_map(|(id, name)| StreamEvent::ToolInvocation {
            id,
            name,
            input: serde_json::Value::Null,
            parent_id: None,
        }),
        // Result ids overlap the invocation id space so some match and
        // some are orphans
        ("t[0-9]{1,2}", any::<bool>()).prop_map(|(id, is_error)| StreamEvent::ToolResult {
            id,
            result: "out".to_string(),
            is_error,
        }),
        Just(StreamEvent::UsageUpdate {
            usage: UsageDelta::default()
        }),
        any::<bool>().prop_map(|is_error| StreamEvent::ResultFinal {
            cost_usd: 0.0,
            duration_ms: 1,
            is_error,
            subtype: "success".to_string(),
        }),
    ]
}

fn assert_pending_invariant(r: &Reconstructor) {
    let calling: HashSet<String> = r
        .session()
        .tool_executions
        .values()
        .filter(|e| e.status == ToolStatus::Calling)
        .map(|e| e.id.clone())
        .collect();
    assert_eq!(
        r.session().pending_tool_ids,
        calling,
        "pending_tool_ids diverged from the set of Calling executions"
    );
}

proptest! {
    #[test]
    fn pending_tools_always_match_calling_executions(
        events in proptest::collection::vec(arb_event(), 0..40),
    ) {
        let mut r = Reconstructor::new();
        r.begin_turn("prompt");
        assert_pending_invariant(&r);

        for event in events {
            r.handle_event(event);
            assert_pending_invariant(&r);
        }

        r.finish_turn(TurnOutcome::Success);
        assert_pending_invariant(&r);
        prop_assert!(r.session().pending_tool_ids.is_empty());
    }

    #[test]
    fn every_turn_emits_exactly_one_completion(
        events in proptest::collection::vec(arb_event(), 0..40),
    ) {
        let mut r = Reconstructor::new();
        r.begin_turn("prompt");

        let mut completions = 0usize;
        for event in events {
            completions += r
                .handle_event(event)
                .iter()
                .filter(|n| matches!(n, crate::notify::Notification::TurnComplete { .. }))
                .count();
        }
        completions += r
            .finish_turn(TurnOutcome::Aborted)
            .iter()
            .filter(|n| matches!(n, crate::notify::Notification::TurnComplete { .. }))
            .count();

        prop_assert_eq!(completions, 1);
    }
}
