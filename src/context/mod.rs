//! Context-window budgeting.
//!
//! [`build`] fits a three-tier prompt (framing, history, new turn) into
//! a unit budget with a deterministic eviction policy: the new turn is
//! never dropped to make room, framing goes next, and history fills
//! whatever remains, newest first.

pub mod limits;

pub use limits::context_limit;

use crate::llm::ChatMessage;

/// Approximate size of a message in budget units.
///
/// Cheap tokenizer-free heuristic over character classes: each CJK
/// character, Latin word and numeric run counts one unit, punctuation
/// half a unit. Good enough to keep prompts inside a window without a
/// per-vendor tokenizer.
pub fn message_units(text: &str) -> usize {
    // Tracked in half-units so punctuation stays integral.
    let mut halves = 0usize;
    let mut in_run = false;
    for c in text.chars() {
        if is_cjk(c) {
            halves += flush(&mut in_run) + 2;
        } else if c.is_alphanumeric() {
            in_run = true;
        } else if c.is_whitespace() {
            halves += flush(&mut in_run);
        } else {
            halves += flush(&mut in_run) + 1;
        }
    }
    halves += flush(&mut in_run);
    halves.div_ceil(2)
}

fn flush(in_run: &mut bool) -> usize {
    if std::mem::take(in_run) { 2 } else { 0 }
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3040..=0x30FF      // Hiragana, Katakana
        | 0x3400..=0x4DBF    // CJK extension A
        | 0x4E00..=0x9FFF    // CJK unified
        | 0xAC00..=0xD7AF    // Hangul syllables
        | 0xF900..=0xFAFF    // CJK compatibility
    )
}

/// Total units of a message list.
pub fn transcript_units(messages: &[ChatMessage]) -> usize {
    messages.iter().map(|m| message_units(&m.content)).sum()
}

/// Assemble a budget-respecting prompt.
///
/// Priority order, highest first: `end` (the new user turn), `pre`
/// (system message and ephemeral instructions), `middle` (persisted
/// history, newest kept first). The result is always ordered
/// `pre`, selected `middle` (chronological), `end`.
///
/// If even `end` alone exceeds `limit`, the longest prefix of `end`
/// that fits is returned on its own — possibly empty. Callers must
/// treat an empty result as "nothing fits" and fail the request.
pub fn build(
    pre: &[ChatMessage],
    middle: &[ChatMessage],
    end: &[ChatMessage],
    limit: usize,
) -> Vec<ChatMessage> {
    let mut total = 0usize;

    let mut chosen_end: Vec<ChatMessage> = Vec::with_capacity(end.len());
    for msg in end {
        let units = message_units(&msg.content);
        if total + units > limit {
            break;
        }
        total += units;
        chosen_end.push(msg.clone());
    }
    // The new turn could not fit whole; nothing else gets spliced in.
    if chosen_end.len() < end.len() {
        return chosen_end;
    }

    let mut chosen_pre: Vec<ChatMessage> = Vec::with_capacity(pre.len());
    for msg in pre {
        let units = message_units(&msg.content);
        if total + units > limit {
            break;
        }
        total += units;
        chosen_pre.push(msg.clone());
    }

    // Walk history newest-first, then restore chronological order.
    let mut chosen_middle: Vec<ChatMessage> = Vec::new();
    for msg in middle.iter().rev() {
        let units = message_units(&msg.content);
        if total + units > limit {
            break;
        }
        total += units;
        chosen_middle.push(msg.clone());
    }
    chosen_middle.reverse();

    let mut result = chosen_pre;
    result.extend(chosen_middle);
    result.extend(chosen_end);
    result
}

/// Drop oldest messages until the transcript fits the limit.
///
/// Used at history-append time so stored conversations never grow past
/// the window. Always keeps at least the newest message.
pub fn truncate_history(mut messages: Vec<ChatMessage>, limit: usize) -> Vec<ChatMessage> {
    let mut total = transcript_units(&messages);
    let mut drop = 0usize;
    while total > limit && messages.len() - drop > 1 {
        total -= message_units(&messages[drop].content);
        drop += 1;
    }
    if drop > 0 {
        messages.drain(..drop);
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;
    use pretty_assertions::assert_eq;

    #[test]
    fn latin_words_count_one_unit_each() {
        assert_eq!(message_units("hello"), 1);
        assert_eq!(message_units("one two three"), 3);
    }

    #[test]
    fn cjk_characters_count_individually() {
        assert_eq!(message_units("你好"), 2);
        assert_eq!(message_units("你好 world"), 3);
    }

    #[test]
    fn numeric_runs_count_one_unit() {
        assert_eq!(message_units("call 12345 now"), 3);
    }

    #[test]
    fn punctuation_counts_half() {
        // Two words plus two punctuation halves -> 3 units.
        assert_eq!(message_units("wait, really?"), 3);
        // A lone punctuation mark rounds up to one unit.
        assert_eq!(message_units("!"), 1);
    }

    fn msgs(contents: &[&str]) -> Vec<ChatMessage> {
        contents.iter().map(|c| ChatMessage::human(*c)).collect()
    }

    #[test]
    fn end_always_anchored() {
        let end = msgs(&["the new user turn here"]); // 5 units
        let out = build(&[], &[], &end, 5);
        assert_eq!(out, end);
    }

    #[test]
    fn end_prefix_when_budget_too_small() {
        let end = msgs(&["first part", "second part overflowing clearly"]); // 2 + 4
        let out = build(&msgs(&["sys"]), &msgs(&["old"]), &end, 3);
        // Only the fitting prefix of end, nothing spliced around it.
        assert_eq!(out, msgs(&["first part"]));
    }

    #[test]
    fn empty_when_nothing_fits() {
        let out = build(&[], &[], &msgs(&["way too long for this"]), 2);
        assert!(out.is_empty());
    }

    #[test]
    fn priority_pre_over_middle() {
        let pre = msgs(&["sys prompt here"]); // 3
        let end = msgs(&["user turn now"]); // 3
        let middle = msgs(&["anything else"]); // 2
        // pre + end fill the budget exactly; middle must be dropped whole.
        let out = build(&pre, &middle, &end, 6);
        let mut expect = pre.clone();
        expect.extend(end.clone());
        assert_eq!(out, expect);
    }

    #[test]
    fn history_keeps_newest_in_chronological_order() {
        // Five 3-unit messages, pre+end consume 4 of a 10-unit budget:
        // exactly the two newest fit, spliced back in original order.
        let middle = msgs(&[
            "aa bb cc", "dd ee ff", "gg hh ii", "jj kk ll", "mm nn oo",
        ]);
        let pre = msgs(&["one two"]); // 2
        let end = msgs(&["three four"]); // 2
        let out = build(&pre, &middle, &end, 10);
        let expect: Vec<ChatMessage> = msgs(&["one two", "jj kk ll", "mm nn oo", "three four"]);
        assert_eq!(out, expect);
    }

    #[test]
    fn build_respects_limit_for_any_input() {
        let pre = msgs(&["alpha beta gamma", "delta"]);
        let middle = msgs(&["one", "two three", "four five six", "seven"]);
        let end = msgs(&["tail message"]);
        for limit in 0..20 {
            let out = build(&pre, &middle, &end, limit);
            assert!(
                transcript_units(&out) <= limit,
                "limit {limit} violated: {} units",
                transcript_units(&out)
            );
        }
    }

    #[test]
    fn truncate_drops_oldest_first() {
        let history = msgs(&["aa bb cc", "dd ee ff", "gg hh ii"]); // 3 x 3 units
        let out = truncate_history(history, 6);
        assert_eq!(out, msgs(&["dd ee ff", "gg hh ii"]));
    }

    #[test]
    fn truncate_keeps_newest_even_when_oversized() {
        let history = msgs(&["tiny", "this one is far too large to fit"]);
        let out = truncate_history(history, 2);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, "this one is far too large to fit");
    }
}
