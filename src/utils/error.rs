/// Markers after which providers append payloads we never want in a log line.
const ELIDED_PAYLOAD_MARKERS: [&str; 2] = [" text: ", " with body: "];

/// Collapse an RPC/HTTP error message into one bounded log line.
///
/// Response bodies and backtraces are elided; whitespace runs become single spaces.
pub fn compact_error_message(message: &str, max_len: usize) -> String {
    let mut raw = message;
    if let Some((prefix, _)) = raw.split_once("Stack backtrace:") {
        raw = prefix;
    }

    let mut head = raw.to_string();
    let mut body_hint: Option<String> = None;
    for marker in ELIDED_PAYLOAD_MARKERS {
        if let Some((prefix, body)) = head.split_once(marker) {
            // Keep the JSON-RPC error code if the body carries one; classification depends on it.
            body_hint = extract_rpc_code(body).map(|code| format!(" code={code}"));
            head = format!("{prefix}{}=<omitted>", marker.trim_end_matches(": ").trim_end());
            break;
        }
    }
    if let Some(hint) = body_hint {
        head.push_str(&hint);
    }

    let mut compact = String::with_capacity(head.len().min(max_len.saturating_add(16)));
    for word in head.split_whitespace() {
        if !compact.is_empty() {
            compact.push(' ');
        }
        compact.push_str(word);
        if compact.len() > max_len {
            break;
        }
    }
    if compact.len() > max_len {
        let mut cut = max_len;
        while !compact.is_char_boundary(cut) {
            cut -= 1;
        }
        compact.truncate(cut);
        compact.push_str("...(truncated)");
    }
    compact
}

fn extract_rpc_code(body: &str) -> Option<i64> {
    let start = body.find("\"code\"")?;
    let tail = &body[start + 6..];
    let tail = tail.trim_start().strip_prefix(':')?.trim_start();
    let end = tail
        .char_indices()
        .find(|(idx, ch)| !(ch.is_ascii_digit() || (*idx == 0 && *ch == '-')))
        .map(|(idx, _)| idx)
        .unwrap_or(tail.len());
    tail[..end].parse().ok()
}
