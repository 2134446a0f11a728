//! Logging of long lists without overrunning the system log's line limit.

/// Longest message syslog reliably accepts.
pub const MAX_MESSAGE_LEN: usize = 1024;

/// Split `items` into messages of the form `"{prefix}: a, b, c"`, each shorter
/// than `max_len` bytes. Items too long to fit on their own are truncated.
pub fn chunk_list<S: AsRef<str>>(prefix: &str, items: &[S], max_len: usize) -> Vec<String> {
    let head = format!("{prefix}: ");
    let budget = max_len.saturating_sub(head.len() + 1).max(1);

    let mut messages = Vec::new();
    let mut current = String::new();
    for item in items {
        let item = truncate(item.as_ref(), budget);
        let extra = if current.is_empty() { item.len() } else { item.len() + 2 };
        if !current.is_empty() && current.len() + extra > budget {
            messages.push(format!("{head}{current}"));
            current.clear();
        }
        if !current.is_empty() {
            current.push_str(", ");
        }
        current.push_str(item);
    }
    if !current.is_empty() {
        messages.push(format!("{head}{current}"));
    }
    messages
}

/// Log `items` at info level, chunked with [`chunk_list`].
pub fn log_list<S: AsRef<str>>(prefix: &str, items: &[S]) {
    for message in chunk_list(prefix, items, MAX_MESSAGE_LEN) {
        tracing::info!("{message}");
    }
}

fn truncate(item: &str, max: usize) -> &str {
    if item.len() <= max {
        return item;
    }
    let mut end = max;
    while !item.is_char_boundary(end) {
        end -= 1;
    }
    &item[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_list_is_one_message() {
        let messages = chunk_list("Listening for", &["a", "b", "c"], MAX_MESSAGE_LEN);
        assert_eq!(messages, vec!["Listening for: a, b, c".to_string()]);
    }

    #[test]
    fn empty_list_logs_nothing() {
        let items: [&str; 0] = [];
        assert!(chunk_list("Listening for", &items, MAX_MESSAGE_LEN).is_empty());
    }

    #[test]
    fn long_lists_split_under_limit_and_keep_order() {
        let items: Vec<String> = (0..200)
            .map(|i| format!("State:/Network/Interface/en{i}/IPv4"))
            .collect();
        let messages = chunk_list("Listening for", &items, MAX_MESSAGE_LEN);

        assert!(messages.len() > 1);
        assert!(messages.iter().all(|m| m.len() < MAX_MESSAGE_LEN));

        let rejoined: Vec<String> = messages
            .iter()
            .flat_map(|m| {
                m.trim_start_matches("Listening for: ")
                    .split(", ")
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();
        assert_eq!(rejoined, items);
    }

    #[test]
    fn oversized_item_is_truncated_on_char_boundary() {
        let item = "é".repeat(600);
        let messages = chunk_list("x", &[item], 64);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].len() < 64);
        assert!(messages[0].starts_with("x: é"));
    }
}
