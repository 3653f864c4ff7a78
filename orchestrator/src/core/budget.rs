//! Byte budget helpers for prompts and captured output.

/// Truncate `text` to at most `limit` bytes on a char boundary, noting the cut.
pub fn truncate_with_notice(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[truncated {} bytes]\n", &text[..cut], text.len() - cut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let text = "héllo";
        let out = truncate_with_notice(text, 2);
        assert!(out.starts_with('h'));
        assert!(out.contains("[truncated"));
        assert_eq!(truncate_with_notice("short", 10), "short");
    }
}
