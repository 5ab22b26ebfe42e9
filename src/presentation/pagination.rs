//! Pagination of long payloads.
//!
//! Payloads above the per-message byte cap split at natural boundaries
//! (paragraph, then sentence, then word) and are delivered with `page:`
//! navigation callbacks. Payloads above a second threshold become file
//! attachments instead.

use crate::telegram::Keyboard;

/// Split text into pages no larger than `byte_cap` bytes each.
///
/// Boundary preference: paragraph > sentence > word. A single word
/// longer than the cap is split at a char boundary as a last resort.
pub fn paginate(text: &str, byte_cap: usize) -> Vec<String> {
    assert!(byte_cap > 0, "byte cap must be positive");
    if text.len() <= byte_cap {
        return vec![text.to_string()];
    }

    let mut pages = Vec::new();
    let mut current = String::new();

    for paragraph in split_keeping(text, "\n\n") {
        if fits(&current, &paragraph, byte_cap) {
            current.push_str(&paragraph);
            continue;
        }
        flush(&mut pages, &mut current);
        if paragraph.len() <= byte_cap {
            current.push_str(&paragraph);
            continue;
        }
        // Paragraph alone exceeds the cap: fall to sentences.
        for sentence in split_sentences(&paragraph) {
            if fits(&current, &sentence, byte_cap) {
                current.push_str(&sentence);
                continue;
            }
            flush(&mut pages, &mut current);
            if sentence.len() <= byte_cap {
                current.push_str(&sentence);
                continue;
            }
            // Sentence alone exceeds the cap: fall to words.
            for word in split_keeping(&sentence, " ") {
                if fits(&current, &word, byte_cap) {
                    current.push_str(&word);
                    continue;
                }
                flush(&mut pages, &mut current);
                if word.len() <= byte_cap {
                    current.push_str(&word);
                } else {
                    // Pathological single token: hard split at char
                    // boundaries.
                    let mut rest = word.as_str();
                    while rest.len() > byte_cap {
                        let cut = floor_char_boundary(rest, byte_cap);
                        pages.push(rest[..cut].to_string());
                        rest = &rest[cut..];
                    }
                    current.push_str(rest);
                }
            }
        }
    }
    flush(&mut pages, &mut current);
    pages.retain(|p| !p.trim().is_empty());
    if pages.is_empty() {
        pages.push(String::new());
    }
    pages
}

fn fits(current: &str, next: &str, cap: usize) -> bool {
    current.len() + next.len() <= cap
}

fn flush(pages: &mut Vec<String>, current: &mut String) {
    if !current.trim().is_empty() {
        pages.push(std::mem::take(current).trim_end().to_string());
    } else {
        current.clear();
    }
}

/// Split on a separator, keeping it attached to the preceding chunk.
fn split_keeping(text: &str, sep: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(idx) = rest.find(sep) {
        let end = idx + sep.len();
        out.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    if !rest.is_empty() {
        out.push(rest.to_string());
    }
    out
}

/// Sentence-ish split keeping terminators.
fn split_sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0usize;
    let bytes = text.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if matches!(b, b'.' | b'!' | b'?') {
            // Consume following whitespace into the same chunk.
            let mut end = i + 1;
            while end < bytes.len() && bytes[end].is_ascii_whitespace() {
                end += 1;
            }
            if text.is_char_boundary(end) {
                out.push(text[start..end].to_string());
                start = end;
            }
        }
    }
    if start < text.len() {
        out.push(text[start..].to_string());
    }
    if out.is_empty() {
        out.push(text.to_string());
    }
    out
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx.max(1)
}

/// Page-navigation state for one delivered payload.
#[derive(Debug, Clone)]
pub struct Paginator {
    pages: Vec<String>,
    current: usize,
}

impl Paginator {
    pub fn new(text: &str, byte_cap: usize) -> Self {
        Self {
            pages: paginate(text, byte_cap),
            current: 0,
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    /// Move to page `n` (0-based, clamped); returns its text.
    pub fn goto(&mut self, n: usize) -> &str {
        self.current = n.min(self.pages.len() - 1);
        &self.pages[self.current]
    }

    pub fn current_page(&self) -> &str {
        &self.pages[self.current]
    }

    /// Navigation keyboard, empty for single-page payloads.
    pub fn keyboard(&self) -> Keyboard {
        if self.pages.len() <= 1 {
            return Keyboard::new();
        }
        let mut row = Vec::new();
        if self.current > 0 {
            row.push(Keyboard::button(
                "⬅️",
                format!("page:{}", self.current - 1),
            ));
        }
        row.push(Keyboard::button(
            format!("{}/{}", self.current + 1, self.pages.len()),
            "page:current",
        ));
        if self.current + 1 < self.pages.len() {
            row.push(Keyboard::button(
                "➡️",
                format!("page:{}", self.current + 1),
            ));
        }
        Keyboard::new().row(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_cap_is_single_message() {
        let text = "a".repeat(4096);
        assert_eq!(paginate(&text, 4096).len(), 1);
    }

    #[test]
    fn test_one_byte_over_splits() {
        let text = format!("{} {}", "a".repeat(3000), "b".repeat(1097));
        let pages = paginate(&text, 4096);
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|p| p.len() <= 4096));
    }

    #[test]
    fn test_prefers_paragraph_boundaries() {
        let text = format!("{}\n\n{}", "primeiro ".repeat(50), "segundo ".repeat(50));
        let pages = paginate(&text, 500);
        assert!(pages.len() >= 2);
        assert!(pages[0].contains("primeiro"));
        assert!(!pages[0].contains("segundo"));
    }

    #[test]
    fn test_sentence_fallback_inside_huge_paragraph() {
        let sentence = "Uma frase razoavelmente comprida para o teste. ";
        let text = sentence.repeat(40);
        let pages = paginate(&text, 300);
        assert!(pages.len() > 1);
        for page in &pages {
            assert!(page.len() <= 300);
            // Pages end at sentence boundaries.
            assert!(page.trim_end().ends_with('.'), "page ends mid-sentence: {page:?}");
        }
    }

    #[test]
    fn test_pathological_token_is_hard_split() {
        let text = "x".repeat(10_000);
        let pages = paginate(&text, 4096);
        assert!(pages.len() >= 3);
        assert!(pages.iter().all(|p| p.len() <= 4096));
        let total: usize = pages.iter().map(|p| p.len()).sum();
        assert_eq!(total, 10_000);
    }

    #[test]
    fn test_multibyte_text_splits_on_char_boundaries() {
        let text = "ã".repeat(5000);
        let pages = paginate(&text, 4096);
        for page in &pages {
            assert!(page.len() <= 4096);
            assert!(std::str::from_utf8(page.as_bytes()).is_ok());
        }
    }

    #[test]
    fn test_paginator_navigation_keyboard() {
        let text = format!("{}\n\n{}\n\n{}", "a".repeat(90), "b".repeat(90), "c".repeat(90));
        let mut pager = Paginator::new(&text, 100);
        assert_eq!(pager.page_count(), 3);

        let kb = pager.keyboard();
        // First page: no back button.
        assert_eq!(kb.rows[0].len(), 2);
        assert_eq!(kb.rows[0][1].token, "page:1");

        pager.goto(1);
        let kb = pager.keyboard();
        assert_eq!(kb.rows[0].len(), 3);
        assert_eq!(kb.rows[0][0].token, "page:0");
        assert_eq!(kb.rows[0][2].token, "page:2");

        // Clamped past the end.
        pager.goto(99);
        assert_eq!(pager.current_index(), 2);
        assert!(pager.current_page().starts_with('c'));
    }

    #[test]
    fn test_single_page_has_no_keyboard() {
        let pager = Paginator::new("curto", 4096);
        assert!(pager.keyboard().is_empty());
    }
}
