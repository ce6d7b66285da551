/// Tags whose content is routed to the reasoning channel instead of the
/// user-visible stream. Local models emit either spelling in-band.
const REASONING_TAGS: &[&str] = &["thinking", "think"];

/// Output of one parser push: text for each channel, in arrival order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedChunk {
    pub visible: String,
    pub reasoning: String,
}

impl ParsedChunk {
    pub fn is_empty(&self) -> bool {
        self.visible.is_empty() && self.reasoning.is_empty()
    }
}

enum TagMatch {
    /// (tag, is_closing, consumed bytes)
    Complete(&'static str, bool, usize),
    /// Could still become a recognised tag; wait for more input.
    Partial,
    /// Not one of ours — a literal '<'.
    None,
}

/// Streaming extractor for `<thinking>…</thinking>`-style tags.
///
/// Tolerant to tags split across provider chunks: a trailing fragment that
/// could still become a recognised tag stays buffered until the next push.
/// Unknown tags pass through unchanged.
#[derive(Default)]
pub struct TagStreamParser {
    pending: String,
    inside: Option<&'static str>,
}

impl TagStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while an opened reasoning tag has not been closed.
    pub fn in_reasoning(&self) -> bool {
        self.inside.is_some()
    }

    /// Feed one chunk of model output.
    pub fn push(&mut self, chunk: &str) -> ParsedChunk {
        self.pending.push_str(chunk);
        let mut out = ParsedChunk::default();

        loop {
            match self.pending.find('<') {
                None => {
                    let text = std::mem::take(&mut self.pending);
                    self.route(&text, &mut out);
                    break;
                }
                Some(idx) => {
                    if idx > 0 {
                        let text: String = self.pending.drain(..idx).collect();
                        self.route(&text, &mut out);
                    }
                    match self.match_tag() {
                        TagMatch::Complete(tag, closing, len) => {
                            self.pending.drain(..len);
                            if closing {
                                if self.inside == Some(tag) {
                                    self.inside = None;
                                } else {
                                    // Stray close — pass through unchanged.
                                    self.route(&format!("</{}>", tag), &mut out);
                                }
                            } else {
                                self.inside = Some(tag);
                            }
                        }
                        TagMatch::Partial => break,
                        TagMatch::None => {
                            let lit: String = self.pending.drain(..1).collect();
                            self.route(&lit, &mut out);
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever remains at end of stream. An unterminated fragment is
    /// emitted as-is on the current channel.
    pub fn finish(&mut self) -> ParsedChunk {
        let mut out = ParsedChunk::default();
        let text = std::mem::take(&mut self.pending);
        self.route(&text, &mut out);
        out
    }

    fn route(&self, text: &str, out: &mut ParsedChunk) {
        if text.is_empty() {
            return;
        }
        if self.inside.is_some() {
            out.reasoning.push_str(text);
        } else {
            out.visible.push_str(text);
        }
    }

    /// `pending` starts with '<'. Decide whether it begins one of our tags.
    fn match_tag(&self) -> TagMatch {
        let p = self.pending.as_str();
        let mut partial = false;
        for tag in REASONING_TAGS {
            let open = format!("<{}>", tag);
            let close = format!("</{}>", tag);
            if p.starts_with(&open) {
                return TagMatch::Complete(tag, false, open.len());
            }
            if p.starts_with(&close) {
                return TagMatch::Complete(tag, true, close.len());
            }
            if open.starts_with(p) || close.starts_with(p) {
                partial = true;
            }
        }
        if partial {
            TagMatch::Partial
        } else {
            TagMatch::None
        }
    }
}

/// One-shot helper for non-streaming responses.
pub fn extract_reasoning(text: &str) -> ParsedChunk {
    let mut parser = TagStreamParser::new();
    let mut first = parser.push(text);
    let rest = parser.finish();
    first.visible.push_str(&rest.visible);
    first.reasoning.push_str(&rest.reasoning);
    first
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        let mut p = TagStreamParser::new();
        let out = p.push("hello world");
        assert_eq!(out.visible, "hello world");
        assert!(out.reasoning.is_empty());
    }

    #[test]
    fn thinking_content_goes_to_reasoning() {
        let mut p = TagStreamParser::new();
        let out = p.push("<thinking>let me see</thinking>The answer is 4.");
        assert_eq!(out.reasoning, "let me see");
        assert_eq!(out.visible, "The answer is 4.");
    }

    #[test]
    fn tag_split_across_chunks() {
        let mut p = TagStreamParser::new();
        let a = p.push("before <thi");
        assert_eq!(a.visible, "before ");
        assert!(a.reasoning.is_empty());

        let b = p.push("nking>secret</thin");
        assert_eq!(b.reasoning, "secret");
        assert!(b.visible.is_empty());

        let c = p.push("king> after");
        assert_eq!(c.visible, " after");
        assert!(!p.in_reasoning());
    }

    #[test]
    fn think_variant_is_recognised() {
        let mut p = TagStreamParser::new();
        let out = p.push("<think>short</think>ok");
        assert_eq!(out.reasoning, "short");
        assert_eq!(out.visible, "ok");
    }

    #[test]
    fn unknown_tags_pass_through_unchanged() {
        let mut p = TagStreamParser::new();
        let mut out = p.push("a <b>bold</b> move");
        out.visible.push_str(&p.finish().visible);
        assert_eq!(out.visible, "a <b>bold</b> move");
        assert!(out.reasoning.is_empty());
    }

    #[test]
    fn lone_angle_bracket_is_literal() {
        let mut p = TagStreamParser::new();
        let mut out = p.push("x < y and z");
        out.visible.push_str(&p.finish().visible);
        assert_eq!(out.visible, "x < y and z");
    }

    #[test]
    fn trailing_partial_tag_flushes_on_finish() {
        let mut p = TagStreamParser::new();
        let out = p.push("done <thin");
        assert_eq!(out.visible, "done ");
        let rest = p.finish();
        assert_eq!(rest.visible, "<thin");
    }

    #[test]
    fn unclosed_thinking_stays_on_reasoning_channel() {
        let mut p = TagStreamParser::new();
        let out = p.push("<thinking>never closed");
        assert_eq!(out.reasoning, "never closed");
        assert!(p.in_reasoning());
    }

    #[test]
    fn stray_close_passes_through() {
        let mut p = TagStreamParser::new();
        let out = p.push("odd</thinking>text");
        assert_eq!(out.visible, "odd</thinking>text");
    }

    #[test]
    fn multiple_blocks_in_one_chunk() {
        let out = extract_reasoning("<thinking>a</thinking>one<thinking>b</thinking>two");
        assert_eq!(out.reasoning, "ab");
        assert_eq!(out.visible, "onetwo");
    }
}
