//! SentenceBuilder (§4.4): accumulates consecutive ASR finals into complete,
//! punctuation-terminated sentences and hands each one off for translation
//! as soon as it completes.

use crate::id::SegmentId;
use crate::model::Sentence;

const SENTENCE_END: [char; 6] = ['.', '!', '?', '。', '！', '？'];

pub struct SentenceBuilder {
    buffer: String,
    /// The segment a sentence is attributed to, locked in at the moment the
    /// buffer goes from empty to non-empty. A card split mid-sentence must
    /// not reassign the sentence to the new card.
    locked_segment_id: Option<SegmentId>,
    sentence_index: u32,
}

impl SentenceBuilder {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            locked_segment_id: None,
            sentence_index: 0,
        }
    }

    /// Accumulate one ASR final. Returns every sentence the buffer now
    /// completes (usually zero or one, occasionally more if a single final
    /// packs several short sentences together).
    pub fn add_final(&mut self, text: &str, segment_id: SegmentId) -> Vec<Sentence> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }

        if self.buffer.is_empty() {
            self.locked_segment_id = Some(segment_id);
            self.buffer.push_str(text);
        } else {
            self.buffer.push(' ');
            self.buffer.push_str(text);
        }

        self.extract_sentences()
    }

    /// Split the buffer on sentence-ending punctuation, keeping the
    /// punctuation attached to the sentence it closes. Whatever remains
    /// after the last terminator stays buffered.
    fn extract_sentences(&mut self) -> Vec<Sentence> {
        let segment_id = match self.locked_segment_id {
            Some(id) => id,
            None => return Vec::new(),
        };

        let mut sentences = Vec::new();
        let mut start = 0;
        let chars: Vec<char> = self.buffer.chars().collect();
        let mut cut_at = 0;

        let mut i = 0;
        while i < chars.len() {
            if SENTENCE_END.contains(&chars[i]) {
                let mut end = i + 1;
                while end < chars.len() && chars[end].is_whitespace() {
                    end += 1;
                }
                let sentence_text: String = chars[start..i + 1].iter().collect();
                let sentence_text = sentence_text.trim().to_string();
                if !sentence_text.is_empty() {
                    sentences.push(Sentence {
                        text: sentence_text,
                        segment_id,
                        sentence_index: self.sentence_index,
                    });
                    self.sentence_index += 1;
                }
                start = end;
                cut_at = end;
                i = end;
            } else {
                i += 1;
            }
        }

        self.buffer = chars[cut_at..].iter().collect::<String>().trim().to_string();
        sentences
    }

    /// Force out whatever remains as one sentence — called on stop/disconnect.
    pub fn flush(&mut self) -> Vec<Sentence> {
        if self.buffer.trim().is_empty() {
            return Vec::new();
        }
        let segment_id = self.locked_segment_id.unwrap_or_else(SegmentId::new);
        let sentence = Sentence {
            text: self.buffer.trim().to_string(),
            segment_id,
            sentence_index: self.sentence_index,
        };
        self.buffer.clear();
        self.sentence_index += 1;
        vec![sentence]
    }

    /// A new card is starting: flush the old card's remainder (imperfect
    /// sentence boundary, but the card's content must stay intact) and reset
    /// the per-card sentence counter.
    pub fn reset_for_new_segment(&mut self, _new_segment_id: SegmentId) -> Vec<Sentence> {
        let flushed = self.flush();
        self.sentence_index = 0;
        flushed
    }

    pub fn get_incomplete_text(&self) -> &str {
        &self.buffer
    }

    pub fn clear_buffer(&mut self) {
        self.buffer.clear();
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.locked_segment_id = None;
        self.sentence_index = 0;
    }
}

impl Default for SentenceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_final_with_terminator_yields_one_sentence() {
        let mut builder = SentenceBuilder::new();
        let seg = SegmentId::new();
        let sentences = builder.add_final("Hello world.", seg);
        assert_eq!(sentences.len(), 1);
        assert_eq!(sentences[0].text, "Hello world.");
        assert_eq!(sentences[0].sentence_index, 0);
    }

    #[test]
    fn partial_final_without_terminator_buffers() {
        let mut builder = SentenceBuilder::new();
        let seg = SegmentId::new();
        assert!(builder.add_final("Hello", seg).is_empty());
        assert_eq!(builder.get_incomplete_text(), "Hello");

        let sentences = builder.add_final("world.", seg);
        assert_eq!(sentences.len(), 1);
        assert_eq!(sentences[0].text, "Hello world.");
    }

    #[test]
    fn one_final_with_two_sentences_yields_two() {
        let mut builder = SentenceBuilder::new();
        let seg = SegmentId::new();
        let sentences = builder.add_final("Hi there. How are you?", seg);
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0].text, "Hi there.");
        assert_eq!(sentences[1].text, "How are you?");
        assert_eq!(sentences[1].sentence_index, 1);
    }

    #[test]
    fn segment_stays_locked_to_first_fragment() {
        let mut builder = SentenceBuilder::new();
        let seg_a = SegmentId::new();
        let seg_b = SegmentId::new();

        builder.add_final("Hello", seg_a);
        let sentences = builder.add_final("world.", seg_b);
        assert_eq!(sentences[0].segment_id, seg_a);
    }

    #[test]
    fn flush_returns_incomplete_remainder() {
        let mut builder = SentenceBuilder::new();
        let seg = SegmentId::new();
        builder.add_final("unfinished thought", seg);

        let flushed = builder.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].text, "unfinished thought");
        assert!(builder.get_incomplete_text().is_empty());
    }

    #[test]
    fn reset_for_new_segment_flushes_and_resets_index() {
        let mut builder = SentenceBuilder::new();
        let seg_a = SegmentId::new();
        let seg_b = SegmentId::new();

        builder.add_final("leftover", seg_a);
        builder.add_final("Complete.", seg_a);
        // consume the completed sentence via add_final above (index now 1)
        let flushed = builder.reset_for_new_segment(seg_b);
        assert!(flushed.is_empty());

        let sentences = builder.add_final("New card sentence.", seg_b);
        assert_eq!(sentences[0].sentence_index, 0);
    }

    #[test]
    fn chinese_terminators_are_recognized() {
        let mut builder = SentenceBuilder::new();
        let seg = SegmentId::new();
        let sentences = builder.add_final("你好。今天天气怎么样？", seg);
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0].text, "你好。");
        assert_eq!(sentences[1].text, "今天天气怎么样？");
    }

    #[test]
    fn whitespace_only_final_is_ignored() {
        let mut builder = SentenceBuilder::new();
        let seg = SegmentId::new();
        assert!(builder.add_final("   ", seg).is_empty());
        assert!(builder.get_incomplete_text().is_empty());
    }
}
