//! Incremental content deduplication.
//!
//! Upstream runners are inconsistent about what a "content" payload holds:
//! some send only the new suffix, some send the new suffix appended to
//! previously seen text, and some resend the full accumulated text. The
//! deduper extracts what is actually new without assuming which shape the
//! runner uses, and never drops data it cannot place.

/// Stateful per-turn buffer. Feed every raw content payload through
/// [`ContentDeduper::push`]; the returned fragment is safe to forward.
#[derive(Debug, Default)]
pub struct ContentDeduper {
    accumulated: String,
}

impl ContentDeduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extract the new fragment from a raw payload and fold it into the
    /// accumulated buffer. Returns an empty string when the payload holds
    /// nothing new.
    pub fn push(&mut self, raw: &str) -> String {
        let fragment = if raw.starts_with(&self.accumulated) {
            // Full accumulated text resent with a suffix (or the very
            // first payload): everything past the prefix is new.
            raw[self.accumulated.len()..].to_string()
        } else if !self.accumulated.is_empty() && raw.contains(&self.accumulated) {
            // Accumulated text embedded mid-payload: take what follows it.
            let start = raw
                .find(&self.accumulated)
                .expect("contains() implies find() succeeds");
            raw[start + self.accumulated.len()..].to_string()
        } else {
            // No overlap found: forward the payload verbatim so nothing
            // is lost, even if the client sees a duplicate.
            raw.to_string()
        };

        self.accumulated.push_str(&fragment);
        fragment
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn into_text(self) -> String {
        self.accumulated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumulative_payloads_yield_disjoint_fragments() {
        let mut deduper = ContentDeduper::new();
        let fragments: Vec<String> = ["H", "Hi", "Hi ", "Hi there"]
            .iter()
            .map(|raw| deduper.push(raw))
            .collect();

        assert_eq!(fragments, vec!["H", "i", " ", "there"]);
        assert_eq!(deduper.accumulated(), "Hi there");
    }

    #[test]
    fn pure_suffix_payloads_pass_through() {
        let mut deduper = ContentDeduper::new();
        assert_eq!(deduper.push("Hel"), "Hel");
        assert_eq!(deduper.push("lo"), "lo");
        assert_eq!(deduper.accumulated(), "Hello");
    }

    #[test]
    fn embedded_accumulated_text_is_stripped() {
        let mut deduper = ContentDeduper::new();
        deduper.push("Hi");
        assert_eq!(deduper.push(">> Hi there"), " there");
        assert_eq!(deduper.accumulated(), "Hi there");
    }

    #[test]
    fn non_overlapping_payload_is_forwarded_verbatim() {
        let mut deduper = ContentDeduper::new();
        deduper.push("abc");
        assert_eq!(deduper.push("zzz"), "zzz");
        assert_eq!(deduper.accumulated(), "abczzz");
    }

    #[test]
    fn unchanged_payload_yields_empty_fragment() {
        let mut deduper = ContentDeduper::new();
        deduper.push("Hi");
        assert_eq!(deduper.push("Hi"), "");
        assert_eq!(deduper.accumulated(), "Hi");
    }

    #[test]
    fn fragments_concatenate_to_the_final_payload() {
        let payloads = ["On", "One t", "One two", "One two three"];
        let mut deduper = ContentDeduper::new();
        let joined: String = payloads.iter().map(|raw| deduper.push(raw)).collect();

        assert_eq!(joined, "One two three");
        assert_eq!(deduper.into_text(), "One two three");
    }
}
