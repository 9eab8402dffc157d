/// A profile document parsed into a preamble (everything before the first
/// `## ` heading) and an ordered list of heading-delimited sections, mirroring
/// the `## Heading` convention the teacher's memory vault writer used for its
/// Obsidian export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileDocument {
    pub preamble: String,
    pub sections: Vec<(String, String)>,
}

impl ProfileDocument {
    pub fn parse(raw: &str) -> Self {
        let mut preamble_lines = Vec::new();
        let mut sections: Vec<(String, String)> = Vec::new();
        let mut current: Option<(String, Vec<&str>)> = None;

        for line in raw.lines() {
            if let Some(heading) = line.strip_prefix("## ") {
                if let Some((title, body)) = current.take() {
                    sections.push((title, body.join("\n").trim().to_string()));
                }
                current = Some((heading.trim().to_string(), Vec::new()));
            } else if let Some((_, body)) = current.as_mut() {
                body.push(line);
            } else {
                preamble_lines.push(line);
            }
        }
        if let Some((title, body)) = current.take() {
            sections.push((title, body.join("\n").trim().to_string()));
        }

        Self { preamble: preamble_lines.join("\n").trim().to_string(), sections }
    }

    pub fn section(&self, heading: &str) -> Option<&str> {
        self.sections.iter().find(|(h, _)| h == heading).map(|(_, body)| body.as_str())
    }

    /// Reassembles the document as it would read on disk: preamble, then
    /// each section as `## Heading\n{body}`.
    pub fn full_text(&self) -> String {
        let mut parts = Vec::new();
        if !self.preamble.is_empty() {
            parts.push(self.preamble.clone());
        }
        for (heading, body) in &self.sections {
            parts.push(format!("## {heading}\n{body}"));
        }
        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_preamble_and_sections() {
        let raw = "Intro line.\n\n## Tone\nBe warm.\n\n## Boundaries\nNever give legal advice.";
        let doc = ProfileDocument::parse(raw);
        assert_eq!(doc.preamble, "Intro line.");
        assert_eq!(doc.section("Tone"), Some("Be warm."));
        assert_eq!(doc.section("Boundaries"), Some("Never give legal advice."));
    }

    #[test]
    fn document_with_no_headings_is_all_preamble() {
        let doc = ProfileDocument::parse("Just one block of prose.");
        assert_eq!(doc.preamble, "Just one block of prose.");
        assert!(doc.sections.is_empty());
    }

    #[test]
    fn full_text_round_trips_shape() {
        let raw = "Intro.\n\n## A\nbody a\n\n## B\nbody b";
        let doc = ProfileDocument::parse(raw);
        let text = doc.full_text();
        assert!(text.starts_with("Intro."));
        assert!(text.contains("## A\nbody a"));
        assert!(text.contains("## B\nbody b"));
    }
}
