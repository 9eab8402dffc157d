/// Matches a dot-separated `topic` against a dot-separated `pattern` where
/// `*` matches exactly one segment and `#` matches the remainder of the
/// topic (zero or more segments), wherever it appears.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    let topic_segments: Vec<&str> = topic.split('.').collect();
    match_segments(&pattern_segments, &topic_segments)
}

fn match_segments(pattern: &[&str], topic: &[&str]) -> bool {
    match pattern.first() {
        None => topic.is_empty(),
        Some(&"#") => {
            // `#` matches zero or more remaining segments; try every split.
            if pattern.len() == 1 {
                return true;
            }
            for i in 0..=topic.len() {
                if match_segments(&pattern[1..], &topic[i..]) {
                    return true;
                }
            }
            false
        }
        Some(&"*") => {
            !topic.is_empty() && match_segments(&pattern[1..], &topic[1..])
        }
        Some(literal) => {
            topic.first() == Some(literal) && match_segments(&pattern[1..], &topic[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::topic_matches;

    #[test]
    fn literal_topic_matches_itself_only() {
        assert!(topic_matches("agent.task", "agent.task"));
        assert!(!topic_matches("agent.task", "agent.task.status"));
    }

    #[test]
    fn single_segment_wildcard() {
        assert!(topic_matches("agent.response.*", "agent.response.bot-a"));
        assert!(!topic_matches("agent.response.*", "agent.response.bot-a.extra"));
        assert!(!topic_matches("agent.response.*", "agent.response"));
    }

    #[test]
    fn multi_segment_wildcard() {
        assert!(topic_matches("subagent.#", "subagent.progress"));
        assert!(topic_matches("subagent.#", "subagent.progress.task-1"));
        assert!(topic_matches("subagent.#", "subagent"));
    }

    #[test]
    fn hash_in_middle_tries_every_split() {
        assert!(topic_matches("a.#.z", "a.z"));
        assert!(topic_matches("a.#.z", "a.b.z"));
        assert!(topic_matches("a.#.z", "a.b.c.z"));
        assert!(!topic_matches("a.#.z", "a.b.c"));
    }
}
