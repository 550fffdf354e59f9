use std::collections::HashSet;

/// Scores how alike two versions of the same file are, from 0 (nothing shared) to 1.
pub(crate) trait SimilarityEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn version(&self) -> &'static str;

    fn similarity(&self, lhs: &str, rhs: &str) -> f64;
}

/// Jaccard overlap of token k-grams. Identifiers and literals are kept as written,
/// whitespace and comments are dropped.
pub(crate) struct ShingleEngine {
    size: usize,
}

impl ShingleEngine {
    pub(crate) fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    fn shingles<'a>(&self, tokens: &'a [&'a str]) -> HashSet<&'a [&'a str]> {
        if tokens.is_empty() {
            return HashSet::new();
        }
        if tokens.len() < self.size {
            return HashSet::from([tokens]);
        }
        tokens.windows(self.size).collect()
    }
}

impl Default for ShingleEngine {
    fn default() -> Self {
        Self::new(5)
    }
}

impl SimilarityEngine for ShingleEngine {
    fn name(&self) -> &'static str {
        "shingle"
    }

    fn version(&self) -> &'static str {
        "1"
    }

    fn similarity(&self, lhs: &str, rhs: &str) -> f64 {
        let (lhs, rhs) = (tokenize(lhs), tokenize(rhs));
        let left = self.shingles(&lhs);
        let right = self.shingles(&rhs);

        let union = left.union(&right).count();
        if union == 0 {
            return 0.0;
        }
        left.intersection(&right).count() as f64 / union as f64
    }
}

/// Split source into identifier/number runs and single punctuation characters.
/// `#` and `//` start a line comment.
fn tokenize(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    for line in text.lines() {
        let line = strip_comment(line);
        let mut start = None;
        for (index, ch) in line.char_indices() {
            let word = ch.is_alphanumeric() || ch == '_';
            match (word, start) {
                (true, None) => start = Some(index),
                (true, Some(_)) => {}
                (false, Some(begin)) => {
                    tokens.push(&line[begin..index]);
                    start = None;
                }
                (false, None) => {}
            }
            if !word && !ch.is_whitespace() {
                tokens.push(&line[index..index + ch.len_utf8()]);
            }
        }
        if let Some(begin) = start {
            tokens.push(&line[begin..]);
        }
    }
    tokens
}

fn strip_comment(line: &str) -> &str {
    let cut = [line.find('#'), line.find("//")].into_iter().flatten().min();
    match cut {
        Some(index) => &line[..index],
        None => line,
    }
}
