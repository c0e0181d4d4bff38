//! Paired examples and their rendering to LM text.
//!
//! A dataset is a list of (input, output) string pairs. Rendering is the
//! only place example text is turned into model-facing text, so the
//! scoring offset arithmetic has exactly one source of truth.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{DataConfig, ExegeteError, Result};

/// One paired example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Example {
    /// Input text
    pub input: String,

    /// Output text the model should assign high likelihood to
    pub output: String,
}

/// Controls how examples render to model-facing text.
///
/// `render_query` must be a strict prefix of `render_shot` for the same
/// example, with exactly the output text missing. Scoring relies on this
/// to locate the output span by character offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderTemplate {
    /// Text before each input
    pub input_prefix: String,

    /// Text before each output (keep the trailing space here, not on the
    /// output, so the scored span starts at the output's first character)
    pub output_prefix: String,

    /// Text between rendered examples
    pub example_separator: String,
}

impl Default for RenderTemplate {
    fn default() -> Self {
        Self {
            input_prefix: "Input: ".to_string(),
            output_prefix: "Output: ".to_string(),
            example_separator: "\n\n".to_string(),
        }
    }
}

impl From<&DataConfig> for RenderTemplate {
    fn from(data: &DataConfig) -> Self {
        Self {
            input_prefix: data.input_prefix.clone(),
            output_prefix: data.output_prefix.clone(),
            example_separator: data.example_separator.clone(),
        }
    }
}

impl RenderTemplate {
    /// Render one complete example, output included.
    pub fn render_shot(&self, example: &Example) -> String {
        format!(
            "{}{}\n{}{}",
            self.input_prefix, example.input, self.output_prefix, example.output
        )
    }

    /// Render an example up to the point the model must continue from.
    pub fn render_query(&self, example: &Example) -> String {
        format!(
            "{}{}\n{}",
            self.input_prefix, example.input, self.output_prefix
        )
    }

    /// Render a multi-shot demonstration block.
    pub fn render_block(&self, examples: &[Example]) -> String {
        examples
            .iter()
            .map(|e| self.render_shot(e))
            .collect::<Vec<_>>()
            .join(&self.example_separator)
    }
}

/// An owned, ordered collection of examples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    examples: Vec<Example>,
}

impl Dataset {
    /// Wrap a non-empty example list.
    pub fn new(examples: Vec<Example>) -> Result<Self> {
        if examples.is_empty() {
            return Err(ExegeteError::InvalidInput(
                "dataset contains no examples".to_string(),
            ));
        }
        Ok(Self { examples })
    }

    /// Load a dataset from a JSONL file: one object per line with `input`
    /// and `output` fields. Blank lines are skipped; unknown fields are
    /// ignored.
    pub fn from_jsonl(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ExegeteError::io(format!("reading dataset {}", path.display()), e))?;

        let mut examples = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let example: Example = serde_json::from_str(line).map_err(|e| {
                ExegeteError::Dataset(format!("{}:{}: {}", path.display(), line_num + 1, e))
            })?;
            examples.push(example);
        }

        Self::new(examples)
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Reorder examples with a seeded RNG. Same seed, same order.
    pub fn shuffled(mut self, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        self.examples.shuffle(&mut rng);
        self
    }

    /// Keep at most `max_size` examples (0 keeps all).
    pub fn truncated(mut self, max_size: usize) -> Self {
        if max_size > 0 {
            self.examples.truncate(max_size);
        }
        self
    }

    /// Split into (train, eval) by fraction. Errors if either side would
    /// be empty.
    pub fn split(self, train_frac: f64) -> Result<(Self, Self)> {
        if !(0.0 < train_frac && train_frac < 1.0) {
            return Err(ExegeteError::InvalidInput(format!(
                "train_split_frac must be in (0, 1), got {train_frac}"
            )));
        }
        let n_train = (self.examples.len() as f64 * train_frac).round() as usize;
        if n_train == 0 || n_train == self.examples.len() {
            return Err(ExegeteError::InvalidInput(format!(
                "split {} of {} examples leaves one side empty",
                train_frac,
                self.examples.len()
            )));
        }
        let mut train = self.examples;
        let eval = train.split_off(n_train);
        Ok((Self { examples: train }, Self { examples: eval }))
    }

    /// `size` examples starting at `cursor`, wrapping around the end.
    /// Returns the batch and the advanced cursor.
    pub fn batch_at(&self, cursor: usize, size: usize) -> (Vec<Example>, usize) {
        let n = self.examples.len();
        let batch = (0..size)
            .map(|i| self.examples[(cursor + i) % n].clone())
            .collect();
        (batch, (cursor + size) % n)
    }
}

/// Recognizer for a known ground-truth description of the dataset.
///
/// When the underlying pattern is known (synthetic tasks), a regex over
/// candidate prompts marks recovered descriptions and can stop the search
/// early. Matching is case-insensitive.
#[derive(Debug, Clone)]
pub struct PromptCheck {
    pattern: String,
    re: regex::Regex,
}

impl PromptCheck {
    pub fn new(pattern: &str) -> Result<Self> {
        let re = regex::RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ExegeteError::ParseError(format!("bad check pattern: {e}")))?;
        Ok(Self {
            pattern: pattern.to_string(),
            re,
        })
    }

    pub fn matches(&self, prompt: &str) -> bool {
        self.re.is_match(prompt)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ex(input: &str, output: &str) -> Example {
        Example {
            input: input.to_string(),
            output: output.to_string(),
        }
    }

    #[test]
    fn query_is_strict_prefix_of_shot() {
        let template = RenderTemplate::default();
        let example = ex("2 5", "7");
        let shot = template.render_shot(&example);
        let query = template.render_query(&example);

        assert!(shot.starts_with(&query));
        assert_eq!(&shot[query.len()..], "7");
    }

    #[test]
    fn block_joins_with_separator() {
        let template = RenderTemplate::default();
        let block = template.render_block(&[ex("1 2", "3"), ex("4 5", "9")]);
        assert_eq!(block, "Input: 1 2\nOutput: 3\n\nInput: 4 5\nOutput: 9");
    }

    #[test]
    fn jsonl_loading_skips_blanks_and_reports_line_numbers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"input": "1 1", "output": "2"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"input": "2 3", "output": "5", "extra": true}}"#).unwrap();
        file.flush().unwrap();

        let dataset = Dataset::from_jsonl(file.path()).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.examples()[1].output, "5");
    }

    #[test]
    fn jsonl_error_names_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"input": "1 1", "output": "2"}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        file.flush().unwrap();

        let err = Dataset::from_jsonl(file.path()).unwrap_err();
        assert!(err.to_string().contains(":2:"), "got: {err}");
    }

    #[test]
    fn empty_dataset_rejected() {
        assert!(matches!(
            Dataset::new(vec![]),
            Err(ExegeteError::InvalidInput(_))
        ));
    }

    #[test]
    fn shuffle_is_seeded() {
        let examples: Vec<Example> = (0..20).map(|i| ex(&i.to_string(), "x")).collect();
        let a = Dataset::new(examples.clone()).unwrap().shuffled(7);
        let b = Dataset::new(examples).unwrap().shuffled(7);
        assert_eq!(a.examples(), b.examples());
    }

    #[test]
    fn split_sizes_and_empty_sides() {
        let examples: Vec<Example> = (0..10).map(|i| ex(&i.to_string(), "x")).collect();
        let (train, eval) = Dataset::new(examples.clone())
            .unwrap()
            .split(0.8)
            .unwrap();
        assert_eq!(train.len(), 8);
        assert_eq!(eval.len(), 2);

        let tiny = Dataset::new(vec![ex("a", "b")]).unwrap();
        assert!(tiny.split(0.5).is_err());
    }

    #[test]
    fn batch_cycles_past_the_end() {
        let examples: Vec<Example> = (0..3).map(|i| ex(&i.to_string(), "x")).collect();
        let dataset = Dataset::new(examples).unwrap();
        let (batch, cursor) = dataset.batch_at(2, 2);
        assert_eq!(batch[0].input, "2");
        assert_eq!(batch[1].input, "0");
        assert_eq!(cursor, 1);
    }

    #[test]
    fn prompt_check_is_case_insensitive() {
        let check = PromptCheck::new(r"add|sum").unwrap();
        assert!(check.matches("Return the SUM of the two numbers"));
        assert!(!check.matches("Return the first word"));
    }
}
