//! Text endpoints: `summarize` and `translate`.

use crate::{required_str, JobError, JobHandler};
use async_trait::async_trait;
use serde_json::{json, Value};

const DEFAULT_MAX_SENTENCES: usize = 2;

/// Keeps the leading sentences of `text`.
///
/// Args: `text` (required), `max_sentences` (optional, default 2).
pub struct Summarize;

#[async_trait]
impl JobHandler for Summarize {
	async fn execute(&self, args: &Value) -> Result<Value, JobError> {
		let text = required_str(args, "text")?;
		let max_sentences = match args.get("max_sentences") {
			None => DEFAULT_MAX_SENTENCES,
			Some(v) => v
				.as_u64()
				.filter(|n| *n > 0)
				.ok_or_else(|| {
					JobError::InvalidArguments("'max_sentences' must be a positive integer".into())
				})? as usize,
		};

		let mut summary = String::new();
		let mut taken = 0;
		for sentence in text.split_inclusive(['.', '!', '?']) {
			if taken == max_sentences {
				break;
			}
			summary.push_str(sentence);
			taken += 1;
		}
		let summary = summary.trim().to_string();
		tracing::debug!(sentences = taken, chars = summary.len(), "Summarized text");

		Ok(json!({
			"summary": summary,
			"original_length": text.chars().count(),
			"summary_length": summary.chars().count(),
		}))
	}
}

/// Tags the text with the target language.
///
/// Args: `text` (required), `target_language` (required), `source_language` (optional).
pub struct Translate;

#[async_trait]
impl JobHandler for Translate {
	async fn execute(&self, args: &Value) -> Result<Value, JobError> {
		let text = required_str(args, "text")?;
		let target = required_str(args, "target_language")?;
		let source = args
			.get("source_language")
			.and_then(Value::as_str)
			.unwrap_or("auto");
		tracing::debug!(source = %source, target = %target, "Translating text");

		Ok(json!({
			"translated_text": format!("[{}] {}", target, text),
			"source_language": source,
			"target_language": target,
			"characters": text.chars().count(),
		}))
	}
}
