//! Media endpoints: `generate_image` and `transcribe`.

use crate::{required_str, JobError, JobHandler};
use async_trait::async_trait;
use serde_json::{json, Value};

const MAX_IMAGES: u64 = 4;

fn slug(text: &str) -> String {
	let slug: String = text
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
		.collect();
	slug.split('-')
		.filter(|part| !part.is_empty())
		.take(6)
		.collect::<Vec<_>>()
		.join("-")
}

/// Args: `prompt` (required), `count` (optional, 1..=4, default 1).
pub struct GenerateImage;

#[async_trait]
impl JobHandler for GenerateImage {
	async fn execute(&self, args: &Value) -> Result<Value, JobError> {
		let prompt = required_str(args, "prompt")?;
		let count = match args.get("count") {
			None => 1,
			Some(v) => v
				.as_u64()
				.filter(|n| (1..=MAX_IMAGES).contains(n))
				.ok_or_else(|| {
					JobError::InvalidArguments(format!(
						"'count' must be an integer between 1 and {}",
						MAX_IMAGES
					))
				})?,
		};

		let slug = slug(prompt);
		let images: Vec<Value> = (1..=count)
			.map(|i| json!({ "url": format!("mock://images/{}/{}.png", slug, i) }))
			.collect();
		tracing::debug!(count, slug = %slug, "Generated images");

		Ok(json!({ "prompt": prompt, "images": images }))
	}
}

/// Args: `audio_url` (required), `duration_seconds` (optional).
pub struct Transcribe;

#[async_trait]
impl JobHandler for Transcribe {
	async fn execute(&self, args: &Value) -> Result<Value, JobError> {
		let audio_url = required_str(args, "audio_url")?;
		let duration = args
			.get("duration_seconds")
			.and_then(Value::as_f64)
			.unwrap_or(0.0);
		tracing::debug!(duration_seconds = duration, "Transcribing audio");

		Ok(json!({
			"audio_url": audio_url,
			"transcript": format!("transcript of {}", audio_url),
			"duration_seconds": duration,
		}))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_generate_image_count() {
		let result = GenerateImage
			.execute(&json!({ "prompt": "A red Fox, at dawn", "count": 3 }))
			.await
			.unwrap();
		let images = result["images"].as_array().unwrap();
		assert_eq!(images.len(), 3);
		assert_eq!(images[0]["url"], "mock://images/a-red-fox-at-dawn/1.png");
	}

	#[tokio::test]
	async fn test_generate_image_bounds() {
		for count in [0, 5] {
			assert!(GenerateImage
				.execute(&json!({ "prompt": "x", "count": count }))
				.await
				.is_err());
		}
		assert!(GenerateImage.execute(&json!({})).await.is_err());
	}

	#[tokio::test]
	async fn test_transcribe_requires_audio_url() {
		assert!(Transcribe.execute(&json!({})).await.is_err());
		let result = Transcribe
			.execute(&json!({ "audio_url": "https://a/b.mp3", "duration_seconds": 42 }))
			.await
			.unwrap();
		assert_eq!(result["duration_seconds"], 42.0);
	}
}
