//! Metering cost model for pipeline stages.
//!
//! Costs are expressed in integer credits. Estimates back ledger
//! reservations before a stage runs; actuals back the commit once the
//! stage's real usage is known.

use crate::defaults;
use crate::models::Stage;

/// Per-stage pricing used for reservation estimates and commit actuals.
#[derive(Debug, Clone)]
pub struct CostModel {
    /// Credits per transcribed audio minute (rounded up).
    pub transcription_per_minute: i64,
    /// Credits per 1k LLM tokens (rounded up).
    pub extraction_per_1k_tokens: i64,
    /// Flat credits per embedding call.
    pub embedding_flat: i64,
    /// Audio minutes assumed when no duration hint is available.
    pub default_audio_minutes: i64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            transcription_per_minute: defaults::COST_TRANSCRIPTION_PER_MINUTE,
            extraction_per_1k_tokens: defaults::COST_EXTRACTION_PER_1K_TOKENS,
            embedding_flat: defaults::COST_EMBEDDING_FLAT,
            default_audio_minutes: defaults::COST_DEFAULT_AUDIO_MINUTES,
        }
    }
}

impl CostModel {
    /// Create a model from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `COST_TRANSCRIPTION_PER_MINUTE` | `10` | Credits per audio minute |
    /// | `COST_EXTRACTION_PER_1K_TOKENS` | `2` | Credits per 1k LLM tokens |
    /// | `COST_EMBEDDING_FLAT` | `1` | Flat credits per embedding call |
    pub fn from_env() -> Self {
        let read = |name: &str, default: i64| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(default)
        };
        Self {
            transcription_per_minute: read(
                "COST_TRANSCRIPTION_PER_MINUTE",
                defaults::COST_TRANSCRIPTION_PER_MINUTE,
            ),
            extraction_per_1k_tokens: read(
                "COST_EXTRACTION_PER_1K_TOKENS",
                defaults::COST_EXTRACTION_PER_1K_TOKENS,
            ),
            embedding_flat: read("COST_EMBEDDING_FLAT", defaults::COST_EMBEDDING_FLAT),
            default_audio_minutes: read(
                "COST_DEFAULT_AUDIO_MINUTES",
                defaults::COST_DEFAULT_AUDIO_MINUTES,
            ),
        }
    }

    /// Reservation estimate for a stage before it runs.
    ///
    /// `duration_hint_secs` informs transcription, `input_len` (characters
    /// of transcript text) informs extraction. Embedding is flat.
    pub fn estimate(
        &self,
        stage: Stage,
        duration_hint_secs: Option<f64>,
        input_len: usize,
    ) -> i64 {
        match stage {
            Stage::Transcription => {
                let minutes = duration_hint_secs
                    .map(|secs| (secs / 60.0).ceil() as i64)
                    .filter(|m| *m > 0)
                    .unwrap_or(self.default_audio_minutes);
                minutes * self.transcription_per_minute
            }
            Stage::Extraction => {
                let tokens = (input_len / defaults::CHARS_PER_TOKEN_ESTIMATE).max(1) as i64;
                self.extraction_actual(tokens)
            }
            Stage::Embedding => self.embedding_flat,
        }
    }

    /// Actual transcription cost from the transcript's real duration.
    /// Untimed transcripts bill a minimum of one minute.
    pub fn transcription_actual(&self, billable_minutes: i64) -> i64 {
        billable_minutes.max(1) * self.transcription_per_minute
    }

    /// Actual extraction cost from tokens consumed.
    pub fn extraction_actual(&self, tokens_used: i64) -> i64 {
        let blocks = (tokens_used.max(1) + 999) / 1000;
        blocks * self.extraction_per_1k_tokens
    }

    /// Actual embedding cost (flat).
    pub fn embedding_actual(&self) -> i64 {
        self.embedding_flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcription_estimate_uses_hint() {
        let model = CostModel::default();
        // 90s -> 2 minutes
        assert_eq!(
            model.estimate(Stage::Transcription, Some(90.0), 0),
            2 * model.transcription_per_minute
        );
    }

    #[test]
    fn test_transcription_estimate_falls_back_to_default() {
        let model = CostModel::default();
        assert_eq!(
            model.estimate(Stage::Transcription, None, 0),
            model.default_audio_minutes * model.transcription_per_minute
        );
        // A zero-length hint is not a usable hint
        assert_eq!(
            model.estimate(Stage::Transcription, Some(0.0), 0),
            model.default_audio_minutes * model.transcription_per_minute
        );
    }

    #[test]
    fn test_extraction_estimate_scales_with_input() {
        let model = CostModel::default();
        let short = model.estimate(Stage::Extraction, None, 100);
        let long = model.estimate(Stage::Extraction, None, 40_000);
        assert!(long > short);
    }

    #[test]
    fn test_extraction_actual_rounds_up_blocks() {
        let model = CostModel::default();
        assert_eq!(model.extraction_actual(1), model.extraction_per_1k_tokens);
        assert_eq!(
            model.extraction_actual(1000),
            model.extraction_per_1k_tokens
        );
        assert_eq!(
            model.extraction_actual(1001),
            2 * model.extraction_per_1k_tokens
        );
    }

    #[test]
    fn test_transcription_actual_minimum_one_minute() {
        let model = CostModel::default();
        assert_eq!(
            model.transcription_actual(0),
            model.transcription_per_minute
        );
        assert_eq!(
            model.transcription_actual(3),
            3 * model.transcription_per_minute
        );
    }

    #[test]
    fn test_embedding_is_flat() {
        let model = CostModel::default();
        assert_eq!(model.estimate(Stage::Embedding, None, 10_000), model.embedding_flat);
        assert_eq!(model.embedding_actual(), model.embedding_flat);
    }
}
