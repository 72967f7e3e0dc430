use crate::config::PromptsConfig;

/// Step function from film frame index to prompt text.
///
/// Entries are `(threshold, prompt)` kept in ascending threshold order. The
/// prompt for index `i` belongs to the smallest threshold `>= i`, so each
/// threshold marks the *last* frame of its scene. The last threshold has to
/// exceed the film length, which [`PromptSchedule::validate`] checks at startup.
#[derive(Debug, Clone)]
pub struct PromptSchedule {
    entries: Vec<(u32, String)>,
    suffix: String,
}

impl PromptSchedule {
    pub fn new<I, S>(entries: I) -> Result<Self, PromptError>
    where
        I: IntoIterator<Item = (u32, S)>,
        S: Into<String>,
    {
        let mut entries: Vec<(u32, String)> = entries
            .into_iter()
            .map(|(threshold, prompt)| (threshold, prompt.into()))
            .collect();
        if entries.is_empty() {
            return Err(PromptError::Empty);
        }
        // Stable: among equal thresholds the first listed wins.
        entries.sort_by_key(|(threshold, _)| *threshold);
        Ok(Self {
            entries,
            suffix: String::new(),
        })
    }

    pub fn from_config(config: &PromptsConfig) -> Result<Self, PromptError> {
        let schedule = Self::new(
            config
                .schedule
                .iter()
                .map(|entry| (entry.threshold, entry.prompt.clone())),
        )?;
        Ok(schedule.with_suffix(config.suffix.clone()))
    }

    /// Style phrase appended to every prompt by [`PromptSchedule::styled_prompt_for`].
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn prompt_for(&self, index: u32) -> Result<&str, PromptError> {
        self.entries
            .iter()
            .find(|(threshold, _)| *threshold >= index)
            .map(|(_, prompt)| prompt.as_str())
            .ok_or(PromptError::NoPromptForIndex {
                index,
                last_threshold: self.last_threshold(),
            })
    }

    pub fn styled_prompt_for(&self, index: u32) -> Result<String, PromptError> {
        let prompt = self.prompt_for(index)?;
        if self.suffix.is_empty() {
            Ok(prompt.to_string())
        } else {
            Ok(format!("{prompt}, {}", self.suffix))
        }
    }

    /// The last threshold must exceed `max_index`, the largest frame index
    /// the film can show.
    pub fn validate(&self, max_index: u32) -> Result<(), PromptError> {
        let last_threshold = self.last_threshold();
        if last_threshold > max_index {
            Ok(())
        } else {
            Err(PromptError::DoesNotCoverFilm {
                max_index,
                last_threshold,
            })
        }
    }

    pub fn last_threshold(&self) -> u32 {
        self.entries.last().map(|(threshold, _)| *threshold).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("no prompt for frame {index}: last threshold is {last_threshold}")]
    NoPromptForIndex { index: u32, last_threshold: u32 },
    #[error("last prompt threshold {last_threshold} must exceed the last film frame {max_index}")]
    DoesNotCoverFilm { max_index: u32, last_threshold: u32 },
    #[error("prompt schedule is empty")]
    Empty,
}
