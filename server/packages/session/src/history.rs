use rewind_agent_error::SessionError;
use serde::Serialize;

pub const PREVIEW_CHARS: usize = 50;

/// One completed prompt/response pair and the checkpoints bracketing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    /// Checkpoint recorded when the prompt was sent; restoring it undoes the
    /// turn's file edits.
    pub user_checkpoint_id: String,
    /// Last assistant message of the turn; resuming here continues after it.
    pub assistant_checkpoint_id: String,
    pub prompt_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RewindTarget {
    /// 1-based position in the rewind menu.
    pub number: usize,
    pub user_checkpoint_id: String,
    pub assistant_checkpoint_id: String,
    pub preview: String,
}

/// Where to put files and agent context back to for a rewind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewindPlan {
    pub file_checkpoint: String,
    pub resume_assistant_checkpoint: String,
    pub target: Turn,
}

#[derive(Debug, Clone, Default)]
pub struct History {
    turns: Vec<Turn>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        user_checkpoint_id: impl Into<String>,
        assistant_checkpoint_id: impl Into<String>,
        prompt_text: impl Into<String>,
    ) {
        self.turns.push(Turn {
            user_checkpoint_id: user_checkpoint_id.into(),
            assistant_checkpoint_id: assistant_checkpoint_id.into(),
            prompt_text: prompt_text.into(),
        });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Every turn but the first: the first turn has no earlier response to
    /// resume from.
    pub fn rewind_targets(&self) -> Vec<RewindTarget> {
        self.turns
            .iter()
            .skip(1)
            .enumerate()
            .map(|(index, turn)| RewindTarget {
                number: index + 1,
                user_checkpoint_id: turn.user_checkpoint_id.clone(),
                assistant_checkpoint_id: turn.assistant_checkpoint_id.clone(),
                preview: preview(&turn.prompt_text, PREVIEW_CHARS),
            })
            .collect()
    }

    /// Truncates history to end at the target turn and returns the
    /// checkpoints for "before this turn's prompt": files go back to the
    /// target's user checkpoint, context resumes after the previous turn.
    pub fn resolve_rewind(
        &mut self,
        target_assistant_id: &str,
    ) -> Result<RewindPlan, SessionError> {
        let index = self
            .turns
            .iter()
            .position(|turn| turn.assistant_checkpoint_id == target_assistant_id)
            .filter(|index| *index > 0)
            .ok_or_else(|| SessionError::RewindTargetNotFound {
                checkpoint_id: target_assistant_id.to_string(),
            })?;

        self.turns.truncate(index + 1);
        let target = self.turns[index].clone();
        let previous = &self.turns[index - 1];
        tracing::debug!(
            index,
            file_checkpoint = %target.user_checkpoint_id,
            resume_at = %previous.assistant_checkpoint_id,
            "history: rewind resolved"
        );
        Ok(RewindPlan {
            file_checkpoint: target.user_checkpoint_id.clone(),
            resume_assistant_checkpoint: previous.assistant_checkpoint_id.clone(),
            target,
        })
    }
}

/// First `max_chars` characters, with `...` appended when text was cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
