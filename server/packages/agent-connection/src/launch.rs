use std::collections::HashMap;
use std::path::PathBuf;

use crate::ConnectOptions;

pub const DEFAULT_PROGRAM: &str = "claude";
pub const DEFAULT_PERMISSION_MODE: &str = "bypassPermissions";
pub const FILE_CHECKPOINTING_ENV: &str = "CLAUDE_CODE_ENABLE_SDK_FILE_CHECKPOINTING";

/// How to start the agent CLI for a connection.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub permission_mode: String,
    pub setting_sources: Vec<String>,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            permission_mode: DEFAULT_PERMISSION_MODE.to_string(),
            setting_sources: vec![
                "user".to_string(),
                "project".to_string(),
                "local".to_string(),
            ],
        }
    }
}

impl LaunchSpec {
    /// Full argument list for one connection. User messages are replayed so
    /// every turn carries the checkpoint uuid of its prompt.
    pub fn command_args(&self, options: &ConnectOptions) -> Vec<String> {
        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--replay-user-messages".to_string(),
            "--permission-mode".to_string(),
            self.permission_mode.clone(),
        ];
        if !self.setting_sources.is_empty() {
            args.push("--setting-sources".to_string());
            args.push(self.setting_sources.join(","));
        }
        if let Some(session_id) = &options.resume {
            args.push("--resume".to_string());
            args.push(session_id.clone());
        }
        if let Some(checkpoint) = &options.resume_session_at {
            args.push("--resume-session-at".to_string());
            args.push(checkpoint.clone());
        }
        args.extend(self.args.iter().cloned());
        args
    }

    pub fn command_env(&self) -> HashMap<String, String> {
        let mut env = self.env.clone();
        env.entry(FILE_CHECKPOINTING_ENV.to_string())
            .or_insert_with(|| "1".to_string());
        env
    }
}
