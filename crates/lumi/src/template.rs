//! Prompt templates.

use std::fmt;
use std::str::FromStr;

/// How a user prompt is wrapped before tokenization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptTemplate {
    /// `<|im_start|>` / `<|im_end|>` chat markup.
    #[default]
    ChatMl,
    /// `Human:` / `Assistant:` turns.
    Chat,
    /// `### Instruction:` / `### Response:` sections.
    Instruct,
    /// Prompt passed through unchanged.
    Raw,
}

impl PromptTemplate {
    /// Every template, in display order.
    pub const ALL: [PromptTemplate; 4] = [Self::ChatMl, Self::Chat, Self::Instruct, Self::Raw];

    /// Wrap `prompt`.
    pub fn format(&self, prompt: &str) -> String {
        match self {
            Self::ChatMl => format!("<|im_start|>user\n{prompt}\n<|im_end|>\n<|im_start|>assistant\n"),
            Self::Chat => format!("Human: {prompt}\n\nAssistant: "),
            Self::Instruct => format!("### Instruction:\n{prompt}\n\n### Response:\n"),
            Self::Raw => prompt.to_string(),
        }
    }

    /// Lowercase name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ChatMl => "chatml",
            Self::Chat => "chat",
            Self::Instruct => "instruct",
            Self::Raw => "raw",
        }
    }
}

impl fmt::Display for PromptTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PromptTemplate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unknown prompt template '{s}' (expected chatml, chat, instruct or raw)"))
    }
}
