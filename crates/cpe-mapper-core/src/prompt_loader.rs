/*
   Manages prompt template loading with built-in fallback and user customization.
   Templates can be embedded, auto-generated on first run, or operator-supplied.
*/

use anyhow::Result;
use std::path::PathBuf;
use tracing::warn;
use crate::config::Config;

const BUILTIN_PROMPT: &str = include_str!("templates/builtin_prompt.md");

#[derive(Clone)]
pub struct PromptLoader {
    prompts_dir: PathBuf,
}

impl PromptLoader {
    pub fn new() -> Result<Self> {
        let project_dirs = Config::get_app_dirs()?;
        let data_dir = project_dirs.data_dir();
        let prompts_dir = data_dir.join("prompts");

        std::fs::create_dir_all(&prompts_dir)?;

        let default_prompt_path = prompts_dir.join("default.md");
        if !default_prompt_path.exists() {
            std::fs::write(&default_prompt_path, BUILTIN_PROMPT)?;
        }

        Ok(Self { prompts_dir })
    }

    pub fn load_prompt(&self, template_name: Option<&String>) -> Result<String> {
        match template_name {
            None => Ok(BUILTIN_PROMPT.to_string()),
            Some(name) => {
                let prompt_path = self.prompts_dir.join(format!("{}.md", name));
                match std::fs::read_to_string(&prompt_path) {
                    Ok(content) => Ok(content),
                    Err(_) => {
                        warn!("Prompt template '{}' not found, using built-in", name);
                        Ok(BUILTIN_PROMPT.to_string())
                    }
                }
            }
        }
    }

    pub fn format_prompt(
        &self,
        template: &str,
        name: &str,
        publisher: Option<&str>,
        version: Option<&str>,
    ) -> String {
        template
            .replace("{name}", name)
            .replace("{publisher}", publisher.unwrap_or("unknown"))
            .replace("{version}", version.unwrap_or("unknown"))
    }
}
