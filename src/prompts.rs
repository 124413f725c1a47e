use crate::api::models::Prompt;
use crate::error::{Error, Result};
use crate::storage::Store;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPrompt {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub is_global: bool,
}

/// Named prompts; the global one feeds every pair without an override.
#[derive(Clone)]
pub struct PromptLibrary {
    store: Store,
}

impl PromptLibrary {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn list(&self) -> Result<Vec<Prompt>> {
        self.store.list_prompts()
    }

    pub fn create(&self, input: NewPrompt) -> Result<Prompt> {
        let name = input.name.trim();
        let content = input.content.trim();
        if name.is_empty() || content.is_empty() {
            return Err(Error::Validation("prompt name and content are required".into()));
        }
        let prompt = Prompt {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            content: content.to_string(),
            category: input
                .category
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| "general".into()),
            is_global: input.is_global,
        };
        self.store.insert_prompt(&prompt)?;
        Ok(prompt)
    }

    pub fn set_global(&self, id: &str) -> Result<()> {
        self.store.set_global_prompt(id)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        if !self.store.delete_prompt(id)? {
            return Err(Error::NotFound(format!("prompt {id}")));
        }
        Ok(())
    }
}
