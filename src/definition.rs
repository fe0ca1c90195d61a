//! Definition generation for terms ingested without one.

use crate::node::NodeId;
use crate::openrouter::{Message, OpenRouterClient};
use crate::tree::ConceptTree;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const SYSTEM_PROMPT: &str = r#"You are an expert in technical terminology and taxonomy management.
Given a term and its context, generate a concise and accurate definition.

INSTRUCTIONS:
- Generate a definition with only one sentence
- Use formal, technical language consistent with domain standards
- Don't provide any other details or justifications than the name and definition of the term
- Along with the name of the term to define, you will also receive the name (and definition if available) of the neighboring concepts in the taxonomy tree. Use this info to understand the context of the expected definition.

EXAMPLES:
- 1. Term with parent
    Input: {"term": "replenishment at port", "context": {"parent": {"name": "replenishment at sea", "definition": ""}, "siblings": [], "children": []}}
    Output: {"term": "replenishment at port", "definition": "The process of resupplying a ship with essential items such as fuel, food, water and spare parts while it is docked or anchored in a harbor, rather than while it is moving at sea."}

- 2. Term with 2 children but without parent
    Input: {"term": "air", "context": {"parent": null, "siblings": [], "children": [{"name": "air transport", "definition": "The expedited movement of goods, cargo, or mail via aircraft as part of a secure, rapid, and integrated supply chain."}, {"name": "air-to-air refuelling", "definition": "The in-flight transfer of fuel from a specialized tanker aircraft to a receiver aircraft."}]}}
    Output: {"term": "air", "definition": "The atmosphere, extending from the Earth's surface to the altitude where its effects on operations become negligible, encompassing all manned and unmanned aircraft and related infrastructure."}
"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedDefinition {
    pub name: String,
    pub definition: String,
}

/// Immediate neighbourhood of a node, used as prompt context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeContext {
    pub term: String,
    pub parent: Option<NamedDefinition>,
    pub siblings: Vec<NamedDefinition>,
    pub children: Vec<NamedDefinition>,
}

impl NodeContext {
    pub fn of(tree: &ConceptTree, id: &NodeId) -> Option<Self> {
        let node = tree.get(id)?;
        Some(Self {
            term: node.name.clone(),
            parent: tree.parent_of(id).map(|p| p.to_named_definition()),
            siblings: tree
                .siblings_of(id)
                .into_iter()
                .map(|s| s.to_named_definition())
                .collect(),
            children: tree
                .children_of(id)
                .into_iter()
                .map(|c| c.to_named_definition())
                .collect(),
        })
    }
}

/// Writes a definition for a term from its tree context.
#[async_trait::async_trait]
pub trait DefinitionGenerator: Send + Sync {
    async fn generate(&self, context: &NodeContext) -> Result<String>;
}

/// LLM-backed generator speaking the OpenRouter chat API.
pub struct LlmDefinitionGenerator {
    client: OpenRouterClient,
}

#[derive(Debug, Deserialize)]
struct DefinitionResponse {
    #[allow(dead_code)]
    term: String,
    definition: String,
}

impl LlmDefinitionGenerator {
    pub fn new(client: OpenRouterClient) -> Self {
        Self { client }
    }

    fn user_prompt(context: &NodeContext) -> Result<String> {
        let payload = serde_json::json!({
            "term": context.term,
            "context": {
                "parent": context.parent,
                "siblings": context.siblings,
                "children": context.children,
            },
        });
        Ok(serde_json::to_string_pretty(&payload)?)
    }

    fn response_schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "term": {"type": "string"},
                "definition": {"type": "string"}
            },
            "required": ["term", "definition"],
            "additionalProperties": false
        })
    }
}

#[async_trait::async_trait]
impl DefinitionGenerator for LlmDefinitionGenerator {
    async fn generate(&self, context: &NodeContext) -> Result<String> {
        let messages = vec![
            Message::system(SYSTEM_PROMPT),
            Message::user(Self::user_prompt(context)?),
        ];
        let response: DefinitionResponse = self
            .client
            .chat_json(messages, "definition", Self::response_schema())
            .await
            .with_context(|| format!("Definition generation failed for '{}'", context.term))?;

        let definition = response.definition.trim().to_string();
        if definition.is_empty() {
            anyhow::bail!("LLM returned an empty definition for '{}'", context.term);
        }
        Ok(definition)
    }
}
