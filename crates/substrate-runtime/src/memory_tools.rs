//! Memory operations exposed to the model as tools.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use substrate_core::{
    Event, EventBus, Result, SideEffectClass, SubstrateError, ToolContext, ToolHandler, ToolSpec,
};
use substrate_memory::{
    ArchivalMemory, BlockEdit, CoreBlock, CoreMemory, MemoryCategory, NewEntry, SearchQuery,
};
use tracing::info;

use crate::registry::ToolRegistry;

/// Default and maximum result counts for `archival_memory_search`.
pub const DEFAULT_SEARCH_LIMIT: usize = 5;
pub const MAX_SEARCH_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryOp {
    Append,
    Replace,
    Rethink,
    Get,
    List,
    ArchivalInsert,
    ArchivalSearch,
}

/// Shared handle to both memory tiers plus the bus edits are announced on.
#[derive(Clone)]
pub struct MemoryHandles {
    pub core: Arc<CoreMemory>,
    pub archival: Arc<ArchivalMemory>,
    pub events: EventBus,
}

struct MemoryTool {
    op: MemoryOp,
    memory: MemoryHandles,
}

fn category_names() -> Vec<&'static str> {
    MemoryCategory::ALL.iter().map(|c| c.as_str()).collect()
}

/// Specs for the seven built-in memory tools.
pub fn memory_tool_specs() -> Vec<ToolSpec> {
    memory_tools().into_iter().map(|(spec, _)| spec).collect()
}

fn memory_tools() -> Vec<(ToolSpec, MemoryOp)> {
    vec![
        (
            ToolSpec::new(
                "core_memory_append",
                "Append text to the end of a core memory block. Core memory is always visible to you; use it for what you must remember in every conversation.",
                json!({
                    "type": "object",
                    "properties": {
                        "label": {"type": "string", "description": "Block label, e.g. 'human' or 'persona'"},
                        "content": {"type": "string", "description": "Text to append. Include any separator (newline, space) yourself."}
                    },
                    "required": ["label", "content"]
                }),
                SideEffectClass::MutatesMemory,
            ),
            MemoryOp::Append,
        ),
        (
            ToolSpec::new(
                "core_memory_replace",
                "Replace every occurrence of old_content in a core memory block with new_content. Fails if old_content is not found; the block is then unchanged.",
                json!({
                    "type": "object",
                    "properties": {
                        "label": {"type": "string", "description": "Block label"},
                        "old_content": {"type": "string", "description": "Exact text to find"},
                        "new_content": {"type": "string", "description": "Replacement text (may be empty to delete)"}
                    },
                    "required": ["label", "old_content", "new_content"]
                }),
                SideEffectClass::MutatesMemory,
            ),
            MemoryOp::Replace,
        ),
        (
            ToolSpec::new(
                "memory_rethink",
                "Rewrite a core memory block entirely. Use to condense or reorganise a block that is getting full.",
                json!({
                    "type": "object",
                    "properties": {
                        "label": {"type": "string", "description": "Block label"},
                        "new_memory": {"type": "string", "description": "The complete new content of the block"}
                    },
                    "required": ["label", "new_memory"]
                }),
                SideEffectClass::MutatesMemory,
            ),
            MemoryOp::Rethink,
        ),
        (
            ToolSpec::new(
                "core_memory_get",
                "Read one core memory block with its capacity.",
                json!({
                    "type": "object",
                    "properties": {
                        "label": {"type": "string", "description": "Block label"}
                    },
                    "required": ["label"]
                }),
                SideEffectClass::Pure,
            ),
            MemoryOp::Get,
        ),
        (
            ToolSpec::new(
                "core_memory_list",
                "List all core memory blocks with their capacity and read-only status.",
                json!({"type": "object", "properties": {}}),
                SideEffectClass::Pure,
            ),
            MemoryOp::List,
        ),
        (
            ToolSpec::new(
                "archival_memory_insert",
                "Store a memory in long-term archival storage. Archival memory is unlimited but only visible through search.",
                json!({
                    "type": "object",
                    "properties": {
                        "content": {"type": "string", "description": "What to remember, self-contained"},
                        "category": {"type": "string", "enum": category_names(), "description": "Kind of memory (default: fact)"},
                        "importance": {"type": "integer", "description": "1 (trivia) to 10 (core to identity), default 5"},
                        "tags": {"type": "array", "items": {"type": "string"}, "description": "Optional tags"}
                    },
                    "required": ["content"]
                }),
                SideEffectClass::MutatesMemory,
            ),
            MemoryOp::ArchivalInsert,
        ),
        (
            ToolSpec::new(
                "archival_memory_search",
                "Semantic search over archival memory. Results are ordered by similarity, then importance, then recency.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "What to look for"},
                        "limit": {"type": "integer", "description": "Maximum results (default 5, max 50)"},
                        "category": {"type": "string", "enum": category_names()},
                        "min_importance": {"type": "integer", "description": "Only entries at or above this importance"},
                        "tags": {"type": "array", "items": {"type": "string"}, "description": "Only entries carrying any of these tags"}
                    },
                    "required": ["query"]
                }),
                SideEffectClass::ExternalIo,
            ),
            MemoryOp::ArchivalSearch,
        ),
    ]
}

/// Register every memory tool on `registry`.
pub fn register_memory_tools(registry: &ToolRegistry, memory: MemoryHandles) -> Result<()> {
    for (spec, op) in memory_tools() {
        registry.register(
            spec,
            Arc::new(MemoryTool {
                op,
                memory: memory.clone(),
            }),
        )?;
    }
    Ok(())
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| SubstrateError::InvalidArguments {
            tool: "memory".into(),
            reason: format!("missing string field '{key}'"),
        })
}

fn tags_arg(args: &Value) -> Vec<String> {
    args.get("tags")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default()
}

fn u8_arg(args: &Value, key: &str, tool: &str) -> Result<Option<u8>> {
    match args.get(key).and_then(Value::as_i64) {
        None => Ok(None),
        Some(n) => u8::try_from(n)
            .map(Some)
            .map_err(|_| SubstrateError::InvalidArguments {
                tool: tool.into(),
                reason: format!("'{key}' out of range: {n}"),
            }),
    }
}

fn block_json(block: &CoreBlock) -> Value {
    json!({
        "label": block.label,
        "content": block.content,
        "description": block.description,
        "read_only": block.read_only,
        "chars": block.chars(),
        "limit": block.limit,
        "usage_pct": block.usage_pct(),
    })
}

impl MemoryTool {
    fn edit(&self, label: &str, edit: BlockEdit<'_>) -> Result<Value> {
        // The model never overrides the read-only flag.
        let block = self.memory.core.edit(label, edit, false)?;
        self.memory.events.publish(Event::MemoryBlockUpdated {
            label: block.label.clone(),
            operation: edit.name().to_string(),
        });
        let mut out = block_json(&block);
        if block.near_capacity() {
            out["warning"] = json!(format!(
                "block is {}% full; consider memory_rethink or moving detail to archival memory",
                block.usage_pct()
            ));
        }
        Ok(out)
    }

    async fn archival_insert(&self, args: &Value) -> Result<Value> {
        let category = match args.get("category").and_then(Value::as_str) {
            Some(c) => c.parse::<MemoryCategory>()?,
            None => MemoryCategory::Fact,
        };
        let importance = u8_arg(args, "importance", "archival_memory_insert")?.unwrap_or(5);
        let entry = self
            .memory
            .archival
            .insert(
                NewEntry::new(str_arg(args, "content")?, category, importance)
                    .with_tags(tags_arg(args)),
            )
            .await?;
        self.memory.events.publish(Event::ArchivalInserted {
            entry_id: entry.id,
            category: entry.category.to_string(),
        });
        Ok(json!({
            "id": entry.id,
            "category": entry.category,
            "importance": entry.importance,
            "stored": true,
        }))
    }

    async fn archival_search(&self, args: &Value) -> Result<Value> {
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .min(MAX_SEARCH_LIMIT);
        let mut query = SearchQuery::new(str_arg(args, "query")?, limit);
        if let Some(c) = args.get("category").and_then(Value::as_str) {
            query = query.category(c.parse()?);
        }
        if let Some(min) = u8_arg(args, "min_importance", "archival_memory_search")? {
            query = query.min_importance(min);
        }
        query.tags = tags_arg(args).into_iter().collect();

        let hits = self.memory.archival.search(&query).await;
        info!(query = %query.query, hits = hits.len(), "archival_memory_search");
        Ok(serde_json::to_value(&hits)?)
    }
}

#[async_trait]
impl ToolHandler for MemoryTool {
    async fn call(&self, _ctx: &ToolContext, args: Value) -> Result<Value> {
        match self.op {
            MemoryOp::Append => self.edit(
                str_arg(&args, "label")?,
                BlockEdit::Append(str_arg(&args, "content")?),
            ),
            MemoryOp::Replace => self.edit(
                str_arg(&args, "label")?,
                BlockEdit::Replace {
                    old: str_arg(&args, "old_content")?,
                    new: str_arg(&args, "new_content")?,
                },
            ),
            MemoryOp::Rethink => self.edit(
                str_arg(&args, "label")?,
                BlockEdit::Rethink(str_arg(&args, "new_memory")?),
            ),
            MemoryOp::Get => Ok(block_json(&self.memory.core.get(str_arg(&args, "label")?)?)),
            MemoryOp::List => Ok(Value::Array(
                self.memory.core.list().iter().map(block_json).collect(),
            )),
            MemoryOp::ArchivalInsert => self.archival_insert(&args).await,
            MemoryOp::ArchivalSearch => self.archival_search(&args).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_specs_are_complete_and_classified() {
        let specs = memory_tool_specs();
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "core_memory_append",
                "core_memory_replace",
                "memory_rethink",
                "core_memory_get",
                "core_memory_list",
                "archival_memory_insert",
                "archival_memory_search",
            ]
        );
        let class = |n: &str| specs.iter().find(|s| s.name == n).map(|s| s.side_effect);
        assert_eq!(class("core_memory_append"), Some(SideEffectClass::MutatesMemory));
        assert_eq!(class("core_memory_get"), Some(SideEffectClass::Pure));
        assert_eq!(class("archival_memory_search"), Some(SideEffectClass::ExternalIo));
    }

    #[test]
    fn test_u8_arg_range() {
        let args = json!({"importance": 300, "ok": 7});
        assert!(u8_arg(&args, "importance", "t").is_err());
        assert_eq!(u8_arg(&args, "ok", "t").unwrap(), Some(7));
        assert_eq!(u8_arg(&args, "missing", "t").unwrap(), None);
    }
}
