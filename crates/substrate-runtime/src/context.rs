//! System prompt assembly and history shaping for model requests.

use chrono::{DateTime, Local};
use std::fmt::Write as _;
use substrate_core::{Message, Role};
use substrate_memory::{CoreBlock, ScoredEntry};

/// Used when neither `agent.system_prompt` nor `agent.system_prompt_file` is set.
pub const DEFAULT_PREAMBLE: &str = "You are a helpful, persistent assistant with long-term memory.

Your core memory blocks below are always visible to you. Keep them accurate:
record what you learn about the user and yourself with the core memory tools,
and move detail that does not need to be in every conversation to archival
memory. Search archival memory when the user refers to something you may have
stored earlier.";

/// Final assistant content when a turn runs out of tool-call cycles.
pub const DEPTH_LIMIT_NOTICE: &str = "maximum tool-call depth reached";

/// Everything the system prompt is rendered from.
pub struct PromptContext<'a> {
    pub preamble: &'a str,
    pub blocks: &'a [CoreBlock],
    /// Archival entries recalled for the latest user message.
    pub recalled: &'a [ScoredEntry],
    pub history_len: usize,
    pub archival_count: usize,
    pub max_tool_depth: u32,
    pub now: DateTime<Local>,
}

/// Render the system prompt: preamble, memory metadata, core blocks with
/// capacity, recalled archival memories, and tool rules.
pub fn render_system_prompt(ctx: &PromptContext<'_>) -> String {
    let mut out = String::with_capacity(ctx.preamble.len() + 2048);
    out.push_str(ctx.preamble.trim_end());

    out.push_str("\n\n### MEMORY METADATA\n");
    let _ = writeln!(out, "- Current date: {}", ctx.now.format("%B %d, %Y"));
    let _ = writeln!(out, "- Conversation messages: {} previous messages in history", ctx.history_len);
    let _ = writeln!(out, "- Archival memories: {} memories stored", ctx.archival_count);

    if !ctx.blocks.is_empty() {
        out.push_str("\n### CORE MEMORY\n");
        out.push_str("These blocks are loaded in every request:\n");
        for block in ctx.blocks {
            render_block(&mut out, block);
        }

        let full: Vec<&CoreBlock> = ctx
            .blocks
            .iter()
            .filter(|b| !b.read_only && b.near_capacity())
            .collect();
        if !full.is_empty() {
            out.push_str("\n### MEMORY MAINTENANCE NEEDED\n");
            out.push_str("These blocks are near capacity and need cleanup:\n");
            for b in full {
                let _ = writeln!(out, "- {}: {}/{} chars ({}% full)", b.label, b.chars(), b.limit, b.usage_pct());
            }
            out.push_str(
                "Move detail to archival_memory_insert, then condense the block with memory_rethink.\n",
            );
        }
    }

    if !ctx.recalled.is_empty() {
        out.push_str("\n### RELEVANT ARCHIVAL MEMORIES\n");
        for hit in ctx.recalled {
            let e = &hit.entry;
            let _ = writeln!(
                out,
                "- [{}, importance {}, {}] {}",
                e.category,
                e.importance,
                e.timestamp.format("%Y-%m-%d"),
                e.content
            );
        }
    }

    out.push_str("\n### TOOL USAGE RULES\n");
    let _ = writeln!(out, "- Max tool-call cycles per response: {}", ctx.max_tool_depth);
    out.push_str("- Call tools only through the structured tool-calling mechanism. Never write tool calls as text or XML tags.\n");
    out.push_str("- Memory tools update your core blocks and archival storage; search tools find past memories.\n");
    out
}

fn render_block(out: &mut String, block: &CoreBlock) {
    let marker = if block.read_only { "READ-ONLY" } else { "EDITABLE" };
    let capacity = if block.read_only {
        format!("[{} chars]", block.chars())
    } else {
        let mut c = format!("[{}/{} chars, {}%]", block.chars(), block.limit, block.usage_pct());
        if block.near_capacity() {
            c.push_str(" NEEDS CLEANUP");
        }
        c
    };
    let _ = write!(out, "\n<{} {} {}>\n", block.label, marker, capacity);
    if let Some(ref d) = block.description {
        let _ = writeln!(out, "Purpose: {d}");
    }
    out.push_str(&block.content);
    let _ = writeln!(out, "\n</{}>", block.label);
}

/// Reminder appended to the system prompt as a turn nears its depth limit.
/// `cycles` is the number of dispatch cycles completed so far.
pub fn iteration_warning(cycles: u32, max: u32) -> Option<String> {
    if max >= 2 && cycles == max - 2 {
        Some(format!(
            "ITERATION WARNING: you are on tool-call cycle {cycles}/{max}. Two cycles remain; \
             if you want to answer the user, do it soon."
        ))
    } else if max >= 1 && cycles == max - 1 {
        Some(format!(
            "FINAL WARNING: this is tool-call cycle {cycles}/{max}. After this cycle no more tool \
             calls will run. Answer the user now."
        ))
    } else {
        None
    }
}

/// The most recent `limit` committed messages, as sent to the model. The window
/// never opens on a tool result whose call fell outside it. A limit of 0 keeps
/// the whole history.
pub fn history_window(messages: &[Message], limit: usize) -> &[Message] {
    if limit == 0 || messages.len() <= limit {
        return messages;
    }
    let mut start = messages.len() - limit;
    while messages.get(start).is_some_and(|m| m.role == Role::Tool) {
        start += 1;
    }
    &messages[start..]
}

/// Shorten a tool output to `max_chars`, keeping the first 60% and last 20%
/// with an omission note between. A limit of 0 disables truncation.
pub fn truncate_tool_output(content: &str, max_chars: usize) -> String {
    let total = content.chars().count();
    if max_chars == 0 || total <= max_chars {
        return content.to_string();
    }
    let head_chars = max_chars * 6 / 10;
    let tail_chars = max_chars * 2 / 10;
    let head: String = content.chars().take(head_chars).collect();
    let tail: String = content.chars().skip(total - tail_chars).collect();
    let omitted = total - head_chars - tail_chars;
    format!("{head}\n\n[... {omitted} chars omitted ...]\n\n{tail}")
}
