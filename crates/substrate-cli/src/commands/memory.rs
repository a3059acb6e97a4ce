use substrate_config::SubstrateConfig;
use substrate_memory::{MemoryCategory, SearchQuery};
use substrate_runtime::Agent;

use super::{MemoryAction, truncate_output};

pub(super) async fn cmd_memory(
    config: SubstrateConfig,
    action: MemoryAction,
) -> substrate_core::Result<()> {
    let agent = Agent::from_config(config).await?;

    match action {
        MemoryAction::Blocks { json } => {
            let blocks = agent.core_memory().list();
            if json {
                let out: Vec<serde_json::Value> = blocks
                    .iter()
                    .map(|b| {
                        serde_json::json!({
                            "label": b.label,
                            "content": b.content,
                            "description": b.description,
                            "read_only": b.read_only,
                            "chars": b.chars(),
                            "limit": b.limit,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }
            if blocks.is_empty() {
                println!("No core memory blocks.");
            }
            for b in &blocks {
                let marker = if b.read_only { " (read-only)" } else { "" };
                println!(
                    "\x1b[1m{}\x1b[0m{marker}  {}/{} chars, {}%",
                    b.label,
                    b.chars(),
                    b.limit,
                    b.usage_pct()
                );
                if let Some(ref d) = b.description {
                    println!("   \x1b[90m{d}\x1b[0m");
                }
                for line in b.content.lines() {
                    println!("   {line}");
                }
                println!();
            }
        }
        MemoryAction::Search {
            query,
            limit,
            category,
            min_importance,
            tag,
            json,
        } => {
            if !agent.embedder_ready() {
                eprintln!("⚠️  embedding backend unavailable, search results will be empty");
            }
            let mut q = SearchQuery::new(query, limit);
            if let Some(c) = category {
                q = q.category(c.parse::<MemoryCategory>()?);
            }
            if let Some(min) = min_importance {
                q = q.min_importance(min);
            }
            q.tags = tag.into_iter().collect();

            let hits = agent.archival_memory().search(&q).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
                return Ok(());
            }
            if hits.is_empty() {
                println!("No matching memories.");
            }
            for hit in &hits {
                let e = &hit.entry;
                println!(
                    "\x1b[90m{:.3}\x1b[0m  [{}, {}] {}  \x1b[90m{}\x1b[0m",
                    hit.similarity,
                    e.category,
                    e.importance,
                    truncate_output(&e.content, 100),
                    e.timestamp.format("%Y-%m-%d")
                );
            }
        }
        MemoryAction::Stats { json } => {
            let stats = agent.archival_memory().stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
                return Ok(());
            }
            println!("Archival memories: {}", stats.total);
            println!("Excluded:          {}", stats.excluded);
            println!("Avg importance:    {:.2}", stats.average_importance);
            for (category, count) in &stats.by_category {
                println!("   {category:<18} {count}");
            }
        }
    }
    Ok(())
}
