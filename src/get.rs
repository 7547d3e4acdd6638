//! Document management commands: `snap docs`, `snap get`, `snap delete`.

use anyhow::{bail, Result};

use snapmind_core::store::Store;

use crate::config::Config;
use crate::db;

pub async fn run_docs(config: &Config) -> Result<()> {
    let store = db::open_store(config).await?;
    let docs = store.list_documents().await?;
    store.close().await;

    if docs.is_empty() {
        println!("No documents.");
        return Ok(());
    }

    for doc in docs {
        println!(
            "{}  {:<8}  {:>4} passages  {}",
            doc.id,
            doc.status.as_str(),
            doc.passage_count,
            doc.source_url.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let store = db::open_store(config).await?;
    let Some(doc) = store.get_document(id).await? else {
        store.close().await;
        bail!("document not found: {}", id);
    };
    let passages = store.list_passages(id).await?;
    store.close().await;

    println!("--- Document ---");
    println!("id:           {}", doc.id);
    println!("source_url:   {}", doc.source_url.as_deref().unwrap_or("-"));
    println!("status:       {}", doc.status);
    println!("ingested_at:  {}", doc.ingested_at.to_rfc3339());
    println!("content_hash: {}", doc.content_hash);
    println!();

    println!("--- Passages ({}) ---", passages.len());
    for passage in &passages {
        match passage.heading() {
            Some(heading) => println!("[{}] ({})", passage.block_id(), heading),
            None => println!("[{}]", passage.block_id()),
        }
        println!("{}", passage.text());
        println!();
    }
    Ok(())
}

pub async fn run_delete(config: &Config, id: &str) -> Result<()> {
    let store = db::open_store(config).await?;
    let deleted = store.delete_document(id).await?;
    store.close().await;

    if !deleted {
        bail!("document not found: {}", id);
    }
    println!("deleted {}", id);
    Ok(())
}
