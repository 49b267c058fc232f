use std::{collections::HashSet, path::Path, sync::Arc};

use bookbert::{
    ChunkDb, ChunkStore, ColbertEmbedder, ConfigDb, DataDir, Document, EmbeddingQueue,
    HashEmbedder, IndexOutcome, IndexProgress, LazyEmbedder, RetrievalConfig, Retriever,
    SearchOptions,
    chunking::chunk_markup,
    config::{self, KEYS},
    config_db::DocumentRecord,
    embedding::SharedProvider,
    error::{self, Error},
    model_manager::{MODEL_SETTING, resolve_model},
    scheduler::select_scheduler,
    search,
    tokenizer::estimate_token_count,
};
use clap::Parser;
use kdam::{BarExt, tqdm};
use tokio::{sync::watch, task::JoinHandle};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{
    ChunkArgs, Cli, Command, ConfigAction, EmbedderKind, GetArgs, IndexArgs, ModelAction,
    SearchArgs,
};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("BOOKBERT_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> error::Result<()> {
    let cli = Cli::parse();
    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }
    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_db = ConfigDb::open(&data_dir.config_db())?;

    match &cli.command {
        Command::Index(args) => cmd_index(&cli, &data_dir, &config_db, args, false).await,
        Command::Reindex(args) => cmd_index(&cli, &data_dir, &config_db, args, true).await,
        Command::Search(args) => cmd_search(&cli, &data_dir, &config_db, args).await,
        Command::Get(args) => cmd_get(&cli, &data_dir, &config_db, args).await,
        Command::Chunk(args) => cmd_chunk(&config_db, args),
        Command::Status(args) => cmd_status(&cli, &data_dir, &config_db, args.json),
        Command::Remove { document } => {
            cmd_remove(&cli, &data_dir, &config_db, document).await
        }
        Command::Model { action } => cmd_model(&config_db, cli.model.as_deref(), action),
        Command::Config { action } => cmd_config(&config_db, action),
        Command::Completions(_) => Ok(()),
    }
}

fn build_embedder(
    kind: EmbedderKind,
    explicit_model: Option<&str>,
    config_db: &ConfigDb,
) -> error::Result<LazyEmbedder> {
    Ok(match kind {
        EmbedderKind::None => LazyEmbedder::unavailable(),
        EmbedderKind::Hash => LazyEmbedder::ready(Arc::new(HashEmbedder::default())),
        EmbedderKind::Colbert => {
            let stored = config_db.get_setting(MODEL_SETTING)?;
            let (model_id, source) = resolve_model(explicit_model, stored.as_deref());
            debug!(model = %model_id, %source, "embedding model resolved");
            LazyEmbedder::new(move || {
                Ok(Arc::new(ColbertEmbedder::load(model_id)?) as SharedProvider)
            })
        }
    })
}

/// The CLI drains backfill explicitly, so `auto_backfill` is always off.
fn open_retriever(
    cli: &Cli,
    data_dir: &DataDir,
    config_db: &ConfigDb,
    prefer_worker: bool,
    mut config: RetrievalConfig,
) -> error::Result<Retriever> {
    config.auto_backfill = false;
    let store: Arc<dyn ChunkStore> = Arc::new(ChunkDb::open(&data_dir.chunks_db())?);
    let scheduler = select_scheduler(prefer_worker, config.inline_yield_every);
    let embedder = build_embedder(cli.embedder, cli.model.as_deref(), config_db)?;

    Ok(Retriever::new(
        store,
        scheduler,
        Arc::new(embedder),
        Arc::new(EmbeddingQueue::new()),
        config,
    ))
}

fn load_document(
    path: &Path,
    id: Option<&str>,
    title: Option<&str>,
) -> error::Result<Document> {
    let content = std::fs::read_to_string(path)?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let mut document = if is_json {
        serde_json::from_str::<Document>(&content)?
    } else {
        Document::from_markup(&stem, &stem, content)
    };
    if let Some(id) = id {
        document.id = id.to_string();
    }
    if let Some(title) = title {
        document.title = title.to_string();
    }
    if document.id.trim().is_empty() {
        return Err(Error::Config(format!(
            "document in {} has no id",
            path.display()
        )));
    }
    Ok(document)
}

/// Mirror indexing and backfill progress on a terminal progress bar.
fn spawn_progress(mut rx: watch::Receiver<Option<IndexProgress>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut bar = tqdm!(total = 100, unit = "%");
        let mut stage = None;
        while rx.changed().await.is_ok() {
            let Some(progress) = rx.borrow_and_update().clone() else {
                continue;
            };
            if stage != Some(progress.state) {
                stage = Some(progress.state);
                bar.set_description(progress.state.to_string());
            }
            let _ = bar.update_to(usize::from(progress.percent));
        }
    })
}

async fn cmd_index(
    cli: &Cli,
    data_dir: &DataDir,
    config_db: &ConfigDb,
    args: &IndexArgs,
    reindex: bool,
) -> error::Result<()> {
    let document =
        load_document(&args.path, args.id.as_deref(), args.title.as_deref())?;

    let mut config = RetrievalConfig::load(config_db)?;
    if args.no_embeddings {
        config.generate_embeddings = false;
    }
    let options = args.chunking.apply(config.chunking);
    let retriever = open_retriever(cli, data_dir, config_db, !args.inline, config)?;

    let progress = (!cli.quiet).then(|| spawn_progress(retriever.progress()));

    let report = if reindex {
        retriever.reindex_document(&document, Some(options)).await
    } else {
        retriever.index_document(&document, Some(options)).await
    };
    let report = match report {
        Ok(report) => report,
        Err(error) => {
            if let Some(handle) = progress {
                handle.abort();
            }
            return Err(error);
        }
    };

    if let IndexOutcome::Indexed { chunk_count } = report.outcome {
        config_db.set_document(&DocumentRecord {
            id: document.id.clone(),
            title: document.title.clone(),
            chapter_count: document.chapters.len(),
            chunk_count,
            options,
        })?;
    }

    let backfilled = if retriever.queue().is_empty() {
        0
    } else {
        retriever.drain_backfill().await
    };

    if let Some(handle) = progress {
        handle.abort();
        let _ = handle.await;
        eprintln!();
    }

    if args.json {
        let mut value = serde_json::to_value(&report)?;
        value["state"] = serde_json::to_value(retriever.state(&document.id))?;
        value["backfilled"] = serde_json::Value::from(backfilled);
        println!("{value}");
        return Ok(());
    }

    match report.outcome {
        IndexOutcome::Indexed { chunk_count } => {
            println!("Indexed '{}': {chunk_count} chunk(s)", report.document_id);
        }
        IndexOutcome::AlreadyIndexed => {
            println!(
                "'{}' is already indexed (use `bookbert reindex` to re-chunk)",
                report.document_id
            );
        }
        IndexOutcome::Cancelled => {
            println!("Indexing of '{}' was cancelled", report.document_id);
        }
    }
    println!("State: {}", retriever.state(&document.id));
    Ok(())
}

async fn cmd_search(
    cli: &Cli,
    data_dir: &DataDir,
    config_db: &ConfigDb,
    args: &SearchArgs,
) -> error::Result<()> {
    let config = RetrievalConfig::load(config_db)?;
    let retriever = open_retriever(cli, data_dir, config_db, false, config)?;

    let options = SearchOptions {
        scope: args.effective_scope(),
        chapter_id: args.chapter.clone(),
        top_k: args.count.unwrap_or(retriever.config().top_k),
    };
    let outcome = retriever
        .search_outcome(&args.query, &args.document, &options)
        .await?;

    if args.json {
        println!("{}", search::format_json(&args.query, &outcome)?);
    } else {
        print!("{}", search::format_human(&outcome));
    }

    if outcome.needs_backfill && !cli.quiet {
        eprintln!(
            "note: embeddings for '{}' are incomplete, run `bookbert index` on it again to compute them",
            args.document
        );
    }
    Ok(())
}

async fn cmd_get(
    cli: &Cli,
    data_dir: &DataDir,
    config_db: &ConfigDb,
    args: &GetArgs,
) -> error::Result<()> {
    let config = RetrievalConfig::load(config_db)?;
    let retriever = open_retriever(cli, data_dir, config_db, false, config)?;
    let chunk = retriever
        .get_chunk_by_id(&args.id)
        .await?
        .ok_or_else(|| Error::NotFound {
            kind: "chunk",
            name: args.id.clone(),
        })?;

    if args.json {
        println!("{}", serde_json::to_string(&chunk)?);
    } else {
        println!("id: {}", chunk.id);
        println!("document: {}", chunk.document_id);
        println!("chapter: {} ({})", chunk.chapter_title, chunk.chapter_id);
        println!("tokens: {}..{}", chunk.offset_start, chunk.offset_end);
        if let Some(model) = &chunk.embedding_model {
            println!("embedding: {model}");
        }
        println!();
        println!("{}", chunk.text);
    }
    Ok(())
}

fn cmd_chunk(config_db: &ConfigDb, args: &ChunkArgs) -> error::Result<()> {
    let config = RetrievalConfig::load(config_db)?;
    let options = args.chunking.apply(config.chunking);
    options.validate()?;

    let content = std::fs::read_to_string(&args.path)?;
    let chunks = chunk_markup(&content, &options);

    if args.json {
        println!("{}", serde_json::to_string(&chunks)?);
        return Ok(());
    }

    for (i, chunk) in chunks.iter().enumerate() {
        println!(
            "--- chunk {i} [{}..{}] {} token(s) ---",
            chunk.offset_start,
            chunk.offset_end,
            estimate_token_count(&chunk.text)
        );
        println!("{}", chunk.text);
    }
    println!("\n{} chunk(s)", chunks.len());
    Ok(())
}

fn cmd_status(
    cli: &Cli,
    data_dir: &DataDir,
    config_db: &ConfigDb,
    json: bool,
) -> error::Result<()> {
    let chunk_db = ChunkDb::open(&data_dir.chunks_db())?;
    let stored = config_db.get_setting(MODEL_SETTING)?;
    let (model_id, _) = resolve_model(cli.model.as_deref(), stored.as_deref());

    let mut documents = Vec::new();
    for (id, chunk_count) in chunk_db.list_documents()? {
        let chunks = chunk_db.load_document(&id)?;
        let embedded = chunks.iter().filter(|c| c.embedding.is_some()).count();
        let title = config_db
            .get_document(&id)?
            .map(|record| record.title)
            .unwrap_or_default();
        documents.push((id, title, chunk_count, embedded));
    }

    if json {
        let docs: Vec<serde_json::Value> = documents
            .iter()
            .map(|(id, title, chunks, embedded)| {
                serde_json::json!({
                    "id": id,
                    "title": title,
                    "chunks": chunks,
                    "embedded": embedded,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::json!({
                "dataDir": data_dir.root().display().to_string(),
                "model": model_id,
                "documents": docs,
            })
        );
        return Ok(());
    }

    println!("Data directory: {}", data_dir.root().display());
    println!("Model: {model_id}");
    println!("Documents: {}", documents.len());
    for (id, title, chunks, embedded) in &documents {
        if title.is_empty() {
            println!("  {id}: {chunks} chunk(s), {embedded} embedded");
        } else {
            println!("  {id} ({title}): {chunks} chunk(s), {embedded} embedded");
        }
    }
    Ok(())
}

async fn cmd_remove(
    cli: &Cli,
    data_dir: &DataDir,
    config_db: &ConfigDb,
    document: &str,
) -> error::Result<()> {
    let config = RetrievalConfig::load(config_db)?;
    let retriever = open_retriever(cli, data_dir, config_db, false, config)?;

    let had_chunks = retriever.store().has_chunks(document).await?;
    let had_record = config_db.remove_document(document)?;
    if !had_chunks && !had_record {
        return Err(Error::NotFound {
            kind: "document",
            name: document.to_string(),
        });
    }

    retriever.remove_document(document).await?;
    println!("Removed document '{document}'");
    Ok(())
}

fn cmd_model(
    config_db: &ConfigDb,
    explicit: Option<&str>,
    action: &ModelAction,
) -> error::Result<()> {
    match action {
        ModelAction::Show { json } => {
            let stored = config_db.get_setting(MODEL_SETTING)?;
            let (model_id, source) = resolve_model(explicit, stored.as_deref());
            if *json {
                println!(
                    "{}",
                    serde_json::json!({
                        "model": model_id,
                        "source": source.to_string(),
                        "stored": stored,
                    })
                );
            } else {
                println!("{model_id} (from {source})");
            }
        }
        ModelAction::Set { model } => {
            config_db.set_setting(MODEL_SETTING, model)?;
            println!("Default model set to '{model}'");
        }
        ModelAction::Clear => {
            if config_db.remove_setting(MODEL_SETTING)? {
                println!("Stored model cleared");
            } else {
                println!("No stored model");
            }
        }
    }
    Ok(())
}

fn cmd_config(config_db: &ConfigDb, action: &ConfigAction) -> error::Result<()> {
    match action {
        ConfigAction::Show { json } => {
            let effective = RetrievalConfig::load(config_db)?;
            if *json {
                println!("{}", serde_json::to_string(&effective)?);
            } else {
                let persisted: HashSet<String> = config_db
                    .list_settings_with_prefix(config::SETTING_PREFIX)?
                    .into_iter()
                    .map(|(key, _)| key)
                    .collect();
                for key in KEYS {
                    let value = effective.get(key).unwrap_or_default();
                    if persisted.contains(*key) {
                        println!("{key}\t{value}\t(set)");
                    } else {
                        println!("{key}\t{value}");
                    }
                }
            }
        }
        ConfigAction::Set { key, value } => {
            let mut candidate = RetrievalConfig::load(config_db)?;
            candidate.apply(key, value)?;
            candidate.validate()?;
            config_db.set_setting(&config::setting_key(key), value.trim())?;
            println!("{key} = {}", value.trim());
        }
        ConfigAction::Unset { key } => {
            if !config_db.remove_setting(&config::setting_key(key))? {
                return Err(Error::NotFound {
                    kind: "setting",
                    name: key.clone(),
                });
            }
            println!("{key} reset to default");
        }
    }
    Ok(())
}
