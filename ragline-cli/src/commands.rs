//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use futures::StreamExt;
use ragline_core::chat::{ChatClient, DateTimeTools, ToolRegistry};
use ragline_core::config::RaglineConfig;
use ragline_core::providers::create_provider;
use ragline_core::rag::completion::resolve_used_fragments;
use ragline_core::rag::evaluation::EvaluationRequest;
use ragline_core::rag::{
    DocumentFragment, DocumentIngestor, Embedder, Evaluator, EvaluationVerdict,
    InMemoryVectorIndex, KnowledgeGapEvaluator, RagService, RelevancyEvaluator, Retriever,
    VectorIndex, VectorRetriever, create_embedder,
};
use ragline_core::types::Message;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    config: RaglineConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    match command {
        Commands::Ask {
            question,
            docs,
            stream,
            evaluate,
        } => handle_ask(&config, workspace, &question, &docs, stream, evaluate).await,
        Commands::Chat {
            message,
            conversation,
            system,
            no_tools,
        } => {
            handle_chat(
                &config,
                workspace,
                message,
                conversation.as_deref(),
                system,
                no_tools,
            )
            .await
        }
        Commands::Eval {
            question,
            answer,
            docs,
        } => handle_eval(&config, workspace, &question, &answer, &docs).await,
        Commands::Tools => handle_tools(&config).await,
        Commands::Config { action } => handle_config(action, workspace),
    }
}

pub fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".ragline");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&RaglineConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let mut config = ragline_core::config::load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            for llm in std::iter::once(&mut config.llm).chain(config.judge.as_mut()) {
                if llm.api_key.is_some() {
                    llm.api_key = Some("********".into());
                }
            }
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Knowledge base
// ---------------------------------------------------------------------------

/// An in-memory index holding the documents named on the command line.
struct KnowledgeBase {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
}

impl KnowledgeBase {
    async fn load(config: &RaglineConfig, paths: &[PathBuf]) -> anyhow::Result<Self> {
        let embedder = create_embedder(&config.retrieval.embedding)?;
        let index: Arc<dyn VectorIndex> = Arc::new(InMemoryVectorIndex::new());
        let ingestor = DocumentIngestor::new(
            Arc::clone(&embedder),
            Arc::clone(&index),
            config.retrieval.chunking.clone(),
        );

        let mut documents = 0;
        for path in paths {
            if path.is_dir() {
                documents += ingestor.ingest_directory(path).await?.len();
            } else {
                ingestor.ingest_file(path).await?;
                documents += 1;
            }
        }
        if documents == 0 {
            warn!("No documents ingested; every question will lack context");
        } else {
            let chunks = index.len().await?;
            info!(documents, chunks, "Knowledge base ready");
        }
        Ok(Self { embedder, index })
    }

    fn retriever(&self, config: &RaglineConfig) -> VectorRetriever {
        VectorRetriever::new(Arc::clone(&self.embedder), Arc::clone(&self.index))
            .with_min_score(config.retrieval.min_score)
    }
}

/// Paths given with `--docs`, or the workspace's `.ragline/docs` if present.
fn document_paths(workspace: &Path, docs: &[PathBuf]) -> Vec<PathBuf> {
    if !docs.is_empty() {
        return docs.to_vec();
    }
    let default = workspace.join(".ragline").join("docs");
    if default.is_dir() {
        vec![default]
    } else {
        Vec::new()
    }
}

/// Relevancy when there is material to judge against, knowledge gap when not.
fn judge_for(
    config: &RaglineConfig,
    fragments: &[DocumentFragment],
) -> anyhow::Result<Box<dyn Evaluator>> {
    let judge = create_provider(config.judge_llm())?;
    let attempts = config.rag.judge_attempts;
    Ok(if fragments.is_empty() {
        Box::new(KnowledgeGapEvaluator::new(judge).with_max_attempts(attempts))
    } else {
        Box::new(RelevancyEvaluator::new(judge).with_max_attempts(attempts))
    })
}

/// Judge an answer against every fragment the model was shown, cited or not.
fn evaluation_for(
    config: &RaglineConfig,
    question: &str,
    context: Vec<DocumentFragment>,
    answer: String,
) -> anyhow::Result<(Box<dyn Evaluator>, EvaluationRequest)> {
    let evaluator = judge_for(config, &context)?;
    Ok((evaluator, EvaluationRequest::new(question, context, answer)))
}

fn print_verdict(evaluator: &dyn Evaluator, verdict: &EvaluationVerdict) {
    println!();
    println!("Evaluation ({}): {}", evaluator.name(), verdict.outcome);
    if !verdict.explanation.is_empty() {
        println!("  {}", verdict.explanation);
    }
}

fn print_sources(fragments: &[DocumentFragment]) {
    if fragments.is_empty() {
        return;
    }
    println!();
    println!("Sources:");
    for fragment in fragments {
        println!("  [{}] {} (score {:.2})", fragment.id, fragment.source, fragment.score);
    }
}

// ---------------------------------------------------------------------------
// ask / eval
// ---------------------------------------------------------------------------

async fn handle_ask(
    config: &RaglineConfig,
    workspace: &Path,
    question: &str,
    docs: &[PathBuf],
    stream: bool,
    evaluate: bool,
) -> anyhow::Result<()> {
    let knowledge = KnowledgeBase::load(config, &document_paths(workspace, docs)).await?;
    let provider = create_provider(&config.llm)?;
    let service = RagService::from_config(
        config,
        provider,
        Arc::clone(&knowledge.embedder),
        Arc::clone(&knowledge.index),
    );

    let (answer, used, context) = if stream {
        let mut chunks = service.query_streaming(question).await?;
        let mut answer = String::new();
        let mut stdout = std::io::stdout();
        loop {
            tokio::select! {
                chunk = chunks.next() => match chunk {
                    Some(chunk) => {
                        let chunk = chunk?;
                        print!("{}", chunk);
                        stdout.flush()?;
                        answer.push_str(&chunk);
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    chunks.cancel();
                    println!();
                    anyhow::bail!("Cancelled");
                }
            }
        }
        println!();
        let context = chunks.fragments().to_vec();
        let used = resolve_used_fragments(&answer, &context);
        (answer, used, context)
    } else {
        let (result, context) = service.query_with_context(question).await?;
        println!("{}", result.answer);
        (result.answer, result.used_fragments, context)
    };
    print_sources(&used);

    if evaluate {
        let (evaluator, request) = evaluation_for(config, question, context, answer)?;
        let verdict = evaluator.evaluate(&request).await;
        print_verdict(evaluator.as_ref(), &verdict);
    }
    Ok(())
}

async fn handle_eval(
    config: &RaglineConfig,
    workspace: &Path,
    question: &str,
    answer: &str,
    docs: &[PathBuf],
) -> anyhow::Result<()> {
    let knowledge = KnowledgeBase::load(config, &document_paths(workspace, docs)).await?;
    let fragments = knowledge
        .retriever(config)
        .retrieve(question, config.retrieval.top_k)
        .await?;
    print_sources(&fragments);

    let evaluator = judge_for(config, &fragments)?;
    let verdict = evaluator
        .evaluate(&EvaluationRequest::new(question, fragments, answer))
        .await;
    print_verdict(evaluator.as_ref(), &verdict);
    if verdict.is_pass() {
        Ok(())
    } else {
        anyhow::bail!("Answer did not pass {} evaluation", evaluator.name())
    }
}

// ---------------------------------------------------------------------------
// chat / tools
// ---------------------------------------------------------------------------

async fn handle_chat(
    config: &RaglineConfig,
    workspace: &Path,
    message: String,
    conversation: Option<&str>,
    system: Option<String>,
    no_tools: bool,
) -> anyhow::Result<()> {
    let mut registry = ToolRegistry::new();
    let clients = if no_tools {
        Vec::new()
    } else {
        registry.register_all(DateTimeTools::new().callbacks())?;
        let clients = ragline_mcp::connect_servers(&config.mcp).await;
        ragline_mcp::register_tools(&mut registry, &clients);
        clients
    };

    let provider = create_provider(&config.llm)?;
    let chat = ChatClient::from_config(config, provider, registry);

    let store = ConversationStore::new(workspace);
    if let Some(id) = conversation {
        chat.memory().append(id, store.load(id)?);
    }

    let mut request = chat.prompt(message);
    if let Some(system) = system {
        request = request.system(system);
    }
    if let Some(id) = conversation {
        request = request.conversation(id);
    }
    let result = request.call().await;
    ragline_mcp::shutdown_all(&clients).await;
    let response = result?;

    println!("{}", response.content);
    if let Some(id) = conversation {
        store.save(id, &chat.memory().history(id))?;
    }
    Ok(())
}

async fn handle_tools(config: &RaglineConfig) -> anyhow::Result<()> {
    let mut registry = ToolRegistry::new();
    registry.register_all(DateTimeTools::new().callbacks())?;
    println!("Built-in tools:");
    for name in registry.names() {
        if let Some(tool) = registry.get(name) {
            println!("  {} - {}", name, tool.description());
        }
    }

    let clients = ragline_mcp::connect_servers(&config.mcp).await;
    if config.mcp.servers.is_empty() {
        println!();
        println!("No MCP servers configured. Add [[mcp.servers]] entries to your config file.");
    }
    for client in &clients {
        let version = client
            .server_info()
            .map(|info| format!("{} {}", info.name, info.version))
            .unwrap_or_default();
        println!();
        println!("MCP server '{}' ({}):", client.name(), version.trim());
        for tool in client.tools() {
            println!(
                "  {} - {}",
                tool.name,
                tool.description.as_deref().unwrap_or("(no description)")
            );
        }
    }
    ragline_mcp::shutdown_all(&clients).await;
    Ok(())
}

/// Conversations saved as JSON under `<workspace>/.ragline/conversations`.
struct ConversationStore {
    dir: PathBuf,
}

impl ConversationStore {
    fn new(workspace: &Path) -> Self {
        Self {
            dir: workspace.join(".ragline").join("conversations"),
        }
    }

    fn path(&self, id: &str) -> PathBuf {
        let file: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file}.json"))
    }

    fn load(&self, id: &str) -> anyhow::Result<Vec<Message>> {
        let path = self.path(id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn save(&self, id: &str, messages: &[Message]) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path(id), serde_json::to_string_pretty(messages)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_conversation_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ConversationStore::new(dir.path());
        assert!(store.load("c1").unwrap().is_empty());

        let messages = vec![
            Message::user("My name is Inigo Montoya"),
            Message::assistant("Nice to meet you"),
        ];
        store.save("c1", &messages).unwrap();
        assert_eq!(store.load("c1").unwrap(), messages);
    }

    #[test]
    fn test_conversation_ids_are_sanitized() {
        let store = ConversationStore::new(Path::new("/ws"));
        assert_eq!(
            store.path("../etc/passwd"),
            PathBuf::from("/ws/.ragline/conversations/___etc_passwd.json")
        );
    }

    #[test]
    fn test_document_paths_default() {
        let dir = TempDir::new().unwrap();
        assert!(document_paths(dir.path(), &[]).is_empty());

        let docs = dir.path().join(".ragline").join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        assert_eq!(document_paths(dir.path(), &[]), vec![docs]);
        assert_eq!(
            document_paths(dir.path(), &[PathBuf::from("x.md")]),
            vec![PathBuf::from("x.md")]
        );
    }

    #[tokio::test]
    async fn test_knowledge_base_loads_files_and_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("spring.md"), "Spring Framework 6.2 is out.").unwrap();
        let nested = dir.path().join("notes");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("a.txt"), "Alpha notes.").unwrap();
        std::fs::write(nested.join("b.txt"), "Beta notes.").unwrap();

        let config = RaglineConfig::default();
        let kb = KnowledgeBase::load(&config, &[dir.path().join("spring.md"), nested])
            .await
            .unwrap();
        assert_eq!(kb.index.len().await.unwrap(), 3);

        let hits = kb
            .retriever(&config)
            .retrieve("Spring Framework version", 1)
            .await
            .unwrap();
        assert_eq!(hits[0].source, "spring.md");
    }

    #[tokio::test]
    async fn test_evaluation_uses_uncited_context() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("spring.md"), "Spring Framework 6.2 is out.").unwrap();
        let mut config = RaglineConfig::default();
        config.llm.api_key = Some("sk-test".into());
        let kb = KnowledgeBase::load(&config, &[dir.path().join("spring.md")])
            .await
            .unwrap();

        let provider = Arc::new(ragline_core::brain::MockLlmProvider::with_response(
            "Spring Framework 6.2 is the latest release.",
        ));
        let service = RagService::from_config(
            &config,
            provider,
            Arc::clone(&kb.embedder),
            Arc::clone(&kb.index),
        );
        let (result, context) = service
            .query_with_context("Spring Framework version")
            .await
            .unwrap();
        assert!(result.used_fragments.is_empty());
        assert!(!context.is_empty());

        let (evaluator, request) =
            evaluation_for(&config, "Spring Framework version", context.clone(), result.answer)
                .unwrap();
        assert_eq!(evaluator.name(), "relevancy");
        assert_eq!(request.fragments, context);
    }
}
