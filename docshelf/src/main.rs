//! docshelf command line
//!
//! Wires the configured metadata, content and text index backends into a
//! document repository and exposes its operations as subcommands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use docshelf_core::config::{Config, MetadataBackend};
use docshelf_core::{Document, DocumentFilter, DocumentRepository, Group, Id, Policy, User};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod setup;

#[derive(Parser, Debug)]
#[command(name = "docshelf")]
#[command(about = "Document repository with tag and full-text listings")]
struct Cli {
    /// Metadata backend (embedded, bolt or dynamo). Overrides DS_BACKEND.
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Embedded database file. Overrides DS_DB_PATH.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Content directory for the disk backend, key prefix for S3. Overrides DS_FILE_PREFIX.
    #[arg(long, global = true)]
    content_root: Option<String>,

    /// Text index directory. Overrides DS_INDEX_PATH.
    #[arg(long, global = true)]
    index_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a document's content, or its metadata with --meta
    Get {
        id_or_path: String,

        #[arg(long)]
        meta: bool,
    },

    /// Create or update a document, reading content from --file or stdin
    Save {
        #[arg(short, long)]
        title: String,

        /// Derived from the title when omitted
        #[arg(short, long)]
        path: Option<String>,

        /// Update the document with this id
        #[arg(long)]
        id: Option<String>,

        #[arg(short = 'g', long = "tag")]
        tags: Vec<String>,

        #[arg(short, long)]
        file: Option<PathBuf>,

        /// User id recorded as the author of this write
        #[arg(long)]
        author: Option<String>,
    },

    /// List documents, optionally filtered by text query, tags and path prefix
    Ls {
        #[arg(short, long, default_value = "")]
        query: String,

        #[arg(short = 'g', long = "tag")]
        tags: Vec<String>,

        #[arg(long, default_value = "")]
        prefix: String,
    },

    /// Add tags to a document
    Tag {
        id_or_path: String,

        #[arg(required = true)]
        tags: Vec<String>,
    },

    /// Remove a document
    Rm { id_or_path: String },

    /// Manage users
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Manage groups
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },

    /// Manage policies
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Provision storage and make sure the root user exists
    Init,
}

#[derive(Subcommand, Debug)]
enum UserAction {
    /// Look a user up by id or email
    Get { id_or_email: String },
    List,
    Add {
        email: String,

        #[arg(short, long, default_value = "")]
        name: String,
    },
    Rm { id: String },
}

#[derive(Subcommand, Debug)]
enum GroupAction {
    Get { id: String },
    List,
    Add {
        name: String,

        #[arg(short, long = "user")]
        users: Vec<String>,
    },
    Rm { id: String },
}

#[derive(Subcommand, Debug)]
enum PolicyAction {
    Get { id: String },
    List,
    Add {
        #[arg(short, long = "user")]
        users: Vec<String>,

        #[arg(short, long = "group")]
        groups: Vec<String>,

        #[arg(long)]
        read_only: bool,
    },
    Rm { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = apply_overrides(&cli, Config::from_env()?)?;
    let repo = setup::build_repository(&config).await?;

    run(cli.command, &repo).await
}

fn apply_overrides(cli: &Cli, mut config: Config) -> Result<Config> {
    if let Some(backend) = &cli.backend {
        config.backend = MetadataBackend::parse(backend)?;
    }
    if let Some(path) = &cli.db_path {
        config.db_path = path.clone();
    }
    if let Some(root) = &cli.content_root {
        config.file_prefix = root.clone();
    }
    if let Some(path) = &cli.index_path {
        config.index_path = path.clone();
    }
    Ok(config)
}

async fn run(command: Commands, repo: &DocumentRepository) -> Result<()> {
    match command {
        Commands::Get { id_or_path, meta } => {
            let doc = repo.get_document(&id_or_path).await?;
            if meta {
                print_json(&doc)?;
            } else {
                print!("{}", doc.content_string());
            }
        }
        Commands::Save {
            title,
            path,
            id,
            tags,
            file,
            author,
        } => {
            let content = read_content(file).await?;
            let mut doc = Document::new(title, content).with_tags(tags);
            doc.id = id.map(Id::from);
            doc.path = path.unwrap_or_default();
            doc.updated_by = author.map(Id::from);
            let id = repo.save_document(doc).await?;
            println!("{id}");
        }
        Commands::Ls {
            query,
            tags,
            prefix,
        } => {
            let filter = DocumentFilter::new().prefix(prefix).query(query).tags(tags);
            for doc in repo.list(&filter).await? {
                println!("{}", listing_line(&doc));
            }
        }
        Commands::Tag { id_or_path, tags } => {
            repo.tag_document(&id_or_path, &tags).await?;
        }
        Commands::Rm { id_or_path } => {
            repo.remove_document(&id_or_path).await?;
        }
        Commands::User { action } => run_user(action, repo).await?,
        Commands::Group { action } => run_group(action, repo).await?,
        Commands::Policy { action } => run_policy(action, repo).await?,
        Commands::Init => match setup::ensure_root_user(repo).await? {
            Some(token) => println!("root user created, token: {token}"),
            None => println!("root user already exists"),
        },
    }
    Ok(())
}

async fn run_user(action: UserAction, repo: &DocumentRepository) -> Result<()> {
    match action {
        UserAction::Get { id_or_email } => print_json(&repo.get_user(&id_or_email).await?)?,
        UserAction::List => print_json(&repo.list_users().await?)?,
        UserAction::Add { email, name } => {
            let id = repo
                .save_user(User {
                    email,
                    name,
                    ..Default::default()
                })
                .await?;
            println!("{id}");
        }
        UserAction::Rm { id } => repo.remove_user(&Id::from(id)).await?,
    }
    Ok(())
}

async fn run_group(action: GroupAction, repo: &DocumentRepository) -> Result<()> {
    match action {
        GroupAction::Get { id } => print_json(&repo.get_group(&Id::from(id)).await?)?,
        GroupAction::List => print_json(&repo.list_groups().await?)?,
        GroupAction::Add { name, users } => {
            let id = repo
                .save_group(Group {
                    name,
                    users: users.into_iter().map(Id::from).collect(),
                    ..Default::default()
                })
                .await?;
            println!("{id}");
        }
        GroupAction::Rm { id } => repo.remove_group(&Id::from(id)).await?,
    }
    Ok(())
}

async fn run_policy(action: PolicyAction, repo: &DocumentRepository) -> Result<()> {
    match action {
        PolicyAction::Get { id } => print_json(&repo.get_policy(&Id::from(id)).await?)?,
        PolicyAction::List => print_json(&repo.list_policies().await?)?,
        PolicyAction::Add {
            users,
            groups,
            read_only,
        } => {
            let id = repo
                .save_policy(Policy {
                    users: users.into_iter().map(Id::from).collect(),
                    groups: groups.into_iter().map(Id::from).collect(),
                    read_only,
                    ..Default::default()
                })
                .await?;
            println!("{id}");
        }
        PolicyAction::Rm { id } => repo.remove_policy(&Id::from(id)).await?,
    }
    Ok(())
}

async fn read_content(file: Option<PathBuf>) -> Result<Vec<u8>> {
    match file {
        Some(path) => tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display())),
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin().read_to_end(&mut buf).await?;
            info!(bytes = buf.len(), "read content from stdin");
            Ok(buf)
        }
    }
}

fn listing_line(doc: &Document) -> String {
    let tags: Vec<&str> = doc.tags.iter().map(String::as_str).collect();
    format!("{}\t{}\t{}", doc.path, doc.title, tags.join(","))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use docshelf_core::config::ContentBackend;

    fn test_config() -> Config {
        Config {
            backend: MetadataBackend::Embedded,
            file_backend: ContentBackend::Disk,
            s3_bucket: String::new(),
            file_prefix: "documents".into(),
            db_path: "docshelf.db".into(),
            index_path: "docshelf.index".into(),
            search_limit: 1000,
            store: Default::default(),
        }
    }

    #[test]
    fn parses_save_with_repeated_tags() {
        let cli = Cli::try_parse_from([
            "docshelf", "save", "--title", "Runbook", "-g", "ops", "--tag", "oncall", "--path",
            "ops/runbook.md",
        ])
        .unwrap();

        match cli.command {
            Commands::Save {
                title, tags, path, ..
            } => {
                assert_eq!(title, "Runbook");
                assert_eq!(tags, vec!["ops", "oncall"]);
                assert_eq!(path.as_deref(), Some("ops/runbook.md"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn tag_requires_at_least_one_tag() {
        assert!(Cli::try_parse_from(["docshelf", "tag", "a.md"]).is_err());
        assert!(Cli::try_parse_from(["docshelf", "tag", "a.md", "x"]).is_ok());
    }

    #[test]
    fn flags_override_environment() {
        let cli = Cli::try_parse_from([
            "docshelf",
            "--backend",
            "dynamo",
            "--db-path",
            "/tmp/meta.db",
            "ls",
            "--content-root",
            "/srv/docs",
        ])
        .unwrap();

        let config = apply_overrides(&cli, test_config()).unwrap();
        assert_eq!(config.backend, MetadataBackend::Dynamo);
        assert_eq!(config.db_path, PathBuf::from("/tmp/meta.db"));
        assert_eq!(config.file_prefix, "/srv/docs");
        assert_eq!(config.index_path, PathBuf::from("docshelf.index"));
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let cli = Cli::try_parse_from(["docshelf", "--backend", "mongo", "init"]).unwrap();
        assert!(apply_overrides(&cli, test_config()).is_err());
    }

    #[test]
    fn listing_lines_show_tags() {
        let doc = Document::new("Runbook", "")
            .with_path("ops/runbook.md")
            .with_tags(["ops", "oncall"]);
        assert_eq!(listing_line(&doc), "ops/runbook.md\tRunbook\toncall,ops");
    }
}
