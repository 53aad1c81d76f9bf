use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gleaner::config::Config;
use gleaner::dedup::find_duplicates;
use gleaner::feed;
use gleaner::library::Library;
use gleaner::preferences::PreferenceManager;
use gleaner::rules::{MatchMode, Rule, SmartFolder};
use gleaner::storage::{Article, ArticleFilter, Database, DatabaseError, Folder, ItemType};
use gleaner::sync::{HttpBlobStore, SyncEngine, SyncQueue};
use gleaner::util::{strip_control_chars, truncate_to_width};

const TITLE_WIDTH: usize = 60;

#[derive(Parser, Debug)]
#[command(
    name = "gleaner",
    about = "Feed reader with duplicate detection, smart folders and multi-device sync"
)]
struct Args {
    /// Config file (defaults to ~/.config/gleaner/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed
    Add {
        url: String,
        /// Title to use instead of the feed's own
        #[arg(long)]
        title: Option<String>,
    },
    /// Unsubscribe from a feed
    Remove { url: String },
    /// Fetch new articles
    Refresh {
        /// Refresh one feed, even if its circuit breaker has tripped
        #[arg(long)]
        feed: Option<i64>,
    },
    /// List articles, newest first
    List {
        #[arg(long)]
        feed: Option<i64>,
        #[arg(long)]
        unread: bool,
        /// Include duplicate copies of a story
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Print an article with its stored content
    Show { link: String },
    /// Download an article page for offline reading
    Save { link: String },
    /// Mark an article read
    Read { link: String },
    /// Mark every article read (or only one feed's)
    ReadAll {
        #[arg(long)]
        feed: Option<i64>,
    },
    /// Mark an article unread
    Unread { link: String },
    /// Show groups of articles reporting the same story
    Duplicates,
    /// Tag an article (or a feed with --feed)
    Tag {
        name: String,
        link: String,
        #[arg(long)]
        feed: bool,
    },
    /// Remove a tag from an article (or a feed with --feed)
    Untag {
        name: String,
        link: String,
        #[arg(long)]
        feed: bool,
    },
    /// Delete a tag everywhere it is used
    DeleteTag { name: String },
    /// Manage folders
    #[command(subcommand)]
    Folder(FolderCommand),
    /// Manage smart folders
    #[command(subcommand)]
    Smart(SmartCommand),
    /// Show or change a preference
    Pref {
        key: String,
        value: Option<String>,
        /// Drop the stored value and go back to the config file's
        #[arg(long, conflicts_with = "value")]
        reset: bool,
    },
    /// Deliver queued changes to the sync backend
    Sync {
        /// Also apply changes made on other devices
        #[arg(long)]
        pull: bool,
        /// Keep running and deliver changes as they are queued
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Subcommand, Debug)]
enum FolderCommand {
    Create {
        name: String,
        #[arg(long)]
        parent: Option<i64>,
    },
    /// Move a folder under another one (or to the top level)
    Move {
        id: i64,
        #[arg(long)]
        parent: Option<i64>,
    },
    Rename {
        id: i64,
        name: String,
    },
    /// Delete a folder; its children move up a level
    Delete {
        id: i64,
    },
    /// Put a feed in a folder (or take it out)
    Assign {
        feed_id: i64,
        #[arg(long)]
        folder: Option<i64>,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum SmartCommand {
    /// Save a smart folder, e.g. --rule "title contains rust"
    Save {
        name: String,
        /// Match any rule instead of all of them
        #[arg(long)]
        any: bool,
        #[arg(long = "rule", required = true)]
        rules: Vec<String>,
    },
    /// Show the articles (or feeds) a smart folder matches
    Show {
        name: String,
        #[arg(long)]
        feeds: bool,
    },
    List,
    Delete {
        name: String,
    },
}

/// Create the config directory with user-only permissions.
fn prepare_config_dir(config_dir: &Path) -> Result<()> {
    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(config_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }
    Ok(())
}

async fn open_database(path: &Path) -> Result<Database> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!(
                "Error: Another instance of gleaner appears to be running. Please close it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("gleaner/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

fn format_date(ts: Option<i64>) -> String {
    ts.and_then(|t| chrono::DateTime::from_timestamp(t, 0))
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "----------".to_string())
}

fn print_article(article: &Article) {
    println!(
        "{} {}  {:<20}  {}",
        if article.is_read { "[x]" } else { "[ ]" },
        format_date(article.pub_date),
        truncate_to_width(&article.source, 20),
        truncate_to_width(&article.title, TITLE_WIDTH),
    );
    println!("      {}", article.link);
}

fn print_folders(folders: &[Folder]) {
    let mut children: HashMap<Option<i64>, Vec<&Folder>> = HashMap::new();
    for folder in folders {
        children.entry(folder.parent_id).or_default().push(folder);
    }
    // Iterative walk; depth is bounded by the number of folders
    let mut stack: Vec<(&Folder, usize)> = children
        .get(&None)
        .map(|roots| roots.iter().rev().map(|f| (*f, 0)).collect())
        .unwrap_or_default();
    let mut printed = 0;
    while let Some((folder, depth)) = stack.pop() {
        printed += 1;
        if printed > folders.len() {
            break;
        }
        println!("{}{} (#{})", "  ".repeat(depth), folder.name, folder.id);
        if let Some(kids) = children.get(&Some(folder.id)) {
            stack.extend(kids.iter().rev().map(|f| (*f, depth + 1)));
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = Config::dir()?;
    prepare_config_dir(&config_dir)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    tracing::debug!(config = ?config, "Loaded configuration");

    let db = open_database(&config_dir.join("gleaner.db")).await?;
    let prefs = PreferenceManager::load(&config, &db)
        .await
        .context("Failed to load preferences")?;

    let queue = if config.sync.enabled {
        Some(Arc::new(
            SyncQueue::load(db.clone(), config.sync.retry_policy())
                .await
                .context("Failed to load sync queue")?,
        ))
    } else {
        None
    };
    let library = Library::new(db.clone(), prefs, queue.clone());

    match args.command {
        Command::Add { url, title } => {
            let title = match title {
                Some(title) => title,
                None => match feed::fetch_title(&http_client()?, url.trim()).await {
                    Ok(Some(title)) => title,
                    Ok(None) => url.clone(),
                    Err(e) => {
                        tracing::warn!(feed = %url, error = %e, "Could not read feed title");
                        url.clone()
                    }
                },
            };
            let feed = library.subscribe(&url, &title).await?;
            println!("Subscribed to {} (#{})", feed.title, feed.id);
        }
        Command::Remove { url } => {
            if library.unsubscribe(&url).await? {
                println!("Unsubscribed from {}", url);
            } else {
                println!("Not subscribed to {}", url);
            }
        }
        Command::Refresh { feed: Some(feed_id) } => {
            let feed = db
                .get_feed(feed_id)
                .await?
                .with_context(|| format!("No feed with id {}", feed_id))?;
            let result = feed::refresh_one(&db, &http_client()?, &feed).await;
            match result.result {
                Ok(count) => println!("{}: {} new", feed.title, count),
                Err(e) => println!("{}: {}", feed.title, e),
            }
        }
        Command::Refresh { feed: None } => {
            let feeds = db.get_feeds().await?;
            let concurrency = library.preferences().refresh_concurrency();
            let results = feed::refresh_all(&db, &http_client()?, &feeds, concurrency).await;
            let new: usize = results.iter().filter_map(|r| r.result.as_ref().ok()).sum();
            let failed: Vec<_> = results.iter().filter(|r| r.result.is_err()).collect();
            println!(
                "Refreshed {} feeds: {} new articles, {} failed",
                results.len(),
                new,
                failed.len()
            );
            for r in failed {
                if let Err(e) = &r.result {
                    println!("  feed #{}: {}", r.feed_id, e);
                }
            }
        }
        Command::List {
            feed,
            unread,
            all,
            limit,
        } => {
            let filter = ArticleFilter {
                feed_id: feed,
                unread_only: unread,
                limit: Some(limit),
            };
            let articles = if all {
                db.get_articles(&filter).await?
            } else {
                library.articles(&filter).await?
            };
            for article in &articles {
                print_article(article);
            }
        }
        Command::Show { link } => {
            let article = db
                .get_article_by_link(&link)
                .await?
                .with_context(|| format!("No article with link {}", link))?;
            print_article(&article);
            if let Some(author) = &article.author {
                println!("      by {}", strip_control_chars(author));
            }
            let body = db
                .get_article_content(&article.link)
                .await?
                .or(article.description);
            if let Some(body) = body {
                println!();
                println!("{}", strip_control_chars(&body));
            }
        }
        Command::Save { link } => {
            let bytes = library.save_offline(&http_client()?, &link).await?;
            println!("Saved {} bytes for offline reading", bytes);
        }
        Command::Read { link } => {
            if !library.mark_read(&link).await? {
                println!("No unread article with link {}", link);
            }
        }
        Command::ReadAll { feed } => {
            let count = library.mark_all_read(feed).await?;
            println!("Marked {} articles read", count);
        }
        Command::Unread { link } => {
            if !library.mark_unread(&link).await? {
                println!("No read article with link {}", link);
            }
        }
        Command::Duplicates => {
            let articles = db.get_articles(&ArticleFilter::default()).await?;
            let policy = library.preferences().dedup_policy();
            let groups = find_duplicates(&articles, &policy);
            if groups.is_empty() {
                println!("No duplicates");
            }
            for group in groups {
                println!("{:?}:", group.reason);
                print_article(group.primary);
                for dup in group.duplicates {
                    print!("  dup ");
                    print_article(dup);
                }
            }
        }
        Command::Tag { name, link, feed } => {
            let item_type = if feed { ItemType::Feed } else { ItemType::Article };
            library.tag(&name, &link, item_type).await?;
        }
        Command::Untag { name, link, feed } => {
            let item_type = if feed { ItemType::Feed } else { ItemType::Article };
            if !library.untag(&name, &link, item_type).await? {
                println!("'{}' was not tagged {}", link, name);
            }
        }
        Command::DeleteTag { name } => {
            if !library.remove_tag(&name).await? {
                println!("No tag named '{}'", name);
            }
        }
        Command::Folder(cmd) => run_folder(&db, cmd).await?,
        Command::Smart(cmd) => run_smart(&library, cmd).await?,
        Command::Pref { key, value, reset } => {
            let mut prefs = PreferenceManager::load(&config, &db).await?;
            if reset {
                if !prefs.reset(&db, &key).await? {
                    println!("{} had no stored value", key);
                }
            } else if let Some(value) = value {
                prefs.set(&db, &key, &value).await?;
            }
            match prefs.get(&key) {
                Some(value) => println!("{} = {}", key, value),
                None => println!("{} is not set", key),
            }
        }
        Command::Sync { pull, watch } => {
            let Some(queue) = queue else {
                anyhow::bail!("Sync is disabled; set [sync] enabled = true in the config file");
            };
            let endpoint = config
                .sync
                .endpoint
                .as_deref()
                .context("Sync endpoint is not configured")?;
            let store = HttpBlobStore::new(
                http_client()?,
                endpoint,
                config.sync.api_token(),
                config.sync.request_timeout(),
            )?;
            let engine = SyncEngine::new(queue, Arc::new(store), config.sync.reconcile_interval());

            let summary = engine.drain().await?;
            println!(
                "Delivered {}, retrying {}, dropped {} ({} still queued)",
                summary.delivered,
                summary.retrying,
                summary.dropped,
                engine.queue().len().await
            );

            if pull {
                let pulled = engine.pull(&db).await?;
                println!(
                    "Pulled {} records: {} local changes",
                    pulled.records,
                    pulled.total_changes()
                );
            }

            if watch {
                let (tx, rx) = tokio::sync::watch::channel(false);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        let _ = tx.send(true);
                    }
                });
                println!("Watching the sync queue; press Ctrl-C to stop");
                engine.run(rx).await;
            }
        }
    }

    Ok(())
}

async fn run_folder(db: &Database, cmd: FolderCommand) -> Result<()> {
    match cmd {
        FolderCommand::Create { name, parent } => {
            let id = db.create_folder(&name, parent).await?;
            println!("Created folder #{}", id);
        }
        FolderCommand::Move { id, parent } => db.move_folder(id, parent).await?,
        FolderCommand::Rename { id, name } => db.rename_folder(id, &name).await?,
        FolderCommand::Delete { id } => db.delete_folder(id).await?,
        FolderCommand::Assign { feed_id, folder } => db.move_feed_to_folder(feed_id, folder).await?,
        FolderCommand::List => print_folders(&db.get_folders().await?),
    }
    Ok(())
}

async fn run_smart(library: &Library, cmd: SmartCommand) -> Result<()> {
    match cmd {
        SmartCommand::Save { name, any, rules } => {
            let rules = rules
                .iter()
                .map(|r| r.parse::<Rule>().with_context(|| format!("Invalid rule '{}'", r)))
                .collect::<Result<Vec<_>>>()?;
            let mode = if any { MatchMode::Any } else { MatchMode::All };
            let folder = SmartFolder::new(&name, mode, rules)?;
            library.save_smart_folder(folder).await?;
            println!("Saved smart folder '{}'", name.trim());
        }
        SmartCommand::Show { name, feeds: true } => {
            for feed in library.smart_folder_feeds(&name).await? {
                println!("#{} {}  {}", feed.id, feed.title, feed.url);
            }
        }
        SmartCommand::Show { name, feeds: false } => {
            for article in library.smart_folder_articles(&name).await? {
                print_article(&article);
            }
        }
        SmartCommand::List => {
            for folder in library.db().get_smart_folders().await? {
                let joiner = match folder.mode {
                    MatchMode::All => " AND ",
                    MatchMode::Any => " OR ",
                };
                let rules: Vec<String> = folder.rules.iter().map(ToString::to_string).collect();
                println!("{}: {}", folder.name, rules.join(joiner));
            }
        }
        SmartCommand::Delete { name } => {
            if !library.delete_smart_folder(&name).await? {
                println!("No smart folder named '{}'", name);
            }
        }
    }
    Ok(())
}
