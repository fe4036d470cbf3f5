//! Microblog CLI
//!
//! Local entry point: manage a user's feed, follows and blocks, read
//! timelines and run the crawler.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use microblog::{
    codec::parse_date,
    error::{AppError, Result},
    models::{Config, Post, ReplyFields, RepostFields, Source},
    pipeline,
    services::{Account, HttpFetcher, OnDemandCrawler, Timeline},
    storage::{FeedStore, JsonFileSettings, MemoryCache, SettingsStore},
};

/// microblog - federated microblog feeds
#[derive(Parser, Debug)]
#[command(name = "microblog", version, about = "Federated microblog feed engine")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "storage/config.toml")]
    config: PathBuf,

    /// Storage directory (overrides feed.storage_dir)
    #[arg(short, long)]
    storage_dir: Option<PathBuf>,

    /// User id to act as (default: the first registered user)
    #[arg(short, long)]
    user: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a user and create their feed documents
    Init {
        username: String,
        /// Public link of the feed (default: derived from feed.public_url)
        #[arg(long)]
        link: Option<String>,
    },

    /// Publish a status
    Post { text: String },

    /// Publish a reply
    Reply {
        text: String,
        #[arg(long)]
        to_status: String,
        #[arg(long)]
        to_user: String,
        #[arg(long)]
        to_link: String,
    },

    /// Publish a repost
    Repost {
        text: String,
        #[arg(long)]
        status_id: String,
        /// Publication date of the reposted status (RFC 2822)
        #[arg(long)]
        pubdate: String,
        #[arg(long)]
        user_id: String,
        #[arg(long)]
        user_link: String,
    },

    /// Delete one of your posts
    Delete { guid: String },

    /// Follow a feed (id and name are read from the feed if omitted)
    Follow {
        link: String,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },

    /// Stop following a feed
    Unfollow { link: String },

    /// Block a feed, dropping any follow of it
    Block {
        link: String,
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },

    /// Unblock a feed
    Unblock { link: String },

    /// List followed feeds
    Follows,

    /// List blocked feeds
    Blocks,

    /// Show your own posts
    Timeline {
        /// Guid to page from
        #[arg(long)]
        start: Option<String>,
        /// Posts to show; negative pages backwards from --start
        #[arg(short = 'n', long = "count", allow_negative_numbers = true)]
        n: Option<i64>,
    },

    /// Show your home timeline
    Home {
        #[arg(long)]
        start: Option<String>,
        #[arg(short = 'n', long = "count", allow_negative_numbers = true)]
        n: Option<i64>,
    },

    /// Fetch and show a remote feed
    Show {
        link: String,
        #[arg(short = 'n', long = "count")]
        n: Option<i64>,
    },

    /// Crawl followed feeds
    Crawl {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },

    /// Validate the configuration file
    Validate,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn print_posts(posts: &[Post]) {
    if posts.is_empty() {
        println!("(no posts)");
    }
    for post in posts {
        println!("{}  {}", post.pubdate.to_rfc2822(), post.guid);
        println!("    {}", post.description);
    }
}

fn print_sources(sources: &[Source]) {
    if sources.is_empty() {
        println!("(none)");
    }
    for source in sources {
        println!("{}  {}  {}", source.user_name, source.user_id, source.user_link);
    }
}

/// Find the listed source with `link`.
fn find_listed(sources: Vec<Source>, link: &str) -> Result<Source> {
    sources
        .into_iter()
        .find(|s| s.user_link == link)
        .ok_or_else(|| AppError::not_found(link))
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Command::Validate = cli.command {
        pipeline::run_validate(&cli.config)?;
        return Ok(());
    }

    let config = Config::load_or_default(&cli.config);
    let storage_dir = cli
        .storage_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(&config.feed.storage_dir));
    log::debug!("Using storage directory {}", storage_dir.display());

    let config = Arc::new(config);
    let store = Arc::new(FeedStore::new(&storage_dir, &config.feed)?);
    let settings: Arc<dyn SettingsStore> =
        Arc::new(JsonFileSettings::new(storage_dir.join("settings.json")));
    let cache = Arc::new(MemoryCache::new());
    let page_size = config.timeline.page_size as i64;

    if let Command::Init { username, link } = &cli.command {
        let account = Account::create(store, settings, username, link.clone()).await?;
        println!("Created {} with id {}", username, account.user_id());
        println!("Feed: {}", account.link());
        return Ok(());
    }

    let account = match &cli.user {
        Some(user_id) => Account::open(Arc::clone(&store), settings, user_id).await?,
        None => Account::open_default(Arc::clone(&store), settings).await?,
    }
    .with_cache(cache.clone())
    .with_timeline_cap(config.timeline.cache_cap);

    let on_demand = || -> Result<OnDemandCrawler> {
        Ok(OnDemandCrawler::new(
            Arc::new(HttpFetcher::new(&config.crawler)?),
            store.codec().clone(),
            config.crawler.clone(),
        ))
    };

    match cli.command {
        Command::Init { .. } | Command::Validate => {}

        Command::Post { text } => {
            let post = account.post(&text).await?;
            println!("Posted {}", post.guid);
        }

        Command::Reply {
            text,
            to_status,
            to_user,
            to_link,
        } => {
            let to = ReplyFields {
                in_reply_to_status_id: to_status,
                in_reply_to_user_id: to_user,
                in_reply_to_user_link: to_link,
            };
            let post = account.reply(&text, to).await?;
            println!("Replied {}", post.guid);
        }

        Command::Repost {
            text,
            status_id,
            pubdate,
            user_id,
            user_link,
        } => {
            let of = RepostFields {
                reposted_status_id: status_id,
                reposted_status_pubdate: parse_date(&pubdate)?,
                reposted_status_user_id: user_id,
                reposted_status_user_link: user_link,
            };
            let post = account.repost(&text, of).await?;
            println!("Reposted as {}", post.guid);
        }

        Command::Delete { guid } => {
            account.delete_post(&guid).await?;
            println!("Deleted {}", guid);
        }

        Command::Follow {
            link,
            user_id,
            name,
        } => {
            let source = match (user_id, name) {
                (Some(user_id), Some(name)) => {
                    let source = Source::new(user_id, name, &link);
                    account.follow(source.clone()).await?;
                    source
                }
                _ => account.follow_link(&on_demand()?, &link).await?,
            };
            println!("Following {} ({})", source.user_name, source.user_link);
        }

        Command::Unfollow { link } => {
            let source = find_listed(account.follows().await?, &link)?;
            account.unfollow(&source).await?;
            println!("Unfollowed {}", link);
        }

        Command::Block {
            link,
            user_id,
            name,
        } => {
            let source = match (user_id, name) {
                (Some(user_id), Some(name)) => Source::new(user_id, name, &link),
                _ => match find_listed(account.follows().await?, &link) {
                    Ok(source) => source,
                    Err(_) => {
                        let feed = on_demand()?.get_feed(&link).await?;
                        Source::new(
                            feed.info.user_id.unwrap_or_default(),
                            feed.info.username.unwrap_or_default(),
                            &link,
                        )
                    }
                },
            };
            account.block(source).await?;
            println!("Blocked {}", link);
        }

        Command::Unblock { link } => {
            let source = find_listed(account.blocks().await?, &link)?;
            account.unblock(&source).await?;
            println!("Unblocked {}", link);
        }

        Command::Follows => print_sources(&account.follows().await?),

        Command::Blocks => print_sources(&account.blocks().await?),

        Command::Timeline { start, n } => {
            let posts = account
                .user_timeline(start.as_deref(), n.unwrap_or(page_size))
                .await?;
            print_posts(&posts);
        }

        Command::Home { start, n } => {
            let home = account
                .home_timeline(&on_demand()?, start.as_deref(), n.unwrap_or(page_size))
                .await?;
            for link in &home.failed {
                log::warn!("Could not reach {}; showing what we have", link);
            }
            print_posts(&home.posts);
        }

        Command::Show { link, n } => {
            let feed = on_demand()?.get_feed(&link).await?;
            if let Some(name) = &feed.info.username {
                println!("{} ({})", name, link);
            }
            if !feed.rejected.is_empty() {
                log::warn!("{} malformed items skipped", feed.rejected.len());
            }
            let timeline = Timeline::from_posts(feed.items, usize::MAX);
            print_posts(&timeline.fetch_top(n.unwrap_or(page_size))?);
        }

        Command::Crawl { once } => {
            let account = Arc::new(account);
            let report =
                pipeline::run_crawler(Arc::clone(&config), Arc::clone(&store), account, cache, once)
                    .await?;
            if let Some(report) = report {
                println!(
                    "{} sources: {} ok, {} failed, {} new posts",
                    report.sources,
                    report.succeeded,
                    report.failed.len(),
                    report.new_items
                );
            }
        }
    }

    Ok(())
}
