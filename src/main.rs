use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cuthist::clipboard::{ClipboardSource, SystemClipboard};
use cuthist::config::{AppPaths, ConfigProvider, ConfigSource, JsonConfigFile, RetentionConfig};
use cuthist::errors::{CutError, Result};
use cuthist::hotkey::{self, HotkeyRegistrar, SystemHotkeys, WindowControl};
use cuthist::image_bridge::ClipboardImageProcessor;
use cuthist::instance::{self, InstanceLock};
use cuthist::pipeline::Pipeline;
use cuthist::storage::HistoryStore;
use cuthist::storage::models::{HistoryItem, ImageItem, TextItem};
use cuthist::storage::sqlite::SqliteStore;
use cuthist::watcher::ConfigFileWatcher;

#[derive(Parser)]
#[command(name = "cuthist", version, about = "Clipboard history with bounded retention")]
struct Cli {
    /// Output results as JSON
    #[arg(short = 'j', long = "json", global = true)]
    json: bool,

    /// Data directory (default: ~/.cuthist)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the clipboard in the foreground
    Run {
        /// Do not register the window toggle hotkey
        #[arg(long)]
        no_hotkey: bool,

        /// Poll period in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },

    /// List stored history, newest first
    List {
        /// List images instead of text
        #[arg(short, long)]
        images: bool,

        /// Maximum number of entries to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Copy an item back to the clipboard
    Copy {
        /// Item ID or unique prefix
        id: String,

        /// Look the ID up in image history
        #[arg(short, long)]
        image: bool,
    },

    /// Remove an item from history
    Remove {
        /// Item ID or unique prefix
        id: String,

        /// Look the ID up in image history
        #[arg(short, long)]
        image: bool,
    },

    /// Show watcher and history status
    Status,

    /// Show or change retention limits
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the active limits
    Show,
    /// Update limits; a running watcher picks them up
    Set {
        /// Maximum stored text items
        #[arg(long)]
        max_text: Option<u32>,

        /// Maximum stored images
        #[arg(long)]
        max_images: Option<u32>,
    },
}

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Serialize)]
struct StatusResponse {
    success: bool,
    message: String,
}

fn main() {
    let cli = Cli::parse();
    let json = cli.json;

    let default_level = match cli.command {
        Some(Commands::Run { .. }) => "info",
        _ => "warn",
    };
    init_logging(default_level);

    if let Err(e) = run(cli) {
        if json {
            eprintln!("{}", serde_json::json!({"error": e.to_string()}));
        } else {
            eprintln!("error: {}", e);
        }
        process::exit(1);
    }
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let paths = match cli.data_dir {
        Some(dir) => AppPaths::from_base(dir),
        None => AppPaths::new()?,
    };
    let json = cli.json;

    match cli.command {
        None => cmd_list(&paths, false, 10, json),
        Some(Commands::Run {
            no_hotkey,
            interval_ms,
        }) => cmd_run(&paths, !no_hotkey, Duration::from_millis(interval_ms.max(50)), json),
        Some(Commands::List { images, limit }) => cmd_list(&paths, images, limit, json),
        Some(Commands::Copy { id, image }) => cmd_copy(&paths, &id, image, json),
        Some(Commands::Remove { id, image }) => cmd_remove(&paths, &id, image, json),
        Some(Commands::Status) => cmd_status(&paths, json),
        Some(Commands::Config { action }) => cmd_config(&paths, action, json),
    }
}

fn open_store(paths: &AppPaths) -> SqliteStore {
    let config = Arc::new(ConfigProvider::new());
    config.load(&JsonConfigFile::new(&paths.config_file));
    SqliteStore::new(&paths.db_path, config)
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("error: {}", e),
    }
}

fn report(json: bool, success: bool, message: String) {
    if json {
        print_json(&StatusResponse { success, message });
    } else {
        println!("{}", message);
    }
}

// --- run ---

/// Stand-in for the history window: tracks visibility and, while shown,
/// prints each appended item.
struct HeadlessWindow {
    minimized: AtomicBool,
    json: bool,
}

impl HeadlessWindow {
    fn new(json: bool) -> Self {
        Self {
            minimized: AtomicBool::new(false),
            json,
        }
    }

    fn append(&self, item: &HistoryItem) {
        if self.is_minimized() {
            return;
        }
        if self.json {
            print_json(item);
            return;
        }
        match item {
            HistoryItem::Text(text) => print_text_row(text),
            HistoryItem::Image(image) => print_image_row(image),
        }
    }
}

impl WindowControl for HeadlessWindow {
    fn is_minimized(&self) -> bool {
        self.minimized.load(Ordering::SeqCst)
    }

    fn restore_and_focus(&self) {
        self.minimized.store(false, Ordering::SeqCst);
        info!("history view shown");
    }

    fn minimize(&self) {
        self.minimized.store(true, Ordering::SeqCst);
        info!("history view hidden");
    }
}

fn register_hotkey(window: Arc<HeadlessWindow>) -> Option<HotkeyRegistrar<SystemHotkeys>> {
    if !hotkey::LISTENER_SUPPORTED {
        warn!(
            "{} is not supported on this platform, running without it",
            hotkey::TOGGLE_SHORTCUT
        );
        return None;
    }
    let backend = match SystemHotkeys::new() {
        Ok(backend) => backend,
        Err(e) => {
            warn!("hotkey unavailable: {}", e);
            return None;
        }
    };
    let mut registrar = HotkeyRegistrar::new(backend, hotkey::toggle_hotkey());
    match registrar.init() {
        Ok(id) => {
            hotkey::spawn_listener(id, window);
            Some(registrar)
        }
        Err(e) => {
            warn!("failed to register {}: {}", hotkey::TOGGLE_SHORTCUT, e);
            None
        }
    }
}

fn cmd_run(paths: &AppPaths, with_hotkey: bool, interval: Duration, json: bool) -> Result<()> {
    let _lock = InstanceLock::acquire(&paths.pid_file)?;

    let config_file = JsonConfigFile::new(&paths.config_file);
    let config = Arc::new(ConfigProvider::new());
    config.load(&config_file);
    let store = Arc::new(SqliteStore::new(&paths.db_path, Arc::clone(&config)));

    let window = Arc::new(HeadlessWindow::new(json));
    let pipeline = Arc::new(
        Pipeline::new(
            store,
            Arc::new(SystemClipboard),
            Arc::new(ClipboardImageProcessor::new()),
        )
        .with_interval(interval),
    );
    let view = Arc::clone(&window);
    pipeline.notifier().attach(move |item| view.append(item));

    // Dropping the registrar releases the OS registration.
    let hotkeys = if with_hotkey {
        register_hotkey(Arc::clone(&window))
    } else {
        None
    };

    // The runtime lives on a worker thread so the main thread is free to
    // turn the run loop that delivers hotkey events.
    let done = Arc::new(AtomicBool::new(false));
    let finished = Arc::clone(&done);
    let watcher = thread::Builder::new()
        .name("cuthist-watch".into())
        .spawn(move || {
            let result = watch_clipboard(pipeline, config, config_file);
            finished.store(true, Ordering::Release);
            result
        })?;

    if hotkeys.is_some() {
        hotkey::pump_main_loop(&done);
    }
    let result = watcher
        .join()
        .map_err(|_| CutError::Task("clipboard watcher thread panicked".into()))?;
    drop(hotkeys);
    result
}

fn watch_clipboard(
    pipeline: Arc<Pipeline>,
    config: Arc<ConfigProvider>,
    config_file: JsonConfigFile,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async {
        let (updates, pushed) = tokio::sync::mpsc::unbounded_channel();
        let _subscription = config.subscribe(pushed);
        let _watcher = match ConfigFileWatcher::spawn(config_file, updates) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("config changes will not be picked up: {}", e);
                None
            }
        };

        let interrupted = Arc::new(tokio::sync::Notify::new());
        let signal = Arc::clone(&interrupted);
        ctrlc::set_handler(move || signal.notify_one())
            .map_err(|e| CutError::Io(std::io::Error::other(e.to_string())))?;

        pipeline.start();
        info!(pid = std::process::id(), "watching clipboard");
        interrupted.notified().await;

        info!("shutting down");
        pipeline.shutdown().await;
        Ok::<(), CutError>(())
    });

    // A hung image capture must not hold the process open.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

// --- history ---

fn resolve_id<'a>(ids: impl Iterator<Item = &'a str>, prefix: &str) -> Result<String> {
    let matches: Vec<&str> = ids.filter(|id| id.starts_with(prefix)).collect();
    match matches.as_slice() {
        [id] => Ok(id.to_string()),
        [] => Err(CutError::NotFound(format!("no item with id {}", prefix))),
        _ => Err(CutError::InvalidInput(format!(
            "id prefix {} matches {} items",
            prefix,
            matches.len()
        ))),
    }
}

fn find_text(store: &SqliteStore, id: &str) -> Result<TextItem> {
    match store.get_text_item(id) {
        Err(CutError::NotFound(_)) => {
            let items = store.list_text_items()?;
            let full = resolve_id(items.iter().map(|i| i.id.as_str()), id)?;
            store.get_text_item(&full)
        }
        other => other,
    }
}

fn find_image(store: &SqliteStore, id: &str) -> Result<ImageItem> {
    match store.get_image_item(id) {
        Err(CutError::NotFound(_)) => {
            let items = store.list_image_items()?;
            let full = resolve_id(items.iter().map(|i| i.id.as_str()), id)?;
            store.get_image_item(&full)
        }
        other => other,
    }
}

fn cmd_list(paths: &AppPaths, images: bool, limit: usize, json: bool) -> Result<()> {
    let store = open_store(paths);

    if images {
        let items: Vec<ImageItem> = store.list_image_items()?.into_iter().take(limit).collect();
        if json {
            print_json(&items);
        } else if items.is_empty() {
            println!("No images found.");
        } else {
            items.iter().for_each(print_image_row);
        }
        return Ok(());
    }

    let items: Vec<TextItem> = store.list_text_items()?.into_iter().take(limit).collect();
    if json {
        print_json(&items);
    } else if items.is_empty() {
        println!("No clips found.");
    } else {
        items.iter().for_each(print_text_row);
    }
    Ok(())
}

fn cmd_copy(paths: &AppPaths, id: &str, image: bool, json: bool) -> Result<()> {
    let store = open_store(paths);
    let clipboard = SystemClipboard;

    let message = if image {
        let item = find_image(&store, id)?;
        clipboard.write_image(&item.content)?;
        format!("Copied image {} to clipboard.", short_id(&item.id))
    } else {
        let item = find_text(&store, id)?;
        clipboard.write_text(&item.content)?;
        format!("Copied clip {} to clipboard.", short_id(&item.id))
    };

    report(json, true, message);
    Ok(())
}

fn cmd_remove(paths: &AppPaths, id: &str, image: bool, json: bool) -> Result<()> {
    let store = open_store(paths);

    let full = if image {
        find_image(&store, id).map(|item| item.id)
    } else {
        find_text(&store, id).map(|item| item.id)
    };
    let removed = match full {
        Ok(full) if image => store.remove_image_item(&full),
        Ok(full) => store.remove_text_item(&full),
        Err(CutError::NotFound(_)) => false,
        Err(e) => return Err(e),
    };

    let message = if removed {
        format!("Removed {}.", id)
    } else {
        format!("Item {} not found.", id)
    };
    report(json, removed, message);
    Ok(())
}

fn cmd_status(paths: &AppPaths, json: bool) -> Result<()> {
    let store = open_store(paths);
    let counts = store.counts()?;
    let limits = JsonConfigFile::new(&paths.config_file)
        .fetch()
        .unwrap_or_default();
    let pid = instance::running_pid(&paths.pid_file)?;

    if json {
        print_json(&serde_json::json!({
            "running": pid.is_some(),
            "pid": pid,
            "text_items": counts.text_items,
            "image_items": counts.image_items,
            "max_text_history": limits.max_text_history,
            "max_image_history": limits.max_image_history,
        }));
        return Ok(());
    }

    println!("Clipboard History");
    println!("─────────────────");
    println!(
        "Text items:   {} / {}",
        counts.text_items, limits.max_text_history
    );
    println!(
        "Images:       {} / {}",
        counts.image_items, limits.max_image_history
    );
    println!("Database:     {}", paths.db_path.display());
    match pid {
        Some(pid) => println!("Watcher:      running (pid {})", pid),
        None => println!("Watcher:      not running"),
    }
    Ok(())
}

fn cmd_config(paths: &AppPaths, action: ConfigAction, json: bool) -> Result<()> {
    let file = JsonConfigFile::new(&paths.config_file);

    match action {
        ConfigAction::Show => {
            let provider = ConfigProvider::new();
            let config = provider.load(&file);
            if json {
                print_json(&config);
            } else {
                println!("max_text_history:  {}", config.max_text_history);
                println!("max_image_history: {}", config.max_image_history);
            }
            Ok(())
        }
        ConfigAction::Set {
            max_text,
            max_images,
        } => {
            let current = file.fetch().unwrap_or_default();
            let updated = RetentionConfig::new(
                max_text.unwrap_or(current.max_text_history),
                max_images.unwrap_or(current.max_image_history),
            );
            file.save(&updated)?;
            report(
                json,
                true,
                format!(
                    "Retention set to {} text items and {} images.",
                    updated.max_text_history, updated.max_image_history
                ),
            );
            Ok(())
        }
    }
}

// --- formatting ---

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn print_text_row(item: &TextItem) {
    let oneline = item.content.replace('\n', "\\n");
    println!(
        "{} {:>6}  {}",
        short_id(&item.id),
        format_age(item.create_time),
        truncate_chars(&oneline, 60)
    );
}

fn print_image_row(item: &ImageItem) {
    println!(
        "{} {:>6}  {}x{} image ({})",
        short_id(&item.id),
        format_age(item.create_time),
        item.width,
        item.height,
        format_bytes(item.size)
    );
}

fn format_age(dt: chrono::DateTime<Utc>) -> String {
    let dur = Utc::now() - dt;
    if dur.num_seconds() < 60 {
        "now".to_string()
    } else if dur.num_minutes() < 60 {
        format!("{}m", dur.num_minutes())
    } else if dur.num_hours() < 24 {
        format!("{}h", dur.num_hours())
    } else {
        format!("{}d", dur.num_days())
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    let mut chars = s.chars();
    let truncated: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{truncated}…")
    } else {
        truncated
    }
}
