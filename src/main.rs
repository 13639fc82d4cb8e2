mod tui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use cmdk::config::{self, ConfigFile, ResolvedConfig};
use cmdk::storage::data_dir;

#[derive(Parser, Debug)]
#[command(
    name = "cmdk",
    about = "A command palette with an AI chat mode, in your terminal",
    long_about = None,
)]
struct Args {
    /// Profile to use from config file
    #[arg(short, long, env = "CMDK_PROFILE")]
    profile: Option<String>,

    /// Override the chat endpoint URL
    #[arg(long, env = "CMDK_ENDPOINT")]
    endpoint: Option<String>,

    /// Override API key
    #[arg(long, env = "CMDK_API_KEY")]
    api_key: Option<String>,

    /// Report a coarse pointer, so the palette always uses the mobile sheet
    #[arg(long, env = "CMDK_TOUCH")]
    touch: bool,

    /// Write a default config file to ~/.config/cmdk/config.toml and exit
    #[arg(long)]
    init: bool,

    /// List available profiles and exit
    #[arg(long)]
    profiles: bool,

    /// Generate shell completions and print to stdout (bash, zsh, fish, elvish)
    #[arg(long, value_name = "SHELL")]
    completions: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // ── --init ────────────────────────────────────────────────────────────────
    if args.init {
        let path = ConfigFile::write_default_if_missing()?;
        println!("Config written to: {}", path.display());
        println!("Edit it, then run: cmdk");
        return Ok(());
    }

    // ── --completions ─────────────────────────────────────────────────────────
    if let Some(shell_name) = &args.completions {
        return generate_completions(shell_name);
    }

    init_logging();

    let file = ConfigFile::load()?;

    // ── --profiles ────────────────────────────────────────────────────────────
    if args.profiles {
        print_profiles(&file);
        return Ok(());
    }

    let resolved = ResolvedConfig::resolve(
        &file,
        args.profile.as_deref(),
        args.endpoint.as_deref(),
        args.api_key.as_deref(),
    );
    tracing::info!(
        profile = %resolved.profile_name,
        chat = resolved.chat_endpoint.is_some(),
        config = %config::config_path().display(),
        "starting"
    );

    tui::run(resolved, args.touch).await
}

// ── Logging ───────────────────────────────────────────────────────────────────

/// The terminal belongs to the UI, so logs go to ~/.local/share/cmdk/cmdk.log.
/// Filter with CMDK_LOG (default `warn`). Logging is best-effort.
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let dir = data_dir();
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let Ok(file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("cmdk.log"))
    else {
        return;
    };

    let filter = EnvFilter::try_from_env("CMDK_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(file))
        .try_init();
}

// ── Profiles ──────────────────────────────────────────────────────────────────

fn print_profiles(file: &ConfigFile) {
    let mut entries: Vec<(&String, &config::Profile)> = file.profiles.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    println!();
    println!("  Profiles");
    for (name, p) in &entries {
        let marker = if **name == file.default_profile { " ←" } else { "" };
        println!("  {name}{marker}");
        println!(
            "    chat      {}",
            p.chat_endpoint.as_deref().unwrap_or("(disabled)")
        );
        println!("    commands  {}", p.commands.len());
        println!("    actions   {}", p.actions.len());
        println!("    history   {} (max {})", p.history_storage_key, p.max_conversations);
        println!();
    }
}

// ── Shell completions ─────────────────────────────────────────────────────────

fn generate_completions(shell_name: &str) -> Result<()> {
    use clap_complete::{Shell, generate};

    let shell: Shell = match shell_name.to_lowercase().as_str() {
        "bash"    => Shell::Bash,
        "zsh"     => Shell::Zsh,
        "fish"    => Shell::Fish,
        "elvish"  => Shell::Elvish,
        _ => anyhow::bail!("unknown shell: {shell_name} (supported: bash, zsh, fish, elvish)"),
    };

    let mut cmd = Args::command();
    generate(shell, &mut cmd, "cmdk", &mut std::io::stdout());
    Ok(())
}
