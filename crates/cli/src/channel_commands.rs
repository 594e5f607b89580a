//! CLI subcommands for DingTalk account configuration.

use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
};

use {
    anyhow::{Result, anyhow},
    clap::{Args, Subcommand},
    dingbot_dingtalk::{
        accounts::DEFAULT_ACCOUNT_ID,
        setup::{
            apply_account_config, apply_onboarding, delete_account, describe_account,
            format_allow_from, format_group_allow_from, list_account_ids, set_account_enabled,
        },
    },
    serde_json::{Map, Value},
};

#[derive(Subcommand)]
pub enum ChannelAction {
    /// Add or update a DingTalk account.
    Setup(SetupArgs),
    /// Enable an account.
    Enable {
        #[arg(long, default_value = DEFAULT_ACCOUNT_ID)]
        account: String,
    },
    /// Disable an account without removing its config.
    Disable {
        #[arg(long, default_value = DEFAULT_ACCOUNT_ID)]
        account: String,
    },
    /// Remove an account from the config file.
    Remove {
        #[arg(long, default_value = DEFAULT_ACCOUNT_ID)]
        account: String,
        /// Skip the confirmation prompt.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

#[derive(Args, Clone)]
pub struct SetupArgs {
    /// Account key, `default` writes the top-level section.
    #[arg(long, default_value = DEFAULT_ACCOUNT_ID)]
    account: String,
    /// DingTalk app key (client ID).
    #[arg(long, env = "DINGTALK_APP_KEY")]
    app_key: Option<String>,
    /// DingTalk app secret (client secret).
    #[arg(long, env = "DINGTALK_APP_SECRET", hide_env_values = true)]
    app_secret: Option<String>,
    /// Robot code, when it differs from the app key.
    #[arg(long)]
    robot_code: Option<String>,
    /// DM policy: open, pairing or allowlist.
    #[arg(long)]
    dm_policy: Option<String>,
    /// Group policy: open, allowlist or disabled.
    #[arg(long)]
    group_policy: Option<String>,
    /// User IDs allowed to DM the bot (repeatable).
    #[arg(long = "allow-from")]
    allow_from: Vec<String>,
    /// Conversation IDs allowed in groups (repeatable).
    #[arg(long = "group-allow-from")]
    group_allow_from: Vec<String>,
    /// Print the resulting config instead of writing it.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

/// Load the config tree for editing, from `path` or the standard locations.
pub fn load_for_edit(path: Option<&Path>) -> Result<(PathBuf, Value)> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(dingbot_config::find_or_default_config_path);
    let value = if path.exists() {
        dingbot_config::load_config_value(&path)?
    } else {
        Value::Null
    };
    Ok((path, value))
}

pub fn handle_channels(action: ChannelAction, config_path: Option<&Path>) -> Result<()> {
    let (path, mut root) = load_for_edit(config_path)?;
    match action {
        ChannelAction::Setup(args) => return run_setup(args, &path, root),
        ChannelAction::Enable { account } => {
            ensure_listed(&root, &account)?;
            set_account_enabled(&mut root, &account, true)?;
            println!("Enabled DingTalk account '{account}'.");
        },
        ChannelAction::Disable { account } => {
            ensure_listed(&root, &account)?;
            set_account_enabled(&mut root, &account, false)?;
            println!("Disabled DingTalk account '{account}'.");
        },
        ChannelAction::Remove { account, force } => {
            if !force && !prompt_yes_no(&format!("Remove DingTalk account '{account}'"), false)? {
                println!("Aborted. No changes written.");
                return Ok(());
            }
            if !delete_account(&mut root, &account) {
                anyhow::bail!("DingTalk account '{account}' not found");
            }
            println!("Removed DingTalk account '{account}'.");
        },
    }
    dingbot_config::save_config_value(&path, &root)?;
    println!("Saved {}", path.display());
    Ok(())
}

fn ensure_listed(root: &Value, account_id: &str) -> Result<()> {
    if list_account_ids(root).iter().any(|id| id == account_id) {
        Ok(())
    } else {
        Err(anyhow!("DingTalk account '{account_id}' not found"))
    }
}

fn run_setup(args: SetupArgs, path: &Path, mut root: Value) -> Result<()> {
    validate_account_id(&args.account)?;
    let app_key = required_value(args.app_key, "DingTalk app key (client ID)")?;
    let app_secret = required_value(args.app_secret, "DingTalk app secret")?;

    if args.account == DEFAULT_ACCOUNT_ID {
        let values: HashMap<String, String> = [
            ("appKey".to_string(), app_key),
            ("appSecret".to_string(), app_secret),
        ]
        .into_iter()
        .collect();
        root = apply_onboarding(root, &values)?;
    } else {
        let mut patch = Map::new();
        patch.insert("appKey".into(), Value::String(app_key));
        patch.insert("appSecret".into(), Value::String(app_secret));
        apply_account_config(&mut root, &args.account, Value::Object(patch))?;
    }

    let mut policy = Map::new();
    if let Some(robot_code) = args.robot_code {
        policy.insert("robotCode".into(), Value::String(robot_code));
    }
    if let Some(dm_policy) = args.dm_policy {
        policy.insert("dmPolicy".into(), Value::String(dm_policy));
    }
    if let Some(group_policy) = args.group_policy {
        policy.insert("groupPolicy".into(), Value::String(group_policy));
    }
    if !args.allow_from.is_empty() {
        policy.insert("allowFrom".into(), format_allow_from(&args.allow_from).into());
    }
    if !args.group_allow_from.is_empty() {
        policy.insert(
            "groupAllowFrom".into(),
            format_group_allow_from(&args.group_allow_from).into(),
        );
    }
    if !policy.is_empty() {
        apply_account_config(&mut root, &args.account, Value::Object(policy))?;
    }

    let description = describe_account(&root, &args.account)?;
    println!("{}", serde_json::to_string_pretty(&description)?);

    if args.dry_run {
        println!("Dry run enabled. Generated config:");
        println!("{}", serde_json::to_string_pretty(&root)?);
        return Ok(());
    }

    dingbot_config::save_config_value(path, &root)?;
    println!("Saved DingTalk account '{}' to {}", args.account, path.display());
    println!("Start it with `dingbot run`.");
    Ok(())
}

fn required_value(provided: Option<String>, prompt: &str) -> Result<String> {
    match provided {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => prompt_required(prompt, None),
    }
}

fn prompt_required(prompt: &str, default: Option<&str>) -> Result<String> {
    let mut stdout = std::io::stdout();
    match default {
        Some(value) if !value.trim().is_empty() => write!(stdout, "{prompt} [{value}]: ")?,
        _ => write!(stdout, "{prompt}: ")?,
    }
    stdout.flush()?;

    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return default
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("{prompt} is required"));
    }
    Ok(trimmed.to_string())
}

fn prompt_yes_no(prompt: &str, default_yes: bool) -> Result<bool> {
    loop {
        let (default, hint) = if default_yes {
            ("y", "Y/n")
        } else {
            ("n", "y/N")
        };
        let answer = prompt_required(&format!("{prompt} [{hint}]"), Some(default))?;
        match answer.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => println!("Please answer with 'y' or 'n'."),
        }
    }
}

fn validate_account_id(account_id: &str) -> Result<()> {
    if account_id.trim().is_empty() {
        anyhow::bail!("account is required");
    }
    if !account_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        anyhow::bail!(
            "account contains unsupported characters. Use only letters, numbers, '-', '_', '.'"
        );
    }
    Ok(())
}
