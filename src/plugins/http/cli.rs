use crate::plugins::http::api::FinetuneParams;
use crate::plugins::transport::{normalize_base, DriverContext, DEFAULT_API_URL};
use clap::{Arg, ArgAction, ArgMatches, Command};

/// Global HTTP options shared by every subcommand.
pub fn augment_command(cmd: Command) -> Command {
    cmd.arg(
        Arg::new("api_url")
            .long("api-url")
            .help_heading("HTTP")
            .help("Backend base URL")
            .env("FINETUNE_API_URL")
            .default_value(DEFAULT_API_URL)
            .global(true)
            .num_args(1),
    )
    .arg(
        Arg::new("http_header")
            .long("header")
            .help_heading("HTTP")
            .help("Extra HTTP header (repeatable), e.g. --header 'Authorization: Bearer xxx'")
            .action(ArgAction::Append)
            .global(true)
            .num_args(1),
    )
    .arg(
        Arg::new("http_user_agent")
            .long("user-agent")
            .help_heading("HTTP")
            .help("HTTP User-Agent")
            .default_value("finetune-client/0.1")
            .global(true)
            .num_args(1),
    )
    .arg(
        Arg::new("http_timeout_secs")
            .long("timeout-secs")
            .help_heading("HTTP")
            .help("Timeout in seconds for request/response calls (not the processing stream)")
            .default_value("60")
            .global(true)
            .num_args(1),
    )
    .arg(
        Arg::new("http_connect_timeout_secs")
            .long("connect-timeout-secs")
            .help_heading("HTTP")
            .help("TCP connect timeout in seconds")
            .default_value("10")
            .global(true)
            .num_args(1),
    )
    .arg(
        Arg::new("upload_chunk_kb")
            .long("chunk-kb")
            .help_heading("HTTP")
            .help("Upload chunk size in KiB (granularity of upload progress)")
            .default_value("64")
            .global(true)
            .num_args(1),
    )
}

pub fn apply_matches(matches: &ArgMatches, ctx: &mut DriverContext) -> anyhow::Result<()> {
    if let Some(url) = matches.get_one::<String>("api_url") {
        ctx.base_url = normalize_base(url).map_err(|e| anyhow::anyhow!("invalid --api-url {}: {}", url, e))?;
    }
    if let Some(ua) = matches.get_one::<String>("http_user_agent") {
        ctx.user_agent = ua.clone();
    }
    if let Some(s) = matches.get_one::<String>("http_timeout_secs") {
        ctx.timeout_secs = s.parse()?;
    }
    if let Some(s) = matches.get_one::<String>("http_connect_timeout_secs") {
        ctx.connect_timeout_secs = s.parse()?;
    }
    if let Some(s) = matches.get_one::<String>("upload_chunk_kb") {
        let kb: usize = s.parse()?;
        ctx.upload_chunk_bytes = kb.max(1) * 1024;
    }

    if let Some(values) = matches.get_many::<String>("http_header") {
        for h in values {
            let (k, v) = h
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("invalid header format: {}", h))?;
            ctx.headers.insert(k.trim().to_string(), v.trim().to_string());
        }
    }

    Ok(())
}

pub fn finetune_args(cmd: Command) -> Command {
    let d = FinetuneParams::default();
    [
        ("epochs", "Training epochs (1-10)", d.epochs.to_string()),
        ("learning_rate", "Learning rate (1e-5 - 5e-4)", d.learning_rate.to_string()),
        ("batch_size", "Batch size (1-8)", d.batch_size.to_string()),
        ("gradient_accumulation", "Gradient accumulation steps (1-32)", d.gradient_accumulation.to_string()),
        ("max_length", "Max sequence length (256-4096)", d.max_length.to_string()),
        ("lora_r", "LoRA rank (4-64)", d.lora_r.to_string()),
        ("lora_alpha", "LoRA alpha (8-128)", d.lora_alpha.to_string()),
        ("lora_dropout", "LoRA dropout (0.0-0.3)", d.lora_dropout.to_string()),
    ]
    .into_iter()
    .fold(cmd, |c, (id, help, default)| {
        c.arg(
            Arg::new(id)
                .long(id.replace('_', "-"))
                .help_heading("Fine-tune")
                .help(help)
                .default_value(default)
                .num_args(1),
        )
    })
}

pub fn finetune_params(matches: &ArgMatches) -> anyhow::Result<FinetuneParams> {
    fn get<T: std::str::FromStr>(m: &ArgMatches, id: &str) -> anyhow::Result<T>
    where
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        let raw = m
            .get_one::<String>(id)
            .ok_or_else(|| anyhow::anyhow!("missing --{}", id.replace('_', "-")))?;
        Ok(raw.parse()?)
    }

    Ok(FinetuneParams {
        epochs: get(matches, "epochs")?,
        learning_rate: get(matches, "learning_rate")?,
        batch_size: get(matches, "batch_size")?,
        gradient_accumulation: get(matches, "gradient_accumulation")?,
        max_length: get(matches, "max_length")?,
        lora_r: get(matches, "lora_r")?,
        lora_alpha: get(matches, "lora_alpha")?,
        lora_dropout: get(matches, "lora_dropout")?,
    })
}
