use clap::{Arg, ArgAction, ArgMatches, Command};
use finetune_client::core::events::{ProgressEvent, ProgressObserver};
use finetune_client::core::model::DocumentUpload;
use finetune_client::plugins::http::api::ApiClient;
use finetune_client::plugins::http::cli;
use finetune_client::{DriverContext, ProcessError, Processor};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn build_cli() -> Command {
    let process = Command::new("process")
        .about("Upload a document and follow its server-side processing")
        .arg(Arg::new("file").help("Document to upload (.pdf, .txt, .json, .jsonl)").required(true).num_args(1))
        .arg(model_arg())
        .arg(
            Arg::new("deadline_secs")
                .long("deadline-secs")
                .help("Cancel the upload if it has not finished after this many seconds")
                .num_args(1),
        )
        .arg(
            Arg::new("check_merged_model")
                .long("check-merged-model")
                .help("Refuse to upload unless the model is listed among merged models")
                .action(ArgAction::SetTrue),
        );

    let upload = Command::new("upload")
        .about("Upload a document for conversion without following progress")
        .arg(Arg::new("file").help("Document to upload").required(true).num_args(1));

    let finetune = cli::finetune_args(
        Command::new("finetune")
            .about("Start fine-tuning on the processed training data")
            .arg(model_arg()),
    );

    let download = Command::new("download-model")
        .about("Ask the backend to download a base model")
        .arg(Arg::new("name").help("Model repository id").required(true).num_args(1));

    let chat = Command::new("chat")
        .about("Send one prompt to a model")
        .arg(model_arg())
        .arg(Arg::new("prompt").required(true).num_args(1..));

    let models = Command::new("models").about("List merged models available for chat");

    cli::augment_command(
        Command::new("finetune-client")
            .about("Client for the document fine-tuning backend")
            .subcommand_required(true)
            .arg_required_else_help(true)
            .subcommand(process)
            .subcommand(upload)
            .subcommand(finetune)
            .subcommand(download)
            .subcommand(chat)
            .subcommand(models),
    )
}

fn model_arg() -> Arg {
    Arg::new("model").long("model").short('m').help("Model name").required(true).num_args(1)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("finetune_client=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = build_cli().get_matches();
    let mut ctx = DriverContext::default();
    cli::apply_matches(&matches, &mut ctx)?;

    match matches.subcommand() {
        Some(("process", m)) => process(m, ctx).await?,
        Some(("upload", m)) => {
            let path: PathBuf = required(m, "file")?.into();
            let document = DocumentUpload::from_path(&path).await?;
            let resp = ApiClient::new(ctx)?.upload_large(&document).await?;
            println!("{} {} -> {} ({} chars)", resp.status, resp.filename, resp.output_file, resp.size);
        }
        Some(("finetune", m)) => {
            let model = required(m, "model")?;
            let params = cli::finetune_params(m)?;
            let resp = ApiClient::new(ctx)?.finetune(model, &params).await?;
            println!("{} -> adapter at {}", resp.status, resp.adapter_path);
        }
        Some(("download-model", m)) => {
            let resp = ApiClient::new(ctx)?.download_model(required(m, "name")?).await?;
            println!("{} {} -> {}", resp.status, resp.model_name, resp.model_path);
        }
        Some(("chat", m)) => {
            let model = required(m, "model")?;
            let prompt = m
                .get_many::<String>("prompt")
                .map(|v| v.map(String::as_str).collect::<Vec<_>>().join(" "))
                .unwrap_or_default();
            println!("{}", ApiClient::new(ctx)?.chat(model, &prompt).await?);
        }
        Some(("models", _)) => {
            for name in ApiClient::new(ctx)?.list_models().await? {
                println!("{name}");
            }
        }
        _ => {}
    }

    Ok(())
}

fn required<'a>(m: &'a ArgMatches, id: &str) -> anyhow::Result<&'a str> {
    m.get_one::<String>(id)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("missing argument {}", id))
}

async fn process(m: &ArgMatches, ctx: DriverContext) -> anyhow::Result<()> {
    let path: PathBuf = required(m, "file")?.into();
    let model = required(m, "model")?;
    let deadline = m
        .get_one::<String>("deadline_secs")
        .map(|s| s.parse::<u64>())
        .transpose()?;

    ApiClient::new(ctx.clone())?
        .preflight_model(model, m.get_flag("check_merged_model"))
        .await?;

    let document = DocumentUpload::from_path(&path).await?;
    let processor = Processor::http(ctx)?;

    let mp = MultiProgress::new();
    let observer = BarObserver::new(&mp, &document.file_name)?;
    let handle = processor.start(document, model, observer)?;
    tracing::info!(task = %handle.id(), "task started");

    if let Some(secs) = deadline {
        let token = handle.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            token.cancel();
        });
    }

    match handle.wait().await {
        Ok(report) => {
            let _ = mp.println(format!(
                "done: {} pages {}/{}{}{}",
                report.file_name,
                report.pages.current,
                report.pages.total,
                if report.pages.is_done() { "" } else { " (not every page was reported)" },
                if report.implicit { " (stream closed without completion marker)" } else { "" },
            ));
            if let Some(msg) = report.message {
                let _ = mp.println(msg);
            }
            Ok(())
        }
        Err(ProcessError::Cancelled) if deadline.is_some() => {
            anyhow::bail!("processing did not finish within {}s", deadline.unwrap_or_default())
        }
        Err(e) => Err(e.into()),
    }
}

/// Upload bar plus page bar, in the same MultiProgress.
struct BarObserver {
    upload: ProgressBar,
    pages: ProgressBar,
}

impl BarObserver {
    fn new(mp: &MultiProgress, name: &str) -> anyhow::Result<Self> {
        let sty = ProgressStyle::with_template("{prefix:>10} {bar:40.cyan/blue} {pos:>4}/{len:4} {wide_msg}")?;

        let upload = mp.add(ProgressBar::new(100));
        upload.set_style(sty.clone());
        upload.set_prefix("upload");
        upload.set_message(format!("{name} (%)"));

        let pages = mp.add(ProgressBar::new(0));
        pages.set_style(sty);
        pages.set_prefix("pages");
        pages.set_message("waiting for server");

        Ok(Self { upload, pages })
    }
}

impl ProgressObserver for BarObserver {
    fn upload_progress(&mut self, percent: u8) {
        self.upload.set_position(percent as u64);
        if percent == 100 {
            self.upload.finish();
        }
    }

    fn page_progress(&mut self, current: u32, total: u32) {
        if self.pages.length() != Some(total as u64) {
            self.pages.set_length(total as u64);
        }
        self.pages.set_position(current as u64);
    }

    fn event(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::PageStart { page, .. } => self.pages.set_message(format!("parsing page {page}")),
            ProgressEvent::PageComplete { page, .. } => self.pages.set_message(format!("page {page} done")),
            ProgressEvent::Saving { message } => {
                self.pages.set_message(message.clone().unwrap_or_else(|| "saving".to_string()))
            }
            ProgressEvent::Complete { .. } => self.pages.finish_with_message("complete"),
            ProgressEvent::TotalPages { .. } => {}
        }
    }
}
