use anyhow::Result;
use clap::Parser;
use indicatif::MultiProgress;
use mailbot::cli::{self, Cli, Commands, ProgressReporter};
use mailbot::config::Config;
use mailbot::error::MailbotError;
use mailbot::llm::ProviderKind;
use std::io::Write;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

impl MultiProgressWriter {
    fn new(multi: Arc<MultiProgress>) -> Self {
        Self {
            multi,
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut buffer = self.lock();
        if !buffer.is_empty() {
            let msg = String::from_utf8_lossy(&buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter::new(Arc::clone(&self.multi))
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        display_error(&e);
        eprintln!("\nFor help, run: mailbot --help");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Several dependencies pull in rustls; pick the provider explicitly.
    // aws-lc-rs needs NASM/CMake on Windows, so use ring there.
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mailbot=debug,info"))
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("mailbot=info,warn,error"))
    };

    // Logs print above progress bars
    let multi_progress = Arc::new(MultiProgress::new());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(MultiProgressMakeWriter {
            multi: Arc::clone(&multi_progress),
        })
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    match &cli.command {
        Commands::Auth { force } => {
            tracing::info!("Authenticating with Gmail API...");
            let config = Config::load(&cli.config).await?;
            let account = cli::authenticate(&cli, &config, *force).await?;

            println!("Successfully authenticated with Gmail API");
            println!("Connected to account: {}", account);
            Ok(())
        }

        Commands::Analyze { .. } | Commands::Clean { .. } => {
            let config = Config::load(&cli.config).await?;
            let overrides = cli
                .command
                .run_overrides()
                .ok_or_else(|| anyhow::anyhow!("command does not process messages"))?;
            let skip_confirmation = matches!(cli.command, Commands::Clean { force: true, .. });

            let cancel = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&cancel);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, finishing current message...");
                    flag.store(true, Ordering::SeqCst);
                }
            });

            let reporter = ProgressReporter::with_multi_progress((*multi_progress).clone());
            let output = cli::run_classification(
                &cli,
                &config,
                &overrides,
                &reporter,
                cancel,
                skip_confirmation,
            )
            .await?;

            println!("{}", cli::format_summary(&output.summary));
            if let Some(path) = &output.results_path {
                println!("Results written to {}", path.display());
            }

            match output.error {
                Some(e) => Err(e.into()),
                None => Ok(()),
            }
        }

        Commands::SenderAnalysis {
            sender,
            limit,
            provider,
        } => {
            let config = Config::load(&cli.config).await?;
            let reporter = ProgressReporter::with_multi_progress((*multi_progress).clone());
            let analysis = cli::run_sender_analysis(
                &cli,
                &config,
                sender,
                *limit,
                provider.clone(),
                &reporter,
            )
            .await?;

            match analysis {
                Some(analysis) => println!("{}", cli::format_sender_analysis(&analysis)),
                None => println!("No emails found from {}", sender),
            }
            Ok(())
        }

        Commands::Providers => {
            let config = Config::load(&cli.config).await?;
            let selected = config
                .llm
                .provider
                .as_deref()
                .and_then(|name| name.parse::<ProviderKind>().ok());

            print!("{}", cli::format_providers(selected));
            if selected.is_none() {
                println!("\nNo provider selected. Set llm.provider in the config file or pass --provider.");
            }
            Ok(())
        }

        Commands::InitConfig { output, force } => {
            tracing::info!("Generating example configuration file");

            if output.exists() && !force {
                return Err(MailbotError::config(
                    output.display().to_string(),
                    "configuration file already exists. Use --force to overwrite.",
                )
                .into());
            }

            Config::create_example(output).await?;

            println!("Created example configuration file at: {:?}", output);
            println!("\nKey settings to review:");
            println!("  - llm.provider: groq, gemini, openai or anthropic");
            println!("  - run.confidence_threshold: minimum confidence before acting");
            println!("  - run.auto_delete: delete messages classified as JUNK");
            println!("  - run.promotional_folder: where PROMOTIONAL messages are moved");
            println!("  - run.dry_run: keep true until you trust the results");

            Ok(())
        }
    }
}

fn display_error(error: &anyhow::Error) {
    eprintln!("Error: {}", error);

    let mut cause = error.source();
    while let Some(e) = cause {
        eprintln!("  Caused by: {}", e);
        cause = e.source();
    }

    if let Some(err) = error.downcast_ref::<MailbotError>() {
        match err {
            MailbotError::AuthError(_) => {
                eprintln!("\nHint: Check the mailbox or LLM credentials.");
                eprintln!("      Gmail: run `mailbot auth --force`.");
                eprintln!("      Outlook: export a fresh MS_GRAPH_TOKEN.");
            }
            MailbotError::ConfigError { key, .. } => {
                eprintln!("\nHint: Check '{}' in your configuration or environment.", key);
                eprintln!("      Run: mailbot init-config --force");
            }
            MailbotError::RateLimitExceeded { retry_after } => {
                eprintln!("\nHint: The provider is rate limiting requests.");
                eprintln!("      Wait {} seconds and try again.", retry_after);
                eprintln!("      Consider lowering llm.max_concurrent_requests.");
            }
            MailbotError::UnsupportedOperation { provider, .. } => {
                eprintln!("\nHint: {} classifies one message per request.", provider);
                eprintln!("      Remove llm.batch_size or choose a batch-capable provider.");
            }
            MailbotError::ServerError { .. } | MailbotError::NetworkError(_) => {
                eprintln!("\nHint: This may be a temporary error. Try running the command again.");
            }
            _ => {}
        }
    }
}
