use std::{num::NonZeroU32, path::PathBuf, time::Duration};

use anyhow::bail;
use clap::Parser;
use fake_user_agent::get_chrome_rua;
use segdl::{
    notify::LogNotifier,
    store::memory::MemoryJobStore,
    util::http::parse_header_line,
    DownloadConfig, JobOrchestratorBuilder, JobRequest, JobStatus,
};

#[derive(Parser, Debug, Clone)]
#[clap(name = "segdl", version)]
pub struct SegdlArgs {
    /// Debug output
    #[clap(long, alias = "debug")]
    verbose: bool,

    /// Threads limit
    #[clap(long)]
    threads: Option<NonZeroU32>,

    /// Retry limit, including the first attempt
    #[clap(long)]
    retries: Option<u32>,

    /// Timeout of one segment request, in seconds
    #[clap(long)]
    timeout: Option<u64>,

    /// HTTP Header used to download
    ///
    /// Custom header. eg. "User-Agent: xxxxx".
    #[clap(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Output file path
    ///
    /// Defaults to `<title>.mp4` in the output directory.
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Title of the video, used to name the output file
    #[clap(long)]
    title: Option<String>,

    /// Temporary file path
    #[clap(long, env = "TEMP")]
    temp_dir: Option<PathBuf>,

    /// JSON configuration file
    #[clap(long)]
    config: Option<PathBuf>,

    /// ffmpeg binary used to merge segments
    #[clap(long)]
    ffmpeg: Option<PathBuf>,

    /// Keep temporary files.
    #[clap(short, long)]
    keep: bool,

    /// m3u8 file path
    m3u8: String,
}

impl SegdlArgs {
    fn config(&self) -> anyhow::Result<DownloadConfig> {
        let mut config = match &self.config {
            Some(path) => DownloadConfig::from_json_file(path)?,
            None => DownloadConfig {
                user_agent: get_chrome_rua().to_string(),
                ..Default::default()
            },
        };

        if let Some(threads) = self.threads {
            config.concurrency = threads;
        }
        if let Some(retries) = self.retries {
            config.retries = retries;
        }
        if let Some(timeout) = self.timeout {
            config.segment_timeout = Duration::from_secs(timeout);
        }
        if let Some(temp_dir) = &self.temp_dir {
            if !temp_dir.exists() {
                log::error!("Temporary path directory does not exist.");
                bail!("Temporary path directory does not exist.");
            }
            let temp_dir = temp_dir.canonicalize()?;
            log::info!("Temporary path sets to {}", temp_dir.display());
            config.work_root = temp_dir;
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            config.ffmpeg = Some(ffmpeg.clone());
        }
        config.keep_segments |= self.keep;

        Ok(config)
    }

    fn request(&self) -> anyhow::Result<JobRequest> {
        let mut request = JobRequest::new(&self.m3u8);
        if let Some(title) = &self.title {
            request = request.title(title);
        }
        if let Some(output) = &self.output {
            request = request.output_path(output);
        }
        for header in &self.headers {
            let (key, value) = parse_header_line(header)?;
            request = request.header(key, value);
        }
        Ok(request)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = SegdlArgs::parse();

    let level = if args.verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let orchestrator = JobOrchestratorBuilder::with_config(args.config()?)
        .build(MemoryJobStore::new(), LogNotifier)?;
    let job = orchestrator.create_job(args.request()?).await?;
    let id = job.id;

    let ctrlc_handler = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            // wait for the first ctrl-c to stop downloader
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::info!("Ctrl-C received, stopping downloader.");
            if let Err(e) = orchestrator.cancel(id).await {
                tracing::warn!("Failed to cancel job: {e}");
            }

            // wait for the second ctrl-c to force exit
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl-C received again, force exit.");
                std::process::exit(1);
            }
        }
    });

    let job = orchestrator.start(id).await?;
    ctrlc_handler.abort();

    match job.status {
        JobStatus::Completed => {
            tracing::info!("Saved to {}", job.output_path.display());
            Ok(())
        }
        status => bail!(
            "Job {status}: {}",
            job.error_message.as_deref().unwrap_or("interrupted")
        ),
    }
}
