use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use log::LevelFilter;

use crate::client::DEFAULT_URL_TEMPLATE;
use crate::delay_manager::DelayPolicy;
use crate::record::{ListEncoding, RecordSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Multi-field details, seven workers.
    Details,
    /// Single description field, one worker.
    Descriptions,
}

/// Every tunable of one run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub schema: RecordSchema,
    pub input: PathBuf,
    pub output: PathBuf,
    pub checkpoint: PathBuf,
    pub url_template: String,
    pub user_agent: String,
    pub workers: usize,
    pub request_timeout: Duration,
    pub delays: DelayPolicy,
    /// Checkpoint is flushed every this many completions.
    pub checkpoint_every: usize,
    pub progress_every: usize,
    /// Only the first `limit` rows of the master list are used.
    pub limit: Option<usize>,
    pub list_encoding: ListEncoding,
}

impl PipelineConfig {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Details => PipelineConfig {
                schema: RecordSchema::Details,
                input: "game_descriptions.csv".into(),
                output: "game_details.csv".into(),
                checkpoint: "details_scraping_checkpoint.json".into(),
                url_template: DEFAULT_URL_TEMPLATE.to_string(),
                user_agent: default_user_agent(),
                workers: 7,
                request_timeout: Duration::from_secs(10),
                delays: DelayPolicy::default(),
                checkpoint_every: 30,
                progress_every: 50,
                limit: None,
                list_encoding: ListEncoding::default(),
            },
            Mode::Descriptions => PipelineConfig {
                schema: RecordSchema::Description,
                input: "boardgames_ranks.csv".into(),
                output: "game_descriptions.csv".into(),
                checkpoint: "descriptions_scraping_checkpoint.json".into(),
                url_template: DEFAULT_URL_TEMPLATE.to_string(),
                user_agent: default_user_agent(),
                workers: 1,
                request_timeout: Duration::from_secs(30),
                delays: DelayPolicy {
                    request_delay: Duration::from_millis(300),
                    ..DelayPolicy::default()
                },
                checkpoint_every: 1,
                progress_every: 20,
                limit: Some(30_000),
                list_encoding: ListEncoding::default(),
            },
        }
    }

    /// Clamps counters that must be at least one.
    pub fn normalized(mut self) -> Self {
        self.workers = self.workers.max(1);
        self.checkpoint_every = self.checkpoint_every.max(1);
        self.progress_every = self.progress_every.max(1);
        self.delays.max_attempts = self.delays.max_attempts.max(1);
        self
    }
}

fn default_user_agent() -> String {
    format!("bgg_scraper/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Parser)]
#[command(
    name = "bgg_scraper",
    version,
    about = "Resumable BoardGameGeek API scraper",
    long_about = "Fetch per-game data from the BoardGameGeek XML API into CSV. \
                  Interrupt at any point and run again to resume."
)]
pub struct Cli {
    #[arg(value_enum, default_value_t = Mode::Details, help = "What to scrape")]
    pub mode: Mode,
    #[arg(long, value_name = "PATH", help = "Master list CSV with id,name columns")]
    pub input: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Output CSV")]
    pub output: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "Checkpoint JSON file")]
    pub checkpoint: Option<PathBuf>,
    #[arg(long, help = "Concurrent workers")]
    pub workers: Option<usize>,
    #[arg(long = "delay-ms", help = "Per-worker delay before each request, in milliseconds")]
    pub delay_ms: Option<u64>,
    #[arg(long = "timeout-secs", help = "HTTP request timeout in seconds")]
    pub timeout_secs: Option<u64>,
    #[arg(long = "max-attempts", help = "Fetch attempts per game before it is abandoned")]
    pub max_attempts: Option<u32>,
    #[arg(long, help = "Only use the first N games of the input")]
    pub limit: Option<usize>,
    #[arg(long = "checkpoint-every", help = "Save the checkpoint every N completed games")]
    pub checkpoint_every: Option<usize>,
    #[arg(
        long = "list-encoding",
        value_name = "joined[:SEP]|json",
        help = "How list fields are stored"
    )]
    pub list_encoding: Option<ListEncoding>,
    #[arg(long = "url-template", help = "Request URL, {id} is replaced by the game id")]
    pub url_template: Option<String>,
    #[arg(long = "log-level", default_value = "info", help = "error, warn, info, debug or trace")]
    pub log_level: LevelFilter,
}

impl Cli {
    pub fn into_config(self) -> PipelineConfig {
        let mut config = PipelineConfig::for_mode(self.mode);
        if let Some(input) = self.input {
            config.input = input;
        }
        if let Some(output) = self.output {
            config.output = output;
        }
        if let Some(checkpoint) = self.checkpoint {
            config.checkpoint = checkpoint;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(ms) = self.delay_ms {
            config.delays.request_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = self.timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = self.max_attempts {
            config.delays.max_attempts = attempts;
        }
        if self.limit.is_some() {
            config.limit = self.limit;
        }
        if let Some(every) = self.checkpoint_every {
            config.checkpoint_every = every;
        }
        if let Some(encoding) = self.list_encoding {
            config.list_encoding = encoding;
        }
        if let Some(template) = self.url_template {
            config.url_template = template;
        }
        config.normalized()
    }
}
