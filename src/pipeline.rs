use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;

use crate::archiver::StoryArchiver;
use crate::cli::{ArchiveArgs, ScrapeArgs, TargetedArgs, ViewArgs};
use crate::crawl::{CrawlRequest, ListingCrawler};
use crate::formats::TargetDescriptor;
use crate::ledger::FailureLedger;
use crate::platform::{Credentials, HttpPlatformClient, PlatformClient, PlatformConfig};
use crate::resolve::IdentifierPolicy;
use crate::retry::RetryPolicy;
use crate::target_list::SkipSet;
use crate::view::RenderOptions;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Archives targets one at a time, recording failures in the ledger.
pub struct ArchiveSession {
    archiver: StoryArchiver,
    ledger: FailureLedger,
    download_images: bool,
    delay: Duration,
}

impl ArchiveSession {
    pub fn new(
        archiver: StoryArchiver,
        ledger: FailureLedger,
        download_images: bool,
        delay: Duration,
    ) -> Self {
        Self {
            archiver,
            ledger,
            download_images,
            delay,
        }
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    /// A story failure is counted and recorded; only an unwritable ledger is
    /// returned as an error.
    pub async fn archive_one(
        &self,
        target: &TargetDescriptor,
        report: &mut BatchReport,
    ) -> anyhow::Result<()> {
        if report.total() > 0 && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        tracing::info!(
            story_id = %target.story_id,
            user = ?target.user,
            done = report.total(),
            "archiving story"
        );

        match self.archiver.archive(target, self.download_images).await {
            Ok(_) => report.succeeded += 1,
            Err(failure) => {
                report.failed += 1;
                self.ledger
                    .record(&target.story_id, &failure.to_string())
                    .context("record fat quest")?;
            }
        }
        Ok(())
    }

    pub async fn archive_targets<I>(&self, targets: I) -> anyhow::Result<BatchReport>
    where
        I: IntoIterator<Item = TargetDescriptor>,
    {
        let mut report = BatchReport::default();
        for target in targets {
            self.archive_one(&target, &mut report).await?;
        }
        Ok(report)
    }

    /// Pulls descriptors from the crawler only as fast as they are archived.
    pub async fn archive_crawl(
        &self,
        crawler: &mut ListingCrawler<'_>,
    ) -> anyhow::Result<BatchReport> {
        let mut report = BatchReport::default();
        loop {
            let target = match crawler.next().await {
                Ok(Some(target)) => target,
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(
                        succeeded = report.succeeded,
                        failed = report.failed,
                        "crawl aborted"
                    );
                    return Err(err);
                }
            };
            self.archive_one(&target, &mut report).await?;
        }
        Ok(report)
    }
}

pub async fn scrape(args: ScrapeArgs) -> anyhow::Result<()> {
    let started = Instant::now();
    let skip = match args.skip_list.as_deref() {
        Some(path) => SkipSet::load(Path::new(path))?,
        None => SkipSet::default(),
    };
    tracing::info!(skip = skip.len(), "loaded skip list");

    let client = connect(&args.archive).await?;
    let retry = retry_policy(&args.archive);
    let session = open_session(&args.archive, Arc::clone(&client))?;

    let request = CrawlRequest {
        sort: args.sort,
        start_page: args.start_page,
        end_page: args.end_page,
        skip_chat: args.archive.skip_chat,
    };
    let mut crawler = crate::crawl::crawl(client.as_ref(), request, &skip, retry);
    let report = session.archive_crawl(&mut crawler).await?;

    tracing::info!(
        succeeded = report.succeeded,
        failed = report.failed,
        pages = crawler.pages_fetched(),
        elapsed = ?started.elapsed(),
        "finished archiving"
    );
    Ok(())
}

pub async fn targeted(args: TargetedArgs) -> anyhow::Result<()> {
    let started = Instant::now();
    let raw_identifiers = match (args.target.as_deref(), args.target_list.as_deref()) {
        (Some(target), _) => vec![target.to_owned()],
        (None, Some(path)) => crate::target_list::read_identifier_list(Path::new(path))
            .context("load target list")?,
        (None, None) => anyhow::bail!("either --target or --target-list is required"),
    };

    let client = connect(&args.archive).await?;
    let retry = retry_policy(&args.archive);
    let session = open_session(&args.archive, Arc::clone(&client))?;

    let policy = IdentifierPolicy::new(args.author_prefix.clone());
    let resolution = crate::resolve::resolve(
        &raw_identifiers,
        client.as_ref(),
        &policy,
        args.archive.skip_chat,
        &retry,
    )
    .await;
    for failure in &resolution.failures {
        tracing::error!(
            identifier = %failure.identifier,
            reason = %failure.reason,
            "unable to resolve target"
        );
    }
    tracing::info!(
        targets = resolution.targets.len(),
        unresolved = resolution.failures.len(),
        "resolved targets"
    );

    let report = session.archive_targets(resolution.targets).await?;
    tracing::info!(
        succeeded = report.succeeded,
        failed = report.failed,
        elapsed = ?started.elapsed(),
        "finished archiving"
    );
    Ok(())
}

pub fn view(args: ViewArgs) -> anyhow::Result<()> {
    let input = match args.input.as_deref() {
        Some(input) => PathBuf::from(input),
        None => crate::inspect::latest_data_dir(Path::new("."))?
            .ok_or_else(|| anyhow::anyhow!("no --input given and no data-* directory found"))?,
    };
    let output_root = args.out.as_deref().map(PathBuf::from);
    let options = RenderOptions {
        page_bytes: args.page_bytes.max(1),
    };

    if args.single {
        if !crate::inspect::is_archive(&input) {
            anyhow::bail!("input path is not recognised as an archive: {}", input.display());
        }
        let summary = crate::view::render(&input, output_root.as_deref(), &options)
            .with_context(|| format!("render view: {}", input.display()))?;
        tracing::info!(out = %summary.out_dir.display(), pages = summary.pages, "built view");
        return Ok(());
    }

    let inputs = crate::inspect::discover_archives(&input)?;
    if inputs.is_empty() {
        anyhow::bail!("no archives detected under {}", input.display());
    }
    tracing::info!(count = inputs.len(), "detected archives");
    for input in &inputs {
        tracing::info!(archive = %input.display(), "detected archive");
    }

    let started = Instant::now();
    let report = render_views(&inputs, output_root.as_deref(), &options);
    tracing::info!(
        succeeded = report.succeeded,
        failed = report.failed,
        elapsed = ?started.elapsed(),
        "built all views"
    );
    Ok(())
}

/// Renders each archive independently; one broken archive never stops the rest.
pub fn render_views(
    inputs: &[PathBuf],
    output_root: Option<&Path>,
    options: &RenderOptions,
) -> BatchReport {
    let mut report = BatchReport::default();
    for input in inputs {
        match crate::view::render(input, output_root, options) {
            Ok(summary) => {
                report.succeeded += 1;
                tracing::info!(
                    archive = %input.display(),
                    out = %summary.out_dir.display(),
                    pages = summary.pages,
                    "built view"
                );
            }
            Err(err) => {
                report.failed += 1;
                tracing::error!(archive = %input.display(), ?err, "unable to build view");
            }
        }
    }
    report
}

fn retry_policy(args: &ArchiveArgs) -> RetryPolicy {
    RetryPolicy::new(args.retries, Duration::from_millis(args.retry_backoff_ms))
}

fn output_dir(args: &ArchiveArgs) -> PathBuf {
    match args.out.as_deref() {
        Some(out) => PathBuf::from(out),
        None => PathBuf::from(format!("data-{}", chrono::Utc::now().timestamp_millis())),
    }
}

fn open_session(
    args: &ArchiveArgs,
    client: Arc<dyn PlatformClient>,
) -> anyhow::Result<ArchiveSession> {
    let out_dir = output_dir(args);
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("create output dir: {}", out_dir.display()))?;
    tracing::info!(out = %out_dir.display(), "archiving into");

    let archiver = StoryArchiver::new(client, &out_dir, retry_policy(args));
    Ok(ArchiveSession::new(
        archiver,
        FailureLedger::in_dir(&out_dir),
        !args.no_images,
        Duration::from_millis(args.delay_ms),
    ))
}

async fn connect(args: &ArchiveArgs) -> anyhow::Result<Arc<dyn PlatformClient>> {
    let config = PlatformConfig::resolve(args.api_base.as_deref())?;
    tracing::debug!(base_url = %config.base_url, "platform gateway");
    let client = HttpPlatformClient::new(config)?;

    match Credentials::from_env() {
        Some(credentials) => {
            let session = client
                .login(&credentials.username, &credentials.password)
                .await
                .context("unable to login")?;
            tracing::info!(username = %session.username, "logged in");
        }
        None => tracing::warn!("no credentials in environment; continuing without login"),
    }
    Ok(Arc::new(client))
}
