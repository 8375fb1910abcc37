//! Top-level run orchestration: fetch, group, distribute, then per-session
//! download loops feeding either the downloads tree or the publish pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::{DomainError, Message, Severity};
use crate::shared::backoff::RetryPolicy;
use crate::shared::config::MirrorConfig;
use crate::shared::files;
use crate::usecases::coordinator::{PublishUnit, UploadCoordinator, UnitSink};
use crate::usecases::distributor::{distribute, DistributionSettings};
use crate::usecases::downloader::{DownloadMode, DownloadOutcome, MediaDownloader};
use crate::usecases::fetcher::MessageFetcher;
use crate::usecases::grouper::group_messages;
use crate::usecases::publisher::{PublisherSettings, StagedPublisher};
use crate::usecases::session_pool::{PooledSession, SessionPool};
use crate::usecases::stats::{RunReport, StatsCollector};
use crate::usecases::template::{TemplateDefinition, TemplateEngine, TemplateMode};

pub struct MirrorService {
    config: MirrorConfig,
    pool: Arc<SessionPool>,
    stats: Arc<StatsCollector>,
    cancel: CancellationToken,
}

impl MirrorService {
    pub fn new(
        config: MirrorConfig,
        pool: Arc<SessionPool>,
        stats: Arc<StatsCollector>,
        cancel: CancellationToken,
    ) -> Self {
        Self { config, pool, stats, cancel }
    }

    /// Run the configured workload to completion and produce the report the
    /// launcher maps to an exit code.
    pub async fn run(&self) -> Result<RunReport, DomainError> {
        let channel = self
            .config
            .source_channel
            .clone()
            .ok_or_else(|| DomainError::Config("source_channel is required".into()))?;
        let (start_id, end_id) = match (self.config.start_id, self.config.end_id) {
            (Some(start), Some(end)) => (start, end),
            _ => return Err(DomainError::Config("start_id and end_id are required".into())),
        };

        let sessions = self.pool.sessions();
        let fetcher =
            MessageFetcher::new(self.config.fetch_batch_size_or_default(), self.cancel.clone());
        let messages = fetcher.fetch_range(&sessions, &channel, start_id, end_id).await?;

        let media_messages: Vec<Message> =
            messages.into_iter().filter(Message::has_media).collect();
        if media_messages.is_empty() {
            info!("no media messages in the window, nothing to do");
            return Ok(self.stats.final_report(&self.pool));
        }
        self.stats.set_targeted(media_messages.len() as u64);

        let collection = group_messages(media_messages);
        let distribution = distribute(
            collection,
            &self.pool.session_names(),
            &DistributionSettings {
                largest_first: self.config.largest_groups_first_or_default(),
                max_imbalance_ratio: self.config.max_imbalance_ratio_or_default(),
            },
        )?;

        let reporter = self.stats.spawn_reporter(self.cancel.clone());

        if self.config.publish_enabled() {
            self.run_publish_pipeline(&channel, distribution).await?;
        } else {
            self.run_download_only(&channel, distribution).await?;
        }

        reporter.abort();
        if self.cancel.is_cancelled() {
            self.stats.mark_cancelled();
        }
        let report = self.stats.final_report(&self.pool);
        report.log_summary();
        Ok(report)
    }

    /// Download-only mode: everything lands in the per-channel downloads
    /// folder.
    async fn run_download_only(
        &self,
        channel: &str,
        distribution: crate::domain::Distribution,
    ) -> Result<(), DomainError> {
        let folder = self.derive_folder(channel).await;
        let mode = DownloadMode::Disk {
            base: PathBuf::from(self.config.download_dir_or_default()),
            folder,
        };
        self.run_downloads(channel, distribution, mode, None).await;
        Ok(())
    }

    /// Download + publish mode: memory downloads feed the bounded queue;
    /// consumers hand finished units to the staged publisher.
    async fn run_publish_pipeline(
        &self,
        channel: &str,
        distribution: crate::domain::Distribution,
    ) -> Result<(), DomainError> {
        let template = TemplateEngine::new(self.template_definition()?)?;
        let publisher = StagedPublisher::new(
            Arc::clone(&self.pool),
            template,
            PublisherSettings {
                targets: self.config.target_channels.clone(),
                batch_size: self.config.stage_batch_size_or_default(),
                preserve_structure: self.config.preserve_structure_or_default(),
                fanout_concurrency: self.config.fanout_concurrency_or_default(),
                cleanup_after_success: self.config.cleanup_after_success_or_default(),
                cleanup_after_failure: self.config.cleanup_after_failure_or_default(),
                ..Default::default()
            },
            RetryPolicy::from_settings(&self.config.retry),
            Arc::clone(&self.stats),
            self.cancel.clone(),
        );
        let coordinator = Arc::new(UploadCoordinator::new(
            Arc::clone(&publisher) as Arc<dyn UnitSink>,
            self.config.upload_queue_size_or_default(),
            self.config.upload_consumers_or_default(),
            self.cancel.clone(),
        ));
        coordinator.start();

        self.run_downloads(channel, distribution, DownloadMode::Memory, Some(&coordinator))
            .await;

        coordinator.shutdown().await;
        publisher.flush_all().await;
        Ok(())
    }

    fn template_definition(&self) -> Result<TemplateDefinition, DomainError> {
        if let Some(path) = self.config.template.file.as_deref() {
            return TemplateDefinition::from_json_file(std::path::Path::new(path));
        }
        let mode = match self.config.template.mode.as_deref() {
            None | Some("original") => TemplateMode::Original,
            Some("custom") => TemplateMode::Custom,
            Some(other) => {
                return Err(DomainError::Config(format!("unknown template mode: {other}")))
            }
        };
        Ok(TemplateDefinition {
            mode,
            body: self.config.template.body.clone().unwrap_or_default(),
            ..Default::default()
        })
    }

    /// One task per session works through its assignment group by group;
    /// downloads within a session stay in submission order, the semaphore
    /// caps overall concurrency.
    async fn run_downloads(
        &self,
        channel: &str,
        distribution: crate::domain::Distribution,
        mode: DownloadMode,
        coordinator: Option<&Arc<UploadCoordinator>>,
    ) {
        let downloader = Arc::new(MediaDownloader::new(
            self.config.download_threshold_bytes(),
            self.cancel.clone(),
        ));
        let limit = Arc::new(Semaphore::new(self.config.concurrent_downloads_or_default()));

        let mut tasks = JoinSet::new();
        for assignment in distribution.assignments {
            if assignment.is_empty() {
                continue;
            }
            let Some(session) = self.pool.session(&assignment.session) else {
                warn!(session = %assignment.session, "assigned session vanished from pool");
                continue;
            };
            let channel = channel.to_string();
            let mode = mode.clone();
            let downloader = Arc::clone(&downloader);
            let limit = Arc::clone(&limit);
            let stats = Arc::clone(&self.stats);
            let cancel = self.cancel.clone();
            let coordinator = coordinator.map(Arc::clone);
            tasks.spawn(async move {
                session_worker(
                    session,
                    assignment,
                    channel,
                    mode,
                    downloader,
                    limit,
                    stats,
                    coordinator,
                    cancel,
                )
                .await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "session download task panicked");
            }
        }
    }

    /// `@handle-title` from chat metadata; falls back to the sanitized
    /// handle when the lookup fails.
    async fn derive_folder(&self, channel: &str) -> String {
        match self.pool.sessions().first() {
            Some(session) => match session.gateway.get_chat(channel).await {
                Ok(chat) => files::channel_folder_name(&chat),
                Err(e) => {
                    warn!(channel, error = %e, "chat lookup failed, using handle as folder name");
                    files::sanitize_folder_name(channel)
                }
            },
            None => files::sanitize_folder_name(channel),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn session_worker(
    session: Arc<PooledSession>,
    assignment: crate::domain::ClientAssignment,
    channel: String,
    mode: DownloadMode,
    downloader: Arc<MediaDownloader>,
    limit: Arc<Semaphore>,
    stats: Arc<StatsCollector>,
    coordinator: Option<Arc<UploadCoordinator>>,
    cancel: CancellationToken,
) {
    info!(
        session = %session.name,
        groups = assignment.groups.len(),
        messages = assignment.total_messages,
        estimated = %files::format_size(assignment.estimated_size),
        "session worker started"
    );

    'groups: for group in assignment.groups {
        if cancel.is_cancelled() {
            warn!(session = %session.name, "cancelled, abandoning remaining groups");
            break;
        }

        let mut items = Vec::with_capacity(group.len());
        let mut failed_members = 0usize;
        for message in &group.messages {
            if cancel.is_cancelled() {
                break 'groups;
            }
            let _permit = limit.acquire().await.expect("semaphore closed");
            match downloader.download(&session, &channel, message, &mode).await {
                Ok(DownloadOutcome::Downloaded(item)) => {
                    session.record_download(true, item.size());
                    stats.record_downloaded(item.size());
                    items.push(item);
                }
                Ok(DownloadOutcome::Skipped(_)) => {
                    session.record_skip();
                    stats.record_skipped();
                }
                Err(DomainError::Cancelled) => break 'groups,
                Err(e) => {
                    session.record_download(false, 0);
                    stats.record_failed();
                    stats.record_error(
                        &e,
                        Severity::Error,
                        format!("download msg {} ({})", message.id, session.name),
                    );
                    error!(
                        session = %session.name,
                        msg_id = message.id,
                        error = %e,
                        "download failed"
                    );
                    failed_members += 1;
                }
            }
        }

        if let Some(coordinator) = &coordinator {
            if !items.is_empty() || failed_members > 0 {
                coordinator
                    .submit(PublishUnit {
                        group_id: group.id.clone(),
                        session: session.name.clone(),
                        is_album: group.is_album(),
                        items,
                        failed_members,
                    })
                    .await;
            }
        }
    }

    info!(session = %session.name, "session worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::adapters::telegram::mock::MockChatGateway;
    use crate::domain::{FileLocation, MediaDescriptor, MediaKind, MediaMeta};
    use crate::ports::{ChatGateway, GatewayFactory};

    struct MapFactory(std::collections::HashMap<String, Arc<MockChatGateway>>);

    #[async_trait::async_trait]
    impl GatewayFactory for MapFactory {
        async fn open(&self, name: &str) -> Result<Arc<dyn ChatGateway>, DomainError> {
            self.0
                .get(name)
                .map(|g| Arc::clone(g) as Arc<dyn ChatGateway>)
                .ok_or_else(|| DomainError::Config(format!("no credentials for {name}")))
        }
    }

    fn doc_message(id: i32, group_id: Option<&str>, size: u64) -> Message {
        Message {
            id,
            chat_id: 1,
            group_id: group_id.map(String::from),
            text: None,
            caption: Some(format!("caption {id}")),
            media: Some(MediaDescriptor {
                kind: MediaKind::Document,
                file_size: Some(size),
                mime_type: None,
                file_name: None,
                meta: MediaMeta::default(),
                location: Some(FileLocation {
                    media_id: id as i64,
                    access_hash: 1,
                    file_reference: vec![],
                    dc_id: 2,
                    thumb_size: None,
                    is_photo: false,
                }),
            }),
        }
    }

    fn base_config(dir: &std::path::Path) -> MirrorConfig {
        MirrorConfig {
            session_names: vec!["s1".into(), "s2".into()],
            api_id: Some(1),
            api_hash: Some("0123456789abcdef0123456789abcdef".into()),
            source_channel: Some("@src".into()),
            start_id: Some(1),
            end_id: Some(6),
            download_dir: Some(dir.to_string_lossy().into_owned()),
            ..Default::default()
        }
    }

    async fn started_pool(
        gateways: &[(&str, Arc<MockChatGateway>)],
    ) -> Arc<SessionPool> {
        let factory = MapFactory(
            gateways.iter().map(|(n, g)| (n.to_string(), Arc::clone(g))).collect(),
        );
        let names: Vec<String> = gateways.iter().map(|(n, _)| n.to_string()).collect();
        let pool = Arc::new(
            SessionPool::initialize_with_stagger(&factory, &names, Duration::ZERO)
                .await
                .unwrap(),
        );
        pool.start_all().await.unwrap();
        pool
    }

    fn seeded_gateway(name: &str, ids: std::ops::RangeInclusive<i32>) -> Arc<MockChatGateway> {
        let mut gateway = MockChatGateway::new(name)
            .with_messages(ids.clone().map(|id| doc_message(id, None, 8)).collect());
        for id in ids {
            gateway = gateway.with_file_bytes(id as i64, vec![id as u8; 8]);
        }
        gateway
    }

    #[tokio::test]
    async fn test_download_only_run_writes_all_files() {
        let dir = tempfile::tempdir().unwrap();
        let g1 = seeded_gateway("s1", 1..=6);
        let g2 = seeded_gateway("s2", 1..=6);
        let pool = started_pool(&[("s1", Arc::clone(&g1)), ("s2", Arc::clone(&g2))]).await;

        let service = MirrorService::new(
            base_config(dir.path()),
            pool,
            StatsCollector::new(),
            CancellationToken::new(),
        );
        let report = service.run().await.unwrap();

        assert_eq!(report.targeted, 6);
        assert_eq!(report.downloaded, 6);
        assert_eq!(report.exit_code(), 0);
        let folder = dir.path().join("_src-Mock Channel");
        for id in 1..=6 {
            assert!(folder.join(format!("{id}_document.bin")).exists(), "missing file {id}");
        }
    }

    #[tokio::test]
    async fn test_rerun_skips_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let g1 = seeded_gateway("s1", 1..=6);
        let g2 = seeded_gateway("s2", 1..=6);
        let pool = started_pool(&[("s1", Arc::clone(&g1)), ("s2", Arc::clone(&g2))]).await;
        let config = base_config(dir.path());

        MirrorService::new(config.clone(), Arc::clone(&pool), StatsCollector::new(), CancellationToken::new())
            .run()
            .await
            .unwrap();

        let report =
            MirrorService::new(config, pool, StatsCollector::new(), CancellationToken::new())
                .run()
                .await
                .unwrap();
        assert_eq!(report.downloaded, 0);
        assert_eq!(report.skipped, 6);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_empty_window_is_success_without_work() {
        let dir = tempfile::tempdir().unwrap();
        let g1 = MockChatGateway::new("s1");
        let g2 = MockChatGateway::new("s2");
        let pool = started_pool(&[("s1", g1), ("s2", g2)]).await;

        let report = MirrorService::new(
            base_config(dir.path()),
            pool,
            StatsCollector::new(),
            CancellationToken::new(),
        )
        .run()
        .await
        .unwrap();
        assert_eq!(report.targeted, 0);
        assert_eq!(report.exit_code(), 0);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_publish_pipeline_stages_and_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut g1 = MockChatGateway::new("s1").with_messages(vec![
            doc_message(1, Some("album"), 8),
            doc_message(2, Some("album"), 8),
            doc_message(3, None, 8),
        ]);
        for id in 1..=3 {
            g1 = g1.with_file_bytes(id as i64, vec![9; 8]);
        }
        let pool = started_pool(&[("s1", Arc::clone(&g1))]).await;

        let mut config = base_config(dir.path());
        config.session_names = vec!["s1".into()];
        config.end_id = Some(3);
        config.target_channels = vec!["@t1".into(), "@t2".into()];
        config.preserve_structure = Some(true);

        let report = MirrorService::new(
            config,
            pool,
            StatsCollector::new(),
            CancellationToken::new(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(report.downloaded, 3);
        // Album of two plus a singleton, each to two targets.
        let published = g1.published_groups();
        assert_eq!(published.len(), 4);
        assert_eq!(published.iter().filter(|(_, size)| *size == 2).count(), 2);
        assert_eq!(published.iter().filter(|(_, size)| *size == 1).count(), 2);
        // Scratch uploads were cleaned up after success.
        assert!(!g1.deleted_messages().is_empty());
        assert_eq!(report.published, 3);
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_album_atomicity_survives_the_whole_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let messages: Vec<Message> =
            (1..=10).map(|id| doc_message(id, Some("big_album"), 8)).collect();
        let mut g1 = MockChatGateway::new("s1").with_messages(messages.clone());
        let mut g2 = MockChatGateway::new("s2").with_messages(messages);
        for id in 1..=10 {
            g1 = g1.with_file_bytes(id as i64, vec![1; 8]);
            g2 = g2.with_file_bytes(id as i64, vec![1; 8]);
        }
        let pool = started_pool(&[("s1", Arc::clone(&g1)), ("s2", Arc::clone(&g2))]).await;

        let mut config = base_config(dir.path());
        config.end_id = Some(10);
        config.target_channels = vec!["@t1".into()];
        config.preserve_structure = Some(true);

        let report = MirrorService::new(
            config,
            pool,
            StatsCollector::new(),
            CancellationToken::new(),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(report.downloaded, 10);
        // The album went whole through exactly one session.
        let all_published: Vec<(String, usize)> = g1
            .published_groups()
            .into_iter()
            .chain(g2.published_groups())
            .collect();
        assert_eq!(all_published.len(), 1);
        assert_eq!(all_published[0].1, 10);
    }
}
