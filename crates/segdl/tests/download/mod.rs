use std::{num::NonZeroU32, sync::Arc, time::Duration};

use segdl::{
    merge::ConcatMerger,
    notify::{ChannelNotifier, JobEvent},
    segment::SegmentStatus,
    store::{memory::MemoryJobStore, JobStore},
    JobId, JobOrchestrator, JobOrchestratorBuilder, JobRequest, JobStatus, SegdlError,
};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::{encrypt, media_playlist, HlsMock};

const KEY: [u8; 16] = *b"0123456789abcdef";

type TestOrchestrator = JobOrchestrator<Arc<MemoryJobStore>, ChannelNotifier, ConcatMerger>;

struct Harness {
    orchestrator: TestOrchestrator,
    events: UnboundedReceiver<JobEvent>,
    dir: TempDir,
}

impl Harness {
    fn new(concurrency: u32) -> anyhow::Result<Self> {
        Self::with_builder(
            JobOrchestratorBuilder::new().concurrency(NonZeroU32::new(concurrency).unwrap()),
        )
    }

    fn with_builder(builder: JobOrchestratorBuilder) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let (notifier, events) = ChannelNotifier::new();
        let orchestrator = builder
            .retry_delay(Duration::from_millis(10))
            .work_root(dir.path().join("work"))
            .output_dir(dir.path().join("out"))
            .build_with_merger(Arc::new(MemoryJobStore::new()), notifier, ConcatMerger)?;

        Ok(Self {
            orchestrator,
            events,
            dir,
        })
    }

    fn events(&mut self) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    fn statuses(&mut self) -> Vec<JobStatus> {
        statuses(&self.events())
    }
}

fn statuses(events: &[JobEvent]) -> Vec<JobStatus> {
    events
        .iter()
        .filter_map(|event| match event {
            JobEvent::StatusChange { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

fn progress_count(events: &[JobEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, JobEvent::Progress(_)))
        .count()
}

async fn mock_segment(server: &MockServer, mock_path: &str, body: Vec<u8>, delay: Duration) {
    Mock::given(method("GET"))
        .and(path(mock_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body).set_delay(delay))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_plain_playlist_completes() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server
        .mock_media("/video/index.m3u8", &["seg0.ts", "seg1.ts", "seg2.ts"], None)
        .await
        .mock("/video/seg0.ts", "seg0-")
        .await
        .mock("/video/seg1.ts", "seg1-")
        .await
        .mock("/video/seg2.ts", "seg2-")
        .await;

    let mut harness = Harness::new(8)?;
    let orchestrator = harness.orchestrator.clone();

    let job = orchestrator
        .create_job(JobRequest::new(format!("{}/video/index.m3u8", server.uri())).title("movie"))
        .await?;
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.work_dir.exists());
    assert_eq!(
        job.output_path,
        harness.dir.path().join("out").join("movie.mp4")
    );

    let job = orchestrator.start(job.id).await?;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_segments, 3);
    assert_eq!(job.completed_segments, 3);
    assert_eq!(job.failed_segments, 0);
    assert_eq!(job.progress, 100.);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert!(job.error_message.is_none());

    assert_eq!(tokio::fs::read(&job.output_path).await?, b"seg0-seg1-seg2-");
    assert!(!job.work_dir.exists());

    let segments = orchestrator.store().list_segments(job.id, None).await?;
    assert_eq!(segments.len(), 3);
    for segment in &segments {
        assert_eq!(segment.status, SegmentStatus::Completed);
        assert_eq!(segment.file_size, Some(5));
        assert_eq!(segment.retry_count, 0);
        assert!(segment.completed_at.is_some());
    }

    let events = harness.events();
    let progress: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            JobEvent::Progress(progress) => Some(progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 3);
    assert_eq!(progress.last().map(|p| p.percent), Some(100.));
    assert_eq!(
        statuses(&events),
        vec![
            JobStatus::Downloading,
            JobStatus::Merging,
            JobStatus::Completed
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_aes128_explicit_iv() -> anyhow::Result<()> {
    let plain = [
        vec![0x47u8; 188],
        b"second segment".to_vec(),
        vec![0x11u8; 32],
    ];
    let iv = [0u8; 16];

    let server = MockServer::start().await;
    server
        .mock_media(
            "/index.m3u8",
            &["0.ts", "1.ts", "2.ts"],
            Some(r#"#EXT-X-KEY:METHOD=AES-128,URI="key.bin",IV=0x00000000000000000000000000000000"#),
        )
        .await
        .mock("/key.bin", KEY.to_vec())
        .await;
    for (index, data) in plain.iter().enumerate() {
        server
            .mock(&format!("/{index}.ts"), encrypt(data, &KEY, iv))
            .await;
    }

    let harness = Harness::new(2)?;
    let orchestrator = &harness.orchestrator;
    let job = orchestrator
        .create_job(JobRequest::new(format!("{}/index.m3u8", server.uri())))
        .await?;
    let job = orchestrator.start(job.id).await?;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.encryption_key, KEY);
    assert_eq!(job.encryption_iv, Some(iv));
    assert_eq!(
        job.output_path.file_name().and_then(|name| name.to_str()),
        Some(format!("download_{}.mp4", job.id).as_str())
    );
    assert_eq!(tokio::fs::read(&job.output_path).await?, plain.concat());
    Ok(())
}

#[tokio::test]
async fn test_aes128_iv_from_index() -> anyhow::Result<()> {
    let plain: Vec<Vec<u8>> = (0u8..4).map(|i| vec![i; 100]).collect();

    let server = MockServer::start().await;
    server
        .mock_media(
            "/index.m3u8",
            &["0.ts", "1.ts", "2.ts", "3.ts"],
            Some(r#"#EXT-X-KEY:METHOD=AES-128,URI="key.bin""#),
        )
        .await
        .mock("/key.bin", KEY.to_vec())
        .await;
    for (index, data) in plain.iter().enumerate() {
        let iv = (index as u128).to_be_bytes();
        server
            .mock(&format!("/{index}.ts"), encrypt(data, &KEY, iv))
            .await;
    }

    let harness = Harness::with_builder(JobOrchestratorBuilder::new().keep_segments(true))?;
    let orchestrator = &harness.orchestrator;
    let job = orchestrator
        .create_job(JobRequest::new(format!("{}/index.m3u8", server.uri())))
        .await?;
    let job = orchestrator.start(job.id).await?;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.encryption_iv, None);
    assert_eq!(tokio::fs::read(&job.output_path).await?, plain.concat());

    // Decrypted segment files stay in place when asked to
    let kept = tokio::fs::read(job.work_dir.join("segment_000003.ts")).await?;
    assert_eq!(kept, plain[3]);
    Ok(())
}

#[tokio::test]
async fn test_partial_failure_fails_job() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server
        .mock_media(
            "/index.m3u8",
            &["0.ts", "1.ts", "2.ts", "3.ts", "4.ts"],
            None,
        )
        .await;
    for index in [0, 1, 3, 4] {
        server.mock(&format!("/{index}.ts"), format!("{index}")).await;
    }
    Mock::given(method("GET"))
        .and(path("/2.ts"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let mut harness = Harness::new(8)?;
    let orchestrator = harness.orchestrator.clone();
    let job = orchestrator
        .create_job(JobRequest::new(format!("{}/index.m3u8", server.uri())))
        .await?;
    let job = orchestrator.start(job.id).await?;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("Failed to download 1 segments")
    );
    assert_eq!(job.completed_segments, 4);
    assert_eq!(job.failed_segments, 1);
    assert!(job.completed_at.is_none());
    assert!(!job.output_path.exists());
    assert!(job.work_dir.exists());

    let failed = orchestrator
        .store()
        .list_segments(job.id, Some(SegmentStatus::Failed))
        .await?;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].index, 2);
    assert_eq!(failed[0].retry_count, 2);
    assert!(failed[0]
        .error_message
        .as_deref()
        .is_some_and(|message| message.contains("500")));
    assert!(!job.work_dir.join("segment_000002.ts").exists());

    // One progress update per settled segment, none per retry attempt
    let events = harness.events();
    assert_eq!(progress_count(&events), 5);
    let statuses = statuses(&events);
    assert!(!statuses.contains(&JobStatus::Merging));
    assert_eq!(statuses.last(), Some(&JobStatus::Failed));

    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_transient_failure_is_retried() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server
        .mock_media("/index.m3u8", &["0.ts", "1.ts"], None)
        .await
        .mock("/0.ts", "a")
        .await;
    Mock::given(method("GET"))
        .and(path("/1.ts"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/1.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_string("b"))
        .expect(1)
        .mount(&server)
        .await;

    let mut harness = Harness::new(8)?;
    let orchestrator = harness.orchestrator.clone();
    let job = orchestrator
        .create_job(JobRequest::new(format!("{}/index.m3u8", server.uri())))
        .await?;
    let job = orchestrator.start(job.id).await?;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_segments, 2);
    assert_eq!(job.failed_segments, 0);
    assert_eq!(tokio::fs::read_to_string(&job.output_path).await?, "ab");

    let segments = orchestrator.store().list_segments(job.id, None).await?;
    assert_eq!(segments[1].retry_count, 2);
    assert_eq!(segments[1].status, SegmentStatus::Completed);

    assert_eq!(progress_count(&harness.events()), 2);
    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_decrypt_failure_is_not_retried() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server
        .mock_media(
            "/index.m3u8",
            &["0.ts", "1.ts"],
            Some(r#"#EXT-X-KEY:METHOD=AES-128,URI="key.bin",IV=0x0"#),
        )
        .await
        .mock("/key.bin", KEY.to_vec())
        .await
        .mock("/0.ts", encrypt(b"fine", &KEY, [0; 16]))
        .await;
    Mock::given(method("GET"))
        .and(path("/1.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 17]))
        .expect(1)
        .mount(&server)
        .await;

    let harness = Harness::new(8)?;
    let orchestrator = &harness.orchestrator;
    let job = orchestrator
        .create_job(JobRequest::new(format!("{}/index.m3u8", server.uri())))
        .await?;
    let job = orchestrator.start(job.id).await?;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("Failed to download 1 segments")
    );

    let segments = orchestrator.store().list_segments(job.id, None).await?;
    assert_eq!(segments[1].status, SegmentStatus::Failed);
    assert_eq!(segments[1].retry_count, 0);
    assert!(segments[1]
        .error_message
        .as_deref()
        .is_some_and(|message| message.contains("decrypt")));

    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_retry_refetches_failed_segments_only() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server
        .mock_media("/index.m3u8", &["0.ts", "1.ts", "2.ts"], None)
        .await;
    for (index, body) in [(0, "x"), (2, "z")] {
        Mock::given(method("GET"))
            .and(path(format!("/{index}.ts")))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/1.ts"))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/1.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_string("y"))
        .mount(&server)
        .await;

    let harness = Harness::new(8)?;
    let orchestrator = &harness.orchestrator;
    let job = orchestrator
        .create_job(JobRequest::new(format!("{}/index.m3u8", server.uri())))
        .await?;
    let job = orchestrator.start(job.id).await?;
    assert_eq!(job.status, JobStatus::Failed);

    let job = orchestrator.retry(job.id).await?;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.failed_segments, 0);
    assert_eq!(job.completed_segments, 3);
    assert!(job.error_message.is_none());
    assert_eq!(tokio::fs::read_to_string(&job.output_path).await?, "xyz");

    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_pause_and_resume() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server
        .mock_media("/index.m3u8", &["0.ts", "1.ts", "2.ts"], None)
        .await;
    for index in 0..3 {
        mock_segment(
            &server,
            &format!("/{index}.ts"),
            format!("<{index}>").into_bytes(),
            Duration::from_millis(300),
        )
        .await;
    }

    let mut harness = Harness::new(1)?;
    let orchestrator = harness.orchestrator.clone();
    let job = orchestrator
        .create_job(JobRequest::new(format!("{}/index.m3u8", server.uri())))
        .await?;
    let id = job.id;

    let running = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start(id).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    orchestrator.pause(id).await?;

    let job = running.await??;
    assert_eq!(job.status, JobStatus::Paused);
    assert!(job.completed_segments < 3);
    assert!(!job.output_path.exists());

    // The in-flight segment was discarded and is fetched again
    let pending = orchestrator
        .store()
        .list_segments(id, Some(SegmentStatus::Pending))
        .await?;
    assert_eq!(pending.len() as u64, 3 - job.completed_segments);

    let job = orchestrator.resume(id).await?;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        tokio::fs::read_to_string(&job.output_path).await?,
        "<0><1><2>"
    );

    let statuses = harness.statuses();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Downloading,
            JobStatus::Paused,
            JobStatus::Downloading,
            JobStatus::Merging,
            JobStatus::Completed
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_cancel_then_retry() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server.mock_media("/index.m3u8", &["0.ts", "1.ts"], None).await;
    for index in 0..2 {
        mock_segment(
            &server,
            &format!("/{index}.ts"),
            vec![b'a' + index as u8],
            Duration::from_millis(300),
        )
        .await;
    }

    let harness = Harness::new(1)?;
    let orchestrator = harness.orchestrator.clone();
    let job = orchestrator
        .create_job(JobRequest::new(format!("{}/index.m3u8", server.uri())))
        .await?;
    let id = job.id;

    let running = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start(id).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    orchestrator.cancel(id).await?;
    assert_eq!(running.await??.status, JobStatus::Cancelled);

    let result = orchestrator.resume(id).await;
    assert!(matches!(
        result,
        Err(SegdlError::InvalidTransition {
            from: JobStatus::Cancelled,
            to: JobStatus::Downloading
        })
    ));

    let job = orchestrator.retry(id).await?;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(tokio::fs::read_to_string(&job.output_path).await?, "ab");
    Ok(())
}

#[tokio::test]
async fn test_invalid_transitions() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server
        .mock_media("/index.m3u8", &["0.ts"], None)
        .await
        .mock("/0.ts", "0")
        .await;

    let harness = Harness::new(8)?;
    let orchestrator = &harness.orchestrator;
    let job = orchestrator
        .create_job(JobRequest::new(format!("{}/index.m3u8", server.uri())))
        .await?;

    assert!(matches!(
        orchestrator.resume(job.id).await,
        Err(SegdlError::InvalidTransition {
            from: JobStatus::Pending,
            ..
        })
    ));
    assert!(orchestrator.pause(job.id).await.is_err());
    assert!(orchestrator.retry(job.id).await.is_err());

    let job = orchestrator.start(job.id).await?;
    assert_eq!(job.status, JobStatus::Completed);

    assert!(matches!(
        orchestrator.start(job.id).await,
        Err(SegdlError::InvalidTransition {
            from: JobStatus::Completed,
            to: JobStatus::Downloading
        })
    ));
    assert!(orchestrator.cancel(job.id).await.is_err());
    assert_eq!(
        orchestrator.status(job.id).await?.status,
        JobStatus::Completed
    );

    assert!(matches!(
        orchestrator.status(JobId::new()).await,
        Err(SegdlError::JobNotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_playlist_failure_fails_job() -> anyhow::Result<()> {
    let server = MockServer::start().await;

    let harness = Harness::new(8)?;
    let orchestrator = &harness.orchestrator;
    let job = orchestrator
        .create_job(JobRequest::new(format!("{}/gone.m3u8", server.uri())))
        .await?;
    let job = orchestrator.start(job.id).await?;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .error_message
        .as_deref()
        .is_some_and(|message| message.starts_with("Failed to fetch playlist")));
    assert_eq!(job.total_segments, 0);
    Ok(())
}

#[tokio::test]
async fn test_master_playlist_downloads_best_variant() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server
        .mock(
            "/master.m3u8",
            "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=500000
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=1200000
high/index.m3u8
",
        )
        .await
        .mock("/high/index.m3u8", media_playlist(&["a.ts", "b.ts"], None))
        .await
        .mock("/high/a.ts", "HA")
        .await
        .mock("/high/b.ts", "HB")
        .await;
    Mock::given(method("GET"))
        .and(path("/low/index.m3u8"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let harness = Harness::new(8)?;
    let orchestrator = &harness.orchestrator;
    let job = orchestrator
        .create_job(JobRequest::new(format!("{}/master.m3u8", server.uri())))
        .await?;
    let job = orchestrator.start(job.id).await?;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(tokio::fs::read_to_string(&job.output_path).await?, "HAHB");

    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_job_headers_reach_every_request() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let referer = "https://example.com/player";
    for (mock_path, body) in [
        ("/index.m3u8", media_playlist(&["0.ts"], None)),
        ("/0.ts", "only".to_string()),
    ] {
        Mock::given(method("GET"))
            .and(path(mock_path))
            .and(header("referer", referer))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;
    }

    let harness = Harness::new(8)?;
    let orchestrator = &harness.orchestrator;
    let job = orchestrator
        .create_job(
            JobRequest::new(format!("{}/index.m3u8", server.uri())).header("Referer", referer),
        )
        .await?;
    let job = orchestrator.start(job.id).await?;

    assert_eq!(job.status, JobStatus::Completed);
    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_master_without_variants_fails_job() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server
        .mock(
            "/master.m3u8",
            r#"#EXTM3U
#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=86000,URI="iframe.m3u8"
"#,
        )
        .await;

    let harness = Harness::new(8)?;
    let orchestrator = &harness.orchestrator;
    let job = orchestrator
        .create_job(JobRequest::new(format!("{}/master.m3u8", server.uri())))
        .await?;
    let job = orchestrator.start(job.id).await?;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .error_message
        .as_deref()
        .is_some_and(|message| message.starts_with("No variant stream found")));
    assert_eq!(job.total_segments, 0);
    Ok(())
}

#[tokio::test]
async fn test_merge_failure_keeps_segments_for_retry() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    server.mock_media("/index.m3u8", &["0.ts", "1.ts"], None).await;
    for (index, body) in [(0, "m"), (1, "n")] {
        Mock::given(method("GET"))
            .and(path(format!("/{index}.ts")))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .expect(1)
            .mount(&server)
            .await;
    }

    let mut harness = Harness::new(8)?;
    let orchestrator = harness.orchestrator.clone();

    // A directory in place of the output file makes the merge fail
    let output = harness.dir.path().join("blocked.mp4");
    tokio::fs::create_dir_all(&output).await?;
    let job = orchestrator
        .create_job(JobRequest::new(format!("{}/index.m3u8", server.uri())).output_path(&output))
        .await?;
    let job = orchestrator.start(job.id).await?;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .error_message
        .as_deref()
        .is_some_and(|message| message.starts_with("Failed to merge segments: ")));
    assert!(job.completed_at.is_none());
    assert!(output.is_dir());
    assert!(job.work_dir.join("segment_000000.ts").exists());
    assert!(job.work_dir.join("segment_000001.ts").exists());
    assert_eq!(
        statuses(&harness.events()),
        vec![
            JobStatus::Downloading,
            JobStatus::Merging,
            JobStatus::Failed
        ]
    );

    // Retry goes straight to merging without fetching again
    tokio::fs::remove_dir(&output).await?;
    let job = orchestrator.retry(job.id).await?;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(tokio::fs::read_to_string(&output).await?, "mn");

    server.verify().await;
    Ok(())
}
