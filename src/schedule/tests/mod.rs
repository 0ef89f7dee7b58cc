use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

use crate::schedule::broadcast::{EventReceiver, ListChange, TaskEvent};
use crate::schedule::pipeline::StageCatalog;
use crate::schedule::scheduler::{Dispatcher, DispatcherOptions, SubmitError};
use crate::schedule::stage::mock::{Behavior, ScriptedStage};
use crate::schedule::types::*;

struct TestEnv {
    dispatcher: Arc<Dispatcher>,
    dir: TempDir,
}

impl TestEnv {
    fn new(extract: Arc<ScriptedStage>, transcribe: Option<Arc<ScriptedStage>>, max_jobs: usize) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let mut catalog = StageCatalog::new(extract);
        if let Some(stage) = transcribe {
            catalog = catalog.with_transcriber(Engine::Remote, stage);
        }

        let dispatcher = Dispatcher::new(
            catalog,
            DispatcherOptions {
                max_concurrent_jobs: max_jobs,
                retention: Duration::from_secs(3600),
                history_capacity: 100,
                output_dir: dir.path().join("output"),
                scratch_dir: dir.path().join("tmp"),
            },
        );
        Ok(Self {
            dispatcher: Arc::new(dispatcher),
            dir,
        })
    }

    fn upload(&self, name: &str) -> Result<PathBuf> {
        let uploads = self.dir.path().join("uploads");
        std::fs::create_dir_all(&uploads)?;
        let path = uploads.join(name);
        std::fs::write(&path, b"media")?;
        Ok(path)
    }

    fn spec(&self, name: &str, kind: ConversionKind) -> Result<TaskSpec> {
        Ok(TaskSpec {
            input_path: self.upload(name)?,
            filename: name.to_string(),
            kind,
            engine: kind.needs_engine().then_some(Engine::Remote),
            language: Some("en".to_string()),
        })
    }

    fn submit(&self, name: &str, kind: ConversionKind) -> Result<String> {
        Ok(self.dispatcher.submit(self.spec(name, kind)?)?)
    }

    async fn wait_until<F>(&self, task_id: &str, predicate: F) -> Result<TaskSnapshot>
    where
        F: Fn(&TaskSnapshot) -> bool,
    {
        let waited = timeout(Duration::from_secs(5), async {
            loop {
                if let Some(task) = self.dispatcher.get_status(task_id) {
                    if predicate(&task) {
                        return task;
                    }
                }
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        Ok(waited)
    }

    async fn wait_finished(&self, task_id: &str) -> Result<TaskSnapshot> {
        self.wait_until(task_id, |t| t.status.is_terminal()).await
    }
}

/// Reads events until the terminal `conversion_complete` arrives.
async fn collect_events(rx: &mut EventReceiver) -> Result<Vec<TaskEvent>> {
    let events = timeout(Duration::from_secs(5), async {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            let done = matches!(event, TaskEvent::Complete { .. });
            events.push(event);
            if done {
                break;
            }
        }
        events
    })
    .await?;
    Ok(events)
}

fn progress_values(events: &[TaskEvent]) -> Vec<u8> {
    events
        .iter()
        .filter_map(|e| match e {
            TaskEvent::Progress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_single_stage_success() -> Result<()> {
    let extract = Arc::new(ScriptedStage::new("extract_audio", vec![0, 50, 30, 100]).extension("mp3"));
    let env = TestEnv::new(extract.clone(), None, 2)?;
    let mut list = env.dispatcher.broadcaster().watch_list();

    let id = env.submit("clip.mp4", ConversionKind::Mp4ToMp3)?;
    let (_, mut rx) = env.dispatcher.broadcaster().subscribe_channel(&id);
    let events = collect_events(&mut rx).await?;

    match &events[0] {
        TaskEvent::Status(snapshot) => assert_eq!(snapshot.status, TaskStatus::Pending),
        other => panic!("expected snapshot first, got {:?}", other),
    }

    // the late 30% report is raised to the current 50%
    let progress = progress_values(&events);
    assert_eq!(progress, vec![0, 0, 50, 50, 100]);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));

    match events.last() {
        Some(TaskEvent::Complete { success, output_file, error, .. }) => {
            assert!(*success);
            assert_eq!(output_file.as_deref(), Some("clip.mp3"));
            assert!(error.is_none());
        }
        other => panic!("expected completion, got {:?}", other),
    }
    assert!(!events.iter().any(|e| matches!(e, TaskEvent::Error { .. })));

    let task = env.wait_finished(&id).await?;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    let output = task.output_path.clone().unwrap();
    assert_eq!(output, env.dir.path().join("output").join(&id).join("clip.mp3"));
    assert!(output.exists());
    assert_eq!(extract.runs(), 1);

    assert_eq!(
        list.recv().await?,
        ListChange::Created {
            conversion_id: id.clone(),
            filename: "clip.mp4".into(),
            kind: ConversionKind::Mp4ToMp3,
        }
    );
    assert_eq!(
        list.recv().await?,
        ListChange::Finished {
            conversion_id: id.clone(),
            success: true,
        }
    );

    let page = env.dispatcher.history(50);
    assert_eq!(page.total, 1);
    assert_eq!(page.entries[0].output_file.as_deref(), Some("clip.mp3"));
    assert!(env.dispatcher.list_active().active.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_two_stage_progress_is_weighted() -> Result<()> {
    let extract = Arc::new(ScriptedStage::new("extract_audio", vec![100]).extension("mp3"));
    let transcribe = Arc::new(ScriptedStage::new("transcribe", vec![50, 100]).extension("txt"));
    let env = TestEnv::new(extract, Some(transcribe.clone()), 2)?;

    let id = env.submit("lecture.mp4", ConversionKind::Mp4ToTxt)?;
    let (_, mut rx) = env.dispatcher.broadcaster().subscribe_channel(&id);
    let events = collect_events(&mut rx).await?;

    assert_eq!(progress_values(&events), vec![0, 50, 75, 100]);
    let task = env.wait_finished(&id).await?;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.output_file_name().as_deref(), Some("lecture.txt"));
    assert!(task.metadata.contains_key("extract_audio"));
    assert!(task.metadata.contains_key("transcribe"));

    // transcribe read the intermediate audio, which is gone now
    let intermediate = transcribe.inputs()[0].clone();
    assert!(intermediate.starts_with(env.dir.path().join("tmp")));
    assert!(!intermediate.exists());
    Ok(())
}

#[tokio::test]
async fn test_mid_pipeline_failure() -> Result<()> {
    let extract = Arc::new(ScriptedStage::new("extract_audio", vec![100]).extension("mp3"));
    let transcribe = Arc::new(
        ScriptedStage::new("transcribe", vec![20])
            .extension("txt")
            .behave(Behavior::Fail("recognizer crashed".into())),
    );
    let env = TestEnv::new(extract, Some(transcribe), 2)?;

    let id = env.submit("talk.mp4", ConversionKind::Mp4ToTxt)?;
    let (_, mut first) = env.dispatcher.broadcaster().subscribe_channel(&id);
    let (_, mut second) = env.dispatcher.broadcaster().subscribe_channel(&id);

    for rx in [&mut first, &mut second] {
        let events = collect_events(rx).await?;
        let errors: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, TaskEvent::Error { .. }))
            .collect();
        let completes: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, TaskEvent::Complete { .. }))
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(completes.len(), 1);
        assert!(matches!(
            completes[0],
            TaskEvent::Complete { success: false, error: Some(e), .. } if e == "recognizer crashed"
        ));
        // error is announced before completion
        let error_at = events.iter().position(|e| matches!(e, TaskEvent::Error { .. }));
        assert_eq!(error_at, Some(events.len() - 2));
    }

    let task = env.wait_finished(&id).await?;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some("recognizer crashed"));
    assert!(task.output_path.is_none());
    assert_eq!(task.metadata["failed_stage"], "transcribe");

    let scratch: Vec<_> = std::fs::read_dir(env.dir.path().join("tmp"))?.collect();
    assert!(scratch.is_empty());
    assert!(!env.dir.path().join("output").join(&id).join("talk.txt").exists());

    let page = env.dispatcher.history(10);
    assert_eq!(page.total, 1);
    assert!(!page.entries[0].success);
    Ok(())
}

#[tokio::test]
async fn test_stage_error_fails_task() -> Result<()> {
    let extract = Arc::new(
        ScriptedStage::new("extract_audio", vec![10]).behave(Behavior::Error("ffmpeg exited with 1".into())),
    );
    let env = TestEnv::new(extract, None, 1)?;

    let id = env.submit("clip.mov", ConversionKind::Mp4ToMp3)?;
    let task = env.wait_finished(&id).await?;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.unwrap().contains("ffmpeg exited with 1"));
    assert!(task.started_at.is_some());
    assert!(task.ended_at.is_some());
    Ok(())
}

#[tokio::test]
async fn test_failed_task_keeps_other_outputs_with_same_name() -> Result<()> {
    let extract = Arc::new(
        ScriptedStage::new("extract_audio", vec![50])
            .extension("mp3")
            .behave(Behavior::FailAfter(1, "ffmpeg crashed".into())),
    );
    let env = TestEnv::new(extract, None, 1)?;

    let first = env.submit("clip.mp4", ConversionKind::Mp4ToMp3)?;
    let done = env.wait_finished(&first).await?;
    assert_eq!(done.status, TaskStatus::Completed);
    let first_output = done.output_path.clone().unwrap();
    assert!(first_output.exists());

    let second = env.submit("clip.mp4", ConversionKind::Mp4ToMp3)?;
    let failed = env.wait_finished(&second).await?;
    assert_eq!(failed.status, TaskStatus::Failed);
    assert!(!env.dir.path().join("output").join(&second).join("clip.mp3").exists());

    let first_now = env.dispatcher.get_status(&first).unwrap();
    assert_eq!(first_now.status, TaskStatus::Completed);
    assert_eq!(first_now.output_path.as_ref(), Some(&first_output));
    assert!(first_output.exists());
    assert_eq!(first_now.output_file_name().as_deref(), Some("clip.mp3"));
    Ok(())
}

#[tokio::test]
async fn test_successful_conversions_are_logged() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let extract = Arc::new(
        ScriptedStage::new("extract_audio", vec![])
            .extension("mp3")
            .behave(Behavior::FailAfter(1, "ffmpeg crashed".into())),
    );
    let log_path = dir.path().join("logs").join("conversions.jsonl");
    let dispatcher = Dispatcher::new(
        StageCatalog::new(extract),
        DispatcherOptions {
            max_concurrent_jobs: 1,
            retention: Duration::from_secs(3600),
            history_capacity: 10,
            output_dir: dir.path().join("output"),
            scratch_dir: dir.path().join("tmp"),
        },
    )
    .with_conversion_log(&log_path);

    let input = dir.path().join("clip.mp4");
    std::fs::write(&input, b"media")?;
    let mut ids = Vec::new();
    for _ in 0..2 {
        let id = dispatcher.submit(TaskSpec {
            input_path: input.clone(),
            filename: "clip.mp4".into(),
            kind: ConversionKind::Mp4ToMp3,
            engine: None,
            language: None,
        })?;
        timeout(Duration::from_secs(5), async {
            while !dispatcher.get_status(&id).is_some_and(|t| t.status.is_terminal()) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        ids.push(id);
    }

    let content = std::fs::read_to_string(&log_path)?;
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 1);
    let record: serde_json::Value = serde_json::from_str(lines[0])?;
    assert_eq!(record["conversion_id"], ids[0].as_str());
    assert_eq!(record["metadata"]["extract_audio"]["stage"], "extract_audio");
    Ok(())
}

#[tokio::test]
async fn test_late_subscriber_gets_snapshot_first() -> Result<()> {
    let gate = Arc::new(Notify::new());
    let extract = Arc::new(
        ScriptedStage::new("extract_audio", vec![10, 40])
            .extension("mp3")
            .gated(gate.clone()),
    );
    let env = TestEnv::new(extract, None, 1)?;

    let id = env.submit("clip.mp4", ConversionKind::Mp4ToMp3)?;
    env.wait_until(&id, |t| t.progress == 40).await?;

    let (_, mut rx) = env.dispatcher.broadcaster().subscribe_channel(&id);
    gate.notify_one();
    let events = collect_events(&mut rx).await?;

    match &events[0] {
        TaskEvent::Status(snapshot) => {
            assert_eq!(snapshot.progress, 40);
            assert_eq!(snapshot.status, TaskStatus::Running);
        }
        other => panic!("expected snapshot first, got {:?}", other),
    }
    assert!(progress_values(&events).iter().all(|p| *p >= 40));
    assert!(matches!(events.last(), Some(TaskEvent::Complete { success: true, .. })));
    Ok(())
}

#[tokio::test]
async fn test_subscribers_see_identical_sequences() -> Result<()> {
    let extract = Arc::new(ScriptedStage::new("extract_audio", vec![100]).extension("mp3"));
    let transcribe = Arc::new(ScriptedStage::new("transcribe", vec![25, 50, 75, 100]).extension("txt"));
    let env = TestEnv::new(extract, Some(transcribe), 2)?;

    let id = env.submit("talk.mp4", ConversionKind::Mp4ToTxt)?;
    let (_, mut first) = env.dispatcher.broadcaster().subscribe_channel(&id);
    let (_, mut second) = env.dispatcher.broadcaster().subscribe_channel(&id);

    let (a, b) = tokio::join!(collect_events(&mut first), collect_events(&mut second));
    assert_eq!(a?, b?);
    Ok(())
}

#[tokio::test]
async fn test_history_keeps_the_latest_entries() -> Result<()> {
    let extract = Arc::new(ScriptedStage::new("extract_audio", vec![]).extension("mp3"));
    let env = TestEnv::new(extract, None, 2)?;

    for name in ["a.mp4", "b.mp4", "c.mp4"] {
        let id = env.submit(name, ConversionKind::Mp4ToMp3)?;
        env.wait_finished(&id).await?;
    }

    let page = env.dispatcher.history(2);
    assert_eq!(page.total, 3);
    let inputs: Vec<_> = page.entries.iter().map(|e| e.input_file.as_str()).collect();
    assert_eq!(inputs, vec!["b.mp4", "c.mp4"]);
    assert_eq!(env.dispatcher.list_active().history_count, 3);
    Ok(())
}

#[tokio::test]
async fn test_submit_validation() -> Result<()> {
    let extract = Arc::new(ScriptedStage::new("extract_audio", vec![]));
    let transcribe = Arc::new(ScriptedStage::new("transcribe", vec![]));
    let env = TestEnv::new(extract.clone(), Some(transcribe), 2)?;

    let unsupported = env.spec("notes.pdf", ConversionKind::Mp4ToMp3)?;
    assert!(matches!(
        env.dispatcher.submit(unsupported),
        Err(SubmitError::UnsupportedFile(_))
    ));

    let mismatch = env.spec("song.mp3", ConversionKind::Mp4ToMp3)?;
    assert!(matches!(
        env.dispatcher.submit(mismatch),
        Err(SubmitError::KindMismatch { .. })
    ));

    let mut no_engine = env.spec("song.mp3", ConversionKind::Mp3ToTxt)?;
    no_engine.engine = None;
    assert!(matches!(
        env.dispatcher.submit(no_engine),
        Err(SubmitError::MissingEngine(_))
    ));

    let mut unavailable = env.spec("song.mp3", ConversionKind::Mp3ToTxt)?;
    unavailable.engine = Some(Engine::Whisper);
    assert_eq!(
        env.dispatcher.submit(unavailable),
        Err(SubmitError::EngineUnavailable(Engine::Whisper))
    );

    let mut missing = env.spec("clip.mp4", ConversionKind::Mp4ToMp3)?;
    missing.input_path = env.dir.path().join("uploads").join("gone.mp4");
    assert!(matches!(
        env.dispatcher.submit(missing),
        Err(SubmitError::InputNotFound(_))
    ));

    // nothing was registered or run
    sleep(Duration::from_millis(20)).await;
    assert!(env.dispatcher.list_active().active.is_empty());
    assert_eq!(env.dispatcher.history(10).total, 0);
    assert_eq!(extract.runs(), 0);
    Ok(())
}

#[tokio::test]
async fn test_concurrency_is_bounded() -> Result<()> {
    let gate = Arc::new(Notify::new());
    let extract = Arc::new(
        ScriptedStage::new("extract_audio", vec![10])
            .extension("mp3")
            .gated(gate.clone()),
    );
    let env = TestEnv::new(extract.clone(), None, 1)?;

    let first = env.submit("a.mp4", ConversionKind::Mp4ToMp3)?;
    let second = env.submit("b.mp4", ConversionKind::Mp4ToMp3)?;

    env.wait_until(&first, |t| t.status == TaskStatus::Running).await?;
    sleep(Duration::from_millis(20)).await;
    assert_eq!(env.dispatcher.get_status(&second).unwrap().status, TaskStatus::Pending);
    assert_eq!(env.dispatcher.running_jobs(), 1);
    assert_eq!(env.dispatcher.list_active().active.len(), 2);

    gate.notify_one();
    env.wait_finished(&first).await?;
    env.wait_until(&second, |t| t.status == TaskStatus::Running).await?;
    gate.notify_one();
    let task = env.wait_finished(&second).await?;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(extract.runs(), 2);
    Ok(())
}

#[tokio::test]
async fn test_prune_drops_finished_tasks() -> Result<()> {
    let extract = Arc::new(ScriptedStage::new("extract_audio", vec![]).extension("mp3"));
    let env = TestEnv::new(extract, None, 1)?;

    let id = env.submit("a.mp4", ConversionKind::Mp4ToMp3)?;
    env.wait_finished(&id).await?;

    // still inside the retention window
    assert_eq!(env.dispatcher.prune(), 0);
    assert!(env.dispatcher.get_status(&id).is_some());
    Ok(())
}
