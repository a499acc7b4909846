//! End-to-end router flows with a scripted child process standing in for the
//! container engine and a recording messenger standing in for the platform.

use nanoclaw::agent::{AgentDispatcher, ContainerLaunch, ContainerRuntime, MountPolicy};
use nanoclaw::config::Config;
use nanoclaw::db::Db;
use nanoclaw::messenger::{ChatKind, CommandSpec, InboundEvent, Messenger};
use nanoclaw::queue::{ChatQueue, ProcessOutcome};
use nanoclaw::router::Router;
use nanoclaw::scheduler::TaskStage;
use nanoclaw::status::StatusRelay;
use nanoclaw::store::{
    ContextMode, NewTask, ScheduleKind, Store, StoredMessage, Workspace, WorkspaceContainerConfig,
    WorkspaceRegistry,
};
use nanoclaw::Result;

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Container engine double: spawns `sh -c <script>` instead of a container.
struct ScriptRuntime {
    script: String,
}

impl ScriptRuntime {
    fn new(script: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            script: script.into(),
        })
    }
}

#[async_trait]
impl ContainerRuntime for ScriptRuntime {
    async fn ensure_available(&self) -> Result<()> {
        Ok(())
    }

    async fn launch(&self, _launch: &ContainerLaunch) -> Result<tokio::process::Child> {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(nanoclaw::RouterError::Io)?;
        Ok(child)
    }

    async fn terminate(&self, _name: &str) {}
    async fn kill(&self, _name: &str) {}
}

#[derive(Default)]
struct RecordingMessenger {
    sent: std::sync::Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Messenger for RecordingMessenger {
    fn name(&self) -> &str {
        "recording"
    }
    async fn connect(&self) -> Result<()> {
        Ok(())
    }
    async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), text.to_string()));
        Ok(())
    }
    async fn send_or_update_status(
        &self,
        _chat_id: &str,
        _correlation_id: &str,
        _text: &str,
        _is_first: bool,
        _reply_to: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }
    async fn clear_status(&self, _chat_id: &str, _correlation_id: Option<&str>) {}
    async fn register_commands(&self, _commands: &[CommandSpec]) -> Result<()> {
        Ok(())
    }
    async fn start_listener(&self, _tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        Ok(())
    }
}

struct Harness {
    _db: Db,
    store: Store,
    registry: Arc<WorkspaceRegistry>,
    messenger: Arc<RecordingMessenger>,
    stage: TaskStage,
    router: Router,
    _tmp: tempfile::TempDir,
}

async fn harness(script: &str) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config {
        data_dir: tmp.path().to_path_buf(),
        ..Config::default()
    };
    let db = Db::connect_in_memory().await.unwrap();
    let store = Store::new(db.pool.clone());
    let registry = Arc::new(WorkspaceRegistry::new());
    let messenger = Arc::new(RecordingMessenger::default());
    let runtime = ScriptRuntime::new(script);
    let queue = ChatQueue::new(config.queue.clone(), runtime.clone());
    let status = Arc::new(StatusRelay::new(messenger.clone()));
    let stage = TaskStage::new();

    let dispatcher = AgentDispatcher::new(
        config.container.clone(),
        runtime,
        store.clone(),
        status.clone(),
        queue,
        MountPolicy::default(),
        config.groups_root(),
    );
    let router = Router::new(
        config,
        store.clone(),
        registry.clone(),
        messenger.clone(),
        dispatcher,
        status,
        stage.clone(),
    );

    Harness {
        _db: db,
        store,
        registry,
        messenger,
        stage,
        router,
        _tmp: tmp,
    }
}

fn success_script(user_message: &str) -> String {
    format!(
        "cat > /dev/null; \
         echo '---NANOCLAW_OUTPUT_START---'; \
         echo '{{\"status\":\"success\",\"result\":{{\"outputType\":\"message\",\
\"userMessage\":\"{user_message}\"}},\"newSessionId\":\"sess-next\"}}'; \
         echo '---NANOCLAW_OUTPUT_END---'"
    )
}

async fn register_group(h: &Harness, chat_id: &str, folder: &str, requires_trigger: bool) {
    h.store
        .upsert_chat(chat_id, Some(folder), "group", "2026-01-01T00:00:00.000Z")
        .await
        .unwrap();
    h.store
        .register_workspace(&Workspace {
            chat_id: chat_id.to_string(),
            name: folder.to_string(),
            folder: folder.to_string(),
            trigger_word: String::new(),
            requires_trigger,
            is_main: false,
            allowed_users: None,
            added_at: "2026-01-01T00:00:00.000Z".to_string(),
            container: None,
        })
        .await
        .unwrap();
    h.registry.reload(&h.store).await.unwrap();
}

async fn insert(h: &Harness, chat_id: &str, id: &str, content: &str, ts: &str) {
    h.store
        .insert_message(&StoredMessage {
            message_id: id.to_string(),
            chat_id: chat_id.to_string(),
            sender_id: "u-alice".to_string(),
            sender_name: "alice".to_string(),
            content: content.to_string(),
            timestamp: ts.to_string(),
            is_from_me: false,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn triggered_batch_runs_agent_and_advances_cursor() {
    let h = harness(&success_script("hello")).await;
    register_group(&h, "G", "garden", true).await;

    insert(&h, "G", "m1", "hi", "2026-01-01T00:00:01.000Z").await;
    insert(&h, "G", "m2", "@Andy what's up", "2026-01-01T00:00:02.000Z").await;

    let outcome = h.router.process_chat("G").await;
    assert_eq!(outcome, ProcessOutcome::Completed);

    // The platform got the prefixed reply.
    let sent = h.messenger.sent.lock().unwrap().clone();
    assert_eq!(sent, vec![("G".to_string(), "Andy: hello".to_string())]);

    // The per-chat cursor sits at the second message's timestamp.
    assert_eq!(
        h.store.agent_cursor("G").await.unwrap().as_deref(),
        Some("2026-01-01T00:00:02.000Z")
    );

    // The session handle from the run was stored under the workspace folder.
    assert_eq!(
        h.store.session_for("garden").await.unwrap().as_deref(),
        Some("sess-next")
    );
}

#[tokio::test]
async fn untriggered_batch_holds_the_cursor_and_spawns_nothing() {
    let h = harness("exit 7").await; // would fail loudly if ever spawned
    register_group(&h, "G", "garden", true).await;

    insert(&h, "G", "m1", "just chatting", "2026-01-01T00:00:01.000Z").await;

    let outcome = h.router.process_chat("G").await;
    assert_eq!(outcome, ProcessOutcome::Completed);
    assert!(h.messenger.sent.lock().unwrap().is_empty());
    assert!(h.store.agent_cursor("G").await.unwrap().is_none());
}

#[tokio::test]
async fn register_on_fresh_private_chat_creates_main_session() {
    let h = harness("exit 0").await;

    let event = InboundEvent {
        id: "m1".to_string(),
        chat_id: "P".to_string(),
        sender_id: "u1".to_string(),
        sender_name: "owner".to_string(),
        content: "/register".to_string(),
        timestamp: "2026-01-01T00:00:01.000Z".to_string(),
        chat_kind: ChatKind::Private,
        chat_name: None,
    };
    h.store
        .upsert_chat("P", None, "private", &event.timestamp)
        .await
        .unwrap();
    h.router.handle_unregistered_command(&event).await;

    let main = h.registry.main().expect("main workspace created");
    assert!(main.is_main);
    assert_eq!(main.folder, "main");
    assert_eq!(main.allowed_users.as_deref(), Some(&["u1".to_string()][..]));

    let sent = h.messenger.sent.lock().unwrap();
    assert!(sent[0].1.contains("main session"));
}

#[tokio::test]
async fn in_band_command_is_synchronous_and_moves_the_cursor() {
    let h = harness("exit 7").await; // commands must never spawn the agent
    register_group(&h, "G", "garden", true).await;
    h.store.store_session("garden", "sess-old").await.unwrap();

    insert(&h, "G", "m1", "/new", "2026-01-01T00:00:01.000Z").await;

    let outcome = h.router.process_chat("G").await;
    assert_eq!(outcome, ProcessOutcome::Completed);
    assert!(h.store.session_for("garden").await.unwrap().is_none());
    assert_eq!(
        h.store.agent_cursor("G").await.unwrap().as_deref(),
        Some("2026-01-01T00:00:01.000Z")
    );
    let sent = h.messenger.sent.lock().unwrap();
    assert!(sent[0].1.contains("fresh session"));
}

#[tokio::test]
async fn agent_timeout_yields_retry_and_keeps_the_cursor() {
    let h = harness("sleep 30").await;
    register_group(&h, "G", "garden", true).await;
    // Tight per-workspace timeout override.
    let mut workspace = h.registry.get("G").unwrap();
    workspace.container = Some(WorkspaceContainerConfig {
        additional_mounts: vec![],
        timeout_secs: Some(1),
    });
    h.store.register_workspace(&workspace).await.unwrap();
    h.registry.reload(&h.store).await.unwrap();

    insert(&h, "G", "m1", "@andy slow task", "2026-01-01T00:00:01.000Z").await;

    let outcome = h.router.process_chat("G").await;
    assert_eq!(outcome, ProcessOutcome::Retry);
    assert!(h.store.agent_cursor("G").await.unwrap().is_none());
    assert!(h.messenger.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn crash_after_payload_still_counts_as_success() {
    let script = format!("{}; exit 3", success_script("made it"));
    let h = harness(&script).await;
    register_group(&h, "G", "garden", true).await;

    insert(&h, "G", "m1", "@andy do it", "2026-01-01T00:00:01.000Z").await;

    let outcome = h.router.process_chat("G").await;
    assert_eq!(outcome, ProcessOutcome::Completed);
    let sent = h.messenger.sent.lock().unwrap();
    assert_eq!(sent[0].1, "Andy: made it");
}

#[tokio::test]
async fn crash_without_payload_is_a_retry() {
    let h = harness("echo 'no payload here'; exit 3").await;
    register_group(&h, "G", "garden", true).await;

    insert(&h, "G", "m1", "@andy do it", "2026-01-01T00:00:01.000Z").await;

    let outcome = h.router.process_chat("G").await;
    assert_eq!(outcome, ProcessOutcome::Retry);
    assert!(h.store.agent_cursor("G").await.unwrap().is_none());
}

#[tokio::test]
async fn staged_scheduled_task_runs_and_logs() {
    let h = harness(&success_script("report ready")).await;
    register_group(&h, "G", "garden", false).await;

    let task_id = h
        .store
        .create_task(&NewTask {
            folder: "garden".to_string(),
            chat_id: "G".to_string(),
            prompt: "make the report".to_string(),
            kind: ScheduleKind::Once,
            schedule_value: "2026-01-01T00:00:00Z".to_string(),
            context_mode: ContextMode::Isolated,
            next_run: Some("2026-01-01T00:00:00.000Z".to_string()),
        })
        .await
        .unwrap();
    let task = h.store.get_task(task_id).await.unwrap().unwrap();

    // Stage and process exactly as the scheduler + queue would.
    h.stage.stage(task).await;
    let outcome = h.router.process_chat("G").await;
    assert_eq!(outcome, ProcessOutcome::Completed);

    let runs = h.store.recent_task_runs(task_id, 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].success);
    assert_eq!(runs[0].result.as_deref(), Some("report ready"));

    // Isolated mode keeps its session under the task key, not the folder.
    assert_eq!(
        h.store
            .session_for(&format!("task-{task_id}"))
            .await
            .unwrap()
            .as_deref(),
        Some("sess-next")
    );
    assert!(h.store.session_for("garden").await.unwrap().is_none());

    let sent = h.messenger.sent.lock().unwrap();
    assert_eq!(sent[0].1, "Andy: report ready");
}
