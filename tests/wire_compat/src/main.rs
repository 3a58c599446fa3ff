fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::future::Future;
    use std::path::{Path, PathBuf};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use linkdeploy_agent_server::{AgentSession, SessionSettings};
    use linkdeploy_hub_deploy::{
        ControllerSession, DeployEvent, DeployOptions, DeployOrchestrator, Project, RetryPolicy,
    };
    use linkdeploy_protocol::constants::ARCHIVE_NAME;
    use linkdeploy_protocol::{Command, DeploymentConfig};
    use linkdeploy_transfer::{ArchiveBlob, build_archive};
    use linkdeploy_transport::{Link, LinkError, LinkOpener};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    const WAIT: Duration = Duration::from_secs(10);

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_fixture(name: &str) -> Vec<u8> {
        let path = fixtures_dir().join(name);
        fs::read(&path).unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()))
    }

    fn agent_settings(root: &Path) -> SessionSettings {
        SessionSettings {
            app_dir: root.join("app"),
            staging_file: root.join("staging").join(ARCHIVE_NAME),
            payload_timeout: Duration::from_secs(5),
            ..SessionSettings::default()
        }
    }

    /// Starts an agent on one end of an in-memory link and returns the other.
    fn spawn_agent(settings: SessionSettings) -> Link {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut session = AgentSession::new(Link::new(a), settings);
        tokio::spawn(async move { session.run(CancellationToken::new()).await });
        Link::new(b)
    }

    fn write_project(dir: &Path, descriptor: &str, files: &[(&str, &str)]) {
        fs::write(dir.join("config.json"), descriptor).unwrap();
        for (name, body) in files {
            fs::write(dir.join(name), body).unwrap();
        }
    }

    // ---- Descriptor ----

    #[test]
    fn legacy_descriptor_parses_with_defaults() {
        let raw = load_fixture("legacy_config.json");
        let config = DeploymentConfig::from_json(&raw).unwrap();

        assert_eq!(config.directory.as_deref(), Some("/home/pi/app"));
        assert_eq!(config.main, "main.py");
        assert_eq!(config.args, vec!["--verbose"]);
        assert_eq!(config.exclude, vec!["*.log", "__pycache__/**"]);
        assert_eq!(config.com_port, "COM7");
        assert_eq!(config.interpreter, vec!["python3", "-u"]);
    }

    #[test]
    fn descriptor_payload_keeps_legacy_fields() {
        let raw = load_fixture("legacy_config.json");
        let config = DeploymentConfig::from_json(&raw).unwrap();

        let ours: serde_json::Value = serde_json::from_slice(&config.to_json().unwrap()).unwrap();
        let theirs: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        for (key, value) in theirs.as_object().unwrap() {
            assert_eq!(ours.get(key), Some(value), "field {key}");
        }
    }

    // ---- Agent against legacy sender bytes ----

    #[tokio::test]
    async fn legacy_config_frame_is_acknowledged() {
        let tmp = tempfile::tempdir().unwrap();
        let mut peer = spawn_agent(agent_settings(tmp.path()));

        let payload = load_fixture("legacy_config.json");
        let mut wire = format!("CONFIG {}\n", payload.len()).into_bytes();
        wire.extend_from_slice(&payload);
        peer.write_all(&wire).await.unwrap();
        peer.flush().await.unwrap();

        assert_eq!(peer.read_line(WAIT).await.unwrap().as_deref(), Some("OK_CONFIG"));
    }

    #[tokio::test]
    async fn commands_before_config_are_gated() {
        let tmp = tempfile::tempdir().unwrap();
        let mut peer = spawn_agent(agent_settings(tmp.path()));

        peer.write_all(b"UPLOAD 12 0123abcd __upload__.tar.gz\nRUN\n")
            .await
            .unwrap();
        peer.flush().await.unwrap();

        assert_eq!(
            peer.read_line(WAIT).await.unwrap().as_deref(),
            Some("ERR_NO_CONFIG")
        );
        assert_eq!(
            peer.read_line(WAIT).await.unwrap().as_deref(),
            Some("ERR_NO_CONFIG")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn whole_legacy_session_in_one_burst() {
        let tmp = tempfile::tempdir().unwrap();
        let project = tmp.path().join("project");
        fs::create_dir_all(&project).unwrap();
        let deploy_dir = tmp.path().join("deployed");
        let descriptor = format!(
            r#"{{"directory": "{}", "main": "main.sh", "args": ["burst"], "interpreter": ["sh"]}}"#,
            deploy_dir.display()
        );
        write_project(&project, &descriptor, &[("main.sh", "echo \"hello $1\"\nexit 3\n")]);
        let config = DeploymentConfig::from_json(descriptor.as_bytes()).unwrap();
        let blob = build_archive(&project, &config).unwrap();

        // CONFIG, UPLOAD and RUN written back to back, as a sender that
        // never waits for acknowledgements would.
        let mut wire = format!("CONFIG {}\n", descriptor.len()).into_bytes();
        wire.extend_from_slice(descriptor.as_bytes());
        wire.extend_from_slice(
            format!("UPLOAD {} {} {ARCHIVE_NAME}\n", blob.size(), blob.digest()).as_bytes(),
        );
        wire.extend_from_slice(blob.bytes());
        wire.extend_from_slice(b"RUN\n");

        let mut peer = spawn_agent(agent_settings(tmp.path()));
        peer.write_all(&wire).await.unwrap();
        peer.flush().await.unwrap();

        let mut replies = Vec::new();
        while let Some(line) = peer.read_line(WAIT).await.unwrap() {
            let done = line.starts_with("EXIT");
            if !line.starts_with("PROGRESS") {
                replies.push(line);
            }
            if done {
                break;
            }
        }

        assert_eq!(
            replies,
            vec!["OK_CONFIG", "OK", "DONE", "RUNNING", "hello burst", "EXIT 3"]
        );
        assert!(deploy_dir.join("main.sh").is_file());
        assert!(deploy_dir.join("config.json").is_file());
    }

    // ---- Controller against legacy receiver replies ----

    fn legacy_replies() -> Vec<String> {
        String::from_utf8(load_fixture("legacy_receiver_replies.txt"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn small_archive() -> (tempfile::TempDir, ArchiveBlob) {
        let dir = tempfile::tempdir().unwrap();
        write_project(dir.path(), r#"{"main":"main.py"}"#, &[("main.py", "print('hi')\n")]);
        let blob = build_archive(dir.path(), &DeploymentConfig::default()).unwrap();
        (dir, blob)
    }

    #[tokio::test]
    async fn controller_sends_legacy_framing_and_reads_legacy_replies() {
        let (_dir, blob) = small_archive();
        let config_json = load_fixture("legacy_config.json");
        let replies = legacy_replies();

        let (a, b) = tokio::io::duplex(1024 * 1024);
        let mut link = Link::new(a);
        let mut agent = Link::new(b);

        let expected_digest = blob.digest().to_string();
        let expected_size = blob.size();
        let expected_config = config_json.clone();
        let agent_task = tokio::spawn(async move {
            let line = agent.read_line(WAIT).await.unwrap().unwrap();
            assert_eq!(line, format!("CONFIG {}", expected_config.len()));
            let payload = agent
                .read_exact_bytes(expected_config.len(), WAIT)
                .await
                .unwrap();
            assert_eq!(payload, expected_config);
            agent.write_line(&replies[0]).await.unwrap();

            let line = agent.read_line(WAIT).await.unwrap().unwrap();
            assert_eq!(
                line,
                format!("UPLOAD {expected_size} {expected_digest} {ARCHIVE_NAME}")
            );
            let Ok(Command::Upload(header)) = Command::parse(&line) else {
                panic!("not an upload header: {line}");
            };
            agent.write_line(&replies[1]).await.unwrap();
            agent
                .read_exact_bytes(header.size as usize, WAIT)
                .await
                .unwrap();
            for reply in &replies[2..5] {
                agent.write_line(reply).await.unwrap();
            }

            assert_eq!(agent.read_line(WAIT).await.unwrap().as_deref(), Some("RUN"));
            for reply in &replies[5..] {
                agent.write_line(reply).await.unwrap();
            }
            agent
        });

        let options = DeployOptions {
            settle: Duration::from_millis(10),
            ..DeployOptions::default()
        };
        let (tx, mut rx) = mpsc::channel(256);
        let mut session = ControllerSession::new(&mut link, &options, &tx);
        let report = session.run(&config_json, &blob).await.unwrap().unwrap();

        assert!(report.started);
        assert_eq!(report.exit_code, Some(1));
        assert_eq!(report.output_lines, 2);
        assert!(report.error.is_none());

        let mut progress = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DeployEvent::Progress { received, .. } = event {
                progress.push(received);
            }
        }
        assert_eq!(progress, vec![65_536, 131_072]);

        drop(session);
        drop(agent_task.await.unwrap());
    }

    // ---- End to end ----

    /// Spawns a fresh agent session per open; the first `drop_first`
    /// links are closed by the agent side straight away.
    struct LoopbackAgent {
        settings: SessionSettings,
        drop_first: u32,
        opened: AtomicU32,
    }

    impl LoopbackAgent {
        fn new(settings: SessionSettings, drop_first: u32) -> Self {
            Self {
                settings,
                drop_first,
                opened: AtomicU32::new(0),
            }
        }
    }

    impl LinkOpener for LoopbackAgent {
        fn open(&self) -> Pin<Box<dyn Future<Output = Result<Link, LinkError>> + Send + '_>> {
            let n = self.opened.fetch_add(1, Ordering::SeqCst);
            let link = if n < self.drop_first {
                let (a, _b) = tokio::io::duplex(64);
                Link::new(a)
            } else {
                spawn_agent(self.settings.clone())
            };
            Box::pin(async move { Ok(link) })
        }
    }

    fn fast_options() -> DeployOptions {
        DeployOptions {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: None,
            },
            ack_timeout: Duration::from_secs(5),
            result_idle_timeout: Duration::from_secs(5),
            observe_window: Duration::from_secs(5),
            settle: Duration::from_millis(10),
            run: true,
        }
    }

    #[cfg(unix)]
    fn shell_project(root: &Path) -> (PathBuf, PathBuf) {
        let project = root.join("project");
        fs::create_dir_all(&project).unwrap();
        let deploy_dir = root.join("target-dir");
        let descriptor = format!(
            r#"{{"directory":"{}","main":"main.sh","args":["e2e"],"exclude":["*.log"],"interpreter":["sh"]}}"#,
            deploy_dir.display()
        );
        write_project(
            &project,
            &descriptor,
            &[
                ("main.sh", "echo \"started $1\"\necho oops >&2\nexit 3\n"),
                ("debug.log", "not deployed"),
            ],
        );
        (project, deploy_dir)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deploy_project_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let (project_dir, deploy_dir) = shell_project(tmp.path());
        fs::create_dir_all(&deploy_dir).unwrap();
        fs::write(deploy_dir.join("stale.txt"), "from a previous deploy").unwrap();

        let agent = LoopbackAgent::new(agent_settings(tmp.path()), 0);
        let project = Project::load(&project_dir).unwrap();
        let mut orchestrator = DeployOrchestrator::new(fast_options());
        let mut rx = orchestrator.take_events().unwrap();

        let report = orchestrator.deploy_project(&agent, &project).await.unwrap();
        assert_eq!(report.attempts, 1);
        let run = report.run.unwrap();
        assert!(run.started);
        assert_eq!(run.exit_code, Some(3));

        assert!(deploy_dir.join("main.sh").is_file());
        assert!(deploy_dir.join("config.json").is_file());
        assert!(!deploy_dir.join("debug.log").exists());
        assert!(!deploy_dir.join("stale.txt").exists());

        let mut output = Vec::new();
        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            if let DeployEvent::Output { line } = &event {
                output.push(line.clone());
            }
            last = Some(event);
        }
        assert!(output.contains(&"started e2e".to_string()));
        assert!(output.contains(&"oops".to_string()));
        assert_eq!(last, Some(DeployEvent::Completed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dead_link_is_retried_against_a_live_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let (project_dir, deploy_dir) = shell_project(tmp.path());

        let agent = LoopbackAgent::new(agent_settings(tmp.path()), 1);
        let project = Project::load(&project_dir).unwrap();
        let mut orchestrator = DeployOrchestrator::new(fast_options());
        let mut rx = orchestrator.take_events().unwrap();

        let report = orchestrator.deploy_project(&agent, &project).await.unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(report.run.and_then(|r| r.exit_code), Some(3));
        assert!(deploy_dir.join("main.sh").is_file());

        let mut failures = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, DeployEvent::AttemptFailed { attempt: 1, .. }) {
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn no_run_stops_after_done() {
        let tmp = tempfile::tempdir().unwrap();
        let project_dir = tmp.path().join("project");
        fs::create_dir_all(&project_dir).unwrap();
        let deploy_dir = tmp.path().join("only-upload");
        let descriptor = format!(
            r#"{{"directory":"{}","main":"main.py"}}"#,
            deploy_dir.display().to_string().replace('\\', "/")
        );
        write_project(&project_dir, &descriptor, &[("main.py", "print('hi')\n")]);

        let agent = LoopbackAgent::new(agent_settings(tmp.path()), 0);
        let project = Project::load(&project_dir).unwrap();
        let orchestrator = DeployOrchestrator::new(DeployOptions {
            run: false,
            ..fast_options()
        });

        let report = orchestrator.deploy_project(&agent, &project).await.unwrap();
        assert!(report.run.is_none());
        assert!(deploy_dir.join("main.py").is_file());
    }
}
