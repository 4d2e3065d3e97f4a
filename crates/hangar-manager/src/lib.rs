//! Application lifecycle management for Hangar.
//!
//! This crate hosts the live application/package objects, the container and
//! runtime factories with the default `process` backend, the quick-launch
//! pool, the debug-wrapper grammar, intent routing, and the
//! [`ApplicationManager`] tying it all together.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod application;
mod container;
pub mod debugwrapper;
mod intents;
mod manager;
mod model;
mod process_backend;
mod quicklaunch;
mod runtime;

pub use application::{Application, ExitInfo, ExitStatus, Package, RunState};
pub use container::{Container, ContainerFactory, ContainerManager};
pub use intents::{
    IntentFailure, IntentPhase, IntentRequest, IntentServer, IntentTimeouts,
};
pub use manager::{ApplicationManager, ApplicationManagerConfig, OpenUrlRequest};
pub use model::{role_value, Role, RoleValue};
pub use process_backend::{ProcessContainer, ProcessContainerManager, ProcessRuntime, ProcessRuntimeManager};
pub use quicklaunch::{QuickLaunch, QuickLaunchConfig};
pub use runtime::{InProcessRuntimeManager, Runtime, RuntimeFactory, RuntimeManager};

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use hangar_core::PackageId;
    use hangar_database::{Locations, PackageDatabase};
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(10);

    struct Fixture {
        _dir: tempfile::TempDir,
        manager: ApplicationManager,
        states: crossbeam_channel::Receiver<(PackageId, RunState)>,
    }

    fn write_app(builtin: &Path, id: &str, extra_manifest: &str) {
        let dir = builtin.join(id);
        fs::create_dir_all(&dir).unwrap();
        let runtime_line = if extra_manifest.contains("runtime:") {
            ""
        } else {
            "runtime: process\n"
        };
        fs::write(
            dir.join("info.yaml"),
            format!(
                "formatType: am-package\nformatVersion: 1\n---\n\
                 id: {id}\ndisplayName:\n  en: {id}\ncode: app.sh\n{runtime_line}{extra_manifest}"
            ),
        )
        .unwrap();
        let script = dir.join("app.sh");
        fs::write(&script, "#!/bin/sh\nwhile true; do sleep 1; done\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    impl Fixture {
        fn new(apps: &[(&str, &str)], config: ApplicationManagerConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let builtin = dir.path().join("builtin");
            fs::create_dir_all(&builtin).unwrap();
            for (id, extra) in apps {
                write_app(&builtin, id, extra);
            }

            let database = PackageDatabase::builder()
                .built_in_dir(&builtin)
                .cache_dir(dir.path().join("cache"))
                .build();
            database.parse(Locations::ALL).unwrap();

            let container_factory = Arc::new(ContainerFactory::new());
            container_factory.register(Arc::new(ProcessContainerManager));
            let runtime_factory = Arc::new(RuntimeFactory::new());
            runtime_factory.register(Arc::new(ProcessRuntimeManager));
            runtime_factory.register(Arc::new(InProcessRuntimeManager::new("qml")));

            let manager =
                ApplicationManager::new(database, container_factory, runtime_factory, config);

            let (tx, rx) = crossbeam_channel::unbounded();
            manager.application_run_state_changed().connect(move |event| {
                let _ = tx.send(event.clone());
            });

            Self {
                _dir: dir,
                manager,
                states: rx,
            }
        }

        fn wait_for_state(&self, app_id: &PackageId, state: RunState) {
            loop {
                match self.states.recv_timeout(TIMEOUT) {
                    Ok((id, s)) if id == *app_id && s == state => return,
                    Ok(_) => {}
                    Err(_) => panic!("timed out waiting for {app_id} to reach {state:?}"),
                }
            }
        }
    }

    fn id(s: &str) -> PackageId {
        PackageId::parse(s).unwrap()
    }

    #[test]
    fn start_run_stop_lifecycle() {
        let fx = Fixture::new(
            &[("com.example.hello", "")],
            ApplicationManagerConfig::default(),
        );
        let app_id = id("com.example.hello");

        assert!(fx.manager.start_application(&app_id, None));
        fx.wait_for_state(&app_id, RunState::Running);

        let app = fx.manager.application(&app_id).unwrap();
        assert_eq!(app.run_state(), RunState::Running);
        let runtime = fx.manager.current_runtime(&app_id).unwrap();
        let pid = runtime.process_id().expect("running process");
        assert!(pid > 0);
        assert_eq!(fx.manager.identify_application(pid), Some(app_id.clone()));

        fx.manager.stop_application(&app_id, false);
        fx.wait_for_state(&app_id, RunState::NotRunning);

        // NotRunning implies no attached runtime
        assert!(fx.manager.current_runtime(&app_id).is_none());
        assert_eq!(app.last_exit().status, ExitStatus::NormalExit);
    }

    #[test]
    fn starting_twice_reuses_the_runtime() {
        let fx = Fixture::new(
            &[("com.example.hello", "")],
            ApplicationManagerConfig::default(),
        );
        let app_id = id("com.example.hello");

        assert!(fx.manager.start_application(&app_id, None));
        fx.wait_for_state(&app_id, RunState::Running);
        let first = fx.manager.current_runtime(&app_id).unwrap().security_token();

        // second start activates instead of spawning a second process
        assert!(fx.manager.start_application(&app_id, Some("doc:///x")));
        let second = fx.manager.current_runtime(&app_id).unwrap().security_token();
        assert_eq!(first, second);

        fx.manager.stop_application(&app_id, true);
        fx.wait_for_state(&app_id, RunState::NotRunning);
    }

    #[test]
    fn unknown_and_blocked_apps_are_refused() {
        let fx = Fixture::new(
            &[("com.example.hello", "")],
            ApplicationManagerConfig::default(),
        );
        assert!(!fx.manager.start_application(&id("com.example.ghost"), None));

        let app_id = id("com.example.hello");
        fx.manager.application(&app_id).unwrap().block();
        let err = fx
            .manager
            .start_application_internal(&app_id, None, None, None, Vec::new())
            .unwrap_err();
        assert!(err.to_string().contains("blocked"), "{err}");
    }

    #[test]
    fn invalid_stdio_specification_is_refused() {
        let fx = Fixture::new(
            &[("com.example.hello", "")],
            ApplicationManagerConfig::default(),
        );
        let err = fx
            .manager
            .start_application_internal(
                &id("com.example.hello"),
                None,
                None,
                None,
                vec![-1, -1, -1, -1],
            )
            .unwrap_err();
        assert!(err.to_string().contains("IO redirection"), "{err}");
    }

    #[test]
    fn debug_wrapper_validation() {
        let fx = Fixture::new(
            &[
                ("com.example.hello", ""),
                ("com.example.ui", "runtime: qml\n"),
            ],
            ApplicationManagerConfig::default(),
        );

        // empty spec is fine (treated as no wrapper)
        assert!(fx
            .manager
            .start_application_internal(&id("com.example.hello"), None, None, Some(""), Vec::new())
            .is_ok());
        fx.wait_for_state(&id("com.example.hello"), RunState::Running);
        fx.manager.stop_application(&id("com.example.hello"), true);
        fx.wait_for_state(&id("com.example.hello"), RunState::NotRunning);

        // an invalid (whitespace-only) spec is rejected
        let err = fx
            .manager
            .start_application_internal(
                &id("com.example.hello"),
                None,
                None,
                Some("   "),
                Vec::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("debug-wrapper"), "{err}");
    }

    #[test]
    fn debug_wrapper_rejected_for_in_process_runtimes() {
        let fx = Fixture::new(
            &[("com.example.ui", "runtime: qml\n")],
            ApplicationManagerConfig::default(),
        );
        let err = fx
            .manager
            .start_application_internal(
                &id("com.example.ui"),
                None,
                None,
                Some("gdbserver :5555"),
                Vec::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("in-process"), "{err}");
    }

    #[test]
    fn single_process_mode_rejects_debug_wrappers() {
        let fx = Fixture::new(
            &[("com.example.hello", "")],
            ApplicationManagerConfig {
                single_process: true,
                ..ApplicationManagerConfig::default()
            },
        );
        let err = fx
            .manager
            .start_application_internal(
                &id("com.example.hello"),
                None,
                None,
                Some("strace -f"),
                Vec::new(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("single-process"), "{err}");
    }

    #[test]
    fn shutdown_stops_everything_and_finishes_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let fx = Fixture::new(
            &[("com.example.hello", "")],
            ApplicationManagerConfig::default(),
        );
        let app_id = id("com.example.hello");
        assert!(fx.manager.start_application(&app_id, None));
        fx.wait_for_state(&app_id, RunState::Running);

        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        fx.manager.shut_down_finished().connect(move |()| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        fx.manager.shut_down();
        fx.wait_for_state(&app_id, RunState::NotRunning);
        // give the emission a moment; it fires on the waiter thread
        let deadline = std::time::Instant::now() + TIMEOUT;
        while finished.load(Ordering::Relaxed) == 0 {
            assert!(std::time::Instant::now() < deadline, "shutDownFinished missing");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(finished.load(Ordering::Relaxed), 1);

        // no starts during/after shutdown
        let err = fx
            .manager
            .start_application_internal(&app_id, None, None, None, Vec::new())
            .unwrap_err();
        assert!(err.to_string().contains("shutdown"), "{err}");
    }

    #[test]
    fn compositor_gating_defers_the_start() {
        let fx = Fixture::new(
            &[("com.example.hello", "")],
            ApplicationManagerConfig {
                compositor_ready: false,
                ..ApplicationManagerConfig::default()
            },
        );
        let app_id = id("com.example.hello");

        assert!(fx.manager.start_application(&app_id, None));
        std::thread::sleep(Duration::from_millis(50));
        let app = fx.manager.application(&app_id).unwrap();
        assert_eq!(app.run_state(), RunState::NotRunning);

        fx.manager.notify_compositor_ready();
        fx.wait_for_state(&app_id, RunState::Running);
        fx.manager.stop_application(&app_id, true);
        fx.wait_for_state(&app_id, RunState::NotRunning);
    }

    #[test]
    fn quick_launch_pool_is_consulted() {
        let fx = Fixture::new(
            &[("com.example.hello", "")],
            ApplicationManagerConfig::default(),
        );
        let pool = QuickLaunch::new(
            Arc::new({
                let cf = ContainerFactory::new();
                cf.register(Arc::new(ProcessContainerManager));
                cf
            }),
            Arc::new({
                let rf = RuntimeFactory::new();
                rf.register(Arc::new(ProcessRuntimeManager));
                rf
            }),
            QuickLaunchConfig::default(),
        );
        while pool.rebuild() {}
        assert_eq!(pool.pool_size(), 1);
        fx.manager.set_quick_launch(Arc::clone(&pool));

        let app_id = id("com.example.hello");
        assert!(fx.manager.start_application(&app_id, None));
        fx.wait_for_state(&app_id, RunState::Running);

        let runtime = fx.manager.current_runtime(&app_id).unwrap();
        assert!(!runtime.is_quick_launcher(), "pooled runtime was attached");

        fx.manager.stop_application(&app_id, true);
        fx.wait_for_state(&app_id, RunState::NotRunning);
    }

    #[test]
    fn open_url_prefers_scheme_handlers_and_coordinator() {
        let fx = Fixture::new(
            &[
                (
                    "com.example.browser",
                    "mimeTypes:\n- x-scheme-handler/web\n- text/html\n",
                ),
                ("com.example.viewer", "mimeTypes:\n- text/plain\n"),
            ],
            ApplicationManagerConfig::default(),
        );

        // no coordinator: the first candidate is started directly
        assert!(fx.manager.open_url("web://example.org"));
        fx.wait_for_state(&id("com.example.browser"), RunState::Running);
        fx.manager.stop_application(&id("com.example.browser"), true);
        fx.wait_for_state(&id("com.example.browser"), RunState::NotRunning);

        // mime probe fallback
        assert!(fx.manager.open_url("file:///data/readme.txt"));
        fx.wait_for_state(&id("com.example.viewer"), RunState::Running);
        fx.manager.stop_application(&id("com.example.viewer"), true);
        fx.wait_for_state(&id("com.example.viewer"), RunState::NotRunning);

        // unroutable urls report failure
        assert!(!fx.manager.open_url("file:///data/movie.zzz"));

        // with a coordinator: the request is delegated
        let (tx, rx) = crossbeam_channel::unbounded();
        fx.manager.open_url_requested().connect(move |request| {
            let _ = tx.send(request.clone());
        });
        assert!(fx.manager.open_url("web://example.org"));
        let request = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(request.possible_app_ids, [id("com.example.browser")]);

        // rejecting an unknown candidate does not start anything
        fx.manager
            .acknowledge_open_url_request(&request.id, &id("com.example.viewer"));
        assert_eq!(
            fx.manager
                .application(&id("com.example.browser"))
                .unwrap()
                .run_state(),
            RunState::NotRunning
        );

        // a second round, this time acknowledged properly
        assert!(fx.manager.open_url("web://example.org"));
        let request = rx.recv_timeout(TIMEOUT).unwrap();
        fx.manager
            .acknowledge_open_url_request(&request.id, &id("com.example.browser"));
        fx.wait_for_state(&id("com.example.browser"), RunState::Running);
        fx.manager.stop_application(&id("com.example.browser"), true);
        fx.wait_for_state(&id("com.example.browser"), RunState::NotRunning);

        // rejected requests are dropped
        assert!(fx.manager.open_url("web://example.org"));
        let request = rx.recv_timeout(TIMEOUT).unwrap();
        fx.manager.reject_open_url_request(&request.id);
        fx.manager
            .acknowledge_open_url_request(&request.id, &id("com.example.browser"));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(
            fx.manager
                .application(&id("com.example.browser"))
                .unwrap()
                .run_state(),
            RunState::NotRunning
        );
    }

    #[test]
    fn container_selection_rules_pick_the_first_match() {
        let fx = Fixture::new(
            &[("com.example.hello", "")],
            ApplicationManagerConfig::default(),
        );
        fx.manager.set_container_selection_config(vec![
            ("org.other.*".into(), "lxc".into()),
            ("com.example.*".into(), "process".into()),
            ("*".into(), "lxc".into()),
        ]);

        let app_id = id("com.example.hello");
        assert!(fx.manager.start_application(&app_id, None));
        fx.wait_for_state(&app_id, RunState::Running);
        fx.manager.stop_application(&app_id, true);
        fx.wait_for_state(&app_id, RunState::NotRunning);

        // a rule resolving to an unregistered backend fails the start
        fx.manager
            .set_container_selection_config(vec![("*".into(), "lxc".into())]);
        let err = fx
            .manager
            .start_application_internal(&app_id, None, None, None, Vec::new())
            .unwrap_err();
        assert!(err.to_string().contains("container"), "{err}");
    }

    #[test]
    fn model_reports_roles_for_every_application() {
        let fx = Fixture::new(
            &[("com.example.hello", "version: '3.1'\n")],
            ApplicationManagerConfig::default(),
        );
        assert_eq!(fx.manager.count(), 1);
        assert_eq!(
            fx.manager.data(0, Role::Id),
            Some(RoleValue::String("com.example.hello".into()))
        );
        assert_eq!(
            fx.manager.data(0, Role::RuntimeName),
            Some(RoleValue::String("process".into()))
        );
        assert_eq!(
            fx.manager.data(0, Role::IsRemovable),
            Some(RoleValue::Bool(false)) // built-in
        );
        assert_eq!(fx.manager.data(1, Role::Id), None);
    }

    #[test]
    fn force_kill_reports_forced_exit() {
        let fx = Fixture::new(
            &[("com.example.hello", "")],
            ApplicationManagerConfig::default(),
        );
        let app_id = id("com.example.hello");
        assert!(fx.manager.start_application(&app_id, None));
        fx.wait_for_state(&app_id, RunState::Running);

        fx.manager.stop_application(&app_id, true);
        fx.wait_for_state(&app_id, RunState::NotRunning);
        let app = fx.manager.application(&app_id).unwrap();
        assert_eq!(app.last_exit().status, ExitStatus::ForcedExit);
    }
}
