//! Asynchronous package installation and removal.
//!
//! The [`PackageManager`] queues [`TaskId`]-addressed tasks and runs them on
//! worker threads, one at a time. Installations stream the archive into a
//! `<id>+` staging directory, verify digest and signatures, wait for the
//! coordinator's acknowledge and then swap the staging directory into place
//! atomically (`<id>-` backup, rename, delete backup). Removals are the
//! inverse. All state transitions and failures are published as
//! [`TaskEvent`]s in the order they occur.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

mod manager;
mod secret;
mod task;

pub use manager::{PackageManager, PackageManagerBuilder, SigningPolicy};
pub use secret::ensure_installation_secret;
pub use task::{TaskEvent, TaskId, TaskState};

#[cfg(test)]
mod tests {
    use super::*;
    use hangar_archive::{create_signature, InstallationReport, PackageCreator};
    use hangar_core::{CancelToken, ErrorKind, PackageId};
    use hangar_database::{Locations, PackageDatabase};
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(10);

    struct Fixture {
        dir: tempfile::TempDir,
        database: PackageDatabase,
        manager: PackageManager,
        events: crossbeam_channel::Receiver<TaskEvent>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_policy(SigningPolicy {
                allow_unsigned: true,
                ..SigningPolicy::default()
            })
        }

        fn with_policy(policy: SigningPolicy) -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir_all(dir.path().join("builtin")).unwrap();
            fs::create_dir_all(dir.path().join("installed")).unwrap();
            fs::create_dir_all(dir.path().join("docs")).unwrap();

            let database = PackageDatabase::builder()
                .built_in_dir(dir.path().join("builtin"))
                .installed_dir(dir.path().join("installed"))
                .cache_dir(dir.path().join("cache"))
                .build();
            database.parse(Locations::ALL).unwrap();

            let manager = PackageManager::builder(database.clone())
                .documents_dir(dir.path().join("docs"))
                .signing_policy(policy)
                .build()
                .unwrap();
            let events = manager.event_stream();
            Self {
                dir,
                database,
                manager,
                events,
            }
        }

        fn installed_dir(&self) -> PathBuf {
            self.dir.path().join("installed")
        }

        fn make_archive(&self, id: &str, display_name: &str) -> Vec<u8> {
            let src = self.dir.path().join("src").join(id);
            fs::create_dir_all(&src).unwrap();
            fs::write(
                src.join("info.yaml"),
                format!(
                    "formatType: am-package\nformatVersion: 1\n---\n\
                     id: {id}\ndisplayName:\n  en: {display_name}\ncode: main.qml\nruntime: qml\n"
                ),
            )
            .unwrap();
            fs::write(src.join("main.qml"), "Item {}\n").unwrap();

            let mut report = InstallationReport::new(PackageId::parse(id).unwrap());
            report.add_files(["info.yaml", "main.qml"]);
            report.disk_space_used = 128;

            let mut out = Vec::new();
            PackageCreator::new(&src, &report, &mut out)
                .create(&CancelToken::new())
                .unwrap();
            out
        }

        fn wait_for(&self, what: &str, mut pred: impl FnMut(&TaskEvent) -> bool) -> TaskEvent {
            loop {
                match self.events.recv_timeout(TIMEOUT) {
                    Ok(event) => {
                        if pred(&event) {
                            return event;
                        }
                    }
                    Err(_) => panic!("timed out waiting for {what}"),
                }
            }
        }

        fn wait_for_ack_request(&self, task: &TaskId) {
            self.wait_for("acknowledge request", |e| {
                matches!(e, TaskEvent::RequestingInstallationAcknowledge { task: t, .. } if t == task)
            });
        }
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn install_commits_only_after_acknowledge() {
        let fx = Fixture::new();
        let archive = fx.make_archive("com.example.hello", "Hello");

        let task = fx.manager.install_package(Box::new(std::io::Cursor::new(archive)));
        fx.wait_for_ack_request(&task);

        // nothing but the staging directory exists in the installed tree
        assert_eq!(dir_entries(&fx.installed_dir()), ["com.example.hello+"]);
        assert_eq!(
            fx.manager.task_state(&task),
            Some(TaskState::AwaitingAcknowledge)
        );

        fx.manager.acknowledge_package_installation(&task);
        fx.manager.wait_for_task(&task).unwrap();

        assert_eq!(dir_entries(&fx.installed_dir()), ["com.example.hello"]);
        let pkg_dir = fx.installed_dir().join("com.example.hello");
        assert!(pkg_dir.join("info.yaml").is_file());
        assert!(pkg_dir.join("main.qml").is_file());
        assert!(pkg_dir.join(".installation-report.yaml").is_file());

        let id = PackageId::parse("com.example.hello").unwrap();
        let pkg = fx.database.package(&id).expect("package registered");
        assert!(pkg.installation_report.is_some());
    }

    #[test]
    fn cancel_at_acknowledge_gate_leaves_tree_untouched() {
        let fx = Fixture::new();
        let before = dir_entries(&fx.installed_dir());
        let archive = fx.make_archive("com.example.hello", "Hello");

        let task = fx.manager.install_package(Box::new(std::io::Cursor::new(archive)));
        fx.wait_for_ack_request(&task);
        assert!(fx.manager.cancel_task(&task));

        let event = fx.wait_for("failure", |e| {
            matches!(e, TaskEvent::Failed { task: t, .. } if *t == task)
        });
        match event {
            TaskEvent::Failed { kind, .. } => assert_eq!(kind, ErrorKind::Canceled),
            _ => unreachable!(),
        }
        assert_eq!(dir_entries(&fx.installed_dir()), before);
        assert!(fx
            .database
            .package(&PackageId::parse("com.example.hello").unwrap())
            .is_none());
    }

    #[test]
    fn state_events_arrive_in_entry_order() {
        let fx = Fixture::new();
        let recorder = fx.manager.event_stream();
        let archive = fx.make_archive("com.example.hello", "Hello");
        let task = fx.manager.install_package(Box::new(std::io::Cursor::new(archive)));
        fx.wait_for_ack_request(&task);
        fx.manager.acknowledge_package_installation(&task);
        fx.manager.wait_for_task(&task).unwrap();

        // replay the recorded states for this task
        let mut states = Vec::new();
        while let Ok(event) = recorder.try_recv() {
            if let TaskEvent::StateChanged { task: t, state } = event {
                if t == task {
                    states.push(state);
                }
            }
        }
        assert_eq!(
            states,
            [
                TaskState::Queued,
                TaskState::Executing,
                TaskState::Installing,
                TaskState::AwaitingAcknowledge,
                TaskState::CleaningUp,
                TaskState::Finished,
            ]
        );
    }

    #[test]
    fn register_is_emitted_before_task_finished() {
        let fx = Fixture::new();
        let archive = fx.make_archive("com.example.hello", "Hello");

        let order = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let register_order = std::sync::Arc::clone(&order);
        fx.database.package_added().connect(move |_| {
            register_order.lock().push("register");
        });
        let finish_order = std::sync::Arc::clone(&order);
        fx.manager.events().connect(move |e| {
            if matches!(e, TaskEvent::Finished { .. }) {
                finish_order.lock().push("finished");
            }
        });

        let task = fx.manager.install_package(Box::new(std::io::Cursor::new(archive)));
        fx.wait_for_ack_request(&task);
        fx.manager.acknowledge_package_installation(&task);
        fx.manager.wait_for_task(&task).unwrap();

        assert_eq!(*order.lock(), ["register", "finished"]);
    }

    #[test]
    fn update_shadows_built_in_and_removal_restores_it() {
        let fx = Fixture::new();

        // a built-in package is part of the database before the update
        let builtin_dir = fx.dir.path().join("builtin").join("com.example.app");
        fs::create_dir_all(&builtin_dir).unwrap();
        fs::write(
            builtin_dir.join("info.yaml"),
            "formatType: am-package\nformatVersion: 1\n---\n\
             id: com.example.app\ndisplayName:\n  en: Old\ncode: main.qml\nruntime: qml\n",
        )
        .unwrap();
        let database = PackageDatabase::builder()
            .built_in_dir(fx.dir.path().join("builtin"))
            .installed_dir(fx.installed_dir())
            .cache_dir(fx.dir.path().join("cache2"))
            .build();
        database.parse(Locations::ALL).unwrap();
        let manager = PackageManager::builder(database.clone())
            .signing_policy(SigningPolicy {
                allow_unsigned: true,
                ..SigningPolicy::default()
            })
            .build()
            .unwrap();

        let id = PackageId::parse("com.example.app").unwrap();
        assert_eq!(database.package(&id).unwrap().name("en"), Some("Old"));

        let rx = manager.event_stream();
        let archive = fx.make_archive("com.example.app", "New");
        let task = manager.install_package(Box::new(std::io::Cursor::new(archive)));
        loop {
            match rx.recv_timeout(TIMEOUT).expect("event") {
                TaskEvent::RequestingInstallationAcknowledge { task: t, .. } if t == task => break,
                _ => {}
            }
        }
        manager.acknowledge_package_installation(&task);
        manager.wait_for_task(&task).unwrap();

        // exactly one visible entry with that id, carrying the updated name
        let resolved = database.package(&id).unwrap();
        assert_eq!(resolved.name("en"), Some("New"));
        assert!(database.built_in_has_removable_update(&resolved));

        let task = manager.remove_package(id.clone(), false);
        manager.wait_for_task(&task).unwrap();

        let restored = database.package(&id).unwrap();
        assert_eq!(restored.name("en"), Some("Old"));
        assert!(restored.built_in);
        assert!(!fx.installed_dir().join("com.example.app").exists());
    }

    #[test]
    fn unsigned_packages_are_rejected_by_default() {
        let fx = Fixture::with_policy(SigningPolicy::default());
        let archive = fx.make_archive("com.example.hello", "Hello");

        let task = fx.manager.install_package(Box::new(std::io::Cursor::new(archive)));
        let event = fx.wait_for("failure", |e| {
            matches!(e, TaskEvent::Failed { task: t, .. } if *t == task)
        });
        match event {
            TaskEvent::Failed { kind, message, .. } => {
                assert_eq!(kind, ErrorKind::Package);
                assert!(message.contains("unsigned"), "{message}");
            }
            _ => unreachable!(),
        }
        assert_eq!(dir_entries(&fx.installed_dir()), Vec::<String>::new());
    }

    #[test]
    fn developer_signature_is_verified() {
        let secret = [9u8; 32];
        let public = ed25519_dalek::SigningKey::from_bytes(&secret)
            .verifying_key()
            .to_bytes();
        let fx = Fixture::with_policy(SigningPolicy {
            allow_unsigned: false,
            developer_verification_key: Some(public.to_vec()),
            store_verification_key: None,
        });

        // build a signed archive: pack once to learn the digest
        let src = fx.dir.path().join("src").join("com.example.signed");
        fs::create_dir_all(&src).unwrap();
        fs::write(
            src.join("info.yaml"),
            "formatType: am-package\nformatVersion: 1\n---\n\
             id: com.example.signed\ndisplayName:\n  en: Signed\ncode: main.qml\nruntime: qml\n",
        )
        .unwrap();
        fs::write(src.join("main.qml"), "Item {}\n").unwrap();
        let mut report = InstallationReport::new(PackageId::parse("com.example.signed").unwrap());
        report.add_files(["info.yaml", "main.qml"]);

        let metadata = {
            let mut out = Vec::new();
            PackageCreator::new(&src, &report, &mut out)
                .create(&CancelToken::new())
                .unwrap()
        };
        let digest = hex::decode(&metadata.digest).unwrap();
        report.developer_signature = Some(create_signature(&digest, &secret).unwrap());
        let mut archive = Vec::new();
        PackageCreator::new(&src, &report, &mut archive)
            .create(&CancelToken::new())
            .unwrap();

        let task = fx.manager.install_package(Box::new(std::io::Cursor::new(archive)));
        fx.wait_for_ack_request(&task);
        fx.manager.acknowledge_package_installation(&task);
        fx.manager.wait_for_task(&task).unwrap();
        assert!(fx
            .database
            .package(&PackageId::parse("com.example.signed").unwrap())
            .is_some());
    }

    #[test]
    fn queued_task_can_be_force_canceled() {
        let fx = Fixture::new();
        let first = fx.make_archive("com.example.first", "First");
        let second = fx.make_archive("com.example.second", "Second");

        let blocking = fx.manager.install_package(Box::new(std::io::Cursor::new(first)));
        fx.wait_for_ack_request(&blocking);

        let queued = fx.manager.install_package(Box::new(std::io::Cursor::new(second)));
        assert_eq!(fx.manager.task_state(&queued), Some(TaskState::Queued));
        assert!(fx.manager.cancel_task(&queued));
        assert_eq!(fx.manager.task_state(&queued), Some(TaskState::Failed));

        fx.manager.acknowledge_package_installation(&blocking);
        fx.manager.wait_for_task(&blocking).unwrap();
        assert_eq!(dir_entries(&fx.installed_dir()), ["com.example.first"]);
    }

    #[test]
    fn tampered_archive_fails_with_archive_error() {
        let fx = Fixture::new();
        let mut archive = fx.make_archive("com.example.hello", "Hello");
        // corrupt the compressed stream tail (inside the footer region)
        let len = archive.len();
        archive[len - 40] ^= 0xff;

        let task = fx.manager.install_package(Box::new(std::io::Cursor::new(archive)));
        let event = fx.wait_for("failure", |e| {
            matches!(e, TaskEvent::Failed { task: t, .. } if *t == task)
        });
        match event {
            TaskEvent::Failed { kind, .. } => assert_eq!(kind, ErrorKind::Archive),
            _ => unreachable!(),
        }
        assert_eq!(dir_entries(&fx.installed_dir()), Vec::<String>::new());
    }

    #[test]
    fn removing_an_unknown_package_fails() {
        let fx = Fixture::new();
        let task = fx
            .manager
            .remove_package(PackageId::parse("com.example.ghost").unwrap(), false);
        let event = fx.wait_for("failure", |e| {
            matches!(e, TaskEvent::Failed { task: t, .. } if *t == task)
        });
        match event {
            TaskEvent::Failed { kind, .. } => assert_eq!(kind, ErrorKind::NotInstalled),
            _ => unreachable!(),
        }
    }

    #[test]
    fn purge_documents_flag_controls_document_removal() {
        let fx = Fixture::new();
        let archive = fx.make_archive("com.example.docs", "Docs");
        let task = fx.manager.install_package(Box::new(std::io::Cursor::new(archive)));
        fx.wait_for_ack_request(&task);
        fx.manager.acknowledge_package_installation(&task);
        fx.manager.wait_for_task(&task).unwrap();

        let docs = fx.dir.path().join("docs").join("com.example.docs");
        fs::create_dir_all(&docs).unwrap();
        fs::write(docs.join("note.txt"), "keep me").unwrap();

        let id = PackageId::parse("com.example.docs").unwrap();
        let task = fx.manager.remove_package(id.clone(), false);
        fx.manager.wait_for_task(&task).unwrap();
        assert!(docs.join("note.txt").exists(), "documents must be preserved");

        // reinstall, then purge
        let archive = fx.make_archive("com.example.docs", "Docs");
        let task = fx.manager.install_package(Box::new(std::io::Cursor::new(archive)));
        fx.wait_for_ack_request(&task);
        fx.manager.acknowledge_package_installation(&task);
        fx.manager.wait_for_task(&task).unwrap();

        let task = fx.manager.remove_package(id, true);
        fx.manager.wait_for_task(&task).unwrap();
        assert!(!docs.exists(), "documents must be purged");
    }
}
