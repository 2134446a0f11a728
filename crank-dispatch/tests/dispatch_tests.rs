use std::sync::{Arc, Mutex};

use crank_core::{Config, ConfigError, EventKey, HandlerSpec, Payload, SourceKind};
use crank_dispatch::{
    Catalog, CommandExecutor, HandlerError, HandlerObject, Invocation, PathEvent, RawEvent,
    Resolver, Router, ShellCommand,
};
use rstest::rstest;
use tempfile::TempDir;

#[derive(Default, Clone)]
struct RecordingExecutor(Arc<Mutex<Vec<ShellCommand>>>);

impl RecordingExecutor {
    fn commands(&self) -> Vec<String> {
        self.0
            .lock()
            .expect("lock")
            .iter()
            .map(|c| c.command.clone())
            .collect()
    }
}

impl CommandExecutor for RecordingExecutor {
    fn execute(&self, command: ShellCommand) -> Result<(), HandlerError> {
        self.0.lock().expect("lock").push(command);
        Ok(())
    }
}

/// Counts how often it was built and which callbacks ran.
struct Counter {
    calls: Arc<Mutex<Vec<String>>>,
}

impl HandlerObject for Counter {
    fn responds_to(&self, method: &str) -> bool {
        method.starts_with("on") || method == "record"
    }

    fn call(&mut self, method: &str, _invocation: &Invocation) -> Result<(), HandlerError> {
        self.calls.lock().expect("lock").push(method.to_string());
        Ok(())
    }
}

struct Harness {
    resolver: Resolver,
    executor: RecordingExecutor,
    built: Arc<Mutex<usize>>,
    calls: Arc<Mutex<Vec<String>>>,
}

fn harness() -> Harness {
    let executor = RecordingExecutor::default();
    let built = Arc::new(Mutex::new(0));
    let calls = Arc::new(Mutex::new(Vec::new()));

    let mut catalog = Catalog::with_builtins();
    let (factory_built, factory_calls) = (Arc::clone(&built), Arc::clone(&calls));
    catalog.register_class("tests.Counter", move || {
        *factory_built.lock().expect("lock") += 1;
        Box::new(Counter {
            calls: Arc::clone(&factory_calls),
        }) as Box<dyn HandlerObject>
    });

    Harness {
        resolver: Resolver::new(catalog, Arc::new(executor.clone())),
        executor,
        built,
        calls,
    }
}

#[test]
fn class_singleton_is_built_once_across_sections() {
    let mut h = harness();
    let mut config = Config::default();
    config
        .workspace
        .insert("NSWorkspaceDidWakeNotification", HandlerSpec::class("tests.Counter"));
    config
        .workspace
        .insert("NSWorkspaceWillSleepNotification", HandlerSpec::class("tests.Counter"));
    config.net_service.insert(
        "_ssh._tcp.",
        HandlerSpec::method("tests.Counter", "record"),
    );

    let mut router = Router::from_config(&config, &mut h.resolver).expect("router");
    assert_eq!(*h.built.lock().expect("lock"), 1);
    assert_eq!(h.resolver.singletons().constructed(), 1);

    router.dispatch(&RawEvent::new(
        SourceKind::Workspace,
        "NSWorkspaceWillSleepNotification",
        Payload::None,
    ));
    router.dispatch(&RawEvent::new(SourceKind::NetService, "_ssh._tcp.", Payload::None));
    router.dispatch(&RawEvent::new(
        SourceKind::Workspace,
        "NSWorkspaceDidWakeNotification",
        Payload::None,
    ));

    assert_eq!(*h.built.lock().expect("lock"), 1);
    assert_eq!(
        *h.calls.lock().expect("lock"),
        vec![
            "onNSWorkspaceWillSleepNotification",
            "record",
            "onNSWorkspaceDidWakeNotification"
        ]
    );
}

#[test]
fn key_matching_two_patterns_invokes_both_in_order_every_time() {
    let mut h = harness();
    let mut config = Config::default();
    config.dynamic_store.insert(
        "regexp:State:/Network/Interface/[^/]+/Link",
        HandlerSpec::command("link"),
    );
    config
        .dynamic_store
        .insert("regexp:State:/Network/Interface/", HandlerSpec::command("interface"));
    let mut router = Router::from_config(&config, &mut h.resolver).expect("router");

    let event = RawEvent::new(
        SourceKind::DynamicStore,
        "State:/Network/Interface/en0/Link",
        Payload::None,
    );
    for _ in 0..3 {
        let report = router.dispatch(&event);
        assert_eq!(report.matched, 2);
        assert_eq!(report.failed, 0);
    }
    assert_eq!(
        h.executor.commands(),
        vec!["link", "interface", "link", "interface", "link", "interface"]
    );
}

#[test]
fn pattern_must_match_from_start_of_key() {
    let mut h = harness();
    let mut config = Config::default();
    config
        .dynamic_store
        .insert("regexp:Network/", HandlerSpec::command("never"));
    let mut router = Router::from_config(&config, &mut h.resolver).expect("router");

    let report = router.dispatch(&RawEvent::new(
        SourceKind::DynamicStore,
        "State:/Network/Global/IPv4",
        Payload::None,
    ));
    assert!(report.is_unhandled());
    assert!(h.executor.commands().is_empty());
}

#[test]
fn pattern_handler_sees_its_captures() {
    let seen: Arc<Mutex<Vec<Vec<String>>>> = Arc::default();
    let mut catalog = Catalog::with_builtins();
    {
        let seen = Arc::clone(&seen);
        catalog.register_function("tests.captures", move |invocation: &Invocation| {
            seen.lock().expect("lock").push(invocation.captures());
            Ok(())
        });
    }
    let mut resolver = Resolver::new(catalog, Arc::new(RecordingExecutor::default()));
    let mut config = Config::default();
    config.dynamic_store.insert(
        "regexp:State:/Network/Interface/([^/]+)/Link",
        HandlerSpec::function("tests.captures"),
    );
    config
        .dynamic_store
        .insert("State:/Network/Global/IPv4", HandlerSpec::function("tests.captures"));
    let mut router = Router::from_config(&config, &mut resolver).expect("router");

    router.dispatch(&RawEvent::new(
        SourceKind::DynamicStore,
        "State:/Network/Interface/en1/Link",
        Payload::None,
    ));
    router.dispatch(&RawEvent::new(
        SourceKind::DynamicStore,
        "State:/Network/Global/IPv4",
        Payload::None,
    ));

    assert_eq!(
        *seen.lock().expect("lock"),
        vec![
            vec!["State:/Network/Interface/en1/Link".to_string(), "en1".to_string()],
            Vec::new(),
        ]
    );
}

#[rstest]
#[case::no_mode(HandlerSpec::default())]
#[case::command_and_function(HandlerSpec {
    command: Some("true".into()),
    function: Some("crank.log".into()),
    ..HandlerSpec::default()
})]
#[case::class_and_process(HandlerSpec {
    class: Some("tests.Counter".into()),
    process: Some("Mail".into()),
    ..HandlerSpec::default()
})]
fn specs_without_exactly_one_mode_fail_every_time(#[case] spec: HandlerSpec) {
    for _ in 0..2 {
        let mut h = harness();
        let mut config = Config::default();
        config.workspace.insert("NSWorkspaceDidWakeNotification", spec.clone());
        let err = match Router::from_config(&config, &mut h.resolver) {
            Err(err) => err,
            Ok(_) => panic!("invalid spec accepted"),
        };
        assert!(
            matches!(
                err,
                ConfigError::NoHandlerMode { .. } | ConfigError::ConflictingHandlerModes { .. }
            ),
            "got: {err}"
        );
    }
}

#[test]
fn every_callback_under_a_watch_runs_once_per_event() {
    let dir = TempDir::new().expect("tempdir");
    let root = std::fs::canonicalize(dir.path()).expect("canonical");
    let nested = root.join("a").join("b");
    std::fs::create_dir_all(&nested).expect("mkdir");

    let mut h = harness();
    let mut config = Config::default();
    config.fs_events.insert(
        root.display().to_string(),
        HandlerSpec::command("root"),
    );
    config.fs_events.insert(
        root.join("a").display().to_string(),
        HandlerSpec::command("a"),
    );
    let mut router = Router::from_config(&config, &mut h.resolver).expect("router");
    assert_eq!(router.watch_paths().len(), 2);

    let report = router.dispatch_path(&PathEvent::new(nested.join("changed.txt")));
    assert_eq!(report.matched, 2);
    assert_eq!(h.executor.commands(), vec!["root", "a"]);

    let report = router.dispatch(&RawEvent::new(
        SourceKind::FileSystem,
        root.join("top.txt").display().to_string(),
        Payload::None,
    ));
    assert_eq!(report.matched, 1);
    assert_eq!(h.executor.commands(), vec!["root", "a", "root"]);
}

#[test]
fn watch_handler_sees_path_environment() {
    let dir = TempDir::new().expect("tempdir");
    let root = std::fs::canonicalize(dir.path()).expect("canonical");

    let mut h = harness();
    let mut config = Config::default();
    config
        .fs_events
        .insert(root.display().to_string(), HandlerSpec::command("sync"));
    let mut router = Router::from_config(&config, &mut h.resolver).expect("router");

    router.dispatch_path(&PathEvent::new(root.join("x.txt")));
    let commands = h.executor.0.lock().expect("lock");
    assert_eq!(
        commands[0].env_var("CRANK_PATH"),
        Some(root.display().to_string().as_str())
    );
    assert_eq!(commands[0].env_var("CRANK_RECURSIVE"), Some("false"));
}

#[test]
fn failing_handler_does_not_stop_dispatch() {
    let mut h = harness();
    let mut config = Config::default();
    let key = EventKey::from("NSWorkspaceDidMountNotification");
    config.workspace.insert(key.clone(), HandlerSpec::function("tests.fail"));

    let mut catalog = Catalog::with_builtins();
    catalog.register_function("tests.fail", |_: &Invocation| {
        Err(HandlerError::new("volume is read-only"))
    });
    h.resolver = Resolver::new(catalog, Arc::new(h.executor.clone()));
    let mut router = Router::from_config(&config, &mut h.resolver).expect("router");

    for _ in 0..2 {
        let report = router.dispatch(&RawEvent::new(SourceKind::Workspace, key.clone(), Payload::None));
        assert_eq!((report.matched, report.failed), (1, 1));
    }
}
