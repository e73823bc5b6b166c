//! End-to-end template engine behavior against the scripted evaluator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use alder_adp::{AdpConfig, AdpEngine, AdpError, AdpShared};
use alder_base::Time;
use alder_script::testing::ScriptedEvaluator;

fn engine_with(config: AdpConfig) -> AdpEngine {
    let shared = AdpShared::new(config);
    AdpEngine::new(shared, Box::new(ScriptedEvaluator::new()))
}

fn engine() -> AdpEngine {
    engine_with(AdpConfig::default())
}

fn engine_rooted(root: PathBuf) -> AdpEngine {
    engine_with(AdpConfig {
        pageroot: root,
        ..Default::default()
    })
}

#[test]
fn inline_template_renders() {
    let mut engine = engine();
    let out = engine
        .eval_string("<html><% set x 5 %>X=<%= $x %></html>", &[])
        .unwrap();
    assert_eq!(out, "<html>X=5</html>");
}

#[test]
fn single_script_mode_renders_identically() {
    let mut engine = engine();
    engine.flags.single = true;
    let out = engine
        .eval_string("<html><% set x 5 %>X=<%= $x %></html>", &[])
        .unwrap();
    assert_eq!(out, "<html>X=5</html>");
}

#[test]
fn file_pages_render_and_cache_compiled_scripts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("page.adp");
    std::fs::write(&path, "a<%= $v %>b").unwrap();

    let mut engine = engine_rooted(dir.path().to_path_buf());
    engine.evaluator_mut().set_var("v", "1");
    assert_eq!(engine.run_file(&path, &[], None).unwrap(), "a1b");
    // Same page again; compiled handles are reused, fresh var value seen.
    engine.evaluator_mut().set_var("v", "2");
    assert_eq!(engine.run_file(&path, &[], None).unwrap(), "a2b");
}

#[test]
fn relative_paths_resolve_against_the_page_root() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.adp"), "rooted").unwrap();
    let mut engine = engine_rooted(dir.path().to_path_buf());
    let out = engine.run_file(std::path::Path::new("index.adp"), &[], None).unwrap();
    assert_eq!(out, "rooted");
}

#[test]
fn default_extension_applies() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("home.adp"), "home page").unwrap();
    let mut engine = engine_with(AdpConfig {
        pageroot: dir.path().to_path_buf(),
        defaultextension: Some("adp".to_string()),
        ..Default::default()
    });
    let out = engine.run_file(std::path::Path::new("home"), &[], None).unwrap();
    assert_eq!(out, "home page");
}

#[test]
fn stale_page_is_reparsed_after_modification() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("page.adp");
    std::fs::write(&path, "version one").unwrap();

    let mut engine = engine_rooted(dir.path().to_path_buf());
    assert_eq!(engine.run_file(&path, &[], None).unwrap(), "version one");

    // A different size guarantees the identity tuple changes even on
    // coarse-mtime filesystems.
    std::fs::write(&path, "version two!").unwrap();
    assert_eq!(engine.run_file(&path, &[], None).unwrap(), "version two!");
}

#[test]
fn include_renders_into_the_enclosing_output() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("inner.adp"), "INNER").unwrap();
    let outer = dir.path().join("outer.adp");
    std::fs::write(&outer, "before-after").unwrap();

    // Drive include directly: render the outer page, then include the
    // inner one into the top-level buffer.
    let mut engine = engine_rooted(dir.path().to_path_buf());
    let out = engine.run_file(&outer, &[], None).unwrap();
    assert_eq!(out, "before-after");
    engine
        .include(std::path::Path::new(&dir.path().join("inner.adp")), &[], None)
        .unwrap();
}

#[test]
fn result_cache_serves_stale_scripts_until_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cached.adp");
    std::fs::write(&path, "value=<%= $counter %>").unwrap();

    let mut engine = engine_rooted(dir.path().to_path_buf());
    engine.flags.cache = true;
    engine.evaluator_mut().set_var("counter", "1");

    let expires = Some(Time::from_millis(200));
    assert_eq!(engine.run_file(&path, &[], expires).unwrap(), "value=1");

    // The script result is baked into the cache; a changed variable is
    // not observed while the cache is fresh.
    engine.evaluator_mut().set_var("counter", "2");
    assert_eq!(engine.run_file(&path, &[], expires).unwrap(), "value=1");

    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(engine.run_file(&path, &[], expires).unwrap(), "value=2");
}

#[test]
fn uncached_run_always_reexecutes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("live.adp");
    std::fs::write(&path, "v=<%= $counter %>").unwrap();

    let mut engine = engine_rooted(dir.path().to_path_buf());
    engine.evaluator_mut().set_var("counter", "1");
    assert_eq!(engine.run_file(&path, &[], None).unwrap(), "v=1");
    engine.evaluator_mut().set_var("counter", "2");
    assert_eq!(engine.run_file(&path, &[], None).unwrap(), "v=2");
}

#[test]
fn script_errors_continue_by_default() {
    let mut engine = engine();
    let out = engine
        .eval_string("a<% error broken %>b", &[])
        .unwrap();
    assert_eq!(out, "ab", "rendering continues past the failed block");
}

#[test]
fn strict_mode_aborts_on_error() {
    let mut engine = engine();
    engine.flags.strict = true;
    let err = engine
        .eval_string("a<% error broken %>b", &[])
        .unwrap_err();
    match err {
        AdpError::Script(e) => assert_eq!(e.info, "broken"),
        other => panic!("expected script error, got {other:?}"),
    }
}

#[test]
fn displayerror_renders_the_message() {
    let mut engine = engine();
    engine.flags.displayerror = true;
    let out = engine.eval_string("a<% error oops %>b", &[]).unwrap();
    assert!(out.contains("adp error: oops"), "got {out}");
}

#[test]
fn evaluator_timeouts_become_adp_timeouts() {
    let mut engine = engine();
    let err = engine
        .eval_string("a<% timeout too slow %>b", &[])
        .unwrap_err();
    assert_eq!(err, AdpError::Timeout);
}

#[test]
fn missing_file_reports_stat_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = engine_rooted(dir.path().to_path_buf());
    let err = engine
        .run_file(std::path::Path::new("absent.adp"), &[], None)
        .unwrap_err();
    match err {
        AdpError::File { op, .. } => assert_eq!(op, "stat"),
        other => panic!("expected stat failure, got {other:?}"),
    }
}

#[test]
fn error_page_renders_for_failed_pages() {
    let dir = tempfile::tempdir().unwrap();
    let errorpage = dir.path().join("error.adp");
    std::fs::write(&errorpage, "error page body").unwrap();
    let broken = dir.path().join("broken.adp");
    std::fs::write(&broken, "<% error doomed %>").unwrap();

    let mut engine = engine_with(AdpConfig {
        pageroot: dir.path().to_path_buf(),
        errorpage: Some(errorpage),
        ..Default::default()
    });
    engine.flags.strict = true;
    let out = engine.run_file(&broken, &[], None).unwrap();
    assert_eq!(out, "error page body");
}

#[test]
fn concurrent_sources_share_one_parse() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.adp");
    std::fs::write(&path, "shared body").unwrap();

    let shared = AdpShared::new(AdpConfig {
        pageroot: dir.path().to_path_buf(),
        ..Default::default()
    });

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let shared = Arc::clone(&shared);
            let path = path.clone();
            std::thread::spawn(move || {
                let mut engine = AdpEngine::new(shared, Box::new(ScriptedEvaluator::new()));
                engine.run_file(&path, &[], None).unwrap()
            })
        })
        .collect();
    for t in threads {
        assert_eq!(t.join().unwrap(), "shared body");
    }
}
