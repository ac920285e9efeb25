//! Architectural rules for the relay crates

use architectural_enforcement::{production_sources, relay_sources, violations};

#[test]
fn test_sources_found() {
    let files = relay_sources();
    assert!(
        files.iter().any(|f| f.file_name() == "registry.rs"),
        "relay sources not found; workspace layout changed?"
    );
}

#[test]
fn test_no_thread_sleep_in_production() {
    let found = violations(&relay_sources(), &["thread::sleep", "std::thread::sleep"]);
    assert!(
        found.is_empty(),
        "blocking sleeps in production code (use tokio::time):\n{}",
        found.join("\n")
    );
}

#[test]
fn test_registry_is_single_owner() {
    let others: Vec<_> = production_sources("relay/core/src")
        .into_iter()
        .filter(|f| f.file_name() != "registry.rs")
        .collect();
    let found = violations(
        &others,
        &["HashMap<ConversationId, Connection>", "struct Connection {"],
    );
    assert!(
        found.is_empty(),
        "connection entries owned outside registry.rs:\n{}",
        found.join("\n")
    );
}

#[test]
fn test_no_lazy_globals() {
    let found = violations(
        &relay_sources(),
        &["lazy_static!", "OnceLock<", "OnceCell<", "static mut "],
    );
    assert!(
        found.is_empty(),
        "process-wide state must go through explicit init/reset:\n{}",
        found.join("\n")
    );
}

#[test]
fn test_no_unwrap_in_core() {
    let found = violations(&production_sources("relay/core/src"), &[".unwrap()", ".expect("]);
    assert!(
        found.is_empty(),
        "unwrap/expect on production paths:\n{}",
        found.join("\n")
    );
}
