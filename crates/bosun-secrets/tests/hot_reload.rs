//! Hot-reload behavior of the secret agent against a real filesystem.

use std::path::Path;
use std::time::Duration;

use bosun_secrets::SecretAgent;

fn write_file(path: &Path, content: &[u8]) {
    std::fs::write(path, content).unwrap();
}

/// Poll until `check` passes or the deadline expires.
async fn eventually<F: Fn() -> bool>(deadline: Duration, check: F) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn reload_picks_up_changed_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("secret");
    write_file(&path, b"1");

    let agent = SecretAgent::with_tick_interval(Duration::from_millis(50));
    agent.add(&path).await.unwrap();
    assert_eq!(agent.get_secret(&path).unwrap(), b"1");

    // Let the mtime advance past the initial observation before rewriting.
    tokio::time::sleep(Duration::from_millis(80)).await;
    write_file(&path, b"2");

    let reloaded = eventually(Duration::from_secs(3), || {
        agent.get_secret(&path).as_deref() == Some(b"2".as_slice())
    })
    .await;
    assert!(reloaded, "agent never observed the rewritten secret");
    agent.shutdown();
}

#[tokio::test]
async fn reload_refreshes_the_censorer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("secret");
    write_file(&path, b"first-token");

    let agent = SecretAgent::with_tick_interval(Duration::from_millis(50));
    agent.add(&path).await.unwrap();
    let censorer = agent.censorer();
    assert_eq!(censorer.censor_str("x first-token y"), "x *********** y");

    tokio::time::sleep(Duration::from_millis(80)).await;
    write_file(&path, b"second-token");

    let swapped = eventually(Duration::from_secs(3), || {
        censorer.censor_str("second-token") == "************"
    })
    .await;
    assert!(swapped, "censorer never picked up the new secret");
    agent.shutdown();
}

#[tokio::test]
async fn parse_failure_keeps_previous_typed_value() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("number");
    write_file(&path, b"1");

    let agent = SecretAgent::with_tick_interval(Duration::from_millis(50));
    let value = agent
        .add_with_parser(&path, |bytes| {
            let text = std::str::from_utf8(bytes)?;
            Ok(text.parse::<u64>()?)
        })
        .await
        .unwrap();
    assert_eq!(*value.get(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    write_file(&path, b"not-a-number");

    // Give the reloader several ticks to observe the bad write.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*value.get(), 1, "parse failure must keep the old value");
    assert_eq!(
        agent.get_secret(&path).unwrap(),
        b"1",
        "raw bytes must stay in sync with the parsed value"
    );

    // A subsequent good write advances both.
    write_file(&path, b"2");
    let advanced = eventually(Duration::from_secs(3), || *value.get() == 2).await;
    assert!(advanced, "agent never recovered from the bad write");
    assert_eq!(agent.get_secret(&path).unwrap(), b"2");
    agent.shutdown();
}

#[tokio::test]
async fn reload_rejects_internal_whitespace() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("token");
    write_file(&path, b"good-token");

    let agent = SecretAgent::with_tick_interval(Duration::from_millis(50));
    agent.add(&path).await.unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    write_file(&path, b"bad token with spaces");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        agent.get_secret(&path).unwrap(),
        b"good-token",
        "a token with internal whitespace must not be published"
    );
    agent.shutdown();
}
