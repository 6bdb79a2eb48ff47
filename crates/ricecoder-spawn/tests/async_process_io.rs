//! Line notifications from real child processes

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ricecoder_spawn::{AsyncProcessIo, LineReceived, ManagedChild, ProcessConfig, ProcessManager};

const HELPER: &str = env!("CARGO_BIN_EXE_spawn-helper");
const LONG: Duration = Duration::from_secs(10);

type Seen = Arc<Mutex<Vec<String>>>;

fn recorder() -> (Seen, impl Fn(&LineReceived) + Send + Sync + 'static) {
    let seen = Seen::default();
    let sink = Arc::clone(&seen);
    (seen, move |e: &LineReceived| sink.lock().push(e.line().to_string()))
}

async fn suspended(args: &[&str]) -> ManagedChild {
    let config = ProcessConfig::new(HELPER)
        .args(args.iter().copied())
        .redirect_all()
        .start_suspended(true);
    ProcessManager::new().spawn(config).await.unwrap()
}

#[tokio::test]
async fn test_output_lines_in_order() {
    let child = suspended(&["LINES=50"]).await;
    let io = AsyncProcessIo::new(child.io()).unwrap();
    let (seen, handler) = recorder();
    io.on_output_line(handler);
    io.start().unwrap();
    child.start().unwrap();

    assert!(io.wait_for_all_output(LONG).await);
    let expected: Vec<String> = (1..=50).map(|i| format!("LINE_{i}")).collect();
    assert_eq!(*seen.lock(), expected);
}

#[tokio::test]
async fn test_input_echoed_to_both_streams() {
    let child = suspended(&["OUTPUT", "ERROR"]).await;
    let io = AsyncProcessIo::new(child.io()).unwrap();
    let (out, out_handler) = recorder();
    let (err, err_handler) = recorder();
    io.on_output_line(out_handler);
    io.on_error_line(err_handler);
    io.start().unwrap();
    child.start().unwrap();

    let input = io.input().unwrap();
    input.write_line("foo").await.unwrap();
    input.write_line("bar").await.unwrap();
    input.close().await.unwrap();

    assert!(io.wait_for_all_output(LONG).await);
    assert!(io.wait_for_all_error(LONG).await);
    assert_eq!(*out.lock(), vec!["foo", "bar"]);
    assert_eq!(*err.lock(), vec!["foo", "bar"]);
}

#[tokio::test]
async fn test_output_not_drained_while_child_runs() {
    let child = suspended(&["LINES=4", "SLEEP=30000"]).await;
    let io = AsyncProcessIo::new(child.io()).unwrap();
    let (seen, handler) = recorder();
    io.on_output_line(handler);
    io.start().unwrap();
    child.start().unwrap();

    tokio::time::timeout(LONG, async {
        while seen.lock().len() < 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(!io.wait_for_all_output(Duration::from_millis(300)).await);

    child.kill(0).unwrap();
    assert!(io.wait_for_all_output(LONG).await);
    assert_eq!(seen.lock().len(), 4);
}

#[tokio::test]
async fn test_failing_subscriber_does_not_starve_others() {
    let child = suspended(&["LINES=5"]).await;
    let io = AsyncProcessIo::new(child.io()).unwrap();
    io.on_output_line(|_| panic!("subscriber failure"));
    let (seen, handler) = recorder();
    io.on_output_line(handler);
    io.start().unwrap();
    child.start().unwrap();

    assert!(io.wait_for_all_output(LONG).await);
    assert_eq!(
        *seen.lock(),
        vec!["LINE_1", "LINE_2", "LINE_3", "LINE_4", "LINE_5"]
    );
}

#[tokio::test]
async fn test_removed_handler_stops_receiving() {
    let child = suspended(&["LINES=3"]).await;
    let io = AsyncProcessIo::new(child.io()).unwrap();
    let (removed, handler) = recorder();
    let id = io.on_output_line(handler);
    let (kept, handler) = recorder();
    io.on_output_line(handler);

    assert!(io.remove_output_handler(id));
    assert!(!io.remove_output_handler(id));
    io.start().unwrap();
    child.start().unwrap();

    assert!(io.wait_for_all_output(LONG).await);
    assert!(removed.lock().is_empty());
    assert_eq!(kept.lock().len(), 3);
}

#[tokio::test]
async fn test_unredirected_error_reports_drained() {
    let config = ProcessConfig::new(HELPER)
        .args(["LINES=1"])
        .redirect_stdout(true);
    let child = ProcessManager::new().spawn(config).await.unwrap();
    let io = AsyncProcessIo::new(child.io()).unwrap();
    let (seen, handler) = recorder();
    io.on_error_line(handler);
    io.start().unwrap();

    assert!(io.wait_for_all_error(Duration::ZERO).await);
    assert!(io.wait_for_all_output(LONG).await);
    assert!(seen.lock().is_empty());
}

#[tokio::test]
async fn test_dispose_while_child_runs() {
    let child = suspended(&["SLEEP=30000"]).await;
    let io = AsyncProcessIo::new(child.io()).unwrap();
    io.start().unwrap();
    child.start().unwrap();

    io.dispose();

    assert!(io.wait_for_all_output(Duration::from_secs(1)).await);
    assert!(io.wait_for_all_error(Duration::from_secs(1)).await);
    assert!(io.input().unwrap_err().is_invalid_state());
    assert!(!child.has_exited().unwrap());

    child.kill(0).unwrap();
    assert!(child.wait_for_exit(Some(LONG)).await.unwrap());
}

async fn suspended_shell(script: &str) -> ManagedChild {
    let config = ProcessConfig::new("sh")
        .args(["-c", script])
        .redirect_all()
        .start_suspended(true);
    ProcessManager::new().spawn(config).await.unwrap()
}

async fn wait_for_lines(seen: &Seen, count: usize) {
    tokio::time::timeout(LONG, async {
        while seen.lock().len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_invalid_utf8_line_does_not_end_stream() {
    let child =
        suspended_shell(r"printf 'first\ncaf\351\nthird\n'; read gate; printf 'fourth\n'").await;
    let io = AsyncProcessIo::new(child.io()).unwrap();
    let (seen, handler) = recorder();
    io.on_output_line(handler);
    io.start().unwrap();
    child.start().unwrap();

    wait_for_lines(&seen, 3).await;
    assert!(!io.wait_for_all_output(Duration::from_millis(300)).await);

    let input = io.input().unwrap();
    input.write_line("go").await.unwrap();
    input.close().await.unwrap();

    assert!(io.wait_for_all_output(LONG).await);
    assert_eq!(*seen.lock(), vec!["first", "caf\u{FFFD}", "third", "fourth"]);
}

#[tokio::test]
async fn test_crlf_lines_are_trimmed() {
    let child = suspended_shell(r"printf 'one\r\ntwo\r\n\r\nthree'").await;
    let io = AsyncProcessIo::new(child.io()).unwrap();
    let (seen, handler) = recorder();
    io.on_output_line(handler);
    io.start().unwrap();
    child.start().unwrap();

    assert!(io.wait_for_all_output(LONG).await);
    assert_eq!(*seen.lock(), vec!["one", "two", "", "three"]);
}

#[tokio::test]
async fn test_binary_output_is_delivered_lossily() {
    let child = suspended_shell(r"printf '\377\376x\n\200\n'").await;
    let io = AsyncProcessIo::new(child.io()).unwrap();
    let (seen, handler) = recorder();
    io.on_output_line(handler);
    io.start().unwrap();
    child.start().unwrap();

    assert!(io.wait_for_all_output(LONG).await);
    assert_eq!(*seen.lock(), vec!["\u{FFFD}\u{FFFD}x", "\u{FFFD}"]);
}
